use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::TaskId;
use glob::glob;
use tracing::{info, warn};

use crate::builder::TaskDefinition;
use crate::error::{Result, TaskError};
use crate::media::{ContainerOptions, Merger, CHUNK_PREFIX};
use crate::tracker::Termination;

/// Todo lo que hace falta para mezclar y entregar, tomado bajo el lock
/// y usado después fuera de él.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub task_id: TaskId,
    pub input: PathBuf,
    /// Resultados de los chunks en orden de índice
    pub chunk_results: Vec<PathBuf>,
    pub output_file: PathBuf,
    pub work_dir: PathBuf,
    pub options: ContainerOptions,
    pub partial: bool,
}

impl MergePlan {
    pub fn new(definition: &TaskDefinition, work_dir: &Path, termination: Termination) -> Self {
        Self {
            task_id: definition.task_id.clone(),
            input: definition.input.clone(),
            chunk_results: termination.results.into_iter().map(PathBuf::from).collect(),
            output_file: definition.output_file.clone(),
            work_dir: work_dir.to_path_buf(),
            options: ContainerOptions::from(&definition.params),
            partial: termination.partial,
        }
    }
}

/// Pasa los resultados al merger y mueve el archivo final a su destino.
pub struct ResultAggregator {
    merger: Arc<dyn Merger>,
}

impl ResultAggregator {
    pub fn new(merger: Arc<dyn Merger>) -> Self {
        Self { merger }
    }

    /// Se llama a lo sumo una vez por tarea. Un error acá es fatal para la
    /// tarea: el cómputo terminó pero el resultado no llegó a destino.
    pub fn finalize(&self, plan: &MergePlan) -> Result<PathBuf> {
        info!(
            "mezclando {} resultados de la tarea {}",
            plan.chunk_results.len(),
            plan.task_id
        );

        let basename = plan
            .output_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                TaskError::Merge(format!(
                    "la ruta de salida {} no tiene nombre de archivo",
                    plan.output_file.display()
                ))
            })?;

        let merged = self.merger.merge(
            &plan.input,
            &plan.chunk_results,
            &basename,
            &plan.work_dir,
            &plan.options,
        )?;

        relocate(&merged, &plan.output_file)?;
        remove_intermediate_chunks(&plan.work_dir);

        info!(
            "tarea {} mezclada correctamente en {}",
            plan.task_id,
            plan.output_file.display()
        );
        Ok(plan.output_file.clone())
    }
}

/// Mueve el archivo creando los directorios intermedios.
fn relocate(from: &Path, to: &Path) -> Result<()> {
    let delivery_err = |source| TaskError::MergeDelivery {
        path: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(delivery_err)?;
        }
    }

    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    // rename falla entre filesystems distintos
    fs::copy(from, to).map_err(delivery_err)?;
    if let Err(e) = fs::remove_file(from) {
        warn!("no se pudo borrar {}: {}", from.display(), e);
    }
    Ok(())
}

fn remove_intermediate_chunks(work_dir: &Path) {
    let pattern = work_dir.join(format!("{}*", CHUNK_PREFIX));
    let pattern = pattern.to_string_lossy();

    let entries = match glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("patrón inválido {}: {}", pattern, e);
            return;
        }
    };

    for path in entries.flatten() {
        if let Err(e) = fs::remove_file(&path) {
            warn!("no se pudo borrar el chunk {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{tests::temp_dir, ConcatMerger};
    use common::Container;

    fn plan_in(dir: &Path, output_file: PathBuf) -> MergePlan {
        let work = dir.join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("chunk-0000.mp4"), b"x").unwrap();

        let mut results = Vec::new();
        for (i, part) in ["uno-", "dos-", "tres"].iter().enumerate() {
            let p = dir.join(format!("res{i}.mp4"));
            fs::write(&p, part).unwrap();
            results.push(p);
        }

        MergePlan {
            task_id: "t".to_string(),
            input: dir.join("clip.mp4"),
            chunk_results: results,
            output_file,
            work_dir: work,
            options: ContainerOptions {
                container: Container::Mp4,
                strip_unsupported_data_streams: false,
                strip_unsupported_subtitle_streams: false,
            },
            partial: false,
        }
    }

    #[test]
    fn finalize_entrega_en_directorio_nuevo() {
        let dir = temp_dir("aggregator_ok");
        let output = dir.join("salida").join("anidada").join("clip.mp4");
        let plan = plan_in(&dir, output.clone());

        let aggregator = ResultAggregator::new(Arc::new(ConcatMerger));
        let delivered = aggregator.finalize(&plan).unwrap();

        assert_eq!(delivered, output);
        assert_eq!(fs::read_to_string(&output).unwrap(), "uno-dos-tres");
        // los chunks intermedios se limpian
        assert!(!plan.work_dir.join("chunk-0000.mp4").exists());
    }

    #[test]
    fn error_de_entrega_es_merge_delivery() {
        let dir = temp_dir("aggregator_err");
        // un archivo donde debería ir un directorio
        let blocker = dir.join("bloqueo");
        fs::write(&blocker, b"no soy un directorio").unwrap();

        let plan = plan_in(&dir, blocker.join("clip.mp4"));
        let err = ResultAggregator::new(Arc::new(ConcatMerger))
            .finalize(&plan)
            .unwrap_err();

        assert!(matches!(err, TaskError::MergeDelivery { .. }));
    }
}
