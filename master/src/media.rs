use std::{
    fmt,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use common::{Container, TranscodingParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TaskError};

/// Prefijo de los archivos que produce el splitter dentro del work dir.
pub const CHUNK_PREFIX: &str = "chunk-";

/// Metadatos mínimos del archivo de entrada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub container: Option<Container>,
    pub size_bytes: u64,
}

/// Opciones del contenedor de salida para el merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerOptions {
    pub container: Container,
    pub strip_unsupported_data_streams: bool,
    pub strip_unsupported_subtitle_streams: bool,
}

impl From<&TranscodingParams> for ContainerOptions {
    fn from(p: &TranscodingParams) -> Self {
        Self {
            container: p.container,
            strip_unsupported_data_streams: p.strip_unsupported_data_streams,
            strip_unsupported_subtitle_streams: p.strip_unsupported_subtitle_streams,
        }
    }
}

/* =========================
   Colaboradores externos
   ========================= */

/// Divide el archivo de entrada en hasta `chunks` archivos dentro de `work_dir`.
/// Puede devolver menos de los pedidos. Las rutas relativas se resuelven
/// contra `work_dir`.
pub trait Splitter: Send + Sync {
    fn split(
        &self,
        input: &Path,
        chunks: usize,
        work_dir: &Path,
    ) -> Result<(Vec<PathBuf>, VideoMetadata)>;
}

pub trait Validator: Send + Sync {
    fn validate(&self, metadata: &VideoMetadata) -> Result<()>;
    fn validate_params(&self, params: &TranscodingParams, metadata: &VideoMetadata) -> Result<()>;
}

/// Une los resultados de los chunks (en orden) en un único archivo
/// dentro de `work_dir` y devuelve su ruta.
pub trait Merger: Send + Sync {
    fn merge(
        &self,
        input: &Path,
        chunk_results: &[PathBuf],
        output_basename: &str,
        work_dir: &Path,
        options: &ContainerOptions,
    ) -> Result<PathBuf>;
}

/// Las tres piezas que usa una tarea.
#[derive(Clone)]
pub struct MediaTools {
    pub splitter: Arc<dyn Splitter>,
    pub validator: Arc<dyn Validator>,
    pub merger: Arc<dyn Merger>,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            splitter: Arc::new(ByteSplitter),
            validator: Arc::new(BasicValidator),
            merger: Arc::new(ConcatMerger),
        }
    }
}

impl fmt::Debug for MediaTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTools").finish_non_exhaustive()
    }
}

/* =========================
   Implementaciones simples sobre archivos
   ========================= */

/// Corta el archivo en rangos de bytes consecutivos de igual tamaño.
/// Cada chunk tiene al menos un byte, así que un archivo chico produce menos chunks.
pub struct ByteSplitter;

impl Splitter for ByteSplitter {
    fn split(
        &self,
        input: &Path,
        chunks: usize,
        work_dir: &Path,
    ) -> Result<(Vec<PathBuf>, VideoMetadata)> {
        let size = fs::metadata(input)?.len();
        let metadata = VideoMetadata {
            container: Container::from_extension(&input.to_string_lossy()),
            size_bytes: size,
        };

        if size == 0 || chunks == 0 {
            return Ok((Vec::new(), metadata));
        }

        fs::create_dir_all(work_dir)?;

        let wanted = (chunks as u64).min(size);
        let chunk_len = size.div_ceil(wanted);
        let produced = size.div_ceil(chunk_len);

        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();

        let mut reader = BufReader::new(File::open(input)?);
        let mut out = Vec::with_capacity(produced as usize);

        for i in 0..produced {
            let name = format!("{}{:04}.{}", CHUNK_PREFIX, i, ext);
            let mut writer = BufWriter::new(File::create(work_dir.join(&name))?);
            io::copy(&mut (&mut reader).take(chunk_len), &mut writer)?;
            writer.flush()?;
            // relativa al work dir
            out.push(PathBuf::from(name));
        }

        debug!(
            "split de {} en {} chunks de hasta {} bytes",
            input.display(),
            produced,
            chunk_len
        );

        Ok((out, metadata))
    }
}

pub struct BasicValidator;

impl Validator for BasicValidator {
    fn validate(&self, metadata: &VideoMetadata) -> Result<()> {
        if metadata.size_bytes == 0 {
            return Err(TaskError::InvalidInput("el archivo de entrada está vacío".to_string()));
        }
        if metadata.container.is_none() {
            warn!("formato de entrada no reconocido, se asume que el backend lo soporta");
        }
        Ok(())
    }

    fn validate_params(&self, params: &TranscodingParams, _metadata: &VideoMetadata) -> Result<()> {
        if let Some((w, h)) = params.video.resolution {
            if w == 0 || h == 0 {
                return Err(TaskError::InvalidInput(format!(
                    "resolución inválida: {}x{}",
                    w, h
                )));
            }
        }

        if let Some(fr) = params.video.frame_rate.as_deref() {
            if !valid_frame_rate(fr) {
                return Err(TaskError::InvalidInput(format!("frame rate inválido: {}", fr)));
            }
        }

        Ok(())
    }
}

/// "30", "29.97" o "30000/1001"
fn valid_frame_rate(s: &str) -> bool {
    match s.split_once('/') {
        Some((num, den)) => matches!(
            (num.trim().parse::<u32>(), den.trim().parse::<u32>()),
            (Ok(n), Ok(d)) if n > 0 && d > 0
        ),
        None => s.trim().parse::<f64>().map(|v| v > 0.0).unwrap_or(false),
    }
}

/// Concatena los resultados en orden. No re-empaqueta el contenedor.
pub struct ConcatMerger;

impl Merger for ConcatMerger {
    fn merge(
        &self,
        _input: &Path,
        chunk_results: &[PathBuf],
        output_basename: &str,
        work_dir: &Path,
        options: &ContainerOptions,
    ) -> Result<PathBuf> {
        let merge_dir = work_dir.join("merge");
        fs::create_dir_all(&merge_dir)?;

        if options.strip_unsupported_data_streams || options.strip_unsupported_subtitle_streams {
            debug!("concat merge: las opciones de strip no aplican");
        }

        let output = merge_dir.join(output_basename);
        let mut writer = BufWriter::new(File::create(&output)?);

        for part in chunk_results {
            let mut reader = File::open(part).map_err(|e| {
                TaskError::Merge(format!("no se pudo abrir {}: {e}", part.display()))
            })?;
            io::copy(&mut reader, &mut writer)?;
        }

        writer.flush()?;
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;

    pub fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("master_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    pub struct FailingValidator;

    impl Validator for FailingValidator {
        fn validate(&self, _metadata: &VideoMetadata) -> Result<()> {
            Err(TaskError::InvalidInput("video corrupto".to_string()))
        }

        fn validate_params(&self, _p: &TranscodingParams, _m: &VideoMetadata) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn split_y_concat_reconstruyen_el_archivo() {
        let dir = temp_dir("split_concat");
        let input = dir.join("clip.mkv");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        fs::write(&input, &data).unwrap();

        let work = dir.join("work");
        let (chunks, meta) = ByteSplitter.split(&input, 3, &work).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(meta.size_bytes, 1000);
        assert_eq!(meta.container, Some(Container::Mkv));
        assert!(chunks.iter().all(|c| c.is_relative()));

        let absolute: Vec<PathBuf> = chunks.iter().map(|c| work.join(c)).collect();
        let options = ContainerOptions {
            container: Container::Mkv,
            strip_unsupported_data_streams: false,
            strip_unsupported_subtitle_streams: false,
        };
        let merged = ConcatMerger
            .merge(&input, &absolute, "out.mkv", &work, &options)
            .unwrap();

        assert_eq!(fs::read(merged).unwrap(), data);
    }

    #[test]
    fn split_de_archivo_chico_produce_menos_chunks() {
        let dir = temp_dir("split_chico");
        let input = dir.join("clip.mp4");
        fs::write(&input, b"abc").unwrap();

        let (chunks, _) = ByteSplitter.split(&input, 5, &dir.join("work")).unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn validador_rechaza_parametros_invalidos() {
        let meta = VideoMetadata {
            container: Some(Container::Mp4),
            size_bytes: 10,
        };
        let mut params = TranscodingParams {
            video: Default::default(),
            audio: Default::default(),
            container: Container::Mp4,
            strip_unsupported_data_streams: false,
            strip_unsupported_subtitle_streams: false,
        };
        assert!(BasicValidator.validate_params(&params, &meta).is_ok());

        params.video.frame_rate = Some("30000/1001".to_string());
        assert!(BasicValidator.validate_params(&params, &meta).is_ok());

        params.video.frame_rate = Some("rapido".to_string());
        assert!(BasicValidator.validate_params(&params, &meta).is_err());

        params.video.frame_rate = None;
        params.video.resolution = Some((0, 720));
        assert!(BasicValidator.validate_params(&params, &meta).is_err());

        let vacio = VideoMetadata {
            container: None,
            size_bytes: 0,
        };
        assert!(matches!(
            BasicValidator.validate(&vacio),
            Err(TaskError::InvalidInput(_))
        ));
    }
}
