use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::Result;
use crate::task::TaskSnapshot;

const CHECKPOINT_FILE: &str = "checkpoint.json";

pub fn checkpoint_path(task_dir: &Path) -> PathBuf {
    task_dir.join(CHECKPOINT_FILE)
}

/// Escribe el snapshot en <task_dir>/checkpoint.json (tmp + rename).
/// Cada escritura usa su propio tmp, así dos escrituras simultáneas no se
/// pisan el archivo intermedio. El orden entre snapshots lo garantiza
/// quien llama (ver `TranscodingTask::save_checkpoint`).
pub fn save(task_dir: &Path, snapshot: &TaskSnapshot) -> Result<()> {
    fs::create_dir_all(task_dir)?;

    let path = checkpoint_path(task_dir);
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));

    fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!("checkpoint de la tarea {} guardado", snapshot.definition.task_id);
    Ok(())
}

pub fn load(task_dir: &Path) -> Result<TaskSnapshot> {
    let bytes = fs::read(checkpoint_path(task_dir))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Carga todos los checkpoints bajo <tasks_root>/*/checkpoint.json.
/// Los que no se pueden leer se loguean y se saltean.
pub fn load_all(tasks_root: &Path) -> Vec<TaskSnapshot> {
    let entries = match fs::read_dir(tasks_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !checkpoint_path(&dir).is_file() {
            continue;
        }
        match load(&dir) {
            Ok(snapshot) => out.push(snapshot),
            Err(e) => warn!("checkpoint ilegible en {}: {}", dir.display(), e),
        }
    }

    out.sort_by(|a, b| a.definition.submitted_at.cmp(&b.definition.submitted_at));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::temp_dir;
    use crate::task::{
        tests::{definition, state_with},
        Delivery, TaskSnapshot,
    };

    #[test]
    fn guarda_y_carga_todos_los_checkpoints() {
        let root = temp_dir("checkpoints");

        for id in ["a", "b"] {
            let mut def = definition(2);
            def.task_id = id.to_string();
            let snapshot = TaskSnapshot {
                definition: def,
                work_dir: root.join(id),
                state: state_with(2),
                delivery: Delivery::NotStarted,
            };
            save(&root.join(id), &snapshot).unwrap();
        }
        // basura que no debe romper la carga
        fs::create_dir_all(root.join("roto")).unwrap();
        fs::write(checkpoint_path(&root.join("roto")), b"{no es json").unwrap();

        let loaded = load_all(&root);
        let mut ids: Vec<_> = loaded.iter().map(|s| s.definition.task_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(loaded[0].state, state_with(2));
    }

    #[test]
    fn sin_directorio_no_hay_checkpoints() {
        let root = temp_dir("checkpoints_vacio");
        assert!(load_all(&root.join("no_existe")).is_empty());
    }

    #[test]
    fn escrituras_simultaneas_no_fallan() {
        let root = temp_dir("checkpoints_concurrentes");
        let dir = root.join("t");
        let snapshot = TaskSnapshot {
            definition: definition(2),
            work_dir: root.join("work"),
            state: state_with(2),
            delivery: Delivery::NotStarted,
        };

        let errors: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| (0..100).filter(|_| save(&dir, &snapshot).is_err()).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(errors, 0);
        assert_eq!(load(&dir).unwrap().state, snapshot.state);
        // no quedan temporales
        let leftovers = fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
