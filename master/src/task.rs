use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use common::{
    ChunkDescriptor, ChunkStatus, DispatchDescriptor, DispatchId, Outcome, TaskId, TaskInfo,
    TaskResults, TaskStatus, WorkerId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::MergePlan;
use crate::builder::TaskDefinition;
use crate::checkpoint;
use crate::error::{Result, TaskError};
use crate::ledger::RetryLedger;
use crate::media::MediaTools;
use crate::registry::ChunkRegistry;
use crate::scheduler::SubtaskScheduler;
use crate::tracker::{CompletionTracker, Progress};

/// Estado agregado de la ejecución.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRunState {
    /// N real (puede ser menor que lo pedido)
    pub total: usize,
    /// Próximo índice nunca despachado
    pub dispatch_cursor: usize,
    pub succeeded: usize,
    /// Latch: algún chunk superó su presupuesto de reintentos
    pub permanently_failed: bool,
    /// Latch: la tarea completa se canceló
    pub cancelled: bool,
    /// Latch: el merge ya se disparó
    pub merge_triggered: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRunState {
    /// Ya no se entrega más trabajo.
    pub fn is_stopped(&self) -> bool {
        self.permanently_failed || self.cancelled
    }
}

/// Bloque de estado mutable de una tarea. Se muta siempre bajo el lock
/// de su `TranscodingTask` y es lo que se serializa en los checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub registry: ChunkRegistry,
    pub ledger: RetryLedger,
    pub run: TaskRunState,
    /// Archivo de entrada de cada chunk, por índice
    pub chunk_resources: Vec<String>,
}

impl TaskState {
    pub fn seeded(chunk_resources: Vec<String>, max_retries: u32) -> Self {
        let total = chunk_resources.len();
        Self {
            registry: ChunkRegistry::seeded(total),
            ledger: RetryLedger::new(max_retries),
            run: TaskRunState {
                total,
                ..Default::default()
            },
            chunk_resources,
        }
    }

    /// Todos exitosos, o tarea detenida con todos los chunks en estado terminado.
    pub fn is_finished(&self) -> bool {
        let full = self.run.total > 0 && self.run.succeeded == self.run.total;
        let partial = self.run.is_stopped() && self.registry.all_ended();
        full || partial
    }

    pub fn needs_more_work(&self) -> bool {
        if self.run.is_stopped() || self.is_finished() {
            return false;
        }
        self.run.dispatch_cursor < self.run.total || self.registry.awaiting_retry() > 0
    }
}

/// Entrega del resultado final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    NotStarted,
    Merging,
    Delivered { output: String, partial: bool },
    /// Terminó sin ningún chunk exitoso
    NoOutput,
    Failed { reason: String },
}

/// Efecto de una notificación terminal.
#[derive(Debug)]
pub enum Notified {
    /// Aplicada; trae el plan de merge si con ella la tarea terminó con resultados
    Applied(Option<MergePlan>),
    /// La tarea ya había terminado, no cambió nada
    Late,
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    delivery: Delivery,
}

/// Lo que se persiste de una tarea. El mutex no forma parte: se construye
/// de nuevo al restaurar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub definition: TaskDefinition,
    pub work_dir: PathBuf,
    pub state: TaskState,
    pub delivery: Delivery,
}

/// Una tarea de transcodificación: dueña exclusiva de su registro,
/// contadores y estado, todo detrás de un único lock.
#[derive(Debug)]
pub struct TranscodingTask {
    definition: TaskDefinition,
    work_dir: PathBuf,
    inner: Mutex<TaskInner>,
    /// Serializa snapshot + escritura del checkpoint
    persist: Mutex<()>,
}

impl TranscodingTask {
    /// Divide la entrada en chunks, valida y siembra el registro.
    pub fn initialize(
        definition: TaskDefinition,
        work_dir: &Path,
        media: &MediaTools,
        max_retries: u32,
    ) -> Result<Self> {
        let task_id = definition.task_id.clone();
        debug!("inicializando tarea de transcodificación {}", task_id);

        if definition.input.as_os_str().is_empty() {
            return Err(TaskError::NoInputResource(task_id));
        }
        if !definition.input.is_file() {
            return Err(TaskError::InvalidInput(format!(
                "{} no existe o no es un archivo",
                definition.input.display()
            )));
        }

        std::fs::create_dir_all(work_dir)?;

        let (chunks, metadata) =
            media
                .splitter
                .split(&definition.input, definition.requested_chunks, work_dir)?;

        if chunks.len() < definition.requested_chunks {
            warn!(
                "se pidieron {} chunks pero el split produjo {} (task_id={})",
                definition.requested_chunks,
                chunks.len(),
                task_id
            );
        }
        if chunks.is_empty() {
            return Err(TaskError::InvalidInput(format!(
                "el split de {} no produjo ningún chunk",
                definition.input.display()
            )));
        }

        media.validator.validate(&metadata)?;
        // todos los chunks usan los mismos parámetros
        media.validator.validate_params(&definition.params, &metadata)?;

        let resources: Vec<String> = chunks
            .into_iter()
            .map(|p| {
                if p.is_absolute() {
                    p
                } else {
                    work_dir.join(p)
                }
            })
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        info!(
            "tarea {} inicializada con {} chunks",
            task_id,
            resources.len()
        );

        Ok(Self {
            definition,
            work_dir: work_dir.to_path_buf(),
            inner: Mutex::new(TaskInner {
                state: TaskState::seeded(resources, max_retries),
                delivery: Delivery::NotStarted,
            }),
            persist: Mutex::new(()),
        })
    }

    pub fn restore(snapshot: TaskSnapshot) -> Self {
        Self {
            definition: snapshot.definition,
            work_dir: snapshot.work_dir,
            inner: Mutex::new(TaskInner {
                state: snapshot.state,
                delivery: snapshot.delivery,
            }),
            persist: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock();
        TaskSnapshot {
            definition: self.definition.clone(),
            work_dir: self.work_dir.clone(),
            state: inner.state.clone(),
            delivery: inner.delivery.clone(),
        }
    }

    /// Toma un snapshot y lo escribe en `task_dir`. El lock de persistencia
    /// se mantiene durante las dos cosas: un snapshot viejo nunca se escribe
    /// después de uno más nuevo. Hace IO bloqueante.
    pub fn save_checkpoint(&self, task_dir: &Path) -> Result<()> {
        let _persist = self.persist.lock().unwrap_or_else(|e| e.into_inner());
        checkpoint::save(task_dir, &self.snapshot())
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        // el estado queda consistente entre sentencias, así que un lock
        // envenenado se puede seguir usando
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &TaskId {
        &self.definition.task_id
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn select_next(
        &self,
        performance: f64,
        worker_id: &WorkerId,
    ) -> Result<Option<DispatchDescriptor>> {
        self.select_next_at(performance, worker_id, Utc::now())
    }

    pub fn select_next_at(
        &self,
        performance: f64,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchDescriptor>> {
        let mut inner = self.lock();
        SubtaskScheduler::new(&self.definition).dispatch(&mut inner.state, performance, worker_id, now)
    }

    /// Aplica una notificación terminal. Si con ella la tarea termina y hay
    /// resultados, devuelve el plan de merge: el merge corre fuera del lock.
    pub fn on_terminal_notification(
        &self,
        dispatch_id: &str,
        outcome: Outcome,
        result_paths: &[String],
    ) -> Result<Notified> {
        let mut inner = self.lock();
        let progress = CompletionTracker::new(&self.definition.task_id).on_terminal_notification(
            &mut inner.state,
            dispatch_id,
            outcome,
            result_paths,
            Utc::now(),
        )?;
        if progress == Progress::AlreadyTerminated {
            return Ok(Notified::Late);
        }
        Ok(Notified::Applied(self.plan_after(&mut inner, progress)))
    }

    pub fn cancel(&self) -> Result<Option<MergePlan>> {
        let mut inner = self.lock();
        let progress =
            CompletionTracker::new(&self.definition.task_id).cancel(&mut inner.state, Utc::now())?;
        Ok(self.plan_after(&mut inner, progress))
    }

    pub fn restart_chunk(&self, index: usize) -> Result<()> {
        let mut inner = self.lock();
        CompletionTracker::new(&self.definition.task_id).restart(&mut inner.state, index)
    }

    fn plan_after(&self, inner: &mut TaskInner, progress: Progress) -> Option<MergePlan> {
        let Progress::Terminated(termination) = progress else {
            return None;
        };

        if termination.results.is_empty() {
            inner.delivery = Delivery::NoOutput;
            return None;
        }

        inner.delivery = Delivery::Merging;
        Some(MergePlan::new(&self.definition, &self.work_dir, termination))
    }

    /// Registra el resultado de la entrega del archivo final.
    pub fn record_delivery(&self, result: Result<PathBuf>, partial: bool) {
        let mut inner = self.lock();
        inner.delivery = match result {
            Ok(path) => {
                info!(
                    "tarea {} entregada en {}",
                    self.definition.task_id,
                    path.display()
                );
                Delivery::Delivered {
                    output: path.to_string_lossy().to_string(),
                    partial,
                }
            }
            Err(e) => {
                error!(
                    "tarea {}: el resultado no se pudo entregar: {}",
                    self.definition.task_id, e
                );
                Delivery::Failed {
                    reason: e.to_string(),
                }
            }
        };
    }

    pub fn is_finished(&self) -> bool {
        self.lock().state.is_finished()
    }

    pub fn needs_more_work(&self) -> bool {
        self.lock().state.needs_more_work()
    }

    pub fn chunks(&self) -> Vec<ChunkDescriptor> {
        self.lock().state.registry.chunks().to_vec()
    }

    /// Dispatch en vuelo: (worker, momento del dispatch).
    pub fn dispatch_owner(&self, dispatch_id: &str) -> Option<(WorkerId, DateTime<Utc>)> {
        let inner = self.lock();
        inner
            .state
            .registry
            .dispatch(dispatch_id)
            .filter(|r| r.is_outstanding())
            .map(|r| (r.worker_id.clone(), r.dispatched_at))
    }

    pub fn outstanding_for_worker(&self, worker_id: &str) -> Vec<DispatchId> {
        let inner = self.lock();
        inner
            .state
            .registry
            .outstanding()
            .filter(|(_, r)| r.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn expired_dispatches(&self, now: DateTime<Utc>) -> Vec<DispatchId> {
        let inner = self.lock();
        inner
            .state
            .registry
            .outstanding()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn info(&self) -> TaskInfo {
        let inner = self.lock();
        let state = &inner.state;
        let registry = &state.registry;

        let failed = registry.count(ChunkStatus::Failed)
            + registry.count(ChunkStatus::TimedOut)
            + registry.count(ChunkStatus::Cancelled);

        let (status, error) = match &inner.delivery {
            Delivery::Delivered { partial: false, .. } => (TaskStatus::Succeeded, None),
            Delivery::Delivered { partial: true, .. } => (TaskStatus::PartiallySucceeded, None),
            Delivery::Merging => (TaskStatus::Merging, None),
            Delivery::Failed { reason } => (TaskStatus::Failed, Some(reason.clone())),
            Delivery::NoOutput if state.run.cancelled => (TaskStatus::Cancelled, None),
            Delivery::NoOutput => (
                TaskStatus::Failed,
                Some("ningún chunk terminó con éxito".to_string()),
            ),
            Delivery::NotStarted if state.run.started_at.is_none() => (TaskStatus::Accepted, None),
            Delivery::NotStarted => (TaskStatus::Running, None),
        };

        TaskInfo {
            id: self.definition.task_id.clone(),
            name: self.definition.name.clone(),
            status,
            input: self.definition.input.to_string_lossy().to_string(),
            output_file: self.definition.output_file.to_string_lossy().to_string(),
            submitted_at: self.definition.submitted_at,
            started_at: state.run.started_at,
            finished_at: state.run.finished_at,
            deadline: self.definition.deadline,
            requested_chunks: self.definition.requested_chunks as u32,
            total_chunks: state.run.total as u32,
            succeeded_chunks: state.run.succeeded as u32,
            failed_chunks: failed as u32,
            outstanding_dispatches: registry.outstanding().count() as u32,
            retries: state.ledger.total_retries(),
            needs_more_work: state.needs_more_work(),
            finished: state.is_finished(),
            error,
        }
    }

    pub fn results(&self) -> TaskResults {
        let inner = self.lock();
        let (output_file, partial) = match &inner.delivery {
            Delivery::Delivered { output, partial } => (Some(output.clone()), *partial),
            _ => (None, inner.state.run.succeeded < inner.state.run.total),
        };

        TaskResults {
            task_id: self.definition.task_id.clone(),
            output_file,
            chunk_results: inner.state.registry.results_in_order(),
            partial,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::tests::{temp_dir, FailingValidator};
    use chrono::Duration as ChronoDuration;
    use common::{AudioParams, Container, TranscodingParams, VideoParams};
    use std::{collections::HashSet, fs, sync::Arc, thread};

    pub fn definition(chunks: usize) -> TaskDefinition {
        let now = Utc::now();
        TaskDefinition {
            task_id: "t".to_string(),
            name: "clip".to_string(),
            input: PathBuf::from("/in/clip.mp4"),
            requested_chunks: chunks,
            subtask_timeout_secs: 60,
            deadline: now + ChronoDuration::hours(1),
            submitted_at: now,
            params: TranscodingParams {
                video: VideoParams::default(),
                audio: AudioParams::default(),
                container: Container::Mp4,
                strip_unsupported_data_streams: false,
                strip_unsupported_subtitle_streams: false,
            },
            output_file: PathBuf::from("/out/clip.mp4"),
        }
    }

    pub fn state_with(n: usize) -> TaskState {
        let resources = (0..n).map(|i| format!("/work/chunk-{i}.mp4")).collect();
        TaskState::seeded(resources, 2)
    }

    fn input_file(dir: &Path, bytes: usize) -> PathBuf {
        let input = dir.join("clip.mp4");
        fs::write(&input, vec![7u8; bytes]).unwrap();
        input
    }

    #[test]
    fn initialize_siembra_un_chunk_por_archivo_del_split() {
        let dir = temp_dir("task_init");
        let mut def = definition(4);
        def.input = input_file(&dir, 400);

        let task =
            TranscodingTask::initialize(def, &dir.join("work"), &MediaTools::default(), 2).unwrap();

        let chunks = task.chunks();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert!(task.needs_more_work());
        assert!(!task.is_finished());
        assert_eq!(task.info().status, TaskStatus::Accepted);
    }

    #[test]
    fn menos_chunks_que_los_pedidos() {
        let dir = temp_dir("task_menos_chunks");
        let mut def = definition(5);
        // 3 bytes no alcanzan para 5 chunks
        def.input = input_file(&dir, 3);

        let task =
            TranscodingTask::initialize(def, &dir.join("work"), &MediaTools::default(), 2).unwrap();
        assert_eq!(task.chunks().len(), 3);

        let worker = "w".to_string();
        let mut indices = Vec::new();
        while let Some(d) = task.select_next(1.0, &worker).unwrap() {
            assert!(Path::new(&d.resource).is_file());
            indices.push(d.chunk_index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(!task.needs_more_work());
    }

    #[test]
    fn initialize_sin_input_falla() {
        let dir = temp_dir("task_sin_input");
        let mut def = definition(2);
        def.input = PathBuf::new();

        let err = TranscodingTask::initialize(def, &dir, &MediaTools::default(), 2).unwrap_err();
        assert!(matches!(err, TaskError::NoInputResource(_)));
    }

    #[test]
    fn initialize_propaga_input_invalido() {
        let dir = temp_dir("task_validacion");
        let mut def = definition(2);
        def.input = input_file(&dir, 10);

        let media = MediaTools {
            validator: Arc::new(FailingValidator),
            ..MediaTools::default()
        };
        let err = TranscodingTask::initialize(def, &dir.join("work"), &media, 2).unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }

    #[test]
    fn exito_completo_devuelve_plan_de_merge() {
        let dir = temp_dir("task_plan");
        let mut def = definition(2);
        def.input = input_file(&dir, 10);
        let task =
            TranscodingTask::initialize(def, &dir.join("work"), &MediaTools::default(), 2).unwrap();

        let w = "w".to_string();
        let d0 = task.select_next(1.0, &w).unwrap().unwrap();
        let d1 = task.select_next(1.0, &w).unwrap().unwrap();

        assert!(matches!(
            task.on_terminal_notification(&d1.dispatch_id, Outcome::Succeeded, &["r1".to_string()])
                .unwrap(),
            Notified::Applied(None)
        ));
        assert_eq!(task.info().status, TaskStatus::Running);

        let Notified::Applied(Some(plan)) = task
            .on_terminal_notification(&d0.dispatch_id, Outcome::Succeeded, &["r0".to_string()])
            .unwrap()
        else {
            panic!("se esperaba el plan de merge");
        };
        assert_eq!(plan.chunk_results, vec![PathBuf::from("r0"), PathBuf::from("r1")]);
        assert!(!plan.partial);
        assert_eq!(task.info().status, TaskStatus::Merging);

        // una notificación tardía no reabre nada
        assert!(matches!(
            task.on_terminal_notification(&d0.dispatch_id, Outcome::Failed, &[])
                .unwrap(),
            Notified::Late
        ));

        task.record_delivery(Ok(PathBuf::from("/out/clip.mp4")), plan.partial);
        let info = task.info();
        assert_eq!(info.status, TaskStatus::Succeeded);
        assert!(info.finished);
        assert_eq!(task.results().output_file.as_deref(), Some("/out/clip.mp4"));
    }

    #[test]
    fn snapshot_restaura_estado_con_lock_nuevo() {
        let dir = temp_dir("task_snapshot");
        let mut def = definition(3);
        def.input = input_file(&dir, 30);
        let task =
            TranscodingTask::initialize(def, &dir.join("work"), &MediaTools::default(), 2).unwrap();

        let w = "w".to_string();
        let d0 = task.select_next(1.0, &w).unwrap().unwrap();
        task.on_terminal_notification(&d0.dispatch_id, Outcome::Failed, &[])
            .unwrap();
        let d1 = task.select_next(1.0, &w).unwrap().unwrap();

        let json = serde_json::to_string(&task.snapshot()).unwrap();
        let restored = TranscodingTask::restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.chunks(), task.chunks());
        assert_eq!(restored.dispatch_owner(&d1.dispatch_id).map(|(w, _)| w), Some(w.clone()));

        // el estado restaurado sigue funcionando
        let next = restored.select_next(1.0, &w).unwrap().unwrap();
        assert_eq!(next.chunk_index, 1);
    }

    fn restored(n: usize, work_dir: &Path) -> TranscodingTask {
        TranscodingTask::restore(TaskSnapshot {
            definition: definition(n),
            work_dir: work_dir.to_path_buf(),
            state: state_with(n),
            delivery: Delivery::NotStarted,
        })
    }

    #[test]
    fn dispatch_y_notificaciones_concurrentes_no_duplican_nada() {
        const N: usize = 16;
        let task = Arc::new(restored(N, Path::new("/work")));
        let dispatch_ids = Arc::new(Mutex::new(HashSet::new()));
        let failed_once = Arc::new(Mutex::new(HashSet::new()));
        let succeeded = Arc::new(Mutex::new(Vec::new()));
        let plans = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let task = task.clone();
                let dispatch_ids = dispatch_ids.clone();
                let failed_once = failed_once.clone();
                let succeeded = succeeded.clone();
                let plans = plans.clone();

                thread::spawn(move || {
                    let worker = format!("w{t}");
                    while !task.is_finished() {
                        let Some(d) = task.select_next(1.0, &worker).unwrap() else {
                            thread::yield_now();
                            continue;
                        };

                        assert!(dispatch_ids.lock().unwrap().insert(d.dispatch_id.clone()));
                        // un chunk exitoso no se vuelve a despachar
                        assert!(!succeeded.lock().unwrap().contains(&d.chunk_index));

                        // los chunks pares fallan una vez antes de salir bien
                        let fail = d.chunk_index % 2 == 0
                            && failed_once.lock().unwrap().insert(d.chunk_index);
                        let (outcome, results) = if fail {
                            (Outcome::Failed, vec![])
                        } else {
                            succeeded.lock().unwrap().push(d.chunk_index);
                            (Outcome::Succeeded, vec![format!("/res/{:02}", d.chunk_index)])
                        };

                        match task
                            .on_terminal_notification(&d.dispatch_id, outcome, &results)
                            .unwrap()
                        {
                            Notified::Applied(Some(plan)) => plans.lock().unwrap().push(plan),
                            Notified::Applied(None) => {}
                            Notified::Late => panic!("notificación tardía inesperada"),
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(dispatch_ids.lock().unwrap().len(), N + N / 2);

        let mut ok = succeeded.lock().unwrap().clone();
        ok.sort();
        assert_eq!(ok, (0..N).collect::<Vec<_>>());
        assert!(task
            .chunks()
            .iter()
            .all(|c| c.status == ChunkStatus::Succeeded));

        let plans = plans.lock().unwrap();
        assert_eq!(plans.len(), 1, "el merge se dispara una sola vez");
        assert!(!plans[0].partial);
        let expected: Vec<PathBuf> = (0..N).map(|i| PathBuf::from(format!("/res/{i:02}"))).collect();
        assert_eq!(plans[0].chunk_results, expected);
        assert_eq!(task.info().outstanding_dispatches, 0);
    }

    #[test]
    fn checkpoints_concurrentes_dejan_el_ultimo_estado() {
        let dir = temp_dir("task_checkpoint_concurrente");
        let task = Arc::new(restored(40, &dir.join("work")));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let task = task.clone();
                let dir = dir.clone();
                thread::spawn(move || {
                    let worker = format!("w{t}");
                    for _ in 0..10 {
                        task.select_next(1.0, &worker).unwrap().unwrap();
                        task.save_checkpoint(&dir).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let saved = checkpoint::load(&dir).unwrap();
        assert_eq!(saved.state, task.snapshot().state);
        assert_eq!(saved.state.run.dispatch_cursor, 40);
    }
}
