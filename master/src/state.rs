// master/src/state.rs

use common::{TaskId, TerminalNotification, WorkerId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use tracing::{info, warn};

use crate::aggregator::{MergePlan, ResultAggregator};
use crate::checkpoint;
use crate::config::MasterConfig;
use crate::error::{Result, TaskError};
use crate::media::MediaTools;
use crate::task::{Notified, TranscodingTask};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub media: MediaTools,
    pub aggregator: Arc<ResultAggregator>,
    // cada tarea tiene su propio lock; este mapa sólo se toca para buscarlas
    pub tasks: Arc<Mutex<HashMap<TaskId, Arc<TranscodingTask>>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub dispatches_started: u64,
    pub dispatches_succeeded: u64,
    pub dispatches_failed: u64,
    pub total_dispatch_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            dispatches_started: 0,
            dispatches_succeeded: 0,
            dispatches_failed: 0,
            total_dispatch_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

/// Qué pasó con una notificación terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Applied,
    /// Dispatch desconocido, ya resuelto o tarea ya terminada
    Ignored,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AppState {
    pub fn new(config: MasterConfig, media: MediaTools) -> Self {
        let aggregator = Arc::new(ResultAggregator::new(media.merger.clone()));
        Self {
            config: Arc::new(config),
            media,
            aggregator,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn workers(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerMeta>> {
        lock(&self.workers)
    }

    pub fn task(&self, id: &str) -> Option<Arc<TranscodingTask>> {
        lock(&self.tasks).get(id).cloned()
    }

    pub fn insert_task(&self, task: Arc<TranscodingTask>) {
        lock(&self.tasks).insert(task.id().clone(), task);
    }

    /// Tareas en orden de envío.
    pub fn tasks_in_order(&self) -> Vec<Arc<TranscodingTask>> {
        let mut tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by(|a, b| a.definition().submitted_at.cmp(&b.definition().submitted_at));
        tasks
    }

    /// Restaura las tareas guardadas en <data_dir>/tasks.
    pub fn restore_checkpoints(&self) -> usize {
        let snapshots = checkpoint::load_all(&self.config.data_dir.join("tasks"));
        let count = snapshots.len();
        for snapshot in snapshots {
            self.insert_task(Arc::new(TranscodingTask::restore(snapshot)));
        }
        count
    }

    /// Guarda el checkpoint de la tarea fuera del runtime async.
    pub async fn checkpoint(&self, task: &Arc<TranscodingTask>) {
        let dir = self.config.task_dir(task.id());
        let owned = task.clone();

        match tokio::task::spawn_blocking(move || owned.save_checkpoint(&dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("no se pudo guardar el checkpoint de la tarea {}: {}", task.id(), e)
            }
            Err(e) => warn!("el checkpoint de la tarea {} abortó: {}", task.id(), e),
        }
    }

    /// Aplica una notificación terminal y, si la tarea terminó, mezcla y entrega.
    pub async fn notify(&self, n: &TerminalNotification) -> Result<NotifyOutcome> {
        let Some(task) = self.task(&n.task_id) else {
            warn!(
                "notificación para tarea desconocida {} (dispatch={}), se ignora",
                n.task_id, n.dispatch_id
            );
            return Ok(NotifyOutcome::Ignored);
        };

        match task.on_terminal_notification(&n.dispatch_id, n.outcome, &n.result_paths) {
            Ok(Notified::Applied(plan)) => {
                self.checkpoint(&task).await;
                if let Some(plan) = plan {
                    self.finalize(task, plan).await;
                }
                Ok(NotifyOutcome::Applied)
            }
            Ok(Notified::Late) => Ok(NotifyOutcome::Ignored),
            Err(TaskError::UnknownDispatch(id)) => {
                warn!(
                    "notificación {:?} para dispatch desconocido {} (tarea {}), se ignora",
                    n.outcome, id, n.task_id
                );
                Ok(NotifyOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cancel(&self, task: Arc<TranscodingTask>) -> Result<()> {
        let plan = task.cancel()?;
        self.checkpoint(&task).await;
        if let Some(plan) = plan {
            self.finalize(task, plan).await;
        }
        Ok(())
    }

    /// Merge + entrega fuera del lock de la tarea.
    pub async fn finalize(&self, task: Arc<TranscodingTask>, plan: MergePlan) {
        let aggregator = self.aggregator.clone();
        let partial = plan.partial;

        info!("disparando merge de la tarea {}", plan.task_id);
        let result = tokio::task::spawn_blocking(move || aggregator.finalize(&plan))
            .await
            .unwrap_or_else(|e| Err(TaskError::Merge(format!("el merge abortó: {e}"))));

        task.record_delivery(result, partial);
        self.checkpoint(&task).await;
    }
}
