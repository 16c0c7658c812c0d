use serde::{Deserialize, Serialize};

use crate::chunk::DispatchDescriptor;

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

/// Pedido de trabajo de un worker. `performance` es su índice de rendimiento.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub performance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub dispatch: Option<DispatchDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub ok: bool,
    /// true si la notificación no correspondía a ningún dispatch pendiente
    pub ignored: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_dispatches: u32,
    pub dispatches_started: u64,
    pub dispatches_succeeded: u64,
    pub dispatches_failed: u64,
    pub avg_dispatch_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
