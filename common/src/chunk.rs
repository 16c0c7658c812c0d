use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media::TranscodingParams;
use crate::task::TaskId;
use crate::worker::WorkerId;

pub type DispatchId = String;

/// Estado de un chunk dentro de su tarea.
///
/// pending -> dispatched -> {succeeded | failed | timed_out | cancelled}
/// failed | timed_out | cancelled -> restarted -> resent -> dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Restarted,
    Resent,
}

impl ChunkStatus {
    /// El intento actual terminó (aunque `resent` vuelva a despacharse).
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            ChunkStatus::Succeeded
                | ChunkStatus::Failed
                | ChunkStatus::TimedOut
                | ChunkStatus::Cancelled
                | ChunkStatus::Resent
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ChunkStatus::Failed | ChunkStatus::TimedOut | ChunkStatus::Cancelled
        )
    }

    /// Chunks que el scheduler reenvía antes que los nunca despachados.
    pub fn awaits_retry(self) -> bool {
        self.is_failure() || self == ChunkStatus::Restarted
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;

        match (self, next) {
            (Pending, Dispatched) | (Resent, Dispatched) => true,
            (Dispatched, Succeeded | Failed | TimedOut | Cancelled) => true,
            (Failed | TimedOut | Cancelled, Restarted | Resent) => true,
            (Restarted, Resent) => true,
            // abandono al detener la tarea
            (Pending | Restarted, Cancelled) => true,
            _ => false,
        }
    }
}

/// Resultado terminal de un dispatch reportado por el backend de ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl Outcome {
    pub fn status(self) -> ChunkStatus {
        match self {
            Outcome::Succeeded => ChunkStatus::Succeeded,
            Outcome::Failed => ChunkStatus::Failed,
            Outcome::TimedOut => ChunkStatus::TimedOut,
            Outcome::Cancelled => ChunkStatus::Cancelled,
        }
    }
}

/// Una unidad de trabajo: una de las N partes del input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub status: ChunkStatus,
    /// Último worker al que se despachó (None si nunca)
    pub assigned_worker: Option<WorkerId>,
    /// Id del último dispatch; cada reintento genera uno nuevo
    pub dispatch_id: Option<DispatchId>,
    /// Sólo se llena en `succeeded`
    pub result_paths: Vec<String>,
}

impl ChunkDescriptor {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: ChunkStatus::Pending,
            assigned_worker: None,
            dispatch_id: None,
            result_paths: Vec::new(),
        }
    }
}

/// Lo que recibe un worker para computar un chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchDescriptor {
    pub task_id: TaskId,
    pub dispatch_id: DispatchId,
    pub chunk_index: usize,
    /// Archivo de entrada del chunk (salida del splitter)
    pub resource: String,
    /// Iguales para todos los chunks de una tarea
    pub params: TranscodingParams,
    pub performance: f64,
    pub deadline: DateTime<Utc>,
}

/// Notificación terminal de un dispatch (éxito, fallo, timeout o cancelación).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalNotification {
    pub task_id: TaskId,
    pub dispatch_id: DispatchId,
    pub outcome: Outcome,
    #[serde(default)]
    pub result_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estados_terminados_incluyen_resent() {
        assert!(ChunkStatus::Resent.is_ended());
        assert!(ChunkStatus::Succeeded.is_ended());
        assert!(ChunkStatus::TimedOut.is_ended());
        assert!(!ChunkStatus::Pending.is_ended());
        assert!(!ChunkStatus::Dispatched.is_ended());
        assert!(!ChunkStatus::Restarted.is_ended());
    }

    #[test]
    fn succeeded_no_retrocede() {
        for next in [
            ChunkStatus::Pending,
            ChunkStatus::Dispatched,
            ChunkStatus::Failed,
            ChunkStatus::Restarted,
            ChunkStatus::Resent,
            ChunkStatus::Cancelled,
        ] {
            assert!(!ChunkStatus::Succeeded.can_transition_to(next));
        }
    }

    #[test]
    fn ciclo_de_reintento_vuelve_a_dispatched() {
        assert!(ChunkStatus::Dispatched.can_transition_to(ChunkStatus::Failed));
        assert!(ChunkStatus::Failed.can_transition_to(ChunkStatus::Restarted));
        assert!(ChunkStatus::Restarted.can_transition_to(ChunkStatus::Resent));
        assert!(ChunkStatus::Resent.can_transition_to(ChunkStatus::Dispatched));
        assert!(!ChunkStatus::Pending.can_transition_to(ChunkStatus::Succeeded));
    }

    #[test]
    fn outcome_se_serializa_en_snake_case() {
        let n = TerminalNotification {
            task_id: "t".to_string(),
            dispatch_id: "d".to_string(),
            outcome: Outcome::TimedOut,
            result_paths: vec![],
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["outcome"], json!("timed_out"));

        let back: TerminalNotification =
            serde_json::from_value(json!({"task_id": "t", "dispatch_id": "d", "outcome": "succeeded"}))
                .unwrap();
        assert_eq!(back.outcome, Outcome::Succeeded);
        assert!(back.result_paths.is_empty());
    }
}
