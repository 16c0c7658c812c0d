use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;

/* --------- Configuración cruda enviada por el usuario --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoOptionsRequest {
    pub codec: Option<String>,
    pub bit_rate: Option<String>,
    pub frame_rate: Option<String>,
    pub resolution: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioOptionsRequest {
    pub codec: Option<String>,
    pub bit_rate: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptionsRequest {
    #[serde(default)]
    pub video: VideoOptionsRequest,
    #[serde(default)]
    pub audio: AudioOptionsRequest,
    /// Si falta se toma del archivo de entrada (preset)
    pub container: Option<String>,
    /// Directorio donde se deja el resultado final
    pub output_path: Option<String>,
    /// Si falta se usa "<name>.<container>"
    pub output_filename: Option<String>,
    pub strip_unsupported_data_streams: Option<bool>,
    pub strip_unsupported_subtitle_streams: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,

    /// Archivos de entrada; se espera exactamente uno
    #[serde(default)]
    pub resources: Vec<String>,

    /// Cantidad de chunks pedida (el splitter puede producir menos)
    pub subtasks_count: Option<u32>,

    /// Timeout por chunk
    pub subtask_timeout_secs: Option<u64>,

    /// Timeout de la tarea completa
    pub timeout_secs: Option<u64>,

    pub options: Option<TaskOptionsRequest>,
}

/* --------- Estado y métricas de una tarea --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Accepted,
    Running,
    Merging,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::PartiallySucceeded
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,

    pub input: String,
    pub output_file: String,

    /// -------- Métricas de la tarea --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline: DateTime<Utc>,
    pub requested_chunks: u32,
    pub total_chunks: u32,
    pub succeeded_chunks: u32,
    pub failed_chunks: u32,
    pub outstanding_dispatches: u32,
    pub retries: u32,
    pub needs_more_work: bool,
    pub finished: bool,

    /// Error de entrega del resultado final, si lo hubo
    pub error: Option<String>,
}
