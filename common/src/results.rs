use serde::{Deserialize, Serialize};

use crate::task::TaskId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResults {
    pub task_id: TaskId,
    /// Archivo final entregado (None si todavía no hay o si falló la entrega)
    pub output_file: Option<String>,
    /// Resultados por chunk, en orden de índice
    pub chunk_results: Vec<String>,
    /// true si se mezclaron menos chunks que el total
    pub partial: bool,
}
