use std::{io, path::PathBuf};

use common::{ChunkStatus, Container, DispatchId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("el campo {0} es obligatorio en la definición de la tarea")]
    MissingRequiredField(&'static str),

    #[error("el contenedor {container} no soporta el códec {codec}")]
    UnsupportedCodecForContainer { codec: String, container: Container },

    #[error("configuración inválida: {0}")]
    Configuration(String),

    #[error("la tarea {0} no tiene archivo de entrada")]
    NoInputResource(String),

    #[error("entrada inválida: {0}")]
    InvalidInput(String),

    #[error("dispatch desconocido o ya resuelto: {0}")]
    UnknownDispatch(DispatchId),

    #[error("dispatch id duplicado: {0}")]
    DuplicateDispatch(DispatchId),

    #[error("el chunk {0} no existe")]
    UnknownChunk(usize),

    #[error("transición inválida del chunk {index}: {from:?} -> {to:?}")]
    InvalidTransition {
        index: usize,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("la tarea {0} ya está detenida o terminada")]
    TaskStopped(String),

    #[error("falló el merge de resultados: {0}")]
    Merge(String),

    #[error("no se pudo entregar el resultado en {path}: {source}")]
    MergeDelivery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Clase de error según cómo se trata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// La tarea nunca se construye
    Configuration,
    /// La tarea queda inutilizable
    Input,
    /// Se loguea y se ignora
    Bookkeeping,
    /// Operación rechazada por el estado actual de la tarea
    Conflict,
    /// Fatal: el resultado existe pero no se pudo entregar
    Delivery,
    Internal,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::MissingRequiredField(_)
            | TaskError::UnsupportedCodecForContainer { .. }
            | TaskError::Configuration(_) => ErrorKind::Configuration,
            TaskError::NoInputResource(_) | TaskError::InvalidInput(_) => ErrorKind::Input,
            TaskError::UnknownDispatch(_)
            | TaskError::DuplicateDispatch(_)
            | TaskError::UnknownChunk(_) => ErrorKind::Bookkeeping,
            TaskError::InvalidTransition { .. } | TaskError::TaskStopped(_) => ErrorKind::Conflict,
            TaskError::Merge(_) | TaskError::MergeDelivery { .. } => ErrorKind::Delivery,
            TaskError::Io(_) | TaskError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
