use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{ChunkDescriptor, ChunkStatus, DispatchId, Outcome, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Un intento de cómputo de un chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub chunk_index: usize,
    pub worker_id: WorkerId,
    pub performance: f64,
    pub dispatched_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// None mientras el intento está en vuelo
    pub outcome: Option<Outcome>,
}

impl DispatchRecord {
    pub fn is_outstanding(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Tabla autoritativa de chunks y dispatches de una tarea.
/// Existe exactamente un descriptor por índice en [0, N).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkRegistry {
    chunks: Vec<ChunkDescriptor>,
    dispatches: HashMap<DispatchId, DispatchRecord>,
}

impl ChunkRegistry {
    /// N descriptores `pending` con índices 0..N-1.
    pub fn seeded(n: usize) -> Self {
        Self {
            chunks: (0..n).map(ChunkDescriptor::pending).collect(),
            dispatches: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn get(&self, index: usize) -> Result<&ChunkDescriptor> {
        self.chunks.get(index).ok_or(TaskError::UnknownChunk(index))
    }

    pub fn status(&self, index: usize) -> Result<ChunkStatus> {
        self.get(index).map(|c| c.status)
    }

    /// Cambia el estado validando la máquina de estados.
    pub fn transition(&mut self, index: usize, to: ChunkStatus) -> Result<()> {
        let chunk = self
            .chunks
            .get_mut(index)
            .ok_or(TaskError::UnknownChunk(index))?;

        if !chunk.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                index,
                from: chunk.status,
                to,
            });
        }
        chunk.status = to;
        Ok(())
    }

    /// Primer chunk (por índice) esperando reintento.
    pub fn first_awaiting_retry(&self) -> Option<usize> {
        self.chunks
            .iter()
            .find(|c| c.status.awaits_retry())
            .map(|c| c.index)
    }

    pub fn awaiting_retry(&self) -> usize {
        self.chunks.iter().filter(|c| c.status.awaits_retry()).count()
    }

    pub fn all_ended(&self) -> bool {
        self.chunks.iter().all(|c| c.status.is_ended())
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|c| c.status == status).count()
    }

    /// Registra un dispatch nuevo y deja el chunk en `dispatched`.
    pub fn record_dispatch(&mut self, dispatch_id: DispatchId, record: DispatchRecord) -> Result<()> {
        if self.dispatches.contains_key(&dispatch_id) {
            return Err(TaskError::DuplicateDispatch(dispatch_id));
        }

        let index = record.chunk_index;
        self.transition(index, ChunkStatus::Dispatched)?;

        let chunk = &mut self.chunks[index];
        chunk.assigned_worker = Some(record.worker_id.clone());
        chunk.dispatch_id = Some(dispatch_id.clone());

        self.dispatches.insert(dispatch_id, record);
        Ok(())
    }

    pub fn dispatch(&self, dispatch_id: &str) -> Option<&DispatchRecord> {
        self.dispatches.get(dispatch_id)
    }

    /// Cierra un dispatch en vuelo y devuelve el índice de su chunk.
    /// Falla con `UnknownDispatch` si nunca se emitió o ya estaba resuelto.
    pub fn resolve(&mut self, dispatch_id: &str, outcome: Outcome) -> Result<usize> {
        match self.dispatches.get_mut(dispatch_id) {
            Some(record) if record.is_outstanding() => {
                record.outcome = Some(outcome);
                Ok(record.chunk_index)
            }
            _ => Err(TaskError::UnknownDispatch(dispatch_id.to_string())),
        }
    }

    pub fn outstanding(&self) -> impl Iterator<Item = (&DispatchId, &DispatchRecord)> {
        self.dispatches.iter().filter(|(_, r)| r.is_outstanding())
    }

    pub fn outstanding_ids(&self) -> Vec<DispatchId> {
        self.outstanding().map(|(id, _)| id.clone()).collect()
    }

    pub fn append_results(&mut self, index: usize, paths: &[String]) -> Result<()> {
        let chunk = self
            .chunks
            .get_mut(index)
            .ok_or(TaskError::UnknownChunk(index))?;
        chunk.result_paths.extend(paths.iter().cloned());
        Ok(())
    }

    /// Resultados de los chunks exitosos, en orden de índice.
    pub fn results_in_order(&self) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Succeeded)
            .flat_map(|c| c.result_paths.iter().cloned())
            .collect()
    }

    /// Chunks que nunca se van a despachar pasan a `cancelled`.
    pub fn abandon_unscheduled(&mut self) -> usize {
        let mut abandoned = 0;
        for chunk in self.chunks.iter_mut() {
            if matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Restarted) {
                chunk.status = ChunkStatus::Cancelled;
                abandoned += 1;
            }
        }
        abandoned
    }
}
