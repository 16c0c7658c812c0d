use chrono::{DateTime, Utc};
use common::{ChunkStatus, DispatchDescriptor, WorkerId};
use tracing::{debug, info};

use crate::builder::{deadline_after, TaskDefinition};
use crate::error::{Result, TaskError};
use crate::registry::DispatchRecord;
use crate::task::TaskState;

/// Decide qué chunk se despacha a continuación.
/// Los chunks fallidos o reiniciados tienen prioridad sobre los nunca despachados.
pub struct SubtaskScheduler<'a> {
    definition: &'a TaskDefinition,
}

impl<'a> SubtaskScheduler<'a> {
    pub fn new(definition: &'a TaskDefinition) -> Self {
        Self { definition }
    }

    /// Índice del próximo chunk, o None si no hay más trabajo.
    /// Debe llamarse con el lock de la tarea tomado.
    pub fn select_next(&self, state: &mut TaskState) -> Result<Option<usize>> {
        if state.run.is_stopped() {
            return Ok(None);
        }

        // 1) reintentos primero, en orden de índice
        if let Some(index) = state.registry.first_awaiting_retry() {
            debug!(
                "el chunk {} de la tarea {} falló, se reenvía",
                index, self.definition.task_id
            );
            state.registry.transition(index, ChunkStatus::Resent)?;
            return Ok(Some(index));
        }

        // 2) después, chunks nunca despachados
        if state.run.dispatch_cursor < state.run.total {
            let index = state.run.dispatch_cursor;
            state.run.dispatch_cursor += 1;
            return Ok(Some(index));
        }

        Ok(None)
    }

    /// Selecciona un chunk, arma su descriptor y lo registra antes de devolverlo.
    pub fn dispatch(
        &self,
        state: &mut TaskState,
        performance: f64,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchDescriptor>> {
        // antes de tocar el estado: nada después de select_next puede fallar
        // sin dejar el chunk seleccionado colgado
        let deadline = self.deadline_from(now);

        let Some(index) = self.select_next(state)? else {
            return Ok(None);
        };

        let resource = state
            .chunk_resources
            .get(index)
            .cloned()
            .ok_or(TaskError::UnknownChunk(index))?;

        let dispatch_id = uuid::Uuid::new_v4().to_string();

        state.registry.record_dispatch(
            dispatch_id.clone(),
            DispatchRecord {
                chunk_index: index,
                worker_id: worker_id.clone(),
                performance,
                dispatched_at: now,
                deadline,
                outcome: None,
            },
        )?;

        if state.run.started_at.is_none() {
            state.run.started_at = Some(now);
        }

        info!(
            "despachando chunk {} de la tarea {} al worker {} (dispatch={}, deadline={})",
            index, self.definition.task_id, worker_id, dispatch_id, deadline
        );

        Ok(Some(DispatchDescriptor {
            task_id: self.definition.task_id.clone(),
            dispatch_id,
            chunk_index: index,
            resource,
            params: self.definition.params.clone(),
            performance,
            deadline,
        }))
    }

    /// min(now + timeout por chunk, deadline de la tarea). Un timeout que
    /// no entra en un DateTime deja sólo el deadline de la tarea.
    pub fn deadline_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match deadline_after(now, self.definition.subtask_timeout_secs) {
            Some(per_chunk) => per_chunk.min(self.definition.deadline),
            None => self.definition.deadline,
        }
    }
}
