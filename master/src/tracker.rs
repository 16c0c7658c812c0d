use chrono::{DateTime, Utc};
use common::{ChunkStatus, Outcome};
use tracing::{error, info, warn};

use crate::error::{Result, TaskError};
use crate::task::TaskState;

/// Resultado de aplicar un evento sobre el estado de la tarea.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Running,
    /// La terminación se alcanzó en esta llamada (merge_triggered pasó a true)
    Terminated(Termination),
    /// Ya había terminado antes; el evento no cambió nada
    AlreadyTerminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    /// Terminó sin que todos los chunks fueran exitosos
    pub partial: bool,
    /// Resultados de chunks exitosos en orden de índice; vacío = nada que mezclar
    pub results: Vec<String>,
}

/// Transiciones de los chunks ante notificaciones terminales y predicado de fin.
pub struct CompletionTracker<'a> {
    task_id: &'a str,
}

impl<'a> CompletionTracker<'a> {
    pub fn new(task_id: &'a str) -> Self {
        Self { task_id }
    }

    pub fn on_terminal_notification(
        &self,
        state: &mut TaskState,
        dispatch_id: &str,
        outcome: Outcome,
        result_paths: &[String],
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        // notificaciones tardías después del merge no reabren nada
        if state.run.merge_triggered {
            warn!(
                "notificación {:?} para dispatch {} llegó con la tarea {} ya terminada, se ignora",
                outcome, dispatch_id, self.task_id
            );
            return Ok(Progress::AlreadyTerminated);
        }

        let index = state.registry.resolve(dispatch_id, outcome)?;

        match outcome {
            Outcome::Succeeded => {
                if state.registry.status(index)? == ChunkStatus::Succeeded {
                    return Ok(Progress::Running);
                }
                state.registry.transition(index, ChunkStatus::Succeeded)?;
                state.registry.append_results(index, result_paths)?;
                state.run.succeeded += 1;

                info!(
                    "tarea {}: chunk {} listo ({} de {})",
                    self.task_id, index, state.run.succeeded, state.run.total
                );
            }
            Outcome::Failed | Outcome::TimedOut | Outcome::Cancelled => {
                state.registry.transition(index, outcome.status())?;
                let failures = state.ledger.record_failure(index);

                if state.ledger.should_retry(index) {
                    info!(
                        "tarea {}: chunk {} terminó {:?} (fallo {}), se va a reintentar",
                        self.task_id, index, outcome, failures
                    );
                } else if !state.run.permanently_failed {
                    state.run.permanently_failed = true;
                    let abandoned = state.registry.abandon_unscheduled();
                    warn!(
                        "tarea {}: chunk {} superó el máximo de reintentos ({}), \
                         la tarea termina con resultados parciales ({} chunks abandonados)",
                        self.task_id,
                        index,
                        state.ledger.max_retries(),
                        abandoned
                    );
                }
            }
        }

        Ok(self.evaluate(state, now))
    }

    /// Cancela la tarea completa: todo lo que no terminó pasa a `cancelled`.
    pub fn cancel(&self, state: &mut TaskState, now: DateTime<Utc>) -> Result<Progress> {
        if state.run.merge_triggered {
            return Ok(Progress::AlreadyTerminated);
        }

        state.run.cancelled = true;

        for dispatch_id in state.registry.outstanding_ids() {
            let index = state.registry.resolve(&dispatch_id, Outcome::Cancelled)?;
            state.registry.transition(index, ChunkStatus::Cancelled)?;
        }
        let abandoned = state.registry.abandon_unscheduled();

        info!(
            "tarea {} cancelada ({} chunks nunca despachados)",
            self.task_id, abandoned
        );

        Ok(self.evaluate(state, now))
    }

    /// Un operador vuelve a poner en cola un chunk cuyo intento falló.
    pub fn restart(&self, state: &mut TaskState, index: usize) -> Result<()> {
        if state.run.is_stopped() || state.run.merge_triggered {
            return Err(TaskError::TaskStopped(self.task_id.to_string()));
        }
        state.registry.transition(index, ChunkStatus::Restarted)?;
        info!("tarea {}: chunk {} reiniciado", self.task_id, index);
        Ok(())
    }

    /// Evalúa el predicado de fin y dispara el merge a lo sumo una vez.
    fn evaluate(&self, state: &mut TaskState, now: DateTime<Utc>) -> Progress {
        if state.run.merge_triggered {
            return Progress::AlreadyTerminated;
        }
        if !state.is_finished() {
            return Progress::Running;
        }

        state.run.merge_triggered = true;
        state.run.finished_at = Some(now);

        let partial = state.run.succeeded < state.run.total;
        let results = state.registry.results_in_order();

        if results.is_empty() {
            error!(
                "tarea {} terminó sin ningún chunk exitoso, no hay nada que mezclar",
                self.task_id
            );
        } else {
            info!(
                "tarea {} terminada ({}), {} resultados para mezclar",
                self.task_id,
                if partial { "parcial" } else { "completa" },
                results.len()
            );
        }

        Progress::Terminated(Termination { partial, results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SubtaskScheduler;
    use crate::task::tests::{definition, state_with};
    use common::DispatchDescriptor;

    fn next(state: &mut TaskState, n: usize) -> DispatchDescriptor {
        let def = definition(n);
        SubtaskScheduler::new(&def)
            .dispatch(state, 1.0, &"w".to_string(), Utc::now())
            .unwrap()
            .unwrap()
    }

    fn notify(state: &mut TaskState, d: &DispatchDescriptor, outcome: Outcome) -> Progress {
        let results = match outcome {
            Outcome::Succeeded => vec![format!("/res/{}.mp4", d.chunk_index)],
            _ => vec![],
        };
        CompletionTracker::new("t")
            .on_terminal_notification(state, &d.dispatch_id, outcome, &results, Utc::now())
            .unwrap()
    }

    #[test]
    fn exito_completo_dispara_merge_una_vez_en_orden() {
        let mut state = state_with(4);
        let ds: Vec<_> = (0..4).map(|_| next(&mut state, 4)).collect();

        // llegan desordenados
        for i in [3, 1, 0] {
            assert_eq!(notify(&mut state, &ds[i], Outcome::Succeeded), Progress::Running);
        }
        assert!(!state.is_finished());

        let p = notify(&mut state, &ds[2], Outcome::Succeeded);
        assert_eq!(
            p,
            Progress::Terminated(Termination {
                partial: false,
                results: vec![
                    "/res/0.mp4".to_string(),
                    "/res/1.mp4".to_string(),
                    "/res/2.mp4".to_string(),
                    "/res/3.mp4".to_string(),
                ],
            })
        );
        assert!(state.is_finished());
        assert!(state.run.merge_triggered);
    }

    #[test]
    fn exito_duplicado_no_cuenta_dos_veces() {
        let mut state = state_with(2);
        let d = next(&mut state, 2);

        notify(&mut state, &d, Outcome::Succeeded);
        let err = CompletionTracker::new("t")
            .on_terminal_notification(&mut state, &d.dispatch_id, Outcome::Succeeded, &[], Utc::now())
            .unwrap_err();

        assert!(matches!(err, TaskError::UnknownDispatch(_)));
        assert_eq!(state.run.succeeded, 1);
        assert_eq!(state.registry.get(0).unwrap().result_paths.len(), 1);
    }

    #[test]
    fn max_retries_fallos_activan_latch_y_no_se_reenvia() {
        let mut state = state_with(2);

        // el primer fallo se reintenta
        let d = next(&mut state, 2);
        notify(&mut state, &d, Outcome::Failed);
        assert!(!state.run.permanently_failed);
        assert!(state.needs_more_work());

        // el reintento va antes que el chunk 1 y vuelve a fallar
        let d = next(&mut state, 2);
        assert_eq!(d.chunk_index, 0);
        notify(&mut state, &d, Outcome::Failed);

        assert!(state.run.permanently_failed);
        assert_eq!(state.ledger.failures(0), 2);
        // el chunk 1 nunca se despachó y queda abandonado
        assert_eq!(state.registry.status(1).unwrap(), ChunkStatus::Cancelled);
        assert!(!state.needs_more_work());

        let def = definition(2);
        assert!(SubtaskScheduler::new(&def)
            .dispatch(&mut state, 1.0, &"w".to_string(), Utc::now())
            .unwrap()
            .is_none());
        // sin ningún éxito no hay nada que mezclar
        assert!(state.is_finished());
    }

    #[test]
    fn terminacion_parcial_mezcla_solo_los_exitosos() {
        let mut state = state_with(3);
        let d0 = next(&mut state, 3);
        let mut d1 = next(&mut state, 3);
        let mut d2 = next(&mut state, 3);

        assert_eq!(notify(&mut state, &d0, Outcome::Succeeded), Progress::Running);

        notify(&mut state, &d1, Outcome::Failed);
        notify(&mut state, &d2, Outcome::TimedOut);
        d1 = next(&mut state, 3);
        d2 = next(&mut state, 3);
        assert_eq!((d1.chunk_index, d2.chunk_index), (1, 2));

        // segundo fallo del chunk 1: latch, pero el chunk 2 sigue en vuelo
        assert_eq!(notify(&mut state, &d1, Outcome::Failed), Progress::Running);
        assert!(state.run.permanently_failed);
        assert!(!state.is_finished());

        let p = notify(&mut state, &d2, Outcome::Failed);
        assert_eq!(
            p,
            Progress::Terminated(Termination {
                partial: true,
                results: vec!["/res/0.mp4".to_string()],
            })
        );
        assert!(state.is_finished());
    }

    #[test]
    fn exito_del_ultimo_intento_cierra_tarea_detenida() {
        let mut state = state_with(2);
        let mut d0 = next(&mut state, 2);
        let d1 = next(&mut state, 2);

        notify(&mut state, &d0, Outcome::Failed);
        d0 = next(&mut state, 2);
        assert_eq!(notify(&mut state, &d0, Outcome::Failed), Progress::Running);
        assert!(state.run.permanently_failed);

        match notify(&mut state, &d1, Outcome::Succeeded) {
            Progress::Terminated(t) => {
                assert!(t.partial);
                assert_eq!(t.results, vec!["/res/1.mp4".to_string()]);
            }
            other => panic!("se esperaba terminación, llegó {other:?}"),
        }
    }

    #[test]
    fn cancelar_resuelve_dispatches_en_vuelo() {
        let mut state = state_with(3);
        let d0 = next(&mut state, 3);
        let d1 = next(&mut state, 3);
        notify(&mut state, &d0, Outcome::Succeeded);

        let p = CompletionTracker::new("t").cancel(&mut state, Utc::now()).unwrap();
        assert_eq!(
            p,
            Progress::Terminated(Termination {
                partial: true,
                results: vec!["/res/0.mp4".to_string()],
            })
        );
        assert_eq!(state.registry.status(1).unwrap(), ChunkStatus::Cancelled);
        assert_eq!(state.registry.status(2).unwrap(), ChunkStatus::Cancelled);

        // la respuesta tardía del dispatch cancelado es un no-op
        let late = CompletionTracker::new("t")
            .on_terminal_notification(&mut state, &d1.dispatch_id, Outcome::Succeeded, &[], Utc::now())
            .unwrap();
        assert_eq!(late, Progress::AlreadyTerminated);
        assert_eq!(state.run.succeeded, 1);
    }

    #[test]
    fn reiniciar_exige_intento_fallido() {
        let mut state = state_with(2);
        let d0 = next(&mut state, 2);
        let tracker = CompletionTracker::new("t");

        assert!(matches!(
            tracker.restart(&mut state, 0),
            Err(TaskError::InvalidTransition { .. })
        ));

        notify(&mut state, &d0, Outcome::Cancelled);
        tracker.restart(&mut state, 0).unwrap();
        assert_eq!(state.registry.status(0).unwrap(), ChunkStatus::Restarted);
        assert_eq!(next(&mut state, 2).chunk_index, 0);
    }
}
