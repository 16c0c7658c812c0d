use crate::state::AppState;
use chrono::{DateTime, Utc};
use common::{Outcome, TerminalNotification};
use std::{collections::HashSet, time::SystemTime};
use tracing::{info, warn};

/// Loop de supervisión: workers sin heartbeat y dispatches vencidos.
pub async fn monitor_workers(state: AppState) {
    loop {
        tokio::time::sleep(state.config.monitor_interval).await;
        let timed_out = sweep_once(&state, Utc::now()).await;
        if timed_out > 0 {
            info!("monitor: {} dispatches reportados como timed_out", timed_out);
        }
    }
}

/// Una pasada de chequeo. Devuelve cuántos dispatches se dieron por vencidos.
pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> usize {
    let dead_workers = mark_dead_workers(state, SystemTime::from(now));

    let mut expired = Vec::new();
    for task in state.tasks_in_order() {
        // Dispatches de workers muertos
        for worker_id in &dead_workers {
            for dispatch_id in task.outstanding_for_worker(worker_id) {
                info!(
                    "dispatch {} de la tarea {} perdido con el worker {}",
                    dispatch_id,
                    task.id(),
                    worker_id
                );
                expired.push((task.id().clone(), dispatch_id));
            }
        }

        // Dispatches con deadline vencido
        for dispatch_id in task.expired_dispatches(now) {
            if !expired.iter().any(|(_, d)| *d == dispatch_id) {
                info!("dispatch {} de la tarea {} venció", dispatch_id, task.id());
                expired.push((task.id().clone(), dispatch_id));
            }
        }
    }

    let mut reported = 0;
    for (task_id, dispatch_id) in expired {
        let notification = TerminalNotification {
            task_id,
            dispatch_id,
            outcome: Outcome::TimedOut,
            result_paths: Vec::new(),
        };
        match state.notify(&notification).await {
            Ok(_) => reported += 1,
            Err(e) => warn!(
                "no se pudo reportar el timeout del dispatch {}: {}",
                notification.dispatch_id, e
            ),
        }
    }
    reported
}

fn mark_dead_workers(state: &AppState, now: SystemTime) -> HashSet<String> {
    let timeout = state.config.worker_dead_timeout;
    let mut dead = HashSet::new();

    let mut workers = state.workers();
    for (id, meta) in workers.iter_mut() {
        if meta.dead {
            continue;
        }
        if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
            if elapsed > timeout {
                meta.dead = true;
                info!("marcando worker {} como muerto", id);
                dead.insert(id.clone());
            }
        }
    }
    dead
}
