use anyhow::Result;
use common::{
    DispatchRequest, DispatchResponse, TerminalNotification, WorkerHeartbeatRequest,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::transcode;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_OUTPUT_DIR: &str = "/data/results";

/// Configuración del worker, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_base_url: String,
    pub max_concurrency: u32,
    /// Donde se escriben los resultados de cada chunk
    pub output_dir: PathBuf,
    /// Programa de transcodificación; sin él los chunks se copian tal cual
    pub program: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            master_base_url: env::var("MASTER_BASE_URL")
                .unwrap_or_else(|_| "http://master:8080".to_string()),
            max_concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            output_dir: env::var("WORKER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            program: env::var("TRANSCODE_PROGRAM")
                .ok()
                .filter(|p| !p.trim().is_empty()),
        }
    }
}

/// Qué tan rápido puede procesar este worker ahora: CPUs libres aproximadas.
fn performance(sys: &System) -> f64 {
    let cpus = sys.cpus().len().max(1) as f64;
    let busy = (sys.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 0.9);
    cpus * (1.0 - busy)
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide chunks mientras tenga "slots" libres.
/// - Procesa cada chunk en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = Arc::new(WorkerConfig::from_env());
    let base_url = config.master_base_url.clone();
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: config.max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {} (programa={:?})",
        worker_id, config.max_concurrency, base_url, config.program
    );

    let sem = Arc::new(Semaphore::new(config.max_concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent,
                mem_bytes,
            })
            .send()
            .await
        {
            warn!("heartbeat fallido: {}", e);
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevos chunks; esperamos un poco
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos un chunk al master
        let assign_url = format!("{}/api/v1/subtasks/next", base_url);
        let assignment: DispatchResponse = match client
            .post(&assign_url)
            .json(&DispatchRequest {
                worker_id: worker_id.clone(),
                performance: performance(&sys),
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => resp.json().await?,
            Err(e) => {
                warn!("no se pudo pedir trabajo al master: {}", e);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if let Some(dispatch) = assignment.dispatch {
            info!(
                "tengo el chunk {} de la tarea {} (dispatch={} deadline={})",
                dispatch.chunk_index, dispatch.task_id, dispatch.dispatch_id, dispatch.deadline
            );

            // Clonar lo que usamos en la tarea asíncrona
            let client_cloned = client.clone();
            let config_cloned = config.clone();

            tokio::spawn(async move {
                let (outcome, result_paths) = transcode::execute(
                    &dispatch,
                    &config_cloned.output_dir,
                    config_cloned.program.as_deref(),
                )
                .await;

                // Reportar al master exactamente un resultado terminal
                let complete_url =
                    format!("{}/api/v1/subtasks/complete", config_cloned.master_base_url);
                let notification = TerminalNotification {
                    task_id: dispatch.task_id.clone(),
                    dispatch_id: dispatch.dispatch_id.clone(),
                    outcome,
                    result_paths,
                };
                if let Err(e) = client_cloned
                    .post(&complete_url)
                    .json(&notification)
                    .send()
                    .await
                {
                    warn!(
                        "no se pudo reportar el dispatch {}: {}",
                        dispatch.dispatch_id, e
                    );
                }

                // Liberar el "slot" de concurrencia al terminar
                drop(permit);
            });
        } else {
            // No hay trabajo: devolvemos el permiso y dormimos
            drop(permit);
            sleep(Duration::from_secs(2)).await;
        }
    }
}
