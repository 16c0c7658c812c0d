use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    AudioOptionsRequest, ChunkDescriptor, TaskInfo, TaskOptionsRequest, TaskRequest,
    TaskResults, VideoOptionsRequest, WorkerMetrics,
};
use reqwest::{Client, Response};
use std::env;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una tarea de transcodificación
    Submit(SubmitArgs),
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lista los chunks de una tarea y su estado
    Chunks {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Muestra el archivo final y los resultados por chunk
    Results {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Cancela una tarea
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Vuelve a poner en cola un chunk terminado
    Restart {
        #[arg(value_name = "TASK_ID")]
        id: String,
        #[arg(value_name = "INDICE")]
        index: usize,
    },

    Workers,
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(value_name = "NOMBRE")]
    name: String,

    /// Archivo de entrada (visible para el master)
    #[arg(value_name = "INPUT")]
    input: String,

    /// Directorio de salida
    #[arg(long, short = 'o')]
    output_path: String,

    #[arg(long)]
    output_filename: Option<String>,

    /// Cantidad de chunks pedida
    #[arg(long, short = 'n')]
    subtasks: Option<u32>,

    #[arg(long)]
    container: Option<String>,

    #[arg(long)]
    video_codec: Option<String>,

    /// Ej: 2M
    #[arg(long)]
    video_bitrate: Option<String>,

    /// Ej: 30 o 30000/1001
    #[arg(long)]
    frame_rate: Option<String>,

    /// Ej: 1280x720
    #[arg(long)]
    resolution: Option<String>,

    #[arg(long)]
    audio_codec: Option<String>,

    #[arg(long)]
    audio_bitrate: Option<String>,

    #[arg(long)]
    subtask_timeout_secs: Option<u64>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

/// "1280x720" -> (1280, 720)
fn parse_resolution(s: &str) -> Result<(u32, u32)> {
    let Some((w, h)) = s.trim().to_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse::<u32>(), h.trim().parse::<u32>())
    }) else {
        bail!("resolución inválida: {s} (se espera ANCHOxALTO)");
    };
    match (w, h) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => bail!("resolución inválida: {s} (se espera ANCHOxALTO)"),
    }
}

impl SubmitArgs {
    fn into_request(self) -> Result<TaskRequest> {
        let resolution = self.resolution.as_deref().map(parse_resolution).transpose()?;

        Ok(TaskRequest {
            name: self.name,
            resources: vec![self.input],
            subtasks_count: self.subtasks,
            subtask_timeout_secs: self.subtask_timeout_secs,
            timeout_secs: self.timeout_secs,
            options: Some(TaskOptionsRequest {
                video: VideoOptionsRequest {
                    codec: self.video_codec,
                    bit_rate: self.video_bitrate,
                    frame_rate: self.frame_rate,
                    resolution,
                },
                audio: AudioOptionsRequest {
                    codec: self.audio_codec,
                    bit_rate: self.audio_bitrate,
                },
                container: self.container,
                output_path: Some(self.output_path),
                output_filename: self.output_filename,
                ..Default::default()
            }),
        })
    }
}

fn print_task(task: &TaskInfo) {
    println!("Tarea:");
    println!("  id: {}", task.id);
    println!("  nombre: {}", task.name);
    println!("  estado: {:?}", task.status);
    println!("  input: {}", task.input);
    println!("  output: {}", task.output_file);

    println!(
        "  chunks: pedidos={}, total={}, ok={}, fallidos={}, en vuelo={}, reintentos={}",
        task.requested_chunks,
        task.total_chunks,
        task.succeeded_chunks,
        task.failed_chunks,
        task.outstanding_dispatches,
        task.retries
    );

    // progreso calculado localmente
    if task.total_chunks > 0 {
        let pct = (task.succeeded_chunks as f64 / task.total_chunks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    } else {
        println!("  progreso: (sin chunks)");
    }

    println!("  submitted_at: {}", task.submitted_at);
    println!("  deadline: {}", task.deadline);
    if let Some(ref started) = task.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = task.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref err) = task.error {
        println!("  error: {}", err);
    }
}

async fn fail(what: &str, resp: Response) -> Result<()> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    println!("Error: {} (status {}) {}", what, status, body);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit(args) => {
            let url = format!("{}/api/v1/tasks", base_url);
            let req = args.into_request()?;

            let resp = client.post(&url).json(&req).send().await?;
            if resp.status().is_success() {
                let task: TaskInfo = resp.json().await?;
                println!("Tarea creada.");
                print_task(&task);
            } else {
                fail("no se pudo crear la tarea", resp).await?;
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let task: TaskInfo = resp.json().await?;
                print_task(&task);
            } else {
                fail("tarea no encontrada", resp).await?;
            }
        }

        Commands::Chunks { id } => {
            let url = format!("{}/api/v1/tasks/{id}/chunks", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let chunks: Vec<ChunkDescriptor> = resp.json().await?;
                for c in chunks {
                    println!(
                        "  [{:>3}] {:<10} worker={} dispatch={}",
                        c.index,
                        format!("{:?}", c.status),
                        c.assigned_worker.as_deref().unwrap_or("-"),
                        c.dispatch_id.as_deref().unwrap_or("-")
                    );
                }
            } else {
                fail("tarea no encontrada", resp).await?;
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/tasks/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: TaskResults = resp.json().await?;
                println!("Resultados para tarea {}:", results.task_id);
                match results.output_file {
                    Some(ref f) if results.partial => println!("  archivo final (parcial): {}", f),
                    Some(ref f) => println!("  archivo final: {}", f),
                    None => println!("  (todavía sin archivo final)"),
                }
                if results.chunk_results.is_empty() {
                    println!("  (sin resultados de chunks)");
                } else {
                    println!("  resultados por chunk:");
                    for f in results.chunk_results {
                        println!("    - {}", f);
                    }
                }
            } else {
                fail("no se encontraron resultados", resp).await?;
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{id}/cancel", base_url);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                let task: TaskInfo = resp.json().await?;
                println!("Tarea cancelada.");
                print_task(&task);
            } else {
                fail("no se pudo cancelar", resp).await?;
            }
        }

        Commands::Restart { id, index } => {
            let url = format!("{}/api/v1/tasks/{id}/chunks/{index}/restart", base_url);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                println!("Chunk {} de la tarea {} reiniciado.", index, id);
            } else {
                fail("no se pudo reiniciar el chunk", resp).await?;
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                } else {
                    for w in workers {
                        println!("Worker {}", w.worker_id);
                        println!("  host           : {}", w.hostname);
                        println!("  dead           : {}", w.dead);
                        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                        println!(
                            "  concurrency    : max={}, activos={}",
                            w.max_concurrency, w.active_dispatches
                        );
                        println!(
                            "  dispatches     : started={}, ok={}, failed={}",
                            w.dispatches_started, w.dispatches_succeeded, w.dispatches_failed
                        );
                        if let Some(avg) = w.avg_dispatch_ms {
                            println!("  avg_ms         : {:.1}", avg);
                        } else {
                            println!("  avg_ms         : (sin datos)");
                        }
                        if let Some(cpu) = w.cpu_percent {
                            println!("  cpu_percent    : {:.1}%", cpu);
                        } else {
                            println!("  cpu_percent    : (sin datos)");
                        }
                        if let Some(mem) = w.mem_bytes {
                            println!("  mem_bytes      : {}", mem);
                        } else {
                            println!("  mem_bytes      : (sin datos)");
                        }
                        println!();
                    }
                }
            } else {
                fail("no se pudo consultar /api/v1/workers", resp).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_resoluciones() {
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_resolution(" 640X480 ").unwrap(), (640, 480));
        assert!(parse_resolution("hd").is_err());
        assert!(parse_resolution("1280x").is_err());
    }

    #[test]
    fn submit_arma_el_request() {
        let cli = Cli::parse_from([
            "client", "submit", "clip", "/data/in/clip.mkv", "-o", "/data/out", "-n", "4",
            "--video-codec", "h264", "--resolution", "1920x1080",
        ]);
        let Commands::Submit(args) = cli.command else {
            panic!("se esperaba submit");
        };
        let req = args.into_request().unwrap();

        assert_eq!(req.resources, vec!["/data/in/clip.mkv"]);
        assert_eq!(req.subtasks_count, Some(4));
        let options = req.options.unwrap();
        assert_eq!(options.output_path.as_deref(), Some("/data/out"));
        assert_eq!(options.video.codec.as_deref(), Some("h264"));
        assert_eq!(options.video.resolution, Some((1920, 1080)));
        assert!(options.container.is_none());
    }
}
