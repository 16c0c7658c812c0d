use std::{env, path::PathBuf, time::Duration};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_DATA_DIR: &str = "/data";

pub const DEFAULT_MAX_SUBTASK_RETRIES: u32 = 2;
pub const DEFAULT_SUBTASK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_WORKER_DEAD_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;

/// Configuración del master, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind: String,
    /// Raíz de datos: tasks/<id>/ con chunks y checkpoints
    pub data_dir: PathBuf,
    pub max_subtask_retries: u32,
    pub subtask_timeout: Duration,
    pub task_timeout: Duration,
    pub worker_dead_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            max_subtask_retries: DEFAULT_MAX_SUBTASK_RETRIES,
            subtask_timeout: Duration::from_secs(DEFAULT_SUBTASK_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            worker_dead_timeout: Duration::from_secs(DEFAULT_WORKER_DEAD_TIMEOUT_SECS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl MasterConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            bind: env::var("MASTER_BIND").unwrap_or(d.bind),
            data_dir: env::var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_subtask_retries: env_parse("MAX_SUBTASK_RETRIES").unwrap_or(d.max_subtask_retries),
            subtask_timeout: env_parse("SUBTASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.subtask_timeout),
            task_timeout: env_parse("TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.task_timeout),
            worker_dead_timeout: env_parse("WORKER_DEAD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.worker_dead_timeout),
            monitor_interval: env_parse("MONITOR_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.monitor_interval),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.data_dir.join("tasks").join(task_id)
    }
}
