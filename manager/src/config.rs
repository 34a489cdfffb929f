use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MEMORY_SAMPLE_MS: u64 = 1_000;
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 1 << 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Configuración del gestor de tareas.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Máximo de tareas activas (queued + running) a la vez
    pub max_concurrency: usize,
    /// Ejecutable del worker y sus argumentos
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    /// Carpeta donde los workers dejan sus artefactos
    pub spool_dir: PathBuf,
    /// Tiempo entre SIGTERM y SIGKILL al cancelar
    pub cancel_grace: Duration,
    /// Cuánto espera `shutdown` a que terminen los workers
    pub shutdown_timeout: Duration,
    pub memory_interval: Duration,
    pub cache_max_bytes: u64,
    /// Si está, las tareas terminadas se borran pasado este tiempo
    pub task_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            spool_dir: env::temp_dir().join("flow-tasks"),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            memory_interval: Duration::from_millis(DEFAULT_MEMORY_SAMPLE_MS),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            task_ttl: None,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// El worker se busca al lado del ejecutable actual; si no, en el PATH.
fn default_worker_program() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("worker")))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("worker"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl ManagerConfig {
    /// Lee la configuración desde variables de entorno.
    /// Valores ausentes o inválidos caen al default.
    ///
    /// | Env Var                 | Default                  |
    /// |-------------------------|--------------------------|
    /// | `MAX_CONCURRENCY`       | `4`                      |
    /// | `WORKER_BIN`            | `worker` junto al binario|
    /// | `SPOOL_DIR`             | `$TMPDIR/flow-tasks`     |
    /// | `CANCEL_GRACE_MS`       | `5000`                   |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                     |
    /// | `MEMORY_SAMPLE_MS`      | `1000`                   |
    /// | `CACHE_MAX_BYTES`       | `1073741824`             |
    /// | `TASK_TTL_SECS`         | sin TTL                  |
    /// | `SWEEP_INTERVAL_SECS`   | `60`                     |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrency: env_parse::<usize>("MAX_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrency),
            worker_program: env::var("WORKER_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_program),
            worker_args: defaults.worker_args,
            spool_dir: env::var("SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            cancel_grace: env_parse::<u64>("CANCEL_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.cancel_grace),
            shutdown_timeout: env_parse::<u64>("SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            memory_interval: env_parse::<u64>("MEMORY_SAMPLE_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.memory_interval),
            cache_max_bytes: env_parse::<u64>("CACHE_MAX_BYTES")
                .unwrap_or(defaults.cache_max_bytes),
            task_ttl: env_parse::<u64>("TASK_TTL_SECS").map(Duration::from_secs),
            sweep_interval: env_parse::<u64>("SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        }
    }
}
