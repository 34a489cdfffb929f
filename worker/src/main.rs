mod reporter;
mod worker;

use anyhow::{Context, Result};
use common::{WorkerAssignment, WorkerMessage, EXIT_CANCELED, EXIT_FAILED};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{io::AsyncReadExt, task::JoinError};
use tracing::{error, info, warn};

use crate::reporter::Reporter;
use crate::worker::{run_job, JobContext, JobError};

/// Mismo código que usa Rust cuando un pánico llega a `main`.
const EXIT_PANIC: i32 = 101;

/// Proceso worker: ejecuta exactamente una tarea.
/// - lee su `WorkerAssignment` de stdin
/// - reporta por stdout, un mensaje JSON por línea
/// - SIGTERM pide terminar; sale con `EXIT_CANCELED`
#[tokio::main]
async fn main() {
    // stdout es del protocolo: los logs van a stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=info".into()),
        )
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("worker abortado: {:#}", e);
            let _ = Reporter::stdout().send(&WorkerMessage::Failed {
                error: format!("{e:#}"),
            });
            EXIT_FAILED
        }
    };

    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cancel = Arc::new(AtomicBool::new(false));
    listen_for_terminate(cancel.clone())?;

    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("leyendo la asignación de stdin")?;
    let assignment: WorkerAssignment =
        serde_json::from_str(&raw).context("asignación con formato inválido")?;

    info!(
        "tarea {} ({}) en pid {}",
        assignment.task_id,
        assignment.job.kind(),
        std::process::id()
    );

    let reporter = Reporter::stdout();
    reporter.send(&WorkerMessage::Started)?;

    let artifact_path = assignment.artifact_path.clone();
    let ctx = JobContext::new(cancel.clone(), reporter.clone());
    let job = assignment.job;
    let handle = tokio::task::spawn_blocking(move || run_job(&job, &artifact_path, &ctx));
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => return Ok(crash_code(&assignment.task_id, e)),
    };

    match result {
        Ok(_) if cancel.load(Ordering::SeqCst) => {
            let _ = std::fs::remove_file(&assignment.artifact_path);
            info!("tarea {} cancelada al terminar", assignment.task_id);
            Ok(EXIT_CANCELED)
        }
        Ok(out) => {
            reporter.send(&WorkerMessage::Completed {
                artifact_path: assignment.artifact_path,
                rows: out.rows,
                bytes: out.bytes,
            })?;
            info!("tarea {} completada ({} filas)", assignment.task_id, out.rows);
            Ok(0)
        }
        Err(JobError::Canceled) => {
            info!("tarea {} cancelada", assignment.task_id);
            Ok(EXIT_CANCELED)
        }
        Err(e) => {
            warn!("tarea {} falló: {}", assignment.task_id, e);
            reporter.send(&WorkerMessage::Failed {
                error: e.to_string(),
            })?;
            Ok(EXIT_FAILED)
        }
    }
}

/// Un pánico del job no se reporta como `failed`: sale con un código fuera
/// del protocolo y el manager lo registra como caída.
fn crash_code(task_id: &str, e: JoinError) -> i32 {
    if e.is_panic() {
        error!("el job de {} entró en pánico", task_id);
    } else {
        error!("el job de {} no terminó: {}", task_id, e);
    }
    EXIT_PANIC
}

/// Prende `cancel` al recibir SIGTERM.
fn listen_for_terminate(cancel: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("instalando handler de SIGTERM")?;
        tokio::spawn(async move {
            if term.recv().await.is_some() {
                info!("SIGTERM recibido, cancelando");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    Ok(())
}
