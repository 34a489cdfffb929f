//! Punto de entrada público: recibe jobs, lanza un worker por tarea,
//! actualiza el registro con lo que reporta cada worker y expone
//! cancelación y apagado.

use common::{
    new_task_id, JobKind, JobPayload, MemorySample, Table, TaskFailure, TaskId, TaskInfo,
    TaskStatus, WorkerAssignment, WorkerMessage,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheError, ResultCache},
    config::ManagerConfig,
    error::TaskError,
    launcher::{ProcessLauncher, StopMode, StopRequest, WorkerOutcome, WorkerProcess},
    monitor::MemoryMonitor,
    registry::{CancelOutcome, TaskRegistry},
    sweeper,
};

/// Tras el SIGKILL de un apagado, cuánto más esperamos antes de soltar el proceso.
const FORCE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelAck {
    pub id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Tareas activas canceladas por el apagado
    pub canceled: usize,
    /// Workers que no salieron a tiempo y se mataron
    pub forced: usize,
}

struct Supervision {
    stop: mpsc::Sender<StopRequest>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ManagerConfig,
    registry: Arc<TaskRegistry>,
    cache: Arc<ResultCache>,
    launcher: ProcessLauncher,
    monitor: MemoryMonitor,
    slots: Arc<Semaphore>,
    accepting: AtomicBool,
    supervisors: Mutex<HashMap<TaskId, Supervision>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Arma el gestor. Debe llamarse dentro de un runtime de tokio.
    pub fn start(config: ManagerConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.spool_dir)?;

        let registry = Arc::new(TaskRegistry::new());
        let cache = Arc::new(ResultCache::new(config.cache_max_bytes));
        let launcher = ProcessLauncher::new(
            config.worker_program.clone(),
            config.worker_args.clone(),
            config.cancel_grace,
        );
        let monitor = MemoryMonitor::new(config.memory_interval);

        let sweeper = config.task_ttl.map(|ttl| {
            tokio::spawn(sweeper::run_ttl_sweeper(
                registry.clone(),
                ttl,
                config.sweep_interval,
            ))
        });

        info!(
            "gestor de tareas listo (max_concurrency={}, worker={}, spool={})",
            config.max_concurrency,
            config.worker_program.display(),
            config.spool_dir.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrency)),
                config,
                registry,
                cache,
                launcher,
                monitor,
                accepting: AtomicBool::new(true),
                supervisors: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(sweeper),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Valida el payload, crea la tarea en QUEUED y lanza su worker.
    /// Vuelve apenas el proceso arrancó, sin esperar al job.
    pub async fn submit(&self, kind: JobKind, payload: Value) -> Result<TaskId, TaskError> {
        let inner = &self.inner;

        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }

        let job = JobPayload::parse(kind, payload)?;

        let slot = inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| TaskError::ResourceExhausted {
                limit: inner.config.max_concurrency,
            })?;

        let id = new_task_id();
        inner
            .registry
            .insert(TaskInfo::queued(id.clone(), kind), Some(slot));

        let assignment = WorkerAssignment {
            task_id: id.clone(),
            artifact_path: inner.artifact_path(&id),
            job,
        };

        let process = match inner.launcher.launch(&assignment).await {
            Ok(p) => p,
            Err(e) => {
                warn!("no se pudo lanzar el worker de {}: {}", id, e);
                inner.registry.remove(&id);
                inner.registry.release_slot(&id);
                return Err(TaskError::Launch(e.to_string()));
            }
        };

        let (stop_tx, stop_rx) = mpsc::channel(4);
        {
            let mut supervisors = inner.lock_supervisors();
            let handle = tokio::spawn(supervise_task(inner.clone(), id.clone(), process, stop_rx));
            supervisors.insert(
                id.clone(),
                Supervision {
                    stop: stop_tx,
                    handle,
                },
            );
        }

        info!("tarea {} ({}) aceptada", id, kind);

        inner.settle_after_launch(&id).await;

        Ok(id)
    }

    pub fn status(&self, id: &str) -> Result<TaskInfo, TaskError> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        self.inner.registry.list()
    }

    /// Artefacto de una tarea completada.
    pub fn result(&self, id: &str) -> Result<Arc<Table>, TaskError> {
        let info = self.status(id)?;

        match info.status {
            TaskStatus::Queued | TaskStatus::Running => Err(TaskError::NotReady {
                id: info.id,
                status: info.status,
            }),
            TaskStatus::Canceled => Err(TaskError::Canceled(info.id)),
            TaskStatus::Failed => Err(info
                .error
                .map(TaskError::from)
                .unwrap_or_else(|| TaskError::Application("falla sin detalle".to_string()))),
            TaskStatus::Completed => self
                .inner
                .cache
                .get(id)
                .map_err(|_| TaskError::NotFound(id.to_string())),
        }
    }

    /// Muestras de memoria registradas; vacío si nunca corrió o ya no existe.
    pub fn memory_usage(&self, id: &str) -> Vec<MemorySample> {
        self.inner.registry.memory(id)
    }

    /// Pide la terminación (cooperativa y luego forzada). Vuelve cuando la
    /// señal salió, no cuando el proceso terminó. Sobre tareas ya
    /// terminadas no hace nada.
    pub async fn cancel(&self, id: &str) -> Result<CancelAck, TaskError> {
        let outcome = self
            .inner
            .registry
            .cancel(id)
            .map_err(|_| TaskError::NotFound(id.to_string()))?;

        if let CancelOutcome::Canceled { from } = outcome {
            info!("tarea {} cancelada (estaba en {})", id, from);
            self.inner.signal_stop(id, StopMode::Graceful).await;
        }

        let status = self
            .inner
            .registry
            .get(id)
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Canceled);

        Ok(CancelAck {
            id: id.to_string(),
            status,
        })
    }

    /// Borra la tarea (cancelándola si sigue activa) y su artefacto.
    pub async fn delete(&self, id: &str) -> Result<(), TaskError> {
        let info = self.status(id)?;

        if !info.status.is_terminal() {
            self.cancel(id).await?;
        }

        self.inner.registry.remove(id);
        self.inner.cache.evict(id);
        info!("tarea {} borrada", id);
        Ok(())
    }

    /// El cliente confirma que ya leyó el resultado; se libera del cache.
    pub fn acknowledge(&self, id: &str) -> Result<(), TaskError> {
        match self.inner.cache.acknowledge(id) {
            Ok(()) => {
                debug!("resultado de {} confirmado por el cliente", id);
                Ok(())
            }
            Err(CacheError::NotFetched(_)) => Err(TaskError::NotReady {
                id: id.to_string(),
                status: self.status(id).map(|t| t.status).unwrap_or(TaskStatus::Completed),
            }),
            Err(_) => Err(TaskError::NotFound(id.to_string())),
        }
    }

    /// Deja de aceptar tareas, cancela todo lo activo y espera a que salgan
    /// los workers hasta `shutdown_timeout`. Los que no salen a tiempo se
    /// matan.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;

        if inner.accepting.swap(false, Ordering::SeqCst) {
            info!("apagando gestor de tareas");
        }

        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let mut report = ShutdownReport::default();

        for id in inner.registry.active_ids() {
            if let Ok(CancelOutcome::Canceled { .. }) = inner.registry.cancel(&id) {
                report.canceled += 1;
            }
        }

        // también las ya canceladas cuyo proceso sigue vivo
        let pending: Vec<(TaskId, Supervision)> = inner.lock_supervisors().drain().collect();
        for (id, sup) in &pending {
            let (ack_tx, ack_rx) = oneshot::channel();
            let req = StopRequest {
                mode: StopMode::Graceful,
                ack: Some(ack_tx),
            };
            if sup.stop.send(req).await.is_ok() {
                let _ = ack_rx.await;
            }
            debug!("señal de fin enviada al worker de {}", id);
        }

        let deadline = Instant::now() + inner.config.shutdown_timeout;
        let mut stragglers = Vec::new();
        for (id, mut sup) in pending {
            if timeout_at(deadline, &mut sup.handle).await.is_err() {
                stragglers.push((id, sup));
            }
        }

        if stragglers.is_empty() {
            info!("gestor apagado: {} tareas canceladas", report.canceled);
            return report;
        }

        report.forced = stragglers.len();
        for (id, sup) in &stragglers {
            warn!("el worker de {} no salió en {:?}, forzando", id, inner.config.shutdown_timeout);
            let _ = sup.stop.try_send(StopRequest {
                mode: StopMode::Force,
                ack: None,
            });
        }

        let deadline = Instant::now() + FORCE_WAIT;
        for (id, mut sup) in stragglers {
            if timeout_at(deadline, &mut sup.handle).await.is_err() {
                // al soltar el Child se mata el proceso (kill_on_drop)
                warn!("abortando supervisor de {}", id);
                sup.handle.abort();
                let _ = sup.handle.await;
            }
        }

        info!(
            "gestor apagado: {} tareas canceladas, {} workers forzados",
            report.canceled, report.forced
        );
        report
    }
}

impl Inner {
    fn lock_supervisors(&self) -> MutexGuard<'_, HashMap<TaskId, Supervision>> {
        self.supervisors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn artifact_path(&self, id: &str) -> String {
        self.config
            .spool_dir
            .join(format!("{id}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    /// Pudo cancelarse o empezar el apagado mientras lanzábamos. El apagado
    /// ya pudo marcarla cancelada sin ver a su supervisor, así que la señal
    /// se manda igual.
    async fn settle_after_launch(&self, id: &str) {
        let shutting_down = !self.accepting.load(Ordering::SeqCst);
        if shutting_down {
            if let Ok(CancelOutcome::Canceled { from }) = self.registry.cancel(id) {
                info!("tarea {} cancelada por el apagado (estaba en {})", id, from);
            }
        }

        let unwanted = shutting_down
            || self
                .registry
                .get(id)
                .map_or(true, |t| t.status.is_terminal());
        if unwanted {
            self.signal_stop(id, StopMode::Graceful).await;
        }
    }

    /// Envía un pedido de fin al supervisor y espera a que la señal salga.
    async fn signal_stop(&self, id: &str, mode: StopMode) -> bool {
        let stop = self.lock_supervisors().get(id).map(|s| s.stop.clone());
        let Some(stop) = stop else {
            return false;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let req = StopRequest {
            mode,
            ack: Some(ack_tx),
        };
        if stop.send(req).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }

    /// Registra el resultado final del worker. Si la tarea ya quedó en un
    /// estado terminal (p.ej. cancelada), el resultado se descarta.
    async fn finalize(&self, id: &str, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Succeeded {
                artifact_path,
                rows,
                bytes,
            } => {
                // si salió sin reportar `started`, igual arrancó
                let _ = self.registry.mark_running(id);

                let expected = self.artifact_path(id);
                if artifact_path != expected {
                    warn!(
                        "el worker de {} reportó el artefacto en {}, se usa {}",
                        id, artifact_path, expected
                    );
                }

                let path = expected.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    let table = Table::read_jsonl(&path)?;
                    let size = std::fs::metadata(&path)?.len();
                    Ok::<_, io::Error>((table, size))
                })
                .await;

                match loaded {
                    Ok(Ok((table, size))) => {
                        if table.len() != rows || size != bytes {
                            debug!(
                                "artefacto de {}: reportado {} filas/{} bytes, leído {}/{}",
                                id,
                                rows,
                                bytes,
                                table.len(),
                                size
                            );
                        }
                        self.commit_result(id, table, size);
                    }
                    Ok(Err(e)) => self.record_failure(
                        id,
                        TaskFailure::Application(format!("artefacto ilegible: {e}")),
                    ),
                    Err(e) => self.record_failure(
                        id,
                        TaskFailure::WorkerCrashed(format!("carga del artefacto abortada: {e}")),
                    ),
                }

                remove_spool_file(&expected);
            }
            WorkerOutcome::Failed(error) => {
                let _ = self.registry.mark_running(id);
                self.record_failure(id, TaskFailure::Application(error));
            }
            WorkerOutcome::Crashed(detail) => {
                let _ = self.registry.mark_running(id);
                self.record_failure(id, TaskFailure::WorkerCrashed(detail));
            }
            WorkerOutcome::Stopped { forced } => {
                info!("worker de {} detenido (forzado={})", id, forced);
                let _ = self.registry.cancel(id);
                remove_spool_file(&self.artifact_path(id));
            }
        }
    }

    /// Guarda en cache y pasa a COMPLETED. Si la transición pierde contra
    /// una cancelación, el artefacto se expulsa.
    fn commit_result(&self, id: &str, table: Table, bytes: u64) {
        let result_ref = match self.cache.put(id, table, bytes) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(id, TaskFailure::Application(e.to_string()));
                return;
            }
        };

        let rows = result_ref.rows;
        match self.registry.complete(id, result_ref) {
            Ok(_) => info!("tarea {} completada ({} filas, {} bytes)", id, rows, bytes),
            Err(e) => {
                self.cache.evict(id);
                debug!("resultado de {} descartado: {}", id, e);
            }
        }
    }

    fn record_failure(&self, id: &str, failure: TaskFailure) {
        match self.registry.fail(id, failure.clone()) {
            Ok(_) => warn!("tarea {} falló: {}", id, failure),
            Err(e) => debug!("falla de {} descartada ({}): {}", id, e, failure),
        }
    }
}

/// Vida completa del supervisor de una tarea: reenvía los mensajes del
/// worker al registro, arranca el monitor de memoria y registra el final.
async fn supervise_task(
    inner: Arc<Inner>,
    id: TaskId,
    process: WorkerProcess,
    stop: mpsc::Receiver<StopRequest>,
) {
    let pid = process.pid;
    let registry = inner.registry.clone();
    let mut monitor: Option<JoinHandle<()>> = None;

    let outcome = inner
        .launcher
        .supervise(process, stop, |msg| match msg {
            WorkerMessage::Started => {
                if registry.mark_running(&id).is_ok() {
                    info!("tarea {} corriendo (pid={})", id, pid);
                    monitor = Some(inner.monitor.spawn(id.clone(), pid, registry.clone()));
                }
            }
            WorkerMessage::Progress { fraction, message } => {
                registry.set_progress(&id, *fraction, message.clone());
            }
            WorkerMessage::Completed { .. } | WorkerMessage::Failed { .. } => {}
        })
        .await;

    if let Some(monitor) = monitor {
        monitor.abort();
    }

    inner.finalize(&id, outcome).await;
    registry.release_slot(&id);
    inner.lock_supervisors().remove(&id);
}

fn remove_spool_file(path: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("no se pudo borrar {}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    /// Worker de mentira: espera el archivo `<artefacto>.go` y después
    /// escribe dos filas.
    const GATED_WORKER: &str = r#"read -r _
echo '{"type":"started"}'
while [ ! -f "$FLOW_ARTIFACT_PATH.go" ]; do sleep 0.02; done
printf '{"a":1}\n{"a":2}\n' > "$FLOW_ARTIFACT_PATH"
echo '{"type":"completed","artifact_path":"'"$FLOW_ARTIFACT_PATH"'","rows":2,"bytes":16}'"#;

    const QUICK_WORKER: &str = r#"read -r _
echo '{"type":"started"}'
echo '{"type":"progress","fraction":0.5,"message":"a mitad"}'
printf '{"a":1}\n{"a":2}\n' > "$FLOW_ARTIFACT_PATH"
echo '{"type":"completed","artifact_path":"'"$FLOW_ARTIFACT_PATH"'","rows":2,"bytes":16}'"#;

    fn config(name: &str, script: &str, max_concurrency: usize) -> ManagerConfig {
        let spool = std::env::temp_dir()
            .join("manager_tests")
            .join(format!("{name}-{}", new_task_id()));

        ManagerConfig {
            max_concurrency,
            worker_program: PathBuf::from("sh"),
            worker_args: vec!["-c".to_string(), script.to_string()],
            spool_dir: spool,
            cancel_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            memory_interval: Duration::from_millis(20),
            ..ManagerConfig::default()
        }
    }

    fn execute_payload() -> Value {
        json!({"steps": [{"op": "limit", "n": 1}]})
    }

    async fn wait_terminal(mgr: &TaskManager, id: &str) -> TaskInfo {
        for _ in 0..500 {
            let info = mgr.status(id).unwrap();
            if info.status.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("la tarea {id} no terminó a tiempo");
    }

    fn open_gate(mgr: &TaskManager, id: &str) {
        let gate = format!("{}.go", mgr.inner.artifact_path(id));
        std::fs::write(gate, b"").unwrap();
    }

    #[tokio::test]
    async fn payload_invalido_no_crea_tarea() {
        let mgr = TaskManager::start(config("invalid", QUICK_WORKER, 2)).unwrap();

        let err = mgr
            .submit(JobKind::FuzzyJoin, json!({"steps": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload(_)));
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn tarea_completa_y_resultado_estable_hasta_expulsion() {
        let mgr = TaskManager::start(config("complete", QUICK_WORKER, 2)).unwrap();

        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();
        let info = wait_terminal(&mgr, &id).await;

        assert_eq!(info.status, TaskStatus::Completed);
        assert!(info.started_at.is_some() && info.ended_at.is_some());
        assert_eq!(info.result_ref.as_ref().map(|r| r.rows), Some(2));
        assert_eq!(info.progress, 1.0);

        let first = mgr.result(&id).unwrap();
        let second = mgr.result(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        // el archivo del spool ya no hace falta
        assert!(!std::path::Path::new(&mgr.inner.artifact_path(&id)).exists());

        mgr.acknowledge(&id).unwrap();
        assert_eq!(mgr.result(&id), Err(TaskError::NotFound(id.clone())));
        // el registro sigue existiendo
        assert_eq!(mgr.status(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn limite_de_concurrencia_falla_rapido_y_se_libera_al_completar() {
        let mgr = TaskManager::start(config("limit", GATED_WORKER, 2)).unwrap();

        let a = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();
        let b = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        let err = mgr
            .submit(JobKind::Execute, execute_payload())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::ResourceExhausted { limit: 2 });

        assert!(matches!(mgr.result(&a), Err(TaskError::NotReady { .. })));

        open_gate(&mgr, &a);
        assert_eq!(wait_terminal(&mgr, &a).await.status, TaskStatus::Completed);

        let c = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        open_gate(&mgr, &b);
        open_gate(&mgr, &c);
        assert_eq!(wait_terminal(&mgr, &b).await.status, TaskStatus::Completed);
        assert_eq!(wait_terminal(&mgr, &c).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancelar_es_idempotente() {
        let mgr = TaskManager::start(config("cancel", GATED_WORKER, 2)).unwrap();

        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        let first = mgr.cancel(&id).await.unwrap();
        let second = mgr.cancel(&id).await.unwrap();
        assert_eq!(first.status, TaskStatus::Canceled);
        assert_eq!(first, second);

        // aunque el worker llegue a producir algo, sigue cancelada
        open_gate(&mgr, &id);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let info = mgr.status(&id).unwrap();
        assert_eq!(info.status, TaskStatus::Canceled);
        assert!(info.error.is_none() && info.result_ref.is_none());
        assert_eq!(mgr.result(&id), Err(TaskError::Canceled(id.clone())));

        assert_eq!(
            mgr.cancel("desconocida").await,
            Err(TaskError::NotFound("desconocida".into()))
        );
    }

    #[tokio::test]
    async fn caida_del_worker_queda_como_worker_crashed() {
        let script = r#"read -r _; echo '{"type":"started"}'; kill -9 $$"#;
        let mgr = TaskManager::start(config("crash", script, 2)).unwrap();

        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();
        let info = wait_terminal(&mgr, &id).await;

        assert_eq!(info.status, TaskStatus::Failed);
        assert!(matches!(info.error, Some(TaskFailure::WorkerCrashed(_))));
        assert!(matches!(mgr.result(&id), Err(TaskError::WorkerCrashed(_))));
    }

    #[tokio::test]
    async fn error_de_aplicacion_se_propaga_en_result() {
        let script = r#"read -r _; echo '{"type":"failed","error":"sin columna x"}'; exit 1"#;
        let mgr = TaskManager::start(config("apperr", script, 2)).unwrap();

        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();
        let info = wait_terminal(&mgr, &id).await;

        // nunca reportó started: igual pasa por running
        assert!(info.started_at.is_some());
        assert_eq!(
            mgr.result(&id),
            Err(TaskError::Application("sin columna x".into()))
        );
    }

    #[tokio::test]
    async fn worker_inexistente_devuelve_launch_y_libera_cupo() {
        let mut cfg = config("launch", QUICK_WORKER, 1);
        cfg.worker_program = PathBuf::from("/no/existe/worker");
        let mgr = TaskManager::start(cfg).unwrap();

        for _ in 0..2 {
            let err = mgr
                .submit(JobKind::Execute, execute_payload())
                .await
                .unwrap_err();
            assert!(matches!(err, TaskError::Launch(_)));
        }
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn memoria_se_muestrea_mientras_corre() {
        let mgr = TaskManager::start(config("memory", GATED_WORKER, 1)).unwrap();
        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        open_gate(&mgr, &id);
        wait_terminal(&mgr, &id).await;

        let samples = mgr.memory_usage(&id);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.bytes > 0));
        assert!(mgr.memory_usage("desconocida").is_empty());
    }

    #[tokio::test]
    async fn delete_cancela_y_borra() {
        let mgr = TaskManager::start(config("delete", GATED_WORKER, 1)).unwrap();
        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        mgr.delete(&id).await.unwrap();
        assert_eq!(mgr.status(&id), Err(TaskError::NotFound(id.clone())));
        assert_eq!(mgr.delete(&id).await, Err(TaskError::NotFound(id.clone())));
    }

    #[tokio::test]
    async fn shutdown_cancela_todo_y_no_acepta_mas() {
        let mgr = TaskManager::start(config("shutdown", GATED_WORKER, 4)).unwrap();

        let a = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();
        let b = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        let report = mgr.shutdown().await;
        assert_eq!(report.canceled, 2);
        assert_eq!(report.forced, 0);

        for id in [&a, &b] {
            assert_eq!(mgr.status(id).unwrap().status, TaskStatus::Canceled);
        }
        assert!(mgr.inner.lock_supervisors().is_empty());

        assert_eq!(
            mgr.submit(JobKind::Execute, execute_payload()).await,
            Err(TaskError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn apagado_durante_el_lanzamiento_igual_detiene_al_worker() {
        let mgr = TaskManager::start(config("carrera", GATED_WORKER, 1)).unwrap();

        let id = mgr.submit(JobKind::Execute, execute_payload()).await.unwrap();

        // lo que deja un apagado que corrió entre el insert y el registro del
        // supervisor: la tarea quedó cancelada pero nadie avisó al worker
        mgr.inner.accepting.store(false, Ordering::SeqCst);
        assert!(matches!(
            mgr.inner.registry.cancel(&id),
            Ok(CancelOutcome::Canceled { .. })
        ));

        mgr.inner.settle_after_launch(&id).await;

        let mut gone = false;
        for _ in 0..250 {
            if !mgr.inner.lock_supervisors().contains_key(&id) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "el worker de {id} siguió corriendo");
        assert_eq!(mgr.status(&id).unwrap().status, TaskStatus::Canceled);
        assert_eq!(mgr.inner.slots.available_permits(), 1);
    }
}
