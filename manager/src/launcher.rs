//! Lanzamiento y supervisión de procesos worker, uno por tarea.
//!
//! El worker recibe su `WorkerAssignment` por stdin y reporta por stdout,
//! un `WorkerMessage` JSON por línea. Una caída del proceso (señal, código
//! inesperado, salida sin reporte) se distingue de un error reportado por el
//! propio job.

use common::{
    protocol::{ENV_ARTIFACT_PATH, ENV_TASK_ID},
    TaskId, WorkerAssignment, WorkerMessage,
};
use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{mpsc, oneshot},
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

/// Cuánto esperamos a que se vacíe el stdout de un worker que ya salió.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    /// SIGTERM y, pasado el plazo de gracia, SIGKILL
    Graceful,
    /// SIGKILL directo
    Force,
}

/// Pedido de terminación. `ack` se responde apenas se envió la señal.
pub struct StopRequest {
    pub mode: StopMode,
    pub ack: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Succeeded {
        artifact_path: String,
        rows: usize,
        bytes: u64,
    },
    /// El job reportó un error
    Failed(String),
    /// El proceso terminó de forma anormal
    Crashed(String),
    /// Terminó porque se pidió detenerlo
    Stopped { forced: bool },
}

pub struct WorkerProcess {
    pub task_id: TaskId,
    pub pid: u32,
    child: Child,
    messages: mpsc::Receiver<WorkerMessage>,
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<String>, grace: Duration) -> Self {
        Self {
            program,
            args,
            grace,
        }
    }

    /// Lanza el worker y le entrega su asignación por stdin.
    pub async fn launch(&self, assignment: &WorkerAssignment) -> io::Result<WorkerProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_TASK_ID, &assignment.task_id)
            .env(ENV_ARTIFACT_PATH, &assignment.artifact_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // grupo propio: un Ctrl+C a la terminal del manager no llega al worker
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "el worker salió antes de tener pid"))?;

        let missing = |what: &str| io::Error::new(io::ErrorKind::Other, format!("worker sin {what}"));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let mut body = serde_json::to_vec(assignment)?;
        body.push(b'\n');

        let task_id = assignment.task_id.clone();

        // la escritura va aparte para no frenar a quien lanza si el payload es grande
        let writer_task = task_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                warn!("no se pudo enviar la asignación al worker de {}: {}", writer_task, e);
            }
            // al soltar stdin el worker ve EOF
        });

        let (tx, messages) = mpsc::channel(64);
        tokio::spawn(relay_stdout(task_id.clone(), stdout, tx));
        tokio::spawn(relay_stderr(task_id.clone(), stderr));

        info!("worker lanzado para tarea {} (pid={})", task_id, pid);

        Ok(WorkerProcess {
            task_id,
            pid,
            child,
            messages,
        })
    }

    /// Supervisa el proceso hasta que sale. Cada mensaje se pasa a
    /// `on_message` en el orden en que el worker lo escribió.
    pub async fn supervise<F>(
        &self,
        process: WorkerProcess,
        mut stop: mpsc::Receiver<StopRequest>,
        mut on_message: F,
    ) -> WorkerOutcome
    where
        F: FnMut(&WorkerMessage),
    {
        let WorkerProcess {
            task_id,
            pid,
            mut child,
            mut messages,
        } = process;

        let mut terminal: Option<WorkerMessage> = None;
        let mut stop_mode: Option<StopMode> = None;
        let mut kill_deadline: Option<Instant> = None;
        let mut forced = false;
        let mut messages_open = true;
        let mut stop_open = true;

        let status = loop {
            tokio::select! {
                res = child.wait() => break res,

                msg = messages.recv(), if messages_open => match msg {
                    Some(msg) => observe(&task_id, msg, &mut terminal, &mut on_message),
                    None => messages_open = false,
                },

                req = stop.recv(), if stop_open => match req {
                    Some(req) => {
                        match req.mode {
                            StopMode::Force => {
                                warn!("forzando fin del worker de {} (pid={})", task_id, pid);
                                let _ = child.start_kill();
                                forced = true;
                                kill_deadline = None;
                            }
                            StopMode::Graceful if stop_mode.is_none() => {
                                info!("pidiendo al worker de {} que termine (pid={})", task_id, pid);
                                match send_terminate(pid) {
                                    Ok(()) => kill_deadline = Some(Instant::now() + self.grace),
                                    Err(e) => {
                                        warn!("SIGTERM falló para pid {}: {}, usando SIGKILL", pid, e);
                                        let _ = child.start_kill();
                                        forced = true;
                                    }
                                }
                            }
                            StopMode::Graceful => {}
                        }
                        stop_mode = stop_mode.max(Some(req.mode));
                        if let Some(ack) = req.ack {
                            let _ = ack.send(());
                        }
                    }
                    None => stop_open = false,
                },

                _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                    warn!(
                        "el worker de {} no terminó en {:?}, enviando SIGKILL",
                        task_id, self.grace
                    );
                    let _ = child.start_kill();
                    forced = true;
                    kill_deadline = None;
                }
            }
        };

        // lo que quedó en el pipe después de la salida
        if messages_open {
            let drained = timeout(DRAIN_TIMEOUT, async {
                while let Some(msg) = messages.recv().await {
                    observe(&task_id, msg, &mut terminal, &mut on_message);
                }
            })
            .await;
            if drained.is_err() {
                warn!("stdout del worker de {} sigue abierto tras su salida", task_id);
            }
        }

        if stop_mode.is_some() {
            return WorkerOutcome::Stopped { forced };
        }

        let status = match status {
            Ok(s) => s,
            Err(e) => return WorkerOutcome::Crashed(format!("no se pudo esperar al worker: {e}")),
        };

        classify(status, terminal)
    }
}

fn observe<F>(task_id: &str, msg: WorkerMessage, terminal: &mut Option<WorkerMessage>, on_message: &mut F)
where
    F: FnMut(&WorkerMessage),
{
    if msg.is_terminal() {
        if terminal.is_some() {
            warn!("el worker de {} reportó más de un resultado, se ignora: {:?}", task_id, msg);
            return;
        }
        *terminal = Some(msg.clone());
    }
    on_message(&msg);
}

/// Decide el resultado a partir del código de salida y del último reporte.
fn classify(status: ExitStatus, terminal: Option<WorkerMessage>) -> WorkerOutcome {
    match (terminal, status.code()) {
        (
            Some(WorkerMessage::Completed {
                artifact_path,
                rows,
                bytes,
            }),
            Some(0),
        ) => WorkerOutcome::Succeeded {
            artifact_path,
            rows,
            bytes,
        },
        (Some(WorkerMessage::Failed { error }), Some(_)) => WorkerOutcome::Failed(error),
        (reported, _) => WorkerOutcome::Crashed(describe_exit(status, reported.is_some())),
    }
}

fn describe_exit(status: ExitStatus, reported: bool) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("terminado por la señal {sig}");
        }
    }

    match (status.code(), reported) {
        (Some(0), false) => "salió sin reportar resultado".to_string(),
        (Some(code), false) => format!("salió con código {code} sin reportar resultado"),
        (Some(code), true) => format!("salió con código {code} tras reportar éxito"),
        (None, _) => "terminó sin código de salida".to_string(),
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid fuera de rango"))?;

    // SAFETY: kill(2) sólo envía una señal; el pid es de un hijo todavía no
    // esperado, así que no puede haber sido reciclado.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "terminación cooperativa no disponible en esta plataforma",
    ))
}

async fn relay_stdout(task_id: TaskId, stdout: ChildStdout, tx: mpsc::Sender<WorkerMessage>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match WorkerMessage::from_line(&line) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("línea inválida del worker de {}: {:?} ({})", task_id, line, e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error leyendo stdout del worker de {}: {}", task_id, e);
                break;
            }
        }
    }
}

async fn relay_stderr(task_id: TaskId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[worker {}] {}", task_id, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ExecutePayload, JobPayload, Step};

    fn assignment(task_id: &str) -> WorkerAssignment {
        WorkerAssignment {
            task_id: task_id.to_string(),
            artifact_path: format!("/tmp/{task_id}.jsonl"),
            job: JobPayload::Execute(ExecutePayload {
                steps: vec![Step::Limit { n: 1 }],
            }),
        }
    }

    fn sh(script: &str, grace: Duration) -> ProcessLauncher {
        ProcessLauncher::new(
            PathBuf::from("sh"),
            vec!["-c".to_string(), script.to_string()],
            grace,
        )
    }

    async fn run(launcher: &ProcessLauncher, id: &str) -> (WorkerOutcome, Vec<WorkerMessage>) {
        let process = launcher.launch(&assignment(id)).await.unwrap();
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let mut seen = Vec::new();
        let outcome = launcher
            .supervise(process, stop_rx, |m| seen.push(m.clone()))
            .await;
        (outcome, seen)
    }

    #[tokio::test]
    async fn exito_reportado_y_salida_cero() {
        let launcher = sh(
            r#"read -r _
echo '{"type":"started"}'
echo '{"type":"progress","fraction":0.5}'
echo '{"type":"completed","artifact_path":"'"$FLOW_ARTIFACT_PATH"'","rows":1,"bytes":8}'"#,
            Duration::from_secs(1),
        );

        let (outcome, seen) = run(&launcher, "ok1").await;

        assert_eq!(
            outcome,
            WorkerOutcome::Succeeded {
                artifact_path: "/tmp/ok1.jsonl".into(),
                rows: 1,
                bytes: 8,
            }
        );
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], WorkerMessage::Started);
    }

    #[tokio::test]
    async fn error_de_aplicacion_no_es_caida() {
        let launcher = sh(
            r#"echo '{"type":"started"}'; echo '{"type":"failed","error":"columna inexistente"}'; exit 1"#,
            Duration::from_secs(1),
        );

        let (outcome, _) = run(&launcher, "app1").await;
        assert_eq!(outcome, WorkerOutcome::Failed("columna inexistente".into()));
    }

    #[tokio::test]
    async fn muerte_por_senal_es_caida() {
        let launcher = sh(
            r#"echo '{"type":"started"}'; kill -9 $$"#,
            Duration::from_secs(1),
        );

        let (outcome, _) = run(&launcher, "crash1").await;
        match outcome {
            WorkerOutcome::Crashed(detail) => assert!(detail.contains('9'), "{detail}"),
            other => panic!("se esperaba caída, vino {other:?}"),
        }
    }

    #[tokio::test]
    async fn salida_sin_reporte_es_caida() {
        let launcher = sh("echo 'esto no es json'; exit 0", Duration::from_secs(1));

        let (outcome, seen) = run(&launcher, "mudo").await;
        assert!(seen.is_empty());
        assert_eq!(
            outcome,
            WorkerOutcome::Crashed("salió sin reportar resultado".into())
        );
    }

    #[tokio::test]
    async fn stop_cooperativo_usa_sigterm() {
        let launcher = sh(
            r#"trap 'exit 3' TERM
echo '{"type":"started"}'
while true; do sleep 0.05; done"#,
            Duration::from_secs(5),
        );

        let process = launcher.launch(&assignment("coop")).await.unwrap();
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let started = std::time::Instant::now();
        let supervise = tokio::spawn({
            let launcher = launcher.clone();
            async move { launcher.supervise(process, stop_rx, |_| {}).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (ack_tx, ack_rx) = oneshot::channel();
        stop_tx
            .send(StopRequest {
                mode: StopMode::Graceful,
                ack: Some(ack_tx),
            })
            .await
            .unwrap();
        ack_rx.await.unwrap();

        let outcome = supervise.await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Stopped { forced: false });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn stop_escala_a_sigkill_tras_la_gracia() {
        // ignora SIGTERM: sólo lo frena el SIGKILL
        let launcher = sh(
            r#"trap '' TERM
echo '{"type":"started"}'
while true; do sleep 0.05; done"#,
            Duration::from_millis(300),
        );

        let process = launcher.launch(&assignment("terco")).await.unwrap();
        let (stop_tx, stop_rx) = mpsc::channel(1);

        // damos tiempo a que el trap quede instalado
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = stop_tx
                .send(StopRequest {
                    mode: StopMode::Graceful,
                    ack: None,
                })
                .await;
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            launcher.supervise(process, stop_rx, |_| {}),
        )
        .await
        .expect("el supervisor debería terminar tras el SIGKILL");

        assert_eq!(outcome, WorkerOutcome::Stopped { forced: true });
    }

    #[tokio::test]
    async fn panico_del_worker_es_caida_aunque_haya_reportado_started() {
        // 101 es lo que usa el worker cuando el job entra en pánico
        let launcher = sh(
            r#"echo '{"type":"started"}'; exit 101"#,
            Duration::from_secs(1),
        );

        let (outcome, seen) = run(&launcher, "panico").await;
        assert_eq!(seen, vec![WorkerMessage::Started]);
        assert!(matches!(outcome, WorkerOutcome::Crashed(_)), "{outcome:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_corre_en_su_propio_grupo_de_procesos() {
        let launcher = sh("read -r _; sleep 5", Duration::from_millis(200));

        let process = launcher.launch(&assignment("grupo")).await.unwrap();
        let pid = process.pid as libc::pid_t;

        let worker_pgid = unsafe { libc::getpgid(pid) };
        let own_pgid = unsafe { libc::getpgid(0) };
        assert!(worker_pgid > 0);
        assert_eq!(worker_pgid, pid);
        assert_ne!(worker_pgid, own_pgid);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        stop_tx
            .send(StopRequest {
                mode: StopMode::Force,
                ack: None,
            })
            .await
            .unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            launcher.supervise(process, stop_rx, |_| {}),
        )
        .await
        .expect("el supervisor debería terminar tras el SIGKILL");
        assert!(matches!(outcome, WorkerOutcome::Stopped { .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn launch_falla_si_el_ejecutable_no_existe() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/no/existe/worker"),
            Vec::new(),
            Duration::from_secs(1),
        );
        assert!(launcher.launch(&assignment("x")).await.is_err());
    }
}
