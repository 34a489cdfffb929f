use chrono::Utc;
use common::{MemorySample, TaskId};
use std::{sync::Arc, time::Duration};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use crate::registry::TaskRegistry;

/// Lectura de memoria residente de un proceso.
pub trait MemoryProbe: Send + 'static {
    /// `None` si el proceso ya no existe o no se pudo leer.
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

/// Implementación sobre sysinfo.
pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(pid) {
            return None;
        }
        // memory() ya viene en bytes
        self.sys.process(pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryMonitor {
    interval: Duration,
}

impl MemoryMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn spawn(&self, task_id: TaskId, pid: u32, registry: Arc<TaskRegistry>) -> JoinHandle<()> {
        self.spawn_with(task_id, pid, registry, SysinfoProbe::new())
    }

    /// Muestrea a intervalo fijo mientras la tarea esté en RUNNING. Frena
    /// en cuanto el registro rechaza una muestra.
    pub fn spawn_with<P: MemoryProbe>(
        &self,
        task_id: TaskId,
        pid: u32,
        registry: Arc<TaskRegistry>,
        probe: P,
    ) -> JoinHandle<()> {
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut probe = Some(probe);

            loop {
                ticker.tick().await;

                let Some(mut p) = probe.take() else {
                    break;
                };

                // la lectura puede tocar /proc: fuera del runtime
                let read = tokio::task::spawn_blocking(move || {
                    let bytes = p.resident_bytes(pid);
                    (p, bytes)
                })
                .await;

                let bytes = match read {
                    Ok((p, bytes)) => {
                        probe = Some(p);
                        bytes
                    }
                    Err(e) => {
                        debug!("lectura de memoria de {} abortada: {}", task_id, e);
                        break;
                    }
                };

                let Some(bytes) = bytes else {
                    // el proceso ya no está; el supervisor se encarga del resto
                    continue;
                };

                let sample = MemorySample {
                    at: Utc::now(),
                    bytes,
                };
                if !registry.record_memory(&task_id, sample) {
                    debug!("monitor de memoria de {} detenido", task_id);
                    break;
                }
            }
        })
    }
}
