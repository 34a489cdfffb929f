//! Registro en memoria de tareas: única fuente de verdad sobre qué corre y
//! qué pasó. Todas las mutaciones de una tarea pasan por el mismo lock, así
//! que "chequear estado + instalar resultado + cambiar estado" es atómico.

use chrono::{DateTime, Utc};
use common::{MemorySample, ResultRef, TaskFailure, TaskId, TaskInfo, TaskStatus};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("tarea {0} no encontrada")]
    NotFound(TaskId),

    #[error("transición inválida {from} -> {to}")]
    Illegal { from: TaskStatus, to: TaskStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// La tarea pasó a CANCELED desde `from`
    Canceled { from: TaskStatus },
    /// Ya estaba terminada; no se tocó
    AlreadyTerminal(TaskStatus),
}

struct TaskRecord {
    info: TaskInfo,
    memory: Vec<MemorySample>,
}

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, TaskRecord>,
    // cupos de concurrencia; viven aparte para sobrevivir al borrado del registro
    slots: HashMap<TaskId, OwnedSemaphorePermit>,
}

#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<Tables>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Da de alta una tarea nueva junto con su cupo de concurrencia.
    pub fn insert(&self, info: TaskInfo, slot: Option<OwnedSemaphorePermit>) {
        let mut tables = self.lock();
        if let Some(slot) = slot {
            tables.slots.insert(info.id.clone(), slot);
        }
        tables.tasks.insert(
            info.id.clone(),
            TaskRecord {
                info,
                memory: Vec::new(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<TaskInfo> {
        self.lock().tasks.get(id).map(|r| r.info.clone())
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let mut out: Vec<TaskInfo> = self.lock().tasks.values().map(|r| r.info.clone()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Aplica una transición del ciclo de vida. `apply` corre bajo el mismo
    /// lock, sólo si la transición es válida. Devuelve el estado anterior.
    pub fn transition<F>(&self, id: &str, next: TaskStatus, apply: F) -> Result<TaskStatus, TransitionError>
    where
        F: FnOnce(&mut TaskInfo),
    {
        let mut tables = self.lock();

        let record = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;

        let from = record.info.status;
        if !from.can_transition_to(next) {
            return Err(TransitionError::Illegal { from, to: next });
        }

        let now = Utc::now();
        record.info.status = next;
        if next == TaskStatus::Running {
            record.info.started_at = Some(now);
        }
        if next.is_terminal() {
            record.info.ended_at = Some(now);
        }
        apply(&mut record.info);

        // el cupo de una tarea cancelada se libera cuando su proceso sale
        if matches!(next, TaskStatus::Completed | TaskStatus::Failed) {
            tables.slots.remove(id);
        }

        debug!("tarea {} {} -> {}", id, from, next);
        Ok(from)
    }

    pub fn mark_running(&self, id: &str) -> Result<TaskStatus, TransitionError> {
        self.transition(id, TaskStatus::Running, |_| {})
    }

    pub fn complete(&self, id: &str, result: ResultRef) -> Result<TaskStatus, TransitionError> {
        self.transition(id, TaskStatus::Completed, |info| {
            info.progress = 1.0;
            info.result_ref = Some(result);
        })
    }

    pub fn fail(&self, id: &str, failure: TaskFailure) -> Result<TaskStatus, TransitionError> {
        self.transition(id, TaskStatus::Failed, |info| {
            info.message = Some(failure.to_string());
            info.error = Some(failure);
        })
    }

    /// Cancela si la tarea no terminó. Cancelar algo ya terminado no hace nada.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, TransitionError> {
        match self.transition(id, TaskStatus::Canceled, |info| {
            info.message = Some("cancelada".to_string());
        }) {
            Ok(from) => Ok(CancelOutcome::Canceled { from }),
            Err(TransitionError::Illegal { from, .. }) => Ok(CancelOutcome::AlreadyTerminal(from)),
            Err(e) => Err(e),
        }
    }

    /// Actualiza el avance; sólo mientras corre y nunca hacia atrás.
    pub fn set_progress(&self, id: &str, fraction: f32, message: Option<String>) -> bool {
        let mut tables = self.lock();
        match tables.tasks.get_mut(id) {
            Some(record) if record.info.status == TaskStatus::Running => {
                let fraction = if fraction.is_finite() {
                    fraction.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                record.info.progress = record.info.progress.max(fraction);
                if message.is_some() {
                    record.info.message = message;
                }
                true
            }
            _ => false,
        }
    }

    /// Agrega una muestra de memoria. Devuelve `false` si la tarea ya no
    /// está corriendo: el monitor debe frenar.
    pub fn record_memory(&self, id: &str, sample: MemorySample) -> bool {
        let mut tables = self.lock();
        match tables.tasks.get_mut(id) {
            Some(record) if record.info.status == TaskStatus::Running => {
                record.memory.push(sample);
                true
            }
            _ => false,
        }
    }

    pub fn memory(&self, id: &str) -> Vec<MemorySample> {
        self.lock()
            .tasks
            .get(id)
            .map(|r| r.memory.clone())
            .unwrap_or_default()
    }

    pub fn release_slot(&self, id: &str) -> bool {
        self.lock().slots.remove(id).is_some()
    }

    pub fn remove(&self, id: &str) -> Option<TaskInfo> {
        self.lock().tasks.remove(id).map(|r| r.info)
    }

    /// Tareas terminadas hace más de `ttl`.
    pub fn expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<TaskId> {
        self.lock()
            .tasks
            .values()
            .filter(|r| r.info.status.is_terminal())
            .filter(|r| r.info.ended_at.map(|t| now - t > ttl).unwrap_or(false))
            .map(|r| r.info.id.clone())
            .collect()
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.lock()
            .tasks
            .values()
            .filter(|r| !r.info.status.is_terminal())
            .map(|r| r.info.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::JobKind;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn registry_with(id: &str) -> TaskRegistry {
        let reg = TaskRegistry::new();
        reg.insert(TaskInfo::queued(id.to_string(), JobKind::Execute), None);
        reg
    }

    fn sample(bytes: u64) -> MemorySample {
        MemorySample {
            at: Utc::now(),
            bytes,
        }
    }

    #[test]
    fn ciclo_completo_setea_timestamps_y_resultado() {
        let reg = registry_with("t1");

        reg.mark_running("t1").unwrap();
        let running = reg.get("t1").unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.ended_at.is_none());

        let r = ResultRef {
            key: "t1".into(),
            rows: 3,
            bytes: 42,
        };
        reg.complete("t1", r.clone()).unwrap();

        let done = reg.get("t1").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result_ref, Some(r));
        assert_eq!(done.progress, 1.0);
        assert!(done.ended_at.is_some());
    }

    #[test]
    fn transiciones_invalidas_se_rechazan() {
        let reg = registry_with("t1");

        let err = reg.complete(
            "t1",
            ResultRef {
                key: "t1".into(),
                rows: 0,
                bytes: 0,
            },
        );
        assert_eq!(
            err,
            Err(TransitionError::Illegal {
                from: TaskStatus::Queued,
                to: TaskStatus::Completed
            })
        );

        assert_eq!(
            reg.mark_running("nope"),
            Err(TransitionError::NotFound("nope".into()))
        );
    }

    #[test]
    fn un_solo_estado_terminal_aunque_compitan() {
        let reg = registry_with("t1");
        reg.mark_running("t1").unwrap();

        assert_eq!(
            reg.cancel("t1").unwrap(),
            CancelOutcome::Canceled {
                from: TaskStatus::Running
            }
        );

        // la falla natural llega tarde y se descarta
        assert!(reg.fail("t1", TaskFailure::Application("boom".into())).is_err());
        assert_eq!(
            reg.cancel("t1").unwrap(),
            CancelOutcome::AlreadyTerminal(TaskStatus::Canceled)
        );

        let info = reg.get("t1").unwrap();
        assert_eq!(info.status, TaskStatus::Canceled);
        assert!(info.error.is_none());
    }

    #[test]
    fn memoria_solo_se_registra_mientras_corre() {
        let reg = registry_with("t1");
        assert!(!reg.record_memory("t1", sample(1)));

        reg.mark_running("t1").unwrap();
        assert!(reg.record_memory("t1", sample(10)));
        assert!(reg.record_memory("t1", sample(20)));

        reg.fail("t1", TaskFailure::WorkerCrashed("signal 9".into())).unwrap();
        assert!(!reg.record_memory("t1", sample(30)));

        let bytes: Vec<u64> = reg.memory("t1").iter().map(|s| s.bytes).collect();
        assert_eq!(bytes, vec![10, 20]);
        assert!(reg.memory("desconocida").is_empty());
    }

    #[test]
    fn progreso_no_retrocede_ni_se_sale_de_rango() {
        let reg = registry_with("t1");
        assert!(!reg.set_progress("t1", 0.5, None));

        reg.mark_running("t1").unwrap();
        assert!(reg.set_progress("t1", 0.5, Some("mitad".into())));
        assert!(reg.set_progress("t1", 0.2, None));
        assert!(reg.set_progress("t1", 7.0, None));

        let info = reg.get("t1").unwrap();
        assert_eq!(info.progress, 1.0);
        assert_eq!(info.message.as_deref(), Some("mitad"));
    }

    #[test]
    fn cupo_se_libera_al_completar_pero_no_al_cancelar() {
        let sem = Arc::new(Semaphore::new(2));
        let reg = TaskRegistry::new();

        for id in ["a", "b"] {
            let slot = sem.clone().try_acquire_owned().unwrap();
            reg.insert(TaskInfo::queued(id.into(), JobKind::Execute), Some(slot));
            reg.mark_running(id).unwrap();
        }
        assert_eq!(sem.available_permits(), 0);

        reg.fail("a", TaskFailure::Application("x".into())).unwrap();
        assert_eq!(sem.available_permits(), 1);

        reg.cancel("b").unwrap();
        assert_eq!(sem.available_permits(), 1);

        // el supervisor lo suelta cuando el proceso salió
        assert!(reg.release_slot("b"));
        assert_eq!(sem.available_permits(), 2);
        assert!(!reg.release_slot("b"));
    }

    #[test]
    fn expired_solo_devuelve_terminadas_viejas() {
        let reg = registry_with("viejo");
        reg.insert(TaskInfo::queued("activo".into(), JobKind::Execute), None);
        reg.cancel("viejo").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = reg.expired(later, chrono::Duration::seconds(60));
        assert_eq!(expired, vec!["viejo".to_string()]);

        assert!(reg.expired(Utc::now(), chrono::Duration::seconds(60)).is_empty());
        assert_eq!(reg.active_ids(), vec!["activo".to_string()]);
    }
}
