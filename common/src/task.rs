use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobKind;

pub type TaskId = String;

/// Genera un id nuevo. UUID v4: no se repite dentro de la vida del proceso.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Transiciones permitidas:
    /// queued -> running -> {completed, failed}, y queued|running -> canceled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Queued, Canceled)
                | (Running, Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Motivo de un `FAILED`. Las caídas del proceso se separan de los errores
/// que reporta el propio job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskFailure {
    WorkerCrashed(String),
    Application(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::WorkerCrashed(d) => write!(f, "worker caído: {d}"),
            TaskFailure::Application(d) => write!(f, "error de aplicación: {d}"),
        }
    }
}

/// Referencia a un artefacto dentro del cache de resultados.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub key: TaskId,
    pub rows: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub at: DateTime<Utc>,
    pub bytes: u64,
}

/// Proyección de sólo lectura de una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: JobKind,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Avance reportado por el worker, entre 0 y 1
    pub progress: f32,
    pub message: Option<String>,

    pub error: Option<TaskFailure>,
    pub result_ref: Option<ResultRef>,
}

impl TaskInfo {
    pub fn queued(id: TaskId, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            progress: 0.0,
            message: None,
            error: None,
            result_ref: None,
        }
    }
}
