use common::{PayloadError, TaskFailure, TaskId, TaskStatus};

/// Errores que devuelve la interfaz pública del gestor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error("límite de concurrencia alcanzado ({limit} tareas activas)")]
    ResourceExhausted { limit: usize },

    #[error("tarea {0} no encontrada")]
    NotFound(TaskId),

    #[error("la tarea {id} todavía no tiene resultado (estado {status})")]
    NotReady { id: TaskId, status: TaskStatus },

    #[error("el proceso worker terminó de forma anormal: {0}")]
    WorkerCrashed(String),

    #[error("el job reportó un error: {0}")]
    Application(String),

    #[error("la tarea {0} fue cancelada")]
    Canceled(TaskId),

    #[error("el gestor se está apagando y no acepta tareas nuevas")]
    ShuttingDown,

    #[error("no se pudo lanzar el worker: {0}")]
    Launch(String),
}

impl From<TaskFailure> for TaskError {
    fn from(f: TaskFailure) -> Self {
        match f {
            TaskFailure::WorkerCrashed(d) => TaskError::WorkerCrashed(d),
            TaskFailure::Application(d) => TaskError::Application(d),
        }
    }
}
