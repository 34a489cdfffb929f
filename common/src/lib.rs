pub mod engine;
pub mod fuzzy;
pub mod job;
pub mod protocol;
pub mod task;

pub use engine::{Record, Records, Table};
pub use job::{
    DataSource, ExecutePayload, FileFormat, FuzzyJoinPayload, JobKind, JobPayload, PayloadError,
    Step, TableInputFormat, CreateTablePayload, WriteResultsPayload,
};
pub use protocol::{WorkerAssignment, WorkerMessage, EXIT_CANCELED, EXIT_FAILED};
pub use task::{new_task_id, MemorySample, ResultRef, TaskFailure, TaskId, TaskInfo, TaskStatus};
