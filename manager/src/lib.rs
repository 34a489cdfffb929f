pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod sweeper;

pub use cache::{CacheError, ResultCache};
pub use config::ManagerConfig;
pub use error::TaskError;
pub use manager::{CancelAck, ShutdownReport, TaskManager};
