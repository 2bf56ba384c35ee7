// EventRelay library
// Calendar synchronization and multi-channel notification dispatch

pub mod calendar;
pub mod channels;
pub mod config;
pub mod conflict;
pub mod database;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod http_config;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use database::{Database, StoreBatch};
pub use error::{DeliveryError, FetchError, SyncError, TargetError};
pub use models::*;
pub use orchestrator::SyncOrchestrator;
