// EventRelay - runs one synchronization pass per invocation
// Scheduling is left to cron or a systemd timer

use std::process::ExitCode;

use log::{error, info, warn};

use eventrelay::utils::logging::init_logging;
use eventrelay::{Config, Database, PassState, SyncOrchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!("Starting EventRelay");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let db = match Database::new(&config.database_path()).await {
        Ok(database) => database,
        Err(e) => {
            error!("Failed to initialize event store: {:#}", e);
            eprintln!("Failed to initialize event store: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match db.cleanup_old_data(config.retention_days).await {
        Ok(cleanup) => info!("Retention cleanup: {:?}", cleanup),
        Err(e) => warn!("Retention cleanup failed, continuing: {:#}", e),
    }

    let orchestrator = match SyncOrchestrator::from_config(&config, db) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to set up synchronization: {:#}", e);
            eprintln!("Failed to set up synchronization: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = orchestrator.run_pass().await;
    if report.state == PassState::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
