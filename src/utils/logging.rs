use env_logger::{Builder, Target};
use log::{Level, LevelFilter, SetLoggerError};
use std::env;
use std::io::Write;

use crate::models::PassReport;

fn parse_level(value: &str) -> LevelFilter {
    match value.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Installs the process logger. `RUST_LOG` picks the level;
/// `EVENTRELAY_ENV=production` quiets the HTTP and database crates.
pub fn init_logging() -> Result<(), SetLoggerError> {
    let env = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level = parse_level(&env);

    let mut builder = Builder::from_default_env();

    builder.format(|buf, record| {
        let timestamp = buf.timestamp();
        let target = record.target();
        let file = record.file().unwrap_or("unknown");
        let line = record.line().unwrap_or(0);

        match record.level() {
            Level::Info => writeln!(buf, "{} [INFO] [{}]: {}", timestamp, target, record.args()),
            level => writeln!(
                buf,
                "{} [{}] [{}:{}] {}: {}",
                timestamp,
                level,
                file,
                line,
                target,
                record.args()
            ),
        }
    });

    if env::var("EVENTRELAY_ENV").unwrap_or_else(|_| "development".to_string()) == "production" {
        builder.filter_module("reqwest", LevelFilter::Warn);
        builder.filter_module("hyper", LevelFilter::Warn);
        builder.filter_module("rustls", LevelFilter::Warn);
        builder.filter_module("sqlx", LevelFilter::Warn);
    }

    builder.filter_level(log_level).target(Target::Stdout).try_init()
}

pub fn log_error_with_context(error: &(dyn std::error::Error + 'static), context: &str) {
    log::error!("[{}] {}", context, error);

    let mut source = error.source();
    while let Some(err) = source {
        log::error!("  Caused by: {}", err);
        source = err.source();
    }
}

pub fn log_database_operation(operation: &str, table: &str, duration_ms: u64) {
    log::debug!("[Database] {} on table {} took {}ms", operation, table, duration_ms);
}

pub fn log_delivery_attempt(channel: &str, notification_id: &str, attempt: u32, outcome: &str) {
    log::debug!("[Dispatch] {} -> {} attempt {}: {}", notification_id, channel, attempt, outcome);
}

pub fn log_pass_summary(report: &PassReport) {
    let changes = &report.changes;
    log::info!(
        "[Pass {}] {}: +{} ~{} -{} ={}, pushed {}, conflicts {}, delivered {}, permanent failures {}",
        report.pass_id,
        report.state,
        changes.added,
        changes.updated,
        changes.deleted,
        changes.unchanged,
        report.resolution.pushed,
        report.resolution.manual_review,
        report.delivered_count(),
        report.permanent_failures.len()
    );
    if let Some(error) = &report.error {
        log::error!("[Pass {}] failed during {:?}: {}", report.pass_id, report.failed_stage, error);
    }
}
