use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_FILE_PREFIX: &str = "rmm.log";

fn env_filter(level: tracing::Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber: compact stdout, plus a daily rolling
/// file under `log_dir` when one is given.
///
/// The returned guards flush the non-blocking writers on drop and must be
/// held for as long as the node runs.
pub fn init_logging(level: tracing::Level, log_dir: Option<&Path>) -> Vec<WorkerGuard> {
    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(env_filter(level));

    match log_dir {
        Some(log_dir) => {
            if let Err(e) = std::fs::create_dir_all(log_dir) {
                eprintln!(
                    "Warning: Failed to create log directory {:?}: {}",
                    log_dir, e
                );
            }
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            guards.push(file_guard);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_filter(env_filter(level));

            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
        }
        None => tracing_subscriber::registry().with(stdout_layer).init(),
    }

    guards
}
