//! Tracing initialisation for the daemon.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// The level comes from configuration but `RUST_LOG` wins when set. With a
/// log file the output goes there (append, no colors); otherwise stdout.
pub fn init_tracing(
    log_level: &str,
    log_file: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
                .map_err(|e| format!("Failed to set global tracing subscriber: {e}"))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .try_init()
                .map_err(|e| format!("Failed to set global tracing subscriber: {e}"))?;
        }
    }

    Ok(())
}
