use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, TesseraError};

/// Initializes the global tracing subscriber. Intended for binaries and
/// integration tests; returns an error if the level filter is malformed or
/// a subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| TesseraError::InvalidArgument(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| TesseraError::InvalidArgument("logging already initialized".into()))
}
