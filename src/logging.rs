//! Logging setup
//!
//! Console output follows `LOG_FORMAT` (`gcp` for Stackdriver JSON, plain
//! otherwise). Events with target `oplog` are also written to the operator
//! log file, one plain line each.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

use crate::config::LoggingConfig;

/// Target for events that belong in the operator log
pub const OPLOG: &str = "oplog";

/// Layer writing `oplog` events to `path`. `truncate` starts the file over,
/// otherwise lines are appended.
pub fn operator_log_layer<S>(path: &Path, truncate: bool) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    let file = options
        .open(path)
        .with_context(|| format!("opening operator log {}", path.display()))?;

    Ok(tracing_subscriber::fmt::layer()
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_filter(Targets::new().with_target(OPLOG, Level::TRACE)))
}

pub fn init_logging(config: &LoggingConfig, truncate: bool) -> Result<()> {
    let operator_log = operator_log_layer::<Registry>(Path::new(&config.operator_log), truncate)?;

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let (gcp, plain) = if log_format == "gcp" {
        let layer = tracing_stackdriver::layer().with_filter(LevelFilter::INFO);
        (Some(layer), None)
    } else {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));
        (None, Some(tracing_subscriber::fmt::layer().with_filter(filter)))
    };

    tracing_subscriber::registry()
        .with(operator_log)
        .with(gcp)
        .with(plain)
        .init();
    Ok(())
}
