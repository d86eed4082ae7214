//! Log routing.
//!
//! One access line per request goes to the `rawx::access` target, every
//! other event (startup, errors, warnings) to the error sink. Each sink is
//! stdout/stderr unless redirected to a file.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter, fmt};

pub const ACCESS_TARGET: &str = "rawx::access";
pub const ERROR_TARGET: &str = "rawx::error";

const DEFAULT_DIRECTIVES: &str = "info,tower_http=warn";

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// verbosity of both sinks.
pub fn init(access_log: Option<&Path>, error_log: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let access_layer = fmt::layer()
        .with_writer(sink(access_log, std::io::stdout)?)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_filter(filter::filter_fn(|meta| meta.target() == ACCESS_TARGET));
    let error_layer = fmt::layer()
        .with_writer(sink(error_log, std::io::stderr)?)
        .with_ansi(error_log.is_none())
        .with_filter(filter::filter_fn(|meta| meta.target() != ACCESS_TARGET));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(access_layer)
        .with(error_layer)
        .try_init()?;
    Ok(())
}

fn sink<W>(path: Option<&Path>, fallback: W) -> anyhow::Result<BoxMakeWriter>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    match path {
        None => Ok(BoxMakeWriter::new(fallback)),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("cannot open log file {}: {e}", path.display()))?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
    }
}
