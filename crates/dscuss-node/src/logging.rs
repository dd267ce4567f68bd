//! Log setup for the daemon. Library users install their own subscriber.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::error::{DscussError, Result};

pub const LOG_FILE: &str = "dscuss.log";
const DEFAULT_FILTER: &str = "info,dscuss_net=debug";

/// Append log lines to `<dir>/dscuss.log`, and mirror them to stderr when
/// `verbose` is set. `RUST_LOG` overrides the default filter.
pub fn init(dir: &Path, verbose: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    let file = Mutex::new(file);

    let writer = if verbose {
        BoxMakeWriter::new(file.and(std::io::stderr))
    } else {
        BoxMakeWriter::new(file)
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| DscussError::Internal(format!("logging already initialised: {e}")))
}
