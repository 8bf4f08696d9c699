//! `tracing` subscriber setup.
//!
//! Stdout carries the single JSON response kubelet parses, so diagnostics go
//! to an append-mode log file and fall back to stderr when the file cannot be
//! opened.

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tracing_subscriber::EnvFilter;

use crate::config::DriverConfig;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV_VAR: &str = "FLEXVOL_LOG";

const FALLBACK_DIRECTIVE: &str = "warn";

/// Where log output ended up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogTarget {
    /// Appending to the named file.
    File(Utf8PathBuf),
    /// The file could not be opened; writing to stderr.
    Stderr {
        /// File that was attempted.
        attempted: Utf8PathBuf,
        /// Open failure.
        message: String,
    },
}

/// Builds the filter from [`LOG_ENV_VAR`], then the configured level.
#[must_use]
pub fn filter_for(config: &DriverConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(config.log_level.trim()))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_DIRECTIVE))
}

/// Opens `path` for appending, creating it when absent.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be opened.
pub fn open_log_file(path: &Utf8Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. Later calls keep the first subscriber.
pub fn init(config: &DriverConfig, binary_name: &str) -> LogTarget {
    let path = config.log_file_for(binary_name);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_target(true)
        .with_ansi(false);

    match open_log_file(&path) {
        Ok(file) => {
            if builder.with_writer(Mutex::new(file)).try_init().is_err() {
                tracing::debug!("subscriber already installed");
            }
            LogTarget::File(path)
        }
        Err(err) => {
            if builder.with_writer(io::stderr).try_init().is_err() {
                tracing::debug!("subscriber already installed");
            }
            tracing::warn!(path = %path, error = %err, "log file unavailable; using stderr");
            LogTarget::Stderr {
                attempted: path,
                message: err.to_string(),
            }
        }
    }
}
