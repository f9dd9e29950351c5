use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can abort analyzer startup. Per-packet conditions (decode
/// rejects, non-local traffic, table overflow) are verdicts, not errors.
#[derive(Error, Debug)]
pub enum PnaError {
    #[error("capture setup failed on {iface}: {source}")]
    Capture { iface: String, source: io::Error },

    #[error("cannot read networks file {path}: {source}")]
    NetworksIo { path: PathBuf, source: io::Error },

    #[error("bad network {line:?} in {path}")]
    NetworksParse { path: PathBuf, line: String },

    #[error("no monitored networks configured (use -n or --net)")]
    NoNetworks,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),

    #[error("signal handler setup failed: {0}")]
    Signals(io::Error),
}

pub type Result<T> = std::result::Result<T, PnaError>;
