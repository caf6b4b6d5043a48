//! Error type shared by every component of the supervisor.
//!
//! Most runtime failures are logged and absorbed where they happen; the
//! variants here are the ones that have to travel: startup failures that end
//! the process and the `Interrupted` marker that unwinds a pending retry when
//! a shutdown signal arrives.
use nix::errno::Errno;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Another supervisor holds the lock of this directory.
    #[error("{} is already supervised", .0.display())]
    AlreadySupervised(PathBuf),

    #[error("unable to lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: Errno },

    #[error("unable to open control channel {}: {source}", path.display())]
    Control { path: PathBuf, source: io::Error },

    #[error("invalid configuration {}: {source}", path.display())]
    Config {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unsupported configuration format: {}", .0.display())]
    UnsupportedConfig(PathBuf),

    /// A timed wait was cut short by a shutdown request.
    #[error("interrupted by shutdown request")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sys(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps an `io::Error` produced by a raw syscall back onto its errno.
pub fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::UnknownErrno)
}
