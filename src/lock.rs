//! Advisory locking of a service directory.
//!
//! Holding an exclusive `flock` on `supervise/lock` is what makes a directory
//! "supervised". The lock lives exactly as long as the returned [`Lock`], so
//! every exit path of the supervisor releases it, including unwinding.
use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use tracing::debug;

use crate::error::{errno_of, Error, Result};

pub struct Lock {
    path: PathBuf,
    file: Flock<File>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("path", &self.path).finish()
    }
}

/// Outcome of probing somebody else's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Locked,
    Unlocked,
    NotFound,
}

impl Lock {
    /// Takes the lock at `path`, creating the file if needed.
    ///
    /// Never blocks: contention is reported as [`Error::AlreadySupervised`].
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Lock {
                path: path.to_path_buf(),
                source: errno_of(&e),
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                debug!(path = %path.display(), "lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    file,
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(Error::AlreadySupervised(
                path.parent()
                    .and_then(Path::parent)
                    .unwrap_or(path)
                    .to_path_buf(),
            )),
            Err((_, source)) => Err(Error::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock explicitly; dropping the handle does the same.
    pub fn release(self) -> Result<()> {
        let path = self.path;
        self.file
            .unlock()
            .map_err(|(_, source)| Error::Lock { path, source })?;
        Ok(())
    }
}

/// Probes the lock at `path` without disturbing its holder.
///
/// When nobody holds it the probe has to take it briefly; it is released
/// before returning.
pub fn test(path: &Path) -> io::Result<Probe> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::NotFound),
        Err(e) => return Err(e),
    };

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(locked) => {
            // dropping the Flock unlocks
            drop(locked);
            Ok(Probe::Unlocked)
        }
        Err((_, Errno::EWOULDBLOCK)) => Ok(Probe::Locked),
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}
