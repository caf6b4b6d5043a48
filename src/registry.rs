//! Bookkeeping of forked children.
//!
//! [`Registry`] remembers every dependency supervisor this process started,
//! so an exit can be matched back to its directory and the supervisor brought
//! straight back. Records are never removed: dependency supervisors are meant
//! to live as long as the system does.
//!
//! [`reap_children`] collects every child that has terminated so far without
//! blocking. It is safe to call any number of times from any point of the
//! loop; a call with nothing to collect is a no-op.
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub dir: PathBuf,
    pub pid: Pid,
}

#[derive(Debug, Default)]
pub struct Registry {
    pub records: Vec<DependencyRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dir: &Path, pid: Pid) {
        match self.get_by_dir_mut(dir) {
            Some(record) => record.pid = pid,
            None => self.records.push(DependencyRecord {
                dir: dir.to_path_buf(),
                pid,
            }),
        }
    }

    pub fn get_by_dir(&self, dir: &Path) -> Option<&DependencyRecord> {
        self.records.iter().find(|record| record.dir == dir)
    }

    pub fn get_by_dir_mut(&mut self, dir: &Path) -> Option<&mut DependencyRecord> {
        self.records.iter_mut().find(|record| record.dir == dir)
    }

    pub fn get_by_pid(&self, pid: Pid) -> Option<&DependencyRecord> {
        self.records.iter().find(|record| record.pid == pid)
    }
}

/// Collects every terminated child without blocking.
pub fn reap_children() -> Vec<WaitStatus> {
    let mut reaped_children = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                reaped_children.push(status);
            }
            Ok(WaitStatus::StillAlive) => break,
            Err(Errno::ECHILD) => break, // No more children
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("error in waitpid: {}", e);
                break;
            }
            _ => {}
        }
    }
    reaped_children
}
