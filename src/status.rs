//! The status state machine and its on-disk projection.
//!
//! [`ServiceState`] is the single in-memory source of truth. Every status
//! transition goes through [`ServiceState::set_status`], which derives a fresh
//! [`StatusSnapshot`] and hands it to a [`StatusSink`]; the persisted files are
//! never patched in place. Flag changes that are not a transition (pause,
//! wanted direction) are published through [`ServiceState::refresh`].
use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use nix::unistd::Pid;
use tracing::{info, warn};

/// TAI64 label of the unix epoch (2^62 + 10 leap seconds).
const TAI64_EPOCH: u64 = 4_611_686_018_427_387_914;

pub const SNAPSHOT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Exited,
    Crashed,
    Error,
    Running,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Exited => "terminated",
            Status::Crashed => "crashed",
            Status::Error => "error",
            Status::Running => "running",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives every snapshot produced by a status transition.
pub trait StatusSink {
    fn persist(&mut self, snapshot: &StatusSnapshot) -> io::Result<()>;
}

pub struct ServiceState {
    pub status: Status,
    pub changed: SystemTime,
    /// Pid of the current run; only meaningful while `Running`.
    pub pid: Option<Pid>,
    pub restart: bool,
    pub signaled: bool,
    pub paused: bool,
    pub dependency_count: i32,
    sink: Box<dyn StatusSink>,
    persisted: Option<StatusSnapshot>,
}

impl ServiceState {
    pub fn new(sink: Box<dyn StatusSink>) -> Self {
        Self {
            status: Status::Exited,
            changed: SystemTime::now(),
            pid: None,
            restart: false,
            signaled: false,
            paused: false,
            dependency_count: 0,
            sink,
            persisted: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    /// The desired direction, as reported in the binary snapshot.
    pub fn wants_up(&self) -> bool {
        self.restart || self.dependency_count > 0
    }

    /// Moves to `status`, persisting a snapshot when it actually changes.
    ///
    /// The in-memory transition happens even if persisting fails.
    pub fn set_status(&mut self, status: Status) {
        if status == self.status {
            return;
        }

        self.status = status;
        self.changed = SystemTime::now();
        info!(status = %status, "status changed");
        self.publish();
    }

    /// Persists the current snapshot if it differs from the last one written.
    pub fn refresh(&mut self) {
        if self.persisted.as_ref() != Some(&self.snapshot()) {
            self.publish();
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        match self.sink.persist(&snapshot) {
            Ok(()) => self.persisted = Some(snapshot),
            Err(e) => warn!("unable to persist status: {}", e),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let running = self.is_running();
        StatusSnapshot {
            status: self.status,
            changed: self.changed,
            pid: if running { self.pid } else { None },
            paused: self.paused,
            wants_up: self.wants_up(),
            signaled: self.signaled,
            running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: Status,
    pub changed: SystemTime,
    pub pid: Option<Pid>,
    pub paused: bool,
    pub wants_up: bool,
    pub signaled: bool,
    pub running: bool,
}

impl StatusSnapshot {
    /// Fixed-width binary form written to `supervise/status`.
    pub fn encode(&self) -> [u8; SNAPSHOT_LEN] {
        let secs = self
            .changed
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut buf = [0u8; SNAPSHOT_LEN];
        buf[0..8].copy_from_slice(&(TAI64_EPOCH + secs).to_be_bytes());
        // bytes 8..12 are the nanosecond field, always zero
        let pid = self.pid.map(Pid::as_raw).unwrap_or(0);
        buf[12..16].copy_from_slice(&pid.to_le_bytes());
        buf[16] = self.paused as u8;
        buf[17] = if self.wants_up { b'u' } else { b'd' };
        buf[18] = self.signaled as u8;
        buf[19] = self.running as u8;
        buf
    }

    pub fn stat_text(&self) -> String {
        format!("{}\n", self.status)
    }

    pub fn pid_text(&self) -> String {
        match self.pid {
            Some(pid) => format!("{}\n", pid),
            None => String::new(),
        }
    }
}

/// Writes snapshots into a `supervise` directory.
pub struct StatusDir {
    dir: PathBuf,
}

impl StatusDir {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn replace(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!("{name}.new"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp, self.dir.join(name))
    }
}

impl StatusSink for StatusDir {
    fn persist(&mut self, snapshot: &StatusSnapshot) -> io::Result<()> {
        self.replace("status", &snapshot.encode())?;
        self.replace("stat", snapshot.stat_text().as_bytes())?;
        self.replace("pid", snapshot.pid_text().as_bytes())
    }
}

/// Human-readable summary of a service directory, as persisted by its
/// supervisor.
pub fn describe(service: &Path, supervised: bool) -> String {
    let supervise = service.join("supervise");
    let stat = fs::read_to_string(supervise.join("stat")).unwrap_or_default();
    let pid = fs::read_to_string(supervise.join("pid")).unwrap_or_default();

    let mut line = format!("{}: ", service.display());
    if !supervised {
        line.push_str("not supervised");
        if !stat.trim().is_empty() {
            line.push_str(&format!(", last status {}", stat.trim()));
        }
        return line;
    }

    match stat.trim() {
        "" => line.push_str("unknown"),
        stat => line.push_str(stat),
    }
    if !pid.trim().is_empty() {
        line.push_str(&format!(" (pid {})", pid.trim()));
    }
    line
}
