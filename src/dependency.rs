//! Dependency management.
//!
//! A service lists the services it needs in its `depends` file. Before the
//! payload starts, every dependency receives a `+` on its control channel, and
//! after the payload is gone for good, a `-`. Each dependency is held at most
//! once: the enabled set remembers which ones currently carry our `+`.
//!
//! A dependency nobody supervises yet gets a supervisor of its own: this
//! program re-executed in dependency mode. Those processes are recorded in a
//! [`Registry`] and restarted whenever they exit, including while a send is
//! still waiting for one of them to come up.
use std::{
    collections::HashSet,
    ffi::CString,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::wait::WaitStatus,
    unistd::{fork, ForkResult, Pid},
};
use tracing::{debug, error, info, warn};

use crate::{
    buffd::open_writer,
    conf::Timing,
    error::{errno_of, Error, Result},
    exec::{exec_child, to_cstring},
    lock::{self, Probe},
    registry::Registry,
    status::{ServiceState, Status},
    watcher::Pause,
};

pub const DEPENDS_FILE: &str = "depends";

/// Starts a supervisor process for another service directory.
pub trait Spawner {
    fn spawn(&mut self, dir: &Path) -> std::result::Result<Pid, Errno>;
}

/// Re-invokes this program in dependency mode (`-d DIR`).
#[derive(Debug)]
pub struct SelfSpawner {
    exe: CString,
    config: Option<CString>,
}

impl SelfSpawner {
    pub fn new(exe: &Path, config: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            exe: to_cstring(exe.as_os_str())?,
            config: config.map(|c| to_cstring(c.as_os_str())).transpose()?,
        })
    }
}

impl Spawner for SelfSpawner {
    fn spawn(&mut self, dir: &Path) -> std::result::Result<Pid, Errno> {
        let dir = to_cstring(dir.as_os_str()).map_err(|_| Errno::EINVAL)?;
        let mut argv = vec![self.exe.clone(), c"-d".to_owned(), dir];
        if let Some(config) = &self.config {
            argv.push(c"--config".to_owned());
            argv.push(config.clone());
        }

        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => exec_child(
                &self.exe,
                &argv,
                b"dirsv: unable to execute dependency supervisor\n",
            ),
        }
    }
}

/// What became of one command sent to a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The channel stayed full for every attempt.
    Abandoned,
    /// Nobody supervises the dependency and we were not asked to start it.
    Unsupervised,
}

pub struct Dependencies {
    service_dir: PathBuf,
    root: PathBuf,
    enabled: HashSet<PathBuf>,
    registry: Registry,
    spawner: Box<dyn Spawner>,
    timing: Timing,
    /// Exits of other children collected while waiting.
    deferred: Vec<WaitStatus>,
}

impl Dependencies {
    /// `service_dir` holds the `depends` file; `root` resolves bare names.
    pub fn new<P, Q>(service_dir: P, root: Q, spawner: Box<dyn Spawner>, timing: Timing) -> Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        Self {
            service_dir: service_dir.into(),
            root: root.into(),
            enabled: HashSet::new(),
            registry: Registry::new(),
            spawner,
            timing,
            deferred: Vec::new(),
        }
    }

    /// Lists the dependencies that currently resolve to a directory.
    ///
    /// A missing `depends` file means no dependencies. Entries that resolve
    /// nowhere are logged and skipped; they never hide the remaining ones.
    pub fn enumerate(&self) -> Vec<PathBuf> {
        let text = match fs::read_to_string(self.service_dir.join(DEPENDS_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("unable to read {}: {}", DEPENDS_FILE, e);
                return Vec::new();
            }
        };

        text.lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter_map(|name| self.resolve(name))
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let direct = self.service_dir.join(name);
        if direct.exists() {
            return Some(direct);
        }
        let rooted = self.root.join(name);
        if rooted.exists() {
            return Some(rooted);
        }
        error!("dependency not found: {}", name);
        None
    }

    pub fn is_enabled(&self, dep: &Path) -> bool {
        self.enabled.contains(dep)
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Takes a hold on `dep`, once.
    pub fn enable(
        &mut self,
        dep: &Path,
        state: &mut ServiceState,
        pause: &mut dyn Pause,
    ) -> Result<()> {
        if self.is_enabled(dep) {
            return Ok(());
        }

        if self.send(dep, true, b'+', state, pause)? == Delivery::Delivered {
            self.enabled.insert(dep.to_path_buf());
        }
        Ok(())
    }

    /// Gives back the hold on `dep`, if we have one.
    pub fn disable(
        &mut self,
        dep: &Path,
        state: &mut ServiceState,
        pause: &mut dyn Pause,
    ) -> Result<()> {
        if !self.is_enabled(dep) {
            return Ok(());
        }

        match self.send(dep, false, b'-', state, pause)? {
            Delivery::Delivered | Delivery::Unsupervised => {
                self.enabled.remove(dep);
            }
            Delivery::Abandoned => {}
        }
        Ok(())
    }

    /// Writes one command byte into the control channel of `dep`.
    ///
    /// Waits (status `Waiting`) for the channel to get a reader, starting a
    /// supervisor first when `start_if_missing` is set and nobody supervises
    /// the dependency.
    pub fn send(
        &mut self,
        dep: &Path,
        start_if_missing: bool,
        command: u8,
        state: &mut ServiceState,
        pause: &mut dyn Pause,
    ) -> Result<Delivery> {
        let path = dep.join("supervise").join("control");

        let mut writer = loop {
            match open_writer(&path) {
                Ok(writer) => break writer,
                Err(e) if matches!(errno_of(&e), Errno::ENOENT | Errno::ENXIO) => {
                    if !self.is_supervised(dep) {
                        if !start_if_missing {
                            warn!(
                                "{} is not supervised, dropping command {}",
                                dep.display(),
                                command as char
                            );
                            return Ok(Delivery::Unsupervised);
                        }
                        info!("starting supervisor for {}", dep.display());
                        self.start_supervisor(dep, pause)?;
                    }
                    if !state.is_running() {
                        state.set_status(Status::Waiting);
                    }
                    self.wait(self.timing.send_interval(), pause)?;
                }
                Err(source) => return Err(Error::Control { path, source }),
            }
        };

        let mut retries = self.timing.send_retries.max(1);
        loop {
            match writer.write(&[command]) {
                Ok(1) => {
                    debug!("sent {} to {}", command as char, dep.display());
                    return Ok(Delivery::Delivered);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => warn!(
                    "unable to send command to {}: {}, retrying",
                    dep.display(),
                    e
                ),
            }

            retries -= 1;
            if retries == 0 {
                warn!(
                    "giving up on sending {} to {}",
                    command as char,
                    dep.display()
                );
                return Ok(Delivery::Abandoned);
            }
            self.wait(self.timing.send_interval(), pause)?;
        }
    }

    /// Whether some process (ours or not) looks after `dep`.
    fn is_supervised(&self, dep: &Path) -> bool {
        if self.registry.get_by_dir(dep).is_some() {
            return true;
        }
        let lock_path = dep.join("supervise").join("lock");
        match lock::test(&lock_path) {
            Ok(Probe::Locked) => true,
            Ok(Probe::Unlocked) | Ok(Probe::NotFound) => false,
            Err(e) => {
                warn!("unable to test lock of {}: {}", dep.display(), e);
                true
            }
        }
    }

    fn start_supervisor(&mut self, dep: &Path, pause: &mut dyn Pause) -> Result<Pid> {
        loop {
            match self.spawner.spawn(dep) {
                Ok(pid) => {
                    debug!(pid = %pid, "supervisor for {} started", dep.display());
                    self.registry.insert(dep, pid);
                    return Ok(pid);
                }
                Err(e) => {
                    warn!(
                        "unable to start supervisor for {}: {}, retrying",
                        dep.display(),
                        e
                    );
                    pause.pause(self.timing.fork_retry())?;
                }
            }
        }
    }

    /// Pauses, then restarts any of our supervisors that exited meanwhile.
    ///
    /// Other exits are kept for [`Dependencies::take_deferred`].
    fn wait(&mut self, duration: Duration, pause: &mut dyn Pause) -> Result<()> {
        pause.pause(duration)?;
        for status in pause.exited() {
            match status.pid() {
                Some(pid) if self.owns(pid) => self.respawn(pid, pause)?,
                _ => self.deferred.push(status),
            }
        }
        Ok(())
    }

    /// Child exits collected by a wait that belong to somebody else.
    pub fn take_deferred(&mut self) -> Vec<WaitStatus> {
        std::mem::take(&mut self.deferred)
    }

    /// Whether `pid` is one of the dependency supervisors we started.
    pub fn owns(&self, pid: Pid) -> bool {
        self.registry.get_by_pid(pid).is_some()
    }

    /// Brings back the dependency supervisor that ran as `pid`.
    pub fn respawn(&mut self, pid: Pid, pause: &mut dyn Pause) -> Result<()> {
        let Some(dir) = self.registry.get_by_pid(pid).map(|r| r.dir.clone()) else {
            return Ok(());
        };
        info!("supervisor for {} stopped, restarting", dir.display());
        self.start_supervisor(&dir, pause)?;
        Ok(())
    }
}
