//! Fakes for the supervisor's seams and scratch service directories.
use std::{
    cell::RefCell,
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    rc::Rc,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use nix::{errno::Errno, sys::signal::Signal, unistd::Pid};

use crate::{
    buffd::BufFd,
    conf::Timing,
    dependency::{Dependencies, Spawner},
    error::{Error, Result},
    lock::Lock,
    service::Launcher,
    status::{ServiceState, Status, StatusSink, StatusSnapshot},
    supervisor::Supervisor,
    watcher::Pause,
};

static CHILDREN: Mutex<()> = Mutex::new(());

/// Serializes tests that fork real children or reap with `waitpid(-1)`, so
/// one test never collects another one's child.
pub fn children_lock() -> MutexGuard<'static, ()> {
    CHILDREN.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
pub struct RecordingSink(Rc<RefCell<Vec<StatusSnapshot>>>);

impl RecordingSink {
    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.0.borrow().clone()
    }
}

impl StatusSink for RecordingSink {
    fn persist(&mut self, snapshot: &StatusSnapshot) -> io::Result<()> {
        self.0.borrow_mut().push(snapshot.clone());
        Ok(())
    }
}

/// Returns immediately; optionally reports a shutdown after `limit` waits.
#[derive(Debug, Default)]
pub struct NoPause {
    count: usize,
    limit: Option<usize>,
}

impl NoPause {
    pub fn interrupt_after(limit: usize) -> Self {
        Self {
            count: 0,
            limit: Some(limit),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Pause for NoPause {
    fn pause(&mut self, _: Duration) -> Result<()> {
        self.count += 1;
        match self.limit {
            Some(limit) if self.count > limit => Err(Error::Interrupted),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct LauncherLog {
    launched: Vec<Pid>,
    signals: Vec<(Pid, Signal)>,
    failures: usize,
    next: i32,
}

#[derive(Clone, Default)]
pub struct FakeLauncher(Rc<RefCell<LauncherLog>>);

impl FakeLauncher {
    pub fn failing(self, failures: usize) -> Self {
        self.0.borrow_mut().failures = failures;
        self
    }

    pub fn launched(&self) -> Vec<Pid> {
        self.0.borrow().launched.clone()
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        self.0.borrow().signals.clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&mut self) -> std::result::Result<Pid, Errno> {
        let mut log = self.0.borrow_mut();
        if log.failures > 0 {
            log.failures -= 1;
            return Err(Errno::EAGAIN);
        }
        log.next += 1;
        let pid = Pid::from_raw(1000 + log.next);
        log.launched.push(pid);
        Ok(pid)
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> std::result::Result<(), Errno> {
        self.0.borrow_mut().signals.push((pid, signal));
        Ok(())
    }
}

#[derive(Default)]
struct SpawnerLog {
    listen: bool,
    failures: usize,
    next: i32,
    spawned: Vec<PathBuf>,
    readers: HashMap<PathBuf, BufFd>,
}

/// Stands in for starting dependency supervisors. A listening spawner opens
/// the dependency's control channel the way a real supervisor would.
#[derive(Clone, Default)]
pub struct FakeSpawner(Rc<RefCell<SpawnerLog>>);

impl FakeSpawner {
    pub fn listening() -> Self {
        let spawner = Self::default();
        spawner.0.borrow_mut().listen = true;
        spawner
    }

    pub fn failing(self, failures: usize) -> Self {
        self.0.borrow_mut().failures = failures;
        self
    }

    pub fn spawned(&self) -> Vec<PathBuf> {
        self.0.borrow().spawned.clone()
    }

    pub fn received(&self, dir: &Path) -> Vec<u8> {
        match self.0.borrow_mut().readers.get_mut(dir) {
            Some(reader) => reader.drain().unwrap(),
            None => Vec::new(),
        }
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&mut self, dir: &Path) -> std::result::Result<Pid, Errno> {
        let mut log = self.0.borrow_mut();
        if log.failures > 0 {
            log.failures -= 1;
            return Err(Errno::EAGAIN);
        }
        if log.listen {
            fs::create_dir_all(dir.join("supervise")).unwrap();
            let reader = BufFd::fifo(&dir.join("supervise/control")).unwrap();
            log.readers.insert(dir.to_path_buf(), reader);
        }
        log.next += 1;
        log.spawned.push(dir.to_path_buf());
        Ok(Pid::from_raw(5000 + log.next))
    }
}

/// A service directory with a `supervise` subdirectory.
pub struct ServiceDir {
    pub path: PathBuf,
    lock: Option<Lock>,
}

impl ServiceDir {
    pub fn new(root: &Path, name: &str) -> Self {
        let path = root.join(name);
        fs::create_dir_all(path.join("supervise")).unwrap();
        Self { path, lock: None }
    }

    pub fn write_depends(&self, text: &str) {
        fs::write(self.path.join("depends"), text).unwrap();
    }

    /// Acts as this directory's supervisor: holds its lock and reads its
    /// control channel.
    pub fn listen(&mut self) -> BufFd {
        self.lock = Some(Lock::acquire(&self.path.join("supervise/lock")).unwrap());
        BufFd::fifo(&self.path.join("supervise/control")).unwrap()
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }
}

pub struct Harness<W = NoPause> {
    pub supervisor: Supervisor<W>,
    pub launcher: FakeLauncher,
    pub sink: RecordingSink,
    pub spawner: FakeSpawner,
}

/// A `Waiting` supervisor for `service` with every seam faked.
pub fn harness(service: &Path, root: &Path) -> Harness {
    harness_with(service, root, NoPause::default(), Timing::default())
}

/// Same as [`harness`] around a caller-provided watcher.
pub fn harness_with<W: Pause>(
    service: &Path,
    root: &Path,
    watcher: W,
    timing: Timing,
) -> Harness<W> {
    let launcher = FakeLauncher::default();
    let sink = RecordingSink::default();
    let spawner = FakeSpawner::listening();
    let deps = Dependencies::new(service, root, Box::new(spawner.clone()), timing.clone());
    let state = ServiceState::new(Box::new(sink.clone()));
    let mut supervisor = Supervisor::new(state, deps, Box::new(launcher.clone()), watcher, timing);
    supervisor.set_status(Status::Waiting);
    Harness {
        supervisor,
        launcher,
        sink,
        spawner,
    }
}
