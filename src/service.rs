//! Starts and signals the supervised payload.
//!
//! The launcher knows nothing about status or restart policy; it only forks,
//! execs the entry point and delivers signals. The supervisor decides when.
use crate::exec::{exec_child, to_cstring};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::{fork, ForkResult, Pid},
};
use std::{ffi::CString, io, path::Path};

/// Entry point of every service, relative to its directory.
pub const ENTRY_POINT: &str = "./run";

pub trait Launcher {
    /// Forks and execs the payload, returning the child's pid.
    fn launch(&mut self) -> Result<Pid, Errno>;

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), Errno>;
}

#[derive(Debug)]
pub struct ForkLauncher {
    prog: CString,
}

impl ForkLauncher {
    pub fn new<P: AsRef<Path>>(entry: P) -> io::Result<Self> {
        let prog = to_cstring(entry.as_ref().as_os_str())?;
        Ok(Self { prog })
    }
}

impl Launcher for ForkLauncher {
    fn launch(&mut self) -> Result<Pid, Errno> {
        let argv = [self.prog.clone()];
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => exec_child(
                &self.prog,
                &argv,
                b"dirsv: unable to execute service entry point\n",
            ),
        }
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        kill(pid, signal)
    }
}
