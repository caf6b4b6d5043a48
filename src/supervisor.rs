//! The supervisor provides a framework-like experience for using this codebase.
//!
//! [`Supervisor`] is the one context object of a supervising process: it owns
//! the service state, the dependency manager, the payload launcher and the
//! watcher, and it runs the event loop that feeds them. Child exits, control
//! bytes and shutdown requests all arrive through that loop, so state only
//! ever changes on a single path. The watcher is a bounded generic so the loop
//! is not tied to one notification backend.
use std::time::Duration;

use nix::{
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    buffd::BufFd,
    conf::Timing,
    dependency::Dependencies,
    error::{Error, Result},
    service::Launcher,
    status::{ServiceState, Status},
    watcher::{is_shutdown, AsWatcher, Event, Pause},
};

pub struct Supervisor<W> {
    pub(crate) state: ServiceState,
    pub(crate) deps: Dependencies,
    launcher: Box<dyn Launcher>,
    pub(crate) watcher: W,
    timing: Timing,
    shutdown: bool,
}

impl<W> Supervisor<W>
where
    W: Pause,
{
    pub fn new(
        state: ServiceState,
        deps: Dependencies,
        launcher: Box<dyn Launcher>,
        watcher: W,
        timing: Timing,
    ) -> Self {
        Self {
            state,
            deps,
            launcher,
            watcher,
            timing,
            shutdown: false,
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn set_status(&mut self, status: Status) {
        self.state.set_status(status);
    }

    /// Starts the payload unless it already runs.
    ///
    /// Dependencies are enabled first. A failing fork is retried until it
    /// succeeds or a shutdown interrupts the wait.
    pub fn start(&mut self) {
        if self.state.is_running() {
            return;
        }

        for dep in self.deps.enumerate() {
            match self.deps.enable(&dep, &mut self.state, &mut self.watcher) {
                Ok(()) => {}
                Err(Error::Interrupted) => {
                    self.shutdown = true;
                    return;
                }
                Err(e) => error!("unable to enable {}: {}", dep.display(), e),
            }
        }

        let pid = loop {
            match self.launcher.launch() {
                Ok(pid) => break pid,
                Err(e) => {
                    warn!("unable to fork: {}, retrying", e);
                    if self.watcher.pause(self.timing.fork_retry()).is_err() {
                        self.shutdown = true;
                        return;
                    }
                }
            }
        };

        info!(pid = %pid, "service started");
        self.state.pid = Some(pid);
        self.state.signaled = false;
        self.state.paused = false;
        self.state.set_status(Status::Running);
    }

    /// Asks the payload to terminate; its exit is picked up by the loop.
    pub fn stop(&mut self) {
        if !self.state.is_running() {
            return;
        }
        self.signal(Signal::SIGTERM);
        if self.state.paused {
            // a stopped process only sees SIGTERM once continued
            self.signal(Signal::SIGCONT);
            self.state.paused = false;
        }
    }

    /// Delivers `signal` to the payload if it runs.
    pub fn signal(&mut self, signal: Signal) -> bool {
        let Some(pid) = running_pid(&self.state) else {
            return false;
        };
        match self.launcher.signal(pid, signal) {
            Ok(()) => {
                debug!(pid = %pid, signal = %signal, "signal sent");
                true
            }
            Err(e) => {
                warn!("unable to send {} to {}: {}", signal, pid, e);
                false
            }
        }
    }

    /// Applies the exit of child `pid`.
    pub fn on_child_exit(&mut self, status: WaitStatus) {
        let (pid, signaled) = match status {
            WaitStatus::Exited(pid, _) => (pid, false),
            WaitStatus::Signaled(pid, _, _) => (pid, true),
            _ => return,
        };

        if self.deps.owns(pid) {
            if let Err(e) = self.deps.respawn(pid, &mut self.watcher) {
                self.abort_on_interrupt(e);
            }
            return;
        }

        if !self.state.is_running() || self.state.pid != Some(pid) {
            debug!(pid = %pid, "ignoring exit of unknown child");
            return;
        }

        match status {
            WaitStatus::Exited(_, code) => info!(pid = %pid, code, "service exited"),
            WaitStatus::Signaled(_, sig, _) => info!(pid = %pid, signal = %sig, "service killed"),
            _ => {}
        }
        self.state.signaled = signaled;
        self.state.paused = false;
        self.state.set_status(if signaled {
            Status::Crashed
        } else {
            Status::Exited
        });

        if self.state.wants_up() {
            self.start();
        } else {
            self.release_dependencies();
        }
    }

    /// Gives back every dependency this service holds.
    pub fn release_dependencies(&mut self) {
        for dep in self.deps.enumerate() {
            if let Err(e) = self.deps.disable(&dep, &mut self.state, &mut self.watcher) {
                if matches!(e, Error::Interrupted) {
                    self.shutdown = true;
                    return;
                }
                error!("unable to disable {}: {}", dep.display(), e);
            }
        }
    }

    fn abort_on_interrupt(&mut self, e: Error) {
        match e {
            Error::Interrupted => self.shutdown = true,
            e => error!("{}", e),
        }
    }

    /// Collects and applies every pending child exit, including those picked
    /// up while a dependency send was waiting.
    pub fn reap(&mut self) {
        let mut exits = self.deps.take_deferred();
        exits.extend(self.watcher.exited());
        for status in exits {
            self.on_child_exit(status);
        }
    }

    /// Feeds every byte queued on the control channel to the handler.
    pub fn drain(&mut self, control: &mut BufFd) {
        match control.drain() {
            Ok(bytes) => {
                for byte in bytes {
                    self.handle_command(byte);
                }
            }
            Err(e) => {
                error!("unable to read control channel: {}", e);
                if !self.state.is_running() {
                    self.state.set_status(Status::Error);
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }
}

impl<W> Supervisor<W>
where
    W: AsWatcher,
{
    /// Runs until SIGTERM or SIGINT.
    ///
    /// Each cycle reaps finished children, then waits for control input or a
    /// signal for at most the poll interval.
    pub fn run(&mut self, control: &mut BufFd) -> Result<()> {
        self.watcher.watch_fd(control.as_raw_fd())?;

        while !self.is_shutting_down() {
            self.reap();

            for event in self.watcher.poll(self.timing.poll_interval())? {
                match event {
                    Event::Signal(Signal::SIGCHLD) => self.reap(),
                    Event::Signal(sig) if is_shutdown(sig) => {
                        info!(signal = %sig, "shutting down");
                        self.shutdown = true;
                    }
                    Event::Signal(sig) => debug!(signal = %sig, "ignoring signal"),
                    Event::Readable(_) => self.drain(control),
                    Event::HangUp(_) => self.idle(self.timing.hangup_pause()),
                }
            }
        }

        self.state.restart = false;
        self.stop();
        self.state.refresh();
        Ok(())
    }

    fn idle(&mut self, duration: Duration) {
        if self.watcher.pause(duration).is_err() {
            self.shutdown = true;
        }
    }
}

/// Pid of the running payload, if any.
pub fn running_pid(state: &ServiceState) -> Option<Pid> {
    state.pid.filter(|_| state.is_running())
}
