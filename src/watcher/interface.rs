//! Abstraction over the kernel notification system driving the supervisor.
//!
//! The supervisor waits on two things at once: readability of its control
//! channel and signals (child exits, shutdown requests). Signals are never
//! handled asynchronously; a backend turns them into [`Event`]s that the
//! ordinary loop dispatches, which keeps every state mutation on one path.
//!
//! Retry loops elsewhere in the crate need to sleep. They do so through
//! [`Pause`], whose waits end early with `Error::Interrupted` once a
//! shutdown signal arrives; signals seen while pausing are queued and handed
//! out by the next poll. Children keep exiting while a retry loop is parked,
//! so [`Pause::exited`] lets such a loop collect them between waits.
use nix::sys::{signal::Signal, wait::WaitStatus};
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Signal(Signal),
    Readable(RawFd),
    /// The last writer of a watched FIFO went away.
    HangUp(RawFd),
}

pub trait Pause {
    /// Waits for `duration`, or fails with `Error::Interrupted` when asked
    /// to shut down.
    fn pause(&mut self, duration: Duration) -> Result<()>;

    /// Children that terminated so far and were not collected yet.
    fn exited(&mut self) -> Vec<WaitStatus> {
        Vec::new()
    }
}

pub trait AsWatcher: Pause {
    fn watch_fd(&mut self, fd: RawFd) -> Result<()>;

    /// Waits up to `timeout` and returns whatever became ready, possibly
    /// nothing.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Event>>;
}

/// Signals that end the supervisor.
pub fn is_shutdown(signal: Signal) -> bool {
    matches!(signal, Signal::SIGTERM | Signal::SIGINT)
}
