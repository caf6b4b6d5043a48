use nix::sys::{
    epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
    signal::{SigSet, Signal},
    signalfd::{SfdFlags, SignalFd},
    wait::WaitStatus,
};
use std::{
    collections::VecDeque,
    os::{
        fd::{BorrowedFd, RawFd},
        unix::io::AsRawFd,
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    registry::reap_children,
};

use super::{is_shutdown, AsWatcher, Event, Pause};

const WATCHED_SIGNALS: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT];

pub struct EpollWatcher {
    event_buffer: [EpollEvent; 4],
    signal_fd: SignalFd,
    /// Signal fd plus every watched fd.
    epoll: Epoll,
    /// Signal fd only; pausing must not wake up for control input.
    quiet: Epoll,
    pending: VecDeque<Signal>,
    interrupted: bool,
}

impl EpollWatcher {
    pub fn new() -> Result<Self> {
        let mut sigset = SigSet::empty();
        for sig in WATCHED_SIGNALS {
            sigset.add(sig);
        }

        // Blocking the signals makes them wait in the signal fd instead of
        // interrupting syscalls; they are read back as ordinary events.
        sigset.thread_block()?;
        let signal_fd =
            SignalFd::with_flags(&sigset, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let quiet = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let event = EpollEvent::new(EpollFlags::EPOLLIN, signal_fd.as_raw_fd() as _);
        epoll.add(&signal_fd, event)?;
        quiet.add(&signal_fd, event)?;

        Ok(Self {
            event_buffer: [EpollEvent::empty(); 4],
            signal_fd,
            epoll,
            quiet,
            pending: VecDeque::new(),
            interrupted: false,
        })
    }

    fn read_signals(&mut self) -> Result<()> {
        while let Some(info) = self.signal_fd.read_signal()? {
            match Signal::try_from(info.ssi_signo as i32) {
                Ok(sig) => {
                    debug!(signal = %sig, "signal received");
                    if is_shutdown(sig) {
                        self.interrupted = true;
                    }
                    self.pending.push_back(sig);
                }
                Err(e) => warn!("unknown signal number {}: {}", info.ssi_signo, e),
            }
        }
        Ok(())
    }
}

fn timeout_of(duration: Duration) -> EpollTimeout {
    EpollTimeout::try_from(duration).unwrap_or(EpollTimeout::NONE)
}

impl Pause for EpollWatcher {
    fn pause(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let num_fds = self
                .quiet
                .wait(&mut self.event_buffer, timeout_of(deadline - now))?;
            if num_fds > 0 {
                self.read_signals()?;
            }
        }
    }

    fn exited(&mut self) -> Vec<WaitStatus> {
        reap_children()
    }
}

impl AsWatcher for EpollWatcher {
    fn watch_fd(&mut self, fd: RawFd) -> Result<()> {
        let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed_fd, EpollEvent::new(EpollFlags::EPOLLIN, fd as _))?;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Event>> {
        // signals picked up while pausing come first, without waiting
        let timeout = if self.pending.is_empty() {
            timeout_of(timeout)
        } else {
            EpollTimeout::ZERO
        };

        let num_fds = match self.epoll.wait(&mut self.event_buffer, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        let mut signaled = false;
        for event in &self.event_buffer[..num_fds] {
            let data = event.data();
            if data == self.signal_fd.as_raw_fd() as u64 {
                signaled = true;
            } else if event.events().contains(EpollFlags::EPOLLIN) {
                files.push(Event::Readable(data as _));
            } else if event.events().contains(EpollFlags::EPOLLHUP) {
                files.push(Event::HangUp(data as _));
            }
        }
        if signaled {
            self.read_signals()?;
        }

        let mut events: Vec<Event> = self.pending.drain(..).map(Event::Signal).collect();
        events.extend(files);
        Ok(events)
    }
}
