//! The single-byte control protocol.
//!
//! Each byte read from `supervise/control` is one command. Decoding a byte at
//! a time means a reader can never get out of step with a writer, whatever
//! the writer's buffering. Bytes that are not printable are skipped; unknown
//! printable bytes are logged and skipped.
use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::{supervisor::Supervisor, watcher::Pause};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `s`, `u`, `o`: want the service up and start it.
    Start,
    /// `x`, `t`, `d`: want the service down and terminate it.
    Stop,
    /// `k`
    Kill,
    /// Forward a signal to the running payload.
    Signal(Signal),
    /// `+`: a dependent needs this service.
    Acquire,
    /// `-`: a dependent no longer needs it.
    Release,
}

impl Command {
    /// Decodes one control byte. `None` for bytes outside the alphabet.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let command = match byte {
            b's' | b'u' | b'o' => Command::Start,
            b'x' | b't' | b'd' => Command::Stop,
            b'k' => Command::Kill,
            b'p' => Command::Signal(Signal::SIGSTOP),
            b'c' => Command::Signal(Signal::SIGCONT),
            b'a' => Command::Signal(Signal::SIGALRM),
            b'h' => Command::Signal(Signal::SIGHUP),
            b'i' => Command::Signal(Signal::SIGINT),
            b'q' => Command::Signal(Signal::SIGQUIT),
            b'1' => Command::Signal(Signal::SIGUSR1),
            b'2' => Command::Signal(Signal::SIGUSR2),
            b'+' => Command::Acquire,
            b'-' => Command::Release,
            _ => return None,
        };
        Some(command)
    }
}

impl<W> Supervisor<W>
where
    W: Pause,
{
    pub fn handle_command(&mut self, byte: u8) {
        if !byte.is_ascii_graphic() {
            return;
        }
        let Some(command) = Command::from_byte(byte) else {
            warn!("unknown command: {}", byte as char);
            return;
        };
        debug!(?command, "command received");
        self.apply(command);
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Start => {
                self.state.restart = true;
                self.start();
            }
            Command::Stop => {
                self.state.restart = false;
                self.stop();
            }
            Command::Kill => {
                self.state.restart = false;
                if self.signal(Signal::SIGKILL) {
                    self.state.paused = false;
                }
            }
            Command::Signal(signal) => {
                if self.signal(signal) {
                    match signal {
                        Signal::SIGSTOP => self.state.paused = true,
                        Signal::SIGCONT => self.state.paused = false,
                        _ => {}
                    }
                }
            }
            Command::Acquire => {
                self.state.dependency_count += 1;
                if self.state.dependency_count > 0 {
                    self.start();
                }
            }
            Command::Release => {
                self.state.dependency_count -= 1;
                if self.state.dependency_count == 0 && !self.state.restart {
                    self.stop();
                }
            }
        }
        self.state.refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::testutil::harness;
    use nix::sys::wait::WaitStatus;

    #[test]
    fn decodes_the_alphabet() {
        for byte in *b"suo" {
            assert_eq!(Command::from_byte(byte), Some(Command::Start));
        }
        for byte in *b"xtd" {
            assert_eq!(Command::from_byte(byte), Some(Command::Stop));
        }
        assert_eq!(Command::from_byte(b'k'), Some(Command::Kill));
        assert_eq!(
            Command::from_byte(b'h'),
            Some(Command::Signal(Signal::SIGHUP))
        );
        assert_eq!(
            Command::from_byte(b'2'),
            Some(Command::Signal(Signal::SIGUSR2))
        );
        assert_eq!(Command::from_byte(b'+'), Some(Command::Acquire));
        assert_eq!(Command::from_byte(b'-'), Some(Command::Release));
        assert_eq!(Command::from_byte(b'z'), None);
        assert_eq!(Command::from_byte(b'\n'), None);
    }

    #[test]
    fn start_then_balanced_dependents_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        for byte in *b"s++--" {
            h.supervisor.handle_command(byte);
        }

        assert_eq!(h.launcher.launched().len(), 1);
        assert_eq!(h.supervisor.state().dependency_count, 0);
        assert!(h.supervisor.state().restart);
        assert_eq!(h.supervisor.state().status, Status::Running);
        assert!(h.launcher.signals().is_empty());
    }

    #[test]
    fn last_dependent_leaving_stops_an_undesired_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        for byte in *b"++-" {
            h.supervisor.handle_command(byte);
        }
        assert!(h.launcher.signals().is_empty());

        h.supervisor.handle_command(b'-');
        let pid = h.launcher.launched()[0];
        assert_eq!(h.launcher.signals(), vec![(pid, Signal::SIGTERM)]);

        h.supervisor.on_child_exit(WaitStatus::Exited(pid, 0));
        assert_eq!(h.supervisor.state().status, Status::Exited);
        assert_eq!(h.launcher.launched().len(), 1);
    }

    #[test]
    fn stop_clears_restart_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        h.supervisor.handle_command(b'u');
        h.supervisor.handle_command(b't');
        let pid = h.launcher.launched()[0];

        assert!(!h.supervisor.state().restart);
        assert_eq!(h.launcher.signals(), vec![(pid, Signal::SIGTERM)]);
    }

    #[test]
    fn kill_sends_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        h.supervisor.handle_command(b'k');
        assert!(h.launcher.signals().is_empty());

        h.supervisor.handle_command(b's');
        h.supervisor.handle_command(b'k');
        let pid = h.launcher.launched()[0];
        assert!(!h.supervisor.state().restart);
        assert_eq!(h.launcher.signals(), vec![(pid, Signal::SIGKILL)]);
    }

    #[test]
    fn signal_commands_need_a_running_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        for byte in *b"pcahiq12" {
            h.supervisor.handle_command(byte);
        }
        assert!(h.launcher.signals().is_empty());
        assert_eq!(h.supervisor.state().status, Status::Waiting);

        h.supervisor.handle_command(b's');
        let pid = h.launcher.launched()[0];
        for byte in *b"ahiq12" {
            h.supervisor.handle_command(byte);
        }
        let sent: Vec<_> = h.launcher.signals().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            sent,
            vec![
                Signal::SIGALRM,
                Signal::SIGHUP,
                Signal::SIGINT,
                Signal::SIGQUIT,
                Signal::SIGUSR1,
                Signal::SIGUSR2,
            ]
        );
        assert!(h.launcher.signals().iter().all(|(p, _)| *p == pid));
    }

    #[test]
    fn stopping_a_paused_payload_continues_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        h.supervisor.handle_command(b's');
        h.supervisor.handle_command(b'p');
        assert!(h.supervisor.state().paused);

        h.supervisor.handle_command(b'd');
        let sent: Vec<_> = h.launcher.signals().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            sent,
            vec![Signal::SIGSTOP, Signal::SIGTERM, Signal::SIGCONT]
        );
        assert!(!h.supervisor.state().paused);
    }

    #[test]
    fn pause_is_published_and_kill_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        h.supervisor.handle_command(b's');
        h.supervisor.handle_command(b'p');
        let last = h.sink.snapshots().last().unwrap().clone();
        assert_eq!(last.status, Status::Running);
        assert_eq!(last.encode()[16], 1);

        h.supervisor.handle_command(b'k');
        assert!(!h.supervisor.state().paused);
        let pid = h.launcher.launched()[0];
        h.supervisor
            .on_child_exit(WaitStatus::Signaled(pid, Signal::SIGKILL, false));

        let last = h.sink.snapshots().last().unwrap().clone();
        assert_eq!(last.status, Status::Crashed);
        assert_eq!(last.encode()[16], 0);
        assert_eq!(last.encode()[17], b'd');
    }

    #[test]
    fn paused_payload_exiting_on_its_own_is_no_longer_paused() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());

        h.supervisor.handle_command(b'p');
        assert!(!h.supervisor.state().paused);

        h.supervisor.handle_command(b'+');
        h.supervisor.handle_command(b'p');
        let pid = h.launcher.launched()[0];
        h.supervisor.handle_command(b'-');
        // paused again before the exit is observed
        h.supervisor.handle_command(b'p');
        h.supervisor
            .on_child_exit(WaitStatus::Signaled(pid, Signal::SIGTERM, false));

        assert!(!h.supervisor.state().paused);
        let last = h.sink.snapshots().last().unwrap().clone();
        assert_eq!(last.status, Status::Crashed);
        assert_eq!(last.encode()[16], 0);
    }

    #[test]
    fn unknown_and_unprintable_bytes_change_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), dir.path());
        let writes = h.sink.snapshots().len();

        for byte in [b'z', b'\n', b' ', 0u8, 0xff] {
            h.supervisor.handle_command(byte);
        }

        assert!(h.launcher.launched().is_empty());
        assert_eq!(h.sink.snapshots().len(), writes);
        assert_eq!(h.supervisor.state().dependency_count, 0);
    }
}
