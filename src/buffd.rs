//! Named pipes with a co-located read buffer.
//!
//! The control channel is a FIFO opened non-blocking. [`BufFd`] owns the read
//! end together with a small buffer so the event loop can drain whatever is
//! queued without ever blocking; bytes are handed out in the order received.
use nix::{errno::Errno, libc, sys::stat::Mode, unistd::mkfifo};

use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
};

const IO_BUFSIZE: usize = 64;

#[derive(Debug)]
pub struct BufFd {
    file: File,
    buffer: [u8; IO_BUFSIZE],
    curr_len: usize,
}

impl BufFd {
    /// Creates the FIFO at `path` if needed and opens its read end.
    pub fn fifo(path: &Path) -> io::Result<Self> {
        match mkfifo(path, Mode::from_bits_truncate(0o600)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self::new(file))
    }

    pub fn new(file: File) -> Self {
        Self {
            file,
            buffer: [0; IO_BUFSIZE],
            curr_len: 0,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.curr_len]
    }

    /// Reads one buffer's worth. Zero bytes means nothing is queued (or no
    /// writer is attached); it is not an error on a non-blocking FIFO.
    pub fn read(&mut self) -> Result<usize, Errno> {
        match nix::unistd::read(self.file.as_raw_fd(), &mut self.buffer) {
            Ok(n) => {
                self.curr_len = n;
                Ok(n)
            }
            Err(Errno::EAGAIN) => {
                // we'll be woken up again by the watcher when more arrives
                self.curr_len = 0;
                Ok(0)
            }
            Err(e) => {
                self.curr_len = 0;
                Err(e)
            }
        }
    }

    /// Reads until the FIFO is empty, returning every queued byte.
    pub fn drain(&mut self) -> Result<Vec<u8>, Errno> {
        let mut out = Vec::new();
        while self.read()? > 0 {
            out.extend_from_slice(self.data());
        }
        Ok(out)
    }
}

impl AsFd for BufFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Opens the write end of a FIFO without blocking.
///
/// Fails with `ENXIO` while no reader has the FIFO open and with `ENOENT`
/// when it does not exist.
pub fn open_writer(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}
