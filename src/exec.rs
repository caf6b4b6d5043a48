//! Helpers for the child side of `fork`.
//!
//! Everything a child needs for `execv` is converted into `CString`s before
//! forking, so the code that runs between `fork` and `exec` neither allocates
//! nor takes locks.
use nix::{
    libc,
    sys::signal::{signal, SigHandler, SigSet, Signal},
    unistd::{execv, write},
};
use std::{
    env,
    ffi::{CString, OsStr},
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use which::which;

/// Exit status of a child whose `exec` failed.
pub const EXEC_FAILED: i32 = 127;

pub fn to_cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Replaces the current (freshly forked) process with `prog`.
///
/// The supervisor blocks SIGCHLD/SIGTERM/SIGINT and ignores SIGPIPE; both the
/// mask and ignored dispositions survive `exec`, so they are reset here first.
/// Never returns: on failure the child exits with [`EXEC_FAILED`].
pub fn exec_child(prog: &CString, argv: &[CString], failure: &[u8]) -> ! {
    let _ = SigSet::all().thread_unblock();
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }

    let _ = execv(prog, argv);

    let _ = write(io::stderr(), failure);
    unsafe { libc::_exit(EXEC_FAILED) }
}

/// Absolute path of the running program, used to start more supervisors.
pub fn resolve_self() -> PathBuf {
    let arg0 = env::args_os().next().map(PathBuf::from);
    let found = arg0.and_then(|arg0| {
        if arg0.components().count() > 1 {
            arg0.canonicalize().ok()
        } else {
            which(&arg0).ok()
        }
    });

    found
        .or_else(|| env::current_exe().ok())
        .unwrap_or_else(|| Path::new("dirsv").to_path_buf())
}
