// Purpose: Non-blocking file helpers and subprocess stdout/stderr drainage.
// Inputs/Outputs: Paths and shell commands in; byte counts and exit codes out. All drains go through the park loop.
// Invariants: Child pipes are switched to non-blocking before any fiber parks on them.
// Gotchas: join() blocks the host thread in waitpid; drain the pipes first or a chatty child can fill them and stall.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, Command, Stdio};

use libc::{O_APPEND, O_CREAT, O_NONBLOCK, O_RDONLY, O_WRONLY};

use crate::net::{read_until, set_nonblocking, write_all};

/// Closes the wrapped fd on drop so early error returns cannot leak it.
struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn open_path(path: &str, flags: i32, mode: libc::c_uint) -> io::Result<RawFd> {
    let cpath = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Reads `path` into `buf` through the non-blocking park loop and returns
/// the byte count. Regular files report ready immediately; pipes and FIFOs
/// genuinely suspend the calling fiber.
pub fn read_file(path: &str, buf: &mut [u8]) -> io::Result<usize> {
    let fd = open_path(path, O_RDONLY | O_NONBLOCK, 0)?;
    let _guard = FdGuard(fd);
    read_until(fd, buf, b"")
}

/// Appends `buf` to `path`, creating it 0644 if missing, parking on
/// WouldBlock. Returns the byte count written.
pub fn write_file(path: &str, buf: &[u8]) -> io::Result<usize> {
    let fd = open_path(path, O_WRONLY | O_CREAT | O_APPEND | O_NONBLOCK, 0o644)?;
    let _guard = FdGuard(fd);
    write_all(fd, buf)
}

/// A shelled-out child whose stdout/stderr drain through the scheduler
/// instead of blocking the thread.
pub struct ChildProc {
    child: Child,
    out_fd: RawFd,
    err_fd: RawFd,
}

/// Runs `cmd` under `/bin/sh -c` with both output pipes captured and
/// switched to non-blocking mode.
pub fn subprocess(cmd: &str) -> io::Result<ChildProc> {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let out_fd = match child.stdout.as_ref() {
        Some(out) => out.as_raw_fd(),
        None => return Err(io::Error::other("child stdout not captured")),
    };
    let err_fd = match child.stderr.as_ref() {
        Some(err) => err.as_raw_fd(),
        None => return Err(io::Error::other("child stderr not captured")),
    };
    set_nonblocking(out_fd)?;
    set_nonblocking(err_fd)?;
    Ok(ChildProc {
        child,
        out_fd,
        err_fd,
    })
}

impl ChildProc {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdout_fd(&self) -> RawFd {
        self.out_fd
    }

    pub fn stderr_fd(&self) -> RawFd {
        self.err_fd
    }

    /// Drains child stdout until EOF or `buf` fills, parking between
    /// chunks. Returns the byte count.
    pub fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_until(self.out_fd, buf, b"")
    }

    /// Drains child stderr; same contract as `read_stdout`.
    pub fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_until(self.err_fd, buf, b"")
    }

    /// Waits for the child and returns its exit code (-1 if it died to a
    /// signal). This blocks the host thread, not just the calling fiber.
    pub fn join(mut self) -> io::Result<i32> {
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Kills the child, then reaps it.
    pub fn kill(mut self) -> io::Result<i32> {
        self.child.kill()?;
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}
