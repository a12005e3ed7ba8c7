// Purpose: Non-blocking TCP helpers built on the suspension primitives.
// Inputs/Outputs: Raw fds in, raw fds out; accepted connections are handed to handler fibers already in non-blocking mode.
// Invariants: After a readiness wakeup the syscall is always retried; readiness is a hint, not a guarantee.
// Gotchas: Callers must put an fd into non-blocking mode before parking on it; a blocking fd would stall the whole runtime.

use std::ffi::c_void;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{IntoRawFd, RawFd};
use std::ptr;

use libc::{F_GETFL, F_SETFL, O_NONBLOCK};
use socket2::{Domain, Protocol, Socket, Type};

use crate::sched::{park_read, park_write, spawn, yield_now};

/// Puts an fd into non-blocking mode. Required before parking on it.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Binds a non-blocking IPv4 listener on all interfaces. Port 0 picks an
/// ephemeral port; the resolved port is returned alongside the raw fd.
pub fn tcp_bind(port: u16) -> io::Result<(RawFd, u16)> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    sock.bind(&addr.into())?;
    sock.listen(128)?;
    sock.set_nonblocking(true)?;
    let bound = sock
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .unwrap_or(port);
    Ok((sock.into_raw_fd(), bound))
}

/// Parks on the listener until connections arrive, drains the accept
/// queue, and spawns `handler` on each connection (switched to
/// non-blocking first). Yields after each spawn so handlers start promptly
/// even under an accept burst.
pub fn tcp_accept_loop(fd: RawFd, handler: fn(RawFd)) -> io::Result<()> {
    loop {
        park_read(fd);
        loop {
            let conn = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
            if conn < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted => continue,
                    _ => return Err(err),
                }
            }
            set_nonblocking(conn)?;
            spawn(move || handler(conn));
            yield_now();
        }
    }
}

/// `tcp_bind` + `tcp_accept_loop`: serve `handler` on `port` forever.
pub fn tcp_listen(port: u16, handler: fn(RawFd)) -> io::Result<()> {
    let (fd, _) = tcp_bind(port)?;
    tcp_accept_loop(fd, handler)
}

/// Reads until `delim` appears in the filled bytes, the buffer fills, or
/// the peer closes (an empty delimiter reads to EOF or a full buffer).
/// WouldBlock parks the fiber until the fd reports readable, then the read
/// is retried. Returns the number of bytes filled; 0 means EOF before any
/// data.
pub fn read_until(fd: RawFd, buf: &mut [u8], delim: &[u8]) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut c_void,
                buf.len() - total,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    park_read(fd);
                    continue;
                }
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        if n == 0 {
            break;
        }
        total += n as usize;
        if !delim.is_empty() && buf[..total].windows(delim.len()).any(|w| w == delim) {
            break;
        }
    }
    Ok(total)
}

/// Writes the whole buffer, parking on WouldBlock until the fd reports
/// writable. Returns the byte count written.
pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[total..].as_ptr() as *const c_void,
                buf.len() - total,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    park_write(fd);
                    continue;
                }
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        total += n as usize;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{live_count, yield_now};
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn echo_handler(fd: RawFd) {
        let mut buf = [0u8; 1024];
        loop {
            let n = match read_until(fd, &mut buf, b"\n") {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 || &buf[..n] == b"quit\n" {
                break;
            }
            if write_all(fd, &buf[..n]).is_err() {
                break;
            }
        }
        unsafe { libc::close(fd) };
    }

    /// Drives the scheduler from fiber 0 until `cond` holds; panics if it
    /// never does.
    fn drive_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..5_000_000u64 {
            if cond() {
                return;
            }
            yield_now();
        }
        panic!("runtime made no progress");
    }

    #[test]
    fn tcp_bind_resolves_an_ephemeral_port() {
        let (fd, port) = tcp_bind(0).expect("bind");
        assert_ne!(port, 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn set_nonblocking_rejects_a_bad_fd() {
        assert!(set_nonblocking(-1).is_err());
    }

    #[test]
    fn echo_server_serves_a_single_client() {
        let (fd, port) = tcp_bind(0).expect("bind");
        crate::sched::spawn(move || {
            let _ = tcp_accept_loop(fd, echo_handler);
        });
        let client = thread::spawn(move || {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            for line in ["hello\n", "world\n"] {
                conn.write_all(line.as_bytes()).expect("send");
                let mut echo = vec![0u8; line.len()];
                conn.read_exact(&mut echo).expect("echo");
                assert_eq!(echo, line.as_bytes());
            }
            conn.write_all(b"quit\n").expect("send quit");
            let mut rest = Vec::new();
            let n = conn.read_to_end(&mut rest).expect("close");
            assert_eq!(n, 0);
        });
        drive_until(|| client.is_finished() && live_count() == 2);
        client.join().expect("client");
        // listener + fiber 0 remain
        assert_eq!(live_count(), 2);
        crate::sched::shutdown();
    }

    #[test]
    fn two_clients_interleave_fairly() {
        let (fd, port) = tcp_bind(0).expect("bind");
        crate::sched::spawn(move || {
            let _ = tcp_accept_loop(fd, echo_handler);
        });
        let spawn_client = |tag: u8| {
            thread::spawn(move || {
                let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
                for round in 0..2u8 {
                    let line = [tag, b'0' + round, b'\n'];
                    conn.write_all(&line).expect("send");
                    let mut echo = [0u8; 3];
                    // The next round is only sent once this round's echo
                    // arrived, so both clients finishing proves neither
                    // connection starved the other.
                    conn.read_exact(&mut echo).expect("echo");
                    assert_eq!(echo, line);
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };
        let c1 = spawn_client(b'a');
        let c2 = spawn_client(b'b');
        drive_until(|| c1.is_finished() && c2.is_finished());
        c1.join().expect("client a");
        c2.join().expect("client b");
        drive_until(|| live_count() == 2);
        crate::sched::shutdown();
    }

    #[test]
    fn busy_counter_and_listener_share_the_runtime() {
        let (fd, port) = tcp_bind(0).expect("bind");
        crate::sched::spawn(move || {
            let _ = tcp_accept_loop(fd, echo_handler);
        });
        let count = Rc::new(Cell::new(0u32));
        let c = count.clone();
        crate::sched::spawn(move || {
            for i in 1..=1000 {
                c.set(i);
                yield_now();
            }
        });
        let client = thread::spawn(move || {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            conn.write_all(b"ping\n").expect("send");
            let mut echo = [0u8; 5];
            conn.read_exact(&mut echo).expect("echo");
            assert_eq!(&echo, b"ping\n");
        });
        drive_until(|| client.is_finished() && count.get() == 1000 && live_count() == 2);
        client.join().expect("client");
        crate::sched::shutdown();
    }
}
