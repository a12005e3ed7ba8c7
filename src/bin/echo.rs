// Purpose: Demo binary: two counter fibers interleaving with a TCP line-echo server on one runtime.
// Inputs/Outputs: Listens on 9091 (or $STRAND_ECHO_PORT); echoes each line back, "quit" closes the connection.
// Invariants: Everything runs on one thread; the counters keep advancing while connections are idle.
// Gotchas: The listener parks forever, so main_loop only returns if the process is killed.

use std::os::fd::RawFd;

use anyhow::{Context, Result};

use strand::{main_loop, read_until, spawn, tcp_accept_loop, tcp_bind, write_all, yield_now};

fn echo_handler(fd: RawFd) {
    let mut buf = [0u8; 1024];
    loop {
        let n = match read_until(fd, &mut buf, b"\n") {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                eprintln!("echo: read failed: {err}");
                break;
            }
        };
        let line = String::from_utf8_lossy(&buf[..n]);
        if line.trim() == "quit" {
            break;
        }
        if let Err(err) = write_all(fd, &buf[..n]) {
            eprintln!("echo: write failed: {err}");
            break;
        }
    }
    unsafe { libc::close(fd) };
}

fn counter(limit: u32) {
    for i in 0..=limit {
        println!("count to {limit}: {i}");
        yield_now();
    }
}

fn main() -> Result<()> {
    let port = std::env::var("STRAND_ECHO_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(9091);
    let (fd, port) = tcp_bind(port).context("bind echo listener")?;
    println!("echo server listening on 127.0.0.1:{port}");
    spawn(|| counter(10));
    spawn(|| counter(20));
    spawn(move || {
        if let Err(err) = tcp_accept_loop(fd, echo_handler) {
            eprintln!("listener failed: {err}");
        }
    });
    main_loop();
    Ok(())
}
