// Purpose: Define the crate-level surface of the fiber runtime core.
// Inputs/Outputs: Re-exports the scheduler, suspension primitives, and the non-blocking I/O helpers built on them.
// Invariants: All scheduler state is thread-local; every public call binds to the calling thread's runtime.
// Gotchas: Pointers returned by the per-fiber allocator die when the owning fiber retires.

#![allow(unsafe_op_in_unsafe_fn)]

pub mod ctx;
pub mod net;
pub mod os;
pub mod region;
pub mod sched;
pub mod slice;
pub mod stack;

pub use net::{read_until, set_nonblocking, tcp_accept_loop, tcp_bind, tcp_listen, write_all};
pub use os::{ChildProc, read_file, subprocess, write_file};
pub use sched::{
    alloc, current_id, live_count, main_loop, park_read, park_write, reallocate, shutdown, spawn,
    spawn_raw, sprintf, yield_now,
};

/// Diagnostic-and-abort path for states the runtime cannot continue from:
/// table OOM, stack mapping failure, a poll error that is not EINTR, or a
/// broken scheduler invariant. Expected failures never come through here.
pub(crate) fn fatal(msg: &str) -> ! {
    eprintln!("[strand] fatal: {msg}");
    std::process::abort();
}

pub(crate) fn env_usize_clamp(name: &str, defv: usize, lo: usize, hi: usize) -> usize {
    if let Ok(val) = std::env::var(name) {
        if let Ok(v) = val.parse::<usize>() {
            if v > 0 {
                return v.clamp(lo, hi);
            }
        }
    }
    defv
}
