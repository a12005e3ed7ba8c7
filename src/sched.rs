// Purpose: Single-threaded cooperative fiber scheduler with readiness-driven suspension.
// Inputs/Outputs: Owns the fiber table and the runnable/parked/polls/retired sets; exposes spawn, yield, park, and main_loop.
// Invariants: Exactly one fiber runs at a time; parked and polls always have equal length with matching indices; fiber 0 never retires.
// Gotchas: Raw Sched pointers must not be cached across a context switch; re-read the thread-local on resume.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::OnceLock;

use libc::{EINTR, POLLRDNORM, POLLWRNORM, nfds_t, poll, pollfd};

use crate::ctx::{FiberCtx, ctx_bootstrap, strand_ctx_swap};
use crate::fatal;
use crate::region::{Region, region_alloc, region_realloc, region_release};
use crate::slice::Slice;
use crate::stack::{stack_alloc, stack_free, stack_size};

/// Raw entry signature: a function pointer plus an opaque argument. The
/// typed `spawn` wraps closures in this form.
pub type FiberFn = extern "C" fn(*mut c_void);

const FIBER_RUNNABLE: i32 = 0;
const FIBER_RUNNING: i32 = 1;
const FIBER_PARKED: i32 = 2;
const FIBER_RETIRED: i32 = 3;

struct Fiber {
    ctx: FiberCtx,
    stack_base: *mut c_void,
    stack_size: usize,
    region: *mut Region,
    entry: Option<FiberFn>,
    arg: *mut c_void,
    state: i32,
}

/// The scheduler. One instance per thread, reached through a thread-local
/// slot so user code never threads a handle around; the suspension
/// primitives cannot outlive it.
pub struct Sched {
    fibers: Slice<Fiber>,
    runnable: Slice<i32>,
    parked: Slice<i32>,
    polls: Slice<pollfd>,
    retired: Slice<i32>,
    current: usize,
}

impl Sched {
    fn new() -> Sched {
        let mut s = Sched {
            fibers: Slice::new(),
            runnable: Slice::new(),
            parked: Slice::new(),
            polls: Slice::new(),
            retired: Slice::new(),
            current: 0,
        };
        // Fiber 0 runs on the host thread's own stack: no mapping of its
        // own, and it never retires.
        s.fibers.append(Fiber {
            ctx: FiberCtx::zeroed(),
            stack_base: ptr::null_mut(),
            stack_size: 0,
            region: ptr::null_mut(),
            entry: None,
            arg: ptr::null_mut(),
            state: FIBER_RUNNING,
        });
        s.runnable.append(0);
        s
    }
}

impl Drop for Sched {
    fn drop(&mut self) {
        unsafe {
            for i in 0..self.fibers.len() {
                let f = &mut self.fibers[i];
                region_release(&mut f.region);
                if !f.stack_base.is_null() {
                    stack_free(f.stack_base, f.stack_size);
                    f.stack_base = ptr::null_mut();
                }
            }
        }
    }
}

struct SchedSlot(Cell<*mut Sched>);

impl Drop for SchedSlot {
    fn drop(&mut self) {
        let s = self.0.get();
        if !s.is_null() {
            self.0.set(ptr::null_mut());
            unsafe { drop(Box::from_raw(s)) };
        }
    }
}

thread_local! {
    static TLS_SCHED: SchedSlot = SchedSlot(Cell::new(ptr::null_mut()));
}

fn sched_get() -> *mut Sched {
    let s = TLS_SCHED.with(|slot| slot.0.get());
    if !s.is_null() {
        return s;
    }
    let boxed = Box::into_raw(Box::new(Sched::new()));
    TLS_SCHED.with(|slot| slot.0.set(boxed));
    boxed
}

fn trace_enabled() -> bool {
    static ON: OnceLock<bool> = OnceLock::new();
    *ON.get_or_init(|| std::env::var_os("STRAND_TRACE").is_some())
}

fn trace(args: fmt::Arguments<'_>) {
    if trace_enabled() {
        eprintln!("[strand] {args}");
    }
}

unsafe fn running_id(s: *mut Sched) -> i32 {
    (&(*s).runnable)[(*s).current]
}

/// Asks the kernel which parked fds have become ready and moves their
/// owners to the runnable tail in report order. Parked and polls shrink
/// together, so index i of one keeps naming index i of the other. Error
/// events (POLLERR/POLLHUP/POLLNVAL) also wake the owner; the fiber
/// observes the failure on its next syscall attempt.
unsafe fn poll_reap(s: *mut Sched, timeout: i32) {
    debug_assert_eq!((*s).parked.len(), (*s).polls.len());
    if (*s).polls.is_empty() {
        return;
    }
    loop {
        let rc = poll((*s).polls.as_mut_ptr(), (*s).polls.len() as nfds_t, timeout);
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(EINTR) {
            continue;
        }
        fatal(&format!("poll failed: {err}"));
    }
    let mut i = 0;
    while i < (*s).polls.len() {
        if (&(*s).polls)[i].revents != 0 {
            let id = (*s).parked.swap_remove(i);
            (*s).polls.swap_remove(i);
            (&mut (*s).fibers)[id as usize].state = FIBER_RUNNABLE;
            (*s).runnable.append(id);
            trace(format_args!("fiber {id} woke"));
        } else {
            i += 1;
        }
    }
}

/// Readiness reap, cursor normalisation, and the switch into the next
/// runnable fiber. `from` must be the fiber executing this call; its
/// context receives the saved state. The reap blocks only when nothing is
/// runnable, so a lone busy fiber is never stalled behind the kernel.
unsafe fn sched_continue(s: *mut Sched, from: i32) {
    let timeout = if (*s).runnable.is_empty() { -1 } else { 0 };
    poll_reap(s, timeout);
    if (*s).runnable.is_empty() {
        fatal("scheduler has nothing left to run");
    }
    (*s).current %= (*s).runnable.len();
    let next = (&(*s).runnable)[(*s).current];
    (&mut (*s).fibers)[next as usize].state = FIBER_RUNNING;
    let fibers = (*s).fibers.as_mut_ptr();
    strand_ctx_swap(
        &raw mut (*fibers.add(from as usize)).ctx,
        &raw mut (*fibers.add(next as usize)).ctx,
    );
}

/// Starts a fiber running `entry(arg)`. Retired ids are recycled LIFO and
/// keep their stack mapping; otherwise a fresh guard-paged stack is
/// mapped. The new fiber joins the runnable tail; it first runs at the
/// spawner's next suspension point.
pub fn spawn_raw(entry: FiberFn, arg: *mut c_void) -> i32 {
    unsafe {
        let s = sched_get();
        let id = if (*s).retired.is_empty() {
            let usable = stack_size();
            let base = stack_alloc(usable);
            (*s).fibers.append(Fiber {
                ctx: FiberCtx::zeroed(),
                stack_base: base,
                stack_size: usable,
                region: ptr::null_mut(),
                entry: None,
                arg: ptr::null_mut(),
                state: FIBER_RUNNABLE,
            });
            ((*s).fibers.len() - 1) as i32
        } else {
            let last = (*s).retired.len() - 1;
            (*s).retired.swap_remove(last)
        };
        let f = &mut (&mut (*s).fibers)[id as usize];
        f.entry = Some(entry);
        f.arg = arg;
        f.state = FIBER_RUNNABLE;
        let top = f.stack_base as usize + f.stack_size;
        ctx_bootstrap(&mut f.ctx, top, id as u64);
        (*s).runnable.append(id);
        trace(format_args!("spawned fiber {id}"));
        id
    }
}

/// Closure front door over `spawn_raw`.
pub fn spawn<F>(f: F) -> i32
where
    F: FnOnce() + 'static,
{
    extern "C" fn run_boxed<F: FnOnce()>(arg: *mut c_void) {
        let f = unsafe { Box::from_raw(arg as *mut F) };
        f();
    }
    spawn_raw(run_boxed::<F>, Box::into_raw(Box::new(f)) as *mut c_void)
}

/// Entry point the bootstrap trampoline jumps to on a fiber's first
/// switch-in: runs the recorded entry function, then retires the fiber.
/// Referenced by symbol from the strandctx assembly; never call it.
#[unsafe(no_mangle)]
pub extern "C" fn strand_fiber_main(id: u64) -> ! {
    unsafe {
        let s = sched_get();
        let entry = match (&mut (*s).fibers)[id as usize].entry.take() {
            Some(f) => f,
            None => fatal("fiber started without an entry function"),
        };
        let arg = (&(*s).fibers)[id as usize].arg;
        entry(arg);
        fiber_retire(s)
    }
}

/// Terminal path of a fiber whose entry function returned: the region is
/// released, the id recycled, and the next fiber resumed. Never returns.
unsafe fn fiber_retire(s: *mut Sched) -> ! {
    let id = running_id(s);
    if id == 0 {
        fatal("fiber 0 must never retire");
    }
    trace(format_args!("fiber {id} retired"));
    region_release(&mut (&mut (*s).fibers)[id as usize].region);
    (&mut (*s).fibers)[id as usize].state = FIBER_RETIRED;
    (*s).retired.append(id);
    (*s).runnable.swap_remove((*s).current);
    poll_reap(s, 0);
    if (*s).runnable.is_empty() && !(*s).parked.is_empty() {
        // Nothing runnable: promote the head of the parked list rather
        // than sit on a dead scheduler. A spurious wake is harmless; the
        // fiber retries its syscall and parks again on EAGAIN.
        let pid = (*s).parked.swap_remove(0);
        (*s).polls.swap_remove(0);
        (&mut (*s).fibers)[pid as usize].state = FIBER_RUNNABLE;
        (*s).runnable.append(pid);
    }
    if (*s).runnable.is_empty() {
        fatal("all fibers retired");
    }
    (*s).current %= (*s).runnable.len();
    let next = (&(*s).runnable)[(*s).current];
    (&mut (*s).fibers)[next as usize].state = FIBER_RUNNING;
    let fibers = (*s).fibers.as_mut_ptr();
    strand_ctx_swap(
        &raw mut (*fibers.add(id as usize)).ctx,
        &raw mut (*fibers.add(next as usize)).ctx,
    );
    unreachable!("retired fiber resumed");
}

/// Gives up the CPU. The calling fiber stays runnable; it runs again once
/// the fibers after it in the rotation have had their turn.
pub fn yield_now() {
    unsafe {
        let s = sched_get();
        let id = running_id(s);
        (&mut (*s).fibers)[id as usize].state = FIBER_RUNNABLE;
        (*s).current += 1;
        sched_continue(s, id);
    }
}

/// Parks the calling fiber until `fd` is readable. Level-triggered:
/// readiness is a hint, not a guarantee, so callers loop on EAGAIN.
pub fn park_read(fd: RawFd) {
    park_on(fd, POLLRDNORM);
}

/// Parks the calling fiber until `fd` is writable.
pub fn park_write(fd: RawFd) {
    park_on(fd, POLLWRNORM);
}

fn park_on(fd: RawFd, events: i16) {
    unsafe {
        let s = sched_get();
        let id = running_id(s);
        (*s).polls.append(pollfd {
            fd,
            events,
            revents: 0,
        });
        (*s).parked.append(id);
        (&mut (*s).fibers)[id as usize].state = FIBER_PARKED;
        (*s).runnable.swap_remove((*s).current);
        trace(format_args!("fiber {id} parked on fd {fd}"));
        sched_continue(s, id);
    }
}

/// Runs the scheduler until only fiber 0 remains runnable and nothing is
/// parked. Applications call this once their initial fibers are spawned.
pub fn main_loop() -> i32 {
    unsafe {
        let s = sched_get();
        while (*s).runnable.len() > 1 || !(*s).parked.is_empty() {
            yield_now();
        }
    }
    0
}

/// Id of the running fiber; 0 on the initial fiber.
pub fn current_id() -> i32 {
    unsafe {
        let s = sched_get();
        running_id(s)
    }
}

/// Fibers not yet retired, the initial fiber included.
pub fn live_count() -> usize {
    unsafe {
        let s = sched_get();
        (*s).fibers.len() - (*s).retired.len()
    }
}

/// Allocates from the running fiber's region; the memory lives until that
/// fiber retires. Never returns null (out-of-memory aborts).
pub fn alloc(size: usize) -> *mut u8 {
    unsafe {
        let s = sched_get();
        let id = running_id(s);
        region_alloc(&mut (&mut (*s).fibers)[id as usize].region, size)
    }
}

/// Regrows a block from `alloc`. Region blocks carry no headers, so the
/// caller supplies the old size; see `region_realloc` for the in-place
/// versus copy policy.
pub fn reallocate(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    unsafe {
        let s = sched_get();
        let id = running_id(s);
        region_realloc(&mut (&mut (*s).fibers)[id as usize].region, ptr, old_size, new_size)
    }
}

/// Formats into the running fiber's region; the returned text is valid
/// until the fiber retires.
pub fn sprintf(args: fmt::Arguments<'_>) -> *const str {
    let text = fmt::format(args);
    let dst = alloc(text.len());
    unsafe {
        ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
        ptr::slice_from_raw_parts(dst, text.len()) as *const str
    }
}

/// Tears down the calling thread's scheduler: every fiber stack is
/// unmapped and every region released, parked fibers included. Only legal
/// from fiber 0. The next runtime call starts a fresh scheduler; without
/// an explicit call, teardown runs when the owning thread exits.
pub fn shutdown() {
    let s = TLS_SCHED.with(|slot| {
        let p = slot.0.get();
        slot.0.set(ptr::null_mut());
        p
    });
    if s.is_null() {
        return;
    }
    unsafe {
        if running_id(s) != 0 {
            fatal("shutdown must be called from fiber 0");
        }
        drop(Box::from_raw(s));
    }
}
