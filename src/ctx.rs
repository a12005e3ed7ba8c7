// Purpose: Architecture context slots and the external switch/start primitives.
// Inputs/Outputs: FiberCtx field order is ABI with the strandctx_*.asm files; both sides must change together.
// Invariants: After switching out and back, all caller-local state is bit-identical.
// Gotchas: strand_ctx_start is never called from Rust; it is only ever jumped into by a bootstrapped context.

use std::mem;

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[allow(dead_code)]
pub struct FiberCtx {
    rsp: u64,
    rip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[allow(dead_code)]
pub struct FiberCtx {
    sp: u64,
    pc: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    // d8-d15: AAPCS64 callee-saves the low 64 bits of these.
    d: [u64; 8],
}

unsafe extern "C" {
    /// Saves the callee-saved registers and stack pointer into `from`,
    /// restores them from `to`, and continues wherever `to` left off. A
    /// self-swap degenerates to a plain return.
    pub fn strand_ctx_swap(from: *mut FiberCtx, to: *mut FiberCtx);
    pub fn strand_ctx_start();
}

impl FiberCtx {
    pub fn zeroed() -> FiberCtx {
        unsafe { mem::zeroed() }
    }
}

/// Seeds `ctx` so the first switch into it begins executing
/// `strand_fiber_main(id)` on the stack whose highest usable address is
/// `stack_top`. The id travels in a callee-saved register (r12 / x19)
/// because those are the only slots the swap restores.
pub unsafe fn ctx_bootstrap(ctx: &mut FiberCtx, stack_top: usize, id: u64) {
    let top = (stack_top & !0xFusize) as u64;
    *ctx = FiberCtx::zeroed();
    #[cfg(target_arch = "x86_64")]
    {
        ctx.rsp = top;
        ctx.rip = strand_ctx_start as *const () as usize as u64;
        ctx.r12 = id;
    }
    #[cfg(target_arch = "aarch64")]
    {
        ctx.sp = top;
        ctx.pc = strand_ctx_start as *const () as usize as u64;
        ctx.x19 = id;
    }
}
