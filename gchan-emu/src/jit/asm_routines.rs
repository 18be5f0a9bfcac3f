//! The hand-written entry/dispatch stubs every block runs under.
//!
//! Register contract inside emitted code:
//!   rbp  PPCState base
//!   r14  EmuCtx base
//!   rbx  fastmem logical base
//!   rax, rdx  scratch
//!
//! Blocks are entered by `jmp` with rsp % 16 == 0. BL exits push the guest
//! return address as a prediction hint and `call`, so the invariant
//! survives (16 bytes per prediction frame).

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::jit::code_region::CodeRegion;
use crate::jit::emitter::{Cond, Emitter};
use crate::{CTX_OFF_LOGICAL_BASE, CTX_OFF_PPC, CTX_OFF_SAVED_RSP, CTX_OFF_STACK_TOP};

/// extern "C" fn(*mut EmuCtx) -> *const u8; null means leave enter_code.
pub type DispatchFn = usize;
/// extern "C" fn(*mut EmuCtx).
pub type TimingFn = usize;

#[derive(Debug, Default, Clone, Copy)]
pub struct AsmRoutines {
    pub enter_code: usize,
    pub dispatcher: usize,
    pub dispatcher_no_check: usize,
    pub dispatcher_no_timing_check: usize,
    pub dispatcher_mispredicted_blr: usize,
    pub do_timing: usize,
}

impl AsmRoutines {
    pub fn emit(region: &mut CodeRegion, dispatch_fn: DispatchFn, timing_fn: TimingFn) -> Self {
        let downcount = crate::cpu::OFF_DOWNCOUNT;
        let span = region.alloc_routines(512);
        let mut e = Emitter::new(span.0, span.1);

        let enter_code = e.current();
        dynasm!(e
            ; .arch x64
            ; push rbp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, 8
            ; mov r14, rdi
            ; mov [r14 + CTX_OFF_SAVED_RSP], rsp
            ; mov rbp, [r14 + CTX_OFF_PPC]
            ; mov rbx, [r14 + CTX_OFF_LOGICAL_BASE]
            ; mov rax, [r14 + CTX_OFF_STACK_TOP]
            ; test rax, rax
        );
        let no_stack = e.jcc_fixup(Cond::Zero);
        dynasm!(e ; .arch x64 ; mov rsp, rax);
        e.set_jump_target(no_stack);

        let dispatcher = e.current();
        dynasm!(e
            ; .arch x64
            ; cmp DWORD [rbp + downcount], 0
        );
        let skip_timing = e.jcc_fixup(Cond::Greater);
        dynasm!(e ; .arch x64 ; mov rdi, r14);
        e.call_abs(timing_fn);
        e.set_jump_target(skip_timing);

        // The exception check lives in the dispatch slow path, so the
        // no-timing and no-check entries coincide.
        let dispatcher_no_timing_check = e.current();
        let dispatcher_no_check = e.current();
        dynasm!(e ; .arch x64 ; mov rdi, r14);
        e.call_abs(dispatch_fn);
        dynasm!(e ; .arch x64 ; test rax, rax);
        let leave = e.jcc_fixup(Cond::Zero);
        dynasm!(e ; .arch x64 ; jmp rax);

        e.set_jump_target(leave);
        dynasm!(e
            ; .arch x64
            ; mov rsp, [r14 + CTX_OFF_SAVED_RSP]
            ; add rsp, 8
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; ret
        );

        // Jumped to (never called) by block exits when the downcount ran
        // out; advances host timing and re-dispatches.
        let do_timing = e.current();
        dynasm!(e ; .arch x64 ; mov rdi, r14);
        e.call_abs(timing_fn);
        e.jmp(dispatcher_no_check);

        // The BLR prediction missed: the emulation stack holds stale
        // frames, so rewind it wholesale and re-dispatch.
        let dispatcher_mispredicted_blr = e.current();
        dynasm!(e
            ; .arch x64
            ; mov rax, [r14 + CTX_OFF_STACK_TOP]
            ; test rax, rax
        );
        let keep_rsp = e.jcc_fixup(Cond::Zero);
        dynasm!(e ; .arch x64 ; mov rsp, rax);
        e.set_jump_target(keep_rsp);
        e.jmp(dispatcher);

        assert!(!e.has_write_failed(), "routines region too small");

        Self {
            enter_code,
            dispatcher,
            dispatcher_no_check,
            dispatcher_no_timing_check,
            dispatcher_mispredicted_blr,
            do_timing,
        }
    }
}
