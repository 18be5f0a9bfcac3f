//! Fastmem backpatching.
//!
//! Emitted loads and stores hit guest memory directly through the logical
//! window in `rbx`, with the effective address materialized in `rax`. When
//! such an access faults, the handler looks up the site here, generates a
//! trampoline that performs the slow path, patches the original access
//! into a jump to it, and resumes inside the trampoline.

use std::collections::HashMap;

use dynasm::dynasm;
use dynasmrt::DynasmApi;
use smallvec::SmallVec;

use crate::jit::emitter::{patch_jmp, Emitter};

/// Host register state at the fault, by x86-64 register number.
#[derive(Debug, Clone)]
pub struct FaultCtx {
    pub rip: usize,
    pub regs: [u64; 16],
}

/// One backpatchable fastmem site, recorded at emit time.
#[derive(Debug, Clone)]
pub struct TrampolineInfo {
    /// First byte of the access sequence (what gets overwritten).
    pub start: usize,
    /// Bytes covered by the sequence, >= 5.
    pub len: u8,
    /// Guest address of the faulting instruction.
    pub pc: u32,
    pub access_size: u8,
    pub is_store: bool,
    /// Loads: host register receiving the value.
    pub dest_reg: u8,
    /// Stores: host register holding the natural (unswapped) value.
    pub value_reg: u8,
    pub sign_extend: bool,
    /// Caller-saved host registers live across the access (excluding the
    /// load destination).
    pub registers_in_use: SmallVec<[u8; 8]>,
    /// xmm registers holding live paired-single bindings.
    pub xmm_in_use: SmallVec<[u8; 8]>,
    /// Displacement folded into the address register, to undo on retry.
    /// This backend always computes the address into scratch, so the undo
    /// never triggers, but the fault handler honors it when set.
    pub offset: i32,
    pub offset_added_to_address: bool,
    /// Address register to apply the offset undo to.
    pub op_reg_operand: u8,
    /// Stores that byte-swapped the source register in place before
    /// faulting; the handler swaps it back so the retry is idempotent.
    pub non_atomic_swap_store_src: Option<u8>,
    /// Filled on first fault; later faults reuse it.
    pub trampoline: Option<usize>,
}

#[derive(Default)]
pub struct BackPatchInfo {
    /// Keyed by the host address of the *faulting* instruction.
    sites: HashMap<usize, TrampolineInfo>,
}

impl BackPatchInfo {
    pub fn insert(&mut self, fault_ip: usize, info: TrampolineInfo) {
        self.sites.insert(fault_ip, info);
    }

    pub fn get_mut(&mut self, fault_ip: usize) -> Option<&mut TrampolineInfo> {
        self.sites.get_mut(&fault_ip)
    }

    pub fn clear(&mut self) {
        self.sites.clear();
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Slow-path helper set the trampolines call into; addresses of
/// `extern "C" fn(*mut EmuCtx, u32 [, u64]) -> u64` style functions.
#[derive(Debug, Clone, Copy)]
pub struct SlowMemHelpers {
    pub read_u8: usize,
    pub read_u16: usize,
    pub read_u32: usize,
    pub read_u64: usize,
    pub write_u8: usize,
    pub write_u16: usize,
    pub write_u32: usize,
    pub write_u64: usize,
}

impl SlowMemHelpers {
    fn read_for(&self, size: u8) -> usize {
        match size {
            1 => self.read_u8,
            2 => self.read_u16,
            4 => self.read_u32,
            _ => self.read_u64,
        }
    }

    fn write_for(&self, size: u8) -> usize {
        match size {
            1 => self.write_u8,
            2 => self.write_u16,
            4 => self.write_u32,
            _ => self.write_u64,
        }
    }
}

/// Emits the slow-path trampoline for `info` into `e` (the trampoline
/// child region) and returns its entry.
///
/// Contract with the patched site: the guest effective address is in rax,
/// rsp is at the block-entry alignment, and the code jumps back to the
/// first instruction after the original access sequence.
pub fn generate_trampoline(e: &mut Emitter, info: &TrampolineInfo, helpers: &SlowMemHelpers) -> usize {
    let entry = e.current();
    let resume = info.start + info.len as usize;

    if info.is_store {
        let target = helpers.write_for(info.access_size);
        let value_reg = info.value_reg;
        e.abi_call_with_xmm(&info.registers_in_use, &info.xmm_in_use, target, |e| {
            // Value first: esi/rdi may alias the register holding it.
            if info.access_size == 8 {
                dynasm!(e ; .arch x64 ; mov rdx, Rq(value_reg));
            } else {
                dynasm!(e ; .arch x64 ; mov edx, Rd(value_reg));
            }
            dynasm!(e
                ; .arch x64
                ; mov esi, eax
                ; mov rdi, r14
            );
        });
    } else {
        let target = helpers.read_for(info.access_size);
        e.abi_call_with_xmm(&info.registers_in_use, &info.xmm_in_use, target, |e| {
            dynasm!(e
                ; .arch x64
                ; mov esi, eax
                ; mov rdi, r14
            );
        });
        // Result comes back zero-extended in rax.
        let dest = info.dest_reg;
        match (info.access_size, info.sign_extend) {
            (8, _) => dynasm!(e ; .arch x64 ; mov Rq(dest), rax),
            (2, true) => dynasm!(e ; .arch x64 ; movsx Rd(dest), ax),
            (1, true) => dynasm!(e ; .arch x64 ; movsx Rd(dest), al),
            _ => dynasm!(e ; .arch x64 ; mov Rd(dest), eax),
        }
    }

    e.jmp(resume);
    entry
}

/// Applies the in-place patch: the original access becomes a jump to the
/// trampoline and the leftover bytes become trap opcodes.
pub fn patch_site(info: &TrampolineInfo, trampoline: usize) {
    patch_jmp(info.start, trampoline);
    for i in 5..info.len as usize {
        // SAFETY: inside the access sequence we emitted.
        unsafe {
            std::ptr::write((info.start + i) as *mut u8, 0xCC);
        }
    }
}

/// Undo steps that make the retry idempotent, applied to the interrupted
/// context before it resumes in the trampoline.
pub fn undo_partial_effects(info: &TrampolineInfo, ctx: &mut FaultCtx) {
    if let Some(reg) = info.non_atomic_swap_store_src {
        let value = &mut ctx.regs[reg as usize];
        *value = match info.access_size {
            1 => *value,
            2 => (*value as u16).swap_bytes() as u64,
            4 => (*value as u32).swap_bytes() as u64,
            _ => (*value).swap_bytes(),
        };
    }
    if info.offset_added_to_address {
        let reg = &mut ctx.regs[info.op_reg_operand as usize];
        *reg = reg.wrapping_sub(info.offset as i64 as u64);
    }
}

/// Minimum bytes a fastmem site must span so the jump fits.
pub const BACKPATCH_MIN_SIZE: usize = 5;

/// Convenience used by the emitters: pads the site out to the minimum
/// patchable size.
pub fn pad_site(e: &mut Emitter, start: usize) -> u8 {
    let end = start + BACKPATCH_MIN_SIZE;
    e.nop_fill(end);
    (e.current() - start) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn swap_undo_round_trips() {
        let mut ctx = FaultCtx {
            rip: 0,
            regs: [0; 16],
        };
        ctx.regs[6] = 0xDDCC_BBAAu64;
        let info = TrampolineInfo {
            start: 0,
            len: 6,
            pc: 0,
            access_size: 4,
            is_store: true,
            dest_reg: 0,
            value_reg: 6,
            sign_extend: false,
            registers_in_use: SmallVec::new(),
            xmm_in_use: SmallVec::new(),
            offset: 0,
            offset_added_to_address: false,
            op_reg_operand: 0,
            non_atomic_swap_store_src: Some(6),
            trampoline: None,
        };
        undo_partial_effects(&info, &mut ctx);
        assert_eq!(ctx.regs[6], 0xAABB_CCDD);
    }

    #[test]
    fn offset_undo_applies_when_flagged() {
        let mut ctx = FaultCtx {
            rip: 0,
            regs: [0; 16],
        };
        ctx.regs[8] = 0x8000_1000;
        let mut info = TrampolineInfo {
            start: 0,
            len: 5,
            pc: 0,
            access_size: 4,
            is_store: false,
            dest_reg: 9,
            value_reg: 0,
            sign_extend: false,
            registers_in_use: SmallVec::new(),
            xmm_in_use: SmallVec::new(),
            offset: 0x20,
            offset_added_to_address: false,
            op_reg_operand: 8,
            non_atomic_swap_store_src: None,
            trampoline: None,
        };
        undo_partial_effects(&info, &mut ctx);
        assert_eq!(ctx.regs[8], 0x8000_1000);
        info.offset_added_to_address = true;
        undo_partial_effects(&info, &mut ctx);
        assert_eq!(ctx.regs[8], 0x8000_0FE0);
    }
}
