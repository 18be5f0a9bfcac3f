//! Special-purpose register traffic. Every SPR lives in the PPCState
//! array, so these are plain moves; anything with side effects decodes as
//! interpreter-only upstream.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::analyzer::CodeOp;
use crate::cpu::{spr_offset, OFF_CR, OFF_MSR};
use crate::jit::{cur, Jit};

impl Jit {
    pub(super) fn emit_mfspr(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let offset = spr_offset(inst.spr_index());
        let d = self.gpr.bind_write(cur!(self), inst.rd());
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov Rd(d), [rbp + offset]);
    }

    pub(super) fn emit_mtspr(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let offset = spr_offset(inst.spr_index());
        if let Some(value) = self.gpr.imm_value(inst.rs()) {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov DWORD [rbp + offset], value as i32);
            return;
        }
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov [rbp + offset], Rd(s));
    }

    pub(super) fn emit_mfmsr(&mut self, op: &CodeOp) {
        let d = self.gpr.bind_write(cur!(self), op.inst.rd());
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov Rd(d), [rbp + OFF_MSR]);
    }

    pub(super) fn emit_mfcr(&mut self, op: &CodeOp) {
        let d = self.gpr.bind_write(cur!(self), op.inst.rd());
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov Rd(d), [rbp + OFF_CR]);
    }
}
