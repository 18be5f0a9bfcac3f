//! Branch emitters and the block terminators they reach.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::analyzer::CodeOp;
use crate::cpu::{spr_offset, EXCEPTION_SYSCALL, OFF_CR, OFF_EXCEPTIONS, OFF_PC, SPR_CTR, SPR_LR};
use crate::jit::emitter::{Cond, FixupBranch};
use crate::jit::{cur, Jit};

const BO_DONT_DECREMENT: u32 = 0x4;
const BO_BRANCH_IF_CTR_ZERO: u32 = 0x2;
const BO_DONT_CHECK_CONDITION: u32 = 0x10;
const BO_BRANCH_IF_TRUE: u32 = 0x8;

impl Jit {
    fn emit_set_lr(&mut self, value: u32) {
        let lr = spr_offset(SPR_LR);
        let e = cur!(self);
        dynasm!(e
            ; .arch x64
            ; mov DWORD [rbp + lr], value as i32
        );
    }

    /// Conditional-branch guards: emits the CTR decrement and condition
    /// test, returning the fixups that skip the taken path.
    fn emit_branch_guards(&mut self, op: &CodeOp, decrement_ctr: bool) -> Vec<FixupBranch> {
        let inst = op.inst;
        let bo = inst.bo();
        let mut skips = Vec::new();

        if decrement_ctr && bo & BO_DONT_DECREMENT == 0 {
            let ctr = spr_offset(SPR_CTR);
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; sub DWORD [rbp + ctr], 1
            );
            let cond = if bo & BO_BRANCH_IF_CTR_ZERO != 0 {
                Cond::NotZero
            } else {
                Cond::Zero
            };
            skips.push(e.jcc_fixup(cond));
        }

        if bo & BO_DONT_CHECK_CONDITION == 0 {
            let bit = (0x8000_0000u32 >> inst.bi()) as i32;
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; test DWORD [rbp + OFF_CR], bit
            );
            let cond = if bo & BO_BRANCH_IF_TRUE != 0 {
                Cond::Zero
            } else {
                Cond::NotZero
            };
            skips.push(e.jcc_fixup(cond));
        }

        skips
    }

    fn emit_not_taken_fallthrough(&mut self, op: &CodeOp, skips: Vec<FixupBranch>) {
        for skip in skips {
            let e = cur!(self);
            e.set_jump_target(skip);
        }
        if self.js.is_last_instruction {
            self.gpr.flush(cur!(self));
            self.fpr.flush(cur!(self));
            self.write_exit(op.address.wrapping_add(4), false, 0);
        }
    }

    pub(super) fn emit_bx(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let dest = op.branch_to.expect("b has a static destination");

        if inst.lk() {
            self.emit_set_lr(op.address.wrapping_add(4));
        }

        if op.branch_followed {
            // The analyzer inlined the destination; for bl, keep the BLR
            // prediction stack coherent.
            if inst.lk() {
                self.fake_bl_call(op.address.wrapping_add(4));
            }
            return;
        }

        self.flush_carry();
        self.gpr.flush(cur!(self));
        self.fpr.flush(cur!(self));

        if op.is_idle_branch() {
            self.write_idle_exit(dest);
        } else {
            self.write_exit(dest, inst.lk(), op.address.wrapping_add(4));
        }
    }

    pub(super) fn emit_bcx(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let dest = op.branch_to.expect("bc has a static destination");

        self.flush_carry();
        let skips = self.emit_branch_guards(op, true);

        {
            let gpr_snapshot = self.gpr.snapshot();
            let fpr_snapshot = self.fpr.snapshot();
            self.gpr.flush(cur!(self));
            self.fpr.flush(cur!(self));
            if inst.lk() {
                self.emit_set_lr(op.address.wrapping_add(4));
            }
            self.write_exit(dest, inst.lk(), op.address.wrapping_add(4));
            self.gpr.restore(gpr_snapshot);
            self.fpr.restore(fpr_snapshot);
        }

        self.emit_not_taken_fallthrough(op, skips);
    }

    pub(super) fn emit_bclrx(&mut self, op: &CodeOp) {
        let inst = op.inst;

        self.flush_carry();
        let skips = self.emit_branch_guards(op, true);

        {
            let gpr_snapshot = self.gpr.snapshot();
            let fpr_snapshot = self.fpr.snapshot();
            self.gpr.flush(cur!(self));
            self.fpr.flush(cur!(self));
            let lr = spr_offset(SPR_LR);
            {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, [rbp + lr]
                    ; and eax, -4
                );
            }
            if inst.lk() {
                self.emit_set_lr(op.address.wrapping_add(4));
            }
            self.write_blr_exit();
            self.gpr.restore(gpr_snapshot);
            self.fpr.restore(fpr_snapshot);
        }

        self.emit_not_taken_fallthrough(op, skips);
    }

    pub(super) fn emit_bcctrx(&mut self, op: &CodeOp) {
        let inst = op.inst;

        self.flush_carry();
        // bcctr never decrements CTR.
        let skips = self.emit_branch_guards(op, false);

        {
            let gpr_snapshot = self.gpr.snapshot();
            let fpr_snapshot = self.fpr.snapshot();
            self.gpr.flush(cur!(self));
            self.fpr.flush(cur!(self));
            if inst.lk() {
                self.emit_set_lr(op.address.wrapping_add(4));
            }
            let ctr = spr_offset(SPR_CTR);
            {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, [rbp + ctr]
                    ; and eax, -4
                );
            }
            self.write_exit_dest_in_eax();
            self.gpr.restore(gpr_snapshot);
            self.fpr.restore(fpr_snapshot);
        }

        self.emit_not_taken_fallthrough(op, skips);
    }

    pub(super) fn emit_sc(&mut self, op: &CodeOp) {
        self.flush_carry();
        self.gpr.flush(cur!(self));
        self.fpr.flush(cur!(self));
        let after = op.address.wrapping_add(4);
        {
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; or DWORD [rbp + OFF_EXCEPTIONS], EXCEPTION_SYSCALL as i32
                ; mov DWORD [rbp + OFF_PC], after as i32
            );
        }
        self.write_exception_exit();
    }
}
