//! Integer ALU emitters. Inputs fold to immediates where the register
//! cache knows them; results funnel through eax so aliased operands never
//! bite.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::analyzer::{CodeOp, Op};
use crate::cpu::{rlw_mask, spr_offset, OFF_CR, SPR_XER};
use crate::jit::emitter::Cond;
use crate::jit::{cur, CarryFlag, Jit};

/// Clears XER.CA.
const CA_CLEAR: i32 = !(1u32 << 29) as i32;

impl Jit {
    /// Builds a CR field nibble from live comparison flags. Uses rax/rdx.
    pub(super) fn emit_cr_flags(&mut self, field: usize, signed: bool) {
        let shift = ((7 - field) * 4) as i8;
        let field_clear = !(0xFu32 << shift) as i32;
        let xer = spr_offset(SPR_XER);
        let e = cur!(self);
        if signed {
            dynasm!(e ; .arch x64 ; setl al ; sete dl);
        } else {
            dynasm!(e ; .arch x64 ; setb al ; sete dl);
        }
        dynasm!(e
            ; .arch x64
            ; movzx eax, al
            ; movzx edx, dl
            ; lea eax, [rdx + rax * 4]
        );
        if signed {
            dynasm!(e ; .arch x64 ; setg dl);
        } else {
            dynasm!(e ; .arch x64 ; seta dl);
        }
        dynasm!(e
            ; .arch x64
            ; movzx edx, dl
            ; lea eax, [rax + rdx * 2]
            ; mov edx, [rbp + xer]
            ; shr edx, 31
            ; lea eax, [rdx + rax * 2]
            ; shl eax, shift
            ; mov edx, [rbp + OFF_CR]
            ; and edx, field_clear
            ; or edx, eax
            ; mov [rbp + OFF_CR], edx
        );
    }

    /// CR0 update for Rc=1 forms; `host` holds the result.
    pub(super) fn emit_cr0(&mut self, host: u8) {
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; test Rd(host), Rd(host));
        }
        self.emit_cr_flags(0, true);
    }

    /// Writes XER.CA from the host carry flag without touching eax.
    fn emit_store_carry(&mut self) {
        let xer = spr_offset(SPR_XER);
        let e = cur!(self);
        dynasm!(e
            ; .arch x64
            ; setc dl
            ; movzx edx, dl
            ; shl edx, 29
            ; and DWORD [rbp + xer], CA_CLEAR
            ; or [rbp + xer], edx
        );
    }

    pub(super) fn emit_addi(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let imm = if op.op == Op::Addis {
            (inst.uimm() << 16) as i32
        } else {
            inst.simm()
        };
        let (ra, rd) = (inst.ra(), inst.rd());

        if ra == 0 {
            self.gpr.set_imm(rd, imm as u32, true);
            return;
        }
        if let Some(base) = self.gpr.imm_value(ra) {
            self.gpr.set_imm(rd, base.wrapping_add(imm as u32), true);
            return;
        }

        let a = self.gpr.bind_read(cur!(self), ra);
        let d = self.gpr.bind_write(cur!(self), rd);
        let e = cur!(self);
        if a == d {
            dynasm!(e ; .arch x64 ; add Rd(d), imm);
        } else {
            dynasm!(e ; .arch x64 ; lea Rd(d), [Rq(a) + imm]);
        }
    }

    /// add / subf / mullw, via eax.
    pub(super) fn emit_arith_reg(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let (ra, rb, rd) = (inst.ra(), inst.rb(), inst.rd());

        let a = self.gpr.bind_read(cur!(self), ra);
        let b = self.gpr.bind_read(cur!(self), rb);
        {
            let e = cur!(self);
            match op.op {
                Op::Add => dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(a)
                    ; add eax, Rd(b)
                ),
                Op::Subf => dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(b)
                    ; sub eax, Rd(a)
                ),
                _ => dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(a)
                    ; imul eax, Rd(b)
                ),
            }
        }
        let d = self.gpr.bind_write(cur!(self), rd);
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_neg(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let a = self.gpr.bind_read(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(a) ; neg eax);
        }
        let d = self.gpr.bind_write(cur!(self), inst.rd());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_mulli(&mut self, op: &CodeOp) {
        let inst = op.inst;
        if let Some(value) = self.gpr.imm_value(inst.ra()) {
            self.gpr.set_imm(
                inst.rd(),
                (value as i32).wrapping_mul(inst.simm()) as u32,
                true,
            );
            return;
        }
        let a = self.gpr.bind_read(cur!(self), inst.ra());
        let d = self.gpr.bind_write(cur!(self), inst.rd());
        let imm = inst.simm();
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; imul Rd(d), Rd(a), imm);
    }

    /// addic / addc: compute the sum and capture the carry.
    pub(super) fn emit_carry_add(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let a = self.gpr.bind_read(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(a));
        }
        if op.op == Op::Addic {
            let imm = inst.simm();
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; add eax, imm);
        } else {
            let b = self.gpr.bind_read(cur!(self), inst.rb());
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; add eax, Rd(b));
        }
        self.finish_carry_op(op, inst.rc() && op.op == Op::Addc);
    }

    pub(super) fn emit_adde(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let a = self.gpr.bind_read(cur!(self), inst.ra());
        let b = self.gpr.bind_read(cur!(self), inst.rb());

        let carry_in = self.js.carry_flag;
        self.js.carry_flag = CarryFlag::InPpcState;
        match carry_in {
            CarryFlag::InHostCarry => {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(a)
                    ; adc eax, Rd(b)
                );
            }
            CarryFlag::ConstantZero => {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(a)
                    ; add eax, Rd(b)
                );
            }
            CarryFlag::ConstantOne => {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(a)
                    ; stc
                    ; adc eax, Rd(b)
                );
            }
            CarryFlag::InPpcState => {
                let xer = spr_offset(SPR_XER);
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov edx, [rbp + xer]
                    ; bt edx, 29
                    ; mov eax, Rd(a)
                    ; adc eax, Rd(b)
                );
            }
        }
        self.finish_carry_op(op, inst.rc());
    }

    /// Result in eax, carry in CF: either hand the carry to an adjacent
    /// consumer in the flags or spill it to XER.CA.
    fn finish_carry_op(&mut self, op: &CodeOp, rc: bool) {
        if self.js.next_op_consumes_carry && !rc {
            self.js.carry_flag = CarryFlag::InHostCarry;
        } else {
            self.emit_store_carry();
            self.js.carry_flag = CarryFlag::InPpcState;
        }
        let d = self.gpr.bind_write(cur!(self), op.inst.rd());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if rc {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_logic_imm(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let (rs, ra) = (inst.rs(), inst.ra());
        let shifted = matches!(op.op, Op::Oris | Op::Xoris | Op::AndisRc);
        let imm = if shifted {
            inst.uimm() << 16
        } else {
            inst.uimm()
        };

        if let Some(value) = self.gpr.imm_value(rs) {
            let result = match op.op {
                Op::Ori | Op::Oris => value | imm,
                Op::Xori | Op::Xoris => value ^ imm,
                _ => value & imm,
            };
            self.gpr.set_imm(ra, result, true);
            if matches!(op.op, Op::AndiRc | Op::AndisRc) {
                // Rc on a folded value still has to reach CR0.
                let host = self.gpr.bind_read(cur!(self), ra);
                self.emit_cr0(host);
            }
            return;
        }

        let s = self.gpr.bind_read(cur!(self), rs);
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(s));
            match op.op {
                Op::Ori | Op::Oris => dynasm!(e ; .arch x64 ; or eax, imm as i32),
                Op::Xori | Op::Xoris => dynasm!(e ; .arch x64 ; xor eax, imm as i32),
                _ => dynasm!(e ; .arch x64 ; and eax, imm as i32),
            }
        }
        let d = self.gpr.bind_write(cur!(self), ra);
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if matches!(op.op, Op::AndiRc | Op::AndisRc) {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_logic_reg(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let b = self.gpr.bind_read(cur!(self), inst.rb());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(s));
            match op.op {
                Op::And => dynasm!(e ; .arch x64 ; and eax, Rd(b)),
                Op::Or => dynasm!(e ; .arch x64 ; or eax, Rd(b)),
                Op::Xor => dynasm!(e ; .arch x64 ; xor eax, Rd(b)),
                Op::Nand => dynasm!(e ; .arch x64 ; and eax, Rd(b) ; not eax),
                Op::Nor => dynasm!(e ; .arch x64 ; or eax, Rd(b) ; not eax),
                Op::Eqv => dynasm!(e ; .arch x64 ; xor eax, Rd(b) ; not eax),
                Op::Andc => dynasm!(e
                    ; .arch x64
                    ; mov edx, Rd(b)
                    ; not edx
                    ; and eax, edx
                ),
                _ => dynasm!(e
                    ; .arch x64
                    ; mov edx, Rd(b)
                    ; not edx
                    ; or eax, edx
                ),
            }
        }
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_extend(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        {
            let e = cur!(self);
            if op.op == Op::Extsb {
                dynasm!(e ; .arch x64 ; movsx eax, Rb(s));
            } else {
                dynasm!(e ; .arch x64 ; movsx eax, Rw(s));
            }
        }
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_cntlzw(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let zero_case;
        {
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; mov eax, 32
                ; bsr edx, Rd(s)
            );
            zero_case = e.jcc_fixup(Cond::Zero);
            dynasm!(e
                ; .arch x64
                ; mov eax, 31
                ; sub eax, edx
            );
            e.set_jump_target(zero_case);
        }
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_rlwinm(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let mask = rlw_mask(inst.mb(), inst.me());
        let sh = inst.sh() as i8;

        if let Some(value) = self.gpr.imm_value(inst.rs()) {
            if !inst.rc() {
                self.gpr
                    .set_imm(inst.ra(), value.rotate_left(inst.sh()) & mask, true);
                return;
            }
        }

        let s = self.gpr.bind_read(cur!(self), inst.rs());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(s));
            if sh != 0 {
                dynasm!(e ; .arch x64 ; rol eax, sh);
            }
            dynasm!(e ; .arch x64 ; and eax, mask as i32);
        }
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_rlwimi(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let mask = rlw_mask(inst.mb(), inst.me());
        let sh = inst.sh() as i8;

        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let a = self.gpr.bind_readwrite(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, Rd(s));
            if sh != 0 {
                dynasm!(e ; .arch x64 ; rol eax, sh);
            }
            dynasm!(e
                ; .arch x64
                ; and eax, mask as i32
                ; and Rd(a), !mask as i32
                ; or Rd(a), eax
            );
        }
        if inst.rc() {
            self.emit_cr0(a);
        }
    }

    /// slw / srw via a 64-bit shift so amounts of 32..63 collapse to
    /// zero.
    pub(super) fn emit_shift_reg(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let b = self.gpr.bind_read(cur!(self), inst.rb());
        self.gpr.free_host(cur!(self), crate::jit::reg_cache::RCX);
        {
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; mov ecx, Rd(b)
                ; and ecx, 63
                ; mov eax, Rd(s)
            );
            if op.op == Op::Slw {
                dynasm!(e ; .arch x64 ; shl rax, cl);
            } else {
                dynasm!(e ; .arch x64 ; shr rax, cl);
            }
        }
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_srawi(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let sh = inst.sh();
        let s = self.gpr.bind_read(cur!(self), inst.rs());
        let xer = spr_offset(SPR_XER);

        if sh == 0 {
            // Result is rs, carry always clear.
            {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, Rd(s)
                    ; and DWORD [rbp + xer], CA_CLEAR
                );
            }
            self.js.carry_flag = CarryFlag::ConstantZero;
        } else {
            let out_mask = ((1u32 << sh) - 1) as i32;
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                // carry = sign && (bits shifted out != 0)
                ; mov edx, Rd(s)
                ; and edx, out_mask
                ; setne dl
                ; movzx edx, dl
                ; mov eax, Rd(s)
                ; shr eax, 31
                ; and edx, eax
                ; shl edx, 29
                ; and DWORD [rbp + xer], CA_CLEAR
                ; or [rbp + xer], edx
                ; mov eax, Rd(s)
                ; sar eax, sh as i8
            );
        }
        self.js.carry_flag = CarryFlag::InPpcState;
        let d = self.gpr.bind_write(cur!(self), inst.ra());
        {
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov Rd(d), eax);
        }
        if inst.rc() {
            self.emit_cr0(d);
        }
    }

    pub(super) fn emit_cmp(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let field = inst.crfd();
        let signed = matches!(op.op, Op::Cmpi | Op::Cmp);

        let a = self.gpr.bind_read(cur!(self), inst.ra());
        {
            let e = cur!(self);
            match op.op {
                Op::Cmpi => {
                    let imm = inst.simm();
                    dynasm!(e ; .arch x64 ; cmp Rd(a), imm);
                }
                Op::Cmpli => {
                    let imm = inst.uimm() as i32;
                    dynasm!(e ; .arch x64 ; cmp Rd(a), imm);
                }
                _ => {}
            }
        }
        if matches!(op.op, Op::Cmp | Op::Cmpl) {
            let b = self.gpr.bind_read(cur!(self), inst.rb());
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; cmp Rd(a), Rd(b));
        }
        self.emit_cr_flags(field, signed);
    }
}
