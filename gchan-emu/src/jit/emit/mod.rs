//! Per-opcode emitters. One small routine per native op; everything else
//! routes through the interpreter fallback.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::analyzer::{CodeOp, Op, FL_ENDBLOCK, FL_INTERPRETER_ONLY};
use crate::cpu::interpreter;
use crate::cpu::{OFF_NPC, OFF_PC};
use crate::jit::emitter::Cond;
use crate::jit::{cur, Jit};

mod branch;
mod integer;
mod loadstore;
mod paired;
mod system;

pub fn compile_instruction(jit: &mut Jit, op: &CodeOp) {
    if op.flags & FL_INTERPRETER_ONLY != 0 {
        jit.fallback_to_interpreter(op);
        return;
    }

    match op.op {
        Op::Addi | Op::Addis => jit.emit_addi(op),
        Op::Add | Op::Subf | Op::Mullw => jit.emit_arith_reg(op),
        Op::Neg => jit.emit_neg(op),
        Op::Mulli => jit.emit_mulli(op),
        Op::Addic | Op::Addc => jit.emit_carry_add(op),
        Op::Adde => jit.emit_adde(op),
        Op::Ori | Op::Oris | Op::Xori | Op::Xoris | Op::AndiRc | Op::AndisRc => {
            jit.emit_logic_imm(op)
        }
        Op::And
        | Op::Or
        | Op::Xor
        | Op::Nand
        | Op::Nor
        | Op::Eqv
        | Op::Andc
        | Op::Orc => jit.emit_logic_reg(op),
        Op::Extsb | Op::Extsh => jit.emit_extend(op),
        Op::Cntlzw => jit.emit_cntlzw(op),
        Op::Rlwinm => jit.emit_rlwinm(op),
        Op::Rlwimi => jit.emit_rlwimi(op),
        Op::Slw | Op::Srw => jit.emit_shift_reg(op),
        Op::Srawi => jit.emit_srawi(op),
        Op::Cmpi | Op::Cmpli | Op::Cmp | Op::Cmpl => jit.emit_cmp(op),
        Op::B => jit.emit_bx(op),
        Op::Bc => jit.emit_bcx(op),
        Op::Bclr => jit.emit_bclrx(op),
        Op::Bcctr => jit.emit_bcctrx(op),
        Op::Sc => jit.emit_sc(op),
        Op::Lbz | Op::Lhz | Op::Lha | Op::Lwz | Op::Lbzx | Op::Lhzx | Op::Lwzx => {
            jit.emit_load(op)
        }
        Op::Stb | Op::Sth | Op::Stw | Op::Stbx | Op::Sthx | Op::Stwx => jit.emit_store(op),
        Op::Lfs | Op::Lfd => jit.emit_float_load(op),
        Op::Stfs | Op::Stfd => jit.emit_float_store(op),
        Op::Fmr => jit.emit_fmr(op),
        Op::PsqL => jit.emit_psq_l(op),
        Op::PsqSt => jit.emit_psq_st(op),
        Op::Mfspr => jit.emit_mfspr(op),
        Op::Mtspr => jit.emit_mtspr(op),
        Op::Mfmsr => jit.emit_mfmsr(op),
        Op::Mfcr => jit.emit_mfcr(op),
        Op::Sync | Op::Isync => {}
        _ => jit.fallback_to_interpreter(op),
    }
}

impl Jit {
    /// ABI-correct call into the interpreter routine for this opcode.
    pub fn fallback_to_interpreter(&mut self, op: &CodeOp) {
        self.flush_carry();
        // The routine may rewrite XER.CA behind any constant-carry
        // assumption.
        self.js.carry_flag = crate::jit::CarryFlag::InPpcState;
        self.gpr.flush(cur!(self));
        self.fpr.flush(cur!(self));

        let end_block = op.flags & FL_ENDBLOCK != 0;
        let address = op.address;
        let next_address = address.wrapping_add(4) as i32;
        if end_block {
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; mov DWORD [rbp + OFF_PC], address as i32
                ; mov DWORD [rbp + OFF_NPC], next_address
            );
        }

        let routine = interpreter::get_interpreter_op(op.inst) as usize;
        let inst = op.inst.0;
        let e = cur!(self);
        e.abi_call_with(&[], routine, |e| {
            dynasm!(e
                ; .arch x64
                ; mov rdi, r14
                ; mov esi, inst as i32
            );
        });

        // Anything the interpreter wrote must not stay shadowed by a
        // discarded binding.
        self.gpr.reset(op.regs_out);
        self.fpr.reset(op.fregs_out);

        if end_block {
            if self.js.is_last_instruction {
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, [rbp + OFF_NPC]
                    ; mov [rbp + OFF_PC], eax
                );
                self.write_exception_exit();
            } else {
                // Mid-block end: leave only if the interpreter actually
                // redirected control flow.
                let straight = address.wrapping_add(4);
                let e = cur!(self);
                dynasm!(e
                    ; .arch x64
                    ; mov eax, [rbp + OFF_NPC]
                    ; cmp eax, straight as i32
                );
                let keep_going = e.jcc_fixup(Cond::Zero);
                dynasm!(e ; .arch x64 ; mov [rbp + OFF_PC], eax);
                self.write_exception_exit();
                let e = cur!(self);
                e.set_jump_target(keep_going);
            }
        }
    }
}
