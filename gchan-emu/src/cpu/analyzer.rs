use smallvec::SmallVec;

use crate::cpu::SPR_GQR0;
use crate::memory::Memory;

/// Raw Gekko instruction word with field accessors.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GekkoInst(pub u32);

impl std::fmt::Debug for GekkoInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GekkoInst({:#010x})", self.0)
    }
}

impl GekkoInst {
    pub fn opcd(self) -> u32 {
        self.0 >> 26
    }
    /// rD for loads/arithmetic, rS for stores. Same field.
    pub fn rd(self) -> u8 {
        ((self.0 >> 21) & 0x1F) as u8
    }
    pub fn rs(self) -> u8 {
        self.rd()
    }
    pub fn ra(self) -> u8 {
        ((self.0 >> 16) & 0x1F) as u8
    }
    pub fn rb(self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }
    pub fn simm(self) -> i32 {
        self.0 as u16 as i16 as i32
    }
    pub fn uimm(self) -> u32 {
        self.0 as u16 as u32
    }
    pub fn crfd(self) -> usize {
        ((self.0 >> 23) & 0x7) as usize
    }
    pub fn bo(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }
    pub fn bi(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }
    /// Sign-extended, word-aligned displacement of I-form branches.
    pub fn li(self) -> i32 {
        ((self.0 & 0x03FF_FFFC) as i32) << 6 >> 6
    }
    /// Sign-extended, word-aligned displacement of B-form branches.
    pub fn bd(self) -> i32 {
        (((self.0 & 0xFFFC) as i32) << 16) >> 16
    }
    pub fn aa(self) -> bool {
        self.0 & 2 != 0
    }
    pub fn lk(self) -> bool {
        self.0 & 1 != 0
    }
    pub fn rc(self) -> bool {
        self.0 & 1 != 0
    }
    pub fn sh(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }
    pub fn mb(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    pub fn me(self) -> u32 {
        (self.0 >> 1) & 0x1F
    }
    pub fn xo10(self) -> u32 {
        (self.0 >> 1) & 0x3FF
    }
    pub fn spr_index(self) -> usize {
        (((self.0 >> 16) & 0x1F) | (((self.0 >> 11) & 0x1F) << 5)) as usize
    }
    /// psq_l / psq_st 12-bit displacement.
    pub fn ps_d(self) -> i32 {
        ((self.0 & 0xFFF) as i32) << 20 >> 20
    }
    pub fn ps_i(self) -> usize {
        ((self.0 >> 12) & 0x7) as usize
    }
    pub fn ps_w(self) -> bool {
        self.0 & 0x8000 != 0
    }
}

/// Decoded operation kind. Everything the translator has no native emitter
/// for carries enough liveness data here to fall back safely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    // integer arithmetic
    Addi,
    Addis,
    Add,
    Subf,
    Neg,
    Mulli,
    Mullw,
    Addic,
    Addc,
    Adde,
    Subfc,
    Subfe,
    // logical
    Ori,
    Oris,
    Xori,
    Xoris,
    AndiRc,
    AndisRc,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Eqv,
    Andc,
    Orc,
    Extsb,
    Extsh,
    Cntlzw,
    // shifts / rotates
    Rlwinm,
    Rlwimi,
    Slw,
    Srw,
    Sraw,
    Srawi,
    // compares
    Cmpi,
    Cmpli,
    Cmp,
    Cmpl,
    // flow
    B,
    Bc,
    Bclr,
    Bcctr,
    Sc,
    Rfi,
    // loads
    Lbz,
    Lhz,
    Lha,
    Lwz,
    Lbzx,
    Lhzx,
    Lwzx,
    // stores
    Stb,
    Sth,
    Stw,
    Stbx,
    Sthx,
    Stwx,
    // multiple
    Lmw,
    Stmw,
    // float / paired
    Lfs,
    Lfd,
    Stfs,
    Stfd,
    Fmr,
    PsqL,
    PsqSt,
    FpArith,
    PsArith,
    // system
    Mfspr,
    Mtspr,
    Mfmsr,
    Mtmsr,
    Mfcr,
    Mtcrf,
    CrLogic,
    Icbi,
    Dcbz,
    Dcbf,
    Sync,
    Isync,
    // decode failure: raises a program exception at run time
    Invalid,
}

pub const FL_ENDBLOCK: u32 = 1 << 0;
pub const FL_USE_FPU: u32 = 1 << 1;
pub const FL_LOADSTORE: u32 = 1 << 2;
pub const FL_STORE: u32 = 1 << 3;
pub const FL_UPDATE: u32 = 1 << 4;
pub const FL_RC: u32 = 1 << 5;
/// Set on every op reachable only behind an interpreter fallback.
pub const FL_INTERPRETER_ONLY: u32 = 1 << 6;

#[derive(Clone, Copy, Debug)]
pub struct CodeOp {
    pub inst: GekkoInst,
    pub op: Op,
    pub address: u32,
    pub flags: u32,
    pub cycles: u8,
    pub regs_in: u32,
    pub regs_out: u32,
    pub fregs_in: u32,
    pub fregs_out: u32,
    pub gpr_in_use: u32,
    pub gpr_discardable: u32,
    pub fpr_in_use: u32,
    pub fpr_discardable: u32,
    /// Branch already consumed by follow-the-branch inlining.
    pub skip: bool,
    /// Statically known branch destination.
    pub branch_to: Option<u32>,
    /// Unconditional branch that was inlined; for `bl` the emitter still
    /// owes the LR write and the BLR-stack hint.
    pub branch_followed: bool,
}

impl CodeOp {
    pub fn is_idle_branch(&self) -> bool {
        self.op == Op::B && !self.inst.lk() && self.branch_to == Some(self.address)
    }
}

#[derive(Default)]
pub struct BlockStats {
    pub num_cycles: u32,
    pub num_load_store: u32,
    pub num_fp: u32,
}

#[derive(Default)]
pub struct CodeBlock {
    pub start: u32,
    pub num_instructions: usize,
    pub memory_exception: bool,
    /// Ended by the instruction budget rather than control flow.
    pub broken: bool,
    pub physical_addresses: SmallVec<[u32; 32]>,
    /// Registers read before any write in this block.
    pub gpr_inputs: u32,
    pub gqr_used: u8,
    pub gqr_modified: u8,
    pub stats: BlockStats,
}

struct Decoded {
    op: Op,
    flags: u32,
    cycles: u8,
    regs_in: u32,
    regs_out: u32,
    fregs_in: u32,
    fregs_out: u32,
}

fn bit(reg: u8) -> u32 {
    1 << reg
}

/// ra as an input, honoring the `ra == 0 means literal zero` convention of
/// d-form address computation.
fn ra_base(inst: GekkoInst) -> u32 {
    if inst.ra() == 0 {
        0
    } else {
        bit(inst.ra())
    }
}

fn decode(inst: GekkoInst) -> Decoded {
    let d = |op, flags, cycles, regs_in, regs_out| Decoded {
        op,
        flags,
        cycles,
        regs_in,
        regs_out,
        fregs_in: 0,
        fregs_out: 0,
    };

    let ra = inst.ra();
    let rb = inst.rb();
    let rd = inst.rd();
    let rs = inst.rs();

    match inst.opcd() {
        7 => d(Op::Mulli, 0, 2, bit(ra), bit(rd)),
        10 => d(Op::Cmpli, 0, 1, bit(ra), 0),
        11 => d(Op::Cmpi, 0, 1, bit(ra), 0),
        12 => d(Op::Addic, 0, 1, bit(ra), bit(rd)),
        14 => d(Op::Addi, 0, 1, ra_base(inst), bit(rd)),
        15 => d(Op::Addis, 0, 1, ra_base(inst), bit(rd)),
        16 => d(Op::Bc, FL_ENDBLOCK, 1, 0, 0),
        17 => d(Op::Sc, FL_ENDBLOCK, 2, 0, 0),
        18 => d(Op::B, FL_ENDBLOCK, 1, 0, 0),
        19 => match inst.xo10() {
            16 => d(Op::Bclr, FL_ENDBLOCK, 1, 0, 0),
            528 => d(Op::Bcctr, FL_ENDBLOCK, 1, 0, 0),
            50 => d(Op::Rfi, FL_ENDBLOCK | FL_INTERPRETER_ONLY, 2, 0, 0),
            150 => d(Op::Isync, 0, 1, 0, 0),
            _ => d(Op::CrLogic, FL_INTERPRETER_ONLY, 1, 0, 0),
        },
        20 => d(Op::Rlwimi, if inst.rc() { FL_RC } else { 0 }, 1, bit(ra) | bit(rs), bit(ra)),
        21 => d(Op::Rlwinm, if inst.rc() { FL_RC } else { 0 }, 1, bit(rs), bit(ra)),
        24 => d(Op::Ori, 0, 1, bit(rs), bit(ra)),
        25 => d(Op::Oris, 0, 1, bit(rs), bit(ra)),
        26 => d(Op::Xori, 0, 1, bit(rs), bit(ra)),
        27 => d(Op::Xoris, 0, 1, bit(rs), bit(ra)),
        28 => d(Op::AndiRc, FL_RC, 1, bit(rs), bit(ra)),
        29 => d(Op::AndisRc, FL_RC, 1, bit(rs), bit(ra)),
        31 => decode_op31(inst),
        32 => d(Op::Lwz, FL_LOADSTORE, 1, ra_base(inst), bit(rd)),
        33 => d(Op::Lwz, FL_LOADSTORE | FL_UPDATE, 1, bit(ra), bit(rd) | bit(ra)),
        34 => d(Op::Lbz, FL_LOADSTORE, 1, ra_base(inst), bit(rd)),
        35 => d(Op::Lbz, FL_LOADSTORE | FL_UPDATE, 1, bit(ra), bit(rd) | bit(ra)),
        40 => d(Op::Lhz, FL_LOADSTORE, 1, ra_base(inst), bit(rd)),
        41 => d(Op::Lhz, FL_LOADSTORE | FL_UPDATE, 1, bit(ra), bit(rd) | bit(ra)),
        42 => d(Op::Lha, FL_LOADSTORE, 1, ra_base(inst), bit(rd)),
        43 => d(Op::Lha, FL_LOADSTORE | FL_UPDATE, 1, bit(ra), bit(rd) | bit(ra)),
        36 => d(Op::Stw, FL_LOADSTORE | FL_STORE, 1, ra_base(inst) | bit(rs), 0),
        37 => d(
            Op::Stw,
            FL_LOADSTORE | FL_STORE | FL_UPDATE,
            1,
            bit(ra) | bit(rs),
            bit(ra),
        ),
        38 => d(Op::Stb, FL_LOADSTORE | FL_STORE, 1, ra_base(inst) | bit(rs), 0),
        39 => d(
            Op::Stb,
            FL_LOADSTORE | FL_STORE | FL_UPDATE,
            1,
            bit(ra) | bit(rs),
            bit(ra),
        ),
        44 => d(Op::Sth, FL_LOADSTORE | FL_STORE, 1, ra_base(inst) | bit(rs), 0),
        45 => d(
            Op::Sth,
            FL_LOADSTORE | FL_STORE | FL_UPDATE,
            1,
            bit(ra) | bit(rs),
            bit(ra),
        ),
        46 => d(
            Op::Lmw,
            FL_LOADSTORE | FL_INTERPRETER_ONLY,
            11,
            ra_base(inst),
            !0u32 << rd,
        ),
        47 => d(
            Op::Stmw,
            FL_LOADSTORE | FL_STORE | FL_INTERPRETER_ONLY,
            11,
            ra_base(inst) | (!0u32 << rs),
            0,
        ),
        48 | 49 => Decoded {
            op: Op::Lfs,
            flags: FL_LOADSTORE | FL_USE_FPU | if inst.opcd() == 49 { FL_UPDATE } else { 0 },
            cycles: 1,
            regs_in: if inst.opcd() == 49 { bit(ra) } else { ra_base(inst) },
            regs_out: if inst.opcd() == 49 { bit(ra) } else { 0 },
            fregs_in: 0,
            fregs_out: bit(rd),
        },
        50 | 51 => Decoded {
            op: Op::Lfd,
            flags: FL_LOADSTORE | FL_USE_FPU | if inst.opcd() == 51 { FL_UPDATE } else { 0 },
            cycles: 1,
            regs_in: if inst.opcd() == 51 { bit(ra) } else { ra_base(inst) },
            regs_out: if inst.opcd() == 51 { bit(ra) } else { 0 },
            fregs_in: 0,
            fregs_out: bit(rd),
        },
        52 | 53 => Decoded {
            op: Op::Stfs,
            flags: FL_LOADSTORE | FL_STORE | FL_USE_FPU
                | if inst.opcd() == 53 { FL_UPDATE } else { 0 },
            cycles: 1,
            regs_in: if inst.opcd() == 53 { bit(ra) } else { ra_base(inst) },
            regs_out: if inst.opcd() == 53 { bit(ra) } else { 0 },
            fregs_in: bit(rs),
            fregs_out: 0,
        },
        54 | 55 => Decoded {
            op: Op::Stfd,
            flags: FL_LOADSTORE | FL_STORE | FL_USE_FPU
                | if inst.opcd() == 55 { FL_UPDATE } else { 0 },
            cycles: 1,
            regs_in: if inst.opcd() == 55 { bit(ra) } else { ra_base(inst) },
            regs_out: if inst.opcd() == 55 { bit(ra) } else { 0 },
            fregs_in: bit(rs),
            fregs_out: 0,
        },
        56 => Decoded {
            op: Op::PsqL,
            flags: FL_LOADSTORE | FL_USE_FPU,
            cycles: 1,
            regs_in: ra_base(inst),
            regs_out: 0,
            fregs_in: 0,
            fregs_out: bit(rd),
        },
        60 => Decoded {
            op: Op::PsqSt,
            flags: FL_LOADSTORE | FL_STORE | FL_USE_FPU,
            cycles: 1,
            regs_in: ra_base(inst),
            regs_out: 0,
            fregs_in: bit(rs),
            fregs_out: 0,
        },
        4 => Decoded {
            // paired-single arithmetic; conservatively all-lanes in/out
            op: Op::PsArith,
            flags: FL_USE_FPU | FL_INTERPRETER_ONLY,
            cycles: 1,
            regs_in: 0,
            regs_out: 0,
            fregs_in: bit(ra) | bit(rb) | bit((inst.0 >> 6) as u8 & 0x1F),
            fregs_out: bit(rd),
        },
        59 | 63 => match (inst.opcd(), inst.xo10()) {
            (63, 72) => Decoded {
                op: Op::Fmr,
                flags: FL_USE_FPU,
                cycles: 1,
                regs_in: 0,
                regs_out: 0,
                fregs_in: bit(rb),
                fregs_out: bit(rd),
            },
            _ => Decoded {
                op: Op::FpArith,
                flags: FL_USE_FPU | FL_INTERPRETER_ONLY,
                cycles: 1,
                regs_in: 0,
                regs_out: 0,
                fregs_in: bit(ra) | bit(rb) | bit((inst.0 >> 6) as u8 & 0x1F),
                fregs_out: bit(rd),
            },
        },
        _ => d(Op::Invalid, FL_ENDBLOCK | FL_INTERPRETER_ONLY, 1, 0, 0),
    }
}

fn decode_op31(inst: GekkoInst) -> Decoded {
    let d = |op, flags, cycles, regs_in, regs_out| Decoded {
        op,
        flags,
        cycles,
        regs_in,
        regs_out,
        fregs_in: 0,
        fregs_out: 0,
    };

    let ra = inst.ra();
    let rb = inst.rb();
    let rd = inst.rd();
    let rs = inst.rs();
    let rc = if inst.rc() { FL_RC } else { 0 };

    match inst.xo10() {
        0 => d(Op::Cmp, 0, 1, bit(ra) | bit(rb), 0),
        32 => d(Op::Cmpl, 0, 1, bit(ra) | bit(rb), 0),
        266 => d(Op::Add, rc, 1, bit(ra) | bit(rb), bit(rd)),
        40 => d(Op::Subf, rc, 1, bit(ra) | bit(rb), bit(rd)),
        104 => d(Op::Neg, rc, 1, bit(ra), bit(rd)),
        235 => d(Op::Mullw, rc, 4, bit(ra) | bit(rb), bit(rd)),
        10 => d(Op::Addc, rc, 1, bit(ra) | bit(rb), bit(rd)),
        138 => d(Op::Adde, rc, 1, bit(ra) | bit(rb), bit(rd)),
        8 => d(Op::Subfc, rc | FL_INTERPRETER_ONLY, 1, bit(ra) | bit(rb), bit(rd)),
        136 => d(Op::Subfe, rc | FL_INTERPRETER_ONLY, 1, bit(ra) | bit(rb), bit(rd)),
        28 => d(Op::And, rc, 1, bit(rs) | bit(rb), bit(ra)),
        444 => d(Op::Or, rc, 1, bit(rs) | bit(rb), bit(ra)),
        316 => d(Op::Xor, rc, 1, bit(rs) | bit(rb), bit(ra)),
        476 => d(Op::Nand, rc, 1, bit(rs) | bit(rb), bit(ra)),
        124 => d(Op::Nor, rc, 1, bit(rs) | bit(rb), bit(ra)),
        284 => d(Op::Eqv, rc, 1, bit(rs) | bit(rb), bit(ra)),
        60 => d(Op::Andc, rc, 1, bit(rs) | bit(rb), bit(ra)),
        412 => d(Op::Orc, rc, 1, bit(rs) | bit(rb), bit(ra)),
        954 => d(Op::Extsb, rc, 1, bit(rs), bit(ra)),
        922 => d(Op::Extsh, rc, 1, bit(rs), bit(ra)),
        26 => d(Op::Cntlzw, rc, 1, bit(rs), bit(ra)),
        24 => d(Op::Slw, rc, 1, bit(rs) | bit(rb), bit(ra)),
        536 => d(Op::Srw, rc, 1, bit(rs) | bit(rb), bit(ra)),
        792 => d(Op::Sraw, rc | FL_INTERPRETER_ONLY, 1, bit(rs) | bit(rb), bit(ra)),
        824 => d(Op::Srawi, rc, 1, bit(rs), bit(ra)),
        87 => d(Op::Lbzx, FL_LOADSTORE, 1, ra_base(inst) | bit(rb), bit(rd)),
        279 => d(Op::Lhzx, FL_LOADSTORE, 1, ra_base(inst) | bit(rb), bit(rd)),
        23 => d(Op::Lwzx, FL_LOADSTORE, 1, ra_base(inst) | bit(rb), bit(rd)),
        215 => d(
            Op::Stbx,
            FL_LOADSTORE | FL_STORE,
            1,
            ra_base(inst) | bit(rb) | bit(rs),
            0,
        ),
        407 => d(
            Op::Sthx,
            FL_LOADSTORE | FL_STORE,
            1,
            ra_base(inst) | bit(rb) | bit(rs),
            0,
        ),
        151 => d(
            Op::Stwx,
            FL_LOADSTORE | FL_STORE,
            1,
            ra_base(inst) | bit(rb) | bit(rs),
            0,
        ),
        339 => d(Op::Mfspr, 0, 1, 0, bit(rd)),
        467 => d(Op::Mtspr, 0, 1, bit(rs), 0),
        83 => d(Op::Mfmsr, 0, 1, 0, bit(rd)),
        146 => d(Op::Mtmsr, FL_ENDBLOCK | FL_INTERPRETER_ONLY, 1, bit(rs), 0),
        19 => d(Op::Mfcr, 0, 1, 0, bit(rd)),
        144 => d(Op::Mtcrf, FL_INTERPRETER_ONLY, 1, bit(rs), 0),
        982 => d(Op::Icbi, FL_ENDBLOCK | FL_INTERPRETER_ONLY, 4, ra_base(inst) | bit(rb), 0),
        1014 => d(
            Op::Dcbz,
            FL_LOADSTORE | FL_STORE | FL_INTERPRETER_ONLY,
            4,
            ra_base(inst) | bit(rb),
            0,
        ),
        86 => d(Op::Dcbf, FL_INTERPRETER_ONLY, 4, ra_base(inst) | bit(rb), 0),
        598 => d(Op::Sync, 0, 2, 0, 0),
        _ => d(Op::Invalid, FL_ENDBLOCK | FL_INTERPRETER_ONLY, 1, 0, 0),
    }
}

/// Operation kind for one instruction word, shared with the interpreter
/// table.
pub fn decode_op(inst: GekkoInst) -> Op {
    decode(inst).op
}

pub struct Analyzer {
    /// Inline unconditional branches into the block being analyzed.
    pub branch_follow: bool,
    /// Only one inlined branch per block; nested follows are not worth it.
    max_follows: usize,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self {
            branch_follow: true,
            max_follows: 1,
        }
    }
}

impl Analyzer {
    /// Analyzes a straight-line region starting at `pc`.
    ///
    /// Returns the next sequential PC after the analyzed region. On a
    /// translation fault, `block.memory_exception` is set and the returned
    /// PC is the faulting address.
    pub fn analyze(
        &self,
        pc: u32,
        block: &mut CodeBlock,
        buffer: &mut Vec<CodeOp>,
        memory: &Memory,
        max_instructions: usize,
    ) -> u32 {
        buffer.clear();
        *block = CodeBlock {
            start: pc,
            ..CodeBlock::default()
        };

        let mut address = pc;
        let mut follows = 0;
        let mut defined: u32 = 0;

        loop {
            let Some(phys) = Memory::instruction_address(address) else {
                block.memory_exception = true;
                return address;
            };
            let Some(word) = memory.read_u32(address) else {
                block.memory_exception = true;
                return address;
            };
            let inst = GekkoInst(word);
            let dec = decode(inst);

            let mut op = CodeOp {
                inst,
                op: dec.op,
                address,
                flags: dec.flags,
                cycles: dec.cycles,
                regs_in: dec.regs_in,
                regs_out: dec.regs_out,
                fregs_in: dec.fregs_in,
                fregs_out: dec.fregs_out,
                gpr_in_use: 0,
                gpr_discardable: 0,
                fpr_in_use: 0,
                fpr_discardable: 0,
                skip: false,
                branch_to: None,
                branch_followed: false,
            };

            if matches!(dec.op, Op::B | Op::Bc) {
                let displacement = if dec.op == Op::B { inst.li() } else { inst.bd() };
                op.branch_to = Some(if inst.aa() {
                    displacement as u32
                } else {
                    address.wrapping_add(displacement as u32)
                });
            }

            match dec.op {
                Op::PsqL | Op::PsqSt => block.gqr_used |= 1 << inst.ps_i(),
                Op::Mtspr => {
                    let spr = inst.spr_index();
                    if (SPR_GQR0..SPR_GQR0 + 8).contains(&spr) {
                        block.gqr_modified |= 1 << (spr - SPR_GQR0);
                    }
                }
                _ => {}
            }

            block.gpr_inputs |= dec.regs_in & !defined;
            defined |= dec.regs_out;
            block.physical_addresses.push(phys);
            block.stats.num_cycles += dec.cycles as u32;
            if dec.flags & FL_LOADSTORE != 0 {
                block.stats.num_load_store += 1;
            }
            if dec.flags & FL_USE_FPU != 0 {
                block.stats.num_fp += 1;
            }

            let end_block = dec.flags & FL_ENDBLOCK != 0;

            if end_block
                && self.branch_follow
                && follows < self.max_follows
                && buffer.len() + 1 < max_instructions
                && dec.op == Op::B
            {
                if let Some(dest) = op.branch_to {
                    // Never follow into ourselves (idle loops) or backwards.
                    if dest != op.address && dest > op.address {
                        follows += 1;
                        op.skip = !inst.lk();
                        op.branch_followed = true;
                        buffer.push(op);
                        address = dest;
                        continue;
                    }
                }
            }

            buffer.push(op);

            if end_block {
                block.num_instructions = buffer.len();
                self.finish_liveness(buffer);
                return address.wrapping_add(4);
            }

            if buffer.len() >= max_instructions {
                block.broken = true;
                block.num_instructions = buffer.len();
                self.finish_liveness(buffer);
                return address.wrapping_add(4);
            }

            address = address.wrapping_add(4);
        }
    }

    /// Backward pass filling the in-use and discardable masks.
    fn finish_liveness(&self, buffer: &mut [CodeOp]) {
        // Per register: 0 = untouched later, 1 = next access is a read,
        // 2 = next access is a write.
        let mut next_gpr = [0u8; 32];
        let mut next_fpr = [0u8; 32];

        for op in buffer.iter_mut().rev() {
            let mut in_use = 0u32;
            let mut discardable = 0u32;
            for reg in 0..32 {
                match next_gpr[reg] {
                    0 => {}
                    1 => in_use |= 1 << reg,
                    _ => {
                        in_use |= 1 << reg;
                        discardable |= 1 << reg;
                    }
                }
            }
            // In-use means "read again by a later op"; the current op's
            // own registers don't keep themselves alive.
            op.gpr_in_use = in_use;
            op.gpr_discardable = discardable & !(op.regs_in | op.regs_out);

            let mut fin_use = 0u32;
            let mut fdiscardable = 0u32;
            for reg in 0..32 {
                match next_fpr[reg] {
                    0 => {}
                    1 => fin_use |= 1 << reg,
                    _ => {
                        fin_use |= 1 << reg;
                        fdiscardable |= 1 << reg;
                    }
                }
            }
            op.fpr_in_use = fin_use;
            op.fpr_discardable = fdiscardable & !(op.fregs_in | op.fregs_out);

            for reg in 0..32 {
                let mask = 1u32 << reg;
                if op.regs_in & mask != 0 {
                    next_gpr[reg] = 1;
                } else if op.regs_out & mask != 0 {
                    next_gpr[reg] = 2;
                }
                if op.fregs_in & mask != 0 {
                    next_fpr[reg] = 1;
                } else if op.fregs_out & mask != 0 {
                    next_fpr[reg] = 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use pretty_assertions::assert_eq;

    pub fn addi(rd: u8, ra: u8, simm: i16) -> u32 {
        (14 << 26) | ((rd as u32) << 21) | ((ra as u32) << 16) | (simm as u16 as u32)
    }

    pub fn b(offset: i32) -> u32 {
        (18 << 26) | ((offset as u32) & 0x03FF_FFFC)
    }

    pub fn blr() -> u32 {
        (19 << 26) | (0x14 << 21) | (16 << 1)
    }

    fn analyze_at(mem: &Memory, pc: u32) -> (CodeBlock, Vec<CodeOp>) {
        let analyzer = Analyzer::default();
        let mut block = CodeBlock::default();
        let mut buffer = Vec::new();
        analyzer.analyze(pc, &mut block, &mut buffer, mem, 32);
        (block, buffer)
    }

    fn write_program(mem: &Memory, pc: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            mem.write_u32(pc + i as u32 * 4, *word).unwrap();
        }
    }

    #[test]
    fn straight_line_ends_at_branch() {
        let mem = Memory::new().unwrap();
        write_program(&mem, 0x8000_0000, &[addi(3, 0, 1), addi(4, 3, 2), blr()]);
        let (block, buffer) = analyze_at(&mem, 0x8000_0000);

        assert_eq!(block.num_instructions, 3);
        assert!(!block.broken);
        assert_eq!(buffer[2].op, Op::Bclr);
        assert_eq!(block.physical_addresses.len(), 3);
        // r3 is defined before use, so the only block input is none
        assert_eq!(block.gpr_inputs, 0);
    }

    #[test]
    fn liveness_discardable() {
        let mem = Memory::new().unwrap();
        // r3 = 1; r3 = 2 (first write dead); r4 = r3; blr
        write_program(
            &mem,
            0x8000_0000,
            &[addi(3, 0, 1), addi(3, 0, 2), addi(4, 3, 0), blr()],
        );
        let (_, buffer) = analyze_at(&mem, 0x8000_0000);

        // After op0, the next access to r3 is a write: discardable.
        assert_ne!(buffer[0].gpr_discardable & (1 << 3), 0);
        // After op1 it is read by op2: in use, not discardable.
        assert_eq!(buffer[1].gpr_discardable & (1 << 3), 0);
        assert_ne!(buffer[1].gpr_in_use & (1 << 3), 0);
    }

    #[test]
    fn unconditional_branch_is_followed() {
        let mem = Memory::new().unwrap();
        write_program(&mem, 0x8000_0000, &[addi(3, 0, 1), b(0x40 - 4)]);
        write_program(&mem, 0x8000_0040, &[addi(4, 0, 2), blr()]);
        let (block, buffer) = analyze_at(&mem, 0x8000_0000);

        assert_eq!(block.num_instructions, 4);
        assert!(buffer[1].skip);
        assert!(buffer[1].branch_followed);
        assert_eq!(buffer[2].address, 0x8000_0040);
    }

    #[test]
    fn idle_loop_is_not_followed() {
        let mem = Memory::new().unwrap();
        write_program(&mem, 0x8000_0000, &[b(0)]);
        let (block, buffer) = analyze_at(&mem, 0x8000_0000);

        assert_eq!(block.num_instructions, 1);
        assert!(buffer[0].is_idle_branch());
    }

    #[test]
    fn unmapped_fetch_raises_isi() {
        let mem = Memory::new().unwrap();
        let analyzer = Analyzer::default();
        let mut block = CodeBlock::default();
        let mut buffer = Vec::new();
        let next = analyzer.analyze(0x7000_0000, &mut block, &mut buffer, &mem, 32);
        assert!(block.memory_exception);
        assert_eq!(next, 0x7000_0000);
    }

    #[test]
    fn gqr_tracking() {
        let mem = Memory::new().unwrap();
        // psq_l f1, 0(r3), gqr2 ; blr
        let psq_l = (56 << 26) | (1 << 21) | (3 << 16) | (2 << 12);
        write_program(&mem, 0x8000_0000, &[psq_l, blr()]);
        let (block, _) = analyze_at(&mem, 0x8000_0000);
        assert_eq!(block.gqr_used, 1 << 2);
        assert_eq!(block.gqr_modified, 0);
    }
}
