//! Quantized paired-single loads and stores.
//!
//! With a speculated-constant GQR of float type, the access inlines as a
//! fastmem pair load plus a cvt; every other quantization type re-reads
//! the GQR at run time through the interpreter routine.

use dynasm::dynasm;
use dynasmrt::DynasmApi;
use smallvec::SmallVec;

use crate::cpu::analyzer::CodeOp;
use crate::cpu::Gqr;
use crate::jit::fastmem::{pad_site, TrampolineInfo};
use crate::jit::reg_cache::RDX;
use crate::jit::{cur, Jit};

impl Jit {
    /// The speculated GQR for this access, when the guard at the block
    /// head pinned it.
    fn speculated_gqr(&self, op: &CodeOp) -> Option<Gqr> {
        let index = op.inst.ps_i();
        (self.js.constant_gqr_valid & (1 << index) != 0)
            .then(|| Gqr(self.js.constant_gqr[index]))
    }

    fn emit_psq_ea(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let offset = inst.ps_d();
        if inst.ra() == 0 {
            let ea = offset as u32;
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, ea as i32);
            return;
        }
        if let Some(base) = self.gpr.imm_value(inst.ra()) {
            let ea = base.wrapping_add(offset as u32);
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; mov eax, ea as i32);
            return;
        }
        let a = self.gpr.bind_read(cur!(self), inst.ra());
        let e = cur!(self);
        if offset == 0 {
            dynasm!(e ; .arch x64 ; mov eax, Rd(a));
        } else {
            dynasm!(e ; .arch x64 ; lea eax, [Rq(a) + offset]);
        }
    }

    pub(super) fn emit_psq_l(&mut self, op: &CodeOp) {
        let Some(gqr) = self.speculated_gqr(op) else {
            self.fallback_to_interpreter(op);
            return;
        };
        if gqr.ld_type() != 0 || !self.jo.fastmem || self.jo.memcheck {
            self.fallback_to_interpreter(op);
            return;
        }

        let inst = op.inst;
        let single = inst.ps_w();
        self.emit_psq_ea(op);

        let in_use: SmallVec<[u8; 8]> = self.gpr.caller_saved_in_use().into_iter().collect();
        let xmm_in_use: SmallVec<[u8; 8]> = self.fpr.in_use_hosts().into_iter().collect();
        let e = cur!(self);
        let site_start = e.current();
        if single {
            dynasm!(e
                ; .arch x64
                ; mov edx, [rbx + rax]
                ; bswap edx
            );
        } else {
            dynasm!(e
                ; .arch x64
                ; mov rdx, [rbx + rax]
                ; bswap rdx
            );
        }
        let len = pad_site(e, site_start);
        self.back_patch_info.insert(
            site_start,
            TrampolineInfo {
                start: site_start,
                len,
                pc: op.address,
                access_size: if single { 4 } else { 8 },
                is_store: false,
                dest_reg: RDX,
                value_reg: 0,
                sign_extend: false,
                registers_in_use: in_use,
                xmm_in_use,
                offset: 0,
                offset_added_to_address: false,
                op_reg_operand: 0,
                non_atomic_swap_store_src: None,
                trampoline: None,
            },
        );
        self.js.fastmem_load_store = Some(site_start);

        if single {
            // ps0 = value, ps1 = 1.0
            let one = self.const_pool.get(1.0f64.to_bits());
            let f = self.fpr.bind_write(cur!(self), inst.rd());
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; movd xmm0, edx
                ; cvtss2sd xmm0, xmm0
                ; mov rax, QWORD one as i64
                ; movsd xmm1, [rax]
                ; unpcklpd xmm0, xmm1
                ; movapd Rx(f), xmm0
            );
        } else {
            // Big-endian pair: after bswap the first element sits in the
            // high dword; rotate so cvtps2pd sees ps0 first.
            let f = self.fpr.bind_write(cur!(self), inst.rd());
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; rol rdx, 32
                ; movq xmm0, rdx
                ; cvtps2pd xmm0, xmm0
                ; movapd Rx(f), xmm0
            );
        }
    }

    pub(super) fn emit_psq_st(&mut self, op: &CodeOp) {
        let Some(gqr) = self.speculated_gqr(op) else {
            self.fallback_to_interpreter(op);
            return;
        };
        if gqr.st_type() != 0 || !self.jo.fastmem || self.jo.memcheck {
            self.fallback_to_interpreter(op);
            return;
        }

        let inst = op.inst;
        let single = inst.ps_w();

        // Value into rdx as the big-endian byte stream.
        let f = self.fpr.bind_read(cur!(self), inst.rs());
        {
            let e = cur!(self);
            if single {
                dynasm!(e
                    ; .arch x64
                    ; cvtsd2ss xmm0, Rx(f)
                    ; movd edx, xmm0
                );
            } else {
                dynasm!(e
                    ; .arch x64
                    ; cvtpd2ps xmm0, Rx(f)
                    ; movq rdx, xmm0
                    ; rol rdx, 32
                );
            }
        }

        self.emit_psq_ea(op);

        let in_use: SmallVec<[u8; 8]> = self.gpr.caller_saved_in_use().into_iter().collect();
        let xmm_in_use: SmallVec<[u8; 8]> = self.fpr.in_use_hosts().into_iter().collect();
        let e = cur!(self);
        let site_start = e.current();
        if single {
            dynasm!(e ; .arch x64 ; bswap edx);
        } else {
            dynasm!(e ; .arch x64 ; bswap rdx);
        }
        let fault_ip = e.current();
        if single {
            dynasm!(e ; .arch x64 ; mov [rbx + rax], edx);
        } else {
            dynasm!(e ; .arch x64 ; mov [rbx + rax], rdx);
        }
        let len = pad_site(e, site_start);
        self.back_patch_info.insert(
            fault_ip,
            TrampolineInfo {
                start: site_start,
                len,
                pc: op.address,
                access_size: if single { 4 } else { 8 },
                is_store: true,
                dest_reg: 0,
                value_reg: RDX,
                sign_extend: false,
                registers_in_use: in_use,
                xmm_in_use,
                offset: 0,
                offset_added_to_address: false,
                op_reg_operand: 0,
                non_atomic_swap_store_src: Some(RDX),
                trampoline: None,
            },
        );
        self.js.fastmem_load_store = Some(fault_ip);
    }
}
