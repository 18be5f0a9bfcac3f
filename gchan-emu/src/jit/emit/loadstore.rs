//! Load/store emitters. The hot path is a direct host access through the
//! logical fastmem window in rbx with the effective address in rax; the
//! fault handler backpatches any site that turns out to be I/O.

use dynasm::dynasm;
use dynasmrt::DynasmApi;
use smallvec::SmallVec;

use crate::cpu::analyzer::{CodeOp, Op, FL_UPDATE};
use crate::cpu::{ps0_offset, OFF_GATHER_PIPE_PTR};
use crate::jit::fastmem::{pad_site, TrampolineInfo, BACKPATCH_MIN_SIZE};
use crate::jit::reg_cache::RDX;
use crate::jit::{cur, Jit};
use crate::memory::MMIO_GATHER_PIPE;

impl Jit {
    /// Materializes the effective address into eax, folding immediates.
    fn emit_ea(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let x_form = matches!(
            op.op,
            Op::Lbzx | Op::Lhzx | Op::Lwzx | Op::Stbx | Op::Sthx | Op::Stwx
        );

        if x_form {
            let rb = inst.rb();
            if inst.ra() == 0 {
                let b = self.gpr.bind_read(cur!(self), rb);
                let e = cur!(self);
                dynasm!(e ; .arch x64 ; mov eax, Rd(b));
                return;
            }
            let a = self.gpr.bind_read(cur!(self), inst.ra());
            let b = self.gpr.bind_read(cur!(self), rb);
            let e = cur!(self);
            dynasm!(e ; .arch x64 ; lea eax, [Rq(a) + Rq(b)]);
            return;
        }

        let offset = inst.simm();
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

    /// rA := EA for update forms. Emitted before the access: fastmem
    /// faults complete the access through the trampoline, so the update
    /// is unconditional.
    fn emit_update(&mut self, op: &CodeOp) {
        if op.flags & FL_UPDATE == 0 {
            return;
        }
        let ra = op.inst.ra();
        if self.gpr.is_imm(ra) {
            // The base folded; rebind so the update lands in a register.
            self.gpr.bind_read(cur!(self), ra);
        }
        let a = self.gpr.bind_readwrite(cur!(self), ra);
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov Rd(a), eax);
    }

    fn load_size(op: Op) -> (u8, bool) {
        match op {
            Op::Lbz | Op::Lbzx => (1, false),
            Op::Lhz | Op::Lhzx => (2, false),
            Op::Lha => (2, true),
            _ => (4, false),
        }
    }

    pub(super) fn emit_load(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let (size, sign) = Self::load_size(op.op);
        let update = op.flags & FL_UPDATE != 0;

        if self.jo.memcheck && update {
            // The DSI check must gate the rA writeback; let the
            // interpreter order it.
            self.fallback_to_interpreter(op);
            return;
        }

        self.emit_ea(op);
        self.emit_update(op);
        let d = self.gpr.bind_write(cur!(self), inst.rd());

        if self.jo.fastmem && !self.jo.memcheck {
            let mut in_use: SmallVec<[u8; 8]> =
                self.gpr.caller_saved_in_use().into_iter().collect();
            in_use.retain(|&mut r| r != d);
            let xmm_in_use: SmallVec<[u8; 8]> =
                self.fpr.in_use_hosts().into_iter().collect();

            let e = cur!(self);
            let site_start = e.current();
            match (size, sign) {
                (1, _) => dynasm!(e ; .arch x64 ; movzx Rd(d), BYTE [rbx + rax]),
                (2, false) => dynasm!(e
                    ; .arch x64
                    ; movzx Rd(d), WORD [rbx + rax]
                    ; ror Rw(d), 8
                ),
                (2, true) => dynasm!(e
                    ; .arch x64
                    ; movzx Rd(d), WORD [rbx + rax]
                    ; ror Rw(d), 8
                    ; movsx Rd(d), Rw(d)
                ),
                _ => dynasm!(e
                    ; .arch x64
                    ; mov Rd(d), [rbx + rax]
                    ; bswap Rd(d)
                ),
            }
            let len = pad_site(e, site_start).max(BACKPATCH_MIN_SIZE as u8);

            self.back_patch_info.insert(
                site_start,
                TrampolineInfo {
                    start: site_start,
                    len,
                    pc: op.address,
                    access_size: size,
                    is_store: false,
                    dest_reg: d,
                    value_reg: 0,
                    sign_extend: sign,
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
        } else {
            let helper = match size {
                1 => crate::slow_read_u8 as usize,
                2 => crate::slow_read_u16 as usize,
                _ => crate::slow_read_u32 as usize,
            };
            let in_use: Vec<u8> = self
                .gpr
                .caller_saved_in_use()
                .into_iter()
                .filter(|&r| r != d)
                .collect();
            let xmm_in_use = self.fpr.in_use_hosts();
            let e = cur!(self);
            e.abi_call_with_xmm(&in_use, &xmm_in_use, helper, |e| {
                dynasm!(e
                    ; .arch x64
                    ; mov esi, eax
                    ; mov rdi, r14
                );
            });
            if sign {
                dynasm!(e ; .arch x64 ; movsx Rd(d), ax);
            } else {
                dynasm!(e ; .arch x64 ; mov Rd(d), eax);
            }
        }
    }

    fn store_size(op: Op) -> u8 {
        match op {
            Op::Stb | Op::Stbx => 1,
            Op::Sth | Op::Sthx => 2,
            _ => 4,
        }
    }

    pub(super) fn emit_store(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let size = Self::store_size(op.op);
        let update = op.flags & FL_UPDATE != 0;

        if self.jo.memcheck && update {
            self.fallback_to_interpreter(op);
            return;
        }

        // Stores to a compile-time gather-pipe address skip memory
        // entirely and go through the pipe pointer.
        if self.jo.optimize_gather_pipe && !self.jo.memcheck {
            let known = match (inst.ra(), self.gpr.imm_value(inst.ra())) {
                _ if matches!(op.op, Op::Stbx | Op::Sthx | Op::Stwx) => None,
                (0, _) => Some(inst.simm() as u32),
                (_, Some(base)) => Some(base.wrapping_add(inst.simm() as u32)),
                _ => None,
            };
            if known == Some(MMIO_GATHER_PIPE) && !update {
                self.emit_gather_pipe_store(op, size);
                return;
            }
        }

        let s_host = self.gpr.bind_read(cur!(self), inst.rs());
        self.emit_ea(op);
        self.emit_update(op);

        if self.jo.fastmem && !self.jo.memcheck {
            let in_use: SmallVec<[u8; 8]> =
                self.gpr.caller_saved_in_use().into_iter().collect();
            let xmm_in_use: SmallVec<[u8; 8]> =
                self.fpr.in_use_hosts().into_iter().collect();
            let dead_source = op.gpr_discardable & (1 << inst.rs()) != 0;

            let (site_start, fault_ip, value_reg, swapped_src) = if dead_source && size > 1 {
                // Swap in place; the fault handler swaps back before the
                // retry.
                let e = cur!(self);
                let site_start = e.current();
                if size == 2 {
                    dynasm!(e ; .arch x64 ; ror Rw(s_host), 8);
                } else {
                    dynasm!(e ; .arch x64 ; bswap Rd(s_host));
                }
                let fault_ip = e.current();
                if size == 2 {
                    dynasm!(e ; .arch x64 ; mov [rbx + rax], Rw(s_host));
                } else {
                    dynasm!(e ; .arch x64 ; mov [rbx + rax], Rd(s_host));
                }
                (site_start, fault_ip, s_host, Some(s_host))
            } else {
                let e = cur!(self);
                let site_start = e.current();
                match size {
                    1 => {
                        let fault_ip = site_start;
                        dynasm!(e ; .arch x64 ; mov [rbx + rax], Rb(s_host));
                        (site_start, fault_ip, s_host, None)
                    }
                    2 => {
                        dynasm!(e
                            ; .arch x64
                            ; mov edx, Rd(s_host)
                            ; ror dx, 8
                        );
                        let fault_ip = e.current();
                        dynasm!(e ; .arch x64 ; mov [rbx + rax], dx);
                        (site_start, fault_ip, s_host, None)
                    }
                    _ => {
                        dynasm!(e
                            ; .arch x64
                            ; mov edx, Rd(s_host)
                            ; bswap edx
                        );
                        let fault_ip = e.current();
                        dynasm!(e ; .arch x64 ; mov [rbx + rax], edx);
                        (site_start, fault_ip, s_host, None)
                    }
                }
            };
            let e = cur!(self);
            let len = pad_site(e, site_start);

            self.back_patch_info.insert(
                fault_ip,
                TrampolineInfo {
                    start: site_start,
                    len,
                    pc: op.address,
                    access_size: size,
                    is_store: true,
                    dest_reg: 0,
                    value_reg,
                    sign_extend: false,
                    registers_in_use: in_use,
                    xmm_in_use,
                    offset: 0,
                    offset_added_to_address: false,
                    op_reg_operand: 0,
                    non_atomic_swap_store_src: swapped_src,
                    trampoline: None,
                },
            );
            self.js.fastmem_load_store = Some(fault_ip);
        } else {
            let helper = match size {
                1 => crate::slow_write_u8 as usize,
                2 => crate::slow_write_u16 as usize,
                _ => crate::slow_write_u32 as usize,
            };
            let in_use = self.gpr.caller_saved_in_use();
            let xmm_in_use = self.fpr.in_use_hosts();
            let e = cur!(self);
            e.abi_call_with_xmm(&in_use, &xmm_in_use, helper, |e| {
                dynasm!(e
                    ; .arch x64
                    ; mov edx, Rd(s_host)
                    ; mov esi, eax
                    ; mov rdi, r14
                );
            });
        }
    }

    /// Immediate-addressed store into the write-gather pipe.
    fn emit_gather_pipe_store(&mut self, op: &CodeOp, size: u8) {
        let inst = op.inst;
        let value = self.gpr.imm_value(inst.rs());
        let s_host = match value {
            Some(_) => 0,
            None => self.gpr.bind_read(cur!(self), inst.rs()),
        };

        let e = cur!(self);
        dynasm!(e ; .arch x64 ; mov rdx, [rbp + OFF_GATHER_PIPE_PTR]);
        match (size, value) {
            (1, Some(v)) => dynasm!(e
                ; .arch x64
                ; mov BYTE [rdx], v as i8
            ),
            (1, None) => dynasm!(e ; .arch x64 ; mov [rdx], Rb(s_host)),
            (2, Some(v)) => {
                let swapped = (v as u16).swap_bytes();
                dynasm!(e ; .arch x64 ; mov WORD [rdx], swapped as i16);
            }
            (2, None) => dynasm!(e
                ; .arch x64
                ; mov eax, Rd(s_host)
                ; ror ax, 8
                ; mov [rdx], ax
            ),
            (_, Some(v)) => {
                let swapped = v.swap_bytes();
                dynasm!(e ; .arch x64 ; mov DWORD [rdx], swapped as i32);
            }
            (_, None) => dynasm!(e
                ; .arch x64
                ; mov eax, Rd(s_host)
                ; bswap eax
                ; mov [rdx], eax
            ),
        }
        dynasm!(e
            ; .arch x64
            ; add QWORD [rbp + OFF_GATHER_PIPE_PTR], size as i32
        );

        self.js.fifo_bytes_since_check += size as u32;
    }

    pub(super) fn emit_float_load(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let update = op.flags & FL_UPDATE != 0;
        if self.jo.memcheck && update {
            self.fallback_to_interpreter(op);
            return;
        }
        let double = op.op == Op::Lfd;
        let size: u8 = if double { 8 } else { 4 };

        self.emit_ea(op);
        self.emit_update(op);

        if self.jo.fastmem && !self.jo.memcheck {
            let in_use: SmallVec<[u8; 8]> =
                self.gpr.caller_saved_in_use().into_iter().collect();
            let xmm_in_use: SmallVec<[u8; 8]> =
                self.fpr.in_use_hosts().into_iter().collect();
            let e = cur!(self);
            let site_start = e.current();
            if double {
                dynasm!(e
                    ; .arch x64
                    ; mov rdx, [rbx + rax]
                    ; bswap rdx
                );
            } else {
                dynasm!(e
                    ; .arch x64
                    ; mov edx, [rbx + rax]
                    ; bswap edx
                );
            }
            let len = pad_site(e, site_start);
            self.back_patch_info.insert(
                site_start,
                TrampolineInfo {
                    start: site_start,
                    len,
                    pc: op.address,
                    access_size: size,
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
        } else {
            let helper = if double {
                crate::slow_read_u64 as usize
            } else {
                crate::slow_read_u32 as usize
            };
            let in_use = self.gpr.caller_saved_in_use();
            let xmm_in_use = self.fpr.in_use_hosts();
            let e = cur!(self);
            e.abi_call_with_xmm(&in_use, &xmm_in_use, helper, |e| {
                dynasm!(e
                    ; .arch x64
                    ; mov esi, eax
                    ; mov rdi, r14
                );
            });
            dynasm!(e ; .arch x64 ; mov rdx, rax);
        }

        // Value (swapped, natural) is in rdx/edx.
        if double {
            // lfd writes ps0 only.
            let f = self.fpr.bind_readwrite(cur!(self), inst.rd());
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; movq xmm0, rdx
                ; movsd Rx(f), xmm0
            );
        } else {
            // lfs replicates the single across both lanes.
            let f = self.fpr.bind_write(cur!(self), inst.rd());
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; movd xmm0, edx
                ; cvtss2sd xmm0, xmm0
                ; unpcklpd xmm0, xmm0
                ; movapd Rx(f), xmm0
            );
        }
    }

    pub(super) fn emit_float_store(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let update = op.flags & FL_UPDATE != 0;
        if self.jo.memcheck && update {
            self.fallback_to_interpreter(op);
            return;
        }
        let double = op.op == Op::Stfd;
        let size: u8 = if double { 8 } else { 4 };

        // Natural value into rdx before the address math.
        if let Some(f) = self.fpr.host_for(inst.rs()) {
            let e = cur!(self);
            if double {
                dynasm!(e ; .arch x64 ; movq rdx, Rx(f));
            } else {
                dynasm!(e
                    ; .arch x64
                    ; cvtsd2ss xmm0, Rx(f)
                    ; movd edx, xmm0
                );
            }
        } else {
            let ps0 = ps0_offset(inst.rs());
            let e = cur!(self);
            if double {
                dynasm!(e ; .arch x64 ; mov rdx, [rbp + ps0]);
            } else {
                dynasm!(e
                    ; .arch x64
                    ; movsd xmm0, [rbp + ps0]
                    ; cvtsd2ss xmm0, xmm0
                    ; movd edx, xmm0
                );
            }
        }

        self.emit_ea(op);
        self.emit_update(op);

        if self.jo.fastmem && !self.jo.memcheck {
            let in_use: SmallVec<[u8; 8]> =
                self.gpr.caller_saved_in_use().into_iter().collect();
            let xmm_in_use: SmallVec<[u8; 8]> =
                self.fpr.in_use_hosts().into_iter().collect();
            let e = cur!(self);
            let site_start = e.current();
            if double {
                dynasm!(e ; .arch x64 ; bswap rdx);
            } else {
                dynasm!(e ; .arch x64 ; bswap edx);
            }
            let fault_ip = e.current();
            if double {
                dynasm!(e ; .arch x64 ; mov [rbx + rax], rdx);
            } else {
                dynasm!(e ; .arch x64 ; mov [rbx + rax], edx);
            }
            let len = pad_site(e, site_start);
            self.back_patch_info.insert(
                fault_ip,
                TrampolineInfo {
                    start: site_start,
                    len,
                    pc: op.address,
                    access_size: size,
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
        } else {
            let helper = if double {
                crate::slow_write_u64 as usize
            } else {
                crate::slow_write_u32 as usize
            };
            let in_use = self.gpr.caller_saved_in_use();
            let xmm_in_use = self.fpr.in_use_hosts();
            let e = cur!(self);
            e.abi_call_with_xmm(&in_use, &xmm_in_use, helper, |e| {
                dynasm!(e
                    ; .arch x64
                    ; mov esi, eax
                    ; mov rdi, r14
                );
            });
        }
    }

    pub(super) fn emit_fmr(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let b = self.fpr.bind_read(cur!(self), inst.rb());
        let d = self.fpr.bind_readwrite(cur!(self), inst.rd());
        let e = cur!(self);
        dynasm!(e ; .arch x64 ; movsd Rx(d), Rx(b));
    }
}
