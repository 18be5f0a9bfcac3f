//! The dynamic recompiler: analyze a straight-line guest region, emit
//! host code for it into the code region, and finalize it in the block
//! cache. Blocks link to each other lazily and everything the emitters
//! cannot handle falls back to the interpreter.

use std::collections::HashSet;

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::analyzer::{Analyzer, CodeBlock, CodeOp, FL_LOADSTORE, FL_USE_FPU};
use crate::cpu::{
    CpuState, PpcState, EXCEPTION_DSI, EXCEPTION_EXTERNAL_INT, EXCEPTION_FPU_UNAVAILABLE,
    EXCEPTION_ISI, OFF_DOWNCOUNT, OFF_EXCEPTIONS, OFF_GATHER_PIPE_BASE, OFF_GATHER_PIPE_PTR,
    OFF_MSR, OFF_NPC, OFF_PC, SPR_GQR0,
};
use crate::gpu::{INT_CAUSE_CP, INT_CAUSE_PE_FINISH, INT_CAUSE_PE_TOKEN};
use crate::memory::Memory;
use crate::{Emu, EmuCtx, HookKind};

pub mod asm_routines;
pub mod block_cache;
pub mod blr_stack;
pub mod code_region;
pub mod emit;
pub mod emitter;
pub mod fastmem;
pub mod fault;
pub mod reg_cache;

use asm_routines::AsmRoutines;
use block_cache::{BlockCache, BlockId, ProfileData};
use blr_stack::BlrStack;
use code_region::{CodeRegion, ConstPool, Region};
use emitter::{Cond, Emitter, FixupBranch};
use fastmem::{BackPatchInfo, FaultCtx, SlowMemHelpers};
use reg_cache::{FprCache, GprCache};

/// Current emitter: far code while a cold path is being written.
macro_rules! cur {
    ($s:expr) => {
        if $s.in_far {
            &mut $s.far
        } else {
            &mut $s.near
        }
    };
}
pub(crate) use cur;

/// Maximum guest instructions per block.
pub const MAX_BLOCK_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryFlag {
    InPpcState,
    InHostCarry,
    ConstantZero,
    ConstantOne,
}

/// Reasons a speculation bail stub forces a recompile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u32)]
pub enum ExceptionType {
    PairedQuantize = 0,
    SpeculativeConstants = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct JitOptions {
    pub enable_blocklink: bool,
    pub optimize_gather_pipe: bool,
    /// MMU exception checks on loads/stores.
    pub memcheck: bool,
    pub fastmem: bool,
    pub profile_blocks: bool,
    pub enable_debugging: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            enable_blocklink: true,
            optimize_gather_pipe: true,
            memcheck: false,
            fastmem: true,
            profile_blocks: false,
            enable_debugging: false,
        }
    }
}

/// Ephemeral state of one block compile.
pub struct JitState {
    pub block_start: u32,
    pub compiler_pc: u32,
    pub downcount_amount: u32,
    pub is_last_instruction: bool,
    pub first_fp_instruction_found: bool,
    pub fifo_bytes_since_check: u32,
    pub must_check_fifo: bool,
    pub carry_flag: CarryFlag,
    /// The analyzer paired this op with a carry consumer right behind
    /// it, so the carry may ride the host flags.
    pub next_op_consumes_carry: bool,
    pub constant_gqr: [u32; 8],
    pub constant_gqr_valid: u8,
    /// Host address of the current op's fastmem site, when one exists.
    pub fastmem_load_store: Option<usize>,
    /// The op emitted its own exception branch instead of the DSI test.
    pub fixup_exception_handler: bool,
    pub exception_handler: Option<FixupBranch>,
    pub cur_block: BlockId,
    /// Stable address of the current block's profile data, or 0.
    pub profile_ptr: usize,
}

impl Default for JitState {
    fn default() -> Self {
        Self {
            block_start: 0,
            compiler_pc: 0,
            downcount_amount: 0,
            is_last_instruction: false,
            first_fp_instruction_found: false,
            fifo_bytes_since_check: 0,
            must_check_fifo: false,
            carry_flag: CarryFlag::InPpcState,
            next_op_consumes_carry: false,
            constant_gqr: [0; 8],
            constant_gqr_valid: 0,
            fastmem_load_store: None,
            fixup_exception_handler: false,
            exception_handler: None,
            cur_block: 0,
            profile_ptr: 0,
        }
    }
}

/// What the translator needs from the rest of the system while compiling.
pub struct CompileCtx<'a> {
    pub mem: &'a Memory,
    pub ppc: &'a mut PpcState,
    pub hooks: &'a crate::Hle,
    pub stepping: bool,
}

pub struct Jit {
    pub region: CodeRegion,
    pub blocks: BlockCache,
    pub asm: AsmRoutines,
    pub gpr: GprCache,
    pub fpr: FprCache,
    pub const_pool: ConstPool,
    pub analyzer: Analyzer,
    pub jo: JitOptions,
    pub js: JitState,

    code_block: CodeBlock,
    code_buffer: Vec<CodeOp>,
    near: Emitter,
    far: Emitter,
    in_far: bool,

    pub back_patch_info: BackPatchInfo,
    slow_helpers: SlowMemHelpers,
    pub blr_stack: Option<BlrStack>,
    pub enable_blr_optimization: bool,
    cleanup_after_stackfault: bool,

    /// Gather-pipe writers discovered through backpatching.
    pub fifo_write_addresses: HashSet<u32>,
    /// Blocks whose GQR speculation misfired; compiled generic from now
    /// on.
    paired_quantize_addresses: HashSet<u32>,
    no_speculative_constants_addresses: HashSet<u32>,

    /// Address of the processor-interface cause register, read by the
    /// emitted external-interrupt check.
    pi_cause_ptr: usize,
    /// Runtime toggles mirrored from Config.
    pub no_block_cache: bool,
}

impl Jit {
    pub fn new() -> Result<Self, code_region::CodeRegionError> {
        let mut region = CodeRegion::new()?;
        let asm = AsmRoutines::emit(
            &mut region,
            dispatch_slowpath as usize,
            do_timing_slowpath as usize,
        );
        let mut const_pool = ConstPool::default();
        const_pool.init(region.const_pool());

        Ok(Self {
            region,
            blocks: BlockCache::new(),
            asm,
            gpr: GprCache::default(),
            fpr: FprCache::default(),
            const_pool,
            analyzer: Analyzer::default(),
            jo: JitOptions::default(),
            js: JitState::default(),
            code_block: CodeBlock::default(),
            code_buffer: Vec::new(),
            near: Emitter::new(0, 0),
            far: Emitter::new(0, 0),
            in_far: false,
            back_patch_info: BackPatchInfo::default(),
            slow_helpers: SlowMemHelpers {
                read_u8: crate::slow_read_u8 as usize,
                read_u16: crate::slow_read_u16 as usize,
                read_u32: crate::slow_read_u32 as usize,
                read_u64: crate::slow_read_u64 as usize,
                write_u8: crate::slow_write_u8 as usize,
                write_u16: crate::slow_write_u16 as usize,
                write_u32: crate::slow_write_u32 as usize,
                write_u64: crate::slow_write_u64 as usize,
            },
            blr_stack: None,
            enable_blr_optimization: false,
            cleanup_after_stackfault: false,
            fifo_write_addresses: HashSet::new(),
            paired_quantize_addresses: HashSet::new(),
            no_speculative_constants_addresses: HashSet::new(),
            pi_cause_ptr: 0,
            no_block_cache: false,
        })
    }

    pub fn init(&mut self, pi_cause_ptr: usize, config: &crate::Config) {
        self.jo.fastmem = config.fastmem;
        self.jo.enable_blocklink = !config.no_block_linking;
        self.jo.profile_blocks = config.profile_blocks;
        self.jo.enable_debugging = config.enable_debugging;
        self.no_block_cache = config.no_block_cache;
        self.pi_cause_ptr = pi_cause_ptr;
        self.blocks.set_dispatcher(self.asm.dispatcher);

        self.enable_blr_optimization =
            self.jo.enable_blocklink && self.jo.fastmem && !self.jo.enable_debugging;
        if self.enable_blr_optimization {
            self.blr_stack = BlrStack::alloc();
            if self.blr_stack.is_none() {
                self.enable_blr_optimization = false;
            }
        }
    }

    pub fn stack_top(&self) -> *mut u8 {
        self.blr_stack
            .as_ref()
            .map_or(std::ptr::null_mut(), |s| s.top())
    }

    /// The GQR speculation for this block start misfired at least once.
    pub fn gqr_speculation_disabled(&self, pc: u32) -> bool {
        self.paired_quantize_addresses.contains(&pc)
    }

    pub fn clear_cache(&mut self) {
        tracing::debug!("clearing JIT cache");
        self.blocks.clear();
        self.region.clear_trampolines();
        self.back_patch_info.clear();
        self.const_pool.clear();
        self.region.reset_free_ranges();
    }

    /// Entry from the dispatcher: translate the block at `em_address`.
    pub fn compile(&mut self, em_address: u32, cctx: &mut CompileCtx) {
        self.compile_inner(em_address, cctx, true);
    }

    fn compile_inner(&mut self, em_address: u32, cctx: &mut CompileCtx, retry_on_failure: bool) {
        if self.cleanup_after_stackfault {
            // The trigger guard stays unprotected: the translator itself
            // runs on the emulation stack, which may still be below the
            // guard line, and the optimization never re-enables anyway.
            self.clear_cache();
            self.cleanup_after_stackfault = false;
        }

        if self.region.trampolines_almost_full() || self.no_block_cache {
            if !self.no_block_cache {
                tracing::warn!("flushing trampoline code cache, please report if this happens a lot");
            }
            self.clear_cache();
        }

        // Return host ranges of invalidated blocks before looking for
        // space.
        let (near_freed, far_freed) = self.blocks.drain_freed_ranges();
        for (from, to) in near_freed {
            self.region.insert(Region::Near, from, to);
        }
        for (from, to) in far_freed {
            self.region.insert(Region::Far, from, to);
        }

        let mut block_size = MAX_BLOCK_SIZE;
        let mut enable_blocklink = self.jo.enable_blocklink;
        if self.jo.enable_debugging && cctx.stepping {
            block_size = 1;
            enable_blocklink = false;
            self.analyzer.branch_follow = false;
        } else {
            self.analyzer.branch_follow = true;
        }

        let next_pc = self.analyzer.analyze(
            em_address,
            &mut self.code_block,
            &mut self.code_buffer,
            cctx.mem,
            block_size,
        );

        if self.code_block.memory_exception {
            // Address of instruction could not be translated.
            cctx.ppc.npc = next_pc;
            cctx.ppc.exceptions |= EXCEPTION_ISI;
            tracing::warn!(pc = %gchan_utils::hex(next_pc), "ISI exception");
            return;
        }

        if self.set_emitters_to_free_regions() {
            let near_start = self.near.current();
            let far_start = self.far.current();

            let phys = Memory::instruction_address(em_address).expect("analyzed address maps");
            let id = self.blocks.allocate_block(phys);

            if self.do_jit(em_address, id, next_pc, enable_blocklink, cctx) {
                let near_end = self.near.current();
                if near_start != near_end {
                    self.region.erase(Region::Near, near_start, near_end);
                }
                let far_end = self.far.current();
                if far_start != far_end {
                    self.region.erase(Region::Far, far_start, far_end);
                }

                let block = self.blocks.block_mut(id);
                block.near = (near_start, near_end);
                block.far = (far_start, far_end);

                let physical_addresses = std::mem::take(&mut self.code_block.physical_addresses);
                self.blocks
                    .finalize_block(id, enable_blocklink, &physical_addresses);
                return;
            }
        }

        if retry_on_failure {
            tracing::warn!("flushing code caches, please report if this happens a lot");
            self.clear_cache();
            self.compile_inner(em_address, cctx, false);
            return;
        }

        panic!(
            "JIT failed to find code space after a cache clear. This should never happen. \
             Please report this incident."
        );
    }

    /// Points the near and far emitters at the largest free spans.
    fn set_emitters_to_free_regions(&mut self) -> bool {
        let near = match self.region.largest_free(Region::Near) {
            Ok(span) => span,
            Err(_) => {
                tracing::warn!("failed to find free memory region in near code region");
                return false;
            }
        };
        let far = match self.region.largest_free(Region::Far) {
            Ok(span) => span,
            Err(_) => {
                tracing::warn!("failed to find free memory region in far code region");
                return false;
            }
        };
        self.near = Emitter::new(near.0, near.1);
        self.far = Emitter::new(far.0, far.1);
        self.in_far = false;
        true
    }

    pub fn switch_to_far_code(&mut self) {
        self.in_far = true;
    }

    pub fn switch_to_near_code(&mut self) {
        self.in_far = false;
    }

    fn do_jit(
        &mut self,
        em_address: u32,
        id: BlockId,
        next_pc: u32,
        enable_blocklink: bool,
        cctx: &mut CompileCtx,
    ) -> bool {
        self.js = JitState {
            block_start: em_address,
            cur_block: id,
            ..JitState::default()
        };
        self.gpr.start();
        self.fpr.start();

        self.near.align4();
        let start = self.near.current();
        {
            let block = self.blocks.block_mut(id);
            block.checked_entry = start;
            block.normal_entry = start;
        }

        // Entry-side downcount check; exits carry their own as well so
        // linked jumps stay cheap.
        dynasm!(self.near
            ; .arch x64
            ; cmp DWORD [rbp + OFF_DOWNCOUNT], 0
        );
        let timing_ok = self.near.jcc_fixup(Cond::Greater);
        dynasm!(self.near
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], em_address as i32
        );
        self.near.jmp(self.asm.do_timing);
        self.near.set_jump_target(timing_ok);
        let normal_entry = self.near.current();
        self.blocks.block_mut(id).normal_entry = normal_entry;

        if self.jo.profile_blocks {
            let data = Box::<ProfileData>::default();
            let ptr = &*data as *const ProfileData as usize;
            self.blocks.block_mut(id).profile_data = Some(data);
            self.js.profile_ptr = ptr;
            self.emit_profile_preamble(ptr);
        }

        // Speculative GQR specialization.
        if !self.paired_quantize_addresses.contains(&em_address) {
            let gqr_static = self.code_block.gqr_used & !self.code_block.gqr_modified;
            if gqr_static != 0 {
                let target = self.emit_compile_exception_stub(ExceptionType::PairedQuantize);
                for gqr in 0..8u8 {
                    if gqr_static & (1 << gqr) == 0 {
                        continue;
                    }
                    let value = cctx.ppc.gqr(gqr as usize);
                    self.js.constant_gqr[gqr as usize] = value;
                    let offset = crate::cpu::spr_offset(SPR_GQR0 + gqr as usize);
                    dynasm!(self.near
                        ; .arch x64
                        ; cmp DWORD [rbp + offset], value as i32
                    );
                    self.near.jcc(Cond::NotZero, target);
                }
                self.js.constant_gqr_valid = gqr_static;
            }
        }

        if !self
            .no_speculative_constants_addresses
            .contains(&em_address)
        {
            self.initialize_speculative_constants(cctx.ppc);
        }

        let num_instructions = self.code_block.num_instructions;
        for index in 0..num_instructions {
            let op = self.code_buffer[index];
            self.js.compiler_pc = op.address;
            self.js.downcount_amount += op.cycles as u32;
            self.js.fastmem_load_store = None;
            self.js.fixup_exception_handler = false;
            self.js.exception_handler = None;
            self.js.is_last_instruction = index + 1 == num_instructions;
            self.js.next_op_consumes_carry = self
                .code_buffer
                .get(index + 1)
                .is_some_and(|next| matches!(next.op, crate::cpu::analyzer::Op::Adde));
            self.gpr.unlock_all();

            // Gather pipe writes using a non-immediate address are
            // discovered by profiling.
            let mut gather_pipe_int_check =
                self.fifo_write_addresses.contains(&op.address);

            if self.jo.optimize_gather_pipe
                && (self.js.fifo_bytes_since_check >= crate::fifo::gather_pipe::GATHER_PIPE_SIZE as u32
                    || self.js.must_check_fifo)
            {
                self.js.fifo_bytes_since_check = 0;
                self.js.must_check_fifo = false;
                self.flush_carry();
                let in_use = self.gpr.caller_saved_in_use();
                let xmm_in_use = self.fpr.in_use_hosts();
                let e = cur!(self);
                e.abi_call_with_xmm(
                    &in_use,
                    &xmm_in_use,
                    crate::fifo::gather_pipe::fast_check_gather_pipe as usize,
                    |e| dynasm!(e ; .arch x64 ; mov rdi, r14),
                );
                gather_pipe_int_check = true;
            }

            if gather_pipe_int_check {
                self.emit_external_interrupt_check(op.address);
            }

            if self.handle_function_hooking(op.address, cctx) {
                break;
            }

            if op.skip {
                continue;
            }

            if op.flags & FL_USE_FPU != 0 && !self.js.first_fp_instruction_found {
                self.emit_fp_unavailable_check(op.address);
                self.js.first_fp_instruction_found = true;
            }

            if self.jo.enable_debugging
                && cctx.hooks.breakpoints.contains(&op.address)
                && !cctx.stepping
            {
                // No linking through breakpoints, or Step Over would run
                // past them.
                self.emit_breakpoint_check(op.address);
            }

            // Preload inputs that stay live, leaving room for the output.
            self.gpr
                .preload(cur!(self), op.regs_in & op.gpr_in_use & !op.gpr_discardable);
            self.fpr
                .preload(cur!(self), op.fregs_in & op.fpr_in_use & !op.fpr_discardable);

            emit::compile_instruction(self, &op);

            if self.jo.memcheck && op.flags & FL_LOADSTORE != 0 {
                self.emit_memcheck_exception(op.address);
            }

            // Dead registers are dropped; regs with no further use in the
            // block get written back now while the store is cheap.
            self.gpr.discard(op.gpr_discardable);
            self.fpr.discard(op.fpr_discardable);
            self.gpr
                .flush_masked(cur!(self), !op.gpr_in_use & (op.regs_in | op.regs_out));
            self.fpr
                .flush_masked(cur!(self), !op.fpr_in_use & (op.fregs_in | op.fregs_out));
        }

        if self.code_block.broken {
            self.flush_carry();
            self.gpr.flush(cur!(self));
            self.fpr.flush(cur!(self));
            self.write_exit(next_pc, false, 0);
        }

        if self.near.has_write_failed() || self.far.has_write_failed() {
            if self.near.has_write_failed() {
                tracing::warn!("JIT ran out of space in near code region during code generation");
            }
            if self.far.has_write_failed() {
                tracing::warn!("JIT ran out of space in far code region during code generation");
            }
            return false;
        }

        let block = self.blocks.block_mut(id);
        block.code_size = (self.near.current() - start) as u32;
        block.original_size = num_instructions as u32;
        true
    }

    fn emit_profile_preamble(&mut self, profile_ptr: usize) {
        let run_count = std::mem::offset_of!(ProfileData, run_count) as i32;
        let tic_start = std::mem::offset_of!(ProfileData, tic_start) as i32;
        dynasm!(self.near
            ; .arch x64
            ; push rcx
            ; mov rcx, QWORD profile_ptr as i64
            ; add QWORD [rcx + run_count], 1
            ; rdtsc
            ; shl rdx, 32
            ; or rax, rdx
            ; mov [rcx + tic_start], rax
            ; pop rcx
        );
    }

    /// Far-code stub that forces a recompile of this block with the given
    /// speculation disabled.
    fn emit_compile_exception_stub(&mut self, kind: ExceptionType) -> usize {
        self.switch_to_far_code();
        let target = self.far.current();
        let block_start = self.js.block_start;
        tracing::trace!(%kind, pc = %gchan_utils::hex(block_start), "speculation bail stub");
        dynasm!(self.far
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], block_start as i32
        );
        let kind = kind as u32 as i32;
        self.far.abi_call_with(&[], compile_exception_check as usize, |e| {
            dynasm!(e
                ; .arch x64
                ; mov rdi, r14
                ; mov esi, kind
            );
        });
        let dispatcher_no_check = self.asm.dispatcher_no_check;
        self.far.jmp(dispatcher_no_check);
        self.switch_to_near_code();
        target
    }

    /// Treat block inputs that currently hold gather-pipe-looking
    /// addresses as constants, guarded by a runtime check.
    fn initialize_speculative_constants(&mut self, ppc: &PpcState) {
        let mut target = None;
        for reg in 0..32u8 {
            if self.code_block.gpr_inputs & (1 << reg) == 0 {
                continue;
            }
            let value = ppc.gpr[reg as usize];
            let wpar = ppc.spr[crate::cpu::SPR_WPAR] & !0x1F;
            let looks_like_gather_pipe = (wpar != 0 && (value == wpar || value == wpar - 0x8000))
                || value == crate::memory::MMIO_GATHER_PIPE
                || value == crate::memory::MMIO_GATHER_PIPE - 0x8000
                || value == 0xCC00_0000;
            if !looks_like_gather_pipe {
                continue;
            }
            let target = *target.get_or_insert_with(|| {
                // Deferred so blocks with no such inputs emit nothing.
                self.emit_compile_exception_stub(ExceptionType::SpeculativeConstants)
            });
            let offset = crate::cpu::gpr_offset(reg);
            dynasm!(self.near
                ; .arch x64
                ; cmp DWORD [rbp + offset], value as i32
            );
            self.near.jcc(Cond::NotZero, target);
            self.gpr.set_imm(reg, value, false);
        }
    }

    /// Test for a pending external interrupt; the far path flushes and
    /// leaves through the external-exception exit.
    fn emit_external_interrupt_check(&mut self, address: u32) {
        self.flush_carry();
        dynasm!(self.near
            ; .arch x64
            ; test DWORD [rbp + OFF_EXCEPTIONS], EXCEPTION_EXTERNAL_INT as i32
        );
        let ext_exception = self.near.jcc_fixup(Cond::NotZero);

        self.switch_to_far_code();
        let far_entry = self.far.current();
        ext_exception.patch(far_entry);
        dynasm!(self.far
            ; .arch x64
            ; test DWORD [rbp + OFF_MSR], 0x8000
        );
        let no_ee = self.far.jcc_fixup(Cond::Zero);
        let cause_ptr = self.pi_cause_ptr;
        let cause_mask = (INT_CAUSE_CP | INT_CAUSE_PE_TOKEN | INT_CAUSE_PE_FINISH) as i32;
        dynasm!(self.far
            ; .arch x64
            ; mov rax, QWORD cause_ptr as i64
            ; test DWORD [rax], cause_mask
        );
        let no_cp_int = self.far.jcc_fixup(Cond::Zero);

        {
            let gpr_snapshot = self.gpr.snapshot();
            let fpr_snapshot = self.fpr.snapshot();
            self.gpr.flush(&mut self.far);
            self.fpr.flush(&mut self.far);
            dynasm!(self.far
                ; .arch x64
                ; mov DWORD [rbp + OFF_PC], address as i32
            );
            self.write_external_exception_exit();
            self.gpr.restore(gpr_snapshot);
            self.fpr.restore(fpr_snapshot);
        }
        let back = self.near.current();
        no_ee.patch(back);
        no_cp_int.patch(back);
        self.switch_to_near_code();
    }

    fn emit_fp_unavailable_check(&mut self, address: u32) {
        dynasm!(self.near
            ; .arch x64
            ; test DWORD [rbp + OFF_MSR], 1 << 13
        );
        let unavailable = self.near.jcc_fixup(Cond::Zero);

        self.switch_to_far_code();
        unavailable.patch(self.far.current());
        {
            let gpr_snapshot = self.gpr.snapshot();
            let fpr_snapshot = self.fpr.snapshot();
            self.gpr.flush(&mut self.far);
            self.fpr.flush(&mut self.far);
            dynasm!(self.far
                ; .arch x64
                ; mov DWORD [rbp + OFF_PC], address as i32
                ; or DWORD [rbp + OFF_EXCEPTIONS], EXCEPTION_FPU_UNAVAILABLE as i32
            );
            self.write_exception_exit();
            self.gpr.restore(gpr_snapshot);
            self.fpr.restore(fpr_snapshot);
        }
        self.switch_to_near_code();
    }

    fn emit_breakpoint_check(&mut self, address: u32) {
        self.flush_carry();
        self.gpr.flush(&mut self.near);
        self.fpr.flush(&mut self.near);
        dynasm!(self.near
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], address as i32
        );
        self.near
            .abi_call_with(&[], check_breakpoints as usize, |e| {
                dynasm!(e ; .arch x64 ; mov rdi, r14);
            });
        // A nonzero return means the CPU switched to stepping; leave
        // through the dispatcher.
        dynasm!(self.near ; .arch x64 ; test eax, eax);
        let no_breakpoint = self.near.jcc_fixup(Cond::Zero);
        self.write_exit(address, false, 0);
        self.near.set_jump_target(no_breakpoint);
    }

    /// After a fallback load/store with MMU checks on, test the DSI bit
    /// and leave through a far exception exit.
    fn emit_memcheck_exception(&mut self, address: u32) {
        if self.js.fastmem_load_store.is_some() && self.js.fixup_exception_handler {
            debug_assert!(false, "fastmem loadstores don't take exception fixups");
        }
        let branch = if self.js.fastmem_load_store.is_none() && !self.js.fixup_exception_handler {
            dynasm!(self.near
                ; .arch x64
                ; test DWORD [rbp + OFF_EXCEPTIONS], EXCEPTION_DSI as i32
            );
            Some(self.near.jcc_fixup(Cond::NotZero))
        } else {
            // A null fastmem site means there is nothing to register an
            // exception handler for.
            self.js.exception_handler.take()
        };
        let Some(branch) = branch else { return };

        self.switch_to_far_code();
        branch.patch(self.far.current());
        let gpr_snapshot = self.gpr.snapshot();
        let fpr_snapshot = self.fpr.snapshot();
        self.gpr.flush(&mut self.far);
        self.fpr.flush(&mut self.far);
        dynasm!(self.far
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], address as i32
        );
        self.write_exception_exit();
        self.gpr.restore(gpr_snapshot);
        self.fpr.restore(fpr_snapshot);
        self.switch_to_near_code();
    }

    fn handle_function_hooking(&mut self, address: u32, cctx: &mut CompileCtx) -> bool {
        let Some((index, kind)) = cctx.hooks.lookup(address) else {
            return false;
        };
        if kind == HookKind::None {
            return false;
        }

        self.flush_carry();
        self.js.carry_flag = CarryFlag::InPpcState;
        self.gpr.flush(&mut self.near);
        self.fpr.flush(&mut self.near);
        self.near.abi_call_with(&[], hle_execute as usize, |e| {
            dynasm!(e
                ; .arch x64
                ; mov rdi, r14
                ; mov esi, address as i32
                ; mov edx, index as i32
            );
        });

        if kind != HookKind::Replace {
            return false;
        }

        dynasm!(self.near ; .arch x64 ; mov eax, [rbp + OFF_NPC]);
        self.js.downcount_amount += self.code_block.stats.num_cycles;
        self.write_exit_dest_in_eax();
        true
    }

    /// Gather-pipe flush plus profiling accumulation at exits. Returns
    /// true when it emitted anything that clobbers rax/rdx.
    pub fn cleanup(&mut self) -> bool {
        let mut did_something = false;

        if self.jo.optimize_gather_pipe && self.js.fifo_bytes_since_check > 0 {
            let update = crate::fifo::gather_pipe::update_gather_pipe as usize;
            let pipe_size = crate::fifo::gather_pipe::GATHER_PIPE_SIZE as i32;
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; mov rax, [rbp + OFF_GATHER_PIPE_PTR]
                ; sub rax, [rbp + OFF_GATHER_PIPE_BASE]
                ; cmp rax, pipe_size
            );
            let exit = e.jcc_fixup(Cond::Less);
            e.abi_call_with(&[], update, |e| {
                dynasm!(e ; .arch x64 ; mov rdi, r14);
            });
            e.set_jump_target(exit);
            did_something = true;
        }

        if self.jo.profile_blocks && self.js.profile_ptr != 0 {
            let profile_ptr = self.js.profile_ptr;
            let downcount_amount = self.js.downcount_amount;
            let tic_start = std::mem::offset_of!(ProfileData, tic_start) as i32;
            let tic_stop = std::mem::offset_of!(ProfileData, tic_stop) as i32;
            let tic_counter = std::mem::offset_of!(ProfileData, tic_counter) as i32;
            let downcount_counter = std::mem::offset_of!(ProfileData, downcount_counter) as i32;
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; push rcx
                ; mov rcx, QWORD profile_ptr as i64
                ; rdtsc
                ; shl rdx, 32
                ; or rax, rdx
                ; mov [rcx + tic_stop], rax
                ; sub rax, [rcx + tic_start]
                ; add [rcx + tic_counter], rax
                ; add QWORD [rcx + downcount_counter], downcount_amount as i32
                ; pop rcx
            );
            did_something = true;
        }

        did_something
    }

    /// Spills a host-carry value back into XER.CA.
    pub fn flush_carry(&mut self) {
        if self.js.carry_flag == CarryFlag::InHostCarry {
            let xer = crate::cpu::spr_offset(crate::cpu::SPR_XER);
            let e = cur!(self);
            dynasm!(e
                ; .arch x64
                ; setc al
                ; movzx eax, al
                ; shl eax, 29
                ; mov edx, [rbp + xer]
                ; and edx, !(1 << 29) as i32
                ; or edx, eax
                ; mov [rbp + xer], edx
            );
            self.js.carry_flag = CarryFlag::InPpcState;
        }
    }

    // ---- exit writers ---------------------------------------------------

    /// Fakes the BLR-stack frame for an inlined BL so a later BLR can
    /// still fast-return.
    pub fn fake_bl_call(&mut self, after: u32) {
        if !self.enable_blr_optimization {
            return;
        }
        dynasm!(self.near
            ; .arch x64
            ; mov edx, after as i32
            ; push rdx
        );
        let (_, skip_exit) = self.near.call_fixup();
        dynasm!(self.near ; .arch x64 ; pop rdx);
        self.just_write_exit(after, false, 0);
        self.near.set_jump_target(skip_exit);
    }

    pub fn write_exit(&mut self, destination: u32, bl: bool, after: u32) {
        let bl = bl && self.enable_blr_optimization;
        self.cleanup();
        if bl {
            dynasm!(self.near
                ; .arch x64
                ; mov edx, after as i32
                ; push rdx
            );
        }
        let amount = self.js.downcount_amount;
        dynasm!(self.near
            ; .arch x64
            ; sub DWORD [rbp + OFF_DOWNCOUNT], amount as i32
        );
        self.just_write_exit(destination, bl, after);
    }

    fn just_write_exit(&mut self, destination: u32, bl: bool, after: u32) {
        dynasm!(self.near
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], destination as i32
        );
        // Links are keyed by the destination's physical address; an
        // untranslatable destination stays dispatcher-bound forever.
        let exit_address = Memory::instruction_address(destination).unwrap_or(u32::MAX);

        let exit_ptr;
        if bl {
            let do_timing = self.near.jcc_fixup(Cond::LessEqual);
            self.switch_to_far_code();
            do_timing.patch(self.far.current());
            self.far.call(self.asm.do_timing);
            let after_timing = self.far.jmp_fixup();
            self.switch_to_near_code();

            exit_ptr = self.near.call(self.asm.dispatcher_no_timing_check);

            self.near.set_jump_target(after_timing);
            dynasm!(self.near ; .arch x64 ; pop rax);
            self.just_write_exit(after, false, 0);
        } else {
            self.near.jcc(Cond::LessEqual, self.asm.do_timing);
            exit_ptr = self.near.jmp(self.asm.dispatcher_no_timing_check);
        }

        self.blocks
            .block_mut(self.js.cur_block)
            .links
            .push(block_cache::LinkData {
                exit_address,
                exit_ptr,
                is_call: bl,
                linked: false,
            });
    }

    /// Exit with the destination PC in eax.
    pub fn write_exit_dest_in_eax(&mut self) {
        dynasm!(self.near ; .arch x64 ; mov [rbp + OFF_PC], eax);
        self.cleanup();
        let amount = self.js.downcount_amount;
        dynasm!(self.near
            ; .arch x64
            ; sub DWORD [rbp + OFF_DOWNCOUNT], amount as i32
        );
        self.near.jmp(self.asm.dispatcher);
    }

    /// BLR with the link value in eax: compare against the host-stack
    /// hint and `ret` straight back on a match.
    pub fn write_blr_exit(&mut self) {
        if !self.enable_blr_optimization {
            self.write_exit_dest_in_eax();
            return;
        }
        dynasm!(self.near ; .arch x64 ; mov [rbp + OFF_PC], eax);
        let disturbed = self.cleanup();
        if disturbed {
            dynasm!(self.near ; .arch x64 ; mov eax, [rbp + OFF_PC]);
        }
        let amount = self.js.downcount_amount;
        dynasm!(self.near
            ; .arch x64
            ; mov edx, amount as i32
            ; cmp rax, [rsp + 8]
        );
        self.near
            .jcc(Cond::NotZero, self.asm.dispatcher_mispredicted_blr);
        dynasm!(self.near
            ; .arch x64
            ; sub [rbp + OFF_DOWNCOUNT], edx
            ; ret
        );
    }

    pub fn write_idle_exit(&mut self, destination: u32) {
        self.near.abi_call_with(&[], core_idle as usize, |e| {
            dynasm!(e ; .arch x64 ; mov rdi, r14);
        });
        dynasm!(self.near
            ; .arch x64
            ; mov DWORD [rbp + OFF_PC], destination as i32
        );
        self.write_exception_exit();
    }

    pub fn write_exception_exit(&mut self) {
        self.write_exception_exit_with(check_exceptions_thunk as usize);
    }

    pub fn write_external_exception_exit(&mut self) {
        self.write_exception_exit_with(check_external_exceptions_thunk as usize);
    }

    fn write_exception_exit_with(&mut self, handler: usize) {
        self.cleanup();
        let amount = self.js.downcount_amount;
        let dispatcher = self.asm.dispatcher;
        let e = cur!(self);
        dynasm!(e
            ; .arch x64
            ; mov eax, [rbp + OFF_PC]
            ; mov [rbp + OFF_NPC], eax
        );
        e.abi_call_with(&[], handler, |e| {
            dynasm!(e ; .arch x64 ; mov rdi, r14);
        });
        dynasm!(e
            ; .arch x64
            ; sub DWORD [rbp + OFF_DOWNCOUNT], amount as i32
        );
        e.jmp(dispatcher);
    }

    // ---- fault handling -------------------------------------------------

    /// Decision function for host faults. True when the fault was ours
    /// and the context has been fixed up to resume.
    pub fn handle_fault(&mut self, access_address: usize, ctx: &mut FaultCtx, mem: &Memory) -> bool {
        if let Some(stack) = &self.blr_stack {
            if self.enable_blr_optimization && stack.is_trigger_fault(access_address) {
                return self.handle_stack_fault();
            }
        }

        let Some(guest_addr) = mem.guest_address_of_fault(access_address) else {
            return false;
        };
        self.backpatch(guest_addr, ctx)
    }

    fn handle_stack_fault(&mut self) -> bool {
        tracing::warn!("BLR cache disabled due to excessive BL in the emulated program");
        self.enable_blr_optimization = false;
        if let Some(stack) = &self.blr_stack {
            stack.unprotect_trigger_guard();
        }
        // The cache is full of bad CALLs; flag a clear for the next
        // translator entry and force the dispatcher to take over.
        self.blocks.invalidate_icache(0, 0xFFFF_FFFF, true);
        self.blocks.clear_ranges_to_free();
        self.cleanup_after_stackfault = true;
        true
    }

    fn backpatch(&mut self, guest_addr: u32, ctx: &mut FaultCtx) -> bool {
        let code_ptr = ctx.rip;
        if !self.region.contains(code_ptr) {
            return false;
        }
        let helpers = self.slow_helpers;

        let info = match self.back_patch_info.get_mut(code_ptr) {
            Some(info) => info.clone(),
            None => {
                tracing::error!(
                    rip = %gchan_utils::hex(code_ptr as u64),
                    "backpatch: no register use entry for address"
                );
                return false;
            }
        };

        let trampoline = match info.trampoline {
            Some(t) => t,
            None => {
                // First fault here: build the slow path and patch the
                // site over to it.
                let span_needed = 96 + info.registers_in_use.len() * 4;
                let span = self.region.alloc_trampoline(span_needed);
                let mut e = Emitter::new(span.0, span.1);
                let t = fastmem::generate_trampoline(&mut e, &info, &helpers);
                assert!(!e.has_write_failed(), "trampoline overflow");
                fastmem::patch_site(&info, t);
                self.back_patch_info
                    .get_mut(code_ptr)
                    .expect("site still registered")
                    .trampoline = Some(t);
                t
            }
        };

        fastmem::undo_partial_effects(&info, ctx);

        // Stores that landed in the gather pipe teach the translator to
        // check the FIFO at this address from now on.
        if info.is_store
            && (crate::memory::MMIO_GATHER_PIPE..crate::memory::MMIO_GATHER_PIPE + 0x40)
                .contains(&guest_addr)
        {
            self.fifo_write_addresses.insert(info.pc);
        }

        ctx.rip = trampoline;
        true
    }
}

// ---- extern entry points used by emitted code ---------------------------

/// Dispatcher slow path: look up (compiling on miss) and return the next
/// block entry, or null to leave `enter_code`.
pub unsafe extern "C" fn dispatch_slowpath(ctx: *mut EmuCtx) -> *const u8 {
    let emu = unsafe { &mut *(*ctx).emu };
    for _ in 0..8 {
        let stepping = match emu.cpu_state.get() {
            CpuState::Running => false,
            // One block per single_step, then back to the host.
            CpuState::Stepping if emu.stepping_dispatched => return std::ptr::null(),
            CpuState::Stepping => true,
            CpuState::PowerDown => return std::ptr::null(),
        };
        if emu.ppc.exceptions != 0 {
            emu.check_exceptions();
        }
        let pc = emu.ppc.pc;
        let Some(phys) = Memory::instruction_address(pc) else {
            emu.ppc.npc = pc;
            emu.ppc.exceptions |= EXCEPTION_ISI;
            continue;
        };
        if let Some(block) = emu.jit.blocks.get_by_start(phys) {
            emu.stepping_dispatched = stepping;
            return block.checked_entry as *const u8;
        }
        emu.jit_compile(pc);
    }
    panic!(
        "dispatcher failed to reach a block at pc {}",
        gchan_utils::hex(emu.ppc.pc)
    );
}

/// Timing slow path: hand control to the host scheduler.
pub unsafe extern "C" fn do_timing_slowpath(ctx: *mut EmuCtx) {
    let emu = unsafe { &mut *(*ctx).emu };
    emu.advance_timing();
}

unsafe extern "C" fn compile_exception_check(ctx: *mut EmuCtx, kind: u32) {
    let emu = unsafe { &mut *(*ctx).emu };
    let pc = emu.ppc.pc;
    match kind {
        k if k == ExceptionType::PairedQuantize as u32 => {
            emu.jit.paired_quantize_addresses.insert(pc);
        }
        _ => {
            emu.jit.no_speculative_constants_addresses.insert(pc);
        }
    }
    if let Some(phys) = Memory::instruction_address(pc) {
        emu.jit.blocks.invalidate_icache(phys, phys + 4, false);
    }
}

unsafe extern "C" fn check_exceptions_thunk(ctx: *mut EmuCtx) {
    let emu = unsafe { &mut *(*ctx).emu };
    emu.check_exceptions();
}

unsafe extern "C" fn check_external_exceptions_thunk(ctx: *mut EmuCtx) {
    let emu = unsafe { &mut *(*ctx).emu };
    emu.check_external_exceptions();
}

/// Returns nonzero when the CPU flipped to stepping at this breakpoint.
unsafe extern "C" fn check_breakpoints(ctx: *mut EmuCtx) -> u32 {
    let emu = unsafe { &mut *(*ctx).emu };
    if emu.hle.breakpoints.contains(&emu.ppc.pc) {
        emu.cpu_state.set(CpuState::Stepping);
    }
    u32::from(emu.cpu_state.is_stepping())
}

unsafe extern "C" fn core_idle(ctx: *mut EmuCtx) {
    let emu = unsafe { &mut *(*ctx).emu };
    emu.idle();
}

unsafe extern "C" fn hle_execute(ctx: *mut EmuCtx, pc: u32, index: u32) {
    let emu = unsafe { &mut *(*ctx).emu };
    emu.hle_execute(pc, index);
}

/// Raw entry used by the signal handler.
pub(crate) unsafe fn handle_fault_raw(
    ctx: *mut EmuCtx,
    access_address: usize,
    fault_ctx: &mut FaultCtx,
) -> bool {
    let emu = unsafe { &mut *(*ctx).emu };
    let blr_was_enabled = emu.jit.enable_blr_optimization;
    let handled = {
        let Emu { jit, mem, .. } = emu;
        jit.handle_fault(access_address, fault_ctx, mem)
    };
    // A guard hit wants the dispatcher back in control promptly.
    if handled && blr_was_enabled && !emu.jit.enable_blr_optimization {
        emu.force_exception_check(0);
    }
    handled
}
