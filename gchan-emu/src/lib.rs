//! Gekko dynamic-recompiler core with CPU-GPU FIFO synchronization.
//!
//! `Emu` wires the pieces together: guest state, the fastmem-backed
//! memory, the translator and its code region, the gather pipe, and the
//! FIFO synchronizer with its optional GPU thread.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::mem::offset_of;
use std::sync::Arc;

use thiserror::Error;

pub mod cpu;
pub mod fifo;
pub mod gpu;
pub mod jit;
pub mod memory;
pub mod savestate;

#[cfg(test)]
mod emu_tests;

use cpu::{
    CpuState, CpuStateFlag, Msr, PpcState, EXCEPTION_ALIGNMENT, EXCEPTION_DECREMENTER,
    EXCEPTION_DSI, EXCEPTION_EXTERNAL_INT, EXCEPTION_FPU_UNAVAILABLE, EXCEPTION_ISI,
    EXCEPTION_PROGRAM, EXCEPTION_SYSCALL, SPR_SRR0, SPR_SRR1,
};
use fifo::gather_pipe::GatherPipe;
use fifo::FifoSync;
use gpu::{ChunkDecoder, CommandProcessor, OpcodeDecoder, ProcessorInterface};
use jit::{CompileCtx, Jit};
use memory::Memory;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error(transparent)]
    Memory(#[from] memory::MemoryError),
    #[error(transparent)]
    CodeRegion(#[from] jit::code_region::CodeRegionError),
}

/// Runtime tunables; the FS and TR subsets mirror the distinction in the
/// configuration registry.
#[derive(Debug, Clone)]
pub struct Config {
    pub fastmem: bool,
    pub enable_debugging: bool,
    pub profile_blocks: bool,
    pub no_block_cache: bool,
    pub no_block_linking: bool,
    pub dual_core: bool,
    pub deterministic_gpu_thread: bool,
    pub sync_gpu: bool,
    pub sync_gpu_max_distance: i32,
    pub sync_gpu_min_distance: i32,
    pub sync_gpu_overclock: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fastmem: true,
            enable_debugging: false,
            profile_blocks: false,
            no_block_cache: false,
            no_block_linking: false,
            dual_core: false,
            deterministic_gpu_thread: false,
            sync_gpu: false,
            sync_gpu_max_distance: 200_000,
            sync_gpu_min_distance: -200_000,
            sync_gpu_overclock: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    None,
    Start,
    Replace,
}

pub type HookFn = fn(&mut Emu);

/// High-level replacement functions plus the debugger's breakpoints.
#[derive(Default)]
pub struct Hle {
    hooks: HashMap<u32, (u32, HookKind)>,
    handlers: Vec<HookFn>,
    pub breakpoints: HashSet<u32>,
}

impl Hle {
    pub fn register(&mut self, pc: u32, kind: HookKind, handler: HookFn) -> u32 {
        let index = self.handlers.len() as u32;
        self.handlers.push(handler);
        self.hooks.insert(pc, (index, kind));
        index
    }

    pub fn lookup(&self, pc: u32) -> Option<(u32, HookKind)> {
        self.hooks.get(&pc).copied()
    }
}

/// Context block emitted code addresses through r14. repr(C): the asm
/// routines read the leading fields by fixed offset.
#[repr(C)]
pub struct EmuCtx {
    pub ppc: *mut PpcState,
    pub logical_base: *mut u8,
    pub stack_top: *mut u8,
    pub saved_host_rsp: u64,
    pub emu: *mut Emu,
}

pub const CTX_OFF_PPC: i32 = offset_of!(EmuCtx, ppc) as i32;
pub const CTX_OFF_LOGICAL_BASE: i32 = offset_of!(EmuCtx, logical_base) as i32;
pub const CTX_OFF_STACK_TOP: i32 = offset_of!(EmuCtx, stack_top) as i32;
pub const CTX_OFF_SAVED_RSP: i32 = offset_of!(EmuCtx, saved_host_rsp) as i32;

const MMIO_END: u32 = 0xCE00_0000;

impl EmuCtx {
    /// # Safety-adjacent: only valid while the owning Emu is alive.
    fn emu(&mut self) -> &mut Emu {
        unsafe { &mut *self.emu }
    }

    pub fn read_u8(&mut self, ea: u32) -> Option<u8> {
        if let Some(value) = self.emu().mem.read_u8(ea) {
            return Some(value);
        }
        self.mmio_read(ea).map(|v| v as u8)
    }

    pub fn read_u16(&mut self, ea: u32) -> Option<u16> {
        if let Some(value) = self.emu().mem.read_u16(ea) {
            return Some(value);
        }
        self.mmio_read(ea).map(|v| v as u16)
    }

    pub fn read_u32(&mut self, ea: u32) -> Option<u32> {
        if let Some(value) = self.emu().mem.read_u32(ea) {
            return Some(value);
        }
        self.mmio_read(ea)
    }

    pub fn read_u64(&mut self, ea: u32) -> Option<u64> {
        if let Some(value) = self.emu().mem.read_u64(ea) {
            return Some(value);
        }
        let high = self.mmio_read(ea)? as u64;
        let low = self.mmio_read(ea.wrapping_add(4))? as u64;
        Some(high << 32 | low)
    }

    pub fn write_u8(&mut self, ea: u32, value: u8) -> Option<()> {
        if Memory::ram_offset(ea).is_some() {
            self.invalidate_icache(ea, ea.wrapping_add(1));
            return self.emu().mem.write_u8(ea, value);
        }
        self.mmio_write(ea, value as u32, 1)
    }

    pub fn write_u16(&mut self, ea: u32, value: u16) -> Option<()> {
        if Memory::ram_offset(ea).is_some() {
            self.invalidate_icache(ea, ea.wrapping_add(2));
            return self.emu().mem.write_u16(ea, value);
        }
        self.mmio_write(ea, value as u32, 2)
    }

    pub fn write_u32(&mut self, ea: u32, value: u32) -> Option<()> {
        if Memory::ram_offset(ea).is_some() {
            self.invalidate_icache(ea, ea.wrapping_add(4));
            return self.emu().mem.write_u32(ea, value);
        }
        self.mmio_write(ea, value, 4)
    }

    pub fn write_u64(&mut self, ea: u32, value: u64) -> Option<()> {
        if Memory::ram_offset(ea).is_some() {
            self.invalidate_icache(ea, ea.wrapping_add(8));
            return self.emu().mem.write_u64(ea, value);
        }
        self.mmio_write(ea, (value >> 32) as u32, 4)?;
        self.mmio_write(ea.wrapping_add(4), value as u32, 4)
    }

    fn mmio_read(&mut self, ea: u32) -> Option<u32> {
        if !(memory::MMIO_BASE..MMIO_END).contains(&ea) {
            return None;
        }
        let emu = self.emu();
        match ea & !0x3 {
            a if (memory::MMIO_PI..memory::MMIO_PI + 0x100).contains(&a) => {
                Some(emu.pi.cause.load(std::sync::atomic::Ordering::Relaxed))
            }
            a if (memory::MMIO_CP..memory::MMIO_CP + 0x80).contains(&a) => {
                // Status reads must not observe a stale GPU.
                fifo::sync_gpu_for_register_access(emu);
                Some(
                    emu.cp
                        .fifo
                        .cp_read_write_distance
                        .load(std::sync::atomic::Ordering::SeqCst) as u32,
                )
            }
            _ => Some(0),
        }
    }

    fn mmio_write(&mut self, ea: u32, value: u32, size: u8) -> Option<()> {
        if !(memory::MMIO_BASE..MMIO_END).contains(&ea) {
            return None;
        }
        if (memory::MMIO_GATHER_PIPE..memory::MMIO_GATHER_PIPE + 0x40).contains(&ea) {
            match size {
                1 => fifo::gather_pipe::write_u8(self, value as u8),
                2 => fifo::gather_pipe::write_u16(self, value as u16),
                _ => fifo::gather_pipe::write_u32(self, value),
            }
            return Some(());
        }
        tracing::trace!(ea = %gchan_utils::hex(ea), value = %gchan_utils::hex(value), "unhandled MMIO write");
        Some(())
    }

    /// Self-modifying code and `icbi` funnel through here.
    pub fn invalidate_icache(&mut self, from: u32, to: u32) {
        let emu = self.emu();
        if let (Some(phys_from), Some(phys_to)) =
            (Memory::ram_offset(from), Memory::ram_offset(to.wrapping_sub(1)))
        {
            emu.jit
                .blocks
                .invalidate_icache(phys_from, phys_to + 1, false);
        }
    }
}

// Slow-path helpers the trampolines call. Results return zero-extended.

pub unsafe extern "C" fn slow_read_u8(ctx: *mut EmuCtx, addr: u32) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.read_u8(addr).unwrap_or(0) as u64
}

pub unsafe extern "C" fn slow_read_u16(ctx: *mut EmuCtx, addr: u32) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.read_u16(addr).unwrap_or(0) as u64
}

pub unsafe extern "C" fn slow_read_u32(ctx: *mut EmuCtx, addr: u32) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.read_u32(addr).unwrap_or(0) as u64
}

pub unsafe extern "C" fn slow_read_u64(ctx: *mut EmuCtx, addr: u32) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.read_u64(addr).unwrap_or(0)
}

pub unsafe extern "C" fn slow_write_u8(ctx: *mut EmuCtx, addr: u32, value: u64) {
    let ctx = unsafe { &mut *ctx };
    let _ = ctx.write_u8(addr, value as u8);
}

pub unsafe extern "C" fn slow_write_u16(ctx: *mut EmuCtx, addr: u32, value: u64) {
    let ctx = unsafe { &mut *ctx };
    let _ = ctx.write_u16(addr, value as u16);
}

pub unsafe extern "C" fn slow_write_u32(ctx: *mut EmuCtx, addr: u32, value: u64) {
    let ctx = unsafe { &mut *ctx };
    let _ = ctx.write_u32(addr, value as u32);
}

pub unsafe extern "C" fn slow_write_u64(ctx: *mut EmuCtx, addr: u32, value: u64) {
    let ctx = unsafe { &mut *ctx };
    let _ = ctx.write_u64(addr, value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SyncGpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SchedEvent {
    time: u64,
    period: u64,
    kind: EventKind,
}

impl Ord for SchedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time)
    }
}

impl PartialOrd for SchedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Downcount-driven event scheduler, the host side of `do_timing`.
pub struct Scheduler {
    pub global_timer: u64,
    slice_length: i32,
    last_downcount_set: i32,
    events: BinaryHeap<std::cmp::Reverse<SchedEvent>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            global_timer: 0,
            slice_length: 20_000,
            last_downcount_set: 0,
            events: BinaryHeap::new(),
        }
    }
}

impl Scheduler {
    pub fn schedule_event(&mut self, delay: u64, kind: EventKind) {
        self.events.push(std::cmp::Reverse(SchedEvent {
            time: self.global_timer + delay,
            period: delay,
            kind,
        }));
    }

    /// Tick budget handed out at the last refill; `downcount_slice() -
    /// ppc.downcount` is the cycle count executed since.
    pub fn downcount_slice(&self) -> i32 {
        self.last_downcount_set
    }
}

pub struct Emu {
    pub ppc: Box<PpcState>,
    pub mem: Arc<Memory>,
    pub gp: GatherPipe,
    pub cp: Arc<CommandProcessor>,
    pub pi: Arc<ProcessorInterface>,
    pub fifo: Arc<FifoSync>,
    pub jit: Jit,
    pub hle: Hle,
    pub scheduler: Scheduler,
    pub cpu_state: Arc<CpuStateFlag>,
    pub config: Config,
    /// One-shot gate: in stepping mode the dispatcher hands out exactly
    /// one block per `single_step`.
    pub(crate) stepping_dispatched: bool,
    gpu_thread: Option<std::thread::JoinHandle<()>>,
    ctx: Box<EmuCtx>,
}

impl Emu {
    pub fn new(config: Config) -> Result<Box<Emu>, EmuError> {
        Self::with_decoders(
            config,
            Box::new(ChunkDecoder::new(300)),
            Box::new(ChunkDecoder::new(300)),
        )
    }

    pub fn with_decoders(
        config: Config,
        decoder: Box<dyn OpcodeDecoder>,
        pp_decoder: Box<dyn OpcodeDecoder>,
    ) -> Result<Box<Emu>, EmuError> {
        let mem = Arc::new(Memory::new()?);
        let cp = Arc::new(CommandProcessor::default());
        let pi = Arc::new(ProcessorInterface::default());
        let fifo = Arc::new(FifoSync::new(
            Arc::clone(&mem),
            Arc::clone(&cp),
            Arc::clone(&pi),
            decoder,
            pp_decoder,
        ));

        let mut jit = Jit::new()?;
        jit.init(pi.cause_ptr() as usize, &config);

        let mut emu = Box::new(Emu {
            ppc: Box::default(),
            mem,
            gp: GatherPipe::default(),
            cp,
            pi,
            fifo,
            jit,
            hle: Hle::default(),
            scheduler: Scheduler::default(),
            cpu_state: Arc::new(CpuStateFlag::default()),
            config,
            stepping_dispatched: false,
            gpu_thread: None,
            ctx: Box::new(EmuCtx {
                ppc: std::ptr::null_mut(),
                logical_base: std::ptr::null_mut(),
                stack_top: std::ptr::null_mut(),
                saved_host_rsp: 0,
                emu: std::ptr::null_mut(),
            }),
        });

        // Wire the context block now that everything has its final
        // address.
        let pipe_base = emu.gp.base_ptr();
        emu.ppc.gather_pipe_base_ptr = pipe_base;
        emu.ppc.gather_pipe_ptr = pipe_base;
        let ppc_ptr: *mut PpcState = &mut *emu.ppc;
        let emu_ptr: *mut Emu = &mut *emu;
        emu.ctx.ppc = ppc_ptr;
        emu.ctx.logical_base = emu.mem.logical_base();
        emu.ctx.stack_top = emu.jit.stack_top();
        emu.ctx.emu = emu_ptr;
        jit::fault::install(&mut *emu.ctx);

        // FS configuration and the GPU worker.
        let fifo = &emu.fifo;
        fifo.config
            .sync_gpu
            .store(emu.config.sync_gpu, std::sync::atomic::Ordering::Relaxed);
        fifo.config.sync_gpu_max_distance.store(
            emu.config.sync_gpu_max_distance,
            std::sync::atomic::Ordering::Relaxed,
        );
        fifo.config.sync_gpu_min_distance.store(
            emu.config.sync_gpu_min_distance,
            std::sync::atomic::Ordering::Relaxed,
        );
        fifo.config.sync_gpu_overclock.store(
            emu.config.sync_gpu_overclock.to_bits(),
            std::sync::atomic::Ordering::Relaxed,
        );
        fifo.init(emu.config.dual_core);
        fifo.update_want_determinism(emu.config.deterministic_gpu_thread);

        if emu.config.dual_core {
            let worker = Arc::clone(&emu.fifo);
            emu.gpu_thread = Some(
                std::thread::Builder::new()
                    .name("gchan-gpu".into())
                    .spawn(move || worker.run_gpu_loop())
                    .expect("spawning GPU thread"),
            );
            emu.fifo.emulator_state(true);
        }

        emu.cpu_state.set(CpuState::Running);
        Ok(emu)
    }

    pub fn ctx_ptr(&mut self) -> *mut EmuCtx {
        &mut *self.ctx
    }

    /// Enters translated code until the CPU leaves the running state.
    pub fn run(&mut self) {
        self.cpu_state.set(CpuState::Running);
        self.advance_timing();
        let enter: unsafe extern "C" fn(*mut EmuCtx) =
            unsafe { std::mem::transmute(self.jit.asm.enter_code) };
        let ctx = self.ctx_ptr();
        unsafe { enter(ctx) };
    }

    pub fn stop(&mut self) {
        self.cpu_state.set(CpuState::PowerDown);
    }

    /// Runs exactly one guest instruction through the translator.
    pub fn single_step(&mut self) {
        self.cpu_state.set(CpuState::Stepping);
        self.stepping_dispatched = false;
        self.advance_timing();
        let enter: unsafe extern "C" fn(*mut EmuCtx) =
            unsafe { std::mem::transmute(self.jit.asm.enter_code) };
        let ctx = self.ctx_ptr();
        unsafe { enter(ctx) };
    }

    /// Registers a hook at `pc` that powers the CPU down; the test
    /// harness's way of ending a guest program.
    pub fn install_stop_hook(&mut self, pc: u32) {
        self.hle.register(pc, HookKind::Replace, |emu| emu.stop());
    }

    pub(crate) fn jit_compile(&mut self, pc: u32) {
        let stepping = self.cpu_state.is_stepping();
        let Emu { jit, mem, ppc, hle, .. } = self;
        let mut cctx = CompileCtx {
            mem,
            ppc,
            hooks: hle,
            stepping,
        };
        jit.compile(pc, &mut cctx);
    }

    pub(crate) fn hle_execute(&mut self, _pc: u32, index: u32) {
        let handler = self.hle.handlers[index as usize];
        handler(self);
    }

    /// Scheduler entry from `do_timing`: account the executed slice, run
    /// due events, refill the downcount.
    pub fn advance_timing(&mut self) {
        let executed = self.scheduler.last_downcount_set - self.ppc.downcount;
        if executed > 0 {
            self.scheduler.global_timer += executed as u64;
        }

        loop {
            let due = match self.scheduler.events.peek() {
                Some(std::cmp::Reverse(event)) if event.time <= self.scheduler.global_timer => {
                    *event
                }
                _ => break,
            };
            self.scheduler.events.pop();
            let late = (self.scheduler.global_timer - due.time) as i64;
            match due.kind {
                EventKind::SyncGpu => fifo::sync_gpu_callback(self, due.period, late),
            }
        }

        let next = self
            .scheduler
            .events
            .peek()
            .map(|event| event.0.time.saturating_sub(self.scheduler.global_timer))
            .unwrap_or(self.scheduler.slice_length as u64);
        let downcount = next.min(self.scheduler.slice_length as u64) as i32;
        self.ppc.downcount = downcount;
        self.scheduler.last_downcount_set = downcount;
    }

    /// The CPU hit an idle loop; burn the remaining slice.
    pub fn idle(&mut self) {
        self.scheduler.last_downcount_set -= self.ppc.downcount;
        self.ppc.downcount = 0;
    }

    /// Clamp the downcount so an exception check happens within `cycles`.
    pub fn force_exception_check(&mut self, cycles: i32) {
        if self.ppc.downcount > cycles {
            let delta = self.ppc.downcount - cycles;
            self.ppc.downcount = cycles;
            self.scheduler.last_downcount_set -= delta;
        }
    }

    fn take_exception(&mut self, vector: u32, srr0: u32) {
        let ppc = &mut *self.ppc;
        ppc.spr[SPR_SRR0] = srr0;
        ppc.spr[SPR_SRR1] = ppc.msr & 0x87C0_FFFF;
        // Clear POW, EE, PR, FP, FE0, SE, BE, FE1, IR, DR, RI.
        ppc.msr &= !0x04_EF36;
        ppc.pc = vector;
        ppc.npc = vector.wrapping_add(4);
    }

    /// Services the highest-priority pending exception, if any.
    pub fn check_exceptions(&mut self) {
        let ex = self.ppc.exceptions;
        if ex == 0 {
            return;
        }
        let npc = self.ppc.npc;
        let pc = self.ppc.pc;

        if ex & EXCEPTION_ISI != 0 {
            self.ppc.exceptions &= !EXCEPTION_ISI;
            self.take_exception(0x0400, npc);
        } else if ex & EXCEPTION_PROGRAM != 0 {
            self.ppc.exceptions &= !EXCEPTION_PROGRAM;
            self.take_exception(0x0700, pc);
        } else if ex & EXCEPTION_SYSCALL != 0 {
            self.ppc.exceptions &= !EXCEPTION_SYSCALL;
            self.take_exception(0x0C00, npc);
        } else if ex & EXCEPTION_FPU_UNAVAILABLE != 0 {
            self.ppc.exceptions &= !EXCEPTION_FPU_UNAVAILABLE;
            self.take_exception(0x0800, pc);
        } else if ex & EXCEPTION_DSI != 0 {
            self.ppc.exceptions &= !EXCEPTION_DSI;
            self.take_exception(0x0300, pc);
        } else if ex & EXCEPTION_ALIGNMENT != 0 {
            self.ppc.exceptions &= !EXCEPTION_ALIGNMENT;
            self.take_exception(0x0600, pc);
        } else {
            self.check_external_exceptions();
        }
    }

    /// Asynchronous interrupts, gated on MSR.EE.
    pub fn check_external_exceptions(&mut self) {
        let ex = self.ppc.exceptions;
        if ex & (EXCEPTION_EXTERNAL_INT | EXCEPTION_DECREMENTER) == 0 {
            return;
        }
        if !Msr(self.ppc.msr).ee() {
            return;
        }
        let npc = self.ppc.npc;
        if ex & EXCEPTION_EXTERNAL_INT != 0 {
            self.ppc.exceptions &= !EXCEPTION_EXTERNAL_INT;
            self.take_exception(0x0500, npc);
        } else {
            self.ppc.exceptions &= !EXCEPTION_DECREMENTER;
            self.take_exception(0x0900, npc);
        }
    }

    /// Reference interpretation of one instruction, for differential
    /// tests against the translator.
    pub fn single_step_interpreted(&mut self) {
        let pc = self.ppc.pc;
        let Some(word) = self.mem.read_u32(pc) else {
            self.ppc.exceptions |= EXCEPTION_ISI;
            self.check_exceptions();
            return;
        };
        self.ppc.npc = pc.wrapping_add(4);
        let inst = cpu::analyzer::GekkoInst(word);
        let routine = cpu::interpreter::get_interpreter_op(inst);
        let ctx = self.ctx_ptr();
        unsafe { routine(ctx, word) };
        if self.ppc.exceptions != 0 {
            self.check_exceptions();
        } else {
            self.ppc.pc = self.ppc.npc;
        }
    }

    /// Convenience for tests: writes a guest program at `pc`.
    pub fn write_program(&mut self, pc: u32, words: &[u32]) {
        for (index, word) in words.iter().enumerate() {
            self.mem
                .write_u32(pc + index as u32 * 4, *word)
                .expect("program must land in RAM");
        }
        if let Some(phys) = Memory::ram_offset(pc) {
            self.jit
                .blocks
                .invalidate_icache(phys, phys + words.len() as u32 * 4, false);
        }
    }
}

impl Drop for Emu {
    fn drop(&mut self) {
        if let Some(worker) = self.gpu_thread.take() {
            self.fifo.exit_gpu_loop();
            let _ = worker.join();
        }
        jit::fault::uninstall();
    }
}
