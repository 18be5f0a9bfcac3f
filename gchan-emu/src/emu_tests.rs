//! End-to-end scenarios: guest programs compiled, linked, invalidated,
//! backpatched and paced against the FIFO.
//!
//! The process-wide fault handler means only one Emu may be live at a
//! time, so every test holds the harness lock.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use gchan_utils::{setup_tracing, IgnorePoison};
use pretty_assertions::assert_eq;

use crate::cpu::{CpuState, SPR_GQR0};
use crate::fifo::gather_pipe::GATHER_PIPE_SIZE;
use crate::gpu::ChunkDecoder;
use crate::memory::MMIO_GATHER_PIPE;
use crate::{Config, Emu};

static HARNESS: Mutex<()> = Mutex::new(());

fn harness() -> MutexGuard<'static, ()> {
    setup_tracing();
    HARNESS.get()
}

const BASE: u32 = 0x8000_0000;

// Gekko instruction encoders, enough for the scenarios.

fn addi(rd: u32, ra: u32, simm: i16) -> u32 {
    (14 << 26) | (rd << 21) | (ra << 16) | (simm as u16 as u32)
}

fn addis(rd: u32, ra: u32, simm: i16) -> u32 {
    (15 << 26) | (rd << 21) | (ra << 16) | (simm as u16 as u32)
}

fn add(rd: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rd << 21) | (ra << 16) | (rb << 11) | (266 << 1)
}

fn addic(rd: u32, ra: u32, simm: i16) -> u32 {
    (12 << 26) | (rd << 21) | (ra << 16) | (simm as u16 as u32)
}

fn adde(rd: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rd << 21) | (ra << 16) | (rb << 11) | (138 << 1)
}

fn subf(rd: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rd << 21) | (ra << 16) | (rb << 11) | (40 << 1)
}

fn ori(ra: u32, rs: u32, uimm: u16) -> u32 {
    (24 << 26) | (rs << 21) | (ra << 16) | uimm as u32
}

fn rlwinm(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (21 << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (mb << 6) | (me << 1)
}

fn srawi(ra: u32, rs: u32, sh: u32) -> u32 {
    (31 << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (824 << 1)
}

fn cmpwi(ra: u32, simm: i16) -> u32 {
    (11 << 26) | (ra << 16) | (simm as u16 as u32)
}

fn lwz(rd: u32, ra: u32, d: i16) -> u32 {
    (32 << 26) | (rd << 21) | (ra << 16) | (d as u16 as u32)
}

fn stw(rs: u32, ra: u32, d: i16) -> u32 {
    (36 << 26) | (rs << 21) | (ra << 16) | (d as u16 as u32)
}

fn b(offset: i32) -> u32 {
    (18 << 26) | ((offset as u32) & 0x03FF_FFFC)
}

fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

fn b_always(offset: i32) -> u32 {
    // bc 20,0,offset: unconditional, but never inlined by the analyzer.
    (16 << 26) | (20 << 21) | ((offset as u32) & 0xFFFC)
}

fn blr() -> u32 {
    (19 << 26) | (20 << 21) | (16 << 1)
}

fn b_self() -> u32 {
    b(0)
}

fn psq_l(fd: u32, ra: u32, d: i16, w: bool, gqr: u32) -> u32 {
    (56 << 26)
        | (fd << 21)
        | (ra << 16)
        | ((w as u32) << 15)
        | (gqr << 12)
        | ((d as u16 as u32) & 0xFFF)
}

/// Program that ends in an idle branch with a stop hook on it.
fn finish(words: &mut Vec<u32>) -> u32 {
    words.push(b_self());
    (words.len() as u32 - 1) * 4 + BASE
}

fn run_program(emu: &mut Emu, words: &[u32]) {
    let mut words = words.to_vec();
    let stop_pc = finish(&mut words);
    emu.write_program(BASE, &words);
    emu.install_stop_hook(stop_pc);
    emu.ppc.pc = BASE;
    emu.run();
    assert_eq!(emu.cpu_state.get(), CpuState::PowerDown);
}

#[test]
fn translation_idempotence_and_differential_execution() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    let program = vec![
        addi(3, 0, 7),
        addis(4, 3, 2),
        add(5, 3, 4),
        subf(6, 3, 5),
        ori(7, 5, 0xBEEF),
        rlwinm(8, 7, 4, 0, 27),
        srawi(9, 8, 3),
        addic(10, 3, -8),
        adde(11, 4, 5),
        cmpwi(11, 0),
    ];

    // Reference run through the interpreter.
    let mut reference = Emu::new(Config::default()).unwrap();
    reference.write_program(BASE, &program);
    reference.ppc.pc = BASE;
    for _ in 0..program.len() {
        reference.single_step_interpreted();
    }

    run_program(&mut emu, &program);

    assert_eq!(emu.ppc.gpr[3..12], reference.ppc.gpr[3..12]);
    assert_eq!(emu.ppc.cr, reference.ppc.cr);
    assert_eq!(emu.ppc.spr[crate::cpu::SPR_XER], reference.ppc.spr[crate::cpu::SPR_XER]);

    // Translate the same region twice with a clear in between: identical
    // shape.
    let phys = crate::memory::Memory::ram_offset(BASE).unwrap();
    let first_size = emu.jit.blocks.get_by_start(phys).unwrap().original_size;
    emu.jit.clear_cache();
    emu.ppc.pc = BASE;
    emu.cpu_state.set(CpuState::Running);
    emu.run();
    let second_size = emu.jit.blocks.get_by_start(phys).unwrap().original_size;
    assert_eq!(first_size, second_size);
}

#[test]
fn compile_and_link_patches_exit_site() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // Block A at BASE: one addi, then an un-inlinable unconditional
    // branch to BASE + 0x40 (block B).
    emu.write_program(BASE, &[addi(3, 0, 1), b_always(0x40 - 4)]);
    emu.write_program(BASE + 0x40, &[addi(4, 0, 2), b_self()]);
    emu.install_stop_hook(BASE + 0x44);
    emu.ppc.pc = BASE;
    emu.run();

    assert_eq!(emu.ppc.gpr[3], 1);
    assert_eq!(emu.ppc.gpr[4], 2);

    let phys_a = crate::memory::Memory::ram_offset(BASE).unwrap();
    let phys_b = crate::memory::Memory::ram_offset(BASE + 0x40).unwrap();
    let block_a = emu.jit.blocks.get_by_start(phys_a).unwrap();
    let block_b = emu.jit.blocks.get_by_start(phys_b).unwrap();

    let link = block_a
        .links
        .iter()
        .find(|l| l.exit_address == phys_b)
        .expect("A has an exit aimed at B");
    assert!(link.linked);

    // The patch site is a 5-byte jmp rel32 landing on B's checked entry.
    let opcode = unsafe { std::ptr::read(link.exit_ptr as *const u8) };
    assert_eq!(opcode, 0xE9);
    let rel = unsafe { std::ptr::read_unaligned((link.exit_ptr + 1) as *const i32) };
    let target = (link.exit_ptr as isize + 5 + rel as isize) as usize;
    assert_eq!(target, block_b.checked_entry);
}

#[test]
fn invalidation_tears_out_blocks_and_frees_ranges() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    run_program(&mut emu, &[addi(3, 0, 5)]);
    let phys = crate::memory::Memory::ram_offset(BASE).unwrap();
    assert!(emu.jit.blocks.get_by_start(phys).is_some());
    let near = emu.jit.blocks.get_by_start(phys).unwrap().near;

    emu.jit.blocks.invalidate_icache(phys, phys + 8, false);
    assert!(emu.jit.blocks.get_by_start(phys).is_none());
    let (freed_near, _) = emu.jit.blocks.drain_freed_ranges();
    assert!(freed_near.contains(&near));

    // Self-modifying store invalidates through the slow path too:
    // rewrite the block and rerun.
    emu.write_program(BASE, &[addi(3, 0, 9)]);
    emu.ppc.pc = BASE;
    emu.cpu_state.set(CpuState::Running);
    emu.run();
    assert_eq!(emu.ppc.gpr[3], 9);
}

#[test]
fn downcount_decrements_by_block_cycle_count() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // Five addi (1 cycle each) + bc-always (1 cycle) = 6 cycles in block
    // A; block B is the hooked idle branch (1 cycle, charged via the
    // hook exit).
    emu.write_program(
        BASE,
        &[
            addi(3, 0, 1),
            addi(3, 3, 1),
            addi(3, 3, 1),
            addi(3, 3, 1),
            addi(3, 3, 1),
            b_always(0x40 - 20),
        ],
    );
    emu.write_program(BASE + 0x40, &[b_self()]);
    emu.install_stop_hook(BASE + 0x40);
    emu.ppc.pc = BASE;
    emu.run();

    let initial = emu.scheduler.downcount_slice();
    assert_eq!(initial - emu.ppc.downcount, 6 + 1);
}

#[test]
fn fastmem_backpatch_recovers_mmio_loads() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();
    emu.pi.cause.store(0x0000_1234, Ordering::Relaxed);

    // r3 = 0xCC003000 (PI base): lis/ori would fold, but runtime input
    // keeps the load address dynamic.
    emu.ppc.gpr[3] = 0xCC00_3000;
    run_program(&mut emu, &[lwz(4, 3, 0), lwz(5, 3, 0)]);
    assert_eq!(emu.ppc.gpr[4], 0x0000_1234);
    assert_eq!(emu.ppc.gpr[5], 0x0000_1234);

    // Second execution goes through the trampoline with no further
    // faults or patching.
    emu.pi.cause.store(0x0000_4321, Ordering::Relaxed);
    emu.ppc.pc = BASE;
    emu.cpu_state.set(CpuState::Running);
    emu.run();
    assert_eq!(emu.ppc.gpr[4], 0x0000_4321);
}

#[test]
fn blr_stack_overflow_disables_optimization_and_recovers() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();
    assert!(emu.jit.enable_blr_optimization);

    // `bl .` pushes a prediction frame every iteration and never
    // returns; the hook watches for the guard fault recovery.
    emu.write_program(BASE, &[bl(0)]);
    emu.hle.register(BASE, crate::HookKind::Start, |emu| {
        if !emu.jit.enable_blr_optimization {
            emu.stop();
        }
    });
    emu.ppc.pc = BASE;
    emu.run();

    assert!(!emu.jit.enable_blr_optimization);
    assert_eq!(emu.cpu_state.get(), CpuState::PowerDown);
}

#[test]
fn blr_prediction_fast_path_returns_through_host_ret() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // Callee below the caller so the analyzer cannot inline the bl.
    emu.write_program(BASE + 0x100, &[addi(4, 4, 1), blr()]);
    emu.write_program(
        BASE + 0x200,
        &[
            addi(4, 0, 0),
            bl(0x100 - 0x204),
            bl(0x100 - 0x208),
            addi(5, 4, 10),
            b_self(),
        ],
    );
    emu.install_stop_hook(BASE + 0x210);
    emu.ppc.pc = BASE + 0x200;
    emu.run();

    assert_eq!(emu.ppc.gpr[4], 2);
    assert_eq!(emu.ppc.gpr[5], 12);
    assert_eq!(emu.ppc.lr(), BASE + 0x20C);
}

#[test]
fn inlined_bl_keeps_blr_stack_coherent() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // Callee above the caller: the analyzer follows the bl, the emitter
    // fakes the prediction frame.
    emu.write_program(
        BASE,
        &[addi(4, 0, 0), bl(0x100 - 4)],
    );
    emu.write_program(BASE + 0x100, &[addi(4, 4, 5), blr()]);
    emu.write_program(BASE + 8, &[addi(5, 4, 1), b_self()]);
    emu.install_stop_hook(BASE + 12);
    emu.ppc.pc = BASE;
    emu.run();

    assert_eq!(emu.ppc.gpr[4], 5);
    assert_eq!(emu.ppc.gpr[5], 6);
}

#[test]
fn gather_pipe_stores_burst_into_cp_fifo() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // CP FIFO ring in guest memory; read disabled so the chunk stays
    // counted.
    let fifo_base = 0x0000_4000u32;
    emu.cp.fifo.cp_base.store(fifo_base, Ordering::Relaxed);
    emu.cp.fifo.cp_end.store(fifo_base + 0xFE0, Ordering::Relaxed);
    emu.cp
        .fifo
        .cp_write_pointer
        .store(fifo_base, Ordering::Relaxed);
    emu.cp.fifo.gp_read_enable.store(false, Ordering::Relaxed);

    // r3 arrives holding the gather-pipe address: speculative constant.
    emu.ppc.gpr[3] = MMIO_GATHER_PIPE;
    let mut program = Vec::new();
    for i in 0..8 {
        program.push(addi(4, 0, 0x100 + i as i16));
        program.push(stw(4, 3, 0));
    }
    run_program(&mut emu, &program);

    assert_eq!(
        emu.cp.fifo.cp_read_write_distance.load(Ordering::SeqCst),
        GATHER_PIPE_SIZE as i32
    );
    // The burst landed in guest memory in guest byte order.
    for i in 0..8u32 {
        assert_eq!(emu.mem.read_u32(fifo_base + i * 4), Some(0x100 + i));
    }
}

#[test]
fn gqr_speculation_bails_and_recompiles_generic() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // Two big-endian f32 values at 0x1000.
    emu.mem.write_u32(0x8000_1000, 1.5f32.to_bits()).unwrap();
    emu.mem.write_u32(0x8000_1004, 2.5f32.to_bits()).unwrap();

    emu.ppc.msr |= 1 << 13; // FP on
    emu.ppc.gpr[3] = 0x8000_1000;
    emu.ppc.spr[SPR_GQR0 + 3] = 0; // float, no scale

    run_program(&mut emu, &[psq_l(1, 3, 0, false, 3)]);
    assert_eq!(f64::from_bits(emu.ppc.ps[1][0]), 1.5);
    assert_eq!(f64::from_bits(emu.ppc.ps[1][1]), 2.5);
    assert!(!emu.jit.gqr_speculation_disabled(BASE));

    // Change the GQR under the block: the guard bails to a generic
    // recompile that dequantizes as s16.
    emu.ppc.spr[SPR_GQR0 + 3] = 0x0007_0007;
    emu.ppc.pc = BASE;
    emu.cpu_state.set(CpuState::Running);
    emu.run();

    assert!(emu.jit.gqr_speculation_disabled(BASE));
    let expected0 = i16::from_be_bytes(1.5f32.to_bits().to_be_bytes()[0..2].try_into().unwrap());
    let expected1 = i16::from_be_bytes(1.5f32.to_bits().to_be_bytes()[2..4].try_into().unwrap());
    assert_eq!(f64::from_bits(emu.ppc.ps[1][0]), expected0 as f64);
    assert_eq!(f64::from_bits(emu.ppc.ps[1][1]), expected1 as f64);
}

#[test]
fn single_core_pacing_consumes_fifo_and_reports_idle() {
    let _guard = harness();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let emu = Emu::with_decoders(
        Config::default(),
        Box::new(ChunkDecoder::with_sink(4000, Arc::clone(&sink))),
        Box::new(ChunkDecoder::new(4000)),
    )
    .unwrap();

    let fifo_base = 0x0000_5000u32;
    let chunk: Vec<u8> = (0..32u8).collect();
    emu.mem.copy_to_emu(fifo_base, &chunk).unwrap();

    let fifo = &emu.cp.fifo;
    fifo.cp_base.store(fifo_base, Ordering::Relaxed);
    fifo.cp_end.store(fifo_base + 0xFE0, Ordering::Relaxed);
    fifo.cp_read_pointer.store(fifo_base, Ordering::Relaxed);
    fifo.cp_read_write_distance
        .store(GATHER_PIPE_SIZE as i32, Ordering::SeqCst);
    fifo.gp_read_enable.store(true, Ordering::Relaxed);

    // 10k ticks at overclock 1.0 against a 4k-cycle command: drains and
    // goes idle.
    let next = emu.fifo.run_gpu_on_cpu(10_000);
    assert_eq!(next, -1);
    assert_eq!(fifo.cp_read_pointer.load(Ordering::Relaxed), fifo_base + 32);
    assert_eq!(fifo.cp_read_write_distance.load(Ordering::SeqCst), 0);
    assert_eq!(emu.fifo.sync_ticks.load(Ordering::SeqCst), 0);
    assert_eq!(*sink.lock().unwrap(), chunk);

    // Distance conservation when the budget runs out mid-stream.
    emu.mem.copy_to_emu(fifo_base + 32, &chunk).unwrap();
    fifo.cp_read_write_distance
        .store(2 * GATHER_PIPE_SIZE as i32, Ordering::SeqCst);
    let next = emu.fifo.run_gpu_on_cpu(3_000);
    // One chunk consumed: available = 3000 - 4000 = -1000.
    assert_eq!(next, 1000 + crate::fifo::GPU_TIME_SLOT_SIZE);
    assert_eq!(emu.fifo.sync_ticks.load(Ordering::SeqCst), -1000);
}

#[test]
fn deterministic_mode_round_trips_and_wraps() {
    let _guard = harness();
    let gpu_sink = Arc::new(Mutex::new(Vec::new()));
    let pp_sink = Arc::new(Mutex::new(Vec::new()));
    let config = Config {
        dual_core: true,
        deterministic_gpu_thread: true,
        ..Config::default()
    };
    let emu = Emu::with_decoders(
        config,
        Box::new(ChunkDecoder::with_sink(0, Arc::clone(&gpu_sink))),
        Box::new(ChunkDecoder::with_sink(0, Arc::clone(&pp_sink))),
    )
    .unwrap();

    let fifo_base = 0x0000_6000u32;
    let fifo = &emu.cp.fifo;
    fifo.cp_base.store(fifo_base, Ordering::Relaxed);
    fifo.cp_end.store(fifo_base, Ordering::Relaxed); // single-slot ring
    fifo.cp_read_pointer.store(fifo_base, Ordering::Relaxed);
    fifo.gp_read_enable.store(true, Ordering::Relaxed);

    // Push enough chunks to force at least one video-ring wraparound.
    let chunks = crate::fifo::FIFO_SIZE / GATHER_PIPE_SIZE + 1024;
    let mut expected = Vec::with_capacity(chunks * GATHER_PIPE_SIZE);
    for index in 0..chunks {
        let mut chunk = [0u8; GATHER_PIPE_SIZE];
        let tag = (index as u32).to_be_bytes();
        for (slot, byte) in chunk.iter_mut().enumerate() {
            *byte = tag[slot % 4] ^ slot as u8;
        }
        emu.mem.copy_to_emu(fifo_base, &chunk).unwrap();
        expected.extend_from_slice(&chunk);

        fifo.cp_read_write_distance
            .store(GATHER_PIPE_SIZE as i32, Ordering::SeqCst);
        let ret = emu.fifo.run_gpu_on_cpu(1_000_000);
        assert_eq!(ret, -1);
    }

    // Let the GPU worker finish, then compare all three streams.
    emu.fifo.sync_gpu(crate::fifo::SyncGpuReason::Other, true);
    assert_eq!(pp_sink.lock().unwrap().len(), expected.len());
    assert_eq!(*pp_sink.lock().unwrap(), expected);
    assert_eq!(*gpu_sink.lock().unwrap(), expected);
}

#[test]
fn fifo_savestate_round_trips_pointers_as_offsets() {
    let _guard = harness();
    let emu = Emu::new(Config::default()).unwrap();

    let fifo_base = 0x0000_7000u32;
    let payload: Vec<u8> = (0..64u8).collect();
    emu.mem.copy_to_emu(fifo_base, &payload[..32]).unwrap();
    let fifo = &emu.cp.fifo;
    fifo.cp_base.store(fifo_base, Ordering::Relaxed);
    fifo.cp_end.store(fifo_base + 0xFE0, Ordering::Relaxed);
    fifo.cp_read_pointer.store(fifo_base, Ordering::Relaxed);
    fifo.cp_read_write_distance
        .store(GATHER_PIPE_SIZE as i32, Ordering::SeqCst);
    // Leave read disabled so the chunk stays buffered... but nothing is
    // buffered until the loop runs; instead save, scribble, and restore.
    let mut blob = Vec::new();
    {
        let mut p = crate::savestate::PointerWrap::for_write(&mut blob);
        emu.fifo.do_state(&mut p);
    }
    let before = emu.fifo.pending_bytes();
    {
        let mut p = crate::savestate::PointerWrap::for_read(&mut blob);
        emu.fifo.do_state(&mut p);
    }
    assert_eq!(emu.fifo.pending_bytes(), before);
}

#[test]
fn exceptions_redirect_through_vectors() {
    let _guard = harness();
    let mut emu = Emu::new(Config::default()).unwrap();

    // sc raises a syscall exception; the handler at 0x00000C00 runs and
    // spins.
    let sc = 17 << 26 | 2;
    emu.write_program(BASE, &[addi(3, 0, 1), sc]);
    emu.write_program(0x8000_0C00, &[addi(4, 0, 99), b_self()]);
    // The vector dispatches at the untranslated address.
    emu.install_stop_hook(0x0000_0C04);
    emu.ppc.pc = BASE;
    emu.run();

    assert_eq!(emu.ppc.gpr[3], 1);
    assert_eq!(emu.ppc.gpr[4], 99);
    // SRR0 points past the sc.
    assert_eq!(emu.ppc.spr[crate::cpu::SPR_SRR0], BASE + 8);
}
