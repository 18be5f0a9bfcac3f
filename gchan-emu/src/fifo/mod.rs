//! CPU-GPU FIFO synchronization.
//!
//! The CPU thread produces gather-pipe chunks into the video ring; the
//! GPU thread (or the CPU itself in single-core mode) feeds them to the
//! opcode decoder. Three modes: single-core time-sliced, dual-core
//! free-running, and dual-core deterministic where the CPU pre-decodes
//! the stream so GPU-thread timing cannot leak into emulated state.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use gchan_utils::IgnorePoison;

use crate::gpu::{CommandProcessor, OpcodeDecoder, ProcessorInterface};
use crate::memory::Memory;
use crate::savestate::PointerWrap;

pub mod blocking_loop;
pub mod gather_pipe;

use blocking_loop::BlockingLoop;
use gather_pipe::GATHER_PIPE_SIZE;

pub const FIFO_SIZE: usize = 2 * 1024 * 1024;
pub const GPU_TIME_SLOT_SIZE: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SyncGpuReason {
    Other,
    Wraparound,
    AuxSpace,
}

/// One-shot wakeup the CPU blocks on when it runs too far ahead.
#[derive(Default)]
struct Event {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    fn set(&self) {
        let mut signaled = self.signaled.get();
        *signaled = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.get();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap_or_else(|e| e.into_inner());
        }
        *signaled = false;
    }
}

struct Buffer(UnsafeCell<Box<[u8]>>);

// Disjoint-range access is enforced by the pointer protocol below.
unsafe impl Sync for Buffer {}

impl Buffer {
    fn new(len: usize) -> Self {
        Self(UnsafeCell::new(vec![0; len].into_boxed_slice()))
    }

    /// # Safety
    /// Caller must own the `[at, at+len)` range per the pointer
    /// discipline.
    unsafe fn write(&self, at: usize, data: &[u8]) {
        unsafe {
            let buffer = &mut *self.0.get();
            buffer[at..at + data.len()].copy_from_slice(data);
        }
    }

    unsafe fn read(&self, from: usize, to: usize) -> &[u8] {
        unsafe {
            let buffer = &*self.0.get();
            &buffer[from..to]
        }
    }

    /// memmove within the buffer; only legal while the other side is
    /// known idle.
    unsafe fn shift_down(&self, from: usize, to: usize) {
        unsafe {
            let buffer = &mut *self.0.get();
            buffer.copy_within(from..to, 0);
        }
    }
}

/// Runtime tunables, refreshed from Config on init.
pub struct FifoConfig {
    pub sync_gpu: AtomicBool,
    pub sync_gpu_max_distance: AtomicI32,
    pub sync_gpu_min_distance: AtomicI32,
    /// f32 bits.
    pub sync_gpu_overclock: AtomicU32,
    pub dual_core: AtomicBool,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            sync_gpu: AtomicBool::new(false),
            sync_gpu_max_distance: AtomicI32::new(200_000),
            sync_gpu_min_distance: AtomicI32::new(-200_000),
            sync_gpu_overclock: AtomicU32::new(1.0f32.to_bits()),
            dual_core: AtomicBool::new(false),
        }
    }
}

impl FifoConfig {
    fn overclock(&self) -> f32 {
        f32::from_bits(self.sync_gpu_overclock.load(Ordering::Relaxed))
    }
}

pub struct FifoSync {
    video_buffer: Buffer,
    /// Owned by the GPU thread.
    read_off: AtomicUsize,
    /// Written by the CPU after copying from guest memory.
    write_off: AtomicUsize,
    /// Deterministic mode: how far the GPU has consumed, trailing write.
    seen_off: AtomicUsize,
    /// Deterministic mode: the CPU's preprocessing read cursor.
    pp_read_off: AtomicUsize,

    aux_data: Buffer,
    aux_read_off: AtomicUsize,
    aux_write_off: AtomicUsize,

    /// CPU-ahead-of-GPU emulated ticks.
    pub sync_ticks: AtomicI32,
    syncing_suspended: AtomicBool,
    sync_wakeup: Event,

    gpu_mainloop: BlockingLoop,
    emu_running_state: AtomicBool,
    use_deterministic_gpu_thread: AtomicBool,

    pub config: FifoConfig,

    mem: Arc<Memory>,
    cp: Arc<CommandProcessor>,
    pi: Arc<ProcessorInterface>,
    /// GPU-side decoder.
    decoder: Mutex<Box<dyn OpcodeDecoder>>,
    /// CPU-side preprocessing decoder (deterministic mode).
    pp_decoder: Mutex<Box<dyn OpcodeDecoder>>,
}

impl FifoSync {
    pub fn new(
        mem: Arc<Memory>,
        cp: Arc<CommandProcessor>,
        pi: Arc<ProcessorInterface>,
        decoder: Box<dyn OpcodeDecoder>,
        pp_decoder: Box<dyn OpcodeDecoder>,
    ) -> Self {
        Self {
            // Padded so SIMD overreads in the vertex loader are safe.
            video_buffer: Buffer::new(FIFO_SIZE + 4),
            read_off: AtomicUsize::new(0),
            write_off: AtomicUsize::new(0),
            seen_off: AtomicUsize::new(0),
            pp_read_off: AtomicUsize::new(0),
            aux_data: Buffer::new(FIFO_SIZE),
            aux_read_off: AtomicUsize::new(0),
            aux_write_off: AtomicUsize::new(0),
            sync_ticks: AtomicI32::new(0),
            syncing_suspended: AtomicBool::new(true),
            sync_wakeup: Event::default(),
            gpu_mainloop: BlockingLoop::default(),
            emu_running_state: AtomicBool::new(false),
            use_deterministic_gpu_thread: AtomicBool::new(false),
            config: FifoConfig::default(),
            mem,
            cp,
            pi,
            decoder: Mutex::new(decoder),
            pp_decoder: Mutex::new(pp_decoder),
        }
    }

    pub fn init(&self, dual_core: bool) {
        self.reset_video_buffer();
        if dual_core {
            self.gpu_mainloop.prepare();
        }
        self.config.dual_core.store(dual_core, Ordering::Relaxed);
        self.sync_ticks.store(0, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        if self.gpu_mainloop.is_running() {
            panic!("FIFO shutting down while active");
        }
    }

    pub fn reset_video_buffer(&self) {
        self.read_off.store(0, Ordering::Relaxed);
        self.write_off.store(0, Ordering::Release);
        self.seen_off.store(0, Ordering::Release);
        self.pp_read_off.store(0, Ordering::Relaxed);
        self.aux_read_off.store(0, Ordering::Relaxed);
        self.aux_write_off.store(0, Ordering::Relaxed);
    }

    pub fn is_dual_core(&self) -> bool {
        self.config.dual_core.load(Ordering::Relaxed)
    }

    pub fn use_deterministic_gpu_thread(&self) -> bool {
        self.use_deterministic_gpu_thread.load(Ordering::Relaxed)
    }

    /// May be executed from any thread, even the graphics thread.
    pub fn exit_gpu_loop(&self) {
        // This should break the wait loop in the CPU thread.
        self.cp.fifo.gp_read_enable.store(false, Ordering::Relaxed);
        self.flush_gpu();

        // Terminate the GPU-thread loop non-blocking.
        self.emu_running_state.store(true, Ordering::SeqCst);
        self.gpu_mainloop.stop();
    }

    pub fn emulator_state(&self, running: bool) {
        self.emu_running_state.store(running, Ordering::SeqCst);
        if running {
            self.gpu_mainloop.wakeup();
        } else {
            self.gpu_mainloop.allow_sleep();
        }
    }

    pub fn pause_and_lock(&self, do_lock: bool, unpause_on_unlock: bool) {
        if do_lock {
            self.sync_gpu(SyncGpuReason::Other, true);
            self.emulator_state(false);

            if !self.is_dual_core() || self.use_deterministic_gpu_thread() {
                return;
            }
            self.gpu_mainloop
                .wait_yield(Duration::from_millis(100), || {
                    // Yield to the host UI between waits.
                    std::thread::yield_now();
                });
        } else if unpause_on_unlock {
            self.emulator_state(true);
        }
    }

    /// Deterministic-mode rendezvous: wait for the GPU to consume
    /// everything published, then optionally rewind the ring to the
    /// front. Wrap-around happens only here, while the GPU is known
    /// idle.
    pub fn sync_gpu(&self, reason: SyncGpuReason, may_move_read_ptr: bool) {
        if !self.use_deterministic_gpu_thread() {
            return;
        }
        tracing::trace!(%reason, may_move_read_ptr, "syncing GPU");
        self.gpu_mainloop.wait();
        if !self.gpu_mainloop.is_running() {
            return;
        }

        // Opportunistically reset the FIFOs so we don't wrap around.
        let aux_read = self.aux_read_off.load(Ordering::Relaxed);
        let aux_write = self.aux_write_off.load(Ordering::Relaxed);
        if may_move_read_ptr && aux_write != aux_read {
            panic!("Aux FIFO not synced ({aux_write}, {aux_read})");
        }
        // SAFETY: GPU loop is idle (waited above).
        unsafe {
            self.aux_data.shift_down(aux_read, aux_write);
        }
        self.aux_write_off
            .store(aux_write - aux_read, Ordering::Relaxed);
        self.aux_read_off.store(0, Ordering::Relaxed);

        if may_move_read_ptr {
            let write = self.write_off.load(Ordering::Relaxed);
            let pp_read = self.pp_read_off.load(Ordering::Relaxed);
            let size = write - pp_read;

            // SAFETY: GPU loop is idle.
            unsafe {
                self.video_buffer.shift_down(pp_read, write);
            }
            // This change always decreases the pointers. Seen is stored
            // after write here and loaded after write in the GPU loop,
            // so a spurious `write > seen` cannot appear.
            self.write_off.store(size, Ordering::Release);
            self.pp_read_off.store(0, Ordering::Relaxed);
            self.read_off.store(0, Ordering::Relaxed);
            self.seen_off.store(size, Ordering::Release);
        }
    }

    pub fn push_fifo_aux_buffer(&self, data: &[u8]) {
        let mut write = self.aux_write_off.load(Ordering::Relaxed);
        if data.len() > FIFO_SIZE - write {
            self.sync_gpu(SyncGpuReason::AuxSpace, false);
            if !self.gpu_mainloop.is_running() {
                // GPU is shutting down.
                return;
            }
            write = self.aux_write_off.load(Ordering::Relaxed);
            if data.len() > FIFO_SIZE - write {
                // That will sync us up to the last 32 bytes, so this
                // would have to be a 2 MB display list or something.
                panic!("Absurdly large aux buffer");
            }
        }
        // SAFETY: CPU owns the aux write side.
        unsafe {
            self.aux_data.write(write, data);
        }
        self.aux_write_off
            .store(write + data.len(), Ordering::Release);
    }

    pub fn pop_fifo_aux_buffer(&self, size: usize) -> Vec<u8> {
        let read = self.aux_read_off.load(Ordering::Relaxed);
        // SAFETY: range below the write offset, owned by the consumer.
        let data = unsafe { self.aux_data.read(read, read + size) }.to_vec();
        self.aux_read_off.store(read + size, Ordering::Relaxed);
        data
    }

    /// Copies one gather-pipe chunk from guest memory into the ring
    /// (GPU-owned pointers).
    fn read_data_from_fifo(&self, read_ptr: u32) {
        let mut write = self.write_off.load(Ordering::Relaxed);
        if GATHER_PIPE_SIZE > FIFO_SIZE - write {
            let read = self.read_off.load(Ordering::Relaxed);
            let existing_len = write - read;
            if GATHER_PIPE_SIZE > FIFO_SIZE - existing_len {
                panic!(
                    "FIFO out of bounds (existing {existing_len} + new {GATHER_PIPE_SIZE} > {FIFO_SIZE})"
                );
            }
            // SAFETY: this thread owns both pointers in this mode.
            unsafe {
                self.video_buffer.shift_down(read, write);
            }
            write = existing_len;
            self.write_off.store(write, Ordering::Relaxed);
            self.read_off.store(0, Ordering::Relaxed);
        }
        let mut chunk = [0u8; GATHER_PIPE_SIZE];
        if self.mem.copy_from_emu(&mut chunk, read_ptr).is_none() {
            tracing::warn!(read_ptr = %gchan_utils::hex(read_ptr), "FIFO read from unmapped memory");
        }
        // SAFETY: CPU/GPU ownership per mode; the range is past read.
        unsafe {
            self.video_buffer.write(write, &chunk);
        }
        self.write_off
            .store(write + GATHER_PIPE_SIZE, Ordering::Release);
    }

    /// The deterministic-mode version: runs on the CPU and pre-decodes.
    fn read_data_from_fifo_on_cpu(&self, read_ptr: u32) {
        let mut write = self.write_off.load(Ordering::Relaxed);
        if GATHER_PIPE_SIZE > FIFO_SIZE - write {
            // We can't wrap around while the GPU is working on the data.
            // This should be rare due to the reset in sync_gpu.
            self.sync_gpu(SyncGpuReason::Wraparound, true);
            if !self.gpu_mainloop.is_running() {
                // GPU is shutting down, so the next asserts may fail.
                return;
            }
            if self.pp_read_off.load(Ordering::Relaxed) != self.read_off.load(Ordering::Relaxed) {
                panic!("Desynced read pointers");
            }
            write = self.write_off.load(Ordering::Relaxed);
            let pp_read = self.pp_read_off.load(Ordering::Relaxed);
            let existing_len = write - pp_read;
            if GATHER_PIPE_SIZE > FIFO_SIZE - existing_len {
                panic!(
                    "FIFO out of bounds (existing {existing_len} + new {GATHER_PIPE_SIZE} > {FIFO_SIZE})"
                );
            }
        }

        let mut chunk = [0u8; GATHER_PIPE_SIZE];
        if self.mem.copy_from_emu(&mut chunk, read_ptr).is_none() {
            tracing::warn!(read_ptr = %gchan_utils::hex(read_ptr), "FIFO read from unmapped memory");
        }
        // SAFETY: the GPU never reads past seen, which trails write.
        unsafe {
            self.video_buffer.write(write, &chunk);
        }

        let pp_read = self.pp_read_off.load(Ordering::Relaxed);
        // Pre-run the decoder over everything published so far plus the
        // new chunk.
        let consumed = {
            let mut decoder = self.pp_decoder.get();
            let mut cycles = 0;
            // SAFETY: [pp_read, write + chunk) is CPU-owned.
            let data = unsafe { self.video_buffer.read(pp_read, write + GATHER_PIPE_SIZE) };
            decoder.run_fifo(data, &mut cycles)
        };
        self.pp_read_off.store(pp_read + consumed, Ordering::Relaxed);

        // Publish after the pre-decode; the GPU reads write before seen.
        self.write_off
            .store(write + GATHER_PIPE_SIZE, Ordering::Release);
    }

    pub fn at_breakpoint(&self) -> bool {
        let fifo = &self.cp.fifo;
        fifo.bp_enable.load(Ordering::Relaxed)
            && fifo.cp_read_pointer.load(Ordering::Relaxed)
                == fifo.cp_breakpoint.load(Ordering::Relaxed)
    }

    fn advance_read_pointer(&self) {
        let fifo = &self.cp.fifo;
        let read_ptr = fifo.cp_read_pointer.load(Ordering::Relaxed);
        if read_ptr == fifo.cp_end.load(Ordering::Relaxed) {
            fifo.cp_read_pointer
                .store(fifo.cp_base.load(Ordering::Relaxed), Ordering::Relaxed);
        } else {
            fifo.cp_read_pointer
                .store(read_ptr + GATHER_PIPE_SIZE as u32, Ordering::Relaxed);
        }
    }

    /// Main FIFO update loop, the GPU thread's body. Keeps the CP status
    /// and the CPU-GPU distance up to date.
    pub fn run_gpu_loop(&self) {
        self.gpu_mainloop.run(|| {
            // Do nothing while paused.
            if !self.emu_running_state.load(Ordering::SeqCst) {
                return;
            }

            if self.use_deterministic_gpu_thread() {
                // All the FIFO/CP logic is on the CPU. We just need to
                // run the opcode decoder, never past seen's publisher.
                let write = self.write_off.load(Ordering::Acquire);
                let seen = self.seen_off.load(Ordering::Acquire);
                if write > seen {
                    let read = self.read_off.load(Ordering::Relaxed);
                    let consumed = {
                        let mut decoder = self.decoder.get();
                        let mut cycles = 0;
                        // SAFETY: [read, write) is published data.
                        let data = unsafe { self.video_buffer.read(read, write) };
                        decoder.run_fifo(data, &mut cycles)
                    };
                    self.read_off.store(read + consumed, Ordering::Relaxed);
                    self.seen_off.store(write, Ordering::Release);
                }
            } else {
                let fifo = &self.cp.fifo;
                self.cp.set_cp_status_from_gpu(&self.pi);

                // Check if we are able to run this buffer.
                while !self.cp.is_interrupt_waiting()
                    && fifo.gp_read_enable.load(Ordering::Relaxed)
                    && fifo.cp_read_write_distance.load(Ordering::Relaxed) != 0
                    && !self.at_breakpoint()
                {
                    if self.config.sync_gpu.load(Ordering::Relaxed)
                        && self.sync_ticks.load(Ordering::Acquire)
                            < self.config.sync_gpu_min_distance.load(Ordering::Relaxed)
                    {
                        break;
                    }

                    let read_ptr = fifo.cp_read_pointer.load(Ordering::Relaxed);
                    self.read_data_from_fifo(read_ptr);
                    self.advance_read_pointer();

                    let distance = fifo
                        .cp_read_write_distance
                        .load(Ordering::Relaxed)
                        - GATHER_PIPE_SIZE as i32;
                    assert!(
                        distance >= 0,
                        "Negative CPReadWriteDistance = {distance} in FIFO loop; \
                         that can produce instability in the game."
                    );

                    let mut cycles = 0u32;
                    let read = self.read_off.load(Ordering::Relaxed);
                    let write = self.write_off.load(Ordering::Relaxed);
                    let consumed = {
                        let mut decoder = self.decoder.get();
                        // SAFETY: GPU owns [read, write).
                        let data = unsafe { self.video_buffer.read(read, write) };
                        decoder.run_fifo(data, &mut cycles)
                    };
                    self.read_off.store(read + consumed, Ordering::Relaxed);

                    fifo.cp_read_write_distance
                        .fetch_sub(GATHER_PIPE_SIZE as i32, Ordering::SeqCst);
                    if write == read + consumed {
                        fifo.safe_cp_read_pointer.store(
                            fifo.cp_read_pointer.load(Ordering::Relaxed),
                            Ordering::Relaxed,
                        );
                    }

                    self.cp.set_cp_status_from_gpu(&self.pi);

                    if self.config.sync_gpu.load(Ordering::Relaxed) {
                        let cycles = (cycles as f32 / self.config.overclock()) as i32;
                        let old = self.sync_ticks.fetch_sub(cycles, Ordering::AcqRel);
                        let max = self.config.sync_gpu_max_distance.load(Ordering::Relaxed);
                        if old >= max && old - cycles < max {
                            self.sync_wakeup.set();
                        }
                    }
                }

                // Fast skip remaining GPU time if the FIFO is empty.
                if self.sync_ticks.load(Ordering::Acquire) > 0 {
                    let old = self.sync_ticks.swap(0, Ordering::AcqRel);
                    if old >= self.config.sync_gpu_max_distance.load(Ordering::Relaxed) {
                        self.sync_wakeup.set();
                    }
                }

                // The FIFO ran dry; emit whatever the decoder buffered
                // and refresh CPU-visible peeks.
                let mut decoder = self.decoder.get();
                decoder.flush();
                decoder.refresh_peek_cache();
            }
        });
    }

    pub fn flush_gpu(&self) {
        if !self.is_dual_core() || self.use_deterministic_gpu_thread() {
            return;
        }
        self.gpu_mainloop.wait();
    }

    pub fn gpu_may_sleep(&self) {
        self.gpu_mainloop.allow_sleep();
    }

    pub fn gpu_loop_running(&self) -> bool {
        self.gpu_mainloop.is_running()
    }

    /// Wakes the GPU worker; the scheduler-side resume of the sync
    /// callback is handled by the caller.
    pub fn wake_gpu(&self) {
        if self.is_dual_core() && !self.use_deterministic_gpu_thread() {
            self.gpu_mainloop.wakeup();
        }
    }

    /// Whether the sync callback needs rescheduling after a FIFO write.
    pub fn needs_sync_callback(&self) -> bool {
        !self.is_dual_core()
            || self.use_deterministic_gpu_thread()
            || self.config.sync_gpu.load(Ordering::Relaxed)
    }

    pub fn syncing_suspended(&self) -> bool {
        self.syncing_suspended.load(Ordering::Relaxed)
    }

    pub fn set_syncing_suspended(&self, suspended: bool) {
        self.syncing_suspended.store(suspended, Ordering::Relaxed);
    }

    /// Single-core (and deterministic pre-run) GPU slice on the CPU
    /// thread. Returns -1 when idle, else the next reschedule delay.
    pub fn run_gpu_on_cpu(&self, ticks: i32) -> i32 {
        let fifo = &self.cp.fifo;
        let mut reset_simd_state = false;
        let mut saved_csr = 0u32;
        let mut available_ticks = (ticks as f32 * self.config.overclock()) as i32
            + self.sync_ticks.load(Ordering::SeqCst);

        while fifo.gp_read_enable.load(Ordering::Relaxed)
            && fifo.cp_read_write_distance.load(Ordering::Relaxed) != 0
            && !self.at_breakpoint()
            && available_ticks >= 0
        {
            if self.use_deterministic_gpu_thread() {
                self.read_data_from_fifo_on_cpu(fifo.cp_read_pointer.load(Ordering::Relaxed));
                self.gpu_mainloop.wakeup();
            } else {
                if !reset_simd_state {
                    saved_csr = save_simd_state();
                    reset_simd_state = true;
                }
                self.read_data_from_fifo(fifo.cp_read_pointer.load(Ordering::Relaxed));
                let mut cycles = 0u32;
                let read = self.read_off.load(Ordering::Relaxed);
                let write = self.write_off.load(Ordering::Relaxed);
                let consumed = {
                    let mut decoder = self.decoder.get();
                    // SAFETY: single-core, this thread owns everything.
                    let data = unsafe { self.video_buffer.read(read, write) };
                    decoder.run_fifo(data, &mut cycles)
                };
                self.read_off.store(read + consumed, Ordering::Relaxed);
                available_ticks -= cycles as i32;
            }

            self.advance_read_pointer();
            fifo.cp_read_write_distance
                .fetch_sub(GATHER_PIPE_SIZE as i32, Ordering::Relaxed);
        }

        self.cp.set_cp_status_from_gpu(&self.pi);

        if reset_simd_state {
            restore_simd_state(saved_csr);
        }

        // Discard all available ticks as there is nothing to do anymore.
        self.sync_ticks.store(available_ticks.min(0), Ordering::SeqCst);

        // If the GPU is idle, drop the handler.
        if available_ticks >= 0 {
            return -1;
        }

        // Always wait at least for GPU_TIME_SLOT_SIZE cycles.
        -available_ticks + GPU_TIME_SLOT_SIZE
    }

    /// Dual-core CPU-side pacing: credit the GPU thread with `ticks`,
    /// wake it or block on it as the distance demands. Returns the next
    /// good time to be called, or -1 to stop polling.
    pub fn wait_for_gpu_thread(&self, ticks: i32) -> i32 {
        let old = self.sync_ticks.fetch_add(ticks, Ordering::AcqRel);
        let now = old + ticks;

        let min = self.config.sync_gpu_min_distance.load(Ordering::Relaxed);
        let max = self.config.sync_gpu_max_distance.load(Ordering::Relaxed);

        // GPU is idle, so stop polling.
        if old >= 0 && self.gpu_mainloop.is_done() {
            return -1;
        }

        // Wake up the GPU.
        if old < min && now >= min {
            self.wake_gpu();
        }

        // If the GPU is still sleeping, wait for a longer time.
        if now < min {
            return GPU_TIME_SLOT_SIZE + min - now;
        }

        // Wait for the GPU.
        if now >= max {
            self.sync_wakeup.wait();
        }

        GPU_TIME_SLOT_SIZE
    }

    /// Deterministic-thread selection; only safe on quiescent state.
    pub fn update_want_determinism(&self, want: bool) {
        let gpu_thread = want && self.is_dual_core();
        if self.use_deterministic_gpu_thread() != gpu_thread {
            self.use_deterministic_gpu_thread
                .store(gpu_thread, Ordering::SeqCst);
            if gpu_thread {
                // These haven't been updated in non-deterministic mode.
                let read = self.read_off.load(Ordering::Relaxed);
                self.seen_off.store(read, Ordering::Release);
                self.pp_read_off.store(read, Ordering::Relaxed);
            }
        }
    }

    pub fn do_state(&self, p: &mut PointerWrap) {
        // SAFETY: callers hold the pause lock; both loops are idle.
        unsafe {
            let buffer = &mut *self.video_buffer.0.get();
            p.do_bytes(&mut buffer[..FIFO_SIZE]);
        }
        let mut write = self.write_off.load(Ordering::Relaxed) as u64;
        let mut read = self.read_off.load(Ordering::Relaxed) as u64;
        p.do_u64(&mut write);
        p.do_u64(&mut read);
        self.write_off.store(write as usize, Ordering::Release);
        self.read_off.store(read as usize, Ordering::Relaxed);

        if p.is_read_mode() && self.use_deterministic_gpu_thread() {
            // We're good and paused, right?
            self.seen_off.store(read as usize, Ordering::Release);
            self.pp_read_off.store(read as usize, Ordering::Relaxed);
        }

        let mut ticks = self.sync_ticks.load(Ordering::SeqCst);
        p.do_i32(&mut ticks);
        self.sync_ticks.store(ticks, Ordering::SeqCst);

        let mut suspended = self.syncing_suspended.load(Ordering::Relaxed);
        p.do_bool(&mut suspended);
        self.syncing_suspended.store(suspended, Ordering::Relaxed);
    }

    /// Observed byte span for tests: what the GPU side would decode next.
    pub fn pending_bytes(&self) -> usize {
        self.write_off.load(Ordering::Acquire) - self.read_off.load(Ordering::Relaxed)
    }
}

fn save_simd_state() -> u32 {
    // The opcode decoder expects the default rounding mode, not whatever
    // the guest FPU left behind.
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let csr = std::arch::x86_64::_mm_getcsr();
        std::arch::x86_64::_mm_setcsr(0x1F80);
        csr
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

fn restore_simd_state(csr: u32) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_setcsr(csr);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = csr;
}

/// Wake up the GPU thread and, if the sync callback went to sleep,
/// reschedule it. Called after FIFO writes on the CPU thread.
pub fn run_gpu(emu: &mut crate::Emu) {
    emu.fifo.wake_gpu();

    if emu.fifo.needs_sync_callback() && emu.fifo.syncing_suspended() {
        emu.fifo.set_syncing_suspended(false);
        emu.scheduler
            .schedule_event(GPU_TIME_SLOT_SIZE as u64, crate::EventKind::SyncGpu);
    }
}

/// The scheduler-registered callback keeping CPU and GPU in step.
pub fn sync_gpu_callback(emu: &mut crate::Emu, ticks: u64, cycles_late: i64) {
    let ticks = (ticks as i64 + cycles_late) as i32;
    let next = if !emu.fifo.is_dual_core() || emu.fifo.use_deterministic_gpu_thread() {
        emu.fifo.run_gpu_on_cpu(ticks)
    } else if emu.fifo.config.sync_gpu.load(Ordering::Relaxed) {
        emu.fifo.wait_for_gpu_thread(ticks)
    } else {
        -1
    };

    emu.fifo.set_syncing_suspended(next < 0);
    if next >= 0 {
        emu.scheduler
            .schedule_event(next as u64, crate::EventKind::SyncGpu);
    }
}

/// CP register reads from the CPU must observe fresh GPU state.
pub fn sync_gpu_for_register_access(emu: &mut crate::Emu) {
    emu.fifo.sync_gpu(SyncGpuReason::Other, false);

    if !emu.fifo.is_dual_core() || emu.fifo.use_deterministic_gpu_thread() {
        emu.fifo.run_gpu_on_cpu(GPU_TIME_SLOT_SIZE);
    } else if emu.fifo.config.sync_gpu.load(Ordering::Relaxed) {
        emu.fifo.wait_for_gpu_thread(GPU_TIME_SLOT_SIZE);
    }
}
