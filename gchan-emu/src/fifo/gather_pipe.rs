//! The write-gather pipe. Stores to the WPAR address land here byte for
//! byte; full 32-byte chunks burst into the CP FIFO in guest memory and
//! wake the GPU.

use crate::cpu::Gqr;
use crate::EmuCtx;

pub const GATHER_PIPE_SIZE: usize = 32;
/// Extra headroom so a burst check can lag a few writes.
const PIPE_BUFFER_SIZE: usize = GATHER_PIPE_SIZE * 4;

pub struct GatherPipe {
    buffer: Box<[u8; PIPE_BUFFER_SIZE]>,
}

impl Default for GatherPipe {
    fn default() -> Self {
        Self {
            buffer: Box::new([0; PIPE_BUFFER_SIZE]),
        }
    }
}

impl GatherPipe {
    pub fn base_ptr(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr()
    }
}

/// Bytes currently pending in the pipe.
unsafe fn pipe_count(ctx: *mut EmuCtx) -> usize {
    unsafe {
        let ppc = (*ctx).ppc;
        let ptr = (*ppc).gather_pipe_ptr as usize;
        let base = (*ppc).gather_pipe_base_ptr as usize;
        ptr - base
    }
}

/// Appends raw bytes (already in guest byte order) and bursts if a full
/// chunk accumulated. Gather-pipe field access stays on raw pointers so
/// callers may hold their own PPCState borrows.
pub fn write_bytes(ctx: &mut EmuCtx, bytes: &[u8]) {
    unsafe {
        let ctx_ptr: *mut EmuCtx = ctx;
        let ppc = (*ctx_ptr).ppc;
        let dst = (*ppc).gather_pipe_ptr;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        (*ppc).gather_pipe_ptr = dst.add(bytes.len());
        if pipe_count(ctx_ptr) >= GATHER_PIPE_SIZE {
            update_gather_pipe(ctx_ptr);
        }
    }
}

pub fn write_u8(ctx: &mut EmuCtx, value: u8) {
    write_bytes(ctx, &[value]);
}

pub fn write_u16(ctx: &mut EmuCtx, value: u16) {
    write_bytes(ctx, &value.to_be_bytes());
}

pub fn write_u32(ctx: &mut EmuCtx, value: u32) {
    write_bytes(ctx, &value.to_be_bytes());
}

pub fn write_u64(ctx: &mut EmuCtx, value: u64) {
    write_bytes(ctx, &value.to_be_bytes());
}

/// Moves every complete chunk into the CP FIFO at `CPWritePointer`,
/// advancing and wrapping it, then shifts the remainder to the front of
/// the pipe. Callable from emitted code.
pub unsafe extern "C" fn update_gather_pipe(ctx: *mut EmuCtx) {
    unsafe {
        let emu = &mut *(*ctx).emu;
        let ppc = (*ctx).ppc;
        let base = (*ppc).gather_pipe_base_ptr;
        let mut processed = 0;
        let mut count = pipe_count(ctx);

        while count >= GATHER_PIPE_SIZE {
            let fifo = &emu.cp.fifo;
            let wp = fifo.cp_write_pointer.load(std::sync::atomic::Ordering::Relaxed);
            let chunk = std::slice::from_raw_parts(base.add(processed), GATHER_PIPE_SIZE);
            if emu.mem.copy_to_emu(wp, chunk).is_none() {
                tracing::warn!(wp = %gchan_utils::hex(wp), "gather pipe burst to unmapped FIFO");
            }

            let next = if wp == fifo.cp_end.load(std::sync::atomic::Ordering::Relaxed) {
                fifo.cp_base.load(std::sync::atomic::Ordering::Relaxed)
            } else {
                wp + GATHER_PIPE_SIZE as u32
            };
            fifo.cp_write_pointer.store(next, std::sync::atomic::Ordering::Relaxed);
            fifo.cp_read_write_distance
                .fetch_add(GATHER_PIPE_SIZE as i32, std::sync::atomic::Ordering::SeqCst);

            processed += GATHER_PIPE_SIZE;
            count -= GATHER_PIPE_SIZE;
        }

        if processed > 0 {
            std::ptr::copy(base.add(processed), base, count);
            (*ppc).gather_pipe_ptr = base.add(count);

            // Interrupt causes are sampled here, at gather-pipe
            // checkpoints, not asynchronously.
            if emu.cp.update_interrupts_from_cpu(&emu.pi) {
                (*ppc).exceptions |= crate::cpu::EXCEPTION_EXTERNAL_INT;
            }
            crate::fifo::run_gpu(emu);
        }
    }
}

/// The fast path emitted ahead of dense gather-pipe write runs.
pub unsafe extern "C" fn fast_check_gather_pipe(ctx: *mut EmuCtx) {
    unsafe {
        if pipe_count(ctx) >= GATHER_PIPE_SIZE {
            update_gather_pipe(ctx);
        }
    }
}

fn sext6(scale: u32) -> i32 {
    ((scale as i32) << 26) >> 26
}

/// Quantized paired-single load. `w` loads one element and pads ps1 with
/// 1.0.
pub fn dequantize_load(ctx: &mut EmuCtx, ea: u32, gqr: Gqr, w: bool) -> Option<[f64; 2]> {
    let ld_type = gqr.ld_type();
    let scale = f64::powi(2.0, -sext6(gqr.ld_scale()));

    let mut read = |offset: u32, index: usize| -> Option<f64> {
        let ea = ea.wrapping_add(offset * index as u32);
        Some(match ld_type {
            4 => ctx.read_u8(ea)? as f64 * scale,
            5 => ctx.read_u16(ea)? as f64 * scale,
            6 => ctx.read_u8(ea)? as i8 as f64 * scale,
            7 => ctx.read_u16(ea)? as i16 as f64 * scale,
            _ => f32::from_bits(ctx.read_u32(ea)?) as f64,
        })
    };

    let elem = match ld_type {
        4 | 6 => 1,
        5 | 7 => 2,
        _ => 4,
    };
    let ps0 = read(elem, 0)?;
    let ps1 = if w { 1.0 } else { read(elem, 1)? };
    Some([ps0, ps1])
}

/// Quantized paired-single store, clamped to the target type's range.
pub fn quantize_store(ctx: &mut EmuCtx, ea: u32, gqr: Gqr, w: bool, pair: [f64; 2]) -> Option<()> {
    let st_type = gqr.st_type();
    let scale = f64::powi(2.0, sext6(gqr.st_scale()));
    let count = if w { 1 } else { 2 };

    let mut offset = 0u32;
    for &value in pair.iter().take(count) {
        let scaled = value * scale;
        match st_type {
            4 => {
                ctx.write_u8(ea.wrapping_add(offset), scaled.clamp(0.0, 255.0) as u8)?;
                offset += 1;
            }
            5 => {
                ctx.write_u16(ea.wrapping_add(offset), scaled.clamp(0.0, 65535.0) as u16)?;
                offset += 2;
            }
            6 => {
                ctx.write_u8(
                    ea.wrapping_add(offset),
                    scaled.clamp(-128.0, 127.0) as i8 as u8,
                )?;
                offset += 1;
            }
            7 => {
                ctx.write_u16(
                    ea.wrapping_add(offset),
                    scaled.clamp(-32768.0, 32767.0) as i16 as u16,
                )?;
                offset += 2;
            }
            _ => {
                ctx.write_u32(ea.wrapping_add(offset), (value as f32).to_bits())?;
                offset += 4;
            }
        }
    }
    Some(())
}
