//! Command-processor state shared between the CPU and GPU threads, plus
//! the opcode-decoder seam. The decoder itself (vertex manager and
//! friends) is an external collaborator; tests plug in counting stubs.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

pub const INT_CAUSE_PE_TOKEN: u32 = 0x200;
pub const INT_CAUSE_PE_FINISH: u32 = 0x400;
pub const INT_CAUSE_CP: u32 = 0x800;

/// The CP FIFO registers both threads observe. Orderings follow the
/// pointer discipline: distance decrements are seq_cst because CP status
/// derives from the observed value, everything else is relaxed.
#[derive(Default)]
pub struct SyncedFifo {
    pub cp_base: AtomicU32,
    pub cp_end: AtomicU32,
    pub cp_read_pointer: AtomicU32,
    pub cp_write_pointer: AtomicU32,
    pub cp_breakpoint: AtomicU32,
    pub cp_read_write_distance: AtomicI32,
    pub safe_cp_read_pointer: AtomicU32,
    pub gp_read_enable: AtomicBool,
    pub bp_enable: AtomicBool,
    pub gp_link_enable: AtomicBool,
}

#[derive(Default)]
pub struct CommandProcessor {
    pub fifo: SyncedFifo,
    /// A CP interrupt is pending delivery to the CPU.
    pub interrupt_waiting: AtomicBool,
}

impl CommandProcessor {
    pub fn is_interrupt_waiting(&self) -> bool {
        self.interrupt_waiting.load(Ordering::Relaxed)
    }

    /// Called from the GPU loop after every chunk; derives breakpoint and
    /// interrupt state from what the GPU has consumed.
    pub fn set_cp_status_from_gpu(&self, pi: &ProcessorInterface) {
        let fifo = &self.fifo;
        let bp_hit = fifo.bp_enable.load(Ordering::Relaxed)
            && fifo.cp_read_pointer.load(Ordering::Relaxed)
                == fifo.cp_breakpoint.load(Ordering::Relaxed);
        if bp_hit {
            self.interrupt_waiting.store(true, Ordering::Relaxed);
            pi.assert_int(INT_CAUSE_CP);
        }
    }

    /// CPU-side status refresh, run at gather-pipe checkpoints.
    pub fn update_interrupts_from_cpu(&self, pi: &ProcessorInterface) -> bool {
        if self.interrupt_waiting.swap(false, Ordering::Relaxed) {
            pi.assert_int(INT_CAUSE_CP);
            return true;
        }
        false
    }
}

/// The processor-interface cause register the emitted external-interrupt
/// check reads. Kept at a stable address behind a Box.
#[derive(Default)]
pub struct ProcessorInterface {
    pub cause: AtomicU32,
}

impl ProcessorInterface {
    pub fn assert_int(&self, bits: u32) {
        self.cause.fetch_or(bits, Ordering::Relaxed);
    }

    pub fn clear_int(&self, bits: u32) {
        self.cause.fetch_and(!bits, Ordering::Relaxed);
    }

    pub fn cause_ptr(&self) -> *const AtomicU32 {
        &self.cause
    }
}

/// Parser of the GPU command stream; drives the vertex and framebuffer
/// managers in the real system.
pub trait OpcodeDecoder: Send {
    /// Decodes as much of `data` as forms whole commands; returns bytes
    /// consumed and adds the emulated cost to `cycles`.
    fn run_fifo(&mut self, data: &[u8], cycles: &mut u32) -> usize;

    /// The ring drained; emit buffered primitives.
    fn flush(&mut self) {}

    /// Keep CPU-visible peeks fresh after a drain.
    fn refresh_peek_cache(&mut self) {}
}

/// Consumes whole 32-byte chunks at a fixed cycle cost. Stops at partial
/// chunks, which exercises the deterministic-mode partial-command
/// bookkeeping. An optional sink records the consumed stream so tests
/// can compare it across threads and runs.
pub struct ChunkDecoder {
    pub cycles_per_chunk: u32,
    pub chunks_seen: u64,
    pub bytes_seen: Vec<u8>,
    pub sink: Option<std::sync::Arc<std::sync::Mutex<Vec<u8>>>>,
}

impl ChunkDecoder {
    pub fn new(cycles_per_chunk: u32) -> Self {
        Self {
            cycles_per_chunk,
            chunks_seen: 0,
            bytes_seen: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(
        cycles_per_chunk: u32,
        sink: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    ) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(cycles_per_chunk)
        }
    }
}

impl OpcodeDecoder for ChunkDecoder {
    fn run_fifo(&mut self, data: &[u8], cycles: &mut u32) -> usize {
        let whole = data.len() / 32 * 32;
        self.bytes_seen.extend_from_slice(&data[..whole]);
        if let Some(sink) = &self.sink {
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&data[..whole]);
        }
        self.chunks_seen += (whole / 32) as u64;
        *cycles += (whole / 32) as u32 * self.cycles_per_chunk;
        whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chunk_decoder_stops_at_partial_commands() {
        let mut decoder = ChunkDecoder::new(100);
        let data = vec![0xAB; 70];
        let mut cycles = 0;
        let consumed = decoder.run_fifo(&data, &mut cycles);
        assert_eq!(consumed, 64);
        assert_eq!(cycles, 200);
        assert_eq!(decoder.chunks_seen, 2);
    }

    #[test]
    fn breakpoint_raises_cp_interrupt() {
        let cp = CommandProcessor::default();
        let pi = ProcessorInterface::default();
        cp.fifo.bp_enable.store(true, Ordering::Relaxed);
        cp.fifo.cp_breakpoint.store(0x100, Ordering::Relaxed);
        cp.fifo.cp_read_pointer.store(0x100, Ordering::Relaxed);
        cp.set_cp_status_from_gpu(&pi);
        assert!(cp.is_interrupt_waiting());
        assert_eq!(pi.cause.load(Ordering::Relaxed) & INT_CAUSE_CP, INT_CAUSE_CP);
    }
}
