use thiserror::Error;

/// 24 MiB of main memory.
pub const MEM1_SIZE: u32 = 0x0180_0000;
/// Guest effective addresses are 32 bit; the extra 64 KiB absorbs the
/// largest displacement an emitted access can add past the top.
pub const FASTMEM_WINDOW_SIZE: usize = 0x1_0001_0000;

pub const MMIO_BASE: u32 = 0xCC00_0000;
pub const MMIO_CP: u32 = 0xCC00_0000;
pub const MMIO_PI: u32 = 0xCC00_3000;
pub const MMIO_GATHER_PIPE: u32 = 0xCC00_8000;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memfd_create failed: {0}")]
    Backing(std::io::Error),
    #[error("mmap of fastmem window failed: {0}")]
    Window(std::io::Error),
    #[error("mapping view at {offset:#x} failed: {source}")]
    View {
        offset: usize,
        source: std::io::Error,
    },
}

/// Guest RAM plus the two fault-backed fastmem windows.
///
/// The same `memfd` pages appear at every mirror, so a store through one
/// view is visible through all of them. Everything outside the mapped
/// mirrors stays `PROT_NONE` and faults into the backpatcher.
pub struct Memory {
    fd: libc::c_int,
    physical_base: *mut u8,
    logical_base: *mut u8,
}

// The raw pointers are owned mappings, not shared references; the GPU
// loop reads through them concurrently with CPU writes under the FIFO
// pointer protocol.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

unsafe fn reserve_window() -> Result<*mut u8, MemoryError> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        FASTMEM_WINDOW_SIZE,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::Window(last_os_error()));
    }
    Ok(ptr as *mut u8)
}

unsafe fn map_view(base: *mut u8, offset: usize, fd: libc::c_int) -> Result<(), MemoryError> {
    let ptr = libc::mmap(
        base.add(offset) as *mut libc::c_void,
        MEM1_SIZE as usize,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::View {
            offset,
            source: last_os_error(),
        });
    }
    Ok(())
}

impl Memory {
    pub fn new() -> Result<Self, MemoryError> {
        unsafe {
            let fd = libc::memfd_create(c"gchan-mem1".as_ptr(), 0);
            if fd < 0 {
                return Err(MemoryError::Backing(last_os_error()));
            }
            if libc::ftruncate(fd, MEM1_SIZE as libc::off_t) != 0 {
                let err = last_os_error();
                libc::close(fd);
                return Err(MemoryError::Backing(err));
            }

            let physical_base = reserve_window()?;
            let logical_base = reserve_window()?;

            // Physical address space: MEM1 at zero.
            map_view(physical_base, 0, fd)?;
            // Effective address space: cached and uncached mirrors.
            map_view(logical_base, 0x8000_0000, fd)?;
            map_view(logical_base, 0xC000_0000, fd)?;
            // Some loaders run with translation off; keep the low mirror
            // usable through the logical window too.
            map_view(logical_base, 0, fd)?;

            Ok(Self {
                fd,
                physical_base,
                logical_base,
            })
        }
    }

    pub fn physical_base(&self) -> *mut u8 {
        self.physical_base
    }

    pub fn logical_base(&self) -> *mut u8 {
        self.logical_base
    }

    /// Maps a guest effective address to an offset into MEM1, or None for
    /// anything unmapped (MMIO included).
    pub fn ram_offset(ea: u32) -> Option<u32> {
        let segment = ea >> 28;
        if !matches!(segment, 0x0 | 0x8 | 0xC) {
            return None;
        }
        let offset = ea & 0x0FFF_FFFF;
        (offset < MEM1_SIZE).then_some(offset)
    }

    /// Physical address of the instruction at `ea`, or None when the fetch
    /// would fault (translation ISI).
    pub fn instruction_address(ea: u32) -> Option<u32> {
        Self::ram_offset(ea)
    }

    fn ram(&self) -> &[u8] {
        // SAFETY: the first MEM1_SIZE bytes of the physical window are
        // always mapped read/write.
        unsafe { std::slice::from_raw_parts(self.physical_base, MEM1_SIZE as usize) }
    }

    /// Guest memory is inherently shared: emitted code, the interpreter
    /// and the GPU loops all write through the same mapping. Writes go
    /// through raw pointers; the guest's own ordering rules apply.
    #[allow(clippy::mut_from_ref)]
    fn ram_mut(&self) -> &mut [u8] {
        // SAFETY: mapping is ours and always writable.
        unsafe { std::slice::from_raw_parts_mut(self.physical_base, MEM1_SIZE as usize) }
    }

    pub fn read_u8(&self, ea: u32) -> Option<u8> {
        let offset = Self::ram_offset(ea)? as usize;
        Some(self.ram()[offset])
    }

    pub fn read_u16(&self, ea: u32) -> Option<u16> {
        let offset = Self::ram_offset(ea)? as usize;
        let bytes = self.ram().get(offset..offset + 2)?;
        Some(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&self, ea: u32) -> Option<u32> {
        let offset = Self::ram_offset(ea)? as usize;
        let bytes = self.ram().get(offset..offset + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&self, ea: u32) -> Option<u64> {
        let offset = Self::ram_offset(ea)? as usize;
        let bytes = self.ram().get(offset..offset + 8)?;
        Some(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_u8(&self, ea: u32, value: u8) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        self.ram_mut()[offset] = value;
        Some(())
    }

    pub fn write_u16(&self, ea: u32, value: u16) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        self.ram_mut()[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        Some(())
    }

    pub fn write_u32(&self, ea: u32, value: u32) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        self.ram_mut()[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        Some(())
    }

    pub fn write_u64(&self, ea: u32, value: u64) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        self.ram_mut()[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
        Some(())
    }

    /// Bulk copy out of guest memory, used by the FIFO loops to pull
    /// gather-pipe chunks into the video buffer.
    pub fn copy_from_emu(&self, dst: &mut [u8], ea: u32) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        let src = self.ram().get(offset..offset + dst.len())?;
        dst.copy_from_slice(src);
        Some(())
    }

    pub fn copy_to_emu(&self, ea: u32, src: &[u8]) -> Option<()> {
        let offset = Self::ram_offset(ea)? as usize;
        self.ram_mut().get_mut(offset..offset + src.len())?.copy_from_slice(src);
        Some(())
    }

    /// True when `host_addr` falls inside one of the fastmem windows;
    /// returns the guest address it corresponds to.
    pub fn guest_address_of_fault(&self, host_addr: usize) -> Option<u32> {
        let phys = self.physical_base as usize;
        if (phys..phys + FASTMEM_WINDOW_SIZE).contains(&host_addr) {
            return Some((host_addr - phys) as u32);
        }
        let logical = self.logical_base as usize;
        if (logical..logical + FASTMEM_WINDOW_SIZE).contains(&host_addr) {
            return Some((host_addr - logical) as u32);
        }
        None
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.physical_base as *mut libc::c_void, FASTMEM_WINDOW_SIZE);
            libc::munmap(self.logical_base as *mut libc::c_void, FASTMEM_WINDOW_SIZE);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mirrors_alias_the_same_pages() {
        let mem = Memory::new().unwrap();
        mem.write_u32(0x8000_0000, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read_u32(0x0000_0000), Some(0xDEAD_BEEF));
        assert_eq!(mem.read_u32(0xC000_0000), Some(0xDEAD_BEEF));

        // And through the raw fastmem window, in guest byte order.
        let raw = unsafe { std::ptr::read(mem.physical_base() as *const [u8; 4]) };
        assert_eq!(raw, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn mmio_is_unmapped() {
        let mem = Memory::new().unwrap();
        assert_eq!(Memory::ram_offset(0xCC00_8000), None);
        assert_eq!(mem.read_u32(0xCC00_8000), None);
        assert_eq!(Memory::ram_offset(0x8180_0000), None);
    }

    #[test]
    fn copies_round_trip() {
        let mem = Memory::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        mem.copy_to_emu(0x8000_1000, &data).unwrap();
        let mut out = [0u8; 64];
        mem.copy_from_emu(&mut out, 0x0000_1000).unwrap();
        assert_eq!(&out[..], &data[..]);
    }
}
