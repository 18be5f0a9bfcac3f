use std::collections::BTreeMap;

use thiserror::Error;

/// Near region: block bodies, hot path.
pub const CODE_SIZE: usize = 16 * 1024 * 1024;
/// Dispatcher and the other fixed routines.
pub const ROUTINES_SIZE: usize = 16 * 1024;
/// Backpatch trampolines.
pub const TRAMPOLINES_SIZE: usize = 256 * 1024;
/// Cold slow paths emitted per block.
pub const FARCODE_SIZE: usize = 4 * 1024 * 1024;
pub const CONSTPOOL_SIZE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum CodeRegionError {
    #[error("mmap of code region failed: {0}")]
    Map(std::io::Error),
    #[error("no free span left in {0:?} region")]
    NoSpace(Region),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Near,
    Far,
}

/// Set of free `[from, to)` byte ranges with coalescing.
#[derive(Default, Debug)]
pub struct FreeRangeSet {
    ranges: BTreeMap<usize, usize>,
}

impl FreeRangeSet {
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn insert(&mut self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        let mut from = from;
        let mut to = to;

        // Merge with a predecessor that touches or overlaps us.
        if let Some((&prev_from, &prev_to)) = self.ranges.range(..=from).next_back() {
            if prev_to >= from {
                from = prev_from;
                to = to.max(prev_to);
                self.ranges.remove(&prev_from);
            }
        }
        // Swallow successors that start inside the merged range.
        while let Some((&next_from, &next_to)) = self.ranges.range(from..).next() {
            if next_from > to {
                break;
            }
            to = to.max(next_to);
            self.ranges.remove(&next_from);
        }
        self.ranges.insert(from, to);
    }

    pub fn erase(&mut self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        let mut touched: Vec<(usize, usize)> = Vec::new();
        if let Some((&prev_from, &prev_to)) = self.ranges.range(..=from).next_back() {
            if prev_to > from {
                touched.push((prev_from, prev_to));
            }
        }
        for (&next_from, &next_to) in self.ranges.range(from..) {
            if next_from >= to {
                break;
            }
            touched.push((next_from, next_to));
        }
        for (range_from, range_to) in touched {
            self.ranges.remove(&range_from);
            if range_from < from {
                self.ranges.insert(range_from, from);
            }
            if range_to > to {
                self.ranges.insert(to, range_to);
            }
        }
    }

    /// Largest free span, ties broken towards lower addresses.
    pub fn largest(&self) -> Option<(usize, usize)> {
        self.ranges
            .iter()
            .max_by_key(|&(&from, &to)| (to - from, std::cmp::Reverse(from)))
            .map(|(&from, &to)| (from, to))
    }

    pub fn total_free(&self) -> usize {
        self.ranges.iter().map(|(from, to)| to - from).sum()
    }
}

/// One RWX arena partitioned into the fixed child regions plus the near
/// bulk. Child regions are bump-allocated; near and far reclaim through
/// the free-range sets.
pub struct CodeRegion {
    base: *mut u8,
    total: usize,

    routines: (usize, usize),
    trampolines: (usize, usize),
    far: (usize, usize),
    const_pool: (usize, usize),
    near: (usize, usize),

    pub free_near: FreeRangeSet,
    pub free_far: FreeRangeSet,

    routines_used: usize,
    trampolines_used: usize,
}

unsafe impl Send for CodeRegion {}

impl CodeRegion {
    pub fn new() -> Result<Self, CodeRegionError> {
        let total = CODE_SIZE + ROUTINES_SIZE + TRAMPOLINES_SIZE + FARCODE_SIZE + CONSTPOOL_SIZE;
        // SAFETY: fresh anonymous mapping, never overlapping anything.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CodeRegionError::Map(std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        let mut cursor = base as usize;
        let mut carve = |size: usize| {
            let start = cursor;
            cursor += size;
            (start, start + size)
        };
        let routines = carve(ROUTINES_SIZE);
        let trampolines = carve(TRAMPOLINES_SIZE);
        let far = carve(FARCODE_SIZE);
        let const_pool = carve(CONSTPOOL_SIZE);
        let near = carve(CODE_SIZE);

        let mut region = Self {
            base,
            total,
            routines,
            trampolines,
            far,
            const_pool,
            near,
            free_near: FreeRangeSet::default(),
            free_far: FreeRangeSet::default(),
            routines_used: 0,
            trampolines_used: 0,
        };
        region.reset_free_ranges();
        Ok(region)
    }

    /// Marks the whole near and far regions as unused.
    pub fn reset_free_ranges(&mut self) {
        self.free_near.clear();
        self.free_near.insert(self.near.0, self.near.1);
        self.free_far.clear();
        self.free_far.insert(self.far.0, self.far.1);
    }

    fn free_set(&mut self, region: Region) -> &mut FreeRangeSet {
        match region {
            Region::Near => &mut self.free_near,
            Region::Far => &mut self.free_far,
        }
    }

    /// Largest `[from, to)` span of the region's free set.
    pub fn largest_free(&mut self, region: Region) -> Result<(usize, usize), CodeRegionError> {
        self.free_set(region)
            .largest()
            .ok_or(CodeRegionError::NoSpace(region))
    }

    pub fn erase(&mut self, region: Region, from: usize, to: usize) {
        self.free_set(region).erase(from, to);
    }

    pub fn insert(&mut self, region: Region, from: usize, to: usize) {
        self.free_set(region).insert(from, to);
    }

    /// Bump allocation inside the routines child region.
    pub fn alloc_routines(&mut self, size: usize) -> (usize, usize) {
        let start = self.routines.0 + self.routines_used;
        assert!(start + size <= self.routines.1, "routines region exhausted");
        self.routines_used += size;
        (start, start + size)
    }

    pub fn alloc_trampoline(&mut self, size: usize) -> (usize, usize) {
        let start = self.trampolines.0 + self.trampolines_used;
        assert!(
            start + size <= self.trampolines.1,
            "trampoline region exhausted"
        );
        self.trampolines_used += size;
        (start, start + size)
    }

    /// The trampoline cache cannot reclaim individual entries; when it is
    /// nearly full the whole JIT cache is cleared instead.
    pub fn trampolines_almost_full(&self) -> bool {
        self.trampolines_used * 8 > (self.trampolines.1 - self.trampolines.0) * 7
    }

    pub fn clear_trampolines(&mut self) {
        self.trampolines_used = 0;
    }

    pub fn const_pool(&self) -> (usize, usize) {
        self.const_pool
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        (base..base + self.total).contains(&addr)
    }

    pub fn near_span(&self) -> (usize, usize) {
        self.near
    }

    pub fn far_span(&self) -> (usize, usize) {
        self.far
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        // SAFETY: exact mapping created in new().
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

/// Deduplicated 8-byte constants living in the const-pool child region,
/// addressable from emitted code.
#[derive(Default)]
pub struct ConstPool {
    base: usize,
    end: usize,
    used: usize,
    map: std::collections::HashMap<u64, usize>,
}

impl ConstPool {
    pub fn init(&mut self, span: (usize, usize)) {
        self.base = span.0;
        self.end = span.1;
        self.clear();
    }

    pub fn clear(&mut self) {
        self.used = 0;
        self.map.clear();
    }

    /// Host address of an 8-byte constant, emitting it on first use.
    pub fn get(&mut self, value: u64) -> usize {
        if let Some(&addr) = self.map.get(&value) {
            return addr;
        }
        let addr = self.base + self.used;
        assert!(addr + 8 <= self.end, "const pool exhausted");
        // SAFETY: inside the const-pool child region, which is RW.
        unsafe {
            std::ptr::write_unaligned(addr as *mut u64, value);
        }
        self.used += 8;
        self.map.insert(value, addr);
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn insert_coalesces_adjacent() {
        let mut set = FreeRangeSet::default();
        set.insert(0x1000, 0x2000);
        set.insert(0x2000, 0x3000);
        assert_eq!(set.largest(), Some((0x1000, 0x3000)));
        set.insert(0x0800, 0x1000);
        assert_eq!(set.largest(), Some((0x0800, 0x3000)));
    }

    #[test]
    fn erase_splits_ranges() {
        let mut set = FreeRangeSet::default();
        set.insert(0x1000, 0x4000);
        set.erase(0x2000, 0x3000);
        assert_eq!(set.total_free(), 0x2000);
        assert_eq!(set.largest(), Some((0x1000, 0x2000)));
        set.insert(0x2000, 0x3000);
        assert_eq!(set.largest(), Some((0x1000, 0x4000)));
    }

    #[rstest]
    #[case(0x1000, 0x1000)]
    #[case(0x2000, 0x1000)]
    fn degenerate_ranges_ignored(#[case] from: usize, #[case] to: usize) {
        let mut set = FreeRangeSet::default();
        set.insert(from, to);
        assert!(set.is_empty());
    }

    #[test]
    fn erase_across_multiple_ranges() {
        let mut set = FreeRangeSet::default();
        set.insert(0x1000, 0x2000);
        set.insert(0x3000, 0x4000);
        set.erase(0x1800, 0x3800);
        assert_eq!(set.total_free(), 0x1000);
        set.erase(0x0000, 0x9000);
        assert!(set.is_empty());
    }

    #[test]
    fn region_allocates_and_reclaims() {
        let mut region = CodeRegion::new().unwrap();
        let (from, to) = region.largest_free(Region::Near).unwrap();
        assert_eq!(to - from, CODE_SIZE);
        region.erase(Region::Near, from, from + 0x100);
        let (from2, _) = region.largest_free(Region::Near).unwrap();
        assert_eq!(from2, from + 0x100);
        region.insert(Region::Near, from, from + 0x100);
        assert_eq!(region.largest_free(Region::Near).unwrap(), (from, to));
    }

    #[test]
    fn region_is_executable_mapping() {
        let region = CodeRegion::new().unwrap();
        let (start, _) = region.near_span();
        // A `ret` we can actually call.
        unsafe {
            std::ptr::write(start as *mut u8, 0xC3);
            let f: extern "C" fn() = std::mem::transmute(start);
            f();
        }
    }
}
