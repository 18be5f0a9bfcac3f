use std::collections::HashMap;

use smallvec::SmallVec;

use crate::jit::emitter::{patch_call, patch_jmp};

pub type BlockId = u32;

const PAGE_SHIFT: u32 = 12;

/// One resolved-or-pending exit of a block.
#[derive(Debug, Clone, Copy)]
pub struct LinkData {
    /// Guest destination of this exit.
    pub exit_address: u32,
    /// Host address of the 5-byte jmp/call stub.
    pub exit_ptr: usize,
    /// BL-style exit emitted as a call so the BLR prediction can `ret`.
    pub is_call: bool,
    pub linked: bool,
}

/// Sampled by the profiling preamble and exit stubs of a block.
#[repr(C)]
#[derive(Default, Debug)]
pub struct ProfileData {
    pub run_count: u64,
    pub tic_start: u64,
    pub tic_stop: u64,
    pub tic_counter: u64,
    pub downcount_counter: u64,
}

pub struct JitBlock {
    pub physical_start: u32,
    /// Guest instructions translated into this block.
    pub original_size: u32,
    /// Host bytes of the near-region body.
    pub code_size: u32,
    pub checked_entry: usize,
    pub normal_entry: usize,
    pub near: (usize, usize),
    pub far: (usize, usize),
    pub links: SmallVec<[LinkData; 4]>,
    /// Guest-physical pages this block was compiled from.
    pub pages: SmallVec<[u32; 4]>,
    /// Boxed so emitted code can hold a stable pointer.
    pub profile_data: Option<Box<ProfileData>>,
    pub valid: bool,
}

pub struct BlockCache {
    blocks: Vec<JitBlock>,
    /// Guest physical start -> valid block.
    block_map: HashMap<u32, BlockId>,
    /// Exit address -> blocks with an exit stub aimed there.
    links_to: HashMap<u32, SmallVec<[BlockId; 4]>>,
    /// Page -> blocks compiled from it, for invalidation.
    page_map: HashMap<u32, SmallVec<[BlockId; 8]>>,
    ranges_to_free_near: Vec<(usize, usize)>,
    ranges_to_free_far: Vec<(usize, usize)>,
    /// Where torn-out exit stubs get pointed back to.
    dispatcher: usize,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            block_map: HashMap::new(),
            links_to: HashMap::new(),
            page_map: HashMap::new(),
            ranges_to_free_near: Vec::new(),
            ranges_to_free_far: Vec::new(),
            dispatcher: 0,
        }
    }

    pub fn set_dispatcher(&mut self, dispatcher: usize) {
        self.dispatcher = dispatcher;
    }

    pub fn allocate_block(&mut self, physical_start: u32) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(JitBlock {
            physical_start,
            original_size: 0,
            code_size: 0,
            checked_entry: 0,
            normal_entry: 0,
            near: (0, 0),
            far: (0, 0),
            links: SmallVec::new(),
            pages: SmallVec::new(),
            profile_data: None,
            valid: false,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &JitBlock {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut JitBlock {
        &mut self.blocks[id as usize]
    }

    pub fn get_by_start(&self, physical_start: u32) -> Option<&JitBlock> {
        let id = *self.block_map.get(&physical_start)?;
        let block = &self.blocks[id as usize];
        block.valid.then_some(block)
    }

    pub fn len(&self) -> usize {
        self.block_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_map.is_empty()
    }

    /// Registers the block's guest-physical footprint and resolves links
    /// in both directions.
    pub fn finalize_block(
        &mut self,
        id: BlockId,
        enable_linking: bool,
        physical_addresses: &[u32],
    ) {
        let start = self.blocks[id as usize].physical_start;
        let mut pages: SmallVec<[u32; 4]> = SmallVec::new();
        for &addr in physical_addresses {
            let page = addr >> PAGE_SHIFT;
            if !pages.contains(&page) {
                pages.push(page);
            }
        }
        for &page in &pages {
            self.page_map.entry(page).or_default().push(id);
        }
        {
            let block = &mut self.blocks[id as usize];
            block.pages = pages;
            block.valid = true;
        }
        self.block_map.insert(start, id);

        for link in self.blocks[id as usize].links.clone() {
            self.links_to.entry(link.exit_address).or_default().push(id);
        }

        if enable_linking {
            self.link_block_exits(id);
            self.link_inbound(start);
        }
    }

    /// Patches this block's own unresolved exits whose destination is
    /// already compiled.
    fn link_block_exits(&mut self, id: BlockId) {
        let links = self.blocks[id as usize].links.clone();
        for (index, link) in links.iter().enumerate() {
            if link.linked {
                continue;
            }
            let Some(target) = self.get_by_start(link.exit_address) else {
                continue;
            };
            let entry = target.checked_entry;
            if link.is_call {
                patch_call(link.exit_ptr, entry);
            } else {
                patch_jmp(link.exit_ptr, entry);
            }
            self.blocks[id as usize].links[index].linked = true;
        }
    }

    /// Patches every other block's pending exits aimed at `start`, now
    /// that a block exists there.
    fn link_inbound(&mut self, start: u32) {
        let Some(sources) = self.links_to.get(&start).cloned() else {
            return;
        };
        for source in sources {
            if self.blocks[source as usize].valid {
                self.link_block_exits(source);
            }
        }
    }

    /// Marks every block whose footprint intersects `[from, to)` invalid,
    /// tears out inbound links and queues the host ranges for reclamation.
    pub fn invalidate_icache(&mut self, from: u32, to: u32, forced: bool) {
        let mut victims: Vec<BlockId> = Vec::new();
        if forced {
            victims.extend(
                self.blocks
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.valid)
                    .map(|(id, _)| id as BlockId),
            );
        } else {
            let first_page = from >> PAGE_SHIFT;
            let last_page = to.saturating_sub(1) >> PAGE_SHIFT;
            for page in first_page..=last_page {
                if let Some(ids) = self.page_map.get(&page) {
                    for &id in ids {
                        let block = &self.blocks[id as usize];
                        if !block.valid {
                            continue;
                        }
                        let block_end =
                            block.physical_start.wrapping_add(block.original_size * 4);
                        // Footprint check is per page; the range check
                        // keeps same-page neighbors alive.
                        let overlaps = block.physical_start < to && from < block_end
                            || block.pages.len() > 1;
                        if overlaps && !victims.contains(&id) {
                            victims.push(id);
                        }
                    }
                }
            }
        }

        for id in victims {
            self.invalidate_block(id);
        }
    }

    fn invalidate_block(&mut self, id: BlockId) {
        let (start, near, far) = {
            let block = &mut self.blocks[id as usize];
            if !block.valid {
                return;
            }
            block.valid = false;
            (block.physical_start, block.near, block.far)
        };
        tracing::trace!(start = %gchan_utils::hex(start), "invalidating block");

        if self.block_map.get(&start) == Some(&id) {
            self.block_map.remove(&start);
        }
        if near.0 != near.1 {
            self.ranges_to_free_near.push(near);
        }
        if far.0 != far.1 {
            self.ranges_to_free_far.push(far);
        }

        // Inbound exits go back to the dispatcher.
        if let Some(sources) = self.links_to.get(&start).cloned() {
            for source in sources {
                let source_block = &mut self.blocks[source as usize];
                if !source_block.valid {
                    continue;
                }
                for link in source_block.links.iter_mut() {
                    if link.exit_address == start && link.linked {
                        if link.is_call {
                            patch_call(link.exit_ptr, self.dispatcher);
                        } else {
                            patch_jmp(link.exit_ptr, self.dispatcher);
                        }
                        link.linked = false;
                    }
                }
            }
        }

        // And our own link records disappear from the index.
        let links = self.blocks[id as usize].links.clone();
        for link in links {
            if let Some(ids) = self.links_to.get_mut(&link.exit_address) {
                ids.retain(|&mut other| other != id);
            }
        }

        let block = &mut self.blocks[id as usize];
        for page in std::mem::take(&mut block.pages) {
            if let Some(ids) = self.page_map.get_mut(&page) {
                ids.retain(|&mut other| other != id);
            }
        }
    }

    /// Consumes the pending free queues; the translator returns them to
    /// the code-region allocator before the next emit.
    pub fn drain_freed_ranges(&mut self) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
        (
            std::mem::take(&mut self.ranges_to_free_near),
            std::mem::take(&mut self.ranges_to_free_far),
        )
    }

    pub fn clear_ranges_to_free(&mut self) {
        self.ranges_to_free_near.clear();
        self.ranges_to_free_far.clear();
    }

    /// Drops every block. Host ranges are not queued; the caller resets
    /// the code region wholesale.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.block_map.clear();
        self.links_to.clear();
        self.page_map.clear();
        self.clear_ranges_to_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::code_region::{CodeRegion, Region};
    use crate::jit::emitter::Emitter;
    use dynasm::dynasm;
    use dynasmrt::DynasmApi;
    use pretty_assertions::assert_eq;

    /// Emits a fake block body: entry returns `tag`, then an exit stub.
    fn fake_block(e: &mut Emitter, cache: &mut BlockCache, pc: u32, tag: i32) -> BlockId {
        let id = cache.allocate_block(pc);
        let entry = e.current();
        dynasm!(e ; .arch x64 ; mov eax, tag ; ret);
        let site = e.jmp(cache.dispatcher);
        let end = e.current();
        let block = cache.block_mut(id);
        block.checked_entry = entry;
        block.normal_entry = entry;
        block.near = (entry, end);
        block.original_size = 1;
        block.links.push(LinkData {
            exit_address: pc.wrapping_add(4),
            exit_ptr: site,
            is_call: false,
            linked: false,
        });
        id
    }

    fn read_jmp_target(site: usize) -> usize {
        let rel = unsafe { std::ptr::read_unaligned((site + 1) as *const i32) };
        (site as isize + 5 + rel as isize) as usize
    }

    #[test]
    fn lazy_linking_resolves_on_finalize() {
        let mut region = CodeRegion::new().unwrap();
        let (from, to) = region.largest_free(Region::Near).unwrap();
        let mut e = Emitter::new(from, to);
        let mut cache = BlockCache::new();
        cache.set_dispatcher(0x1000);

        let a = fake_block(&mut e, &mut cache, 0x100, 1);
        cache.finalize_block(a, true, &[0x100]);
        let site = cache.block(a).links[0].exit_ptr;
        // Nothing at 0x104 yet: still dispatcher-bound.
        assert!(!cache.block(a).links[0].linked);
        assert_eq!(read_jmp_target(site), 0x1000);

        let b = fake_block(&mut e, &mut cache, 0x104, 2);
        cache.finalize_block(b, true, &[0x104]);
        // Finalizing B patched A's exit in place.
        assert!(cache.block(a).links[0].linked);
        assert_eq!(read_jmp_target(site), cache.block(b).checked_entry);
    }

    #[test]
    fn invalidation_unlinks_and_queues_ranges() {
        let mut region = CodeRegion::new().unwrap();
        let (from, to) = region.largest_free(Region::Near).unwrap();
        let mut e = Emitter::new(from, to);
        let mut cache = BlockCache::new();
        cache.set_dispatcher(0x1000);

        let a = fake_block(&mut e, &mut cache, 0x100, 1);
        cache.finalize_block(a, true, &[0x100]);
        let b = fake_block(&mut e, &mut cache, 0x104, 2);
        cache.finalize_block(b, true, &[0x104]);
        let site = cache.block(a).links[0].exit_ptr;
        let b_near = cache.block(b).near;

        cache.invalidate_icache(0x104, 0x108, false);

        assert!(cache.get_by_start(0x104).is_none());
        assert!(!cache.block(a).links[0].linked);
        assert_eq!(read_jmp_target(site), 0x1000);
        let (near, far) = cache.drain_freed_ranges();
        assert_eq!(near, vec![b_near]);
        assert!(far.is_empty());
        // A is untouched.
        assert!(cache.get_by_start(0x100).is_some());
    }

    #[test]
    fn forced_invalidation_takes_everything() {
        let mut region = CodeRegion::new().unwrap();
        let (from, to) = region.largest_free(Region::Near).unwrap();
        let mut e = Emitter::new(from, to);
        let mut cache = BlockCache::new();
        cache.set_dispatcher(0x1000);

        for i in 0..4u32 {
            let id = fake_block(&mut e, &mut cache, 0x100 + i * 4, i as i32);
            cache.finalize_block(id, false, &[0x100 + i * 4]);
        }
        assert_eq!(cache.len(), 4);
        cache.invalidate_icache(0, 0xFFFF_FFFF, true);
        assert_eq!(cache.len(), 0);
        let (near, _) = cache.drain_freed_ranges();
        assert_eq!(near.len(), 4);
    }
}
