//! Guest-register to host-register binding.
//!
//! rax/rdx stay scratch, rbp/rbx/r14 are the fixed bases. Everything else
//! the GPR cache hands out, preferring callee-saved registers so helper
//! calls don't force spills.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::{gpr_offset, ps0_offset};
use crate::jit::emitter::Emitter;

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R14: u8 = 14;

/// Allocation order: callee-saved first.
const GPR_ALLOC_ORDER: [u8; 9] = [13, 12, RSI, RDI, 8, 9, 10, 11, RCX];

const fn is_caller_saved(reg: u8) -> bool {
    matches!(reg, 0 | 1 | 2 | 6 | 7 | 8 | 9 | 10 | 11)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Authoritative value lives in PPCState.
    Default,
    Bound { host: u8, dirty: bool },
    Imm { value: u32, dirty: bool },
}

#[derive(Clone)]
pub struct GprCache {
    location: [Location; 32],
    /// Host register -> bound guest register.
    host: [Option<u8>; 16],
    /// Bump clock for LRU eviction.
    tick: u64,
    last_used: [u64; 16],
    /// Bindings the current instruction depends on; never evicted inside
    /// one instruction.
    locked: u16,
}

impl Default for GprCache {
    fn default() -> Self {
        Self {
            location: [Location::Default; 32],
            host: [None; 16],
            tick: 0,
            last_used: [0; 16],
            locked: 0,
        }
    }
}

impl GprCache {
    pub fn start(&mut self) {
        *self = Self::default();
    }

    fn touch(&mut self, host: u8) {
        self.tick += 1;
        self.last_used[host as usize] = self.tick;
    }

    pub fn lock(&mut self, host: u8) {
        self.locked |= 1 << host;
    }

    /// Called once per guest instruction.
    pub fn unlock_all(&mut self) {
        self.locked = 0;
    }

    pub fn host_for(&self, guest: u8) -> Option<u8> {
        match self.location[guest as usize] {
            Location::Bound { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn imm_value(&self, guest: u8) -> Option<u32> {
        match self.location[guest as usize] {
            Location::Imm { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_imm(&self, guest: u8) -> bool {
        self.imm_value(guest).is_some()
    }

    fn alloc_host(&mut self, e: &mut Emitter) -> u8 {
        for reg in GPR_ALLOC_ORDER {
            if self.host[reg as usize].is_none() {
                return reg;
            }
        }
        // Evict the least recently used unlocked binding.
        let victim = GPR_ALLOC_ORDER
            .iter()
            .copied()
            .filter(|&r| self.locked & (1 << r) == 0)
            .min_by_key(|&r| self.last_used[r as usize])
            .expect("all cache registers locked by one instruction");
        let guest = self.host[victim as usize].expect("victim not bound");
        self.store_and_free(e, guest);
        victim
    }

    fn bind(&mut self, guest: u8, host: u8, dirty: bool) {
        self.location[guest as usize] = Location::Bound { host, dirty };
        self.host[host as usize] = Some(guest);
        self.touch(host);
        self.lock(host);
    }

    /// Host register holding the guest value, loading it if needed.
    pub fn bind_read(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        match self.location[guest as usize] {
            Location::Bound { host, .. } => {
                self.touch(host);
                self.lock(host);
                host
            }
            Location::Imm { value, dirty } => {
                let host = self.alloc_host(e);
                dynasm!(e ; .arch x64 ; mov Rd(host), value as i32);
                self.bind(guest, host, dirty);
                host
            }
            Location::Default => {
                let host = self.alloc_host(e);
                let offset = gpr_offset(guest);
                dynasm!(e ; .arch x64 ; mov Rd(host), [rbp + offset]);
                self.bind(guest, host, false);
                host
            }
        }
    }

    /// Host register for a full overwrite of the guest value.
    pub fn bind_write(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        match self.location[guest as usize] {
            Location::Bound { host, .. } => {
                self.location[guest as usize] = Location::Bound { host, dirty: true };
                self.touch(host);
                self.lock(host);
                host
            }
            _ => {
                let host = self.alloc_host(e);
                self.bind(guest, host, true);
                host
            }
        }
    }

    pub fn bind_readwrite(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        let host = self.bind_read(e, guest);
        self.location[guest as usize] = Location::Bound { host, dirty: true };
        host
    }

    pub fn mark_dirty(&mut self, guest: u8) {
        if let Location::Bound { host, .. } = self.location[guest as usize] {
            self.location[guest as usize] = Location::Bound { host, dirty: true };
        }
    }

    /// Folds the guest register to a compile-time constant.
    pub fn set_imm(&mut self, guest: u8, value: u32, dirty: bool) {
        if let Location::Bound { host, .. } = self.location[guest as usize] {
            self.host[host as usize] = None;
        }
        self.location[guest as usize] = Location::Imm { value, dirty };
    }

    /// Loads registers that will be used later while spare host registers
    /// remain, leaving one free for the output.
    pub fn preload(&mut self, e: &mut Emitter, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) == 0 {
                continue;
            }
            if self.host_for(guest).is_some() || self.is_imm(guest) {
                continue;
            }
            let free = GPR_ALLOC_ORDER
                .iter()
                .filter(|&&r| self.host[r as usize].is_none())
                .count();
            if free <= 1 {
                break;
            }
            self.bind_read(e, guest);
        }
    }

    /// Drops bindings without writing them back; only sound for registers
    /// the analyzer proved dead.
    pub fn discard(&mut self, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) == 0 {
                continue;
            }
            if let Location::Bound { host, .. } = self.location[guest as usize] {
                self.host[host as usize] = None;
            }
            self.location[guest as usize] = Location::Default;
        }
    }

    /// After an interpreter fallback wrote these registers, any cached
    /// value is stale.
    pub fn reset(&mut self, mask: u32) {
        self.discard(mask);
    }

    fn store_and_free(&mut self, e: &mut Emitter, guest: u8) {
        match self.location[guest as usize] {
            Location::Bound { host, dirty } => {
                if dirty {
                    let offset = gpr_offset(guest);
                    dynasm!(e ; .arch x64 ; mov [rbp + offset], Rd(host));
                }
                self.host[host as usize] = None;
                self.location[guest as usize] = Location::Default;
            }
            Location::Imm { value, dirty } => {
                if dirty {
                    let offset = gpr_offset(guest);
                    dynasm!(e ; .arch x64 ; mov DWORD [rbp + offset], value as i32);
                }
                self.location[guest as usize] = Location::Default;
            }
            Location::Default => {}
        }
    }

    pub fn flush_masked(&mut self, e: &mut Emitter, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) != 0 {
                self.store_and_free(e, guest);
            }
        }
    }

    pub fn flush(&mut self, e: &mut Emitter) {
        self.flush_masked(e, !0);
    }

    /// Spills whatever guest value occupies `host`; used before emitted
    /// code needs that specific register (shift counts in cl).
    pub fn free_host(&mut self, e: &mut Emitter, host: u8) {
        if let Some(guest) = self.host[host as usize] {
            self.store_and_free(e, guest);
        }
    }

    /// Caller-saved host registers currently holding guest values; these
    /// must survive ABI calls.
    pub fn caller_saved_in_use(&self) -> Vec<u8> {
        GPR_ALLOC_ORDER
            .iter()
            .copied()
            .filter(|&r| is_caller_saved(r) && self.host[r as usize].is_some())
            .collect()
    }

    /// Far-code exception paths flush a copy of the cache state and then
    /// restore the near-path bindings.
    pub fn snapshot(&self) -> GprCache {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: GprCache) {
        *self = snapshot;
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        for guest in 0..32u8 {
            if let Location::Bound { host, .. } = self.location[guest as usize] {
                if self.host[host as usize] != Some(guest) {
                    return false;
                }
            }
        }
        true
    }
}

/// Paired-single cache over xmm2..xmm15; xmm0/xmm1 stay scratch.
const FPR_ALLOC_ORDER: [u8; 14] = [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FprLocation {
    Default,
    Bound { host: u8, dirty: bool },
}

#[derive(Clone)]
pub struct FprCache {
    location: [FprLocation; 32],
    host: [Option<u8>; 16],
    tick: u64,
    last_used: [u64; 16],
}

impl Default for FprCache {
    fn default() -> Self {
        Self {
            location: [FprLocation::Default; 32],
            host: [None; 16],
            tick: 0,
            last_used: [0; 16],
        }
    }
}

impl FprCache {
    pub fn start(&mut self) {
        *self = Self::default();
    }

    fn touch(&mut self, host: u8) {
        self.tick += 1;
        self.last_used[host as usize] = self.tick;
    }

    pub fn host_for(&self, guest: u8) -> Option<u8> {
        match self.location[guest as usize] {
            FprLocation::Bound { host, .. } => Some(host),
            _ => None,
        }
    }

    fn alloc_host(&mut self, e: &mut Emitter) -> u8 {
        for reg in FPR_ALLOC_ORDER {
            if self.host[reg as usize].is_none() {
                return reg;
            }
        }
        let victim = FPR_ALLOC_ORDER
            .iter()
            .copied()
            .min_by_key(|&r| self.last_used[r as usize])
            .unwrap();
        let guest = self.host[victim as usize].expect("victim not bound");
        self.store_and_free(e, guest);
        victim
    }

    pub fn bind_read(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        match self.location[guest as usize] {
            FprLocation::Bound { host, .. } => {
                self.touch(host);
                host
            }
            FprLocation::Default => {
                let host = self.alloc_host(e);
                let offset = ps0_offset(guest);
                dynasm!(e ; .arch x64 ; movupd Rx(host), [rbp + offset]);
                self.location[guest as usize] = FprLocation::Bound { host, dirty: false };
                self.host[host as usize] = Some(guest);
                self.touch(host);
                host
            }
        }
    }

    pub fn bind_write(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        let host = match self.location[guest as usize] {
            FprLocation::Bound { host, .. } => host,
            FprLocation::Default => {
                let host = self.alloc_host(e);
                self.host[host as usize] = Some(guest);
                host
            }
        };
        self.location[guest as usize] = FprLocation::Bound { host, dirty: true };
        self.touch(host);
        host
    }

    /// For partial-lane writes: loads the pair first, then marks dirty.
    pub fn bind_readwrite(&mut self, e: &mut Emitter, guest: u8) -> u8 {
        let host = self.bind_read(e, guest);
        self.location[guest as usize] = FprLocation::Bound { host, dirty: true };
        host
    }

    fn store_and_free(&mut self, e: &mut Emitter, guest: u8) {
        if let FprLocation::Bound { host, dirty } = self.location[guest as usize] {
            if dirty {
                let offset = ps0_offset(guest);
                dynasm!(e ; .arch x64 ; movupd [rbp + offset], Rx(host));
            }
            self.host[host as usize] = None;
            self.location[guest as usize] = FprLocation::Default;
        }
    }

    pub fn flush_masked(&mut self, e: &mut Emitter, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) != 0 {
                self.store_and_free(e, guest);
            }
        }
    }

    pub fn flush(&mut self, e: &mut Emitter) {
        self.flush_masked(e, !0);
    }

    pub fn discard(&mut self, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) == 0 {
                continue;
            }
            if let FprLocation::Bound { host, .. } = self.location[guest as usize] {
                self.host[host as usize] = None;
            }
            self.location[guest as usize] = FprLocation::Default;
        }
    }

    pub fn reset(&mut self, mask: u32) {
        self.discard(mask);
    }

    pub fn preload(&mut self, e: &mut Emitter, mask: u32) {
        for guest in 0..32u8 {
            if mask & (1 << guest) == 0 || self.host_for(guest).is_some() {
                continue;
            }
            let free = FPR_ALLOC_ORDER
                .iter()
                .filter(|&&r| self.host[r as usize].is_none())
                .count();
            if free <= 1 {
                break;
            }
            self.bind_read(e, guest);
        }
    }

    /// Bound xmm registers; all of them are caller-saved, so every ABI
    /// call must preserve this set.
    pub fn in_use_hosts(&self) -> Vec<u8> {
        FPR_ALLOC_ORDER
            .iter()
            .copied()
            .filter(|&r| self.host[r as usize].is_some())
            .collect()
    }

    pub fn snapshot(&self) -> FprCache {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: FprCache) {
        *self = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PpcState;
    use crate::jit::code_region::{CodeRegion, Region};
    use pretty_assertions::assert_eq;

    /// Runs emitted cache traffic against a real PpcState: rdi (arg0) is
    /// moved into rbp, which cache stores address.
    fn run_with_state(build: impl FnOnce(&mut Emitter, &mut GprCache), state: &mut PpcState) {
        let mut region = CodeRegion::new().unwrap();
        let (from, to) = region.largest_free(Region::Near).unwrap();
        let mut e = Emitter::new(from, to);
        let entry = e.current();
        dynasm!(e ; .arch x64 ; push rbp ; push rbx ; mov rbp, rdi);
        let mut cache = GprCache::default();
        build(&mut e, &mut cache);
        cache.flush(&mut e);
        dynasm!(e ; .arch x64 ; pop rbx ; pop rbp ; ret);
        assert!(!e.has_write_failed());
        let f: extern "C" fn(*mut PpcState) = unsafe { std::mem::transmute(entry) };
        f(state);
    }

    #[test]
    fn bind_load_modify_flush() {
        let mut state = PpcState::default();
        state.gpr[3] = 41;
        run_with_state(
            |e, cache| {
                let r3 = cache.bind_readwrite(e, 3);
                dynasm!(e ; .arch x64 ; add Rd(r3), 1);
            },
            &mut state,
        );
        assert_eq!(state.gpr[3], 42);
    }

    #[test]
    fn immediates_fold_until_flush() {
        let mut state = PpcState::default();
        run_with_state(
            |e, cache| {
                cache.set_imm(7, 0xCAFE_F00D, true);
                let _ = e;
            },
            &mut state,
        );
        assert_eq!(state.gpr[7], 0xCAFE_F00D);
    }

    #[test]
    fn discard_skips_writeback() {
        let mut state = PpcState::default();
        state.gpr[5] = 10;
        run_with_state(
            |e, cache| {
                let r5 = cache.bind_readwrite(e, 5);
                dynasm!(e ; .arch x64 ; add Rd(r5), 99);
                cache.discard(1 << 5);
            },
            &mut state,
        );
        assert_eq!(state.gpr[5], 10);
    }

    #[test]
    fn eviction_keeps_mapping_consistent() {
        let mut state = PpcState::default();
        for i in 0..32 {
            state.gpr[i] = i as u32;
        }
        run_with_state(
            |e, cache| {
                // Touch more guest registers than there are hosts.
                for guest in 0..16u8 {
                    cache.unlock_all();
                    let host = cache.bind_readwrite(e, guest);
                    dynasm!(e ; .arch x64 ; add Rd(host), 100);
                    assert!(cache.consistent());
                }
            },
            &mut state,
        );
        for i in 0..16 {
            assert_eq!(state.gpr[i], i as u32 + 100);
        }
        for i in 16..32 {
            assert_eq!(state.gpr[i], i as u32);
        }
    }
}
