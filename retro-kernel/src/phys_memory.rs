//! Region-based physical memory accounting.
//!
//! Every byte of physical RAM below 4GiB is classified into a region drawn
//! from a fixed boot-time pool. Regions sit on two intrusive lists at once:
//! one ordered by base address covering everything, and one holding only the
//! FREE regions. There is no allocator here; the slab allocator owns the HEAP
//! region and everything else is static for the life of the machine.

use crate::event;
use crate::list::{Linked, Links, List, Slot};
use bitflags::bitflags;
use retro_common::memory_map::{MemoryMap, RegionKind};
use spin::{Lazy, Mutex};

pub const REGION_POOL_CAP: usize = 64;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct RegionFlags: u8 {
        const FREE = 1 << 0;
        const KERNEL = 1 << 1;
        const RESERVED = 1 << 2;
        const DEVICE = 1 << 3;
        const STACK = 1 << 4;
        const HEAP = 1 << 5;
        const RAMDISK = 1 << 6;
    }
}

/// Marker for the address-ordered list of all regions (also reused by the
/// slot pool, since a slot is never pooled and mapped at the same time).
pub struct ByAddr;

/// Marker for the free-only list.
pub struct ByFree;

pub struct Region {
    base: u64,
    length: u64,
    flags: RegionFlags,
    owner: &'static str,
    /// Hook surface: fired by nothing in the core.
    pub alloc_events: event::Chain,
    pub free_events: event::Chain,
    by_addr: Links,
    by_free: Links,
}

impl Region {
    const fn empty() -> Self {
        Self {
            base: 0,
            length: 0,
            flags: RegionFlags::empty(),
            owner: "",
            alloc_events: event::Chain::new(),
            free_events: event::Chain::new(),
            by_addr: Links::new(),
            by_free: Links::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }
}

impl Linked<ByAddr> for Region {
    fn links(&self) -> &Links {
        &self.by_addr
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.by_addr
    }
}

impl Linked<ByFree> for Region {
    fn links(&self) -> &Links {
        &self.by_free
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.by_free
    }
}

pub struct MemoryManager {
    pool: [Region; REGION_POOL_CAP],
    all: List<ByAddr>,
    free: List<ByFree>,
    free_slots: List<ByAddr>,
    total_bytes: u64,
    free_bytes: u64,
    kernel_bytes: u64,
    /// Hook surface, like the per-region chains.
    pub alloc_events: event::Chain,
    pub free_events: event::Chain,
    pub oom_events: event::Chain,
}

impl MemoryManager {
    pub fn new() -> Self {
        let mut mm = Self {
            pool: core::array::from_fn(|_| Region::empty()),
            all: List::new(),
            free: List::new(),
            free_slots: List::new(),
            total_bytes: 0,
            free_bytes: 0,
            kernel_bytes: 0,
            alloc_events: event::Chain::new(),
            free_events: event::Chain::new(),
            oom_events: event::Chain::new(),
        };
        mm.init();
        mm
    }

    /// Reset to the boot state: no regions mapped, every pool slot available.
    pub fn init(&mut self) {
        self.all = List::new();
        self.free = List::new();
        self.free_slots = List::new();
        self.total_bytes = 0;
        self.free_bytes = 0;
        self.kernel_bytes = 0;
        for i in 0..REGION_POOL_CAP {
            self.pool[i].by_addr = Links::new();
            self.pool[i].by_free = Links::new();
            self.free_slots.push_back(&mut self.pool, Slot(i));
        }
    }

    /// Classify every BIOS-reported region below 4GiB.
    pub fn parse_map(&mut self, map: &MemoryMap) {
        // Collected first so the borrow on `map` ends before mutation.
        let mut entries = [(0u64, 0u64, RegionFlags::empty()); REGION_POOL_CAP];
        let mut n = 0;
        for entry in map.regions() {
            if entry.base >= 0x1_0000_0000 || n == entries.len() {
                continue;
            }
            let flags = match entry.kind() {
                RegionKind::Usable => RegionFlags::FREE,
                RegionKind::Reserved
                | RegionKind::AcpiReclaimable
                | RegionKind::AcpiNvs
                | RegionKind::Bad => RegionFlags::RESERVED,
            };
            entries[n] = (entry.base, entry.length, flags);
            n += 1;
        }
        for &(base, length, flags) in &entries[..n] {
            let owner = if flags.contains(RegionFlags::FREE) {
                "bios"
            } else {
                "bios-reserved"
            };
            self.add_region(base, length, flags, owner);
        }
    }

    /// Track `[base, base+length)` with `flags`. Keeps the address list
    /// sorted by base; a FREE region also joins the free list. When the pool
    /// is exhausted the add is dropped; at boot there is no better recovery.
    pub fn add_region(&mut self, base: u64, length: u64, flags: RegionFlags, owner: &'static str) {
        let slot = match self.free_slots.pop_front(&mut self.pool) {
            Some(slot) => slot,
            None => {
                log::trace!("region pool exhausted; dropping {:#x}+{:#x}", base, length);
                return;
            }
        };

        {
            let region = &mut self.pool[slot.index()];
            region.base = base;
            region.length = length;
            region.flags = flags;
            region.owner = owner;
        }

        let at = self
            .all
            .iter(&self.pool)
            .find(|s| self.pool[s.index()].base > base);
        match at {
            Some(at) => self.all.insert_before(&mut self.pool, at, slot),
            None => self.all.push_back(&mut self.pool, slot),
        }

        if flags.contains(RegionFlags::FREE) {
            self.free.push_back(&mut self.pool, slot);
            self.free_bytes += length;
        }
        if flags.contains(RegionFlags::KERNEL) {
            self.kernel_bytes += length;
        }
        self.total_bytes += length;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn kernel_bytes(&self) -> u64 {
        self.kernel_bytes
    }

    pub fn region_count(&self) -> usize {
        self.all.len()
    }

    /// All regions in ascending base order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.all.iter(&self.pool).map(|s| &self.pool[s.index()])
    }

    /// FREE regions in insertion order.
    pub fn free_regions(&self) -> impl Iterator<Item = &Region> {
        self.free.iter(&self.pool).map(|s| &self.pool[s.index()])
    }
}

static MANAGER: Lazy<Mutex<MemoryManager>> = Lazy::new(|| Mutex::new(MemoryManager::new()));

pub fn manager() -> &'static Mutex<MemoryManager> {
    &MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;
    use retro_common::memory_map::Region as MapRegion;

    fn map_of(entries: &[MapRegion]) -> MemoryMap {
        MemoryMap {
            entries: entries.as_ptr(),
            entries_len: entries.len() as u32,
        }
    }

    fn entry(base: u64, length: u64, kind: u32) -> MapRegion {
        MapRegion { base, length, kind }
    }

    #[test]
    fn parse_map_accounts_every_byte() {
        let entries = [
            entry(0x0000_0000, 0x0009_f000, 1),
            entry(0x0009_f000, 0x0000_1000, 2),
            entry(0x0010_0000, 0x0ff0_0000, 1),
            entry(0xfffc_0000, 0x0004_0000, 2),
        ];
        let mut mm = MemoryManager::new();
        mm.parse_map(&map_of(&entries));

        let total: u64 = mm.regions().map(|r| r.length()).sum();
        let free: u64 = mm
            .regions()
            .filter(|r| r.flags().contains(RegionFlags::FREE))
            .map(|r| r.length())
            .sum();
        assert_eq!(mm.total_bytes(), total);
        assert_eq!(mm.free_bytes(), free);
        assert_eq!(free, 0x0009_f000 + 0x0ff0_0000);
        assert_eq!(mm.region_count(), 4);
    }

    #[test]
    fn address_list_is_strictly_ascending() {
        let mut mm = MemoryManager::new();
        mm.add_region(0x300000, 0x1000, RegionFlags::FREE, "c");
        mm.add_region(0x100000, 0x1000, RegionFlags::FREE, "a");
        mm.add_region(0x200000, 0x1000, RegionFlags::RESERVED, "b");

        let bases: Vec<u64> = mm.regions().map(|r| r.base()).collect();
        assert_eq!(bases, [0x100000, 0x200000, 0x300000]);
    }

    #[test]
    fn free_list_membership_follows_the_free_flag() {
        let mut mm = MemoryManager::new();
        mm.add_region(0x1000, 0x1000, RegionFlags::FREE, "free");
        mm.add_region(0x2000, 0x1000, RegionFlags::KERNEL, "kernel");
        mm.add_region(0x3000, 0x2000, RegionFlags::FREE, "free");

        assert_eq!(mm.free_regions().count(), 2);
        assert_eq!(mm.free_bytes(), 0x3000);
        assert_eq!(mm.kernel_bytes(), 0x1000);
        assert_eq!(mm.total_bytes(), 0x4000);
    }

    #[test]
    fn entries_above_4g_are_ignored() {
        let entries = [
            entry(0x0010_0000, 0x1000, 1),
            entry(0x1_0000_0000, 0x1000_0000, 1),
        ];
        let mut mm = MemoryManager::new();
        mm.parse_map(&map_of(&entries));
        assert_eq!(mm.region_count(), 1);
        assert_eq!(mm.total_bytes(), 0x1000);
    }

    #[test]
    fn unknown_bios_kinds_become_reserved() {
        let entries = [entry(0x0010_0000, 0x1000, 0xdead)];
        let mut mm = MemoryManager::new();
        mm.parse_map(&map_of(&entries));
        let region = mm.regions().next().unwrap();
        assert!(region.flags().contains(RegionFlags::RESERVED));
        assert_eq!(mm.free_bytes(), 0);
    }

    #[test]
    fn pool_exhaustion_drops_the_add() {
        let mut mm = MemoryManager::new();
        for i in 0..REGION_POOL_CAP as u64 {
            mm.add_region(i * 0x1000, 0x1000, RegionFlags::FREE, "x");
        }
        let before = mm.total_bytes();
        mm.add_region(0x9999_0000, 0x1000, RegionFlags::FREE, "overflow");
        assert_eq!(mm.total_bytes(), before);
        assert_eq!(mm.region_count(), REGION_POOL_CAP);
    }

    #[test]
    fn init_recycles_every_slot() {
        let mut mm = MemoryManager::new();
        mm.add_region(0x1000, 0x1000, RegionFlags::FREE, "x");
        mm.init();
        assert_eq!(mm.region_count(), 0);
        assert_eq!(mm.total_bytes(), 0);
        for i in 0..REGION_POOL_CAP as u64 {
            mm.add_region(i * 0x1000, 0x1000, RegionFlags::FREE, "y");
        }
        assert_eq!(mm.region_count(), REGION_POOL_CAP);
    }
}
