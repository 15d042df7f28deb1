//! Set-associative write-back cache with a timed bus.
//!
//! Two-way, 64 sets, 8-byte lines. Address layout (high to low): 7 tag
//! bits, 6 set bits, 3 offset bits. A miss evicts the LRU line and charges
//! `2 + words` bus cycles, doubled when the victim is dirty; one bus cycle
//! is five CPU cycles. While the refill drains, the requested address is
//! the request's "preferred" address: at rest the cache refuses other
//! addresses until the owner comes back and completes.
//!
//! Backing data lives in main memory the whole time — the cache models
//! timing and coherence windows, not storage. Device addresses (and every
//! access while the cache is disabled) take a fixed 2-bus-cycle uncached
//! path with the same ask-retry protocol.

use std::collections::HashSet;

use crate::alu::Size;
use crate::bus::{Access, Bus};
use crate::error::Fault;

pub const BITS_FOR_TAG: u16 = 7;
pub const BITS_FOR_SET: u16 = 6;
pub const BITS_FOR_OFFSET: u16 = 3;
pub const ASSOCIATIVITY: usize = 2;

pub const NUM_SETS: usize = 1 << BITS_FOR_SET;
pub const WORDS_PER_LINE: u8 = (1 << BITS_FOR_OFFSET) / 2;

/// CPU cycles consumed by one external bus cycle.
pub const CPU_CYCLES_PER_BUS_CYCLE: u8 = 5;

/// LRU rank marking a line that is being refilled and must not be chosen
/// as a victim.
const LRU_EJECTING: i8 = -1;

/// One cache line. `missed` stays up after a refill so the completing
/// access counts as a miss instead of a hit.
#[derive(Debug, Clone)]
pub struct CacheLine {
    pub tag: u16,
    pub set_index: u16,
    pub valid: bool,
    pub modified: bool,
    pub missed: bool,
    pub lru: i8,
}

impl CacheLine {
    fn new(set_index: u16, lru: i8) -> Self {
        Self {
            tag: 0,
            set_index,
            valid: false,
            modified: false,
            missed: false,
            lru,
        }
    }

    /// True while a bus request is refilling this line.
    #[must_use]
    pub fn ejecting(&self) -> bool {
        self.lru == LRU_EJECTING
    }
}

/// A line refill or uncached transfer in flight on the bus.
#[derive(Debug, Clone)]
struct BusRequest {
    bus_cycles_left: u8,
    cpu_sub_cycle: u8,
    done: bool,
    /// Set index of the line being refilled; `None` for uncached
    /// transfers. The line itself is found by its EJECTING rank — sets are
    /// physically reordered on every LRU update, so a way index would go
    /// stale.
    line: Option<usize>,
}

impl BusRequest {
    fn idle() -> Self {
        Self {
            bus_cycles_left: 0,
            cpu_sub_cycle: 0,
            done: true,
            line: None,
        }
    }

    fn new(bus_cycles: u8, line: Option<usize>) -> Self {
        Self {
            bus_cycles_left: bus_cycles,
            cpu_sub_cycle: 0,
            done: bus_cycles == 0,
            line,
        }
    }

    /// Advance one CPU cycle; true when the transfer just finished.
    fn cycle(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.cpu_sub_cycle += 1;
        if self.cpu_sub_cycle == CPU_CYCLES_PER_BUS_CYCLE {
            self.bus_cycles_left -= 1;
            self.cpu_sub_cycle = 0;
        }
        if self.bus_cycles_left != 0 {
            return false;
        }
        self.done = true;
        true
    }
}

/// One of the two split caches (instructions / data).
#[derive(Debug, Clone)]
pub struct Cache {
    sets: Vec<Vec<CacheLine>>,
    request: BusRequest,
    enabled: bool,
    busy: bool,
    /// In-flight or preferred address. While set, only a matching request
    /// is served.
    address: Option<u16>,
    access: Option<Access>,
    hits: u64,
    misses: u64,
    /// Word addresses pinned by the pipeline between operand fetch and
    /// writeback; loads of a pinned word are refused.
    pinned: HashSet<u16>,
}

impl Cache {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let sets = (0..NUM_SETS)
            .map(|set| {
                (0..ASSOCIATIVITY)
                    .map(|way| CacheLine::new(set as u16, (ASSOCIATIVITY - way - 1) as i8))
                    .collect()
            })
            .collect();
        Self {
            sets,
            request: BusRequest::idle(),
            enabled,
            busy: false,
            address: None,
            access: None,
            hits: 0,
            misses: 0,
            pinned: HashSet::new(),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.busy
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Address the in-flight (or just-completed) request belongs to.
    #[must_use]
    pub fn address(&self) -> Option<u16> {
        self.address
    }

    /// Direction of the in-flight (or just-completed) request.
    #[must_use]
    pub fn access(&self) -> Option<Access> {
        self.access
    }

    pub fn clear_statistics(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }

    /// True when no line of any set is mid-refill.
    #[must_use]
    pub fn no_line_ejecting(&self) -> bool {
        self.sets
            .iter()
            .all(|set| set.iter().all(|line| !line.ejecting()))
    }

    /// Attempt a load. `Ok(None)` means busy or refused: retry next cycle.
    pub fn load<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u16,
        size: Size,
    ) -> Result<Option<u16>, Fault> {
        if self.pinned.contains(&(address & !1)) {
            return Ok(None);
        }
        if !self.busy && self.address.is_some() && self.address != Some(address) {
            return Ok(None);
        }
        if !self.enabled || bus.is_device(address) {
            return self.load_uncached(bus, address, size);
        }

        let (set, tag) = split_address(address);
        if let Some(way) = self.find(set, tag) {
            self.touch(set, way);
            if !self.busy {
                self.address = None;
            }
            let line = &mut self.sets[set][way];
            if line.missed {
                line.missed = false;
                self.misses += 1;
            } else {
                self.hits += 1;
            }
            return bus.load(address, size).map(Some);
        }

        if !self.busy {
            self.eject(set, tag, address, Access::Read);
        }
        Ok(None)
    }

    /// Attempt a store. `Ok(false)` means busy or refused: retry next
    /// cycle. Pinned words accept stores — the pin owner is the writer.
    pub fn store<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u16,
        size: Size,
        value: u16,
    ) -> Result<bool, Fault> {
        if !self.busy && self.address.is_some() && self.address != Some(address) {
            return Ok(false);
        }
        if !self.enabled || bus.is_device(address) {
            return self.store_uncached(bus, address, size, value);
        }

        let (set, tag) = split_address(address);
        if let Some(way) = self.find(set, tag) {
            self.touch(set, way);
            if !self.busy {
                self.address = None;
            }
            bus.store(address, size, value)?;
            let line = &mut self.sets[set][way];
            line.modified = true;
            if line.missed {
                line.missed = false;
                self.misses += 1;
            } else {
                self.hits += 1;
            }
            return Ok(true);
        }

        if !self.busy {
            self.eject(set, tag, address, Access::Write);
        }
        Ok(false)
    }

    /// Drain one CPU cycle of the in-flight bus request. Returns readiness
    /// (not busy) so stalled stages know whether to retry.
    pub fn cycle(&mut self) -> bool {
        if self.request.done {
            return !self.busy;
        }
        if self.request.cycle() {
            self.busy = false;
            if let Some(set) = self.request.line {
                if let Some(way) = self.sets[set].iter().position(CacheLine::ejecting) {
                    let line = &mut self.sets[set][way];
                    line.valid = true;
                    line.modified = false;
                    line.missed = true;
                    self.touch(set, way);
                }
            }
        }
        !self.busy
    }

    /// Pin or release a word address. Returns whether anything changed;
    /// pinning a pinned word reports `false` so the caller waits,
    /// releasing an unpinned word is a programming error.
    pub fn block(&mut self, address: u16, on: bool) -> Result<bool, Fault> {
        let word = address & !1;
        if self.pinned.contains(&word) != on {
            if on {
                self.pinned.insert(word);
            } else {
                self.pinned.remove(&word);
            }
            return Ok(true);
        }
        if !on {
            return Err(Fault::CacheUnblock);
        }
        Ok(false)
    }

    // === Uncached path (devices, disabled cache) ===

    fn load_uncached<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u16,
        size: Size,
    ) -> Result<Option<u16>, Fault> {
        if self.busy {
            return Ok(None);
        }
        if self.address == Some(address) && self.access == Some(Access::Read) {
            self.access = None;
            self.address = None;
            return bus.load(address, size).map(Some);
        }
        if self.address.is_none() {
            self.access = Some(Access::Read);
            self.address = Some(address);
            self.request = BusRequest::new(2, None);
            self.busy = true;
        }
        Ok(None)
    }

    fn store_uncached<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u16,
        size: Size,
        value: u16,
    ) -> Result<bool, Fault> {
        if self.busy {
            return Ok(false);
        }
        if self.address == Some(address) && self.access == Some(Access::Write) {
            self.access = None;
            self.address = None;
            bus.store(address, size, value)?;
            return Ok(true);
        }
        if self.address.is_none() {
            self.access = Some(Access::Write);
            self.address = Some(address);
            self.request = BusRequest::new(2, None);
            self.busy = true;
        }
        Ok(false)
    }

    // === Line management ===

    fn find(&self, set: usize, tag: u16) -> Option<usize> {
        self.sets[set]
            .iter()
            .position(|line| line.valid && line.tag == tag)
    }

    /// Start an eviction + refill for a missing address. When the LRU
    /// victim is itself mid-refill the miss simply fails and the caller
    /// retries.
    fn eject(&mut self, set: usize, tag: u16, address: u16, access: Access) {
        debug_assert!(!self.busy);

        // Lines are kept sorted by descending rank; the victim sits first.
        if self.sets[set][0].ejecting() {
            return;
        }

        self.address = Some(address);
        self.access = Some(access);

        self.sets[set][0].lru = LRU_EJECTING;
        self.sets[set].sort_by(|a, b| b.lru.cmp(&a.lru));
        let way = self.sets[set]
            .iter()
            .position(CacheLine::ejecting)
            .unwrap_or(ASSOCIATIVITY - 1);

        let line = &mut self.sets[set][way];
        line.valid = false;
        let dirty = line.modified;
        line.tag = tag;
        let mut bus_cycles = 2 + WORDS_PER_LINE;
        if dirty {
            bus_cycles += 2 + WORDS_PER_LINE;
        }
        self.request = BusRequest::new(bus_cycles, Some(set));
        self.busy = true;
    }

    /// Make a line most-recently-used and renormalize the set's ranks.
    fn touch(&mut self, set: usize, way: usize) {
        debug_assert!(self.sets[set][way].valid);
        for (index, line) in self.sets[set].iter_mut().enumerate() {
            if index != way && line.lru != LRU_EJECTING {
                line.lru += 1;
            }
        }
        self.sets[set][way].lru = 0;
        self.normalize(set);
    }

    /// Keep ranks contiguous after touches and evictions. Lines stay
    /// physically sorted by descending rank so the victim is always first.
    fn normalize(&mut self, set: usize) {
        let lines = &mut self.sets[set];
        lines.sort_by(|a, b| b.lru.cmp(&a.lru));
        for index in (0..ASSOCIATIVITY).rev() {
            if lines[index].lru == LRU_EJECTING {
                continue;
            }
            if index != ASSOCIATIVITY - 1 {
                lines[index].lru = lines[index + 1].lru + 1;
            }
        }
    }
}

/// Split an address into (set index, tag).
fn split_address(address: u16) -> (usize, u16) {
    let set = (address >> BITS_FOR_OFFSET) & ((1 << BITS_FOR_SET) - 1);
    let tag = address >> (BITS_FOR_OFFSET + BITS_FOR_SET);
    (set as usize, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat little-endian RAM with no devices.
    struct FlatBus {
        data: Vec<u8>,
        device_from: Option<u16>,
    }

    impl FlatBus {
        fn new() -> Self {
            Self {
                data: vec![0; 0x10000],
                device_from: None,
            }
        }
    }

    impl Bus for FlatBus {
        fn load(&mut self, address: u16, size: Size) -> Result<u16, Fault> {
            match size {
                Size::Byte => Ok(u16::from(self.data[address as usize])),
                Size::Word => {
                    if address % 2 == 1 {
                        return Err(Fault::OddAddress(address));
                    }
                    let low = u16::from(self.data[address as usize]);
                    let high = u16::from(self.data[address as usize + 1]);
                    Ok(high << 8 | low)
                }
            }
        }

        fn store(&mut self, address: u16, size: Size, value: u16) -> Result<(), Fault> {
            match size {
                Size::Byte => self.data[address as usize] = value as u8,
                Size::Word => {
                    if address % 2 == 1 {
                        return Err(Fault::OddAddress(address));
                    }
                    self.data[address as usize] = value as u8;
                    self.data[address as usize + 1] = (value >> 8) as u8;
                }
            }
            Ok(())
        }

        fn is_device(&self, address: u16) -> bool {
            self.device_from.is_some_and(|from| address >= from)
        }
    }

    fn drain(cache: &mut Cache, cycles: u32) {
        for _ in 0..cycles {
            cache.cycle();
        }
    }

    #[test]
    fn miss_refill_then_hits() {
        let mut bus = FlatBus::new();
        let mut cache = Cache::new(true);

        assert!(!cache.store(&mut bus, 0x000A, Size::Byte, 0x55).unwrap());
        assert!(cache.busy());
        // Clean refill: (2 + 4 words) bus cycles at 5 CPU cycles each.
        drain(&mut cache, 29);
        assert!(cache.busy());
        drain(&mut cache, 1);
        assert!(!cache.busy());

        assert!(cache.store(&mut bus, 0x000A, Size::Byte, 0x55).unwrap());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);

        assert_eq!(
            cache.load(&mut bus, 0x000A, Size::Byte).unwrap(),
            Some(0x55)
        );
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);

        // Same line, adjacent byte: hits without another refill.
        assert!(cache.load(&mut bus, 0x000B, Size::Byte).unwrap().is_some());
        assert_eq!(cache.hits(), 2);
    }

    #[test]
    fn preferred_address_locks_out_others() {
        let mut bus = FlatBus::new();
        let mut cache = Cache::new(true);

        assert!(cache.load(&mut bus, 0x0100, Size::Word).unwrap().is_none());
        drain(&mut cache, 30);
        // A different address is refused until the owner completes.
        assert!(cache.load(&mut bus, 0x2000, Size::Word).unwrap().is_none());
        assert!(cache.load(&mut bus, 0x0100, Size::Word).unwrap().is_some());
        // Preference cleared: new addresses may start again.
        assert!(cache.load(&mut bus, 0x2000, Size::Word).unwrap().is_none());
        assert!(cache.busy());
    }

    #[test]
    fn dirty_eviction_costs_double() {
        let mut bus = FlatBus::new();
        let mut cache = Cache::new(true);

        // Fill both ways of set 0 (same set, different tags) and dirty one.
        for address in [0x0000u16, 0x1000] {
            assert!(!cache.store(&mut bus, address, Size::Word, 0xAAAA).unwrap());
            drain(&mut cache, 30);
            assert!(cache.store(&mut bus, address, Size::Word, 0xAAAA).unwrap());
        }
        // Third tag in the same set: evicts the LRU (0x0000, dirty) and
        // pays the write-back on top of the refill.
        assert!(cache.load(&mut bus, 0x2000, Size::Word).unwrap().is_none());
        drain(&mut cache, 59);
        assert!(cache.busy());
        drain(&mut cache, 1);
        assert!(!cache.busy());
        assert!(cache.load(&mut bus, 0x2000, Size::Word).unwrap().is_some());
        assert_eq!(cache.misses(), 3);

        // 0x0000 is gone; 0x1000 survived.
        assert!(cache.load(&mut bus, 0x1000, Size::Word).unwrap().is_some());
        assert_eq!(cache.hits(), 1);
        assert!(cache.load(&mut bus, 0x0000, Size::Word).unwrap().is_none());
    }

    #[test]
    fn pinned_word_refuses_loads_allows_stores() {
        let mut bus = FlatBus::new();
        let mut cache = Cache::new(true);

        // Warm the line first.
        assert!(cache.load(&mut bus, 0x0040, Size::Word).unwrap().is_none());
        drain(&mut cache, 30);
        assert!(cache.load(&mut bus, 0x0040, Size::Word).unwrap().is_some());

        assert!(cache.block(0x0041, true).unwrap());
        assert!(cache.load(&mut bus, 0x0040, Size::Word).unwrap().is_none());
        assert!(cache.store(&mut bus, 0x0040, Size::Word, 7).unwrap());
        assert!(!cache.block(0x0040, true).unwrap());
        assert!(cache.block(0x0040, false).unwrap());
        assert!(cache.load(&mut bus, 0x0040, Size::Word).unwrap().is_some());
        assert!(matches!(cache.block(0x0040, false), Err(Fault::CacheUnblock)));
    }

    #[test]
    fn device_access_is_uncached_with_fixed_latency() {
        let mut bus = FlatBus::new();
        bus.device_from = Some(0x4000);
        bus.data[0x4000] = 0x12;
        let mut cache = Cache::new(true);

        assert!(cache.load(&mut bus, 0x4000, Size::Byte).unwrap().is_none());
        // 2 bus cycles = 10 CPU cycles.
        drain(&mut cache, 9);
        assert!(cache.busy());
        drain(&mut cache, 1);
        assert!(!cache.busy());
        // Wrong direction is refused; the owner's retry completes.
        assert!(!cache.store(&mut bus, 0x4000, Size::Byte, 0).unwrap());
        assert_eq!(
            cache.load(&mut bus, 0x4000, Size::Byte).unwrap(),
            Some(0x12)
        );
        assert_eq!(cache.hits() + cache.misses(), 0);
    }

    #[test]
    fn disabled_cache_collects_no_statistics() {
        let mut bus = FlatBus::new();
        let mut cache = Cache::new(false);

        assert!(!cache.store(&mut bus, 0x0010, Size::Word, 5).unwrap());
        drain(&mut cache, 10);
        assert!(cache.store(&mut bus, 0x0010, Size::Word, 5).unwrap());
        assert_eq!(cache.hits() + cache.misses(), 0);
        assert_eq!(bus.load(0x0010, Size::Word).unwrap(), 5);
    }
}
