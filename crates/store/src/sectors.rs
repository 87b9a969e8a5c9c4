//! Per-sector bookkeeping and placement policy.
//!
//! The sector table holds one descriptor per physical sector and answers
//! three questions without touching flash: where can a new record go,
//! which sector should garbage collection reclaim next, and how many
//! bytes of each sector are live, appendable, or reclaimable.
//!
//! For every sector, `writable_bytes + valid_bytes + recoverable_bytes`
//! equals the sector size; recoverable bytes are implicit.

use tracing::warn;

/// In-memory accounting for one physical sector.
#[derive(Debug, Clone)]
pub struct SectorDescriptor {
    /// Bytes still appendable at the sector's tail. Monotonically
    /// non-increasing between erases.
    writable_bytes: usize,
    /// Bytes occupied by records that are the newest version of their key
    /// (live or tombstone).
    valid_bytes: usize,
    /// Latched when the sector is unreadable or holds partially written
    /// data. No further appends until erased.
    corrupt: bool,
}

impl SectorDescriptor {
    fn new(sector_size: usize) -> Self {
        Self {
            writable_bytes: sector_size,
            valid_bytes: 0,
            corrupt: false,
        }
    }

    pub fn writable_bytes(&self) -> usize {
        self.writable_bytes
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    pub fn corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn add_valid_bytes(&mut self, bytes: usize) {
        self.valid_bytes += bytes;
    }

    pub fn remove_valid_bytes(&mut self, bytes: usize) {
        if bytes > self.valid_bytes {
            warn!(
                removing = bytes,
                tracked = self.valid_bytes,
                "sector valid-byte accounting underflow"
            );
        }
        self.valid_bytes = self.valid_bytes.saturating_sub(bytes);
    }

    pub fn remove_writable_bytes(&mut self, bytes: usize) {
        self.writable_bytes = self.writable_bytes.saturating_sub(bytes);
    }

    pub fn set_writable_bytes(&mut self, bytes: usize) {
        self.writable_bytes = bytes;
    }

    /// Latches the corrupt flag and forfeits the remaining tail so no
    /// further appends land here; also makes the sector a strong GC
    /// candidate. Records already indexed remain readable.
    pub fn mark_corrupt(&mut self) {
        self.corrupt = true;
        self.writable_bytes = 0;
    }

    /// Returns the descriptor to the fully-erased state.
    pub fn set_erased(&mut self, sector_size: usize) {
        self.writable_bytes = sector_size;
        self.valid_bytes = 0;
        self.corrupt = false;
    }

    /// A sector with its whole span still writable and no corruption.
    pub fn is_empty(&self, sector_size: usize) -> bool {
        !self.corrupt && self.writable_bytes == sector_size
    }

    /// Bytes neither writable nor valid; what erasing would reclaim.
    pub fn recoverable_bytes(&self, sector_size: usize) -> usize {
        sector_size - self.valid_bytes - self.writable_bytes
    }
}

/// The table of sector descriptors plus the placement policy.
#[derive(Debug)]
pub struct SectorTable {
    sectors: Vec<SectorDescriptor>,
    sector_size: usize,
    /// Sector that most recently received a new record; the round-robin
    /// anchor that spreads wear across sectors.
    last_new_sector: usize,
}

impl SectorTable {
    pub fn new(sector_count: usize, sector_size: usize) -> Self {
        Self {
            sectors: vec![SectorDescriptor::new(sector_size); sector_count],
            sector_size,
            last_new_sector: 0,
        }
    }

    /// Forgets all accounting; used when (re-)initializing the store.
    pub fn reset(&mut self) {
        for sector in &mut self.sectors {
            *sector = SectorDescriptor::new(self.sector_size);
        }
        self.last_new_sector = 0;
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn get(&self, index: usize) -> &SectorDescriptor {
        &self.sectors[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut SectorDescriptor {
        &mut self.sectors[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectorDescriptor> {
        self.sectors.iter()
    }

    /// Sector index containing `address`.
    pub fn index_of(&self, address: u32) -> usize {
        address as usize / self.sector_size
    }

    pub fn base_address(&self, index: usize) -> u32 {
        (index * self.sector_size) as u32
    }

    pub fn address_in_sector(&self, index: usize, address: u32) -> bool {
        self.index_of(address) == index
    }

    /// Address of the first unwritten byte in the sector's tail.
    pub fn next_writable_address(&self, index: usize) -> u32 {
        self.base_address(index) + (self.sector_size - self.sectors[index].writable_bytes) as u32
    }

    pub fn last_new_sector(&self) -> usize {
        self.last_new_sector
    }

    /// Anchors the round-robin scan at the sector containing `address`
    /// (the newest record found during init).
    pub fn set_last_new_sector(&mut self, address: u32) {
        self.last_new_sector = self.index_of(address);
    }

    fn contains_any(&self, index: usize, addresses: &[u32]) -> bool {
        addresses.iter().any(|&a| self.index_of(a) == index)
    }

    /// Round-robin ordering of all sector indices, starting just past the
    /// last sector written to.
    fn scan_order(&self) -> impl Iterator<Item = usize> + '_ {
        let n = self.sectors.len();
        (1..=n).map(move |offset| (self.last_new_sector + offset) % n)
    }

    /// Selects a sector with room for `entry_size` appended bytes.
    ///
    /// Sectors already holding one of `reserved` are excluded so that two
    /// copies of one entry never share a sector. Non-empty sectors are
    /// preferred, keeping at least one erased sector in reserve for GC;
    /// among them the largest tail wins, ties broken round-robin from the
    /// last written sector. An empty sector is used only as a last resort.
    pub fn find_space(&mut self, entry_size: usize, reserved: &[u32]) -> Option<usize> {
        let pick = self.pick_sector(entry_size, |table, index| {
            !table.contains_any(index, reserved)
        });
        if let Some(index) = pick {
            self.last_new_sector = index;
        }
        pick
    }

    /// Space finding for relocation during garbage collection.
    ///
    /// Additionally excludes sectors containing any other copy of the
    /// entry being moved (`copies`), preserving replica diversity, and
    /// *prefers* the empty reserve sector: relocation is the one consumer
    /// allowed to spend it, since collecting the victim produces the next
    /// reserve.
    pub fn find_space_during_gc(
        &mut self,
        entry_size: usize,
        copies: &[u32],
        reserved: &[u32],
    ) -> Option<usize> {
        let mut empty_pick = None;
        for index in self.scan_order() {
            let sector = &self.sectors[index];
            if sector.is_empty(self.sector_size)
                && sector.writable_bytes >= entry_size
                && !self.contains_any(index, copies)
                && !self.contains_any(index, reserved)
            {
                empty_pick = Some(index);
                break;
            }
        }

        let pick = empty_pick.or_else(|| {
            self.pick_sector(entry_size, |table, index| {
                !table.contains_any(index, copies) && !table.contains_any(index, reserved)
            })
        });
        if let Some(index) = pick {
            self.last_new_sector = index;
        }
        pick
    }

    fn pick_sector<F>(&self, entry_size: usize, eligible: F) -> Option<usize>
    where
        F: Fn(&SectorTable, usize) -> bool,
    {
        let mut best_nonempty: Option<usize> = None;
        let mut best_empty: Option<usize> = None;

        for index in self.scan_order() {
            let sector = &self.sectors[index];
            if sector.corrupt || sector.writable_bytes < entry_size || !eligible(self, index) {
                continue;
            }
            if sector.is_empty(self.sector_size) {
                best_empty.get_or_insert(index);
            } else {
                match best_nonempty {
                    Some(best) if self.sectors[best].writable_bytes >= sector.writable_bytes => {}
                    _ => best_nonempty = Some(index),
                }
            }
        }

        best_nonempty.or(best_empty)
    }

    /// Picks the garbage-collection victim: the sector with the most
    /// recoverable bytes that holds none of `reserved`. Returns `None`
    /// iff nothing is reclaimable.
    pub fn find_sector_to_gc(&self, reserved: &[u32]) -> Option<usize> {
        let mut victim: Option<usize> = None;
        for index in 0..self.sectors.len() {
            let recoverable = self.sectors[index].recoverable_bytes(self.sector_size);
            if recoverable == 0 || self.contains_any(index, reserved) {
                continue;
            }
            match victim {
                Some(best)
                    if self.sectors[best].recoverable_bytes(self.sector_size) >= recoverable => {}
                _ => victim = Some(index),
            }
        }
        victim
    }

    /// True when at least one sector is fully erased (the free reserve).
    pub fn any_empty(&self) -> bool {
        self.sectors.iter().any(|s| s.is_empty(self.sector_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR_SIZE: usize = 4096;

    fn table(sector_count: usize) -> SectorTable {
        SectorTable::new(sector_count, SECTOR_SIZE)
    }

    // -------------------- descriptor accounting --------------------

    #[test]
    fn fresh_sector_is_empty_and_fully_writable() {
        let table = table(4);
        let sector = table.get(0);
        assert!(sector.is_empty(SECTOR_SIZE));
        assert_eq!(sector.writable_bytes(), SECTOR_SIZE);
        assert_eq!(sector.valid_bytes(), 0);
        assert_eq!(sector.recoverable_bytes(SECTOR_SIZE), 0);
    }

    #[test]
    fn byte_classes_always_sum_to_sector_size() {
        let mut table = table(1);
        let sector = table.get_mut(0);
        sector.remove_writable_bytes(256);
        sector.add_valid_bytes(192);

        let sector = table.get(0);
        assert_eq!(
            sector.writable_bytes()
                + sector.valid_bytes()
                + sector.recoverable_bytes(SECTOR_SIZE),
            SECTOR_SIZE
        );
        assert_eq!(sector.recoverable_bytes(SECTOR_SIZE), 64);
    }

    #[test]
    fn remove_valid_bytes_saturates() {
        let mut table = table(1);
        table.get_mut(0).add_valid_bytes(32);
        table.get_mut(0).remove_valid_bytes(64);
        assert_eq!(table.get(0).valid_bytes(), 0);
    }

    #[test]
    fn mark_corrupt_forfeits_tail() {
        let mut table = table(1);
        table.get_mut(0).remove_writable_bytes(100);
        table.get_mut(0).mark_corrupt();

        let sector = table.get(0);
        assert!(sector.corrupt());
        assert_eq!(sector.writable_bytes(), 0);
        assert!(!sector.is_empty(SECTOR_SIZE));
        assert_eq!(sector.recoverable_bytes(SECTOR_SIZE), SECTOR_SIZE);
    }

    #[test]
    fn set_erased_clears_corruption() {
        let mut table = table(1);
        table.get_mut(0).add_valid_bytes(10);
        table.get_mut(0).mark_corrupt();
        table.get_mut(0).set_erased(SECTOR_SIZE);

        let sector = table.get(0);
        assert!(sector.is_empty(SECTOR_SIZE));
        assert!(!sector.corrupt());
        assert_eq!(sector.valid_bytes(), 0);
    }

    // -------------------- addressing --------------------

    #[test]
    fn address_to_sector_mapping() {
        let table = table(4);
        assert_eq!(table.index_of(0), 0);
        assert_eq!(table.index_of(4095), 0);
        assert_eq!(table.index_of(4096), 1);
        assert_eq!(table.base_address(2), 8192);
        assert!(table.address_in_sector(1, 5000));
        assert!(!table.address_in_sector(1, 9000));
    }

    #[test]
    fn next_writable_address_tracks_tail() {
        let mut table = table(4);
        assert_eq!(table.next_writable_address(1), 4096);
        table.get_mut(1).remove_writable_bytes(96);
        assert_eq!(table.next_writable_address(1), 4096 + 96);
    }

    // -------------------- find_space --------------------

    #[test]
    fn find_space_prefers_non_empty_sectors() {
        let mut table = table(4);
        // Sector 2 has been written to; the rest are the empty reserve.
        table.get_mut(2).remove_writable_bytes(64);

        assert_eq!(table.find_space(32, &[]), Some(2));
    }

    #[test]
    fn find_space_falls_back_to_empty_reserve() {
        let mut table = table(2);
        table.get_mut(0).remove_writable_bytes(SECTOR_SIZE);
        // Sector 0 is full; only the empty sector 1 can take the entry.
        assert_eq!(table.find_space(32, &[]), Some(1));
    }

    #[test]
    fn find_space_prefers_largest_tail() {
        let mut table = table(3);
        table.get_mut(0).remove_writable_bytes(512);
        table.get_mut(1).remove_writable_bytes(128);
        table.get_mut(2).remove_writable_bytes(2048);

        assert_eq!(table.find_space(32, &[]), Some(1));
    }

    #[test]
    fn find_space_skips_reserved_and_corrupt() {
        let mut table = table(3);
        table.get_mut(0).remove_writable_bytes(16);
        table.get_mut(1).remove_writable_bytes(16);
        table.get_mut(2).mark_corrupt();

        // An address in sector 1 is reserved, sector 2 is corrupt.
        let reserved = [4096u32 + 8];
        assert_eq!(table.find_space(32, &reserved), Some(0));
    }

    #[test]
    fn find_space_rejects_too_small_tails() {
        let mut table = table(1);
        table.get_mut(0).remove_writable_bytes(SECTOR_SIZE - 16);
        assert_eq!(table.find_space(32, &[]), None);
    }

    #[test]
    fn find_space_round_robins_between_equal_tails() {
        let mut table = table(4);
        for i in 0..4 {
            table.get_mut(i).remove_writable_bytes(64);
        }
        let first = table.find_space(32, &[]).unwrap();
        let second = table.find_space(32, &[]).unwrap();
        // The anchor advanced, so the identical-tail tie resolves to a
        // different sector on the next call.
        assert_ne!(first, second);
    }

    // -------------------- find_space_during_gc --------------------

    #[test]
    fn gc_space_prefers_the_empty_reserve() {
        let mut table = table(3);
        table.get_mut(0).remove_writable_bytes(64);
        // Sector 1 empty, sector 0 non-empty: relocation takes the reserve.
        assert_eq!(table.find_space_during_gc(32, &[], &[]), Some(1));
    }

    #[test]
    fn gc_space_avoids_sectors_with_other_copies() {
        let mut table = table(3);
        table.get_mut(0).remove_writable_bytes(SECTOR_SIZE);
        table.get_mut(1).remove_writable_bytes(64);
        table.get_mut(2).remove_writable_bytes(64);

        // The entry's surviving copy lives in sector 1.
        let copies = [4096u32];
        assert_eq!(table.find_space_during_gc(32, &copies, &[]), Some(2));
    }

    // -------------------- find_sector_to_gc --------------------

    #[test]
    fn gc_victim_is_most_recoverable() {
        let mut table = table(3);
        // Sector 0: 100 recoverable; sector 1: 300; sector 2: empty.
        table.get_mut(0).remove_writable_bytes(150);
        table.get_mut(0).add_valid_bytes(50);
        table.get_mut(1).remove_writable_bytes(400);
        table.get_mut(1).add_valid_bytes(100);

        assert_eq!(table.find_sector_to_gc(&[]), Some(1));
    }

    #[test]
    fn gc_victim_none_when_nothing_reclaimable() {
        let mut table = table(3);
        // All written bytes are still valid.
        table.get_mut(0).remove_writable_bytes(128);
        table.get_mut(0).add_valid_bytes(128);

        assert_eq!(table.find_sector_to_gc(&[]), None);
    }

    #[test]
    fn gc_victim_skips_reserved_addresses() {
        let mut table = table(2);
        table.get_mut(0).remove_writable_bytes(512);
        table.get_mut(1).remove_writable_bytes(256);

        let reserved = [16u32]; // inside sector 0
        assert_eq!(table.find_sector_to_gc(&reserved), Some(1));
    }

    #[test]
    fn corrupt_sector_is_a_strong_victim() {
        let mut table = table(2);
        table.get_mut(0).remove_writable_bytes(100);
        table.get_mut(1).mark_corrupt();

        // The corrupt sector forfeited its tail, so it has the most
        // recoverable bytes.
        assert_eq!(table.find_sector_to_gc(&[]), Some(1));
    }

    #[test]
    fn wear_spreads_within_factor_two_of_mean() {
        let mut table = table(4);
        let mut counts = [0usize; 4];

        // Uniform appends; a filled sector is erased as GC would.
        for _ in 0..4096 {
            let index = table.find_space(64, &[]).unwrap();
            counts[index] += 1;
            table.get_mut(index).remove_writable_bytes(64);
            if table.get(index).writable_bytes() < 64 {
                table.get_mut(index).set_erased(SECTOR_SIZE);
            }
        }

        let mean = 4096 / 4;
        for &count in &counts {
            assert!(
                count >= mean / 2 && count <= mean * 2,
                "uneven wear: {counts:?}"
            );
        }
    }

    // -------------------- reserve tracking --------------------

    #[test]
    fn any_empty_reflects_reserve() {
        let mut table = table(2);
        assert!(table.any_empty());
        table.get_mut(0).remove_writable_bytes(1);
        table.get_mut(1).remove_writable_bytes(1);
        assert!(!table.any_empty());
    }
}
