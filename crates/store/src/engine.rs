//! The store engine: initialization, reads, writes, garbage collection,
//! and repair over one flash partition.

use tracing::{debug, error, info, warn};

use entry::{
    newer_than, Entry, EntryError, EntryState, FormatSet, MAX_KEY_LENGTH, MIN_ALIGNMENT,
    TOMBSTONE_SENTINEL,
};
use flash::FlashPartition;

use crate::config::{ErrorRecovery, GcOnWrite, StoreConfig};
use crate::error::{Result, StoreError};
use crate::keycache::KeyCache;
use crate::sectors::SectorTable;

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Before a successful `init`, or after one that failed outright.
    NotInitialized,
    /// All operations permitted.
    Ready,
    /// Reads permitted; writes rejected until `repair` or
    /// `full_maintenance` succeeds.
    NeedsMaintenance,
}

/// Aggregate space accounting and repair counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Bytes occupied by the newest version of every key.
    pub in_use_bytes: usize,
    /// Bytes reclaimable by garbage collection.
    pub reclaimable_bytes: usize,
    /// Appendable bytes, excluding the reserved empty sector.
    pub writable_bytes: usize,
    pub corrupt_sectors_recovered: usize,
    pub missing_redundant_entries_recovered: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct ErrorStats {
    corrupt_sectors_recovered: usize,
    missing_redundant_entries_recovered: usize,
}

/// A key-value store over one flash partition.
///
/// The store is single-threaded and non-reentrant: every operation runs
/// to completion before returning. All state lives in this struct; the
/// partition is owned exclusively for the store's lifetime.
pub struct Store<P: FlashPartition> {
    flash: P,
    formats: FormatSet,
    config: StoreConfig,
    sectors: SectorTable,
    cache: KeyCache,
    state: StoreState,
    error_detected: bool,
    error_stats: ErrorStats,
    last_transaction_id: u32,
}

impl<P: FlashPartition> Store<P> {
    /// Creates a store over `flash`. The store is unusable until
    /// [`init`](Store::init) runs.
    pub fn new(flash: P, formats: FormatSet, config: StoreConfig) -> Result<Self> {
        if config.redundancy == 0 {
            return Err(StoreError::InvalidArgument("redundancy must be at least 1"));
        }
        if config.redundancy > flash.sector_count() {
            return Err(StoreError::InvalidArgument(
                "redundancy exceeds sector count",
            ));
        }
        if config.max_entries == 0 {
            return Err(StoreError::InvalidArgument("entry cache needs capacity"));
        }
        if MIN_ALIGNMENT % flash.alignment() != 0 {
            return Err(StoreError::InvalidArgument(
                "partition alignment incompatible with entry alignment",
            ));
        }
        if flash.sector_size() % MIN_ALIGNMENT != 0 {
            return Err(StoreError::InvalidArgument(
                "sector size not a multiple of entry alignment",
            ));
        }

        let sectors = SectorTable::new(flash.sector_count(), flash.sector_size());
        let cache = KeyCache::new(config.max_entries, config.redundancy);
        Ok(Self {
            flash,
            formats,
            config,
            sectors,
            cache,
            state: StoreState::NotInitialized,
            error_detected: false,
            error_stats: ErrorStats::default(),
            last_transaction_id: 0,
        })
    }

    /// Consumes the store, releasing the partition.
    pub fn into_flash(self) -> P {
        self.flash
    }

    #[cfg(test)]
    pub(crate) fn flash_mut(&mut self) -> &mut P {
        &mut self.flash
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Number of live (non-deleted) keys.
    pub fn len(&self) -> usize {
        self.cache
            .iter()
            .filter(|m| m.state() == EntryState::Valid)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of indexed keys including deleted ones whose tombstones
    /// are still on flash.
    pub fn total_entries(&self) -> usize {
        self.cache.total_entries()
    }

    // =========================================================================
    // Init
    // =========================================================================

    /// Rebuilds the in-memory index and sector accounting from the flash
    /// log, then applies the configured recovery policy.
    ///
    /// Returns `DataLoss` when corrupt bytes remain uncorrected; the
    /// store is still usable for the keys that survived.
    pub fn init(&mut self) -> Result<()> {
        self.state = StoreState::NotInitialized;
        self.error_detected = false;
        self.error_stats = ErrorStats::default();
        self.last_transaction_id = 0;
        self.sectors.reset();
        self.cache.reset();

        let sector_size = self.flash.sector_size();
        info!(
            sectors = self.sectors.len(),
            sector_size, "initializing store"
        );

        // First pass: walk every sector's log, indexing each decodable
        // record and hunting past corrupt spans for survivors.
        let mut total_corrupt_bytes = 0usize;
        let mut corrupt_entries = 0usize;
        let mut empty_sector_found = false;

        for index in 0..self.sectors.len() {
            let base = self.sectors.base_address(index);
            let mut entry_address = base;
            let mut sector_corrupt_bytes = 0usize;

            loop {
                if !self.sectors.address_in_sector(index, entry_address) {
                    debug!(sector = index, "reached end of sector");
                    break;
                }

                match self.load_entry(entry_address) {
                    Ok(next_address) => {
                        entry_address = next_address;
                        self.sectors
                            .get_mut(index)
                            .set_writable_bytes(sector_size - (entry_address - base) as usize);
                    }
                    Err(StoreError::NotFound) => {
                        debug!(sector = index, "hit erased tail");
                        break;
                    }
                    Err(StoreError::DataLoss) => {
                        warn!(
                            sector = index,
                            address = entry_address,
                            "corrupt entry during init"
                        );
                        self.error_detected = true;
                        corrupt_entries += 1;

                        // The corrupt record's length cannot be trusted;
                        // probe forward for the next recognizable magic.
                        match self.scan_for_entry(index, entry_address + MIN_ALIGNMENT as u32)? {
                            Some(next_address) => {
                                sector_corrupt_bytes += (next_address - entry_address) as usize;
                                entry_address = next_address;
                                self.sectors.get_mut(index).set_writable_bytes(
                                    sector_size - (entry_address - base) as usize,
                                );
                            }
                            None => {
                                sector_corrupt_bytes +=
                                    sector_size - (entry_address - base) as usize;
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        error!(%error, "unexpected error during init");
                        return Err(StoreError::Unknown);
                    }
                }
            }

            if sector_corrupt_bytes > 0 {
                // No further appends here; the sector becomes a strong GC
                // candidate while its surviving entries stay readable.
                self.sectors.get_mut(index).mark_corrupt();
                self.error_detected = true;
                warn!(
                    sector = index,
                    corrupt_bytes = sector_corrupt_bytes,
                    "sector contains corrupt data"
                );
            }
            if self.sectors.get(index).is_empty(sector_size) {
                empty_sector_found = true;
            }
            total_corrupt_bytes += sector_corrupt_bytes;
        }

        // Second pass: count valid bytes per sector and find the newest
        // transaction to anchor write placement and id allocation.
        let mut newest_address: Option<u32> = None;
        for index in 0..self.cache.total_entries() {
            if self.cache.get(index).addresses().len() < self.config.redundancy {
                self.error_detected = true;
            }
            let addresses = self.cache.get(index).addresses().to_vec();
            for address in addresses {
                let entry = Entry::read(&self.flash, address, &self.formats)
                    .map_err(|_| StoreError::Unknown)?;
                let sector = self.sectors.index_of(address);
                self.sectors.get_mut(sector).add_valid_bytes(entry.size());
            }

            let metadata = self.cache.get(index);
            if newest_address.is_none()
                || newer_than(metadata.transaction_id(), self.last_transaction_id)
            {
                self.last_transaction_id = metadata.transaction_id();
                newest_address = Some(*metadata.addresses().last().unwrap());
            }
        }
        if let Some(address) = newest_address {
            self.sectors.set_last_new_sector(address);
        }

        if !empty_sector_found {
            self.error_detected = true;
        }

        if !self.error_detected {
            self.state = StoreState::Ready;
        } else if self.config.recovery != ErrorRecovery::Manual {
            warn!("corruption detected, beginning repair");
            match self.repair_internal() {
                Ok(()) => {
                    warn!("corruption detected and fully repaired");
                    self.state = StoreState::Ready;
                    total_corrupt_bytes = 0;
                    corrupt_entries = 0;
                }
                Err(StoreError::ResourceExhausted) => {
                    warn!("unable to maintain required free sector");
                    self.state = StoreState::NeedsMaintenance;
                }
                Err(error) => {
                    warn!(%error, "corruption detected and unable to repair");
                    self.state = StoreState::NeedsMaintenance;
                }
            }
        } else {
            warn!("corruption detected, manual recovery configured");
            self.state = StoreState::NeedsMaintenance;
        }

        info!(
            live_keys = self.len(),
            deleted_keys = self.cache.total_entries() - self.len(),
            sectors = self.sectors.len(),
            "store init complete"
        );
        self.log_sectors();
        self.log_keys();

        if total_corrupt_bytes > 0 {
            warn!(
                corrupt_bytes = total_corrupt_bytes,
                corrupt_entries, "uncorrected corruption; some keys may be missing"
            );
            return Err(StoreError::DataLoss);
        }
        Ok(())
    }

    /// Decodes, verifies, and indexes the record at `address`, returning
    /// the address just past it.
    fn load_entry(&mut self, address: u32) -> Result<u32> {
        let entry = Entry::read(&self.flash, address, &self.formats).map_err(init_read_error)?;

        let mut key = [0u8; MAX_KEY_LENGTH];
        let key_length = entry.read_key(&self.flash, &mut key).map_err(init_read_error)?;
        let key = &key[..key_length];

        entry
            .verify_checksum_in_flash(&self.flash)
            .map_err(init_read_error)?;

        let next_address = entry.next_address();
        self.cache
            .add_new_or_update_existing(entry.descriptor(key), address, self.flash.sector_size())
            .map_err(|_| StoreError::ResourceExhausted)?;
        Ok(next_address)
    }

    /// Probes forward within a sector for a recognizable record magic,
    /// starting at `start_address` and stepping by the minimum alignment.
    fn scan_for_entry(&self, sector: usize, start_address: u32) -> Result<Option<u32>> {
        debug!(sector, start_address, "scanning for entry magic");
        let mut address = flash::align_up(start_address as usize, MIN_ALIGNMENT) as u32;
        while self.sectors.address_in_sector(sector, address) {
            let mut magic = [0u8; 4];
            self.flash
                .read(address, &mut magic)
                .map_err(|_| StoreError::Unknown)?;
            if self.formats.known(u32::from_le_bytes(magic)) {
                debug!(address, "found entry magic");
                return Ok(Some(address));
            }
            address += MIN_ALIGNMENT as u32;
        }
        Ok(None)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads the value for `key` into `buf`, starting at `offset` bytes
    /// into the value. Returns the number of bytes read; a short buffer
    /// yields a short read.
    pub fn get(&self, key: &[u8], buf: &mut [u8], offset: usize) -> Result<usize> {
        self.check_read_operation(key)?;

        let index = self
            .cache
            .find_existing(&self.flash, &self.formats, key)
            .map_err(read_error)?
            .ok_or(StoreError::NotFound)?;

        let entry = Entry::read(&self.flash, self.cache.get(index).first_address(), &self.formats)
            .map_err(read_error)?;
        let read = entry
            .read_value(&self.flash, buf, offset)
            .map_err(read_error)?;

        // Only a whole-value read can be checked against the record
        // checksum; partial reads skip verification.
        if self.config.verify_on_read && offset == 0 && read == entry.value_length() {
            if entry.verify_checksum(key, &buf[..read]).is_err() {
                buf[..read].fill(0);
                return Err(StoreError::DataLoss);
            }
        }
        Ok(read)
    }

    /// Declared value length for `key`, without touching the payload.
    pub fn value_size(&self, key: &[u8]) -> Result<usize> {
        self.check_read_operation(key)?;

        let index = self
            .cache
            .find_existing(&self.flash, &self.formats, key)
            .map_err(read_error)?
            .ok_or(StoreError::NotFound)?;

        let entry = Entry::read(&self.flash, self.cache.get(index).first_address(), &self.formats)
            .map_err(read_error)?;
        Ok(entry.value_length())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores `value` under `key`, overwriting any previous version.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_write_operation(key)?;
        debug!(
            key_length = key.len(),
            value_length = value.len(),
            "writing key/value"
        );

        if value.len() >= TOMBSTONE_SENTINEL as usize {
            return Err(StoreError::InvalidArgument("value too large"));
        }
        if Entry::size_for(key, value, MIN_ALIGNMENT) > self.flash.sector_size() {
            debug!("key/value pair cannot fit in one sector");
            return Err(StoreError::InvalidArgument(
                "entry larger than one sector",
            ));
        }

        let result = self.put_impl(key, value);
        self.finish_mutation(result)
    }

    fn put_impl(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self
            .cache
            .find(&self.flash, &self.formats, key)
            .map_err(read_error)?
        {
            Some(index) => {
                debug!(
                    hash = self.cache.get(index).hash(),
                    copies = self.cache.get(index).addresses().len(),
                    "overwriting existing entry"
                );
                self.write_entry_for_existing(index, EntryState::Valid, key, value)
            }
            None => self.write_entry_for_new(key, value),
        }
    }

    /// Writes a tombstone for `key`. The key stays indexed until its
    /// tombstone's sector is collected; a later put resurrects it.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_write_operation(key)?;

        let Some(index) = self
            .cache
            .find_existing(&self.flash, &self.formats, key)
            .map_err(read_error)?
        else {
            return Err(StoreError::NotFound);
        };

        debug!(hash = self.cache.get(index).hash(), "writing tombstone");
        let result = self.write_entry_for_existing(index, EntryState::Deleted, key, &[]);
        self.finish_mutation(result)
    }

    /// Eager recovery repairs as soon as a mutation latches an error.
    fn finish_mutation(&mut self, result: Result<()>) -> Result<()> {
        if self.config.recovery == ErrorRecovery::Eager && self.error_detected {
            debug!("eager repair after mutation");
            let _ = self.repair_internal();
        }
        result
    }

    fn write_entry_for_existing(
        &mut self,
        index: usize,
        new_state: EntryState,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        // The prior record's size drives the stale-byte accounting.
        let prior = Entry::read(&self.flash, self.cache.get(index).first_address(), &self.formats)
            .map_err(read_error)?;
        self.write_entry(key, value, new_state, Some((index, prior.size())))
    }

    fn write_entry_for_new(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.cache.is_full() {
            warn!(
                entries = self.cache.total_entries(),
                "cannot store new key, entry cache full"
            );
            return Err(StoreError::ResourceExhausted);
        }
        self.write_entry(key, value, EntryState::Valid, None)
    }

    fn write_entry(
        &mut self,
        key: &[u8],
        value: &[u8],
        new_state: EntryState,
        prior: Option<(usize, usize)>,
    ) -> Result<()> {
        let entry_size = Entry::size_for(key, value, MIN_ALIGNMENT);
        let redundancy = self.config.redundancy;

        // Stage one address per copy up front, garbage collecting along
        // the way if needed; no two copies share a sector.
        let mut reserved: Vec<u32> = Vec::with_capacity(redundancy);
        for _ in 0..redundancy {
            let sector = self.get_sector_for_write(entry_size, &reserved)?;
            debug!(sector, "found space for entry");
            reserved.push(self.sectors.next_writable_address(sector));
        }

        // Burn a transaction id even if the writes below fail. A failed
        // write followed by a retry must never reuse an id, or two
        // different records could tie after a crash.
        self.last_transaction_id = self.last_transaction_id.wrapping_add(1);

        let mut entry = match new_state {
            EntryState::Valid => Entry::valid(
                reserved[0],
                self.formats.primary(),
                key,
                value,
                MIN_ALIGNMENT,
                self.last_transaction_id,
            ),
            EntryState::Deleted => Entry::tombstone(
                reserved[0],
                self.formats.primary(),
                key,
                MIN_ALIGNMENT,
                self.last_transaction_id,
            ),
        };

        // If this first append fails the cache is untouched and the store
        // still reflects the prior value.
        self.append_entry(&entry, key, value)?;

        let index = match prior {
            None => self
                .cache
                .add_new(entry.descriptor(key), entry.address())
                .map_err(|_| StoreError::ResourceExhausted)?,
            Some((index, prior_size)) => {
                let stale = self.cache.get(index).addresses().to_vec();
                for address in stale {
                    let sector = self.sectors.index_of(address);
                    self.sectors.get_mut(sector).remove_valid_bytes(prior_size);
                }
                self.cache
                    .get_mut(index)
                    .reset(entry.descriptor(key), entry.address());
                index
            }
        };

        for &address in &reserved[1..] {
            entry.set_address(address);
            self.append_entry(&entry, key, value)?;
            self.cache.get_mut(index).add_address(address);
        }
        Ok(())
    }

    /// Appends one record copy and keeps the sector accounting honest
    /// whether or not the write succeeds.
    fn append_entry(&mut self, entry: &Entry, key: &[u8], value: &[u8]) -> Result<()> {
        let sector = self.sectors.index_of(entry.address());

        match entry.write(&mut self.flash, key, value) {
            Ok(written) => {
                self.sectors.get_mut(sector).remove_writable_bytes(written);
            }
            Err(error) => {
                // The tail is in an unknown state; forfeit the record's
                // whole span and stop appending to this sector.
                self.sectors
                    .get_mut(sector)
                    .remove_writable_bytes(entry.size());
                error!(%error, address = entry.address(), "failed to append entry");
                self.sectors.get_mut(sector).mark_corrupt();
                self.error_detected = true;
                return Err(StoreError::DataLoss);
            }
        }

        if self.config.verify_on_write {
            if let Err(error) = entry.verify_checksum_in_flash(&self.flash) {
                error!(%error, address = entry.address(), "verify after append failed");
                self.sectors.get_mut(sector).mark_corrupt();
                self.error_detected = true;
                return Err(StoreError::DataLoss);
            }
        }

        self.sectors.get_mut(sector).add_valid_bytes(entry.size());
        Ok(())
    }

    /// Finds a sector with room for `entry_size`, garbage collecting as
    /// the policy allows when space runs out.
    fn get_sector_for_write(&mut self, entry_size: usize, reserved: &[u32]) -> Result<usize> {
        let mut found = self.sectors.find_space(entry_size, reserved);

        let mut gc_count = 0usize;
        let mut do_auto_gc = self.config.gc_on_write != GcOnWrite::Disabled;

        while found.is_none() && do_auto_gc {
            if self.config.gc_on_write == GcOnWrite::OneSector {
                do_auto_gc = false;
            }
            match self.garbage_collect_internal(reserved) {
                Ok(()) => {}
                // Nothing reclaimable anywhere: the store is full.
                Err(StoreError::NotFound) => return Err(StoreError::ResourceExhausted),
                Err(error) => return Err(error),
            }
            found = self.sectors.find_space(entry_size, reserved);

            gc_count += 1;
            // Past this point every sector has been considered; further
            // loops cannot make progress.
            if gc_count > self.sectors.len() + 2 {
                error!("garbage collected more sectors than the partition holds");
                return Err(StoreError::ResourceExhausted);
            }
        }

        found.ok_or_else(|| {
            warn!(entry_size, "unable to find sector with space");
            StoreError::ResourceExhausted
        })
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Reclaims one sector's worth of stale records. Returns `NotFound`
    /// when nothing is reclaimable.
    pub fn garbage_collect(&mut self) -> Result<()> {
        if self.state == StoreState::NotInitialized {
            return Err(StoreError::FailedPrecondition);
        }
        if self.error_detected && self.config.recovery != ErrorRecovery::Manual {
            self.repair_internal()?;
        }
        debug!("garbage collecting a single sector");
        self.garbage_collect_internal(&[])
    }

    fn garbage_collect_internal(&mut self, reserved: &[u32]) -> Result<()> {
        let victim = self
            .sectors
            .find_sector_to_gc(reserved)
            .ok_or(StoreError::NotFound)?;
        self.garbage_collect_sector(victim, reserved)
    }

    /// Moves every live record out of `victim`, then erases it.
    fn garbage_collect_sector(&mut self, victim: usize, reserved: &[u32]) -> Result<()> {
        debug!(victim, "garbage collecting sector");

        if self.sectors.get(victim).valid_bytes() != 0 {
            for index in 0..self.cache.total_entries() {
                self.relocate_key_addresses_in_sector(victim, index, reserved)?;
            }
        }

        if self.sectors.get(victim).valid_bytes() != 0 {
            error!(
                victim,
                remaining = self.sectors.get(victim).valid_bytes(),
                "valid bytes remain after relocation"
            );
            return Err(StoreError::Internal);
        }

        // Latched while erasing: a power loss here leaves the sector a GC
        // candidate rather than an append target.
        self.sectors.get_mut(victim).mark_corrupt();
        if let Err(error) = self.flash.erase(victim, 1) {
            error!(%error, victim, "sector erase failed");
            self.error_detected = true;
            return Err(StoreError::DataLoss);
        }
        self.sectors
            .get_mut(victim)
            .set_erased(self.flash.sector_size());

        debug!(victim, "sector reclaimed");
        Ok(())
    }

    fn relocate_key_addresses_in_sector(
        &mut self,
        victim: usize,
        index: usize,
        reserved: &[u32],
    ) -> Result<()> {
        let addresses = self.cache.get(index).addresses().to_vec();
        for address in addresses {
            if self.sectors.address_in_sector(victim, address) {
                debug!(
                    hash = self.cache.get(index).hash(),
                    victim, "relocating entry copy"
                );
                self.relocate_entry(index, address, reserved)?;
            }
        }
        Ok(())
    }

    /// Copies one record out of a sector about to be erased.
    fn relocate_entry(&mut self, index: usize, address: u32, reserved: &[u32]) -> Result<()> {
        let mut entry = match Entry::read(&self.flash, address, &self.formats) {
            Ok(entry) => entry,
            Err(error) => return self.drop_lost_copy(index, address, error),
        };

        let copies = self.cache.get(index).addresses().to_vec();
        let Some(new_sector) = self
            .sectors
            .find_space_during_gc(entry.size(), &copies, reserved)
        else {
            return Err(StoreError::ResourceExhausted);
        };
        let new_address = self.sectors.next_writable_address(new_sector);

        let written = match entry.copy(&mut self.flash, new_address) {
            Ok(written) => written,
            Err(error) => {
                error!(%error, new_address, "relocation write failed");
                self.sectors.get_mut(new_sector).mark_corrupt();
                self.error_detected = true;
                return Err(StoreError::DataLoss);
            }
        };
        self.sectors
            .get_mut(new_sector)
            .remove_writable_bytes(written);

        if self.config.verify_on_write {
            if let Err(error) = entry.verify_checksum_in_flash(&self.flash) {
                error!(%error, new_address, "verify after relocation failed");
                self.sectors.get_mut(new_sector).mark_corrupt();
                self.error_detected = true;
                return Err(StoreError::DataLoss);
            }
        }

        self.sectors.get_mut(new_sector).add_valid_bytes(written);
        let old_sector = self.sectors.index_of(address);
        self.sectors.get_mut(old_sector).remove_valid_bytes(written);
        self.cache.get_mut(index).update_address(address, new_address);
        Ok(())
    }

    /// An unreadable source copy is abandoned when another replica
    /// survives; the surviving copies stay authoritative. With no
    /// survivor the relocation fails.
    fn drop_lost_copy(&mut self, index: usize, address: u32, error: EntryError) -> Result<()> {
        warn!(%error, address, "entry copy unreadable during relocation");
        self.error_detected = true;

        if self.cache.get(index).addresses().len() <= 1 {
            return Err(StoreError::DataLoss);
        }
        let survivor = *self
            .cache
            .get(index)
            .addresses()
            .iter()
            .find(|&&a| a != address)
            .unwrap();
        // Same version, same size: charge the victim by the survivor's.
        let size = Entry::read(&self.flash, survivor, &self.formats)
            .map_err(read_error)?
            .size();
        let sector = self.sectors.index_of(address);
        self.sectors.get_mut(sector).remove_valid_bytes(size);
        self.cache.get_mut(index).remove_address(address);
        Ok(())
    }

    // =========================================================================
    // Maintenance and repair
    // =========================================================================

    /// Repairs if needed, then garbage collects every sector holding
    /// reclaimable bytes, cycling from the most recently written sector.
    pub fn full_maintenance(&mut self) -> Result<()> {
        if self.state == StoreState::NotInitialized {
            return Err(StoreError::FailedPrecondition);
        }
        debug!("full maintenance");

        self.check_for_errors();
        if self.error_detected {
            self.repair_internal()?;
        }

        let start = self.sectors.last_new_sector();
        let count = self.sectors.len();
        for offset in 1..=count {
            let index = (start + offset) % count;
            if self
                .sectors
                .get(index)
                .recoverable_bytes(self.flash.sector_size())
                > 0
            {
                self.garbage_collect_sector(index, &[])?;
            }
        }

        debug!("full maintenance complete");
        Ok(())
    }

    /// Scans for latent problems (corrupt latches, missing redundancy)
    /// and records whether any were found.
    pub fn check_for_errors(&mut self) -> bool {
        if self.sectors.iter().any(|s| s.corrupt()) {
            self.error_detected = true;
        }
        if self.config.redundancy > 1
            && self
                .cache
                .iter()
                .any(|m| m.addresses().len() < self.config.redundancy)
        {
            self.error_detected = true;
        }
        self.error_detected
    }

    /// Three-phase recovery: collect corrupt sectors, restore the free
    /// reserve, and re-replicate under-copied keys. Every phase runs;
    /// the first failure is reported. Full success returns the store to
    /// `Ready`.
    pub fn repair(&mut self) -> Result<()> {
        if self.state == StoreState::NotInitialized {
            return Err(StoreError::FailedPrecondition);
        }
        self.repair_internal()
    }

    fn repair_internal(&mut self) -> Result<()> {
        debug!("store repair");

        let mut overall = self.repair_corrupt_sectors();

        // A sector found empty above can be consumed by a failing GC, so
        // the reserve is re-checked independently.
        let status = self.ensure_free_sector_exists();
        if overall.is_ok() {
            overall = status;
        }

        let status = self.ensure_entry_redundancy();
        if overall.is_ok() {
            overall = status;
        }

        if overall.is_ok() {
            self.error_detected = false;
            self.state = StoreState::Ready;
        }
        overall
    }

    /// Garbage collects every corrupt-latched sector. A failed pass is
    /// retried once; an earlier reclaim may have freed the space a later
    /// one needed.
    fn repair_corrupt_sectors(&mut self) -> Result<()> {
        let mut status: Result<()> = Ok(());
        for pass in 1..=2u32 {
            if status == Err(StoreError::ResourceExhausted) {
                status = Ok(());
            }
            debug!(pass, "repairing corrupt sectors");

            for index in 0..self.sectors.len() {
                if !self.sectors.get(index).corrupt() {
                    continue;
                }
                debug!(sector = index, "collecting corrupt sector");
                match self.garbage_collect_sector(index, &[]) {
                    Ok(()) => self.error_stats.corrupt_sectors_recovered += 1,
                    Err(error) => {
                        if status.is_ok() {
                            status = Err(error);
                        }
                    }
                }
            }

            if status.is_ok() {
                break;
            }
        }
        status
    }

    fn ensure_free_sector_exists(&mut self) -> Result<()> {
        if self.sectors.any_empty() {
            return Ok(());
        }
        debug!("no empty sector, forcing garbage collection");
        match self.garbage_collect_internal(&[]) {
            Ok(()) => Ok(()),
            // Nothing reclaimable and nothing free: the store is wedged
            // until space is released.
            Err(StoreError::NotFound) => Err(StoreError::ResourceExhausted),
            Err(error) => Err(error),
        }
    }

    /// Writes the missing copies for every key below the redundancy
    /// target, each into a sector not already holding one.
    fn ensure_entry_redundancy(&mut self) -> Result<()> {
        if self.config.redundancy == 1 {
            return Ok(());
        }
        let mut status: Result<()> = Ok(());
        for index in 0..self.cache.total_entries() {
            if self.cache.get(index).addresses().len() >= self.config.redundancy {
                continue;
            }
            debug!(
                hash = self.cache.get(index).hash(),
                copies = self.cache.get(index).addresses().len(),
                want = self.config.redundancy,
                "adding missing redundant copies"
            );
            match self.add_redundant_entries(index) {
                Ok(()) => self.error_stats.missing_redundant_entries_recovered += 1,
                Err(error) => {
                    if status.is_ok() {
                        status = Err(error);
                    }
                }
            }
        }
        status
    }

    fn add_redundant_entries(&mut self, index: usize) -> Result<()> {
        let first_address = self.cache.get(index).first_address();
        let mut entry =
            Entry::read(&self.flash, first_address, &self.formats).map_err(read_error)?;
        entry
            .verify_checksum_in_flash(&self.flash)
            .map_err(read_error)?;

        while self.cache.get(index).addresses().len() < self.config.redundancy {
            let existing = self.cache.get(index).addresses().to_vec();
            let Some(sector) = self.sectors.find_space(entry.size(), &existing) else {
                return Err(StoreError::ResourceExhausted);
            };
            let new_address = self.sectors.next_writable_address(sector);

            let written = match entry.copy(&mut self.flash, new_address) {
                Ok(written) => written,
                Err(error) => {
                    error!(%error, new_address, "redundant copy write failed");
                    self.sectors.get_mut(sector).mark_corrupt();
                    self.error_detected = true;
                    return Err(StoreError::DataLoss);
                }
            };
            self.sectors.get_mut(sector).remove_writable_bytes(written);

            if self.config.verify_on_write {
                if let Err(error) = entry.verify_checksum_in_flash(&self.flash) {
                    error!(%error, new_address, "verify after redundant copy failed");
                    self.sectors.get_mut(sector).mark_corrupt();
                    self.error_detected = true;
                    return Err(StoreError::DataLoss);
                }
            }

            self.sectors.get_mut(sector).add_valid_bytes(written);
            self.cache.get_mut(index).add_address(new_address);
        }
        Ok(())
    }

    // =========================================================================
    // Stats and iteration
    // =========================================================================

    /// Space accounting across the partition. The first empty sector is
    /// the GC reserve and is not counted as writable.
    pub fn storage_stats(&self) -> StorageStats {
        let sector_size = self.flash.sector_size();
        let mut stats = StorageStats {
            corrupt_sectors_recovered: self.error_stats.corrupt_sectors_recovered,
            missing_redundant_entries_recovered: self
                .error_stats
                .missing_redundant_entries_recovered,
            ..StorageStats::default()
        };

        let mut reserve_seen = false;
        for sector in self.sectors.iter() {
            stats.in_use_bytes += sector.valid_bytes();
            stats.reclaimable_bytes += sector.recoverable_bytes(sector_size);

            if !reserve_seen && sector.is_empty(sector_size) {
                reserve_seen = true;
                continue;
            }
            stats.writable_bytes += sector.writable_bytes();
        }
        stats
    }

    /// Iterates the live (non-deleted) keys in insertion order.
    pub fn iter(&self) -> StoreIter<'_, P> {
        StoreIter {
            store: self,
            index: 0,
        }
    }

    /// Logs per-sector accounting at debug level.
    pub fn log_sectors(&self) {
        let sector_size = self.flash.sector_size();
        for (index, sector) in self.sectors.iter().enumerate() {
            debug!(
                sector = index,
                valid = sector.valid_bytes(),
                recoverable = sector.recoverable_bytes(sector_size),
                free = sector.writable_bytes(),
                corrupt = sector.corrupt(),
                "sector state"
            );
        }
    }

    /// Logs every indexed key's metadata at debug level.
    pub fn log_keys(&self) {
        for metadata in self.cache.iter() {
            debug!(
                hash = metadata.hash(),
                transaction_id = metadata.transaction_id(),
                first_address = metadata.first_address(),
                deleted = metadata.state() == EntryState::Deleted,
                "key descriptor"
            );
        }
    }

    fn check_write_operation(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument("bad key"));
        }
        // Writes need a fully healthy store.
        if self.state != StoreState::Ready {
            return Err(StoreError::FailedPrecondition);
        }
        Ok(())
    }

    fn check_read_operation(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument("bad key"));
        }
        // Reads are fine while maintenance is pending.
        if self.state == StoreState::NotInitialized {
            return Err(StoreError::FailedPrecondition);
        }
        Ok(())
    }
}

fn read_error(error: EntryError) -> StoreError {
    match error {
        EntryError::OutOfRange => StoreError::InvalidArgument("offset out of range"),
        // An indexed address that no longer decodes is lost data, whatever
        // the codec called it.
        _ => StoreError::DataLoss,
    }
}

/// Error mapping for the init scan, where `NotFound` is meaningful (it
/// marks the erased tail) and everything unreadable is `DataLoss`.
fn init_read_error(error: EntryError) -> StoreError {
    match error {
        EntryError::NotFound => StoreError::NotFound,
        EntryError::Flash(_) => StoreError::Unknown,
        _ => StoreError::DataLoss,
    }
}

/// Iterator over live keys; see [`Store::iter`].
pub struct StoreIter<'a, P: FlashPartition> {
    store: &'a Store<P>,
    index: usize,
}

impl<'a, P: FlashPartition> Iterator for StoreIter<'a, P> {
    type Item = StoreItem<'a, P>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.store.cache.total_entries() {
            let index = self.index;
            self.index += 1;
            if self.store.cache.get(index).state() == EntryState::Valid {
                return Some(StoreItem {
                    store: self.store,
                    index,
                });
            }
        }
        None
    }
}

/// One live key yielded by iteration. The key bytes are read from flash
/// lazily so iteration itself keeps nothing resident.
pub struct StoreItem<'a, P: FlashPartition> {
    store: &'a Store<P>,
    index: usize,
}

impl<P: FlashPartition> StoreItem<'_, P> {
    /// Reads this entry's key bytes from flash.
    pub fn key(&self) -> Result<Vec<u8>> {
        let metadata = self.store.cache.get(self.index);
        let entry = Entry::read(&self.store.flash, metadata.first_address(), &self.store.formats)
            .map_err(read_error)?;
        let mut key = [0u8; MAX_KEY_LENGTH];
        let length = entry
            .read_key(&self.store.flash, &mut key)
            .map_err(read_error)?;
        Ok(key[..length].to_vec())
    }

    /// Declared value length of this entry.
    pub fn value_size(&self) -> Result<usize> {
        let metadata = self.store.cache.get(self.index);
        let entry = Entry::read(&self.store.flash, metadata.first_address(), &self.store.formats)
            .map_err(read_error)?;
        Ok(entry.value_length())
    }

    /// Reads this entry's value into `buf`, returning the bytes read.
    pub fn read_value(&self, buf: &mut [u8]) -> Result<usize> {
        let metadata = self.store.cache.get(self.index);
        let entry = Entry::read(&self.store.flash, metadata.first_address(), &self.store.formats)
            .map_err(read_error)?;
        entry
            .read_value(&self.store.flash, buf, 0)
            .map_err(read_error)
    }
}
