//! The in-memory key index.
//!
//! Maps a 32-bit key fingerprint to the flash addresses holding copies of
//! the newest version of that key. Fingerprints may collide between
//! distinct keys; lookups settle collisions by reading the candidate's
//! key bytes back from flash. Capacity is fixed at construction to bound
//! memory, and entries keep their insertion order, which is also the
//! iteration order of the store.

use entry::{
    hash_key, newer_than, Entry, EntryError, EntryState, FormatSet, KeyDescriptor, MAX_KEY_LENGTH,
};
use flash::FlashPartition;
use thiserror::Error;

/// The cache holds as many unique keys as it was sized for.
#[derive(Debug, Error)]
#[error("entry cache full")]
pub struct CacheFull;

/// Everything known in memory about one key: the descriptor of its newest
/// version and the addresses of the on-flash copies of that version.
#[derive(Debug, Clone)]
pub struct KeyMetadata {
    descriptor: KeyDescriptor,
    addresses: Vec<u32>,
}

impl KeyMetadata {
    fn new(descriptor: KeyDescriptor, address: u32) -> Self {
        Self {
            descriptor,
            addresses: vec![address],
        }
    }

    pub fn hash(&self) -> u32 {
        self.descriptor.key_hash
    }

    pub fn transaction_id(&self) -> u32 {
        self.descriptor.transaction_id
    }

    pub fn state(&self) -> EntryState {
        self.descriptor.state
    }

    /// Addresses of all copies of the newest version, 1..=R.
    pub fn addresses(&self) -> &[u32] {
        &self.addresses
    }

    pub fn first_address(&self) -> u32 {
        self.addresses[0]
    }

    /// Reassigns this key to a newly written version with one copy so
    /// far. All previous addresses become stale.
    pub(crate) fn reset(&mut self, descriptor: KeyDescriptor, address: u32) {
        self.descriptor = descriptor;
        self.addresses.clear();
        self.addresses.push(address);
    }

    pub(crate) fn add_address(&mut self, address: u32) {
        self.addresses.push(address);
    }

    /// Re-points one relocated copy.
    pub(crate) fn update_address(&mut self, old: u32, new: u32) {
        if let Some(slot) = self.addresses.iter_mut().find(|a| **a == old) {
            *slot = new;
        }
    }

    /// Drops a copy that was lost; at least one address must remain.
    pub(crate) fn remove_address(&mut self, address: u32) {
        debug_assert!(self.addresses.len() > 1);
        self.addresses.retain(|&a| a != address);
    }
}

/// Bounded index of every key the store knows about, including deleted
/// keys whose tombstones are still on flash.
#[derive(Debug)]
pub struct KeyCache {
    entries: Vec<KeyMetadata>,
    max_entries: usize,
    redundancy: usize,
}

impl KeyCache {
    pub fn new(max_entries: usize, redundancy: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_entries),
            max_entries,
            redundancy,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn total_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    pub fn get(&self, index: usize) -> &KeyMetadata {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut KeyMetadata {
        &mut self.entries[index]
    }

    /// Iterates all metadata in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyMetadata> {
        self.entries.iter()
    }

    /// Finds the metadata for `key`, resolving fingerprint collisions by
    /// comparing against the key bytes stored in flash. Copies are tried
    /// in order until one is readable; a candidate whose every copy is
    /// unreadable fails the lookup.
    pub fn find<P: FlashPartition>(
        &self,
        flash: &P,
        formats: &FormatSet,
        key: &[u8],
    ) -> Result<Option<usize>, EntryError> {
        let hash = hash_key(key);
        'candidates: for (index, metadata) in self.entries.iter().enumerate() {
            if metadata.descriptor.key_hash != hash {
                continue;
            }
            let mut last_error = None;
            for &address in &metadata.addresses {
                match read_key_at(flash, formats, address) {
                    Ok((stored, length)) => {
                        if &stored[..length] == key {
                            return Ok(Some(index));
                        }
                        // Same fingerprint, different key.
                        continue 'candidates;
                    }
                    Err(error) => last_error = Some(error),
                }
            }
            return Err(last_error.unwrap_or(EntryError::NotFound));
        }
        Ok(None)
    }

    /// Like [`find`](KeyCache::find) but treats deleted keys as absent.
    pub fn find_existing<P: FlashPartition>(
        &self,
        flash: &P,
        formats: &FormatSet,
        key: &[u8],
    ) -> Result<Option<usize>, EntryError> {
        Ok(self
            .find(flash, formats, key)?
            .filter(|&index| self.entries[index].state() == EntryState::Valid))
    }

    /// Inserts metadata for a key not present in the cache.
    pub fn add_new(&mut self, descriptor: KeyDescriptor, address: u32) -> Result<usize, CacheFull> {
        if self.is_full() {
            return Err(CacheFull);
        }
        self.entries.push(KeyMetadata::new(descriptor, address));
        Ok(self.entries.len() - 1)
    }

    /// Init-time registration of a record found on flash.
    ///
    /// Matches on fingerprint alone (init trusts the hash; lookups do the
    /// full comparison). A newer transaction id replaces the metadata and
    /// discards the stale addresses; the same id adds another replica of
    /// that version, provided it lands in a distinct sector and the list
    /// is below the redundancy bound; an older id is ignored, leaving its
    /// bytes for garbage collection.
    pub fn add_new_or_update_existing(
        &mut self,
        descriptor: KeyDescriptor,
        address: u32,
        sector_size: usize,
    ) -> Result<(), CacheFull> {
        let existing = self
            .entries
            .iter_mut()
            .find(|m| m.descriptor.key_hash == descriptor.key_hash);

        let Some(metadata) = existing else {
            return self.add_new(descriptor, address).map(|_| ());
        };

        if newer_than(descriptor.transaction_id, metadata.descriptor.transaction_id) {
            metadata.reset(descriptor, address);
        } else if descriptor.transaction_id == metadata.descriptor.transaction_id {
            let sector = address as usize / sector_size;
            let duplicate_sector = metadata
                .addresses
                .iter()
                .any(|&a| a as usize / sector_size == sector);
            if metadata.addresses.len() < self.redundancy && !duplicate_sector {
                metadata.addresses.push(address);
            }
        }
        Ok(())
    }
}

fn read_key_at<P: FlashPartition>(
    flash: &P,
    formats: &FormatSet,
    address: u32,
) -> Result<([u8; MAX_KEY_LENGTH], usize), EntryError> {
    let entry = Entry::read(flash, address, formats)?;
    let mut key = [0u8; MAX_KEY_LENGTH];
    let length = entry.read_key(flash, &mut key)?;
    Ok((key, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use entry::MIN_ALIGNMENT;
    use flash::MemFlash;

    const SECTOR_SIZE: usize = 4096;

    fn formats() -> FormatSet {
        FormatSet::default()
    }

    /// Writes a record and returns its descriptor.
    fn seed(flash: &mut MemFlash, address: u32, key: &[u8], txn: u32) -> KeyDescriptor {
        let entry = Entry::valid(address, formats().primary(), key, b"v", MIN_ALIGNMENT, txn);
        entry.write(flash, key, b"v").unwrap();
        entry.descriptor(key)
    }

    fn seed_tombstone(flash: &mut MemFlash, address: u32, key: &[u8], txn: u32) -> KeyDescriptor {
        let entry = Entry::tombstone(address, formats().primary(), key, MIN_ALIGNMENT, txn);
        entry.write(flash, key, &[]).unwrap();
        entry.descriptor(key)
    }

    // -------------------- add / find --------------------

    #[test]
    fn add_then_find() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 1);

        let descriptor = seed(&mut flash, 0, b"wifi_ssid", 1);
        let index = cache.add_new(descriptor, 0).unwrap();

        let found = cache.find(&flash, &formats(), b"wifi_ssid").unwrap();
        assert_eq!(found, Some(index));
        assert_eq!(cache.get(index).first_address(), 0);
        assert_eq!(cache.get(index).transaction_id(), 1);
    }

    #[test]
    fn find_missing_key_is_none() {
        let flash = MemFlash::new(4, SECTOR_SIZE);
        let cache = KeyCache::new(8, 1);
        assert_eq!(cache.find(&flash, &formats(), b"nope").unwrap(), None);
    }

    #[test]
    fn add_new_fails_when_full() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(1, 1);

        let a = seed(&mut flash, 0, b"a", 1);
        let b = seed(&mut flash, 32, b"b", 2);
        cache.add_new(a, 0).unwrap();
        assert!(cache.add_new(b, 32).is_err());
        assert!(cache.is_full());
    }

    #[test]
    fn fingerprint_collision_resolved_from_flash() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 1);

        // Two distinct keys, forced to share a fingerprint slot by
        // fabricating identical hashes in their descriptors.
        let mut first = seed(&mut flash, 0, b"alpha", 1);
        let second_entry = Entry::valid(64, formats().primary(), b"beta", b"v", MIN_ALIGNMENT, 2);
        second_entry.write(&mut flash, b"beta", b"v").unwrap();
        let mut second = second_entry.descriptor(b"beta");

        let shared = hash_key(b"alpha");
        first.key_hash = shared;
        second.key_hash = shared;

        cache.add_new(second, 64).unwrap(); // colliding stranger first
        cache.add_new(first, 0).unwrap();

        // Lookup must skip the stranger and land on the true "alpha".
        let found = cache.find(&flash, &formats(), b"alpha").unwrap().unwrap();
        assert_eq!(cache.get(found).first_address(), 0);
    }

    // -------------------- tombstone visibility --------------------

    #[test]
    fn find_existing_hides_deleted_keys() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 1);

        let descriptor = seed_tombstone(&mut flash, 0, b"gone", 3);
        cache.add_new(descriptor, 0).unwrap();

        assert!(cache.find(&flash, &formats(), b"gone").unwrap().is_some());
        assert!(cache
            .find_existing(&flash, &formats(), b"gone")
            .unwrap()
            .is_none());
    }

    // -------------------- init-time merge --------------------

    #[test]
    fn init_merge_newer_version_replaces() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let old = seed(&mut flash, 0, b"k", 5);
        let new = seed(&mut flash, 4096, b"k", 6);

        cache.add_new_or_update_existing(old, 0, SECTOR_SIZE).unwrap();
        cache
            .add_new_or_update_existing(new, 4096, SECTOR_SIZE)
            .unwrap();

        assert_eq!(cache.total_entries(), 1);
        let metadata = cache.get(0);
        assert_eq!(metadata.transaction_id(), 6);
        assert_eq!(metadata.addresses(), &[4096]);
    }

    #[test]
    fn init_merge_older_version_ignored() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let new = seed(&mut flash, 4096, b"k", 6);
        let old = seed(&mut flash, 0, b"k", 5);

        cache
            .add_new_or_update_existing(new, 4096, SECTOR_SIZE)
            .unwrap();
        cache.add_new_or_update_existing(old, 0, SECTOR_SIZE).unwrap();

        assert_eq!(cache.get(0).addresses(), &[4096]);
    }

    #[test]
    fn init_merge_same_version_collects_replicas() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let copy_a = seed(&mut flash, 0, b"k", 9);
        let copy_b = seed(&mut flash, 4096, b"k", 9);

        cache.add_new_or_update_existing(copy_a, 0, SECTOR_SIZE).unwrap();
        cache
            .add_new_or_update_existing(copy_b, 4096, SECTOR_SIZE)
            .unwrap();

        assert_eq!(cache.get(0).addresses(), &[0, 4096]);
    }

    #[test]
    fn init_merge_rejects_same_sector_duplicate() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let copy_a = seed(&mut flash, 0, b"k", 9);
        let copy_b = seed(&mut flash, 64, b"k", 9);

        cache.add_new_or_update_existing(copy_a, 0, SECTOR_SIZE).unwrap();
        cache.add_new_or_update_existing(copy_b, 64, SECTOR_SIZE).unwrap();

        // Both copies sit in sector 0; the second is not a usable replica.
        assert_eq!(cache.get(0).addresses(), &[0]);
    }

    #[test]
    fn init_merge_caps_replicas_at_redundancy() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let a = seed(&mut flash, 0, b"k", 9);
        let b = seed(&mut flash, 4096, b"k", 9);
        let c = seed(&mut flash, 8192, b"k", 9);

        cache.add_new_or_update_existing(a, 0, SECTOR_SIZE).unwrap();
        cache.add_new_or_update_existing(b, 4096, SECTOR_SIZE).unwrap();
        cache.add_new_or_update_existing(c, 8192, SECTOR_SIZE).unwrap();

        assert_eq!(cache.get(0).addresses().len(), 2);
    }

    #[test]
    fn init_merge_is_wrap_safe() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 1);

        let before_wrap = seed(&mut flash, 0, b"k", u32::MAX);
        let after_wrap = seed(&mut flash, 4096, b"k", 1);

        cache
            .add_new_or_update_existing(before_wrap, 0, SECTOR_SIZE)
            .unwrap();
        cache
            .add_new_or_update_existing(after_wrap, 4096, SECTOR_SIZE)
            .unwrap();

        // 1 is newer than u32::MAX across the wrap.
        assert_eq!(cache.get(0).transaction_id(), 1);
        assert_eq!(cache.get(0).addresses(), &[4096]);
    }

    // -------------------- metadata mutation --------------------

    #[test]
    fn reset_and_update_address() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 2);

        let v1 = seed(&mut flash, 0, b"k", 1);
        let index = cache.add_new(v1, 0).unwrap();

        let v2 = seed(&mut flash, 4096, b"k", 2);
        cache.get_mut(index).reset(v2, 4096);
        cache.get_mut(index).add_address(8192);
        assert_eq!(cache.get(index).addresses(), &[4096, 8192]);

        cache.get_mut(index).update_address(8192, 12288);
        assert_eq!(cache.get(index).addresses(), &[4096, 12288]);

        cache.get_mut(index).remove_address(4096);
        assert_eq!(cache.get(index).addresses(), &[12288]);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut flash = MemFlash::new(4, SECTOR_SIZE);
        let mut cache = KeyCache::new(8, 1);

        for (i, key) in [b"c" as &[u8], b"a", b"b"].iter().enumerate() {
            let address = (i * 64) as u32;
            let descriptor = seed(&mut flash, address, key, i as u32 + 1);
            cache.add_new(descriptor, address).unwrap();
        }

        let order: Vec<u32> = cache.iter().map(|m| m.first_address()).collect();
        assert_eq!(order, vec![0, 64, 128]);
    }
}
