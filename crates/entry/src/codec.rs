//! Encode, decode, and transfer single records at flash addresses.

use flash::{align_up, FlashPartition, ERASED_BYTE};

use crate::format::{
    hash_key, EntryError, EntryFormat, EntryHeader, EntryState, FormatSet, KeyDescriptor,
    HEADER_SIZE, MAX_KEY_LENGTH, MIN_ALIGNMENT, TOMBSTONE_SENTINEL,
};

/// One record pinned to a flash address.
///
/// An `Entry` is either decoded from flash ([`Entry::read`]) or built in
/// memory ([`Entry::valid`] / [`Entry::tombstone`]) and then written. It
/// never owns the key or value bytes; those are passed to the operations
/// that need them or read back from flash on demand.
#[derive(Debug, Clone)]
pub struct Entry {
    address: u32,
    header: EntryHeader,
}

impl Entry {
    /// Decodes the record at `address`.
    ///
    /// Returns [`EntryError::NotFound`] when the magic bytes are in the
    /// erased state (the end of a sector's log), and
    /// [`EntryError::DataLoss`] when the magic is unrecognized, a length
    /// field is impossible, or the record would cross its sector's end.
    /// The checksum is *not* verified here; use
    /// [`verify_checksum_in_flash`](Entry::verify_checksum_in_flash).
    pub fn read<P: FlashPartition>(
        flash: &P,
        address: u32,
        formats: &FormatSet,
    ) -> Result<Entry, EntryError> {
        let mut bytes = [0u8; HEADER_SIZE];
        flash.read(address, &mut bytes)?;

        if bytes[..4] == [ERASED_BYTE; 4] {
            return Err(EntryError::NotFound);
        }

        let header = EntryHeader::decode(&bytes);
        if !formats.known(header.magic) {
            return Err(EntryError::DataLoss("unrecognized magic"));
        }
        if header.alignment_units == 0 {
            return Err(EntryError::DataLoss("zero alignment"));
        }
        let key_length = header.key_length as usize;
        if key_length == 0 || key_length > MAX_KEY_LENGTH {
            return Err(EntryError::DataLoss("impossible key length"));
        }

        let entry = Entry { address, header };

        // Records never span sectors; a size that reaches past the end of
        // the containing sector means a corrupt length field.
        let sector_size = flash.sector_size() as u32;
        let sector_end = (address / sector_size + 1) * sector_size;
        if entry.address + entry.size() as u32 > sector_end {
            return Err(EntryError::DataLoss("entry crosses sector end"));
        }

        Ok(entry)
    }

    /// Builds a live record for `key` / `value` at `address`, checksummed
    /// and ready to [`write`](Entry::write).
    pub fn valid(
        address: u32,
        format: EntryFormat,
        key: &[u8],
        value: &[u8],
        alignment_bytes: usize,
        transaction_id: u32,
    ) -> Entry {
        assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);
        assert!((value.len() as u64) < TOMBSTONE_SENTINEL as u64);
        Self::build(
            address,
            format,
            key,
            value,
            value.len() as u16,
            alignment_bytes,
            transaction_id,
        )
    }

    /// Builds a tombstone record for `key` at `address`.
    pub fn tombstone(
        address: u32,
        format: EntryFormat,
        key: &[u8],
        alignment_bytes: usize,
        transaction_id: u32,
    ) -> Entry {
        assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);
        Self::build(
            address,
            format,
            key,
            &[],
            TOMBSTONE_SENTINEL,
            alignment_bytes,
            transaction_id,
        )
    }

    fn build(
        address: u32,
        format: EntryFormat,
        key: &[u8],
        value: &[u8],
        value_size: u16,
        alignment_bytes: usize,
        transaction_id: u32,
    ) -> Entry {
        assert!(alignment_bytes % MIN_ALIGNMENT == 0 && alignment_bytes > 0);
        let mut header = EntryHeader {
            magic: format.magic,
            checksum: 0,
            alignment_units: (alignment_bytes / MIN_ALIGNMENT) as u8,
            key_length: key.len() as u8,
            value_size,
            transaction_id,
        };
        header.checksum = header.compute_checksum(key, value);
        Entry { address, header }
    }

    /// Total record size `key` and `value` occupy on flash, including the
    /// header and alignment padding.
    pub fn size_for(key: &[u8], value: &[u8], alignment_bytes: usize) -> usize {
        align_up(HEADER_SIZE + key.len() + value.len(), alignment_bytes)
    }

    /// Writes the record (header, key, value, zero padding) at the entry's
    /// address. Returns the number of bytes written.
    pub fn write<P: FlashPartition>(
        &self,
        flash: &mut P,
        key: &[u8],
        value: &[u8],
    ) -> Result<usize, EntryError> {
        debug_assert_eq!(key.len(), self.header.key_length as usize);
        debug_assert_eq!(value.len(), self.header.value_length());

        let mut record = Vec::with_capacity(self.size());
        record.extend_from_slice(&self.header.encode());
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        record.resize(self.size(), 0);

        Ok(flash.write(self.address, &record)?)
    }

    /// Streams the record unchanged (same transaction id and checksum) to
    /// `new_address` and re-pins the entry there. Returns bytes written.
    pub fn copy<P: FlashPartition>(
        &mut self,
        flash: &mut P,
        new_address: u32,
    ) -> Result<usize, EntryError> {
        let mut record = vec![0u8; self.size()];
        flash.read(self.address, &mut record)?;
        let written = flash.write(new_address, &record)?;
        self.address = new_address;
        Ok(written)
    }

    /// Re-reads key and value from flash and recomputes the checksum.
    pub fn verify_checksum_in_flash<P: FlashPartition>(
        &self,
        flash: &P,
    ) -> Result<(), EntryError> {
        let mut key = [0u8; MAX_KEY_LENGTH];
        let key_length = self.read_key(flash, &mut key)?;
        let mut value = vec![0u8; self.header.value_length()];
        self.read_value(flash, &mut value, 0)?;
        self.verify_checksum(&key[..key_length], &value)
    }

    /// Recomputes the checksum over caller-held key and value bytes.
    pub fn verify_checksum(&self, key: &[u8], value: &[u8]) -> Result<(), EntryError> {
        if self.header.compute_checksum(key, value) != self.header.checksum {
            return Err(EntryError::DataLoss("checksum mismatch"));
        }
        Ok(())
    }

    /// Reads the key bytes into `buf` and returns the key length.
    pub fn read_key<P: FlashPartition>(
        &self,
        flash: &P,
        buf: &mut [u8],
    ) -> Result<usize, EntryError> {
        let key_length = self.header.key_length as usize;
        if buf.len() < key_length {
            return Err(EntryError::OutOfRange);
        }
        flash.read(self.address + HEADER_SIZE as u32, &mut buf[..key_length])?;
        Ok(key_length)
    }

    /// Reads value bytes starting at `offset` into `buf`.
    ///
    /// Reads as many bytes as fit; a short buffer yields a short read, and
    /// an offset equal to the value length reads zero bytes. Returns the
    /// number of bytes read.
    pub fn read_value<P: FlashPartition>(
        &self,
        flash: &P,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EntryError> {
        let value_length = self.header.value_length();
        if offset > value_length {
            return Err(EntryError::OutOfRange);
        }
        let len = buf.len().min(value_length - offset);
        if len == 0 {
            return Ok(0);
        }
        let base = self.address + (HEADER_SIZE + self.header.key_length as usize + offset) as u32;
        flash.read(base, &mut buf[..len])?;
        Ok(len)
    }

    /// The cache descriptor for this record.
    pub fn descriptor(&self, key: &[u8]) -> KeyDescriptor {
        KeyDescriptor {
            key_hash: hash_key(key),
            transaction_id: self.header.transaction_id,
            state: self.header.state(),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    /// Aligned size of the record on flash.
    pub fn size(&self) -> usize {
        align_up(
            HEADER_SIZE + self.header.key_length as usize + self.header.value_length(),
            self.header.alignment_bytes(),
        )
    }

    /// First aligned address past this record.
    pub fn next_address(&self) -> u32 {
        self.address + self.size() as u32
    }

    pub fn transaction_id(&self) -> u32 {
        self.header.transaction_id
    }

    pub fn state(&self) -> EntryState {
        self.header.state()
    }

    /// Declared value length; zero for tombstones.
    pub fn value_length(&self) -> usize {
        self.header.value_length()
    }

    pub fn key_length(&self) -> usize {
        self.header.key_length as usize
    }
}
