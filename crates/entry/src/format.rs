//! Record format constants, header encode/decode, and the recognized
//! format set.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::hash::Hasher;

use flash::FlashError;
use thiserror::Error;

/// Magic identifying the primary record format ("EKV1").
pub const ENTRY_MAGIC: u32 = 0x454B_5631;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Minimum record alignment; entries always begin at multiples of this.
pub const MIN_ALIGNMENT: usize = 16;

/// Longest accepted key.
pub const MAX_KEY_LENGTH: usize = 64;

/// `value_size` sentinel marking a deleted (tombstone) record.
pub const TOMBSTONE_SENTINEL: u16 = 0xFFFF;

/// Errors from decoding or transferring a record.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The bytes at the address are in the erased state (end of log).
    #[error("no entry at address")]
    NotFound,
    /// The record is unreadable: unknown magic, impossible lengths, or a
    /// checksum mismatch.
    #[error("entry corrupt: {0}")]
    DataLoss(&'static str),
    /// Read offset past the declared value size.
    #[error("read offset out of range")]
    OutOfRange,
    #[error("key longer than {MAX_KEY_LENGTH} bytes")]
    KeyTooLong,
    #[error(transparent)]
    Flash(#[from] FlashError),
}

/// Whether a record stores a live value or a deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Valid,
    Deleted,
}

/// One recognized record format.
///
/// Formats only differ by magic today; keeping the set open-ended lets a
/// store read records written before a format upgrade while emitting only
/// the primary magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFormat {
    pub magic: u32,
}

/// The ordered set of formats a store recognizes. The first is primary:
/// new records are written with its magic; all others are decoded only.
#[derive(Debug, Clone)]
pub struct FormatSet {
    formats: Vec<EntryFormat>,
}

impl FormatSet {
    pub fn new(primary: EntryFormat) -> Self {
        Self {
            formats: vec![primary],
        }
    }

    /// Adds a legacy magic that will be decoded but never written.
    pub fn recognize(mut self, legacy: EntryFormat) -> Self {
        self.formats.push(legacy);
        self
    }

    pub fn primary(&self) -> EntryFormat {
        self.formats[0]
    }

    pub fn known(&self, magic: u32) -> bool {
        self.formats.iter().any(|f| f.magic == magic)
    }
}

impl Default for FormatSet {
    fn default() -> Self {
        Self::new(EntryFormat { magic: ENTRY_MAGIC })
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: u32,
    pub checksum: u32,
    /// Record alignment in units of [`MIN_ALIGNMENT`].
    pub alignment_units: u8,
    pub key_length: u8,
    /// Value length, or [`TOMBSTONE_SENTINEL`].
    pub value_size: u16,
    pub transaction_id: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.write_u8(self.alignment_units).unwrap();
        buf.write_u8(self.key_length).unwrap();
        buf.write_u16::<LittleEndian>(self.value_size).unwrap();
        buf.write_u32::<LittleEndian>(self.transaction_id).unwrap();
        buf.try_into().unwrap()
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut r = &bytes[..];
        Self {
            magic: r.read_u32::<LittleEndian>().unwrap(),
            checksum: r.read_u32::<LittleEndian>().unwrap(),
            alignment_units: r.read_u8().unwrap(),
            key_length: r.read_u8().unwrap(),
            value_size: r.read_u16::<LittleEndian>().unwrap(),
            transaction_id: r.read_u32::<LittleEndian>().unwrap(),
        }
    }

    pub fn state(&self) -> EntryState {
        if self.value_size == TOMBSTONE_SENTINEL {
            EntryState::Deleted
        } else {
            EntryState::Valid
        }
    }

    /// Value length in bytes; zero for tombstones.
    pub fn value_length(&self) -> usize {
        match self.state() {
            EntryState::Valid => self.value_size as usize,
            EntryState::Deleted => 0,
        }
    }

    /// Record alignment in bytes.
    pub fn alignment_bytes(&self) -> usize {
        self.alignment_units as usize * MIN_ALIGNMENT
    }

    /// CRC-32 over the header (checksum field zeroed), key, and value.
    pub fn compute_checksum(&self, key: &[u8], value: &[u8]) -> u32 {
        let mut zeroed = *self;
        zeroed.checksum = 0;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&zeroed.encode());
        hasher.update(key);
        hasher.update(value);
        hasher.finalize()
    }
}

/// In-memory identity of the newest version of a key: its fingerprint,
/// transaction id, and live/deleted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_hash: u32,
    pub transaction_id: u32,
    pub state: EntryState,
}

/// 32-bit key fingerprint: FNV-1 folded from 64 to 32 bits.
///
/// Not collision-free; lookups confirm candidates against the key bytes
/// stored in flash.
pub fn hash_key(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    let h = hasher.finish();
    h as u32 ^ (h >> 32) as u32
}

/// Wrap-safe transaction-id ordering: `a` is newer than `b` iff the
/// modular difference `a - b` lies in the lower half of the 32-bit ring.
pub fn newer_than(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------- header roundtrip --------------------

    #[test]
    fn header_encode_decode_roundtrip() {
        let header = EntryHeader {
            magic: ENTRY_MAGIC,
            checksum: 0xDEAD_BEEF,
            alignment_units: 2,
            key_length: 9,
            value_size: 300,
            transaction_id: 77,
        };
        assert_eq!(EntryHeader::decode(&header.encode()), header);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = EntryHeader {
            magic: 0x0403_0201,
            checksum: 0x0807_0605,
            alignment_units: 1,
            key_length: 2,
            value_size: 0x0A09,
            transaction_id: 0x0E0D_0C0B,
        };
        assert_eq!(
            header.encode(),
            [1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 9, 10, 11, 12, 13, 14]
        );
    }

    #[test]
    fn tombstone_state_from_sentinel() {
        let mut header = EntryHeader {
            magic: ENTRY_MAGIC,
            checksum: 0,
            alignment_units: 1,
            key_length: 1,
            value_size: TOMBSTONE_SENTINEL,
            transaction_id: 1,
        };
        assert_eq!(header.state(), EntryState::Deleted);
        assert_eq!(header.value_length(), 0);

        header.value_size = 0;
        assert_eq!(header.state(), EntryState::Valid);
    }

    // -------------------- checksum --------------------

    #[test]
    fn checksum_ignores_own_field() {
        let mut a = EntryHeader {
            magic: ENTRY_MAGIC,
            checksum: 0,
            alignment_units: 1,
            key_length: 3,
            value_size: 5,
            transaction_id: 9,
        };
        let sum = a.compute_checksum(b"key", b"value");
        a.checksum = sum;
        // Recomputing with the field populated yields the same digest.
        assert_eq!(a.compute_checksum(b"key", b"value"), sum);
    }

    #[test]
    fn checksum_covers_key_and_value() {
        let header = EntryHeader {
            magic: ENTRY_MAGIC,
            checksum: 0,
            alignment_units: 1,
            key_length: 3,
            value_size: 5,
            transaction_id: 9,
        };
        let sum = header.compute_checksum(b"key", b"value");
        assert_ne!(header.compute_checksum(b"kez", b"value"), sum);
        assert_ne!(header.compute_checksum(b"key", b"valuf"), sum);
    }

    // -------------------- format set --------------------

    #[test]
    fn format_set_primary_and_legacy() {
        let set = FormatSet::default().recognize(EntryFormat { magic: 0x1111_2222 });
        assert_eq!(set.primary().magic, ENTRY_MAGIC);
        assert!(set.known(ENTRY_MAGIC));
        assert!(set.known(0x1111_2222));
        assert!(!set.known(0x3333_4444));
    }

    // -------------------- hash / ordering --------------------

    #[test]
    fn hash_key_is_stable_and_spreads() {
        assert_eq!(hash_key(b"wifi_ssid"), hash_key(b"wifi_ssid"));
        assert_ne!(hash_key(b"wifi_ssid"), hash_key(b"wifi_pass"));
    }

    #[test]
    fn newer_than_is_wrap_safe() {
        assert!(newer_than(2, 1));
        assert!(!newer_than(1, 2));
        assert!(!newer_than(7, 7));
        // Across the 32-bit boundary the successor is still newer.
        assert!(newer_than(0, u32::MAX));
        assert!(newer_than(5, u32::MAX - 5));
        assert!(!newer_than(u32::MAX, 0));
    }
}
