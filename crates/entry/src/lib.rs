//! # Entry
//!
//! The on-flash record format and codec for the EmberKV storage engine.
//!
//! Every durable write is one self-describing record:
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ HEADER (16 bytes, little-endian)                   │
//! │                                                    │
//! │ magic (u32) | checksum (u32) | align_units (u8)    │
//! │ key_len (u8) | value_size (u16) | txn_id (u32)     │
//! ├────────────────────────────────────────────────────┤
//! │ key bytes (1..=64)                                 │
//! ├────────────────────────────────────────────────────┤
//! │ value bytes (absent for tombstones)                │
//! ├────────────────────────────────────────────────────┤
//! │ zero padding to align_units * 16                   │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! A `value_size` of `0xFFFF` marks a tombstone. The checksum is a CRC-32
//! over the header (with the checksum field itself zeroed) followed by the
//! key and value bytes. Reading the erased pattern where a magic should be
//! signals the end of a sector's log.

mod codec;
mod format;

pub use codec::Entry;
pub use format::{
    hash_key, newer_than, EntryError, EntryFormat, EntryHeader, EntryState, FormatSet,
    KeyDescriptor, ENTRY_MAGIC, HEADER_SIZE, MAX_KEY_LENGTH, MIN_ALIGNMENT, TOMBSTONE_SENTINEL,
};
