//! # Store
//!
//! The EmberKV storage engine: a persistent key-value dictionary over a
//! flash partition of fixed-size erasable sectors.
//!
//! Records are appended to per-sector logs; the newest version of each
//! key wins by transaction id. An in-memory index ([`keycache`]) gives
//! O(1) lookups and a sector table ([`sectors`]) gives O(sectors) space
//! and garbage-collection decisions, so no operation rescans flash after
//! [`Store::init`]. Each live key is kept as `R` copies in distinct
//! sectors, and the write, relocation, and repair paths preserve "at
//! least one copy survives" across a power loss at any step.
//!
//! ```
//! use flash::MemFlash;
//! use store::{Store, StoreConfig};
//!
//! let flash = MemFlash::new(4, 4096);
//! let mut store = Store::new(flash, Default::default(), StoreConfig::default()).unwrap();
//! store.init().unwrap();
//!
//! store.put(b"wifi_ssid", b"homenet").unwrap();
//! let mut buf = [0u8; 32];
//! let n = store.get(b"wifi_ssid", &mut buf, 0).unwrap();
//! assert_eq!(&buf[..n], b"homenet");
//! ```

mod config;
mod engine;
mod error;
mod keycache;
mod sectors;

pub use config::{ErrorRecovery, GcOnWrite, StoreConfig};
pub use engine::{StorageStats, Store, StoreItem, StoreIter, StoreState};
pub use entry::{EntryFormat, FormatSet};
pub use error::{Result, StoreError};
pub use keycache::{CacheFull, KeyCache, KeyMetadata};
pub use sectors::{SectorDescriptor, SectorTable};
