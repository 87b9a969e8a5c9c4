//! Store construction options.

/// Whether the store may run [`repair`](crate::Store::repair) on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Never repair automatically; the caller invokes `repair` itself.
    Manual,
    /// Repair during init, garbage collection, and maintenance.
    Lazy,
    /// Like `Lazy`, and additionally repair as soon as a mutating
    /// operation latches a new error.
    Eager,
}

/// Whether a write that finds no space may trigger garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOnWrite {
    /// Never; the write fails with `ResourceExhausted`.
    Disabled,
    /// Reclaim at most one sector per write.
    OneSector,
    /// Keep reclaiming until the write fits or nothing is reclaimable.
    AsNeeded,
}

/// Options fixed at store construction.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of on-flash copies kept per live key (R >= 1). Copies of one
    /// entry are always placed in distinct sectors.
    pub redundancy: usize,
    /// Entry-cache capacity: the maximum number of unique keys.
    pub max_entries: usize,
    pub recovery: ErrorRecovery,
    pub gc_on_write: GcOnWrite,
    /// Re-read and checksum-verify every record right after appending it.
    pub verify_on_write: bool,
    /// Recompute the checksum on full-value reads.
    pub verify_on_read: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redundancy: 1,
            max_entries: 256,
            recovery: ErrorRecovery::Lazy,
            gc_on_write: GcOnWrite::AsNeeded,
            verify_on_write: true,
            verify_on_read: true,
        }
    }
}
