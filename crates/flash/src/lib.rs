//! # Flash
//!
//! The flash partition abstraction for the EmberKV storage engine.
//!
//! A partition is a span of raw NOR/NAND flash divided into fixed-size
//! sectors. Reads may cover arbitrary in-range byte spans; writes must be
//! aligned to the partition's minimum write granularity; erases operate on
//! whole sectors and leave them reading back as `0xFF`.
//!
//! Two partitions are provided:
//! - [`MemFlash`] — RAM-backed, with fault-injection hooks for tests.
//! - [`FileFlash`] — a flash image stored in a regular file.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Byte value of erased flash cells.
pub const ERASED_BYTE: u8 = 0xFF;

/// Errors reported by a flash partition.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("access at {address:#x}+{len} outside partition")]
    OutOfRange { address: u32, len: usize },
    #[error("unaligned write at {address:#x} (alignment {alignment})")]
    Misaligned { address: u32, alignment: usize },
    #[error("flash io error: {0}")]
    Io(#[from] io::Error),
    #[error("simulated write failure")]
    WriteFault,
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// A partition of sector-erasable flash.
///
/// Writes to bytes that are not in the erased state have an undefined
/// result at the device level; callers are expected to append only into
/// erased space and reclaim by erasing whole sectors.
pub trait FlashPartition {
    /// Size of one erase unit in bytes.
    fn sector_size(&self) -> usize;

    /// Number of sectors in the partition.
    fn sector_count(&self) -> usize;

    /// Minimum write granularity in bytes (a power of two).
    fn alignment(&self) -> usize;

    /// Total partition size in bytes.
    fn size(&self) -> usize {
        self.sector_size() * self.sector_count()
    }

    /// Reads `buf.len()` bytes starting at `address`. Reads may span any
    /// in-range byte span. Returns the number of bytes read.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<usize, FlashError>;

    /// Writes `data` at `address`. Address and length must be multiples of
    /// [`alignment`](FlashPartition::alignment). Returns the number of bytes
    /// actually written, which is less than `data.len()` on a failed or
    /// interrupted write.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<usize, FlashError>;

    /// Erases `count` sectors starting at `first_sector`. After success the
    /// erased span reads back as [`ERASED_BYTE`].
    fn erase(&mut self, first_sector: usize, count: usize) -> Result<(), FlashError>;
}

fn check_range(size: usize, address: u32, len: usize) -> Result<(), FlashError> {
    let end = address as usize + len;
    if end > size {
        return Err(FlashError::OutOfRange { address, len });
    }
    Ok(())
}

fn check_write_alignment(address: u32, len: usize, alignment: usize) -> Result<(), FlashError> {
    if address as usize % alignment != 0 || len % alignment != 0 {
        return Err(FlashError::Misaligned { address, alignment });
    }
    Ok(())
}

// =============================================================================
// MemFlash
// =============================================================================

/// A RAM-backed flash partition.
///
/// Used by tests and benchmarks. Besides the plain [`FlashPartition`]
/// contract it offers fault injection: [`corrupt`](MemFlash::corrupt)
/// overwrites a byte span to fake a torn or bit-rotted record, and
/// [`fail_next_write`](MemFlash::fail_next_write) makes the next write
/// report failure after writing only its first alignment unit.
#[derive(Debug)]
pub struct MemFlash {
    data: Vec<u8>,
    sector_size: usize,
    alignment: usize,
    fail_next_write: bool,
}

impl MemFlash {
    /// Creates an erased partition of `sector_count` x `sector_size` bytes
    /// with a 16-byte write alignment.
    pub fn new(sector_count: usize, sector_size: usize) -> Self {
        Self::with_alignment(sector_count, sector_size, 16)
    }

    /// Creates an erased partition with an explicit write alignment.
    pub fn with_alignment(sector_count: usize, sector_size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(sector_size % alignment == 0);
        Self {
            data: vec![ERASED_BYTE; sector_count * sector_size],
            sector_size,
            alignment,
            fail_next_write: false,
        }
    }

    /// Overwrites `len` bytes at `address` with zeros, ignoring alignment.
    ///
    /// Simulates the after-effect of a power loss mid-write or of failing
    /// cells; the span will no longer checksum.
    pub fn corrupt(&mut self, address: u32, len: usize) {
        let start = address as usize;
        let end = (start + len).min(self.data.len());
        self.data[start..end].fill(0);
    }

    /// Arms a one-shot fault: the next `write` stores only its first
    /// alignment unit and then reports [`FlashError::WriteFault`].
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    /// Raw view of the partition contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl FlashPartition for MemFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.data.len() / self.sector_size
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<usize, FlashError> {
        check_range(self.data.len(), address, buf.len())?;
        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<usize, FlashError> {
        check_range(self.data.len(), address, data.len())?;
        check_write_alignment(address, data.len(), self.alignment)?;
        let start = address as usize;

        if self.fail_next_write {
            self.fail_next_write = false;
            let partial = self.alignment.min(data.len());
            self.data[start..start + partial].copy_from_slice(&data[..partial]);
            return Err(FlashError::WriteFault);
        }

        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn erase(&mut self, first_sector: usize, count: usize) -> Result<(), FlashError> {
        let start = first_sector * self.sector_size;
        let len = count * self.sector_size;
        check_range(self.data.len(), start as u32, len)?;
        self.data[start..start + len].fill(ERASED_BYTE);
        Ok(())
    }
}

// =============================================================================
// FileFlash
// =============================================================================

/// A flash partition stored as an image in a regular file.
///
/// On creation the image is filled with the erased pattern. An existing
/// image is reused as-is when its size matches the requested geometry.
#[derive(Debug)]
pub struct FileFlash {
    file: std::fs::File,
    sector_size: usize,
    sector_count: usize,
    alignment: usize,
}

impl FileFlash {
    /// Opens `path` as a flash image, creating and erasing it if it does
    /// not exist. An existing file of the wrong size is rejected.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        sector_count: usize,
        sector_size: usize,
    ) -> Result<Self, FlashError> {
        let size = sector_count * sector_size;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            file.write_all(&vec![ERASED_BYTE; size])?;
            file.sync_all()?;
        } else if len != size {
            return Err(FlashError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("image is {len} bytes, geometry requires {size}"),
            )));
        }

        Ok(Self {
            file,
            sector_size,
            sector_count,
            alignment: 16,
        })
    }
}

impl FlashPartition for FileFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<usize, FlashError> {
        check_range(self.size(), address, buf.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(address as u64))?;
        file.read_exact(buf)?;
        Ok(buf.len())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<usize, FlashError> {
        check_range(self.size(), address, data.len())?;
        check_write_alignment(address, data.len(), self.alignment)?;
        self.file.seek(SeekFrom::Start(address as u64))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(data.len())
    }

    fn erase(&mut self, first_sector: usize, count: usize) -> Result<(), FlashError> {
        let start = first_sector * self.sector_size;
        let len = count * self.sector_size;
        check_range(self.size(), start as u32, len)?;
        self.file.seek(SeekFrom::Start(start as u64))?;
        self.file.write_all(&vec![ERASED_BYTE; len])?;
        self.file.sync_data()?;
        Ok(())
    }
}
