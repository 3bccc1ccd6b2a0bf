//! # Disk Image Writer
//!
//! The low-level primitive shared by both image assemblers: a byte store of
//! a pre-computed size, offset-addressed checked writes, and guarded
//! finalization to a file.
//!
//! The writer enforces the planning/writing split: the store is allocated
//! once at its final size, every write is validated against that size (a
//! violation is a planning defect, never silently truncated), and the file
//! on disk either receives the complete image or is removed again.

mod mbr;
mod writer;

pub use mbr::{BOOT_SIGNATURE, MAX_PRIMARY_PARTITIONS, MbrPartition, write_partition_table};
pub use writer::DiskImage;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DiskImageError {
    #[error("write of {len:#x} bytes at offset {offset:#x} exceeds image length {image_len:#x}")]
    WriteOutOfBounds {
        offset: u64,
        len: u64,
        image_len: u64,
    },
    #[error("image length {len:#x} exceeds addressable memory")]
    LengthOverflow { len: u64 },
    #[error("an MBR partition table holds at most four primary entries, got {count}")]
    TooManyPartitions { count: usize },
    #[error("failed to write disk image {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Round `x` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + (align - 1)) & !(align - 1)
}

/// Number of whole sectors needed to hold `len` bytes.
#[inline]
#[must_use]
pub const fn sectors_for(len: u64, sector_size: u64) -> u64 {
    align_up(len, sector_size) / sector_size
}
