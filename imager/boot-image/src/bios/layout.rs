//! Pure planning pass for the BIOS image.
//!
//! Everything here is arithmetic over the kernel's segment table; no byte of
//! the output exists until the write pass runs against the finished plan.

use crate::BuildError;
use crate::bios::stage2;
use disk_image::{MbrPartition, sectors_for};
use kernel_image::KernelImage;
use log::debug;

/// BIOS boot images always use 512-byte sectors; INT 13h addressing and the
/// boot signature offset are defined in those terms.
pub(crate) const SECTOR_SIZE: u64 = 512;

/// Low memory holding the IVT, the boot sector, stage-2 and its page tables.
/// No kernel segment may load below this line.
pub(crate) const LOW_MEMORY_RESERVED_END: u64 = 0x10_0000;

/// Stage-2 runs with 4 GiB identity-mapped; segments must stay inside.
pub(crate) const IDENTITY_WINDOW_END: u64 = 0x1_0000_0000;

/// MBR partition tables address sectors with 32 bits.
pub(crate) const MBR_LBA_LIMIT: u64 = 1 << 32;

/// Stage-1 loads stage-2 with a single EDD read, capped at 127 sectors.
const STAGE2_SECTOR_LIMIT: u64 = 127;

/// One kernel segment placed in the image and described to stage-2.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedSegment {
    pub disk_lba: u64,
    pub file_len: u64,
    pub dest: u64,
    pub mem_len: u64,
}

/// Fully computed layout of the BIOS image.
#[derive(Debug)]
pub(crate) struct BiosLayout {
    pub stage2_lba: u64,
    pub stage2_sectors: u64,
    pub segments: Vec<PlannedSegment>,
    pub total_sectors: u64,
    pub partition: MbrPartition,
}

impl BiosLayout {
    /// Compute all offsets and sizes for `kernel`.
    ///
    /// # Errors
    ///
    /// [`BuildError::ImageTooLarge`] when the memory footprint or the laid
    /// out image exceeds 32-bit sector addressing,
    /// [`BuildError::SegmentOverlapsReservedRegion`] and
    /// [`BuildError::SegmentAboveIdentityWindow`] for destinations stage-2
    /// cannot safely service.
    pub(crate) fn plan(kernel: &KernelImage) -> Result<Self, BuildError> {
        // The declared footprint alone can disqualify the kernel before any
        // buffer is allocated.
        let footprint_sectors = sectors_for(kernel.memory_footprint(), SECTOR_SIZE);
        if footprint_sectors >= MBR_LBA_LIMIT {
            return Err(BuildError::ImageTooLarge {
                sectors: footprint_sectors,
                max: MBR_LBA_LIMIT - 1,
            });
        }

        for segment in kernel.segments() {
            if segment.vaddr < LOW_MEMORY_RESERVED_END {
                return Err(BuildError::SegmentOverlapsReservedRegion {
                    vaddr: segment.vaddr,
                    reserved_end: LOW_MEMORY_RESERVED_END,
                });
            }
            if segment.vaddr_end() > IDENTITY_WINDOW_END {
                return Err(BuildError::SegmentAboveIdentityWindow {
                    vaddr: segment.vaddr,
                });
            }
        }

        let stage2_len = stage2::blob_len(kernel.segments().len());
        let stage2_sectors = sectors_for(stage2_len, SECTOR_SIZE);
        if stage2_sectors > STAGE2_SECTOR_LIMIT {
            return Err(BuildError::ImageTooLarge {
                sectors: stage2_sectors,
                max: STAGE2_SECTOR_LIMIT,
            });
        }

        let stage2_lba = 1;
        let mut cursor = stage2_lba + stage2_sectors;
        let mut segments = Vec::with_capacity(kernel.segments().len());
        for segment in kernel.segments() {
            segments.push(PlannedSegment {
                disk_lba: cursor,
                file_len: segment.file_size,
                dest: segment.vaddr,
                mem_len: segment.mem_size,
            });
            cursor += sectors_for(segment.file_size, SECTOR_SIZE);
        }

        let total_sectors = cursor;
        if total_sectors >= MBR_LBA_LIMIT {
            return Err(BuildError::ImageTooLarge {
                sectors: total_sectors,
                max: MBR_LBA_LIMIT - 1,
            });
        }

        debug!(
            "bios layout: stage2 {stage2_sectors} sectors, payload from LBA {}, {total_sectors} sectors total",
            stage2_lba + stage2_sectors
        );

        #[allow(clippy::cast_possible_truncation)]
        // total_sectors < 2^32 was checked above.
        let partition = MbrPartition {
            bootable: true,
            // Private/experimental type byte: the partition is a raw
            // loader-and-payload blob, not a real filesystem.
            type_byte: 0x7F,
            start_lba: stage2_lba as u32,
            sectors: (total_sectors - stage2_lba) as u32,
        };

        Ok(Self {
            stage2_lba,
            stage2_sectors,
            segments,
            total_sectors,
            partition,
        })
    }
}
