//! # BIOS Image Assembler
//!
//! Produces a raw MBR-partitioned image bootable through legacy BIOS
//! INT 19h: boot sector at LBA 0, stage-2 loader in the sectors after it,
//! kernel payload behind that, all covered by one bootable primary
//! partition entry.

mod layout;
mod stage1;
mod stage2;

use crate::{BuildConfig, BuildError};
use disk_image::{DiskImage, write_partition_table};
use kernel_image::KernelImage;
use layout::BiosLayout;
use log::{debug, info};
use std::path::Path;

/// Create a BIOS boot image for a parsed kernel.
pub struct BiosBoot<'a> {
    kernel: &'a KernelImage,
    config: BuildConfig,
}

impl<'a> BiosBoot<'a> {
    #[must_use]
    pub fn new(kernel: &'a KernelImage) -> Self {
        Self {
            kernel,
            config: BuildConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Plan the layout, assemble the image, finalize it at `path`.
    ///
    /// # Errors
    ///
    /// Planning errors surface before any byte is written; I/O errors
    /// during finalization remove the partial file.
    pub fn create_disk_image(&self, path: &Path) -> Result<(), BuildError> {
        if u64::from(self.config.sector_size) != layout::SECTOR_SIZE {
            // INT 13h boot assumes 512-byte sectors; 4Kn disks boot via UEFI.
            return Err(BuildError::UnsupportedSectorSize {
                sector_size: self.config.sector_size,
            });
        }

        let plan = BiosLayout::plan(self.kernel)?;

        let mut image = DiskImage::new(
            plan.total_sectors * layout::SECTOR_SIZE,
            self.config.sector_size,
        )?;

        #[allow(clippy::cast_possible_truncation)]
        // stage2_sectors <= 127, enforced by the planner.
        let boot_sector = stage1::build(plan.stage2_lba, plan.stage2_sectors as u16);
        image.write_lba(0, &boot_sector)?;
        write_partition_table(&mut image, &[plan.partition])?;

        let stage2_blob = stage2::build(self.kernel.entry(), &plan.segments);
        debug!(
            "stage-2: {} bytes at LBA {}, handoff table at {:#x}",
            stage2_blob.len(),
            plan.stage2_lba,
            stage2::HANDOFF_TABLE_ADDR
        );
        image.write_lba(plan.stage2_lba, &stage2_blob)?;

        for (planned, segment) in plan.segments.iter().zip(self.kernel.segments()) {
            image.write_lba(planned.disk_lba, self.kernel.segment_bytes(segment))?;
        }

        image.finalize(path)?;
        info!(
            "bios image: {} ({} sectors, {} segments)",
            path.display(),
            plan.total_sectors,
            plan.segments.len()
        );
        Ok(())
    }
}
