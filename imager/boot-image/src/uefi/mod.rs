//! # UEFI Image Assembler
//!
//! Produces a raw GPT-partitioned image with a single FAT-formatted EFI
//! system partition holding the synthesized UEFI application and the kernel
//! executable. Firmware auto-discovers `\EFI\BOOT\BOOTX64.EFI`; the stub
//! loads `\EFI\BOOT\KERNEL.ELF` from the same volume.

mod fat;
mod gpt;
mod stub;

use crate::{BuildConfig, BuildError};
use disk_image::{DiskImage, MbrPartition, align_up, write_partition_table};
use gpt::GptLayout;
use kernel_image::KernelImage;
use log::info;
use std::path::Path;

/// Create a UEFI boot image for a parsed kernel.
pub struct UefiBoot<'a> {
    kernel: &'a KernelImage,
    config: BuildConfig,
}

impl<'a> UefiBoot<'a> {
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

    /// Plan the ESP and GPT layout, assemble the image, finalize it at
    /// `path`.
    ///
    /// # Errors
    ///
    /// Configuration and sizing errors surface before any byte is written;
    /// I/O errors during finalization remove the partial file.
    pub fn create_disk_image(&self, path: &Path) -> Result<(), BuildError> {
        self.config.validate()?;
        let sector_size = u64::from(self.config.sector_size);

        let stub = stub::build();

        // The partition starts on a 1 MiB boundary, which also clears the
        // primary GPT structures at the front of the disk.
        let partition_start = align_up(1024 * 1024, sector_size) / sector_size;
        #[allow(clippy::cast_possible_truncation)]
        let esp = fat::build_esp(
            &stub,
            self.kernel.as_bytes(),
            &self.config,
            partition_start as u32,
        )?;

        let esp_sectors = esp.bytes.len() as u64 / sector_size;
        let partition_end = partition_start + esp_sectors - 1;

        let layout = {
            // Backup entry array plus backup header close out the disk.
            let probe = GptLayout {
                sector_size,
                total_sectors: 0,
                partition_start,
                partition_end,
            };
            GptLayout {
                total_sectors: partition_end + 1 + probe.entry_array_sectors() + 1,
                ..probe
            }
        };

        let mut image = DiskImage::new(
            layout.total_sectors * sector_size,
            self.config.sector_size,
        )?;

        // Protective MBR keeps legacy tooling from treating the disk as free.
        #[allow(clippy::cast_possible_truncation)]
        let protective_sectors = (layout.total_sectors - 1).min(u64::from(u32::MAX)) as u32;
        write_partition_table(
            &mut image,
            &[MbrPartition {
                bootable: false,
                type_byte: 0xEE,
                start_lba: 1,
                sectors: protective_sectors,
            }],
        )?;

        gpt::write_tables(&mut image, &layout)?;
        image.write_lba(partition_start, &esp.bytes)?;

        image.finalize(path)?;
        info!(
            "uefi image: {} ({} sectors, {} ESP, {} clusters)",
            path.display(),
            layout.total_sectors,
            esp.variant,
            esp.cluster_count
        );
        Ok(())
    }
}
