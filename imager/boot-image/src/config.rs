use crate::BuildError;
use core::fmt;

/// Which firmware the produced image targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    Bios,
    Uefi,
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bios => f.write_str("bios"),
            Self::Uefi => f.write_str("uefi"),
        }
    }
}

/// FAT table width of the EFI system partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    /// Numeric suffix, for log lines and the BPB filesystem-type label.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Fat12 => 12,
            Self::Fat16 => 16,
            Self::Fat32 => 32,
        }
    }
}

impl fmt::Display for FatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAT{}", self.bits())
    }
}

/// Per-invocation build parameters.
///
/// Passed into each assembler explicitly; there is no process-wide build
/// state shared between the two boot targets.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// Size floor for the EFI system partition, in bytes. Firmware is more
    /// reliable with a partition that is not comically small; content larger
    /// than the floor grows the partition past it.
    pub min_esp_size: u64,
    /// Logical sector size of the produced images. 512 or 4096.
    pub sector_size: u32,
    /// Pin the FAT variant instead of selecting it from the cluster count.
    pub fat_variant_override: Option<FatVariant>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            min_esp_size: 1024 * 1024,
            sector_size: 512,
            fat_variant_override: None,
        }
    }
}

impl BuildConfig {
    /// Check the parameters shared by both assemblers.
    ///
    /// # Errors
    ///
    /// [`BuildError::UnsupportedSectorSize`] for anything but 512 or 4096.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.sector_size != 512 && self.sector_size != 4096 {
            return Err(BuildError::UnsupportedSectorSize {
                sector_size: self.sector_size,
            });
        }
        Ok(())
    }
}
