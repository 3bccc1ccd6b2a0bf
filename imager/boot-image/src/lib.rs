//! # Bootable Image Construction
//!
//! Turns a parsed [`kernel_image::KernelImage`] into standalone, self-booting
//! raw disk images: one for legacy BIOS firmware, one for UEFI firmware.
//!
//! Both assemblers are strict two-pass constructions. A pure planning pass
//! computes every region offset and size up front (no I/O, no allocation of
//! the output store); the write pass then performs only offset-addressed
//! writes into a [`disk_image::DiskImage`] and finalizes it to a file. The
//! two assemblers share nothing but the read-only kernel view and may run
//! concurrently against separate output files.
//!
//! ```no_run
//! use boot_image::{BiosBoot, UefiBoot};
//! use kernel_image::KernelImage;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = KernelImage::load(std::fs::read("kernel.elf")?)?;
//! BiosBoot::new(&kernel).create_disk_image("boot-bios.img".as_ref())?;
//! UefiBoot::new(&kernel).create_disk_image("boot-uefi.img".as_ref())?;
//! # Ok(())
//! # }
//! ```

mod bios;
mod config;
mod error;
mod uefi;

pub use bios::BiosBoot;
pub use config::{BootTarget, BuildConfig, FatVariant};
pub use error::BuildError;
pub use uefi::UefiBoot;
