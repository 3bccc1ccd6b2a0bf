//! # mkboot
//!
//! Turns a freestanding kernel executable into self-booting disk images:
//! one for legacy BIOS firmware, one for UEFI firmware. The kernel is
//! parsed once; the two assemblers run on independent threads against
//! separate output files, so one target failing never corrupts the other.

mod logger;

use boot_image::{BiosBoot, BootTarget, BuildConfig, BuildError, FatVariant, UefiBoot};
use clap::Parser;
use kernel_image::KernelImage;
use log::{LevelFilter, error, info};
use logger::StderrLogger;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, thread};

#[derive(Parser)]
#[command(name = "mkboot")]
#[command(about = "Build BIOS- and UEFI-bootable disk images from a kernel executable")]
struct Args {
    /// Kernel executable (ELF64, x86-64).
    kernel: PathBuf,

    /// Directory the images are written into.
    out_dir: PathBuf,

    /// Build only the legacy BIOS image.
    #[arg(long, conflicts_with = "uefi_only")]
    bios_only: bool,

    /// Build only the UEFI image.
    #[arg(long)]
    uefi_only: bool,

    /// EFI system partition size floor in bytes.
    #[arg(long, value_name = "BYTES")]
    min_esp_size: Option<u64>,

    /// Logical sector size (512 or 4096).
    #[arg(long, default_value_t = 512)]
    sector_size: u32,

    /// Pin the ESP's FAT variant instead of auto-selecting it.
    #[arg(long = "fat", value_parser = parse_fat_variant, value_name = "12|16|32")]
    fat_variant: Option<FatVariant>,

    /// More log output; repeat for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn parse_fat_variant(value: &str) -> Result<FatVariant, String> {
    match value {
        "12" => Ok(FatVariant::Fat12),
        "16" => Ok(FatVariant::Fat16),
        "32" => Ok(FatVariant::Fat32),
        other => Err(format!("unknown FAT variant {other}, expected 12, 16 or 32")),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.quiet {
        LevelFilter::Error
    } else {
        match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    if StderrLogger::new(level).init().is_err() {
        eprintln!("logger already installed");
        return ExitCode::FAILURE;
    }

    let mut config = BuildConfig {
        sector_size: args.sector_size,
        fat_variant_override: args.fat_variant,
        ..BuildConfig::default()
    };
    if let Some(floor) = args.min_esp_size {
        config.min_esp_size = floor;
    }

    // An invalid kernel fails every target before any thread spawns.
    let kernel = match load_kernel(&args.kernel) {
        Ok(kernel) => kernel,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let targets: &[BootTarget] = if args.bios_only {
        &[BootTarget::Bios]
    } else if args.uefi_only {
        &[BootTarget::Uefi]
    } else {
        &[BootTarget::Bios, BootTarget::Uefi]
    };

    let stem = args
        .kernel
        .file_stem()
        .map_or_else(|| "kernel".into(), |s| s.to_string_lossy().into_owned());

    // The assemblers share only the read-only kernel view; each owns its
    // output file, so they run as plain scoped threads.
    let mut failed = false;
    thread::scope(|scope| {
        let handles: Vec<_> = targets
            .iter()
            .map(|&target| {
                let kernel = &kernel;
                let out = image_path(&args.out_dir, &stem, target);
                scope.spawn(move || (target, build_target(target, kernel, config, &out)))
            })
            .collect();

        for handle in handles {
            let Ok((target, result)) = handle.join() else {
                error!("a build thread panicked");
                failed = true;
                continue;
            };
            if let Err(err) = result {
                error!("{target} image failed: {err}");
                failed = true;
            }
        }
    });

    if failed {
        ExitCode::FAILURE
    } else {
        info!("all images built");
        ExitCode::SUCCESS
    }
}

fn load_kernel(path: &Path) -> Result<KernelImage, String> {
    let bytes =
        fs::read(path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    KernelImage::load(bytes).map_err(|err| format!("{}: {err}", path.display()))
}

fn image_path(out_dir: &Path, stem: &str, target: BootTarget) -> PathBuf {
    out_dir.join(format!("{stem}-{target}.img"))
}

fn build_target(
    target: BootTarget,
    kernel: &KernelImage,
    config: BuildConfig,
    out: &Path,
) -> Result<(), BuildError> {
    match target {
        BootTarget::Bios => BiosBoot::new(kernel).with_config(config).create_disk_image(out),
        BootTarget::Uefi => UefiBoot::new(kernel).with_config(config).create_disk_image(out),
    }
}
