use disk_image::DiskImageError;
use kernel_image::KernelImageError;

/// Failure taxonomy of the image assemblers.
///
/// Input errors ([`Kernel`](Self::Kernel)) and capacity errors
/// ([`ImageTooLarge`](Self::ImageTooLarge), [`EspTooSmall`](Self::EspTooSmall),
/// [`ClusterAllocationExhausted`](Self::ClusterAllocationExhausted)) carry
/// the offending addresses and limits so the caller can act on them.
/// [`Disk`](Self::Disk) covers both destination I/O failures and the
/// out-of-bounds tripwire that marks an internal planning defect.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Kernel(#[from] KernelImageError),
    #[error(transparent)]
    Disk(#[from] DiskImageError),
    #[error("unsupported sector size {sector_size}, expected 512 or 4096")]
    UnsupportedSectorSize { sector_size: u32 },
    #[error("image spans {sectors} sectors, beyond the addressing limit of {max}")]
    ImageTooLarge { sectors: u64, max: u64 },
    #[error(
        "segment at {vaddr:#x} overlaps the reserved boot region below {reserved_end:#x}"
    )]
    SegmentOverlapsReservedRegion { vaddr: u64, reserved_end: u64 },
    #[error(
        "segment at {vaddr:#x} lies above the 4 GiB window reachable by the stage-2 loader"
    )]
    SegmentAboveIdentityWindow { vaddr: u64 },
    #[error(
        "EFI system partition cannot hold {required_clusters} clusters under {variant}, \
         which addresses at most {ceiling}"
    )]
    EspTooSmall {
        variant: crate::FatVariant,
        required_clusters: u64,
        ceiling: u64,
    },
    #[error("cluster allocation exhausted: need {needed} clusters, {available} available")]
    ClusterAllocationExhausted { needed: u64, available: u64 },
}
