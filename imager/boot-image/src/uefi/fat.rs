//! From-scratch FAT filesystem construction for the EFI system partition.
//!
//! The staged content is a fixed tree (`EFI/BOOT/` holding the UEFI
//! application and the kernel payload), modeled entirely in memory and
//! serialized exactly once. Geometry is planned first (variant, FAT size,
//! cluster count), then clusters are assigned, then the region is written:
//! boot sector, FSInfo (FAT32), two identical FAT copies, root directory,
//! data clusters.

use crate::{BuildConfig, BuildError, FatVariant};
use disk_image::{align_up, sectors_for};
use log::debug;

const DIR_ENTRY_SIZE: usize = 32;
/// Fixed root directory capacity for FAT12/16 (entries, not bytes).
const ROOT_DIR_ENTRIES: u64 = 512;
/// Free-cluster margin included in every sizing decision.
const CLUSTER_SLACK: u64 = 8;
/// Deterministic volume serial number.
const VOLUME_ID: u32 = 0x8E2A_41C6;

const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_DIRECTORY: u8 = 0x10;

/// End-of-chain marker in the in-memory table; masked per variant on
/// serialization (0xFFF / 0xFFFF / 0x0FFF_FFFF).
const EOC: u32 = 0x0FFF_FFFF;

impl FatVariant {
    const fn min_clusters(self) -> u64 {
        match self {
            Self::Fat12 => 1,
            Self::Fat16 => 4085,
            Self::Fat32 => 65_525,
        }
    }

    const fn max_clusters(self) -> u64 {
        match self {
            Self::Fat12 => 4084,
            Self::Fat16 => 65_524,
            Self::Fat32 => 268_435_444,
        }
    }

    const fn by_cluster_count(count: u64) -> Self {
        if count < 4085 {
            Self::Fat12
        } else if count < 65_525 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    const fn next_smaller(self) -> Self {
        match self {
            Self::Fat12 | Self::Fat16 => Self::Fat12,
            Self::Fat32 => Self::Fat16,
        }
    }

    /// Bytes one FAT copy needs for `entries` table slots.
    const fn fat_bytes(self, entries: u64) -> u64 {
        match self {
            Self::Fat12 => (entries * 3).div_ceil(2),
            Self::Fat16 => entries * 2,
            Self::Fat32 => entries * 4,
        }
    }
}

/// Solved filesystem geometry, all quantities in sectors unless noted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub variant: FatVariant,
    pub sector_size: u64,
    pub sectors_per_cluster: u64,
    pub reserved_sectors: u64,
    pub fat_sectors: u64,
    pub root_dir_sectors: u64,
    /// Sector count the BPB declares; consistent with `cluster_count` so
    /// readers derive the same variant we serialized.
    pub total_sectors: u64,
    /// Full aligned ESP region; at least `total_sectors`.
    pub region_sectors: u64,
    pub cluster_count: u64,
}

impl Geometry {
    fn cluster_bytes(&self) -> u64 {
        self.sector_size * self.sectors_per_cluster
    }

    fn data_start_sector(&self) -> u64 {
        self.reserved_sectors + 2 * self.fat_sectors + self.root_dir_sectors
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        (self.data_start_sector() + u64::from(cluster - 2) * self.sectors_per_cluster)
            * self.sector_size
    }
}

/// A built EFI system partition region.
pub(crate) struct EspImage {
    pub bytes: Vec<u8>,
    pub variant: FatVariant,
    pub cluster_count: u64,
}

/// Build the FAT region holding `EFI/BOOT/BOOTX64.EFI` and
/// `EFI/BOOT/KERNEL.ELF`.
///
/// `hidden_sectors` is the partition's start LBA on the surrounding disk,
/// recorded in the BPB as firmware expects.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn build_esp(
    stub: &[u8],
    kernel: &[u8],
    config: &BuildConfig,
    hidden_sectors: u32,
) -> Result<EspImage, BuildError> {
    let geometry = plan_geometry(config, stub.len() as u64, kernel.len() as u64)?;
    debug!(
        "esp geometry: {} with {} clusters over {} sectors ({} region)",
        geometry.variant, geometry.cluster_count, geometry.total_sectors, geometry.region_sectors
    );

    let mut table = FatTable::new(geometry.cluster_count)?;
    let cluster_bytes = geometry.cluster_bytes();

    // Allocation order fixes the on-disk cluster numbering: root directory
    // (FAT32 only), the two directories, then the file chains.
    let root_cluster = match geometry.variant {
        FatVariant::Fat32 => Some(table.alloc_chain(1)?),
        _ => None,
    };
    let efi_cluster = table.alloc_chain(1)?;
    let boot_cluster = table.alloc_chain(1)?;
    let stub_cluster = table.alloc_chain(chains_for(stub.len() as u64, cluster_bytes))?;
    let kernel_cluster = table.alloc_chain(chains_for(kernel.len() as u64, cluster_bytes))?;

    let mut bytes = vec![0u8; usize::try_from(geometry.region_sectors * geometry.sector_size)
        .map_err(|_| BuildError::ImageTooLarge {
            sectors: geometry.region_sectors,
            max: u64::MAX,
        })?];

    write_boot_sector(&mut bytes, &geometry, hidden_sectors, root_cluster, &table);

    // Both FAT copies from the same table; bit-identical by construction.
    let fat = table.serialize(geometry.variant, geometry.fat_sectors * geometry.sector_size);
    let fat0_off = usize::try_from(geometry.reserved_sectors * geometry.sector_size).unwrap_or(0);
    let fat_len = fat.len();
    bytes[fat0_off..fat0_off + fat_len].copy_from_slice(&fat);
    bytes[fat0_off + fat_len..fat0_off + 2 * fat_len].copy_from_slice(&fat);

    // Directories.
    let root_entries = [dir_entry(short_name("EFI"), ATTR_DIRECTORY, efi_cluster, 0)];
    let efi_entries = [
        dir_entry(*b".          ", ATTR_DIRECTORY, efi_cluster, 0),
        dir_entry(*b"..         ", ATTR_DIRECTORY, 0, 0),
        dir_entry(short_name("BOOT"), ATTR_DIRECTORY, boot_cluster, 0),
    ];
    let boot_entries = [
        dir_entry(*b".          ", ATTR_DIRECTORY, boot_cluster, 0),
        dir_entry(*b"..         ", ATTR_DIRECTORY, efi_cluster, 0),
        dir_entry(
            short_name("BOOTX64.EFI"),
            ATTR_ARCHIVE,
            stub_cluster,
            stub.len() as u32,
        ),
        dir_entry(
            short_name("KERNEL.ELF"),
            ATTR_ARCHIVE,
            kernel_cluster,
            kernel.len() as u32,
        ),
    ];

    match root_cluster {
        Some(cluster) => write_dir(&mut bytes, &geometry, cluster, &root_entries),
        None => {
            let root_off = usize::try_from(
                (geometry.reserved_sectors + 2 * geometry.fat_sectors) * geometry.sector_size,
            )
            .unwrap_or(0);
            for (i, entry) in root_entries.iter().enumerate() {
                let off = root_off + i * DIR_ENTRY_SIZE;
                bytes[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry);
            }
        }
    }
    write_dir(&mut bytes, &geometry, efi_cluster, &efi_entries);
    write_dir(&mut bytes, &geometry, boot_cluster, &boot_entries);

    // File payloads across their chains.
    write_file(&mut bytes, &geometry, stub_cluster, stub);
    write_file(&mut bytes, &geometry, kernel_cluster, kernel);

    Ok(EspImage {
        bytes,
        variant: geometry.variant,
        cluster_count: geometry.cluster_count,
    })
}

/// Whole clusters needed for `len` bytes; empty files still occupy one.
fn chains_for(len: u64, cluster_bytes: u64) -> u64 {
    sectors_for(len, cluster_bytes).max(1)
}

/// Solve the filesystem geometry for the staged content and configuration.
fn plan_geometry(
    config: &BuildConfig,
    stub_len: u64,
    kernel_len: u64,
) -> Result<Geometry, BuildError> {
    let sector_size = u64::from(config.sector_size);
    let sectors_per_cluster = 1u64;
    let cluster_bytes = sector_size * sectors_per_cluster;

    // Directories: root (counts only on FAT32), EFI, BOOT.
    let content_clusters = chains_for(stub_len, cluster_bytes)
        + chains_for(kernel_len, cluster_bytes)
        + 3;

    let mut variant = match config.fat_variant_override {
        Some(pinned) => pinned,
        None => {
            // Rough total estimate just to seed the variant; boundary slop
            // is resolved by the downgrade-and-clamp pass below.
            let rough_bytes =
                (content_clusters * cluster_bytes + 64 * 1024).max(config.min_esp_size);
            FatVariant::by_cluster_count(rough_bytes / cluster_bytes)
        }
    };

    // A pinned variant must end up inside its legal cluster-count window;
    // grow towards its minimum, fail past its ceiling.
    let target_clusters = if config.fat_variant_override.is_some() {
        if content_clusters + CLUSTER_SLACK > variant.max_clusters() {
            return Err(BuildError::EspTooSmall {
                variant,
                required_clusters: content_clusters,
                ceiling: variant.max_clusters(),
            });
        }
        (content_clusters + CLUSTER_SLACK).max(variant.min_clusters() + CLUSTER_SLACK)
    } else {
        content_clusters + CLUSTER_SLACK
    };

    // Sectors needed for the target cluster count under `variant`.
    let minimal_sectors = minimal_total_sectors(target_clusters, variant, sector_size);
    // Apply the floor and round the region up to a 1 MiB boundary.
    let region_bytes = align_up(
        (minimal_sectors * sector_size).max(config.min_esp_size),
        1024 * 1024,
    );
    let region_sectors = region_bytes / sector_size;

    // Let the region fill up with clusters; downgrade the variant when an
    // auto-selected one turns out too big for the count that actually fits.
    let mut cluster_count;
    let mut fat_sectors;
    loop {
        (cluster_count, fat_sectors) = fill_region(region_sectors, variant, sector_size);
        if config.fat_variant_override.is_none()
            && cluster_count < variant.min_clusters()
            && variant != FatVariant::Fat12
        {
            variant = variant.next_smaller();
            continue;
        }
        break;
    }

    // Clamp to the variant's ceiling; trailing region sectors then sit
    // outside the filesystem, which the BPB totals must reflect.
    if cluster_count > variant.max_clusters() {
        cluster_count = variant.max_clusters();
    }

    if content_clusters > cluster_count {
        return Err(BuildError::EspTooSmall {
            variant,
            required_clusters: content_clusters,
            ceiling: cluster_count,
        });
    }

    let total_sectors = reserved_sectors(variant)
        + 2 * fat_sectors
        + root_dir_sectors(variant, sector_size)
        + cluster_count * sectors_per_cluster;

    Ok(Geometry {
        variant,
        sector_size,
        sectors_per_cluster,
        reserved_sectors: reserved_sectors(variant),
        fat_sectors,
        root_dir_sectors: root_dir_sectors(variant, sector_size),
        total_sectors,
        region_sectors,
        cluster_count,
    })
}

const fn reserved_sectors(variant: FatVariant) -> u64 {
    match variant {
        FatVariant::Fat12 | FatVariant::Fat16 => 1,
        FatVariant::Fat32 => 32,
    }
}

const fn root_dir_sectors(variant: FatVariant, sector_size: u64) -> u64 {
    match variant {
        FatVariant::Fat12 | FatVariant::Fat16 => {
            (ROOT_DIR_ENTRIES * DIR_ENTRY_SIZE as u64) / sector_size
        }
        FatVariant::Fat32 => 0,
    }
}

/// Smallest region size (sectors) that yields at least `clusters` clusters.
fn minimal_total_sectors(clusters: u64, variant: FatVariant, sector_size: u64) -> u64 {
    let fat = sectors_for(variant.fat_bytes(clusters + 2), sector_size);
    reserved_sectors(variant) + 2 * fat + root_dir_sectors(variant, sector_size) + clusters
}

/// Fixed point of (cluster count, FAT sectors) for a fixed region size.
fn fill_region(total_sectors: u64, variant: FatVariant, sector_size: u64) -> (u64, u64) {
    let overhead = reserved_sectors(variant) + root_dir_sectors(variant, sector_size);
    let mut fat_sectors = 0u64;
    loop {
        let data = total_sectors.saturating_sub(overhead + 2 * fat_sectors);
        let clusters = data; // one sector per cluster
        let needed = sectors_for(variant.fat_bytes(clusters + 2), sector_size);
        if needed == fat_sectors {
            return (clusters, fat_sectors);
        }
        fat_sectors = needed;
    }
}

/// The shared allocation table both FAT copies are serialized from.
struct FatTable {
    entries: Vec<u32>,
    next_free: u32,
}

impl FatTable {
    fn new(cluster_count: u64) -> Result<Self, BuildError> {
        let slots = usize::try_from(cluster_count + 2).map_err(|_| {
            BuildError::ClusterAllocationExhausted {
                needed: cluster_count,
                available: 0,
            }
        })?;
        Ok(Self {
            entries: vec![0u32; slots],
            next_free: 2,
        })
    }

    /// Allocate `count` clusters as one chain; returns the first cluster.
    fn alloc_chain(&mut self, count: u64) -> Result<u32, BuildError> {
        let first = u64::from(self.next_free);
        let available = self.entries.len() as u64 - first;
        if count > available {
            return Err(BuildError::ClusterAllocationExhausted {
                needed: count,
                available,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let first = first as u32;
        #[allow(clippy::cast_possible_truncation)]
        let count = count as u32;
        for i in 0..count {
            let cluster = first + i;
            let next = if i + 1 == count { EOC } else { cluster + 1 };
            self.entries[cluster as usize] = next;
        }
        self.next_free = first + count;
        Ok(first)
    }

    fn used_clusters(&self) -> u32 {
        self.next_free - 2
    }

    /// Serialize one FAT copy, padded to `fat_bytes` length.
    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, variant: FatVariant, fat_bytes: u64) -> Vec<u8> {
        let mut fat = vec![0u8; usize::try_from(fat_bytes).unwrap_or(0)];

        // Reserved slots: media descriptor marker and end-of-chain.
        let mut slots = self.entries.clone();
        slots[0] = 0x0FFF_FFF8;
        slots[1] = EOC;

        match variant {
            FatVariant::Fat12 => {
                for (cluster, &value) in slots.iter().enumerate() {
                    let value = (value & 0xFFF) as u16;
                    let off = cluster + cluster / 2;
                    if cluster % 2 == 0 {
                        fat[off] = (value & 0xFF) as u8;
                        fat[off + 1] = (fat[off + 1] & 0xF0) | ((value >> 8) & 0x0F) as u8;
                    } else {
                        fat[off] = (fat[off] & 0x0F) | (((value & 0x0F) << 4) as u8);
                        fat[off + 1] = (value >> 4) as u8;
                    }
                }
            }
            FatVariant::Fat16 => {
                for (cluster, &value) in slots.iter().enumerate() {
                    let off = cluster * 2;
                    fat[off..off + 2].copy_from_slice(&((value & 0xFFFF) as u16).to_le_bytes());
                }
            }
            FatVariant::Fat32 => {
                for (cluster, &value) in slots.iter().enumerate() {
                    let off = cluster * 4;
                    fat[off..off + 4].copy_from_slice(&(value & 0x0FFF_FFFF).to_le_bytes());
                }
            }
        }

        fat
    }

    /// Next cluster in a chain, or `None` at end-of-chain.
    #[cfg(test)]
    fn next(&self, cluster: u32) -> Option<u32> {
        let value = self.entries[cluster as usize];
        (value != EOC).then_some(value)
    }
}

/// Pack a plain `NAME.EXT` into the 11-byte 8.3 directory form.
fn short_name(name: &str) -> [u8; 11] {
    let mut packed = [b' '; 11];
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    for (i, b) in base.bytes().take(8).enumerate() {
        packed[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        packed[8 + i] = b.to_ascii_uppercase();
    }
    packed
}

fn dir_entry(name: [u8; 11], attr: u8, first_cluster: u32, size: u32) -> [u8; DIR_ENTRY_SIZE] {
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[0..11].copy_from_slice(&name);
    entry[11] = attr;
    #[allow(clippy::cast_possible_truncation)]
    let (hi, lo) = ((first_cluster >> 16) as u16, first_cluster as u16);
    entry[20..22].copy_from_slice(&hi.to_le_bytes());
    entry[26..28].copy_from_slice(&lo.to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
    entry
}

fn write_dir(bytes: &mut [u8], geometry: &Geometry, cluster: u32, entries: &[[u8; 32]]) {
    let base = usize::try_from(geometry.cluster_offset(cluster)).unwrap_or(0);
    for (i, entry) in entries.iter().enumerate() {
        let off = base + i * DIR_ENTRY_SIZE;
        bytes[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry);
    }
}

/// Lay `data` across the chain starting at `first`, cluster by cluster.
fn write_file(bytes: &mut [u8], geometry: &Geometry, first: u32, data: &[u8]) {
    let cluster_bytes = usize::try_from(geometry.cluster_bytes()).unwrap_or(512);
    let mut cluster = first;
    for chunk in data.chunks(cluster_bytes) {
        let off = usize::try_from(geometry.cluster_offset(cluster)).unwrap_or(0);
        bytes[off..off + chunk.len()].copy_from_slice(chunk);
        cluster += 1;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_boot_sector(
    bytes: &mut [u8],
    geometry: &Geometry,
    hidden_sectors: u32,
    root_cluster: Option<u32>,
    table: &FatTable,
) {
    let ss = geometry.sector_size as usize;
    let mut sector = vec![0u8; ss];

    match geometry.variant {
        FatVariant::Fat32 => sector[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]),
        _ => sector[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]),
    }
    sector[3..11].copy_from_slice(b"BOOTIMG ");
    sector[11..13].copy_from_slice(&(geometry.sector_size as u16).to_le_bytes());
    sector[13] = geometry.sectors_per_cluster as u8;
    sector[14..16].copy_from_slice(&(geometry.reserved_sectors as u16).to_le_bytes());
    sector[16] = 2; // FAT copies
    let root_entries = match geometry.variant {
        FatVariant::Fat32 => 0u16,
        _ => ROOT_DIR_ENTRIES as u16,
    };
    sector[17..19].copy_from_slice(&root_entries.to_le_bytes());
    if geometry.variant != FatVariant::Fat32 && geometry.total_sectors < 0x1_0000 {
        sector[19..21].copy_from_slice(&(geometry.total_sectors as u16).to_le_bytes());
    } else {
        sector[32..36].copy_from_slice(&(geometry.total_sectors as u32).to_le_bytes());
    }
    sector[21] = 0xF8; // fixed-disk media descriptor
    if geometry.variant != FatVariant::Fat32 {
        sector[22..24].copy_from_slice(&(geometry.fat_sectors as u16).to_le_bytes());
    }
    sector[24..26].copy_from_slice(&63u16.to_le_bytes());
    sector[26..28].copy_from_slice(&255u16.to_le_bytes());
    sector[28..32].copy_from_slice(&hidden_sectors.to_le_bytes());

    match geometry.variant {
        FatVariant::Fat32 => {
            sector[36..40].copy_from_slice(&(geometry.fat_sectors as u32).to_le_bytes());
            // Extension flags and version stay zero (mirrored FATs).
            sector[44..48].copy_from_slice(&root_cluster.unwrap_or(2).to_le_bytes());
            sector[48..50].copy_from_slice(&1u16.to_le_bytes()); // FSInfo
            sector[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot
            sector[64] = 0x80;
            sector[66] = 0x29;
            sector[67..71].copy_from_slice(&VOLUME_ID.to_le_bytes());
            sector[71..82].copy_from_slice(b"EFI SYSTEM ");
            sector[82..90].copy_from_slice(b"FAT32   ");
        }
        variant => {
            sector[36] = 0x80;
            sector[38] = 0x29;
            sector[39..43].copy_from_slice(&VOLUME_ID.to_le_bytes());
            sector[43..54].copy_from_slice(b"EFI SYSTEM ");
            sector[54..62].copy_from_slice(match variant {
                FatVariant::Fat12 => b"FAT12   ",
                _ => b"FAT16   ",
            });
        }
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;

    bytes[..ss].copy_from_slice(&sector);

    if geometry.variant == FatVariant::Fat32 {
        let mut info = vec![0u8; ss];
        info[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes()); // "RRaA"
        info[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes()); // "rrAa"
        let free = (geometry.cluster_count as u32).saturating_sub(table.used_clusters());
        info[488..492].copy_from_slice(&free.to_le_bytes());
        info[492..496].copy_from_slice(&table.next_free.to_le_bytes());
        info[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        bytes[ss..2 * ss].copy_from_slice(&info);

        // Backup boot sector and FSInfo at sectors 6 and 7.
        bytes[6 * ss..7 * ss].copy_from_slice(&sector);
        bytes[7 * ss..8 * ss].copy_from_slice(&info);
    }
}

#[cfg(test)]
mod tests {
    use super::{FatTable, FatVariant, short_name};

    #[test]
    fn short_names_pack_uppercase_space_padded() {
        assert_eq!(&short_name("BOOTX64.EFI"), b"BOOTX64 EFI");
        assert_eq!(&short_name("KERNEL.ELF"), b"KERNEL  ELF");
        assert_eq!(&short_name("efi"), b"EFI        ");
    }

    #[test]
    fn fat12_packing_splits_nibbles() {
        let mut table = FatTable::new(16).expect("table");
        // Chain: 2 -> 3 -> EOC.
        table.alloc_chain(2).expect("chain");
        let fat = table.serialize(FatVariant::Fat12, 512);

        // Slot 0 = 0xFF8, slot 1 = 0xFFF.
        assert_eq!(&fat[0..3], &[0xF8, 0xFF, 0xFF]);
        // Slot 2 = 3, slot 3 = 0xFFF.
        assert_eq!(fat[3], 0x03);
        assert_eq!(fat[4], 0xF0);
        assert_eq!(fat[5], 0xFF);
    }

    #[test]
    fn chains_link_and_terminate() {
        let mut table = FatTable::new(64).expect("table");
        let first = table.alloc_chain(3).expect("chain");
        assert_eq!(first, 2);
        assert_eq!(table.next(2), Some(3));
        assert_eq!(table.next(3), Some(4));
        assert_eq!(table.next(4), None);
    }

    #[test]
    fn allocation_exhausts_cleanly() {
        let mut table = FatTable::new(4).expect("table");
        assert!(table.alloc_chain(4).is_ok());
        assert!(table.alloc_chain(1).is_err());
    }
}
