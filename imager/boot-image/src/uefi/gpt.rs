//! GUID partition table serialization.
//!
//! Raw byte-offset encoding of the primary and backup headers plus the
//! 128-entry partition array, CRC-32 sealed. The two headers agree on
//! everything except their own and their array's location.

use crate::BuildError;
use disk_image::{DiskImage, sectors_for};
use uguid::{Guid, guid};

/// EFI system partition type, as defined by the UEFI specification.
pub(crate) const ESP_TYPE_GUID: Guid = guid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");

/// Fixed disk and partition identity.
///
/// Deterministic rather than random: identical inputs produce bit-identical
/// images, and the primary/backup identity invariant is trivially upheld.
const DISK_GUID: Guid = guid!("8f4f5c10-6f22-4a41-9a2e-5a61e3b8c7d4");
const PARTITION_GUID: Guid = guid!("d1f8a2b3-44c5-4e66-8777-1e88f99aa0b1");

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
const ENTRY_SIZE: usize = 128;
const ENTRY_COUNT: usize = 128;

/// Planned placement of the GPT structures on the disk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GptLayout {
    pub sector_size: u64,
    pub total_sectors: u64,
    /// First LBA of the EFI system partition.
    pub partition_start: u64,
    /// Last LBA of the EFI system partition, inclusive.
    pub partition_end: u64,
}

impl GptLayout {
    pub(crate) fn entry_array_sectors(&self) -> u64 {
        sectors_for((ENTRY_COUNT * ENTRY_SIZE) as u64, self.sector_size)
    }

    pub(crate) fn first_usable(&self) -> u64 {
        2 + self.entry_array_sectors()
    }

    pub(crate) fn last_usable(&self) -> u64 {
        self.total_sectors - self.entry_array_sectors() - 2
    }

    fn backup_entry_lba(&self) -> u64 {
        self.total_sectors - 1 - self.entry_array_sectors()
    }
}

/// Write protective-MBR-covered GPT structures: primary header and entry
/// array at the front, mirrored copies at the image tail.
pub(crate) fn write_tables(image: &mut DiskImage, layout: &GptLayout) -> Result<(), BuildError> {
    let entries = build_entry_array(layout);
    let entries_crc = crc32(&entries);

    image.write_lba(2, &entries)?;
    image.write_lba(layout.backup_entry_lba(), &entries)?;

    let primary = build_header(layout, 1, layout.total_sectors - 1, 2, entries_crc);
    image.write_lba(1, &primary)?;

    let backup = build_header(
        layout,
        layout.total_sectors - 1,
        1,
        layout.backup_entry_lba(),
        entries_crc,
    );
    image.write_lba(layout.total_sectors - 1, &backup)?;

    Ok(())
}

fn build_entry_array(layout: &GptLayout) -> Vec<u8> {
    let mut entries = vec![0u8; ENTRY_COUNT * ENTRY_SIZE];

    entries[0..16].copy_from_slice(&ESP_TYPE_GUID.to_bytes());
    entries[16..32].copy_from_slice(&PARTITION_GUID.to_bytes());
    entries[32..40].copy_from_slice(&layout.partition_start.to_le_bytes());
    entries[40..48].copy_from_slice(&layout.partition_end.to_le_bytes());
    // Attributes stay zero.
    for (i, unit) in "EFI system partition".encode_utf16().enumerate() {
        let off = 56 + i * 2;
        entries[off..off + 2].copy_from_slice(&unit.to_le_bytes());
    }

    entries
}

#[allow(clippy::cast_possible_truncation)]
fn build_header(
    layout: &GptLayout,
    my_lba: u64,
    alternate_lba: u64,
    entry_lba: u64,
    entries_crc: u32,
) -> Vec<u8> {
    let mut sector = vec![0u8; layout.sector_size as usize];

    sector[0..8].copy_from_slice(GPT_SIGNATURE);
    sector[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
    sector[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
    // CRC field stays zero until the whole header is in place.
    sector[24..32].copy_from_slice(&my_lba.to_le_bytes());
    sector[32..40].copy_from_slice(&alternate_lba.to_le_bytes());
    sector[40..48].copy_from_slice(&layout.first_usable().to_le_bytes());
    sector[48..56].copy_from_slice(&layout.last_usable().to_le_bytes());
    sector[56..72].copy_from_slice(&DISK_GUID.to_bytes());
    sector[72..80].copy_from_slice(&entry_lba.to_le_bytes());
    sector[80..84].copy_from_slice(&(ENTRY_COUNT as u32).to_le_bytes());
    sector[84..88].copy_from_slice(&(ENTRY_SIZE as u32).to_le_bytes());
    sector[88..92].copy_from_slice(&entries_crc.to_le_bytes());

    let header_crc = crc32(&sector[0..HEADER_SIZE as usize]);
    sector[16..20].copy_from_slice(&header_crc.to_le_bytes());

    sector
}

/// CRC-32 (IEEE 802.3 polynomial, reflected), allocation-free.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0xEDB8_8320;
    let mut crc = 0xFFFF_FFFFu32;

    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}

#[cfg(test)]
mod tests {
    use super::crc32;

    #[test]
    fn crc32_matches_known_vector() {
        // IEEE CRC-32 of "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
