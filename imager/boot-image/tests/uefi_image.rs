mod common;

use boot_image::{BuildConfig, BuildError, FatVariant, UefiBoot};
use common::{
    EspReader, PF_R, PF_X, Seg, Variant, crc32, load_kernel, parse_gpt_header, read_u32,
};
use kernel_image::KernelImage;
use std::fs;
use std::path::Path;

fn small_kernel() -> KernelImage {
    load_kernel(
        0x10_0000,
        &[Seg {
            vaddr: 0x10_0000,
            file_size: 4096,
            mem_size: 8192,
            flags: PF_R | PF_X,
        }],
    )
}

fn build(kernel: &KernelImage, config: BuildConfig, path: &Path) -> Vec<u8> {
    UefiBoot::new(kernel)
        .with_config(config)
        .create_disk_image(path)
        .expect("build uefi image");
    fs::read(path).expect("read image")
}

#[test]
fn protective_mbr_covers_the_disk() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let image = build(&kernel, BuildConfig::default(), &dir.path().join("u.img"));

    assert_eq!(&image[510..512], &[0x55, 0xAA]);
    assert_eq!(image[446], 0x00, "protective entry is not bootable");
    assert_eq!(image[446 + 4], 0xEE, "protective type");
    assert_eq!(read_u32(&image, 446 + 8), 1);
    let total_sectors = image.len() / 512;
    assert_eq!(read_u32(&image, 446 + 12) as usize, total_sectors - 1);
}

#[test]
fn primary_and_backup_gpt_headers_agree() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let image = build(&kernel, BuildConfig::default(), &dir.path().join("u.img"));
    let total_sectors = image.len() / 512;

    let primary = parse_gpt_header(&image[512..1024]);
    let backup_off = (total_sectors - 1) * 512;
    let backup = parse_gpt_header(&image[backup_off..backup_off + 512]);

    assert_eq!(primary.my_lba, 1);
    assert_eq!(primary.alternate_lba as usize, total_sectors - 1);
    assert_eq!(backup.my_lba as usize, total_sectors - 1);
    assert_eq!(backup.alternate_lba, 1);
    assert_eq!(primary.disk_guid, backup.disk_guid);
    assert_eq!(primary.first_usable, backup.first_usable);
    assert_eq!(primary.last_usable, backup.last_usable);
    assert_eq!(primary.entries_crc, backup.entries_crc);

    // Both entry arrays decode to the same single ESP entry.
    let entry_bytes = primary.entry_count as usize * primary.entry_size as usize;
    let primary_entries =
        &image[primary.entry_lba as usize * 512..primary.entry_lba as usize * 512 + entry_bytes];
    let backup_entries =
        &image[backup.entry_lba as usize * 512..backup.entry_lba as usize * 512 + entry_bytes];
    assert_eq!(primary_entries, backup_entries);
    assert_eq!(crc32(primary_entries), primary.entries_crc);

    // EFI system partition type GUID, mixed-endian on disk.
    assert_eq!(
        &primary_entries[0..16],
        &[
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B
        ]
    );

    let start = u64::from_le_bytes(primary_entries[32..40].try_into().unwrap());
    let end = u64::from_le_bytes(primary_entries[40..48].try_into().unwrap());
    assert!(start >= primary.first_usable);
    assert!(end <= primary.last_usable);
    assert!(end > start);
}

#[test]
fn corrupted_primary_header_is_detectable() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut image = build(&kernel, BuildConfig::default(), &dir.path().join("u.img"));

    image[512 + 40] ^= 0xFF; // flip a bit in first_usable
    let sector = &image[512..1024];
    let stored = read_u32(sector, 16);
    let mut scratch = sector[..92].to_vec();
    scratch[16..20].fill(0);
    assert_ne!(crc32(&scratch), stored, "checksum must catch the corruption");
}

#[test]
fn esp_holds_stub_and_kernel_at_wellknown_paths() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let image = build(&kernel, BuildConfig::default(), &dir.path().join("u.img"));

    let primary = parse_gpt_header(&image[512..1024]);
    let entries = &image[primary.entry_lba as usize * 512..];
    let start = u64::from_le_bytes(entries[32..40].try_into().unwrap()) as usize;
    let end = u64::from_le_bytes(entries[40..48].try_into().unwrap()) as usize;
    let esp_bytes = &image[start * 512..(end + 1) * 512];

    let esp = EspReader::parse(esp_bytes);
    let root = esp.dir_bytes(esp.root());
    let (efi_cluster, _) = esp.find(&root, b"EFI        ").expect("EFI directory");
    let efi = esp.dir_bytes(Some(efi_cluster));
    let (boot_cluster, _) = esp.find(&efi, b"BOOT       ").expect("BOOT directory");
    let boot = esp.dir_bytes(Some(boot_cluster));

    let (stub_cluster, stub_size) = esp.find(&boot, b"BOOTX64 EFI").expect("stub file");
    let stub = esp.read_chain(stub_cluster, stub_size as usize);
    assert_eq!(&stub[0..2], b"MZ", "stub is a PE image");

    let (kernel_cluster, kernel_size) = esp.find(&boot, b"KERNEL  ELF").expect("kernel file");
    assert_eq!(kernel_size as usize, kernel.as_bytes().len());
    let payload = esp.read_chain(kernel_cluster, kernel_size as usize);
    assert_eq!(payload, kernel.as_bytes(), "kernel file round-trips");
}

#[test]
fn both_fat_copies_are_byte_identical() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let image = build(&kernel, BuildConfig::default(), &dir.path().join("u.img"));

    let primary = parse_gpt_header(&image[512..1024]);
    let entries = &image[primary.entry_lba as usize * 512..];
    let start = u64::from_le_bytes(entries[32..40].try_into().unwrap()) as usize;
    let esp = EspReader::parse(&image[start * 512..]);

    assert_eq!(esp.fat_copy(0), esp.fat_copy(1));
}

#[test]
fn image_respects_the_esp_floor() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BuildConfig {
        min_esp_size: 4 * 1024 * 1024,
        ..BuildConfig::default()
    };
    let image = build(&kernel, config, &dir.path().join("u.img"));

    // Floor plus protective MBR, both GPT header/entry regions.
    assert!(image.len() as u64 >= 4 * 1024 * 1024 + 512 * (1 + 2 * 33));
}

#[test]
fn pinned_fat12_builds_a_fat12_esp() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BuildConfig {
        fat_variant_override: Some(FatVariant::Fat12),
        ..BuildConfig::default()
    };
    let image = build(&kernel, config, &dir.path().join("u.img"));

    let primary = parse_gpt_header(&image[512..1024]);
    let entries = &image[primary.entry_lba as usize * 512..];
    let start = u64::from_le_bytes(entries[32..40].try_into().unwrap()) as usize;
    let esp = EspReader::parse(&image[start * 512..]);

    assert_eq!(esp.variant, Variant::Fat12);
    assert_eq!(&esp.bytes[54..62], b"FAT12   ");
}

#[test]
fn pinned_fat12_fails_when_content_exceeds_its_ceiling() {
    // ~2.5 MiB of payload: more than 4084 single-sector clusters.
    let kernel = load_kernel(
        0x10_0000,
        &[Seg {
            vaddr: 0x10_0000,
            file_size: 2_560_000,
            mem_size: 2_560_000,
            flags: PF_R | PF_X,
        }],
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BuildConfig {
        fat_variant_override: Some(FatVariant::Fat12),
        ..BuildConfig::default()
    };
    let err = UefiBoot::new(&kernel)
        .with_config(config)
        .create_disk_image(&dir.path().join("u.img"))
        .expect_err("content cannot fit FAT12");

    assert!(matches!(err, BuildError::EspTooSmall { .. }));
}

#[test]
fn pinned_fat32_grows_to_its_minimum_cluster_count() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BuildConfig {
        fat_variant_override: Some(FatVariant::Fat32),
        ..BuildConfig::default()
    };
    let image = build(&kernel, config, &dir.path().join("u.img"));

    let primary = parse_gpt_header(&image[512..1024]);
    let entries = &image[primary.entry_lba as usize * 512..];
    let start = u64::from_le_bytes(entries[32..40].try_into().unwrap()) as usize;
    let esp = EspReader::parse(&image[start * 512..]);

    assert_eq!(esp.variant, Variant::Fat32);
    assert!(esp.cluster_count >= 65_525);
    assert_eq!(&esp.bytes[82..90], b"FAT32   ");

    // FAT32 extras: FSInfo and the backup boot sector.
    assert_eq!(read_u32(esp.bytes, 512), 0x4161_5252);
    assert_eq!(&esp.bytes[6 * 512..6 * 512 + 3], &esp.bytes[0..3]);
}

#[test]
fn four_kilobyte_sectors_shift_all_structures() {
    let kernel = small_kernel();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BuildConfig {
        sector_size: 4096,
        ..BuildConfig::default()
    };
    let image = build(&kernel, config, &dir.path().join("u.img"));

    assert_eq!(image.len() % 4096, 0);
    let primary = parse_gpt_header(&image[4096..8192]);
    assert_eq!(primary.my_lba, 1);

    let entries = &image[primary.entry_lba as usize * 4096..];
    let start = u64::from_le_bytes(entries[32..40].try_into().unwrap()) as usize;
    let esp = EspReader::parse(&image[start * 4096..]);
    assert_eq!(esp.sector_size, 4096);
}
