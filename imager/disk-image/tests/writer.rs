use disk_image::{
    BOOT_SIGNATURE, DiskImage, DiskImageError, MbrPartition, align_up, sectors_for,
    write_partition_table,
};
use std::fs;

#[test]
fn write_at_places_bytes_at_offset() {
    let mut image = DiskImage::new(4096, 512).expect("alloc");
    image.write_at(1000, &[1, 2, 3, 4]).expect("in bounds");

    assert_eq!(&image.bytes()[1000..1004], &[1, 2, 3, 4]);
    assert!(image.bytes()[..1000].iter().all(|&b| b == 0));
}

#[test]
fn write_past_end_is_rejected_not_truncated() {
    let mut image = DiskImage::new(1024, 512).expect("alloc");
    let err = image.write_at(1020, &[0xFF; 8]).expect_err("out of bounds");

    assert!(matches!(
        err,
        DiskImageError::WriteOutOfBounds {
            offset: 1020,
            len: 8,
            image_len: 1024,
        }
    ));
    // Nothing may have been written.
    assert!(image.bytes().iter().all(|&b| b == 0));
}

#[test]
fn write_lba_addresses_sectors() {
    let mut image = DiskImage::new(4096, 512).expect("alloc");
    image.write_lba(3, &[0xAA; 512]).expect("in bounds");

    assert!(image.bytes()[1536..2048].iter().all(|&b| b == 0xAA));
    assert!(image.bytes()[..1536].iter().all(|&b| b == 0));
}

#[test]
fn finalize_round_trips_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("disk.img");

    let mut image = DiskImage::new(2048, 512).expect("alloc");
    image.write_at(0, b"first sector").expect("write");
    image.write_lba(3, &[0x5A; 512]).expect("write");
    image.finalize(&path).expect("finalize");

    let written = fs::read(&path).expect("read back");
    assert_eq!(written.len(), 2048);
    assert_eq!(&written[..12], b"first sector");
    assert!(written[1536..].iter().all(|&b| b == 0x5A));
}

#[test]
fn finalize_into_missing_directory_fails_without_leftovers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("no-such-dir").join("disk.img");

    let image = DiskImage::new(512, 512).expect("alloc");
    let err = image.finalize(&path).expect_err("destination not writable");

    assert!(matches!(err, DiskImageError::Io { .. }));
    assert!(!path.exists());
}

#[test]
fn partition_table_lands_at_standard_offsets() {
    let mut image = DiskImage::new(4096, 512).expect("alloc");
    write_partition_table(
        &mut image,
        &[MbrPartition {
            bootable: true,
            type_byte: 0x7F,
            start_lba: 1,
            sectors: 6,
        }],
    )
    .expect("table fits");

    let bytes = image.bytes();
    assert_eq!(bytes[446], 0x80, "boot flag");
    assert_eq!(bytes[446 + 4], 0x7F, "type byte");
    assert_eq!(&bytes[446 + 8..446 + 12], &1u32.to_le_bytes());
    assert_eq!(&bytes[446 + 12..446 + 16], &6u32.to_le_bytes());
    assert_eq!(&bytes[510..512], &BOOT_SIGNATURE);
}

#[test]
fn more_than_four_partitions_are_rejected() {
    let mut image = DiskImage::new(4096, 512).expect("alloc");
    let entry = MbrPartition {
        bootable: false,
        type_byte: 0x0C,
        start_lba: 1,
        sectors: 1,
    };
    let err = write_partition_table(&mut image, &[entry; 5]).expect_err("five entries");
    assert!(matches!(
        err,
        DiskImageError::TooManyPartitions { count: 5 }
    ));
}

#[test]
fn alignment_helpers() {
    assert_eq!(align_up(0, 512), 0);
    assert_eq!(align_up(1, 512), 512);
    assert_eq!(align_up(512, 512), 512);
    assert_eq!(align_up(513, 512), 1024);
    assert_eq!(sectors_for(0, 512), 0);
    assert_eq!(sectors_for(1, 512), 1);
    assert_eq!(sectors_for(4097, 512), 9);
}
