//! The 512-byte real-mode boot sector.
//!
//! BIOS INT 19h loads this sector to 0000:7C00 and jumps to it with the boot
//! drive in DL. The code sets up a stack, reads stage-2 from the sectors
//! following LBA 0 with one EDD extended read (INT 13h AH=42h) and far-jumps
//! to it at 0000:7E00. The disk-address packet sits inside the sector; the
//! assembler patches its sector count and start LBA to match the layout.

/// Assembled stage-1 code, origin 0000:7C00.
///
/// ```text
/// 7C00  fa              cli
/// 7C01  31 c0           xor   ax, ax
/// 7C03  8e d8           mov   ds, ax
/// 7C05  8e c0           mov   es, ax
/// 7C07  8e d0           mov   ss, ax
/// 7C09  bc 00 7c        mov   sp, 0x7c00
/// 7C0C  fb              sti
/// 7C0D  88 16 22 7c     mov   [0x7c22], dl      ; remember boot drive
/// 7C11  be 24 7c        mov   si, 0x7c24        ; disk-address packet
/// 7C14  b4 42           mov   ah, 0x42          ; EDD extended read
/// 7C16  cd 13           int   0x13
/// 7C18  72 05           jc    fault
/// 7C1A  ea 00 7e 00 00  jmp   0x0000:0x7e00     ; enter stage-2
/// 7C1F  f4       fault: hlt
/// 7C20  eb fd           jmp   fault
/// 7C22                  db    0                 ; boot drive
/// 7C23                  db    0
/// 7C24                  ; disk-address packet (see below)
/// ```
const CODE: [u8; 36] = [
    0xFA, // cli
    0x31, 0xC0, // xor ax, ax
    0x8E, 0xD8, // mov ds, ax
    0x8E, 0xC0, // mov es, ax
    0x8E, 0xD0, // mov ss, ax
    0xBC, 0x00, 0x7C, // mov sp, 0x7c00
    0xFB, // sti
    0x88, 0x16, 0x22, 0x7C, // mov [0x7c22], dl
    0xBE, 0x24, 0x7C, // mov si, 0x7c24
    0xB4, 0x42, // mov ah, 0x42
    0xCD, 0x13, // int 0x13
    0x72, 0x05, // jc fault
    0xEA, 0x00, 0x7E, 0x00, 0x00, // jmp 0x0000:0x7e00
    0xF4, // fault: hlt
    0xEB, 0xFD, // jmp fault
    0x00, // boot drive scratch
    0x00, // pad
];

/// Disk-address packet location and patch slots, as sector offsets.
const DAP_OFFSET: usize = 36;
const DAP_SECTOR_COUNT: usize = DAP_OFFSET + 2;
const DAP_START_LBA: usize = DAP_OFFSET + 8;

/// Build the boot sector for a stage-2 of `stage2_sectors` sectors starting
/// at `stage2_lba`. Bytes 446..510 stay zero for the partition table; the
/// caller writes that separately.
pub(crate) fn build(stage2_lba: u64, stage2_sectors: u16) -> [u8; 512] {
    let mut sector = [0u8; 512];
    sector[..CODE.len()].copy_from_slice(&CODE);

    // Disk-address packet: size, reserved, count, buffer 0000:7E00, LBA.
    sector[DAP_OFFSET] = 0x10;
    sector[DAP_SECTOR_COUNT..DAP_SECTOR_COUNT + 2]
        .copy_from_slice(&stage2_sectors.to_le_bytes());
    sector[DAP_OFFSET + 4..DAP_OFFSET + 6].copy_from_slice(&0x7E00u16.to_le_bytes());
    sector[DAP_OFFSET + 6..DAP_OFFSET + 8].copy_from_slice(&0u16.to_le_bytes());
    sector[DAP_START_LBA..DAP_START_LBA + 8].copy_from_slice(&stage2_lba.to_le_bytes());

    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[cfg(test)]
mod tests {
    use super::build;

    #[test]
    fn boot_sector_is_signed_and_patched() {
        let sector = build(1, 9);
        assert_eq!(sector.len(), 512);
        assert_eq!(&sector[510..], &[0x55, 0xAA]);
        assert_eq!(&sector[38..40], &9u16.to_le_bytes());
        assert_eq!(&sector[44..52], &1u64.to_le_bytes());
        // Partition table area untouched.
        assert!(sector[446..510].iter().all(|&b| b == 0));
    }
}
