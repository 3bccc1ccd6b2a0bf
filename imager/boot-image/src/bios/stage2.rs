//! The stage-2 loader: mode switching, segment placement, kernel handoff.
//!
//! Stage-1 reads this blob to 0000:7E00. The first KiB is fixed machine
//! code plus its static data (GDT, disk-address packet); immediately after
//! it, at 0x8200, the assembler serializes a little-endian handoff table
//! the code walks:
//!
//! ```text
//! 0x8200  u64  kernel entry point
//! 0x8208  u64  segment count
//! 0x8210  u64  segment[0] disk LBA        (repeats per segment, 32 bytes)
//!         u64  segment[0] file length
//!         u64  segment[0] destination physical address
//!         u64  segment[0] memory length
//! ```
//!
//! The code enables the A20 gate, loads big segment limits into DS/ES
//! ("unreal mode") so real-mode INT 13h reads can be copied above 1 MiB,
//! streams each segment from disk in 32 KiB chunks through a buffer at
//! 0x20000, zero-fills the `mem_len - file_len` tail, then builds identity
//! page tables (2 MiB pages, 4 GiB) at 0x1000, enables long mode and jumps
//! to the entry point.

use crate::bios::layout::PlannedSegment;

/// Fixed size of the code-and-data region; the handoff table follows it.
pub(crate) const CODE_REGION_LEN: usize = 1024;

/// Absolute load address of stage-2 (right after the boot sector).
pub(crate) const LOAD_ADDR: u64 = 0x7E00;

/// Absolute address of the handoff table.
pub(crate) const HANDOFF_TABLE_ADDR: u64 = LOAD_ADDR + CODE_REGION_LEN as u64;

const HANDOFF_HEADER_LEN: usize = 16;
const HANDOFF_ENTRY_LEN: usize = 32;

/// Assembled stage-2 code, origin 0000:7E00. Mnemonics alongside.
#[rustfmt::skip]
const CODE: [u8; 0x1A6] = [
    // -- real-mode entry: segments, stack, remember boot drive ------------
    0xFA,                                     // cli
    0x31, 0xC0,                               // xor  ax, ax
    0x8E, 0xD8,                               // mov  ds, ax
    0x8E, 0xC0,                               // mov  es, ax
    0x8E, 0xD0,                               // mov  ss, ax
    0xBC, 0x00, 0x7C,                         // mov  sp, 0x7c00
    0x88, 0x16, 0xFE, 0x81,                   // mov  [0x81fe], dl
    // -- A20 via the fast gate --------------------------------------------
    0xE4, 0x92,                               // in   al, 0x92
    0x0C, 0x02,                               // or   al, 0x02
    0xE6, 0x92,                               // out  0x92, al
    // -- unreal mode: cache 4 GiB limits into DS/ES -----------------------
    0x0F, 0x01, 0x16, 0xE8, 0x81,             // lgdt [0x81e8]
    0x0F, 0x20, 0xC0,                         // mov  eax, cr0
    0x66, 0x83, 0xC8, 0x01,                   // or   eax, 1
    0x0F, 0x22, 0xC0,                         // mov  cr0, eax
    0xEB, 0x00,                               // jmp  $+2 (flush queue)
    0xBB, 0x08, 0x00,                         // mov  bx, 0x08 (data32)
    0x8E, 0xDB,                               // mov  ds, bx
    0x8E, 0xC3,                               // mov  es, bx
    0x66, 0x83, 0xE0, 0xFE,                   // and  eax, ~1
    0x0F, 0x22, 0xC0,                         // mov  cr0, eax
    0xFB, 0x90,                               // sti; nop (IF back on for INT 13h)
    0x31, 0xC0,                               // xor  ax, ax
    0x8E, 0xD8,                               // mov  ds, ax
    0x8E, 0xC0,                               // mov  es, ax
    // -- walk the handoff table -------------------------------------------
    0xBE, 0x10, 0x82,                         // mov  si, 0x8210 (first entry)
    0x66, 0x8B, 0x0E, 0x08, 0x82,             // mov  ecx, [0x8208] (count)
    // next_seg:
    0x66, 0x83, 0xF9, 0x00,                   // cmp  ecx, 0
    0x0F, 0x84, 0x93, 0x00,                   // jz   long_mode
    0x66, 0x51,                               // push ecx
    0x66, 0x8B, 0x1C,                         // mov  ebx, [si]      (disk LBA)
    0x66, 0x8B, 0x6C, 0x10,                   // mov  ebp, [si+16]   (dest)
    0x66, 0x8B, 0x4C, 0x08,                   // mov  ecx, [si+8]    (file bytes)
    // chunk:
    0x66, 0x83, 0xF9, 0x00,                   // cmp  ecx, 0
    0x74, 0x5C,                               // jz   zerofill
    0x66, 0xBA, 0x00, 0x80, 0x00, 0x00,       // mov  edx, 0x8000 (32 KiB chunk)
    0x66, 0x39, 0xCA,                         // cmp  edx, ecx
    0x76, 0x03,                               // jbe  $+5
    0x66, 0x89, 0xCA,                         // mov  edx, ecx
    0x67, 0x66, 0x8D, 0x82, 0xFF, 0x01, 0x00, 0x00, // lea eax, [edx+511]
    0x66, 0xC1, 0xE8, 0x09,                   // shr  eax, 9 (sector count)
    0xA3, 0xF2, 0x81,                         // mov  [0x81f2], ax (DAP count)
    0x66, 0x89, 0x1E, 0xF8, 0x81,             // mov  [0x81f8], ebx (DAP LBA)
    0x8A, 0x16, 0xFE, 0x81,                   // mov  dl, [0x81fe]
    0x56,                                     // push si
    0xBE, 0xF0, 0x81,                         // mov  si, 0x81f0 (DAP)
    0xB4, 0x42,                               // mov  ah, 0x42
    0xCD, 0x13,                               // int  0x13
    0x5E,                                     // pop  si
    0x73, 0x03,                               // jnc  $+5
    0xF4,                                     // fault: hlt
    0xEB, 0xFD,                               // jmp  fault
    0x66, 0x60,                               // pushad
    0x66, 0xBE, 0x00, 0x00, 0x02, 0x00,       // mov  esi, 0x20000 (buffer)
    0x66, 0x89, 0xEF,                         // mov  edi, ebp
    0x67, 0x66, 0x8D, 0x8A, 0x03, 0x00, 0x00, 0x00, // lea ecx, [edx+3]
    0x66, 0xC1, 0xE9, 0x02,                   // shr  ecx, 2
    0x67, 0x66, 0xF3, 0xA5,                   // rep movsd (flat DS/ES)
    0x66, 0x61,                               // popad
    0x66, 0x01, 0xC3,                         // add  ebx, eax (LBA += sectors)
    0x66, 0x01, 0xD5,                         // add  ebp, edx (dest += chunk)
    0x66, 0x29, 0xD1,                         // sub  ecx, edx
    0xEB, 0x9E,                               // jmp  chunk
    // zerofill: ebp == dest + file_len here
    0x66, 0x8B, 0x4C, 0x18,                   // mov  ecx, [si+24] (mem bytes)
    0x66, 0x2B, 0x4C, 0x08,                   // sub  ecx, [si+8]
    0x66, 0x83, 0xC1, 0x03,                   // add  ecx, 3
    0x66, 0xC1, 0xE9, 0x02,                   // shr  ecx, 2
    0x66, 0x89, 0xEF,                         // mov  edi, ebp
    0x66, 0x31, 0xC0,                         // xor  eax, eax
    0x67, 0x66, 0xF3, 0xAB,                   // rep stosd
    0x83, 0xC6, 0x20,                         // add  si, 32 (next entry)
    0x66, 0x59,                               // pop  ecx
    0x66, 0x49,                               // dec  ecx
    0xE9, 0x65, 0xFF,                         // jmp  next_seg
    // long_mode: identity-map 4 GiB with 2 MiB pages at 0x1000
    0xFA,                                     // cli
    0x66, 0xBF, 0x00, 0x10, 0x00, 0x00,       // mov  edi, 0x1000
    0x66, 0xB9, 0x00, 0x18, 0x00, 0x00,       // mov  ecx, 0x1800 (6 pages / 4)
    0x66, 0x31, 0xC0,                         // xor  eax, eax
    0x67, 0x66, 0xF3, 0xAB,                   // rep stosd (clear tables)
    0x67, 0x66, 0xC7, 0x05, 0x00, 0x10, 0x00, 0x00, 0x03, 0x20, 0x00, 0x00, // PML4[0] = 0x2003
    0x67, 0x66, 0xC7, 0x05, 0x00, 0x20, 0x00, 0x00, 0x03, 0x30, 0x00, 0x00, // PDPT[0] = 0x3003
    0x67, 0x66, 0xC7, 0x05, 0x08, 0x20, 0x00, 0x00, 0x03, 0x40, 0x00, 0x00, // PDPT[1] = 0x4003
    0x67, 0x66, 0xC7, 0x05, 0x10, 0x20, 0x00, 0x00, 0x03, 0x50, 0x00, 0x00, // PDPT[2] = 0x5003
    0x67, 0x66, 0xC7, 0x05, 0x18, 0x20, 0x00, 0x00, 0x03, 0x60, 0x00, 0x00, // PDPT[3] = 0x6003
    0x66, 0xBF, 0x00, 0x30, 0x00, 0x00,       // mov  edi, 0x3000
    0x66, 0xB8, 0x83, 0x00, 0x00, 0x00,       // mov  eax, 0x83 (P|RW|PS)
    0x66, 0xB9, 0x00, 0x08, 0x00, 0x00,       // mov  ecx, 2048
    // pd_loop:
    0x67, 0x66, 0x89, 0x07,                   // mov  [edi], eax
    0x66, 0x05, 0x00, 0x00, 0x20, 0x00,       // add  eax, 0x200000
    0x66, 0x83, 0xC7, 0x08,                   // add  edi, 8
    0x66, 0x49,                               // dec  ecx
    0x75, 0xEE,                               // jnz  pd_loop
    0x0F, 0x20, 0xE0,                         // mov  eax, cr4
    0x66, 0x83, 0xC8, 0x20,                   // or   eax, 0x20 (PAE)
    0x0F, 0x22, 0xE0,                         // mov  cr4, eax
    0x66, 0xB9, 0x80, 0x00, 0x00, 0xC0,       // mov  ecx, 0xc0000080 (EFER)
    0x0F, 0x32,                               // rdmsr
    0x66, 0x0D, 0x00, 0x01, 0x00, 0x00,       // or   eax, 0x100 (LME)
    0x0F, 0x30,                               // wrmsr
    0x66, 0xB8, 0x00, 0x10, 0x00, 0x00,       // mov  eax, 0x1000
    0x0F, 0x22, 0xD8,                         // mov  cr3, eax
    0x0F, 0x20, 0xC0,                         // mov  eax, cr0
    0x66, 0x0D, 0x01, 0x00, 0x00, 0x80,       // or   eax, 0x80000001 (PG|PE)
    0x0F, 0x22, 0xC0,                         // mov  cr0, eax
    0x66, 0xEA, 0x8B, 0x7F, 0x00, 0x00, 0x18, 0x00, // jmp 0x18:0x7f8b
    // long64: flat data selectors, fresh stack, jump to the kernel entry
    0x66, 0xB8, 0x08, 0x00,                   // mov  ax, 0x08
    0x8E, 0xD8,                               // mov  ds, ax
    0x8E, 0xC0,                               // mov  es, ax
    0x8E, 0xD0,                               // mov  ss, ax
    0x48, 0xC7, 0xC4, 0x00, 0x7C, 0x00, 0x00, // mov  rsp, 0x7c00
    0x48, 0x8B, 0x04, 0x25, 0x00, 0x82, 0x00, 0x00, // mov rax, [0x8200]
    0xFF, 0xE0,                               // jmp  rax
];

/// GDT: null, 4 GiB data (0x08), 4 GiB 32-bit code (0x10), 64-bit code (0x18).
#[rustfmt::skip]
const GDT: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00,
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00,
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xAF, 0x00,
];

// Static data offsets within the code region (absolute 0x81c0..0x8200).
const GDT_OFFSET: usize = 0x3C0;
const GDT_PTR_OFFSET: usize = 0x3E8;
const DAP_OFFSET: usize = 0x3F0;

/// Length of the full stage-2 blob for `segment_count` kernel segments.
pub(crate) fn blob_len(segment_count: usize) -> u64 {
    (CODE_REGION_LEN + HANDOFF_HEADER_LEN + segment_count * HANDOFF_ENTRY_LEN) as u64
}

/// Serialize the stage-2 blob: code, static data, handoff table.
pub(crate) fn build(entry: u64, segments: &[PlannedSegment]) -> Vec<u8> {
    let len = CODE_REGION_LEN + HANDOFF_HEADER_LEN + segments.len() * HANDOFF_ENTRY_LEN;
    let mut blob = vec![0u8; len];
    blob[..CODE.len()].copy_from_slice(&CODE);

    blob[GDT_OFFSET..GDT_OFFSET + GDT.len()].copy_from_slice(&GDT);
    // lgdt operand: limit, then 32-bit base (0x81c0).
    blob[GDT_PTR_OFFSET..GDT_PTR_OFFSET + 2].copy_from_slice(&0x1Fu16.to_le_bytes());
    blob[GDT_PTR_OFFSET + 2..GDT_PTR_OFFSET + 6].copy_from_slice(&0x81C0u32.to_le_bytes());
    // Disk-address packet template: size, reserved, count, buffer 2000:0000.
    blob[DAP_OFFSET] = 0x10;
    blob[DAP_OFFSET + 6..DAP_OFFSET + 8].copy_from_slice(&0x2000u16.to_le_bytes());

    let mut cursor = CODE_REGION_LEN;
    blob[cursor..cursor + 8].copy_from_slice(&entry.to_le_bytes());
    blob[cursor + 8..cursor + 16].copy_from_slice(&(segments.len() as u64).to_le_bytes());
    cursor += HANDOFF_HEADER_LEN;
    for segment in segments {
        blob[cursor..cursor + 8].copy_from_slice(&segment.disk_lba.to_le_bytes());
        blob[cursor + 8..cursor + 16].copy_from_slice(&segment.file_len.to_le_bytes());
        blob[cursor + 16..cursor + 24].copy_from_slice(&segment.dest.to_le_bytes());
        blob[cursor + 24..cursor + 32].copy_from_slice(&segment.mem_len.to_le_bytes());
        cursor += HANDOFF_ENTRY_LEN;
    }

    blob
}
