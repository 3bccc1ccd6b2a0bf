//! Synthesized UEFI application stub (`BOOTX64.EFI`).
//!
//! A minimal but well-formed PE32+ image for the x86-64 EFI application
//! subsystem, assembled byte-exactly: DOS header, COFF/optional headers,
//! `.text` with the loader code, `.data` with protocol GUIDs and the kernel
//! path. The code opens `\EFI\BOOT\KERNEL.ELF` on its own volume through
//! the Simple File System protocol, reads it into a staging allocation,
//! places every `PT_LOAD` segment at its load address (zero-filling the
//! BSS tail) and jumps to the ELF entry point.
//!
//! RIP-relative references from `.text` into `.data` are patch slots filled
//! in by [`build`] once section addresses are fixed, the same way the BIOS
//! boot sector gets its disk-address packet patched.

use uguid::{Guid, guid};

const LOADED_IMAGE_GUID: Guid = guid!("5b1b31a1-9562-11d2-8e3f-00a0c969723b");
const SIMPLE_FILE_SYSTEM_GUID: Guid = guid!("964e5b22-6459-11d2-8e39-00a0c969723b");

const KERNEL_PATH: &str = "\\EFI\\BOOT\\KERNEL.ELF";

const FILE_ALIGN: usize = 0x200;
const SECTION_ALIGN: u32 = 0x1000;
const TEXT_RVA: u32 = 0x1000;
const DATA_RVA: u32 = 0x2000;
const IMAGE_BASE: u64 = 0x1_4000_0000;

/// EFI application subsystem id.
const SUBSYSTEM_EFI_APPLICATION: u16 = 10;
/// EXECUTABLE_IMAGE | RELOCS_STRIPPED | LARGE_ADDRESS_AWARE.
const IMAGE_CHARACTERISTICS: u16 = 0x0023;

/// Loader code, origin RVA 0x1000. Zeroed dword slots are RIP displacements
/// into `.data`, patched by [`build`].
#[rustfmt::skip]
const CODE: [u8; 0x12B] = [
    0xEB, 0x03,                                     // jmp  main
    0xF4,                                           // fail: hlt
    0xEB, 0xFD,                                     // jmp  fail
    // main: rcx = image handle, rdx = system table
    0x48, 0x83, 0xEC, 0x58,                         // sub  rsp, 0x58
    0x49, 0x89, 0xCC,                               // mov  r12, rcx
    0x49, 0x89, 0xD5,                               // mov  r13, rdx
    0x4D, 0x8B, 0x75, 0x60,                         // mov  r14, [r13+0x60] (BootServices)
    // HandleProtocol(image, &loaded_image_guid, &slot40)
    0x4C, 0x89, 0xE1,                               // mov  rcx, r12
    0x48, 0x8D, 0x15, 0x00, 0x00, 0x00, 0x00,       // lea  rdx, [rip+guid_loaded_image]
    0x4C, 0x8D, 0x44, 0x24, 0x40,                   // lea  r8, [rsp+0x40]
    0x41, 0xFF, 0x96, 0x98, 0x00, 0x00, 0x00,       // call [r14+0x98]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0xD0, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // HandleProtocol(loaded_image->DeviceHandle, &sfs_guid, &slot40)
    0x48, 0x8B, 0x4C, 0x24, 0x40,                   // mov  rcx, [rsp+0x40]
    0x48, 0x8B, 0x49, 0x18,                         // mov  rcx, [rcx+0x18]
    0x48, 0x8D, 0x15, 0x00, 0x00, 0x00, 0x00,       // lea  rdx, [rip+guid_sfs]
    0x4C, 0x8D, 0x44, 0x24, 0x40,                   // lea  r8, [rsp+0x40]
    0x41, 0xFF, 0x96, 0x98, 0x00, 0x00, 0x00,       // call [r14+0x98]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0xAB, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // sfs->OpenVolume(&root)
    0x48, 0x8B, 0x4C, 0x24, 0x40,                   // mov  rcx, [rsp+0x40]
    0x48, 0x8D, 0x54, 0x24, 0x48,                   // lea  rdx, [rsp+0x48]
    0xFF, 0x51, 0x08,                               // call [rcx+0x08]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0x95, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // root->Open(&file, path, READ, 0)
    0x48, 0x8B, 0x4C, 0x24, 0x48,                   // mov  rcx, [rsp+0x48]
    0x48, 0x8D, 0x54, 0x24, 0x40,                   // lea  rdx, [rsp+0x40]
    0x4C, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00,       // lea  r8, [rip+kernel_path]
    0x41, 0xB9, 0x01, 0x00, 0x00, 0x00,             // mov  r9d, 1 (EFI_FILE_MODE_READ)
    0x48, 0xC7, 0x44, 0x24, 0x20, 0x00, 0x00, 0x00, 0x00, // mov qword [rsp+0x20], 0
    0xFF, 0x51, 0x08,                               // call [rcx+0x08]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0x69, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // AllocatePages(AnyPages, LoaderData, 0x4000, &slot30) - 64 MiB staging
    0x31, 0xC9,                                     // xor  ecx, ecx
    0xBA, 0x02, 0x00, 0x00, 0x00,                   // mov  edx, 2
    0x41, 0xB8, 0x00, 0x40, 0x00, 0x00,             // mov  r8d, 0x4000
    0x4C, 0x8D, 0x4C, 0x24, 0x30,                   // lea  r9, [rsp+0x30]
    0x41, 0xFF, 0x56, 0x28,                         // call [r14+0x28]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0x4A, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // file->Read(&size, staging)
    0x48, 0x8B, 0x4C, 0x24, 0x40,                   // mov  rcx, [rsp+0x40]
    0x48, 0xC7, 0x44, 0x24, 0x38, 0x00, 0x00, 0x00, 0x04, // mov qword [rsp+0x38], 64 MiB
    0x48, 0x8D, 0x54, 0x24, 0x38,                   // lea  rdx, [rsp+0x38]
    0x4C, 0x8B, 0x44, 0x24, 0x30,                   // mov  r8, [rsp+0x30]
    0xFF, 0x51, 0x20,                               // call [rcx+0x20]
    0x48, 0x85, 0xC0,                               // test rax, rax
    0x0F, 0x85, 0x26, 0xFF, 0xFF, 0xFF,             // jnz  fail
    // walk the program headers: rbx = staging base
    0x48, 0x8B, 0x5C, 0x24, 0x30,                   // mov  rbx, [rsp+0x30]
    0x48, 0x8B, 0x73, 0x20,                         // mov  rsi, [rbx+0x20] (e_phoff)
    0x48, 0x01, 0xDE,                               // add  rsi, rbx
    0x0F, 0xB7, 0x4B, 0x38,                         // movzx ecx, word [rbx+0x38] (e_phnum)
    // phdr_loop:
    0x85, 0xC9,                                     // test ecx, ecx
    0x74, 0x35,                                     // jz   enter
    0x51,                                           // push rcx
    0x56,                                           // push rsi
    0x83, 0x3E, 0x01,                               // cmp  dword [rsi], 1 (PT_LOAD)
    0x75, 0x24,                                     // jne  skip
    0x48, 0x8B, 0x7E, 0x10,                         // mov  rdi, [rsi+0x10] (p_vaddr)
    0x48, 0x8B, 0x4E, 0x20,                         // mov  rcx, [rsi+0x20] (p_filesz)
    0x48, 0x8B, 0x46, 0x08,                         // mov  rax, [rsi+0x08] (p_offset)
    0x48, 0x8B, 0x56, 0x28,                         // mov  rdx, [rsi+0x28] (p_memsz)
    0x48, 0x8D, 0x34, 0x03,                         // lea  rsi, [rbx+rax]
    0x48, 0x29, 0xCA,                               // sub  rdx, rcx
    0xF3, 0xA4,                                     // rep movsb (payload)
    0x48, 0x89, 0xD1,                               // mov  rcx, rdx
    0x31, 0xC0,                                     // xor  eax, eax
    0xF3, 0xAA,                                     // rep stosb (BSS tail)
    0xEB, 0x02,                                     // jmp  skip
    0x90, 0x90,                                     // (pad)
    // skip:
    0x5E,                                           // pop  rsi
    0x59,                                           // pop  rcx
    0x48, 0x83, 0xC6, 0x38,                         // add  rsi, 56
    0xFF, 0xC9,                                     // dec  ecx
    0xEB, 0xC7,                                     // jmp  phdr_loop
    // enter:
    0x48, 0x8B, 0x43, 0x18,                         // mov  rax, [rbx+0x18] (e_entry)
    0xFF, 0xE0,                                     // jmp  rax
];

/// RIP displacement slots: (slot offset, next-instruction offset, data offset).
const RIP_SLOTS: [(usize, usize, u32); 3] = [
    (0x19, 0x1D, 0),  // guid_loaded_image
    (0x3E, 0x42, 16), // guid_sfs
    (0x7A, 0x7E, 32), // kernel_path
];

fn data_section() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&LOADED_IMAGE_GUID.to_bytes());
    data.extend_from_slice(&SIMPLE_FILE_SYSTEM_GUID.to_bytes());
    for unit in KERNEL_PATH.encode_utf16() {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data.extend_from_slice(&[0, 0]);
    data
}

const fn file_align(len: usize) -> usize {
    (len + FILE_ALIGN - 1) & !(FILE_ALIGN - 1)
}

/// Assemble the PE32+ stub image. Deterministic: identical on every run.
#[allow(clippy::cast_possible_truncation, clippy::too_many_lines)]
pub(crate) fn build() -> Vec<u8> {
    let data = data_section();

    let mut text = CODE.to_vec();
    for (slot, next, data_off) in RIP_SLOTS {
        let target = DATA_RVA + data_off;
        let disp = i64::from(target) - i64::from(TEXT_RVA + next as u32);
        text[slot..slot + 4].copy_from_slice(&(disp as i32).to_le_bytes());
    }

    let text_raw = file_align(text.len());
    let data_raw = file_align(data.len());
    let headers_raw = FILE_ALIGN;
    let text_ptr = headers_raw;
    let data_ptr = text_ptr + text_raw;

    let mut image = vec![0u8; data_ptr + data_raw];

    // DOS header: magic and the offset of the PE signature.
    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());

    // PE signature and COFF header.
    image[0x40..0x44].copy_from_slice(b"PE\0\0");
    let coff = 0x44;
    image[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes()); // x86-64
    image[coff + 2..coff + 4].copy_from_slice(&2u16.to_le_bytes()); // sections
    // Timestamp, symbol table: zero for determinism.
    image[coff + 16..coff + 18].copy_from_slice(&0xF0u16.to_le_bytes()); // optional header size
    image[coff + 18..coff + 20].copy_from_slice(&IMAGE_CHARACTERISTICS.to_le_bytes());

    // Optional header, PE32+.
    let opt = coff + 20;
    image[opt..opt + 2].copy_from_slice(&0x020Bu16.to_le_bytes());
    image[opt + 4..opt + 8].copy_from_slice(&(text.len() as u32).to_le_bytes()); // code size
    image[opt + 8..opt + 12].copy_from_slice(&(data.len() as u32).to_le_bytes()); // init data
    image[opt + 16..opt + 20].copy_from_slice(&TEXT_RVA.to_le_bytes()); // entry point
    image[opt + 20..opt + 24].copy_from_slice(&TEXT_RVA.to_le_bytes()); // code base
    image[opt + 24..opt + 32].copy_from_slice(&IMAGE_BASE.to_le_bytes());
    image[opt + 32..opt + 36].copy_from_slice(&SECTION_ALIGN.to_le_bytes());
    image[opt + 36..opt + 40].copy_from_slice(&(FILE_ALIGN as u32).to_le_bytes());
    image[opt + 64..opt + 68].copy_from_slice(&0x3000u32.to_le_bytes()); // image size
    image[opt + 68..opt + 72].copy_from_slice(&(headers_raw as u32).to_le_bytes());
    image[opt + 80..opt + 82].copy_from_slice(&SUBSYSTEM_EFI_APPLICATION.to_le_bytes());
    image[opt + 96..opt + 104].copy_from_slice(&0x10000u64.to_le_bytes()); // stack reserve
    image[opt + 104..opt + 112].copy_from_slice(&0x1000u64.to_le_bytes()); // stack commit
    image[opt + 112..opt + 120].copy_from_slice(&0x10000u64.to_le_bytes()); // heap reserve
    image[opt + 120..opt + 128].copy_from_slice(&0x1000u64.to_le_bytes()); // heap commit
    image[opt + 132..opt + 136].copy_from_slice(&16u32.to_le_bytes()); // data directories

    // Section table.
    let sect = opt + 0xF0;
    write_section(
        &mut image,
        sect,
        b".text\0\0\0",
        text.len() as u32,
        TEXT_RVA,
        text_raw as u32,
        text_ptr as u32,
        0x6000_0020, // code | execute | read
    );
    write_section(
        &mut image,
        sect + 40,
        b".data\0\0\0",
        data.len() as u32,
        DATA_RVA,
        data_raw as u32,
        data_ptr as u32,
        0xC000_0040, // initialized | read | write
    );

    image[text_ptr..text_ptr + text.len()].copy_from_slice(&text);
    image[data_ptr..data_ptr + data.len()].copy_from_slice(&data);
    image
}

#[allow(clippy::too_many_arguments)]
fn write_section(
    image: &mut [u8],
    off: usize,
    name: &[u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    raw_size: u32,
    raw_ptr: u32,
    characteristics: u32,
) {
    image[off..off + 8].copy_from_slice(name);
    image[off + 8..off + 12].copy_from_slice(&virtual_size.to_le_bytes());
    image[off + 12..off + 16].copy_from_slice(&virtual_address.to_le_bytes());
    image[off + 16..off + 20].copy_from_slice(&raw_size.to_le_bytes());
    image[off + 20..off + 24].copy_from_slice(&raw_ptr.to_le_bytes());
    image[off + 36..off + 40].copy_from_slice(&characteristics.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::build;

    #[test]
    fn stub_is_a_pe32plus_efi_application() {
        let stub = build();
        assert_eq!(&stub[0..2], b"MZ");

        let pe_off = u32::from_le_bytes(stub[0x3C..0x40].try_into().unwrap()) as usize;
        assert_eq!(&stub[pe_off..pe_off + 4], b"PE\0\0");

        let coff = pe_off + 4;
        let machine = u16::from_le_bytes(stub[coff..coff + 2].try_into().unwrap());
        assert_eq!(machine, 0x8664);

        let opt = coff + 20;
        let magic = u16::from_le_bytes(stub[opt..opt + 2].try_into().unwrap());
        assert_eq!(magic, 0x020B, "PE32+ magic");
        let subsystem = u16::from_le_bytes(stub[opt + 80..opt + 82].try_into().unwrap());
        assert_eq!(subsystem, 10, "EFI application subsystem");
    }

    #[test]
    fn stub_is_deterministic() {
        assert_eq!(build(), build());
    }
}
