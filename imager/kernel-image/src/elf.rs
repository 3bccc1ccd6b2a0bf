//! # Raw ELF64 Structures
//!
//! Field layout follows the System V gABI. Only the 64-bit little-endian
//! variant is understood; everything else is rejected before these structs
//! are ever interpreted.

use crate::KernelImageError;
use core::ptr::read_unaligned;

pub(crate) const EM_X86_64: u16 = 62;
pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const ET_DYN: u16 = 3;

const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
pub(crate) struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
pub(crate) struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Read the ELF header and the full program-header table.
///
/// All table arithmetic is checked against the byte length; a truncated or
/// self-inconsistent header surfaces as [`KernelImageError::MalformedExecutable`]
/// rather than an out-of-bounds read.
pub(crate) fn parse(bytes: &[u8]) -> Result<(Elf64Ehdr, Vec<Elf64Phdr>), KernelImageError> {
    use KernelImageError::MalformedExecutable;

    if bytes.len() < size_of::<Elf64Ehdr>() {
        return Err(MalformedExecutable {
            reason: "shorter than an ELF64 header",
        });
    }

    // SAFETY: bounds checked above; read_unaligned avoids any alignment
    // assumption about the input buffer.
    let ehdr = unsafe { read_unaligned(bytes.as_ptr().cast::<Elf64Ehdr>()) };

    if ehdr.e_ident[0..4] != EI_MAGIC_BYTES {
        return Err(MalformedExecutable {
            reason: "bad ELF magic",
        });
    }
    // Class = 2 (ELF64), Data = 1 (little-endian), Version = 1
    if ehdr.e_ident[4] != 2 || ehdr.e_ident[5] != 1 || ehdr.e_ident[6] != 1 {
        return Err(MalformedExecutable {
            reason: "not a little-endian ELF64 image",
        });
    }

    if ehdr.e_machine != EM_X86_64 {
        return Err(KernelImageError::UnsupportedArchitecture {
            machine: ehdr.e_machine,
        });
    }

    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(MalformedExecutable {
            reason: "not an executable or shared-object image",
        });
    }

    if ehdr.e_phentsize as usize != size_of::<Elf64Phdr>() {
        return Err(MalformedExecutable {
            reason: "unexpected program header entry size",
        });
    }

    let phoff = usize::try_from(ehdr.e_phoff).map_err(|_| MalformedExecutable {
        reason: "program header offset exceeds address width",
    })?;
    let phentsize = ehdr.e_phentsize as usize;
    let phnum = ehdr.e_phnum as usize;

    let table_size = phentsize.checked_mul(phnum).ok_or(MalformedExecutable {
        reason: "program header table size overflows",
    })?;
    let end = phoff.checked_add(table_size).ok_or(MalformedExecutable {
        reason: "program header table end overflows",
    })?;
    if end > bytes.len() {
        return Err(MalformedExecutable {
            reason: "program header table extends past end of file",
        });
    }

    let mut headers = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        // SAFETY: off + sizeof(Phdr) is within bytes by the bound check above.
        let ph = unsafe { read_unaligned(bytes.as_ptr().add(off).cast::<Elf64Phdr>()) };
        headers.push(ph);
    }

    Ok((ehdr, headers))
}
