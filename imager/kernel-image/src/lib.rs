//! # Kernel Executable Parsing
//!
//! Turns a freestanding x86-64 kernel executable into an immutable
//! [`KernelImage`]: the entry point, the `PT_LOAD` segments sorted by
//! virtual address, and the cached memory footprint the image assemblers
//! size their payload regions from.
//!
//! Parsing is pure (no I/O, no mutation of the input) and every header
//! field is bounds-checked before use. The parsed image owns the executable
//! bytes so downstream consumers can slice segment payloads without holding
//! a borrow on the original buffer.

mod elf;

use elf::{Elf64Phdr, PT_LOAD};
use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum KernelImageError {
    #[error("malformed kernel executable: {reason}")]
    MalformedExecutable { reason: &'static str },
    #[error("unsupported target machine type {machine:#06x}, expected x86-64")]
    UnsupportedArchitecture { machine: u16 },
    #[error("entry point {entry:#x} is not contained in any executable segment")]
    NoEntryPoint { entry: u64 },
    #[error("segments at {first:#x} and {second:#x} overlap in virtual address space")]
    OverlappingSegments { first: u64, second: u64 },
    #[error("segment at {vaddr:#x} declares file size {file_size:#x} beyond its memory size {mem_size:#x}")]
    FileSizeBeyondMemory {
        vaddr: u64,
        file_size: u64,
        mem_size: u64,
    },
}

/// Permission bits of an ELF `p_flags` word (LSB→MSB: execute, write, read).
#[bitfield_struct::bitfield(u32)]
pub struct SegmentFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// One loadable segment of the kernel executable.
///
/// `file_size` bytes at `file_offset` back the segment on disk; the
/// remaining `mem_size - file_size` bytes are zero-fill (BSS tail).
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: SegmentFlags,
    pub align: u64,
}

impl Segment {
    /// Exclusive end of the segment's virtual address range.
    #[must_use]
    pub const fn vaddr_end(&self) -> u64 {
        self.vaddr + self.mem_size
    }
}

/// Parsed, validated view of a kernel executable. Immutable once constructed.
#[derive(Debug)]
pub struct KernelImage {
    bytes: Vec<u8>,
    entry: u64,
    segments: Vec<Segment>,
    load_base: u64,
    memory_footprint: u64,
}

impl KernelImage {
    /// Parse and validate a kernel executable.
    ///
    /// On success the segment list is sorted by ascending virtual address,
    /// segments are pairwise disjoint, and the total memory footprint is
    /// computed and cached.
    ///
    /// # Errors
    ///
    /// [`KernelImageError::MalformedExecutable`] for header or bounds
    /// defects, [`KernelImageError::UnsupportedArchitecture`] for non-x86-64
    /// machine types, [`KernelImageError::NoEntryPoint`] when the declared
    /// entry lies outside every executable segment, and the segment-invariant
    /// variants for overlapping or size-inverted segments.
    pub fn load(bytes: Vec<u8>) -> Result<Self, KernelImageError> {
        let (ehdr, headers) = elf::parse(&bytes)?;

        let mut segments = Vec::new();
        for ph in &headers {
            if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
                continue;
            }
            segments.push(segment_from_header(ph, bytes.len())?);
        }

        if segments.is_empty() {
            return Err(KernelImageError::MalformedExecutable {
                reason: "no loadable segments",
            });
        }

        segments.sort_by_key(|seg| seg.vaddr);

        for pair in segments.windows(2) {
            if pair[1].vaddr < pair[0].vaddr_end() {
                return Err(KernelImageError::OverlappingSegments {
                    first: pair[0].vaddr,
                    second: pair[1].vaddr,
                });
            }
        }

        let entry = ehdr.e_entry;
        let covered = segments
            .iter()
            .any(|seg| seg.flags.execute() && (seg.vaddr..seg.vaddr_end()).contains(&entry));
        if !covered {
            return Err(KernelImageError::NoEntryPoint { entry });
        }

        let load_base = segments[0].vaddr;
        let top = segments
            .last()
            .map_or(load_base, Segment::vaddr_end);
        let memory_footprint = top - load_base;

        debug!(
            "kernel image: entry={entry:#x} base={load_base:#x} footprint={memory_footprint:#x} segments={}",
            segments.len()
        );

        Ok(Self {
            bytes,
            entry,
            segments,
            load_base,
            memory_footprint,
        })
    }

    /// Virtual address execution starts at.
    #[must_use]
    pub const fn entry(&self) -> u64 {
        self.entry
    }

    /// Loadable segments, sorted by ascending virtual address.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Lowest segment start address, the executable's preferred load base.
    #[must_use]
    pub const fn load_base(&self) -> u64 {
        self.load_base
    }

    /// Highest segment end minus lowest segment start, cached at parse time.
    #[must_use]
    pub const fn memory_footprint(&self) -> u64 {
        self.memory_footprint
    }

    /// Sum of the file-backed sizes of all segments.
    #[must_use]
    pub fn file_size_total(&self) -> u64 {
        self.segments.iter().map(|seg| seg.file_size).sum()
    }

    /// The complete executable as read from disk.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The file-backed bytes of one segment.
    ///
    /// The range was validated during [`load`](Self::load); slicing cannot
    /// go out of bounds for any segment obtained from this image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segment_bytes(&self, segment: &Segment) -> &[u8] {
        // file_offset + file_size <= bytes.len() was checked at load time.
        let start = segment.file_offset as usize;
        let end = (segment.file_offset + segment.file_size) as usize;
        &self.bytes[start..end]
    }
}

fn segment_from_header(ph: &Elf64Phdr, file_len: usize) -> Result<Segment, KernelImageError> {
    use KernelImageError::MalformedExecutable;

    if ph.p_filesz > ph.p_memsz {
        return Err(KernelImageError::FileSizeBeyondMemory {
            vaddr: ph.p_vaddr,
            file_size: ph.p_filesz,
            mem_size: ph.p_memsz,
        });
    }

    let file_end = ph
        .p_offset
        .checked_add(ph.p_filesz)
        .ok_or(MalformedExecutable {
            reason: "segment file range overflows",
        })?;
    if file_end > file_len as u64 {
        return Err(MalformedExecutable {
            reason: "segment file range extends past end of file",
        });
    }

    ph.p_vaddr
        .checked_add(ph.p_memsz)
        .ok_or(MalformedExecutable {
            reason: "segment virtual range overflows the address space",
        })?;

    Ok(Segment {
        vaddr: ph.p_vaddr,
        file_offset: ph.p_offset,
        file_size: ph.p_filesz,
        mem_size: ph.p_memsz,
        flags: SegmentFlags::from_bits(ph.p_flags),
        align: ph.p_align,
    })
}
