use kernel_image::{KernelImage, KernelImageError};

const EHSIZE: usize = 64;
const PHSIZE: usize = 56;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Seg {
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
    flags: u32,
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Build a minimal ELF64 executable with the given program headers.
/// Segment file bytes are a per-segment repeating pattern for content checks.
fn build_elf(machine: u16, entry: u64, segs: &[Seg]) -> Vec<u8> {
    let phoff = EHSIZE;
    let data_start = phoff + segs.len() * PHSIZE;
    let mut out = vec![0u8; data_start];

    out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    out[4] = 2; // ELF64
    out[5] = 1; // little-endian
    out[6] = 1; // version
    put_u16(&mut out, 16, 2); // ET_EXEC
    put_u16(&mut out, 18, machine);
    put_u32(&mut out, 20, 1);
    put_u64(&mut out, 24, entry);
    put_u64(&mut out, 32, phoff as u64);
    put_u16(&mut out, 52, EHSIZE as u16);
    put_u16(&mut out, 54, PHSIZE as u16);
    put_u16(&mut out, 56, segs.len() as u16);

    for (i, seg) in segs.iter().enumerate() {
        let off = phoff + i * PHSIZE;
        let file_offset = out.len() as u64;
        put_u32(&mut out, off, 1); // PT_LOAD
        put_u32(&mut out, off + 4, seg.flags);
        put_u64(&mut out, off + 8, file_offset);
        put_u64(&mut out, off + 16, seg.vaddr);
        put_u64(&mut out, off + 24, seg.vaddr);
        put_u64(&mut out, off + 32, seg.file_size);
        put_u64(&mut out, off + 40, seg.mem_size);
        put_u64(&mut out, off + 48, 0x1000);

        let pattern = 0x10 + i as u8;
        out.extend(std::iter::repeat_n(pattern, seg.file_size as usize));
    }

    out
}

#[test]
fn parses_segments_sorted_with_cached_footprint() {
    // Deliberately supply the higher segment first.
    let elf = build_elf(
        62,
        0x10_0000,
        &[
            Seg {
                vaddr: 0x10_2000,
                file_size: 0x800,
                mem_size: 0x1000,
                flags: PF_R | PF_W,
            },
            Seg {
                vaddr: 0x10_0000,
                file_size: 0x1000,
                mem_size: 0x1000,
                flags: PF_R | PF_X,
            },
        ],
    );

    let image = KernelImage::load(elf).expect("valid image");
    assert_eq!(image.entry(), 0x10_0000);
    assert_eq!(image.load_base(), 0x10_0000);
    // 0x10_2000 + 0x1000 - 0x10_0000
    assert_eq!(image.memory_footprint(), 0x3000);
    assert_eq!(image.file_size_total(), 0x1800);

    let segs = image.segments();
    assert_eq!(segs.len(), 2);
    assert!(segs[0].vaddr < segs[1].vaddr, "segments must be sorted");

    // The data segment was declared first, so its pattern byte is 0x10.
    let data = image.segment_bytes(&segs[1]);
    assert_eq!(data.len(), 0x800);
    assert!(data.iter().all(|&b| b == 0x10));
}

#[test]
fn zero_fill_tail_is_not_file_backed() {
    let elf = build_elf(
        62,
        0x20_0000,
        &[Seg {
            vaddr: 0x20_0000,
            file_size: 4096,
            mem_size: 8192,
            flags: PF_R | PF_X,
        }],
    );

    let image = KernelImage::load(elf).expect("valid image");
    let seg = image.segments()[0];
    assert_eq!(seg.mem_size - seg.file_size, 4096);
    assert_eq!(image.segment_bytes(&seg).len(), 4096);
}

#[test]
fn rejects_bad_magic() {
    let mut elf = build_elf(62, 0x10_0000, &[exec_seg()]);
    elf[1] = b'X';
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::MalformedExecutable { .. })
    ));
}

#[test]
fn rejects_foreign_machine_type() {
    // EM_AARCH64
    let elf = build_elf(183, 0x10_0000, &[exec_seg()]);
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::UnsupportedArchitecture { machine: 183 })
    ));
}

#[test]
fn rejects_entry_outside_any_segment() {
    let elf = build_elf(62, 0xDEAD_0000, &[exec_seg()]);
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::NoEntryPoint {
            entry: 0xDEAD_0000
        })
    ));
}

#[test]
fn rejects_entry_in_non_executable_segment() {
    let elf = build_elf(
        62,
        0x30_0000,
        &[
            Seg {
                vaddr: 0x10_0000,
                file_size: 0x100,
                mem_size: 0x100,
                flags: PF_R | PF_X,
            },
            Seg {
                vaddr: 0x30_0000,
                file_size: 0x100,
                mem_size: 0x100,
                flags: PF_R | PF_W,
            },
        ],
    );
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::NoEntryPoint { .. })
    ));
}

#[test]
fn rejects_overlapping_segments() {
    let elf = build_elf(
        62,
        0x10_0000,
        &[
            Seg {
                vaddr: 0x10_0000,
                file_size: 0x1000,
                mem_size: 0x2000,
                flags: PF_R | PF_X,
            },
            Seg {
                vaddr: 0x10_1000,
                file_size: 0x100,
                mem_size: 0x100,
                flags: PF_R | PF_W,
            },
        ],
    );
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::OverlappingSegments { .. })
    ));
}

#[test]
fn rejects_file_size_beyond_memory_size() {
    let elf = build_elf(
        62,
        0x10_0000,
        &[Seg {
            vaddr: 0x10_0000,
            file_size: 0x2000,
            mem_size: 0x1000,
            flags: PF_R | PF_X,
        }],
    );
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::FileSizeBeyondMemory { .. })
    ));
}

#[test]
fn rejects_truncated_program_header_table() {
    let mut elf = build_elf(62, 0x10_0000, &[exec_seg()]);
    // Claim more headers than the file holds.
    put_u16(&mut elf, 56, 1000);
    assert!(matches!(
        KernelImage::load(elf),
        Err(KernelImageError::MalformedExecutable { .. })
    ));
}

#[test]
fn rejects_empty_input() {
    assert!(matches!(
        KernelImage::load(Vec::new()),
        Err(KernelImageError::MalformedExecutable { .. })
    ));
}

fn exec_seg() -> Seg {
    Seg {
        vaddr: 0x10_0000,
        file_size: 0x1000,
        mem_size: 0x1000,
        flags: PF_R | PF_X,
    }
}
