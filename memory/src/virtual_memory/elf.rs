//! # ELF64 Program Loading
//!
//! Just enough of the ELF64 format to load a statically-linked executable:
//! the file header and `PT_LOAD` program headers. Section headers,
//! relocations, and dynamic linking are out of scope.

use crate::{MemError, MemResult};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// ELF program header type: loadable segment.
pub const PT_LOAD: u32 = 1;

/// Program header flag bits (standard ELF, not RISC-V specific).
pub const PF_X: u32 = 1 << 0;
/// Writable segment.
pub const PF_W: u32 = 1 << 1;
/// Readable segment.
pub const PF_R: u32 = 1 << 2;

/// A parsed `PT_LOAD` program header.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    /// Offset of the segment's initialized contents in the file.
    pub file_offset: u64,
    /// Virtual address the segment is loaded at.
    pub vaddr: u64,
    /// Number of initialized bytes, read from the file.
    pub filesz: u64,
    /// Total in-memory size; bytes beyond `filesz` are zero-filled (BSS).
    pub memsz: u64,
    /// `PF_R`/`PF_W`/`PF_X` bits.
    pub flags: u32,
}

impl LoadSegment {
    /// True if the segment is writable.
    pub fn writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    /// True if the segment is executable.
    pub fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// Entry point and loadable segments of a parsed ELF64 image.
pub struct ElfImage {
    /// Program entry point (`e_entry`).
    pub entry: u64,
    /// All `PT_LOAD` headers, in file order.
    pub segments: alloc::vec::Vec<LoadSegment>,
}

fn read_u16(buf: &[u8], off: usize) -> MemResult<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(MemError::InvalidRegion)
}

fn read_u32(buf: &[u8], off: usize) -> MemResult<u32> {
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(MemError::InvalidRegion)
}

fn read_u64(buf: &[u8], off: usize) -> MemResult<u64> {
    buf.get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte slice")))
        .ok_or(MemError::InvalidRegion)
}

/// Extract one `PT_LOAD` program header at `base` within `table`, or `None`
/// for any other header type.
fn read_load_header(table: &[u8], base: usize) -> MemResult<Option<LoadSegment>> {
    let p_type = read_u32(table, base)?;
    if p_type != PT_LOAD {
        return Ok(None);
    }
    let flags = read_u32(table, base + 4)?;
    let file_offset = read_u64(table, base + 8)?;
    let vaddr = read_u64(table, base + 16)?;
    let filesz = read_u64(table, base + 32)?;
    let memsz = read_u64(table, base + 40)?;
    if filesz > memsz {
        return Err(MemError::InvalidRegion);
    }
    Ok(Some(LoadSegment {
        file_offset,
        vaddr,
        filesz,
        memsz,
        flags,
    }))
}

/// Parse an ELF64 little-endian executable, validating the magic, class,
/// and endianness fields and returning its entry point plus `PT_LOAD`
/// segments. Rejects anything that isn't a plain little-endian 64-bit ELF.
pub fn parse(data: &[u8]) -> MemResult<ElfImage> {
    if data.len() < 64 || data[0..4] != ELF_MAGIC {
        return Err(MemError::InvalidRegion);
    }
    if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
        return Err(MemError::InvalidRegion);
    }

    let entry = read_u64(data, 24)?;
    let phoff = read_u64(data, 32)? as usize;
    let phentsize = read_u16(data, 54)? as usize;
    let phnum = read_u16(data, 56)? as usize;

    if phentsize < 56 {
        return Err(MemError::InvalidRegion);
    }

    let mut segments = alloc::vec::Vec::new();
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        let Some(seg) = read_load_header(data, base)? else {
            continue;
        };
        data.get(seg.file_offset as usize..(seg.file_offset + seg.filesz) as usize)
            .ok_or(MemError::InvalidRegion)?;
        segments.push(seg);
    }

    Ok(ElfImage { entry, segments })
}

/// Parse an ELF64 image from a [`super::FileBacking`] source without
/// pulling the whole file into memory: only the file header and program
/// header table are read eagerly. Segment contents stay on the backing
/// store and are demand-loaded page by page once the VM manager maps them.
pub fn parse_file(source: &dyn super::FileBacking) -> MemResult<ElfImage> {
    let mut head = [0u8; 64];
    let n = source.read_page(0, &mut head)?;
    if n < 64 || head[0..4] != ELF_MAGIC {
        return Err(MemError::InvalidRegion);
    }
    if head[4] != ELFCLASS64 || head[5] != ELFDATA2LSB {
        return Err(MemError::InvalidRegion);
    }

    let entry = read_u64(&head, 24)?;
    let phoff = read_u64(&head, 32)?;
    let phentsize = read_u16(&head, 54)? as usize;
    let phnum = read_u16(&head, 56)? as usize;
    if phentsize < 56 {
        return Err(MemError::InvalidRegion);
    }

    let table_len = phentsize * phnum;
    let mut table = alloc::vec![0u8; table_len];
    if table_len > 0 {
        let n = source.read_page(phoff, &mut table)?;
        if n < table_len {
            return Err(MemError::InvalidRegion);
        }
    }

    let mut segments = alloc::vec::Vec::new();
    for i in 0..phnum {
        if let Some(seg) = read_load_header(&table, i * phentsize)? {
            segments.push(seg);
        }
    }

    Ok(ElfImage { entry, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Build a minimal two-segment ELF64 (one RX text segment, one RW
    /// data segment with trailing BSS) for exec tests.
    pub fn build_two_segment_elf(text: &[u8], data: &[u8], bss_extra: u64) -> Vec<u8> {
        let text_vaddr: u64 = 0x1000;
        let data_vaddr: u64 = 0x2000;
        let ehsize = 64u64;
        let phentsize = 56u64;
        let phoff = ehsize;
        let phnum = 2u64;
        let text_off = phoff + phentsize * phnum;
        let data_off = text_off + text.len() as u64;

        let mut buf = Vec::new();
        buf.extend_from_slice(&ELF_MAGIC);
        buf.push(ELFCLASS64);
        buf.push(ELFDATA2LSB);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(&2u16.to_le_bytes()); // e_type
        buf.extend_from_slice(&0xF3u16.to_le_bytes()); // e_machine
        buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        buf.extend_from_slice(&text_vaddr.to_le_bytes()); // e_entry @24
        buf.extend_from_slice(&phoff.to_le_bytes()); // e_phoff @32
        buf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff @40
        buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags @48
        buf.extend_from_slice(&(ehsize as u16).to_le_bytes()); // e_ehsize @52
        buf.extend_from_slice(&(phentsize as u16).to_le_bytes()); // e_phentsize @54
        buf.extend_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum @56
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize @58
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum @60
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx @62
        debug_assert_eq!(buf.len() as u64, ehsize);

        // text PT_LOAD
        buf.extend_from_slice(&PT_LOAD.to_le_bytes());
        buf.extend_from_slice(&(PF_R | PF_X).to_le_bytes());
        buf.extend_from_slice(&text_off.to_le_bytes());
        buf.extend_from_slice(&text_vaddr.to_le_bytes());
        buf.extend_from_slice(&text_vaddr.to_le_bytes()); // p_paddr (unused)
        buf.extend_from_slice(&(text.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(text.len() as u64).to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

        // data PT_LOAD (with BSS growth)
        buf.extend_from_slice(&PT_LOAD.to_le_bytes());
        buf.extend_from_slice(&(PF_R | PF_W).to_le_bytes());
        buf.extend_from_slice(&data_off.to_le_bytes());
        buf.extend_from_slice(&data_vaddr.to_le_bytes());
        buf.extend_from_slice(&data_vaddr.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(data.len() as u64 + bss_extra).to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());

        debug_assert_eq!(buf.len() as u64, text_off);
        buf.extend_from_slice(text);
        debug_assert_eq!(buf.len() as u64, data_off);
        buf.extend_from_slice(data);

        buf
    }

    #[test]
    fn parses_two_load_segments() {
        let image = build_two_segment_elf(&[0x13, 0x00, 0x00, 0x00], &[1, 2, 3, 4], 4096);
        let elf = parse(&image).unwrap();
        assert_eq!(elf.entry, 0x1000);
        assert_eq!(elf.segments.len(), 2);
        assert_eq!(elf.segments[0].vaddr, 0x1000);
        assert!(elf.segments[0].executable());
        assert!(!elf.segments[0].writable());
        assert_eq!(elf.segments[1].vaddr, 0x2000);
        assert!(elf.segments[1].writable());
        assert_eq!(elf.segments[1].memsz, elf.segments[1].filesz + 4096);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = build_two_segment_elf(&[0u8; 4], &[0u8; 4], 0);
        image[0] = 0;
        assert!(parse(&image).is_err());
    }
}
