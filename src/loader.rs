//! `.r5m` image loader.
//!
//! An image is a fixed 64-byte little-endian header followed by the raw
//! section payloads. The loader sizes VM memory to the smallest power of
//! two that fits the image (plus stack headroom), copies code and data to
//! the load address, and hands back a reset [`Cpu`]. The bss section is
//! implicitly zero because memory starts zeroed.

use thiserror::Error;
use tracing::debug;

use crate::cpu::{Cpu, SectionLayout, VmError};

/// Header identifier, "r5vm" in little-endian byte order.
pub const MAGIC: u32 = 0x6d76_3572;

/// Size of the fixed image header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Flag bit 0: image was built for a 64-bit target, which this VM does
/// not execute.
const FLAG_64BIT: u16 = 1;

/// Minimum headroom added above the image for guest stack and heap.
const MIN_HEADROOM: u64 = 64 * 1024;

/// Largest memory a guest may be given; the address space is 32-bit.
const MAX_MEM_SIZE: u64 = 1 << 31;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image is shorter than the {HEADER_SIZE}-byte header")]
    TruncatedHeader,
    #[error("invalid image magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported image flags {0:#06x} (64-bit images are not supported)")]
    UnsupportedFlags(u16),
    #[error("{section} section at {offset:#x}+{size:#x} lies outside the image file")]
    SectionOutOfFile {
        section: &'static str,
        offset: u32,
        size: u32,
    },
    #[error("image requires more memory than the 32-bit address space allows")]
    ImageTooLarge,
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Parsed `.r5m` header fields.
#[derive(Debug, Clone, Copy)]
struct ImageHeader {
    version: u16,
    entry: u32,
    load_addr: u32,
    code_offset: u32,
    code_size: u32,
    data_offset: u32,
    data_size: u32,
    bss_size: u32,
    total_size: u32,
}

fn le16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn le32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

impl ImageHeader {
    fn parse(image: &[u8]) -> Result<ImageHeader, ImageError> {
        if image.len() < HEADER_SIZE {
            return Err(ImageError::TruncatedHeader);
        }

        let magic = le32(image, 0);
        if magic != MAGIC {
            return Err(ImageError::BadMagic(magic));
        }

        let flags = le16(image, 6);
        if flags & FLAG_64BIT != 0 {
            return Err(ImageError::UnsupportedFlags(flags));
        }

        Ok(ImageHeader {
            version: le16(image, 4),
            entry: le32(image, 8),
            load_addr: le32(image, 12),
            code_offset: le32(image, 16),
            code_size: le32(image, 20),
            data_offset: le32(image, 24),
            data_size: le32(image, 28),
            bss_size: le32(image, 32),
            total_size: le32(image, 36),
        })
    }
}

/// Picks the memory size: the smallest power of two that covers the
/// declared RAM requirement, the loaded image plus headroom, and any
/// caller override.
fn memory_size(header: &ImageHeader, override_size: usize) -> Result<usize, ImageError> {
    let image = header.code_size as u64 + header.data_size as u64 + header.bss_size as u64;
    let load_end = header.load_addr as u64 + image;

    // Heuristic headroom for the guest stack: +25%, at least 64 KiB.
    let mut want = image + (image / 4).max(MIN_HEADROOM);
    want = want
        .max(header.total_size as u64)
        .max(load_end)
        .max(override_size as u64);

    if want > MAX_MEM_SIZE {
        return Err(ImageError::ImageTooLarge);
    }

    let mut size = 64u64;
    while size < want {
        size *= 2;
    }
    Ok(size as usize)
}

fn file_section<'a>(
    image: &'a [u8],
    section: &'static str,
    offset: u32,
    size: u32,
) -> Result<&'a [u8], ImageError> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .filter(|&end| end <= image.len())
        .ok_or(ImageError::SectionOutOfFile {
            section,
            offset,
            size,
        })?;
    Ok(&image[start..end])
}

/// Parses `image`, allocates VM memory (honoring `override_size` as a
/// lower bound when nonzero) and returns a VM reset to the image entry.
pub fn load_image(image: &[u8], override_size: usize) -> Result<Cpu, ImageError> {
    let header = ImageHeader::parse(image)?;

    let code = file_section(image, "code", header.code_offset, header.code_size)?;
    let data = file_section(image, "data", header.data_offset, header.data_size)?;

    // The sizing above covers load_addr + code + data + bss, so the
    // copies below always fit.
    let mem_size = memory_size(&header, override_size)?;
    let mut mem = vec![0u8; mem_size].into_boxed_slice();

    let load_addr = header.load_addr as usize;
    mem[load_addr..load_addr + code.len()].copy_from_slice(code);
    mem[load_addr + code.len()..load_addr + code.len() + data.len()].copy_from_slice(data);

    let mask = (mem_size - 1) as u32;
    let layout = SectionLayout {
        code_offset: header.load_addr,
        code_size: header.code_size,
        data_offset: header.load_addr + header.code_size,
        data_size: header.data_size,
        bss_offset: header.load_addr + header.code_size + header.data_size,
        bss_size: header.bss_size,
        entry: header.entry & mask,
    };

    debug!(
        version = header.version,
        mem_size,
        entry = format_args!("{:#x}", layout.entry),
        code = header.code_size,
        data = header.data_size,
        bss = header.bss_size,
        "image loaded"
    );

    Ok(Cpu::new(mem, layout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal image: header + code words + data bytes.
    fn image(entry: u32, load_addr: u32, code: &[u32], data: &[u8], bss: u32) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE];
        let code_off = out.len() as u32;
        for word in code {
            out.extend_from_slice(&word.to_le_bytes());
        }
        let data_off = out.len() as u32;
        out.extend_from_slice(data);

        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&1u16.to_le_bytes()); // version
        out[6..8].copy_from_slice(&0u16.to_le_bytes()); // flags
        out[8..12].copy_from_slice(&entry.to_le_bytes());
        out[12..16].copy_from_slice(&load_addr.to_le_bytes());
        out[16..20].copy_from_slice(&code_off.to_le_bytes());
        out[20..24].copy_from_slice(&((code.len() * 4) as u32).to_le_bytes());
        out[24..28].copy_from_slice(&data_off.to_le_bytes());
        out[28..32].copy_from_slice(&(data.len() as u32).to_le_bytes());
        out[32..36].copy_from_slice(&bss.to_le_bytes());
        out[36..40].copy_from_slice(&0u32.to_le_bytes()); // total_size
        out
    }

    #[test]
    fn loads_sections_and_records_layout() {
        let img = image(0x40, 0x40, &[0x0000_0013, 0x0010_0073], &[0xAB, 0xCD], 16);
        let cpu = load_image(&img, 0).unwrap();

        assert_eq!(cpu.layout.code_offset, 0x40);
        assert_eq!(cpu.layout.code_size, 8);
        assert_eq!(cpu.layout.data_offset, 0x48);
        assert_eq!(cpu.layout.data_size, 2);
        assert_eq!(cpu.layout.bss_offset, 0x4A);
        assert_eq!(cpu.layout.bss_size, 16);
        assert_eq!(cpu.pc, 0x40);

        assert_eq!(cpu.load(0x40, 4), 0x0000_0013);
        assert_eq!(cpu.load(0x48, 1), 0xAB);
        assert_eq!(cpu.load(0x49, 1), 0xCD);
        // bss starts zeroed
        assert_eq!(cpu.load(0x4A, 4), 0);
    }

    #[test]
    fn memory_is_a_power_of_two_with_headroom() {
        let img = image(0, 0, &[0x13], &[], 0);
        let cpu = load_image(&img, 0).unwrap();
        let size = cpu.mem_size();
        assert!(size.is_power_of_two());
        assert!(size >= 64 * 1024);
    }

    #[test]
    fn override_raises_memory_size() {
        let img = image(0, 0, &[0x13], &[], 0);
        let cpu = load_image(&img, 512 * 1024).unwrap();
        assert_eq!(cpu.mem_size(), 512 * 1024);

        let cpu = load_image(&img, 300 * 1024).unwrap();
        assert_eq!(cpu.mem_size(), 512 * 1024); // rounded up to a power of two
    }

    #[test]
    fn entry_is_masked() {
        let img = image(0xFFFF_0040, 0x40, &[0x13], &[], 0);
        let cpu = load_image(&img, 0).unwrap();
        assert_eq!(cpu.pc as usize, 0xFFFF_0040 & (cpu.mem_size() - 1));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut img = image(0, 0, &[0x13], &[], 0);
        img[0] = b'X';
        assert!(matches!(
            load_image(&img, 0),
            Err(ImageError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_64bit_flag() {
        let mut img = image(0, 0, &[0x13], &[], 0);
        img[6] = 1;
        assert!(matches!(
            load_image(&img, 0),
            Err(ImageError::UnsupportedFlags(1))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            load_image(&[0u8; 10], 0),
            Err(ImageError::TruncatedHeader)
        ));
    }

    #[test]
    fn rejects_truncated_code_section() {
        let mut img = image(0, 0, &[0x13, 0x13, 0x13], &[], 0);
        img.truncate(HEADER_SIZE + 4);
        assert!(matches!(
            load_image(&img, 0),
            Err(ImageError::SectionOutOfFile { section: "code", .. })
        ));
    }
}
