//! ELF section table decoding

use elf::abi::{PT_LOAD, SHF_ALLOC, SHT_PROGBITS};
use elf::endian::AnyEndian;
use elf::segment::ProgramHeader;
use elf::ElfBytes;
use tracing::trace;

use super::{FirmwareImage, ImageFormat, MalformedImage};

pub(super) fn parse(raw: &[u8]) -> Result<FirmwareImage, MalformedImage> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(raw)
        .map_err(|e| MalformedImage::Elf(e.to_string()))?;

    let (shdrs, strtab) = file
        .section_headers_with_strtab()
        .map_err(|e| MalformedImage::Elf(e.to_string()))?;
    let shdrs =
        shdrs.ok_or_else(|| MalformedImage::Elf("missing section header table".to_string()))?;

    let loads: Vec<ProgramHeader> = file
        .segments()
        .map(|table| table.iter().filter(|p| p.p_type == PT_LOAD).collect())
        .unwrap_or_default();

    let mut pieces = Vec::new();
    for shdr in shdrs.iter() {
        let name = strtab
            .as_ref()
            .and_then(|t| t.get(shdr.sh_name as usize).ok())
            .unwrap_or("?");

        let allocated = shdr.sh_flags & SHF_ALLOC as u64 != 0;
        if shdr.sh_type != SHT_PROGBITS || !allocated || shdr.sh_size == 0 {
            trace!(section = name, "Skipping non-loadable section");
            continue;
        }

        let start = shdr.sh_offset;
        let end = start
            .checked_add(shdr.sh_size)
            .filter(|end| *end <= raw.len() as u64)
            .ok_or_else(|| MalformedImage::OutOfBounds {
                what: format!("section {}", name),
                offset: shdr.sh_offset,
                len: shdr.sh_size,
                size: raw.len(),
            })?;

        let lma = match load_address(&loads, shdr.sh_offset, shdr.sh_size) {
            Some(lma) => lma?,
            None => shdr.sh_addr,
        };
        let address = u32::try_from(lma).map_err(|_| MalformedImage::AddressRange(lma))?;

        trace!(
            section = name,
            address = %format!("{:#010x}", address),
            size = shdr.sh_size,
            "Loadable section"
        );
        pieces.push((address, raw[start as usize..end as usize].to_vec()));
    }

    let entry_point = u32::try_from(file.ehdr.e_entry).ok();
    FirmwareImage::from_pieces(ImageFormat::Elf, pieces, entry_point)
}

/// Physical address for section bytes stored at `offset..offset + size` in
/// the file, taken from the `PT_LOAD` header whose file image contains them.
fn load_address(
    loads: &[ProgramHeader],
    offset: u64,
    size: u64,
) -> Option<Result<u64, MalformedImage>> {
    loads
        .iter()
        .find(|p| {
            offset >= p.p_offset
                && offset.saturating_add(size) <= p.p_offset.saturating_add(p.p_filesz)
        })
        .map(|p| {
            p.p_paddr
                .checked_add(offset - p.p_offset)
                .ok_or(MalformedImage::AddressRange(p.p_paddr))
        })
}
