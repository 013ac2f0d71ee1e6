//! Program images.
//!
//! A [`ProgramImage`] is the loader's view of a program: its raw bytes plus the loadable
//! segments, sections and symbols that refer into them. Images are produced from RISC-V ELF
//! executables by [`ProgramImage::parse`] or built by hand for raw code blobs and tests.

use bitflags::bitflags;
use goblin::elf::{
    header::{self, EM_RISCV, ET_DYN, ET_EXEC},
    program_header::PT_LOAD,
    sym::STT_FUNC,
    Elf,
};
use tracing::debug;

use crate::{address::Address, Result};

/// The ELF header flag of executables using compressed instructions.
pub const ELF_FLAG_RVC: u32 = 0x1;
/// The ELF header flag of executables built for the embedded (16 register) base.
pub const ELF_FLAG_RVE: u32 = 0x8;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    /// Permissions of a loadable segment, with the ELF `p_flags` bit values
    pub struct SegmentFlags: u32 {
        /// The segment holds code
        const EXEC = 0x1;
        /// The segment is writable
        const WRITE = 0x2;
        /// The segment is readable
        const READ = 0x4;
    }
}

/// A loadable (`PT_LOAD`) segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    /// Virtual address of the first byte
    pub vaddr: u64,
    /// File offset of the first byte
    pub offset: u64,
    /// Number of bytes stored in the file
    pub filesz: u64,
    /// Number of bytes occupied in memory
    pub memsz: u64,
    /// Segment permissions
    pub flags: SegmentFlags,
}

impl LoadSegment {
    /// Returns `true` if the segment holds code.
    #[must_use]
    pub fn is_exec(&self) -> bool {
        self.flags.contains(SegmentFlags::EXEC)
    }
}

/// A named section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// Section name, e.g. `.text`
    pub name: String,
    /// Virtual address of the section
    pub addr: u64,
    /// File offset of the section
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

/// A symbol table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Address of the symbol
    pub value: u64,
    /// Size in bytes, zero when unknown
    pub size: u64,
    /// Returns `true` for function symbols
    pub is_function: bool,
}

/// The loadable parts of a program.
#[derive(Clone, Debug, Default)]
pub struct ProgramImage {
    /// The raw program bytes segments and sections refer into
    pub binary: Vec<u8>,
    /// Entry point
    pub entry: u64,
    /// Loadable segments in file order
    pub segments: Vec<LoadSegment>,
    /// Sections
    pub sections: Vec<Section>,
    /// Symbols
    pub symbols: Vec<Symbol>,
    /// ELF header flags
    pub flags: u32,
    /// The program is position independent
    pub is_dynamic: bool,
}

impl ProgramImage {
    /// Creates an image of `binary` without segments, sections or symbols.
    #[must_use]
    pub fn new(binary: Vec<u8>, entry: u64) -> Self {
        ProgramImage {
            binary,
            entry,
            ..Default::default()
        }
    }

    /// Adds a loadable segment.
    #[must_use]
    pub fn with_segment(mut self, segment: LoadSegment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Adds a section.
    #[must_use]
    pub fn with_section(mut self, name: &str, addr: u64, offset: u64, size: u64) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            addr,
            offset,
            size,
        });
        self
    }

    /// Adds a function symbol.
    #[must_use]
    pub fn with_function(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push(Symbol {
            name: name.to_string(),
            value,
            size,
            is_function: true,
        });
        self
    }

    /// Parses a RISC-V ELF executable for a machine of address width `A`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] for truncated or foreign images, object files,
    /// images using compressed instructions when `compressed` is disabled, and images built
    /// for the embedded base. Returns [`crate::Error::GoblinErr`] when goblin rejects the image.
    pub fn parse<A: Address>(binary: &[u8], compressed: bool) -> Result<Self> {
        let header_size = if A::is_64() {
            header::header64::SIZEOF_EHDR
        } else {
            header::header32::SIZEOF_EHDR
        };
        if binary.len() < header_size {
            return Err(invalid_program!("ELF program too short", binary.len()));
        }

        let expected_class = if A::is_64() {
            header::ELFCLASS64
        } else {
            header::ELFCLASS32
        };
        if &binary[..header::SELFMAG] != header::ELFMAG || binary[header::EI_CLASS] != expected_class
        {
            return Err(invalid_program!(format!(
                "Invalid ELF header! Expected a {}-bit RISC-V ELF binary",
                A::BITS
            )));
        }

        let elf = Elf::parse(binary)?;
        match elf.header.e_type {
            ET_EXEC | ET_DYN => {}
            _ => {
                return Err(invalid_program!(
                    "ELF program is not an executable type. Trying to load an object file?"
                ))
            }
        }
        if elf.header.e_machine != EM_RISCV {
            return Err(invalid_program!(
                "ELF program is not a RISC-V executable. Wrong architecture.",
                elf.header.e_machine
            ));
        }
        let flags = elf.header.e_flags;
        if flags & ELF_FLAG_RVC != 0 && !compressed {
            return Err(invalid_program!(
                "ELF is a RISC-V RVC executable, however C-extension is not enabled."
            ));
        }
        if flags & ELF_FLAG_RVE != 0 {
            return Err(invalid_program!(
                "ELF is a RISC-V RVE executable, however E-extension is not supported."
            ));
        }

        let segments = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| LoadSegment {
                vaddr: ph.p_vaddr,
                offset: ph.p_offset,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
                flags: SegmentFlags::from_bits_truncate(ph.p_flags),
            })
            .collect();

        let sections = elf
            .section_headers
            .iter()
            .filter_map(|sh| {
                let name = elf.shdr_strtab.get_at(sh.sh_name)?;
                Some(Section {
                    name: name.to_string(),
                    addr: sh.sh_addr,
                    offset: sh.sh_offset,
                    size: sh.sh_size,
                })
            })
            .collect();

        let symbols = elf
            .syms
            .iter()
            .filter_map(|sym| {
                let name = elf.strtab.get_at(sym.st_name)?;
                (!name.is_empty()).then(|| Symbol {
                    name: name.to_string(),
                    value: sym.st_value,
                    size: sym.st_size,
                    is_function: sym.st_type() == STT_FUNC,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "Parsed {}-bit ELF: entry {:#x}, {} symbols",
            A::BITS,
            elf.header.e_entry,
            symbols.len()
        );

        Ok(ProgramImage {
            binary: binary.to_vec(),
            entry: elf.header.e_entry,
            segments,
            sections,
            symbols,
            flags,
            is_dynamic: elf.header.e_type == ET_DYN,
        })
    }

    /// The file bytes of `segment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] if the segment lies outside the binary.
    pub fn segment_data(&self, segment: &LoadSegment) -> Result<&[u8]> {
        self.file_range(segment.offset, segment.filesz)
    }

    /// The file bytes of `section`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidProgram`] if the section lies outside the binary.
    pub fn section_data(&self, section: &Section) -> Result<&[u8]> {
        self.file_range(section.offset, section.size)
    }

    fn file_range(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= self.binary.len())
            .ok_or_else(|| invalid_program!("Bogus ELF program segment offset", offset))?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= self.binary.len())
            .ok_or_else(|| invalid_program!("Not enough room for ELF program segment", len))?;
        Ok(&self.binary[start..end])
    }

    /// The section called `name`.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// The symbol called `name`.
    #[must_use]
    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::riscv_elf, Error};

    #[test]
    fn test_parse_minimal_executable() {
        let code = [0x13, 0x05, 0x10, 0x00, 0x73, 0x00, 0x00, 0x00];
        let binary = riscv_elf(0x1_0000, &code, 0);
        let image = ProgramImage::parse::<u64>(&binary, true).unwrap();

        assert_eq!(image.entry, 0x1_0000);
        assert_eq!(image.segments.len(), 1);
        let segment = image.segments[0];
        assert!(segment.is_exec());
        assert!(segment.flags.contains(SegmentFlags::READ));
        assert_eq!(image.segment_data(&segment).unwrap(), &code);
        assert!(!image.is_dynamic);
    }

    #[test]
    fn test_rejects_wrong_class_and_short_images() {
        let binary = riscv_elf(0x1_0000, &[0x13, 0, 0, 0], 0);
        assert!(matches!(
            ProgramImage::parse::<u32>(&binary, true),
            Err(Error::InvalidProgram { .. })
        ));
        assert!(matches!(
            ProgramImage::parse::<u64>(&binary[..16], true),
            Err(Error::InvalidProgram { .. })
        ));
    }

    #[test]
    fn test_rejects_disabled_extensions() {
        let rvc = riscv_elf(0x1_0000, &[0x13, 0, 0, 0], ELF_FLAG_RVC);
        assert!(ProgramImage::parse::<u64>(&rvc, true).is_ok());
        assert!(ProgramImage::parse::<u64>(&rvc, false).is_err());

        let rve = riscv_elf(0x1_0000, &[0x13, 0, 0, 0], ELF_FLAG_RVE);
        assert!(ProgramImage::parse::<u64>(&rve, true).is_err());
    }

    #[test]
    fn test_file_ranges() {
        let image = ProgramImage::new(vec![0; 16], 0);
        let segment = LoadSegment {
            vaddr: 0x1000,
            offset: 8,
            filesz: 16,
            memsz: 16,
            flags: SegmentFlags::READ,
        };
        assert!(image.segment_data(&segment).is_err());
        assert!(image
            .segment_data(&LoadSegment {
                offset: 32,
                ..segment
            })
            .is_err());
        assert_eq!(
            image
                .segment_data(&LoadSegment { filesz: 8, ..segment })
                .unwrap()
                .len(),
            8
        );
    }

    #[test]
    fn test_builder_lookups() {
        let image = ProgramImage::new(Vec::new(), 0x1000)
            .with_section(".text", 0x1000, 0, 0)
            .with_function("main", 0x1000, 16);
        assert_eq!(image.section_by_name(".text").unwrap().addr, 0x1000);
        assert!(image.symbol_by_name("main").unwrap().is_function);
        assert!(image.symbol_by_name("missing").is_none());
    }
}
