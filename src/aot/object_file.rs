// ELF container for an AOT compiled method. The method code goes into .text with a text symbol
// naming the method, and the persisted relocation records go into a read-only .aotrelo
// section, both written with object::write for the architecture and byte order of the target.
// Reading parses the file with object::read, maps the ELF machine back to a TargetArch and
// returns the code and relocation data unchanged, so tools can decode the records without
// the compiler.

//! Object file writer and reader for AOT methods.

use super::AotError;
use crate::target::TargetArch;
use object::write::{Object as ObjectWriter, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, Object, ObjectSection, ObjectSymbol, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

/// Name of the relocation data section.
pub const RELOCATION_SECTION: &str = ".aotrelo";

/// A method as stored in an AOT object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotMethod {
    pub name: String,
    pub arch: TargetArch,
    pub code: Vec<u8>,
    pub relocation_data: Vec<u8>,
}

fn object_architecture(arch: TargetArch) -> (Architecture, Endianness) {
    match arch {
        TargetArch::X64 => (Architecture::X86_64, Endianness::Little),
        TargetArch::Power => (Architecture::PowerPc64, Endianness::Big),
        TargetArch::Arm => (Architecture::Arm, Endianness::Little),
        TargetArch::S390 => (Architecture::S390x, Endianness::Big),
    }
}

fn target_arch(architecture: Architecture) -> Result<TargetArch, AotError> {
    match architecture {
        Architecture::X86_64 => Ok(TargetArch::X64),
        Architecture::PowerPc64 => Ok(TargetArch::Power),
        Architecture::Arm => Ok(TargetArch::Arm),
        Architecture::S390x => Ok(TargetArch::S390),
        other => Err(AotError::UnsupportedArchitecture(format!("{other:?}"))),
    }
}

/// Write `method` as an ELF relocatable object.
pub fn write_object(method: &AotMethod) -> Result<Vec<u8>, AotError> {
    let (architecture, endian) = object_architecture(method.arch);
    let mut obj = ObjectWriter::new(BinaryFormat::Elf, architecture, endian);

    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &method.code, 16);
    obj.add_symbol(Symbol {
        name: method.name.as_bytes().to_vec(),
        value: offset,
        size: method.code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let relocations = obj.add_section(
        Vec::new(),
        RELOCATION_SECTION.as_bytes().to_vec(),
        SectionKind::ReadOnlyData,
    );
    obj.append_section_data(relocations, &method.relocation_data, 8);

    log::debug!(
        "Writing {} ({} code bytes, {} relocation bytes) for {}",
        method.name,
        method.code.len(),
        method.relocation_data.len(),
        method.arch.name()
    );
    Ok(obj.write()?)
}

/// Read a method written by [`write_object`].
pub fn read_object(bytes: &[u8]) -> Result<AotMethod, AotError> {
    let file = object::File::parse(bytes)?;
    let arch = target_arch(file.architecture())?;

    let text = file
        .section_by_name(".text")
        .ok_or(AotError::MissingSection(".text"))?;
    let text_index = text.index();
    let text_data = text.data()?;

    let relocation_data = file
        .section_by_name(RELOCATION_SECTION)
        .ok_or(AotError::MissingSection(RELOCATION_SECTION))?
        .data()?
        .to_vec();

    let symbol = file
        .symbols()
        .find(|s| s.kind() == SymbolKind::Text && s.section_index() == Some(text_index))
        .ok_or(AotError::MissingSection("method symbol"))?;
    let name = symbol.name()?.to_string();
    let start = symbol.address() as usize;
    let end = start + symbol.size() as usize;
    let code = text_data
        .get(start..end)
        .ok_or(AotError::BadRecordSize {
            offset: start,
            size: symbol.size() as usize,
        })?
        .to_vec();

    Ok(AotMethod {
        name,
        arch,
        code,
        relocation_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips_through_elf() {
        for arch in [TargetArch::X64, TargetArch::Power, TargetArch::Arm, TargetArch::S390] {
            let method = AotMethod {
                name: "java/lang/Object.hashCode()I".to_string(),
                arch,
                code: vec![0x90, 0x90, 0xc3, 0x00],
                relocation_data: vec![1, 2, 3, 4, 5, 6],
            };
            let bytes = write_object(&method).unwrap();
            let read = read_object(&bytes).unwrap();
            assert_eq!(read, method, "{}", arch.name());
        }
    }
}
