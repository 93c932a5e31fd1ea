// AOT persistence of external relocations. Each iterated relocation group becomes one record:
// a u16 record size, the kind byte, the flags byte, the target address, the optional second
// target (flagged by HAS_TARGET2), padding up to the target's header size, and then the site
// offsets, 16 or 32 bits each and doubled for ordered pairs according to the flags. All
// multi-byte fields use the target's byte order and pointer size. The records of a method are
// concatenated into one relocation data blob; decoding walks the blob record by record using
// each record's size, so a reader recovers kind, flags, targets and every site offset.

//! Persisted relocation records.

pub mod object_file;

use crate::core::error::CompileResult;
use crate::relocation::iterated::{IteratedExternalRelocation, ModifierFlags};
use crate::relocation::kind::ExternalRelocationKind;
use crate::target::ArchitectureEncoder;
use object::{Endian, Endianness};
use std::fmt;
use thiserror::Error;

/// Errors of relocation persistence and object files.
#[derive(Error, Debug)]
pub enum AotError {
    #[error("Relocation data truncated at offset {offset}: {needed} more bytes expected")]
    Truncated { offset: usize, needed: usize },

    #[error("Unknown relocation kind {0}")]
    UnknownKind(u8),

    #[error("Header of {kind} needs {needed} bytes but the target reserves {header_size}")]
    HeaderTooSmall {
        kind: ExternalRelocationKind,
        header_size: u16,
        needed: usize,
    },

    #[error("Record at offset {offset} has an invalid size {size}")]
    BadRecordSize { offset: usize, size: usize },

    #[error("Object file has no {0} section")]
    MissingSection(&'static str),

    #[error("Unsupported object architecture {0}")]
    UnsupportedArchitecture(String),

    #[error("Object file error: {0}")]
    Read(#[from] object::read::Error),

    #[error("Object write error: {0}")]
    Write(#[from] object::write::Error),
}

fn write_pointer(out: &mut Vec<u8>, value: u64, endian: Endianness, pointer_size: u8) {
    match pointer_size {
        8 => out.extend_from_slice(&endian.write_u64_bytes(value)),
        _ => out.extend_from_slice(&endian.write_u32_bytes(value as u32)),
    }
}

/// Persisted header of `group`, sized to the target's header size.
pub fn encode_header(
    group: &IteratedExternalRelocation,
    target: &dyn ArchitectureEncoder,
) -> CompileResult<Vec<u8>> {
    let endian = target.endianness();
    let pointer_size = target.pointer_size();
    let mut header = Vec::with_capacity(group.header_size() as usize);
    header.extend_from_slice(&endian.write_u16_bytes(group.size_of_relocation_data() as u16));
    header.push(group.target_kind().as_u8());
    header.push(group.modifier_flags().bits());
    write_pointer(&mut header, group.target_address(), endian, pointer_size);
    if let Some(target2) = group.target_address2() {
        write_pointer(&mut header, target2, endian, pointer_size);
    }

    let header_size = group.header_size() as usize;
    if header.len() > header_size {
        return Err(AotError::HeaderTooSmall {
            kind: group.target_kind(),
            header_size: group.header_size(),
            needed: header.len(),
        }
        .into());
    }
    header.resize(header_size, 0);
    Ok(header)
}

/// Concatenated records of a method.
pub fn relocation_data<'a>(groups: impl Iterator<Item = &'a IteratedExternalRelocation>) -> Vec<u8> {
    let mut data = Vec::new();
    for group in groups {
        data.extend_from_slice(group.data());
    }
    data
}

/// One persisted site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationSite {
    Single(u32),
    Pair(u32, u32),
}

/// A record read back from relocation data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub kind: ExternalRelocationKind,
    pub flags: ModifierFlags,
    pub target: u64,
    pub target2: Option<u64>,
    pub sites: Vec<RelocationSite>,
}

impl DecodedRecord {
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Site offsets in record order, pairs flattened.
    pub fn offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            match *site {
                RelocationSite::Single(offset) => offsets.push(offset),
                RelocationSite::Pair(a, b) => offsets.extend([a, b]),
            }
        }
        offsets
    }
}

impl fmt::Display for DecodedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<48} flags={:<10} target={:#x}",
            self.kind.name(),
            self.flags.without(ModifierFlags::HAS_TARGET2),
            self.target
        )?;
        if let Some(target2) = self.target2 {
            write!(f, " target2={target2:#x}")?;
        }
        write!(f, " sites={}", self.sites.len())?;
        for site in &self.sites {
            match site {
                RelocationSite::Single(offset) => write!(f, " {offset:#x}")?,
                RelocationSite::Pair(a, b) => write!(f, " ({a:#x},{b:#x})")?,
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    endian: Endianness,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], AotError> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(AotError::Truncated {
                offset: self.offset,
                needed: end - self.data.len(),
            });
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, AotError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AotError> {
        let bytes = self.take(2)?;
        Ok(self.endian.read_u16_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, AotError> {
        let bytes = self.take(4)?;
        Ok(self
            .endian
            .read_u32_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, AotError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(self.endian.read_u64_bytes(raw))
    }

    fn pointer(&mut self, pointer_size: u8) -> Result<u64, AotError> {
        match pointer_size {
            8 => self.u64(),
            _ => Ok(self.u32()? as u64),
        }
    }
}

/// Decode the records of a relocation data blob.
pub fn decode_relocation_data(
    data: &[u8],
    target: &dyn ArchitectureEncoder,
) -> Result<Vec<DecodedRecord>, AotError> {
    let pointer_size = target.pointer_size();
    let mut reader = Reader {
        data,
        offset: 0,
        endian: target.endianness(),
    };
    let mut records = Vec::new();

    while reader.offset < data.len() {
        let start = reader.offset;
        let size = reader.u16()? as usize;
        let kind_byte = reader.u8()?;
        let kind = ExternalRelocationKind::from_u8(kind_byte).ok_or(AotError::UnknownKind(kind_byte))?;
        let flags = ModifierFlags::from_bits(reader.u8()?);
        let has_target2 = flags.contains(ModifierFlags::HAS_TARGET2);
        let target_address = reader.pointer(pointer_size)?;
        let target2 = if has_target2 {
            Some(reader.pointer(pointer_size)?)
        } else {
            None
        };

        let header_size = target.aot_header_size(kind, has_target2) as usize;
        if size < header_size {
            return Err(AotError::BadRecordSize { offset: start, size });
        }
        if start + size > data.len() {
            return Err(AotError::Truncated {
                offset: start,
                needed: start + size - data.len(),
            });
        }
        reader.offset = start + header_size;

        let wide = flags.contains(ModifierFlags::WIDE_OFFSET);
        let pair = flags.contains(ModifierFlags::ORDERED_PAIR);
        let site_size = match (wide, pair) {
            (false, false) => 2,
            (true, false) | (false, true) => 4,
            (true, true) => 8,
        };
        let payload = size - header_size;
        if payload % site_size != 0 {
            return Err(AotError::BadRecordSize { offset: start, size });
        }

        let read_offset = |reader: &mut Reader<'_>| -> Result<u32, AotError> {
            if wide {
                reader.u32()
            } else {
                Ok(reader.u16()? as u32)
            }
        };
        let mut sites = Vec::with_capacity(payload / site_size);
        for _ in 0..payload / site_size {
            let first = read_offset(&mut reader)?;
            sites.push(if pair {
                RelocationSite::Pair(first, read_offset(&mut reader)?)
            } else {
                RelocationSite::Single(first)
            });
        }

        records.push(DecodedRecord {
            kind,
            flags,
            target: target_address,
            target2,
            sites,
        });
    }

    Ok(records)
}
