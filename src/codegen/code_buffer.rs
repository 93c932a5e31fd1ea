// The code buffer is the cursor-addressed byte region that binary encoding and snippet
// emission write into. Its storage is carved from the compilation arena once the length
// estimate is known, so its capacity is exactly the estimate: any write that would move the
// cursor past it is reported immediately as EstimateExceeded, which keeps the final length
// within the estimate that stack maps and exception ranges were computed against. The buffer
// knows its absolute start address (handed out by the code cache), the method entry padding
// inserted for entry alignment, and the target's byte order, which the relocation hooks use
// when they read and patch instruction fields after the fact.

//! Cursor-addressed code buffer with a conservative length estimate.

use crate::core::error::{CompileError, CompileResult};
use object::{Endian, Endianness};

/// Code buffer of one compilation.
pub struct CodeBuffer<'arena> {
    /// Storage sized to the estimate.
    bytes: &'arena mut [u8],
    /// Absolute address of the first byte.
    start: u64,
    cursor: u32,
    estimated_length: u32,
    /// Highest cursor position reached.
    actual_length: u32,
    /// Bytes inserted before the method entry for alignment.
    entry_padding: u32,
    endian: Endianness,
}

impl<'arena> CodeBuffer<'arena> {
    /// Create an empty buffer; no bytes can be written until it is reserved.
    pub fn new(endian: Endianness) -> Self {
        Self {
            bytes: &mut [],
            start: 0,
            cursor: 0,
            estimated_length: 0,
            actual_length: 0,
            entry_padding: 0,
            endian,
        }
    }

    /// Attach storage of exactly the estimated length, placed at `start`.
    pub fn reserve(&mut self, storage: &'arena mut [u8], start: u64) {
        self.estimated_length = storage.len() as u32;
        self.bytes = storage;
        self.start = start;
        self.cursor = 0;
        self.actual_length = 0;
        self.entry_padding = 0;
        log::debug!(
            "Reserved {} bytes of code at {:#x}",
            self.estimated_length,
            start
        );
    }

    pub fn is_reserved(&self) -> bool {
        !self.bytes.is_empty()
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    /// Absolute address of the buffer start (the relocatable start).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Start of the relocatable region; relocation offsets are measured from here.
    pub fn relocatable_start(&self) -> u64 {
        self.start
    }

    /// Method entry, after the alignment padding.
    pub fn code_start(&self) -> u64 {
        self.start + self.entry_padding as u64
    }

    pub fn entry_padding(&self) -> u32 {
        self.entry_padding
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn cursor_address(&self) -> u64 {
        self.address_of(self.cursor)
    }

    pub fn address_of(&self, offset: u32) -> u64 {
        self.start + offset as u64
    }

    /// Offset of an absolute address inside the buffer.
    pub fn offset_of(&self, address: u64) -> Option<u32> {
        let offset = address.checked_sub(self.start)?;
        (offset <= self.estimated_length as u64).then_some(offset as u32)
    }

    pub fn estimated_length(&self) -> u32 {
        self.estimated_length
    }

    /// Bytes written so far.
    pub fn actual_length(&self) -> u32 {
        self.actual_length
    }

    /// Written part of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.actual_length as usize]
    }

    /// Write `data` at the cursor and advance it; returns the offset written at.
    pub fn emit_bytes(&mut self, data: &[u8]) -> CompileResult<u32> {
        let offset = self.cursor;
        let end = offset as u64 + data.len() as u64;
        if end > self.estimated_length as u64 {
            return Err(CompileError::EstimateExceeded {
                actual: end.min(u32::MAX as u64) as u32,
                estimated: self.estimated_length,
            });
        }

        self.bytes[offset as usize..end as usize].copy_from_slice(data);
        self.cursor = end as u32;
        self.actual_length = self.actual_length.max(self.cursor);
        Ok(offset)
    }

    pub fn emit_u8(&mut self, value: u8) -> CompileResult<u32> {
        self.emit_bytes(&[value])
    }

    pub fn emit_u16(&mut self, value: u16) -> CompileResult<u32> {
        let bytes = self.endian.write_u16_bytes(value);
        self.emit_bytes(&bytes)
    }

    pub fn emit_u32(&mut self, value: u32) -> CompileResult<u32> {
        let bytes = self.endian.write_u32_bytes(value);
        self.emit_bytes(&bytes)
    }

    pub fn emit_u64(&mut self, value: u64) -> CompileResult<u32> {
        let bytes = self.endian.write_u64_bytes(value);
        self.emit_bytes(&bytes)
    }

    /// Round the cursor up to `boundary` (a power of two), zero filling the gap.
    pub fn align_cursor(&mut self, boundary: u32) -> CompileResult<u32> {
        debug_assert!(boundary.is_power_of_two());
        let aligned = align_up(self.cursor_address(), boundary as u64);
        let padding = (aligned - self.cursor_address()) as usize;
        if padding > 0 {
            let zeros = [0u8; 64];
            let mut remaining = padding;
            while remaining > 0 {
                let chunk = remaining.min(zeros.len());
                self.emit_bytes(&zeros[..chunk])?;
                remaining -= chunk;
            }
        }
        Ok(self.cursor)
    }

    /// Align so that `cursor + pre_entry_size` lands on `boundary`.
    ///
    /// A zero or non power of two boundary leaves the cursor alone.
    pub fn align_method_entry(&mut self, boundary: u32, pre_entry_size: u32) -> CompileResult<u32> {
        if boundary == 0 || !boundary.is_power_of_two() {
            return Ok(0);
        }
        let entry = self.cursor_address() + pre_entry_size as u64;
        let padding = (align_up(entry, boundary as u64) - entry) as u32;
        for _ in 0..padding {
            self.emit_u8(0)?;
        }
        self.entry_padding = padding;
        Ok(padding)
    }

    fn check_patch(&self, offset: u32, size: u32) -> CompileResult<usize> {
        if offset as u64 + size as u64 > self.actual_length as u64 {
            return Err(CompileError::PatchOutOfBounds {
                offset,
                size,
                length: self.actual_length,
            });
        }
        Ok(offset as usize)
    }

    pub fn read_u8(&self, offset: u32) -> CompileResult<u8> {
        let at = self.check_patch(offset, 1)?;
        Ok(self.bytes[at])
    }

    pub fn read_u16(&self, offset: u32) -> CompileResult<u16> {
        let at = self.check_patch(offset, 2)?;
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.bytes[at..at + 2]);
        Ok(self.endian.read_u16_bytes(raw))
    }

    pub fn read_u32(&self, offset: u32) -> CompileResult<u32> {
        let at = self.check_patch(offset, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        Ok(self.endian.read_u32_bytes(raw))
    }

    pub fn read_u64(&self, offset: u32) -> CompileResult<u64> {
        let at = self.check_patch(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[at..at + 8]);
        Ok(self.endian.read_u64_bytes(raw))
    }

    pub fn patch_u8(&mut self, offset: u32, value: u8) -> CompileResult<()> {
        let at = self.check_patch(offset, 1)?;
        self.bytes[at] = value;
        Ok(())
    }

    pub fn patch_u16(&mut self, offset: u32, value: u16) -> CompileResult<()> {
        let at = self.check_patch(offset, 2)?;
        self.bytes[at..at + 2].copy_from_slice(&self.endian.write_u16_bytes(value));
        Ok(())
    }

    pub fn patch_u32(&mut self, offset: u32, value: u32) -> CompileResult<()> {
        let at = self.check_patch(offset, 4)?;
        self.bytes[at..at + 4].copy_from_slice(&self.endian.write_u32_bytes(value));
        Ok(())
    }

    pub fn patch_u64(&mut self, offset: u32, value: u64) -> CompileResult<()> {
        let at = self.check_patch(offset, 8)?;
        self.bytes[at..at + 8].copy_from_slice(&self.endian.write_u64_bytes(value));
        Ok(())
    }

    /// OR `bits` into the 32-bit word at `offset`.
    pub fn or_u32(&mut self, offset: u32, bits: u32) -> CompileResult<()> {
        let word = self.read_u32(offset)?;
        self.patch_u32(offset, word | bits)
    }

    /// Write a pointer-sized value.
    pub fn patch_pointer(&mut self, offset: u32, value: u64, pointer_size: u8) -> CompileResult<()> {
        match pointer_size {
            8 => self.patch_u64(offset, value),
            _ => self.patch_u32(offset, value as u32),
        }
    }
}

pub(crate) fn align_up(value: u64, boundary: u64) -> u64 {
    (value + boundary - 1) & !(boundary - 1)
}
