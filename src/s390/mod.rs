// s390x (big endian) target. Relative branch fields count halfwords from the start of the
// branch instruction: BRASL and BRCL carry a signed 32 bit halfword offset at byte 2, BRC a
// signed 16 bit one. The 12 and 16 bit label relocations also handle the instruction-offset
// forms used by branch preload, where the field sits inside a longer instruction and the
// distance must skip a two byte NOP that may start the target label. Label table slots hold
// the label address relative to the slot. Trampolines load the helper address from an inline
// literal with LGRL and branch through r1.

//! s390x architecture encoder.

use crate::codegen::code_buffer::CodeBuffer;
use crate::core::error::{CompileError, CompileResult};
use crate::target::{fits_signed, ArchitectureEncoder, EncodingError, TargetArch};
use object::Endianness;

const BRASL_R14: [u8; 2] = [0xc0, 0xe5];
const BRCL_15: [u8; 2] = [0xc0, 0xf4];
const BRC_15: [u8; 2] = [0xa7, 0xf4];
const AGHI_R15: [u8; 2] = [0xa7, 0xfb];
const LGRL_R1: [u8; 2] = [0xc4, 0x18];
const BR_R1: [u8; 2] = [0x07, 0xf1];
const NOPR: [u8; 2] = [0x07, 0x00];
/// Two byte NOP that may pad the start of a label.
const LABEL_NOP: u16 = 0x1800;

/// s390x encoder for snippets and label relocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct S390Target;

impl S390Target {
    pub fn new() -> Self {
        Self
    }

    /// Label address, skipping a leading two byte NOP.
    fn label_location(buffer: &CodeBuffer<'_>, label: u64) -> u64 {
        let starts_with_nop = buffer
            .offset_of(label)
            .and_then(|offset| buffer.read_u16(offset).ok())
            .is_some_and(|halfword| halfword == LABEL_NOP);
        if starts_with_nop {
            label + 2
        } else {
            label
        }
    }
}

fn halfword_offset(from: u64, to: u64, bits: u32) -> Result<i64, EncodingError> {
    let displacement = to.wrapping_sub(from) as i64;
    if displacement & 1 != 0 {
        return Err(EncodingError::Misaligned {
            value: displacement,
            alignment: 2,
        });
    }
    let halfwords = displacement / 2;
    if !fits_signed(halfwords, bits) {
        return Err(EncodingError::DisplacementOutOfRange {
            displacement,
            bits: bits + 1,
        });
    }
    Ok(halfwords)
}

impl ArchitectureEncoder for S390Target {
    fn arch(&self) -> TargetArch {
        TargetArch::S390
    }

    fn endianness(&self) -> Endianness {
        Endianness::Big
    }

    fn pointer_size(&self) -> u8 {
        8
    }

    fn call_reference_address(&self, call_address: u64) -> u64 {
        call_address
    }

    fn call_displacement_offset(&self) -> u32 {
        2
    }

    fn call_length(&self) -> u32 {
        6
    }

    fn is_call_displacement_encodable(&self, displacement: i64) -> bool {
        displacement & 1 == 0 && fits_signed(displacement / 2, 32)
    }

    fn encode_call(
        &self,
        call_address: u64,
        target: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let halfwords = halfword_offset(call_address, target, 32)?;
        out.extend_from_slice(&BRASL_R14);
        out.extend_from_slice(&(halfwords as i32).to_be_bytes());
        Ok(())
    }

    fn branch_length(&self, displacement: Option<i64>) -> Option<u32> {
        match displacement {
            None => Some(6),
            Some(d) if d & 1 != 0 => None,
            Some(d) if fits_signed(d / 2, 16) => Some(4),
            Some(d) if fits_signed(d / 2, 32) => Some(6),
            Some(_) => None,
        }
    }

    fn encode_branch(&self, from: u64, to: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        let halfwords = halfword_offset(from, to, 32)?;
        if fits_signed(halfwords, 16) {
            out.extend_from_slice(&BRC_15);
            out.extend_from_slice(&(halfwords as i16).to_be_bytes());
        } else {
            out.extend_from_slice(&BRCL_15);
            out.extend_from_slice(&(halfwords as i32).to_be_bytes());
        }
        Ok(())
    }

    fn stack_adjust_length(&self, adjustment: i32) -> u32 {
        if adjustment == 0 {
            0
        } else {
            4
        }
    }

    fn encode_stack_adjust(
        &self,
        adjustment: i32,
        release: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        if adjustment == 0 {
            return Ok(());
        }
        let immediate = if release {
            adjustment as i64
        } else {
            -(adjustment as i64)
        };
        if !fits_signed(immediate, 16) {
            return Err(EncodingError::DisplacementOutOfRange {
                displacement: immediate,
                bits: 16,
            });
        }
        out.extend_from_slice(&AGHI_R15);
        out.extend_from_slice(&(immediate as i16).to_be_bytes());
        Ok(())
    }

    fn encode_nops(&self, bytes: u32, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        if bytes % 2 != 0 {
            return Err(EncodingError::Misaligned {
                value: bytes as i64,
                alignment: 2,
            });
        }
        for _ in 0..bytes / 2 {
            out.extend_from_slice(&NOPR);
        }
        Ok(())
    }

    fn trampoline_size(&self) -> u32 {
        16
    }

    fn encode_trampoline(
        &self,
        trampoline_address: u64,
        helper_address: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let _ = trampoline_address;
        // lgrl r1,literal (4 halfwords ahead); br r1; literal
        out.extend_from_slice(&LGRL_R1);
        out.extend_from_slice(&4i32.to_be_bytes());
        out.extend_from_slice(&BR_R1);
        out.extend_from_slice(&helper_address.to_be_bytes());
        Ok(())
    }

    fn apply_label_relative_12(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
        check_disp: bool,
        data_base: Option<u64>,
    ) -> CompileResult<()> {
        if check_disp {
            let base = data_base.ok_or_else(|| CompileError::InvalidInstructionSequence {
                reason: "12-bit displacement check without a data snippet base".to_string(),
            })?;
            let displacement = label.wrapping_sub(base) as i64;
            if !(0..0x1000).contains(&displacement) {
                return Err(CompileError::DisplacementOutOfRange {
                    what: "data snippet displacement",
                    displacement,
                    bits: 12,
                });
            }
            return Ok(());
        }

        let cursor = buffer.address_of(offset);
        let target = Self::label_location(buffer, label);
        let halfwords = (target.wrapping_sub(cursor - 1) as i64) / 2;
        let field = buffer.read_u16(offset)? & 0xf000;
        buffer.patch_u16(offset, field | (halfwords as u16 & 0x0fff))
    }

    fn apply_label_relative_16(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
        divisor: i8,
        instruction_offset: bool,
    ) -> CompileResult<()> {
        let cursor = buffer.address_of(offset);
        let value = if divisor == 1 {
            (label.wrapping_sub(cursor - 2) as i64) / 2
        } else if instruction_offset {
            let target = Self::label_location(buffer, label);
            (target.wrapping_sub(cursor.wrapping_sub(divisor as i64 as u64)) as i64) / 2
        } else {
            (label.wrapping_sub(cursor.wrapping_sub(divisor as i64 as u64)) as i64)
                / divisor as i64
        };
        buffer.patch_u16(offset, value as i16 as u16)
    }

    fn apply_label_relative_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let halfwords = (label.wrapping_sub(buffer.address_of(offset)) as i64) / 2;
        buffer.patch_u32(offset + 2, halfwords as i32 as u32)
    }

    fn apply_label_table_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let relative = label.wrapping_sub(buffer.address_of(offset)) as i64;
        if !fits_signed(relative, 32) {
            return Err(CompileError::DisplacementOutOfRange {
                what: "label table entry",
                displacement: relative,
                bits: 32,
            });
        }
        buffer.patch_u32(offset, relative as i32 as u32)
    }
}
