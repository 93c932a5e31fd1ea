// 32-bit ARM (little endian) target. The pc reads two instructions ahead, so every pc relative
// field is measured from the instruction address plus 8. `bl` and `b` carry a signed 24 bit
// word offset; the 8 bit label relocation fills the unsigned immediate of a pc relative
// add or load and requires the label to lie within 255 bytes ahead. Helper trampolines load
// the pc from the literal word that follows them.

//! ARM architecture encoder.

use crate::codegen::code_buffer::CodeBuffer;
use crate::core::error::{CompileError, CompileResult};
use crate::target::{fits_signed, ArchitectureEncoder, EncodingError, TargetArch};
use object::Endianness;

const BL: u32 = 0xeb00_0000;
const B: u32 = 0xea00_0000;
const NOP: u32 = 0xe1a0_0000;
const ADD_SP_SP_IMM: u32 = 0xe28d_d000;
const SUB_SP_SP_IMM: u32 = 0xe24d_d000;
const LDR_PC_PC_MINUS_4: u32 = 0xe51f_f004;

/// Distance the pc runs ahead of the executing instruction.
const PC_BIAS: u64 = 8;

/// ARM encoder for snippets and label relocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmTarget;

impl ArmTarget {
    pub fn new() -> Self {
        Self
    }
}

fn branch_field(from: u64, to: u64) -> Result<u32, EncodingError> {
    let displacement = to.wrapping_sub(from + PC_BIAS) as i64;
    if displacement & 3 != 0 {
        return Err(EncodingError::Misaligned {
            value: displacement,
            alignment: 4,
        });
    }
    if !fits_signed(displacement, 26) {
        return Err(EncodingError::DisplacementOutOfRange {
            displacement,
            bits: 26,
        });
    }
    Ok((displacement >> 2) as u32 & 0x00ff_ffff)
}

impl ArchitectureEncoder for ArmTarget {
    fn arch(&self) -> TargetArch {
        TargetArch::Arm
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn pointer_size(&self) -> u8 {
        4
    }

    fn call_reference_address(&self, call_address: u64) -> u64 {
        call_address + PC_BIAS
    }

    fn call_displacement_offset(&self) -> u32 {
        0
    }

    fn call_length(&self) -> u32 {
        4
    }

    fn is_call_displacement_encodable(&self, displacement: i64) -> bool {
        displacement & 3 == 0 && fits_signed(displacement, 26)
    }

    fn encode_call(
        &self,
        call_address: u64,
        target: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let field = branch_field(call_address, target)?;
        out.extend_from_slice(&(BL | field).to_le_bytes());
        Ok(())
    }

    fn branch_length(&self, displacement: Option<i64>) -> Option<u32> {
        match displacement {
            Some(d) if !self.is_call_displacement_encodable(d - PC_BIAS as i64) => None,
            _ => Some(4),
        }
    }

    fn encode_branch(&self, from: u64, to: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        let field = branch_field(from, to)?;
        out.extend_from_slice(&(B | field).to_le_bytes());
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
        if !(0..=0xff).contains(&adjustment) {
            return Err(EncodingError::UnsupportedOperand(
                "stack adjustment needs a rotated immediate",
            ));
        }
        let opcode = if release { ADD_SP_SP_IMM } else { SUB_SP_SP_IMM };
        out.extend_from_slice(&(opcode | adjustment as u32).to_le_bytes());
        Ok(())
    }

    fn encode_nops(&self, bytes: u32, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        if bytes % 4 != 0 {
            return Err(EncodingError::Misaligned {
                value: bytes as i64,
                alignment: 4,
            });
        }
        for _ in 0..bytes / 4 {
            out.extend_from_slice(&NOP.to_le_bytes());
        }
        Ok(())
    }

    fn trampoline_size(&self) -> u32 {
        8
    }

    fn encode_trampoline(
        &self,
        trampoline_address: u64,
        helper_address: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let _ = trampoline_address;
        if helper_address > u32::MAX as u64 {
            return Err(EncodingError::UnsupportedOperand("helper above 4GB"));
        }
        out.extend_from_slice(&LDR_PC_PC_MINUS_4.to_le_bytes());
        out.extend_from_slice(&(helper_address as u32).to_le_bytes());
        Ok(())
    }

    fn apply_label_relative_8(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let delta = label.wrapping_sub(buffer.address_of(offset) + PC_BIAS) as i64;
        if delta & !0xff != 0 {
            return Err(CompileError::DisplacementOutOfRange {
                what: "pc relative 8-bit immediate",
                displacement: delta,
                bits: 8,
            });
        }
        buffer.or_u32(offset, delta as u32)
    }

    fn apply_label_relative_24(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let delta = label.wrapping_sub(buffer.address_of(offset) + PC_BIAS) as i64;
        buffer.or_u32(offset, (delta >> 2) as u32 & 0x00ff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn words<'a>(arena: &'a Bump, words: &[u32]) -> CodeBuffer<'a> {
        let mut buffer = CodeBuffer::new(Endianness::Little);
        buffer.reserve(arena.alloc_slice_fill_copy(32, 0u8), 0x8000);
        for &w in words {
            buffer.emit_u32(w).unwrap();
        }
        buffer
    }

    #[test]
    fn branch_fields_are_relative_to_pc_plus_8() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[B]);
        ArmTarget
            .apply_label_relative_24(&mut buffer, 0, 0x8010)
            .unwrap();
        assert_eq!(buffer.read_u32(0).unwrap(), B | 2);

        let mut out = Vec::new();
        ArmTarget.encode_call(0x8000, 0x7ff8, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), BL | 0x00ff_fffc);
    }

    #[test]
    fn eight_bit_label_must_be_ahead_and_near() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[0xe28f_0000]);
        ArmTarget
            .apply_label_relative_8(&mut buffer, 0, 0x8018)
            .unwrap();
        assert_eq!(buffer.read_u32(0).unwrap(), 0xe28f_0010);

        let err = ArmTarget
            .apply_label_relative_8(&mut buffer, 0, 0x8000)
            .unwrap_err();
        assert!(matches!(err, CompileError::DisplacementOutOfRange { bits: 8, .. }));
    }

    #[test]
    fn trampoline_loads_pc_from_the_literal() {
        let mut out = Vec::new();
        ArmTarget.encode_trampoline(0, 0x1234_5678, &mut out).unwrap();
        assert_eq!(out, [0x04, 0xf0, 0x1f, 0xe5, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(ArmTarget.address_requestor_count(), 2);
    }
}
