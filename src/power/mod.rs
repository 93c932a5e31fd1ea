// Power (64-bit, big endian) target. Branch displacements are measured from the branch itself
// and must be word aligned; `bl` and `b` reach a signed 26 bit window. Label relocations OR the
// word-aligned distance into the 16 bit BD field of conditional branches or the 24 bit LI field
// of unconditional ones. Load-label relocations patch `li` with the word distance between two
// labels, and the fixed 64 bit address sequence (lis, lis, ori, rldimi, ld) receives the label
// address split into HI/LO halves. Helper trampolines materialize the full 64 bit helper
// address in r11 and branch through the count register.

//! Power architecture encoder.

use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::EncodedInstruction;
use crate::core::error::{CompileError, CompileResult};
use crate::target::{fits_signed, hi_value, ArchitectureEncoder, EncodingError, TargetArch};
use object::Endianness;

const BL: u32 = 0x4800_0001;
const B: u32 = 0x4800_0000;
const NOP: u32 = 0x6000_0000;
const ADDI_R1_R1: u32 = 0x3821_0000;
const LIS_R11: u32 = 0x3d60_0000;
const ORI_R11_R11: u32 = 0x616b_0000;
const ORIS_R11_R11: u32 = 0x656b_0000;
const RLDICR_R11_32_31: u32 = 0x796b_07c6;
const MTCTR_R11: u32 = 0x7d69_03a6;
const BCTR: u32 = 0x4e80_0420;

/// Power encoder for snippets and label relocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerTarget;

impl PowerTarget {
    pub fn new() -> Self {
        Self
    }
}

fn branch_displacement(from: u64, to: u64) -> Result<u32, EncodingError> {
    let displacement = to.wrapping_sub(from) as i64;
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
    Ok(displacement as u32 & 0x03ff_fffc)
}

impl ArchitectureEncoder for PowerTarget {
    fn arch(&self) -> TargetArch {
        TargetArch::Power
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
        let field = branch_displacement(call_address, target)?;
        out.extend_from_slice(&(BL | field).to_be_bytes());
        Ok(())
    }

    fn branch_length(&self, displacement: Option<i64>) -> Option<u32> {
        match displacement {
            Some(d) if !self.is_call_displacement_encodable(d) => None,
            _ => Some(4),
        }
    }

    fn encode_branch(&self, from: u64, to: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        let field = branch_displacement(from, to)?;
        out.extend_from_slice(&(B | field).to_be_bytes());
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
        let word = ADDI_R1_R1 | (immediate as u32 & 0xffff);
        out.extend_from_slice(&word.to_be_bytes());
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
            out.extend_from_slice(&NOP.to_be_bytes());
        }
        Ok(())
    }

    fn trampoline_size(&self) -> u32 {
        28
    }

    fn encode_trampoline(
        &self,
        trampoline_address: u64,
        helper_address: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let _ = trampoline_address;
        let a = helper_address;
        let words = [
            LIS_R11 | ((a >> 48) as u32 & 0xffff),
            ORI_R11_R11 | ((a >> 32) as u32 & 0xffff),
            RLDICR_R11_32_31,
            ORIS_R11_R11 | ((a >> 16) as u32 & 0xffff),
            ORI_R11_R11 | (a as u32 & 0xffff),
            MTCTR_R11,
            BCTR,
        ];
        for word in words {
            out.extend_from_slice(&word.to_be_bytes());
        }
        Ok(())
    }

    fn apply_label_relative_16(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
        divisor: i8,
        instruction_offset: bool,
    ) -> CompileResult<()> {
        let _ = (divisor, instruction_offset);
        let distance = label.wrapping_sub(buffer.address_of(offset));
        buffer.or_u32(offset, distance as u32 & 0x0000_fffc)
    }

    fn apply_label_relative_24(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let distance = label.wrapping_sub(buffer.address_of(offset));
        let word = buffer.read_u32(offset)?;
        buffer.patch_u32(
            offset,
            (word & 0xfc00_0003) | (distance as u32 & 0x03ff_fffc),
        )
    }

    fn apply_load_label_relative_16(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        start: u64,
        end: u64,
        delta_to_start: i32,
    ) -> CompileResult<()> {
        let _ = delta_to_start;
        let bytes = end.wrapping_sub(start) as i64;
        if bytes % 4 != 0 {
            return Err(EncodingError::Misaligned {
                value: bytes,
                alignment: 4,
            }
            .into());
        }
        let distance = bytes / 4;
        if distance as u64 & !0xffff != 0 {
            return Err(CompileError::DisplacementOutOfRange {
                what: "relative label in li",
                displacement: distance,
                bits: 16,
            });
        }
        if buffer.read_u32(instruction.offset)? & 0xffff != 0 {
            return Err(CompileError::InvalidInstructionSequence {
                reason: "li immediate should be 0 before the label distance is written".to_string(),
            });
        }
        buffer.or_u32(instruction.offset, distance as u32 & 0xffff)
    }

    fn apply_load_label_relative_64(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        label: u64,
    ) -> CompileResult<()> {
        // lis, lis, ori, rldimi (untouched), then the load itself
        let last = instruction.offset;
        if last < 16 {
            return Err(CompileError::InvalidInstructionSequence {
                reason: "fixed 64-bit address sequence starts before the buffer".to_string(),
            });
        }
        let address = label as i64;
        buffer.or_u32(last, address as u32 & 0xffff)?;
        let hi = hi_value(address);
        buffer.or_u32(last - 8, (hi >> 16) as u32 & 0xffff)?;
        buffer.or_u32(last - 12, hi as u32 & 0xffff)?;
        buffer.or_u32(last - 16, (hi >> 32) as u32 & 0xffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn words<'a>(arena: &'a Bump, words: &[u32]) -> CodeBuffer<'a> {
        let mut buffer = CodeBuffer::new(Endianness::Big);
        buffer.reserve(arena.alloc_slice_fill_copy(64, 0u8), 0x1_0000);
        for &w in words {
            buffer.emit_u32(w).unwrap();
        }
        buffer
    }

    #[test]
    fn bl_encodes_the_word_aligned_distance() {
        let mut out = Vec::new();
        PowerTarget.encode_call(0x1000, 0x0f00, &mut out).unwrap();
        let word = u32::from_be_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(word, 0x4800_0001 | (-0x100i32 as u32 & 0x03ff_fffc));
        assert!(PowerTarget.is_call_displacement_encodable(0x01ff_fffc));
        assert!(!PowerTarget.is_call_displacement_encodable(0x0200_0000));
        assert!(!PowerTarget.is_call_displacement_encodable(6));
    }

    #[test]
    fn label_relative_24_keeps_opcode_and_link_bits() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[0x4800_0001]);
        PowerTarget
            .apply_label_relative_24(&mut buffer, 0, 0x1_0040)
            .unwrap();
        assert_eq!(buffer.read_u32(0).unwrap(), 0x4800_0041);
    }

    #[test]
    fn label_relative_16_ors_into_the_bd_field() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[0, 0x4182_0000]);
        PowerTarget
            .apply_label_relative_16(&mut buffer, 4, 0x1_0000, 1, false)
            .unwrap();
        assert_eq!(buffer.read_u32(4).unwrap(), 0x4182_fffc);
    }

    #[test]
    fn li_receives_the_word_distance() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[0x3860_0000]);
        let li = EncodedInstruction { offset: 0, length: 4 };
        PowerTarget
            .apply_load_label_relative_16(&mut buffer, li, 0x1_0000, 0x1_0040, 0)
            .unwrap();
        assert_eq!(buffer.read_u32(0).unwrap(), 0x3860_0010);

        let err = PowerTarget
            .apply_load_label_relative_16(&mut buffer, li, 0x1_0000, 0x1_0042, 0)
            .unwrap_err();
        assert!(matches!(err, CompileError::Encoding(EncodingError::Misaligned { .. })));
    }

    #[test]
    fn fixed_sequence_receives_hi_lo_slices() {
        let arena = Bump::new();
        let mut buffer = words(&arena, &[0x3d80_0000, 0x3d60_0000, 0x618c_0000, 0x796b_000e, 0xe96b_0000]);
        let ld = EncodedInstruction { offset: 16, length: 4 };
        let address: u64 = 0x0000_1234_5678_9abc;
        PowerTarget
            .apply_load_label_relative_64(&mut buffer, ld, address)
            .unwrap();

        let hi = hi_value(address as i64);
        assert_eq!(buffer.read_u32(16).unwrap() & 0xffff, 0x9abc);
        assert_eq!(buffer.read_u32(8).unwrap() & 0xffff, (hi >> 16) as u32 & 0xffff);
        assert_eq!(buffer.read_u32(4).unwrap() & 0xffff, hi as u32 & 0xffff);
        assert_eq!(buffer.read_u32(0).unwrap() & 0xffff, (hi >> 32) as u32 & 0xffff);
        assert_eq!(buffer.read_u32(12).unwrap(), 0x796b_000e);
    }

    #[test]
    fn trampoline_is_seven_words() {
        let mut out = Vec::new();
        PowerTarget
            .encode_trampoline(0, 0x1122_3344_5566_7788, &mut out)
            .unwrap();
        assert_eq!(out.len() as u32, PowerTarget.trampoline_size());
        assert_eq!(&out[0..4], &(0x3d60_1122u32).to_be_bytes());
        assert_eq!(&out[24..28], &BCTR.to_be_bytes());
    }

    #[test]
    fn stack_adjust_is_addi_on_r1() {
        let mut out = Vec::new();
        PowerTarget.encode_stack_adjust(32, false, &mut out).unwrap();
        assert_eq!(out, (0x3821_ffe0u32).to_be_bytes().to_vec());
    }
}
