// x86-64 target. Calls and jumps measure their displacement from the end of the instruction,
// calls always take the 5 byte rel32 form so a patchable call has a fixed displacement field
// at offset 1, and helper trampolines are 14 byte indirect jumps through an inline literal.
// The 32 bit label relocation adds the label address into a field that binary encoding has
// seeded with minus the address of the following instruction, so the result is the rel32 the
// CPU expects; the load-label form writes end - start into the imm32 of `mov r32, imm32`,
// which must still be zero when patched. Helper address sites are flagged EIP relative.

//! x86-64 architecture encoder.

pub mod encoder;

use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::EncodedInstruction;
use crate::core::error::{CompileError, CompileResult};
use crate::target::{fits_signed, ArchitectureEncoder, EncodingError, TargetArch};
use encoder::{X64Encoder, CALL_LENGTH, NEAR_JMP_LENGTH, SHORT_JMP_LENGTH, TRAMPOLINE_LENGTH};
use object::Endianness;

/// x86-64 encoder for snippets and label relocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Target;

impl X64Target {
    pub fn new() -> Self {
        Self
    }
}

impl ArchitectureEncoder for X64Target {
    fn arch(&self) -> TargetArch {
        TargetArch::X64
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn pointer_size(&self) -> u8 {
        8
    }

    fn call_reference_address(&self, call_address: u64) -> u64 {
        call_address + CALL_LENGTH as u64
    }

    fn call_displacement_offset(&self) -> u32 {
        1
    }

    fn call_length(&self) -> u32 {
        CALL_LENGTH
    }

    fn is_call_displacement_encodable(&self, displacement: i64) -> bool {
        fits_signed(displacement, 32)
    }

    fn encode_call(
        &self,
        call_address: u64,
        target: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        X64Encoder::new()?.call(call_address, target, out)
    }

    fn branch_length(&self, displacement: Option<i64>) -> Option<u32> {
        match displacement {
            None => Some(NEAR_JMP_LENGTH),
            Some(d) if fits_signed(d - SHORT_JMP_LENGTH as i64, 8) => Some(SHORT_JMP_LENGTH),
            Some(d) if fits_signed(d - NEAR_JMP_LENGTH as i64, 32) => Some(NEAR_JMP_LENGTH),
            Some(_) => None,
        }
    }

    fn encode_branch(&self, from: u64, to: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        X64Encoder::new()?.jmp(from, to, out)
    }

    fn stack_adjust_length(&self, adjustment: i32) -> u32 {
        encoder::stack_adjust_length(adjustment)
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
        X64Encoder::new()?.adjust_rsp(adjustment, release, out)
    }

    fn encode_nops(&self, bytes: u32, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoder::encode_nops(bytes, out);
        Ok(())
    }

    fn trampoline_size(&self) -> u32 {
        TRAMPOLINE_LENGTH
    }

    fn encode_trampoline(
        &self,
        trampoline_address: u64,
        helper_address: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        X64Encoder::new()?.trampoline(trampoline_address, helper_address, out)
    }

    fn apply_label_relative_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let value = buffer.read_u32(offset)? as i32;
        buffer.patch_u32(offset, value.wrapping_add(label as i32) as u32)
    }

    fn apply_load_label_relative_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        start: u64,
        end: u64,
        delta_to_start: i32,
    ) -> CompileResult<()> {
        let _ = delta_to_start;
        if instruction.length < 5 {
            return Err(CompileError::InvalidInstructionSequence {
                reason: "load label relocation needs a mov r32, imm32".to_string(),
            });
        }
        let immediate = instruction.end() - 4;
        let distance = end.wrapping_sub(start) as i64;
        if !fits_signed(distance, 32) {
            return Err(CompileError::DisplacementOutOfRange {
                what: "relative label in mov imm32",
                displacement: distance,
                bits: 32,
            });
        }
        if buffer.read_u32(immediate)? != 0 {
            return Err(CompileError::InvalidInstructionSequence {
                reason: "mov imm32 should be 0 before the label distance is written".to_string(),
            });
        }
        buffer.patch_u32(immediate, distance as u32)
    }
}
