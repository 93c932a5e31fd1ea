// This module defines the seam between the target independent emission core and the
// per-architecture encoders. ArchitectureEncoder answers the questions the core cannot answer
// itself: how far a call or branch can reach, where a displacement is measured from, how long
// the snippet instructions are, how the call, branch, stack adjust, NOP and trampoline
// sequences are encoded, how many bytes an AOT record header takes, and how each label
// relocation width is patched into an instruction. The label relocation hooks have default
// bodies that mirror the behaviour every target shares (add the label address into an 8 or
// 16 bit field) or report the relocation as unsupported; targets override what they use.
// The module also hosts the HI/LO split helpers used by split immediate sequences and the
// TargetArch selector used by tools that decode persisted relocation data.

//! Architecture encoder interface.
//!
//! Implemented by [`crate::x64::X64Target`], [`crate::power::PowerTarget`],
//! [`crate::arm::ArmTarget`] and [`crate::s390::S390Target`].

use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::EncodedInstruction;
use crate::core::config::CompilationMode;
use crate::core::error::{CompileError, CompileResult};
use crate::relocation::kind::ExternalRelocationKind;
use object::Endianness;
use std::fmt;

/// Error types for snippet instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Displacement does not fit the instruction's immediate field.
    DisplacementOutOfRange { displacement: i64, bits: u32 },
    /// Value does not honour the instruction's alignment.
    Misaligned { value: i64, alignment: u32 },
    /// Operand the target cannot encode.
    UnsupportedOperand(&'static str),
    /// Assembly error from iced-x86.
    AssemblyError(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::DisplacementOutOfRange { displacement, bits } => {
                write!(f, "Displacement {displacement:#x} does not fit in {bits} bits")
            }
            EncodingError::Misaligned { value, alignment } => {
                write!(f, "Value {value:#x} is not {alignment}-byte aligned")
            }
            EncodingError::UnsupportedOperand(what) => write!(f, "Unsupported operand: {what}"),
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Supported instruction set architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    X64,
    Power,
    Arm,
    S390,
}

impl TargetArch {
    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X64 => "x86-64",
            TargetArch::Power => "power",
            TargetArch::Arm => "arm",
            TargetArch::S390 => "s390x",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86-64" | "x64" | "amd64" => Some(TargetArch::X64),
            "power" | "ppc64" => Some(TargetArch::Power),
            "arm" => Some(TargetArch::Arm),
            "s390x" | "z" => Some(TargetArch::S390),
            _ => None,
        }
    }

    /// Encoder for this architecture.
    pub fn encoder(self) -> Box<dyn ArchitectureEncoder> {
        match self {
            TargetArch::X64 => Box::new(crate::x64::X64Target::new()),
            TargetArch::Power => Box::new(crate::power::PowerTarget::new()),
            TargetArch::Arm => Box::new(crate::arm::ArmTarget::new()),
            TargetArch::S390 => Box::new(crate::s390::S390Target::new()),
        }
    }
}

/// Upper half of `address` for a split immediate whose lower half is sign extended.
pub fn hi_value(address: i64) -> i64 {
    (address >> 16) + ((address >> 15) & 1)
}

/// Upper half written into a requestor under `mode`.
///
/// Persisted code keeps the raw upper half; the loader re-adds the carry when it
/// relocates the sequence.
pub fn requestor_hi_value(address: i64, mode: CompilationMode) -> i64 {
    if mode.persists_relocations() {
        address >> 16
    } else {
        hi_value(address)
    }
}

/// Lower half of `address`, sign extended by the consuming instruction.
pub fn lo_value(address: i64) -> i16 {
    address as i16
}

/// Whether `value` fits a signed immediate of `bits` bits.
pub fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&value)
}

/// Per-architecture encoding contract used by snippets and relocations.
///
/// Displacements are signed byte distances measured from
/// [`call_reference_address`](Self::call_reference_address) (calls) or from
/// the equivalent point of a branch.
pub trait ArchitectureEncoder: Send + Sync {
    fn arch(&self) -> TargetArch;

    fn name(&self) -> &'static str {
        self.arch().name()
    }

    fn endianness(&self) -> Endianness;

    /// Size of a code pointer in bytes.
    fn pointer_size(&self) -> u8;

    /// Address a call displacement is measured from, given the call's address.
    fn call_reference_address(&self, call_address: u64) -> u64;

    /// Offset of the displacement field inside a call instruction.
    fn call_displacement_offset(&self) -> u32;

    fn call_length(&self) -> u32;

    fn is_call_displacement_encodable(&self, displacement: i64) -> bool;

    /// Append a direct call from `call_address` to `target`.
    fn encode_call(&self, call_address: u64, target: u64, out: &mut Vec<u8>)
        -> Result<(), EncodingError>;

    /// Length of an unconditional branch covering `displacement`, or `None`
    /// when no branch form reaches it.
    fn branch_length(&self, displacement: Option<i64>) -> Option<u32>;

    /// Append the shortest unconditional branch from `from` to `to`.
    fn encode_branch(&self, from: u64, to: u64, out: &mut Vec<u8>) -> Result<(), EncodingError>;

    /// Length of the stack pointer adjustment instruction; zero when none.
    fn stack_adjust_length(&self, adjustment: i32) -> u32;

    /// Append `sp += adjustment` when `release`, `sp -= adjustment` otherwise.
    fn encode_stack_adjust(
        &self,
        adjustment: i32,
        release: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError>;

    /// Append `bytes` bytes of no-op padding.
    fn encode_nops(&self, bytes: u32, out: &mut Vec<u8>) -> Result<(), EncodingError>;

    /// Size of one helper trampoline slot.
    fn trampoline_size(&self) -> u32;

    /// Append a trampoline placed at `trampoline_address` that jumps to `helper_address`.
    fn encode_trampoline(
        &self,
        trampoline_address: u64,
        helper_address: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError>;

    /// Number of requestor instructions that materialize one constant address.
    fn address_requestor_count(&self) -> usize {
        if self.pointer_size() == 8 {
            4
        } else {
            2
        }
    }

    /// Persisted header size of a relocation record of `kind`.
    fn aot_header_size(&self, kind: ExternalRelocationKind, has_target2: bool) -> u16 {
        let _ = kind;
        let ptr = self.pointer_size() as u16;
        4 + ptr + if has_target2 { ptr } else { 0 }
    }

    fn apply_label_relative_8(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let value = buffer.read_u8(offset)? as i8;
        buffer.patch_u8(offset, value.wrapping_add(label as i8) as u8)
    }

    fn apply_label_relative_12(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
        check_disp: bool,
        data_base: Option<u64>,
    ) -> CompileResult<()> {
        let _ = (buffer, offset, label, check_disp, data_base);
        Err(self.unsupported("LabelRelative12Bit"))
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
        let value = buffer.read_u16(offset)? as i16;
        buffer.patch_u16(offset, value.wrapping_add(label as i16) as u16)
    }

    fn apply_label_relative_24(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let _ = (buffer, offset, label);
        Err(self.unsupported("LabelRelative24Bit"))
    }

    fn apply_label_relative_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let _ = (buffer, offset, label);
        Err(self.unsupported("LabelRelative32Bit"))
    }

    fn apply_label_table_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        offset: u32,
        label: u64,
    ) -> CompileResult<()> {
        let _ = (buffer, offset, label);
        Err(self.unsupported("LabelTable32Bit"))
    }

    fn apply_load_label_relative_16(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        start: u64,
        end: u64,
        delta_to_start: i32,
    ) -> CompileResult<()> {
        let _ = (buffer, instruction, start, end, delta_to_start);
        Err(self.unsupported("LoadLabelRelative16Bit"))
    }

    fn apply_load_label_relative_32(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        start: u64,
        end: u64,
        delta_to_start: i32,
    ) -> CompileResult<()> {
        let _ = (buffer, instruction, start, end, delta_to_start);
        Err(self.unsupported("LoadLabelRelative32Bit"))
    }

    fn apply_load_label_relative_64(
        &self,
        buffer: &mut CodeBuffer<'_>,
        instruction: EncodedInstruction,
        label: u64,
    ) -> CompileResult<()> {
        let _ = (buffer, instruction, label);
        Err(self.unsupported("LoadLabelRelative64Bit"))
    }

    /// Patch the immediates of the instructions that materialize `address`.
    ///
    /// Pairs receive `hi | lo`; quads receive the four 16-bit slices of a
    /// 64-bit address with the low slice in the last instruction. `hi` is the
    /// already mode-adjusted upper half.
    fn patch_address_requestors(
        &self,
        buffer: &mut CodeBuffer<'_>,
        requestors: &[EncodedInstruction],
        address: u64,
        hi: i64,
    ) -> CompileResult<()> {
        match requestors {
            [first, second] => {
                buffer.or_u32(first.offset, (hi as u32) & 0xffff)?;
                buffer.or_u32(second.offset, (lo_value(address as i64) as u16) as u32)
            }
            [n0, n1, n2, n3] => {
                buffer.or_u32(n3.offset, (lo_value(address as i64) as u16) as u32)?;
                buffer.or_u32(n2.offset, (hi as u32) & 0xffff)?;
                buffer.or_u32(n1.offset, ((hi >> 16) as u32) & 0xffff)?;
                buffer.or_u32(n0.offset, ((hi >> 32) as u32) & 0xffff)
            }
            _ => Err(CompileError::InvalidInstructionSequence {
                reason: format!(
                    "{} requestors for one address on {}",
                    requestors.len(),
                    self.name()
                ),
            }),
        }
    }

    fn unsupported(&self, relocation: &'static str) -> CompileError {
        CompileError::UnsupportedRelocation {
            target: self.name(),
            relocation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hi_lo_recombine_to_the_address() {
        for address in [0x1234_5678i64, 0x1234_8678, 0x7fff_ffff, 0x0000_8000, 0x10_0000_ffff] {
            let hi = hi_value(address);
            let lo = lo_value(address) as i64;
            assert_eq!((hi << 16) + lo, address, "address {address:#x}");
        }
    }

    #[test]
    fn persisted_requestors_keep_the_raw_upper_half() {
        let address = 0x1234_8678i64;
        assert_eq!(requestor_hi_value(address, CompilationMode::Aot), 0x1234);
        assert_eq!(requestor_hi_value(address, CompilationMode::Direct), 0x1235);
    }

    #[test]
    fn signed_fit() {
        assert!(fits_signed(127, 8));
        assert!(!fits_signed(128, 8));
        assert!(fits_signed(-128, 8));
        assert!(fits_signed(i32::MIN as i64, 32));
        assert!(!fits_signed(i32::MAX as i64 + 1, 32));
    }

    #[test]
    fn arch_names_round_trip() {
        for arch in [TargetArch::X64, TargetArch::Power, TargetArch::Arm, TargetArch::S390] {
            assert_eq!(TargetArch::from_name(arch.name()), Some(arch));
            assert_eq!(arch.encoder().arch(), arch);
        }
    }
}
