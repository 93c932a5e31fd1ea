// This module encodes the handful of x86-64 instruction sequences the emission core writes on
// its own, using the iced-x86 CodeAssembler: the near call from a helper call snippet to its
// helper or trampoline, the restart jump back into the method (short form when the rel8
// window reaches), the rsp adjustment that releases or re-acquires outgoing argument space,
// and the 14 byte helper trampoline `jmp qword ptr [rip]` followed by the absolute helper
// address. Each sequence is assembled at its final instruction pointer so relative fields come
// out right, and the produced length is checked against the fixed length the snippet estimate
// assumed. NOP padding uses the recommended multi-byte NOP forms.

//! x86-64 snippet instruction encoding using iced-x86.

use crate::target::{fits_signed, EncodingError};
use iced_x86::code_asm::*;

/// Length of `call rel32`.
pub const CALL_LENGTH: u32 = 5;
/// Length of `jmp rel8`.
pub const SHORT_JMP_LENGTH: u32 = 2;
/// Length of `jmp rel32`.
pub const NEAR_JMP_LENGTH: u32 = 5;
/// Length of `jmp qword ptr [rip]` plus the 8 byte target.
pub const TRAMPOLINE_LENGTH: u32 = 14;

/// Recommended multi-byte NOPs, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Assembles snippet sequences at a fixed instruction pointer.
pub struct X64Encoder {
    assembler: CodeAssembler,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let mut assembler =
            CodeAssembler::new(64).map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        assembler.set_prefer_short_branch(true);
        Ok(Self { assembler })
    }

    /// Assemble at `ip`, check the length and append to `out`.
    fn finish(
        mut self,
        ip: u64,
        expected: Option<u32>,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let bytes = self
            .assembler
            .assemble(ip)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        if let Some(expected) = expected {
            if bytes.len() as u32 != expected {
                return Err(EncodingError::AssemblyError(format!(
                    "expected {expected} bytes, assembled {}",
                    bytes.len()
                )));
            }
        }
        out.extend_from_slice(&bytes);
        Ok(())
    }

    /// `call target` placed at `ip`.
    pub fn call(mut self, ip: u64, target: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        let displacement = target.wrapping_sub(ip + CALL_LENGTH as u64) as i64;
        if !fits_signed(displacement, 32) {
            return Err(EncodingError::DisplacementOutOfRange {
                displacement,
                bits: 32,
            });
        }
        self.assembler
            .call(target)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.finish(ip, Some(CALL_LENGTH), out)
    }

    /// `jmp target` placed at `ip`, short when rel8 reaches.
    pub fn jmp(mut self, ip: u64, target: u64, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        let short = target.wrapping_sub(ip + SHORT_JMP_LENGTH as u64) as i64;
        let near = target.wrapping_sub(ip + NEAR_JMP_LENGTH as u64) as i64;
        let expected = if fits_signed(short, 8) {
            SHORT_JMP_LENGTH
        } else if fits_signed(near, 32) {
            NEAR_JMP_LENGTH
        } else {
            return Err(EncodingError::DisplacementOutOfRange {
                displacement: near,
                bits: 32,
            });
        };
        self.assembler
            .jmp(target)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.finish(ip, Some(expected), out)
    }

    /// `add rsp, imm` or `sub rsp, imm`.
    pub fn adjust_rsp(
        mut self,
        adjustment: i32,
        release: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let result = if release {
            self.assembler.add(rsp, adjustment)
        } else {
            self.assembler.sub(rsp, adjustment)
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.finish(0, Some(stack_adjust_length(adjustment)), out)
    }

    /// Trampoline at `ip` that jumps to `helper` through an inline literal.
    pub fn trampoline(
        mut self,
        ip: u64,
        helper: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let mut literal = self.assembler.create_label();
        self.assembler
            .jmp(qword_ptr(literal))
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.assembler
            .set_label(&mut literal)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.assembler
            .dq(&[helper])
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.finish(ip, Some(TRAMPOLINE_LENGTH), out)
    }
}

/// Length of the rsp adjustment for `adjustment`; imm8 form when it fits.
pub fn stack_adjust_length(adjustment: i32) -> u32 {
    if adjustment == 0 {
        0
    } else if fits_signed(adjustment as i64, 8) {
        4
    } else {
        7
    }
}

/// Append `bytes` bytes of multi-byte NOPs.
pub fn encode_nops(mut bytes: u32, out: &mut Vec<u8>) {
    while bytes > 0 {
        let chunk = bytes.min(NOPS.len() as u32);
        out.extend_from_slice(NOPS[chunk as usize - 1]);
        bytes -= chunk;
    }
}
