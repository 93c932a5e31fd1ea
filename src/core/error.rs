// This module defines the error types of emitcore using the thiserror crate. CompileError is
// the single error enum surfaced by the phase driver, the code buffer, the snippet set and the
// relocation engine. Almost every variant describes a compiler defect (an estimate that was
// too small, a branch that cannot be encoded, a label applied before it was placed, a
// relocation the target does not implement) and is therefore fatal to the compilation that
// raised it. The one recoverable variant is Interrupted, produced at the two cooperative
// checkpoints of the phase driver; callers may retry the whole compilation later. Overflow of
// an iterated relocation group is deliberately absent: it is handled by opening a new group.
// Encoder and AOT failures keep their own enums and convert via From.

//! Error types for emitcore.
//!
//! Using thiserror for the compile error; encoder errors are plain enums with a
//! manual `Display` and convert through `From`.

use crate::aot::AotError;
use crate::codegen::phase::Phase;
use crate::target::EncodingError;
use thiserror::Error;

/// Main error type for a compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Compilation interrupted after {phase}")]
    Interrupted { phase: Phase },

    #[error(
        "Method length estimate must be conservatively large: \
         codeLength = {actual}, estimatedCodeLength = {estimated}"
    )]
    EstimateExceeded { actual: u32, estimated: u32 },

    #[error("{snippet} length estimate must be conservatively large (estimate={estimate}, actual={actual})")]
    SnippetEstimateExceeded {
        snippet: &'static str,
        estimate: u32,
        actual: u32,
    },

    #[error("Relocation applied to unresolved label L{label}{context}")]
    UnresolvedLabel { label: u32, context: String },

    #[error("Label L{label} is already resolved to {address:#x}")]
    LabelAlreadyResolved { label: u32, address: u64 },

    #[error("Patch of {size} bytes at offset {offset:#x} lies outside the {length:#x} bytes written")]
    PatchOutOfBounds { offset: u32, size: u32, length: u32 },

    #[error("Instruction I{instruction} has no binary encoding")]
    UnencodedInstruction { instruction: u32 },

    #[error("{what}: displacement {displacement:#x} does not fit in {bits} bits")]
    DisplacementOutOfRange {
        what: &'static str,
        displacement: i64,
        bits: u32,
    },

    #[error("Code cache cannot hold {requested} more bytes")]
    CodeCacheExhausted { requested: u32 },

    #[error("No helper trampoline available for {helper} from {from:#x}")]
    TrampolineUnavailable { helper: String, from: u64 },

    #[error("Local helper trampoline should be reachable directly: {helper} trampoline {trampoline:#x} from {from:#x}")]
    TrampolineUnreachable {
        helper: String,
        trampoline: u64,
        from: u64,
    },

    #[error("Restart branch from {from:#x} to {to:#x} is out of range")]
    RestartBranchOutOfRange { from: u64, to: u64 },

    #[error("{target} does not implement {relocation}")]
    UnsupportedRelocation {
        target: &'static str,
        relocation: &'static str,
    },

    #[error("Unexpected instruction sequence: {reason}")]
    InvalidInstructionSequence { reason: String },

    #[error("Snippet protocol violation: {reason}")]
    SnippetProtocol { reason: String },

    #[error("Invalid phase list: {reason}")]
    PhaseOrder { reason: String },

    #[error("Relocation group {group} accounts {accounted} bytes but holds {actual}")]
    RelocationAccounting {
        group: usize,
        accounted: usize,
        actual: usize,
    },

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Aot(#[from] AotError),
}

impl CompileError {
    /// Whether the failure is a compiler defect rather than a cooperative stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CompileError::Interrupted { .. })
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
