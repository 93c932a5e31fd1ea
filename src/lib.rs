//! emitcore - emission and patching substrate of a multi-architecture JIT/AOT backend.
//!
//! A compilation runs a target supplied list of phases over one [`CodeGenerator`]. Binary
//! encoding fills a code buffer sized by a conservative estimate, snippets (helper calls and
//! the constant pool) are emitted after the main stream, and relocations are applied once
//! every address is final. External relocations of an AOT compilation are grouped into
//! iterated records and persisted.
//!
//! # Primary Usage
//!
//! ```ignore
//! use emitcore::core::{CompilationSession, CompileConfig};
//! use emitcore::codegen::{CodeGenerator, PhaseDriver};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut cg = CodeGenerator::new(&session, &config, &target, &caches, &helpers);
//! PhaseDriver::standard().perform_all(&mut cg, &mut backend)?;
//! let records = cg.aot_relocation_data();
//! ```
//!
//! # Architecture
//!
//! - [`core`] - session, configuration and errors
//! - [`codegen`] - code buffer, labels, instructions, phase driver
//! - [`snippet`] - helper call and constant data snippets
//! - [`relocation`] - relocation variants, registry and iterated external groups
//! - [`target`] - architecture encoder interface, with [`x64`], [`power`], [`arm`] and [`s390`]
//! - [`runtime`] - code cache, trampolines and helpers
//! - [`aot`] - persisted relocation records and object files
//! - [`debug`] - relocation, snippet and emission dumps

pub mod aot;
pub mod arm;
pub mod codegen;
pub mod core;
pub mod debug;
pub mod power;
pub mod relocation;
pub mod runtime;
pub mod s390;
pub mod snippet;
pub mod target;
pub mod x64;

pub use codegen::{CodeGenBackend, CodeGenerator, Phase, PhaseDriver};
pub use core::{CompilationMode, CompilationSession, CompileConfig, CompileError, CompileResult};
pub use target::{ArchitectureEncoder, TargetArch};
