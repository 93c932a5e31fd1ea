// This module gathers the infrastructure shared by every part of emitcore: the compilation
// session (the bumpalo arena that owns code bytes, interned names and statistics), the
// explicit compilation configuration with its global value table, the error types, and the
// arena scoped test context used by unit and integration tests.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Phase profiles and emission statistics
//!
//! ## Configuration (`config`, `global_values`)
//! - Compilation mode (direct or AOT) and alignment knobs
//! - Runtime global values, passed explicitly instead of kept in statics
//!
//! ## Errors (`error`)
//! - `CompileError` for everything that aborts a compilation

pub mod config;
pub mod error;
pub mod global_values;
pub mod session;
pub mod test_utils;

pub use config::{CompilationMode, CompileConfig};
pub use error::{CompileError, CompileResult};
pub use global_values::{GlobalValue, GlobalValueTable};
pub use session::{CompilationSession, PhaseProfile, SessionStats};
