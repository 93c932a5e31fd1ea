// Compilation configuration. CompileConfig replaces the process-wide option flags and the
// global value table with one explicit object that a caller builds once and hands to every
// compilation by reference. The compilation mode decides whether snippet and constant
// metadata is persisted as external relocations (AOT) or patched and registered in place
// (direct). Alignment knobs control the method entry padding and the patchable helper call
// padding; trace switches enable the relocation and snippet dumps. from_env overlays a few
// EMITCORE_* environment variables so tools can flip modes without code changes.

//! Compilation configuration.

use super::global_values::GlobalValueTable;
use std::env;

/// How metadata for code addresses is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilationMode {
    /// Code runs where it is compiled; pointers are patched in place.
    #[default]
    Direct,
    /// Code is persisted; every external reference needs a relocation record.
    Aot,
}

impl CompilationMode {
    /// Whether external relocations must be recorded and persisted.
    pub fn persists_relocations(self) -> bool {
        matches!(self, CompilationMode::Aot)
    }
}

/// Configuration shared by all compilations of a process.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    pub mode: CompilationMode,
    /// Method entry alignment boundary; zero or a non power of two disables it.
    pub method_entry_alignment: u32,
    /// Bytes emitted before the aligned method entry.
    pub pre_entry_size: u32,
    /// Boundary a patchable helper call displacement must not straddle.
    pub instruction_patch_alignment: u32,
    pub trace_relocations: bool,
    pub trace_snippets: bool,
    pub global_values: GlobalValueTable,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            mode: CompilationMode::Direct,
            method_entry_alignment: 0,
            pre_entry_size: 0,
            instruction_patch_alignment: 8,
            trace_relocations: false,
            trace_snippets: false,
            global_values: GlobalValueTable::default(),
        }
    }
}

impl CompileConfig {
    /// Configuration for ahead-of-time compilation.
    pub fn aot() -> Self {
        Self {
            mode: CompilationMode::Aot,
            ..Self::default()
        }
    }

    /// Default configuration overlaid with `EMITCORE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_flag("EMITCORE_AOT") {
            config.mode = CompilationMode::Aot;
        }
        if let Some(alignment) = env::var("EMITCORE_ENTRY_ALIGNMENT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.method_entry_alignment = alignment;
        }
        config.trace_relocations = env_flag("EMITCORE_TRACE_RELOCATIONS");
        config.trace_snippets = env_flag("EMITCORE_TRACE_SNIPPETS");
        log::debug!("Configuration from environment: {:?}", config.mode);
        config
    }

    pub fn with_mode(mut self, mode: CompilationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_entry_alignment(mut self, boundary: u32, pre_entry_size: u32) -> Self {
        self.method_entry_alignment = boundary;
        self.pre_entry_size = pre_entry_size;
        self
    }

    pub fn with_global_values(mut self, table: GlobalValueTable) -> Self {
        self.global_values = table;
        self
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::global_values::GlobalValue;

    #[test]
    fn aot_mode_persists_relocations() {
        assert!(CompileConfig::aot().mode.persists_relocations());
        assert!(!CompileConfig::default().mode.persists_relocations());
    }

    #[test]
    fn builders_compose() {
        let config = CompileConfig::default()
            .with_mode(CompilationMode::Aot)
            .with_entry_alignment(16, 4)
            .with_global_values(GlobalValueTable::new().with(GlobalValue::HeapTop, 7));
        assert_eq!(config.mode, CompilationMode::Aot);
        assert_eq!(config.method_entry_alignment, 16);
        assert_eq!(config.pre_entry_size, 4);
        assert_eq!(config.global_values.get(GlobalValue::HeapTop), 7);
    }
}
