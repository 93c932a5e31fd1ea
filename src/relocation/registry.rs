// The relocation registry of one compilation. Relocations are recorded in creation order with
// the source location that created them; code patches and external relocations are kept in
// separate lists because they are processed differently. External relocations are recorded
// only when the compilation persists relocations, and are grouped only once every site is
// final. Processing applies all code patches first, then (for AOT) groups the externals in
// insertion order, writes each group's header, appends every site offset and finally checks
// that each record holds exactly the bytes its accounting promised.

//! Per-compilation relocation list and processing.

use super::iterated::{ExternalRelocationTable, IteratedExternalRelocation};
use super::{ApplyContext, Relocation, RelocationDebugInfo};
use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::{InstructionTable, NodeId};
use crate::codegen::label::LabelDirectory;
use crate::core::config::CompilationMode;
use crate::core::error::{CompileError, CompileResult};
use crate::target::ArchitectureEncoder;
use std::fmt;

/// A relocation and where it was created.
#[derive(Debug, Clone)]
pub struct RelocationEntry {
    pub relocation: Relocation,
    pub debug: Option<RelocationDebugInfo>,
}

/// Counts from one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub applied: usize,
    pub external_sites: usize,
    pub groups: usize,
}

/// Relocations of one compilation.
#[derive(Debug)]
pub struct RelocationRegistry {
    mode: CompilationMode,
    relocations: Vec<RelocationEntry>,
    externals: Vec<RelocationEntry>,
    table: ExternalRelocationTable,
    processed: bool,
}

impl RelocationRegistry {
    pub fn new(mode: CompilationMode) -> Self {
        Self {
            mode,
            relocations: Vec::new(),
            externals: Vec::new(),
            table: ExternalRelocationTable::new(),
            processed: false,
        }
    }

    /// Record a code patch.
    #[track_caller]
    pub fn add_relocation(&mut self, relocation: Relocation, node: Option<NodeId>) -> CompileResult<()> {
        if relocation.is_external() {
            return Err(CompileError::InvalidInstructionSequence {
                reason: format!("{} must be added as an external relocation", relocation.name()),
            });
        }
        let debug = RelocationDebugInfo::here(node);
        log::trace!("Recorded {} at {debug}", relocation.name());
        self.relocations.push(RelocationEntry {
            relocation,
            debug: Some(debug),
        });
        Ok(())
    }

    /// Record an external relocation; returns whether it was kept.
    ///
    /// Externals are only kept when the compilation persists relocations.
    #[track_caller]
    pub fn add_external_relocation(
        &mut self,
        relocation: Relocation,
        node: Option<NodeId>,
    ) -> CompileResult<bool> {
        if !relocation.is_external() {
            return Err(CompileError::InvalidInstructionSequence {
                reason: format!("{} is not an external relocation", relocation.name()),
            });
        }
        if !self.mode.persists_relocations() {
            return Ok(false);
        }
        let debug = RelocationDebugInfo::here(node);
        self.externals.push(RelocationEntry {
            relocation,
            debug: Some(debug),
        });
        Ok(true)
    }

    pub fn relocations(&self) -> &[RelocationEntry] {
        &self.relocations
    }

    pub fn external_relocations(&self) -> &[RelocationEntry] {
        &self.externals
    }

    /// Every entry, code patches first.
    pub fn entries(&self) -> impl Iterator<Item = &RelocationEntry> {
        self.relocations.iter().chain(self.externals.iter())
    }

    pub fn table(&self) -> &ExternalRelocationTable {
        &self.table
    }

    pub fn groups(&self) -> impl Iterator<Item = &IteratedExternalRelocation> {
        self.table.iter()
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Apply every relocation against final addresses.
    ///
    /// `header` encodes a group's persisted header; it is only called in
    /// AOT mode.
    pub fn process(
        &mut self,
        buffer: &mut CodeBuffer<'_>,
        labels: &LabelDirectory,
        instructions: &InstructionTable,
        target: &dyn ArchitectureEncoder,
        data_base: Option<u64>,
        header: &dyn Fn(&IteratedExternalRelocation) -> CompileResult<Vec<u8>>,
    ) -> CompileResult<ProcessSummary> {
        if self.processed {
            return Err(CompileError::InvalidInstructionSequence {
                reason: "relocations processed twice".to_string(),
            });
        }
        let mut summary = ProcessSummary::default();

        for entry in &self.relocations {
            let mut cx = ApplyContext {
                buffer: &mut *buffer,
                labels,
                instructions,
                target,
                data_base,
                debug: entry.debug.as_ref(),
            };
            entry.relocation.apply(&mut cx)?;
            summary.applied += 1;
        }

        if self.mode.persists_relocations() {
            for entry in &mut self.externals {
                let Some(external) = entry.relocation.as_external_mut() else {
                    continue;
                };
                let modifier = external.collect_modifier(instructions)?;
                let wide = modifier.contains(super::iterated::ModifierFlags::WIDE_OFFSET);
                let header_size =
                    target.aot_header_size(external.kind, external.target2.is_some());
                external.group = Some(self.table.insert(external.key(), wide, header_size));
            }

            for group in self.table.iter_mut() {
                let bytes = header(group)?;
                group.initialise(bytes);
            }

            for entry in &self.externals {
                entry
                    .relocation
                    .apply_external(&mut self.table, instructions, target)?;
                summary.applied += 1;
            }

            for (index, group) in self.table.iter().enumerate() {
                let accounted = group.size_of_relocation_data() as usize;
                let actual = group.data().len();
                if accounted != actual {
                    return Err(CompileError::RelocationAccounting {
                        group: index,
                        accounted,
                        actual,
                    });
                }
            }
            summary.groups = self.table.len();
            summary.external_sites = self.table.site_count();
        }

        self.processed = true;
        log::debug!(
            "Processed {} relocations into {} external groups",
            summary.applied,
            summary.groups
        );
        Ok(summary)
    }

    /// Relocation dump, one line per relocation.
    pub fn trace(
        &self,
        out: &mut dyn fmt::Write,
        buffer: &CodeBuffer<'_>,
        instructions: &InstructionTable,
    ) -> fmt::Result {
        writeln!(
            out,
            "{:<48} {:>24} {:>6} {:>10} {:>10} node",
            "relocation", "file", "line", "method", "program"
        )?;
        for entry in self.entries() {
            entry
                .relocation
                .trace(out, entry.debug.as_ref(), buffer, instructions)?;
        }
        Ok(())
    }
}
