// Out-of-line snippets. A snippet is a block of code or data emitted after the main
// instruction stream: helper call thunks reached from a fast path, and the constant data
// pool. Snippets follow a strict two-pass protocol. During estimation each snippet reports a
// conservative length for an estimated start, the set assigns every snippet label an
// estimated offset and freezes the emission order of that placement (warm snippets follow the
// last warm instruction, cold snippets the cold region; data snippets always come last).
// The length each snippet reported is frozen with the order. During emission the snippets
// are visited in that order and the bytes each one writes must not exceed its frozen length,
// because the method length estimate and every later estimated label offset were computed
// from these numbers.
// Emitting a snippet binds its label and may register relocations as a side effect.

//! Snippet protocol and the snippet set.

pub mod constant_data;
pub mod helper_call;

pub use constant_data::{AddressKind, ConstantDataSnippet, ConstantValue, RuntimePatchTable};
pub use helper_call::HelperCallSnippet;

use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::InstructionTable;
use crate::codegen::label::{LabelDirectory, LabelId};
use crate::core::config::CompileConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::relocation::RelocationRegistry;
use crate::runtime::{CodeCacheManager, HelperTable};
use crate::target::ArchitectureEncoder;
use std::fmt;

/// What a snippet may consult when it estimates its length.
pub struct EstimateContext<'a> {
    pub target: &'a dyn ArchitectureEncoder,
    pub config: &'a CompileConfig,
    pub labels: &'a LabelDirectory,
    /// Address of the code buffer once it is reserved.
    pub base: Option<u64>,
}

/// What a snippet may touch while it emits.
pub struct EmitContext<'a, 'arena> {
    pub buffer: &'a mut CodeBuffer<'arena>,
    pub labels: &'a mut LabelDirectory,
    pub instructions: &'a InstructionTable,
    pub relocations: &'a mut RelocationRegistry,
    pub patch_table: &'a mut RuntimePatchTable,
    pub target: &'a dyn ArchitectureEncoder,
    pub code_cache: &'a dyn CodeCacheManager,
    pub helpers: &'a HelperTable,
    pub config: &'a CompileConfig,
    pub session: &'a CompilationSession<'arena>,
}

impl EmitContext<'_, '_> {
    /// Resolve `label` to the cursor address.
    pub fn bind_label(&mut self, label: LabelId) -> CompileResult<u64> {
        let address = self.buffer.cursor_address();
        self.labels.resolve(label, address)?;
        Ok(address)
    }
}

/// What a snippet may consult when it prints itself.
pub struct PrintContext<'a> {
    pub labels: &'a LabelDirectory,
    pub helpers: &'a HelperTable,
    pub target: &'a dyn ArchitectureEncoder,
}

/// An out-of-line block of code or data.
pub trait Snippet {
    /// Label bound to the snippet's entry.
    fn label(&self) -> LabelId;

    fn name(&self) -> &'static str;

    /// Whether the snippet follows the warm instruction stream.
    fn is_warm(&self) -> bool {
        false
    }

    /// Whether the snippet holds data rather than code.
    fn is_data(&self) -> bool {
        false
    }

    /// Conservative length when the snippet starts at `estimated_start`.
    fn length(&self, estimated_start: u32, cx: &EstimateContext<'_>) -> u32;

    /// Write the snippet at the cursor and bind its label.
    fn emit_body(&mut self, cx: &mut EmitContext<'_, '_>) -> CompileResult<()>;

    fn print(&self, out: &mut dyn fmt::Write, cx: &PrintContext<'_>) -> fmt::Result;
}

/// Placement of a snippet, as emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedSnippet {
    pub index: usize,
    pub offset: u32,
    pub estimate: u32,
    pub length: u32,
}

/// A snippet's slot in a frozen placement.
#[derive(Debug, Clone, Copy)]
struct Placement {
    index: usize,
    /// Length reported when the placement was estimated.
    estimate: u32,
}

/// Snippets of one compilation, in insertion order.
#[derive(Default)]
pub struct SnippetSet {
    snippets: Vec<Box<dyn Snippet>>,
    warm_order: Option<Vec<Placement>>,
    cold_order: Option<Vec<Placement>>,
    emitted: Vec<EmittedSnippet>,
}

impl SnippetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    fn order(&self, is_warm: bool) -> &Option<Vec<Placement>> {
        if is_warm {
            &self.warm_order
        } else {
            &self.cold_order
        }
    }

    /// Add a snippet; its placement must not have been estimated yet.
    pub fn add(&mut self, snippet: Box<dyn Snippet>) -> CompileResult<usize> {
        if self.order(snippet.is_warm()).is_some() {
            return Err(CompileError::SnippetProtocol {
                reason: format!(
                    "{} {} added after its placement was estimated",
                    snippet.name(),
                    snippet.label()
                ),
            });
        }
        self.snippets.push(snippet);
        Ok(self.snippets.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&dyn Snippet> {
        self.snippets.get(index).map(|s| s.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Snippet> {
        self.snippets.iter().map(|s| s.as_ref())
    }

    /// Placements recorded by [`emit`](Self::emit).
    pub fn emitted(&self) -> &[EmittedSnippet] {
        &self.emitted
    }

    /// Bytes written by snippets so far.
    pub fn emitted_bytes(&self) -> u32 {
        self.emitted.iter().map(|e| e.length).sum()
    }

    /// Estimate the snippets of one placement starting at `start`; returns
    /// the estimated end offset and freezes the emission order.
    pub fn set_estimated_locations(
        &mut self,
        start: u32,
        is_warm: bool,
        labels: &mut LabelDirectory,
        target: &dyn ArchitectureEncoder,
        config: &CompileConfig,
    ) -> CompileResult<u32> {
        if self.order(is_warm).is_some() {
            return Err(CompileError::SnippetProtocol {
                reason: format!(
                    "{} snippet locations estimated twice",
                    if is_warm { "warm" } else { "cold" }
                ),
            });
        }

        let matching = |s: &dyn Snippet, data: bool| s.is_warm() == is_warm && s.is_data() == data;
        let order: Vec<usize> = (0..self.snippets.len())
            .filter(|&i| matching(self.snippets[i].as_ref(), false))
            .chain((0..self.snippets.len()).filter(|&i| matching(self.snippets[i].as_ref(), true)))
            .collect();

        let mut offset = start;
        let mut placements = Vec::with_capacity(order.len());
        for index in order {
            let snippet = &self.snippets[index];
            let cx = EstimateContext {
                target,
                config,
                labels: &*labels,
                base: None,
            };
            let length = snippet.length(offset, &cx);
            labels.set_estimated_offset(snippet.label(), offset);
            log::trace!(
                "Estimated {} {} at {offset:#x}, {length} bytes",
                snippet.name(),
                snippet.label()
            );
            placements.push(Placement {
                index,
                estimate: length,
            });
            offset += length;
        }
        log::debug!(
            "Estimated {} {} snippets: {:#x}..{offset:#x}",
            placements.len(),
            if is_warm { "warm" } else { "cold" },
            start
        );

        if is_warm {
            self.warm_order = Some(placements);
        } else {
            self.cold_order = Some(placements);
        }
        Ok(offset)
    }

    /// Emit the snippets of one placement in their frozen order.
    pub fn emit(&mut self, is_warm: bool, cx: &mut EmitContext<'_, '_>) -> CompileResult<u32> {
        let order = self
            .order(is_warm)
            .clone()
            .ok_or_else(|| CompileError::SnippetProtocol {
                reason: format!(
                    "{} snippets emitted before their locations were estimated",
                    if is_warm { "warm" } else { "cold" }
                ),
            })?;

        let mut total = 0;
        for Placement { index, estimate } in order {
            let snippet = &mut self.snippets[index];
            let offset = cx.buffer.cursor();
            snippet.emit_body(cx)?;
            let length = cx.buffer.cursor() - offset;

            if length > estimate {
                return Err(CompileError::SnippetEstimateExceeded {
                    snippet: snippet.name(),
                    estimate,
                    actual: length,
                });
            }
            if !cx.labels.is_resolved(snippet.label()) {
                return Err(CompileError::SnippetProtocol {
                    reason: format!("{} did not bind {}", snippet.name(), snippet.label()),
                });
            }

            log::trace!(
                "Emitted {} {} at {offset:#x}: {length} of {estimate} bytes",
                snippet.name(),
                snippet.label()
            );
            cx.session.record_snippet_emitted();
            self.emitted.push(EmittedSnippet {
                index,
                offset,
                estimate,
                length,
            });
            total += length;
        }
        Ok(total)
    }

    /// Print every snippet in insertion order.
    pub fn print(&self, out: &mut dyn fmt::Write, cx: &PrintContext<'_>) -> fmt::Result {
        for snippet in &self.snippets {
            snippet.print(out, cx)?;
        }
        Ok(())
    }
}

/// Address of `label` or of its estimated offset, for printing.
pub(crate) fn label_location(label: LabelId, labels: &LabelDirectory) -> String {
    match (labels.address(label), labels.estimated_offset(label)) {
        (Some(address), _) => format!("{address:#x}"),
        (None, Some(offset)) => format!("~+{offset:#x}"),
        (None, None) => "?".to_string(),
    }
}
