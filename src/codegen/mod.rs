// The per-compilation code generator. CodeGenerator ties the emission state of one method
// together: the code buffer, the label directory, the instruction table filled during binary
// encoding, the snippet set with the constant pool, the relocation registry and the runtime
// patch table of a direct compilation. It borrows the long-lived collaborators (configuration,
// architecture encoder, code cache, helper table) and the compilation session whose arena
// holds the code bytes. The three emission phases live here. Binary encoding estimates the
// main stream, the warm and cold snippets and the entry padding, reserves code memory of that
// size, aligns the method entry and lets the backend encode. Snippet emission writes warm then
// cold snippets in their frozen order. Relocation processing applies every patch, groups the
// external relocations of an AOT compilation, persists the grouped records and checks the
// final length against the estimate.

//! Code generator state and the emission phases.

pub mod code_buffer;
pub mod instruction;
pub mod label;
pub mod phase;

pub use code_buffer::CodeBuffer;
pub use instruction::{EncodedInstruction, InstrId, InstructionTable, NodeId};
pub use label::{LabelDirectory, LabelId};
pub use phase::{current_phase, CodeGenBackend, InterruptFlag, Phase, PhaseDriver};

use crate::aot::{self, object_file::AotMethod};
use crate::core::config::CompileConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::debug;
use crate::core::global_values::GlobalValue;
use crate::relocation::kind::ExternalRelocationKind;
use crate::relocation::{ExternalRelocation, Relocation, RelocationRegistry, UpdateSite};
use crate::runtime::{CodeCacheManager, HelperTable};
use crate::snippet::{
    ConstantDataSnippet, ConstantValue, EmitContext, PrintContext, RuntimePatchTable, Snippet, SnippetSet,
};
use crate::target::ArchitectureEncoder;
use bumpalo::Bump;

/// Emission state of one compilation.
pub struct CodeGenerator<'a, 'arena> {
    session: &'a CompilationSession<'arena>,
    config: &'a CompileConfig,
    target: &'a dyn ArchitectureEncoder,
    code_cache: &'a dyn CodeCacheManager,
    helpers: &'a HelperTable,

    pub buffer: CodeBuffer<'arena>,
    pub labels: LabelDirectory,
    pub instructions: InstructionTable,
    pub snippets: SnippetSet,
    pub relocations: RelocationRegistry,
    pub patch_table: RuntimePatchTable,

    constants: Option<ConstantDataSnippet>,
    constants_placed: bool,
    main_estimate: u32,
    aot_data: Option<Vec<u8>>,
    relocation_dump: Option<String>,
}

impl<'a, 'arena> CodeGenerator<'a, 'arena> {
    pub fn new(
        session: &'a CompilationSession<'arena>,
        config: &'a CompileConfig,
        target: &'a dyn ArchitectureEncoder,
        code_cache: &'a dyn CodeCacheManager,
        helpers: &'a HelperTable,
    ) -> Self {
        Self {
            session,
            config,
            target,
            code_cache,
            helpers,
            buffer: CodeBuffer::new(target.endianness()),
            labels: LabelDirectory::new(),
            instructions: InstructionTable::new(),
            snippets: SnippetSet::new(),
            relocations: RelocationRegistry::new(config.mode),
            patch_table: RuntimePatchTable::new(),
            constants: None,
            constants_placed: false,
            main_estimate: 0,
            aot_data: None,
            relocation_dump: None,
        }
    }

    pub fn session(&self) -> &'a CompilationSession<'arena> {
        self.session
    }

    pub fn config(&self) -> &'a CompileConfig {
        self.config
    }

    pub fn target(&self) -> &'a dyn ArchitectureEncoder {
        self.target
    }

    pub fn code_cache(&self) -> &'a dyn CodeCacheManager {
        self.code_cache
    }

    pub fn helpers(&self) -> &'a HelperTable {
        self.helpers
    }

    pub fn create_label(&mut self) -> LabelId {
        self.labels.create()
    }

    /// Add a snippet and return its label.
    pub fn add_snippet(&mut self, snippet: Box<dyn Snippet>) -> CompileResult<LabelId> {
        let label = snippet.label();
        self.snippets.add(snippet)?;
        Ok(label)
    }

    /// The constant pool, created on first use, with the label directory its
    /// constants are labelled in.
    pub fn constant_pool(&mut self) -> CompileResult<(&mut ConstantDataSnippet, &mut LabelDirectory)> {
        if self.constants_placed {
            return Err(CompileError::SnippetProtocol {
                reason: "constant added after the pool was placed".to_string(),
            });
        }
        let labels = &mut self.labels;
        let pool = self
            .constants
            .get_or_insert_with(|| ConstantDataSnippet::new(labels));
        Ok((pool, labels))
    }

    /// Label of the pool slot holding `value`.
    pub fn find_or_create_constant(&mut self, value: ConstantValue) -> CompileResult<LabelId> {
        let (pool, labels) = self.constant_pool()?;
        Ok(pool.find_or_create(value, labels))
    }

    /// Register instructions that materialize the address of `constant`.
    pub fn add_constant_requestors(&mut self, constant: LabelId, requestors: &[InstrId]) -> CompileResult<()> {
        let (pool, _) = self.constant_pool()?;
        pool.add_requestors(constant, requestors)
    }

    /// Record a code patch created by the caller.
    #[track_caller]
    pub fn add_relocation(&mut self, relocation: Relocation, node: Option<NodeId>) -> CompileResult<()> {
        self.relocations.add_relocation(relocation, node)
    }

    /// Record an external relocation created by the caller; returns whether it was kept.
    #[track_caller]
    pub fn add_external_relocation(
        &mut self,
        relocation: Relocation,
        node: Option<NodeId>,
    ) -> CompileResult<bool> {
        self.relocations.add_external_relocation(relocation, node)
    }

    /// Value to embed at `site` for `global`.
    ///
    /// AOT compilations also record a GlobalValue relocation keyed by the
    /// global's index so the loader can substitute the runtime's value.
    #[track_caller]
    pub fn reference_global_value(&mut self, global: GlobalValue, site: UpdateSite) -> CompileResult<u64> {
        self.relocations.add_external_relocation(
            Relocation::External(ExternalRelocation::new(
                site,
                global.index() as u64,
                ExternalRelocationKind::GlobalValue,
            )),
            None,
        )?;
        Ok(self.config.global_values.get(global))
    }

    /// Bytes of code written so far.
    pub fn code(&self) -> &[u8] {
        self.buffer.bytes()
    }

    /// Persisted relocation records, after processing an AOT compilation.
    pub fn aot_relocation_data(&self) -> Option<&[u8]> {
        self.aot_data.as_deref()
    }

    /// Relocation dump, when tracing was enabled.
    pub fn relocation_dump(&self) -> Option<&str> {
        self.relocation_dump.as_deref()
    }

    pub fn print_context(&self) -> PrintContext<'_> {
        PrintContext {
            labels: &self.labels,
            helpers: self.helpers,
            target: self.target,
        }
    }

    /// Method as stored in an AOT object.
    pub fn aot_method(&self, name: &str) -> Option<AotMethod> {
        let relocation_data = self.aot_data.clone()?;
        Some(AotMethod {
            name: name.to_string(),
            arch: self.target.arch(),
            code: self.code().to_vec(),
            relocation_data,
        })
    }

    pub(crate) fn binary_encoding(
        &mut self,
        backend: &mut dyn CodeGenBackend,
        scratch: &Bump,
    ) -> CompileResult<()> {
        let main = backend.estimate_code_length(self, scratch)?;
        let alignment = self.config.method_entry_alignment;
        let entry_padding = if alignment.is_power_of_two() {
            alignment - 1
        } else {
            0
        };
        self.main_estimate = main + entry_padding;

        if let Some(pool) = self.constants.take() {
            self.snippets.add(Box::new(pool))?;
        }
        self.constants_placed = true;

        let warm_end = self.snippets.set_estimated_locations(
            self.main_estimate,
            true,
            &mut self.labels,
            self.target,
            self.config,
        )?;
        let estimate = self.snippets.set_estimated_locations(
            warm_end,
            false,
            &mut self.labels,
            self.target,
            self.config,
        )?;

        let code_alignment = if alignment.is_power_of_two() {
            alignment.max(16)
        } else {
            16
        };
        let base = self.code_cache.reserve_code(estimate, code_alignment)?;
        let storage = self.session.alloc_zeroed_bytes(estimate as usize);
        self.buffer.reserve(storage, base);
        self.buffer
            .align_method_entry(alignment, self.config.pre_entry_size)?;
        log::debug!(
            "Estimated {estimate} bytes ({main} main, {} snippets) at {base:#x}",
            estimate - self.main_estimate
        );

        backend.encode(self, scratch)?;
        Ok(())
    }

    pub(crate) fn emit_snippets(&mut self) -> CompileResult<()> {
        let main_end = self.buffer.cursor();
        let mut cx = EmitContext {
            buffer: &mut self.buffer,
            labels: &mut self.labels,
            instructions: &self.instructions,
            relocations: &mut self.relocations,
            patch_table: &mut self.patch_table,
            target: self.target,
            code_cache: self.code_cache,
            helpers: self.helpers,
            config: self.config,
            session: self.session,
        };
        let warm = self.snippets.emit(true, &mut cx)?;
        let cold = self.snippets.emit(false, &mut cx)?;
        log::debug!(
            "Emitted {} snippet bytes after {main_end:#x}",
            warm + cold
        );

        if self.config.trace_snippets {
            let mut out = String::new();
            match self.snippets.print(&mut out, &self.print_context()) {
                Ok(()) => log::debug!("Snippets:\n{out}"),
                Err(e) => log::warn!("Cannot print snippets: {e}"),
            }
        }
        Ok(())
    }

    pub(crate) fn process_relocations(&mut self) -> CompileResult<()> {
        let target = self.target;
        let data_base = self
            .snippets
            .iter()
            .filter(|s| s.is_data())
            .find_map(|s| self.labels.address(s.label()));
        let summary = self.relocations.process(
            &mut self.buffer,
            &self.labels,
            &self.instructions,
            target,
            data_base,
            &|group| aot::encode_header(group, target),
        )?;
        self.session.record_relocations_applied(summary.applied);
        self.session
            .record_external_groups(summary.groups, summary.external_sites);

        if self.config.mode.persists_relocations() {
            self.aot_data = Some(aot::relocation_data(self.relocations.groups()));
        }

        let actual = self.buffer.actual_length();
        let estimated = self.buffer.estimated_length();
        if actual > estimated {
            return Err(CompileError::EstimateExceeded { actual, estimated });
        }
        self.session
            .record_code_size(estimated, actual, self.snippets.emitted_bytes());

        if self.config.trace_relocations {
            let dump = debug::relocation_dump(self);
            log::debug!("Relocations:\n{dump}");
            self.relocation_dump = Some(dump);
        }
        Ok(())
    }
}
