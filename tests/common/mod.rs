// Fixtures shared by the integration tests. The scripted backend replays a fixed x86-64
// instruction stream: raw bytes, label bindings, jumps and distance loads against labels, and
// literals that carry an external or label address. It estimates its own length exactly
// (adjustable to provoke estimate failures), records every phase it is asked to run, and can
// run a hook during instruction selection. The environment registers one helper within call
// reach of the code cache and one far outside it.

//! Shared fixtures for the integration tests: a scripted x86-64 backend and a
//! compilation environment with a code cache and helpers.

#![allow(dead_code)]

use bumpalo::Bump;
use emitcore::codegen::{CodeGenBackend, CodeGenerator, InstrId, LabelId, NodeId, Phase};
use emitcore::core::{CompileConfig, CompileResult};
use emitcore::relocation::kind::ExternalRelocationKind;
use emitcore::relocation::{ExternalRelocation, Relocation, UpdateSite};
use emitcore::runtime::{CodeCaches, HelperId, HelperTable};
use emitcore::x64::X64Target;
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One item of the scripted main instruction stream.
#[derive(Debug, Clone)]
pub enum Op {
    /// Raw instruction bytes.
    Bytes(Vec<u8>),
    /// Bind a label at the cursor.
    Bind(LabelId),
    /// `jmp rel32` to a label.
    Jump(LabelId),
    /// `mov eax, imm32` receiving `end - start`.
    LoadDistance { start: LabelId, end: LabelId },
    /// 8-byte literal holding an external address.
    External { kind: ExternalRelocationKind, target: u64 },
    /// 8-byte literal holding the absolute address of a label.
    Address(LabelId),
}

impl Op {
    fn length(&self) -> u32 {
        match self {
            Op::Bytes(bytes) => bytes.len() as u32,
            Op::Bind(_) => 0,
            Op::Jump(_) | Op::LoadDistance { .. } => 5,
            Op::External { .. } | Op::Address(_) => 8,
        }
    }
}

/// Backend that encodes a fixed script and records the phases it was asked to run.
#[derive(Default)]
pub struct ScriptedBackend {
    pub ops: Vec<Op>,
    pub phases: Vec<Phase>,
    pub current_phases: Vec<Option<Phase>>,
    pub instructions: Vec<InstrId>,
    /// Extra bytes added to the estimate.
    pub slack: u32,
    /// Bytes the estimate under-counts by.
    pub under_estimate: u32,
    /// Runs before InstructionSelection returns.
    pub on_selection: Option<Box<dyn FnMut()>>,
}

impl ScriptedBackend {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            ..Self::default()
        }
    }
}

impl CodeGenBackend for ScriptedBackend {
    fn perform_phase(
        &mut self,
        phase: Phase,
        _cg: &mut CodeGenerator<'_, '_>,
        scratch: &Bump,
    ) -> CompileResult<()> {
        scratch.alloc([0u8; 32]);
        self.phases.push(phase);
        self.current_phases.push(emitcore::codegen::current_phase());
        if phase == Phase::InstructionSelection {
            if let Some(hook) = self.on_selection.as_mut() {
                hook();
            }
        }
        Ok(())
    }

    fn estimate_code_length(&mut self, cg: &mut CodeGenerator<'_, '_>, _scratch: &Bump) -> CompileResult<u32> {
        let mut offset = 0;
        for op in &self.ops {
            if let Op::Bind(label) = op {
                cg.labels.set_estimated_offset(*label, offset);
            }
            offset += op.length();
        }
        Ok(offset + self.slack - self.under_estimate)
    }

    fn encode(&mut self, cg: &mut CodeGenerator<'_, '_>, _scratch: &Bump) -> CompileResult<()> {
        for (index, op) in self.ops.iter().enumerate() {
            let node = Some(NodeId(index as u32));
            match op {
                Op::Bytes(bytes) => {
                    let id = cg.instructions.add("bytes", node);
                    let offset = cg.buffer.emit_bytes(bytes)?;
                    cg.instructions.set_encoding(id, offset, bytes.len() as u32);
                    self.instructions.push(id);
                }
                Op::Bind(label) => {
                    let address = cg.buffer.cursor_address();
                    cg.labels.resolve(*label, address)?;
                }
                Op::Jump(label) => {
                    let id = cg.instructions.add("jmp", node);
                    let next = cg.buffer.cursor_address() + 5;
                    let offset = cg.buffer.emit_u8(0xe9)?;
                    cg.buffer.emit_u32((next as i64).wrapping_neg() as u32)?;
                    cg.instructions.set_encoding(id, offset, 5);
                    cg.add_relocation(
                        Relocation::LabelRelative32Bit {
                            site: offset + 1,
                            label: *label,
                        },
                        node,
                    )?;
                    self.instructions.push(id);
                }
                Op::LoadDistance { start, end } => {
                    let id = cg.instructions.add("mov", node);
                    let offset = cg.buffer.emit_u8(0xb8)?;
                    cg.buffer.emit_u32(0)?;
                    cg.instructions.set_encoding(id, offset, 5);
                    cg.add_relocation(
                        Relocation::LoadLabelRelative32Bit {
                            instruction: id,
                            start: *start,
                            end: *end,
                            delta_to_start: 0,
                        },
                        node,
                    )?;
                    self.instructions.push(id);
                }
                Op::External { kind, target } => {
                    let offset = cg.buffer.emit_u64(*target)?;
                    cg.add_external_relocation(
                        Relocation::External(ExternalRelocation::new(
                            UpdateSite::Offset(offset),
                            *target,
                            *kind,
                        )),
                        node,
                    )?;
                }
                Op::Address(label) => {
                    let offset = cg.buffer.emit_u64(0)?;
                    cg.add_relocation(
                        Relocation::LabelAbsolute {
                            site: offset,
                            label: *label,
                        },
                        node,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Long-lived collaborators of a compilation.
pub struct Environment {
    pub config: CompileConfig,
    pub target: Arc<X64Target>,
    pub caches: CodeCaches,
}

pub const CACHE_BASE: u64 = 0x1000_0000;
pub const CACHE_SIZE: u64 = 0x10_0000;
/// Within rel32 reach of the cache.
pub const NEAR_HELPER: u64 = 0x1010_0000 + 0x4000;
/// Far beyond rel32 reach of the cache.
pub const FAR_HELPER: u64 = 0x7f00_0000_0000;

impl Environment {
    pub fn new(config: CompileConfig) -> (Self, HelperId, HelperId) {
        let mut helpers = HelperTable::new();
        let near = helpers.register("jitNearHelper", NEAR_HELPER);
        let far = helpers.register("jitFarHelper", FAR_HELPER);
        let target = Arc::new(X64Target::new());
        let caches = CodeCaches::new(target.clone(), Arc::new(helpers));
        caches.add_cache(CACHE_BASE, CACHE_SIZE);
        (
            Self {
                config,
                target,
                caches,
            },
            near,
            far,
        )
    }

    pub fn code_generator<'a, 'arena>(
        &'a self,
        session: &'a emitcore::core::CompilationSession<'arena>,
    ) -> CodeGenerator<'a, 'arena> {
        CodeGenerator::new(
            session,
            &self.config,
            self.target.as_ref(),
            &self.caches,
            self.caches.helpers(),
        )
    }
}
