// The phase driver. A target supplies the ordered list of code generation phases; the driver
// validates that list once (no duplicates, and the ordering constraints between instruction
// selection, register assignment, stack mapping, binary encoding, snippet emission and
// relocation processing) and then runs every phase exactly once, in order, with no branching
// between phases. Each phase gets a transient bumpalo region that is dropped when the phase
// ends, is timed and measured into a PhaseProfile, and runs with the thread-local current
// phase marker set so crash and trace reports can name it. After instruction selection and
// after register assignment the driver checks the cooperative interruption flag and stops the
// compilation with Interrupted if it is set. The emission phases are implemented by the code
// generator itself; everything else is delegated to the backend, whose hooks default to no-ops.

//! Phase list, phase driver and interruption.

use super::CodeGenerator;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::PhaseProfile;
use bumpalo::Bump;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A code generation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ReserveCodeCache,
    LowerTrees,
    UncommonCallConstNodes,
    SetupForInstructionSelection,
    InstructionSelection,
    CreateStackAtlas,
    RegisterAssigning,
    MapStack,
    Peephole,
    BinaryEncoding,
    EmitSnippets,
    ProcessRelocations,
    FindAndFixCommonedReferences,
    RemoveUnusedLocals,
    ShrinkWrapping,
    InsertDebugCounters,
    CleanUpFlags,
    InliningReport,
}

impl Phase {
    pub const ALL: [Phase; 18] = [
        Phase::ReserveCodeCache,
        Phase::LowerTrees,
        Phase::UncommonCallConstNodes,
        Phase::SetupForInstructionSelection,
        Phase::InstructionSelection,
        Phase::CreateStackAtlas,
        Phase::RegisterAssigning,
        Phase::MapStack,
        Phase::Peephole,
        Phase::BinaryEncoding,
        Phase::EmitSnippets,
        Phase::ProcessRelocations,
        Phase::FindAndFixCommonedReferences,
        Phase::RemoveUnusedLocals,
        Phase::ShrinkWrapping,
        Phase::InsertDebugCounters,
        Phase::CleanUpFlags,
        Phase::InliningReport,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::ReserveCodeCache => "ReserveCodeCache",
            Phase::LowerTrees => "LowerTrees",
            Phase::UncommonCallConstNodes => "UncommonCallConstNodes",
            Phase::SetupForInstructionSelection => "SetupForInstructionSelection",
            Phase::InstructionSelection => "InstructionSelection",
            Phase::CreateStackAtlas => "CreateStackAtlas",
            Phase::RegisterAssigning => "RegisterAssigning",
            Phase::MapStack => "MapStack",
            Phase::Peephole => "Peephole",
            Phase::BinaryEncoding => "BinaryEncoding",
            Phase::EmitSnippets => "EmitSnippets",
            Phase::ProcessRelocations => "ProcessRelocations",
            Phase::FindAndFixCommonedReferences => "FindAndFixCommonedReferences",
            Phase::RemoveUnusedLocals => "RemoveUnusedLocals",
            Phase::ShrinkWrapping => "ShrinkWrapping",
            Phase::InsertDebugCounters => "InsertDebugCounters",
            Phase::CleanUpFlags => "CleanUpFlags",
            Phase::InliningReport => "InliningReport",
        }
    }

    /// Whether the interruption flag is checked after this phase.
    pub fn is_checkpoint(self) -> bool {
        matches!(self, Phase::InstructionSelection | Phase::RegisterAssigning)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

thread_local! {
    static CURRENT_PHASE: Cell<Option<Phase>> = const { Cell::new(None) };
}

/// Phase running on this thread, for crash and trace reports.
pub fn current_phase() -> Option<Phase> {
    CURRENT_PHASE.with(|c| c.get())
}

/// Restores the previous phase marker when dropped.
struct PhaseMarker {
    previous: Option<Phase>,
}

impl PhaseMarker {
    fn enter(phase: Phase) -> Self {
        let previous = CURRENT_PHASE.with(|c| c.replace(Some(phase)));
        Self { previous }
    }
}

impl Drop for PhaseMarker {
    fn drop(&mut self) {
        CURRENT_PHASE.with(|c| c.set(self.previous));
    }
}

/// Cooperative interruption request shared with the compilation's owner.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Target specific work of the code generation phases.
///
/// `scratch` is the transient region of the running phase.
pub trait CodeGenBackend {
    /// Run a phase the code generator does not implement itself.
    fn perform_phase(
        &mut self,
        phase: Phase,
        cg: &mut CodeGenerator<'_, '_>,
        scratch: &Bump,
    ) -> CompileResult<()> {
        let _ = (phase, cg, scratch);
        Ok(())
    }

    /// Marker hook for code cache reservation.
    fn reserve_code_cache(&mut self, cg: &mut CodeGenerator<'_, '_>) -> CompileResult<()> {
        let _ = cg;
        Ok(())
    }

    /// Conservative length of the main instruction stream. Labels in the
    /// stream should receive their estimated offsets here.
    fn estimate_code_length(&mut self, cg: &mut CodeGenerator<'_, '_>, scratch: &Bump) -> CompileResult<u32>;

    /// Encode the main instruction stream into the reserved code buffer,
    /// recording instruction encodings and resolving labels.
    fn encode(&mut self, cg: &mut CodeGenerator<'_, '_>, scratch: &Bump) -> CompileResult<()>;
}

/// Runs a validated phase list.
#[derive(Debug, Clone)]
pub struct PhaseDriver {
    phases: Vec<Phase>,
    interrupt: InterruptFlag,
}

fn position(phases: &[Phase], phase: Phase) -> Option<usize> {
    phases.iter().position(|&p| p == phase)
}

fn check_before(phases: &[Phase], first: Phase, second: Phase) -> CompileResult<()> {
    if let (Some(a), Some(b)) = (position(phases, first), position(phases, second)) {
        if a > b {
            return Err(CompileError::PhaseOrder {
                reason: format!("{first} must run before {second}"),
            });
        }
    }
    Ok(())
}

impl PhaseDriver {
    pub fn new(phases: Vec<Phase>) -> CompileResult<Self> {
        for (i, phase) in phases.iter().enumerate() {
            if phases[..i].contains(phase) {
                return Err(CompileError::PhaseOrder {
                    reason: format!("{phase} appears twice"),
                });
            }
        }
        for later in [Phase::EmitSnippets, Phase::ProcessRelocations] {
            if phases.contains(&later) && !phases.contains(&Phase::BinaryEncoding) {
                return Err(CompileError::PhaseOrder {
                    reason: format!("{later} needs {}", Phase::BinaryEncoding),
                });
            }
        }
        check_before(&phases, Phase::InstructionSelection, Phase::RegisterAssigning)?;
        check_before(&phases, Phase::CreateStackAtlas, Phase::BinaryEncoding)?;
        check_before(&phases, Phase::MapStack, Phase::BinaryEncoding)?;
        check_before(&phases, Phase::BinaryEncoding, Phase::EmitSnippets)?;
        check_before(&phases, Phase::EmitSnippets, Phase::ProcessRelocations)?;
        check_before(&phases, Phase::BinaryEncoding, Phase::ProcessRelocations)?;
        Ok(Self {
            phases,
            interrupt: InterruptFlag::new(),
        })
    }

    /// The usual list of a target that emits and persists code.
    pub fn standard() -> Self {
        Self {
            phases: vec![
                Phase::ReserveCodeCache,
                Phase::LowerTrees,
                Phase::UncommonCallConstNodes,
                Phase::SetupForInstructionSelection,
                Phase::InstructionSelection,
                Phase::CreateStackAtlas,
                Phase::RegisterAssigning,
                Phase::MapStack,
                Phase::Peephole,
                Phase::BinaryEncoding,
                Phase::EmitSnippets,
                Phase::ProcessRelocations,
                Phase::CleanUpFlags,
            ],
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Run every phase once, in order.
    pub fn perform_all(
        &self,
        cg: &mut CodeGenerator<'_, '_>,
        backend: &mut dyn CodeGenBackend,
    ) -> CompileResult<()> {
        for &phase in &self.phases {
            let scratch = Bump::new();
            let arena_before = cg.session().allocated_bytes();
            let started = Instant::now();
            {
                let _marker = PhaseMarker::enter(phase);
                log::trace!("Starting {phase}");
                Self::perform(phase, cg, backend, &scratch)?;
            }
            let profile = PhaseProfile {
                phase,
                elapsed: started.elapsed(),
                transient_bytes: scratch.allocated_bytes(),
                arena_growth: cg.session().allocated_bytes().saturating_sub(arena_before),
            };
            log::debug!(
                "{phase}: {:?}, {} transient bytes, {} arena bytes",
                profile.elapsed,
                profile.transient_bytes,
                profile.arena_growth
            );
            cg.session().record_phase(profile);
            drop(scratch);

            if phase.is_checkpoint() && self.interrupt.is_set() {
                log::debug!("Compilation interrupted after {phase}");
                return Err(CompileError::Interrupted { phase });
            }
        }
        Ok(())
    }

    fn perform(
        phase: Phase,
        cg: &mut CodeGenerator<'_, '_>,
        backend: &mut dyn CodeGenBackend,
        scratch: &Bump,
    ) -> CompileResult<()> {
        match phase {
            Phase::ReserveCodeCache => backend.reserve_code_cache(cg),
            Phase::BinaryEncoding => cg.binary_encoding(backend, scratch),
            Phase::EmitSnippets => cg.emit_snippets(),
            Phase::ProcessRelocations => cg.process_relocations(),
            other => backend.perform_phase(other, cg, scratch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_phase_has_a_distinct_name() {
        let mut names: Vec<_> = Phase::ALL.iter().map(|p| p.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Phase::ALL.len());
    }

    #[test]
    fn duplicate_phases_are_rejected() {
        let err = PhaseDriver::new(vec![Phase::LowerTrees, Phase::LowerTrees]).unwrap_err();
        assert!(err.to_string().contains("LowerTrees appears twice"));
    }

    #[test]
    fn emission_order_is_enforced() {
        assert!(PhaseDriver::new(vec![Phase::EmitSnippets, Phase::BinaryEncoding]).is_err());
        assert!(PhaseDriver::new(vec![Phase::RegisterAssigning, Phase::InstructionSelection]).is_err());
        assert!(PhaseDriver::new(vec![Phase::BinaryEncoding, Phase::MapStack]).is_err());
        assert!(PhaseDriver::new(vec![Phase::ProcessRelocations, Phase::EmitSnippets]).is_err());
        assert!(PhaseDriver::new(PhaseDriver::standard().phases().to_vec()).is_ok());
    }

    #[test]
    fn emission_phases_need_binary_encoding() {
        let err = PhaseDriver::new(vec![Phase::EmitSnippets, Phase::ProcessRelocations]).unwrap_err();
        assert!(err.to_string().contains("EmitSnippets needs BinaryEncoding"), "{err}");
        assert!(PhaseDriver::new(vec![Phase::ProcessRelocations]).is_err());
    }

    #[test]
    fn phase_marker_is_restored() {
        assert_eq!(current_phase(), None);
        {
            let _outer = PhaseMarker::enter(Phase::LowerTrees);
            {
                let _inner = PhaseMarker::enter(Phase::Peephole);
                assert_eq!(current_phase(), Some(Phase::Peephole));
            }
            assert_eq!(current_phase(), Some(Phase::LowerTrees));
        }
        assert_eq!(current_phase(), None);
    }
}
