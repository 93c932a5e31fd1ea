// Helper call snippet. A fast path branches here when it needs a runtime helper: the snippet
// optionally releases the stack frame adjustment, calls the helper, re-acquires the
// adjustment and branches back to the restart label. The call displacement is measured from
// the target's call reference point. When the helper lies beyond the call's reach, the code
// cache supplies a trampoline inside the cache that holds the call site; the trampoline must
// then be reachable directly, otherwise the compilation fails. Patchable calls are padded
// with NOPs so that the displacement field never straddles the patch alignment boundary and
// can be rewritten atomically. In AOT compilations the call displacement is recorded as a
// HelperAddress external relocation keyed by the helper index.

//! Helper call snippet.

use super::{label_location, EmitContext, EstimateContext, PrintContext, Snippet};
use crate::codegen::label::LabelId;
use crate::core::error::{CompileError, CompileResult};
use crate::relocation::kind::ExternalRelocationKind;
use crate::relocation::{ExternalRelocation, Relocation, UpdateSite};
use crate::runtime::HelperId;
use crate::target::{ArchitectureEncoder, TargetArch};
use std::fmt;

/// Width of the call displacement field kept inside one patch window.
const DISPLACEMENT_FIELD: u64 = 4;

/// Out-of-line call to a runtime helper.
#[derive(Debug, Clone)]
pub struct HelperCallSnippet {
    label: LabelId,
    helper: HelperId,
    restart: Option<LabelId>,
    stack_adjustment: i32,
    patchable: bool,
    warm: bool,
    call_address: Option<u64>,
    trampoline: Option<u64>,
}

impl HelperCallSnippet {
    pub fn new(label: LabelId, helper: HelperId) -> Self {
        Self {
            label,
            helper,
            restart: None,
            stack_adjustment: 0,
            patchable: false,
            warm: false,
            call_address: None,
            trampoline: None,
        }
    }

    /// Branch back to `restart` after the call.
    pub fn with_restart(mut self, restart: LabelId) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Release `adjustment` bytes of stack around the call.
    pub fn with_stack_adjustment(mut self, adjustment: i32) -> Self {
        self.stack_adjustment = adjustment;
        self
    }

    /// Keep the call displacement inside one patch window.
    pub fn patchable(mut self) -> Self {
        self.patchable = true;
        self
    }

    /// Place the snippet after the warm instruction stream.
    pub fn warm(mut self) -> Self {
        self.warm = true;
        self
    }

    pub fn helper(&self) -> HelperId {
        self.helper
    }

    /// Address of the emitted call instruction.
    pub fn call_address(&self) -> Option<u64> {
        self.call_address
    }

    /// Trampoline the call went through, if any.
    pub fn trampoline(&self) -> Option<u64> {
        self.trampoline
    }

    fn adjust_length(&self, target: &dyn ArchitectureEncoder) -> u32 {
        if self.stack_adjustment == 0 {
            0
        } else {
            target.stack_adjust_length(self.stack_adjustment)
        }
    }

    /// Padding before a call at `call_address`, or the worst case when unknown.
    fn padding(&self, call_address: Option<u64>, target: &dyn ArchitectureEncoder, alignment: u32) -> u32 {
        if !self.patchable || alignment as u64 <= DISPLACEMENT_FIELD {
            return 0;
        }
        let alignment = alignment as u64;
        match call_address {
            Some(address) => {
                let field = address + target.call_displacement_offset() as u64;
                let mut padding = 0;
                while (field + padding) % alignment + DISPLACEMENT_FIELD > alignment {
                    padding += 1;
                }
                padding as u32
            }
            None => (alignment - 1) as u32,
        }
    }
}

impl Snippet for HelperCallSnippet {
    fn label(&self) -> LabelId {
        self.label
    }

    fn name(&self) -> &'static str {
        "HelperCallSnippet"
    }

    fn is_warm(&self) -> bool {
        self.warm
    }

    fn length(&self, estimated_start: u32, cx: &EstimateContext<'_>) -> u32 {
        let target = cx.target;
        let adjust = self.adjust_length(target);
        let start = cx.base.map(|base| base + estimated_start as u64);
        let padding = self.padding(
            start.map(|s| s + adjust as u64),
            target,
            cx.config.instruction_patch_alignment,
        );
        let mut length = adjust + padding + target.call_length() + adjust;

        if let Some(restart) = self.restart {
            let displacement = match (start, cx.labels.address(restart)) {
                (Some(start), Some(to)) => Some(to as i64 - (start + length as u64) as i64),
                _ => None,
            };
            length += target
                .branch_length(displacement)
                .or_else(|| target.branch_length(None))
                .unwrap_or(0);
        }
        length
    }

    fn emit_body(&mut self, cx: &mut EmitContext<'_, '_>) -> CompileResult<()> {
        let target = cx.target;
        let helper_name = cx.helpers.name(self.helper).unwrap_or("?").to_string();
        let helper_address =
            cx.helpers
                .address(self.helper)
                .ok_or_else(|| CompileError::InvalidInstructionSequence {
                    reason: format!("call to unregistered {}", self.helper),
                })?;

        let start = cx.bind_label(self.label)?;
        let start_offset = cx.buffer.cursor();
        let mut bytes = Vec::new();
        if self.stack_adjustment != 0 {
            target.encode_stack_adjust(self.stack_adjustment, true, &mut bytes)?;
        }
        let padding = self.padding(
            Some(start + bytes.len() as u64),
            target,
            cx.config.instruction_patch_alignment,
        );
        target.encode_nops(padding, &mut bytes)?;

        let call_offset = start_offset + bytes.len() as u32;
        let call_address = start + bytes.len() as u64;
        let reference = target.call_reference_address(call_address);
        let mut destination = helper_address;
        if !target.is_call_displacement_encodable(helper_address as i64 - reference as i64) {
            let trampoline = cx
                .code_cache
                .find_helper_trampoline(self.helper, call_address)
                .ok_or_else(|| CompileError::TrampolineUnavailable {
                    helper: helper_name.clone(),
                    from: call_address,
                })?;
            if !target.is_call_displacement_encodable(trampoline as i64 - reference as i64) {
                return Err(CompileError::TrampolineUnreachable {
                    helper: helper_name,
                    trampoline,
                    from: call_address,
                });
            }
            log::warn!(
                "Calling {helper_name} from {call_address:#x} through trampoline {trampoline:#x}"
            );
            cx.session.record_trampoline_used();
            destination = trampoline;
            self.trampoline = Some(trampoline);
        }
        target.encode_call(call_address, destination, &mut bytes)?;
        self.call_address = Some(call_address);

        if self.stack_adjustment != 0 {
            target.encode_stack_adjust(self.stack_adjustment, false, &mut bytes)?;
        }

        if let Some(restart) = self.restart {
            let to = cx
                .labels
                .address(restart)
                .ok_or_else(|| CompileError::UnresolvedLabel {
                    label: restart.0,
                    context: format!(" as the restart of {} {}", self.name(), self.label),
                })?;
            let from = start + bytes.len() as u64;
            if target.branch_length(Some(to as i64 - from as i64)).is_none() {
                return Err(CompileError::RestartBranchOutOfRange { from, to });
            }
            target.encode_branch(from, to, &mut bytes)?;
        }

        cx.buffer.emit_bytes(&bytes)?;

        let mut external = ExternalRelocation::new(
            UpdateSite::Offset(call_offset + target.call_displacement_offset()),
            self.helper.0 as u64,
            ExternalRelocationKind::HelperAddress,
        );
        if target.arch() == TargetArch::X64 {
            external = external.eip_relative();
        }
        cx.relocations
            .add_external_relocation(Relocation::External(external), None)?;
        Ok(())
    }

    fn print(&self, out: &mut dyn fmt::Write, cx: &PrintContext<'_>) -> fmt::Result {
        write!(
            out,
            "{} [{}] {} {} ({:#x})",
            self.label,
            label_location(self.label, cx.labels),
            self.name(),
            cx.helpers.name(self.helper).unwrap_or("?"),
            cx.helpers.address(self.helper).unwrap_or(0)
        )?;
        if let Some(trampoline) = self.trampoline {
            write!(out, " through trampoline {trampoline:#x}")?;
        }
        if let Some(restart) = self.restart {
            write!(out, " restart {restart}")?;
        }
        writeln!(out)
    }
}
