// The relocation engine. A relocation is a deferred patch request recorded while code is
// encoded and applied once every label and snippet address is final. The set of relocation
// forms is closed, so Relocation is an enum whose variants carry exactly the operands their
// patch needs: label relative fields of 8 to 32 bits, absolute label and instruction
// addresses, label table slots, load-label sequences whose immediates receive a label distance
// or a split label address, and the three external forms whose sites are persisted for AOT
// reuse instead of (or in addition to) being patched. Label relative arithmetic lives in the
// target hooks because every ISA measures displacements differently. External relocations are
// grouped into IteratedExternalRelocation records by ExternalRelocationTable and applied by
// appending their method relative site offsets to the owning record. Every relocation may
// carry RelocationDebugInfo naming where it was created, for dumps and for the diagnostic of
// an unresolved label.

//! Relocation variants and their apply, trace and modifier operations.

pub mod iterated;
pub mod kind;
pub mod registry;

use crate::codegen::code_buffer::CodeBuffer;
use crate::codegen::instruction::{InstrId, InstructionTable, NodeId};
use crate::codegen::label::{LabelDirectory, LabelId};
use crate::core::error::{CompileError, CompileResult};
use crate::target::ArchitectureEncoder;
use iterated::{needs_wide_offset, ExternalRelocationTable, GroupKey, ModifierFlags};
use kind::ExternalRelocationKind;
use std::fmt;
use std::panic::Location;

pub use registry::RelocationRegistry;

/// Number of encoded instructions quoted by an unresolved label diagnostic.
const DIAGNOSTIC_INSTRUCTIONS: usize = 4;

/// Where a relocation patches or which location it persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSite {
    /// Offset from the relocatable start of the code buffer.
    Offset(u32),
    /// Offset inside an instruction, known once it is encoded.
    Instruction { instruction: InstrId, offset: u32 },
}

impl UpdateSite {
    pub fn instruction(instruction: InstrId) -> Self {
        UpdateSite::Instruction {
            instruction,
            offset: 0,
        }
    }

    /// Buffer offset of the site.
    pub fn resolve(&self, instructions: &InstructionTable) -> CompileResult<u32> {
        match *self {
            UpdateSite::Offset(offset) => Ok(offset),
            UpdateSite::Instruction {
                instruction,
                offset,
            } => Ok(instructions.encoding(instruction)?.offset + offset),
        }
    }
}

/// Where a relocation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationDebugInfo {
    pub file: &'static str,
    pub line: u32,
    pub node: Option<NodeId>,
}

impl RelocationDebugInfo {
    #[track_caller]
    pub fn here(node: Option<NodeId>) -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            node,
        }
    }
}

impl fmt::Display for RelocationDebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(node) = self.node {
            write!(f, " {node}")?;
        }
        Ok(())
    }
}

/// Relocation whose target lies outside the code buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRelocation {
    pub site: UpdateSite,
    /// Second location of an ordered pair.
    pub site2: Option<UpdateSite>,
    pub target: u64,
    pub target2: Option<u64>,
    pub kind: ExternalRelocationKind,
    /// Modifier bits other than the width.
    pub flags: ModifierFlags,
    /// Owning group, set when grouped.
    pub group: Option<usize>,
}

impl ExternalRelocation {
    pub fn new(site: UpdateSite, target: u64, kind: ExternalRelocationKind) -> Self {
        Self {
            site,
            site2: None,
            target,
            target2: None,
            kind,
            flags: ModifierFlags::empty(),
            group: None,
        }
    }

    pub fn with_target2(mut self, target2: u64) -> Self {
        self.target2 = Some(target2);
        self
    }

    /// Mark the site as relative to the next instruction.
    pub fn eip_relative(mut self) -> Self {
        self.flags = self.flags | ModifierFlags::EIP_OFFSET;
        self
    }

    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.target, self.target2, self.kind, self.flags)
    }

    pub fn narrow_size(&self) -> u32 {
        self.key().narrow_size()
    }

    pub fn wide_size(&self) -> u32 {
        self.key().wide_size()
    }

    /// Method relative offsets of the site and, for pairs, the second site.
    fn site_offsets(&self, instructions: &InstructionTable) -> CompileResult<(u32, Option<u32>)> {
        let first = self.site.resolve(instructions)?;
        let second = match &self.site2 {
            Some(site) => Some(site.resolve(instructions)?),
            None => None,
        };
        Ok((first, second))
    }

    /// Width decision: wide when any site falls outside the signed 16-bit
    /// window around the relocatable start.
    pub fn collect_modifier(&self, instructions: &InstructionTable) -> CompileResult<ModifierFlags> {
        let (first, second) = self.site_offsets(instructions)?;
        let wide = needs_wide_offset(first as i64)
            || second.is_some_and(|offset| needs_wide_offset(offset as i64));
        Ok(if wide {
            self.flags | ModifierFlags::WIDE_OFFSET
        } else {
            self.flags
        })
    }
}

/// A deferred patch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    LabelRelative8Bit {
        site: u32,
        label: LabelId,
    },
    LabelRelative12Bit {
        site: u32,
        label: LabelId,
        check_disp: bool,
    },
    LabelRelative16Bit {
        site: u32,
        label: LabelId,
        divisor: i8,
        instruction_offset: bool,
    },
    LabelRelative24Bit {
        site: u32,
        label: LabelId,
    },
    LabelRelative32Bit {
        site: u32,
        label: LabelId,
    },
    /// Pointer sized absolute label address.
    LabelAbsolute {
        site: u32,
        label: LabelId,
    },
    LabelTable32Bit {
        site: u32,
        label: LabelId,
    },
    /// Pointer sized address of an instruction's start or end.
    InstructionAbsolute {
        site: u32,
        instruction: InstrId,
        use_end: bool,
    },
    LoadLabelRelative16Bit {
        instruction: InstrId,
        start: LabelId,
        end: LabelId,
        delta_to_start: i32,
    },
    LoadLabelRelative32Bit {
        instruction: InstrId,
        start: LabelId,
        end: LabelId,
        delta_to_start: i32,
    },
    /// Last instruction of a fixed 64-bit address sequence.
    LoadLabelRelative64Bit {
        instruction: InstrId,
        label: LabelId,
    },
    External(ExternalRelocation),
    ExternalOrderedPair32Bit(ExternalRelocation),
    /// External whose site is an instruction's final encoding.
    BeforeBinaryEncodingExternal(ExternalRelocation),
}

/// State a relocation is applied against.
pub struct ApplyContext<'a, 'arena> {
    pub buffer: &'a mut CodeBuffer<'arena>,
    pub labels: &'a LabelDirectory,
    pub instructions: &'a InstructionTable,
    pub target: &'a dyn ArchitectureEncoder,
    /// Start of the data snippets, for displacement checks.
    pub data_base: Option<u64>,
    pub debug: Option<&'a RelocationDebugInfo>,
}

impl ApplyContext<'_, '_> {
    fn label(&self, label: LabelId) -> CompileResult<u64> {
        self.labels.address(label).ok_or_else(|| {
            let mut context = String::new();
            if let Some(debug) = self.debug {
                context.push_str(&format!(" created at {debug}"));
            }
            let recent = self.instructions.recent_encodings(DIAGNOSTIC_INSTRUCTIONS);
            if !recent.is_empty() {
                context.push_str("; last instructions: ");
                context.push_str(&recent.join(", "));
            }
            CompileError::UnresolvedLabel {
                label: label.0,
                context,
            }
        })
    }
}

impl Relocation {
    /// External ordered pair over two locations.
    pub fn external_ordered_pair(
        first: UpdateSite,
        second: UpdateSite,
        target: u64,
        target2: Option<u64>,
        kind: ExternalRelocationKind,
    ) -> Self {
        let mut external = ExternalRelocation::new(first, target, kind);
        external.site2 = Some(second);
        external.target2 = target2;
        external.flags = external.flags | ModifierFlags::ORDERED_PAIR;
        Relocation::ExternalOrderedPair32Bit(external)
    }

    /// External whose site is `instruction`'s encoding.
    pub fn before_binary_encoding_external(
        instruction: InstrId,
        target: u64,
        target2: Option<u64>,
        kind: ExternalRelocationKind,
    ) -> Self {
        let mut external =
            ExternalRelocation::new(UpdateSite::instruction(instruction), target, kind);
        external.target2 = target2;
        Relocation::BeforeBinaryEncodingExternal(external)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Relocation::LabelRelative8Bit { .. } => "LabelRelative8Bit",
            Relocation::LabelRelative12Bit { .. } => "LabelRelative12Bit",
            Relocation::LabelRelative16Bit { .. } => "LabelRelative16Bit",
            Relocation::LabelRelative24Bit { .. } => "LabelRelative24Bit",
            Relocation::LabelRelative32Bit { .. } => "LabelRelative32Bit",
            Relocation::LabelAbsolute { .. } => "LabelAbsolute",
            Relocation::LabelTable32Bit { .. } => "LabelTable32Bit",
            Relocation::InstructionAbsolute { .. } => "InstructionAbsolute",
            Relocation::LoadLabelRelative16Bit { .. } => "LoadLabelRelative16Bit",
            Relocation::LoadLabelRelative32Bit { .. } => "LoadLabelRelative32Bit",
            Relocation::LoadLabelRelative64Bit { .. } => "LoadLabelRelative64Bit",
            Relocation::External(_) => "External",
            Relocation::ExternalOrderedPair32Bit(_) => "ExternalOrderedPair32Bit",
            Relocation::BeforeBinaryEncodingExternal(_) => "BeforeBinaryEncodingExternal",
        }
    }

    pub fn is_external(&self) -> bool {
        self.as_external().is_some()
    }

    pub fn as_external(&self) -> Option<&ExternalRelocation> {
        match self {
            Relocation::External(e)
            | Relocation::ExternalOrderedPair32Bit(e)
            | Relocation::BeforeBinaryEncodingExternal(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_external_mut(&mut self) -> Option<&mut ExternalRelocation> {
        match self {
            Relocation::External(e)
            | Relocation::ExternalOrderedPair32Bit(e)
            | Relocation::BeforeBinaryEncodingExternal(e) => Some(e),
            _ => None,
        }
    }

    /// Primary patch site, when it can be determined.
    pub fn site_offset(&self, instructions: &InstructionTable) -> Option<u32> {
        match self {
            Relocation::LabelRelative8Bit { site, .. }
            | Relocation::LabelRelative12Bit { site, .. }
            | Relocation::LabelRelative16Bit { site, .. }
            | Relocation::LabelRelative24Bit { site, .. }
            | Relocation::LabelRelative32Bit { site, .. }
            | Relocation::LabelAbsolute { site, .. }
            | Relocation::LabelTable32Bit { site, .. }
            | Relocation::InstructionAbsolute { site, .. } => Some(*site),
            Relocation::LoadLabelRelative16Bit { instruction, .. }
            | Relocation::LoadLabelRelative32Bit { instruction, .. }
            | Relocation::LoadLabelRelative64Bit { instruction, .. } => {
                instructions.encoding(*instruction).ok().map(|e| e.offset)
            }
            Relocation::External(e)
            | Relocation::ExternalOrderedPair32Bit(e)
            | Relocation::BeforeBinaryEncodingExternal(e) => e.site.resolve(instructions).ok(),
        }
    }

    /// Patch the code buffer for a non-external relocation.
    pub fn apply(&self, cx: &mut ApplyContext<'_, '_>) -> CompileResult<()> {
        log::trace!("Applying {} {:?}", self.name(), self);
        let target = cx.target;
        match *self {
            Relocation::LabelRelative8Bit { site, label } => {
                let address = cx.label(label)?;
                target.apply_label_relative_8(cx.buffer, site, address)
            }
            Relocation::LabelRelative12Bit {
                site,
                label,
                check_disp,
            } => {
                let address = cx.label(label)?;
                target.apply_label_relative_12(cx.buffer, site, address, check_disp, cx.data_base)
            }
            Relocation::LabelRelative16Bit {
                site,
                label,
                divisor,
                instruction_offset,
            } => {
                let address = cx.label(label)?;
                target.apply_label_relative_16(cx.buffer, site, address, divisor, instruction_offset)
            }
            Relocation::LabelRelative24Bit { site, label } => {
                let address = cx.label(label)?;
                target.apply_label_relative_24(cx.buffer, site, address)
            }
            Relocation::LabelRelative32Bit { site, label } => {
                let address = cx.label(label)?;
                target.apply_label_relative_32(cx.buffer, site, address)
            }
            Relocation::LabelAbsolute { site, label } => {
                let address = cx.label(label)?;
                cx.buffer.patch_pointer(site, address, target.pointer_size())
            }
            Relocation::LabelTable32Bit { site, label } => {
                let address = cx.label(label)?;
                target.apply_label_table_32(cx.buffer, site, address)
            }
            Relocation::InstructionAbsolute {
                site,
                instruction,
                use_end,
            } => {
                let encoding = cx.instructions.encoding(instruction)?;
                let offset = if use_end {
                    encoding.end()
                } else {
                    encoding.offset
                };
                let address = cx.buffer.address_of(offset);
                cx.buffer.patch_pointer(site, address, target.pointer_size())
            }
            Relocation::LoadLabelRelative16Bit {
                instruction,
                start,
                end,
                delta_to_start,
            } => {
                let encoding = cx.instructions.encoding(instruction)?;
                let (start, end) = (cx.label(start)?, cx.label(end)?);
                target.apply_load_label_relative_16(cx.buffer, encoding, start, end, delta_to_start)
            }
            Relocation::LoadLabelRelative32Bit {
                instruction,
                start,
                end,
                delta_to_start,
            } => {
                let encoding = cx.instructions.encoding(instruction)?;
                let (start, end) = (cx.label(start)?, cx.label(end)?);
                target.apply_load_label_relative_32(cx.buffer, encoding, start, end, delta_to_start)
            }
            Relocation::LoadLabelRelative64Bit { instruction, label } => {
                let encoding = cx.instructions.encoding(instruction)?;
                let address = cx.label(label)?;
                target.apply_load_label_relative_64(cx.buffer, encoding, address)
            }
            Relocation::External(_)
            | Relocation::ExternalOrderedPair32Bit(_)
            | Relocation::BeforeBinaryEncodingExternal(_) => {
                Err(CompileError::InvalidInstructionSequence {
                    reason: format!("{} applied as a code patch", self.name()),
                })
            }
        }
    }

    /// Append the site offsets of an external relocation to its group.
    pub fn apply_external(
        &self,
        table: &mut ExternalRelocationTable,
        instructions: &InstructionTable,
        target: &dyn ArchitectureEncoder,
    ) -> CompileResult<()> {
        let external = self
            .as_external()
            .ok_or_else(|| CompileError::InvalidInstructionSequence {
                reason: format!("{} has no relocation record", self.name()),
            })?;
        let group_index = external
            .group
            .ok_or_else(|| CompileError::InvalidInstructionSequence {
                reason: format!("{} applied before grouping", external.kind),
            })?;
        let group =
            table
                .get_mut(group_index)
                .ok_or_else(|| CompileError::InvalidInstructionSequence {
                    reason: format!("relocation group {group_index} does not exist"),
                })?;

        let (first, second) = external.site_offsets(instructions)?;
        log::trace!(
            "Recording {} site {first:#x}{} in group {group_index}",
            external.kind,
            second.map(|s| format!(",{s:#x}")).unwrap_or_default()
        );
        group.add_relocation_entry(first, target.endianness());
        if let Some(second) = second {
            group.add_relocation_entry(second, target.endianness());
        }
        Ok(())
    }

    /// One line of the relocation dump.
    ///
    /// The method offset is relative to the relocatable start, the program
    /// offset to the method entry.
    pub fn trace(
        &self,
        out: &mut dyn fmt::Write,
        debug: Option<&RelocationDebugInfo>,
        buffer: &CodeBuffer<'_>,
        instructions: &InstructionTable,
    ) -> fmt::Result {
        let name = match self.as_external() {
            Some(external) => external.kind.name(),
            None => self.name(),
        };
        let (file, line, node) = match debug {
            Some(info) => (
                info.file,
                info.line.to_string(),
                info.node.map(|n| n.to_string()).unwrap_or_default(),
            ),
            None => ("-", "-".to_string(), String::new()),
        };
        match self.site_offset(instructions) {
            Some(offset) => {
                let program_offset =
                    buffer.address_of(offset) as i64 - buffer.code_start() as i64;
                writeln!(
                    out,
                    "{name:<48} {file:>24} {line:>6} {offset:>#10x} {program_offset:>#10x} {node}"
                )
            }
            None => writeln!(
                out,
                "{name:<48} {file:>24} {line:>6} {:>10} {:>10} {node}",
                "?", "?"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::X64Target;
    use bumpalo::Bump;
    use object::Endianness;

    #[test]
    fn unresolved_label_reports_where_it_was_created() {
        let arena = Bump::new();
        let mut buffer = CodeBuffer::new(Endianness::Little);
        buffer.reserve(arena.alloc_slice_fill_copy(16, 0u8), 0x1000);
        buffer.emit_bytes(&[0xeb, 0x00]).unwrap();

        let mut labels = LabelDirectory::new();
        let label = labels.create();
        let mut instructions = InstructionTable::new();
        let jmp = instructions.add("jmp", Some(NodeId(9)));
        instructions.set_encoding(jmp, 0, 2);

        let debug = RelocationDebugInfo::here(Some(NodeId(9)));
        let relocation = Relocation::LabelRelative8Bit { site: 1, label };
        let mut cx = ApplyContext {
            buffer: &mut buffer,
            labels: &labels,
            instructions: &instructions,
            target: &X64Target,
            data_base: None,
            debug: Some(&debug),
        };
        let err = relocation.apply(&mut cx).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("L0"));
        assert!(message.contains(file!()));
        assert!(message.contains("I0 jmp [n9n]"));
    }

    #[test]
    fn collect_modifier_checks_both_pair_sites() {
        let instructions = InstructionTable::new();
        let near = ExternalRelocation::new(
            UpdateSite::Offset(0x10),
            1,
            ExternalRelocationKind::ClassPointer,
        );
        assert_eq!(near.collect_modifier(&instructions).unwrap(), ModifierFlags::empty());

        let pair = Relocation::external_ordered_pair(
            UpdateSite::Offset(0x10),
            UpdateSite::Offset(0x9000),
            1,
            None,
            ExternalRelocationKind::AbsoluteMethodAddressOrderedPair,
        );
        let flags = pair
            .as_external()
            .unwrap()
            .collect_modifier(&instructions)
            .unwrap();
        assert!(flags.contains(ModifierFlags::WIDE_OFFSET));
        assert!(flags.contains(ModifierFlags::ORDERED_PAIR));
    }

    #[test]
    fn instruction_sites_follow_the_encoding() {
        let mut instructions = InstructionTable::new();
        let lis = instructions.add("lis", None);
        let relocation = Relocation::before_binary_encoding_external(
            lis,
            0x40,
            None,
            ExternalRelocationKind::FixedSequenceAddress2,
        );
        assert_eq!(relocation.site_offset(&instructions), None);
        instructions.set_encoding(lis, 0x24, 4);
        assert_eq!(relocation.site_offset(&instructions), Some(0x24));
    }
}
