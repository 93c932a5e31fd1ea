// Constant data pool. Constants that cannot be encoded as immediates live in one data snippet
// emitted after all code: 16-byte vectors, then doubles, then addresses, then floats, so each
// class stays naturally aligned once the pool start is aligned (16 when the pool holds vectors,
// 8 otherwise). Constants are deduplicated by bit pattern, so -0.0 and 0.0 get separate slots
// and every NaN payload is kept. Each constant has its own label, bound when it is written.
//
// Some targets materialize the address of a pool slot with a split immediate sequence (a pair
// of instructions on 32-bit targets, four on 64-bit ones). These requestor instructions are
// registered against the constant and receive the slot address once the pool is placed.
// Address constants that name classes or methods need metadata so the runtime can find them:
// an AOT compilation records external relocations for them (and for the requestor sequences),
// a direct compilation patches in place and records the slots in the RuntimePatchTable so
// class redefinition and class unloading can rewrite them later. Exactly one of the two paths
// runs, chosen by the compilation mode.

//! Constant data snippet and runtime patch sites.

use super::{label_location, EmitContext, EstimateContext, PrintContext, Snippet};
use crate::codegen::instruction::{EncodedInstruction, InstrId};
use crate::codegen::label::{LabelDirectory, LabelId};
use crate::core::error::{CompileError, CompileResult};
use crate::relocation::kind::ExternalRelocationKind;
use crate::relocation::{ExternalRelocation, Relocation, UpdateSite};
use crate::target::requestor_hi_value;
use hashbrown::HashMap;
use std::fmt;

/// What an address constant refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Opaque address; needs no metadata.
    Plain,
    Class { unloadable: bool },
    RamMethod,
    Method,
}

impl AddressKind {
    /// External relocation recorded for the constant in AOT compilations.
    pub fn relocation_kind(self) -> Option<ExternalRelocationKind> {
        match self {
            AddressKind::Plain => None,
            AddressKind::Class { .. } => Some(ExternalRelocationKind::ClassPointer),
            AddressKind::RamMethod => Some(ExternalRelocationKind::RamMethod),
            AddressKind::Method => Some(ExternalRelocationKind::MethodPointer),
        }
    }

    fn tag(self) -> u8 {
        match self {
            AddressKind::Plain => 0,
            AddressKind::Class { unloadable: false } => 1,
            AddressKind::Class { unloadable: true } => 2,
            AddressKind::RamMethod => 3,
            AddressKind::Method => 4,
        }
    }
}

/// A pool constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    Float(f32),
    Double(f64),
    Address { value: u64, kind: AddressKind },
    Vector([u8; 16]),
}

impl ConstantValue {
    /// Emission rank: vectors, doubles, addresses, floats.
    fn rank(&self) -> u8 {
        match self {
            ConstantValue::Vector(_) => 0,
            ConstantValue::Double(_) => 1,
            ConstantValue::Address { .. } => 2,
            ConstantValue::Float(_) => 3,
        }
    }

    fn size(&self, pointer_size: u8) -> u32 {
        match self {
            ConstantValue::Vector(_) => 16,
            ConstantValue::Double(_) => 8,
            ConstantValue::Address { .. } => pointer_size as u32,
            ConstantValue::Float(_) => 4,
        }
    }

    /// Deduplication key: the class and the raw bits.
    fn key(&self) -> (u8, u128) {
        match *self {
            ConstantValue::Vector(bytes) => (0, u128::from_le_bytes(bytes)),
            ConstantValue::Double(v) => (1, v.to_bits() as u128),
            ConstantValue::Address { value, kind } => (2 + kind.tag(), value as u128),
            ConstantValue::Float(v) => (10, v.to_bits() as u128),
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Float(v) => write!(f, "float {v} ({:#010x})", v.to_bits()),
            ConstantValue::Double(v) => write!(f, "double {v} ({:#018x})", v.to_bits()),
            ConstantValue::Address { value, kind } => write!(f, "address {value:#x} {kind:?}"),
            ConstantValue::Vector(bytes) => {
                write!(f, "vector ")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    value: ConstantValue,
    label: LabelId,
    requestors: Vec<Vec<InstrId>>,
    offset: Option<u32>,
}

/// A slot the runtime rewrites in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    pub address: u64,
    pub value: u64,
}

/// Slots of a directly compiled method that class redefinition or unloading must patch.
#[derive(Debug, Clone, Default)]
pub struct RuntimePatchTable {
    redefinition: Vec<PatchSite>,
    unload: Vec<PatchSite>,
}

impl RuntimePatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_redefinition_site(&mut self, address: u64, value: u64) {
        self.redefinition.push(PatchSite { address, value });
    }

    pub fn add_unload_site(&mut self, address: u64, value: u64) {
        self.unload.push(PatchSite { address, value });
    }

    pub fn redefinition_sites(&self) -> &[PatchSite] {
        &self.redefinition
    }

    pub fn unload_sites(&self) -> &[PatchSite] {
        &self.unload
    }

    pub fn is_empty(&self) -> bool {
        self.redefinition.is_empty() && self.unload.is_empty()
    }
}

/// The constant pool of one compilation.
#[derive(Debug, Clone)]
pub struct ConstantDataSnippet {
    label: LabelId,
    entries: Vec<PoolEntry>,
    index: HashMap<(u8, u128), usize>,
}

impl ConstantDataSnippet {
    pub fn new(labels: &mut LabelDirectory) -> Self {
        Self {
            label: labels.create(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label of `value`, creating its slot on first use.
    pub fn find_or_create(&mut self, value: ConstantValue, labels: &mut LabelDirectory) -> LabelId {
        if let Some(&existing) = self.index.get(&value.key()) {
            return self.entries[existing].label;
        }
        let label = labels.create();
        self.index.insert(value.key(), self.entries.len());
        self.entries.push(PoolEntry {
            value,
            label,
            requestors: Vec::new(),
            offset: None,
        });
        log::trace!("Constant {value} gets {label}");
        label
    }

    pub fn find_or_create_float(&mut self, value: f32, labels: &mut LabelDirectory) -> LabelId {
        self.find_or_create(ConstantValue::Float(value), labels)
    }

    pub fn find_or_create_double(&mut self, value: f64, labels: &mut LabelDirectory) -> LabelId {
        self.find_or_create(ConstantValue::Double(value), labels)
    }

    pub fn find_or_create_address(
        &mut self,
        value: u64,
        kind: AddressKind,
        labels: &mut LabelDirectory,
    ) -> LabelId {
        self.find_or_create(ConstantValue::Address { value, kind }, labels)
    }

    pub fn find_or_create_vector(&mut self, bytes: [u8; 16], labels: &mut LabelDirectory) -> LabelId {
        self.find_or_create(ConstantValue::Vector(bytes), labels)
    }

    /// Instructions that materialize the address of `constant`'s slot.
    pub fn add_requestors(&mut self, constant: LabelId, requestors: &[InstrId]) -> CompileResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.label == constant)
            .ok_or_else(|| CompileError::InvalidInstructionSequence {
                reason: format!("{constant} is not a pool constant"),
            })?;
        entry.requestors.push(requestors.to_vec());
        Ok(())
    }

    /// Offset of `constant`'s slot once emitted.
    pub fn offset_of(&self, constant: LabelId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.label == constant)
            .and_then(|e| e.offset)
    }

    fn alignment(&self) -> u32 {
        if self
            .entries
            .iter()
            .any(|e| matches!(e.value, ConstantValue::Vector(_)))
        {
            16
        } else {
            8
        }
    }

    fn emission_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| self.entries[i].value.rank());
        order
    }

    /// Record metadata for the slot at `offset` and its requestors.
    fn add_metadata(
        &self,
        entry: &PoolEntry,
        offset: u32,
        cx: &mut EmitContext<'_, '_>,
    ) -> CompileResult<()> {
        let address = cx.buffer.address_of(offset);
        let aot = cx.config.mode.persists_relocations();

        if let ConstantValue::Address { value, kind } = entry.value {
            if aot {
                if let Some(relocation_kind) = kind.relocation_kind() {
                    cx.relocations.add_external_relocation(
                        Relocation::External(ExternalRelocation::new(
                            UpdateSite::Offset(offset),
                            value,
                            relocation_kind,
                        )),
                        None,
                    )?;
                }
            } else {
                match kind {
                    AddressKind::Plain => {}
                    AddressKind::Class { unloadable } => {
                        cx.patch_table.add_redefinition_site(address, value);
                        if unloadable {
                            cx.patch_table.add_unload_site(address, value);
                        }
                    }
                    AddressKind::RamMethod | AddressKind::Method => {
                        cx.patch_table.add_redefinition_site(address, value);
                    }
                }
            }
        }

        let hi = requestor_hi_value(address as i64, cx.config.mode);
        for group in &entry.requestors {
            let encodings = group
                .iter()
                .map(|&id| cx.instructions.encoding(id))
                .collect::<CompileResult<Vec<EncodedInstruction>>>()?;
            cx.target
                .patch_address_requestors(cx.buffer, &encodings, address, hi)?;
            if !aot {
                continue;
            }
            let relocation = match group.as_slice() {
                [first, second] => Relocation::external_ordered_pair(
                    UpdateSite::instruction(*first),
                    UpdateSite::instruction(*second),
                    address,
                    None,
                    ExternalRelocationKind::AbsoluteMethodAddressOrderedPair,
                ),
                [first, ..] => Relocation::before_binary_encoding_external(
                    *first,
                    address,
                    None,
                    ExternalRelocationKind::FixedSequenceAddress2,
                ),
                [] => continue,
            };
            cx.relocations.add_external_relocation(relocation, None)?;
        }
        Ok(())
    }
}

impl Snippet for ConstantDataSnippet {
    fn label(&self) -> LabelId {
        self.label
    }

    fn name(&self) -> &'static str {
        "ConstantDataSnippet"
    }

    fn is_data(&self) -> bool {
        true
    }

    fn length(&self, _estimated_start: u32, cx: &EstimateContext<'_>) -> u32 {
        if self.entries.is_empty() {
            return 0;
        }
        let pointer_size = cx.target.pointer_size();
        let payload: u32 = self.entries.iter().map(|e| e.value.size(pointer_size)).sum();
        payload + self.alignment() - 1
    }

    fn emit_body(&mut self, cx: &mut EmitContext<'_, '_>) -> CompileResult<()> {
        if self.entries.is_empty() {
            cx.bind_label(self.label)?;
            return Ok(());
        }
        cx.buffer.align_cursor(self.alignment())?;
        cx.bind_label(self.label)?;

        let pointer_size = cx.target.pointer_size();
        for index in self.emission_order() {
            let value = self.entries[index].value;
            let label = self.entries[index].label;
            cx.bind_label(label)?;
            let offset = match value {
                ConstantValue::Vector(bytes) => cx.buffer.emit_bytes(&bytes)?,
                ConstantValue::Double(v) => cx.buffer.emit_u64(v.to_bits())?,
                ConstantValue::Address { value, .. } if pointer_size == 8 => cx.buffer.emit_u64(value)?,
                ConstantValue::Address { value, .. } => cx.buffer.emit_u32(value as u32)?,
                ConstantValue::Float(v) => cx.buffer.emit_u32(v.to_bits())?,
            };
            self.entries[index].offset = Some(offset);
            self.add_metadata(&self.entries[index], offset, cx)?;
        }
        log::trace!("Emitted {} pool constants", self.entries.len());
        Ok(())
    }

    fn print(&self, out: &mut dyn fmt::Write, cx: &PrintContext<'_>) -> fmt::Result {
        writeln!(
            out,
            "{} [{}] {} ({} constants)",
            self.label,
            label_location(self.label, cx.labels),
            self.name(),
            self.entries.len()
        )?;
        for index in self.emission_order() {
            let entry = &self.entries[index];
            write!(
                out,
                "    {} [{}] {}",
                entry.label,
                label_location(entry.label, cx.labels),
                entry.value
            )?;
            if !entry.requestors.is_empty() {
                write!(out, " requested by {} sequences", entry.requestors.len())?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}
