// Labels are symbolic code locations. A label is created before its address is known so that
// branches, snippets and relocations can refer to it forward; during estimation it receives an
// estimated offset, and during binary encoding or snippet emission it is bound to its final
// absolute address exactly once. Relocations may be recorded against an unbound label but are
// only applied once it is bound. Labels live in a per-compilation directory and are referenced
// by index, so snippets and relocations never own the locations they point at.

//! Label directory.

use crate::core::error::{CompileError, CompileResult};
use std::fmt;

/// Index of a label in its [`LabelDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl LabelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
struct LabelEntry {
    estimated_offset: Option<u32>,
    address: Option<u64>,
}

/// Per-compilation set of labels.
#[derive(Debug, Default)]
pub struct LabelDirectory {
    labels: Vec<LabelEntry>,
}

impl LabelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound label.
    pub fn create(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelEntry::default());
        id
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn set_estimated_offset(&mut self, label: LabelId, offset: u32) {
        if let Some(entry) = self.labels.get_mut(label.index()) {
            entry.estimated_offset = Some(offset);
        }
    }

    pub fn estimated_offset(&self, label: LabelId) -> Option<u32> {
        self.labels.get(label.index())?.estimated_offset
    }

    /// Bind `label` to its final address.
    pub fn resolve(&mut self, label: LabelId, address: u64) -> CompileResult<()> {
        let entry = self
            .labels
            .get_mut(label.index())
            .ok_or_else(|| CompileError::UnresolvedLabel {
                label: label.0,
                context: " (unknown label)".to_string(),
            })?;

        if let Some(existing) = entry.address {
            return Err(CompileError::LabelAlreadyResolved {
                label: label.0,
                address: existing,
            });
        }

        log::trace!("Bound {label} to {address:#x}");
        entry.address = Some(address);
        Ok(())
    }

    /// Final address, if bound.
    pub fn address(&self, label: LabelId) -> Option<u64> {
        self.labels.get(label.index())?.address
    }

    pub fn is_resolved(&self, label: LabelId) -> bool {
        self.address(label).is_some()
    }

    /// Labels that were created but never bound.
    pub fn unresolved(&self) -> impl Iterator<Item = LabelId> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.address.is_none())
            .map(|(index, _)| LabelId(index as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_exactly_once() {
        let mut labels = LabelDirectory::new();
        let l0 = labels.create();
        let l1 = labels.create();
        assert_eq!(l1.to_string(), "L1");

        labels.set_estimated_offset(l0, 0x20);
        assert_eq!(labels.estimated_offset(l0), Some(0x20));
        assert!(!labels.is_resolved(l0));

        labels.resolve(l0, 0x1020).unwrap();
        assert_eq!(labels.address(l0), Some(0x1020));
        assert!(matches!(
            labels.resolve(l0, 0x2000),
            Err(CompileError::LabelAlreadyResolved { label: 0, address: 0x1020 })
        ));
        assert_eq!(labels.unresolved().collect::<Vec<_>>(), vec![l1]);
    }
}
