// Instruction records. Instruction selection and register assignment are collaborators of the
// emission core, so an instruction is only visible here as a mnemonic, the IR node it came
// from, and after binary encoding the offset and length of its bytes. Instruction based
// relocations (absolute instruction addresses, load-label sequences, fixed sequences that
// receive their site only after encoding) and the Power split-immediate paths look encodings
// up by InstrId. The most recently encoded instructions also form the diagnostic context of
// an unresolved label failure.

//! Instruction table filled during binary encoding.

use crate::core::error::{CompileError, CompileResult};
use std::fmt;

/// Index of an instruction in its [`InstructionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// IR node an instruction or relocation is associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}n", self.0)
    }
}

/// Position of an instruction's bytes in the code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedInstruction {
    pub offset: u32,
    pub length: u32,
}

impl EncodedInstruction {
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone)]
struct InstructionRecord {
    mnemonic: &'static str,
    node: Option<NodeId>,
    encoding: Option<EncodedInstruction>,
}

/// Instructions of one compilation, in emission order.
#[derive(Debug, Default)]
pub struct InstructionTable {
    records: Vec<InstructionRecord>,
    /// Encoding order, for diagnostics.
    encoded: Vec<InstrId>,
}

impl InstructionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mnemonic: &'static str, node: Option<NodeId>) -> InstrId {
        let id = InstrId(self.records.len() as u32);
        self.records.push(InstructionRecord {
            mnemonic,
            node,
            encoding: None,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn mnemonic(&self, id: InstrId) -> Option<&'static str> {
        self.records.get(id.0 as usize).map(|r| r.mnemonic)
    }

    pub fn node(&self, id: InstrId) -> Option<NodeId> {
        self.records.get(id.0 as usize)?.node
    }

    /// Record where `id` was encoded.
    pub fn set_encoding(&mut self, id: InstrId, offset: u32, length: u32) {
        if let Some(record) = self.records.get_mut(id.0 as usize) {
            record.encoding = Some(EncodedInstruction { offset, length });
            self.encoded.push(id);
        }
    }

    pub fn encoding(&self, id: InstrId) -> CompileResult<EncodedInstruction> {
        self.records
            .get(id.0 as usize)
            .and_then(|r| r.encoding)
            .ok_or(CompileError::UnencodedInstruction { instruction: id.0 })
    }

    /// Describe the last `count` encoded instructions, oldest first.
    pub fn recent_encodings(&self, count: usize) -> Vec<String> {
        let skip = self.encoded.len().saturating_sub(count);
        self.encoded[skip..]
            .iter()
            .filter_map(|&id| {
                let record = self.records.get(id.0 as usize)?;
                let encoding = record.encoding?;
                Some(match record.node {
                    Some(node) => format!(
                        "{id} {} [{node}] at {:#x} ({} bytes)",
                        record.mnemonic, encoding.offset, encoding.length
                    ),
                    None => format!(
                        "{id} {} at {:#x} ({} bytes)",
                        record.mnemonic, encoding.offset, encoding.length
                    ),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_are_looked_up_by_id() {
        let mut table = InstructionTable::new();
        let mov = table.add("mov", Some(NodeId(4)));
        let ret = table.add("ret", None);

        assert!(matches!(
            table.encoding(mov),
            Err(CompileError::UnencodedInstruction { instruction: 0 })
        ));
        table.set_encoding(mov, 0x10, 5);
        table.set_encoding(ret, 0x15, 1);
        assert_eq!(table.encoding(mov).unwrap().end(), 0x15);

        let recent = table.recent_encodings(1);
        assert_eq!(recent, vec!["I1 ret at 0x15 (1 bytes)".to_string()]);
        assert!(table.recent_encodings(8)[0].contains("[n4n]"));
    }
}
