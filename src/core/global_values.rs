// Runtime "global values" are addresses or constants the generated code refers to by index
// (the recompilation counter, heap bounds, the card table base, method hook switches). AOT
// code cannot bake their values in, so they are referenced through GlobalValue relocations
// whose target is the index; direct compilations read the value from the table. The table is
// an explicit object carried by CompileConfig, shared read-only by every compilation.

//! Table of runtime global values referenced by relocations.

use std::fmt;

/// Runtime value that generated code may reference indirectly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GlobalValue {
    CountForRecompile = 1,
    HeapBase = 2,
    HeapTop = 3,
    HeapBaseForBarrierRange0 = 4,
    ActiveCardTableBase = 5,
    HeapSizeForBarrierRange0 = 6,
    MethodEnterHookEnabledAddress = 7,
    MethodExitHookEnabledAddress = 8,
}

impl GlobalValue {
    /// Every global value, in index order.
    pub const ALL: [GlobalValue; 8] = [
        GlobalValue::CountForRecompile,
        GlobalValue::HeapBase,
        GlobalValue::HeapTop,
        GlobalValue::HeapBaseForBarrierRange0,
        GlobalValue::ActiveCardTableBase,
        GlobalValue::HeapSizeForBarrierRange0,
        GlobalValue::MethodEnterHookEnabledAddress,
        GlobalValue::MethodExitHookEnabledAddress,
    ];

    /// Index used as the relocation target.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|g| g.index() == index)
    }

    pub fn name(self) -> &'static str {
        match self {
            GlobalValue::CountForRecompile => "TR_CountForRecompile (1)",
            GlobalValue::HeapBase => "TR_HeapBase (2)",
            GlobalValue::HeapTop => "TR_HeapTop (3)",
            GlobalValue::HeapBaseForBarrierRange0 => "TR_HeapBaseForBarrierRange0 (4)",
            GlobalValue::ActiveCardTableBase => "TR_ActiveCardTableBase (5)",
            GlobalValue::HeapSizeForBarrierRange0 => "TR_HeapSizeForBarrierRange0 (6)",
            GlobalValue::MethodEnterHookEnabledAddress => "TR_MethodEnterHookEnabledAddress (7)",
            GlobalValue::MethodExitHookEnabledAddress => "TR_MethodExitHookEnabledAddress (8)",
        }
    }
}

impl fmt::Display for GlobalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current values of the runtime globals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalValueTable {
    values: [u64; GlobalValue::ALL.len()],
}

impl GlobalValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, global: GlobalValue) -> u64 {
        self.values[global.index() as usize - 1]
    }

    pub fn set(&mut self, global: GlobalValue, value: u64) {
        self.values[global.index() as usize - 1] = value;
    }

    /// Builder-style setter.
    pub fn with(mut self, global: GlobalValue, value: u64) -> Self {
        self.set(global, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (GlobalValue, u64)> + '_ {
        GlobalValue::ALL.iter().map(move |&g| (g, self.get(g)))
    }
}
