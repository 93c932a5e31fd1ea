// Runtime helper registry. Helpers are runtime routines that compiled code calls out of line
// (allocation slow paths, write barriers, resolution stubs). The code generator only knows
// them by HelperId; the table maps an id to its display name and entry address. The table is
// built once per process and shared read-only by every compilation and by the code cache,
// which uses the addresses as trampoline targets.

//! Runtime helper table.

use hashbrown::HashMap;
use std::fmt;

/// Index of a runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HelperId(pub u32);

impl fmt::Display for HelperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "helper#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Helper {
    name: String,
    address: u64,
}

/// Helper id to name and address.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    helpers: Vec<Helper>,
    by_name: HashMap<String, HelperId>,
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper; re-registering a name updates its address.
    pub fn register(&mut self, name: &str, address: u64) -> HelperId {
        if let Some(&id) = self.by_name.get(name) {
            self.helpers[id.0 as usize].address = address;
            return id;
        }
        let id = HelperId(self.helpers.len() as u32);
        self.helpers.push(Helper {
            name: name.to_string(),
            address,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub fn address(&self, id: HelperId) -> Option<u64> {
        self.helpers.get(id.0 as usize).map(|h| h.address)
    }

    pub fn name(&self, id: HelperId) -> Option<&str> {
        self.helpers.get(id.0 as usize).map(|h| h.name.as_str())
    }

    pub fn lookup(&self, name: &str) -> Option<HelperId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HelperId, &str, u64)> + '_ {
        self.helpers
            .iter()
            .enumerate()
            .map(|(i, h)| (HelperId(i as u32), h.name.as_str(), h.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_keeps_the_id() {
        let mut table = HelperTable::new();
        let a = table.register("jitNewObject", 0x1000);
        let b = table.register("jitWriteBarrier", 0x2000);
        assert_ne!(a, b);
        assert_eq!(table.register("jitNewObject", 0x3000), a);
        assert_eq!(table.address(a), Some(0x3000));
        assert_eq!(table.name(b), Some("jitWriteBarrier"));
        assert_eq!(table.lookup("jitWriteBarrier"), Some(b));
        assert_eq!(table.len(), 2);
    }
}
