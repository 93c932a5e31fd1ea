// Iterated external relocations. Sites that share a target, an optional second target, a kind
// and the modifier bits are batched into one persisted record: a header followed by the list
// of site offsets. A record is capped at MAX_SIZE_RELOCATION_DATA bytes because its size is
// persisted as a u16. Grouping is a linear scan over the groups of the compilation, skipping
// full ones; a group that cannot take one more site is marked full, never reopened, and the
// scan continues, so one key may own several groups over time. Each group starts narrow
// (16-bit offsets) and is upgraded to wide offsets as soon as any of its sites falls outside
// the signed 16-bit window. The upgrade is one way and re-accounts every earlier site at the
// wide size, which is what the offsets will be written as. The wide bit is therefore a
// property of the group rather than of the grouping key.

//! Size-bounded groups of external relocation sites.

use super::kind::ExternalRelocationKind;
use std::fmt;

/// Largest persisted record, header included.
pub const MAX_SIZE_RELOCATION_DATA: u32 = 0xffff;
pub const MIN_SHORT_OFFSET: i64 = -32768;
pub const MAX_SHORT_OFFSET: i64 = 32767;

/// Modifier bits persisted in a record's flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModifierFlags(u8);

impl ModifierFlags {
    /// Site offsets are 32-bit.
    pub const WIDE_OFFSET: ModifierFlags = ModifierFlags(0x80);
    /// Sites are relative to the next instruction.
    pub const EIP_OFFSET: ModifierFlags = ModifierFlags(0x40);
    /// Each site is two correlated offsets.
    pub const ORDERED_PAIR: ModifierFlags = ModifierFlags(0x20);
    /// Header carries a second target.
    pub const HAS_TARGET2: ModifierFlags = ModifierFlags(0x10);

    pub const fn empty() -> Self {
        ModifierFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        ModifierFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: ModifierFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: ModifierFlags) -> Self {
        ModifierFlags(self.0 | other.0)
    }

    pub const fn without(self, other: ModifierFlags) -> Self {
        ModifierFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for ModifierFlags {
    type Output = ModifierFlags;

    fn bitor(self, rhs: ModifierFlags) -> ModifierFlags {
        self.union(rhs)
    }
}

impl fmt::Display for ModifierFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::WIDE_OFFSET) {
            names.push("wide");
        }
        if self.contains(Self::EIP_OFFSET) {
            names.push("eip");
        }
        if self.contains(Self::ORDERED_PAIR) {
            names.push("pair");
        }
        if names.is_empty() {
            f.pad("-")
        } else {
            f.pad(&names.join("|"))
        }
    }
}

/// Whether a method-relative offset needs a wide site.
pub fn needs_wide_offset(offset: i64) -> bool {
    !(MIN_SHORT_OFFSET..=MAX_SHORT_OFFSET).contains(&offset)
}

/// Identity of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub target: u64,
    pub target2: Option<u64>,
    pub kind: ExternalRelocationKind,
    /// Modifier bits other than the width.
    pub modifier: ModifierFlags,
}

impl GroupKey {
    pub fn new(
        target: u64,
        target2: Option<u64>,
        kind: ExternalRelocationKind,
        modifier: ModifierFlags,
    ) -> Self {
        Self {
            target,
            target2,
            kind,
            modifier: modifier.without(ModifierFlags::WIDE_OFFSET),
        }
    }

    pub fn is_ordered_pair(&self) -> bool {
        self.modifier.contains(ModifierFlags::ORDERED_PAIR)
    }

    /// Bytes of one narrow site.
    pub fn narrow_size(&self) -> u32 {
        if self.is_ordered_pair() {
            4
        } else {
            2
        }
    }

    /// Bytes of one wide site.
    pub fn wide_size(&self) -> u32 {
        if self.is_ordered_pair() {
            8
        } else {
            4
        }
    }
}

/// One persisted record under construction.
#[derive(Debug, Clone)]
pub struct IteratedExternalRelocation {
    key: GroupKey,
    wide: bool,
    full: bool,
    number_of_sites: u32,
    /// Accounted record size, header included.
    size: u32,
    header_size: u16,
    /// Header then offsets, once initialised.
    data: Vec<u8>,
}

impl IteratedExternalRelocation {
    fn new(key: GroupKey, header_size: u16) -> Self {
        Self {
            key,
            wide: false,
            full: false,
            number_of_sites: 0,
            size: header_size as u32,
            header_size,
            data: Vec::new(),
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn target_address(&self) -> u64 {
        self.key.target
    }

    pub fn target_address2(&self) -> Option<u64> {
        self.key.target2
    }

    pub fn target_kind(&self) -> ExternalRelocationKind {
        self.key.kind
    }

    /// Flags as persisted, width and second target included.
    pub fn modifier_flags(&self) -> ModifierFlags {
        let mut flags = self.key.modifier;
        if self.wide {
            flags = flags | ModifierFlags::WIDE_OFFSET;
        }
        if self.key.target2.is_some() {
            flags = flags | ModifierFlags::HAS_TARGET2;
        }
        flags
    }

    pub fn needs_wide_offsets(&self) -> bool {
        self.wide
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn number_of_relocation_sites(&self) -> u32 {
        self.number_of_sites
    }

    pub fn size_of_relocation_data(&self) -> u32 {
        self.size
    }

    pub fn header_size(&self) -> u16 {
        self.header_size
    }

    fn site_size(&self) -> u32 {
        if self.wide {
            self.key.wide_size()
        } else {
            self.key.narrow_size()
        }
    }

    /// Size after adding one site, upgrading to wide when `wide_site`.
    fn size_with_one_more(&self, wide_site: bool) -> u32 {
        if wide_site && !self.wide {
            self.header_size as u32 + (self.number_of_sites + 1) * self.key.wide_size()
        } else {
            self.size + self.site_size()
        }
    }

    /// Start the payload with its persisted header.
    pub fn initialise(&mut self, header: Vec<u8>) {
        debug_assert_eq!(header.len(), self.header_size as usize);
        self.data = header;
    }

    /// Append one site offset at the group's width.
    pub fn add_relocation_entry(&mut self, offset: u32, endian: object::Endianness) {
        use object::Endian;
        if self.wide {
            self.data.extend_from_slice(&endian.write_u32_bytes(offset));
        } else {
            self.data
                .extend_from_slice(&endian.write_u16_bytes(offset as u16));
        }
    }

    /// Persisted bytes: header followed by the site offsets.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Groups of one compilation, in creation order.
#[derive(Debug, Default)]
pub struct ExternalRelocationTable {
    groups: Vec<IteratedExternalRelocation>,
}

impl ExternalRelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach one site with `key` and return the index of its group.
    ///
    /// `wide_site` is the site's own width decision; `header_size` seeds a
    /// newly created group.
    pub fn insert(&mut self, key: GroupKey, wide_site: bool, header_size: u16) -> usize {
        for (index, group) in self.groups.iter_mut().enumerate() {
            if group.full || group.key != key {
                continue;
            }

            let size = group.size_with_one_more(wide_site);
            if size > MAX_SIZE_RELOCATION_DATA {
                log::debug!(
                    "Relocation group {index} ({}) is full at {} sites",
                    key.kind,
                    group.number_of_sites
                );
                group.full = true;
                continue;
            }

            if wide_site && !group.wide {
                log::debug!("Relocation group {index} ({}) upgraded to wide offsets", key.kind);
                group.wide = true;
            }
            group.number_of_sites += 1;
            group.size = size;
            return index;
        }

        let mut group = IteratedExternalRelocation::new(key, header_size);
        group.wide = wide_site;
        group.number_of_sites = 1;
        group.size += group.site_size();
        log::debug!(
            "New relocation group {} for {} target={:#x}",
            self.groups.len(),
            key.kind,
            key.target
        );
        self.groups.push(group);
        self.groups.len() - 1
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&IteratedExternalRelocation> {
        self.groups.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut IteratedExternalRelocation> {
        self.groups.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IteratedExternalRelocation> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IteratedExternalRelocation> {
        self.groups.iter_mut()
    }

    /// Total sites across all groups.
    pub fn site_count(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.number_of_sites as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(target: u64) -> GroupKey {
        GroupKey::new(
            target,
            None,
            ExternalRelocationKind::HelperAddress,
            ModifierFlags::EIP_OFFSET,
        )
    }

    #[test]
    fn same_key_shares_a_group() {
        let mut table = ExternalRelocationTable::new();
        let a = table.insert(key(0x100), false, 12);
        let b = table.insert(key(0x100), false, 12);
        let c = table.insert(key(0x200), false, 12);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let group = table.get(a).unwrap();
        assert_eq!(group.number_of_relocation_sites(), 2);
        assert_eq!(group.size_of_relocation_data(), 12 + 2 * 2);
    }

    #[test]
    fn wide_bit_is_not_part_of_the_key() {
        let wide = GroupKey::new(
            1,
            None,
            ExternalRelocationKind::ClassPointer,
            ModifierFlags::WIDE_OFFSET,
        );
        let narrow = GroupKey::new(1, None, ExternalRelocationKind::ClassPointer, ModifierFlags::empty());
        assert_eq!(wide, narrow);
    }

    #[test]
    fn upgrade_reaccounts_earlier_sites() {
        let mut table = ExternalRelocationTable::new();
        let g = table.insert(key(1), false, 12);
        table.insert(key(1), false, 12);
        table.insert(key(1), true, 12);
        let group = table.get(g).unwrap();
        assert!(group.needs_wide_offsets());
        assert_eq!(group.size_of_relocation_data(), 12 + 3 * 4);

        table.insert(key(1), false, 12);
        let group = table.get(g).unwrap();
        assert!(group.needs_wide_offsets());
        assert_eq!(group.size_of_relocation_data(), 12 + 4 * 4);
        assert!(group.modifier_flags().contains(ModifierFlags::WIDE_OFFSET));
    }

    #[test]
    fn ordered_pairs_double_the_site_size() {
        let pair = GroupKey::new(
            7,
            Some(8),
            ExternalRelocationKind::AbsoluteMethodAddressOrderedPair,
            ModifierFlags::ORDERED_PAIR,
        );
        assert_eq!((pair.narrow_size(), pair.wide_size()), (4, 8));
        let mut table = ExternalRelocationTable::new();
        let g = table.insert(pair, false, 20);
        let group = table.get(g).unwrap();
        assert_eq!(group.size_of_relocation_data(), 24);
        assert!(group.modifier_flags().contains(ModifierFlags::HAS_TARGET2));
    }

    #[test]
    fn window_edges() {
        assert!(!needs_wide_offset(MAX_SHORT_OFFSET));
        assert!(needs_wide_offset(MAX_SHORT_OFFSET + 1));
        assert!(!needs_wide_offset(MIN_SHORT_OFFSET));
        assert!(needs_wide_offset(MIN_SHORT_OFFSET - 1));
    }

    #[test]
    fn flags_display() {
        assert_eq!(
            (ModifierFlags::WIDE_OFFSET | ModifierFlags::ORDERED_PAIR).to_string(),
            "wide|pair"
        );
        assert_eq!(ModifierFlags::empty().to_string(), "-");
    }
}
