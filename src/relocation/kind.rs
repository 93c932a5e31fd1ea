// External relocation kinds. Each kind names what a persisted site refers to (a helper entry
// point, a class pointer, a method pointer, a constant pool slot, a guard to validate) so the
// loader knows how to recompute the value when AOT code is reused. The kind is persisted as a
// single byte in each record header, so the numbering is part of the on-disk format and must
// not change. Display names come from an exhaustive match, giving every kind exactly one name.

//! Closed set of external relocation kinds.

use std::fmt;

macro_rules! external_relocation_kinds {
    ($($variant:ident = $value:literal, $name:literal;)*) => {
        /// What an external relocation site refers to.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum ExternalRelocationKind {
            $($variant = $value,)*
        }

        impl ExternalRelocationKind {
            /// Every kind in numeric order.
            pub const ALL: &'static [ExternalRelocationKind] =
                &[$(ExternalRelocationKind::$variant,)*];

            /// Display name used by relocation dumps.
            pub fn name(self) -> &'static str {
                match self {
                    $(ExternalRelocationKind::$variant => $name,)*
                }
            }

            /// Decode a persisted kind byte.
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(ExternalRelocationKind::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

external_relocation_kinds! {
    ConstantPool = 0, "TR_ConstantPool (0)";
    HelperAddress = 1, "TR_HelperAddress (1)";
    RelativeMethodAddress = 2, "TR_RelativeMethodAddress (2)";
    AbsoluteMethodAddress = 3, "TR_AbsoluteMethodAddress (3)";
    DataAddress = 4, "TR_DataAddress (4)";
    ClassObject = 5, "TR_ClassObject (5)";
    MethodObject = 6, "TR_MethodObject (6)";
    InterfaceObject = 7, "TR_InterfaceObject (7)";
    AbsoluteHelperAddress = 8, "TR_AbsoluteHelperAddress (8)";
    FixedSequenceAddress = 9, "TR_FixedSequenceAddress (9)";
    FixedSequenceAddress2 = 10, "TR_FixedSequenceAddress2 (10)";
    JniVirtualTargetAddress = 11, "TR_JNIVirtualTargetAddress (11)";
    JniStaticTargetAddress = 12, "TR_JNIStaticTargetAddress (12)";
    ArrayCopyHelper = 13, "TR_ArrayCopyHelper (13)";
    ArrayCopyToc = 14, "TR_ArrayCopyToc (14)";
    BodyInfoAddress = 15, "TR_BodyInfoAddress (15)";
    Thunks = 16, "TR_Thunks (16)";
    StaticRamMethodConst = 17, "TR_StaticRamMethodConst (17)";
    Trampolines = 18, "TR_Trampolines (18)";
    PicTrampolines = 19, "TR_PicTrampolines (19)";
    CheckMethodEnter = 20, "TR_CheckMethodEnter (20)";
    RamMethod = 21, "TR_RamMethod (21)";
    RamMethodSequence = 22, "TR_RamMethodSequence (22)";
    RamMethodSequenceReg = 23, "TR_RamMethodSequenceReg (23)";
    VerifyClassObjectForAlloc = 24, "TR_VerifyClassObjectForAlloc (24)";
    ConstantPoolOrderedPair = 25, "TR_ConstantPoolOrderedPair (25)";
    AbsoluteMethodAddressOrderedPair = 26, "TR_AbsoluteMethodAddressOrderedPair (26)";
    VerifyRefArrayForAlloc = 27, "TR_VerifyRefArrayForAlloc (27)";
    J2IThunks = 28, "TR_J2IThunks (28)";
    GlobalValue = 29, "TR_GlobalValue (29)";
    BodyInfoAddressLoad = 30, "TR_BodyInfoAddressLoad (30)";
    ValidateInstanceField = 31, "TR_ValidateInstanceField (31)";
    InlinedStaticMethodWithNopGuard = 32, "TR_InlinedStaticMethodWithNopGuard (32)";
    InlinedSpecialMethodWithNopGuard = 33, "TR_InlinedSpecialMethodWithNopGuard (33)";
    InlinedVirtualMethodWithNopGuard = 34, "TR_InlinedVirtualMethodWithNopGuard (34)";
    InlinedInterfaceMethodWithNopGuard = 35, "TR_InlinedInterfaceMethodWithNopGuard (35)";
    SpecialRamMethodConst = 36, "TR_SpecialRamMethodConst (36)";
    InlinedHcrMethod = 37, "TR_InlinedHCRMethod (37)";
    ValidateStaticField = 38, "TR_ValidateStaticField (38)";
    ValidateClass = 39, "TR_ValidateClass (39)";
    ClassAddress = 40, "TR_ClassAddress (40)";
    Hcr = 41, "TR_HCR (41)";
    ProfiledMethodGuardRelocation = 42, "TR_ProfiledMethodGuardRelocation (42)";
    ProfiledClassGuardRelocation = 43, "TR_ProfiledClassGuardRelocation (43)";
    HierarchyGuardRelocation = 44, "TR_HierarchyGuardRelocation (44)";
    AbstractGuardRelocation = 45, "TR_AbstractGuardRelocation (45)";
    ProfiledInlinedMethodRelocation = 46, "TR_ProfiledInlinedMethodRelocation (46)";
    MethodPointer = 47, "TR_MethodPointer (47)";
    ClassPointer = 48, "TR_ClassPointer (48)";
    CheckMethodExit = 49, "TR_CheckMethodExit (49)";
    ValidateArbitraryClass = 50, "TR_ValidateArbitraryClass (50)";
    EmitClass = 51, "TR_EmitClass (51)";
    JniSpecialTargetAddress = 52, "TR_JNISpecialTargetAddress (52)";
    VirtualRamMethodConst = 53, "TR_VirtualRamMethodConst (53)";
    InlinedInterfaceMethod = 54, "TR_InlinedInterfaceMethod (54)";
    InlinedVirtualMethod = 55, "TR_InlinedVirtualMethod (55)";
    NativeMethodAbsolute = 56, "TR_NativeMethodAbsolute (56)";
    NativeMethodRelative = 57, "TR_NativeMethodRelative (57)";
}

impl ExternalRelocationKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Kinds whose sites are always recorded as two correlated locations.
    pub fn is_ordered_pair(self) -> bool {
        matches!(
            self,
            ExternalRelocationKind::ConstantPoolOrderedPair
                | ExternalRelocationKind::AbsoluteMethodAddressOrderedPair
        )
    }
}

impl fmt::Display for ExternalRelocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
