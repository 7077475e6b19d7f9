use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag selecting an entity's meta-control behavior. The tags below are
/// known to the core; user-defined entities (loops, conditionals, and
/// whatever else a library registers) take tags from
/// [`EntityTag::CUSTOM_BASE`] upward and are opaque to the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTag(pub u32);

impl EntityTag {
    pub const FUNCTION: EntityTag = EntityTag(1);
    pub const PATTERN_MATCHING_RESOLVER: EntityTag = EntityTag(2);
    pub const TYPE_RESOLVER: EntityTag = EntityTag(3);
    pub const FREE_BLOCK: EntityTag = EntityTag(4);
    pub const GLOBALS: EntityTag = EntityTag(5);

    pub const CUSTOM_BASE: u32 = 0x100;

    pub fn custom(index: u32) -> EntityTag {
        EntityTag(Self::CUSTOM_BASE + index)
    }

    pub fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOM_BASE
    }

    /// Entities invocable by name: functions and the two resolver kinds.
    pub fn is_invocable(self) -> bool {
        matches!(
            self,
            EntityTag::FUNCTION | EntityTag::PATTERN_MATCHING_RESOLVER | EntityTag::TYPE_RESOLVER
        )
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
