use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a pooled immutable string. Handle 0 is reserved
/// and never names a real string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringHandle(pub u32);

impl StringHandle {
    pub const NULL: StringHandle = StringHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StringHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a mutable, garbage-collected byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(pub u32);

/// Identifier for a freestore-allocated structure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructureHandle(pub u32);
