use crate::error::StreamError;
use crate::handles::StringHandle;
use crate::type_id::TypeId;
use serde::{Deserialize, Serialize};

/// Where a scope variable comes from. The discriminants are the wire
/// encoding of the origin byte in a lexical scope entry record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableOrigin {
    Local = 0,
    Parameter = 1,
    Return = 2,
}

impl VariableOrigin {
    pub fn from_byte(byte: u8) -> Result<VariableOrigin, StreamError> {
        match byte {
            0 => Ok(VariableOrigin::Local),
            1 => Ok(VariableOrigin::Parameter),
            2 => Ok(VariableOrigin::Return),
            other => Err(StreamError::InvalidOrigin(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeVariable {
    pub identifier: StringHandle,
    pub type_id: TypeId,
    pub origin: VariableOrigin,
    pub is_reference: bool,
}

/// A lexical scope descriptor: `(name, parent, variables)`. Scopes form a
/// tree rooted at the global scope (`parent == StringHandle::NULL`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDescription {
    pub name: StringHandle,
    pub parent: StringHandle,
    pub variables: Vec<ScopeVariable>,
}

impl ScopeDescription {
    pub fn new(name: StringHandle, parent: StringHandle) -> ScopeDescription {
        ScopeDescription {
            name,
            parent,
            variables: Vec::new(),
        }
    }

    pub fn variable(&self, identifier: StringHandle) -> Option<(usize, &ScopeVariable)> {
        self.variables
            .iter()
            .enumerate()
            .find(|(_, v)| v.identifier == identifier)
    }

    pub fn has_return(&self) -> bool {
        self.variables
            .iter()
            .any(|v| v.origin == VariableOrigin::Return)
    }
}
