use epoch_bytecode::{StreamError, StringHandle, TypeId};
use thiserror::Error;

/// Runtime failure taxonomy. Everything here terminates the executing
/// context when it escapes `Vm::run`; `DispatchFailed` is the one kind
/// hosts are expected to catch and surface.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("data stack overflow")]
    StackOverflow,
    #[error("data stack underflow")]
    StackUnderflow,
    #[error("unknown function {0}")]
    UnknownFunction(StringHandle),
    #[error("no scope descriptor named {0}")]
    UnknownScope(StringHandle),
    #[error("variable {0} has no storage location in the active scope chain")]
    UnboundVariable(StringHandle),
    #[error("unbound reference")]
    UnboundReference,
    #[error("string handle {0} is not pooled")]
    UnknownStringHandle(StringHandle),
    #[error("string pool conflict on handle {0}")]
    StringPoolConflict(StringHandle),
    #[error("invalid buffer handle {0}")]
    InvalidBufferHandle(u32),
    #[error("invalid structure handle {0}")]
    InvalidStructureHandle(u32),
    #[error("no structure definition for type {0}")]
    UnknownStructureType(TypeId),
    #[error("no member {member} on structure type {type_id}")]
    UnknownMember {
        type_id: TypeId,
        member: StringHandle,
    },
    #[error("missing sum type discriminator for {0}")]
    MissingDiscriminator(TypeId),
    #[error("type {0} is not a declared base of the sum type")]
    InvalidDiscriminator(TypeId),
    #[error("value on the stack does not fit type {0}")]
    TypeMismatch(TypeId),
    #[error("division by zero")]
    DivisionByZero,
    #[error("pattern or type dispatch fell off the end of resolver {resolver}")]
    DispatchFailed { resolver: StringHandle },
    #[error("unsupported type {0} in foreign marshaling")]
    UnsupportedMarshalingType(TypeId),
    #[error("external binding for '{0}' not found")]
    UnknownExternal(String),
    #[error("cannot replace active execution context")]
    ContextReplacement,
    #[error("entity chain state corrupted")]
    ChainCorrupt,
    #[error("no meta-control registered for entity tag {0}")]
    UnknownEntityTag(u32),
}

pub type VmResult<T> = Result<T, VmError>;
