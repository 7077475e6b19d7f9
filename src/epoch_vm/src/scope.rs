use crate::error::{VmError, VmResult};
use crate::stack::StackSpace;
use crate::variants::VariantDefinition;
use epoch_bytecode::{ScopeDescription, StringHandle, TypeId, VariableOrigin};
use log::trace;
use std::collections::HashMap;
use std::rc::Rc;

/// What a reference binding points at: a typed slot on the data stack,
/// or a member of a freestore structure record. Bindings live in a
/// per-context arena and are transient, never owning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefTarget {
    Stack {
        offset: usize,
        type_id: TypeId,
    },
    Member {
        structure: epoch_bytecode::StructureHandle,
        index: usize,
        type_id: TypeId,
    },
}

impl RefTarget {
    pub fn type_id(&self) -> TypeId {
        match self {
            RefTarget::Stack { type_id, .. } | RefTarget::Member { type_id, .. } => *type_id,
        }
    }
}

/// Per-variable runtime data inside an activation record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VarData {
    /// Plain storage at an absolute stack offset.
    Value { offset: usize },
    /// Sum-typed cell: `offset` addresses the payload, the 4-byte
    /// discriminator sits immediately below it at `offset - 4`.
    SumValue { offset: usize },
    /// Reference parameter: an index into the binding arena plus the
    /// referenced storage's type.
    Reference { target: usize, type_id: TypeId },
}

/// Runtime materialization of a lexical scope: storage locations for
/// parameters consumed off the stack and locals pushed onto it.
/// Activations live in a per-context arena; `parent` is an arena index,
/// never an owning pointer.
#[derive(Debug)]
pub struct ActiveScope {
    pub scope: Rc<ScopeDescription>,
    pub parent: Option<usize>,
    pub data: Vec<VarData>,
    /// Stack top at activation, with the caller's parameter pushes
    /// still in place.
    pub entry_top: usize,
    /// Bytes of parameter storage consumed from the caller.
    pub params_bytes: usize,
    /// Binding-arena length at activation; truncated back on exit.
    pub binding_mark: usize,
    /// Set when this activation wrote the return register; the exit
    /// path pushes the register for the caller exactly when set.
    pub register_written: bool,
}

impl ActiveScope {
    pub fn find_variable(&self, identifier: StringHandle) -> Option<(usize, &epoch_bytecode::ScopeVariable)> {
        self.scope.variable(identifier)
    }

    pub fn return_variable(&self) -> Option<usize> {
        self.scope
            .variables
            .iter()
            .position(|v| v.origin == VariableOrigin::Return)
    }

    /// The offset everything from parameters through locals is popped
    /// back to on exit.
    pub fn exit_top(&self) -> usize {
        self.entry_top + self.params_bytes
    }
}

/// Construct an activation record against a scope descriptor.
///
/// Parameters bind first, walking the descriptor's variables in reverse
/// order against the top of the stack: reference parameters consume a
/// `(target, type)` binding, sum-typed parameters consume
/// `(discriminator, payload)`, everything else consumes its storage
/// size in place. Locals and return slots are then pushed and zeroed.
pub fn activate(
    scope: Rc<ScopeDescription>,
    parent: Option<usize>,
    stack: &mut StackSpace,
    variants: &HashMap<TypeId, VariantDefinition>,
    binding_mark: usize,
) -> VmResult<ActiveScope> {
    let entry_top = stack.top_offset();
    let mut data = vec![VarData::Value { offset: 0 }; scope.variables.len()];

    let mut cursor = entry_top;
    for (index, variable) in scope.variables.iter().enumerate().rev() {
        if variable.origin != VariableOrigin::Parameter {
            continue;
        }
        if variable.is_reference {
            let target = stack.read_u32_at(cursor)? as usize;
            let type_id = TypeId(stack.read_u32_at(cursor + 4)?);
            cursor += 8;
            data[index] = VarData::Reference { target, type_id };
        } else if variable.type_id.family() == epoch_bytecode::TypeFamily::SumType {
            let actual = TypeId(stack.read_u32_at(cursor)?);
            cursor += 4;
            let payload = actual
                .storage_size()
                .ok_or(VmError::MissingDiscriminator(variable.type_id))?;
            if actual != TypeId::NOTHING {
                let definition = variants
                    .get(&variable.type_id)
                    .ok_or(VmError::MissingDiscriminator(variable.type_id))?;
                if !definition.has_base(actual) {
                    return Err(VmError::InvalidDiscriminator(actual));
                }
            }
            data[index] = VarData::SumValue { offset: cursor };
            cursor += payload;
        } else {
            let size = variable
                .type_id
                .storage_size()
                .ok_or(VmError::TypeMismatch(variable.type_id))?;
            data[index] = VarData::Value { offset: cursor };
            cursor += size;
        }
    }
    let params_bytes = cursor - entry_top;

    for (index, variable) in scope.variables.iter().enumerate() {
        if variable.origin == VariableOrigin::Parameter {
            continue;
        }
        if variable.type_id.family() == epoch_bytecode::TypeFamily::SumType {
            let definition = variants
                .get(&variable.type_id)
                .ok_or(VmError::MissingDiscriminator(variable.type_id))?;
            let size = definition.max_size();
            stack.push(size)?;
            let top = stack.top_offset();
            stack.write_bytes(top, &vec![0; size])?;
            stack.write_u32_at(top, TypeId::NOTHING.0)?;
            data[index] = VarData::SumValue { offset: top + 4 };
        } else {
            let size = variable
                .type_id
                .storage_size()
                .ok_or(VmError::TypeMismatch(variable.type_id))?;
            stack.push(size)?;
            let top = stack.top_offset();
            stack.write_bytes(top, &vec![0; size])?;
            data[index] = VarData::Value { offset: top };
        }
    }

    trace!(
        "activated scope {} ({} vars, {} param bytes)",
        scope.name,
        scope.variables.len(),
        params_bytes
    );
    Ok(ActiveScope {
        scope,
        parent,
        data,
        entry_top,
        params_bytes,
        binding_mark,
        register_written: false,
    })
}
