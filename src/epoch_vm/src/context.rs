use crate::buffers::BufferStore;
use crate::error::{VmError, VmResult};
use crate::intrinsics::{MetaControlRegistry, NativeRegistry};
use crate::scope::{ActiveScope, RefTarget, VarData};
use crate::stack::{StackSpace, DEFAULT_STACK_BYTES};
use crate::strings::RuntimeStringPool;
use crate::structures::{StructureDefinition, StructureStore};
use crate::value::{Register, Value};
use crate::variants::VariantDefinition;
use epoch_bytecode::{ScopeDescription, StringHandle, StructureHandle, TypeFamily, TypeId};
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

/// Everything one execution context owns: the data stack, activation
/// arena, freestores, string pool, metadata tables, reference-binding
/// arena, and the return register. No state here is shared between
/// contexts; the DLL binding registry is the single process-wide
/// exception and lives in `marshaling`.
pub struct ExecutionContext {
    pub stack: StackSpace,
    pub strings: RuntimeStringPool,
    pub buffers: BufferStore,
    pub structures: StructureStore,
    pub structure_defs: HashMap<TypeId, StructureDefinition>,
    pub variant_defs: HashMap<TypeId, VariantDefinition>,
    pub scopes: HashMap<StringHandle, Rc<ScopeDescription>>,
    pub activations: Vec<ActiveScope>,
    pub bindings: Vec<RefTarget>,
    pub register: Register,
    pub natives: NativeRegistry,
    pub meta: MetaControlRegistry,
    /// Pinned wide-string images handed out to foreign code; also how
    /// unchanged inbound pointers map back to their original handles.
    pub wide_strings: HashMap<StringHandle, Box<[u16]>>,
    pub callback_thunks: HashMap<StringHandle, usize>,
    pub gc_enabled: bool,
}

impl ExecutionContext {
    pub fn new() -> ExecutionContext {
        ExecutionContext::with_stack_size(DEFAULT_STACK_BYTES)
    }

    pub fn with_stack_size(stack_bytes: usize) -> ExecutionContext {
        let mut context = ExecutionContext {
            stack: StackSpace::new(stack_bytes),
            strings: RuntimeStringPool::new(),
            buffers: BufferStore::new(),
            structures: StructureStore::new(),
            structure_defs: HashMap::new(),
            variant_defs: HashMap::new(),
            scopes: HashMap::new(),
            activations: Vec::new(),
            bindings: Vec::new(),
            register: Register::default(),
            natives: NativeRegistry::new(),
            meta: MetaControlRegistry::new(),
            wide_strings: HashMap::new(),
            callback_thunks: HashMap::new(),
            gc_enabled: true,
        };
        crate::intrinsics::install_defaults(&mut context.natives, &mut context.meta);
        context
    }

    // ---- variables ----

    /// Find `(activation index, variable index)` for an identifier,
    /// searching from the innermost activation up the lexical parent
    /// chain.
    pub fn resolve_variable(&self, identifier: StringHandle) -> VmResult<(usize, usize)> {
        let mut current = self.activations.len().checked_sub(1);
        while let Some(index) = current {
            let activation = &self.activations[index];
            if let Some((var_index, _)) = activation.find_variable(identifier) {
                return Ok((index, var_index));
            }
            current = activation.parent;
        }
        Err(VmError::UnboundVariable(identifier))
    }

    pub fn declared_type(&self, activation: usize, variable: usize) -> TypeId {
        self.activations[activation].scope.variables[variable].type_id
    }

    /// Push a variable's current value: dereferencing reference
    /// parameters, and pushing `(payload, discriminator)` for sum-typed
    /// storage with the discriminator on top.
    pub fn push_variable(&mut self, identifier: StringHandle) -> VmResult<()> {
        let (activation, variable) = self.resolve_variable(identifier)?;
        let declared = self.declared_type(activation, variable);
        let data = self.activations[activation].data[variable];
        match data {
            VarData::Value { offset } => {
                let size = declared
                    .storage_size()
                    .ok_or(VmError::TypeMismatch(declared))?;
                let bytes = self.stack.read_bytes(offset, size)?.to_vec();
                self.stack.push_bytes(&bytes)
            }
            VarData::SumValue { offset } => {
                let tag = self.sum_cell_tag(offset, declared)?;
                let size = tag
                    .storage_size()
                    .ok_or(VmError::MissingDiscriminator(declared))?;
                let payload = self.stack.read_bytes(offset, size)?.to_vec();
                self.stack.push_bytes(&payload)?;
                self.stack.push_u32(tag.0)
            }
            VarData::Reference { target, .. } => {
                let value = self.read_ref_target(target)?;
                value.push_onto(&mut self.stack)
            }
        }
    }

    /// Read a variable as a tagged value; the boolean reports whether
    /// the storage was sum-typed.
    pub fn read_variable(&self, identifier: StringHandle) -> VmResult<(Value, bool)> {
        let (activation, variable) = self.resolve_variable(identifier)?;
        let declared = self.declared_type(activation, variable);
        let data = self.activations[activation].data[variable];
        match data {
            VarData::Value { offset } => {
                let size = declared
                    .storage_size()
                    .ok_or(VmError::TypeMismatch(declared))?;
                let bytes = self.stack.read_bytes(offset, size)?;
                Ok((Value::from_bytes(declared, bytes)?, false))
            }
            VarData::SumValue { offset } => {
                let tag = self.sum_cell_tag(offset, declared)?;
                let size = tag
                    .storage_size()
                    .ok_or(VmError::MissingDiscriminator(declared))?;
                let bytes = self.stack.read_bytes(offset, size)?;
                Ok((Value::from_bytes(tag, bytes)?, true))
            }
            VarData::Reference { target, .. } => Ok((self.read_ref_target(target)?, false)),
        }
    }

    /// Write a raw value into a variable's own storage (not through a
    /// binding). Used by identifier-directed assignment.
    pub fn write_variable(&mut self, identifier: StringHandle, bytes: &[u8]) -> VmResult<()> {
        let (activation, variable) = self.resolve_variable(identifier)?;
        let declared = self.declared_type(activation, variable);
        let data = self.activations[activation].data[variable];
        match data {
            VarData::Value { offset } => self.stack.write_bytes(offset, bytes),
            VarData::SumValue { .. } => Err(VmError::MissingDiscriminator(declared)),
            VarData::Reference { target, .. } => {
                let type_id = self.bindings[target].type_id();
                let value = Value::from_bytes(type_id, bytes)?;
                self.write_ref_target(target, &value)
            }
        }
    }

    /// Write a sum-typed cell: discriminator slot plus payload.
    pub fn write_sum_variable(&mut self, identifier: StringHandle, actual: TypeId, payload: &[u8]) -> VmResult<()> {
        let (activation, variable) = self.resolve_variable(identifier)?;
        let declared = self.declared_type(activation, variable);
        let data = self.activations[activation].data[variable];
        let offset = match data {
            VarData::SumValue { offset } => offset,
            _ => return Err(VmError::TypeMismatch(declared)),
        };
        self.check_discriminator(declared, actual)?;
        self.stack.write_u32_at(offset - 4, actual.0)?;
        self.stack.write_bytes(offset, payload)
    }

    fn sum_cell_tag(&self, payload_offset: usize, declared: TypeId) -> VmResult<TypeId> {
        let tag = TypeId(self.stack.read_u32_at(payload_offset - 4)?);
        if tag != TypeId::NOTHING {
            self.check_discriminator(declared, tag)?;
        }
        Ok(tag)
    }

    pub fn check_discriminator(&self, declared: TypeId, actual: TypeId) -> VmResult<()> {
        let definition = self
            .variant_defs
            .get(&declared)
            .ok_or(VmError::MissingDiscriminator(declared))?;
        if actual != TypeId::NOTHING && !definition.has_base(actual) {
            return Err(VmError::InvalidDiscriminator(actual));
        }
        Ok(())
    }

    // ---- reference bindings ----

    /// Create the binding target for a named variable: its own storage,
    /// or the already-bound target when the variable is itself a
    /// reference parameter.
    pub fn bind_variable(&self, identifier: StringHandle) -> VmResult<RefTarget> {
        let (activation, variable) = self.resolve_variable(identifier)?;
        let declared = self.declared_type(activation, variable);
        let data = self.activations[activation].data[variable];
        let target = match data {
            VarData::Value { offset } | VarData::SumValue { offset } => RefTarget::Stack {
                offset,
                type_id: declared,
            },
            VarData::Reference { target, .. } => self.bindings[target],
        };
        Ok(target)
    }

    /// Rebind an established binding to a member of the structure it
    /// refers to, chaining through nested records.
    pub fn member_target(&self, base: RefTarget, member: StringHandle) -> VmResult<RefTarget> {
        let (handle, structure_type) = match base {
            RefTarget::Stack { offset, type_id } if type_id.is_structure_like() => (
                StructureHandle(self.stack.read_u32_at(offset)?),
                type_id,
            ),
            RefTarget::Member {
                structure,
                index,
                type_id,
            } if type_id.is_structure_like() => {
                match self.structures.get(structure)?.members[index] {
                    Value::Structure(handle, nested_type) => (handle, nested_type),
                    _ => return Err(VmError::UnboundReference),
                }
            }
            _ => return Err(VmError::UnboundReference),
        };
        let definition = self
            .structure_defs
            .get(&structure_type)
            .ok_or(VmError::UnknownStructureType(structure_type))?;
        let index = definition
            .member_index(member)
            .ok_or(VmError::UnknownMember {
                type_id: structure_type,
                member,
            })?;
        Ok(RefTarget::Member {
            structure: handle,
            index,
            type_id: definition.members[index].1,
        })
    }

    /// Target for a member of a raw structure handle (no prior binding).
    pub fn member_target_by_handle(
        &self,
        handle: StructureHandle,
        member: StringHandle,
    ) -> VmResult<RefTarget> {
        let structure_type = self.structures.get(handle)?.type_id;
        let definition = self
            .structure_defs
            .get(&structure_type)
            .ok_or(VmError::UnknownStructureType(structure_type))?;
        let index = definition
            .member_index(member)
            .ok_or(VmError::UnknownMember {
                type_id: structure_type,
                member,
            })?;
        Ok(RefTarget::Member {
            structure: handle,
            index,
            type_id: definition.members[index].1,
        })
    }

    pub fn push_binding(&mut self, target: RefTarget) -> VmResult<()> {
        let index = self.bindings.len();
        self.bindings.push(target);
        self.stack.push_u32(target.type_id().0)?;
        self.stack.push_u32(index as u32)
    }

    /// Pop a `(target, type)` binding pair off the stack.
    pub fn pop_binding(&mut self) -> VmResult<(usize, TypeId)> {
        let target = self.stack.pop_u32()? as usize;
        let type_id = TypeId(self.stack.pop_u32()?);
        if target >= self.bindings.len() {
            return Err(VmError::UnboundReference);
        }
        Ok((target, type_id))
    }

    pub fn read_ref_target(&self, target: usize) -> VmResult<Value> {
        match *self
            .bindings
            .get(target)
            .ok_or(VmError::UnboundReference)?
        {
            RefTarget::Stack { offset, type_id } => {
                if type_id.family() == TypeFamily::SumType {
                    let tag = self.sum_cell_tag(offset, type_id)?;
                    let size = tag
                        .storage_size()
                        .ok_or(VmError::MissingDiscriminator(type_id))?;
                    Value::from_bytes(tag, self.stack.read_bytes(offset, size)?)
                } else {
                    let size = type_id
                        .storage_size()
                        .ok_or(VmError::TypeMismatch(type_id))?;
                    Value::from_bytes(type_id, self.stack.read_bytes(offset, size)?)
                }
            }
            RefTarget::Member {
                structure, index, ..
            } => Ok(self.structures.get(structure)?.members[index].clone()),
        }
    }

    pub fn write_ref_target(&mut self, target: usize, value: &Value) -> VmResult<()> {
        match *self
            .bindings
            .get(target)
            .ok_or(VmError::UnboundReference)?
        {
            RefTarget::Stack { offset, type_id } => {
                if type_id.family() == TypeFamily::SumType {
                    self.check_discriminator(type_id, value.type_id())?;
                    self.stack.write_u32_at(offset - 4, value.type_id().0)?;
                    self.stack.write_bytes(offset, &value.to_bytes())
                } else {
                    self.stack.write_bytes(offset, &value.to_bytes())
                }
            }
            RefTarget::Member {
                structure, index, ..
            } => {
                self.structures.get_mut(structure)?.members[index] = value.clone();
                Ok(())
            }
        }
    }

    // ---- register ----

    pub fn mark_register_written(&mut self) {
        if let Some(activation) = self.activations.last_mut() {
            activation.register_written = true;
        }
    }

    /// Convention for native functions: the result is pushed directly
    /// and mirrored into the return register for annotation queries.
    pub fn native_return(&mut self, value: Value) -> VmResult<()> {
        value.push_onto(&mut self.stack)?;
        self.register.set(value);
        Ok(())
    }
}

impl Default for ExecutionContext {
    fn default() -> ExecutionContext {
        ExecutionContext::new()
    }
}

thread_local! {
    static CONTEXT_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Marker for the thread's active execution context. Dropping it frees
/// the slot.
pub struct ContextGuard {
    _not_send: PhantomData<*const ()>,
}

/// Claim this thread's context slot. Installing a second context while
/// one is active is fatal; no two threads ever share a context.
pub fn install_thread_context() -> VmResult<ContextGuard> {
    CONTEXT_INSTALLED.with(|slot| {
        if slot.get() {
            return Err(VmError::ContextReplacement);
        }
        slot.set(true);
        Ok(ContextGuard {
            _not_send: PhantomData,
        })
    })
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_INSTALLED.with(|slot| slot.set(false));
    }
}
