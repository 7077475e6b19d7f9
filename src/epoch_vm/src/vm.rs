use crate::context::ExecutionContext;
use crate::dispatch;
use crate::error::{VmError, VmResult};
use crate::gc;
use crate::intrinsics::{BeginAction, EndAction};
use crate::marshaling;
use crate::program::LoadedProgram;
use crate::scope;
use crate::structures::{self, StructureDefinition};
use crate::value::Value;
use crate::variants::VariantDefinition;
use epoch_bytecode::{
    BytecodeReader, EntityTag, Instruction, PushValue, StringHandle, StructureHandle, TypeFamily,
    TypeId,
};
use log::{debug, trace};
use std::rc::Rc;

const SENTINEL_RETURN: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Function(StringHandle),
    Resolver(StringHandle),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    return_ip: usize,
    kind: FrameKind,
}

#[derive(Debug, Clone, Copy)]
struct ChainRecord {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
struct EntityRecord {
    tag: EntityTag,
    activated: bool,
    /// Set when an explicit `InvokeMeta` already ran this entity's
    /// meta-control, as bottom-tested loops do; the `EndEntity` then
    /// proceeds without invoking it a second time.
    meta_invoked: bool,
}

/// The instruction-stream interpreter. Stateless apart from the loaded
/// program; all mutable execution state lives in the
/// [`ExecutionContext`] passed to each run.
#[derive(Debug)]
pub struct Vm {
    pub program: LoadedProgram,
}

impl Vm {
    pub fn new(program: LoadedProgram) -> Vm {
        Vm { program }
    }

    /// Execute the stream from the top: metadata instructions populate
    /// the context tables, global blocks open, and the entrypoint
    /// invocation runs the program until `Halt`.
    pub fn run(&self, context: &mut ExecutionContext) -> VmResult<()> {
        self.execute(context, 0, Vec::new())
    }

    /// Invoke a single function by name with its arguments already on
    /// the context's stack; returns when that function does. This is
    /// the re-entry path callback thunks use.
    pub fn run_function(&self, context: &mut ExecutionContext, name: StringHandle) -> VmResult<()> {
        match self.program.invocable(name) {
            Some(begin) => {
                let span = *self.program.entity_at(begin).ok_or(VmError::ChainCorrupt)?;
                let kind = if span.tag == EntityTag::FUNCTION {
                    FrameKind::Function(name)
                } else {
                    FrameKind::Resolver(name)
                };
                let frames = vec![Frame {
                    return_ip: SENTINEL_RETURN,
                    kind,
                }];
                self.execute(context, begin, frames)
            }
            None => {
                let native_name = context.strings.get(name)?.to_string();
                let native = context
                    .natives
                    .lookup(&native_name)
                    .ok_or(VmError::UnknownFunction(name))?;
                native(context)
            }
        }
    }

    /// Re-enter the runtime from a foreign callback thunk: unmarshal
    /// the raw argument words against the target's scope descriptor,
    /// invoke it, and marshal the return register back out.
    pub fn invoke_callback(
        &self,
        context: &mut ExecutionContext,
        thunk_address: usize,
        raw_args: &[u64],
    ) -> VmResult<u64> {
        let target = marshaling::thunk_target(context, thunk_address)
            .ok_or(VmError::UnboundReference)?;
        let descriptor = context
            .scopes
            .get(&target)
            .ok_or(VmError::UnknownScope(target))?
            .clone();
        let stack_before = context.stack.used();
        let mut raw = raw_args.iter();
        for variable in descriptor.variables.iter() {
            if variable.origin != epoch_bytecode::VariableOrigin::Parameter {
                continue;
            }
            let word = *raw.next().ok_or(VmError::TypeMismatch(variable.type_id))?;
            let value = match variable.type_id {
                TypeId::INTEGER => Value::Integer(word as u32 as i32),
                TypeId::INTEGER16 => Value::Integer16(word as u16 as i16),
                TypeId::BOOLEAN => Value::Boolean(word != 0),
                TypeId::REAL => Value::Real(f32::from_bits(word as u32)),
                TypeId::STRING => {
                    let text = if word == 0 {
                        String::new()
                    } else {
                        unsafe { marshaling::read_foreign_wide(word as usize) }
                    };
                    Value::Str(context.strings.pool(&text))
                }
                other => return Err(VmError::UnsupportedMarshalingType(other)),
            };
            value.push_onto(&mut context.stack)?;
        }
        self.run_function(context, target)?;
        // The return register was pushed for a caller that does not
        // exist on this path; take the leftover bytes back off.
        let leftover = context.stack.used().saturating_sub(stack_before);
        context.stack.pop(leftover)?;
        let result = match &context.register.value {
            Value::Integer(v) => *v as u32 as u64,
            Value::Integer16(v) => *v as u16 as u64,
            Value::Boolean(v) => u64::from(*v),
            Value::Real(v) => v.to_bits() as u64,
            Value::Str(handle) => marshaling::wide_string_ptr(context, *handle)? as u64,
            Value::Nothing => 0,
            other => return Err(VmError::UnsupportedMarshalingType(other.type_id())),
        };
        Ok(result)
    }

    fn execute(
        &self,
        context: &mut ExecutionContext,
        entry: usize,
        mut frames: Vec<Frame>,
    ) -> VmResult<()> {
        let initial_depth = frames.len();
        let mut ip = entry;
        let mut chains: Vec<ChainRecord> = Vec::new();
        let mut entity_stack: Vec<EntityRecord> = Vec::new();

        loop {
            if ip >= self.program.bytes.len() {
                return Ok(());
            }
            let mut reader = BytecodeReader::new(&self.program.bytes);
            reader.set_offset(ip);
            let offset = ip;
            let instruction = reader.read_instruction()?;
            ip = reader.offset();
            trace!("@{:#010X} {:?}", offset, instruction.opcode());

            match instruction {
                // -- metadata, idempotent on re-execution --
                Instruction::PoolString { handle, value } => {
                    context.strings.pool_at(handle, &value)?;
                }
                Instruction::DefineStructure { type_id, members } => {
                    context
                        .structure_defs
                        .insert(type_id, StructureDefinition { type_id, members });
                }
                Instruction::SumTypeDef { type_id, bases } => {
                    context
                        .variant_defs
                        .insert(type_id, VariantDefinition::from_bases(&bases)?);
                }
                Instruction::DefineLexicalScope { scope } => {
                    context.scopes.insert(scope.name, Rc::new(scope));
                }
                Instruction::Tag { entity, key, items } => {
                    marshaling::apply_tag(context, entity, &key, &items)?;
                }

                // -- framing --
                Instruction::BeginEntity { tag, name } => {
                    let span = *self
                        .program
                        .entity_at(offset)
                        .ok_or(VmError::ChainCorrupt)?;
                    if tag.is_custom() {
                        let control = context
                            .meta
                            .lookup(tag)
                            .ok_or(VmError::UnknownEntityTag(tag.0))?;
                        match (control.on_begin)(context)? {
                            BeginAction::Skip => {
                                ip = span.after_end;
                                continue;
                            }
                            BeginAction::Execute => {
                                self.activate_entity(context, name)?;
                                entity_stack.push(EntityRecord {
                                    tag,
                                    activated: true,
                                    meta_invoked: false,
                                });
                            }
                        }
                    } else if tag == EntityTag::PATTERN_MATCHING_RESOLVER
                        || tag == EntityTag::TYPE_RESOLVER
                    {
                        // Resolvers carry no scope; they come and go
                        // from the call stack transparently.
                        entity_stack.push(EntityRecord {
                            tag,
                            activated: false,
                            meta_invoked: false,
                        });
                    } else {
                        self.activate_entity(context, name)?;
                        entity_stack.push(EntityRecord {
                            tag,
                            activated: true,
                            meta_invoked: false,
                        });
                    }
                }
                Instruction::EndEntity => {
                    let record = entity_stack.pop().ok_or(VmError::ChainCorrupt)?;
                    // Meta-control runs before the activation pops so a
                    // handler can consume values the body left on the
                    // stack. An `InvokeMeta` earlier in the body already
                    // decided this entity's fate; don't ask twice.
                    let action = if record.tag.is_custom() && record.meta_invoked {
                        Some(EndAction::Proceed)
                    } else if record.tag.is_custom() {
                        let control = context
                            .meta
                            .lookup(record.tag)
                            .ok_or(VmError::UnknownEntityTag(record.tag.0))?;
                        Some((control.on_end)(context)?)
                    } else {
                        None
                    };
                    if record.activated {
                        pop_activation(context, false)?;
                    }
                    if context.gc_enabled {
                        gc::collect(context)?;
                    }
                    if let (Some(action), Some(chain)) = (action, chains.last()) {
                        match action {
                            EndAction::RepeatChain => ip = chain.start,
                            EndAction::Proceed => ip = chain.end,
                        }
                    }
                }
                Instruction::BeginChain => {
                    let span = self
                        .program
                        .chains
                        .get(&offset)
                        .ok_or(VmError::ChainCorrupt)?;
                    chains.push(ChainRecord {
                        start: span.start,
                        end: span.end,
                    });
                }
                Instruction::EndChain => {
                    chains.pop().ok_or(VmError::ChainCorrupt)?;
                }
                Instruction::InvokeMeta { tag } => {
                    let control = context
                        .meta
                        .lookup(tag)
                        .ok_or(VmError::UnknownEntityTag(tag.0))?;
                    match (control.on_end)(context)? {
                        EndAction::RepeatChain => {
                            // A repeat unwinds the current entity before
                            // the chain restarts.
                            let record = entity_stack.pop().ok_or(VmError::ChainCorrupt)?;
                            if record.activated {
                                pop_activation(context, false)?;
                            }
                            ip = chains.last().ok_or(VmError::ChainCorrupt)?.start;
                        }
                        EndAction::Proceed => {
                            let record =
                                entity_stack.last_mut().ok_or(VmError::ChainCorrupt)?;
                            record.meta_invoked = true;
                        }
                    }
                }

                // -- stack --
                Instruction::Push { value, .. } => {
                    push_immediate(context, &value)?;
                }
                Instruction::Pop { type_id } => {
                    if type_id.family() == TypeFamily::SumType {
                        let tag = TypeId(context.stack.pop_u32()?);
                        let size = tag
                            .storage_size()
                            .ok_or(VmError::MissingDiscriminator(type_id))?;
                        context.stack.pop(size)?;
                    } else {
                        let size = type_id
                            .storage_size()
                            .ok_or(VmError::TypeMismatch(type_id))?;
                        context.stack.pop(size)?;
                    }
                }

                // -- variables --
                Instruction::Read { variable } => context.push_variable(variable)?,
                Instruction::ReadRef => {
                    let (target, type_id) = context.pop_binding()?;
                    let value = context.read_ref_target(target)?;
                    value.push_onto(&mut context.stack)?;
                    if type_id.family() == TypeFamily::SumType {
                        context.stack.push_u32(value.type_id().0)?;
                    }
                }
                Instruction::Assign => {
                    let (target, type_id) = context.pop_binding()?;
                    if type_id.family() == TypeFamily::SumType {
                        return Err(VmError::MissingDiscriminator(type_id));
                    }
                    let value = Value::pop_from(&mut context.stack, type_id)?;
                    context.write_ref_target(target, &value)?;
                }
                Instruction::AssignSumType => {
                    let (target, declared) = context.pop_binding()?;
                    let actual = TypeId(context.stack.pop_u32()?);
                    let value = Value::pop_from(&mut context.stack, actual)?;
                    if declared.family() == TypeFamily::SumType {
                        context.check_discriminator(declared, actual)?;
                    }
                    context.write_ref_target(target, &value)?;
                }
                Instruction::AssignThroughIdentifier => {
                    let identifier = StringHandle(context.stack.pop_u32()?);
                    let (activation, variable) = context.resolve_variable(identifier)?;
                    let declared = context.declared_type(activation, variable);
                    if declared.family() == TypeFamily::SumType {
                        let actual = TypeId(context.stack.pop_u32()?);
                        let size = actual
                            .storage_size()
                            .ok_or(VmError::MissingDiscriminator(declared))?;
                        let payload = context.stack.pop_bytes(size)?;
                        context.write_sum_variable(identifier, actual, &payload)?;
                    } else {
                        let size = declared
                            .storage_size()
                            .ok_or(VmError::TypeMismatch(declared))?;
                        let bytes = context.stack.pop_bytes(size)?;
                        context.write_variable(identifier, &bytes)?;
                    }
                }
                Instruction::BindRef => {
                    let identifier = StringHandle(context.stack.pop_u32()?);
                    let target = context.bind_variable(identifier)?;
                    context.push_binding(target)?;
                }
                Instruction::BindMemberRef { member } => {
                    let (target, _) = context.pop_binding()?;
                    let base = context.bindings[target];
                    let next = context.member_target(base, member)?;
                    context.push_binding(next)?;
                }
                Instruction::BindMemberByHandle { member } => {
                    let handle = StructureHandle(context.stack.pop_u32()?);
                    let next = context.member_target_by_handle(handle, member)?;
                    context.push_binding(next)?;
                }

                // -- control --
                Instruction::Invoke { function } => {
                    if let Some(target_ip) = self.dispatch_invoke(context, function, &mut frames, ip)? {
                        ip = target_ip;
                    }
                }
                Instruction::InvokeIndirect { variable } => {
                    let (value, _) = context.read_variable(variable)?;
                    let function = match value {
                        Value::FunctionName(handle)
                        | Value::Str(handle)
                        | Value::Identifier(handle) => handle,
                        other => return Err(VmError::TypeMismatch(other.type_id())),
                    };
                    if let Some(target_ip) = self.dispatch_invoke(context, function, &mut frames, ip)? {
                        ip = target_ip;
                    }
                }
                Instruction::Return => {
                    let frame = frames.pop().ok_or(VmError::ChainCorrupt)?;
                    let record = entity_stack.pop().ok_or(VmError::ChainCorrupt)?;
                    if record.activated {
                        pop_activation(context, true)?;
                    }
                    if frame.return_ip == SENTINEL_RETURN {
                        return Ok(());
                    }
                    ip = frame.return_ip;
                    if frames.len() < initial_depth {
                        return Ok(());
                    }
                }
                Instruction::SetRetVal { variable } => {
                    let (value, is_sum) = context.read_variable(variable)?;
                    if is_sum {
                        context.register.set_sum(value);
                    } else {
                        context.register.set(value);
                    }
                    context.mark_register_written();
                }
                Instruction::Halt => {
                    if let Some(Frame {
                        kind: FrameKind::Resolver(resolver),
                        ..
                    }) = frames.last()
                    {
                        return Err(VmError::DispatchFailed {
                            resolver: *resolver,
                        });
                    }
                    debug!("halt at @{:#010X}", offset);
                    return Ok(());
                }

                // -- structures --
                Instruction::AllocStructure { type_id } => {
                    let definition = context
                        .structure_defs
                        .get(&type_id)
                        .ok_or(VmError::UnknownStructureType(type_id))?
                        .clone();
                    let handle = context.structures.allocate(&definition);
                    context.stack.push_u32(handle.0)?;
                }
                Instruction::CopyFromStructure { variable, member } => {
                    self.copy_from_structure(context, variable, member)?;
                }
                Instruction::CopyToStructure { variable, member } => {
                    self.copy_to_structure(context, variable, member)?;
                }
                Instruction::CopyStructure => {
                    let handle = StructureHandle(context.stack.pop_u32()?);
                    let clone =
                        structures::deep_copy(&mut context.structures, &mut context.buffers, handle)?;
                    context.stack.push_u32(clone.0)?;
                }
                Instruction::CopyBuffer => {
                    let handle = epoch_bytecode::BufferHandle(context.stack.pop_u32()?);
                    let clone = context.buffers.clone_buffer(handle)?;
                    context.stack.push_u32(clone.0)?;
                }

                // -- sum types --
                Instruction::ConstructSumType => {
                    let identifier = StringHandle(context.stack.pop_u32()?);
                    let actual = TypeId(context.stack.pop_u32()?);
                    let size = actual
                        .storage_size()
                        .ok_or(VmError::MissingDiscriminator(actual))?;
                    let payload = context.stack.pop_bytes(size)?;
                    context.write_sum_variable(identifier, actual, &payload)?;
                }
                Instruction::TypeFromRegister => {
                    context.stack.push_u32(context.register.value.type_id().0)?;
                }

                // -- dispatch --
                Instruction::PatternMatch { target, params } => {
                    if dispatch::pattern_match(context, &params)? {
                        debug!("pattern matched, transferring to {}", target);
                        entity_stack.pop().ok_or(VmError::ChainCorrupt)?;
                        self.transfer_to(target, &mut frames)?;
                        ip = self
                            .program
                            .invocable(target)
                            .ok_or(VmError::UnknownFunction(target))?;
                    }
                }
                Instruction::TypeMatch { target, params } => {
                    if dispatch::type_match(context, &params)? {
                        debug!("types matched, transferring to {}", target);
                        entity_stack.pop().ok_or(VmError::ChainCorrupt)?;
                        self.transfer_to(target, &mut frames)?;
                        ip = self
                            .program
                            .invocable(target)
                            .ok_or(VmError::UnknownFunction(target))?;
                    }
                }
            }
        }
    }

    fn activate_entity(&self, context: &mut ExecutionContext, name: StringHandle) -> VmResult<()> {
        let descriptor = context
            .scopes
            .get(&name)
            .ok_or(VmError::UnknownScope(name))?
            .clone();
        let parent = if descriptor.parent.is_null() {
            None
        } else {
            context
                .activations
                .iter()
                .rposition(|activation| activation.scope.name == descriptor.parent)
        };
        let binding_mark = context.bindings.len();
        let activation = scope::activate(
            descriptor,
            parent,
            &mut context.stack,
            &context.variant_defs,
            binding_mark,
        )?;
        context.activations.push(activation);
        Ok(())
    }

    /// Resolve an invocation: a bytecode entity wins, then a registered
    /// native; anything else is fatal. Returns the new instruction
    /// pointer for bytecode targets.
    fn dispatch_invoke(
        &self,
        context: &mut ExecutionContext,
        function: StringHandle,
        frames: &mut Vec<Frame>,
        return_ip: usize,
    ) -> VmResult<Option<usize>> {
        if let Some(begin) = self.program.invocable(function) {
            let span = self.program.entity_at(begin).ok_or(VmError::ChainCorrupt)?;
            let kind = if span.tag == EntityTag::FUNCTION {
                FrameKind::Function(function)
            } else {
                FrameKind::Resolver(function)
            };
            frames.push(Frame {
                return_ip,
                kind,
            });
            return Ok(Some(begin));
        }
        let name = context.strings.get(function)?.to_string();
        let native = context
            .natives
            .lookup(&name)
            .ok_or(VmError::UnknownFunction(function))?;
        native(context)?;
        Ok(None)
    }

    /// Tail-transfer out of a resolver: the resolver's frame becomes
    /// the target's, so the target returns straight to the original
    /// caller.
    fn transfer_to(&self, target: StringHandle, frames: &mut [Frame]) -> VmResult<()> {
        let frame = frames.last_mut().ok_or(VmError::ChainCorrupt)?;
        frame.kind = FrameKind::Function(target);
        Ok(())
    }

    fn copy_from_structure(
        &self,
        context: &mut ExecutionContext,
        variable: StringHandle,
        member_variable: StringHandle,
    ) -> VmResult<()> {
        let (structure_value, _) = context.read_variable(variable)?;
        let (handle, structure_type) = match structure_value {
            Value::Structure(handle, type_id) => (handle, type_id),
            other => return Err(VmError::TypeMismatch(other.type_id())),
        };
        let (member_value, _) = context.read_variable(member_variable)?;
        let member_name = match member_value {
            Value::Identifier(handle) | Value::Str(handle) => handle,
            other => return Err(VmError::TypeMismatch(other.type_id())),
        };
        let definition = context
            .structure_defs
            .get(&structure_type)
            .ok_or(VmError::UnknownStructureType(structure_type))?;
        let index = definition
            .member_index(member_name)
            .ok_or(VmError::UnknownMember {
                type_id: structure_type,
                member: member_name,
            })?;
        let member_type = definition.members[index].1;
        let value = context.structures.get(handle)?.members[index].clone();
        if member_type.family() == TypeFamily::SumType {
            context.register.set_sum(value);
        } else {
            context.register.set(value);
        }
        context.mark_register_written();
        Ok(())
    }

    fn copy_to_structure(
        &self,
        context: &mut ExecutionContext,
        variable: StringHandle,
        member: StringHandle,
    ) -> VmResult<()> {
        let (structure_value, _) = context.read_variable(variable)?;
        let (handle, structure_type) = match structure_value {
            Value::Structure(handle, type_id) => (handle, type_id),
            other => return Err(VmError::TypeMismatch(other.type_id())),
        };
        let definition = context
            .structure_defs
            .get(&structure_type)
            .ok_or(VmError::UnknownStructureType(structure_type))?;
        let index = definition
            .member_index(member)
            .ok_or(VmError::UnknownMember {
                type_id: structure_type,
                member,
            })?;
        let member_type = definition.members[index].1;
        let value = if member_type.family() == TypeFamily::SumType {
            let actual = TypeId(context.stack.pop_u32()?);
            context.check_discriminator(member_type, actual)?;
            Value::pop_from(&mut context.stack, actual)?
        } else {
            Value::pop_from(&mut context.stack, member_type)?
        };
        context.structures.get_mut(handle)?.members[index] = value;
        Ok(())
    }
}

fn push_immediate(context: &mut ExecutionContext, value: &PushValue) -> VmResult<()> {
    match value {
        PushValue::Integer(v) => context.stack.push_bytes(&v.to_le_bytes()),
        PushValue::Integer16(v) => context.stack.push_bytes(&v.to_le_bytes()),
        PushValue::Real(v) => context.stack.push_bytes(&v.to_bits().to_le_bytes()),
        PushValue::Boolean(v) => context.stack.push_bool(*v),
        PushValue::Handle(v) => context.stack.push_u32(*v),
        PushValue::Nothing => context.stack.push(0),
    }
}

/// Pop the innermost activation: restore the stack to its pre-call
/// level minus the consumed parameters, drop transient bindings, and
/// (on function return paths) push the return register for the caller.
fn pop_activation(context: &mut ExecutionContext, push_register: bool) -> VmResult<()> {
    let activation = context.activations.pop().ok_or(VmError::ChainCorrupt)?;
    context.stack.set_top(activation.exit_top())?;
    context.bindings.truncate(activation.binding_mark);
    if push_register && activation.register_written {
        context.register.push_onto(&mut context.stack)?;
    }
    Ok(())
}
