use crate::errors::{EmitError, EmitResult};
use crate::ir::{PatternLiteral, PatternSignatureParam, TypeSignatureParam};
use epoch_bytecode::{
    BytecodeWriter, EntityTag, Opcode, ScopeDescription, StringHandle, TypeId,
};
use log::trace;

/// Append-only producer of instruction streams.
///
/// Each method emits one logical operation; the caller is responsible
/// for sequencing them into a legal execution under the framing rules
/// (every entity closed, functions ending in `Return`, resolvers in
/// `Halt`). The code-generation pass is the only intended caller.
#[derive(Debug, Default)]
pub struct BytecodeEmitter {
    writer: BytecodeWriter,
}

impl BytecodeEmitter {
    pub fn new() -> BytecodeEmitter {
        BytecodeEmitter::default()
    }

    pub fn into_stream(self) -> Vec<u8> {
        self.writer.into_bytes()
    }

    pub fn stream_len(&self) -> usize {
        self.writer.len()
    }

    fn op(&mut self, opcode: Opcode) {
        trace!("emit {} @{:#010X}", opcode.mnemonic(), self.writer.len());
        self.writer.emit_opcode(opcode);
    }

    // ---- functions ----

    /// Functions are a specific kind of entity: entity start, function
    /// tag, then the handle of the function's identifier.
    pub fn enter_function(&mut self, name: StringHandle) {
        self.op(Opcode::BeginEntity);
        self.writer.emit_entity_tag(EntityTag::FUNCTION);
        self.writer.emit_handle(name);
    }

    /// Functions always exit through `Return` so control flow finds its
    /// way back to the caller; the entity terminator after it is
    /// book-keeping for the serializer and the loader.
    pub fn exit_function(&mut self) {
        self.op(Opcode::Return);
        self.op(Opcode::EndEntity);
    }

    /// Copy a named variable into the return-value register. The VM
    /// pushes the register onto the caller's stack when the function
    /// exits; callers that ignore the value must pop it themselves.
    pub fn set_return_register(&mut self, variable: StringHandle) {
        self.op(Opcode::SetRetVal);
        self.writer.emit_handle(variable);
    }

    // ---- stack ----

    pub fn push_integer_literal(&mut self, value: i32) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::INTEGER);
        self.writer.emit_i32(value);
    }

    /// The 16-bit form accepts a 32-bit input so narrowing is explicit
    /// and overflow is a compile-time error, never a silent truncation.
    pub fn push_integer16_literal(&mut self, value: i32) -> EmitResult<()> {
        let narrow = i16::try_from(value).map_err(|_| EmitError::Integer16Overflow(value))?;
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::INTEGER16);
        self.writer.emit_i16(narrow);
        Ok(())
    }

    pub fn push_string_literal(&mut self, handle: StringHandle) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::STRING);
        self.writer.emit_handle(handle);
    }

    pub fn push_boolean_literal(&mut self, value: bool) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::BOOLEAN);
        self.writer.emit_bool(value);
    }

    pub fn push_real_literal(&mut self, value: f32) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::REAL);
        self.writer.emit_real(value);
    }

    /// Push a function name for first-class/indirect use.
    pub fn push_function_name(&mut self, name: StringHandle) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::FUNCTION);
        self.writer.emit_handle(name);
    }

    /// Push a type annotation as an integer immediate (used for sum-type
    /// construction and annotated assignment).
    pub fn push_type_annotation(&mut self, type_id: TypeId) {
        self.op(Opcode::Push);
        self.writer.emit_type_id(TypeId::INTEGER);
        self.writer.emit_u32(type_id.0);
    }

    /// Read a variable's value onto the stack, then apply the value-copy
    /// rule its type demands: buffers and structures are handle-backed
    /// resources, so the handle is cloned to preserve value semantics.
    pub fn push_variable_value(&mut self, variable: StringHandle, type_id: TypeId) {
        self.op(Opcode::Read);
        self.writer.emit_handle(variable);
        if type_id == TypeId::BUFFER {
            self.copy_buffer();
        } else if type_id.is_structure_like() {
            self.copy_structure();
        }
    }

    /// Read a variable without the deep-copy step, exposing the raw
    /// handle (constructors and member-chain walks want this).
    pub fn push_variable_value_no_copy(&mut self, variable: StringHandle) {
        self.op(Opcode::Read);
        self.writer.emit_handle(variable);
    }

    pub fn pop_stack(&mut self, type_id: TypeId) {
        self.op(Opcode::Pop);
        self.writer.emit_type_id(type_id);
    }

    // ---- references ----

    /// Bind a reference to a named variable: the identifier is pushed,
    /// then `BindRef` replaces it with the (storage, type) binding.
    pub fn bind_reference(&mut self, variable: StringHandle) {
        self.push_string_literal(variable);
        self.op(Opcode::BindRef);
    }

    /// Bind a reference when the referred identifier is already on the
    /// stack.
    pub fn bind_reference_indirect(&mut self) {
        self.op(Opcode::BindRef);
    }

    /// Rebind the current binding to a member of the bound structure.
    /// Chains, so nested structures cost one instruction per level.
    pub fn bind_structure_reference(&mut self, member: StringHandle) {
        self.op(Opcode::BindMemberRef);
        self.writer.emit_handle(member);
    }

    pub fn bind_structure_reference_by_handle(&mut self, member: StringHandle) {
        self.op(Opcode::BindMemberByHandle);
        self.writer.emit_handle(member);
    }

    /// Consume the top of stack into the storage a prior binding chain
    /// established. The op itself carries no metadata.
    pub fn assign_variable(&mut self) {
        self.op(Opcode::Assign);
    }

    /// Assign into a variable named by an identifier on the stack rather
    /// than an established binding (newly constructed variables, closure
    /// uplinks).
    pub fn assign_variable_through_identifier(&mut self) {
        self.op(Opcode::AssignThroughIdentifier);
    }

    /// Assign into sum-typed storage; the stack carries the actual-type
    /// annotation above the payload.
    pub fn assign_sum_type_variable(&mut self) {
        self.op(Opcode::AssignSumType);
    }

    /// Copy a referenced value back onto the stack; used for chained
    /// assignments like `a = b = c`.
    pub fn read_reference_onto_stack(&mut self) {
        self.op(Opcode::ReadRef);
    }

    // ---- control ----

    pub fn invoke(&mut self, function: StringHandle) {
        self.op(Opcode::Invoke);
        self.writer.emit_handle(function);
    }

    pub fn invoke_indirect(&mut self, variable: StringHandle) {
        self.op(Opcode::InvokeIndirect);
        self.writer.emit_handle(variable);
    }

    pub fn halt(&mut self) {
        self.op(Opcode::Halt);
    }

    // ---- entities and scopes ----

    pub fn enter_entity(&mut self, tag: EntityTag, name: StringHandle) {
        self.op(Opcode::BeginEntity);
        self.writer.emit_entity_tag(tag);
        self.writer.emit_handle(name);
    }

    pub fn exit_entity(&mut self) {
        self.op(Opcode::EndEntity);
    }

    pub fn begin_chain(&mut self) {
        self.op(Opcode::BeginChain);
    }

    pub fn end_chain(&mut self) {
        self.op(Opcode::EndChain);
    }

    /// Run an entity's meta-control independently of entering it, as
    /// do-while loops do at the bottom of the body.
    pub fn invoke_metacontrol(&mut self, tag: EntityTag) {
        self.op(Opcode::InvokeMeta);
        self.writer.emit_entity_tag(tag);
    }

    pub fn define_lexical_scope(&mut self, scope: &ScopeDescription) {
        self.op(Opcode::DefineLexicalScope);
        self.writer.emit_handle(scope.name);
        self.writer.emit_handle(scope.parent);
        self.writer.emit_u32(scope.variables.len() as u32);
        for variable in &scope.variables {
            self.writer.emit_handle(variable.identifier);
            self.writer.emit_type_id(variable.type_id);
            self.writer.emit_byte(variable.origin as u8);
            self.writer.emit_bool(variable.is_reference);
        }
    }

    // ---- pattern matching ----

    pub fn enter_pattern_resolver(&mut self, name: StringHandle) {
        self.op(Opcode::BeginEntity);
        self.writer.emit_entity_tag(EntityTag::PATTERN_MATCHING_RESOLVER);
        self.writer.emit_handle(name);
    }

    /// TODO: emit a catchable runtime exception instead of halting when
    /// every pattern fails (needs VM-side error plumbing first).
    pub fn exit_pattern_resolver(&mut self) {
        self.halt();
        self.op(Opcode::EndEntity);
    }

    pub fn resolve_pattern(
        &mut self,
        target: StringHandle,
        params: &[PatternSignatureParam],
    ) -> EmitResult<()> {
        self.op(Opcode::PatternMatch);
        self.writer.emit_handle(target);
        self.writer.emit_u32(params.len() as u32);
        for param in params {
            self.writer.emit_type_id(param.type_id);
            match &param.literal {
                Some(PatternLiteral::Integer(value)) => {
                    self.writer.emit_bool(true);
                    self.writer.emit_i32(*value);
                }
                Some(_) => return Err(EmitError::UnsupportedPatternLiteral),
                None => self.writer.emit_bool(false),
            }
        }
        Ok(())
    }

    // ---- type resolution ----

    pub fn enter_type_resolver(&mut self, name: StringHandle) {
        self.op(Opcode::BeginEntity);
        self.writer.emit_entity_tag(EntityTag::TYPE_RESOLVER);
        self.writer.emit_handle(name);
    }

    pub fn exit_type_resolver(&mut self) {
        self.halt();
        self.op(Opcode::EndEntity);
    }

    pub fn resolve_types(&mut self, target: StringHandle, params: &[TypeSignatureParam]) {
        self.op(Opcode::TypeMatch);
        self.writer.emit_handle(target);
        self.writer.emit_u32(params.len() as u32);
        for param in params {
            self.writer.emit_bool(param.is_reference);
            self.writer.emit_type_id(param.type_id);
        }
    }

    // ---- structures ----

    pub fn allocate_structure(&mut self, type_id: TypeId) {
        self.op(Opcode::AllocStructure);
        self.writer.emit_type_id(type_id);
    }

    pub fn define_structure(&mut self, type_id: TypeId, members: &[(StringHandle, TypeId)]) {
        self.op(Opcode::DefineStructure);
        self.writer.emit_type_id(type_id);
        self.writer.emit_u32(members.len() as u32);
        for (member, member_type) in members {
            self.writer.emit_handle(*member);
            self.writer.emit_type_id(*member_type);
        }
    }

    /// Copy a named member of a structure variable into the return
    /// register; the body of every member accessor.
    pub fn copy_from_structure(&mut self, variable: StringHandle, member: StringHandle) {
        self.op(Opcode::CopyFromStructure);
        self.writer.emit_handle(variable);
        self.writer.emit_handle(member);
    }

    /// Copy the top of stack into a named member of a structure
    /// variable on the freestore.
    pub fn copy_to_structure(&mut self, variable: StringHandle, member: StringHandle) {
        self.op(Opcode::CopyToStructure);
        self.writer.emit_handle(variable);
        self.writer.emit_handle(member);
    }

    /// Deep copy; expects the source handle on the stack and leaves the
    /// clone's handle in its place.
    pub fn copy_structure(&mut self) {
        self.op(Opcode::CopyStructure);
    }

    /// Clone a buffer; same stack discipline as `copy_structure`.
    pub fn copy_buffer(&mut self) {
        self.op(Opcode::CopyBuffer);
    }

    // ---- sum types ----

    pub fn define_sum_type(&mut self, type_id: TypeId, bases: &[TypeId]) {
        self.op(Opcode::SumTypeDef);
        self.writer.emit_type_id(type_id);
        self.writer.emit_u32(bases.len() as u32);
        for base in bases {
            self.writer.emit_type_id(*base);
        }
    }

    pub fn construct_sum_type(&mut self) {
        self.op(Opcode::ConstructSumType);
    }

    /// Push the type annotation of the value in the return register.
    pub fn type_annotation_from_register(&mut self) {
        self.op(Opcode::TypeFromRegister);
    }

    // ---- pool / meta ----

    /// Static strings are pooled at the top of every program so the VM
    /// can cache literals and identifiers before any code runs.
    pub fn pool_string(&mut self, handle: StringHandle, value: &str) {
        self.op(Opcode::PoolString);
        self.writer.emit_handle(handle);
        self.writer.emit_wide_string(value);
    }

    pub fn tag_data(&mut self, entity: StringHandle, key: &str, items: &[String]) {
        self.op(Opcode::Tag);
        self.writer.emit_handle(entity);
        self.writer.emit_u32(items.len() as u32);
        self.writer.emit_wide_string(key);
        for item in items {
            self.writer.emit_wide_string(item);
        }
    }
}
