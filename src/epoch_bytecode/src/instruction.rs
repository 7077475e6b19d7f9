use crate::entity::EntityTag;
use crate::error::{Result, StreamError};
use crate::handles::StringHandle;
use crate::opcode::Opcode;
use crate::scope::ScopeDescription;
use crate::type_id::TypeId;
use crate::writer::BytecodeWriter;

/// An immediate operand of `Push`, or an embedded pattern literal. The
/// byte-length of the encoded value always equals the storage size of
/// the accompanying type annotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushValue {
    Integer(i32),
    Integer16(i16),
    Real(f32),
    Boolean(bool),
    /// String, buffer, function, identifier, or structure handles all
    /// travel as raw 32-bit values.
    Handle(u32),
    Nothing,
}

impl PushValue {
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        match *self {
            PushValue::Integer(v) => writer.emit_i32(v),
            PushValue::Integer16(v) => writer.emit_i16(v),
            PushValue::Real(v) => writer.emit_real(v),
            PushValue::Boolean(v) => writer.emit_bool(v),
            PushValue::Handle(v) => writer.emit_u32(v),
            PushValue::Nothing => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternParam {
    pub type_id: TypeId,
    /// `Some` when the parameter is pattern-matched against a literal.
    pub literal: Option<PushValue>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeMatchParam {
    pub is_reference: bool,
    pub type_id: TypeId,
}

/// One fully decoded instruction, arguments included. The stream form of
/// every variant is fixed by the wire contract; `encode` reproduces it
/// byte-exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    BeginEntity { tag: EntityTag, name: StringHandle },
    EndEntity,
    BeginChain,
    EndChain,
    InvokeMeta { tag: EntityTag },
    DefineLexicalScope { scope: ScopeDescription },

    Push { type_id: TypeId, value: PushValue },
    Pop { type_id: TypeId },

    Read { variable: StringHandle },
    ReadRef,
    Assign,
    AssignThroughIdentifier,
    AssignSumType,
    BindRef,
    BindMemberRef { member: StringHandle },
    BindMemberByHandle { member: StringHandle },

    Invoke { function: StringHandle },
    InvokeIndirect { variable: StringHandle },
    Return,
    SetRetVal { variable: StringHandle },
    Halt,

    DefineStructure { type_id: TypeId, members: Vec<(StringHandle, TypeId)> },
    AllocStructure { type_id: TypeId },
    CopyFromStructure { variable: StringHandle, member: StringHandle },
    CopyToStructure { variable: StringHandle, member: StringHandle },
    CopyStructure,
    CopyBuffer,

    SumTypeDef { type_id: TypeId, bases: Vec<TypeId> },
    ConstructSumType,
    TypeFromRegister,

    PatternMatch { target: StringHandle, params: Vec<PatternParam> },
    TypeMatch { target: StringHandle, params: Vec<TypeMatchParam> },

    PoolString { handle: StringHandle, value: String },
    Tag { entity: StringHandle, key: String, items: Vec<String> },
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::BeginEntity { .. } => Opcode::BeginEntity,
            Instruction::EndEntity => Opcode::EndEntity,
            Instruction::BeginChain => Opcode::BeginChain,
            Instruction::EndChain => Opcode::EndChain,
            Instruction::InvokeMeta { .. } => Opcode::InvokeMeta,
            Instruction::DefineLexicalScope { .. } => Opcode::DefineLexicalScope,
            Instruction::Push { .. } => Opcode::Push,
            Instruction::Pop { .. } => Opcode::Pop,
            Instruction::Read { .. } => Opcode::Read,
            Instruction::ReadRef => Opcode::ReadRef,
            Instruction::Assign => Opcode::Assign,
            Instruction::AssignThroughIdentifier => Opcode::AssignThroughIdentifier,
            Instruction::AssignSumType => Opcode::AssignSumType,
            Instruction::BindRef => Opcode::BindRef,
            Instruction::BindMemberRef { .. } => Opcode::BindMemberRef,
            Instruction::BindMemberByHandle { .. } => Opcode::BindMemberByHandle,
            Instruction::Invoke { .. } => Opcode::Invoke,
            Instruction::InvokeIndirect { .. } => Opcode::InvokeIndirect,
            Instruction::Return => Opcode::Return,
            Instruction::SetRetVal { .. } => Opcode::SetRetVal,
            Instruction::Halt => Opcode::Halt,
            Instruction::DefineStructure { .. } => Opcode::DefineStructure,
            Instruction::AllocStructure { .. } => Opcode::AllocStructure,
            Instruction::CopyFromStructure { .. } => Opcode::CopyFromStructure,
            Instruction::CopyToStructure { .. } => Opcode::CopyToStructure,
            Instruction::CopyStructure => Opcode::CopyStructure,
            Instruction::CopyBuffer => Opcode::CopyBuffer,
            Instruction::SumTypeDef { .. } => Opcode::SumTypeDef,
            Instruction::ConstructSumType => Opcode::ConstructSumType,
            Instruction::TypeFromRegister => Opcode::TypeFromRegister,
            Instruction::PatternMatch { .. } => Opcode::PatternMatch,
            Instruction::TypeMatch { .. } => Opcode::TypeMatch,
            Instruction::PoolString { .. } => Opcode::PoolString,
            Instruction::Tag { .. } => Opcode::Tag,
        }
    }

    pub fn encode(&self, writer: &mut BytecodeWriter) -> Result<()> {
        writer.emit_opcode(self.opcode());
        match self {
            Instruction::BeginEntity { tag, name } => {
                writer.emit_entity_tag(*tag);
                writer.emit_handle(*name);
            }
            Instruction::InvokeMeta { tag } => writer.emit_entity_tag(*tag),
            Instruction::DefineLexicalScope { scope } => {
                writer.emit_handle(scope.name);
                writer.emit_handle(scope.parent);
                writer.emit_u32(scope.variables.len() as u32);
                for var in &scope.variables {
                    writer.emit_handle(var.identifier);
                    writer.emit_type_id(var.type_id);
                    writer.emit_byte(var.origin as u8);
                    writer.emit_bool(var.is_reference);
                }
            }
            Instruction::Push { type_id, value } => {
                type_id
                    .storage_size()
                    .ok_or(StreamError::UnsizedType(type_id.0))?;
                writer.emit_type_id(*type_id);
                value.encode(writer);
            }
            Instruction::Pop { type_id } => writer.emit_type_id(*type_id),
            Instruction::Read { variable } => writer.emit_handle(*variable),
            Instruction::BindMemberRef { member } => writer.emit_handle(*member),
            Instruction::BindMemberByHandle { member } => writer.emit_handle(*member),
            Instruction::Invoke { function } => writer.emit_handle(*function),
            Instruction::InvokeIndirect { variable } => writer.emit_handle(*variable),
            Instruction::SetRetVal { variable } => writer.emit_handle(*variable),
            Instruction::DefineStructure { type_id, members } => {
                writer.emit_type_id(*type_id);
                writer.emit_u32(members.len() as u32);
                for (member, member_type) in members {
                    writer.emit_handle(*member);
                    writer.emit_type_id(*member_type);
                }
            }
            Instruction::AllocStructure { type_id } => writer.emit_type_id(*type_id),
            Instruction::CopyFromStructure { variable, member }
            | Instruction::CopyToStructure { variable, member } => {
                writer.emit_handle(*variable);
                writer.emit_handle(*member);
            }
            Instruction::SumTypeDef { type_id, bases } => {
                writer.emit_type_id(*type_id);
                writer.emit_u32(bases.len() as u32);
                for base in bases {
                    writer.emit_type_id(*base);
                }
            }
            Instruction::PatternMatch { target, params } => {
                writer.emit_handle(*target);
                writer.emit_u32(params.len() as u32);
                for param in params {
                    writer.emit_type_id(param.type_id);
                    match &param.literal {
                        Some(literal) => {
                            writer.emit_bool(true);
                            literal.encode(writer);
                        }
                        None => writer.emit_bool(false),
                    }
                }
            }
            Instruction::TypeMatch { target, params } => {
                writer.emit_handle(*target);
                writer.emit_u32(params.len() as u32);
                for param in params {
                    writer.emit_bool(param.is_reference);
                    writer.emit_type_id(param.type_id);
                }
            }
            Instruction::PoolString { handle, value } => {
                writer.emit_handle(*handle);
                writer.emit_wide_string(value);
            }
            Instruction::Tag { entity, key, items } => {
                writer.emit_handle(*entity);
                writer.emit_u32(items.len() as u32);
                writer.emit_wide_string(key);
                for item in items {
                    writer.emit_wide_string(item);
                }
            }
            Instruction::EndEntity
            | Instruction::BeginChain
            | Instruction::EndChain
            | Instruction::ReadRef
            | Instruction::Assign
            | Instruction::AssignThroughIdentifier
            | Instruction::AssignSumType
            | Instruction::BindRef
            | Instruction::Return
            | Instruction::Halt
            | Instruction::CopyStructure
            | Instruction::CopyBuffer
            | Instruction::ConstructSumType
            | Instruction::TypeFromRegister => {}
        }
        Ok(())
    }
}
