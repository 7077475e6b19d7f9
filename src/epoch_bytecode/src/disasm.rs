use crate::error::Result;
use crate::instruction::{Instruction, PushValue};
use crate::reader::BytecodeReader;
use std::fmt::Write as _;

/// Render an instruction stream as a textual assembly listing: one
/// instruction per line, the symbolic opcode name followed by one
/// whitespace-separated token per wire field, indented by entity depth.
/// Each line carries a trailing `; @XXXXXXXX` stream-offset comment,
/// which the assembler discards.
pub fn disassemble(bytes: &[u8]) -> Result<String> {
    let mut reader = BytecodeReader::new(bytes);
    let mut listing = String::new();
    let mut depth = 0usize;
    while !reader.is_at_end() {
        let offset = reader.offset();
        let instruction = reader.read_instruction()?;
        if matches!(
            instruction,
            Instruction::EndEntity | Instruction::EndChain
        ) {
            depth = depth.saturating_sub(1);
        }
        for _ in 0..depth {
            listing.push_str("  ");
        }
        listing.push_str(&render(&instruction));
        let _ = writeln!(&mut listing, "  ; @{:08X}", offset);
        if matches!(
            instruction,
            Instruction::BeginEntity { .. } | Instruction::BeginChain
        ) {
            depth += 1;
        }
    }
    Ok(listing)
}

fn push_value_token(value: &PushValue) -> String {
    match value {
        PushValue::Integer(v) => v.to_string(),
        PushValue::Integer16(v) => v.to_string(),
        // Bit pattern, so the listing round-trips exactly.
        PushValue::Real(v) => format!("{:#010X}", v.to_bits()),
        PushValue::Boolean(v) => v.to_string(),
        PushValue::Handle(v) => v.to_string(),
        PushValue::Nothing => String::new(),
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn render(instruction: &Instruction) -> String {
    let mut tokens: Vec<String> = vec![instruction.opcode().mnemonic().to_string()];
    match instruction {
        Instruction::BeginEntity { tag, name } => {
            tokens.push(tag.to_string());
            tokens.push(name.to_string());
        }
        Instruction::InvokeMeta { tag } => tokens.push(tag.to_string()),
        Instruction::DefineLexicalScope { scope } => {
            tokens.push(scope.name.to_string());
            tokens.push(scope.parent.to_string());
            tokens.push(scope.variables.len().to_string());
            for var in &scope.variables {
                tokens.push(var.identifier.to_string());
                tokens.push(var.type_id.to_string());
                tokens.push((var.origin as u8).to_string());
                tokens.push(var.is_reference.to_string());
            }
        }
        Instruction::Push { type_id, value } => {
            tokens.push(type_id.to_string());
            let token = push_value_token(value);
            if !token.is_empty() {
                tokens.push(token);
            }
        }
        Instruction::Pop { type_id } => tokens.push(type_id.to_string()),
        Instruction::Read { variable }
        | Instruction::InvokeIndirect { variable }
        | Instruction::SetRetVal { variable } => tokens.push(variable.to_string()),
        Instruction::BindMemberRef { member } | Instruction::BindMemberByHandle { member } => {
            tokens.push(member.to_string())
        }
        Instruction::Invoke { function } => tokens.push(function.to_string()),
        Instruction::DefineStructure { type_id, members } => {
            tokens.push(type_id.to_string());
            tokens.push(members.len().to_string());
            for (member, member_type) in members {
                tokens.push(member.to_string());
                tokens.push(member_type.to_string());
            }
        }
        Instruction::AllocStructure { type_id } => tokens.push(type_id.to_string()),
        Instruction::CopyFromStructure { variable, member }
        | Instruction::CopyToStructure { variable, member } => {
            tokens.push(variable.to_string());
            tokens.push(member.to_string());
        }
        Instruction::SumTypeDef { type_id, bases } => {
            tokens.push(type_id.to_string());
            tokens.push(bases.len().to_string());
            for base in bases {
                tokens.push(base.to_string());
            }
        }
        Instruction::PatternMatch { target, params } => {
            tokens.push(target.to_string());
            tokens.push(params.len().to_string());
            for param in params {
                tokens.push(param.type_id.to_string());
                match &param.literal {
                    Some(literal) => {
                        tokens.push("true".to_string());
                        tokens.push(push_value_token(literal));
                    }
                    None => tokens.push("false".to_string()),
                }
            }
        }
        Instruction::TypeMatch { target, params } => {
            tokens.push(target.to_string());
            tokens.push(params.len().to_string());
            for param in params {
                tokens.push(param.is_reference.to_string());
                tokens.push(param.type_id.to_string());
            }
        }
        Instruction::PoolString { handle, value } => {
            tokens.push(handle.to_string());
            tokens.push(quote(value));
        }
        Instruction::Tag { entity, key, items } => {
            tokens.push(entity.to_string());
            tokens.push(items.len().to_string());
            tokens.push(quote(key));
            for item in items {
                tokens.push(quote(item));
            }
        }
        _ => {}
    }
    tokens.join(" ")
}
