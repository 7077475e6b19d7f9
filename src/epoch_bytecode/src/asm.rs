use crate::entity::EntityTag;
use crate::error::{Result, StreamError};
use crate::handles::StringHandle;
use crate::instruction::{Instruction, PatternParam, PushValue, TypeMatchParam};
use crate::opcode::Opcode;
use crate::scope::{ScopeDescription, ScopeVariable, VariableOrigin};
use crate::type_id::TypeId;
use crate::writer::BytecodeWriter;

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while1};
use nom::character::complete::{char, digit1, hex_digit1};
use nom::combinator::{map, map_res, opt, recognize, value};
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

/// Assemble a textual listing back into a binary instruction stream.
///
/// The listing grammar is the one `disasm::disassemble` produces: one
/// token per wire field, whitespace-separated, `;` to end of line is a
/// comment, strings double-quoted with `\" \\ \n \t` escapes, reals as
/// hex bit patterns. Indentation and offset comments are ignored, so a
/// round-tripped listing reassembles to the identical byte sequence.
pub fn assemble(listing: &str) -> Result<Vec<u8>> {
    let mut cursor = lex(listing)?;
    let mut writer = BytecodeWriter::new();
    while let Some((line, mnemonic)) = cursor.next_mnemonic()? {
        let opcode = Opcode::from_mnemonic(&mnemonic)
            .ok_or_else(|| StreamError::UnknownMnemonic(mnemonic.clone()))?;
        let instruction = read_instruction(opcode, &mut cursor, line)?;
        instruction.encode(&mut writer)?;
    }
    Ok(writer.into_bytes())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Number(i64),
    Hex(u32),
}

fn quoted(input: &str) -> IResult<&str, Token> {
    let escape = alt((
        value("\\", char('\\')),
        value("\"", char('"')),
        value("\n", char('n')),
        value("\t", char('t')),
    ));
    map(
        delimited(
            char('"'),
            opt(escaped_transform(is_not("\\\""), '\\', escape)),
            char('"'),
        ),
        |body: Option<String>| Token::Quoted(body.unwrap_or_default()),
    )(input)
}

fn hex_number(input: &str) -> IResult<&str, Token> {
    map(
        map_res(preceded(tag("0x"), hex_digit1), |digits: &str| {
            u32::from_str_radix(digits, 16)
        }),
        Token::Hex,
    )(input)
}

fn decimal_number(input: &str) -> IResult<&str, Token> {
    map(
        map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i64>),
        Token::Number,
    )(input)
}

fn word(input: &str) -> IResult<&str, Token> {
    map(
        take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '"'),
        |w: &str| Token::Word(w.to_string()),
    )(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((quoted, hex_number, decimal_number, word))(input)
}

struct TokenCursor {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

fn lex(listing: &str) -> Result<TokenCursor> {
    let mut tokens = Vec::new();
    for (index, raw_line) in listing.lines().enumerate() {
        let line = index + 1;
        let mut rest = raw_line.trim_start();
        while !rest.is_empty() && !rest.starts_with(';') {
            let (next, tok) =
                token(rest).map_err(|_| StreamError::MalformedListing(line))?;
            tokens.push((line, tok));
            rest = next.trim_start();
        }
    }
    Ok(TokenCursor { tokens, pos: 0 })
}

impl TokenCursor {
    fn next_token(&mut self, line: usize, expected: &'static str) -> Result<&Token> {
        let entry = self
            .tokens
            .get(self.pos)
            .ok_or(StreamError::BadOperand { line, expected })?;
        self.pos += 1;
        Ok(&entry.1)
    }

    /// Start of the next instruction; `None` at end of listing.
    fn next_mnemonic(&mut self) -> Result<Option<(usize, String)>> {
        match self.tokens.get(self.pos) {
            None => Ok(None),
            Some((line, Token::Word(word))) => {
                let result = (*line, word.clone());
                self.pos += 1;
                Ok(Some(result))
            }
            Some((line, _)) => Err(StreamError::MalformedListing(*line)),
        }
    }

    fn next_u32(&mut self, line: usize) -> Result<u32> {
        match self.next_token(line, "unsigned integer")? {
            Token::Number(n) if *n >= 0 && *n <= u32::MAX as i64 => Ok(*n as u32),
            Token::Hex(h) => Ok(*h),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "unsigned integer",
            }),
        }
    }

    fn next_i32(&mut self, line: usize) -> Result<i32> {
        match self.next_token(line, "integer")? {
            Token::Number(n) if i32::try_from(*n).is_ok() => Ok(*n as i32),
            Token::Hex(h) => Ok(*h as i32),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "integer",
            }),
        }
    }

    fn next_i16(&mut self, line: usize) -> Result<i16> {
        match self.next_token(line, "16-bit integer")? {
            Token::Number(n) if i16::try_from(*n).is_ok() => Ok(*n as i16),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "16-bit integer",
            }),
        }
    }

    fn next_bool(&mut self, line: usize) -> Result<bool> {
        match self.next_token(line, "boolean")? {
            Token::Word(w) if w == "true" => Ok(true),
            Token::Word(w) if w == "false" => Ok(false),
            Token::Number(1) => Ok(true),
            Token::Number(0) => Ok(false),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "boolean",
            }),
        }
    }

    fn next_real(&mut self, line: usize) -> Result<f32> {
        match self.next_token(line, "real bit pattern")? {
            Token::Hex(bits) => Ok(f32::from_bits(*bits)),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "real bit pattern",
            }),
        }
    }

    fn next_string(&mut self, line: usize) -> Result<String> {
        match self.next_token(line, "quoted string")? {
            Token::Quoted(s) => Ok(s.clone()),
            _ => Err(StreamError::BadOperand {
                line,
                expected: "quoted string",
            }),
        }
    }

    fn next_handle(&mut self, line: usize) -> Result<StringHandle> {
        Ok(StringHandle(self.next_u32(line)?))
    }

    fn next_type_id(&mut self, line: usize) -> Result<TypeId> {
        Ok(TypeId(self.next_u32(line)?))
    }

    fn next_push_value(&mut self, type_id: TypeId, line: usize) -> Result<PushValue> {
        let value = match type_id {
            TypeId::INTEGER => PushValue::Integer(self.next_i32(line)?),
            TypeId::INTEGER16 => PushValue::Integer16(self.next_i16(line)?),
            TypeId::REAL => PushValue::Real(self.next_real(line)?),
            TypeId::BOOLEAN => PushValue::Boolean(self.next_bool(line)?),
            TypeId::NOTHING => PushValue::Nothing,
            other => match other.storage_size() {
                Some(4) => PushValue::Handle(self.next_u32(line)?),
                _ => return Err(StreamError::UnsizedType(other.0)),
            },
        };
        Ok(value)
    }
}

fn read_instruction(opcode: Opcode, cursor: &mut TokenCursor, line: usize) -> Result<Instruction> {
    let instruction = match opcode {
        Opcode::BeginEntity => Instruction::BeginEntity {
            tag: EntityTag(cursor.next_u32(line)?),
            name: cursor.next_handle(line)?,
        },
        Opcode::EndEntity => Instruction::EndEntity,
        Opcode::BeginChain => Instruction::BeginChain,
        Opcode::EndChain => Instruction::EndChain,
        Opcode::InvokeMeta => Instruction::InvokeMeta {
            tag: EntityTag(cursor.next_u32(line)?),
        },
        Opcode::DefineLexicalScope => {
            let name = cursor.next_handle(line)?;
            let parent = cursor.next_handle(line)?;
            let count = cursor.next_u32(line)? as usize;
            let mut variables = Vec::with_capacity(count);
            for _ in 0..count {
                let identifier = cursor.next_handle(line)?;
                let type_id = cursor.next_type_id(line)?;
                let origin = VariableOrigin::from_byte(cursor.next_u32(line)? as u8)?;
                let is_reference = cursor.next_bool(line)?;
                variables.push(ScopeVariable {
                    identifier,
                    type_id,
                    origin,
                    is_reference,
                });
            }
            Instruction::DefineLexicalScope {
                scope: ScopeDescription {
                    name,
                    parent,
                    variables,
                },
            }
        }
        Opcode::Push => {
            let type_id = cursor.next_type_id(line)?;
            let value = cursor.next_push_value(type_id, line)?;
            Instruction::Push { type_id, value }
        }
        Opcode::Pop => Instruction::Pop {
            type_id: cursor.next_type_id(line)?,
        },
        Opcode::Read => Instruction::Read {
            variable: cursor.next_handle(line)?,
        },
        Opcode::ReadRef => Instruction::ReadRef,
        Opcode::Assign => Instruction::Assign,
        Opcode::AssignThroughIdentifier => Instruction::AssignThroughIdentifier,
        Opcode::AssignSumType => Instruction::AssignSumType,
        Opcode::BindRef => Instruction::BindRef,
        Opcode::BindMemberRef => Instruction::BindMemberRef {
            member: cursor.next_handle(line)?,
        },
        Opcode::BindMemberByHandle => Instruction::BindMemberByHandle {
            member: cursor.next_handle(line)?,
        },
        Opcode::Invoke => Instruction::Invoke {
            function: cursor.next_handle(line)?,
        },
        Opcode::InvokeIndirect => Instruction::InvokeIndirect {
            variable: cursor.next_handle(line)?,
        },
        Opcode::Return => Instruction::Return,
        Opcode::SetRetVal => Instruction::SetRetVal {
            variable: cursor.next_handle(line)?,
        },
        Opcode::Halt => Instruction::Halt,
        Opcode::DefineStructure => {
            let type_id = cursor.next_type_id(line)?;
            let count = cursor.next_u32(line)? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let member = cursor.next_handle(line)?;
                let member_type = cursor.next_type_id(line)?;
                members.push((member, member_type));
            }
            Instruction::DefineStructure { type_id, members }
        }
        Opcode::AllocStructure => Instruction::AllocStructure {
            type_id: cursor.next_type_id(line)?,
        },
        Opcode::CopyFromStructure => Instruction::CopyFromStructure {
            variable: cursor.next_handle(line)?,
            member: cursor.next_handle(line)?,
        },
        Opcode::CopyToStructure => Instruction::CopyToStructure {
            variable: cursor.next_handle(line)?,
            member: cursor.next_handle(line)?,
        },
        Opcode::CopyStructure => Instruction::CopyStructure,
        Opcode::CopyBuffer => Instruction::CopyBuffer,
        Opcode::SumTypeDef => {
            let type_id = cursor.next_type_id(line)?;
            let count = cursor.next_u32(line)? as usize;
            let mut bases = Vec::with_capacity(count);
            for _ in 0..count {
                bases.push(cursor.next_type_id(line)?);
            }
            Instruction::SumTypeDef { type_id, bases }
        }
        Opcode::ConstructSumType => Instruction::ConstructSumType,
        Opcode::TypeFromRegister => Instruction::TypeFromRegister,
        Opcode::PatternMatch => {
            let target = cursor.next_handle(line)?;
            let count = cursor.next_u32(line)? as usize;
            let mut params = Vec::with_capacity(count);
            for _ in 0..count {
                let type_id = cursor.next_type_id(line)?;
                let literal = if cursor.next_bool(line)? {
                    Some(cursor.next_push_value(type_id, line)?)
                } else {
                    None
                };
                params.push(PatternParam { type_id, literal });
            }
            Instruction::PatternMatch { target, params }
        }
        Opcode::TypeMatch => {
            let target = cursor.next_handle(line)?;
            let count = cursor.next_u32(line)? as usize;
            let mut params = Vec::with_capacity(count);
            for _ in 0..count {
                let is_reference = cursor.next_bool(line)?;
                let type_id = cursor.next_type_id(line)?;
                params.push(TypeMatchParam {
                    is_reference,
                    type_id,
                });
            }
            Instruction::TypeMatch { target, params }
        }
        Opcode::PoolString => Instruction::PoolString {
            handle: cursor.next_handle(line)?,
            value: cursor.next_string(line)?,
        },
        Opcode::Tag => {
            let entity = cursor.next_handle(line)?;
            let count = cursor.next_u32(line)? as usize;
            let key = cursor.next_string(line)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.next_string(line)?);
            }
            Instruction::Tag { entity, key, items }
        }
    };
    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_escaped_strings() {
        let cursor = lex("PoolString 3 \"a\\\"b\\\\c\\n\"").unwrap();
        assert_eq!(cursor.tokens.len(), 3);
        assert_eq!(cursor.tokens[2].1, Token::Quoted("a\"b\\c\n".to_string()));
    }

    #[test]
    fn lexes_empty_string_and_hex() {
        let cursor = lex("Push 0x00000008 7 \"\"").unwrap();
        assert_eq!(cursor.tokens[1].1, Token::Hex(8));
        assert_eq!(cursor.tokens[3].1, Token::Quoted(String::new()));
    }

    #[test]
    fn comments_are_discarded() {
        let cursor = lex("; full line comment\nHalt  ; @0000002A\n").unwrap();
        assert_eq!(cursor.tokens.len(), 1);
        assert_eq!(cursor.tokens[0].1, Token::Word("Halt".to_string()));
    }

    #[test]
    fn assembles_minimal_program() {
        let bytes = assemble("Invoke 1\nHalt\n").unwrap();
        let mut expected = BytecodeWriter::new();
        Instruction::Invoke {
            function: StringHandle(1),
        }
        .encode(&mut expected)
        .unwrap();
        Instruction::Halt.encode(&mut expected).unwrap();
        assert_eq!(bytes, expected.into_bytes());
    }
}
