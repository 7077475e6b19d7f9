use crate::error::VmResult;
use epoch_bytecode::{
    BytecodeReader, EntityTag, Instruction, StreamError, StringHandle,
};
use std::collections::HashMap;

/// Byte span of one entity frame in the stream.
#[derive(Debug, Clone, Copy)]
pub struct EntitySpan {
    pub tag: EntityTag,
    pub name: StringHandle,
    /// Offset of the `BeginEntity` instruction.
    pub begin: usize,
    /// Offset of the first body instruction.
    pub body: usize,
    /// Offset of the matching `EndEntity`.
    pub end: usize,
    /// Offset just past the `EndEntity`.
    pub after_end: usize,
}

/// Byte span of one `BeginChain`/`EndChain` frame.
#[derive(Debug, Clone, Copy)]
pub struct ChainSpan {
    pub begin: usize,
    /// Offset of the first instruction inside the chain — the repeat
    /// target, so chained parameter expressions re-evaluate.
    pub start: usize,
    /// Offset of the `EndChain` instruction.
    pub end: usize,
}

/// An instruction stream plus the one-pass index the interpreter
/// navigates by: entity frame spans, chain spans, and the offsets of
/// invocable entities (functions and resolvers) by name. Instruction
/// arguments are still decoded lazily at execution time.
#[derive(Debug)]
pub struct LoadedProgram {
    pub bytes: Vec<u8>,
    pub entities: HashMap<usize, EntitySpan>,
    pub chains: HashMap<usize, ChainSpan>,
    pub invocables: HashMap<StringHandle, usize>,
}

impl LoadedProgram {
    /// Index a stream. Also proves framing balance end to end, which
    /// makes every later span lookup infallible.
    pub fn load(bytes: Vec<u8>) -> VmResult<LoadedProgram> {
        let mut entities = HashMap::new();
        let mut chains = HashMap::new();
        let mut invocables = HashMap::new();

        let mut reader = BytecodeReader::new(&bytes);
        let mut entity_stack: Vec<EntitySpan> = Vec::new();
        let mut chain_stack: Vec<ChainSpan> = Vec::new();
        while !reader.is_at_end() {
            let offset = reader.offset();
            match reader.read_instruction()? {
                Instruction::BeginEntity { tag, name } => {
                    entity_stack.push(EntitySpan {
                        tag,
                        name,
                        begin: offset,
                        body: reader.offset(),
                        end: 0,
                        after_end: 0,
                    });
                }
                Instruction::EndEntity => {
                    let mut span = entity_stack
                        .pop()
                        .ok_or(StreamError::UnbalancedEntity(offset))?;
                    span.end = offset;
                    span.after_end = reader.offset();
                    if span.tag.is_invocable() {
                        invocables.insert(span.name, span.begin);
                    }
                    entities.insert(span.begin, span);
                }
                Instruction::BeginChain => {
                    chain_stack.push(ChainSpan {
                        begin: offset,
                        start: reader.offset(),
                        end: 0,
                    });
                }
                Instruction::EndChain => {
                    let mut span = chain_stack
                        .pop()
                        .ok_or(StreamError::UnbalancedChain(offset))?;
                    span.end = offset;
                    chains.insert(span.begin, span);
                }
                _ => {}
            }
        }
        if !entity_stack.is_empty() {
            return Err(StreamError::UnbalancedEntity(bytes.len()).into());
        }
        if !chain_stack.is_empty() {
            return Err(StreamError::UnbalancedChain(bytes.len()).into());
        }

        Ok(LoadedProgram {
            bytes,
            entities,
            chains,
            invocables,
        })
    }

    pub fn entity_at(&self, begin: usize) -> Option<&EntitySpan> {
        self.entities.get(&begin)
    }

    pub fn invocable(&self, name: StringHandle) -> Option<usize> {
        self.invocables.get(&name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epoch_bytecode::{BytecodeWriter, TypeId};

    #[test]
    fn indexes_functions_and_chains() {
        let mut w = BytecodeWriter::new();
        let stream = [
            Instruction::Invoke {
                function: StringHandle(1),
            },
            Instruction::Halt,
            Instruction::BeginEntity {
                tag: EntityTag::FUNCTION,
                name: StringHandle(1),
            },
            Instruction::BeginChain,
            Instruction::Push {
                type_id: TypeId::BOOLEAN,
                value: epoch_bytecode::PushValue::Boolean(true),
            },
            Instruction::BeginEntity {
                tag: EntityTag::custom(0),
                name: StringHandle(2),
            },
            Instruction::EndEntity,
            Instruction::EndChain,
            Instruction::Return,
            Instruction::EndEntity,
        ];
        for instruction in &stream {
            instruction.encode(&mut w).unwrap();
        }
        let loaded = LoadedProgram::load(w.into_bytes()).unwrap();
        assert_eq!(loaded.invocables.len(), 1);
        let begin = loaded.invocable(StringHandle(1)).unwrap();
        let span = loaded.entity_at(begin).unwrap();
        assert_eq!(span.tag, EntityTag::FUNCTION);
        assert_eq!(loaded.chains.len(), 1);
        assert_eq!(loaded.entities.len(), 2);
    }

    #[test]
    fn unbalanced_stream_is_rejected() {
        let mut w = BytecodeWriter::new();
        Instruction::BeginEntity {
            tag: EntityTag::FUNCTION,
            name: StringHandle(1),
        }
        .encode(&mut w)
        .unwrap();
        assert!(LoadedProgram::load(w.into_bytes()).is_err());
    }
}
