use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("unexpected end of instruction stream at offset {0}")]
    UnexpectedEof(usize),
    #[error("unrecognized opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("malformed wide string at offset {0}")]
    MalformedString(usize),
    #[error("unbalanced entity framing at offset {0}")]
    UnbalancedEntity(usize),
    #[error("unbalanced chain framing at offset {0}")]
    UnbalancedChain(usize),
    #[error("type {0:#010X} has no fixed storage size in this position")]
    UnsizedType(u32),
    #[error("invalid variable origin byte {0}")]
    InvalidOrigin(u8),
    #[error("unknown mnemonic '{0}' in assembly listing")]
    UnknownMnemonic(String),
    #[error("line {line}: expected {expected} operand")]
    BadOperand { line: usize, expected: &'static str },
    #[error("malformed assembly listing near line {0}")]
    MalformedListing(usize),
}

pub type Result<T> = std::result::Result<T, StreamError>;
