use epoch_bytecode::{StreamError, StringHandle};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("support for pattern matching function parameters of this type is not implemented")]
    UnsupportedPatternLiteral,
    #[error("integer16 literal {0} overflows 16 bits")]
    Integer16Overflow(i32),
    #[error("assignment has no l-value")]
    MissingLValue,
    #[error("identifier {0} is not a variable in the active scope chain")]
    UnknownVariable(StringHandle),
    #[error("no scope named {0} is defined")]
    UnknownScope(StringHandle),
    #[error("no structure definition for member access on {0}")]
    UnknownStructure(StringHandle),
    #[error("{0} semantic errors present; emission aborted")]
    SemanticErrorsPresent(usize),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type EmitResult<T> = Result<T, EmitError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// One recoverable compile-time diagnostic with enough source context to
/// point a caret at the offending column.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub location: SourceLocation,
    pub source_line: String,
}

impl CompileError {
    /// `message in file line L column C`, then the source line with a
    /// caret under the offending column.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            &mut out,
            "{} in {} line {} column {}",
            self.message, self.location.file, self.location.line, self.location.column
        );
        let _ = writeln!(&mut out, "{}", self.source_line);
        for _ in 1..self.location.column {
            out.push(' ');
        }
        out.push('^');
        out.push('\n');
        out
    }
}

/// Collector the semantic passes report into. Emission refuses to run
/// while any error is present.
#[derive(Debug, Default)]
pub struct CompileErrors {
    errors: Vec<CompileError>,
}

impl CompileErrors {
    pub fn new() -> CompileErrors {
        CompileErrors::default()
    }

    pub fn report(&mut self, message: impl Into<String>, location: SourceLocation, source_line: impl Into<String>) {
        self.errors.push(CompileError {
            message: message.into(),
            location,
            source_line: source_line.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.errors.iter()
    }
}
