//! Bytecode emission for the Epoch toolchain.
//!
//! Consumes a validated semantic IR ([`ir::Program`]) and produces an
//! instruction stream obeying the framing and value rules of the
//! `epoch_bytecode` wire contract. Overload resolution, operator
//! precedence, and type validation are the semantic layer's problem;
//! by the time a `Program` reaches this crate every callee identifier
//! is resolved and every expression is in emission order.

pub mod codegen;
pub mod emitter;
pub mod errors;
pub mod ir;
pub mod strings;

pub use crate::codegen::generate_program;
pub use crate::emitter::BytecodeEmitter;
pub use crate::errors::{CompileError, CompileErrors, EmitError, EmitResult, SourceLocation};
pub use crate::ir::Program;
pub use crate::strings::StringPool;
