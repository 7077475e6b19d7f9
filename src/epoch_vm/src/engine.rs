use crate::context::{install_thread_context, ExecutionContext};
use crate::error::VmResult;
use crate::program::LoadedProgram;
use crate::stack::DEFAULT_STACK_BYTES;
use crate::vm::Vm;
use log::info;

/// Host-facing execution knobs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub stack_bytes: usize,
    pub gc: bool,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            stack_bytes: DEFAULT_STACK_BYTES,
            gc: true,
        }
    }
}

/// Convenience wrapper tying the pieces together: load a stream, claim
/// the thread's context slot, execute, and hand the final context back
/// for inspection.
pub struct ExecutionEngine;

impl ExecutionEngine {
    pub fn new() -> ExecutionEngine {
        ExecutionEngine
    }

    pub fn run_stream(&self, bytes: Vec<u8>, config: &RunConfig) -> VmResult<ExecutionContext> {
        let program = LoadedProgram::load(bytes)?;
        info!(
            "loaded program: {} bytes, {} invocable entities",
            program.bytes.len(),
            program.invocables.len()
        );
        let vm = Vm::new(program);
        let mut context = ExecutionContext::with_stack_size(config.stack_bytes);
        context.gc_enabled = config.gc;
        let _guard = install_thread_context()?;
        vm.run(&mut context)?;
        Ok(context)
    }
}

impl Default for ExecutionEngine {
    fn default() -> ExecutionEngine {
        ExecutionEngine::new()
    }
}
