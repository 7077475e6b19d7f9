use crate::context::ExecutionContext;
use crate::error::VmResult;
use crate::value::Value;
use epoch_bytecode::EntityTag;
use log::info;
use std::collections::HashMap;

pub type NativeFn = fn(&mut ExecutionContext) -> VmResult<()>;

/// Functions implemented by the runtime rather than by bytecode.
/// `Invoke` falls back here when no bytecode entity answers to the
/// name; hosts may register more. Keyed by name text so registration
/// does not depend on pool-handle assignment.
#[derive(Default)]
pub struct NativeRegistry {
    entries: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> NativeRegistry {
        NativeRegistry::default()
    }

    pub fn register(&mut self, name: &str, function: NativeFn) {
        self.entries.insert(name.to_string(), function);
    }

    pub fn lookup(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name).copied()
    }
}

/// What an entity's meta-control decides on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginAction {
    Execute,
    Skip,
}

/// What an entity's meta-control decides at the end of the body (or at
/// an explicit `InvokeMeta`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    Proceed,
    RepeatChain,
}

pub type BeginFn = fn(&mut ExecutionContext) -> VmResult<BeginAction>;
pub type EndFn = fn(&mut ExecutionContext) -> VmResult<EndAction>;

#[derive(Clone, Copy)]
pub struct MetaControl {
    pub on_begin: BeginFn,
    pub on_end: EndFn,
}

/// Meta-control behaviors for user-defined entity tags. The emitter
/// treats these tags as opaque; all of their flow-control meaning lives
/// here.
#[derive(Default)]
pub struct MetaControlRegistry {
    entries: HashMap<u32, MetaControl>,
}

impl MetaControlRegistry {
    pub fn new() -> MetaControlRegistry {
        MetaControlRegistry::default()
    }

    pub fn register(&mut self, tag: EntityTag, control: MetaControl) {
        self.entries.insert(tag.0, control);
    }

    pub fn lookup(&self, tag: EntityTag) -> Option<MetaControl> {
        self.entries.get(&tag.0).copied()
    }
}

/// Conditional arm (if / elseif): pops a Boolean, executes on true, and
/// lets the chain complete afterwards.
pub const TAG_CONDITIONAL: EntityTag = EntityTag(EntityTag::CUSTOM_BASE);
/// Unconditional arm (else): always executes.
pub const TAG_UNCONDITIONAL: EntityTag = EntityTag(EntityTag::CUSTOM_BASE + 1);
/// Loop: pops a Boolean, executes on true, and repeats the chain after
/// each pass so the condition expression re-evaluates.
pub const TAG_LOOPING: EntityTag = EntityTag(EntityTag::CUSTOM_BASE + 2);
/// Bottom-tested loop: always executes; the body leaves its condition
/// on the stack and the end-of-body meta-control pops it to decide
/// whether the chain repeats.
pub const TAG_DO_LOOPING: EntityTag = EntityTag(EntityTag::CUSTOM_BASE + 3);

fn begin_when_true(context: &mut ExecutionContext) -> VmResult<BeginAction> {
    Ok(if context.stack.pop_bool()? {
        BeginAction::Execute
    } else {
        BeginAction::Skip
    })
}

fn begin_always(_context: &mut ExecutionContext) -> VmResult<BeginAction> {
    Ok(BeginAction::Execute)
}

fn end_proceed(_context: &mut ExecutionContext) -> VmResult<EndAction> {
    Ok(EndAction::Proceed)
}

fn end_repeat(_context: &mut ExecutionContext) -> VmResult<EndAction> {
    Ok(EndAction::RepeatChain)
}

fn end_repeat_when_true(context: &mut ExecutionContext) -> VmResult<EndAction> {
    Ok(if context.stack.pop_bool()? {
        EndAction::RepeatChain
    } else {
        EndAction::Proceed
    })
}

fn pop_two_integers(context: &mut ExecutionContext) -> VmResult<(i32, i32)> {
    let rhs = context.stack.pop_i32()?;
    let lhs = context.stack.pop_i32()?;
    Ok((lhs, rhs))
}

fn pop_two_integer16s(context: &mut ExecutionContext) -> VmResult<(i16, i16)> {
    let rhs = context.stack.pop_i16()?;
    let lhs = context.stack.pop_i16()?;
    Ok((lhs, rhs))
}

fn pop_two_reals(context: &mut ExecutionContext) -> VmResult<(f32, f32)> {
    let rhs = context.stack.pop_real()?;
    let lhs = context.stack.pop_real()?;
    Ok((lhs, rhs))
}

fn pop_two_booleans(context: &mut ExecutionContext) -> VmResult<(bool, bool)> {
    let rhs = context.stack.pop_bool()?;
    let lhs = context.stack.pop_bool()?;
    Ok((lhs, rhs))
}

/// Operator natives per operand type. The overload pass in the
/// semantic layer rewrites operator invocations to the `@@`-mangled
/// name matching the operand type; the unmangled names keep the
/// 32-bit-integer behavior.
fn install_operator_natives(natives: &mut NativeRegistry) {
    natives.register("+", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Integer(l.wrapping_add(r)))
    });
    natives.register("-", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Integer(l.wrapping_sub(r)))
    });
    natives.register("*", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Integer(l.wrapping_mul(r)))
    });
    natives.register("/", |c| {
        let (l, r) = pop_two_integers(c)?;
        if r == 0 {
            return Err(crate::error::VmError::DivisionByZero);
        }
        c.native_return(Value::Integer(l.wrapping_div(r)))
    });
    natives.register("==", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l == r))
    });
    natives.register("!=", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l != r))
    });
    natives.register("<", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l < r))
    });
    natives.register(">", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l > r))
    });
    natives.register("<=", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l <= r))
    });
    natives.register(">=", |c| {
        let (l, r) = pop_two_integers(c)?;
        c.native_return(Value::Boolean(l >= r))
    });

    natives.register("+@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Integer16(l.wrapping_add(r)))
    });
    natives.register("-@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Integer16(l.wrapping_sub(r)))
    });
    natives.register("*@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Integer16(l.wrapping_mul(r)))
    });
    natives.register("/@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        if r == 0 {
            return Err(crate::error::VmError::DivisionByZero);
        }
        c.native_return(Value::Integer16(l.wrapping_div(r)))
    });
    natives.register("==@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l == r))
    });
    natives.register("!=@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l != r))
    });
    natives.register("<@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l < r))
    });
    natives.register(">@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l > r))
    });
    natives.register("<=@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l <= r))
    });
    natives.register(">=@@integer16", |c| {
        let (l, r) = pop_two_integer16s(c)?;
        c.native_return(Value::Boolean(l >= r))
    });

    natives.register("+@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Real(l + r))
    });
    natives.register("-@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Real(l - r))
    });
    natives.register("*@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Real(l * r))
    });
    natives.register("/@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Real(l / r))
    });
    natives.register("==@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l == r))
    });
    natives.register("!=@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l != r))
    });
    natives.register("<@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l < r))
    });
    natives.register(">@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l > r))
    });
    natives.register("<=@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l <= r))
    });
    natives.register(">=@@real", |c| {
        let (l, r) = pop_two_reals(c)?;
        c.native_return(Value::Boolean(l >= r))
    });

    natives.register("==@@boolean", |c| {
        let (l, r) = pop_two_booleans(c)?;
        c.native_return(Value::Boolean(l == r))
    });
    natives.register("!=@@boolean", |c| {
        let (l, r) = pop_two_booleans(c)?;
        c.native_return(Value::Boolean(l != r))
    });
}

/// Writes a 32-bit value to the log. The standard library's typed
/// overloads all funnel into this once the semantic layer has resolved
/// them.
fn native_debugwrite(context: &mut ExecutionContext) -> VmResult<()> {
    let value = context.stack.pop_i32()?;
    info!("debugwrite: {}", value);
    Ok(())
}

fn native_debugwritestring(context: &mut ExecutionContext) -> VmResult<()> {
    let handle = epoch_bytecode::StringHandle(context.stack.pop_u32()?);
    let text = context.strings.get(handle)?.to_string();
    info!("debugwrite: {}", text);
    Ok(())
}

fn native_allocbuffer(context: &mut ExecutionContext) -> VmResult<()> {
    let size = context.stack.pop_i32()?.max(0) as usize;
    let handle = context.buffers.allocate(size);
    context.native_return(Value::Buffer(handle))
}

pub fn install_defaults(natives: &mut NativeRegistry, meta: &mut MetaControlRegistry) {
    install_operator_natives(natives);
    natives.register("debugwrite", native_debugwrite);
    natives.register("debugwritestring", native_debugwritestring);
    natives.register("allocbuffer", native_allocbuffer);

    meta.register(
        TAG_CONDITIONAL,
        MetaControl {
            on_begin: begin_when_true,
            on_end: end_proceed,
        },
    );
    meta.register(
        TAG_UNCONDITIONAL,
        MetaControl {
            on_begin: begin_always,
            on_end: end_proceed,
        },
    );
    meta.register(
        TAG_LOOPING,
        MetaControl {
            on_begin: begin_when_true,
            on_end: end_repeat,
        },
    );
    meta.register(
        TAG_DO_LOOPING,
        MetaControl {
            on_begin: begin_always,
            on_end: end_repeat_when_true,
        },
    );
}
