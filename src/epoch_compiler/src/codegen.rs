use crate::emitter::BytecodeEmitter;
use crate::errors::{CompileErrors, EmitError, EmitResult};
use crate::ir::{
    Assignment, AssignmentRhs, CodeBlock, CodeBlockEntry, Entity, Expression, ExpressionAtom,
    FunctionBody, OpStatement, Program, Statement,
};
use epoch_bytecode::{EntityTag, StringHandle, TypeFamily, TypeId, VariableOrigin};
use log::{debug, info};

/// Convert a validated semantic IR into an instruction stream.
///
/// Emission order: pooled strings, structure definitions, sum-type
/// definitions, lexical scope metadata, global code blocks (left open),
/// the entrypoint invocation and halt, every function frame, and
/// finally the deferred global closes in LIFO order.
///
/// Refuses to run while the semantic error collector holds anything.
pub fn generate_program(program: &Program, errors: &CompileErrors) -> EmitResult<Vec<u8>> {
    if !errors.is_empty() {
        return Err(EmitError::SemanticErrorsPresent(errors.len()));
    }

    let mut emitter = BytecodeEmitter::new();

    for (handle, value) in program.strings.iter() {
        emitter.pool_string(handle, value);
    }

    for structure in &program.structures {
        let members: Vec<(StringHandle, TypeId)> = structure
            .members
            .iter()
            .map(|m| (m.name, m.type_id))
            .collect();
        emitter.define_structure(structure.type_id, &members);
    }

    for sum_type in &program.sum_types {
        emitter.define_sum_type(sum_type.type_id, &sum_type.bases);
    }

    for scope in &program.scopes {
        emitter.define_lexical_scope(scope);
    }

    // Entity metadata tags ride in the preamble so the runtime sees
    // them before any code runs; external bindings in particular must
    // be registered ahead of the entrypoint invocation.
    for function in &program.functions {
        for tag in &function.tags {
            emitter.tag_data(function.name, &tag.key, &tag.items);
        }
    }

    for block in &program.global_blocks {
        emitter.enter_entity(EntityTag::GLOBALS, block.scope);
        generate_block(&mut emitter, block, program)?;
    }

    emitter.invoke(program.entrypoint);
    emitter.halt();

    for function in &program.functions {
        match &function.body {
            FunctionBody::Code(block) => {
                emitter.enter_function(function.name);
                generate_block(&mut emitter, block, program)?;
                let scope = program
                    .scope_by_name(function.scope)
                    .ok_or(EmitError::UnknownScope(function.scope))?;
                if let Some(ret) = scope
                    .variables
                    .iter()
                    .find(|v| v.origin == VariableOrigin::Return)
                {
                    emitter.set_return_register(ret.identifier);
                }
                emitter.exit_function();
            }
            FunctionBody::MemberAccessor {
                structure_var,
                member_var,
            } => {
                emitter.enter_function(function.name);
                emitter.copy_from_structure(*structure_var, *member_var);
                emitter.exit_function();
            }
            FunctionBody::PatternResolver(overloads) => {
                emitter.enter_pattern_resolver(function.name);
                for overload in overloads {
                    emitter.resolve_pattern(overload.target, &overload.params)?;
                }
                emitter.exit_pattern_resolver();
            }
            FunctionBody::TypeResolver(overloads) => {
                emitter.enter_type_resolver(function.name);
                for overload in overloads {
                    emitter.resolve_types(overload.target, &overload.params);
                }
                emitter.exit_type_resolver();
            }
            FunctionBody::External => {}
        }
    }

    for _ in &program.global_blocks {
        emitter.exit_entity();
    }

    info!(
        "generated {} bytes of bytecode for {} functions",
        emitter.stream_len(),
        program.functions.len()
    );
    Ok(emitter.into_stream())
}

fn generate_block(
    emitter: &mut BytecodeEmitter,
    block: &CodeBlock,
    program: &Program,
) -> EmitResult<()> {
    let scope = block.scope;
    for entry in &block.entries {
        match entry {
            CodeBlockEntry::Assignment(assignment) => {
                generate_assignment(emitter, assignment, scope, program, false)?;
            }
            CodeBlockEntry::Statement(statement) => {
                emit_statement(emitter, statement, scope, program)?;
                // A statement-position call discards its return value;
                // the register push must come back off the stack.
                if let Some(ret_type) = function_return_type(program, statement.name) {
                    emitter.pop_stack(ret_type);
                }
            }
            CodeBlockEntry::PreOpStatement(op) => {
                generate_preop(emitter, op, scope, program)?;
            }
            CodeBlockEntry::PostOpStatement(op) => {
                generate_postop(emitter, op, scope, program)?;
            }
            CodeBlockEntry::InnerBlock(inner) => {
                emitter.enter_entity(EntityTag::FREE_BLOCK, inner.scope);
                generate_block(emitter, inner, program)?;
                emitter.exit_entity();
            }
            CodeBlockEntry::Entity(entry) => {
                emitter.begin_chain();
                generate_entity(emitter, &entry.primary, scope, program)?;
                for chained in &entry.chain {
                    generate_entity(emitter, chained, scope, program)?;
                }
                emitter.end_chain();
            }
        }
    }
    Ok(())
}

/// Declared return type of a bytecode function, when it has one.
fn function_return_type(program: &Program, name: StringHandle) -> Option<TypeId> {
    let function = program.function(name)?;
    let scope = program.scope_by_name(function.scope)?;
    scope
        .variables
        .iter()
        .find(|v| v.origin == VariableOrigin::Return)
        .map(|v| v.type_id)
}

fn generate_entity(
    emitter: &mut BytecodeEmitter,
    entity: &Entity,
    enclosing_scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    for parameter in &entity.parameters {
        emit_expression(emitter, parameter, enclosing_scope, program)?;
    }
    emitter.enter_entity(entity.tag, entity.name);
    generate_block(emitter, &entity.code, program)?;
    emitter.exit_entity();
    Ok(())
}

fn emit_statement(
    emitter: &mut BytecodeEmitter,
    statement: &Statement,
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    for parameter in &statement.parameters {
        emit_expression(emitter, parameter, scope, program)?;
    }
    // A callee that names a function-typed variable is a higher-order
    // call through that variable, not a direct invocation.
    if program.variable_type(scope, statement.name) == Some(TypeId::FUNCTION) {
        emitter.invoke_indirect(statement.name);
    } else {
        emitter.invoke(statement.name);
    }
    Ok(())
}

fn emit_expression(
    emitter: &mut BytecodeEmitter,
    expression: &Expression,
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    for atom in &expression.atoms {
        emit_atom(emitter, atom, scope, program)?;
    }
    Ok(())
}

fn emit_atom(
    emitter: &mut BytecodeEmitter,
    atom: &ExpressionAtom,
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    match atom {
        // A parenthetical is purely a precedence artifact by the time
        // the semantic layer is done; its atoms emit in place.
        ExpressionAtom::Parenthetical(inner) => {
            emit_expression(emitter, inner, scope, program)?;
        }
        ExpressionAtom::Identifier(identifier) => {
            if program.has_function(*identifier) {
                // A first-class function value: the name handle pushed
                // with the Function annotation.
                emitter.push_function_name(*identifier);
            } else {
                let type_id = program
                    .variable_type(scope, *identifier)
                    .ok_or(EmitError::UnknownVariable(*identifier))?;
                emitter.push_variable_value(*identifier, type_id);
            }
        }
        ExpressionAtom::Operator(operator) => {
            debug!("operator atom {} emitted in supplied order", operator);
            emitter.invoke(*operator);
        }
        ExpressionAtom::LiteralString(handle) => emitter.push_string_literal(*handle),
        ExpressionAtom::LiteralBoolean(value) => emitter.push_boolean_literal(*value),
        ExpressionAtom::LiteralInteger(value) => emitter.push_integer_literal(*value),
        ExpressionAtom::LiteralInteger16(value) => emitter.push_integer16_literal(*value)?,
        ExpressionAtom::LiteralReal(value) => emitter.push_real_literal(*value),
        ExpressionAtom::Statement(statement) => {
            emit_statement(emitter, statement, scope, program)?;
        }
    }
    Ok(())
}

/// Push the value of a member chain `a.b.c...` following the read
/// rules: the head is read without copying, each member goes through
/// its installed accessor overload, and the final type's copy rule is
/// applied only after the last step.
fn push_value(
    emitter: &mut BytecodeEmitter,
    chain: &[StringHandle],
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    let (&head, members) = chain.split_first().ok_or(EmitError::MissingLValue)?;
    let head_type = program
        .variable_type(scope, head)
        .ok_or(EmitError::UnknownVariable(head))?;
    if members.is_empty() {
        emitter.push_variable_value(head, head_type);
        return Ok(());
    }
    emitter.push_variable_value_no_copy(head);
    let mut current = head_type;
    for &member in members {
        let accessor = program
            .member_accessor(current, member)
            .ok_or(EmitError::UnknownStructure(member))?;
        emitter.push_string_literal(member);
        emitter.invoke(accessor);
        current = program
            .member_type(current, member)
            .ok_or(EmitError::UnknownStructure(member))?;
    }
    if current == TypeId::BUFFER {
        emitter.copy_buffer();
    } else if current.is_structure_like() {
        emitter.copy_structure();
    }
    Ok(())
}

fn bind_reference_chain(emitter: &mut BytecodeEmitter, chain: &[StringHandle]) -> EmitResult<()> {
    let (&head, members) = chain.split_first().ok_or(EmitError::MissingLValue)?;
    emitter.bind_reference(head);
    for &member in members {
        emitter.bind_structure_reference(member);
    }
    Ok(())
}

/// Declared type of the storage a member chain names.
fn chain_type(
    chain: &[StringHandle],
    scope: StringHandle,
    program: &Program,
) -> EmitResult<TypeId> {
    let (&head, members) = chain.split_first().ok_or(EmitError::MissingLValue)?;
    let mut current = program
        .variable_type(scope, head)
        .ok_or(EmitError::UnknownVariable(head))?;
    for &member in members {
        current = program
            .member_type(current, member)
            .ok_or(EmitError::UnknownStructure(member))?;
    }
    Ok(current)
}

/// Static type of an expression when it is decidable locally: a lone
/// literal or a lone variable read. Everything else is `None` and the
/// caller falls back to the return register's annotation.
fn expression_static_type(
    expression: &Expression,
    scope: StringHandle,
    program: &Program,
) -> Option<TypeId> {
    match expression.atoms.as_slice() {
        [ExpressionAtom::LiteralInteger(_)] => Some(TypeId::INTEGER),
        [ExpressionAtom::LiteralInteger16(_)] => Some(TypeId::INTEGER16),
        [ExpressionAtom::LiteralReal(_)] => Some(TypeId::REAL),
        [ExpressionAtom::LiteralBoolean(_)] => Some(TypeId::BOOLEAN),
        [ExpressionAtom::LiteralString(_)] => Some(TypeId::STRING),
        [ExpressionAtom::Identifier(id)] => program.variable_type(scope, *id),
        [ExpressionAtom::Parenthetical(inner)] => expression_static_type(inner, scope, program),
        _ => None,
    }
}

fn generate_assignment(
    emitter: &mut BytecodeEmitter,
    assignment: &Assignment,
    scope: StringHandle,
    program: &Program,
    nested: bool,
) -> EmitResult<()> {
    let mut rhs_static_type = match &assignment.rhs {
        AssignmentRhs::Expression(expression) => {
            emit_expression(emitter, expression, scope, program)?;
            expression_static_type(expression, scope, program)
        }
        AssignmentRhs::Nested(inner) => {
            generate_assignment(emitter, inner, scope, program, true)?;
            chain_type(&inner.lhs, scope, program).ok()
        }
    };

    if program.strings.get(assignment.operator) != Some("=") {
        push_value(emitter, &assignment.lhs, scope, program)?;
        emitter.invoke(assignment.operator);
        rhs_static_type = None;
    }

    let lhs_type = chain_type(&assignment.lhs, scope, program)?;
    if lhs_type.family() == TypeFamily::SumType {
        // Sum-typed storage needs the actual-type annotation above the
        // payload. A sum-typed RHS already carried its discriminator.
        match rhs_static_type {
            Some(t) if t.family() == TypeFamily::SumType => {}
            Some(t) => emitter.push_type_annotation(t),
            None => emitter.type_annotation_from_register(),
        }
        bind_reference_chain(emitter, &assignment.lhs)?;
        emitter.assign_sum_type_variable();
    } else {
        bind_reference_chain(emitter, &assignment.lhs)?;
        emitter.assign_variable();
    }

    if nested {
        bind_reference_chain(emitter, &assignment.lhs)?;
        emitter.read_reference_onto_stack();
    }
    Ok(())
}

fn generate_preop(
    emitter: &mut BytecodeEmitter,
    op: &OpStatement,
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    push_value(emitter, &op.operand, scope, program)?;
    emitter.invoke(op.operator);
    bind_reference_chain(emitter, &op.operand)?;
    emitter.assign_variable();
    push_value(emitter, &op.operand, scope, program)
}

fn generate_postop(
    emitter: &mut BytecodeEmitter,
    op: &OpStatement,
    scope: StringHandle,
    program: &Program,
) -> EmitResult<()> {
    // Two pushes on purpose: the lower copy survives as the expression's
    // result after the operator consumes the upper one.
    push_value(emitter, &op.operand, scope, program)?;
    push_value(emitter, &op.operand, scope, program)?;
    emitter.invoke(op.operator);
    bind_reference_chain(emitter, &op.operand)?;
    emitter.assign_variable();
    Ok(())
}
