use epoch_bytecode::{
    ScopeDescription, ScopeVariable, StringHandle, TypeId, VariableOrigin,
};
use epoch_compiler::ir::{
    Assignment, AssignmentRhs, CodeBlock, CodeBlockEntry, Expression, ExpressionAtom, Function,
    FunctionBody, Program, TagMetadata,
};
use epoch_compiler::{generate_program, CompileErrors};
use epoch_vm::marshaling::{
    self, callback_thunk, complete_external_call, lookup_external, marshal_buffer_into_structure,
    marshal_structure_into_buffer, marshaled_size, prepare_external_call, register_external,
    CallingConvention, DllBinding,
};
use epoch_vm::structures::StructureDefinition;
use epoch_vm::{ExecutionContext, LoadedProgram, Value, Vm};

const PTR: usize = std::mem::size_of::<usize>();

fn context_with_record() -> (ExecutionContext, epoch_bytecode::StructureHandle, StringHandle) {
    let mut context = ExecutionContext::new();
    let title = context.strings.pool("window title");

    let inner_type = TypeId::structure(1);
    let inner_def = StructureDefinition {
        type_id: inner_type,
        members: vec![(StringHandle(101), TypeId::INTEGER16)],
    };
    let outer_type = TypeId::structure(0);
    let outer_def = StructureDefinition {
        type_id: outer_type,
        members: vec![
            (StringHandle(102), TypeId::INTEGER),
            (StringHandle(103), TypeId::BOOLEAN),
            (StringHandle(104), TypeId::STRING),
            (StringHandle(105), inner_type),
        ],
    };
    context.structure_defs.insert(inner_type, inner_def.clone());
    context.structure_defs.insert(outer_type, outer_def.clone());

    let inner = context.structures.allocate(&inner_def);
    context.structures.get_mut(inner).unwrap().members[0] = Value::Integer16(-7);
    let outer = context.structures.allocate(&outer_def);
    {
        let record = context.structures.get_mut(outer).unwrap();
        record.members[0] = Value::Integer(123456);
        record.members[1] = Value::Boolean(true);
        record.members[2] = Value::Str(title);
        record.members[3] = Value::Structure(inner, inner_type);
    }
    (context, outer, title)
}

#[test]
fn marshaled_layout_widens_booleans_and_flattens_nesting() {
    let (context, outer, _) = context_with_record();
    let outer_type = context.structures.get(outer).unwrap().type_id;
    // i32 + widened bool + string pointer + nested i16
    assert_eq!(
        marshaled_size(&context, outer_type).unwrap(),
        4 + 4 + PTR + 2
    );
    let mut context = context;
    let mut buffer = Vec::new();
    marshal_structure_into_buffer(&mut context, outer, &mut buffer).unwrap();
    assert_eq!(buffer.len(), 4 + 4 + PTR + 2);
    assert_eq!(&buffer[..4], &123456i32.to_le_bytes());
    assert_eq!(&buffer[4..8], &1i32.to_le_bytes());
    let pointer = usize::from_le_bytes(buffer[8..8 + PTR].try_into().unwrap());
    assert_ne!(pointer, 0);
    assert_eq!(&buffer[8 + PTR..], &(-7i16).to_le_bytes());
}

#[test]
fn marshaling_round_trip_preserves_members_and_string_identity() {
    let (mut context, outer, title) = context_with_record();
    let mut buffer = Vec::new();
    marshal_structure_into_buffer(&mut context, outer, &mut buffer).unwrap();
    marshal_buffer_into_structure(&mut context, outer, &buffer).unwrap();

    let record = context.structures.get(outer).unwrap();
    assert_eq!(record.members[0], Value::Integer(123456));
    assert_eq!(record.members[1], Value::Boolean(true));
    // Unchanged pointers must map back to the identical pooled handle.
    assert_eq!(record.members[2], Value::Str(title));
    let inner = match record.members[3] {
        Value::Structure(inner, _) => inner,
        ref other => panic!("expected nested structure, found {:?}", other),
    };
    assert_eq!(
        context.structures.get(inner).unwrap().members[0],
        Value::Integer16(-7)
    );
}

#[test]
fn reference_writeback_reparses_mutations() {
    let (mut context, outer, _) = context_with_record();
    register_external(
        "ext@writeback",
        DllBinding {
            dll: "demo.dll".to_string(),
            symbol: "Mutate".to_string(),
            convention: CallingConvention::StdCall,
        },
    );
    let outer_type = context.structures.get(outer).unwrap().type_id;
    let mut call = prepare_external_call(
        &mut context,
        "ext@writeback",
        &[(Value::Structure(outer, outer_type), true)],
    )
    .unwrap();
    // Simulate the external function mutating the integer field.
    call.records[0].buffer[..4].copy_from_slice(&777i32.to_le_bytes());
    complete_external_call(&mut context, call).unwrap();
    assert_eq!(
        context.structures.get(outer).unwrap().members[0],
        Value::Integer(777)
    );
}

#[test]
fn null_string_pointer_pools_the_empty_string() {
    let (mut context, outer, _) = context_with_record();
    let mut buffer = Vec::new();
    marshal_structure_into_buffer(&mut context, outer, &mut buffer).unwrap();
    buffer[8..8 + PTR].copy_from_slice(&0usize.to_le_bytes());
    marshal_buffer_into_structure(&mut context, outer, &buffer).unwrap();
    let member = context.structures.get(outer).unwrap().members[2].clone();
    match member {
        Value::Str(handle) => assert_eq!(context.strings.get(handle).unwrap(), ""),
        other => panic!("expected string member, found {:?}", other),
    }
}

#[test]
fn message_box_arguments_marshal_left_to_right() {
    let mut context = ExecutionContext::new();
    let caption = context.strings.pool("Greetings");
    let text = context.strings.pool("Hello from Epoch");
    register_external(
        "ext@messagebox",
        DllBinding {
            dll: "user32.dll".to_string(),
            symbol: "MessageBoxW".to_string(),
            convention: CallingConvention::StdCall,
        },
    );
    let call = prepare_external_call(
        &mut context,
        "ext@messagebox",
        &[
            (Value::Integer(0), false),
            (Value::Str(text), false),
            (Value::Str(caption), false),
            (Value::Integer(0), false),
        ],
    )
    .unwrap();
    assert_eq!(call.binding.symbol, "MessageBoxW");
    let words = call.argument_words();
    assert_eq!(words.len(), 4);
    assert_eq!(words[0], 0);
    // The second argument is the wide C string pointer of the pooled
    // text, stable across marshals.
    let expected = marshaling::wide_string_ptr(&mut context, text).unwrap() as u64;
    assert_eq!(words[1], expected);
    let wide = &context.wide_strings[&text];
    let decoded = String::from_utf16(&wide[..wide.len() - 1]).unwrap();
    assert_eq!(decoded, "Hello from Epoch");
    assert_eq!(wide[wide.len() - 1], 0);
}

#[test]
fn callback_thunks_are_cached_by_target() {
    let mut context = ExecutionContext::new();
    let f = context.strings.pool("callback");
    let g = context.strings.pool("other");
    let first = callback_thunk(&mut context, f);
    let second = callback_thunk(&mut context, f);
    let third = callback_thunk(&mut context, g);
    assert_eq!(first, second);
    assert_ne!(first, third);
    assert_eq!(marshaling::thunk_target(&context, first), Some(f));
}

#[test]
fn external_tag_registers_binding_at_load() {
    let mut program = Program::default();
    let entry = program.strings.pool("entrypoint");
    let external = program.strings.pool("messagebox@tagtest");
    program.scopes.push(ScopeDescription {
        name: entry,
        parent: StringHandle::NULL,
        variables: vec![],
    });
    program.functions.push(Function {
        name: entry,
        scope: entry,
        body: FunctionBody::Code(CodeBlock {
            scope: entry,
            entries: vec![],
        }),
        tags: vec![],
    });
    program.functions.push(Function {
        name: external,
        scope: external,
        body: FunctionBody::External,
        tags: vec![TagMetadata {
            key: "external".to_string(),
            items: vec![
                "user32.dll".to_string(),
                "MessageBoxW".to_string(),
                "stdcall".to_string(),
            ],
        }],
    });
    program.entrypoint = entry;

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    epoch_vm::ExecutionEngine::new()
        .run_stream(stream, &epoch_vm::RunConfig::default())
        .unwrap();
    assert_eq!(
        lookup_external("messagebox@tagtest"),
        Some(DllBinding {
            dll: "user32.dll".to_string(),
            symbol: "MessageBoxW".to_string(),
            convention: CallingConvention::StdCall,
        })
    );
}

#[test]
fn callback_reentry_unmarshals_invokes_and_marshals_back() {
    let mut program = Program::default();
    let entry = program.strings.pool("entrypoint");
    let double = program.strings.pool("double");
    let x = program.strings.pool("x");
    let result = program.strings.pool("result");
    let eq = program.strings.pool("=");
    let star = program.strings.pool("*");
    program.scopes.push(ScopeDescription {
        name: entry,
        parent: StringHandle::NULL,
        variables: vec![],
    });
    program.scopes.push(ScopeDescription {
        name: double,
        parent: StringHandle::NULL,
        variables: vec![
            ScopeVariable {
                identifier: x,
                type_id: TypeId::INTEGER,
                origin: VariableOrigin::Parameter,
                is_reference: false,
            },
            ScopeVariable {
                identifier: result,
                type_id: TypeId::INTEGER,
                origin: VariableOrigin::Return,
                is_reference: false,
            },
        ],
    });
    program.functions.push(Function {
        name: entry,
        scope: entry,
        body: FunctionBody::Code(CodeBlock {
            scope: entry,
            entries: vec![],
        }),
        tags: vec![],
    });
    program.functions.push(Function {
        name: double,
        scope: double,
        body: FunctionBody::Code(CodeBlock {
            scope: double,
            entries: vec![CodeBlockEntry::Assignment(Assignment {
                lhs: vec![result],
                operator: eq,
                rhs: AssignmentRhs::Expression(Expression {
                    atoms: vec![
                        ExpressionAtom::Identifier(x),
                        ExpressionAtom::LiteralInteger(2),
                        ExpressionAtom::Operator(star),
                    ],
                }),
            })],
        }),
        tags: vec![],
    });
    program.entrypoint = entry;

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let vm = Vm::new(LoadedProgram::load(stream).unwrap());
    let mut context = ExecutionContext::new();
    vm.run(&mut context).unwrap();

    let before = context.stack.used();
    let thunk = callback_thunk(&mut context, double);
    let out = vm.invoke_callback(&mut context, thunk, &[21]).unwrap();
    assert_eq!(out, 42);
    assert_eq!(context.stack.used(), before);
}
