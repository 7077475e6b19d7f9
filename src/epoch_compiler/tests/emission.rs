use epoch_bytecode::{
    BytecodeReader, EntityTag, Instruction, PushValue, ScopeDescription, ScopeVariable,
    StringHandle, TypeId, VariableOrigin,
};
use epoch_compiler::ir::{
    Assignment, AssignmentRhs, CodeBlock, CodeBlockEntry, Expression, ExpressionAtom, Function,
    FunctionBody, PatternLiteral, PatternOverload, PatternSignatureParam, Program, Statement,
    Structure, StructureMember,
};
use epoch_compiler::{generate_program, CompileErrors, SourceLocation};

fn decode(bytes: &[u8]) -> Vec<Instruction> {
    let mut reader = BytecodeReader::new(bytes);
    let mut instructions = Vec::new();
    while !reader.is_at_end() {
        instructions.push(reader.read_instruction().expect("stream decodes"));
    }
    instructions
}

fn contains_window(haystack: &[Instruction], needle: &[Instruction]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn scope_with(name: StringHandle, variables: Vec<ScopeVariable>) -> ScopeDescription {
    ScopeDescription {
        name,
        parent: StringHandle::NULL,
        variables,
    }
}

fn local(identifier: StringHandle, type_id: TypeId) -> ScopeVariable {
    ScopeVariable {
        identifier,
        type_id,
        origin: VariableOrigin::Local,
        is_reference: false,
    }
}

fn empty_entrypoint_program() -> Program {
    let mut program = Program::default();
    let entry = program.strings.pool("entrypoint");
    program.scopes.push(scope_with(entry, vec![]));
    program.functions.push(Function {
        name: entry,
        scope: entry,
        body: FunctionBody::Code(CodeBlock {
            scope: entry,
            entries: vec![],
        }),
        tags: vec![],
    });
    program.entrypoint = entry;
    program
}

#[test]
fn s1_empty_entrypoint_frame() {
    let program = empty_entrypoint_program();
    let entry = program.entrypoint;
    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    epoch_bytecode::validate_framing(&stream).unwrap();

    let instructions = decode(&stream);
    assert_eq!(
        instructions[0],
        Instruction::PoolString {
            handle: entry,
            value: "entrypoint".to_string(),
        }
    );
    assert!(contains_window(
        &instructions,
        &[Instruction::Invoke { function: entry }, Instruction::Halt]
    ));
    assert_eq!(
        &instructions[instructions.len() - 3..],
        &[
            Instruction::BeginEntity {
                tag: EntityTag::FUNCTION,
                name: entry,
            },
            Instruction::Return,
            Instruction::EndEntity,
        ]
    );
}

#[test]
fn s1_listing_snapshot() {
    let program = empty_entrypoint_program();
    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let listing = epoch_bytecode::disasm::disassemble(&stream).unwrap();
    insta::assert_snapshot!(listing, @r###"
    PoolString 1 "entrypoint"  ; @00000000
    DefineLexicalScope 1 0 0  ; @0000001B
    Invoke 1  ; @00000028
    Halt  ; @0000002D
    BeginEntity 1 1  ; @0000002E
      Return  ; @00000037
    EndEntity  ; @00000038
    "###);
}

#[test]
fn s2_assignment_then_statement() {
    let mut program = empty_entrypoint_program();
    let entry = program.entrypoint;
    let x = program.strings.pool("x");
    let eq = program.strings.pool("=");
    let debugwrite = program.strings.pool("debugwrite");
    program.scopes[0].variables.push(local(x, TypeId::INTEGER));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![x],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::LiteralInteger(42)],
            }),
        }));
        block.entries.push(CodeBlockEntry::Statement(Statement {
            name: debugwrite,
            parameters: vec![Expression {
                atoms: vec![ExpressionAtom::Identifier(x)],
            }],
        }));
    }

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::Push {
                type_id: TypeId::INTEGER,
                value: PushValue::Integer(42),
            },
            Instruction::Push {
                type_id: TypeId::STRING,
                value: PushValue::Handle(x.0),
            },
            Instruction::BindRef,
            Instruction::Assign,
            Instruction::Read { variable: x },
            Instruction::Invoke {
                function: debugwrite,
            },
        ]
    ));
}

#[test]
fn s3_member_assignment_binds_through_chain() {
    let mut program = empty_entrypoint_program();
    let a = program.strings.pool("a");
    let b = program.strings.pool("b");
    let eq = program.strings.pool("=");
    let point_name = program.strings.pool("point");
    let point = TypeId::structure(0);
    program.structures.push(Structure {
        name: point_name,
        type_id: point,
        members: vec![StructureMember {
            name: b,
            type_id: TypeId::INTEGER,
        }],
    });
    program.scopes[0].variables.push(local(a, point));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![a, b],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::LiteralInteger(5)],
            }),
        }));
    }
    program.finalize();

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::Push {
                type_id: TypeId::INTEGER,
                value: PushValue::Integer(5),
            },
            Instruction::Push {
                type_id: TypeId::STRING,
                value: PushValue::Handle(a.0),
            },
            Instruction::BindRef,
            Instruction::BindMemberRef { member: b },
            Instruction::Assign,
        ]
    ));
}

#[test]
fn s4_pattern_resolver_records() {
    let mut program = empty_entrypoint_program();
    let fact = program.strings.pool("fact");
    let fact_base = program.strings.pool("fact@base");
    let fact_rec = program.strings.pool("fact@rec");
    for name in [fact_base, fact_rec] {
        program.scopes.push(scope_with(name, vec![]));
        program.functions.push(Function {
            name,
            scope: name,
            body: FunctionBody::Code(CodeBlock {
                scope: name,
                entries: vec![],
            }),
            tags: vec![],
        });
    }
    program.functions.push(Function {
        name: fact,
        scope: fact,
        body: FunctionBody::PatternResolver(vec![
            PatternOverload {
                target: fact_base,
                params: vec![PatternSignatureParam {
                    type_id: TypeId::INTEGER,
                    literal: Some(PatternLiteral::Integer(0)),
                }],
            },
            PatternOverload {
                target: fact_rec,
                params: vec![PatternSignatureParam {
                    type_id: TypeId::INTEGER,
                    literal: None,
                }],
            },
        ]),
        tags: vec![],
    });

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::BeginEntity {
                tag: EntityTag::PATTERN_MATCHING_RESOLVER,
                name: fact,
            },
            Instruction::PatternMatch {
                target: fact_base,
                params: vec![epoch_bytecode::PatternParam {
                    type_id: TypeId::INTEGER,
                    literal: Some(PushValue::Integer(0)),
                }],
            },
            Instruction::PatternMatch {
                target: fact_rec,
                params: vec![epoch_bytecode::PatternParam {
                    type_id: TypeId::INTEGER,
                    literal: None,
                }],
            },
            Instruction::Halt,
            Instruction::EndEntity,
        ]
    ));
}

#[test]
fn s5_buffer_read_copies() {
    let mut program = empty_entrypoint_program();
    let b1 = program.strings.pool("b1");
    let b2 = program.strings.pool("b2");
    let eq = program.strings.pool("=");
    program.scopes[0].variables.push(local(b1, TypeId::BUFFER));
    program.scopes[0].variables.push(local(b2, TypeId::BUFFER));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![b2],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::Identifier(b1)],
            }),
        }));
    }

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::Read { variable: b1 },
            Instruction::CopyBuffer,
            Instruction::Push {
                type_id: TypeId::STRING,
                value: PushValue::Handle(b2.0),
            },
            Instruction::BindRef,
            Instruction::Assign,
        ]
    ));
}

#[test]
fn integer16_literals_emit_narrow_pushes() {
    let mut program = empty_entrypoint_program();
    let s = program.strings.pool("s");
    let eq = program.strings.pool("=");
    program.scopes[0].variables.push(local(s, TypeId::INTEGER16));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![s],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::LiteralInteger16(-7)],
            }),
        }));
    }

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::Push {
                type_id: TypeId::INTEGER16,
                value: PushValue::Integer16(-7),
            },
            Instruction::Push {
                type_id: TypeId::STRING,
                value: PushValue::Handle(s.0),
            },
            Instruction::BindRef,
            Instruction::Assign,
        ]
    ));
}

#[test]
fn integer16_overflow_is_a_compile_error() {
    let mut program = empty_entrypoint_program();
    let s = program.strings.pool("s");
    let eq = program.strings.pool("=");
    program.scopes[0].variables.push(local(s, TypeId::INTEGER16));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![s],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::LiteralInteger16(70000)],
            }),
        }));
    }

    assert!(matches!(
        generate_program(&program, &CompileErrors::new()),
        Err(epoch_compiler::EmitError::Integer16Overflow(70000))
    ));
}

#[test]
fn function_identifiers_push_with_function_annotation() {
    let mut program = empty_entrypoint_program();
    let entry = program.entrypoint;
    let f = program.strings.pool("f");
    let eq = program.strings.pool("=");
    program.scopes[0].variables.push(local(f, TypeId::FUNCTION));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![f],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::Identifier(entry)],
            }),
        }));
    }

    let stream = generate_program(&program, &CompileErrors::new()).unwrap();
    let instructions = decode(&stream);
    assert!(contains_window(
        &instructions,
        &[
            Instruction::Push {
                type_id: TypeId::FUNCTION,
                value: PushValue::Handle(entry.0),
            },
            Instruction::Push {
                type_id: TypeId::STRING,
                value: PushValue::Handle(f.0),
            },
            Instruction::BindRef,
            Instruction::Assign,
        ]
    ));
}

#[test]
fn ir_survives_json_round_trip() {
    let mut program = empty_entrypoint_program();
    let x = program.strings.pool("x");
    let eq = program.strings.pool("=");
    program.scopes[0].variables.push(local(x, TypeId::INTEGER));
    if let FunctionBody::Code(block) = &mut program.functions[0].body {
        block.entries.push(CodeBlockEntry::Assignment(Assignment {
            lhs: vec![x],
            operator: eq,
            rhs: AssignmentRhs::Expression(Expression {
                atoms: vec![ExpressionAtom::LiteralInteger(9)],
            }),
        }));
    }

    let json = serde_json::to_string(&program).unwrap();
    let reloaded: Program = serde_json::from_str(&json).unwrap();
    let original = generate_program(&program, &CompileErrors::new()).unwrap();
    let replayed = generate_program(&reloaded, &CompileErrors::new()).unwrap();
    assert_eq!(original, replayed);
}

#[test]
fn unsupported_pattern_literal_aborts_emission() {
    let mut program = empty_entrypoint_program();
    let dispatch = program.strings.pool("dispatch");
    let target = program.strings.pool("dispatch@real");
    program.scopes.push(scope_with(target, vec![]));
    program.functions.push(Function {
        name: target,
        scope: target,
        body: FunctionBody::Code(CodeBlock {
            scope: target,
            entries: vec![],
        }),
        tags: vec![],
    });
    program.functions.push(Function {
        name: dispatch,
        scope: dispatch,
        body: FunctionBody::PatternResolver(vec![PatternOverload {
            target,
            params: vec![PatternSignatureParam {
                type_id: TypeId::REAL,
                literal: Some(PatternLiteral::Real(1.5)),
            }],
        }]),
        tags: vec![],
    });

    let result = generate_program(&program, &CompileErrors::new());
    assert!(matches!(
        result,
        Err(epoch_compiler::EmitError::UnsupportedPatternLiteral)
    ));
}

#[test]
fn semantic_errors_block_emission() {
    let program = empty_entrypoint_program();
    let mut errors = CompileErrors::new();
    errors.report(
        "type mismatch",
        SourceLocation {
            file: "demo.epoch".to_string(),
            line: 1,
            column: 1,
        },
        "integer x = \"oops\"",
    );
    assert!(matches!(
        generate_program(&program, &errors),
        Err(epoch_compiler::EmitError::SemanticErrorsPresent(1))
    ));
}
