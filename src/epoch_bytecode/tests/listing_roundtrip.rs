use epoch_bytecode::asm::assemble;
use epoch_bytecode::disasm::disassemble;
use epoch_bytecode::{
    BytecodeWriter, EntityTag, Instruction, PatternParam, PushValue, ScopeDescription,
    ScopeVariable, StringHandle, TypeId, TypeMatchParam, VariableOrigin,
};

fn sample_stream() -> Vec<u8> {
    let mut w = BytecodeWriter::new();
    let instructions = vec![
        Instruction::PoolString {
            handle: StringHandle(1),
            value: "entrypoint".to_string(),
        },
        Instruction::PoolString {
            handle: StringHandle(2),
            value: "greeting with \"quotes\" and\nnewline".to_string(),
        },
        Instruction::DefineStructure {
            type_id: TypeId::structure(0),
            members: vec![
                (StringHandle(3), TypeId::INTEGER),
                (StringHandle(4), TypeId::STRING),
            ],
        },
        Instruction::SumTypeDef {
            type_id: TypeId::sum_type(0),
            bases: vec![TypeId::INTEGER, TypeId::BOOLEAN],
        },
        Instruction::DefineLexicalScope {
            scope: ScopeDescription {
                name: StringHandle(1),
                parent: StringHandle::NULL,
                variables: vec![
                    ScopeVariable {
                        identifier: StringHandle(5),
                        type_id: TypeId::INTEGER,
                        origin: VariableOrigin::Parameter,
                        is_reference: false,
                    },
                    ScopeVariable {
                        identifier: StringHandle(6),
                        type_id: TypeId::BUFFER,
                        origin: VariableOrigin::Local,
                        is_reference: true,
                    },
                ],
            },
        },
        Instruction::Invoke {
            function: StringHandle(1),
        },
        Instruction::Halt,
        Instruction::BeginEntity {
            tag: EntityTag::FUNCTION,
            name: StringHandle(1),
        },
        Instruction::Push {
            type_id: TypeId::INTEGER,
            value: PushValue::Integer(-42),
        },
        Instruction::Push {
            type_id: TypeId::REAL,
            value: PushValue::Real(3.5),
        },
        Instruction::Push {
            type_id: TypeId::BOOLEAN,
            value: PushValue::Boolean(true),
        },
        Instruction::Push {
            type_id: TypeId::INTEGER16,
            value: PushValue::Integer16(-7),
        },
        Instruction::Push {
            type_id: TypeId::NOTHING,
            value: PushValue::Nothing,
        },
        Instruction::BindRef,
        Instruction::BindMemberRef {
            member: StringHandle(3),
        },
        Instruction::Assign,
        Instruction::BeginChain,
        Instruction::BeginEntity {
            tag: EntityTag::custom(2),
            name: StringHandle(7),
        },
        Instruction::EndEntity,
        Instruction::EndChain,
        Instruction::Return,
        Instruction::EndEntity,
        Instruction::BeginEntity {
            tag: EntityTag::PATTERN_MATCHING_RESOLVER,
            name: StringHandle(8),
        },
        Instruction::PatternMatch {
            target: StringHandle(9),
            params: vec![
                PatternParam {
                    type_id: TypeId::INTEGER,
                    literal: Some(PushValue::Integer(0)),
                },
                PatternParam {
                    type_id: TypeId::INTEGER,
                    literal: None,
                },
            ],
        },
        Instruction::TypeMatch {
            target: StringHandle(10),
            params: vec![TypeMatchParam {
                is_reference: true,
                type_id: TypeId::sum_type(0),
            }],
        },
        Instruction::Halt,
        Instruction::EndEntity,
        Instruction::Tag {
            entity: StringHandle(11),
            key: "external".to_string(),
            items: vec![
                "user32.dll".to_string(),
                "MessageBoxW".to_string(),
                "stdcall".to_string(),
            ],
        },
    ];
    for instruction in &instructions {
        instruction.encode(&mut w).unwrap();
    }
    w.into_bytes()
}

#[test]
fn listing_reassembles_to_identical_bytes() {
    let bytes = sample_stream();
    let listing = disassemble(&bytes).unwrap();
    let reassembled = assemble(&listing).unwrap();
    assert_eq!(reassembled, bytes);
}

#[test]
fn framing_balances_in_sample() {
    epoch_bytecode::validate_framing(&sample_stream()).unwrap();
}

#[test]
fn listing_offsets_are_comments_only() {
    let bytes = sample_stream();
    let listing = disassemble(&bytes).unwrap();
    // Stripping every comment must not change the reassembled bytes.
    let stripped: String = listing
        .lines()
        .map(|line| match line.find("  ; @") {
            Some(pos) => format!("{}\n", &line[..pos]),
            None => format!("{}\n", line),
        })
        .collect();
    assert_eq!(assemble(&stripped).unwrap(), bytes);
}
