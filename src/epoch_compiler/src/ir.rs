use crate::strings::StringPool;
use epoch_bytecode::{EntityTag, ScopeDescription, ScopeVariable, StringHandle, TypeId, VariableOrigin};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The validated semantic IR handed to code generation. Every identifier
/// is already a pooled string handle and every callee is resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub strings: StringPool,
    pub structures: Vec<Structure>,
    pub sum_types: Vec<SumType>,
    /// Every lexical scope in the program, parents before children.
    pub scopes: Vec<ScopeDescription>,
    pub functions: Vec<Function>,
    pub global_blocks: Vec<CodeBlock>,
    pub entrypoint: StringHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub name: StringHandle,
    pub type_id: TypeId,
    pub members: Vec<StructureMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureMember {
    pub name: StringHandle,
    pub type_id: TypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumType {
    pub name: StringHandle,
    pub type_id: TypeId,
    pub bases: Vec<TypeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: StringHandle,
    /// Name of the function's lexical scope (usually the function name).
    pub scope: StringHandle,
    pub body: FunctionBody,
    /// Entity metadata tags, e.g. `external` with (dll, symbol,
    /// calling convention) items.
    pub tags: Vec<TagMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FunctionBody {
    Code(CodeBlock),
    /// Synthesized structure member accessor; see
    /// [`Program::finalize`].
    MemberAccessor {
        structure_var: StringHandle,
        member_var: StringHandle,
    },
    /// Runtime pattern dispatch among overload targets.
    PatternResolver(Vec<PatternOverload>),
    /// Runtime type dispatch on sum-typed arguments.
    TypeResolver(Vec<TypeOverload>),
    /// Declared externally; the body lives in a foreign binary and the
    /// `external` tag carries the binding.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMetadata {
    pub key: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternOverload {
    pub target: StringHandle,
    pub params: Vec<PatternSignatureParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignatureParam {
    pub type_id: TypeId,
    /// `Some` for `@@patternmatched` parameters.
    pub literal: Option<PatternLiteral>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PatternLiteral {
    Integer(i32),
    Integer16(i16),
    Real(f32),
    Boolean(bool),
    Str(StringHandle),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeOverload {
    pub target: StringHandle,
    pub params: Vec<TypeSignatureParam>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TypeSignatureParam {
    pub is_reference: bool,
    pub type_id: TypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Name of the lexical scope attached to this block.
    pub scope: StringHandle,
    pub entries: Vec<CodeBlockEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CodeBlockEntry {
    Assignment(Assignment),
    Statement(Statement),
    PreOpStatement(OpStatement),
    PostOpStatement(OpStatement),
    InnerBlock(CodeBlock),
    Entity(EntityEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub name: StringHandle,
    pub parameters: Vec<Expression>,
}

/// Pre/post increment-like statement: an operator applied to an l-value
/// member chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpStatement {
    pub operator: StringHandle,
    pub operand: Vec<StringHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// L-value member chain `[id, m1, m2, ...]`.
    pub lhs: Vec<StringHandle>,
    pub operator: StringHandle,
    pub rhs: AssignmentRhs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssignmentRhs {
    Expression(Expression),
    /// Right-associative chained assignment `a = b = c`.
    Nested(Box<Assignment>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    /// Atoms in emission order; precedence was normalized upstream.
    pub atoms: Vec<ExpressionAtom>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExpressionAtom {
    Parenthetical(Expression),
    Identifier(StringHandle),
    Operator(StringHandle),
    LiteralString(StringHandle),
    LiteralBoolean(bool),
    LiteralInteger(i32),
    /// Carried as 32 bits; narrowing is checked at emission so an
    /// overflow is a compile-time error, never a silent truncation.
    LiteralInteger16(i32),
    LiteralReal(f32),
    Statement(Box<Statement>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub primary: Entity,
    pub chain: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub tag: EntityTag,
    /// Name of the attached lexical scope.
    pub name: StringHandle,
    pub parameters: Vec<Expression>,
    pub code: CodeBlock,
}

impl Program {
    pub fn has_function(&self, name: StringHandle) -> bool {
        self.functions.iter().any(|f| f.name == name)
    }

    pub fn function(&self, name: StringHandle) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn scope_by_name(&self, name: StringHandle) -> Option<&ScopeDescription> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn structure_by_type(&self, type_id: TypeId) -> Option<&Structure> {
        self.structures.iter().find(|s| s.type_id == type_id)
    }

    pub fn sum_type_by_type(&self, type_id: TypeId) -> Option<&SumType> {
        self.sum_types.iter().find(|s| s.type_id == type_id)
    }

    pub fn member_type(&self, structure_type: TypeId, member: StringHandle) -> Option<TypeId> {
        self.structure_by_type(structure_type)?
            .members
            .iter()
            .find(|m| m.name == member)
            .map(|m| m.type_id)
    }

    /// Resolve a variable's declared type by walking the scope chain
    /// from `scope` toward the global root.
    pub fn variable_type(&self, scope: StringHandle, identifier: StringHandle) -> Option<TypeId> {
        let mut current = self.scope_by_name(scope);
        while let Some(desc) = current {
            if let Some((_, var)) = desc.variable(identifier) {
                return Some(var.type_id);
            }
            if desc.parent.is_null() {
                break;
            }
            current = self.scope_by_name(desc.parent);
        }
        None
    }

    /// Name of the member-access overload installed for
    /// `(structure type, member)`; present after [`Program::finalize`].
    pub fn member_accessor(&self, structure_type: TypeId, member: StringHandle) -> Option<StringHandle> {
        let structure = self.structure_by_type(structure_type)?;
        let name = format!(
            "{}.{}",
            self.strings.get(structure.name)?,
            self.strings.get(member)?
        );
        self.strings.find(&name)
    }

    /// Run the semantic layer's installation passes: member-accessor
    /// synthesis and operator overload resolution. Idempotent, and must
    /// run before code generation so every synthesized name lands in
    /// the string pool.
    pub fn finalize(&mut self) {
        self.install_member_accessors();
        self.resolve_operator_overloads();
    }

    /// Install the member-accessor overloads the emitter's member-chain
    /// read rule invokes: for every structure `S` with member `m`, a
    /// function `S.m` taking `(structure, member identifier)` whose body
    /// copies the named member into the return register.
    fn install_member_accessors(&mut self) {
        let structure_param = self.strings.pool("@structure");
        let member_param = self.strings.pool("@member");
        let mut accessors: Vec<(String, TypeId)> = Vec::new();
        for structure in &self.structures {
            let struct_name = match self.strings.get(structure.name) {
                Some(name) => name.to_string(),
                None => continue,
            };
            for member in &structure.members {
                if let Some(member_name) = self.strings.get(member.name) {
                    accessors.push((
                        format!("{}.{}", struct_name, member_name),
                        structure.type_id,
                    ));
                }
            }
        }
        for (accessor_name, structure_type) in accessors {
            if self
                .strings
                .find(&accessor_name)
                .map(|h| self.has_function(h))
                .unwrap_or(false)
            {
                continue;
            }
            let name = self.strings.pool(&accessor_name);
            let mut scope = ScopeDescription::new(name, StringHandle::NULL);
            scope.variables.push(ScopeVariable {
                identifier: structure_param,
                type_id: structure_type,
                origin: VariableOrigin::Parameter,
                is_reference: false,
            });
            scope.variables.push(ScopeVariable {
                identifier: member_param,
                type_id: TypeId::IDENTIFIER,
                origin: VariableOrigin::Parameter,
                is_reference: false,
            });
            self.scopes.push(scope);
            self.functions.push(Function {
                name,
                scope: name,
                body: FunctionBody::MemberAccessor {
                    structure_var: structure_param,
                    member_var: member_param,
                },
                tags: Vec::new(),
            });
        }
    }

    /// Resolve operator invocations to the overload matching their
    /// operand types. Integer operands keep the surface name; Integer16,
    /// Real, and Boolean operands rewrite to the `@@`-mangled overload
    /// the runtime's typed operator natives answer to. Operand types are
    /// tracked by simulating each expression's value stack; positions
    /// whose type cannot be decided locally are left on the surface
    /// name.
    fn resolve_operator_overloads(&mut self) {
        let env = OverloadEnv {
            function_names: self.functions.iter().map(|f| f.name).collect(),
            return_types: self
                .functions
                .iter()
                .filter_map(|f| {
                    let scope = self.scope_by_name(f.scope)?;
                    let ret = scope
                        .variables
                        .iter()
                        .find(|v| v.origin == VariableOrigin::Return)?;
                    Some((f.name, ret.type_id))
                })
                .collect(),
        };
        let mut functions = std::mem::take(&mut self.functions);
        for function in &mut functions {
            if let FunctionBody::Code(block) = &mut function.body {
                self.resolve_block(block, &env);
            }
        }
        self.functions = functions;
        let mut globals = std::mem::take(&mut self.global_blocks);
        for block in &mut globals {
            self.resolve_block(block, &env);
        }
        self.global_blocks = globals;
    }

    fn resolve_block(&mut self, block: &mut CodeBlock, env: &OverloadEnv) {
        let scope = block.scope;
        for entry in &mut block.entries {
            match entry {
                CodeBlockEntry::Assignment(assignment) => {
                    self.resolve_assignment(assignment, scope, env);
                }
                CodeBlockEntry::Statement(statement) => {
                    self.resolve_statement(statement, scope, env);
                }
                // Pre/post operators are unary at the surface and keep
                // their names; hosts register them as they see fit.
                CodeBlockEntry::PreOpStatement(_) | CodeBlockEntry::PostOpStatement(_) => {}
                CodeBlockEntry::InnerBlock(inner) => self.resolve_block(inner, env),
                CodeBlockEntry::Entity(entry) => {
                    self.resolve_entity(&mut entry.primary, scope, env);
                    for chained in &mut entry.chain {
                        self.resolve_entity(chained, scope, env);
                    }
                }
            }
        }
    }

    fn resolve_entity(&mut self, entity: &mut Entity, enclosing: StringHandle, env: &OverloadEnv) {
        for parameter in &mut entity.parameters {
            self.resolve_expression(parameter, enclosing, env);
        }
        self.resolve_block(&mut entity.code, env);
    }

    fn resolve_assignment(&mut self, assignment: &mut Assignment, scope: StringHandle, env: &OverloadEnv) {
        match &mut assignment.rhs {
            AssignmentRhs::Expression(expression) => {
                self.resolve_expression(expression, scope, env);
            }
            AssignmentRhs::Nested(inner) => self.resolve_assignment(inner, scope, env),
        }
        if self.strings.get(assignment.operator) != Some("=") {
            let operand = self.lvalue_type(&assignment.lhs, scope);
            if let Some(rewritten) = self.overload_for(assignment.operator, operand, operand) {
                assignment.operator = rewritten;
            }
        }
    }

    fn resolve_statement(
        &mut self,
        statement: &mut Statement,
        scope: StringHandle,
        env: &OverloadEnv,
    ) -> Option<TypeId> {
        for parameter in &mut statement.parameters {
            self.resolve_expression(parameter, scope, env);
        }
        env.return_types.get(&statement.name).copied()
    }

    fn resolve_expression(
        &mut self,
        expression: &mut Expression,
        scope: StringHandle,
        env: &OverloadEnv,
    ) -> Option<TypeId> {
        let mut types: Vec<Option<TypeId>> = Vec::new();
        for atom in &mut expression.atoms {
            match atom {
                ExpressionAtom::Parenthetical(inner) => {
                    let inner_type = self.resolve_expression(inner, scope, env);
                    types.push(inner_type);
                }
                ExpressionAtom::Identifier(identifier) => {
                    let atom_type = if env.function_names.contains(identifier) {
                        Some(TypeId::FUNCTION)
                    } else {
                        self.variable_type(scope, *identifier)
                    };
                    types.push(atom_type);
                }
                ExpressionAtom::Operator(operator) => {
                    let rhs = types.pop().flatten();
                    let lhs = types.pop().flatten();
                    let comparison = matches!(
                        self.strings.get(*operator),
                        Some("==" | "!=" | "<" | ">" | "<=" | ">=")
                    );
                    if let Some(rewritten) = self.overload_for(*operator, lhs, rhs) {
                        *operator = rewritten;
                    }
                    types.push(if comparison { Some(TypeId::BOOLEAN) } else { lhs });
                }
                ExpressionAtom::LiteralString(_) => types.push(Some(TypeId::STRING)),
                ExpressionAtom::LiteralBoolean(_) => types.push(Some(TypeId::BOOLEAN)),
                ExpressionAtom::LiteralInteger(_) => types.push(Some(TypeId::INTEGER)),
                ExpressionAtom::LiteralInteger16(_) => types.push(Some(TypeId::INTEGER16)),
                ExpressionAtom::LiteralReal(_) => types.push(Some(TypeId::REAL)),
                ExpressionAtom::Statement(statement) => {
                    let result = self.resolve_statement(statement, scope, env);
                    types.push(result);
                }
            }
        }
        types.pop().flatten()
    }

    fn lvalue_type(&self, chain: &[StringHandle], scope: StringHandle) -> Option<TypeId> {
        let (&head, members) = chain.split_first()?;
        let mut current = self.variable_type(scope, head)?;
        for &member in members {
            current = self.member_type(current, member)?;
        }
        Some(current)
    }

    fn overload_for(
        &mut self,
        operator: StringHandle,
        lhs: Option<TypeId>,
        rhs: Option<TypeId>,
    ) -> Option<StringHandle> {
        let (lhs, rhs) = (lhs?, rhs?);
        if lhs != rhs {
            return None;
        }
        let base = self.strings.get(operator)?.to_string();
        let comparison = matches!(base.as_str(), "==" | "!=" | "<" | ">" | "<=" | ">=");
        let arithmetic = matches!(base.as_str(), "+" | "-" | "*" | "/");
        let suffix = match lhs {
            TypeId::INTEGER16 if comparison || arithmetic => "integer16",
            TypeId::REAL if comparison || arithmetic => "real",
            TypeId::BOOLEAN if matches!(base.as_str(), "==" | "!=") => "boolean",
            _ => return None,
        };
        Some(self.strings.pool(&format!("{}@@{}", base, suffix)))
    }
}

struct OverloadEnv {
    function_names: HashSet<StringHandle>,
    return_types: HashMap<StringHandle, TypeId>,
}
