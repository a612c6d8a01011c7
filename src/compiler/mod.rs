//! Compiler: source rewriting pre-pass, codegen, and module assembly
//!
//! The full pipeline is `tokenize -> expand_offline_markers -> parse ->
//! check -> compile_checked -> ModuleStream`. [`compile_module`] runs the
//! whole thing; the engine's entry points wrap it for plain and contract
//! modes.

mod codegen;
pub mod rewrite;

pub use rewrite::expand_offline_markers;

use crate::bytecode::{ModuleStream, Prototype, StorageField};
use crate::lexer::{tokenize, SyntaxError};
use crate::parser::ast::Statement;
use crate::parser::{parse_syntax, ParseFailure};
use crate::typecheck::{check, CheckMode, CheckedProgram, ContractRegistry, Type, TypeError};
use thiserror::Error;

/// Codegen-level structural violations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("too many local variables (limit {limit}) declaring '{name}' at line {line}", limit = crate::bytecode::MAX_LOCALS)]
    TooManyLocals { name: String, line: usize },

    #[error("expression too complex: out of registers at line {line}")]
    TooManyRegisters { line: usize },

    #[error("too many constants in one function at line {line}")]
    TooManyConstants { line: usize },

    #[error("too many captured upvalues resolving '{name}'")]
    TooManyUpvalues { name: String },

    #[error("'{name}' at line {line} is not a local, an upvalue, or a whitelisted global")]
    UnresolvedName { name: String, line: usize },

    #[error("cannot write to global '{name}' at line {line}")]
    GlobalWrite { name: String, line: usize },

    #[error("no visible label '{label}' for goto at line {line}")]
    UnresolvedLabel { label: String, line: usize },

    #[error("duplicate label '{label}' at line {line}")]
    DuplicateLabel { label: String, line: usize },

    #[error("break outside of a loop at line {line}")]
    BreakOutsideLoop { line: usize },

    #[error("invalid assignment target at line {line}")]
    InvalidAssignment { line: usize },
}

/// Any failure on the source-to-module path
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
    #[error("{}", render_type_errors(.0))]
    Check(Vec<TypeError>),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

fn render_type_errors(errors: &[TypeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl SourceError {
    /// Structured, line-numbered diagnostics suitable for direct display
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            SourceError::Check(errors) => errors.iter().map(|e| e.to_string()).collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Lower a checked program to its root prototype
pub fn compile_checked(program: &CheckedProgram) -> Result<Prototype, CompileError> {
    codegen::compile_chunk(&program.chunk)
}

/// Full source-to-module pipeline
pub fn compile_module(
    source: &str,
    mode: CheckMode,
    registry: &dyn ContractRegistry,
) -> Result<(ModuleStream, CheckedProgram), SourceError> {
    let tokens = tokenize(source)?;
    let (tokens, offline_names) = expand_offline_markers(&tokens)?;
    let chunk = parse_syntax(&tokens)?;
    let program = check(&chunk, mode, registry).map_err(SourceError::Check)?;
    let bytecode = compile_checked(&program)?;

    let mut stream = ModuleStream::new(bytecode);
    stream.api_names = program.api_names.clone();
    stream.offline_api_names = offline_names;
    stream.event_names = program.event_names.clone();
    stream.storage_schema = storage_schema_of(&program);
    Ok((stream, program))
}

/// Flatten the declared storage record into serializable metadata
fn storage_schema_of(program: &CheckedProgram) -> Vec<StorageField> {
    match &program.storage_type {
        Some(Type::Record(record)) => record
            .fields
            .iter()
            .map(|(name, ty)| StorageField {
                name: name.clone(),
                ty: ty.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn statement_line(statement: &Statement) -> usize {
    match statement {
        Statement::Declare { line, .. }
        | Statement::Assign { line, .. }
        | Statement::ExprStat { line, .. }
        | Statement::If { line, .. }
        | Statement::NumericFor { line, .. }
        | Statement::IterFor { line, .. }
        | Statement::While { line, .. }
        | Statement::Do { line, .. }
        | Statement::FunctionDecl { line, .. }
        | Statement::LocalFunction { line, .. }
        | Statement::Return { line, .. }
        | Statement::Break { line }
        | Statement::Goto { line, .. }
        | Statement::Label { line, .. }
        | Statement::TypeDecl { line, .. } => *line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;
    use crate::typecheck::EmptyRegistry;

    fn compile_plain(source: &str) -> ModuleStream {
        compile_module(source, CheckMode::Plain, &EmptyRegistry)
            .unwrap()
            .0
    }

    fn compile_unchecked(source: &str) -> Result<Prototype, CompileError> {
        let tokens = crate::lexer::tokenize(source).unwrap();
        let chunk = crate::parser::parse_syntax(&tokens).unwrap();
        let program = CheckedProgram {
            chunk,
            normalized_source: String::new(),
            contract_type: None,
            storage_type: None,
            event_names: Vec::new(),
            api_names: Vec::new(),
            bindings: Vec::new(),
        };
        compile_checked(&program)
    }

    #[test]
    fn test_simple_chunk_compiles() {
        let stream = compile_plain("let x = 1\nlet y = x + 2\nreturn y");
        let proto = &stream.bytecode;
        assert!(!proto.instructions.is_empty());
        assert_eq!(proto.instructions.len(), proto.line_info.len());
    }

    #[test]
    fn test_constants_deduplicated() {
        let stream = compile_plain("let a = \"k\"\nlet b = \"k\"\nlet c = \"k\"");
        let strings = stream
            .bytecode
            .constants
            .iter()
            .filter(|c| matches!(c, crate::bytecode::Constant::Str(s) if s == "k"))
            .count();
        assert_eq!(strings, 1);
    }

    #[test]
    fn test_upvalue_capture_descriptors() {
        let source = "function outer()\n\
                      let captured = 1\n\
                      function inner()\nreturn captured\nend\n\
                      return inner\n\
                      end";
        let stream = compile_plain(source);
        let outer = &stream.bytecode.protos[0];
        let inner = &outer.protos[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert_eq!(inner.upvalues[0].name, "captured");
        assert!(inner.upvalues[0].from_parent_stack);
    }

    #[test]
    fn test_transitive_upvalue_capture() {
        let source = "function a()\n\
                      let x = 1\n\
                      function b()\n\
                      function c()\nreturn x\nend\n\
                      return c\n\
                      end\n\
                      return b\n\
                      end";
        let stream = compile_plain(source);
        let b = &stream.bytecode.protos[0].protos[0];
        let c = &b.protos[0];
        // b re-captures x from a's stack; c captures b's upvalue
        assert!(b.upvalues.iter().any(|u| u.name == "x" && u.from_parent_stack));
        assert!(c.upvalues.iter().any(|u| u.name == "x" && !u.from_parent_stack));
    }

    #[test]
    fn test_global_write_rejected_by_codegen() {
        let err = compile_unchecked("print = 1").unwrap_err();
        assert!(matches!(err, CompileError::GlobalWrite { .. }));
    }

    #[test]
    fn test_unresolved_name_rejected_by_codegen() {
        let err = compile_unchecked("let x = mystery").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedName { .. }));
    }

    #[test]
    fn test_too_many_locals() {
        let mut source = String::new();
        for i in 0..=crate::bytecode::MAX_LOCALS {
            source.push_str(&format!("var v{} = {}\n", i, i));
        }
        let err = compile_unchecked(&source).unwrap_err();
        assert!(matches!(err, CompileError::TooManyLocals { .. }));
    }

    #[test]
    fn test_goto_resolution() {
        let stream = compile_plain("var i = 0\n::top::\ni = i + 1\nif i < 3 then\ngoto top\nend");
        assert!(stream
            .bytecode
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Jump { offset } if *offset < 0)));
    }

    #[test]
    fn test_unresolved_goto_rejected() {
        let err = compile_unchecked("goto nowhere").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedLabel { .. }));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let err = compile_unchecked("break").unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn test_line_info_follows_source() {
        let stream = compile_plain("let a = 1\n\nlet b = 2");
        let proto = &stream.bytecode;
        assert!(proto.line_info.contains(&1));
        assert!(proto.line_info.contains(&3));
    }

    #[test]
    fn test_contract_module_metadata() {
        let source = r#"
type Storage = { count: int }
var M: Contract<Storage> = {}
function M:init()
    self.storage.count = 0
end
function M:add(amount: string)
    self.storage.count = self.storage.count + tointeger(amount)
    emit("Added", amount)
end
offline function M:query(_: string)
    return tostring(self.storage.count)
end
return M
"#;
        let (stream, _) =
            compile_module(source, CheckMode::Contract, &EmptyRegistry).unwrap();
        assert_eq!(stream.api_names, vec!["init", "add", "query"]);
        assert_eq!(stream.offline_api_names, vec!["query"]);
        assert_eq!(stream.event_names, vec!["Added"]);
        assert_eq!(stream.storage_schema.len(), 1);
        assert_eq!(stream.storage_schema[0].name, "count");
        assert_eq!(stream.storage_schema[0].ty, "int");
    }

    #[test]
    fn test_deterministic_compilation() {
        let source = "let x = 1\nfunction f(a: int): int\nreturn a + x\nend\nreturn f";
        let a = compile_plain(source);
        let b = compile_plain(source);
        assert_eq!(a.serialize(), b.serialize());
    }
}
