//! Contract-mode validation
//!
//! Applied after the general walk: the chunk must return a value of the
//! reserved `Contract<S>` record type, the storage schema is restricted to
//! storable field kinds, and the exported API set (used for the module
//! metadata and the loader's compatibility check) is collected from the
//! returned module table.

use super::types::Type;
use super::Checker;
use crate::parser::ast::{Chunk, Expr, FunctionTarget, Statement, TableKeyExpr};

/// Result of contract-mode validation
pub struct ContractOutcome {
    pub contract_type: Option<Type>,
    pub storage_type: Option<Type>,
    pub api_names: Vec<String>,
}

pub(crate) fn validate_contract(checker: &mut Checker<'_>, chunk: &Chunk) -> ContractOutcome {
    let return_line = if checker.chunk_return_line > 0 {
        checker.chunk_return_line
    } else {
        last_line(chunk)
    };

    let (contract_type, storage_type) = match checker.chunk_return_type.clone() {
        None => {
            checker.error(return_line, "contract must return a contract table");
            (None, None)
        }
        Some(Type::Record(record)) if record.name == "Contract" => {
            let storage = record.field("storage").cloned();
            if let Some(Type::Record(storage_record)) = &storage {
                for (field, ty) in &storage_record.fields {
                    if !Checker::storage_field_allowed(ty) {
                        checker.error(
                            return_line,
                            format!(
                                "storage property '{}' has disallowed type {} \
                                 (allowed: int, number, bool, string, table, record)",
                                field, ty
                            ),
                        );
                    }
                }
            }
            (Some(Type::Record(record)), storage)
        }
        Some(other) => {
            checker.error(
                return_line,
                format!("contract must return a value of type Contract<S>, got {}", other),
            );
            (None, None)
        }
    };

    let api_names = match checker.returned_name.clone() {
        Some(name) => collect_module_apis(chunk, &name),
        None => Vec::new(),
    };

    if !api_names.iter().any(|n| n == "init") {
        checker.error(return_line, "contract must have init function");
    }

    ContractOutcome {
        contract_type,
        storage_type,
        api_names,
    }
}

/// Exported API names of the module table bound to `module_name`, in
/// declaration order: `function M.x` / `function M:x` declarations,
/// function-valued fields in M's constructor, and `M.x = function` forms
pub fn collect_module_apis(chunk: &Chunk, module_name: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };

    for statement in &chunk.block.statements {
        match statement {
            Statement::Declare {
                names: decl_names,
                exprs,
                ..
            } => {
                for (i, decl_name) in decl_names.iter().enumerate() {
                    if decl_name != module_name {
                        continue;
                    }
                    if let Some(Expr::Table { map_items, .. }) = exprs.get(i) {
                        for (key, value) in map_items {
                            if let (TableKeyExpr::Name(field), Expr::Function { .. }) = (key, value)
                            {
                                push(field);
                            }
                        }
                    }
                }
            }
            Statement::FunctionDecl { target, .. } => match target {
                FunctionTarget::Member { table, name } | FunctionTarget::Method { table, name }
                    if table == module_name =>
                {
                    push(name);
                }
                _ => {}
            },
            Statement::Assign { targets, exprs, .. } => {
                for (i, target) in targets.iter().enumerate() {
                    if let Expr::Member { object, name, .. } = target {
                        if let Expr::Name { name: obj, .. } = object.as_ref() {
                            if obj == module_name
                                && matches!(exprs.get(i), Some(Expr::Function { .. }))
                            {
                                push(name);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    names
}

fn last_line(chunk: &Chunk) -> usize {
    chunk
        .block
        .statements
        .last()
        .map(statement_line)
        .unwrap_or(1)
}

fn statement_line(statement: &Statement) -> usize {
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
    use crate::lexer::tokenize;
    use crate::parser::parse_syntax;
    use crate::typecheck::{check, CheckMode, EmptyRegistry, TypeError};

    fn check_contract(source: &str) -> Result<(), Vec<TypeError>> {
        let chunk = parse_syntax(&tokenize(source).unwrap()).unwrap();
        check(&chunk, CheckMode::Contract, &EmptyRegistry).map(|_| ())
    }

    const COUNTER: &str = r#"
type Storage = { count: int }
var M: Contract<Storage> = {}
function M:init()
    self.storage.count = 0
end
function M:add(amount: string)
    self.storage.count = self.storage.count + tointeger(amount)
end
offline function M:query(_: string)
    return tostring(self.storage.count)
end
return M
"#;

    #[test]
    fn test_counter_contract_checks() {
        // the offline marker is expanded before parsing in the real
        // pipeline; strip it here to check the core rules
        let source = COUNTER.replace("offline function", "function");
        check_contract(&source).unwrap();
    }

    #[test]
    fn test_contract_without_init_rejected() {
        let source = "type Storage = { count: int }\n\
                      var M: Contract<Storage> = {}\n\
                      function M:get()\nreturn 1\nend\n\
                      return M";
        let errors = check_contract(source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "contract must have init function"));
    }

    #[test]
    fn test_contract_must_return_contract_type() {
        let source = "var M = {}\nfunction M:init()\nend\nreturn M";
        let errors = check_contract(source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Contract<S>")));
    }

    #[test]
    fn test_storage_field_whitelist() {
        let source = "type Storage = { cb: (int) => int }\n\
                      var M: Contract<Storage> = {}\n\
                      function M:init()\nend\n\
                      return M";
        let errors = check_contract(source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("storage property 'cb' has disallowed type")));
    }

    #[test]
    fn test_lifecycle_call_rejected() {
        let source = "type Storage = { count: int }\n\
                      var M: Contract<Storage> = {}\n\
                      function M:init()\nend\n\
                      function M:poke()\n  self:on_destroy()\nend\n\
                      return M";
        let errors = check_contract(source).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("lifecycle api 'on_destroy'")));
    }
}
