//! Contract loader and sandbox
//!
//! Resolves a contract reference to a module stream, statically verifies
//! the bytecode against the global-access policy, enforces the stored
//! API-set compatibility check, bootstraps the module chunk inside the
//! calling session, and wraps every exported API in a proxy that pushes
//! the contract's identity for the duration of a call.
//!
//! Verification is a linear scan over the compile-time capture graph: each
//! prototype carries its resolved upvalue descriptors, so no recursive
//! re-derivation happens at load time. There is no environment-write
//! instruction in the format at all; on top of that every global read must
//! name a whitelisted identifier, including in hand-crafted bytecode.

use crate::bytecode::{Instruction, ModuleStream, Prototype, UndumpError};
use crate::chain::ContractState;
use crate::typecheck::{is_whitelisted_global, LIFECYCLE_APIS};
use crate::vm::resolver::{ContractResolver, StorageResolver};
use crate::vm::value::{Closure, ContractFn, TableKey};
use crate::vm::{Signal, StopReason, Value, VmError, VmSession};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use thiserror::Error;

/// How a contract is referenced for loading
#[derive(Debug, Clone)]
pub enum ContractRef {
    ByName(String),
    ByAddress(String),
    /// An in-memory stream, used to bootstrap a not-yet-registered contract
    Stream(ModuleStream),
}

impl ContractRef {
    fn describe(&self) -> String {
        match self {
            ContractRef::ByName(name) => format!("name '{}'", name),
            ContractRef::ByAddress(address) => format!("address '{}'", address),
            ContractRef::Stream(_) => "in-memory stream".to_string(),
        }
    }
}

/// Sandbox and verification failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("contract not found by {reference}")]
    ContractNotFound { reference: String },

    #[error("contract {address} is not active")]
    ContractNotActive { address: String },

    #[error("bytecode reads forbidden global '{name}' in function '{function}'")]
    ForbiddenGlobal { name: String, function: String },

    #[error("bytecode verification failed: {details}")]
    MalformedBytecode { details: String },

    #[error("api set mismatch for {address}: stored {stored:?}, loaded {loaded:?}")]
    ApiMismatch {
        address: String,
        stored: Vec<String>,
        loaded: Vec<String>,
    },

    #[error("contract has no api '{name}'")]
    NoSuchApi { name: String },

    #[error(transparent)]
    Undump(#[from] UndumpError),

    #[error("contract bootstrap failed: {details}")]
    Bootstrap { details: String },
}

/// A loaded, verified, bootstrapped contract
#[derive(Debug)]
pub struct LoadedContract {
    pub address: String,
    /// Human name; kept only when the chain knows one (the well-known
    /// contract), anonymous otherwise
    pub name: Option<String>,
    pub stream: ModuleStream,
    /// Module table with `id`, `name` and `storage` injected
    pub module: Value,
    /// Exported API closures after lifecycle stripping
    pub apis: BTreeMap<String, Rc<Closure>>,
}

/// Result of a load that may be interrupted by the stop flag
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(LoadedContract),
    Stopped(StopReason),
}

/// Statically verify a module against the sandbox policy
pub fn verify_module(stream: &ModuleStream) -> Result<(), LoadError> {
    if !stream.bytecode.upvalues.is_empty() {
        return Err(LoadError::MalformedBytecode {
            details: "root prototype cannot capture upvalues".to_string(),
        });
    }
    verify_proto(&stream.bytecode, None)
}

fn verify_proto(proto: &Prototype, parent: Option<&Prototype>) -> Result<(), LoadError> {
    let function = if proto.name.is_empty() {
        "<chunk>".to_string()
    } else {
        proto.name.clone()
    };
    let max_registers = (proto.max_registers as usize)
        .max(proto.param_count as usize)
        .max(1);
    let instruction_count = proto.instructions.len();

    if let Some(parent) = parent {
        for descriptor in &proto.upvalues {
            let in_range = if descriptor.from_parent_stack {
                (descriptor.index as usize)
                    < (parent.max_registers as usize).max(parent.param_count as usize).max(1)
            } else {
                (descriptor.index as usize) < parent.upvalues.len()
            };
            if !in_range {
                return Err(LoadError::MalformedBytecode {
                    details: format!(
                        "upvalue '{}' of '{}' does not resolve in the enclosing function",
                        descriptor.name, function
                    ),
                });
            }
        }
    }

    let reg_ok = |reg: u8| (reg as usize) < max_registers;
    let const_ok = |index: u32| (index as usize) < proto.constants.len();
    let jump_ok = |pc: usize, offset: i32| {
        let target = pc as i64 + 1 + offset as i64;
        target >= 0 && target as usize <= instruction_count
    };
    let fail = |details: String| Err(LoadError::MalformedBytecode { details });

    for (pc, instruction) in proto.instructions.iter().enumerate() {
        let ok = match instruction {
            Instruction::Move { dst, src } => reg_ok(*dst) && reg_ok(*src),
            Instruction::LoadConst { dst, k } => reg_ok(*dst) && const_ok(*k),
            Instruction::LoadBool { dst, .. } => reg_ok(*dst),
            Instruction::LoadNil { dst, count } => {
                reg_ok(*dst) && (*dst as usize + *count as usize) <= max_registers
            }
            Instruction::GetGlobal { dst, name_k } => {
                if !reg_ok(*dst) || !const_ok(*name_k) {
                    false
                } else {
                    match &proto.constants[*name_k as usize] {
                        crate::bytecode::Constant::Str(name) => {
                            if !is_whitelisted_global(name) {
                                return Err(LoadError::ForbiddenGlobal {
                                    name: name.clone(),
                                    function: function.clone(),
                                });
                            }
                            true
                        }
                        _ => false,
                    }
                }
            }
            Instruction::GetUpvalue { dst, index } => {
                reg_ok(*dst) && (*index as usize) < proto.upvalues.len()
            }
            Instruction::SetUpvalue { src, index } => {
                reg_ok(*src) && (*index as usize) < proto.upvalues.len()
            }
            Instruction::NewTable { dst } => reg_ok(*dst),
            Instruction::GetField { dst, obj, key_k } => {
                reg_ok(*dst) && reg_ok(*obj) && const_ok(*key_k)
            }
            Instruction::SetField { obj, key_k, src } => {
                reg_ok(*obj) && reg_ok(*src) && const_ok(*key_k)
            }
            Instruction::GetIndex { dst, obj, idx } => {
                reg_ok(*dst) && reg_ok(*obj) && reg_ok(*idx)
            }
            Instruction::SetIndex { obj, idx, src } => {
                reg_ok(*obj) && reg_ok(*idx) && reg_ok(*src)
            }
            Instruction::GetMethod { dst, obj, key_k } => {
                (*dst as usize + 2) <= max_registers && reg_ok(*obj) && const_ok(*key_k)
            }
            Instruction::AppendList { obj, start, count } => {
                reg_ok(*obj) && (*start as usize + *count as usize) <= max_registers
            }
            Instruction::Arith { dst, lhs, rhs, .. } => {
                reg_ok(*dst) && reg_ok(*lhs) && reg_ok(*rhs)
            }
            Instruction::Unary { dst, src, .. } => reg_ok(*dst) && reg_ok(*src),
            Instruction::Compare { dst, lhs, rhs, .. } => {
                reg_ok(*dst) && reg_ok(*lhs) && reg_ok(*rhs)
            }
            Instruction::Concat { dst, start, count } => {
                reg_ok(*dst) && (*start as usize + *count as usize) <= max_registers
            }
            Instruction::Jump { offset } => jump_ok(pc, *offset),
            Instruction::TestJump { reg, offset, .. } => reg_ok(*reg) && jump_ok(pc, *offset),
            Instruction::Call { base, args } => {
                (*base as usize + *args as usize + 1) <= max_registers
            }
            Instruction::Closure { dst, proto: index } => {
                reg_ok(*dst) && (*index as usize) < proto.protos.len()
            }
            Instruction::Return { src, has_value } => !*has_value || reg_ok(*src),
            Instruction::ForPrep { base, offset } | Instruction::ForLoop { base, offset } => {
                (*base as usize + 4) <= max_registers && jump_ok(pc, *offset)
            }
            Instruction::IterPrep { base } => (*base as usize + 3) <= max_registers,
            Instruction::IterNext { base, offset } => {
                (*base as usize + 3) <= max_registers && jump_ok(pc, *offset)
            }
        };
        if !ok {
            return fail(format!(
                "instruction {} of '{}' has out-of-range operands",
                pc, function
            ));
        }
    }

    if proto.line_info.len() != instruction_count {
        return fail(format!("line table of '{}' is inconsistent", function));
    }

    for child in &proto.protos {
        verify_proto(child, Some(proto))?;
    }
    Ok(())
}

/// Resolve a reference to (address, optional name, stream, bootstrap flag)
pub fn resolve_reference(
    session: &VmSession,
    reference: &ContractRef,
) -> Result<(String, Option<String>, ModuleStream, bool), LoadError> {
    match reference {
        ContractRef::ByName(name) => {
            let address = session
                .chain
                .get_contract_address_by_name(name)
                .ok_or_else(|| LoadError::ContractNotFound {
                    reference: reference.describe(),
                })?;
            let stream =
                session
                    .chain
                    .open_contract(name)
                    .ok_or_else(|| LoadError::ContractNotFound {
                        reference: reference.describe(),
                    })?;
            Ok((address, Some(name.clone()), stream, false))
        }
        ContractRef::ByAddress(address) => {
            let stream = session
                .chain
                .open_contract_by_address(address)
                .ok_or_else(|| LoadError::ContractNotFound {
                    reference: reference.describe(),
                })?;
            Ok((address.clone(), None, stream, false))
        }
        ContractRef::Stream(stream) => Ok((stream.derive_address(), None, stream.clone(), true)),
    }
}

/// Load, verify and bootstrap a contract in the given session
pub fn load(session: &mut VmSession, reference: &ContractRef) -> Result<LoadOutcome, LoadError> {
    let (address, name, stream, bootstrap) = resolve_reference(session, reference)?;

    // a contract that is not active may only be touched by its own
    // bootstrap execution
    if !bootstrap && session.chain.contract_state(&address) != ContractState::Active {
        return Err(LoadError::ContractNotActive { address });
    }

    verify_module(&stream)?;

    // upgrade-compatibility: a previously stored api-name set must match
    // the loaded one exactly
    if let Some(stored) = session.chain.get_stored_contract_info_by_address(&address) {
        let stored_set: BTreeSet<&String> = stored.api_names.iter().collect();
        let loaded_set: BTreeSet<&String> = stream.api_names.iter().collect();
        if stored_set != loaded_set {
            return Err(LoadError::ApiMismatch {
                address,
                stored: stored.api_names.clone(),
                loaded: stream.api_names.clone(),
            });
        }
    }

    debug!("bootstrapping contract {}", address);
    let proto = Rc::new(stream.bytecode.clone());
    let module_value = match session.execute_proto_raw(proto) {
        Ok(Signal::Value(value)) => value,
        Ok(Signal::Stopped(reason)) => return Ok(LoadOutcome::Stopped(reason)),
        Err(fault) => {
            return Err(LoadError::Bootstrap {
                details: fault.to_string(),
            })
        }
    };

    let module_table = match &module_value {
        Value::Table(table) => Rc::clone(table),
        other => {
            return Err(LoadError::Bootstrap {
                details: format!("contract chunk returned {}, expected a table", other.type_name()),
            })
        }
    };

    // inject the reserved identity fields and the storage resolver
    {
        let mut table = module_table.borrow_mut();
        table.set(TableKey::Str("id".into()), Value::from_str(&address));
        table.set(
            TableKey::Str("name".into()),
            Value::from_str(name.as_deref().unwrap_or(address.as_str())),
        );
        table.set(
            TableKey::Str("storage".into()),
            Value::Resolver(Rc::new(StorageResolver {
                contract_id: address.clone(),
            })),
        );
    }

    // collect exported apis, stripping lifecycle names unless this is the
    // call's starting contract
    let is_starting = session.ctx.starting_contract.as_deref() == Some(address.as_str());
    let mut apis = BTreeMap::new();
    for api in &stream.api_names {
        if !is_starting && LIFECYCLE_APIS.contains(&api.as_str()) {
            continue;
        }
        if let Value::Closure(closure) = module_table.borrow().get(&TableKey::Str(api.clone())) {
            apis.insert(api.clone(), closure);
        }
    }

    Ok(LoadOutcome::Loaded(LoadedContract {
        address,
        name,
        stream,
        module: module_value,
        apis,
    }))
}

/// `import_contract(name)` builtin
pub fn import_contract(session: &mut VmSession, name: &str) -> Result<Signal, VmError> {
    import(session, ContractRef::ByName(name.to_string()))
}

/// `import_contract_from_address(address)` builtin
pub fn import_contract_by_address(
    session: &mut VmSession,
    address: &str,
) -> Result<Signal, VmError> {
    import(session, ContractRef::ByAddress(address.to_string()))
}

fn import(session: &mut VmSession, reference: ContractRef) -> Result<Signal, VmError> {
    let cache_key = match &reference {
        ContractRef::ByName(name) => session
            .chain
            .get_contract_address_by_name(name)
            .unwrap_or_else(|| format!("name:{}", name)),
        ContractRef::ByAddress(address) => address.clone(),
        ContractRef::Stream(stream) => stream.derive_address(),
    };
    if let Some(cached) = session.import_cache.get(&cache_key) {
        return Ok(Signal::Value(cached.clone()));
    }

    let loaded = match load(session, &reference).map_err(|e| VmError::ScriptError {
        message: e.to_string(),
    })? {
        LoadOutcome::Loaded(loaded) => loaded,
        LoadOutcome::Stopped(reason) => return Ok(Signal::Stopped(reason)),
    };

    let mut exports = BTreeMap::new();
    for (api, closure) in &loaded.apis {
        exports.insert(
            api.clone(),
            Value::ContractFn(Rc::new(ContractFn {
                address: loaded.address.clone(),
                contract_name: loaded.name.clone(),
                closure: Rc::clone(closure),
                module: loaded.module.clone(),
            })),
        );
    }
    let proxy = Value::Resolver(Rc::new(ContractResolver {
        address: loaded.address.clone(),
        name: loaded.name.clone(),
        exports,
    }));
    session.import_cache.insert(cache_key, proxy.clone());
    Ok(Signal::Value(proxy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Constant;
    use crate::chain::InMemoryChain;
    use crate::compiler::compile_module;
    use crate::typecheck::{CheckMode, EmptyRegistry};
    use std::sync::Arc;

    fn compiled(source: &str) -> ModuleStream {
        compile_module(source, CheckMode::Plain, &EmptyRegistry)
            .unwrap()
            .0
    }

    #[test]
    fn test_verify_accepts_compiler_output() {
        let stream = compiled("let x = 1\nfunction f()\nreturn x\nend\nreturn f");
        verify_module(&stream).unwrap();
    }

    #[test]
    fn test_verify_rejects_forbidden_global() {
        // hand-craft a global read that names a non-whitelisted identifier
        let mut stream = compiled("return print");
        let proto = &mut stream.bytecode;
        for constant in proto.constants.iter_mut() {
            if let Constant::Str(s) = constant {
                if s == "print" {
                    *s = "_G".to_string();
                }
            }
        }
        let err = verify_module(&stream).unwrap_err();
        assert!(matches!(err, LoadError::ForbiddenGlobal { name, .. } if name == "_G"));
    }

    #[test]
    fn test_verify_rejects_bad_upvalue_descriptor() {
        let mut stream = compiled(
            "function outer()\nlet captured = 1\nfunction inner()\nreturn captured\nend\nreturn inner\nend",
        );
        stream.bytecode.protos[0].protos[0].upvalues[0].index = 200;
        let err = verify_module(&stream).unwrap_err();
        assert!(matches!(err, LoadError::MalformedBytecode { .. }));
    }

    #[test]
    fn test_verify_rejects_out_of_range_operands() {
        let mut stream = compiled("return 1");
        stream.bytecode.instructions[0] = Instruction::Move { dst: 200, src: 0 };
        let err = verify_module(&stream).unwrap_err();
        assert!(matches!(err, LoadError::MalformedBytecode { .. }));
    }

    #[test]
    fn test_load_unknown_contract_fails() {
        let chain = Arc::new(InMemoryChain::new());
        let mut session = VmSession::new(chain);
        let err = load(&mut session, &ContractRef::ByName("ghost".into())).unwrap_err();
        assert!(matches!(err, LoadError::ContractNotFound { .. }));
    }
}
