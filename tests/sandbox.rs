//! Sandbox invariants: upgrade compatibility, verification, state checks

use chainscript::bytecode::Constant;
use chainscript::chain::{ChainApi, ContractState, InMemoryChain};
use chainscript::engine::ScriptEngine;
use chainscript::errors::EngineError;
use chainscript::loader::{self, ContractRef, LoadError};
use chainscript::vm::VmSession;
use std::sync::Arc;

const TWO_APIS: &str = r#"
type Storage = { v: int }
var M: Contract<Storage> = {}
function M:init()
    self.storage.v = 0
end
function M:start(_: string)
    self.storage.v = 1
end
function M:get(_: string)
    return tostring(self.storage.v)
end
return M
"#;

const ONE_API: &str = r#"
type Storage = { v: int }
var M: Contract<Storage> = {}
function M:init()
    self.storage.v = 0
end
function M:start(_: string)
    self.storage.v = 1
end
return M
"#;

#[test]
fn test_api_set_mismatch_fails_load() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);

    // stored metadata says {init, start, get}; the loaded bytecode only
    // exports {init, start} - the upgrade silently dropped an api
    let full = engine.compile_contract(TWO_APIS).unwrap();
    let reduced = engine.compile_contract(ONE_API).unwrap();
    chain.set_stored_contract_info(&reduced.derive_address(), full.api_names.clone());

    let mut session = VmSession::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let err = loader::load(&mut session, &ContractRef::Stream(reduced))
        .err()
        .expect("load must fail");
    match err {
        LoadError::ApiMismatch { stored, loaded, .. } => {
            assert!(stored.contains(&"get".to_string()));
            assert!(!loaded.contains(&"get".to_string()));
        }
        other => panic!("expected api mismatch, got {:?}", other),
    }
}

#[test]
fn test_equal_api_sets_load_fine() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let stream = engine.compile_contract(TWO_APIS).unwrap();
    let address = chain.register_contract(Some("c"), stream);

    let receipt = engine
        .execute_contract_api(ContractRef::ByAddress(address), "init", "", false, None)
        .unwrap();
    assert!(receipt.committed);
}

#[test]
fn test_destroyed_contract_cannot_load() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let stream = engine.compile_contract(TWO_APIS).unwrap();
    let address = chain.register_contract(Some("c"), stream);
    chain.set_contract_state(&address, ContractState::Destroyed);

    let err = engine
        .execute_contract_api(ContractRef::ByAddress(address), "start", "", false, None)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Load(LoadError::ContractNotActive { .. })
    ));
}

#[test]
fn test_handcrafted_forbidden_global_rejected() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let mut stream = engine.compile("return print").unwrap();

    // rewrite the global name constant so the bytecode reads _ENV
    for constant in stream.bytecode.constants.iter_mut() {
        if let Constant::Str(s) = constant {
            if s == "print" {
                *s = "_ENV".to_string();
            }
        }
    }
    let err = loader::verify_module(&stream).unwrap_err();
    assert!(matches!(err, LoadError::ForbiddenGlobal { name, .. } if name == "_ENV"));
}

#[test]
fn test_forbidden_global_faults_at_runtime_too() {
    // even without going through the loader, the interpreter rejects a
    // non-whitelisted global read
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let mut stream = engine.compile("return print").unwrap();
    for constant in stream.bytecode.constants.iter_mut() {
        if let Constant::Str(s) = constant {
            if s == "print" {
                *s = "_G".to_string();
            }
        }
    }
    let err = engine.execute(&stream, None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Fault(chainscript::VmError::ForbiddenGlobal { .. })
    ));
}

#[test]
fn test_import_of_nonexistent_contract_is_collected_type_error() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let source = r#"
type Storage = { v: int }
var M: Contract<Storage> = {}
function M:init()
    let a = import_contract("missing-one")
    let b = import_contract("missing-two")
end
return M
"#;
    let err = engine.compile_contract(source).unwrap_err();
    let diagnostics = err.diagnostics();
    // both missing imports are reported in one pass
    assert!(diagnostics.iter().any(|d| d.contains("missing-one")));
    assert!(diagnostics.iter().any(|d| d.contains("missing-two")));
}
