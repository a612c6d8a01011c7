//! Storage change tracking: rollback on fault, commit atomicity

use chainscript::chain::{ChainApi, InMemoryChain};
use chainscript::engine::ScriptEngine;
use chainscript::errors::EngineError;
use chainscript::loader::ContractRef;
use chainscript::storage::StorageValue;
use std::sync::Arc;

const FAULTY: &str = r#"
type Storage = { k: int }
var M: Contract<Storage> = {}
function M:init()
    self.storage.k = 1
end
function M:boom(_: string)
    self.storage.k = 5
    error("deliberate fault after the write")
end
function M:set_then_stop(_: string)
    self.storage.k = 9
    while true do
    end
end
return M
"#;

fn setup() -> (Arc<InMemoryChain>, ScriptEngine, String) {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let stream = engine.compile_contract(FAULTY).unwrap();
    let address = chain.register_contract(Some("faulty"), stream);
    (chain, engine, address)
}

#[test]
fn test_fault_before_commit_leaves_host_unchanged() {
    let (chain, engine, address) = setup();
    engine
        .execute_contract_api(ContractRef::ByAddress(address.clone()), "init", "", false, None)
        .unwrap();
    assert_eq!(chain.storage_value(&address, "k"), StorageValue::Int(1));

    let err = engine
        .execute_contract_api(ContractRef::ByAddress(address.clone()), "boom", "", false, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Fault(_)));

    // the write of 5 was recorded in the session only; the host still
    // holds the committed value
    assert_eq!(chain.storage_value(&address, "k"), StorageValue::Int(1));
}

#[test]
fn test_fault_on_fresh_key_leaves_no_trace() {
    let (chain, engine, address) = setup();
    let err = engine
        .execute_contract_api(ContractRef::ByAddress(address.clone()), "boom", "", false, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Fault(_)));
    assert_eq!(chain.storage_value(&address, "k"), StorageValue::Null);
}

#[test]
fn test_canceled_session_never_commits() {
    let (chain, engine, address) = setup();
    engine
        .execute_contract_api(ContractRef::ByAddress(address.clone()), "init", "", false, None)
        .unwrap();

    // the infinite loop runs out of budget; the preceding write must not
    // survive
    let receipt = engine
        .execute_contract_api(
            ContractRef::ByAddress(address.clone()),
            "set_then_stop",
            "",
            false,
            Some(10_000),
        )
        .unwrap();
    assert!(!receipt.committed);
    assert_eq!(chain.storage_value(&address, "k"), StorageValue::Int(1));
}

#[test]
fn test_events_not_forwarded_without_commit() {
    let chain = Arc::new(InMemoryChain::new());
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let source = r#"
type Storage = { k: int }
var M: Contract<Storage> = {}
function M:init()
end
function M:emit_then_fail(_: string)
    emit("Happened", "{}")
    error("fault after emit")
end
return M
"#;
    let stream = engine.compile_contract(source).unwrap();
    let address = chain.register_contract(Some("noisy"), stream);
    engine
        .execute_contract_api(ContractRef::ByAddress(address.clone()), "init", "", false, None)
        .unwrap();
    let _ = engine
        .execute_contract_api(ContractRef::ByAddress(address), "emit_then_fail", "", false, None)
        .unwrap_err();
    assert!(chain.events().is_empty());
}
