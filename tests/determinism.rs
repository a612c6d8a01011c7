//! Determinism properties: identical sessions, stable disassembly,
//! decompile round trip, exact budget accounting

use chainscript::chain::{ChainApi, InMemoryChain};
use chainscript::engine::ScriptEngine;
use chainscript::loader::ContractRef;
use chainscript::vm::{ExecutionOutcome, StopReason};
use std::sync::Arc;

const CONTRACT: &str = r#"
type Storage = { total: int, log: string }
var M: Contract<Storage> = {}
function M:init()
    self.storage.total = 0
    self.storage.log = ""
end
function M:work(arg: string)
    var sum = 0
    let t = { 3, 1, 2 }
    for k, v in pairs(t) do
        sum = sum + v * k
    end
    self.storage.total = sum + tointeger(arg)
    self.storage.log = self.storage.log .. arg
end
return M
"#;

fn fresh_engine() -> (Arc<InMemoryChain>, ScriptEngine, String) {
    let chain = Arc::new(InMemoryChain::with_oracles(1_700_000_000, 0.25, "tx-42"));
    let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn ChainApi>);
    let stream = engine.compile_contract(CONTRACT).unwrap();
    let address = chain.register_contract(Some("worker"), stream);
    (chain, engine, address)
}

#[test]
fn test_identical_runs_produce_identical_storage_and_counts() {
    let (chain_a, engine_a, address_a) = fresh_engine();
    let (chain_b, engine_b, address_b) = fresh_engine();
    assert_eq!(address_a, address_b);

    let mut receipts = Vec::new();
    for (chain, engine, address) in [
        (&chain_a, &engine_a, &address_a),
        (&chain_b, &engine_b, &address_b),
    ] {
        engine
            .execute_contract_api(ContractRef::ByAddress(address.to_string()), "init", "", false, None)
            .unwrap();
        let receipt = engine
            .execute_contract_api(
                ContractRef::ByAddress(address.to_string()),
                "work",
                "10",
                false,
                None,
            )
            .unwrap();
        receipts.push((
            receipt.instructions,
            chain.storage_value(address, "total"),
            chain.storage_value(address, "log"),
        ));
    }
    assert_eq!(receipts[0], receipts[1]);
}

#[test]
fn test_compiled_stream_is_bit_identical() {
    let engine = ScriptEngine::new(Arc::new(InMemoryChain::new()));
    let a = engine.compile("let x = 1\nreturn x + 2").unwrap();
    let b = engine.compile("let x = 1\nreturn x + 2").unwrap();
    assert_eq!(a.serialize(), b.serialize());
    assert_eq!(a.derive_address(), b.derive_address());
}

#[test]
fn test_disassembly_stable_across_compilations() {
    let engine = ScriptEngine::new(Arc::new(InMemoryChain::new()));
    let a = engine.compile_contract(CONTRACT).unwrap();
    let b = engine.compile_contract(CONTRACT).unwrap();
    assert_eq!(engine.disassemble(&a), engine.disassemble(&b));
}

#[test]
fn test_decompiled_contract_recompiles() {
    let engine = ScriptEngine::new(Arc::new(InMemoryChain::new()));
    let stream = engine.compile_contract(CONTRACT).unwrap();
    let source = engine.decompile(&stream);
    // pseudo-source is plain-mode code; it must parse, check and compile
    // without introducing new errors
    engine
        .compile(&source)
        .unwrap_or_else(|e| panic!("decompiled source failed to recompile: {}\n{}", e, source));
}

#[test]
fn test_budget_of_100_executes_exactly_100() {
    let engine = ScriptEngine::new(Arc::new(InMemoryChain::new()));
    let stream = engine.compile("while true do\nend").unwrap();
    let receipt = engine.execute(&stream, Some(100)).unwrap();
    assert_eq!(
        receipt.outcome,
        ExecutionOutcome::Stopped(StopReason::BudgetExhausted)
    );
    assert_eq!(receipt.instructions, 100);
    assert!(!receipt.committed);
}

#[test]
fn test_short_program_unaffected_by_budget() {
    let engine = ScriptEngine::new(Arc::new(InMemoryChain::new()));
    let stream = engine.compile("return 2 + 2").unwrap();
    let receipt = engine.execute(&stream, Some(1_000)).unwrap();
    assert!(matches!(receipt.outcome, ExecutionOutcome::Completed(_)));
    assert!(receipt.instructions < 1_000);
    assert_eq!(receipt.result_json.as_deref(), Some("4"));
}
