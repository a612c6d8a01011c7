//! Virtual machine
//!
//! A register-based interpreter over [`crate::bytecode::Instruction`] with
//! deterministic, instruction-metered execution. Each session owns its
//! register file, call stack, storage change set and current-contract
//! stack; nothing is shared across sessions except the read-only builtin
//! tables and the host chain API.
//!
//! Session lifecycle per execution: `Idle -> Running -> {Completed |
//! Faulted | Stopped}`. Faults ([`VmError`]) discard the change set;
//! `Stopped` (host stop flag or exhausted instruction budget) is terminal,
//! distinct from a fault, and never commits.

pub mod errors;
mod execution;
mod globals;
pub mod resolver;
pub mod session;
pub mod value;

pub use errors::VmError;
pub use session::{live_session_count, ContractFrame, SessionContext, MAX_CALL_DEPTH};
pub use value::{BuiltinFn, Closure, ContractFn, Table, TableKey, TableIter, Value};

use crate::bytecode::{ModuleStream, Prototype};
use crate::chain::ChainApi;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

/// Why a session stopped without completing or faulting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The host raised the cooperative stop flag
    HostRequest,
    /// The instruction budget ran out
    BudgetExhausted,
}

/// Terminal state of a session run
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Normal return from the top-level chunk or explicit `exit`
    Completed(Value),
    /// Canceled; the result is not authoritative and must not be committed
    Stopped(StopReason),
}

/// Internal control signal threaded through call frames
#[derive(Debug)]
pub(crate) enum Signal {
    Value(Value),
    Stopped(StopReason),
}

/// One VM session: exclusive register file, call stack, change set and
/// contract identity stack
pub struct VmSession {
    pub chain: Arc<dyn ChainApi>,
    pub ctx: SessionContext,
    pub(crate) call_depth: usize,
    /// Imported contract proxies, cached per address for the session
    pub(crate) import_cache: BTreeMap<String, Value>,
    pub(crate) globals: BTreeMap<&'static str, Value>,
}

impl VmSession {
    pub fn new(chain: Arc<dyn ChainApi>) -> Self {
        let globals = globals::builtin_globals();
        Self {
            chain,
            ctx: SessionContext::new(),
            call_depth: 0,
            import_cache: BTreeMap::new(),
            globals,
        }
    }

    /// Deterministic execution budget in instructions, never wall-clock
    pub fn set_instruction_limit(&mut self, limit: Option<u64>) {
        self.ctx.instruction_limit = limit;
    }

    pub fn instruction_count(&self) -> u64 {
        self.ctx.instruction_counter
    }

    /// Execute a module's top-level chunk and return its outcome
    ///
    /// A fault automatically discards the session's change set so no
    /// partial storage mutation can ever be committed.
    pub fn execute_module(&mut self, module: &ModuleStream) -> Result<ExecutionOutcome, VmError> {
        let proto = Rc::new(module.bytecode.clone());
        self.execute_proto(proto)
    }

    /// Run a root prototype inside this session without resolving the
    /// change set; the loader uses this to bootstrap imported modules
    pub(crate) fn execute_proto_raw(&mut self, proto: Rc<Prototype>) -> Result<Signal, VmError> {
        let closure = Rc::new(Closure {
            proto,
            upvalues: Vec::new(),
        });
        self.call_closure(&closure, &[])
    }

    pub(crate) fn execute_proto(
        &mut self,
        proto: Rc<Prototype>,
    ) -> Result<ExecutionOutcome, VmError> {
        let closure = Rc::new(Closure {
            proto,
            upvalues: Vec::new(),
        });
        match self.call_closure(&closure, &[]) {
            Ok(Signal::Value(value)) => Ok(ExecutionOutcome::Completed(value)),
            Ok(Signal::Stopped(reason)) => {
                self.ctx.changes.discard();
                Ok(ExecutionOutcome::Stopped(reason))
            }
            Err(VmError::ExplicitExit) => Ok(ExecutionOutcome::Completed(Value::Nil)),
            Err(fault) => {
                self.ctx.changes.discard();
                Err(fault)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::compiler::compile_module;
    use crate::typecheck::{CheckMode, EmptyRegistry};
    use std::sync::atomic::Ordering;

    fn run(source: &str) -> (Result<ExecutionOutcome, VmError>, VmSession) {
        let (stream, _) = compile_module(source, CheckMode::Plain, &EmptyRegistry).unwrap();
        let mut session = VmSession::new(Arc::new(InMemoryChain::new()));
        let outcome = session.execute_module(&stream);
        (outcome, session)
    }

    fn run_value(source: &str) -> Value {
        let (outcome, _) = run(source);
        match outcome.unwrap() {
            ExecutionOutcome::Completed(value) => value,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_value("return 2 + 3 * 4"), Value::Int(14));
        assert_eq!(run_value("return 7 // 2"), Value::Int(3));
        assert_eq!(run_value("return 7 % 3"), Value::Int(1));
        assert_eq!(run_value("return 2 ^ 10"), Value::Int(1024));
        assert_eq!(run_value("return 1 / 2"), Value::Number(0.5));
    }

    #[test]
    fn test_locals_and_functions() {
        let source = "function add(a: int, b: int): int\nreturn a + b\nend\nreturn add(20, 22)";
        assert_eq!(run_value(source), Value::Int(42));
    }

    #[test]
    fn test_closure_captures_shared_slot() {
        let source = "\
function make()\n\
    var count = 0\n\
    function bump()\n\
        count = count + 1\n\
        return count\n\
    end\n\
    bump()\n\
    bump()\n\
    return bump()\n\
end\n\
return make()";
        assert_eq!(run_value(source), Value::Int(3));
    }

    #[test]
    fn test_control_flow() {
        let source = "\
var total = 0\n\
for i = 1, 10 do\n\
    if i % 2 == 0 then\n\
        total = total + i\n\
    end\n\
end\n\
return total";
        assert_eq!(run_value(source), Value::Int(30));
    }

    #[test]
    fn test_while_and_break() {
        let source = "\
var i = 0\n\
while true do\n\
    i = i + 1\n\
    if i >= 5 then\n\
        break\n\
    end\n\
end\n\
return i";
        assert_eq!(run_value(source), Value::Int(5));
    }

    #[test]
    fn test_iterator_for_over_table() {
        let source = "\
let t = { 10, 20, 30 }\n\
var sum = 0\n\
for k, v in pairs(t) do\n\
    sum = sum + v\n\
end\n\
return sum";
        assert_eq!(run_value(source), Value::Int(60));
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(
            run_value("return \"a\" .. \"b\" .. \"c\""),
            Value::from_str("abc")
        );
        assert_eq!(run_value("return #\"hello\""), Value::Int(5));
        assert_eq!(run_value("return string.upper(\"abc\")"), Value::from_str("ABC"));
    }

    #[test]
    fn test_table_ops() {
        let source = "\
let t = {}\n\
table.append(t, 1)\n\
table.append(t, 2)\n\
return #t";
        assert_eq!(run_value(source), Value::Int(2));
    }

    #[test]
    fn test_type_fault_discards_changes() {
        let (outcome, session) = run("let x = tointeger(\"zzz\")\nreturn x + 1");
        assert!(outcome.is_err());
        assert!(!session.ctx.changes.is_open());
    }

    #[test]
    fn test_budget_stops_after_exact_count() {
        let (stream, _) = compile_module(
            "while true do\nend",
            CheckMode::Plain,
            &EmptyRegistry,
        )
        .unwrap();
        let mut session = VmSession::new(Arc::new(InMemoryChain::new()));
        session.set_instruction_limit(Some(100));
        let outcome = session.execute_module(&stream).unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Stopped(StopReason::BudgetExhausted)
        );
        assert_eq!(session.instruction_count(), 100);
    }

    #[test]
    fn test_stop_flag_observed() {
        let (stream, _) = compile_module("return 1 + 1", CheckMode::Plain, &EmptyRegistry).unwrap();
        let mut session = VmSession::new(Arc::new(InMemoryChain::new()));
        session.ctx.stop_flag.store(true, Ordering::Relaxed);
        let outcome = session.execute_module(&stream).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Stopped(StopReason::HostRequest));
    }

    #[test]
    fn test_exit_completes() {
        let (outcome, _) = run("exit()\nreturn 1");
        assert_eq!(outcome.unwrap(), ExecutionOutcome::Completed(Value::Nil));
    }

    #[test]
    fn test_error_builtin_faults() {
        let (outcome, _) = run("error(\"boom\")");
        match outcome {
            Err(VmError::ScriptError { message }) => assert_eq!(message, "boom"),
            other => panic!("expected script error, got {:?}", other),
        }
    }

    #[test]
    fn test_goto_loop() {
        let source = "\
var i = 0\n\
::top::\n\
i = i + 1\n\
if i < 4 then\n\
    goto top\n\
end\n\
return i";
        assert_eq!(run_value(source), Value::Int(4));
    }

    #[test]
    fn test_determinism_identical_sessions() {
        let source = "\
let t = { c = 1, a = 2, b = 3 }\n\
var acc = \"\"\n\
for k, v in pairs(t) do\n\
    acc = acc .. k\n\
end\n\
return acc";
        let a = run_value(source);
        let b = run_value(source);
        assert_eq!(a, b);
        assert_eq!(a, Value::from_str("abc"));
    }

    #[test]
    fn test_instruction_counts_identical() {
        let source = "var x = 0\nfor i = 1, 50 do\nx = x + i\nend\nreturn x";
        let (stream, _) = compile_module(source, CheckMode::Plain, &EmptyRegistry).unwrap();
        let mut s1 = VmSession::new(Arc::new(InMemoryChain::new()));
        let mut s2 = VmSession::new(Arc::new(InMemoryChain::new()));
        s1.execute_module(&stream).unwrap();
        s2.execute_module(&stream).unwrap();
        assert_eq!(s1.instruction_count(), s2.instruction_count());
    }

    #[test]
    fn test_json_builtins() {
        assert_eq!(
            run_value("return tojsonstring({ 1, 2, 3 })"),
            Value::from_str("[1,2,3]")
        );
        assert_eq!(
            run_value("return tojsonstring({})"),
            Value::from_str("{}")
        );
        assert_eq!(
            run_value("let t = json.loads(\"{\\\"k\\\": 7}\")\nreturn t[\"k\"]"),
            Value::Int(7)
        );
    }

    #[test]
    fn test_stream_builtins() {
        let source = "\
let s = Stream()\n\
s:append(\"hello\")\n\
s:append(\" world\")\n\
return s:dump()";
        assert_eq!(run_value(source), Value::from_str("hello world"));
    }

    #[test]
    fn test_print_collects_output() {
        let (_, session) = run("print(\"a\", 1)\nprint(\"b\")");
        assert_eq!(session.ctx.output, "a\t1\nb\n");
    }
}
