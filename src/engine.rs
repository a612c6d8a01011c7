//! The engine facade: the execution entry points exposed to the host
//!
//! `ScriptEngine` coordinates the compile pipeline, the loader/sandbox and
//! the VM, and owns the commit/discard decision per execution: a completed
//! consensus invocation commits its storage change set and forwards its
//! events to the host in one place; faults, cancellations and query
//! invocations never touch host state.

use crate::bytecode::ModuleStream;
use crate::chain::{ChainApi, ChainRegistry};
use crate::compiler::{compile_module, SourceError};
use crate::decompile;
use crate::errors::EngineError;
use crate::events::ContractEvent;
use crate::loader::{self, ContractRef, LoadError, LoadOutcome};
use crate::typecheck::{CheckMode, CheckedProgram};
use crate::vm::{ContractFrame, ExecutionOutcome, Signal, Value, VmSession};
use log::debug;
use std::sync::Arc;

/// What one session run did
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReceipt {
    pub outcome: ExecutionOutcome,
    /// Instructions executed by the session
    pub instructions: u64,
    /// Accumulated print/pprint output
    pub output: String,
    /// Events emitted during the run (forwarded to the host only when the
    /// run committed)
    pub events: Vec<ContractEvent>,
    /// Whether the storage change set was applied to the host
    pub committed: bool,
    /// JSON projection of the result value, when there is one
    pub result_json: Option<String>,
}

/// The contract scripting engine
pub struct ScriptEngine {
    chain: Arc<dyn ChainApi>,
}

impl ScriptEngine {
    pub fn new(chain: Arc<dyn ChainApi>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &Arc<dyn ChainApi> {
        &self.chain
    }

    /// Compile a plain script
    pub fn compile(&self, source: &str) -> Result<ModuleStream, SourceError> {
        compile_module(source, CheckMode::Plain, &ChainRegistry(self.chain.as_ref()))
            .map(|(stream, _)| stream)
    }

    /// Compile in contract mode, enforcing the contract-specific rules
    pub fn compile_contract(&self, source: &str) -> Result<ModuleStream, SourceError> {
        compile_module(
            source,
            CheckMode::Contract,
            &ChainRegistry(self.chain.as_ref()),
        )
        .map(|(stream, _)| stream)
    }

    /// Type-check without compiling; returns the checked program with its
    /// normalized source and binding dump
    pub fn check(&self, source: &str, mode: CheckMode) -> Result<CheckedProgram, SourceError> {
        compile_module(source, mode, &ChainRegistry(self.chain.as_ref()))
            .map(|(_, program)| program)
    }

    /// Execute a module's top-level chunk in a fresh session
    ///
    /// On completion the session's storage change set is committed and its
    /// events are forwarded; a faulted session discards everything and the
    /// fault is returned.
    pub fn execute(
        &self,
        module: &ModuleStream,
        instruction_limit: Option<u64>,
    ) -> Result<ExecutionReceipt, EngineError> {
        let mut session = VmSession::new(Arc::clone(&self.chain));
        session.set_instruction_limit(instruction_limit);
        let outcome = session.execute_module(module)?;
        self.seal(session, outcome, false)
    }

    /// Invoke one exported API of a contract
    ///
    /// `query` marks a read-only invocation: it is the only way to call an
    /// offline API, and it never commits storage or events.
    pub fn execute_contract_api(
        &self,
        reference: ContractRef,
        api_name: &str,
        argument: &str,
        query: bool,
        instruction_limit: Option<u64>,
    ) -> Result<ExecutionReceipt, EngineError> {
        let mut session = VmSession::new(Arc::clone(&self.chain));
        session.set_instruction_limit(instruction_limit);

        // pin the starting contract before loading so its lifecycle APIs
        // survive the sandbox stripping
        let (address, _, stream, _) = loader::resolve_reference(&session, &reference)?;
        session.ctx.starting_contract = Some(address.clone());

        if !query && stream.offline_api_names.iter().any(|n| n == api_name) {
            return Err(EngineError::OfflineApiRequiresQuery {
                name: api_name.to_string(),
            });
        }

        let loaded = match loader::load(&mut session, &reference)? {
            LoadOutcome::Loaded(loaded) => loaded,
            LoadOutcome::Stopped(reason) => {
                session.ctx.changes.discard();
                return self.seal(session, ExecutionOutcome::Stopped(reason), true);
            }
        };

        let closure = loaded
            .apis
            .get(api_name)
            .cloned()
            .ok_or_else(|| LoadError::NoSuchApi {
                name: api_name.to_string(),
            })?;

        debug!("invoking {}.{}", loaded.address, api_name);
        session.ctx.contract_stack.push(ContractFrame {
            address: loaded.address.clone(),
            name: loaded.name.clone(),
            module: loaded.module.clone(),
        });
        let call = session.call_closure(&closure, &[loaded.module.clone(), Value::from_str(argument)]);
        session.ctx.contract_stack.pop();

        let outcome = match call {
            Ok(Signal::Value(value)) => ExecutionOutcome::Completed(value),
            Ok(Signal::Stopped(reason)) => {
                session.ctx.changes.discard();
                ExecutionOutcome::Stopped(reason)
            }
            Err(crate::vm::VmError::ExplicitExit) => ExecutionOutcome::Completed(Value::Nil),
            Err(fault) => {
                session.ctx.changes.discard();
                return Err(fault.into());
            }
        };
        self.seal(session, outcome, query)
    }

    /// Commit-or-discard and build the receipt
    fn seal(
        &self,
        mut session: VmSession,
        outcome: ExecutionOutcome,
        query: bool,
    ) -> Result<ExecutionReceipt, EngineError> {
        let mut committed = false;
        let result_json = match &outcome {
            ExecutionOutcome::Completed(value) => {
                if query {
                    session.ctx.changes.discard();
                } else {
                    committed = session
                        .ctx
                        .changes
                        .commit(|records| self.chain.commit_storage_changes(records))?;
                    if committed {
                        for event in &session.ctx.events {
                            self.chain
                                .emit_event(&event.contract_id, &event.name, &event.payload);
                        }
                    }
                }
                value.to_json().ok().map(|json| json.to_string())
            }
            ExecutionOutcome::Stopped(_) => None,
        };

        Ok(ExecutionReceipt {
            outcome,
            instructions: session.instruction_count(),
            output: std::mem::take(&mut session.ctx.output),
            events: std::mem::take(&mut session.ctx.events),
            committed,
            result_json,
        })
    }

    /// Reconstruct pseudo-source from a module stream
    pub fn decompile(&self, module: &ModuleStream) -> String {
        decompile::decompile(module)
    }

    /// Textual instruction listing of a module stream
    pub fn disassemble(&self, module: &ModuleStream) -> String {
        decompile::disassemble(module)
    }
}
