pub mod bytecode;
pub mod chain;
pub mod compiler;
pub mod decompile;
pub mod engine;
pub mod errors;
pub mod events;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod storage;
pub mod typecheck;
pub mod vm;

// Use specific imports rather than assuming re-exports for clarity
pub use crate::bytecode::{ModuleStream, Prototype, UndumpError};
pub use crate::chain::{ChainApi, ChainError, InMemoryChain};
pub use crate::compiler::{CompileError, SourceError};
pub use crate::engine::{ExecutionReceipt, ScriptEngine};
pub use crate::errors::EngineError;
pub use crate::events::ContractEvent;
pub use crate::lexer::SyntaxError;
pub use crate::loader::{ContractRef, LoadError};
pub use crate::parser::ParseFailure;
pub use crate::storage::{StorageChangeRecord, StorageError, StorageValue};
pub use crate::typecheck::{CheckMode, TypeError};
pub use crate::vm::{ExecutionOutcome, StopReason, VmError, VmSession};
