//! Crate-level error union

use crate::bytecode::UndumpError;
use crate::chain::ChainError;
use crate::compiler::SourceError;
use crate::loader::LoadError;
use crate::storage::StorageError;
use crate::vm::VmError;
use thiserror::Error;

/// Any failure surfaced by the engine's entry points
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lexing, parsing, checking or codegen failed
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Loading or sandbox verification failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The session faulted at runtime
    #[error(transparent)]
    Fault(#[from] VmError),

    /// Commit-time storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Module stream could not be reconstructed
    #[error(transparent)]
    Undump(#[from] UndumpError),

    /// Host-side failure outside a running session
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// An offline api was invoked in a consensus-affecting call
    #[error("api '{name}' is offline-only and requires a query invocation")]
    OfflineApiRequiresQuery { name: String },
}
