//! Error types for VM execution

use crate::chain::ChainError;
use crate::storage::StorageError;
use thiserror::Error;

/// Runtime faults; any of these aborts the session and discards its
/// storage change set
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// Arithmetic or comparison on an incompatible operand
    #[error("runtime type error at line {line}: {message}")]
    TypeFault { line: usize, message: String },

    /// Integer division or modulo by zero
    #[error("division by zero at line {line}")]
    DivisionByZero { line: usize },

    /// Read of a global not on the whitelist
    #[error("access to forbidden global '{name}' at line {line}")]
    ForbiddenGlobal { name: String, line: usize },

    /// Attempted mutation of the bound environment
    #[error("the environment table is immutable")]
    EnvironmentWrite,

    /// Calling something that is not callable
    #[error("attempt to call a {type_name} value at line {line}")]
    NotCallable { type_name: String, line: usize },

    /// Indexing something that is not indexable
    #[error("attempt to index a {type_name} value at line {line}")]
    NotIndexable { type_name: String, line: usize },

    /// script-raised error()
    #[error("script error: {message}")]
    ScriptError { message: String },

    /// Call frames nested past the limit
    #[error("call stack overflow (depth {depth})")]
    StackOverflow { depth: usize },

    /// Malformed bytecode reached the interpreter
    #[error("malformed bytecode: {details}")]
    MalformedBytecode { details: String },

    /// Value nested beyond the storage/json depth bound
    #[error("value exceeds the nesting depth limit")]
    ValueTooDeep,

    /// Value kind that cannot be serialized
    #[error("value of type {type_name} cannot be serialized")]
    UnserializableValue { type_name: String },

    /// Stream handle not present in the session arena
    #[error("invalid stream handle {handle}")]
    InvalidStreamHandle { handle: u32 },

    /// Storage access on an empty current-contract stack
    #[error("no current contract in this session")]
    NoCurrentContract,

    /// Calling an api that the sandbox stripped or the module lacks
    #[error("contract has no api '{name}'")]
    NoSuchApi { name: String },

    /// Propagated host failure
    #[error("host error: {0}")]
    Host(#[from] ChainError),

    /// Propagated storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Internal `exit()` signal; resolved to Completed at the session top
    #[error("exit")]
    ExplicitExit,
}

impl VmError {
    /// Faults surface one human-readable message plus a kind tag
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::TypeFault { .. } => "type",
            VmError::DivisionByZero { .. } => "arithmetic",
            VmError::ForbiddenGlobal { .. } => "sandbox",
            VmError::EnvironmentWrite => "sandbox",
            VmError::NotCallable { .. } => "type",
            VmError::NotIndexable { .. } => "type",
            VmError::ScriptError { .. } => "script",
            VmError::StackOverflow { .. } => "resource",
            VmError::MalformedBytecode { .. } => "bytecode",
            VmError::ValueTooDeep => "resource",
            VmError::UnserializableValue { .. } => "type",
            VmError::InvalidStreamHandle { .. } => "resource",
            VmError::NoCurrentContract => "sandbox",
            VmError::NoSuchApi { .. } => "sandbox",
            VmError::Host(_) => "host",
            VmError::Storage(_) => "storage",
            VmError::ExplicitExit => "exit",
        }
    }
}
