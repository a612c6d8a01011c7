//! Contract event records

use serde::{Deserialize, Serialize};

/// An event emitted by contract code during one session
///
/// Events are collected in the session and forwarded to the host only when
/// the session commits; a faulted or canceled session emits nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    /// Emitting contract's address
    pub contract_id: String,
    /// Event name; must be one of the module's declared event names
    pub name: String,
    /// Opaque payload, conventionally JSON
    pub payload: String,
}
