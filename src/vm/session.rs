//! Per-session execution context
//!
//! One [`SessionContext`] is owned by each VM session and passed explicitly
//! through every call; there is no ambient global state. The only
//! process-wide structure is the session registry, a mutex-guarded id set
//! used purely for lifetime accounting of sessions and their native
//! handles; contract logic never goes through it.

use crate::events::ContractEvent;
use crate::storage::{ChangeSet, StorageValue};
use crate::vm::errors::VmError;
use crate::vm::value::Value;
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum nested call depth per session
pub const MAX_CALL_DEPTH: usize = 128;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide registry of live session ids; creation and teardown are
/// serialized through this single mutex
static SESSION_REGISTRY: Lazy<Mutex<BTreeSet<u64>>> = Lazy::new(|| Mutex::new(BTreeSet::new()));

/// Number of sessions currently alive in this process
pub fn live_session_count() -> usize {
    SESSION_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .len()
}

/// Whether a session id is currently registered
pub fn session_registered(id: u64) -> bool {
    SESSION_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&id)
}

fn register_session() -> u64 {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
    SESSION_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id);
    id
}

fn unregister_session(id: u64) {
    SESSION_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
}

/// Arena of opaque byte streams addressed by stable integer handles
///
/// Scripts refer to native byte-stream resources by handle only; handles
/// die with the session.
#[derive(Debug, Default)]
pub struct StreamArena {
    slots: Vec<Vec<u8>>,
}

impl StreamArena {
    pub fn alloc(&mut self, bytes: Vec<u8>) -> u32 {
        self.slots.push(bytes);
        (self.slots.len() - 1) as u32
    }

    pub fn get(&self, handle: u32) -> Option<&Vec<u8>> {
        self.slots.get(handle as usize)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Vec<u8>> {
        self.slots.get_mut(handle as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Identity frame on the current-contract stack
#[derive(Debug, Clone)]
pub struct ContractFrame {
    pub address: String,
    /// Kept only for the well-known contract; anonymous otherwise
    pub name: Option<String>,
    /// The contract's module table
    pub module: Value,
}

/// All mutable state owned by one VM session
pub struct SessionContext {
    pub session_id: u64,
    pub instruction_counter: u64,
    pub instruction_limit: Option<u64>,
    pub stop_flag: Arc<AtomicBool>,
    pub contract_stack: Vec<ContractFrame>,
    pub changes: ChangeSet,
    pub streams: StreamArena,
    pub output: String,
    pub events: Vec<ContractEvent>,
    pub caller: String,
    pub caller_address: String,
    /// Address of the contract the call entered through; only it keeps its
    /// lifecycle APIs visible
    pub starting_contract: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: register_session(),
            instruction_counter: 0,
            instruction_limit: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            contract_stack: Vec::new(),
            changes: ChangeSet::new(),
            streams: StreamArena::default(),
            output: String::new(),
            events: Vec::new(),
            caller: String::new(),
            caller_address: String::new(),
            starting_contract: None,
        }
    }

    /// Cooperative cancellation flag, shareable with a host thread
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    /// Identity of the currently executing contract
    pub fn current_contract(&self) -> Option<&ContractFrame> {
        self.contract_stack.last()
    }

    pub fn current_contract_address(&self) -> Result<&str, VmError> {
        self.current_contract()
            .map(|f| f.address.as_str())
            .ok_or(VmError::NoCurrentContract)
    }

    /// Bridge a storage value into the VM, allocating stream handles here
    pub fn materialize_storage(&mut self, value: &StorageValue) -> Value {
        let streams = &mut self.streams;
        let mut alloc = |bytes: Vec<u8>| streams.alloc(bytes);
        Value::from_storage(value, &mut alloc)
    }

    /// Bridge a VM value into storage, snapshotting stream contents
    pub fn persist_value(&self, value: &Value) -> Result<StorageValue, VmError> {
        let streams = &self.streams;
        value.to_storage(&|handle| streams.get(handle).cloned())
    }

    pub fn record_event(&mut self, contract_id: &str, name: &str, payload: &str) {
        self.events.push(ContractEvent {
            contract_id: contract_id.to_string(),
            name: name.to_string(),
            payload: payload.to_string(),
        });
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        unregister_session(self.session_id);
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("instruction_counter", &self.instruction_counter)
            .field("instruction_limit", &self.instruction_limit)
            .field("contract_stack", &self.contract_stack.len())
            .field("changes", &self.changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_lifetime() {
        let id;
        {
            let ctx = SessionContext::new();
            id = ctx.session_id;
            assert!(session_registered(id));
        }
        assert!(!session_registered(id));
    }

    #[test]
    fn test_stream_arena_handles() {
        let mut arena = StreamArena::default();
        let a = arena.alloc(vec![1, 2, 3]);
        let b = arena.alloc(vec![4]);
        assert_ne!(a, b);
        assert_eq!(arena.get(a), Some(&vec![1, 2, 3]));
        arena.get_mut(b).unwrap().push(5);
        assert_eq!(arena.get(b), Some(&vec![4, 5]));
        assert!(arena.get(99).is_none());
    }

    #[test]
    fn test_stop_handle_shared() {
        let ctx = SessionContext::new();
        let handle = ctx.stop_handle();
        assert!(!ctx.stop_requested());
        handle.store(true, Ordering::Relaxed);
        assert!(ctx.stop_requested());
    }
}
