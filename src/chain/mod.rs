//! Host chain API boundary
//!
//! Everything the engine needs from the surrounding blockchain node goes
//! through [`ChainApi`]. The trait is object-safe and takes `&self`: hosts
//! must be safe for concurrent read access because independent VM sessions
//! may run on separate threads. Exception signaling from the original
//! boundary surfaces as `Result<_, ChainError>` here.

pub mod in_memory;

pub use in_memory::InMemoryChain;

use crate::bytecode::ModuleStream;
use crate::storage::{StorageChangeRecord, StorageResult, StorageValue};
use crate::typecheck::ContractRegistry;
use thiserror::Error;

/// Registration state of a contract address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    /// Registered and callable
    Active,
    /// Address unknown to the chain
    NotRegistered,
    /// Destroyed; only its own bootstrap may still touch it
    Destroyed,
}

/// Metadata the chain stores per contract, used for upgrade-compatibility
/// checks at load time
#[derive(Debug, Clone, PartialEq)]
pub struct StoredContractInfo {
    pub api_names: Vec<String>,
}

/// Errors propagated from the host
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("insufficient balance: contract {contract} holds {held} {asset}, needs {needed}")]
    InsufficientBalance {
        contract: String,
        asset: String,
        held: i64,
        needed: i64,
    },

    #[error("contract not found: {0}")]
    ContractNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("chain error: {0}")]
    Other(String),
}

/// The narrow callback surface the engine consumes
pub trait ChainApi: Send + Sync {
    fn get_contract_address_by_name(&self, name: &str) -> Option<String>;
    fn check_contract_exist(&self, name: &str) -> bool;
    fn check_contract_exist_by_address(&self, address: &str) -> bool;
    fn open_contract(&self, name: &str) -> Option<ModuleStream>;
    fn open_contract_by_address(&self, address: &str) -> Option<ModuleStream>;
    fn get_stored_contract_info_by_address(&self, address: &str) -> Option<StoredContractInfo>;
    fn contract_state(&self, address: &str) -> ContractState;

    fn transfer_from_contract_to_address(
        &self,
        contract_id: &str,
        to_address: &str,
        asset: &str,
        amount: i64,
    ) -> Result<i64, ChainError>;

    fn transfer_from_contract_to_public_account(
        &self,
        contract_id: &str,
        to_account: &str,
        asset: &str,
        amount: i64,
    ) -> Result<i64, ChainError>;

    fn get_contract_balance_amount(&self, contract_id: &str, asset: &str) -> i64;

    /// Consensus timestamp; never host wall-clock
    fn get_chain_now(&self) -> i64;
    /// Consensus random oracle
    fn get_chain_random(&self) -> f64;
    fn get_transaction_id(&self) -> String;
    fn get_transaction_fee(&self) -> i64;
    fn get_header_block_num(&self) -> i64;

    fn emit_event(&self, contract_id: &str, event_name: &str, payload: &str);

    fn get_storage(&self, contract_id: &str, key: &str) -> StorageValue;

    /// Apply a whole change set atomically: either every record is applied
    /// or none are
    fn commit_storage_changes(&self, changes: &[StorageChangeRecord]) -> StorageResult<()>;
}

/// Adapter exposing a chain API as the checker's existence predicate
pub struct ChainRegistry<'a>(pub &'a dyn ChainApi);

impl ContractRegistry for ChainRegistry<'_> {
    fn contract_exists(&self, name: &str) -> bool {
        self.0.check_contract_exist(name)
    }

    fn contract_exists_by_address(&self, address: &str) -> bool {
        self.0.check_contract_exist_by_address(address)
    }
}
