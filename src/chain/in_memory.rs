//! In-memory chain host for tests and the CLI
//!
//! A Mutex-protected map store implementing the whole [`ChainApi`] surface.
//! Oracles (time, random, transaction identity) are fixed values settable
//! per instance, so determinism tests can pin them; the default random
//! seed comes from `rand` once at construction and stays constant for the
//! instance's lifetime.

use super::{ChainApi, ChainError, ContractState, StoredContractInfo};
use crate::bytecode::ModuleStream;
use crate::storage::{StorageChangeRecord, StorageError, StorageResult, StorageValue};
use log::debug;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct ContractEntry {
    name: Option<String>,
    stream: ModuleStream,
    state: ContractState,
}

#[derive(Debug, Default)]
struct Inner {
    contracts: BTreeMap<String, ContractEntry>,
    names: BTreeMap<String, String>,
    stored_info: BTreeMap<String, Vec<String>>,
    storage: BTreeMap<(String, String), StorageValue>,
    balances: BTreeMap<(String, String), i64>,
    events: Vec<(String, String, String)>,
}

/// An in-memory [`ChainApi`] implementation
pub struct InMemoryChain {
    inner: Mutex<Inner>,
    chain_now: i64,
    chain_random: f64,
    transaction_id: String,
    transaction_fee: i64,
    header_block_num: i64,
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChain {
    pub fn new() -> Self {
        let random = rand::thread_rng().gen_range(0.0..1.0);
        Self {
            inner: Mutex::new(Inner::default()),
            chain_now: 1_700_000_000,
            chain_random: random,
            transaction_id: "tx-0000".to_string(),
            transaction_fee: 10,
            header_block_num: 1,
        }
    }

    /// Fixed-oracle constructor for determinism tests
    pub fn with_oracles(now: i64, random: f64, transaction_id: &str) -> Self {
        let mut chain = Self::new();
        chain.chain_now = now;
        chain.chain_random = random;
        chain.transaction_id = transaction_id.to_string();
        chain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned host mutex means a panicking writer; the data is
        // plain maps, safe to keep serving
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a contract module, returning its derived address
    pub fn register_contract(&self, name: Option<&str>, stream: ModuleStream) -> String {
        let address = stream.derive_address();
        let mut inner = self.lock();
        if let Some(name) = name {
            inner.names.insert(name.to_string(), address.clone());
        }
        inner
            .stored_info
            .insert(address.clone(), stream.api_names.clone());
        inner.contracts.insert(
            address.clone(),
            ContractEntry {
                name: name.map(str::to_string),
                stream,
                state: ContractState::Active,
            },
        );
        debug!("registered contract at {}", address);
        address
    }

    /// Overwrite the stored API-name set for an address (upgrade testing)
    pub fn set_stored_contract_info(&self, address: &str, api_names: Vec<String>) {
        self.lock().stored_info.insert(address.to_string(), api_names);
    }

    pub fn set_contract_state(&self, address: &str, state: ContractState) {
        if let Some(entry) = self.lock().contracts.get_mut(address) {
            entry.state = state;
        }
    }

    pub fn set_balance(&self, account: &str, asset: &str, amount: i64) {
        self.lock()
            .balances
            .insert((account.to_string(), asset.to_string()), amount);
    }

    pub fn balance(&self, account: &str, asset: &str) -> i64 {
        self.lock()
            .balances
            .get(&(account.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Events observed so far as (contract, name, payload)
    pub fn events(&self) -> Vec<(String, String, String)> {
        self.lock().events.clone()
    }

    /// Raw storage inspection for tests
    pub fn storage_value(&self, contract_id: &str, key: &str) -> StorageValue {
        self.get_storage(contract_id, key)
    }
}

impl ChainApi for InMemoryChain {
    fn get_contract_address_by_name(&self, name: &str) -> Option<String> {
        self.lock().names.get(name).cloned()
    }

    fn check_contract_exist(&self, name: &str) -> bool {
        self.lock().names.contains_key(name)
    }

    fn check_contract_exist_by_address(&self, address: &str) -> bool {
        self.lock().contracts.contains_key(address)
    }

    fn open_contract(&self, name: &str) -> Option<ModuleStream> {
        let inner = self.lock();
        let address = inner.names.get(name)?;
        inner.contracts.get(address).map(|e| e.stream.clone())
    }

    fn open_contract_by_address(&self, address: &str) -> Option<ModuleStream> {
        self.lock().contracts.get(address).map(|e| e.stream.clone())
    }

    fn get_stored_contract_info_by_address(&self, address: &str) -> Option<StoredContractInfo> {
        self.lock()
            .stored_info
            .get(address)
            .map(|api_names| StoredContractInfo {
                api_names: api_names.clone(),
            })
    }

    fn contract_state(&self, address: &str) -> ContractState {
        self.lock()
            .contracts
            .get(address)
            .map(|e| e.state)
            .unwrap_or(ContractState::NotRegistered)
    }

    fn transfer_from_contract_to_address(
        &self,
        contract_id: &str,
        to_address: &str,
        asset: &str,
        amount: i64,
    ) -> Result<i64, ChainError> {
        let mut inner = self.lock();
        let from_key = (contract_id.to_string(), asset.to_string());
        let held = inner.balances.get(&from_key).copied().unwrap_or(0);
        if held < amount {
            return Err(ChainError::InsufficientBalance {
                contract: contract_id.to_string(),
                asset: asset.to_string(),
                held,
                needed: amount,
            });
        }
        inner.balances.insert(from_key, held - amount);
        let to_key = (to_address.to_string(), asset.to_string());
        let to_held = inner.balances.get(&to_key).copied().unwrap_or(0);
        inner.balances.insert(to_key, to_held + amount);
        Ok(0)
    }

    fn transfer_from_contract_to_public_account(
        &self,
        contract_id: &str,
        to_account: &str,
        asset: &str,
        amount: i64,
    ) -> Result<i64, ChainError> {
        self.transfer_from_contract_to_address(contract_id, to_account, asset, amount)
    }

    fn get_contract_balance_amount(&self, contract_id: &str, asset: &str) -> i64 {
        self.balance(contract_id, asset)
    }

    fn get_chain_now(&self) -> i64 {
        self.chain_now
    }

    fn get_chain_random(&self) -> f64 {
        self.chain_random
    }

    fn get_transaction_id(&self) -> String {
        self.transaction_id.clone()
    }

    fn get_transaction_fee(&self) -> i64 {
        self.transaction_fee
    }

    fn get_header_block_num(&self) -> i64 {
        self.header_block_num
    }

    fn emit_event(&self, contract_id: &str, event_name: &str, payload: &str) {
        self.lock().events.push((
            contract_id.to_string(),
            event_name.to_string(),
            payload.to_string(),
        ));
    }

    fn get_storage(&self, contract_id: &str, key: &str) -> StorageValue {
        self.lock()
            .storage
            .get(&(contract_id.to_string(), key.to_string()))
            .cloned()
            .unwrap_or(StorageValue::Null)
    }

    fn commit_storage_changes(&self, changes: &[StorageChangeRecord]) -> StorageResult<()> {
        let mut inner = self.lock();
        // validate everything before touching state: all or nothing
        for record in changes {
            if matches!(record.value_after, StorageValue::Unsupported) {
                return Err(StorageError::UnsupportedValue {
                    key: record.key.clone(),
                    type_name: record.value_after.type_name().to_string(),
                });
            }
        }
        for record in changes {
            let key = (record.contract_id.clone(), record.key.clone());
            if record.value_after == StorageValue::Null {
                inner.storage.remove(&key);
            } else {
                inner.storage.insert(key, record.value_after.clone());
            }
        }
        debug!("committed {} storage change(s)", changes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Prototype;

    fn empty_stream() -> ModuleStream {
        ModuleStream::new(Prototype::new("", 0))
    }

    #[test]
    fn test_register_and_resolve() {
        let chain = InMemoryChain::new();
        let address = chain.register_contract(Some("counter"), empty_stream());
        assert!(chain.check_contract_exist("counter"));
        assert!(chain.check_contract_exist_by_address(&address));
        assert_eq!(
            chain.get_contract_address_by_name("counter"),
            Some(address.clone())
        );
        assert_eq!(chain.contract_state(&address), ContractState::Active);
        assert!(chain.open_contract("counter").is_some());
    }

    #[test]
    fn test_transfer_insufficient_balance() {
        let chain = InMemoryChain::new();
        chain.set_balance("c1", "COIN", 50);
        let err = chain
            .transfer_from_contract_to_address("c1", "alice", "COIN", 100)
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance { held: 50, .. }));
        // nothing moved
        assert_eq!(chain.balance("c1", "COIN"), 50);
        assert_eq!(chain.balance("alice", "COIN"), 0);
    }

    #[test]
    fn test_transfer_moves_balance() {
        let chain = InMemoryChain::new();
        chain.set_balance("c1", "COIN", 100);
        chain
            .transfer_from_contract_to_address("c1", "alice", "COIN", 30)
            .unwrap();
        assert_eq!(chain.balance("c1", "COIN"), 70);
        assert_eq!(chain.balance("alice", "COIN"), 30);
    }

    #[test]
    fn test_storage_commit_and_null_delete() {
        let chain = InMemoryChain::new();
        let changes = vec![StorageChangeRecord {
            contract_id: "c1".into(),
            key: "k".into(),
            value_before: StorageValue::Null,
            value_after: StorageValue::Int(5),
        }];
        chain.commit_storage_changes(&changes).unwrap();
        assert_eq!(chain.get_storage("c1", "k"), StorageValue::Int(5));

        let deletes = vec![StorageChangeRecord {
            contract_id: "c1".into(),
            key: "k".into(),
            value_before: StorageValue::Int(5),
            value_after: StorageValue::Null,
        }];
        chain.commit_storage_changes(&deletes).unwrap();
        assert_eq!(chain.get_storage("c1", "k"), StorageValue::Null);
    }
}
