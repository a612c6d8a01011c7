//! Field resolvers: dynamic field access strategies for special tables
//!
//! The VM's index instructions dispatch on [`crate::vm::value::Value::Resolver`]
//! values through this trait instead of special-casing table lookups.
//! `StorageResolver` backs a contract's `self.storage` table with the
//! session change tracker; `ContractResolver` backs an imported contract's
//! module table with call proxies and identity fields.

use crate::chain::ChainApi;
use crate::vm::errors::VmError;
use crate::vm::session::SessionContext;
use crate::vm::value::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Strategy invoked by GetField/SetField (and the index forms) when the
/// object is a resolver value
pub trait FieldResolver: Debug {
    fn get_field(
        &self,
        ctx: &mut SessionContext,
        chain: &dyn ChainApi,
        key: &str,
    ) -> Result<Value, VmError>;

    fn set_field(
        &self,
        ctx: &mut SessionContext,
        chain: &dyn ChainApi,
        key: &str,
        value: Value,
    ) -> Result<(), VmError>;

    /// Short tag for diagnostics
    fn describe(&self) -> &'static str;
}

/// Contract storage access routed through the change tracker
#[derive(Debug)]
pub struct StorageResolver {
    pub contract_id: String,
}

impl FieldResolver for StorageResolver {
    fn get_field(
        &self,
        ctx: &mut SessionContext,
        chain: &dyn ChainApi,
        key: &str,
    ) -> Result<Value, VmError> {
        let stored = ctx
            .changes
            .read(&self.contract_id, key, || chain.get_storage(&self.contract_id, key));
        Ok(ctx.materialize_storage(&stored))
    }

    fn set_field(
        &self,
        ctx: &mut SessionContext,
        chain: &dyn ChainApi,
        key: &str,
        value: Value,
    ) -> Result<(), VmError> {
        let stored = ctx.persist_value(&value)?;
        ctx.changes
            .write(&self.contract_id, key, stored, || {
                chain.get_storage(&self.contract_id, key)
            });
        Ok(())
    }

    fn describe(&self) -> &'static str {
        "storage"
    }
}

/// An imported contract's visible surface: proxied API functions plus the
/// reserved identity fields; everything is read-only from script code
#[derive(Debug)]
pub struct ContractResolver {
    pub address: String,
    /// Human name, kept only for the well-known contract
    pub name: Option<String>,
    pub exports: BTreeMap<String, Value>,
}

impl FieldResolver for ContractResolver {
    fn get_field(
        &self,
        _ctx: &mut SessionContext,
        _chain: &dyn ChainApi,
        key: &str,
    ) -> Result<Value, VmError> {
        match key {
            "id" => Ok(Value::from_str(&self.address)),
            "name" => Ok(Value::from_str(
                self.name.as_deref().unwrap_or(self.address.as_str()),
            )),
            _ => Ok(self.exports.get(key).cloned().unwrap_or(Value::Nil)),
        }
    }

    fn set_field(
        &self,
        _ctx: &mut SessionContext,
        _chain: &dyn ChainApi,
        _key: &str,
        _value: Value,
    ) -> Result<(), VmError> {
        Err(VmError::EnvironmentWrite)
    }

    fn describe(&self) -> &'static str {
        "contract"
    }
}
