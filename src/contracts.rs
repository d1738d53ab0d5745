//! # Event Contracts
//!
//! A contract is an event type with a stable name. The name is what the store
//! records next to each payload; the registry turns it back into a type when
//! events are fetched.
//!
//! ```rust
//! use eventline::contracts::{Contract, ContractRegistry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CartCreated {
//!     cart_id: String,
//! }
//!
//! impl Contract for CartCreated {
//!     const NAME: &'static str = "CartCreated";
//! }
//!
//! let mut registry = ContractRegistry::new();
//! registry.register::<CartCreated>();
//! assert!(registry.contains("CartCreated"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Serializer;
use crate::error::{Error, Result};
use crate::types::{EventRecord, StreamRev};

// =============================================================================
// Traits
// =============================================================================

/// A serializable event type with a stable contract name.
pub trait Contract: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Name stored with every payload of this type. Never change it once
    /// events have been written; register an up-converter to a new contract
    /// instead.
    const NAME: &'static str;
}

/// Object-safe view of any [`Contract`].
pub trait Event: fmt::Debug + Send + Sync + 'static {
    fn contract_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Contract> Event for T {
    fn contract_name(&self) -> &'static str {
        T::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn Event {
    /// Returns true if the event is a `T`.
    pub fn is<T: Contract>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrows the event as a `T`.
    pub fn downcast_ref<T: Contract>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Takes the event as a `T`.
    pub fn downcast<T: Contract>(self: Box<Self>) -> Option<T> {
        self.into_any().downcast::<T>().ok().map(|event| *event)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Turns a structured payload into a typed event.
pub type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn Event>>;

fn decode_as<T: Contract>(value: serde_json::Value) -> Result<Box<dyn Event>> {
    let event: T = serde_json::from_value(value)?;
    Ok(Box::new(event))
}

/// Maps contract names to their decoders.
#[derive(Default, Clone)]
pub struct ContractRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `T::NAME`. Registering twice is harmless.
    pub fn register<T: Contract>(&mut self) -> &mut Self {
        self.decoders.insert(T::NAME, decode_as::<T>);
        self
    }

    pub fn contains(&self, contract_name: &str) -> bool {
        self.decoders.contains_key(contract_name)
    }

    /// Resolves a contract name.
    pub fn resolve(&self, contract_name: &str) -> Result<DecodeFn> {
        self.decoders
            .get(contract_name)
            .copied()
            .ok_or_else(|| Error::UnknownContract {
                contract_name: contract_name.to_string(),
            })
    }

    /// Decodes `bytes` as the contract named `contract_name`.
    pub fn decode(
        &self,
        serializer: &dyn Serializer,
        contract_name: &str,
        bytes: &[u8],
    ) -> Result<Box<dyn Event>> {
        let decode = self.resolve(contract_name)?;
        decode(serializer.deserialize(bytes)?)
    }

    /// Registered contract names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("contracts", &self.names())
            .finish()
    }
}

/// Encodes a typed event as the record for `version`.
pub fn encode<T: Contract>(
    serializer: &dyn Serializer,
    version: StreamRev,
    event: &T,
) -> Result<EventRecord> {
    let value = serde_json::to_value(event)?;
    Ok(EventRecord::new(version, T::NAME, serializer.serialize(&value)?))
}

// =============================================================================
// Tests
// =============================================================================
