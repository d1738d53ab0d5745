//! # Up-Conversion
//!
//! Events written under an old contract are rewritten into their current
//! shape before delivery. Converters are registered per source contract name
//! and applied repeatedly until none matches:
//!
//! ```text
//!   CartCreated.v1 ──► CartCreated.v2 ──► CartCreated.v3   (no converter: done)
//! ```
//!
//! Dispatch is by contract name, and each converter is a typed function from
//! one contract to the next. A chain that revisits a contract, or runs longer
//! than [`MAX_UPCONVERSION_STEPS`], fails with [`Error::ConversionLoop`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::contracts::{Contract, Event};
use crate::error::{Error, Result};

/// Upper bound on conversions applied to one event.
pub const MAX_UPCONVERSION_STEPS: usize = 64;

type ConvertFn = Box<dyn Fn(Box<dyn Event>) -> Result<Box<dyn Event>> + Send + Sync>;

/// Converters keyed by the contract name they accept.
#[derive(Default)]
pub struct UpConverterRegistry {
    converters: HashMap<&'static str, ConvertFn>,
    targets: HashMap<&'static str, &'static str>,
}

impl UpConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the conversion `From -> To`. A later registration for the
    /// same `From` replaces the earlier one.
    ///
    /// ```rust,ignore
    /// upconverters.register(|old: CartCreatedV1| CartCreatedV2 {
    ///     cart_id: old.id,
    ///     currency: "EUR".into(),
    /// });
    /// ```
    pub fn register<From, To, F>(&mut self, convert: F) -> &mut Self
    where
        From: Contract,
        To: Contract,
        F: Fn(From) -> To + Send + Sync + 'static,
    {
        let apply = move |event: Box<dyn Event>| -> Result<Box<dyn Event>> {
            let actual = event.contract_name();
            match event.downcast::<From>() {
                Some(old) => Ok(Box::new(convert(old))),
                None => Err(Error::Serialization(format!(
                    "up-converter for '{}' received an event of contract '{}'",
                    From::NAME,
                    actual
                ))),
            }
        };
        self.converters.insert(From::NAME, Box::new(apply));
        self.targets.insert(From::NAME, To::NAME);
        self
    }

    /// Returns true if events of `contract_name` would be converted.
    pub fn has_converter(&self, contract_name: &str) -> bool {
        self.converters.contains_key(contract_name)
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Applies converters until none matches the event's contract.
    pub fn convert(&self, mut event: Box<dyn Event>) -> Result<Box<dyn Event>> {
        let mut seen = HashSet::new();
        let mut steps = 0;

        loop {
            let name = event.contract_name();
            let Some(convert) = self.converters.get(name) else {
                return Ok(event);
            };

            if !seen.insert(name) || steps >= MAX_UPCONVERSION_STEPS {
                return Err(Error::ConversionLoop {
                    contract_name: name.to_string(),
                    steps,
                });
            }

            event = convert(event)?;
            steps += 1;
        }
    }
}

impl fmt::Debug for UpConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut edges: Vec<_> = self.targets.iter().collect();
        edges.sort_unstable();
        f.debug_struct("UpConverterRegistry")
            .field("conversions", &edges)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
