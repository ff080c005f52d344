//! Shared store of session metadata.
//!
//! The manager, the tunnel monitor and the session all write into the same
//! [`BuildAttributes`]; clones share one map.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Name of the launched instance.
pub const INSTANCE_NAME: &str = "instance_name";
/// Set to `true` once instance deletion was attempted.
pub const CLEANUP_ATTEMPTED: &str = "instance_cleanup_attempted";
/// Local `host:port` the bridge reaches the device on.
pub const BRIDGE_ADDRESS: &str = "bridge_address";

/// Cloneable, thread-safe string map.
#[derive(Clone, Debug, Default)]
pub struct BuildAttributes {
    values: Arc<RwLock<BTreeMap<String, String>>>,
}

impl BuildAttributes {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Copies every entry of `entries` into the store.
    pub fn extend<'a>(&self, entries: impl IntoIterator<Item = (&'a String, &'a String)>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            values.insert(key.clone(), value.clone());
        }
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether instance deletion was attempted.
    #[must_use]
    pub fn cleanup_attempted(&self) -> bool {
        self.get(CLEANUP_ATTEMPTED).as_deref() == Some("true")
    }
}
