//! Registry for managing named circuit breakers.
//!
//! Allows maintenance access (reset/inspection) to circuit breakers by ID from code that does
//! not own the guard they live in.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreakerHandle, CircuitState};
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker ID was not found.
    #[error("circuit breaker '{id}' not found")]
    NotFound {
        /// Identifier that could not be located.
        id: String,
    },
    /// A handle without a name was passed to [`CircuitBreakerRegistry::register_named`].
    #[error("circuit breaker has no name")]
    Unnamed,
}

/// Trait for breaker registries.
pub trait CircuitBreakerRegistry: Send + Sync + std::fmt::Debug {
    /// Register a circuit breaker handle by id, overwriting any existing handle.
    ///
    /// When multiple guards share an ID the last registration wins; the replaced breaker keeps
    /// its own state and is simply no longer reachable through the registry.
    fn register(&self, id: String, handle: CircuitBreakerHandle);
    /// Get a breaker handle by id.
    fn get(&self, id: &str) -> Option<CircuitBreakerHandle>;
    /// Remove a breaker by id, returning its handle.
    fn remove(&self, id: &str) -> Option<CircuitBreakerHandle>;
    /// Snapshot breaker states sorted by id.
    fn snapshot(&self) -> Vec<(String, CircuitState)>;

    /// Register a handle under its configured name.
    fn register_named(&self, handle: CircuitBreakerHandle) -> Result<(), CircuitBreakerRegistryError> {
        let id = handle.name().ok_or(CircuitBreakerRegistryError::Unnamed)?.to_string();
        self.register(id, handle);
        Ok(())
    }

    /// Reset a breaker by id, erroring if missing.
    fn reset(&self, id: &str) -> Result<(), CircuitBreakerRegistryError> {
        match self.get(id) {
            Some(handle) => {
                handle.reset();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { id: id.to_string() }),
        }
    }

    /// Current state of a breaker by id.
    fn state(&self, id: &str) -> Result<CircuitState, CircuitBreakerRegistryError> {
        self.get(id)
            .map(|handle| handle.state())
            .ok_or_else(|| CircuitBreakerRegistryError::NotFound { id: id.to_string() })
    }
}

/// In-memory implementation backed by an RwLock.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreakerHandle>>>,
}

impl InMemoryCircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every registered breaker.
    pub fn reset_all(&self) {
        let handles: Vec<CircuitBreakerHandle> =
            self.inner.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        for handle in handles {
            handle.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CircuitBreakerRegistry for InMemoryCircuitBreakerRegistry {
    fn register(&self, id: String, handle: CircuitBreakerHandle) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            warn!(target: "faultguard::circuit_breaker_registry", id = %id, "circuit breaker id replaced; last registration wins");
        }
        map.insert(id, handle);
    }

    fn get(&self, id: &str) -> Option<CircuitBreakerHandle> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn remove(&self, id: &str) -> Option<CircuitBreakerHandle> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    fn snapshot(&self) -> Vec<(String, CircuitState)> {
        // collect first: state() may log a lazy transition
        let handles: Vec<(String, CircuitBreakerHandle)> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut entries: Vec<(String, CircuitState)> =
            handles.into_iter().map(|(k, v)| (k, v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
