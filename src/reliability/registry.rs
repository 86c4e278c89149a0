//! Keyed store of circuit breakers.
//!
//! One registry is constructed at the composition root and shared by
//! reference. Breakers are created lazily on first lookup of a key; the
//! configuration passed by the first caller for a key wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::reliability::circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig};
use crate::reliability::scheduler::Scheduler;

/// Breaker key for a whole node.
pub fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

/// Breaker key for one model served by one node.
pub fn model_key(model: &str, node_id: &str) -> String {
    format!("model:{model}:{node_id}")
}

/// Registry mapping breaker keys to breakers.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    scheduler: Scheduler,
}

impl BreakerRegistry {
    /// Create an empty registry whose breakers schedule timers on `scheduler`.
    pub fn new(default_config: CircuitBreakerConfig, scheduler: Scheduler) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            scheduler,
        }
    }

    /// Return the breaker for `key`, creating it with `config` (or the
    /// registry default) if it does not exist yet.
    pub fn get_or_create(&self, key: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            debug!(breaker = %key, "Registering circuit breaker");
            CircuitBreaker::new(
                key,
                config.unwrap_or_else(|| self.default_config.clone()),
                self.scheduler.clone(),
            )
        });
        Arc::clone(entry.value())
    }

    /// The breaker for `key`, if one has been created.
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!(count = self.breakers.len(), "Reset all circuit breakers");
    }

    /// Copy of the key -> breaker map.
    pub fn get_all(&self) -> HashMap<String, Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Metrics of every breaker, ordered by key.
    pub fn metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Drop every breaker.
    pub fn clear(&self) {
        self.breakers.clear();
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::CircuitState;
    use std::time::Duration;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(CircuitBreakerConfig::default(), Scheduler::new())
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(node_key("gpu-1"), "node:gpu-1");
        assert_eq!(model_key("llama3", "gpu-1"), "model:llama3:gpu-1");
    }

    #[test]
    fn test_first_config_wins() {
        let registry = registry();
        let first = registry.get_or_create(
            "node:a",
            Some(CircuitBreakerConfig {
                failure_threshold: 7,
                ..Default::default()
            }),
        );
        let second = registry.get_or_create(
            "node:a",
            Some(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(1),
                ..Default::default()
            }),
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = registry();
        assert!(registry.get("node:missing").is_none());
        assert!(registry.is_empty());

        let created = registry.get_or_create("node:b", None);
        assert_eq!(created.config(), &CircuitBreakerConfig::default());
        assert!(registry.get("node:b").is_some());
    }

    #[tokio::test]
    async fn test_reset_all_closes_every_breaker() {
        let registry = registry();
        registry.get_or_create("node:a", None).trip();
        registry.get_or_create("node:b", None).trip();

        registry.reset_all();

        for (_, breaker) in registry.get_all() {
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
    }

    #[test]
    fn test_get_all_is_a_copy() {
        let registry = registry();
        registry.get_or_create("node:a", None);
        let mut snapshot = registry.get_all();
        snapshot.clear();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.metrics().len(), 1);
    }
}
