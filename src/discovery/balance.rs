//! Load-balancing strategies over discovery results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::warn;

use super::{DiscoveryResult, Instance};

/// Picks instances out of a discovery result.
///
/// Implementations may precompute per-cache-key state; `rebalance` swaps it
/// after a refresh and `delete` drops it when the factory evicts the entry.
pub trait Balancer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn pick(&self, result: &DiscoveryResult) -> Option<Arc<Instance>>;

    /// Recomputes cached state for `result` from scratch.
    fn rebalance(&self, result: &DiscoveryResult);

    /// Drops cached state for an evicted cache key.
    fn delete(&self, cache_key: &str);
}

struct WeightedEntry {
    instances: Vec<Arc<Instance>>,
    weights: Vec<i32>,
    weight_sum: i64,
}

impl WeightedEntry {
    fn build(result: &DiscoveryResult) -> WeightedEntry {
        let mut instances = Vec::with_capacity(result.instances.len());
        let mut weights = Vec::with_capacity(result.instances.len());
        let mut weight_sum: i64 = 0;
        for instance in &result.instances {
            if instance.weight <= 0 {
                warn!(
                    "instance {} has non-positive weight {}, excluding",
                    instance.address, instance.weight
                );
                continue;
            }
            instances.push(instance.clone());
            weights.push(instance.weight);
            weight_sum += instance.weight as i64;
        }
        WeightedEntry {
            instances,
            weights,
            weight_sum,
        }
    }

    fn pick(&self) -> Option<Arc<Instance>> {
        if self.weight_sum <= 0 {
            return None;
        }
        let mut r = rand::thread_rng().gen_range(0..self.weight_sum);
        for (instance, weight) in self.instances.iter().zip(&self.weights) {
            r -= *weight as i64;
            if r < 0 {
                return Some(instance.clone());
            }
        }
        None
    }
}

/// Weight-proportional random selection.
pub struct WeightedRandomBalancer {
    cache: Mutex<HashMap<String, Arc<WeightedEntry>>>,
}

impl WeightedRandomBalancer {
    pub fn new() -> WeightedRandomBalancer {
        WeightedRandomBalancer {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn entry_for(&self, result: &DiscoveryResult) -> Arc<WeightedEntry> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(result.cache_key.clone())
            .or_insert_with(|| Arc::new(WeightedEntry::build(result)))
            .clone()
    }
}

impl Default for WeightedRandomBalancer {
    fn default() -> WeightedRandomBalancer {
        WeightedRandomBalancer::new()
    }
}

impl Balancer for WeightedRandomBalancer {
    fn name(&self) -> &str {
        "weight_random"
    }

    fn pick(&self, result: &DiscoveryResult) -> Option<Arc<Instance>> {
        self.entry_for(result).pick()
    }

    fn rebalance(&self, result: &DiscoveryResult) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            result.cache_key.clone(),
            Arc::new(WeightedEntry::build(result)),
        );
    }

    fn delete(&self, cache_key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(cache_key);
    }
}
