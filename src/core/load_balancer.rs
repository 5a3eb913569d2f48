use std::{collections::HashMap, sync::Mutex};

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::core::instance::{InstanceKey, ServiceInstance};

/// Errors produced by instance selection.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BalanceError {
    /// The candidate list was empty.
    #[error("no service instance available")]
    NoInstanceAvailable,
}

/// Trait defining the interface for load balancing strategies
pub trait Balance: Send + Sync + 'static {
    /// Select one instance from a candidate list.
    fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance, BalanceError>;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn Balance>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Uniform random selection.
#[derive(Default)]
pub struct RandomBalance;

impl RandomBalance {
    pub fn new() -> Self {
        Self
    }
}

impl Balance for RandomBalance {
    fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance, BalanceError> {
        if instances.is_empty() {
            return Err(BalanceError::NoInstanceAvailable);
        }
        let index = rand::rng().random_range(0..instances.len());
        Ok(instances[index].clone())
    }
}

/// Smooth weighted round robin.
///
/// Each call adds every instance's static weight to its scratch weight,
/// picks the instance with the highest scratch weight and decrements the
/// winner by the sum of all weights. Over a stable instance set this yields
/// selection frequency proportional to weight without bursts.
///
/// Scratch state is keyed by instance identity and pruned to the live set on
/// every call, so lists replaced by cache refreshes keep converging.
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<InstanceKey, i64>>,
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
        }
    }
}

impl Balance for WeightedRoundRobin {
    fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance, BalanceError> {
        if instances.is_empty() {
            return Err(BalanceError::NoInstanceAvailable);
        }

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop scratch entries for instances that left the list.
        current.retain(|key, _| instances.iter().any(|i| i.key() == *key));

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;
        let mut best_weight = i64::MIN;

        for (index, instance) in instances.iter().enumerate() {
            let weight = i64::from(instance.weight);
            total += weight;
            let scratch = current.entry(instance.key()).or_insert(0);
            *scratch += weight;
            if best.is_none() || *scratch > best_weight {
                best = Some(index);
                best_weight = *scratch;
            }
        }

        let winner = &instances[best.ok_or(BalanceError::NoInstanceAvailable)?];
        if let Some(scratch) = current.get_mut(&winner.key()) {
            *scratch -= total;
        }
        Ok(winner.clone())
    }
}

/// Random-permutation selection: shuffles the index space and picks the
/// first entry. Equivalent in distribution to [`RandomBalance`]; retained as
/// a distinct swappable mechanism.
#[derive(Default)]
pub struct ShuffleBalance;

impl ShuffleBalance {
    pub fn new() -> Self {
        Self
    }
}

impl Balance for ShuffleBalance {
    fn select(&self, instances: &[ServiceInstance]) -> Result<ServiceInstance, BalanceError> {
        if instances.is_empty() {
            return Err(BalanceError::NoInstanceAvailable);
        }
        let mut indices: Vec<usize> = (0..instances.len()).collect();
        indices.shuffle(&mut rand::rng());
        Ok(instances[indices[0]].clone())
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct BalanceFactory;

impl BalanceFactory {
    pub fn create_strategy(strategy: &crate::config::LoadBalanceStrategy) -> Box<dyn Balance> {
        match strategy {
            crate::config::LoadBalanceStrategy::Random => RandomBalance::new().boxed(),
            crate::config::LoadBalanceStrategy::WeightedRoundRobin => {
                WeightedRoundRobin::new().boxed()
            }
            crate::config::LoadBalanceStrategy::Shuffle => ShuffleBalance::new().boxed(),
        }
    }
}
