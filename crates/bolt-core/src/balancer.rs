//! Load-balancer port and stock policies.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::discovery::ServiceInstance;
use crate::error::{Error, Result};

/// Picks one instance out of a candidate list for each call.
pub trait Balancer: Send + Sync {
    /// Selects an instance for `service_method`. An empty candidate list is
    /// the no-available-instances error.
    fn select(
        &self,
        instances: &[ServiceInstance],
        service_method: &str,
    ) -> Result<ServiceInstance>;

    /// Informs the policy that the instance set changed, letting stateful
    /// policies reset their position.
    fn update_instances(&self, instances: &[ServiceInstance]);
}

/// Cycles through instances in order.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _service_method: &str,
    ) -> Result<ServiceInstance> {
        if instances.is_empty() {
            return Err(Error::no_available_instances());
        }
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(instances[(next % instances.len() as u64) as usize].clone())
    }

    fn update_instances(&self, _instances: &[ServiceInstance]) {
        self.next.store(0, Ordering::Relaxed);
    }
}

/// Picks a uniformly random instance.
#[derive(Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for Random {
    fn select(
        &self,
        instances: &[ServiceInstance],
        _service_method: &str,
    ) -> Result<ServiceInstance> {
        if instances.is_empty() {
            return Err(Error::no_available_instances());
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        Ok(instances[index].clone())
    }

    fn update_instances(&self, _instances: &[ServiceInstance]) {}
}
