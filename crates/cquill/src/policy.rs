//! Host selection and reconnection pacing policies.

use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use cquill_wire_types::backoff::Backoff;

use crate::cluster::{
    ClusterRegistry,
    Host,
};

/// A one-shot ranked enumeration of candidate hosts. Consumers take hosts in
/// order and must not re-rank them.
pub type HostPlan = Box<dyn Iterator<Item = Host> + Send>;

pub trait LoadBalancingPolicy: Send + Sync {
    /// Produce a fresh plan for a statement executed in `keyspace` (control
    /// statements pass `None`).
    fn plan(&self, keyspace: Option<&str>) -> HostPlan;
}

/// A stateful producer of backoff delays; each call advances the backoff.
pub trait ReconnectionSchedule: Send {
    fn next_delay(&mut self) -> Duration;
}

pub trait ReconnectionPolicy: Send + Sync {
    /// A fresh schedule for one outage or one down-host probe series.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Rotates through the registry's current members, starting one host later on
/// each plan.
pub struct RoundRobinPolicy {
    registry: Arc<dyn ClusterRegistry>,
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new(registry: Arc<dyn ClusterRegistry>) -> Self {
        Self {
            registry,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan(&self, _keyspace: Option<&str>) -> HostPlan {
        let mut hosts = self.registry.hosts();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        Box::new(hosts.into_iter())
    }
}

/// Jittered capped-exponential reconnection delays.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialReconnectionPolicy {
    base: Duration,
    cap: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            backoff: Backoff::new(self.base, self.cap),
        })
    }
}

struct ExponentialSchedule {
    backoff: Backoff,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        self.backoff.next_delay(&mut rand::rng())
    }
}
