//! Control-plane driver core for CQL wide-column clusters.
//!
//! The centrepiece is the [`ControlConnection`]: one long-lived session to
//! some member of the cluster used exclusively for metadata and events. It
//! discovers cluster members, keeps schema metadata fresh, reacts to
//! server-pushed topology/status/schema events, and probes members reported
//! down, reconnecting with backoff when its own transport fails.
//!
//! Everything that touches the wire is behind collaborator seams
//! ([`Connector`], [`RequestRunner`], [`Reactor`]) so the core stays a pure
//! coordination state machine. Host selection and retry pacing are policies
//! ([`LoadBalancingPolicy`], [`ReconnectionPolicy`]); discovered members and
//! schema land in a [`ClusterRegistry`] and [`ClusterSchema`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cquill::{
//!     ConnectionOptions,
//!     ControlConnection,
//!     ExponentialReconnectionPolicy,
//!     InMemoryRegistry,
//!     InMemorySchema,
//!     RoundRobinPolicy,
//!     TokioReactor,
//! };
//!
//! # async fn example(
//! #     connector: Arc<dyn cquill::Connector>,
//! #     runner: Arc<dyn cquill::RequestRunner>,
//! # ) -> cquill::Result<()> {
//! let registry = Arc::new(InMemoryRegistry::new());
//! let control = ControlConnection::new(
//!     Arc::new(TokioReactor::default()),
//!     connector,
//!     runner,
//!     Arc::new(RoundRobinPolicy::new(registry.clone())),
//!     Arc::new(ExponentialReconnectionPolicy::default()),
//!     registry,
//!     Arc::new(InMemorySchema::new()),
//!     Arc::new(ConnectionOptions::default()),
//! );
//! control.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod control;
pub mod errors;
pub mod policy;
pub mod transport;

pub use cluster::{
    ClusterRegistry,
    ClusterSchema,
    Host,
    InMemoryRegistry,
    InMemorySchema,
};
pub use control::{
    ConnectionOptions,
    ControlConnection,
    Status,
    DEFAULT_PROTOCOL_VERSION,
};
pub use cquill_wire_types as wire_types;
pub use errors::{
    Error,
    Result,
};
pub use policy::{
    ExponentialReconnectionPolicy,
    HostPlan,
    LoadBalancingPolicy,
    ReconnectionPolicy,
    ReconnectionSchedule,
    RoundRobinPolicy,
};
pub use transport::{
    Connection,
    ConnectionHandle,
    Connector,
    Reactor,
    RequestRunner,
    TokioReactor,
};
