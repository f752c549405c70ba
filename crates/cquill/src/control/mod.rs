//! The control connection: one long-lived session to some member of the
//! cluster, used exclusively for metadata and server-pushed events.
//!
//! The connection discovers cluster members, keeps schema metadata fresh,
//! registers for topology/status/schema events, and probes members reported
//! down. Data-plane pooling and query execution live elsewhere; this module
//! only coordinates its collaborators.

use std::{
    collections::{
        BTreeMap,
        HashSet,
    },
    net::IpAddr,
    sync::{
        atomic::{
            AtomicU8,
            Ordering,
        },
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;

use crate::{
    cluster::{
        ClusterRegistry,
        ClusterSchema,
        Host,
    },
    errors::{
        Error,
        Result,
    },
    policy::{
        HostPlan,
        LoadBalancingPolicy,
        ReconnectionPolicy,
        ReconnectionSchedule,
    },
    transport::{
        Connection,
        Connector,
        Reactor,
        RequestRunner,
    },
};

mod events;
mod refresh;
#[cfg(test)]
pub(crate) mod testing;

pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;

/// Options shared with the connector. The protocol version is negotiated
/// downward when a node rejects the requested version; it never goes back up
/// and never drops below 1.
#[derive(Debug)]
pub struct ConnectionOptions {
    protocol_version: AtomicU8,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::with_protocol_version(DEFAULT_PROTOCOL_VERSION)
    }
}

impl ConnectionOptions {
    pub fn with_protocol_version(version: u8) -> Self {
        Self {
            protocol_version: AtomicU8::new(version.max(1)),
        }
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version.load(Ordering::SeqCst)
    }

    /// Step down one protocol version; `None` once at the floor of 1.
    fn downgrade_protocol_version(&self) -> Option<u8> {
        self.protocol_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |version| {
                (version > 1).then_some(version - 1)
            })
            .ok()
            .map(|previous| previous - 1)
    }
}

/// Lifecycle phase of the control connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Closed,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// Everything guarded by the monitor. Held only for short, non-awaiting
/// critical sections.
#[derive(Debug)]
struct ControlState {
    status: Status,
    connection: Option<Arc<Connection>>,
    refreshing_statuses: HashSet<IpAddr>,
}

pub(crate) struct Inner {
    state: Mutex<ControlState>,
    options: Arc<ConnectionOptions>,
    reactor: Arc<dyn Reactor>,
    connector: Arc<dyn Connector>,
    runner: Arc<dyn RequestRunner>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    reconnection: Arc<dyn ReconnectionPolicy>,
    registry: Arc<dyn ClusterRegistry>,
    schema: Arc<dyn ClusterSchema>,
}

/// Maintains exactly one live metadata session to the cluster.
///
/// Cheap to clone; all clones share the session. Spawned background loops
/// (close watcher, reconnection, status probes, event dispatch) hold weak
/// references and die with the last clone.
#[derive(Clone)]
pub struct ControlConnection {
    pub(crate) inner: Arc<Inner>,
}

impl ControlConnection {
    pub fn new(
        reactor: Arc<dyn Reactor>,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn RequestRunner>,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        reconnection: Arc<dyn ReconnectionPolicy>,
        registry: Arc<dyn ClusterRegistry>,
        schema: Arc<dyn ClusterSchema>,
        options: Arc<ConnectionOptions>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ControlState {
                    status: Status::Closed,
                    connection: None,
                    refreshing_statuses: HashSet::new(),
                }),
                options,
                reactor,
                connector,
                runner,
                load_balancing,
                reconnection,
                registry,
                schema,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Establish the control connection. Idempotent while connecting or
    /// connected; fails with [`Error::Closed`] while a close is in flight.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                Status::Connecting | Status::Connected => return Ok(()),
                Status::Closing => return Err(Error::Closed),
                Status::Closed | Status::Reconnecting => state.status = Status::Connecting,
            }
        }
        self.inner.reactor.start().await;
        let plan = self.inner.load_balancing.plan(None);
        match self.connect_to_first_available(plan, Status::Connecting).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let mut state = self.inner.state.lock();
                if state.status == Status::Connecting {
                    state.status = Status::Closed;
                }
                Err(error)
            },
        }
    }

    /// Tear down the reactor and release the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let connection = {
            let mut state = self.inner.state.lock();
            if matches!(state.status, Status::Closing | Status::Closed) {
                return Ok(());
            }
            state.status = Status::Closing;
            // Every probe loop exits at its next membership check.
            state.refreshing_statuses.clear();
            state.connection.take()
        };
        self.inner.reactor.stop().await;
        if let Some(connection) = connection {
            self.inner
                .connector
                .close(connection.host(), connection)
                .await;
        }
        self.inner.state.lock().status = Status::Closed;
        tracing::debug!("control connection closed");
        Ok(())
    }

    /// Registry listener surface; membership additions need no reaction
    /// beyond what topology refresh already did.
    pub fn host_found(&self, host: &Host) {
        tracing::debug!(host = %host.ip, "cluster member found");
    }

    /// A removed member must not keep a status probe alive.
    pub fn host_lost(&self, host: &Host) {
        self.inner.state.lock().refreshing_statuses.remove(&host.ip);
    }

    /// A member came back. Stop probing it, and if the control connection
    /// itself is gone, use the opportunity to re-establish it.
    pub fn host_up(&self, host: &Host) {
        let reconnect = {
            let mut state = self.inner.state.lock();
            state.refreshing_statuses.remove(&host.ip);
            state.connection.is_none()
                && !matches!(state.status, Status::Closed | Status::Closing)
        };
        if reconnect {
            let control = self.clone();
            tokio::spawn(async move {
                if let Err(error) = control.connect().await {
                    tracing::warn!(%error, "failed to re-establish the control connection");
                }
            });
        }
    }

    /// A member was reported down. While the control connection is healthy
    /// the topology refresh owns probing; otherwise start a probe loop unless
    /// one is already in flight.
    pub fn host_down(&self, host: &Host) {
        let start = {
            let mut state = self.inner.state.lock();
            let healthy = state
                .connection
                .as_ref()
                .is_some_and(|connection| connection.is_connected());
            if healthy || state.refreshing_statuses.contains(&host.ip) {
                false
            } else {
                state.refreshing_statuses.insert(host.ip)
            }
        };
        if start {
            self.spawn_status_probe(host.ip, false);
        }
    }

    /// Walk the plan in order until a host takes the connection. Auth
    /// failures abort the walk; everything else is recorded per host.
    async fn connect_to_first_available(&self, mut plan: HostPlan, phase: Status) -> Result<()> {
        let mut errors = BTreeMap::new();
        while let Some(host) = plan.next() {
            match self.connect_and_refresh(&host, phase).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_authentication_failure() => {
                    return Err(error.into_authentication())
                },
                Err(Error::Closed) => return Err(Error::Closed),
                Err(error) => {
                    tracing::warn!(host = %host.ip, %error, "control connection attempt failed");
                    errors.insert(host.ip, error);
                },
            }
        }
        Err(Error::NoHostsAvailable { errors })
    }

    /// One full attempt against one host: open the transport, take ownership
    /// of it, then register for events and prime the metadata caches. A
    /// failure after the transport opened releases it before the caller moves
    /// on down the plan.
    async fn connect_and_refresh(&self, host: &Host, phase: Status) -> Result<()> {
        let connection = self.connect_to_host(host).await?;
        let previous = match self.install_connection(connection.clone()) {
            Ok(previous) => previous,
            Err(error) => {
                // A close won the race; release the fresh transport.
                self.inner.connector.close(connection.host(), connection).await;
                return Err(error);
            },
        };
        if let Some(previous) = previous {
            self.inner.connector.close(previous.host(), previous).await;
        }
        self.spawn_close_watcher(&connection);

        let setup = async {
            self.register_events(&connection).await?;
            self.refresh_hosts().await?;
            self.refresh_schema().await?;
            Ok(())
        };
        match setup.await {
            Ok(()) => {
                tracing::debug!(host = %connection.host(), "control connection established");
                Ok(())
            },
            Err(error) => {
                let abandoned = {
                    let mut state = self.inner.state.lock();
                    let current = state
                        .connection
                        .as_ref()
                        .is_some_and(|c| Arc::ptr_eq(c, &connection));
                    if current {
                        state.connection = None;
                        if state.status == Status::Connected {
                            state.status = phase;
                        }
                    }
                    current
                };
                if abandoned {
                    self.inner
                        .connector
                        .close(connection.host(), connection.clone())
                        .await;
                }
                Err(error)
            },
        }
    }

    /// Open a transport to one host, stepping the protocol version down and
    /// retrying the same host on a negotiation error.
    async fn connect_to_host(&self, host: &Host) -> Result<Arc<Connection>> {
        loop {
            match self.inner.connector.connect(host.ip).await {
                Ok(connection) => return Ok(connection),
                Err(error) if error.is_protocol_negotiation() => {
                    match self.inner.options.downgrade_protocol_version() {
                        Some(version) => {
                            tracing::warn!(
                                host = %host.ip,
                                protocol_version = version,
                                "protocol negotiation failed, retrying at a lower version"
                            );
                        },
                        None => return Err(error),
                    }
                },
                Err(error) => return Err(error),
            }
        }
    }

    /// Take ownership of a freshly opened connection, returning the one it
    /// replaces (if any) for the caller to close.
    fn install_connection(&self, connection: Arc<Connection>) -> Result<Option<Arc<Connection>>> {
        let mut state = self.inner.state.lock();
        match state.status {
            Status::Closing | Status::Closed => Err(Error::Closed),
            _ => {
                state.status = Status::Connected;
                Ok(state.connection.replace(connection))
            },
        }
    }

    /// Watch for the transport going away. A user-initiated close already
    /// took the connection out of the state, so observing it here means the
    /// transport failed: clear it and start reconnecting.
    fn spawn_close_watcher(&self, connection: &Arc<Connection>) {
        let weak = Arc::downgrade(&self.inner);
        let connection = connection.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let reconnect = {
                let mut state = inner.state.lock();
                let current = state
                    .connection
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, &connection));
                if !current {
                    false
                } else {
                    state.connection = None;
                    match state.status {
                        Status::Closing => {
                            state.status = Status::Closed;
                            false
                        },
                        Status::Connected => {
                            state.status = Status::Reconnecting;
                            true
                        },
                        _ => false,
                    }
                }
            };
            if reconnect {
                tracing::warn!(host = %connection.host(), "control connection lost, reconnecting");
                let schedule = inner.reconnection.new_schedule();
                Inner::spawn_reconnect_loop(Arc::downgrade(&inner), schedule);
            }
        });
    }

    /// Probe a down host until it answers or leaves the refreshing set. With
    /// `immediate` the first attempt skips the leading delay (used right
    /// after a topology refresh saw the host down).
    pub(crate) fn spawn_status_probe(&self, ip: IpAddr, immediate: bool) {
        let weak = Arc::downgrade(&self.inner);
        let mut schedule = self.inner.reconnection.new_schedule();
        tokio::spawn(async move {
            let mut skip_delay = immediate;
            loop {
                if !skip_delay {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let delay = schedule.next_delay();
                    let reactor = inner.reactor.clone();
                    drop(inner);
                    reactor.schedule_timer(delay).await;
                }
                skip_delay = false;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.state.lock().refreshing_statuses.contains(&ip) {
                    return;
                }
                match inner.connector.connect(ip).await {
                    Ok(connection) => {
                        // Reachability test only.
                        inner.connector.close(ip, connection).await;
                        inner.state.lock().refreshing_statuses.remove(&ip);
                        tracing::debug!(host = %ip, "down host answered a status probe");
                        return;
                    },
                    Err(error) => {
                        tracing::debug!(host = %ip, %error, "host still unreachable");
                    },
                }
            }
        });
    }

    #[cfg(test)]
    fn refreshing_statuses(&self) -> HashSet<IpAddr> {
        self.inner.state.lock().refreshing_statuses.clone()
    }
}

impl Inner {
    /// Retry the connection on the schedule's cadence until something else
    /// moves the status off `Reconnecting`. Each failure keeps the same
    /// schedule so the backoff keeps progressing.
    fn spawn_reconnect_loop(weak: Weak<Inner>, mut schedule: Box<dyn ReconnectionSchedule>) {
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let delay = schedule.next_delay();
                tracing::debug!(?delay, "scheduling control connection reconnect");
                let reactor = inner.reactor.clone();
                drop(inner);
                reactor.schedule_timer(delay).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.state.lock().status != Status::Reconnecting {
                    return;
                }
                let control = ControlConnection::from_inner(inner);
                let plan = control.inner.load_balancing.plan(None);
                match control
                    .connect_to_first_available(plan, Status::Reconnecting)
                    .await
                {
                    Ok(()) => return,
                    Err(Error::Closed) => return,
                    Err(error) => {
                        tracing::error!(%error, "control connection reconnect failed");
                    },
                }
            }
        });
    }
}
