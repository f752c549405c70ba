/// Scripted collaborator fakes for driving the control connection through
/// whole scenarios without a wire.
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    net::{
        IpAddr,
        Ipv4Addr,
    },
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use cquill_wire_types::{
    queries,
    Request,
    Row,
};
use parking_lot::Mutex;
use serde_json::{
    json,
    Value,
};

use crate::{
    cluster::{
        ClusterRegistry,
        ClusterSchema,
        Host,
        InMemoryRegistry,
        InMemorySchema,
    },
    control::{
        ConnectionOptions,
        ControlConnection,
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
        ConnectionHandle,
        Connector,
        RequestRunner,
        TokioReactor,
    },
};

pub(crate) fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

pub(crate) fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), json!(value)))
        .collect()
}

pub(crate) fn local_row(last: u8) -> Row {
    row(&[
        ("rack", "rack1"),
        ("data_center", "dc1"),
        ("host_id", &format!("host-{last}")),
        ("release_version", "2.0.9"),
    ])
}

pub(crate) fn peer_row(last: u8) -> Row {
    row(&[
        ("peer", &ip(last).to_string()),
        ("rpc_address", &ip(last).to_string()),
        ("rack", "rack1"),
        ("data_center", "dc1"),
        ("host_id", &format!("host-{last}")),
        ("release_version", "2.0.9"),
    ])
}

pub(crate) async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    deadline
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {description}"));
}

#[derive(Default)]
struct FakeConnectorState {
    scripts: HashMap<IpAddr, VecDeque<Error>>,
    connects: Vec<IpAddr>,
    closes: Vec<IpAddr>,
    handles: HashMap<usize, ConnectionHandle>,
    latest: HashMap<IpAddr, ConnectionHandle>,
}

/// Connector whose outcomes are scripted per host: queued errors are served
/// first, then every further attempt succeeds.
#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Mutex<FakeConnectorState>,
}

impl FakeConnector {
    pub fn fail_next(&self, host: IpAddr, error: Error) {
        self.state.lock().scripts.entry(host).or_default().push_back(error);
    }

    pub fn connects(&self) -> Vec<IpAddr> {
        self.state.lock().connects.clone()
    }

    pub fn closes(&self) -> Vec<IpAddr> {
        self.state.lock().closes.clone()
    }

    /// Transport-side handle of the most recent connection to `host`.
    pub fn handle(&self, host: IpAddr) -> ConnectionHandle {
        self.state
            .lock()
            .latest
            .get(&host)
            .cloned()
            .unwrap_or_else(|| panic!("no connection was opened to {host}"))
    }

    pub fn live_connections(&self) -> usize {
        self.state
            .lock()
            .handles
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: IpAddr) -> Result<Arc<Connection>> {
        let mut state = self.state.lock();
        state.connects.push(host);
        if let Some(error) = state.scripts.get_mut(&host).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let (connection, handle) = Connection::open(host);
        state
            .handles
            .insert(Arc::as_ptr(&connection) as usize, handle.clone());
        state.latest.insert(host, handle);
        Ok(connection)
    }

    async fn close(&self, host: IpAddr, connection: Arc<Connection>) {
        let mut state = self.state.lock();
        state.closes.push(host);
        if let Some(handle) = state.handles.get(&(Arc::as_ptr(&connection) as usize)) {
            handle.close();
        }
    }
}

#[derive(Default)]
struct FakeRunnerState {
    local: HashMap<IpAddr, Row>,
    peers: Vec<Row>,
    keyspaces: Vec<Row>,
    tables: Vec<Row>,
    columns: Vec<Row>,
    failures: HashMap<IpAddr, VecDeque<Error>>,
    requests: Vec<(IpAddr, Request)>,
}

/// Serves the system tables from in-memory rows, with scripted per-host
/// failures consumed ahead of any answer.
#[derive(Default)]
pub(crate) struct FakeRequestRunner {
    state: Mutex<FakeRunnerState>,
}

impl FakeRequestRunner {
    pub fn set_local_row(&self, host: IpAddr, row: Row) {
        self.state.lock().local.insert(host, row);
    }

    pub fn add_peer_row(&self, row: Row) {
        self.state.lock().peers.push(row);
    }

    pub fn remove_peer_row(&self, peer: IpAddr) {
        let peer = peer.to_string();
        self.state
            .lock()
            .peers
            .retain(|row| row.text("peer") != Some(peer.as_str()));
    }

    pub fn clear_local_row(&self, host: IpAddr) {
        self.state.lock().local.remove(&host);
    }

    pub fn set_schema_rows(&self, keyspaces: Vec<Row>, tables: Vec<Row>, columns: Vec<Row>) {
        let mut state = self.state.lock();
        state.keyspaces = keyspaces;
        state.tables = tables;
        state.columns = columns;
    }

    pub fn fail_next(&self, host: IpAddr, error: Error) {
        self.state.lock().failures.entry(host).or_default().push_back(error);
    }

    /// Compact request log: `REGISTER` or the query text.
    pub fn request_log(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(_, request)| match request {
                Request::Register { .. } => "REGISTER".to_string(),
                Request::Query { cql, .. } => cql.clone(),
            })
            .collect()
    }
}

fn param_text(params: &[Value], index: usize) -> Option<String> {
    params.get(index).and_then(Value::as_str).map(str::to_string)
}

fn filtered(rows: &[Row], column: &str, value: Option<&String>) -> Vec<Row> {
    rows.iter()
        .filter(|row| row.text(column).map(str::to_string).as_ref() == value)
        .cloned()
        .collect()
}

#[async_trait]
impl RequestRunner for FakeRequestRunner {
    async fn execute(&self, connection: &Connection, request: Request) -> Result<Vec<Row>> {
        let host = connection.host();
        let mut state = self.state.lock();
        state.requests.push((host, request.clone()));
        if let Some(error) = state.failures.get_mut(&host).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if !connection.is_connected() {
            return Err(Error::NotConnected);
        }
        match &request {
            Request::Register { .. } => Ok(Vec::new()),
            Request::Query { cql, params, .. } => {
                let keyspace = param_text(params, 0);
                let table = param_text(params, 1);
                match cql.as_str() {
                    queries::SELECT_LOCAL => {
                        Ok(state.local.get(&host).cloned().into_iter().collect())
                    },
                    queries::SELECT_PEERS => Ok(state.peers.clone()),
                    queries::SELECT_PEER => Ok(filtered(&state.peers, "peer", keyspace.as_ref())),
                    queries::SELECT_KEYSPACES => Ok(state.keyspaces.clone()),
                    queries::SELECT_TABLES => Ok(state.tables.clone()),
                    queries::SELECT_COLUMNS => Ok(state.columns.clone()),
                    queries::SELECT_KEYSPACE => {
                        Ok(filtered(&state.keyspaces, "keyspace_name", keyspace.as_ref()))
                    },
                    queries::SELECT_KEYSPACE_TABLES => {
                        Ok(filtered(&state.tables, "keyspace_name", keyspace.as_ref()))
                    },
                    queries::SELECT_KEYSPACE_COLUMNS => {
                        Ok(filtered(&state.columns, "keyspace_name", keyspace.as_ref()))
                    },
                    queries::SELECT_TABLE => {
                        let rows = filtered(&state.tables, "keyspace_name", keyspace.as_ref());
                        Ok(filtered(&rows, "columnfamily_name", table.as_ref()))
                    },
                    queries::SELECT_TABLE_COLUMNS => {
                        let rows = filtered(&state.columns, "keyspace_name", keyspace.as_ref());
                        Ok(filtered(&rows, "columnfamily_name", table.as_ref()))
                    },
                    other => Err(Error::Query {
                        code: 0x2000,
                        message: format!("unexpected query {other:?}"),
                    }),
                }
            },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum RegistryEvent {
    Found(IpAddr),
    Lost(IpAddr),
    Down(IpAddr),
}

/// In-memory registry that also records the notification order.
#[derive(Default)]
pub(crate) struct RecordingRegistry {
    pub inner: InMemoryRegistry,
    log: Mutex<Vec<RegistryEvent>>,
}

impl RecordingRegistry {
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.log.lock().clone()
    }
}

impl ClusterRegistry for RecordingRegistry {
    fn host_found(&self, ip: IpAddr, row: &Row) {
        self.log.lock().push(RegistryEvent::Found(ip));
        self.inner.host_found(ip, row);
    }

    fn host_lost(&self, ip: IpAddr) {
        self.log.lock().push(RegistryEvent::Lost(ip));
        self.inner.host_lost(ip);
    }

    fn host_down(&self, ip: IpAddr) {
        self.log.lock().push(RegistryEvent::Down(ip));
        self.inner.host_down(ip);
    }

    fn host(&self, ip: IpAddr) -> Option<Host> {
        self.inner.host(ip)
    }

    fn has_host(&self, ip: IpAddr) -> bool {
        self.inner.has_host(ip)
    }

    fn hosts(&self) -> Vec<Host> {
        self.inner.hosts()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SchemaUpdate {
    Keyspaces(usize),
    Keyspace(String),
    Table(String, String),
}

/// In-memory schema that also records which granularity was applied.
#[derive(Default)]
pub(crate) struct RecordingSchema {
    pub inner: InMemorySchema,
    log: Mutex<Vec<SchemaUpdate>>,
}

impl RecordingSchema {
    pub fn updates(&self) -> Vec<SchemaUpdate> {
        self.log.lock().clone()
    }
}

impl ClusterSchema for RecordingSchema {
    fn update_keyspaces(&self, host: &Host, keyspaces: &[Row], tables: &[Row], columns: &[Row]) {
        self.log.lock().push(SchemaUpdate::Keyspaces(keyspaces.len()));
        self.inner.update_keyspaces(host, keyspaces, tables, columns);
    }

    fn update_keyspace(&self, host: &Host, keyspace: &Row, tables: &[Row], columns: &[Row]) {
        let name = keyspace.text("keyspace_name").unwrap_or_default().to_string();
        self.log.lock().push(SchemaUpdate::Keyspace(name));
        self.inner.update_keyspace(host, keyspace, tables, columns);
    }

    fn update_table(&self, host: &Host, keyspace: &str, table: &Row, columns: &[Row]) {
        let name = table.text("columnfamily_name").unwrap_or_default().to_string();
        self.log
            .lock()
            .push(SchemaUpdate::Table(keyspace.to_string(), name));
        self.inner.update_table(host, keyspace, table, columns);
    }
}

/// Hands out the same fixed plan on every request.
#[derive(Default)]
pub(crate) struct ScriptedPlanPolicy {
    hosts: Mutex<Vec<IpAddr>>,
    plans: AtomicUsize,
}

impl ScriptedPlanPolicy {
    pub fn new(hosts: Vec<IpAddr>) -> Self {
        Self {
            hosts: Mutex::new(hosts),
            plans: AtomicUsize::new(0),
        }
    }

    pub fn plans_requested(&self) -> usize {
        self.plans.load(Ordering::SeqCst)
    }
}

impl LoadBalancingPolicy for ScriptedPlanPolicy {
    fn plan(&self, _keyspace: Option<&str>) -> HostPlan {
        self.plans.fetch_add(1, Ordering::SeqCst);
        let hosts: Vec<Host> = self.hosts.lock().iter().copied().map(Host::new).collect();
        Box::new(hosts.into_iter())
    }
}

/// Fixed-delay reconnection policy that counts schedules and delays.
pub(crate) struct CountingReconnectionPolicy {
    delay: Mutex<Duration>,
    schedules: AtomicUsize,
    delays: Arc<AtomicUsize>,
}

impl Default for CountingReconnectionPolicy {
    fn default() -> Self {
        Self {
            delay: Mutex::new(Duration::from_millis(1)),
            schedules: AtomicUsize::new(0),
            delays: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl CountingReconnectionPolicy {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn schedules_created(&self) -> usize {
        self.schedules.load(Ordering::SeqCst)
    }

    pub fn delays_taken(&self) -> usize {
        self.delays.load(Ordering::SeqCst)
    }
}

impl ReconnectionPolicy for CountingReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        self.schedules.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingSchedule {
            delay: *self.delay.lock(),
            delays: self.delays.clone(),
        })
    }
}

struct CountingSchedule {
    delay: Duration,
    delays: Arc<AtomicUsize>,
}

impl ReconnectionSchedule for CountingSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delays.fetch_add(1, Ordering::SeqCst);
        self.delay
    }
}

/// A control connection wired to fakes, primed with one healthy-looking
/// keyspace and a local row per plan host.
pub(crate) struct TestCluster {
    pub control: ControlConnection,
    pub connector: Arc<FakeConnector>,
    pub runner: Arc<FakeRequestRunner>,
    pub registry: Arc<RecordingRegistry>,
    pub schema: Arc<RecordingSchema>,
    pub plan: Arc<ScriptedPlanPolicy>,
    pub reconnection: Arc<CountingReconnectionPolicy>,
    pub options: Arc<ConnectionOptions>,
    pub reactor: Arc<TokioReactor>,
}

impl TestCluster {
    pub fn new(plan_hosts: Vec<IpAddr>) -> Self {
        Self::with_protocol_version(plan_hosts, crate::control::DEFAULT_PROTOCOL_VERSION)
    }

    pub fn with_protocol_version(plan_hosts: Vec<IpAddr>, protocol_version: u8) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let connector = Arc::new(FakeConnector::default());
        let runner = Arc::new(FakeRequestRunner::default());
        let registry = Arc::new(RecordingRegistry::default());
        let schema = Arc::new(RecordingSchema::default());
        let plan = Arc::new(ScriptedPlanPolicy::new(plan_hosts.clone()));
        let reconnection = Arc::new(CountingReconnectionPolicy::default());
        let options = Arc::new(ConnectionOptions::with_protocol_version(protocol_version));
        let reactor = Arc::new(TokioReactor::default());

        for host in &plan_hosts {
            let IpAddr::V4(v4) = host else { continue };
            runner.set_local_row(*host, local_row(v4.octets()[3]));
        }
        runner.set_schema_rows(
            vec![row(&[("keyspace_name", "app")])],
            vec![row(&[("keyspace_name", "app"), ("columnfamily_name", "users")])],
            vec![row(&[
                ("keyspace_name", "app"),
                ("columnfamily_name", "users"),
                ("column_name", "id"),
            ])],
        );

        let control = ControlConnection::new(
            reactor.clone(),
            connector.clone(),
            runner.clone(),
            plan.clone(),
            reconnection.clone(),
            registry.clone(),
            schema.clone(),
            options.clone(),
        );
        Self {
            control,
            connector,
            runner,
            registry,
            schema,
            plan,
            reconnection,
            options,
            reactor,
        }
    }
}
