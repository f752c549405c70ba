//! Cluster catalogue collaborators: the member registry and the schema
//! metadata store, plus in-memory implementations for stand-alone use.
//!
//! Both collaborators are externally synchronized from the control
//! connection's point of view; the in-memory implementations synchronize with
//! a plain mutex.

use std::{
    collections::BTreeMap,
    net::IpAddr,
};

use cquill_wire_types::Row;
use parking_lot::Mutex;

/// A known cluster member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Host {
    pub ip: IpAddr,
    pub rack: Option<String>,
    pub data_center: Option<String>,
    pub host_id: Option<String>,
    pub release_version: Option<String>,
    up: bool,
}

impl Host {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            rack: None,
            data_center: None,
            host_id: None,
            release_version: None,
            up: true,
        }
    }

    /// Build a host from a `system.local` or `system.peers` row. A freshly
    /// discovered host is considered up.
    pub fn from_row(ip: IpAddr, row: &Row) -> Self {
        let text = |column: &str| row.text(column).map(str::to_string);
        Self {
            ip,
            rack: text("rack"),
            data_center: text("data_center"),
            host_id: text("host_id"),
            release_version: text("release_version"),
            up: true,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn is_down(&self) -> bool {
        !self.up
    }
}

/// Catalogue of known cluster members and their up/down state.
pub trait ClusterRegistry: Send + Sync {
    /// Upsert a host discovered through the system tables. Refreshes
    /// attributes only; liveness marks go through `host_down` and the
    /// hosting driver's up notifications.
    fn host_found(&self, ip: IpAddr, row: &Row);
    fn host_lost(&self, ip: IpAddr);
    fn host_down(&self, ip: IpAddr);
    fn host(&self, ip: IpAddr) -> Option<Host>;
    fn has_host(&self, ip: IpAddr) -> bool;
    fn hosts(&self) -> Vec<Host>;
}

/// Catalogue of keyspace, table, and column metadata. `host` is the member
/// whose view of the schema produced the rows.
pub trait ClusterSchema: Send + Sync {
    fn update_keyspaces(&self, host: &Host, keyspaces: &[Row], tables: &[Row], columns: &[Row]);
    fn update_keyspace(&self, host: &Host, keyspace: &Row, tables: &[Row], columns: &[Row]);
    fn update_table(&self, host: &Host, keyspace: &str, table: &Row, columns: &[Row]);
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    hosts: Mutex<BTreeMap<IpAddr, Host>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterRegistry for InMemoryRegistry {
    fn host_found(&self, ip: IpAddr, row: &Row) {
        let mut hosts = self.hosts.lock();
        let mut host = Host::from_row(ip, row);
        // Rediscovery refreshes attributes but is no evidence of liveness;
        // up/down marks are managed separately.
        if let Some(existing) = hosts.get(&ip) {
            host.up = existing.up;
        }
        hosts.insert(ip, host);
    }

    fn host_lost(&self, ip: IpAddr) {
        self.hosts.lock().remove(&ip);
    }

    fn host_down(&self, ip: IpAddr) {
        if let Some(host) = self.hosts.lock().get_mut(&ip) {
            host.up = false;
        }
    }

    fn host(&self, ip: IpAddr) -> Option<Host> {
        self.hosts.lock().get(&ip).cloned()
    }

    fn has_host(&self, ip: IpAddr) -> bool {
        self.hosts.lock().contains_key(&ip)
    }

    fn hosts(&self) -> Vec<Host> {
        self.hosts.lock().values().cloned().collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableMetadata {
    pub row: Row,
    pub columns: Vec<Row>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyspaceMetadata {
    pub row: Row,
    pub tables: BTreeMap<String, TableMetadata>,
}

#[derive(Debug, Default)]
pub struct InMemorySchema {
    keyspaces: Mutex<BTreeMap<String, KeyspaceMetadata>>,
}

impl InMemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyspace(&self, name: &str) -> Option<KeyspaceMetadata> {
        self.keyspaces.lock().get(name).cloned()
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        self.keyspaces.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, KeyspaceMetadata> {
        self.keyspaces.lock().clone()
    }
}

fn build_keyspace(keyspace: &Row, tables: &[Row], columns: &[Row]) -> Option<(String, KeyspaceMetadata)> {
    let name = keyspace.text("keyspace_name")?.to_string();
    let mut metadata = KeyspaceMetadata {
        row: keyspace.clone(),
        tables: BTreeMap::new(),
    };
    for table in tables {
        if table.text("keyspace_name") != Some(name.as_str()) {
            continue;
        }
        let Some(table_name) = table.text("columnfamily_name") else {
            continue;
        };
        metadata.tables.insert(
            table_name.to_string(),
            TableMetadata {
                row: table.clone(),
                columns: Vec::new(),
            },
        );
    }
    for column in columns {
        if column.text("keyspace_name") != Some(name.as_str()) {
            continue;
        }
        let Some(table_name) = column.text("columnfamily_name") else {
            continue;
        };
        if let Some(table) = metadata.tables.get_mut(table_name) {
            table.columns.push(column.clone());
        }
    }
    Some((name, metadata))
}

impl ClusterSchema for InMemorySchema {
    fn update_keyspaces(&self, _host: &Host, keyspaces: &[Row], tables: &[Row], columns: &[Row]) {
        let catalogue = keyspaces
            .iter()
            .filter_map(|keyspace| build_keyspace(keyspace, tables, columns))
            .collect();
        *self.keyspaces.lock() = catalogue;
    }

    fn update_keyspace(&self, _host: &Host, keyspace: &Row, tables: &[Row], columns: &[Row]) {
        if let Some((name, metadata)) = build_keyspace(keyspace, tables, columns) {
            self.keyspaces.lock().insert(name, metadata);
        }
    }

    fn update_table(&self, _host: &Host, keyspace: &str, table: &Row, columns: &[Row]) {
        let Some(table_name) = table.text("columnfamily_name").map(str::to_string) else {
            return;
        };
        let mut keyspaces = self.keyspaces.lock();
        let Some(metadata) = keyspaces.get_mut(keyspace) else {
            return;
        };
        metadata.tables.insert(
            table_name.clone(),
            TableMetadata {
                row: table.clone(),
                columns: columns
                    .iter()
                    .filter(|column| column.text("columnfamily_name") == Some(table_name.as_str()))
                    .cloned()
                    .collect(),
            },
        );
    }
}
