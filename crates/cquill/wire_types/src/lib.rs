//! Wire-level types shared between the cquill control connection and its
//! transport collaborators: requests, result rows, server event payloads, and
//! the error codes the driver reacts to.
//!
//! CQL value decoding is a data-plane concern and out of scope here; rows
//! stay JSON maps and callers read the few text columns the control plane
//! needs.

use std::net::IpAddr;

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

pub mod backoff;
pub mod events;

pub use events::{
    EventType,
    ServerEvent,
};

/// Server error code signalling a protocol-version negotiation failure. The
/// driver reacts by retrying the same node at the next lower version.
pub const PROTOCOL_ERROR_CODE: u16 = 0x000A;

/// Server error code for bad credentials surfaced on the query path.
pub const BAD_CREDENTIALS_CODE: u16 = 0x0100;

/// Consistency level attached to a query. Control-plane reads always use
/// [`Consistency::One`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum Consistency {
    Any,
    #[default]
    One,
    Quorum,
    All,
}

/// A request the driver hands to its request runner.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Query {
        cql: String,
        params: Vec<Value>,
        consistency: Consistency,
    },
    Register {
        event_types: Vec<EventType>,
    },
}

impl Request {
    pub fn query(cql: impl Into<String>) -> Self {
        Self::query_with_params(cql, Vec::new())
    }

    pub fn query_with_params(cql: impl Into<String>, params: Vec<Value>) -> Self {
        Request::Query {
            cql: cql.into(),
            params,
            consistency: Consistency::One,
        }
    }

    pub fn register(event_types: Vec<EventType>) -> Self {
        Request::Register { event_types }
    }

    /// The query text, for queries.
    pub fn cql(&self) -> Option<&str> {
        match self {
            Request::Query { cql, .. } => Some(cql),
            Request::Register { .. } => None,
        }
    }
}

/// A single result row as returned by the request runner.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Row(pub serde_json::Map<String, Value>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// The value of a text column, if present and textual.
    pub fn text(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

pub type Rows = Vec<Row>;

/// The exact query text issued against the cluster's system tables. Downstream
/// tooling matches on these strings; do not reformat them.
pub mod queries {
    pub const SELECT_LOCAL: &str =
        "SELECT rack, data_center, host_id, release_version FROM system.local";
    pub const SELECT_PEERS: &str =
        "SELECT peer, rack, data_center, host_id, rpc_address, release_version FROM system.peers";
    pub const SELECT_PEER: &str = "SELECT peer, rack, data_center, host_id, rpc_address, \
                                   release_version FROM system.peers WHERE peer = ?";

    pub const SELECT_KEYSPACES: &str = "SELECT * FROM system.schema_keyspaces";
    pub const SELECT_TABLES: &str = "SELECT * FROM system.schema_columnfamilies";
    pub const SELECT_COLUMNS: &str = "SELECT * FROM system.schema_columns";

    pub const SELECT_KEYSPACE: &str =
        "SELECT * FROM system.schema_keyspaces WHERE keyspace_name = ?";
    pub const SELECT_KEYSPACE_TABLES: &str =
        "SELECT * FROM system.schema_columnfamilies WHERE keyspace_name = ?";
    pub const SELECT_KEYSPACE_COLUMNS: &str =
        "SELECT * FROM system.schema_columns WHERE keyspace_name = ?";

    pub const SELECT_TABLE: &str = "SELECT * FROM system.schema_columnfamilies WHERE \
                                    keyspace_name = ? AND columnfamily_name = ?";
    pub const SELECT_TABLE_COLUMNS: &str = "SELECT * FROM system.schema_columns WHERE \
                                            keyspace_name = ? AND columnfamily_name = ?";
}

/// Derive a peer's address from its `system.peers` row.
///
/// `rpc_address` wins unless the node bound it to the unspecified address, in
/// which case the internal `peer` address is the only usable one.
pub fn peer_ip(row: &Row) -> Option<IpAddr> {
    match row.text("rpc_address").and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(address) if !address.is_unspecified() => Some(address),
        _ => row.text("peer").and_then(|s| s.parse().ok()),
    }
}
