//! Server-pushed event model.
//!
//! The wire protocol carries event kinds as strings; they are lifted into
//! tagged variants here, once, at the transport boundary, so the dispatch
//! logic can match exhaustively.

use std::net::IpAddr;

use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

/// The three event streams a connection can register for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TopologyChangeType {
    NewNode,
    RemovedNode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusChangeType {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

/// A validated server-pushed event.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    TopologyChange {
        change: TopologyChangeType,
        address: IpAddr,
    },
    StatusChange {
        change: StatusChangeType,
        address: IpAddr,
    },
    SchemaChange {
        change: SchemaChangeType,
        keyspace: String,
        /// `None` covers both an absent column and the empty string the
        /// server sends for keyspace-level changes.
        table: Option<String>,
    },
}

/// Raw shape of an EVENT frame before boundary validation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub change: String,
    #[serde(default)]
    pub keyspace: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EventParseError {
    #[error("unknown event type {0:?}")]
    UnknownType(String),
    #[error("unknown change {change:?} for event type {event_type:?}")]
    UnknownChange { event_type: String, change: String },
    #[error("event is missing the {0:?} field")]
    MissingField(&'static str),
    #[error("malformed event address {0:?}")]
    BadAddress(String),
}

impl TryFrom<EventPayload> for ServerEvent {
    type Error = EventParseError;

    fn try_from(payload: EventPayload) -> Result<Self, EventParseError> {
        let unknown_change = |change: &str| EventParseError::UnknownChange {
            event_type: payload.event_type.clone(),
            change: change.to_string(),
        };
        match payload.event_type.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change = match payload.change.as_str() {
                    "NEW_NODE" => TopologyChangeType::NewNode,
                    "REMOVED_NODE" => TopologyChangeType::RemovedNode,
                    other => return Err(unknown_change(other)),
                };
                Ok(ServerEvent::TopologyChange {
                    change,
                    address: parse_address(&payload)?,
                })
            },
            "STATUS_CHANGE" => {
                let change = match payload.change.as_str() {
                    "UP" => StatusChangeType::Up,
                    "DOWN" => StatusChangeType::Down,
                    other => return Err(unknown_change(other)),
                };
                Ok(ServerEvent::StatusChange {
                    change,
                    address: parse_address(&payload)?,
                })
            },
            "SCHEMA_CHANGE" => {
                let change = match payload.change.as_str() {
                    "CREATED" => SchemaChangeType::Created,
                    "UPDATED" => SchemaChangeType::Updated,
                    "DROPPED" => SchemaChangeType::Dropped,
                    other => return Err(unknown_change(other)),
                };
                let keyspace = payload
                    .keyspace
                    .clone()
                    .filter(|name| !name.is_empty())
                    .ok_or(EventParseError::MissingField("keyspace"))?;
                Ok(ServerEvent::SchemaChange {
                    change,
                    keyspace,
                    table: payload.table.clone().filter(|name| !name.is_empty()),
                })
            },
            other => Err(EventParseError::UnknownType(other.to_string())),
        }
    }
}

fn parse_address(payload: &EventPayload) -> Result<IpAddr, EventParseError> {
    let address = payload
        .address
        .as_deref()
        .ok_or(EventParseError::MissingField("address"))?;
    address
        .parse()
        .map_err(|_| EventParseError::BadAddress(address.to_string()))
}
