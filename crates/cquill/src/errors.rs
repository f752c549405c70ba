use std::{
    collections::BTreeMap,
    net::IpAddr,
};

use cquill_wire_types::{
    events::EventParseError,
    BAD_CREDENTIALS_CODE,
    PROTOCOL_ERROR_CODE,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong on the control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection plan was exhausted; carries the last error per
    /// attempted host.
    #[error("no hosts available for the control connection ({} attempted)", .errors.len())]
    NoHostsAvailable { errors: BTreeMap<IpAddr, Error> },

    /// Authentication was rejected, either during the handshake or rewrapped
    /// from a bad-credentials query error. Fatal to the whole plan.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A server error frame on the query path.
    #[error("query error 0x{code:04x}: {message}")]
    Query { code: u16, message: String },

    /// Both system tables came back empty; the cluster reported no members.
    #[error("the cluster reported no hosts")]
    NoHosts,

    /// The connection went away between scheduling a refresh and running it.
    #[error("control connection is not connected")]
    NotConnected,

    /// The control connection was closed by the user.
    #[error("control connection is closed")]
    Closed,

    /// A transport-level failure from the connector.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid server event: {0}")]
    Event(#[from] EventParseError),
}

impl Error {
    /// The negotiation error that triggers a protocol-version downgrade.
    pub fn is_protocol_negotiation(&self) -> bool {
        matches!(self, Error::Query { code, .. } if *code == PROTOCOL_ERROR_CODE)
    }

    /// Authentication failures short-circuit plan iteration, whether native
    /// or reported as a bad-credentials query error.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            Error::Authentication(_) => true,
            Error::Query { code, .. } => *code == BAD_CREDENTIALS_CODE,
            _ => false,
        }
    }

    /// Rewrap a bad-credentials query error as an authentication failure.
    pub(crate) fn into_authentication(self) -> Error {
        match self {
            Error::Query { code, message } if code == BAD_CREDENTIALS_CODE => {
                Error::Authentication(message)
            },
            other => other,
        }
    }
}
