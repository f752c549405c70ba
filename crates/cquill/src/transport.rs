//! Transport collaborator seams.
//!
//! The control connection never touches a socket. It asks a [`Connector`] for
//! a [`Connection`], runs statements through a [`RequestRunner`], and waits on
//! timers from a [`Reactor`]. Implementations own the wire protocol.

use std::{
    fmt,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use cquill_wire_types::{
    Request,
    Row,
    ServerEvent,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    watch,
};

use crate::errors::Result;

/// Timer and lifecycle surface of the I/O event loop.
#[async_trait]
pub trait Reactor: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    /// Resolve after `delay` has elapsed.
    async fn schedule_timer(&self, delay: Duration);
}

/// Opens and closes transport sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: IpAddr) -> Result<Arc<Connection>>;
    /// Best-effort close; failures are the connector's to log.
    async fn close(&self, host: IpAddr, connection: Arc<Connection>);
}

/// Executes requests on an established connection.
#[async_trait]
pub trait RequestRunner: Send + Sync {
    async fn execute(&self, connection: &Connection, request: Request) -> Result<Vec<Row>>;
}

/// One transport session handed out by a [`Connector`].
///
/// The handle carries the remote address, the server event stream, and a
/// close signal that fires exactly once, for orderly close and transport
/// failure alike. The transport side keeps the paired [`ConnectionHandle`].
pub struct Connection {
    host: IpAddr,
    events: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Create the driver-side handle and its transport-side pair.
    pub fn open(host: IpAddr) -> (Arc<Connection>, ConnectionHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let connection = Arc::new(Connection {
            host,
            events: Mutex::new(Some(event_rx)),
            closed: closed_rx,
        });
        let handle = ConnectionHandle {
            host,
            events: event_tx,
            closed: Arc::new(closed_tx),
        };
        (connection, handle)
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow() && self.closed.has_changed().is_ok()
    }

    /// Take the server event stream. Yields `Some` exactly once; the single
    /// consumer preserves server ordering.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.lock().take()
    }

    /// Resolve once the transport closes.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        loop {
            if *closed.borrow() {
                return;
            }
            if closed.changed().await.is_err() {
                // Transport side dropped without signalling; same thing.
                return;
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Transport-side pair of a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    host: IpAddr,
    events: mpsc::UnboundedSender<ServerEvent>,
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Push a server event to the driver; `false` once the driver side is
    /// gone.
    pub fn push_event(&self, event: ServerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Signal close. Idempotent.
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// [`Reactor`] backed by the tokio time driver.
#[derive(Debug, Default)]
pub struct TokioReactor {
    running: std::sync::atomic::AtomicBool,
}

impl TokioReactor {
    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Reactor for TokioReactor {
    async fn start(&self) {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn schedule_timer(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
