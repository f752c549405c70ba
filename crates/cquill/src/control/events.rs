//! Event registration and dispatch.
//!
//! One dispatcher task per connection consumes the server event stream in
//! order. Refreshes triggered by an event are awaited before the next event
//! is taken, which keeps metadata updates for a keyspace in delivery order.
//! A failed refresh is logged and never tears down the dispatcher.

use std::sync::Arc;

use cquill_wire_types::{
    events::{
        SchemaChangeType,
        ServerEvent,
        StatusChangeType,
        TopologyChangeType,
    },
    EventType,
    Request,
};

use super::ControlConnection;
use crate::{
    errors::Result,
    transport::Connection,
};

impl ControlConnection {
    /// Register for the three event streams and start this connection's
    /// dispatcher.
    pub(crate) async fn register_events(&self, connection: &Arc<Connection>) -> Result<()> {
        self.inner
            .runner
            .execute(
                connection,
                Request::register(vec![
                    EventType::TopologyChange,
                    EventType::StatusChange,
                    EventType::SchemaChange,
                ]),
            )
            .await?;

        // The stream can only be taken once per connection, so a repeated
        // registration never yields a second dispatcher.
        let Some(mut events) = connection.take_events() else {
            return Ok(());
        };
        let weak = Arc::downgrade(&self.inner);
        let connection = connection.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ControlConnection::from_inner(inner).handle_event(event).await;
                    },
                    () = connection.closed() => break,
                }
            }
        });
        Ok(())
    }

    async fn handle_event(&self, event: ServerEvent) {
        tracing::debug!(?event, "server event");
        let result = match event {
            ServerEvent::SchemaChange {
                change,
                keyspace,
                table,
            } => match (change, table) {
                (SchemaChangeType::Created | SchemaChangeType::Dropped, None) => {
                    self.refresh_schema().await
                },
                (SchemaChangeType::Created | SchemaChangeType::Dropped, Some(_)) => {
                    self.refresh_keyspace(&keyspace).await
                },
                (SchemaChangeType::Updated, None) => self.refresh_keyspace(&keyspace).await,
                (SchemaChangeType::Updated, Some(table)) => {
                    self.refresh_table(&keyspace, &table).await
                },
            },
            ServerEvent::StatusChange { change, address } => match change {
                StatusChangeType::Up => {
                    if self.inner.registry.has_host(address) {
                        self.refresh_host(address).await
                    } else {
                        Ok(())
                    }
                },
                StatusChangeType::Down => {
                    self.inner.registry.host_down(address);
                    Ok(())
                },
            },
            ServerEvent::TopologyChange { change, address } => match change {
                TopologyChangeType::NewNode => {
                    if self.inner.registry.has_host(address) {
                        Ok(())
                    } else {
                        self.refresh_host(address).await
                    }
                },
                TopologyChangeType::RemovedNode => {
                    self.inner.registry.host_lost(address);
                    Ok(())
                },
            },
        };
        if let Err(error) = result {
            tracing::warn!(%error, "failed to apply a server event");
        }
    }
}
