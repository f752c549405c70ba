//! Metadata refresh: cluster topology, schema at three granularities, and
//! single-host lookups. Every refresh runs against the current connection and
//! resolves to [`Error::NotConnected`] if it went away in the meantime.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::Arc,
};

use cquill_wire_types::{
    peer_ip,
    queries,
    Request,
};
use serde_json::json;

use super::ControlConnection;
use crate::{
    cluster::Host,
    errors::{
        Error,
        Result,
    },
    transport::Connection,
};

impl ControlConnection {
    fn current_connection(&self) -> Result<Arc<Connection>> {
        self.inner
            .state
            .lock()
            .connection
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// The host metadata updates are attributed to: the connection's peer as
    /// the registry currently knows it. An absent host means a topology
    /// refresh is about to re-add it and re-trigger the schema refresh, so
    /// skipping the update is safe.
    fn applying_host(&self, connection: &Connection) -> Option<Host> {
        self.inner.registry.host(connection.host())
    }

    /// Re-read cluster membership from the connected node's view.
    pub(crate) async fn refresh_hosts(&self) -> Result<()> {
        let connection = self.current_connection()?;
        let (local, peers) = futures::try_join!(
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_LOCAL)),
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_PEERS)),
        )?;
        if local.is_empty() && peers.is_empty() {
            return Err(Error::NoHosts);
        }

        let mut seen = HashSet::new();
        let local_ip = connection.host();
        seen.insert(local_ip);
        if let Some(row) = local.first() {
            self.inner.registry.host_found(local_ip, row);
        }
        for row in &peers {
            let Some(ip) = peer_ip(row) else {
                tracing::warn!(?row, "skipping peers row without a usable address");
                continue;
            };
            seen.insert(ip);
            self.inner.registry.host_found(ip, row);
        }

        for host in self.inner.registry.hosts() {
            if !seen.contains(&host.ip) {
                self.inner.registry.host_lost(host.ip);
            } else if host.is_down() {
                let claimed = {
                    let mut state = self.inner.state.lock();
                    state.refreshing_statuses.insert(host.ip)
                };
                if claimed {
                    self.spawn_status_probe(host.ip, true);
                }
            }
        }
        Ok(())
    }

    /// Full schema refresh: all keyspaces, tables, and columns.
    pub(crate) async fn refresh_schema(&self) -> Result<()> {
        let connection = self.current_connection()?;
        let (keyspaces, tables, columns) = futures::try_join!(
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_KEYSPACES)),
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_TABLES)),
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_COLUMNS)),
        )?;
        let Some(host) = self.applying_host(&connection) else {
            return Ok(());
        };
        self.inner
            .schema
            .update_keyspaces(&host, &keyspaces, &tables, &columns);
        Ok(())
    }

    pub(crate) async fn refresh_keyspace(&self, keyspace: &str) -> Result<()> {
        let connection = self.current_connection()?;
        let params = vec![json!(keyspace)];
        let (keyspaces, tables, columns) = futures::try_join!(
            self.inner.runner.execute(
                &connection,
                Request::query_with_params(queries::SELECT_KEYSPACE, params.clone()),
            ),
            self.inner.runner.execute(
                &connection,
                Request::query_with_params(queries::SELECT_KEYSPACE_TABLES, params.clone()),
            ),
            self.inner.runner.execute(
                &connection,
                Request::query_with_params(queries::SELECT_KEYSPACE_COLUMNS, params.clone()),
            ),
        )?;
        // The keyspace can vanish between the event and the read.
        let Some(keyspace_row) = keyspaces.first() else {
            return Ok(());
        };
        let Some(host) = self.applying_host(&connection) else {
            return Ok(());
        };
        self.inner
            .schema
            .update_keyspace(&host, keyspace_row, &tables, &columns);
        Ok(())
    }

    pub(crate) async fn refresh_table(&self, keyspace: &str, table: &str) -> Result<()> {
        let connection = self.current_connection()?;
        let params = vec![json!(keyspace), json!(table)];
        let (tables, columns) = futures::try_join!(
            self.inner.runner.execute(
                &connection,
                Request::query_with_params(queries::SELECT_TABLE, params.clone()),
            ),
            self.inner.runner.execute(
                &connection,
                Request::query_with_params(queries::SELECT_TABLE_COLUMNS, params.clone()),
            ),
        )?;
        let Some(table_row) = tables.first() else {
            return Ok(());
        };
        let Some(host) = self.applying_host(&connection) else {
            return Ok(());
        };
        self.inner
            .schema
            .update_table(&host, keyspace, table_row, &columns);
        Ok(())
    }

    /// Re-read one member: the local table for the connected node itself,
    /// the peers table for everyone else.
    pub(crate) async fn refresh_host(&self, address: IpAddr) -> Result<()> {
        let connection = self.current_connection()?;
        let rows = if address == connection.host() {
            self.inner
                .runner
                .execute(&connection, Request::query(queries::SELECT_LOCAL))
                .await?
        } else {
            self.inner
                .runner
                .execute(
                    &connection,
                    Request::query_with_params(
                        queries::SELECT_PEER,
                        vec![json!(address.to_string())],
                    ),
                )
                .await?
        };
        if let Some(row) = rows.first() {
            self.inner.registry.host_found(address, row);
        }
        Ok(())
    }
}
