use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, error, info, warn};

use crate::error::postgres_reason;
use crate::{Error, Result};

/// A client shared between collaborators that must see the same session,
/// e.g. the target writer and a checkpoint table written in its transaction.
pub type SharedClient = Arc<Mutex<ManagedClient>>;

/// A PostgreSQL client that reconnects lazily after the connection drops.
///
/// Reconnection never happens while a transaction opened through
/// [`ManagedClient::begin`] is in progress: statements issued after the loss
/// would otherwise run outside that transaction. The caller gets an error and
/// must roll back.
pub struct ManagedClient {
    name: &'static str,
    config: Config,
    client: Option<Client>,
    connection_task: Option<tokio::task::JoinHandle<()>>,
    in_transaction: bool,
}

impl ManagedClient {
    /// Connects immediately; failure here is reported as a connection error.
    pub async fn connect(name: &'static str, config: Config) -> Result<Self> {
        let mut managed = Self {
            name,
            config,
            client: None,
            connection_task: None,
            in_transaction: false,
        };
        managed.reconnect().await?;
        Ok(managed)
    }

    pub fn into_shared(self) -> SharedClient {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Returns a live client, reconnecting first if the previous connection
    /// was closed outside of a transaction.
    pub async fn client(&mut self) -> Result<&Client> {
        let closed = self.client.as_ref().map_or(true, |c| c.is_closed());
        if closed {
            if self.in_transaction {
                return Err(Error::Connection(format!(
                    "{} connection lost inside a transaction",
                    self.name
                )));
            }
            warn!("{} connection closed, reconnecting", self.name);
            self.reconnect().await?;
        }
        self.client
            .as_ref()
            .ok_or_else(|| Error::Connection(format!("{} connection unavailable", self.name)))
    }

    pub async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::Connection(format!(
                "{} connection already has an open transaction",
                self.name
            )));
        }
        self.client().await?.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        let result = match self.client.as_ref() {
            Some(client) if !client.is_closed() => client.batch_execute("COMMIT").await.map_err(Error::from),
            _ => Err(Error::Connection(format!(
                "{} connection lost before commit",
                self.name
            ))),
        };
        self.in_transaction = false;
        result
    }

    /// Rolls back the open transaction. A dropped connection already rolled
    /// it back server-side, so that case is not an error.
    pub async fn rollback(&mut self) -> Result<()> {
        let result = match self.client.as_ref() {
            Some(client) if !client.is_closed() => client.batch_execute("ROLLBACK").await.map_err(Error::from),
            _ => {
                debug!("{} connection closed, nothing to roll back", self.name);
                Ok(())
            }
        };
        self.in_transaction = false;
        result
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        self.client = None;

        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            Error::Connection(format!(
                "cannot connect to {} database: {}",
                self.name,
                postgres_reason(&e)
            ))
        })?;

        let name = self.name;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("{} connection error: {}", name, e);
            }
        });

        info!("Connected to {} database", self.name);
        self.client = Some(client);
        self.connection_task = Some(connection_task);
        Ok(())
    }
}

impl Drop for ManagedClient {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
    }
}
