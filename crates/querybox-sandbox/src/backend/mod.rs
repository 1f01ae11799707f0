//! Live database clients.
//!
//! The worker opens exactly one connection per job through a [`Connector`].
//! [`NativeConnector`] speaks to real servers; tests inject their own.

mod mongo;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

pub use mongo::MongoClient;
pub use postgres::PgClient;

use crate::adapter::{DocumentClient, RelationalClient};
use crate::error::DbError;
use crate::ipc::ConnectionParams;

/// An open connection of either kind.
#[derive(Clone)]
pub enum Connection {
    /// Relational client.
    Relational(Arc<dyn RelationalClient>),
    /// Document client.
    Document(Arc<dyn DocumentClient>),
}

impl Connection {
    /// Close the connection. Best-effort.
    pub async fn close(&self) {
        match self {
            Self::Relational(c) => c.close().await,
            Self::Document(c) => c.close().await,
        }
    }
}

/// Opens connections from resolved parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `database` using `params`.
    async fn connect(
        &self,
        params: &ConnectionParams,
        database: &str,
    ) -> Result<Connection, DbError>;
}

/// Connects with tokio-postgres and the MongoDB driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConnector;

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
        database: &str,
    ) -> Result<Connection, DbError> {
        match params {
            ConnectionParams::Relational {
                host,
                port,
                user,
                password,
            } => {
                let client = PgClient::connect(host, *port, user, password, database).await?;
                Ok(Connection::Relational(Arc::new(client)))
            }
            ConnectionParams::Document { uri } => {
                let client = MongoClient::connect(uri, database).await?;
                Ok(Connection::Document(Arc::new(client)))
            }
        }
    }
}
