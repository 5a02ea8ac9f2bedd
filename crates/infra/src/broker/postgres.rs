//! Postgres endpoints for the connection broker.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;

use super::{Connector, Endpoint};
use crate::store::{map_sqlx_error, StoreError};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres pools for the primary and (optionally) the fallback endpoint.
///
/// Pools connect lazily, so construction never touches the network.
#[derive(Debug, Clone)]
pub struct PgConnector {
    primary_url: String,
    primary: PgPool,
    fallback: Option<PgPool>,
}

impl PgConnector {
    pub fn new(primary_url: &str, fallback_url: Option<&str>) -> Result<Self, StoreError> {
        let primary = lazy_pool(primary_url)?;
        let fallback = fallback_url.map(lazy_pool).transpose()?;
        Ok(Self {
            primary_url: primary_url.to_string(),
            primary,
            fallback,
        })
    }
}

fn lazy_pool(url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy(url)
        .map_err(|e| map_sqlx_error("connect", e))
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgPool;

    fn handle(&self, endpoint: Endpoint) -> Option<PgPool> {
        match endpoint {
            Endpoint::Primary => Some(self.primary.clone()),
            Endpoint::Fallback => self.fallback.clone(),
        }
    }

    /// Trial connection outside the pool, so stale pooled connections
    /// cannot mask the endpoint's real state.
    async fn probe_primary(&self) -> Result<(), StoreError> {
        let mut conn = tokio::time::timeout(ACQUIRE_TIMEOUT, PgConnection::connect(&self.primary_url))
            .await
            .map_err(|_| StoreError::Connectivity("probe timed out".to_string()))?
            .map_err(|e| map_sqlx_error("probe", e))?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| map_sqlx_error("probe", e))?;
        conn.close().await.map_err(|e| map_sqlx_error("probe", e))
    }
}
