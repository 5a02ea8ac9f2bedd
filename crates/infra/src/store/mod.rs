//! Project persistence behind one backend-agnostic contract.
//!
//! Two interchangeable adapters implement [`ProjectStore`]:
//!
//! - [`SqliteProjectStore`]: embedded, file-backed, always available
//! - [`PostgresProjectStore`]: networked, every call routed through the
//!   [`ConnectionBroker`](crate::broker::ConnectionBroker)
//!
//! [`InMemoryProjectStore`] implements the same contract for tests and dev.
//! The backend is chosen once, at construction, via [`open`].

pub mod in_memory;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use depot_core::{
    ArchivedProject, BackendOrigin, DomainError, FacilityId, MaterialNeed, Project, ProjectResourceRow,
    ResourceRequirement,
};

use crate::broker::{BrokerConfig, ConnectionBroker, PgConnector};
use crate::config::BackendConfig;

pub use in_memory::InMemoryProjectStore;
pub use postgres::PostgresProjectStore;
pub use sqlite::SqliteProjectStore;

/// Project store operation error.
///
/// `Connectivity` is the only kind the connection broker fails over on;
/// everything else propagates unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connectivity(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("project {0} not found")]
    NotFound(FacilityId),

    #[error("transaction rolled back: {0}")]
    Transaction(String),

    #[error("store configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Invalid(#[from] DomainError),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

/// Backend-agnostic project data access.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Which backend this store reads from and writes to.
    fn origin(&self) -> BackendOrigin;

    /// All live projects, ordered by facility id.
    async fn load(&self) -> Result<Vec<Project>, StoreError>;

    async fn get(&self, facility_id: FacilityId) -> Result<Option<Project>, StoreError>;

    /// Whether `facility_id` is a known live project.
    async fn contains(&self, facility_id: FacilityId) -> Result<bool, StoreError> {
        Ok(self.get(facility_id).await?.is_some())
    }

    /// Insert or update by facility id.
    async fn save(&self, project: &Project) -> Result<(), StoreError>;

    /// Resource rows of a project, ordered by resource name.
    async fn resources(&self, facility_id: FacilityId) -> Result<Vec<ProjectResourceRow>, StoreError>;

    async fn find_resource(
        &self,
        facility_id: FacilityId,
        resource_name: &str,
    ) -> Result<Option<ProjectResourceRow>, StoreError>;

    /// Insert or update by `(facility_id, resource_name)`.
    ///
    /// No monotonicity is enforced here; that is the reconciler's job.
    async fn upsert_resource(
        &self,
        facility_id: FacilityId,
        requirement: &ResourceRequirement,
    ) -> Result<(), StoreError>;

    /// Move a project to history and remove it (and its resource rows) from
    /// the live tables in one transaction.
    async fn archive_and_remove(&self, facility_id: FacilityId) -> Result<ArchivedProject, StoreError>;

    /// Remove a project and all its resource rows in one transaction.
    async fn delete(&self, facility_id: FacilityId) -> Result<(), StoreError>;

    /// History, most recently archived first.
    async fn load_archived(&self) -> Result<Vec<ArchivedProject>, StoreError>;

    /// What is still missing for a project.
    async fn materials_needed(&self, facility_id: FacilityId) -> Result<Vec<MaterialNeed>, StoreError> {
        let rows = self.resources(facility_id).await?;
        Ok(rows.iter().map(MaterialNeed::from).collect())
    }
}

#[async_trait]
impl<S> ProjectStore for Arc<S>
where
    S: ProjectStore + ?Sized,
{
    fn origin(&self) -> BackendOrigin {
        (**self).origin()
    }

    async fn load(&self) -> Result<Vec<Project>, StoreError> {
        (**self).load().await
    }

    async fn get(&self, facility_id: FacilityId) -> Result<Option<Project>, StoreError> {
        (**self).get(facility_id).await
    }

    async fn contains(&self, facility_id: FacilityId) -> Result<bool, StoreError> {
        (**self).contains(facility_id).await
    }

    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        (**self).save(project).await
    }

    async fn resources(&self, facility_id: FacilityId) -> Result<Vec<ProjectResourceRow>, StoreError> {
        (**self).resources(facility_id).await
    }

    async fn find_resource(
        &self,
        facility_id: FacilityId,
        resource_name: &str,
    ) -> Result<Option<ProjectResourceRow>, StoreError> {
        (**self).find_resource(facility_id, resource_name).await
    }

    async fn upsert_resource(
        &self,
        facility_id: FacilityId,
        requirement: &ResourceRequirement,
    ) -> Result<(), StoreError> {
        (**self).upsert_resource(facility_id, requirement).await
    }

    async fn archive_and_remove(&self, facility_id: FacilityId) -> Result<ArchivedProject, StoreError> {
        (**self).archive_and_remove(facility_id).await
    }

    async fn delete(&self, facility_id: FacilityId) -> Result<(), StoreError> {
        (**self).delete(facility_id).await
    }

    async fn load_archived(&self) -> Result<Vec<ArchivedProject>, StoreError> {
        (**self).load_archived().await
    }

    async fn materials_needed(&self, facility_id: FacilityId) -> Result<Vec<MaterialNeed>, StoreError> {
        (**self).materials_needed(facility_id).await
    }
}

/// A store opened from configuration.
pub struct OpenedStore {
    pub store: Arc<dyn ProjectStore>,
    /// Present only for the networked backend; exposes the connectivity flag.
    pub broker: Option<ConnectionBroker<PgConnector>>,
}

/// Build the configured backend. Called once at startup.
pub async fn open(config: &BackendConfig) -> Result<OpenedStore, StoreError> {
    match config {
        BackendConfig::Local { sqlite_path } => Ok(OpenedStore {
            store: Arc::new(SqliteProjectStore::new(sqlite_path.clone())),
            broker: None,
        }),
        BackendConfig::Networked {
            primary_url,
            fallback_url,
            probe_interval,
            sticky_fallback,
        } => {
            let connector = PgConnector::new(primary_url, fallback_url.as_deref())?;
            let broker = ConnectionBroker::new(
                connector,
                BrokerConfig {
                    probe_interval: *probe_interval,
                    sticky_fallback: *sticky_fallback,
                },
            );
            let store = PostgresProjectStore::new(broker.clone());
            store.initialize().await?;
            Ok(OpenedStore {
                store: Arc::new(store),
                broker: Some(broker),
            })
        }
    }
}

/// Map an sqlx error to a store error by failure kind.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(e) => StoreError::Connectivity(format!("i/o error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Connectivity(format!("tls error in {operation}: {e}")),
        sqlx::Error::Protocol(msg) => {
            StoreError::Connectivity(format!("protocol error in {operation}: {msg}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Connectivity(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Connectivity(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::WorkerCrashed => {
            StoreError::Connectivity(format!("connection worker crashed in {operation}"))
        }
        sqlx::Error::Configuration(e) => {
            StoreError::Config(format!("invalid configuration in {operation}: {e}"))
        }
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            // Postgres class 08 (connection exception) and 57P0x (server shutdown).
            match db_err.code() {
                Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                    StoreError::Connectivity(msg)
                }
                _ => StoreError::Database(msg),
            }
        }
        other => StoreError::Database(format!("{operation}: {other}")),
    }
}

/// Map an error raised inside a transaction.
///
/// Connectivity stays connectivity so the broker can still fail over.
pub(crate) fn tx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match map_sqlx_error(operation, err) {
        StoreError::Connectivity(msg) => StoreError::Connectivity(msg),
        other => StoreError::Transaction(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_kinds_are_detected() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_sqlx_error("load", sqlx::Error::Io(io)).is_connectivity());
        assert!(map_sqlx_error("load", sqlx::Error::PoolTimedOut).is_connectivity());
        assert!(map_sqlx_error("load", sqlx::Error::PoolClosed).is_connectivity());
        assert!(!map_sqlx_error("load", sqlx::Error::RowNotFound).is_connectivity());
    }

    #[test]
    fn transaction_errors_keep_connectivity_kind() {
        assert!(tx_error("archive", sqlx::Error::PoolClosed).is_connectivity());
        assert!(matches!(
            tx_error("archive", sqlx::Error::RowNotFound),
            StoreError::Transaction(_)
        ));
    }
}
