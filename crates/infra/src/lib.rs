//! Infrastructure layer: journal access, project stores, connection routing,
//! reconciliation and the periodic worker that drives them.

pub mod broker;
pub mod config;
pub mod journal;
pub mod reconcile;
pub mod store;
pub mod workers;

pub use broker::{BrokerConfig, BrokerEvent, ConnectionBroker, Connector, Endpoint, PgConnector};
pub use config::{BackendConfig, ConfigError, EngineConfig};
pub use reconcile::{DepotReconciler, ReconcileOutcome};
pub use store::{OpenedStore, ProjectStore, StoreError};
pub use workers::{JournalPipeline, JournalWorker, JournalWorkerHandle, PassError, PassReport};
