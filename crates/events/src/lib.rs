//! `depot-events`: journal events and change notifications.
//!
//! - [`classify`] turns one raw journal line into a typed [`JournalEvent`]
//! - [`bus`] fans change notifications out to in-process subscribers

pub mod bus;
pub mod classify;
pub mod event;

pub use bus::{EventBus, InMemoryEventBus, InMemoryBusError, Subscription};
pub use classify::{classify, canonical_commodity, Classified, ClassifyError};
pub use event::{
    CargoDelta, CargoMovement, DepotSnapshot, JournalEvent, MovementSource, SnapshotResource,
};
