//! Typed journal events.
//!
//! The journal carries hundreds of event kinds; the engine acts on two
//! shapes and nothing else:
//!
//! - **Cargo movement**: signed per-commodity deltas from market trades,
//!   cargo transfers and depot contributions. Deltas are *not* idempotent;
//!   applying one twice double-counts.
//! - **Depot snapshot**: the full resource list of a construction site at a
//!   point in time. Merging a snapshot is idempotent, so replays are safe.
//!
//! Both carry the journal timestamp when the line had one. Names come in
//! two forms: a canonical lowercase symbol used as the key, and an optional
//! localized name for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use depot_core::{FacilityId, ResourceRequirement};

/// Where a cargo movement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementSource {
    /// Bought on a commodity market.
    Purchase,
    /// Sold on a commodity market.
    Sale,
    /// Moved between the ship and another vessel or facility.
    Transfer,
    /// Handed over to a construction depot.
    Contribution,
}

/// A signed change to one cargo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoDelta {
    /// Canonical commodity name (e.g. `steel`).
    pub item_name: String,
    /// Name to show to people; the localized name when the journal has one.
    pub display_name: String,
    /// Positive when cargo enters the hold, negative when it leaves.
    pub quantity: i64,
}

/// Event: cargo moved into or out of the ship's hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoMovement {
    pub timestamp: Option<DateTime<Utc>>,
    pub source: MovementSource,
    pub deltas: Vec<CargoDelta>,
}

/// One resource line of a depot snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResource {
    /// Canonical commodity name.
    pub name: String,
    pub localized_name: Option<String>,
    pub required_amount: i64,
    pub provided_amount: i64,
    pub payment: i64,
}

impl SnapshotResource {
    /// Preferred name for storage and lookup.
    pub fn display_name(&self) -> &str {
        match &self.localized_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.name,
        }
    }

    pub fn to_requirement(&self) -> ResourceRequirement {
        ResourceRequirement {
            resource_name: self.display_name().to_string(),
            required_amount: self.required_amount,
            provided_amount: self.provided_amount,
            payment_amount: self.payment,
        }
    }
}

/// Event: point-in-time progress report of a construction depot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepotSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub facility_id: FacilityId,
    pub progress: Option<f64>,
    pub complete: bool,
    pub failed: bool,
    pub resources: Vec<SnapshotResource>,
}

/// The closed set of journal events the engine acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEvent {
    CargoMovement(CargoMovement),
    DepotSnapshot(DepotSnapshot),
}
