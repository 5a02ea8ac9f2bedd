//! Journal line classification.
//!
//! Each journal line is one JSON object with an `event` discriminant. Lines
//! are decoded in two steps: a structural parse into `serde_json::Value`,
//! then a per-shape decode into the closed [`JournalEvent`] type. Shapes the
//! engine does not act on come back as [`Classified::Unrecognized`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;

use depot_core::FacilityId;

use crate::event::{
    CargoDelta, CargoMovement, DepotSnapshot, JournalEvent, MovementSource, SnapshotResource,
};

const MARKET_BUY: &str = "MarketBuy";
const MARKET_SELL: &str = "MarketSell";
const CARGO_TRANSFER: &str = "CargoTransfer";
const CONTRIBUTION: &str = "ColonisationContribution";
const CONSTRUCTION_DEPOT: &str = "ColonisationConstructionDepot";

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Event(JournalEvent),
    /// Well-formed line with a discriminant outside the recognized set.
    Unrecognized { event_type: String },
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("malformed journal line: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("journal line has no string `event` field")]
    MissingDiscriminant,

    #[error("invalid {event_type} event: {message}")]
    Field { event_type: String, message: String },
}

impl ClassifyError {
    fn field(event_type: &str, message: impl Into<String>) -> Self {
        Self::Field {
            event_type: event_type.to_string(),
            message: message.into(),
        }
    }
}

/// Classify one raw journal line.
pub fn classify(line: &str) -> Result<Classified, ClassifyError> {
    let value: JsonValue = serde_json::from_str(line.trim()).map_err(ClassifyError::Parse)?;

    let event_type = value
        .get("event")
        .and_then(JsonValue::as_str)
        .ok_or(ClassifyError::MissingDiscriminant)?
        .to_string();

    let event = match event_type.as_str() {
        MARKET_BUY => decode::<wire::MarketTrade>(value, MARKET_BUY)?
            .into_movement(MovementSource::Purchase, 1, MARKET_BUY)?,
        MARKET_SELL => decode::<wire::MarketTrade>(value, MARKET_SELL)?
            .into_movement(MovementSource::Sale, -1, MARKET_SELL)?,
        CARGO_TRANSFER => decode::<wire::CargoTransfer>(value, CARGO_TRANSFER)?.into_movement()?,
        CONTRIBUTION => decode::<wire::Contribution>(value, CONTRIBUTION)?.into_movement()?,
        CONSTRUCTION_DEPOT => decode::<wire::ConstructionDepot>(value, CONSTRUCTION_DEPOT)?.into_snapshot()?,
        _ => {
            trace!(event_type = %event_type, "journal event not tracked");
            return Ok(Classified::Unrecognized { event_type });
        }
    };

    Ok(Classified::Event(event))
}

/// Canonical commodity name from a journal symbol.
///
/// `$Steel_name;`, `steel` and ` Steel ` all map to `steel`.
pub fn canonical_commodity(raw: &str) -> String {
    let mut name = raw.trim();
    name = name.strip_prefix('$').unwrap_or(name);
    name = name.strip_suffix(';').unwrap_or(name);
    let lower = name.to_ascii_lowercase();
    match lower.strip_suffix("_name") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

fn decode<T: DeserializeOwned>(value: JsonValue, event_type: &str) -> Result<T, ClassifyError> {
    serde_json::from_value(value).map_err(|e| ClassifyError::field(event_type, e.to_string()))
}

fn non_negative(amount: i64, event_type: &str, what: &str) -> Result<i64, ClassifyError> {
    if amount < 0 {
        return Err(ClassifyError::field(
            event_type,
            format!("{what} cannot be negative (got {amount})"),
        ));
    }
    Ok(amount)
}

fn delta(
    raw_name: &str,
    localized: Option<String>,
    quantity: i64,
    event_type: &str,
) -> Result<CargoDelta, ClassifyError> {
    let item_name = canonical_commodity(raw_name);
    if item_name.is_empty() {
        return Err(ClassifyError::field(event_type, "commodity name is empty"));
    }
    let display_name = localized
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| item_name.clone());

    Ok(CargoDelta {
        item_name,
        display_name,
        quantity,
    })
}

/// Journal wire shapes. Field names follow the journal's PascalCase keys;
/// `Option` marks fields that may be absent.
mod wire {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub(super) struct MarketTrade {
        #[serde(default)]
        pub timestamp: Option<DateTime<Utc>>,
        #[serde(rename = "Type")]
        pub item_type: String,
        #[serde(rename = "Type_Localised", default)]
        pub item_type_localised: Option<String>,
        #[serde(rename = "Count")]
        pub count: i64,
    }

    impl MarketTrade {
        pub fn into_movement(
            self,
            source: MovementSource,
            sign: i64,
            event_type: &str,
        ) -> Result<JournalEvent, ClassifyError> {
            let count = non_negative(self.count, event_type, "Count")?;
            let delta = delta(&self.item_type, self.item_type_localised, sign * count, event_type)?;
            Ok(JournalEvent::CargoMovement(CargoMovement {
                timestamp: self.timestamp,
                source,
                deltas: vec![delta],
            }))
        }
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Transfer {
        #[serde(rename = "Type")]
        pub item_type: String,
        #[serde(rename = "Type_Localised", default)]
        pub item_type_localised: Option<String>,
        #[serde(rename = "Count")]
        pub count: i64,
        #[serde(rename = "Direction")]
        pub direction: String,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct CargoTransfer {
        #[serde(default)]
        pub timestamp: Option<DateTime<Utc>>,
        #[serde(rename = "Transfers")]
        pub transfers: Vec<Transfer>,
    }

    impl CargoTransfer {
        pub fn into_movement(self) -> Result<JournalEvent, ClassifyError> {
            let mut deltas = Vec::with_capacity(self.transfers.len());
            for t in self.transfers {
                let count = non_negative(t.count, CARGO_TRANSFER, "Count")?;
                let sign = match t.direction.to_ascii_lowercase().as_str() {
                    "toship" => 1,
                    "tocarrier" | "tosrv" => -1,
                    other => {
                        return Err(ClassifyError::field(
                            CARGO_TRANSFER,
                            format!("unknown transfer direction '{other}'"),
                        ));
                    }
                };
                deltas.push(delta(&t.item_type, t.item_type_localised, sign * count, CARGO_TRANSFER)?);
            }
            Ok(JournalEvent::CargoMovement(CargoMovement {
                timestamp: self.timestamp,
                source: MovementSource::Transfer,
                deltas,
            }))
        }
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Contributed {
        #[serde(rename = "Name")]
        pub name: String,
        #[serde(rename = "Name_Localised", default)]
        pub name_localised: Option<String>,
        #[serde(rename = "Amount")]
        pub amount: i64,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Contribution {
        #[serde(default)]
        pub timestamp: Option<DateTime<Utc>>,
        #[serde(rename = "Contributions")]
        pub contributions: Vec<Contributed>,
    }

    impl Contribution {
        pub fn into_movement(self) -> Result<JournalEvent, ClassifyError> {
            let mut deltas = Vec::with_capacity(self.contributions.len());
            for c in self.contributions {
                let amount = non_negative(c.amount, CONTRIBUTION, "Amount")?;
                deltas.push(delta(&c.name, c.name_localised, -amount, CONTRIBUTION)?);
            }
            Ok(JournalEvent::CargoMovement(CargoMovement {
                timestamp: self.timestamp,
                source: MovementSource::Contribution,
                deltas,
            }))
        }
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Required {
        #[serde(rename = "Name")]
        pub name: String,
        #[serde(rename = "Name_Localised", default)]
        pub name_localised: Option<String>,
        #[serde(rename = "RequiredAmount")]
        pub required_amount: i64,
        #[serde(rename = "ProvidedAmount")]
        pub provided_amount: i64,
        #[serde(rename = "Payment", default)]
        pub payment: i64,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct ConstructionDepot {
        #[serde(default)]
        pub timestamp: Option<DateTime<Utc>>,
        #[serde(rename = "MarketID")]
        pub market_id: i64,
        #[serde(rename = "ConstructionProgress", default)]
        pub progress: Option<f64>,
        #[serde(rename = "ConstructionComplete", default)]
        pub complete: bool,
        #[serde(rename = "ConstructionFailed", default)]
        pub failed: bool,
        #[serde(rename = "ResourcesRequired")]
        pub resources: Vec<Required>,
    }

    impl ConstructionDepot {
        pub fn into_snapshot(self) -> Result<JournalEvent, ClassifyError> {
            let mut resources = Vec::with_capacity(self.resources.len());
            for r in self.resources {
                let name = canonical_commodity(&r.name);
                if name.is_empty() {
                    return Err(ClassifyError::field(CONSTRUCTION_DEPOT, "resource name is empty"));
                }
                resources.push(SnapshotResource {
                    name,
                    localized_name: r.name_localised.filter(|s| !s.trim().is_empty()),
                    required_amount: non_negative(r.required_amount, CONSTRUCTION_DEPOT, "RequiredAmount")?,
                    provided_amount: non_negative(r.provided_amount, CONSTRUCTION_DEPOT, "ProvidedAmount")?,
                    payment: non_negative(r.payment, CONSTRUCTION_DEPOT, "Payment")?,
                });
            }
            Ok(JournalEvent::DepotSnapshot(DepotSnapshot {
                timestamp: self.timestamp,
                facility_id: FacilityId::new(self.market_id),
                progress: self.progress,
                complete: self.complete,
                failed: self.failed,
                resources,
            }))
        }
    }
}
