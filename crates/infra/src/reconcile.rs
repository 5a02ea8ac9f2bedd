//! Monotonic merge of depot snapshots into stored resource rows.
//!
//! Snapshots only land for facilities the store already tracks; anything
//! else is logged and dropped. Per resource the merge is:
//!
//! | stored row | incoming provided | result |
//! |---|---|---|
//! | none | any | insert |
//! | `p` | `> p` | update required, provided and payment |
//! | `p` | `≤ p` | skip |
//!
//! Stored `provided_amount` is therefore `max` over every snapshot seen, and
//! delivering the same snapshot again writes nothing.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use depot_events::DepotSnapshot;

use crate::store::{ProjectStore, StoreError};

/// Result of reconciling one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The facility is not a tracked project; nothing was written.
    UnknownFacility,
    Applied {
        inserted: usize,
        updated: usize,
        skipped: usize,
    },
}

/// Merges snapshots into the store for known projects only.
///
/// `provided_amount` never decreases: a row is rewritten only when the
/// snapshot reports strictly more provided than stored. Replaying a
/// snapshot is therefore a no-op.
#[derive(Clone)]
pub struct DepotReconciler {
    store: Arc<dyn ProjectStore>,
}

impl DepotReconciler {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    #[instrument(skip(self, snapshot), fields(facility_id = %snapshot.facility_id), err)]
    pub async fn reconcile(&self, snapshot: &DepotSnapshot) -> Result<ReconcileOutcome, StoreError> {
        let facility_id = snapshot.facility_id;
        if !self.store.contains(facility_id).await? {
            info!(facility_id = %facility_id, "snapshot for untracked facility ignored");
            return Ok(ReconcileOutcome::UnknownFacility);
        }

        let (mut inserted, mut updated, mut skipped) = (0, 0, 0);
        for resource in &snapshot.resources {
            let incoming = resource.to_requirement();
            if let Err(err) = incoming.validate() {
                warn!(error = %err, "invalid snapshot resource skipped");
                skipped += 1;
                continue;
            }

            let mut stored = self.store.find_resource(facility_id, resource.display_name()).await?;
            if stored.is_none() && resource.display_name() != resource.name {
                stored = self.store.find_resource(facility_id, &resource.name).await?;
            }

            match stored {
                None => {
                    self.store.upsert_resource(facility_id, &incoming).await?;
                    inserted += 1;
                }
                Some(row) if incoming.provided_amount > row.provided_amount => {
                    // Keep the stored name so the row is updated, not duplicated.
                    let next = depot_core::ResourceRequirement {
                        resource_name: row.resource_name,
                        ..incoming
                    };
                    self.store.upsert_resource(facility_id, &next).await?;
                    updated += 1;
                }
                Some(row) => {
                    debug!(
                        resource = %row.resource_name,
                        stored = row.provided_amount,
                        incoming = incoming.provided_amount,
                        "stale or unchanged resource skipped"
                    );
                    skipped += 1;
                }
            }
        }

        Ok(ReconcileOutcome::Applied {
            inserted,
            updated,
            skipped,
        })
    }
}
