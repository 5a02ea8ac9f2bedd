//! In-memory cargo hold derived from journal cargo movements.
//!
//! ## Model
//!
//! One entry per commodity, keyed by its name lowercased with whitespace
//! removed. The display name is the latest non-blank name a movement gave
//! the item. Quantities are signed deltas summed per key:
//!
//! - a delta that brings an entry to zero or below removes it;
//! - a negative delta for an item not held is ignored;
//! - an entry is therefore never observed with quantity ≤ 0.
//!
//! ## Notifications
//!
//! Subscribers receive one [`LedgerChanged`] per batch that changed at least
//! one entry, never one per delta. The ledger starts empty on every run; it
//! is rebuilt from the journal lines that arrive while the engine is up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use depot_events::{CargoDelta, EventBus, InMemoryEventBus, Subscription};

/// Current quantity of one item in the hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoEntry {
    /// Latest display name seen for the item, casing preserved.
    pub item_name: String,
    /// Always positive while the entry exists.
    pub quantity: i64,
}

/// Notification: the ledger changed during the last applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerChanged {
    /// Number of distinct items held after the batch.
    pub items: usize,
}

/// In-memory cargo ledger.
///
/// Keys are case- and whitespace-insensitive (`"Liquid Oxygen"` and
/// `"liquidoxygen"` are the same item). Entries whose quantity drops to zero
/// or below are removed, so no entry is ever observed with quantity ≤ 0.
///
/// Single writer: the journal worker's dispatch loop.
#[derive(Debug)]
pub struct CargoLedger {
    entries: HashMap<String, CargoEntry>,
    changes: Arc<InMemoryEventBus<LedgerChanged>>,
}

impl CargoLedger {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            changes: Arc::new(InMemoryEventBus::new()),
        }
    }

    /// Subscribe to batch-level change notifications.
    pub fn subscribe(&self) -> Subscription<LedgerChanged> {
        self.changes.subscribe()
    }

    /// Apply one signed delta as its own batch.
    ///
    /// Returns `true` when the ledger changed.
    pub fn apply_delta(&mut self, item_name: &str, quantity: i64) -> bool {
        let changed = self.apply_one(item_name, None, quantity);
        if changed {
            self.notify();
        }
        changed
    }

    /// Apply a batch of deltas, notifying subscribers at most once.
    ///
    /// Returns the number of deltas that changed the ledger.
    pub fn apply_batch<'a>(&mut self, deltas: impl IntoIterator<Item = &'a CargoDelta>) -> usize {
        let mut applied = 0;
        for d in deltas {
            if self.apply_one(&d.item_name, Some(&d.display_name), d.quantity) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.notify();
        }
        applied
    }

    pub fn quantity(&self, item_name: &str) -> i64 {
        self.entries
            .get(&normalize_key(item_name))
            .map(|e| e.quantity)
            .unwrap_or(0)
    }

    pub fn get(&self, item_name: &str) -> Option<&CargoEntry> {
        self.entries.get(&normalize_key(item_name))
    }

    /// Display name → quantity, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.entries
            .values()
            .map(|e| (e.item_name.clone(), e.quantity))
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CargoEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry (e.g. when the hold is known to be empty).
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.notify();
        }
    }

    /// `display_name`, when present and non-blank, replaces the shown name.
    fn apply_one(&mut self, item_name: &str, display_name: Option<&str>, quantity: i64) -> bool {
        let key = normalize_key(item_name);
        if key.is_empty() || quantity == 0 {
            return false;
        }
        let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());

        match self.entries.get_mut(&key) {
            Some(entry) => {
                let next = entry.quantity.saturating_add(quantity);
                if next <= 0 {
                    debug!(item = %entry.item_name, "cargo entry removed");
                    self.entries.remove(&key);
                } else {
                    entry.quantity = next;
                    if let Some(name) = display_name {
                        if entry.item_name != name {
                            entry.item_name = name.to_string();
                        }
                    }
                }
                true
            }
            None if quantity > 0 => {
                let shown = display_name.unwrap_or(item_name);
                self.entries.insert(
                    key,
                    CargoEntry {
                        item_name: shown.trim().to_string(),
                        quantity,
                    },
                );
                true
            }
            None => {
                debug!(item = %item_name, quantity, "negative delta for item not in ledger ignored");
                false
            }
        }
    }

    fn notify(&self) {
        let msg = LedgerChanged {
            items: self.entries.len(),
        };
        if let Err(err) = self.changes.publish(msg) {
            warn!(error = ?err, "failed to publish ledger change");
        }
    }
}

impl Default for CargoLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup key: lowercase, whitespace removed.
fn normalize_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn delta(name: &str, quantity: i64) -> CargoDelta {
        CargoDelta {
            item_name: name.to_lowercase().replace(' ', ""),
            display_name: name.to_string(),
            quantity,
        }
    }

    #[test]
    fn buy_then_sell_same_amount_removes_entry() {
        let mut ledger = CargoLedger::new();
        ledger.apply_delta("Iron", 50);
        ledger.apply_delta("Iron", -50);
        assert!(ledger.get("Iron").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn keys_ignore_case_and_whitespace_but_keep_display_casing() {
        let mut ledger = CargoLedger::new();
        ledger.apply_delta("Liquid Oxygen", 10);
        ledger.apply_delta("liquidoxygen", 5);
        ledger.apply_delta("LIQUID  OXYGEN", -3);

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.quantity("liquid oxygen"), 12);
        assert_eq!(ledger.get("liquidOxygen").unwrap().item_name, "Liquid Oxygen");
    }

    #[test]
    fn negative_delta_on_missing_item_changes_nothing() {
        let mut ledger = CargoLedger::new();
        let sub = ledger.subscribe();
        assert!(!ledger.apply_delta("Gold", -5));
        assert!(ledger.is_empty());
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn overdraw_removes_entry() {
        let mut ledger = CargoLedger::new();
        ledger.apply_delta("Steel", 10);
        ledger.apply_delta("Steel", -25);
        assert_eq!(ledger.quantity("Steel"), 0);
        assert!(ledger.get("Steel").is_none());
    }

    #[test]
    fn batch_notifies_once() {
        let mut ledger = CargoLedger::new();
        let sub = ledger.subscribe();

        let batch = vec![delta("Steel", 10), delta("Aluminium", 4), delta("Steel", -3)];
        assert_eq!(ledger.apply_batch(&batch), 3);

        let notes = sub.drain();
        assert_eq!(notes, vec![LedgerChanged { items: 2 }]);
    }

    #[test]
    fn batch_without_effect_does_not_notify() {
        let mut ledger = CargoLedger::new();
        let sub = ledger.subscribe();
        let batch = vec![delta("Steel", -10), delta("Water", 0)];
        assert_eq!(ledger.apply_batch(&batch), 0);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn batch_adopts_latest_localized_name() {
        let mut ledger = CargoLedger::new();
        ledger.apply_delta("cmmcomposite", 5);
        ledger.apply_batch(&[CargoDelta {
            item_name: "cmmcomposite".to_string(),
            display_name: "CMM Composite".to_string(),
            quantity: 2,
        }]);
        assert_eq!(ledger.get("cmmcomposite").unwrap().item_name, "CMM Composite");
        assert_eq!(ledger.quantity("cmmcomposite"), 7);
    }

    #[test]
    fn snapshot_is_keyed_by_display_name() {
        let mut ledger = CargoLedger::new();
        ledger.apply_batch(&[delta("Steel", 10), delta("CMM Composite", 3)]);
        let snap = ledger.snapshot();
        assert_eq!(snap.get("Steel"), Some(&10));
        assert_eq!(snap.get("CMM Composite"), Some(&3));
    }

    #[test]
    fn clear_empties_and_notifies_once() {
        let mut ledger = CargoLedger::new();
        ledger.apply_batch(&[delta("Steel", 10), delta("Water", 2)]);
        let sub = ledger.subscribe();

        ledger.clear();
        ledger.clear();

        assert!(ledger.is_empty());
        assert_eq!(ledger.len(), 0);
        assert!(ledger.snapshot().is_empty());
        assert_eq!(sub.drain(), vec![LedgerChanged { items: 0 }]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: no entry is ever observed with quantity <= 0.
        #[test]
        fn entries_stay_positive(
            ops in prop::collection::vec((0usize..4, -500i64..500), 0..200)
        ) {
            let names = ["Steel", "Aluminium", "Liquid Oxygen", "Water"];
            let mut ledger = CargoLedger::new();
            for (idx, qty) in ops {
                ledger.apply_delta(names[idx], qty);
                prop_assert!(ledger.entries().all(|e| e.quantity > 0));
            }
        }

        /// Property: with only positive deltas the ledger equals per-item sums.
        #[test]
        fn positive_deltas_accumulate(
            ops in prop::collection::vec((0usize..3, 1i64..100), 1..50)
        ) {
            let names = ["Steel", "Aluminium", "Water"];
            let mut expected = [0i64; 3];
            let mut ledger = CargoLedger::new();
            for (idx, qty) in ops {
                ledger.apply_delta(names[idx], qty);
                expected[idx] += qty;
            }
            for (idx, name) in names.iter().enumerate() {
                prop_assert_eq!(ledger.quantity(name), expected[idx]);
            }
        }
    }
}
