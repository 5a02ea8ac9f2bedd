//! Cargo ledger driven by journal cargo movements.

pub mod ledger;

pub use ledger::{CargoEntry, CargoLedger, LedgerChanged};
