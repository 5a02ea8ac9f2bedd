//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a construction facility (the journal's `MarketID`).
///
/// Facility ids are the unique key of a project in every store backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacilityId(i64);

impl FacilityId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for FacilityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for FacilityId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<FacilityId> for i64 {
    fn from(value: FacilityId) -> Self {
        value.0
    }
}

impl FromStr for FacilityId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<i64>()
            .map_err(|e| DomainError::InvalidFacilityId {
                input: s.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let id: FacilityId = " 3952874242 ".parse().unwrap();
        assert_eq!(id.get(), 3_952_874_242);
        assert_eq!(id.to_string(), "3952874242");
    }

    #[test]
    fn rejects_non_numeric() {
        let err = "market-7".parse::<FacilityId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidFacilityId { .. }));
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&FacilityId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
