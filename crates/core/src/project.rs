//! Construction projects and their resource rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::FacilityId;

/// Which backend a project record was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendOrigin {
    /// Embedded, file-backed store on this machine.
    Local,
    /// Shared relational store reached over the network.
    Networked,
}

impl BackendOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendOrigin::Local => "local",
            BackendOrigin::Networked => "networked",
        }
    }
}

impl core::fmt::Display for BackendOrigin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked construction project, keyed by its facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub facility_id: FacilityId,
    pub system_name: String,
    pub facility_name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub backend_origin: BackendOrigin,
}

impl Project {
    pub fn new(
        facility_id: FacilityId,
        system_name: impl Into<String>,
        facility_name: impl Into<String>,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
        backend_origin: BackendOrigin,
    ) -> DomainResult<Self> {
        let system_name = system_name.into();
        let facility_name = facility_name.into();
        if system_name.trim().is_empty() {
            return Err(DomainError::EmptyField("system name"));
        }
        if facility_name.trim().is_empty() {
            return Err(DomainError::EmptyField("facility name"));
        }

        Ok(Self {
            facility_id,
            system_name,
            facility_name,
            created_by: created_by.into(),
            created_at,
            backend_origin,
        })
    }

    /// Build the history record for this project.
    pub fn archive(&self, archived_at: DateTime<Utc>) -> ArchivedProject {
        ArchivedProject {
            facility_id: self.facility_id,
            system_name: self.system_name.clone(),
            facility_name: self.facility_name.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            archived_at,
        }
    }
}

/// A single material requirement of a facility, as reported by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_name: String,
    pub required_amount: i64,
    pub provided_amount: i64,
    pub payment_amount: i64,
}

impl ResourceRequirement {
    pub fn new(
        resource_name: impl Into<String>,
        required_amount: i64,
        provided_amount: i64,
        payment_amount: i64,
    ) -> DomainResult<Self> {
        let requirement = Self {
            resource_name: resource_name.into(),
            required_amount,
            provided_amount,
            payment_amount,
        };
        requirement.validate()?;
        Ok(requirement)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.resource_name.trim().is_empty() {
            return Err(DomainError::EmptyField("resource name"));
        }
        for (field, value) in [
            ("required amount", self.required_amount),
            ("provided amount", self.provided_amount),
            ("payment amount", self.payment_amount),
        ] {
            if value < 0 {
                return Err(DomainError::NegativeAmount {
                    resource: self.resource_name.clone(),
                    field,
                    value,
                });
            }
        }
        Ok(())
    }

    /// Outstanding quantity: `max(required - provided, 0)`.
    pub fn needed(&self) -> i64 {
        (self.required_amount - self.provided_amount).max(0)
    }
}

/// Persisted per-resource row of a project.
///
/// `(facility_id, resource_name)` is unique. Reconciliation never lowers
/// `provided_amount`; the storage layer itself does not enforce this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectResourceRow {
    pub facility_id: FacilityId,
    pub resource_name: String,
    pub required_amount: i64,
    pub provided_amount: i64,
    pub payment_amount: i64,
}

impl ProjectResourceRow {
    pub fn from_requirement(facility_id: FacilityId, requirement: &ResourceRequirement) -> Self {
        Self {
            facility_id,
            resource_name: requirement.resource_name.clone(),
            required_amount: requirement.required_amount,
            provided_amount: requirement.provided_amount,
            payment_amount: requirement.payment_amount,
        }
    }

    pub fn as_requirement(&self) -> ResourceRequirement {
        ResourceRequirement {
            resource_name: self.resource_name.clone(),
            required_amount: self.required_amount,
            provided_amount: self.provided_amount,
            payment_amount: self.payment_amount,
        }
    }
}

/// A project moved to history. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedProject {
    pub facility_id: FacilityId,
    pub system_name: String,
    pub facility_name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

/// One line of a project's "materials still needed" list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialNeed {
    pub resource_name: String,
    pub required: i64,
    pub provided: i64,
    pub needed: i64,
}

impl From<&ProjectResourceRow> for MaterialNeed {
    fn from(row: &ProjectResourceRow) -> Self {
        Self {
            resource_name: row.resource_name.clone(),
            required: row.required_amount,
            provided: row.provided_amount,
            needed: (row.required_amount - row.provided_amount).max(0),
        }
    }
}
