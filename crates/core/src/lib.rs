//! `depot-core`: domain building blocks.
//!
//! This crate contains **pure domain** primitives for construction-project
//! tracking (no infrastructure concerns): facility identifiers, projects,
//! resource rows and the archive shape.

pub mod error;
pub mod id;
pub mod project;

pub use error::{DomainError, DomainResult};
pub use id::FacilityId;
pub use project::{
    ArchivedProject, BackendOrigin, MaterialNeed, Project, ProjectResourceRow, ResourceRequirement,
};
