//! In-process [`ProjectStore`] for tests and local experiments.
//!
//! Follows the same contract as the database adapters: `save` upserts by
//! facility id, `upsert_resource` by (facility id, resource name), archive
//! and delete are all-or-nothing under one write lock. Nothing survives the
//! process.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use depot_core::{
    ArchivedProject, BackendOrigin, FacilityId, Project, ProjectResourceRow, ResourceRequirement,
};

use super::{ProjectStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    projects: BTreeMap<FacilityId, Project>,
    resources: HashMap<FacilityId, BTreeMap<String, ProjectResourceRow>>,
    archive: Vec<ArchivedProject>,
}

/// In-memory project store for tests/dev.
///
/// Each operation holds the write lock for its whole duration, which gives
/// the multi-step operations the same all-or-nothing behavior as a
/// database transaction.
#[derive(Debug)]
pub struct InMemoryProjectStore {
    origin: BackendOrigin,
    inner: RwLock<Tables>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::with_origin(BackendOrigin::Local)
    }

    pub fn with_origin(origin: BackendOrigin) -> Self {
        Self {
            origin,
            inner: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Database("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Database("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    fn origin(&self) -> BackendOrigin {
        self.origin
    }

    async fn load(&self) -> Result<Vec<Project>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .projects
            .values()
            .cloned()
            .map(|mut p| {
                p.backend_origin = self.origin;
                p
            })
            .collect())
    }

    async fn get(&self, facility_id: FacilityId) -> Result<Option<Project>, StoreError> {
        let tables = self.read()?;
        Ok(tables.projects.get(&facility_id).cloned().map(|mut p| {
            p.backend_origin = self.origin;
            p
        }))
    }

    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.projects.insert(project.facility_id, project.clone());
        Ok(())
    }

    async fn resources(&self, facility_id: FacilityId) -> Result<Vec<ProjectResourceRow>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .resources
            .get(&facility_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_resource(
        &self,
        facility_id: FacilityId,
        resource_name: &str,
    ) -> Result<Option<ProjectResourceRow>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .resources
            .get(&facility_id)
            .and_then(|rows| rows.get(resource_name))
            .cloned())
    }

    async fn upsert_resource(
        &self,
        facility_id: FacilityId,
        requirement: &ResourceRequirement,
    ) -> Result<(), StoreError> {
        requirement.validate()?;
        let mut tables = self.write()?;
        tables.resources.entry(facility_id).or_default().insert(
            requirement.resource_name.clone(),
            ProjectResourceRow::from_requirement(facility_id, requirement),
        );
        Ok(())
    }

    async fn archive_and_remove(&self, facility_id: FacilityId) -> Result<ArchivedProject, StoreError> {
        let mut tables = self.write()?;
        let project = tables
            .projects
            .remove(&facility_id)
            .ok_or(StoreError::NotFound(facility_id))?;
        tables.resources.remove(&facility_id);

        let archived = project.archive(Utc::now());
        tables.archive.push(archived.clone());
        Ok(archived)
    }

    async fn delete(&self, facility_id: FacilityId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.projects.remove(&facility_id).is_none() {
            return Err(StoreError::NotFound(facility_id));
        }
        tables.resources.remove(&facility_id);
        Ok(())
    }

    async fn load_archived(&self) -> Result<Vec<ArchivedProject>, StoreError> {
        let tables = self.read()?;
        let mut archived = tables.archive.clone();
        archived.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(archived)
    }
}
