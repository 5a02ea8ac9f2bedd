//! Embedded, file-backed project store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use depot_core::{
    ArchivedProject, BackendOrigin, FacilityId, Project, ProjectResourceRow, ResourceRequirement,
};

use super::{map_sqlx_error, tx_error, ProjectStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        facility_id   INTEGER PRIMARY KEY,
        system_name   TEXT NOT NULL,
        facility_name TEXT NOT NULL,
        created_by    TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS project_resources (
        facility_id     INTEGER NOT NULL,
        resource_name   TEXT NOT NULL,
        required_amount INTEGER NOT NULL,
        provided_amount INTEGER NOT NULL,
        payment_amount  INTEGER NOT NULL,
        UNIQUE (facility_id, resource_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects_archive (
        facility_id   INTEGER NOT NULL,
        system_name   TEXT NOT NULL,
        facility_name TEXT NOT NULL,
        created_by    TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        archived_at   TEXT NOT NULL
    )
    "#,
];

/// SQLite-backed project store.
///
/// The pool is created lazily on first use, together with the schema.
#[derive(Debug, Clone)]
pub struct SqliteProjectStore {
    path: PathBuf,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the pool, initializing the database on first call.
    pub(crate) async fn pool(&self) -> Result<SqlitePool, StoreError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Config(format!("failed to create store directory {parent:?}: {e}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("create schema", e))?;
        }

        debug!(path = ?self.path, "sqlite project store initialized");
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("invalid {column} '{raw}': {e}")))
}

fn row_to_project(row: &SqliteRow) -> Result<Project, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    Ok(Project {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        system_name: row.try_get("system_name").map_err(decode)?,
        facility_name: row.try_get("facility_name").map_err(decode)?,
        created_by: row.try_get("created_by").map_err(decode)?,
        created_at: parse_time(&created_at, "created_at")?,
        backend_origin: BackendOrigin::Local,
    })
}

fn row_to_resource(row: &SqliteRow) -> Result<ProjectResourceRow, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    Ok(ProjectResourceRow {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        resource_name: row.try_get("resource_name").map_err(decode)?,
        required_amount: row.try_get("required_amount").map_err(decode)?,
        provided_amount: row.try_get("provided_amount").map_err(decode)?,
        payment_amount: row.try_get("payment_amount").map_err(decode)?,
    })
}

fn row_to_archived(row: &SqliteRow) -> Result<ArchivedProject, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    let archived_at: String = row.try_get("archived_at").map_err(decode)?;
    Ok(ArchivedProject {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        system_name: row.try_get("system_name").map_err(decode)?,
        facility_name: row.try_get("facility_name").map_err(decode)?,
        created_by: row.try_get("created_by").map_err(decode)?,
        created_at: parse_time(&created_at, "created_at")?,
        archived_at: parse_time(&archived_at, "archived_at")?,
    })
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    fn origin(&self) -> BackendOrigin {
        BackendOrigin::Local
    }

    #[instrument(skip(self), err)]
    async fn load(&self) -> Result<Vec<Project>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT facility_id, system_name, facility_name, created_by, created_at
            FROM projects
            ORDER BY facility_id
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        rows.iter().map(row_to_project).collect()
    }

    async fn get(&self, facility_id: FacilityId) -> Result<Option<Project>, StoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT facility_id, system_name, facility_name, created_by, created_at
            FROM projects
            WHERE facility_id = ?1
            "#,
        )
        .bind(facility_id.get())
        .fetch_optional(&pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_project).transpose()
    }

    #[instrument(skip(self, project), fields(facility_id = %project.facility_id), err)]
    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO projects (facility_id, system_name, facility_name, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (facility_id) DO UPDATE SET
                system_name = excluded.system_name,
                facility_name = excluded.facility_name,
                created_by = excluded.created_by,
                created_at = excluded.created_at
            "#,
        )
        .bind(project.facility_id.get())
        .bind(&project.system_name)
        .bind(&project.facility_name)
        .bind(&project.created_by)
        .bind(project.created_at.to_rfc3339())
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    async fn resources(&self, facility_id: FacilityId) -> Result<Vec<ProjectResourceRow>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT facility_id, resource_name, required_amount, provided_amount, payment_amount
            FROM project_resources
            WHERE facility_id = ?1
            ORDER BY resource_name
            "#,
        )
        .bind(facility_id.get())
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("resources", e))?;

        rows.iter().map(row_to_resource).collect()
    }

    async fn find_resource(
        &self,
        facility_id: FacilityId,
        resource_name: &str,
    ) -> Result<Option<ProjectResourceRow>, StoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT facility_id, resource_name, required_amount, provided_amount, payment_amount
            FROM project_resources
            WHERE facility_id = ?1 AND resource_name = ?2
            "#,
        )
        .bind(facility_id.get())
        .bind(resource_name)
        .fetch_optional(&pool)
        .await
        .map_err(|e| map_sqlx_error("find_resource", e))?;

        row.as_ref().map(row_to_resource).transpose()
    }

    #[instrument(skip(self, requirement), fields(resource = %requirement.resource_name), err)]
    async fn upsert_resource(
        &self,
        facility_id: FacilityId,
        requirement: &ResourceRequirement,
    ) -> Result<(), StoreError> {
        requirement.validate()?;
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO project_resources
                (facility_id, resource_name, required_amount, provided_amount, payment_amount)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (facility_id, resource_name) DO UPDATE SET
                required_amount = excluded.required_amount,
                provided_amount = excluded.provided_amount,
                payment_amount = excluded.payment_amount
            "#,
        )
        .bind(facility_id.get())
        .bind(&requirement.resource_name)
        .bind(requirement.required_amount)
        .bind(requirement.provided_amount)
        .bind(requirement.payment_amount)
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_resource", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn archive_and_remove(&self, facility_id: FacilityId) -> Result<ArchivedProject, StoreError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(|e| tx_error("begin", e))?;

        let row = sqlx::query(
            r#"
            SELECT facility_id, system_name, facility_name, created_by, created_at
            FROM projects
            WHERE facility_id = ?1
            "#,
        )
        .bind(facility_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| tx_error("archive lookup", e))?;

        let Some(row) = row else {
            // Dropping the transaction rolls it back.
            return Err(StoreError::NotFound(facility_id));
        };
        let archived = row_to_project(&row)?.archive(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO projects_archive
                (facility_id, system_name, facility_name, created_by, created_at, archived_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(archived.facility_id.get())
        .bind(&archived.system_name)
        .bind(&archived.facility_name)
        .bind(&archived.created_by)
        .bind(archived.created_at.to_rfc3339())
        .bind(archived.archived_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| tx_error("archive insert", e))?;

        sqlx::query("DELETE FROM project_resources WHERE facility_id = ?1")
            .bind(facility_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| tx_error("archive resource delete", e))?;

        sqlx::query("DELETE FROM projects WHERE facility_id = ?1")
            .bind(facility_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| tx_error("archive project delete", e))?;

        tx.commit().await.map_err(|e| tx_error("archive commit", e))?;
        Ok(archived)
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, facility_id: FacilityId) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(|e| tx_error("begin", e))?;

        sqlx::query("DELETE FROM project_resources WHERE facility_id = ?1")
            .bind(facility_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| tx_error("delete resources", e))?;

        let removed = sqlx::query("DELETE FROM projects WHERE facility_id = ?1")
            .bind(facility_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| tx_error("delete project", e))?;

        if removed.rows_affected() == 0 {
            return Err(StoreError::NotFound(facility_id));
        }

        tx.commit().await.map_err(|e| tx_error("delete commit", e))?;
        Ok(())
    }

    async fn load_archived(&self) -> Result<Vec<ArchivedProject>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT facility_id, system_name, facility_name, created_by, created_at, archived_at
            FROM projects_archive
            ORDER BY archived_at DESC
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("load_archived", e))?;

        rows.iter().map(row_to_archived).collect()
    }
}

/// Default database location: `{data_dir}/depot-ledger/projects.db`.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("depot-ledger").join("projects.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SqliteProjectStore {
        SqliteProjectStore::new(dir.path().join("nested").join("projects.db"))
    }

    fn project(id: i64) -> Project {
        Project::new(
            FacilityId::new(id),
            "LTT 1873",
            "Planetary Port",
            "cmdr",
            Utc::now(),
            BackendOrigin::Local,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let p = project(3_700_000_001);
        store.save(&p).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].facility_id, p.facility_id);
        assert_eq!(loaded[0].facility_name, "Planetary Port");
        assert_eq!(loaded[0].created_at.timestamp(), p.created_at.timestamp());
        assert!(store.contains(p.facility_id).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_resource_is_keyed_by_facility_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = FacilityId::new(11);
        store.save(&project(11)).await.unwrap();

        store
            .upsert_resource(id, &ResourceRequirement::new("Steel", 500, 100, 1_000).unwrap())
            .await
            .unwrap();
        store
            .upsert_resource(id, &ResourceRequirement::new("Steel", 500, 250, 1_000).unwrap())
            .await
            .unwrap();
        store
            .upsert_resource(id, &ResourceRequirement::new("Aluminium", 80, 0, 900).unwrap())
            .await
            .unwrap();

        let rows = store.resources(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].resource_name, "Aluminium");
        let steel = store.find_resource(id, "Steel").await.unwrap().unwrap();
        assert_eq!(steel.provided_amount, 250);

        let needs = store.materials_needed(id).await.unwrap();
        assert_eq!(needs.iter().map(|n| n.needed).sum::<i64>(), 80 + 250);
    }

    #[tokio::test]
    async fn archive_moves_project_and_drops_resources() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = FacilityId::new(5);
        store.save(&project(5)).await.unwrap();
        store
            .upsert_resource(id, &ResourceRequirement::new("Steel", 10, 10, 0).unwrap())
            .await
            .unwrap();

        let archived = store.archive_and_remove(id).await.unwrap();
        assert_eq!(archived.facility_id, id);
        assert!(!store.contains(id).await.unwrap());
        assert!(store.resources(id).await.unwrap().is_empty());

        let history = store.load_archived().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].facility_name, "Planetary Port");
    }

    #[tokio::test]
    async fn archive_unknown_project_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let err = store.archive_and_remove(FacilityId::new(404)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.load_archived().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_archive_leaves_live_tables_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = FacilityId::new(8);
        store.save(&project(8)).await.unwrap();

        // Make the archive insert fail mid-transaction.
        let pool = store.pool().await.unwrap();
        sqlx::query("DROP TABLE projects_archive").execute(&pool).await.unwrap();

        let err = store.archive_and_remove(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
        assert!(store.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_project_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = FacilityId::new(9);
        store.save(&project(9)).await.unwrap();
        store
            .upsert_resource(id, &ResourceRequirement::new("Water", 40, 0, 0).unwrap())
            .await
            .unwrap();

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.resources(id).await.unwrap().is_empty());
        assert!(store.load_archived().await.unwrap().is_empty());

        let again = store.delete(id).await.unwrap_err();
        assert!(matches!(again, StoreError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn failed_delete_keeps_resource_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = FacilityId::new(10);
        store.save(&project(10)).await.unwrap();
        store
            .upsert_resource(id, &ResourceRequirement::new("Steel", 300, 40, 0).unwrap())
            .await
            .unwrap();

        // Resource rows go first; the project row delete then aborts.
        let pool = store.pool().await.unwrap();
        sqlx::query(
            "CREATE TRIGGER refuse_project_delete BEFORE DELETE ON projects \
             BEGIN SELECT RAISE(ABORT, 'project locked'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = store.delete(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
        assert!(store.contains(id).await.unwrap());
        let rows = store.resources(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provided_amount, 40);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir).save(&project(21)).await.unwrap();

        let reopened = store_in(&dir);
        assert!(reopened.contains(FacilityId::new(21)).await.unwrap());
    }
}
