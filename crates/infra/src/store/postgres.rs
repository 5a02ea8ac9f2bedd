//! Networked project store. Every call is routed through the connection broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{instrument, Span};

use depot_core::{
    ArchivedProject, BackendOrigin, FacilityId, Project, ProjectResourceRow, ResourceRequirement,
};

use super::{map_sqlx_error, tx_error, ProjectStore, StoreError};
use crate::broker::{ConnectionBroker, PgConnector};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        facility_id   BIGINT PRIMARY KEY,
        system_name   TEXT NOT NULL,
        facility_name TEXT NOT NULL,
        created_by    TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS project_resources (
        facility_id     BIGINT NOT NULL,
        resource_name   TEXT NOT NULL,
        required_amount BIGINT NOT NULL,
        provided_amount BIGINT NOT NULL,
        payment_amount  BIGINT NOT NULL,
        UNIQUE (facility_id, resource_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects_archive (
        facility_id   BIGINT NOT NULL,
        system_name   TEXT NOT NULL,
        facility_name TEXT NOT NULL,
        created_by    TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL,
        archived_at   TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Postgres-backed project store.
#[derive(Clone)]
pub struct PostgresProjectStore {
    broker: ConnectionBroker<PgConnector>,
}

impl PostgresProjectStore {
    pub fn new(broker: ConnectionBroker<PgConnector>) -> Self {
        Self { broker }
    }

    /// Create the tables on whichever endpoint is active.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        self.broker
            .with_connection(|pool: PgPool| async move {
                for statement in SCHEMA {
                    sqlx::query(statement)
                        .execute(&pool)
                        .await
                        .map_err(|e| map_sqlx_error("create schema", e))?;
                }
                Ok(())
            })
            .await
    }
}

fn row_to_project(row: &PgRow) -> Result<Project, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    Ok(Project {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        system_name: row.try_get("system_name").map_err(decode)?,
        facility_name: row.try_get("facility_name").map_err(decode)?,
        created_by: row.try_get("created_by").map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        backend_origin: BackendOrigin::Networked,
    })
}

fn row_to_resource(row: &PgRow) -> Result<ProjectResourceRow, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    Ok(ProjectResourceRow {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        resource_name: row.try_get("resource_name").map_err(decode)?,
        required_amount: row.try_get("required_amount").map_err(decode)?,
        provided_amount: row.try_get("provided_amount").map_err(decode)?,
        payment_amount: row.try_get("payment_amount").map_err(decode)?,
    })
}

fn row_to_archived(row: &PgRow) -> Result<ArchivedProject, StoreError> {
    let decode = |e| map_sqlx_error("decode", e);
    Ok(ArchivedProject {
        facility_id: FacilityId::new(row.try_get("facility_id").map_err(decode)?),
        system_name: row.try_get("system_name").map_err(decode)?,
        facility_name: row.try_get("facility_name").map_err(decode)?,
        created_by: row.try_get("created_by").map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        archived_at: row.try_get::<DateTime<Utc>, _>("archived_at").map_err(decode)?,
    })
}

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    fn origin(&self) -> BackendOrigin {
        BackendOrigin::Networked
    }

    #[instrument(skip(self), fields(endpoint = tracing::field::Empty), err)]
    async fn load(&self) -> Result<Vec<Project>, StoreError> {
        Span::current().record("endpoint", self.broker.active_endpoint().as_str());
        self.broker
            .with_connection(|pool: PgPool| async move {
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
            })
            .await
    }

    async fn get(&self, facility_id: FacilityId) -> Result<Option<Project>, StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                let row = sqlx::query(
                    r#"
                    SELECT facility_id, system_name, facility_name, created_by, created_at
                    FROM projects
                    WHERE facility_id = $1
                    "#,
                )
                .bind(facility_id.get())
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_sqlx_error("get", e))?;

                row.as_ref().map(row_to_project).transpose()
            })
            .await
    }

    #[instrument(skip(self, project), fields(facility_id = %project.facility_id), err)]
    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO projects (facility_id, system_name, facility_name, created_by, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (facility_id) DO UPDATE SET
                        system_name = EXCLUDED.system_name,
                        facility_name = EXCLUDED.facility_name,
                        created_by = EXCLUDED.created_by,
                        created_at = EXCLUDED.created_at
                    "#,
                )
                .bind(project.facility_id.get())
                .bind(&project.system_name)
                .bind(&project.facility_name)
                .bind(&project.created_by)
                .bind(project.created_at)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("save", e))?;
                Ok(())
            })
            .await
    }

    async fn resources(&self, facility_id: FacilityId) -> Result<Vec<ProjectResourceRow>, StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                let rows = sqlx::query(
                    r#"
                    SELECT facility_id, resource_name, required_amount, provided_amount, payment_amount
                    FROM project_resources
                    WHERE facility_id = $1
                    ORDER BY resource_name
                    "#,
                )
                .bind(facility_id.get())
                .fetch_all(&pool)
                .await
                .map_err(|e| map_sqlx_error("resources", e))?;

                rows.iter().map(row_to_resource).collect()
            })
            .await
    }

    async fn find_resource(
        &self,
        facility_id: FacilityId,
        resource_name: &str,
    ) -> Result<Option<ProjectResourceRow>, StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                let row = sqlx::query(
                    r#"
                    SELECT facility_id, resource_name, required_amount, provided_amount, payment_amount
                    FROM project_resources
                    WHERE facility_id = $1 AND resource_name = $2
                    "#,
                )
                .bind(facility_id.get())
                .bind(resource_name)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_sqlx_error("find_resource", e))?;

                row.as_ref().map(row_to_resource).transpose()
            })
            .await
    }

    #[instrument(skip(self, requirement), fields(resource = %requirement.resource_name), err)]
    async fn upsert_resource(
        &self,
        facility_id: FacilityId,
        requirement: &ResourceRequirement,
    ) -> Result<(), StoreError> {
        requirement.validate()?;
        self.broker
            .with_connection(move |pool: PgPool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO project_resources
                        (facility_id, resource_name, required_amount, provided_amount, payment_amount)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (facility_id, resource_name) DO UPDATE SET
                        required_amount = EXCLUDED.required_amount,
                        provided_amount = EXCLUDED.provided_amount,
                        payment_amount = EXCLUDED.payment_amount
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
            })
            .await
    }

    #[instrument(skip(self), err)]
    async fn archive_and_remove(&self, facility_id: FacilityId) -> Result<ArchivedProject, StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                let mut tx = pool.begin().await.map_err(|e| tx_error("begin", e))?;

                let row = sqlx::query(
                    r#"
                    SELECT facility_id, system_name, facility_name, created_by, created_at
                    FROM projects
                    WHERE facility_id = $1
                    FOR UPDATE
                    "#,
                )
                .bind(facility_id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| tx_error("archive lookup", e))?;

                let Some(row) = row else {
                    return Err(StoreError::NotFound(facility_id));
                };
                let archived = row_to_project(&row)?.archive(Utc::now());

                sqlx::query(
                    r#"
                    INSERT INTO projects_archive
                        (facility_id, system_name, facility_name, created_by, created_at, archived_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(archived.facility_id.get())
                .bind(&archived.system_name)
                .bind(&archived.facility_name)
                .bind(&archived.created_by)
                .bind(archived.created_at)
                .bind(archived.archived_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| tx_error("archive insert", e))?;

                sqlx::query("DELETE FROM project_resources WHERE facility_id = $1")
                    .bind(facility_id.get())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| tx_error("archive resource delete", e))?;

                sqlx::query("DELETE FROM projects WHERE facility_id = $1")
                    .bind(facility_id.get())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| tx_error("archive project delete", e))?;

                tx.commit().await.map_err(|e| tx_error("archive commit", e))?;
                Ok(archived)
            })
            .await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, facility_id: FacilityId) -> Result<(), StoreError> {
        self.broker
            .with_connection(move |pool: PgPool| async move {
                let mut tx = pool.begin().await.map_err(|e| tx_error("begin", e))?;

                sqlx::query("DELETE FROM project_resources WHERE facility_id = $1")
                    .bind(facility_id.get())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| tx_error("delete resources", e))?;

                let removed = sqlx::query("DELETE FROM projects WHERE facility_id = $1")
                    .bind(facility_id.get())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| tx_error("delete project", e))?;

                if removed.rows_affected() == 0 {
                    return Err(StoreError::NotFound(facility_id));
                }

                tx.commit().await.map_err(|e| tx_error("delete commit", e))
            })
            .await
    }

    async fn load_archived(&self) -> Result<Vec<ArchivedProject>, StoreError> {
        self.broker
            .with_connection(|pool: PgPool| async move {
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
            })
            .await
    }
}
