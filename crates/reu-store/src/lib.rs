//! Persistent store access for program records.
//!
//! The sync writer and web API talk to the store through the [`ProgramStore`]
//! trait. [`PgStore`] is the hosted Postgres backend; [`MemoryStore`] backs
//! tests and offline runs with the same semantics.

use async_trait::async_trait;
use reu_core::Program;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reu-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("a program with url `{0}` already exists")]
    DuplicateUrl(String),
    #[error("program {0} not found")]
    NotFound(Uuid),
}

/// Store operations used by the pipeline and the read path.
///
/// Lookup methods must be deterministic for a fixed store state: when
/// several rows match, the one with the earliest `created_at` (ties broken
/// by `id`) wins.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Program>, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Program>, StoreError>;
    async fn find_by_url(&self, url: &str) -> Result<Option<Program>, StoreError>;
    async fn find_by_title_ci(&self, title: &str) -> Result<Option<Program>, StoreError>;
    async fn insert(&self, program: &Program) -> Result<(), StoreError>;
    async fn update(&self, program: &Program) -> Result<(), StoreError>;
    /// Administrative: delete every row. Returns the number deleted.
    async fn clear_all(&self) -> Result<u64, StoreError>;
    /// Administrative: empty the `field` tag list on every row. Returns the
    /// number of rows touched.
    async fn clear_field_attribute(&self) -> Result<u64, StoreError>;
}

/// In-memory store with the same match semantics as the Postgres backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Program>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_clone(rows: &[Program]) -> Vec<Program> {
    let mut out = rows.to_vec();
    out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    out
}

#[async_trait]
impl ProgramStore for MemoryStore {
    async fn list(&self) -> Result<Vec<Program>, StoreError> {
        Ok(sorted_clone(&self.rows.read().await))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Program>, StoreError> {
        Ok(self.rows.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Program>, StoreError> {
        let rows = self.rows.read().await;
        Ok(sorted_clone(&rows)
            .into_iter()
            .find(|p| p.url.as_deref() == Some(url)))
    }

    async fn find_by_title_ci(&self, title: &str) -> Result<Option<Program>, StoreError> {
        let rows = self.rows.read().await;
        Ok(sorted_clone(&rows)
            .into_iter()
            .find(|p| p.title.eq_ignore_ascii_case(title)))
    }

    async fn insert(&self, program: &Program) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if let Some(url) = &program.url {
            if rows.iter().any(|p| p.url.as_ref() == Some(url)) {
                return Err(StoreError::DuplicateUrl(url.clone()));
            }
        }
        rows.push(program.clone());
        Ok(())
    }

    async fn update(&self, program: &Program) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        match rows.iter_mut().find(|p| p.id == program.id) {
            Some(existing) => {
                *existing = program.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(program.id)),
        }
    }

    async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let count = rows.len() as u64;
        rows.clear();
        Ok(count)
    }

    async fn clear_field_attribute(&self) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        for row in rows.iter_mut() {
            row.field.clear();
        }
        Ok(rows.len() as u64)
    }
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const PROGRAM_COLUMNS: &str =
    "id, title, url, field, deadline, description, institution, created_at, updated_at";

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Query(sqlx::Error::Migrate(Box::new(err))))?;
        debug!(target: "reu", "migrations applied");
        Ok(())
    }
}

fn row_to_program(row: &PgRow) -> Result<Program, sqlx::Error> {
    Ok(Program {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        field: row.try_get("field")?,
        deadline: row.try_get("deadline")?,
        description: row.try_get("description")?,
        institution: row.try_get("institution")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_pg_error(err: sqlx::Error, url: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        // 23505 = unique_violation; the programs table has a unique url index.
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::DuplicateUrl(url.unwrap_or("<unknown>").to_string());
        }
    }
    StoreError::Query(err)
}

#[async_trait]
impl ProgramStore for PgStore {
    async fn list(&self) -> Result<Vec<Program>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_program(row).map_err(StoreError::Query))
            .collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_program)
            .transpose()
            .map_err(StoreError::Query)
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs WHERE url = $1 ORDER BY created_at, id LIMIT 1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_program)
            .transpose()
            .map_err(StoreError::Query)
    }

    async fn find_by_title_ci(&self, title: &str) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs \
             WHERE lower(title) = lower($1) ORDER BY created_at, id LIMIT 1"
        ))
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_program)
            .transpose()
            .map_err(StoreError::Query)
    }

    async fn insert(&self, program: &Program) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO programs \
             (id, title, url, field, deadline, description, institution, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(program.id)
        .bind(&program.title)
        .bind(&program.url)
        .bind(&program.field)
        .bind(&program.deadline)
        .bind(&program.description)
        .bind(&program.institution)
        .bind(program.created_at)
        .bind(program.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_pg_error(err, program.url.as_deref()))?;
        Ok(())
    }

    async fn update(&self, program: &Program) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE programs \
             SET title = $2, url = $3, field = $4, deadline = $5, \
                 description = $6, institution = $7, updated_at = $8 \
             WHERE id = $1",
        )
        .bind(program.id)
        .bind(&program.title)
        .bind(&program.url)
        .bind(&program.field)
        .bind(&program.deadline)
        .bind(&program.description)
        .bind(&program.institution)
        .bind(program.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_pg_error(err, program.url.as_deref()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(program.id));
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM programs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_field_attribute(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE programs SET field = '{}'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
