//! Tenant-scoped system of record with idempotent write semantics.
//!
//! Every write is keyed by a unique constraint and applied with
//! `ON CONFLICT`, so concurrent writers on the same key converge on one row
//! and observe the same id. Transactions are short: one upsert or one
//! append. The "latest verification per email" view is a covered-index
//! lookup, not a materialized view.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

pub mod entities;
pub mod jobs;
pub mod normalize;

mod leads;
mod resolutions;
mod runs;

pub use entities::*;
pub use leads::{EmailInput, PersonInput};
pub use resolutions::ResolutionInput;
pub use runs::RunEvent;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Normalize(#[from] normalize::NormalizeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("store migrations complete");
        Ok(())
    }

    pub async fn ensure_tenant(&self, tenant_id: Uuid, name: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name) VALUES ($1, $2)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
