//! Source side of a migration: the legacy timeout store.
//!
//! `TimeoutStorage` is the contract the runner drives. It owns every piece of
//! durable progress (the singleton tool state and its batches), so a restarted
//! process recovers purely from what the store reports.
//!
//! - `repo`: SQL-only functions over the SQLite schema in `migrations/`.
//! - `sqlite`: `SqliteTimeoutStorage`, the SQLite implementation of the contract.

use crate::model::{BatchInfo, EndpointInfo, RunParameters, TimeoutData, ToolState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod repo;
pub mod sqlite;

pub use sqlite::SqliteTimeoutStorage;

/// Default number of timeouts per batch.
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[async_trait]
pub trait TimeoutStorage: Send + Sync {
    /// The in-progress migration, if any. Absence is not an error.
    async fn try_load_ongoing_migration(&self) -> Result<Option<ToolState>>;

    /// Endpoints owning at least one untouched timeout due at or before `cutoff`.
    async fn list_endpoints(&self, cutoff: DateTime<Utc>) -> Result<Vec<EndpointInfo>>;

    /// Partition the endpoint's eligible timeouts into pending batches and
    /// persist them with a fresh tool state. An earlier unstaged prepare is
    /// cleaned up and derived again.
    async fn prepare(
        &self,
        cutoff: DateTime<Utc>,
        endpoint_name: &str,
        run_parameters: &RunParameters,
    ) -> Result<ToolState>;

    async fn read_batch(&self, batch_number: i64) -> Result<Vec<TimeoutData>>;

    async fn mark_batch_as_staged(&self, batch_number: i64) -> Result<()>;

    async fn mark_batch_as_completed(&self, batch_number: i64) -> Result<()>;

    /// Archive the finished migration, leaving nothing resumable behind.
    async fn complete(&self) -> Result<()>;

    /// Roll back every non-completed batch and archive the migration.
    async fn abort(&self) -> Result<()>;

    /// Delete the given batches and strip the ongoing marker from their timeouts.
    async fn cleanup_existing_batches_and_reset_timeouts(&self, batches: &[BatchInfo]) -> Result<()>;
}
