//! Destination side of a migration: a transport's native delayed delivery.
use crate::model::{EndpointInfo, MigrationCheckResult, TimeoutData};
use anyhow::Result;
use async_trait::async_trait;

pub mod sqlite;

pub use sqlite::{SqliteEndpointMigrator, SqliteTarget};

#[async_trait]
pub trait TimeoutsTarget: Send + Sync {
    type Migrator: EndpointBatchMigrator;

    /// Pre-flight checks. Side effects are limited to idempotently creating
    /// the endpoint's staging area.
    async fn able_to_migrate(&self, endpoint: &EndpointInfo) -> Result<MigrationCheckResult>;

    /// Acquire the per-endpoint staging resources.
    async fn prepare_endpoint_migrator(&self, endpoint_name: &str) -> Result<Self::Migrator>;

    /// Discard the endpoint's staging area.
    async fn abort(&self, endpoint_name: &str) -> Result<()>;

    /// Verify the staging area is empty, then remove it.
    async fn complete(&self, endpoint_name: &str) -> Result<()>;
}

#[async_trait]
pub trait EndpointBatchMigrator: Send + Sync {
    /// Write the batch into staging, replacing anything staged for it earlier.
    /// Returns how many timeouts are staged for the batch.
    async fn stage_batch(&self, batch_number: i64, timeouts: &[TimeoutData]) -> Result<usize>;

    /// Promote the batch from staging to live delayed delivery. Returns the
    /// number promoted; calling it again after success reports the same count.
    async fn complete_batch(&self, batch_number: i64) -> Result<usize>;
}
