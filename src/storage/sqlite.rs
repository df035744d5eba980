use super::{repo, TimeoutStorage, DEFAULT_PAGE_SIZE};
use crate::db::Pool;
use crate::model::{
    BatchInfo, BatchState, EndpointInfo, MigrationStatus, RunParameters, TimeoutData,
    TimeoutMarker, ToolState,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument, warn};

/// Legacy timeouts kept in a SQLite database. Endpoints are identified by the
/// owning-timeout-manager value of their untouched timeouts.
#[derive(Debug, Clone)]
pub struct SqliteTimeoutStorage {
    pool: Pool,
    page_size: usize,
}

impl SqliteTimeoutStorage {
    pub fn new(pool: Pool) -> Self {
        Self::with_page_size(pool, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(pool: Pool, page_size: usize) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Load legacy timeouts, e.g. when seeding a store.
    pub async fn insert_timeouts(&self, timeouts: &[TimeoutData]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for timeout in timeouts {
            repo::insert_timeout(&mut tx, timeout).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn marker_of(&self, timeout_id: &str) -> Result<Option<TimeoutMarker>> {
        let mut conn = self.pool.acquire().await?;
        repo::fetch_marker(&mut conn, timeout_id).await
    }

    pub async fn archived_migrations(&self, status: MigrationStatus) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        repo::count_archived(&mut conn, status).await
    }
}

/// Delete non-completed batches and reset their markers. The persisted state
/// decides, so a completed batch passed in by mistake is left alone.
async fn cleanup_batches(conn: &mut SqliteConnection, batches: &[BatchInfo]) -> Result<()> {
    for batch in batches {
        match repo::load_batch(conn, batch.number).await? {
            Some(BatchState::Completed) => {
                warn!(batch_number = batch.number, "not cleaning up completed batch");
                continue;
            }
            Some(_) => {
                let reset = repo::rewrite_markers(conn, &batch.timeout_ids, TimeoutMarker::reset).await?;
                repo::delete_batch(conn, batch.number).await?;
                debug!(batch_number = batch.number, reset, "batch cleaned up");
            }
            None => {
                // Orphaned ids of an already deleted batch still get their markers back.
                repo::rewrite_markers(conn, &batch.timeout_ids, TimeoutMarker::reset).await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl TimeoutStorage for SqliteTimeoutStorage {
    #[instrument(skip_all)]
    async fn try_load_ongoing_migration(&self) -> Result<Option<ToolState>> {
        let mut conn = self.pool.acquire().await?;
        let state = repo::load_tool_state(&mut conn).await?;
        Ok(state.filter(|s| s.status == MigrationStatus::StoragePrepared))
    }

    #[instrument(skip_all)]
    async fn list_endpoints(&self, cutoff: DateTime<Utc>) -> Result<Vec<EndpointInfo>> {
        let mut conn = self.pool.acquire().await?;
        repo::endpoint_summaries(&mut conn, cutoff).await
    }

    #[instrument(skip(self, run_parameters))]
    async fn prepare(
        &self,
        cutoff: DateTime<Utc>,
        endpoint_name: &str,
        run_parameters: &RunParameters,
    ) -> Result<ToolState> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = repo::load_tool_state(&mut tx).await? {
            if existing.has_staged_work() {
                bail!(
                    "migration for {} already has staged batches; resume it instead of preparing again",
                    existing.endpoint_name
                );
            }
            info!(
                endpoint = %existing.endpoint_name,
                batches = existing.batches.len(),
                "discarding unstaged batches of an earlier prepare"
            );
            cleanup_batches(&mut tx, &existing.batches).await?;
            repo::delete_tool_state(&mut tx).await?;
        }

        let ids = repo::eligible_timeout_ids(&mut tx, endpoint_name, cutoff).await?;
        let batches: Vec<BatchInfo> = ids
            .chunks(self.page_size)
            .enumerate()
            .map(|(i, chunk)| BatchInfo::pending(i as i64 + 1, chunk.to_vec()))
            .collect();

        for batch in &batches {
            repo::insert_batch(&mut tx, batch).await?;
            repo::rewrite_markers(&mut tx, &batch.timeout_ids, TimeoutMarker::begin).await?;
        }

        let state = ToolState {
            status: MigrationStatus::StoragePrepared,
            endpoint_name: endpoint_name.to_string(),
            run_parameters: run_parameters.clone(),
            batches,
            started_at: Utc::now(),
        };
        repo::insert_tool_state(&mut tx, &state).await?;
        tx.commit().await?;

        info!(
            endpoint = endpoint_name,
            batches = state.batches.len(),
            timeouts = ids.len(),
            "storage prepared"
        );
        Ok(state)
    }

    #[instrument(skip(self))]
    async fn read_batch(&self, batch_number: i64) -> Result<Vec<TimeoutData>> {
        let mut conn = self.pool.acquire().await?;
        repo::read_batch_timeouts(&mut conn, batch_number).await
    }

    #[instrument(skip(self))]
    async fn mark_batch_as_staged(&self, batch_number: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if repo::transition_batch(&mut conn, batch_number, BatchState::Pending, BatchState::Staged).await? {
            return Ok(());
        }
        match repo::load_batch(&mut conn, batch_number).await? {
            Some(BatchState::Staged) | Some(BatchState::Completed) => Ok(()),
            Some(BatchState::Pending) => Err(anyhow!("batch {} could not be marked staged", batch_number)),
            None => Err(anyhow!("batch {} not found", batch_number)),
        }
    }

    #[instrument(skip(self))]
    async fn mark_batch_as_completed(&self, batch_number: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match repo::load_batch(&mut tx, batch_number).await? {
            None => bail!("batch {} not found", batch_number),
            Some(BatchState::Pending) => {
                bail!("batch {} must be staged before it is completed", batch_number)
            }
            Some(BatchState::Completed) => return Ok(()),
            Some(BatchState::Staged) => {}
        }

        let ids = repo::batch_timeout_ids(&mut tx, batch_number).await?;
        repo::transition_batch(&mut tx, batch_number, BatchState::Staged, BatchState::Completed).await?;
        repo::rewrite_markers(&mut tx, &ids, TimeoutMarker::finish).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn complete(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(state) = repo::load_tool_state(&mut tx).await? else {
            return Ok(());
        };
        if let Some(open) = state.next_batch() {
            bail!(
                "cannot complete migration for {}: batch {} is {}",
                state.endpoint_name,
                open.number,
                open.state.as_str()
            );
        }
        let archive_id = repo::archive_tool_state(&mut tx, &state, MigrationStatus::Completed).await?;
        for batch in &state.batches {
            repo::delete_batch(&mut tx, batch.number).await?;
        }
        repo::delete_tool_state(&mut tx).await?;
        tx.commit().await?;
        info!(endpoint = %state.endpoint_name, %archive_id, "migration archived");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn abort(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(state) = repo::load_tool_state(&mut tx).await? else {
            return Ok(());
        };
        let (completed, open): (Vec<BatchInfo>, Vec<BatchInfo>) = state
            .batches
            .iter()
            .cloned()
            .partition(|b| b.state == BatchState::Completed);
        cleanup_batches(&mut tx, &open).await?;
        let archive_id = repo::archive_tool_state(&mut tx, &state, MigrationStatus::Aborted).await?;
        for batch in &completed {
            repo::delete_batch(&mut tx, batch.number).await?;
        }
        repo::delete_tool_state(&mut tx).await?;
        tx.commit().await?;
        info!(
            endpoint = %state.endpoint_name,
            %archive_id,
            reset_batches = open.len(),
            "migration aborted"
        );
        Ok(())
    }

    #[instrument(skip_all)]
    async fn cleanup_existing_batches_and_reset_timeouts(&self, batches: &[BatchInfo]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        cleanup_batches(&mut tx, batches).await?;
        tx.commit().await?;
        Ok(())
    }
}
