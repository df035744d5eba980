//! Drives a migration from the source store to the target transport.
//!
//! Endpoints are migrated one after another and, within an endpoint, batches in
//! ascending number. Every step is persisted by the storage before the next one
//! starts, so re-running after any failure continues from the last recorded step.
//! Running two migrations against the same store at once is not supported.
use crate::error::{BatchStep, EndpointProblems, MigrationError};
use crate::model::{
    BatchState, EndpointFilter, EndpointInfo, MigrationCheckResult, RunParameters, ToolState,
};
use crate::storage::TimeoutStorage;
use crate::target::{EndpointBatchMigrator, TimeoutsTarget};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Completed {
        endpoints: Vec<String>,
        elapsed: Duration,
    },
    /// No endpoint had eligible timeouts after filtering. Lists the endpoints
    /// that exist in storage but were filtered out.
    NothingToMigrate { filtered_out: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Preview {
    pub ongoing: Option<ToolState>,
    pub endpoints: Vec<(EndpointInfo, MigrationCheckResult)>,
}

pub struct MigrationRunner<S, T> {
    storage: S,
    target: T,
}

impl<S, T> MigrationRunner<S, T>
where
    S: TimeoutStorage,
    T: TimeoutsTarget,
{
    pub fn new(storage: S, target: T) -> Self {
        Self { storage, target }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    #[instrument(skip_all, fields(cutoff = %cutoff))]
    pub async fn run(
        &self,
        cutoff: DateTime<Utc>,
        filter: &EndpointFilter,
        run_parameters: &RunParameters,
    ) -> Result<MigrationOutcome, MigrationError> {
        let started = Instant::now();
        let mut migrated = Vec::new();

        if let Some(state) = self.storage.try_load_ongoing_migration().await? {
            guard_against_invalid_state(run_parameters, &state)?;
            info!(endpoint = %state.endpoint_name, "existing migration found; resuming");
            let endpoint = state.endpoint_name.clone();
            self.migrate_batches(state).await?;
            migrated.push(endpoint);

            if !filter.include_all_endpoints() {
                return Ok(self.finished(migrated, started));
            }
        }

        info!("listing the endpoints");
        let all_endpoints = self.storage.list_endpoints(cutoff).await?;
        let to_migrate: Vec<&EndpointInfo> = all_endpoints
            .iter()
            .filter(|e| e.nr_of_timeouts > 0 && filter.should_include(&e.endpoint_name))
            .collect();

        if to_migrate.is_empty() {
            if !migrated.is_empty() {
                return Ok(self.finished(migrated, started));
            }
            let names: Vec<String> = all_endpoints.iter().map(|e| e.endpoint_name.clone()).collect();
            if names.is_empty() {
                info!("no endpoints found in storage with timeouts that need migration");
            } else {
                info!(endpoints = %names.join(","), "none of the endpoints found matched the filter criteria");
            }
            return Ok(MigrationOutcome::NothingToMigrate {
                filtered_out: names,
            });
        }

        self.verify_all(&to_migrate).await?;

        for endpoint in to_migrate {
            info!(
                endpoint = %endpoint.endpoint_name,
                timeouts = endpoint.nr_of_timeouts,
                shortest = %endpoint.shortest_timeout,
                longest = %endpoint.longest_timeout,
                "starting migration"
            );
            let state = self
                .storage
                .prepare(cutoff, &endpoint.endpoint_name, run_parameters)
                .await?;
            info!(batches = state.batches.len(), "storage has been prepared for migration");
            self.migrate_batches(state).await?;
            migrated.push(endpoint.endpoint_name.clone());
        }

        Ok(self.finished(migrated, started))
    }

    /// Endpoints eligible at `cutoff` and whether the target accepts each of them.
    #[instrument(skip_all, fields(cutoff = %cutoff))]
    pub async fn preview(&self, cutoff: DateTime<Utc>) -> Result<Preview, MigrationError> {
        let ongoing = self.storage.try_load_ongoing_migration().await?;
        let mut endpoints = Vec::new();
        for endpoint in self.storage.list_endpoints(cutoff).await? {
            let check = self.target.able_to_migrate(&endpoint).await?;
            endpoints.push((endpoint, check));
        }
        Ok(Preview { ongoing, endpoints })
    }

    /// Abandon the ongoing migration. Staged batches may already be live at the
    /// target, so they are promoted and completed first; pending batches are
    /// returned to the legacy timeout manager. Returns `false` when there was
    /// nothing to abort.
    #[instrument(skip_all)]
    pub async fn abort(&self) -> Result<bool, MigrationError> {
        let Some(state) = self.storage.try_load_ongoing_migration().await? else {
            info!("no migration in progress");
            return Ok(false);
        };
        let endpoint = state.endpoint_name.as_str();
        info!(endpoint, "aborting migration");

        let mut staged: Vec<_> = state
            .batches
            .iter()
            .filter(|b| b.state == BatchState::Staged)
            .collect();
        if !staged.is_empty() {
            staged.sort_by_key(|b| b.number);
            let migrator = self.target.prepare_endpoint_migrator(endpoint).await?;
            for batch in staged {
                info!(endpoint, batch_number = batch.number, "finishing staged batch before abort");
                let completed = migrator.complete_batch(batch.number).await?;
                check_count(
                    endpoint,
                    batch.number,
                    BatchStep::Complete,
                    batch.number_of_timeouts,
                    completed,
                )?;
                self.storage.mark_batch_as_completed(batch.number).await?;
            }
        }

        self.target.abort(endpoint).await?;
        self.storage.abort().await?;
        Ok(true)
    }

    async fn verify_all(&self, endpoints: &[&EndpointInfo]) -> Result<(), MigrationError> {
        let mut problematic = Vec::new();
        for endpoint in endpoints {
            info!(endpoint = %endpoint.endpoint_name, "verifying that timeouts can be migrated");
            let check = self.target.able_to_migrate(endpoint).await?;
            if check.can_migrate() {
                info!(
                    endpoint = %endpoint.endpoint_name,
                    timeouts = endpoint.nr_of_timeouts,
                    "timeouts are eligible to migrate"
                );
            } else {
                problematic.push(EndpointProblems {
                    endpoint_name: endpoint.endpoint_name.clone(),
                    problems: check.problems,
                });
            }
        }
        if problematic.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::PreflightFailed(problematic))
        }
    }

    async fn migrate_batches(&self, state: ToolState) -> Result<(), MigrationError> {
        let endpoint = state.endpoint_name.as_str();
        let migrator = self.target.prepare_endpoint_migrator(endpoint).await?;

        let mut batches: Vec<_> = state
            .batches
            .iter()
            .filter(|b| b.state != BatchState::Completed)
            .collect();
        batches.sort_by_key(|b| b.number);

        for batch in batches {
            let expected = batch.number_of_timeouts;
            info!(endpoint, batch_number = batch.number, "migrating batch");

            if batch.state == BatchState::Pending {
                debug!(batch_number = batch.number, "reading batch");
                let timeouts = self.storage.read_batch(batch.number).await?;
                check_count(endpoint, batch.number, BatchStep::Read, expected, timeouts.len())?;

                debug!(batch_number = batch.number, "staging batch");
                let staged = migrator.stage_batch(batch.number, &timeouts).await?;
                check_count(endpoint, batch.number, BatchStep::Stage, expected, staged)?;
                self.storage.mark_batch_as_staged(batch.number).await?;
            }

            debug!(batch_number = batch.number, "moving batch from staging to destination");
            let completed = migrator.complete_batch(batch.number).await?;
            check_count(endpoint, batch.number, BatchStep::Complete, expected, completed)?;
            self.storage.mark_batch_as_completed(batch.number).await?;
            debug!(batch_number = batch.number, "batch fully migrated");
        }

        self.target.complete(endpoint).await?;
        self.storage.complete().await?;
        info!(endpoint, timeouts = state.number_of_timeouts(), "endpoint migrated");
        Ok(())
    }

    fn finished(&self, endpoints: Vec<String>, started: Instant) -> MigrationOutcome {
        let elapsed = started.elapsed();
        info!(elapsed = %format_elapsed(elapsed), "migration completed successfully");
        MigrationOutcome::Completed { endpoints, elapsed }
    }
}

fn guard_against_invalid_state(
    requested: &RunParameters,
    state: &ToolState,
) -> Result<(), MigrationError> {
    if requested.matches(&state.run_parameters) {
        info!("resuming in progress migration");
        return Ok(());
    }
    Err(MigrationError::RunParametersMismatch {
        endpoint: state.endpoint_name.clone(),
        persisted: state.run_parameters.clone(),
        requested: requested.clone(),
    })
}

fn check_count(
    endpoint: &str,
    batch_number: i64,
    step: BatchStep,
    expected: usize,
    actual: usize,
) -> Result<(), MigrationError> {
    if expected == actual {
        return Ok(());
    }
    Err(MigrationError::CountMismatch {
        endpoint: endpoint.to_string(),
        batch_number,
        step,
        expected,
        actual,
    })
}

/// `hh:mm:ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
