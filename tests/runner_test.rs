use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use timeout_migrator::error::BatchStep;
use timeout_migrator::model::{
    BatchInfo, BatchState, EndpointFilter, EndpointInfo, MigrationCheckResult, MigrationStatus,
    RunParameters, TimeoutData, ToolState,
};
use timeout_migrator::storage::TimeoutStorage;
use timeout_migrator::target::{EndpointBatchMigrator, TimeoutsTarget};
use timeout_migrator::{MigrationError, MigrationOutcome, MigrationRunner};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared state behind the recording storage and target, so a single journal
/// shows the order in which the runner touched both sides.
#[derive(Default)]
struct World {
    journal: Vec<String>,
    fail_once: Option<String>,

    timeouts: BTreeMap<String, Vec<TimeoutData>>,
    marked: HashSet<String>,
    page_size: usize,
    state: Option<ToolState>,
    archived: Vec<MigrationStatus>,
    short_read: bool,

    problems: HashMap<String, Vec<String>>,
    staging: BTreeMap<(String, i64), Vec<String>>,
    promoted: BTreeMap<(String, i64), usize>,
    delivered: Vec<String>,
    short_stage: bool,
    short_complete: bool,
}

impl World {
    fn record(&mut self, call: String) -> Result<()> {
        self.journal.push(call.clone());
        if self.fail_once.as_deref() == Some(call.as_str()) {
            self.fail_once = None;
            bail!("injected failure at {}", call);
        }
        Ok(())
    }

    fn batch_mut(&mut self, number: i64) -> Result<&mut BatchInfo> {
        self.state
            .as_mut()
            .and_then(|s| s.batches.iter_mut().find(|b| b.number == number))
            .ok_or_else(|| anyhow!("batch {} not found", number))
    }
}

type Shared = Arc<Mutex<World>>;

#[derive(Clone)]
struct RecordingStorage(Shared);

#[derive(Clone)]
struct RecordingTarget(Shared);

struct RecordingMigrator {
    world: Shared,
    endpoint: String,
}

#[async_trait::async_trait]
impl TimeoutStorage for RecordingStorage {
    async fn try_load_ongoing_migration(&self) -> Result<Option<ToolState>> {
        let mut w = self.0.lock().await;
        w.record("load".into())?;
        Ok(w.state.clone())
    }

    async fn list_endpoints(&self, cutoff: DateTime<Utc>) -> Result<Vec<EndpointInfo>> {
        let mut w = self.0.lock().await;
        w.record("list".into())?;
        let mut endpoints = Vec::new();
        for (name, timeouts) in &w.timeouts {
            let eligible: Vec<&TimeoutData> = timeouts
                .iter()
                .filter(|t| !w.marked.contains(&t.id) && t.time <= cutoff)
                .collect();
            if eligible.is_empty() {
                continue;
            }
            endpoints.push(EndpointInfo {
                endpoint_name: name.clone(),
                nr_of_timeouts: eligible.len(),
                shortest_timeout: eligible.iter().map(|t| t.time).min().unwrap(),
                longest_timeout: eligible.iter().map(|t| t.time).max().unwrap(),
                destinations: eligible.iter().map(|t| t.destination.clone()).collect(),
            });
        }
        Ok(endpoints)
    }

    async fn prepare(
        &self,
        cutoff: DateTime<Utc>,
        endpoint_name: &str,
        run_parameters: &RunParameters,
    ) -> Result<ToolState> {
        let mut w = self.0.lock().await;
        w.record(format!("prepare {}", endpoint_name))?;
        let mut ids: Vec<String> = w
            .timeouts
            .get(endpoint_name)
            .into_iter()
            .flatten()
            .filter(|t| !w.marked.contains(&t.id) && t.time <= cutoff)
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        let batches: Vec<BatchInfo> = ids
            .chunks(w.page_size)
            .enumerate()
            .map(|(i, chunk)| BatchInfo::pending(i as i64 + 1, chunk.to_vec()))
            .collect();
        w.marked.extend(ids);
        let state = ToolState {
            status: MigrationStatus::StoragePrepared,
            endpoint_name: endpoint_name.to_string(),
            run_parameters: run_parameters.clone(),
            batches,
            started_at: Utc::now(),
        };
        w.state = Some(state.clone());
        Ok(state)
    }

    async fn read_batch(&self, batch_number: i64) -> Result<Vec<TimeoutData>> {
        let mut w = self.0.lock().await;
        w.record(format!("read {}", batch_number))?;
        let ids = w.batch_mut(batch_number)?.timeout_ids.clone();
        let mut read: Vec<TimeoutData> = w
            .timeouts
            .values()
            .flatten()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect();
        if w.short_read {
            read.pop();
        }
        Ok(read)
    }

    async fn mark_batch_as_staged(&self, batch_number: i64) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record(format!("mark_staged {}", batch_number))?;
        let batch = w.batch_mut(batch_number)?;
        if batch.state == BatchState::Pending {
            batch.state = BatchState::Staged;
        }
        Ok(())
    }

    async fn mark_batch_as_completed(&self, batch_number: i64) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record(format!("mark_completed {}", batch_number))?;
        w.batch_mut(batch_number)?.state = BatchState::Completed;
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record("storage.complete".into())?;
        w.state = None;
        w.archived.push(MigrationStatus::Completed);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record("storage.abort".into())?;
        if let Some(state) = w.state.take() {
            for batch in state.batches.iter().filter(|b| b.state != BatchState::Completed) {
                for id in &batch.timeout_ids {
                    w.marked.remove(id);
                }
            }
            w.archived.push(MigrationStatus::Aborted);
        }
        Ok(())
    }

    async fn cleanup_existing_batches_and_reset_timeouts(&self, batches: &[BatchInfo]) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record("cleanup".into())?;
        for batch in batches {
            for id in &batch.timeout_ids {
                w.marked.remove(id);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TimeoutsTarget for RecordingTarget {
    type Migrator = RecordingMigrator;

    async fn able_to_migrate(&self, endpoint: &EndpointInfo) -> Result<MigrationCheckResult> {
        let mut w = self.0.lock().await;
        w.record(format!("check {}", endpoint.endpoint_name))?;
        Ok(MigrationCheckResult {
            problems: w.problems.get(&endpoint.endpoint_name).cloned().unwrap_or_default(),
        })
    }

    async fn prepare_endpoint_migrator(&self, endpoint_name: &str) -> Result<RecordingMigrator> {
        self.0.lock().await.record(format!("migrator {}", endpoint_name))?;
        Ok(RecordingMigrator {
            world: self.0.clone(),
            endpoint: endpoint_name.to_string(),
        })
    }

    async fn abort(&self, endpoint_name: &str) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record(format!("target.abort {}", endpoint_name))?;
        w.staging.retain(|(ep, _), _| ep != endpoint_name);
        w.promoted.retain(|(ep, _), _| ep != endpoint_name);
        Ok(())
    }

    async fn complete(&self, endpoint_name: &str) -> Result<()> {
        let mut w = self.0.lock().await;
        w.record(format!("target.complete {}", endpoint_name))?;
        if w.staging.keys().any(|(ep, _)| ep == endpoint_name) {
            bail!("staging of {} is not empty", endpoint_name);
        }
        w.promoted.retain(|(ep, _), _| ep != endpoint_name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl EndpointBatchMigrator for RecordingMigrator {
    async fn stage_batch(&self, batch_number: i64, timeouts: &[TimeoutData]) -> Result<usize> {
        let mut w = self.world.lock().await;
        w.record(format!("stage {} {}", self.endpoint, batch_number))?;
        let mut ids: Vec<String> = timeouts.iter().map(|t| t.id.clone()).collect();
        if w.short_stage {
            ids.pop();
        }
        let staged = ids.len();
        w.staging.insert((self.endpoint.clone(), batch_number), ids);
        Ok(staged)
    }

    async fn complete_batch(&self, batch_number: i64) -> Result<usize> {
        let mut w = self.world.lock().await;
        w.record(format!("complete_batch {} {}", self.endpoint, batch_number))?;
        let key = (self.endpoint.clone(), batch_number);
        if let Some(count) = w.promoted.get(&key) {
            return Ok(*count);
        }
        let ids = w.staging.remove(&key).unwrap_or_default();
        let count = ids.len();
        w.delivered.extend(ids);
        w.promoted.insert(key, count);
        if w.short_complete {
            return Ok(count.saturating_sub(1));
        }
        Ok(count)
    }
}

fn cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn params() -> RunParameters {
    RunParameters::new()
        .with(RunParameters::CUTOFF_TIME, cutoff().to_rfc3339())
        .with(RunParameters::SOURCE, "sqlite://timeouts.db")
        .with(RunParameters::TARGET, "sqlite://transport.db")
}

fn timeout(id: &str, owner: &str, time: DateTime<Utc>) -> TimeoutData {
    TimeoutData {
        id: id.to_string(),
        destination: format!("{}.Handler", owner),
        saga_id: Uuid::new_v4(),
        owning_timeout_manager: owner.to_string(),
        time,
        headers: HashMap::new(),
        state: vec![1, 2, 3],
    }
}

/// Sales: 5 timeouts (3 batches of 2), Billing: 1 timeout.
fn world() -> Shared {
    let due = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
    let mut w = World {
        page_size: 2,
        ..Default::default()
    };
    w.timeouts.insert(
        "Sales".into(),
        (1..=5)
            .map(|i| timeout(&format!("s{}", i), "Sales", due + Duration::minutes(i)))
            .collect(),
    );
    w.timeouts.insert("Billing".into(), vec![timeout("b1", "Billing", due)]);
    Arc::new(Mutex::new(w))
}

fn runner(world: &Shared) -> MigrationRunner<RecordingStorage, RecordingTarget> {
    MigrationRunner::new(RecordingStorage(world.clone()), RecordingTarget(world.clone()))
}

fn position(journal: &[String], call: &str) -> usize {
    journal
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{} not in journal {:?}", call, journal))
}

fn assert_delivered_once(delivered: &[String], expected: usize) {
    let unique: BTreeSet<&String> = delivered.iter().collect();
    assert_eq!(unique.len(), delivered.len(), "duplicates in {:?}", delivered);
    assert_eq!(delivered.len(), expected);
}

#[tokio::test]
async fn migrates_every_endpoint_batch_by_batch() {
    let world = world();
    let outcome = runner(&world)
        .run(cutoff(), &EndpointFilter::All, &params())
        .await
        .unwrap();

    match outcome {
        MigrationOutcome::Completed { endpoints, .. } => {
            assert_eq!(endpoints, vec!["Billing".to_string(), "Sales".to_string()])
        }
        other => panic!("unexpected {:?}", other),
    }

    let w = world.lock().await;
    assert_delivered_once(&w.delivered, 6);
    assert!(w.state.is_none());
    assert!(w.staging.is_empty());
    assert_eq!(w.archived, vec![MigrationStatus::Completed, MigrationStatus::Completed]);

    // Batches in order, each staged then marked before promotion.
    let j = &w.journal[position(&w.journal, "prepare Sales")..];
    assert!(position(j, "stage Sales 1") < position(j, "mark_staged 1"));
    assert!(position(j, "complete_batch Sales 3") < position(j, "mark_completed 3"));
    assert!(position(j, "mark_completed 1") < position(j, "stage Sales 2"));
    assert!(position(j, "mark_completed 3") < position(j, "target.complete Sales"));
    let last_storage_complete = j.iter().rposition(|c| c == "storage.complete").unwrap();
    assert!(position(j, "target.complete Sales") < last_storage_complete);
}

#[tokio::test]
async fn preflight_failure_on_one_endpoint_migrates_nothing() {
    let world = world();
    world
        .lock()
        .await
        .problems
        .insert("Billing".into(), vec!["Target delayed delivery table Billing.Delayed does not exist.".into()]);

    let err = runner(&world)
        .run(cutoff(), &EndpointFilter::All, &params())
        .await
        .unwrap_err();

    match err {
        MigrationError::PreflightFailed(endpoints) => {
            assert_eq!(endpoints.len(), 1);
            assert_eq!(endpoints[0].endpoint_name, "Billing");
        }
        other => panic!("unexpected {:?}", other),
    }
    let w = world.lock().await;
    assert!(w.journal.iter().any(|c| c == "check Sales"));
    assert!(!w.journal.iter().any(|c| c.starts_with("prepare")));
    assert!(w.delivered.is_empty());
}

#[tokio::test]
async fn mismatched_parameters_are_rejected_before_any_change() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("mark_staged 2".into());
    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();

    let before = {
        let mut w = world.lock().await;
        w.journal.clear();
        w.state.clone()
    };

    let other = params().with(RunParameters::CUTOFF_TIME, "2031-01-01T00:00:00+00:00");
    let err = r
        .run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &other)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::RunParametersMismatch { ref endpoint, .. } if endpoint == "Sales"));
    assert!(err.to_string().contains("abort"));

    let w = world.lock().await;
    assert_eq!(w.journal, vec!["load".to_string()]);
    assert_eq!(w.state, before);
}

#[tokio::test]
async fn parameter_values_match_regardless_of_case() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("read 2".into());
    r.run(cutoff(), &EndpointFilter::All, &params()).await.unwrap_err();

    let shouting = params().with(RunParameters::SOURCE, "SQLITE://TIMEOUTS.DB");
    r.run(cutoff(), &EndpointFilter::All, &shouting).await.unwrap();
    assert_delivered_once(&world.lock().await.delivered, 6);
}

#[tokio::test]
async fn resumes_after_failure_between_staging_and_marking() {
    let world = world();
    let r = runner(&world);
    let filter = EndpointFilter::Only(vec!["Sales".into()]);
    world.lock().await.fail_once = Some("mark_staged 2".into());

    r.run(cutoff(), &filter, &params()).await.unwrap_err();
    {
        let w = world.lock().await;
        let state = w.state.as_ref().unwrap();
        assert_eq!(state.batches[0].state, BatchState::Completed);
        assert_eq!(state.batches[1].state, BatchState::Pending);
        assert!(w.staging.contains_key(&("Sales".to_string(), 2)));
    }

    r.run(cutoff(), &filter, &params()).await.unwrap();
    let w = world.lock().await;
    assert_delivered_once(&w.delivered, 5);
    assert!(w.state.is_none());
    assert_eq!(w.journal.iter().filter(|c| *c == "stage Sales 2").count(), 2);
    assert_eq!(w.journal.iter().filter(|c| *c == "stage Sales 1").count(), 1);
}

#[tokio::test]
async fn resumes_after_failure_between_promotion_and_marking() {
    let world = world();
    let r = runner(&world);
    let filter = EndpointFilter::Only(vec!["Sales".into()]);
    world.lock().await.fail_once = Some("mark_completed 1".into());

    r.run(cutoff(), &filter, &params()).await.unwrap_err();
    assert_eq!(world.lock().await.state.as_ref().unwrap().batches[0].state, BatchState::Staged);

    r.run(cutoff(), &filter, &params()).await.unwrap();
    let w = world.lock().await;
    assert_delivered_once(&w.delivered, 5);
    // The staged batch is promoted again without being read or staged again.
    assert_eq!(w.journal.iter().filter(|c| *c == "read 1").count(), 1);
    assert_eq!(w.journal.iter().filter(|c| *c == "complete_batch Sales 1").count(), 2);
}

#[tokio::test]
async fn resumes_after_failure_before_storage_completion() {
    let world = world();
    let r = runner(&world);
    let filter = EndpointFilter::Only(vec!["Sales".into()]);
    world.lock().await.fail_once = Some("storage.complete".into());

    r.run(cutoff(), &filter, &params()).await.unwrap_err();
    assert!(world.lock().await.state.is_some());

    r.run(cutoff(), &filter, &params()).await.unwrap();
    let w = world.lock().await;
    assert!(w.state.is_none());
    assert_delivered_once(&w.delivered, 5);
    assert_eq!(w.archived, vec![MigrationStatus::Completed]);
}

#[tokio::test]
async fn resume_with_endpoint_filter_stops_after_resumed_endpoint() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("read 3".into());
    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();
    world.lock().await.journal.clear();

    let outcome = r
        .run(cutoff(), &EndpointFilter::Only(vec!["Billing".into()]), &params())
        .await
        .unwrap();
    match outcome {
        MigrationOutcome::Completed { endpoints, .. } => assert_eq!(endpoints, vec!["Sales".to_string()]),
        other => panic!("unexpected {:?}", other),
    }
    let w = world.lock().await;
    assert!(!w.journal.iter().any(|c| c == "list"));
    assert!(!w.delivered.contains(&"b1".to_string()));
}

#[tokio::test]
async fn resume_with_all_endpoints_continues_with_the_rest() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("read 2".into());
    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();

    let outcome = r.run(cutoff(), &EndpointFilter::All, &params()).await.unwrap();
    match outcome {
        MigrationOutcome::Completed { endpoints, .. } => {
            assert_eq!(endpoints, vec!["Sales".to_string(), "Billing".to_string()])
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_delivered_once(&world.lock().await.delivered, 6);
}

#[tokio::test]
async fn short_read_stops_before_staging() {
    let world = world();
    world.lock().await.short_read = true;
    let err = runner(&world)
        .run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();
    match err {
        MigrationError::CountMismatch { step, batch_number, expected, actual, .. } => {
            assert_eq!(step, BatchStep::Read);
            assert_eq!((batch_number, expected, actual), (1, 2, 1));
        }
        other => panic!("unexpected {:?}", other),
    }
    let w = world.lock().await;
    assert!(!w.journal.iter().any(|c| c.starts_with("stage")));
}

#[tokio::test]
async fn short_stage_stops_before_marking() {
    let world = world();
    world.lock().await.short_stage = true;
    let err = runner(&world)
        .run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::CountMismatch { step: BatchStep::Stage, .. }));
    let w = world.lock().await;
    assert!(!w.journal.iter().any(|c| c.starts_with("mark_staged")));
    assert_eq!(w.state.as_ref().unwrap().batches[0].state, BatchState::Pending);
}

#[tokio::test]
async fn short_promotion_leaves_batch_staged() {
    let world = world();
    world.lock().await.short_complete = true;
    let err = runner(&world)
        .run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();
    match err {
        MigrationError::CountMismatch { step, batch_number, expected, actual, .. } => {
            assert_eq!(step, BatchStep::Complete);
            assert_eq!((batch_number, expected, actual), (1, 2, 1));
        }
        other => panic!("unexpected {:?}", other),
    }
    let w = world.lock().await;
    assert!(w.journal.iter().any(|c| c == "mark_staged 1"));
    assert!(!w.journal.iter().any(|c| c.starts_with("mark_completed")));
    assert_eq!(w.state.as_ref().unwrap().batches[0].state, BatchState::Staged);
}

#[tokio::test]
async fn nothing_to_migrate_lists_filtered_out_endpoints() {
    let world = world();
    let outcome = runner(&world)
        .run(cutoff(), &EndpointFilter::Only(vec!["Shipping".into()]), &params())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MigrationOutcome::NothingToMigrate {
            filtered_out: vec!["Billing".to_string(), "Sales".to_string()]
        }
    );
    let w = world.lock().await;
    assert!(!w.journal.iter().any(|c| c.starts_with("check")));
}

#[tokio::test]
async fn nothing_due_before_cutoff() {
    let world = world();
    let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let outcome = runner(&world)
        .run(early, &EndpointFilter::All, &params())
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::NothingToMigrate { filtered_out: vec![] });
}

#[tokio::test]
async fn abort_drops_target_staging_before_resetting_storage() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("mark_staged 2".into());
    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();

    assert!(r.abort().await.unwrap());
    {
        let w = world.lock().await;
        assert!(position(&w.journal, "target.abort Sales") < position(&w.journal, "storage.abort"));
        assert!(w.state.is_none());
        assert!(w.staging.is_empty());
        assert_eq!(w.archived, vec![MigrationStatus::Aborted]);
    }

    // The completed batch stays migrated; the rest is eligible again.
    let listed = r.storage().list_endpoints(cutoff()).await.unwrap();
    let sales = listed.iter().find(|e| e.endpoint_name == "Sales").unwrap();
    assert_eq!(sales.nr_of_timeouts, 3);

    assert!(!r.abort().await.unwrap());
}

#[tokio::test]
async fn abort_completes_staged_batches_instead_of_resetting_them() {
    let world = world();
    let r = runner(&world);
    world.lock().await.fail_once = Some("mark_completed 2".into());
    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap_err();
    assert_eq!(world.lock().await.state.as_ref().unwrap().batches[1].state, BatchState::Staged);
    world.lock().await.journal.clear();

    assert!(r.abort().await.unwrap());
    {
        let w = world.lock().await;
        let j = &w.journal;
        assert!(position(j, "complete_batch Sales 2") < position(j, "mark_completed 2"));
        assert!(position(j, "mark_completed 2") < position(j, "target.abort Sales"));
        assert!(position(j, "target.abort Sales") < position(j, "storage.abort"));
        assert!(!j.iter().any(|c| c == "complete_batch Sales 3"));
        assert_delivered_once(&w.delivered, 4);
    }

    // Only the never-staged batch is handed back.
    let listed = r.storage().list_endpoints(cutoff()).await.unwrap();
    let sales = listed.iter().find(|e| e.endpoint_name == "Sales").unwrap();
    assert_eq!(sales.nr_of_timeouts, 1);

    r.run(cutoff(), &EndpointFilter::Only(vec!["Sales".into()]), &params())
        .await
        .unwrap();
    assert_delivered_once(&world.lock().await.delivered, 5);
}

#[tokio::test]
async fn preview_reports_checks_without_migrating() {
    let world = world();
    world
        .lock()
        .await
        .problems
        .insert("Sales".into(), vec!["too far away".into()]);

    let preview = runner(&world).preview(cutoff()).await.unwrap();
    assert!(preview.ongoing.is_none());
    assert_eq!(preview.endpoints.len(), 2);
    let (sales, check) = preview
        .endpoints
        .iter()
        .find(|(e, _)| e.endpoint_name == "Sales")
        .unwrap();
    assert_eq!(sales.nr_of_timeouts, 5);
    assert!(!check.can_migrate());

    let w = world.lock().await;
    assert!(!w.journal.iter().any(|c| c.starts_with("prepare")));
}
