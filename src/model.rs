use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Pending,
    Staged,
    Completed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Staged => "STAGED",
            BatchState::Completed => "COMPLETED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BatchState::Pending),
            "STAGED" => Some(BatchState::Staged),
            "COMPLETED" => Some(BatchState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationStatus {
    NeverRun,
    StoragePrepared,
    Completed,
    Aborted,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::NeverRun => "NEVER_RUN",
            MigrationStatus::StoragePrepared => "STORAGE_PREPARED",
            MigrationStatus::Completed => "COMPLETED",
            MigrationStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "NEVER_RUN" => Some(MigrationStatus::NeverRun),
            "STORAGE_PREPARED" => Some(MigrationStatus::StoragePrepared),
            "COMPLETED" => Some(MigrationStatus::Completed),
            "ABORTED" => Some(MigrationStatus::Aborted),
            _ => None,
        }
    }
}

/// Migration phase of a single timeout, carried on the wire inside the
/// owning-timeout-manager field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeoutMarker {
    Untouched(String),
    MigrationOngoing(String),
    MigrationDone(String),
}

impl TimeoutMarker {
    pub const ONGOING_PREFIX: &'static str = "migration-ongoing:";
    pub const DONE_PREFIX: &'static str = "migration-done:";

    pub fn from_wire(raw: &str) -> Self {
        if let Some(owner) = raw.strip_prefix(Self::ONGOING_PREFIX) {
            TimeoutMarker::MigrationOngoing(owner.to_string())
        } else if let Some(owner) = raw.strip_prefix(Self::DONE_PREFIX) {
            TimeoutMarker::MigrationDone(owner.to_string())
        } else {
            TimeoutMarker::Untouched(raw.to_string())
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            TimeoutMarker::Untouched(owner) => owner.clone(),
            TimeoutMarker::MigrationOngoing(owner) => format!("{}{}", Self::ONGOING_PREFIX, owner),
            TimeoutMarker::MigrationDone(owner) => format!("{}{}", Self::DONE_PREFIX, owner),
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            TimeoutMarker::Untouched(owner)
            | TimeoutMarker::MigrationOngoing(owner)
            | TimeoutMarker::MigrationDone(owner) => owner,
        }
    }

    /// Untouched -> ongoing. Other states are returned unchanged.
    pub fn begin(self) -> Self {
        match self {
            TimeoutMarker::Untouched(owner) => TimeoutMarker::MigrationOngoing(owner),
            other => other,
        }
    }

    /// Ongoing -> done. Other states are returned unchanged.
    pub fn finish(self) -> Self {
        match self {
            TimeoutMarker::MigrationOngoing(owner) => TimeoutMarker::MigrationDone(owner),
            other => other,
        }
    }

    /// Ongoing -> untouched. A done marker is never reset.
    pub fn reset(self) -> Self {
        match self {
            TimeoutMarker::MigrationOngoing(owner) => TimeoutMarker::Untouched(owner),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutData {
    pub id: String,
    pub destination: String,
    pub saga_id: Uuid,
    pub owning_timeout_manager: String,
    pub time: DateTime<Utc>,
    pub headers: HashMap<String, String>,
    pub state: Vec<u8>,
}

impl TimeoutData {
    pub fn marker(&self) -> TimeoutMarker {
        TimeoutMarker::from_wire(&self.owning_timeout_manager)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointInfo {
    pub endpoint_name: String,
    pub nr_of_timeouts: usize,
    pub shortest_timeout: DateTime<Utc>,
    pub longest_timeout: DateTime<Utc>,
    pub destinations: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchInfo {
    pub number: i64,
    pub state: BatchState,
    pub timeout_ids: Vec<String>,
    /// Count recorded when the batch was created; reads are checked against it.
    pub number_of_timeouts: usize,
}

impl BatchInfo {
    pub fn pending(number: i64, timeout_ids: Vec<String>) -> Self {
        Self {
            number,
            state: BatchState::Pending,
            number_of_timeouts: timeout_ids.len(),
            timeout_ids,
        }
    }
}

/// Option name -> value used to start a migration. Values compare
/// case-insensitively, keys exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunParameters(BTreeMap<String, String>);

impl RunParameters {
    pub const CUTOFF_TIME: &'static str = "cutoff-time";
    pub const SOURCE: &'static str = "source";
    pub const TARGET: &'static str = "target";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, other: &RunParameters) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().all(|(key, value)| {
                other
                    .0
                    .get(key)
                    .is_some_and(|o| o.to_lowercase() == value.to_lowercase())
            })
    }
}

impl FromIterator<(String, String)> for RunParameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The singleton progress record of an in-progress migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolState {
    pub status: MigrationStatus,
    pub endpoint_name: String,
    pub run_parameters: RunParameters,
    pub batches: Vec<BatchInfo>,
    pub started_at: DateTime<Utc>,
}

impl ToolState {
    pub fn number_of_timeouts(&self) -> usize {
        self.batches.iter().map(|b| b.number_of_timeouts).sum()
    }

    /// Lowest-numbered batch that has not reached `Completed`.
    pub fn next_batch(&self) -> Option<&BatchInfo> {
        self.batches
            .iter()
            .filter(|b| b.state != BatchState::Completed)
            .min_by_key(|b| b.number)
    }

    pub fn has_staged_work(&self) -> bool {
        self.batches.iter().any(|b| b.state != BatchState::Pending)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationCheckResult {
    pub problems: Vec<String>,
}

impl MigrationCheckResult {
    pub fn can_migrate(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointFilter {
    All,
    Only(Vec<String>),
}

impl EndpointFilter {
    pub fn include_all_endpoints(&self) -> bool {
        matches!(self, EndpointFilter::All)
    }

    pub fn should_include(&self, endpoint_name: &str) -> bool {
        match self {
            EndpointFilter::All => true,
            EndpointFilter::Only(names) => names.iter().any(|n| n == endpoint_name),
        }
    }
}
