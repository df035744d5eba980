use crate::model::{
    BatchInfo, BatchState, EndpointInfo, MigrationStatus, RunParameters, TimeoutData,
    TimeoutMarker, ToolState,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::instrument;
use uuid::Uuid;

#[instrument(skip_all)]
pub async fn load_tool_state(conn: &mut SqliteConnection) -> Result<Option<ToolState>> {
    let row = sqlx::query(
        "SELECT status, endpoint_name, run_parameters, started_at FROM migration_tool_state WHERE id = 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let status_str: String = row.get("status");
    let status = MigrationStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("tool state has unknown status {}", status_str))?;
    let params_json: String = row.get("run_parameters");
    let run_parameters: RunParameters =
        serde_json::from_str(&params_json).context("tool state has malformed run parameters")?;

    Ok(Some(ToolState {
        status,
        endpoint_name: row.get("endpoint_name"),
        run_parameters,
        batches: load_batches(conn).await?,
        started_at: row.get("started_at"),
    }))
}

async fn load_batches(conn: &mut SqliteConnection) -> Result<Vec<BatchInfo>> {
    let rows = sqlx::query(
        "SELECT batch_number, state, number_of_timeouts FROM migration_batches ORDER BY batch_number",
    )
        .fetch_all(&mut *conn)
        .await?;
    let mut batches = Vec::with_capacity(rows.len());
    for row in rows {
        let number: i64 = row.get("batch_number");
        let state_str: String = row.get("state");
        let state = BatchState::parse_state(&state_str)
            .ok_or_else(|| anyhow!("batch {} has unknown state {}", number, state_str))?;
        let declared: i64 = row.get("number_of_timeouts");
        batches.push(BatchInfo {
            number,
            state,
            timeout_ids: Vec::new(),
            number_of_timeouts: declared as usize,
        });
    }

    let mut ids = sqlx::query(
        "SELECT batch_number, timeout_id FROM migration_batch_timeouts ORDER BY batch_number, timeout_id",
    )
    .fetch(&mut *conn);
    let mut by_batch: HashMap<i64, Vec<String>> = HashMap::new();
    while let Some(row) = ids.try_next().await? {
        by_batch
            .entry(row.get("batch_number"))
            .or_default()
            .push(row.get("timeout_id"));
    }
    for batch in &mut batches {
        batch.timeout_ids = by_batch.remove(&batch.number).unwrap_or_default();
    }
    Ok(batches)
}

#[instrument(skip_all)]
pub async fn load_batch(conn: &mut SqliteConnection, batch_number: i64) -> Result<Option<BatchState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM migration_batches WHERE batch_number = ?")
            .bind(batch_number)
            .fetch_optional(&mut *conn)
            .await?;
    state
        .map(|s| {
            BatchState::parse_state(&s)
                .ok_or_else(|| anyhow!("batch {} has unknown state {}", batch_number, s))
        })
        .transpose()
}

#[instrument(skip_all)]
pub async fn insert_tool_state(conn: &mut SqliteConnection, state: &ToolState) -> Result<()> {
    sqlx::query(
        "INSERT INTO migration_tool_state (id, status, endpoint_name, run_parameters, started_at) VALUES (1, ?, ?, ?, ?)",
    )
    .bind(state.status.as_str())
    .bind(&state.endpoint_name)
    .bind(serde_json::to_string(&state.run_parameters)?)
    .bind(state.started_at)
    .execute(&mut *conn)
    .await
    .context("failed to persist tool state")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_tool_state(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM migration_tool_state WHERE id = 1")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Copy the tool state into the archive under a new id and return that id.
#[instrument(skip_all)]
pub async fn archive_tool_state(
    conn: &mut SqliteConnection,
    state: &ToolState,
    status: MigrationStatus,
) -> Result<String> {
    let id = format!("tool-state-{}", Uuid::new_v4());
    let summary: Vec<(i64, &'static str, usize)> = state
        .batches
        .iter()
        .map(|b| (b.number, b.state.as_str(), b.number_of_timeouts))
        .collect();
    sqlx::query(
        "INSERT INTO migration_tool_state_archive (id, status, endpoint_name, run_parameters, batches, started_at, archived_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(status.as_str())
    .bind(&state.endpoint_name)
    .bind(serde_json::to_string(&state.run_parameters)?)
    .bind(serde_json::to_string(&summary)?)
    .bind(state.started_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .context("failed to archive tool state")?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_batch(conn: &mut SqliteConnection, batch: &BatchInfo) -> Result<()> {
    sqlx::query("INSERT INTO migration_batches (batch_number, state, number_of_timeouts) VALUES (?, ?, ?)")
        .bind(batch.number)
        .bind(batch.state.as_str())
        .bind(batch.number_of_timeouts as i64)
        .execute(&mut *conn)
        .await?;
    for id in &batch.timeout_ids {
        sqlx::query("INSERT INTO migration_batch_timeouts (batch_number, timeout_id) VALUES (?, ?)")
            .bind(batch.number)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn batch_timeout_ids(conn: &mut SqliteConnection, batch_number: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT timeout_id FROM migration_batch_timeouts WHERE batch_number = ? ORDER BY timeout_id",
    )
    .bind(batch_number)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn delete_batch(conn: &mut SqliteConnection, batch_number: i64) -> Result<()> {
    sqlx::query("DELETE FROM migration_batch_timeouts WHERE batch_number = ?")
        .bind(batch_number)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM migration_batches WHERE batch_number = ?")
        .bind(batch_number)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move a batch from `from` to `to`. Returns whether a row changed.
#[instrument(skip_all)]
pub async fn transition_batch(
    conn: &mut SqliteConnection,
    batch_number: i64,
    from: BatchState,
    to: BatchState,
) -> Result<bool> {
    let res = sqlx::query("UPDATE migration_batches SET state = ? WHERE batch_number = ? AND state = ?")
        .bind(to.as_str())
        .bind(batch_number)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Apply a marker transition to every listed timeout; unchanged markers are not written.
#[instrument(skip_all)]
pub async fn rewrite_markers(
    conn: &mut SqliteConnection,
    timeout_ids: &[String],
    transition: fn(TimeoutMarker) -> TimeoutMarker,
) -> Result<usize> {
    let mut changed = 0;
    for id in timeout_ids {
        let current: Option<String> =
            sqlx::query_scalar("SELECT owning_timeout_manager FROM timeout_data WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        let Some(current) = current else {
            continue;
        };
        let next = transition(TimeoutMarker::from_wire(&current)).to_wire();
        if next != current {
            sqlx::query("UPDATE timeout_data SET owning_timeout_manager = ? WHERE id = ?")
                .bind(&next)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Ids of untouched timeouts owned by `endpoint_name` and due at or before `cutoff`, ordered by id.
#[instrument(skip_all)]
pub async fn eligible_timeout_ids(
    conn: &mut SqliteConnection,
    endpoint_name: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut rows = sqlx::query("SELECT id, time FROM timeout_data WHERE owning_timeout_manager = ? ORDER BY id")
        .bind(endpoint_name)
        .fetch(&mut *conn);
    let mut ids = Vec::new();
    while let Some(row) = rows.try_next().await? {
        let time: DateTime<Utc> = row.get("time");
        if time <= cutoff {
            ids.push(row.get("id"));
        }
    }
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn endpoint_summaries(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<EndpointInfo>> {
    let mut rows = sqlx::query("SELECT owning_timeout_manager, destination, time FROM timeout_data")
        .fetch(&mut *conn);
    let mut endpoints: BTreeMap<String, EndpointInfo> = BTreeMap::new();
    while let Some(row) = rows.try_next().await? {
        let marker: String = row.get("owning_timeout_manager");
        let TimeoutMarker::Untouched(owner) = TimeoutMarker::from_wire(&marker) else {
            continue;
        };
        let time: DateTime<Utc> = row.get("time");
        if time > cutoff {
            continue;
        }
        let destination: String = row.get("destination");
        let info = endpoints.entry(owner.clone()).or_insert_with(|| EndpointInfo {
            endpoint_name: owner,
            nr_of_timeouts: 0,
            shortest_timeout: time,
            longest_timeout: time,
            destinations: BTreeSet::new(),
        });
        info.nr_of_timeouts += 1;
        info.shortest_timeout = info.shortest_timeout.min(time);
        info.longest_timeout = info.longest_timeout.max(time);
        info.destinations.insert(destination);
    }
    Ok(endpoints.into_values().collect())
}

#[instrument(skip_all)]
pub async fn read_batch_timeouts(conn: &mut SqliteConnection, batch_number: i64) -> Result<Vec<TimeoutData>> {
    let rows = sqlx::query(
        "SELECT t.id, t.destination, t.saga_id, t.owning_timeout_manager, t.time, t.headers, t.state \
         FROM timeout_data t \
         JOIN migration_batch_timeouts b ON b.timeout_id = t.id \
         WHERE b.batch_number = ? \
         ORDER BY t.id",
    )
    .bind(batch_number)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(timeout_from_row).collect()
}

fn timeout_from_row(row: &SqliteRow) -> Result<TimeoutData> {
    let id: String = row.get("id");
    let saga_id: String = row.get("saga_id");
    let headers: String = row.get("headers");
    Ok(TimeoutData {
        saga_id: Uuid::parse_str(&saga_id)
            .with_context(|| format!("timeout {} has malformed saga id", id))?,
        headers: serde_json::from_str(&headers)
            .with_context(|| format!("timeout {} has malformed headers", id))?,
        destination: row.get("destination"),
        owning_timeout_manager: row.get("owning_timeout_manager"),
        time: row.get("time"),
        state: row.get("state"),
        id,
    })
}

#[instrument(skip_all)]
pub async fn insert_timeout(conn: &mut SqliteConnection, timeout: &TimeoutData) -> Result<()> {
    sqlx::query(
        "INSERT INTO timeout_data (id, destination, saga_id, owning_timeout_manager, time, headers, state) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&timeout.id)
    .bind(&timeout.destination)
    .bind(timeout.saga_id.to_string())
    .bind(&timeout.owning_timeout_manager)
    .bind(timeout.time)
    .bind(serde_json::to_string(&timeout.headers)?)
    .bind(&timeout.state)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_marker(conn: &mut SqliteConnection, timeout_id: &str) -> Result<Option<TimeoutMarker>> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT owning_timeout_manager FROM timeout_data WHERE id = ?")
            .bind(timeout_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(raw.as_deref().map(TimeoutMarker::from_wire))
}

pub async fn count_archived(conn: &mut SqliteConnection, status: MigrationStatus) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_tool_state_archive WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(n)
}
