use super::{EndpointBatchMigrator, TimeoutsTarget};
use crate::db::Pool;
use crate::model::{EndpointInfo, MigrationCheckResult, TimeoutData};
use crate::retry::{self, RetryPolicy};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument, warn};

static ENDPOINT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid endpoint name regex"));

const LEDGER_TABLE: &str = "timeout_migration_promoted";

pub fn delayed_table_name(endpoint_name: &str) -> String {
    format!("{}.Delayed", endpoint_name)
}

pub fn staging_table_name(endpoint_name: &str) -> String {
    format!("{}.timeout_migration_staging", endpoint_name)
}

fn checked(endpoint_name: &str) -> Result<&str> {
    if ENDPOINT_NAME.is_match(endpoint_name) {
        Ok(endpoint_name)
    } else {
        Err(anyhow!("endpoint name '{}' cannot be used as a table name", endpoint_name))
    }
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_one(&mut *conn)
        .await?;
    Ok(n > 0)
}

async fn ensure_ledger(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (endpoint TEXT NOT NULL, batch_number INTEGER NOT NULL, promoted INTEGER NOT NULL, PRIMARY KEY (endpoint, batch_number))",
        LEDGER_TABLE
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn ensure_staging(conn: &mut SqliteConnection, staging_table: &str) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\
            batch_number INTEGER NOT NULL, \
            message_id TEXT NOT NULL, \
            destination TEXT NOT NULL, \
            due TEXT NOT NULL, \
            headers TEXT NOT NULL, \
            body BLOB NOT NULL, \
            PRIMARY KEY (batch_number, message_id))",
        staging_table
    ))
    .execute(&mut *conn)
    .await?;
    ensure_ledger(conn).await
}

/// Create the live delayed-delivery table of an endpoint, as the transport's
/// installers would.
pub async fn create_delayed_table(pool: &Pool, endpoint_name: &str) -> Result<()> {
    let table = delayed_table_name(checked(endpoint_name)?);
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\
            row_version INTEGER PRIMARY KEY AUTOINCREMENT, \
            message_id TEXT NOT NULL, \
            destination TEXT NOT NULL, \
            due TEXT NOT NULL, \
            headers TEXT NOT NULL, \
            body BLOB NOT NULL)",
        table
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Native delayed delivery of a SQL transport backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteTarget {
    pool: Pool,
    max_delay: Option<Duration>,
    teardown: RetryPolicy,
}

impl SqliteTarget {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            max_delay: None,
            teardown: RetryPolicy::default(),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_teardown_policy(mut self, policy: RetryPolicy) -> Self {
        self.teardown = policy;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Best-effort removal of the staging table, retried with backoff.
    async fn drop_staging(&self, endpoint_name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS \"{}\"", staging_table_name(endpoint_name));
        retry::with_backoff(self.teardown, "dropping staging table", || async {
            sqlx::query(&sql).execute(&self.pool).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }

    /// Forget the endpoint's promoted batches. Batch numbers restart with every
    /// migration, so a failure here must stop the caller.
    async fn clear_ledger(&self, endpoint_name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ensure_ledger(&mut conn).await?;
        sqlx::query(&format!("DELETE FROM {} WHERE endpoint = ?", LEDGER_TABLE))
            .bind(endpoint_name)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to clear promotion ledger of {}", endpoint_name))?;
        Ok(())
    }
}

#[async_trait]
impl TimeoutsTarget for SqliteTarget {
    type Migrator = SqliteEndpointMigrator;

    #[instrument(skip_all, fields(endpoint = %endpoint.endpoint_name))]
    async fn able_to_migrate(&self, endpoint: &EndpointInfo) -> Result<MigrationCheckResult> {
        let mut result = MigrationCheckResult::default();
        let name = match checked(&endpoint.endpoint_name) {
            Ok(name) => name,
            Err(err) => {
                result.problems.push(err.to_string());
                return Ok(result);
            }
        };

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                result
                    .problems
                    .push(format!("Unable to connect to the target database. Error message '{}'", err));
                return Ok(result);
            }
        };

        let delayed = delayed_table_name(name);
        match table_exists(&mut conn, &delayed).await {
            Ok(true) => {}
            Ok(false) => result
                .problems
                .push(format!("Target delayed delivery table {} does not exist.", delayed)),
            Err(err) => result
                .problems
                .push(format!("Unable to query the target database. Error message '{}'", err)),
        }

        if let Some(max_delay) = self.max_delay {
            if endpoint.longest_timeout - Utc::now() > max_delay {
                result.problems.push(format!(
                    "{} - has a timeout that has further away date than allowed {} seconds.",
                    name,
                    max_delay.num_seconds()
                ));
            }
        }

        let staging = staging_table_name(name);
        if let Err(err) = ensure_staging(&mut conn, &staging).await {
            result.problems.push(format!(
                "Unable to create staging table '{}'. Error message '{}'",
                staging, err
            ));
        }

        Ok(result)
    }

    #[instrument(skip(self))]
    async fn prepare_endpoint_migrator(&self, endpoint_name: &str) -> Result<SqliteEndpointMigrator> {
        let name = checked(endpoint_name)?;
        let staging_table = staging_table_name(name);
        let mut conn = self.pool.acquire().await?;
        ensure_staging(&mut conn, &staging_table).await?;
        Ok(SqliteEndpointMigrator {
            pool: self.pool.clone(),
            endpoint_name: name.to_string(),
            delayed_table: delayed_table_name(name),
            staging_table,
        })
    }

    #[instrument(skip(self))]
    async fn abort(&self, endpoint_name: &str) -> Result<()> {
        let name = checked(endpoint_name)?;
        self.drop_staging(name).await?;
        self.clear_ledger(name).await?;
        info!(endpoint = name, "staging table removed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete(&self, endpoint_name: &str) -> Result<()> {
        let name = checked(endpoint_name)?;
        let staging = staging_table_name(name);
        let mut conn = self.pool.acquire().await?;
        if table_exists(&mut conn, &staging).await? {
            let left: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", staging))
                .fetch_one(&mut *conn)
                .await?;
            if left > 0 {
                bail!(
                    "Unable to complete migration as there are still {} records available in the staging table {}.",
                    left,
                    staging
                );
            }
        }
        drop(conn);
        if let Err(err) = self.drop_staging(name).await {
            warn!(?err, endpoint = name, "could not remove empty staging table");
        }
        self.clear_ledger(name).await
    }
}

#[derive(Debug, Clone)]
pub struct SqliteEndpointMigrator {
    pool: Pool,
    endpoint_name: String,
    delayed_table: String,
    staging_table: String,
}

#[async_trait]
impl EndpointBatchMigrator for SqliteEndpointMigrator {
    #[instrument(skip(self, timeouts), fields(endpoint = %self.endpoint_name, count = timeouts.len()))]
    async fn stage_batch(&self, batch_number: i64, timeouts: &[TimeoutData]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query(&format!("DELETE FROM \"{}\" WHERE batch_number = ?", self.staging_table))
            .bind(batch_number)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if replaced > 0 {
            debug!(batch_number, replaced, "replacing partially staged batch");
        }

        let insert = format!(
            "INSERT INTO \"{}\" (batch_number, message_id, destination, due, headers, body) VALUES (?, ?, ?, ?, ?, ?)",
            self.staging_table
        );
        let mut staged = 0;
        for timeout in timeouts {
            staged += sqlx::query(&insert)
                .bind(batch_number)
                .bind(&timeout.id)
                .bind(&timeout.destination)
                .bind(timeout.time)
                .bind(serde_json::to_string(&timeout.headers)?)
                .bind(&timeout.state)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to stage timeout {}", timeout.id))?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(staged)
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint_name))]
    async fn complete_batch(&self, batch_number: i64) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let promoted: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT promoted FROM {} WHERE endpoint = ? AND batch_number = ?",
            LEDGER_TABLE
        ))
        .bind(&self.endpoint_name)
        .bind(batch_number)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(promoted) = promoted {
            debug!(batch_number, promoted, "batch already promoted");
            return Ok(promoted as usize);
        }

        let moved = sqlx::query(&format!(
            "INSERT INTO \"{}\" (message_id, destination, due, headers, body) \
             SELECT message_id, destination, due, headers, body FROM \"{}\" WHERE batch_number = ? ORDER BY message_id",
            self.delayed_table, self.staging_table
        ))
        .bind(batch_number)
        .execute(&mut *tx)
        .await
        .context("failed to promote staged timeouts")?
        .rows_affected();

        sqlx::query(&format!("DELETE FROM \"{}\" WHERE batch_number = ?", self.staging_table))
            .bind(batch_number)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (endpoint, batch_number, promoted) VALUES (?, ?, ?)",
            LEDGER_TABLE
        ))
        .bind(&self.endpoint_name)
        .bind(batch_number)
        .bind(moved as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(moved as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_names_are_restricted() {
        assert!(checked("Sales.Orders-v2_x").is_ok());
        assert!(checked("Sales\"; DROP TABLE x; --").is_err());
        assert!(checked("").is_err());
        assert_eq!(delayed_table_name("Sales"), "Sales.Delayed");
        assert_eq!(staging_table_name("Sales"), "Sales.timeout_migration_staging");
    }
}
