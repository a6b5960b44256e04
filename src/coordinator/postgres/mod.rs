use super::{WorkCoordinator, check_successor_ids};
use crate::config::PostgresSettings;
use crate::core::clock::millis_to_datetime;
use crate::core::{Clock, CoordinationError, Result};
use crate::work::{AcquiredWorkItem, WorkAcquisitionOutcome, WorkItemRecord, lease_expiry_millis};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA_TEMPLATE: &str = include_str!("schema.sql");

/// Serialises concurrent `setup()` calls across the fleet.
const SETUP_LOCK_KEY: i64 = 0x5348_4152_444C_4541;

const COLUMNS: &str = "work_item_id, creator_id, completed_at, lease_holder_id, lease_expiry, lease_exponent, successor_item_ids";

#[derive(Debug, FromRow)]
struct WorkItemRow {
    work_item_id: String,
    creator_id: String,
    completed_at: Option<i64>,
    lease_holder_id: Option<String>,
    lease_expiry: i64,
    lease_exponent: i32,
    successor_item_ids: Option<Vec<String>>,
}

impl From<WorkItemRow> for WorkItemRecord {
    fn from(row: WorkItemRow) -> Self {
        Self {
            id: row.work_item_id,
            creator_id: row.creator_id,
            completed_at: row.completed_at,
            lease_holder_id: row.lease_holder_id,
            lease_expiry: row.lease_expiry,
            lease_exponent: u32::try_from(row.lease_exponent).unwrap_or(0),
            successor_item_ids: row.successor_item_ids,
        }
    }
}

fn exponent_param(exponent: u32) -> i32 {
    i32::try_from(exponent).unwrap_or(i32::MAX)
}

/// Table names are spliced into SQL text, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(CoordinationError::Config(format!(
            "'{}' is not a valid table name",
            name
        )))
    }
}

/// Work coordinator backed by a PostgreSQL table.
///
/// Each operation runs in its own transaction and locks at most the rows it
/// changes. Acquisition picks a random eligible row with
/// `FOR UPDATE SKIP LOCKED`, so concurrent acquirers never wait on each other
/// and never see the same row.
pub struct PostgresWorkCoordinator {
    pool: PgPool,
    table_name: String,
    worker_id: String,
    clock: Arc<dyn Clock>,
}

impl PostgresWorkCoordinator {
    pub fn new(
        pool: PgPool,
        table_name: impl Into<String>,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;
        Ok(Self {
            pool,
            table_name,
            worker_id: worker_id.into(),
            clock,
        })
    }

    pub async fn connect(
        settings: &PostgresSettings,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_table_name(&settings.table_name)?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect(&settings.url)
            .await?;
        Self::new(pool, settings.table_name.clone(), worker_id, clock)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn acquired(&self, record: &WorkItemRecord) -> WorkAcquisitionOutcome {
        WorkAcquisitionOutcome::Acquired(AcquiredWorkItem {
            work_item_id: record.id.clone(),
            lease_expiry: millis_to_datetime(record.lease_expiry),
            lease_exponent: record.lease_exponent.saturating_sub(1),
        })
    }

    async fn lock_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        work_item_id: &str,
    ) -> Result<Option<WorkItemRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE work_item_id = $1 FOR UPDATE",
            COLUMNS, self.table_name
        );
        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(work_item_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(WorkItemRecord::from))
    }

    /// Grants this worker a lease on a row already locked by `tx`.
    async fn lease_locked_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &WorkItemRecord,
        now: i64,
        base: Duration,
    ) -> Result<WorkItemRecord> {
        let sql = format!(
            "UPDATE {} SET lease_holder_id = $2, lease_expiry = $3, \
             lease_exponent = lease_exponent + 1, updated_at = NOW() \
             WHERE work_item_id = $1 RETURNING {}",
            self.table_name, COLUMNS
        );
        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(&record.id)
            .bind(&self.worker_id)
            .bind(lease_expiry_millis(now, base, record.lease_exponent))
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.into())
    }

    async fn insert_successors(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        successor_ids: &[String],
        starting_lease_exponent: u32,
    ) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} (work_item_id, creator_id, lease_expiry, lease_exponent) \
             SELECT id, $2, 0, $3 FROM UNNEST($1::text[]) AS id \
             ON CONFLICT (work_item_id) DO NOTHING",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(successor_ids.to_vec())
            .bind(&self.worker_id)
            .bind(exponent_param(starting_lease_exponent))
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_complete(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        work_item_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET completed_at = $2, updated_at = NOW() \
             WHERE work_item_id = $1 AND completed_at IS NULL",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(work_item_id)
            .bind(self.clock.now_millis())
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoordinationError::Integrity(format!(
                "work item '{}' could not be marked complete",
                work_item_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkCoordinator for PostgresWorkCoordinator {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn setup(&self) -> Result<()> {
        let schema = SCHEMA_TEMPLATE.replace("{table}", &self.table_name);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SETUP_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&schema)).await?;
        tx.commit().await?;

        info!(table = %self.table_name, "Work coordination schema initialized");
        Ok(())
    }

    async fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} (work_item_id, creator_id, lease_expiry) VALUES ($1, $2, 0) \
             ON CONFLICT (work_item_id) DO NOTHING",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(work_item_id)
            .bind(&self.worker_id)
            .execute(&self.pool)
            .await?;
        let created = result.rows_affected() > 0;
        debug!(work_item_id = %work_item_id, created, "Created unassigned work item");
        Ok(created)
    }

    async fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome> {
        loop {
            let now = self.clock.now_millis();
            let mut tx = self.pool.begin().await?;

            let Some(record) = self.lock_row(&mut tx, work_item_id).await? else {
                let sql = format!(
                    "INSERT INTO {} (work_item_id, creator_id, lease_holder_id, lease_expiry, lease_exponent) \
                     VALUES ($1, $2, $2, $3, 1) ON CONFLICT (work_item_id) DO NOTHING \
                     RETURNING {}",
                    self.table_name, COLUMNS
                );
                let inserted = sqlx::query_as::<_, WorkItemRow>(&sql)
                    .bind(work_item_id)
                    .bind(&self.worker_id)
                    .bind(lease_expiry_millis(now, lease_duration, 0))
                    .fetch_optional(&mut *tx)
                    .await?;
                tx.commit().await?;
                match inserted {
                    Some(row) => return Ok(self.acquired(&row.into())),
                    // Someone inserted it first; lock their row and decide again.
                    None => continue,
                }
            };

            let outcome = if record.is_completed() {
                WorkAcquisitionOutcome::AlreadyCompleted
            } else if record.is_held_by(&self.worker_id, now) {
                self.acquired(&record)
            } else if record.is_lease_expired(now) {
                let leased = self
                    .lease_locked_row(&mut tx, &record, now, lease_duration)
                    .await?;
                self.acquired(&leased)
            } else {
                WorkAcquisitionOutcome::LeaseLockHeldElsewhere
            };
            tx.commit().await?;
            return Ok(outcome);
        }
    }

    async fn acquire_next_work_item(
        &self,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome> {
        let select = format!(
            "SELECT {} FROM {} WHERE completed_at IS NULL AND lease_expiry < $1 \
             ORDER BY RANDOM() LIMIT 1 FOR UPDATE SKIP LOCKED",
            COLUMNS, self.table_name
        );

        loop {
            let now = self.clock.now_millis();
            let mut tx = self.pool.begin().await?;

            let Some(record) = sqlx::query_as::<_, WorkItemRow>(&select)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
                .map(WorkItemRecord::from)
            else {
                tx.commit().await?;
                return Ok(WorkAcquisitionOutcome::NoAvailableWork);
            };

            if record.has_pending_successors() {
                let successor_ids = record.successor_item_ids.clone().unwrap_or_default();
                warn!(
                    work_item_id = %record.id,
                    successors = ?successor_ids,
                    worker_id = %self.worker_id,
                    "Found incomplete work item that already lists successors; finishing its split"
                );
                self.insert_successors(&mut tx, &successor_ids, record.lease_exponent)
                    .await?;
                self.mark_complete(&mut tx, &record.id).await?;
                tx.commit().await?;
                continue;
            }

            let leased = self
                .lease_locked_row(&mut tx, &record, now, lease_duration)
                .await?;
            tx.commit().await?;

            info!(
                work_item_id = %leased.id,
                worker_id = %self.worker_id,
                lease_expiry = leased.lease_expiry,
                lease_exponent = leased.lease_exponent,
                "Acquired work item"
            );
            return Ok(self.acquired(&leased));
        }
    }

    async fn complete_work_item(&self, work_item_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET completed_at = $3, updated_at = NOW() \
             WHERE work_item_id = $1 AND lease_holder_id = $2 AND completed_at IS NULL",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(work_item_id)
            .bind(&self.worker_id)
            .bind(self.clock.now_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoordinationError::lease_not_held(
                work_item_id,
                &self.worker_id,
            ));
        }
        info!(work_item_id = %work_item_id, worker_id = %self.worker_id, "Completed work item");
        Ok(())
    }

    async fn create_successor_work_items_and_mark_complete(
        &self,
        work_item_id: &str,
        successor_ids: &[String],
        starting_lease_exponent: u32,
    ) -> Result<()> {
        check_successor_ids(work_item_id, successor_ids)?;

        let mut tx = self.pool.begin().await?;
        let record = self.lock_row(&mut tx, work_item_id).await?.ok_or_else(|| {
            CoordinationError::Integrity(format!("work item '{}' does not exist", work_item_id))
        })?;

        if let Some(existing) = &record.successor_item_ids {
            if existing.as_slice() != successor_ids {
                return Err(CoordinationError::Integrity(format!(
                    "work item '{}' already lists successors {:?}",
                    work_item_id, existing
                )));
            }
            if record.is_completed() {
                tx.commit().await?;
                return Ok(());
            }
        }
        if record.is_completed() || record.lease_holder_id.as_deref() != Some(self.worker_id.as_str()) {
            return Err(CoordinationError::lease_not_held(
                work_item_id,
                &self.worker_id,
            ));
        }

        let stamp = format!(
            "UPDATE {} SET successor_item_ids = $2, updated_at = NOW() WHERE work_item_id = $1",
            self.table_name
        );
        sqlx::query(&stamp)
            .bind(work_item_id)
            .bind(successor_ids.to_vec())
            .execute(&mut *tx)
            .await?;
        self.insert_successors(&mut tx, successor_ids, starting_lease_exponent)
            .await?;
        self.mark_complete(&mut tx, work_item_id).await?;
        tx.commit().await?;

        info!(
            work_item_id = %work_item_id,
            successors = ?successor_ids,
            worker_id = %self.worker_id,
            "Split work item into successors"
        );
        Ok(())
    }

    async fn num_work_items_not_yet_complete(&self) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE completed_at IS NULL",
            self.table_name
        );
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn pending_work_item_ids(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT work_item_id FROM {} WHERE completed_at IS NULL ORDER BY work_item_id",
            self.table_name
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItemRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE work_item_id = $1",
            COLUMNS, self.table_name
        );
        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(work_item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(WorkItemRecord::from))
    }
}
