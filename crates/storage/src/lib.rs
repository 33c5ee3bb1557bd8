use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use everly_core::retry::BackoffPolicy;
use everly_core::types::{LeasedNudgeJob, LogStatus, NudgeChannel};

/// How long a worker lease remains exclusive before an abandoned claim
/// becomes eligible for another worker.
pub const LEASE_TIMEOUT: Duration = Duration::minutes(5);

/// Maximum characters of a message copied into the audit log preview.
const PREVIEW_LEN: usize = 140;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for hub metadata.
    pub fn hubs(&self) -> HubRepository {
        HubRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for member records.
    pub fn members(&self) -> MemberRepository {
        MemberRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for activity event records.
    pub fn activity_events(&self) -> ActivityEventRepository {
        ActivityEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for bounty completion records.
    pub fn bounty_events(&self) -> BountyEventRepository {
        BountyEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on the nudge queue.
    pub fn nudge_queue(&self) -> NudgeQueueRepository {
        NudgeQueueRepository {
            pool: self.pool.clone(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Returns a handle for the nudge audit log.
    pub fn nudge_log(&self) -> NudgeLogRepository {
        NudgeLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("787"),
        _ => false,
    }
}

/// Repository for hub (tenant) metadata.
#[derive(Clone)]
pub struct HubRepository {
    pool: SqlitePool,
}

impl HubRepository {
    /// Creates a hub row; used by provisioning and test fixtures.
    pub async fn create(&self, id: &str, name: &str, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO hubs (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(to_rfc3339(now))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns whether the hub is provisioned.
    pub async fn exists(&self, id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM hubs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

/// Repository for member records mapped from platform webhooks.
#[derive(Clone)]
pub struct MemberRepository {
    pool: SqlitePool,
}

/// Data required to upsert a member from a `member.created` event.
pub struct UpsertMember<'a> {
    pub hub_id: &'a str,
    pub external_id: &'a str,
    pub display_name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemberRepository {
    /// Upserts a member keyed on `(hub_id, external_id)`.
    ///
    /// Re-delivery of the same event updates the profile in place instead of
    /// creating a duplicate row.
    pub async fn upsert(&self, member: &UpsertMember<'_>) -> Result<(), MemberError> {
        sqlx::query(
            "INSERT INTO members \
             (id, hub_id, external_id, display_name, email, joined_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(hub_id, external_id) DO UPDATE \
             SET display_name = excluded.display_name, \
                 email = excluded.email, \
                 updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(member.hub_id)
        .bind(member.external_id)
        .bind(member.display_name)
        .bind(member.email)
        .bind(to_rfc3339(member.joined_at))
        .bind(to_rfc3339(member.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                MemberError::MissingHub
            } else {
                MemberError::Database(err)
            }
        })?;
        Ok(())
    }

    /// Counts members for a hub; used by ingestion tests and admin views.
    pub async fn count_for_hub(&self, hub_id: &str) -> Result<i64, MemberError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM members WHERE hub_id = ?")
            .bind(hub_id)
            .fetch_one(&self.pool)
            .await
            .map_err(MemberError::Database)?;
        Ok(row.get("n"))
    }
}

/// Errors that can occur while writing member rows.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("hub is not provisioned for this member")]
    MissingHub,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The external event id was seen before; the write is already applied.
    Duplicate,
}

impl InsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Repository for the `activity_events` table (messages and payments).
#[derive(Clone)]
pub struct ActivityEventRepository {
    pool: SqlitePool,
}

/// Data required to record an activity event.
pub struct NewActivityEvent<'a> {
    pub hub_id: &'a str,
    pub external_event_id: &'a str,
    pub member_external_id: Option<&'a str>,
    pub kind: &'a str,
    pub payload_json: &'a str,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl ActivityEventRepository {
    /// Inserts an activity row; a `(hub, external_event_id)` collision is
    /// reported as [`InsertOutcome::Duplicate`] rather than an error.
    pub async fn insert(&self, event: &NewActivityEvent<'_>) -> Result<InsertOutcome, EventError> {
        let result = sqlx::query(
            "INSERT INTO activity_events \
             (id, hub_id, external_event_id, member_external_id, kind, payload_json, occurred_at, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.hub_id)
        .bind(event.external_event_id)
        .bind(event.member_external_id)
        .bind(event.kind)
        .bind(event.payload_json)
        .bind(to_rfc3339(event.occurred_at))
        .bind(to_rfc3339(event.received_at))
        .execute(&self.pool)
        .await;

        map_event_insert(result)
    }
}

/// Repository for the `bounty_events` table.
#[derive(Clone)]
pub struct BountyEventRepository {
    pool: SqlitePool,
}

/// Data required to record a bounty completion.
pub struct NewBountyEvent<'a> {
    pub hub_id: &'a str,
    pub external_event_id: &'a str,
    pub member_external_id: &'a str,
    pub bounty_id: Option<&'a str>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl BountyEventRepository {
    /// Inserts a bounty completion row with the same duplicate semantics as
    /// [`ActivityEventRepository::insert`].
    pub async fn insert(&self, event: &NewBountyEvent<'_>) -> Result<InsertOutcome, EventError> {
        let result = sqlx::query(
            "INSERT INTO bounty_events \
             (id, hub_id, external_event_id, member_external_id, bounty_id, occurred_at, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.hub_id)
        .bind(event.external_event_id)
        .bind(event.member_external_id)
        .bind(event.bounty_id)
        .bind(to_rfc3339(event.occurred_at))
        .bind(to_rfc3339(event.received_at))
        .execute(&self.pool)
        .await;

        map_event_insert(result)
    }
}

fn map_event_insert(
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
) -> Result<InsertOutcome, EventError> {
    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Duplicate),
        Err(err) if is_foreign_key_violation(&err) => Err(EventError::MissingHub),
        Err(err) => Err(EventError::Database(err)),
    }
}

/// Errors that can occur while recording webhook-mapped events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("hub is not provisioned for incoming event")]
    MissingHub,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Repository owning the NudgeJob lifecycle.
///
/// All lease, attempt and terminal transitions go through this type; no
/// other component mutates queue rows.
#[derive(Clone)]
pub struct NudgeQueueRepository {
    pool: SqlitePool,
    backoff: BackoffPolicy,
}

/// Data required to enqueue a nudge job.
pub struct NewNudgeJob<'a> {
    pub hub_id: &'a str,
    pub member_id: &'a str,
    pub recipe: &'a str,
    pub channel: NudgeChannel,
    pub message: &'a str,
    pub variables_json: &'a str,
    pub dedupe_key: &'a str,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to enqueue a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: String, log_id: String },
    /// Another job with the same dedupe key is already queued or delivered
    /// within the current bucket.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Result of a failure transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempt ceiling reached; the job will never be dequeued again.
    Terminal,
    /// Lock released and the job rescheduled for a later attempt.
    Requeued { available_at: DateTime<Utc> },
}

impl NudgeQueueRepository {
    /// Inserts a job plus its `queued` log row in one transaction.
    ///
    /// A dedupe-key collision rolls back and reports
    /// [`EnqueueOutcome::Duplicate`]; no log row is written for the loser.
    pub async fn enqueue(&self, job: &NewNudgeJob<'_>) -> Result<EnqueueOutcome, NudgeQueueError> {
        let job_id = Uuid::new_v4().to_string();
        let log_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await.map_err(NudgeQueueError::Database)?;

        let inserted = sqlx::query(
            "INSERT INTO nudge_jobs \
             (id, hub_id, member_id, recipe, channel, message, variables_json, \
              attempt, status, available_at, dedupe_key, log_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'queued', ?, ?, ?, ?, ?)",
        )
        .bind(&job_id)
        .bind(job.hub_id)
        .bind(job.member_id)
        .bind(job.recipe)
        .bind(job.channel.as_str())
        .bind(job.message)
        .bind(job.variables_json)
        .bind(to_rfc3339(job.available_at))
        .bind(job.dedupe_key)
        .bind(&log_id)
        .bind(to_rfc3339(job.created_at))
        .bind(to_rfc3339(job.created_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Ok(EnqueueOutcome::Duplicate),
            Err(err) if is_foreign_key_violation(&err) => return Err(NudgeQueueError::MissingHub),
            Err(err) => return Err(NudgeQueueError::Database(err)),
        }

        sqlx::query(
            "INSERT INTO nudge_log \
             (id, job_id, hub_id, member_id, recipe, channel, status, \
              message_preview, attempt, scheduled_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, 0, ?, ?)",
        )
        .bind(&log_id)
        .bind(&job_id)
        .bind(job.hub_id)
        .bind(job.member_id)
        .bind(job.recipe)
        .bind(job.channel.as_str())
        .bind(preview(job.message))
        .bind(to_rfc3339(job.created_at))
        .bind(to_rfc3339(job.created_at))
        .execute(&mut *tx)
        .await
        .map_err(NudgeQueueError::Database)?;

        tx.commit().await.map_err(NudgeQueueError::Database)?;

        Ok(EnqueueOutcome::Enqueued { job_id, log_id })
    }

    /// Atomically leases up to `limit` eligible jobs for `worker_id`.
    ///
    /// Eligible means status `queued`, due by `now`, and either unlocked or
    /// holding a lease older than [`LEASE_TIMEOUT`]. The claim and the read
    /// are a single `UPDATE … RETURNING`, so two workers never receive the
    /// same row from one backlog.
    pub async fn dequeue(
        &self,
        limit: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedNudgeJob>, NudgeQueueError> {
        let lease_expiry = now - LEASE_TIMEOUT;
        let rows = sqlx::query_as::<_, LeasedJobRow>(
            "UPDATE nudge_jobs \
             SET locked_at = ?, locked_by = ?, updated_at = ? \
             WHERE id IN ( \
                 SELECT id FROM nudge_jobs \
                 WHERE status = 'queued' \
                   AND available_at <= ? \
                   AND (locked_at IS NULL OR locked_at <= ?) \
                 ORDER BY available_at ASC \
                 LIMIT ? \
             ) \
             RETURNING id, hub_id, member_id, recipe, channel, message, \
                       variables_json, attempt, available_at, log_id",
        )
        .bind(to_rfc3339(now))
        .bind(worker_id)
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(lease_expiry))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(NudgeQueueError::Database)?;

        Ok(rows.into_iter().map(LeasedJobRow::into_domain).collect())
    }

    /// Marks a leased job delivered and advances its log row to `sent`.
    pub async fn mark_success(
        &self,
        job: &LeasedNudgeJob,
        now: DateTime<Utc>,
    ) -> Result<(), NudgeQueueError> {
        let mut tx = self.pool.begin().await.map_err(NudgeQueueError::Database)?;

        sqlx::query(
            "UPDATE nudge_jobs \
             SET status = 'sent', locked_at = NULL, locked_by = NULL, \
                 attempt = ?, updated_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind((job.attempt + 1) as i64)
        .bind(to_rfc3339(now))
        .bind(&job.id)
        .execute(&mut *tx)
        .await
        .map_err(NudgeQueueError::Database)?;

        sqlx::query(
            "UPDATE nudge_log \
             SET status = 'sent', sent_at = ?, attempt = ?, updated_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(to_rfc3339(now))
        .bind((job.attempt + 1) as i64)
        .bind(to_rfc3339(now))
        .bind(&job.log_id)
        .execute(&mut *tx)
        .await
        .map_err(NudgeQueueError::Database)?;

        tx.commit().await.map_err(NudgeQueueError::Database)?;
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// Below the ceiling the lock is released and `available_at` pushed out
    /// by the backoff schedule; at the ceiling the job and log become
    /// terminally `failed`. Status guards make the terminal state sticky: a
    /// failed job is never rescheduled by a late or repeated call.
    pub async fn mark_failure(
        &self,
        job: &LeasedNudgeJob,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, NudgeQueueError> {
        let next_attempt = job.attempt + 1;
        let mut tx = self.pool.begin().await.map_err(NudgeQueueError::Database)?;

        let outcome = if next_attempt >= max_retries {
            sqlx::query(
                "UPDATE nudge_jobs \
                 SET status = 'failed', locked_at = NULL, locked_by = NULL, \
                     attempt = ?, updated_at = ? \
                 WHERE id = ? AND status <> 'sent'",
            )
            .bind(next_attempt as i64)
            .bind(to_rfc3339(now))
            .bind(&job.id)
            .execute(&mut *tx)
            .await
            .map_err(NudgeQueueError::Database)?;

            sqlx::query(
                "UPDATE nudge_log \
                 SET status = 'failed', error = ?, attempt = ?, updated_at = ? \
                 WHERE id = ? AND status = 'queued'",
            )
            .bind(error)
            .bind(next_attempt as i64)
            .bind(to_rfc3339(now))
            .bind(&job.log_id)
            .execute(&mut *tx)
            .await
            .map_err(NudgeQueueError::Database)?;

            FailureOutcome::Terminal
        } else {
            let available_at = now + self.backoff.delay_for(next_attempt);

            sqlx::query(
                "UPDATE nudge_jobs \
                 SET locked_at = NULL, locked_by = NULL, attempt = ?, \
                     available_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'queued'",
            )
            .bind(next_attempt as i64)
            .bind(to_rfc3339(available_at))
            .bind(to_rfc3339(now))
            .bind(&job.id)
            .execute(&mut *tx)
            .await
            .map_err(NudgeQueueError::Database)?;

            sqlx::query(
                "UPDATE nudge_log \
                 SET error = ?, attempt = ?, updated_at = ? \
                 WHERE id = ? AND status = 'queued'",
            )
            .bind(error)
            .bind(next_attempt as i64)
            .bind(to_rfc3339(now))
            .bind(&job.log_id)
            .execute(&mut *tx)
            .await
            .map_err(NudgeQueueError::Database)?;

            FailureOutcome::Requeued { available_at }
        };

        tx.commit().await.map_err(NudgeQueueError::Database)?;
        Ok(outcome)
    }
}

/// Errors that can occur while mutating the nudge queue.
#[derive(Debug, Error)]
pub enum NudgeQueueError {
    #[error("hub is not provisioned for this nudge")]
    MissingHub,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct LeasedJobRow {
    id: String,
    hub_id: String,
    member_id: String,
    recipe: String,
    channel: String,
    message: String,
    variables_json: String,
    attempt: i64,
    available_at: DateTime<Utc>,
    log_id: String,
}

impl LeasedJobRow {
    fn into_domain(self) -> LeasedNudgeJob {
        let channel = self.channel.parse().unwrap_or_default();
        let variables = serde_json::from_str(&self.variables_json).unwrap_or_default();
        LeasedNudgeJob {
            id: self.id,
            hub_id: self.hub_id,
            member_id: self.member_id,
            recipe: self.recipe,
            channel,
            message: self.message,
            variables,
            attempt: self.attempt as u32,
            available_at: self.available_at,
            log_id: self.log_id,
        }
    }
}

/// Repository for the append-only nudge audit log.
#[derive(Clone)]
pub struct NudgeLogRepository {
    pool: SqlitePool,
}

/// Data required to record a dedupe skip at dispatch time.
pub struct SkippedNudge<'a> {
    pub hub_id: &'a str,
    pub member_id: &'a str,
    pub recipe: &'a str,
    pub channel: NudgeChannel,
    pub message: &'a str,
    pub scheduled_at: DateTime<Utc>,
}

impl NudgeLogRepository {
    /// Writes an informational `skipped` row; skips have no queue job.
    pub async fn record_skipped(&self, skip: &SkippedNudge<'_>) -> Result<String, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO nudge_log \
             (id, hub_id, member_id, recipe, channel, status, \
              message_preview, attempt, scheduled_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'skipped', ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(skip.hub_id)
        .bind(skip.member_id)
        .bind(skip.recipe)
        .bind(skip.channel.as_str())
        .bind(preview(skip.message))
        .bind(to_rfc3339(skip.scheduled_at))
        .bind(to_rfc3339(skip.scheduled_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Lists the most recent log rows for a hub, newest first.
    pub async fn list_for_hub(
        &self,
        hub_id: &str,
        limit: u32,
    ) -> Result<Vec<NudgeLogRow>, sqlx::Error> {
        sqlx::query_as::<_, NudgeLogRow>(
            "SELECT id, job_id, hub_id, member_id, recipe, channel, status, \
                    message_preview, attempt, error, scheduled_at, sent_at \
             FROM nudge_log \
             WHERE hub_id = ? \
             ORDER BY scheduled_at DESC, id DESC \
             LIMIT ?",
        )
        .bind(hub_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
    }
}

/// Audit log row as read back for status queries.
#[derive(Debug, sqlx::FromRow)]
pub struct NudgeLogRow {
    pub id: String,
    pub job_id: Option<String>,
    pub hub_id: String,
    pub member_id: String,
    pub recipe: String,
    pub channel: String,
    pub status: String,
    pub message_preview: String,
    pub attempt: i64,
    pub error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NudgeLogRow {
    /// Parses the persisted status, defaulting unreadable values to `queued`.
    pub fn log_status(&self) -> LogStatus {
        self.status.parse().unwrap_or(LogStatus::Queued)
    }
}

fn preview(message: &str) -> String {
    message.chars().take(PREVIEW_LEN).collect()
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
