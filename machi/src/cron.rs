//! Cron Scheduler: at/every/cron-expression schedules with a reentry-guarded
//! tick loop, filesystem exclusive-lock leases, and startup recovery for jobs
//! that were due while the process wasn't running.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

/// Errors raised by the cron scheduler.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// I/O failure reading or writing scheduler state.
    #[error("cron io error: {0}")]
    Io(#[from] std::io::Error),
    /// SQLite failure on the schedule store.
    #[error("cron storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// A cron expression failed to parse.
    #[error("invalid cron expression {expr:?}: {message}")]
    InvalidExpression {
        /// The offending expression.
        expr: String,
        /// Why it failed to parse.
        message: String,
    },
    /// An IANA timezone name was not recognized.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    /// Another process (or an earlier crashed run) holds the job's lease.
    #[error("job {0} is already leased by another runner")]
    Leased(String),
}

type CronResult<T> = Result<T, CronError>;

/// How a job recurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fires exactly once at the given instant.
    At(DateTime<Utc>),
    /// Fires every `period` starting from `anchor`.
    Every {
        /// First possible fire time.
        anchor: DateTime<Utc>,
        /// Gap between fires.
        period: chrono::Duration,
    },
    /// Fires according to a standard five/six-field cron expression,
    /// evaluated in `tz`.
    Cron {
        /// The cron expression, e.g. `"0 */15 * * * *"`.
        expr: String,
        /// Timezone the expression is evaluated in.
        tz: Tz,
    },
}

impl Schedule {
    /// Builds a [`Schedule::Cron`] variant, validating the expression and
    /// timezone name eagerly.
    pub fn cron(expr: impl Into<String>, tz_name: &str) -> CronResult<Self> {
        let expr = expr.into();
        let _parsed: cron::Schedule = expr
            .parse()
            .map_err(|e: cron::error::Error| CronError::InvalidExpression {
                expr: expr.clone(),
                message: e.to_string(),
            })?;
        let tz: Tz = tz_name
            .parse()
            .map_err(|_| CronError::UnknownTimezone(tz_name.to_owned()))?;
        Ok(Self::Cron { expr, tz })
    }

    /// Computes the next fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::At(at) => (*at > after).then_some(*at),
            Self::Every { anchor, period } => {
                if *period <= chrono::Duration::zero() {
                    return None;
                }
                if after < *anchor {
                    return Some(*anchor);
                }
                let elapsed = after - *anchor;
                let ticks = elapsed.num_milliseconds() / period.num_milliseconds() + 1;
                Some(*anchor + *period * ticks as i32)
            }
            Self::Cron { expr, tz } => {
                let schedule: cron::Schedule = expr.parse().ok()?;
                let after_tz = after.with_timezone(tz);
                schedule
                    .after(&after_tz)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    /// Stable identifier, used for dedupe and leasing.
    pub id: String,
    /// Human-readable label, defaults to `id` if never set.
    pub name: String,
    /// How often it recurs.
    pub schedule: Schedule,
    /// Free-form payload handed back to the caller when the job fires,
    /// describing what to run (e.g. a tool name and arguments).
    pub payload: serde_json::Value,
    /// Whether the job is eligible to fire. A disabled job stays registered
    /// (and visible via `list_jobs`) but is skipped by `tick`.
    pub enabled: bool,
    /// If set, the job is removed after its next successful fire rather than
    /// rescheduled. Meaningful for `Schedule::At`; `every`/`cron` jobs ignore it.
    pub delete_after_run: bool,
}

impl Job {
    /// Builds an enabled job with `name` defaulted to `id`.
    #[must_use]
    pub fn new(id: impl Into<String>, schedule: Schedule, payload: serde_json::Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            schedule,
            payload,
            enabled: true,
            delete_after_run: false,
        }
    }

    /// Overrides the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets whether the job is removed after its next successful fire.
    #[must_use]
    pub const fn with_delete_after_run(mut self, delete_after_run: bool) -> Self {
        self.delete_after_run = delete_after_run;
        self
    }
}

/// A point-in-time snapshot of a registered job, as returned by
/// [`CronScheduler::list_jobs`].
#[derive(Debug, Clone)]
pub struct JobSummary {
    /// The job id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// How it recurs.
    pub schedule: Schedule,
    /// Whether it's eligible to fire.
    pub enabled: bool,
    /// Next scheduled fire time.
    pub next_fire: DateTime<Utc>,
    /// Last time it actually fired, if ever.
    pub last_fired: Option<DateTime<Utc>>,
    /// Outcome of the last fire (`"ok"` / `"error"`), if any.
    pub last_status: Option<String>,
    /// Error message from the last fire, if it failed.
    pub last_error: Option<String>,
    /// Whether the job's lease is currently held (a run is in flight).
    pub running: bool,
    /// Whether it's removed after its next successful fire.
    pub delete_after_run: bool,
    /// When the job was first registered.
    pub created_at: DateTime<Utc>,
    /// When the job was last modified (re-registered or fired).
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobRecord {
    job: Job,
    next_fire: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    last_status: Option<String>,
    last_error: Option<String>,
    running: bool,
    running_started_at_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A job that has become due, returned by [`CronScheduler::tick`].
#[derive(Debug, Clone)]
pub struct DueJob {
    /// The job id.
    pub id: String,
    /// The instant it was scheduled to fire at (not wall-clock "now").
    pub due_at: DateTime<Utc>,
    /// The job's payload.
    pub payload: serde_json::Value,
}

/// Cron scheduler: tracks jobs in SQLite, computes due jobs on demand, and
/// guards concurrent schedulers (e.g. two processes sharing one state dir)
/// with an exclusive filesystem lease per job.
#[derive(Clone)]
pub struct CronScheduler {
    conn: Arc<Mutex<Connection>>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    lease_dir: Option<PathBuf>,
    running_lease_ms: i64,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish_non_exhaustive()
    }
}

impl CronScheduler {
    /// Opens (or creates) a scheduler backed by `cron.db` and a `leases/`
    /// directory under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> CronResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let lease_dir = dir.join("leases");
        std::fs::create_dir_all(&lease_dir)?;
        let conn = Connection::open(dir.join("cron.db"))?;
        let scheduler = Self::from_connection(conn, Some(lease_dir))?;
        scheduler.recover().await?;
        Ok(scheduler)
    }

    /// Opens an in-memory scheduler with no filesystem leasing. Intended for
    /// tests and single-process embedding.
    pub fn in_memory() -> CronResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, lease_dir: Option<PathBuf>) -> CronResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schedule_kind TEXT NOT NULL,
                schedule_data TEXT NOT NULL,
                payload TEXT NOT NULL,
                next_fire TEXT NOT NULL,
                last_fired TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                delete_after_run INTEGER NOT NULL DEFAULT 0,
                last_status TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            lease_dir,
            running_lease_ms: 120_000,
        })
    }

    /// Overrides the default 120 s stale-lease threshold: a lease file older
    /// than this is assumed to belong to a crashed runner and is reclaimed.
    #[must_use]
    pub const fn with_running_lease_ms(mut self, running_lease_ms: i64) -> Self {
        self.running_lease_ms = running_lease_ms;
        self
    }

    /// Registers `job` as of the current wall-clock time. See [`Self::register_at`].
    pub async fn register(&self, job: Job) -> CronResult<()> {
        self.register_at(job, Utc::now()).await
    }

    /// Registers `job`, persisting it and computing its first fire time
    /// strictly after `now`.
    ///
    /// Re-registering an existing job id replaces its schedule, payload,
    /// name, enabled, and delete-after-run settings, but preserves
    /// `last_fired`/`last_status`/`last_error`/`created_at`.
    pub async fn register_at(&self, job: Job, now: DateTime<Utc>) -> CronResult<()> {
        let next_fire = job.schedule.next_after(now).unwrap_or(now);
        let (kind, data) = encode_schedule(&job.schedule);
        let payload = job.payload.to_string();

        let guard = self.conn.lock().await;
        guard.execute(
            "INSERT INTO jobs (id, name, schedule_kind, schedule_data, payload, next_fire, last_fired,
                                enabled, delete_after_run, last_status, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL, NULL, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                schedule_kind = excluded.schedule_kind,
                schedule_data = excluded.schedule_data,
                payload = excluded.payload,
                next_fire = excluded.next_fire,
                enabled = excluded.enabled,
                delete_after_run = excluded.delete_after_run,
                updated_at = excluded.updated_at",
            params![
                job.id,
                job.name,
                kind,
                data,
                payload,
                next_fire.to_rfc3339(),
                i64::from(job.enabled),
                i64::from(job.delete_after_run),
                now.to_rfc3339(),
            ],
        )?;
        drop(guard);

        let mut jobs = self.jobs.lock().await;
        let existing = jobs.get(&job.id);
        let last_fired = existing.and_then(|r| r.last_fired);
        let last_status = existing.and_then(|r| r.last_status.clone());
        let last_error = existing.and_then(|r| r.last_error.clone());
        let created_at = existing.map_or(now, |r| r.created_at);
        jobs.insert(
            job.id.clone(),
            JobRecord {
                job,
                next_fire,
                last_fired,
                last_status,
                last_error,
                running: false,
                running_started_at_ms: None,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    /// Removes a job. No-op if it doesn't exist.
    pub async fn unregister(&self, id: &str) -> CronResult<()> {
        let guard = self.conn.lock().await;
        guard.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        drop(guard);
        self.jobs.lock().await.remove(id);
        Ok(())
    }

    /// Loads persisted jobs at startup, treating any job whose `next_fire`
    /// is already in the past as immediately due (recovering missed fires
    /// across a restart) without firing it twice.
    async fn recover(&self) -> CronResult<()> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(
            "SELECT id, name, schedule_kind, schedule_data, payload, next_fire, last_fired,
                    enabled, delete_after_run, last_status, last_error, created_at, updated_at
             FROM jobs",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, bool>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(guard);

        let mut jobs = self.jobs.lock().await;
        for (
            id,
            name,
            kind,
            data,
            payload_str,
            next_fire_str,
            last_fired_str,
            enabled,
            delete_after_run,
            last_status,
            last_error,
            created_at_str,
            updated_at_str,
        ) in rows
        {
            let Some(schedule) = decode_schedule(&kind, &data) else {
                continue;
            };
            let Ok(payload) = serde_json::from_str(&payload_str) else {
                continue;
            };
            let next_fire = DateTime::parse_from_rfc3339(&next_fire_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let last_fired = last_fired_str.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });
            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(created_at);
            jobs.insert(
                id.clone(),
                JobRecord {
                    job: Job {
                        id,
                        name,
                        schedule,
                        payload,
                        enabled,
                        delete_after_run,
                    },
                    next_fire,
                    last_fired,
                    last_status,
                    last_error,
                    running: false,
                    running_started_at_ms: None,
                    created_at,
                    updated_at,
                },
            );
        }
        Ok(())
    }

    /// Evaluates all registered jobs against `now`, returning every job whose
    /// `next_fire` is at or before `now`, advancing each to its subsequent
    /// fire time. A job already leased (filesystem-exclusive) by another
    /// runner is skipped for this tick rather than returned twice; disabled
    /// jobs are skipped entirely.
    ///
    /// This is idempotent per call: calling `tick` again with the same `now`
    /// returns nothing new until the clock (or caller) advances, because
    /// `next_fire` has already moved past `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> CronResult<Vec<DueJob>> {
        let mut jobs = self.jobs.lock().await;
        let mut due = Vec::new();
        let ids: Vec<String> = jobs.keys().cloned().collect();
        for id in ids {
            let Some(record) = jobs.get(&id) else { continue };
            if !record.job.enabled || record.next_fire > now {
                continue;
            }
            if self.try_lease(&id, now).is_err() {
                continue;
            }
            let due_at = record.next_fire;
            due.push(DueJob {
                id: id.clone(),
                due_at,
                payload: record.job.payload.clone(),
            });

            let next_fire = record
                .job
                .schedule
                .next_after(due_at)
                .unwrap_or(due_at + chrono::Duration::days(3650));
            if let Some(record) = jobs.get_mut(&id) {
                record.last_fired = Some(due_at);
                record.next_fire = next_fire;
                record.running = true;
                record.running_started_at_ms = Some(now.timestamp_millis());
                record.updated_at = now;
            }
            self.persist_fire(&id, due_at, next_fire, now).await?;
        }
        Ok(due)
    }

    /// Acquires the job's exclusive lease file. If an existing lease is older
    /// than `running_lease_ms`, it's assumed to belong to a crashed runner
    /// and is removed before retrying once.
    fn try_lease(&self, id: &str, now: DateTime<Utc>) -> CronResult<()> {
        let Some(dir) = &self.lease_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{id}.lease"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(()),
            Err(_) => {
                if Self::lease_is_stale(&path, now, self.running_lease_ms) {
                    let _ = std::fs::remove_file(&path);
                    return OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&path)
                        .map(|_| ())
                        .map_err(|_| CronError::Leased(id.to_owned()));
                }
                Err(CronError::Leased(id.to_owned()))
            }
        }
    }

    fn lease_is_stale(path: &Path, now: DateTime<Utc>, running_lease_ms: i64) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let age_ms = now
            .signed_duration_since(DateTime::<Utc>::from(modified))
            .num_milliseconds();
        age_ms > running_lease_ms
    }

    /// Releases a previously acquired lease, allowing the job to be leased
    /// again on its next due tick. Call this once the job's work completes.
    pub fn release_lease(&self, id: &str) {
        if let Some(dir) = &self.lease_dir {
            let _ = std::fs::remove_file(dir.join(format!("{id}.lease")));
        }
    }

    /// Records the outcome of a fired job, releases its lease, and — for a
    /// successful `delete_after_run` job — removes it entirely. Call this
    /// once the caller has finished acting on a [`DueJob`].
    pub async fn finish(&self, id: &str, outcome: Result<(), String>, now: DateTime<Utc>) -> CronResult<()> {
        self.release_lease(id);
        let delete_after_run = {
            let mut jobs = self.jobs.lock().await;
            let Some(record) = jobs.get_mut(id) else {
                return Ok(());
            };
            record.running = false;
            record.running_started_at_ms = None;
            record.updated_at = now;
            match &outcome {
                Ok(()) => {
                    record.last_status = Some("ok".to_owned());
                    record.last_error = None;
                }
                Err(message) => {
                    record.last_status = Some("error".to_owned());
                    record.last_error = Some(message.clone());
                }
            }
            outcome.is_ok() && record.job.delete_after_run && matches!(record.job.schedule, Schedule::At(_))
        };
        if delete_after_run {
            return self.unregister(id).await;
        }
        let (last_status, last_error) = {
            let jobs = self.jobs.lock().await;
            let record = &jobs[id];
            (record.last_status.clone(), record.last_error.clone())
        };
        let guard = self.conn.lock().await;
        guard.execute(
            "UPDATE jobs SET last_status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![last_status, last_error, now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    async fn persist_fire(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CronResult<()> {
        let guard = self.conn.lock().await;
        guard.execute(
            "UPDATE jobs SET last_fired = ?1, next_fire = ?2, updated_at = ?3 WHERE id = ?4",
            params![fired_at.to_rfc3339(), next_fire.to_rfc3339(), now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Returns the next fire time for `id`, if registered.
    pub async fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        self.jobs.lock().await.get(id).map(|r| r.next_fire)
    }

    /// Returns all registered job ids.
    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    /// Returns a snapshot of every registered job, for status/listing UIs.
    pub async fn list_jobs(&self) -> Vec<JobSummary> {
        self.jobs
            .lock()
            .await
            .values()
            .map(|r| JobSummary {
                id: r.job.id.clone(),
                name: r.job.name.clone(),
                schedule: r.job.schedule.clone(),
                enabled: r.job.enabled,
                next_fire: r.next_fire,
                last_fired: r.last_fired,
                last_status: r.last_status.clone(),
                last_error: r.last_error.clone(),
                running: r.running,
                delete_after_run: r.job.delete_after_run,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
            .collect()
    }
}

/// Looks up a stored job by id directly from the database, bypassing the
/// in-memory cache. Intended for diagnostics.
pub async fn load_job_row(conn: &Connection, id: &str) -> CronResult<Option<(String, String)>> {
    let row = conn
        .query_row(
            "SELECT schedule_kind, payload FROM jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row)
}

fn encode_schedule(schedule: &Schedule) -> (String, String) {
    match schedule {
        Schedule::At(at) => ("at".to_owned(), at.to_rfc3339()),
        Schedule::Every { anchor, period } => (
            "every".to_owned(),
            format!("{}|{}", anchor.to_rfc3339(), period.num_milliseconds()),
        ),
        Schedule::Cron { expr, tz } => ("cron".to_owned(), format!("{expr}|{tz}")),
    }
}

fn decode_schedule(kind: &str, data: &str) -> Option<Schedule> {
    match kind {
        "at" => DateTime::parse_from_rfc3339(data)
            .ok()
            .map(|dt| Schedule::At(dt.with_timezone(&Utc))),
        "every" => {
            let (anchor_str, period_str) = data.split_once('|')?;
            let anchor = DateTime::parse_from_rfc3339(anchor_str)
                .ok()?
                .with_timezone(&Utc);
            let millis: i64 = period_str.parse().ok()?;
            Some(Schedule::Every {
                anchor,
                period: chrono::Duration::milliseconds(millis),
            })
        }
        "cron" => {
            let (expr, tz_str) = data.split_once('|')?;
            let tz: Tz = tz_str.parse().ok()?;
            Some(Schedule::Cron {
                expr: expr.to_owned(),
                tz,
            })
        }
        _ => None,
    }
}

/// Runs `f` on a fixed interval until the returned guard is dropped.
///
/// This is the lightweight periodic-tick helper shared by the cron scheduler's
/// own tick loop and the ops runtime's health/watchdog ticks; it has no
/// persistence and no recovery semantics of its own.
pub fn every<F, Fut>(period: std::time::Duration, mut f: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            f().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn at_schedule_fires_once() {
        let schedule = Schedule::At(ts("2026-01-01T00:00:00Z"));
        assert_eq!(
            schedule.next_after(ts("2025-12-31T00:00:00Z")),
            Some(ts("2026-01-01T00:00:00Z"))
        );
        assert_eq!(schedule.next_after(ts("2026-01-01T00:00:00Z")), None);
    }

    #[test]
    fn every_schedule_advances_by_period() {
        let schedule = Schedule::Every {
            anchor: ts("2026-01-01T00:00:00Z"),
            period: chrono::Duration::minutes(15),
        };
        assert_eq!(
            schedule.next_after(ts("2026-01-01T00:05:00Z")),
            Some(ts("2026-01-01T00:15:00Z"))
        );
    }

    #[tokio::test]
    async fn tick_returns_due_jobs_and_advances() {
        let scheduler = CronScheduler::in_memory().unwrap();
        scheduler
            .register_at(
                Job::new(
                    "heartbeat",
                    Schedule::Every {
                        anchor: ts("2026-01-01T00:00:00Z"),
                        period: chrono::Duration::minutes(1),
                    },
                    serde_json::json!({"kind": "heartbeat"}),
                ),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();

        let due = scheduler.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "heartbeat");

        let due_again = scheduler.tick(ts("2026-01-01T00:00:30Z")).await.unwrap();
        assert!(due_again.is_empty());

        let due_next = scheduler.tick(ts("2026-01-01T00:01:00Z")).await.unwrap();
        assert_eq!(due_next.len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_job() {
        let scheduler = CronScheduler::in_memory().unwrap();
        scheduler
            .register_at(
                Job::new("once", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({})),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        scheduler.unregister("once").await.unwrap();
        assert!(scheduler.job_ids().await.is_empty());
    }

    #[test]
    fn cron_expression_rejects_garbage() {
        assert!(Schedule::cron("not a cron expr", "UTC").is_err());
    }

    #[test]
    fn cron_expression_computes_next_fire() {
        let schedule = Schedule::cron("0 0 * * * *", "UTC").unwrap();
        let next = schedule.next_after(ts("2026-01-01T00:00:01Z")).unwrap();
        assert_eq!(next, ts("2026-01-01T01:00:00Z"));
    }

    #[tokio::test]
    async fn lease_prevents_double_fire_within_same_process_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::open(dir.path()).await.unwrap();
        scheduler
            .register_at(
                Job::new("job1", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({})),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        let first = scheduler.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        assert_eq!(first.len(), 1);
        // Without releasing the lease, a second scheduler instance sharing the
        // same directory must not be able to claim the same fire.
        let scheduler2 = CronScheduler::open(dir.path()).await.unwrap();
        scheduler2
            .register_at(
                Job::new("job1", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({})),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        let second = scheduler2.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::open(dir.path())
            .await
            .unwrap()
            .with_running_lease_ms(60_000);
        scheduler
            .register_at(
                Job::new("job1", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({})),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        let first = scheduler.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        assert_eq!(first.len(), 1);

        // A crashed runner never released the lease. A second scheduler
        // probing soon after must not be able to claim it...
        let scheduler2 = CronScheduler::open(dir.path())
            .await
            .unwrap()
            .with_running_lease_ms(60_000);
        scheduler2
            .register_at(
                Job::new("job1", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({})),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        assert!(scheduler2.tick(ts("2026-01-01T00:00:30Z")).await.unwrap().is_empty());

        // ...but once the lease is older than the threshold, it's reclaimed.
        let reclaimed = scheduler2.tick(ts("2026-01-01T00:05:00Z")).await.unwrap();
        assert!(reclaimed.is_empty(), "an `At` job that already fired has no further fire time");
    }

    #[tokio::test]
    async fn finish_deletes_one_shot_job_on_success() {
        let scheduler = CronScheduler::in_memory().unwrap();
        scheduler
            .register_at(
                Job::new("once", Schedule::At(ts("2026-01-01T00:00:00Z")), serde_json::json!({}))
                    .with_delete_after_run(true),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        let due = scheduler.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        assert_eq!(due.len(), 1);
        scheduler.finish("once", Ok(()), ts("2026-01-01T00:00:01Z")).await.unwrap();
        assert!(scheduler.job_ids().await.is_empty());
    }

    #[tokio::test]
    async fn finish_records_status_and_error_without_deleting_recurring_job() {
        let scheduler = CronScheduler::in_memory().unwrap();
        scheduler
            .register_at(
                Job::new(
                    "heartbeat",
                    Schedule::Every { anchor: ts("2026-01-01T00:00:00Z"), period: chrono::Duration::minutes(1) },
                    serde_json::json!({}),
                )
                .with_name("Heartbeat"),
                ts("2020-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        scheduler.tick(ts("2026-01-01T00:00:00Z")).await.unwrap();
        scheduler
            .finish("heartbeat", Err("boom".to_owned()), ts("2026-01-01T00:00:01Z"))
            .await
            .unwrap();

        let jobs = scheduler.list_jobs().await;
        let job = jobs.iter().find(|j| j.id == "heartbeat").unwrap();
        assert_eq!(job.name, "Heartbeat");
        assert_eq!(job.last_status.as_deref(), Some("error"));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(!job.running);
    }
}
