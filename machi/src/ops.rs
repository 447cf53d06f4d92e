//! Ops Runtime: a lightweight watchdog built on [`crate::cron::every`] that
//! periodically samples health, and resumes workflow tasks stuck mid-run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::events::{EventLog, TaskState};
use crate::message::InboundMessage;

/// Emits a synthesized `[workflow resume]` inbound message for a task whose
/// last progress is stale, so the router re-enters it.
pub trait ResumeSink: Send + Sync {
    /// Hand a resume message to the channel manager / router.
    fn resume(&self, message: InboundMessage);
}

/// A `Fn`-backed [`ResumeSink`].
pub struct FnResumeSink<F>(pub F);

impl<F> std::fmt::Debug for FnResumeSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnResumeSink").finish_non_exhaustive()
    }
}

impl<F: Fn(InboundMessage) + Send + Sync> ResumeSink for FnResumeSink<F> {
    fn resume(&self, message: InboundMessage) {
        (self.0)(message);
    }
}

/// Snapshot of one health tick, logged only when it differs from the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Number of tasks currently `Running` per the event log projection.
    pub running_tasks: u64,
    /// Number of tasks currently `Failed`.
    pub failed_tasks: u64,
}

/// Parses a synthetic task id of the shape `task:<provider>:<chat_id>:<alias>`
/// used to address the watchdog's recovery messages.
#[must_use]
pub fn parse_task_id(task_id: &str) -> Option<(String, String, String)> {
    let mut parts = task_id.splitn(4, ':');
    if parts.next()? != "task" {
        return None;
    }
    let provider = parts.next()?.to_owned();
    let chat_id = parts.next()?.to_owned();
    let alias = parts.next()?.to_owned();
    Some((provider, chat_id, alias))
}

/// Counters and configuration for the ops runtime's watchdog pass.
pub struct OpsRuntime {
    events: EventLog,
    resume_sink: Arc<dyn ResumeSink>,
    recovery_retry: Duration,
    batch_size: usize,
    last_health: std::sync::Mutex<Option<HealthSnapshot>>,
    resumes_issued: AtomicU64,
}

impl std::fmt::Debug for OpsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsRuntime").finish_non_exhaustive()
    }
}

impl OpsRuntime {
    /// Builds a runtime over `events`, resuming stuck tasks via `resume_sink`.
    #[must_use]
    pub fn new(events: EventLog, resume_sink: Arc<dyn ResumeSink>) -> Self {
        Self {
            events,
            resume_sink,
            recovery_retry: Duration::from_millis(120_000),
            batch_size: 2,
            last_health: std::sync::Mutex::new(None),
            resumes_issued: AtomicU64::new(0),
        }
    }

    /// Overrides the default 120s staleness threshold before a task is
    /// considered eligible for recovery.
    #[must_use]
    pub const fn with_recovery_retry(mut self, retry: Duration) -> Self {
        self.recovery_retry = retry;
        self
    }

    /// Overrides the default per-tick recovery batch size of 2.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Samples current task projections and logs only if the signature
    /// changed since the last call (or `force` is set).
    pub async fn health_tick(&self, force: bool) -> HealthSnapshot {
        let projections = self.events.all_task_projections().await.unwrap_or_default();
        let running_tasks = projections
            .iter()
            .filter(|p| p.state == TaskState::Running)
            .count() as u64;
        let failed_tasks = projections
            .iter()
            .filter(|p| p.state == TaskState::Failed)
            .count() as u64;
        let snapshot = HealthSnapshot {
            running_tasks,
            failed_tasks,
        };

        let mut last = self.last_health.lock().expect("not poisoned");
        if force || last.as_ref() != Some(&snapshot) {
            tracing::info!(
                running = snapshot.running_tasks,
                failed = snapshot.failed_tasks,
                "ops health tick"
            );
        }
        *last = Some(snapshot.clone());
        snapshot
    }

    /// Finds tasks that look stuck (`Running`, whose id parses as a recovery
    /// address, and whose last event is older than the recovery threshold)
    /// and hands up to `batch_size` of them to the resume sink as synthetic
    /// `[workflow resume]` inbound messages.
    ///
    /// `now` and `last_event_age` are supplied by the caller (via RFC 3339
    /// parsing of `last_event_at`) rather than read from the system clock, so
    /// recovery timing is deterministic in tests.
    pub async fn watchdog_tick(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let projections = self.events.all_task_projections().await.unwrap_or_default();
        let mut resumed = 0;
        for projection in projections {
            if resumed >= self.batch_size {
                break;
            }
            // Resumable means still in flight: not yet terminal, and not
            // blocked on a human approval decision.
            if projection.state.is_terminal() || projection.state == TaskState::WaitingApproval {
                continue;
            }
            let Some((provider, chat_id, alias)) = parse_task_id(&projection.task_id) else {
                continue;
            };
            let Ok(last_event_at) = chrono::DateTime::parse_from_rfc3339(&projection.last_event_at)
            else {
                continue;
            };
            let age = now - last_event_at.with_timezone(&chrono::Utc);
            if age < chrono::Duration::from_std(self.recovery_retry).unwrap_or_default() {
                continue;
            }

            self.resume_sink.resume(InboundMessage {
                id: format!("resume-{}", projection.task_id),
                provider,
                sender_id: "ops-runtime".to_owned(),
                chat_id,
                thread_id: None,
                text: format!("[workflow resume] {alias}"),
                media: Vec::new(),
                timestamp: now.to_rfc3339(),
                metadata: serde_json::Map::new(),
            });
            self.resumes_issued.fetch_add(1, Ordering::Relaxed);
            resumed += 1;
        }
        resumed
    }

    /// Total resume messages issued across this runtime's lifetime.
    #[must_use]
    pub fn resumes_issued(&self) -> u64 {
        self.resumes_issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, event};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn parses_well_formed_task_id() {
        let parsed = parse_task_id("task:slack:C123:default").unwrap();
        assert_eq!(parsed, ("slack".to_owned(), "C123".to_owned(), "default".to_owned()));
    }

    #[test]
    fn rejects_malformed_task_id() {
        assert!(parse_task_id("nope").is_none());
        assert!(parse_task_id("task:only:two").is_none());
    }

    struct CollectingSink(StdMutex<Vec<InboundMessage>>);

    impl ResumeSink for CollectingSink {
        fn resume(&self, message: InboundMessage) {
            self.0.lock().expect("not poisoned").push(message);
        }
    }

    #[tokio::test]
    async fn watchdog_resumes_stale_running_task() {
        let events = EventLog::in_memory().unwrap();
        events
            .append(&event(
                "e1",
                Some("task:slack:C1:default".to_owned()),
                EventKind::TaskStarted,
                serde_json::json!({}),
                "2026-01-01T00:00:00Z",
            ))
            .await
            .unwrap();

        let sink = Arc::new(CollectingSink(StdMutex::new(Vec::new())));
        let ops = OpsRuntime::new(events, sink.clone())
            .with_recovery_retry(Duration::from_millis(60_000));

        let now: chrono::DateTime<chrono::Utc> = "2026-01-01T00:05:00Z".parse().unwrap();
        let resumed = ops.watchdog_tick(now).await;
        assert_eq!(resumed, 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert!(sink.0.lock().unwrap()[0].text.contains("workflow resume"));
    }

    #[tokio::test]
    async fn watchdog_skips_fresh_task() {
        let events = EventLog::in_memory().unwrap();
        events
            .append(&event(
                "e1",
                Some("task:slack:C1:default".to_owned()),
                EventKind::TaskStarted,
                serde_json::json!({}),
                "2026-01-01T00:00:00Z",
            ))
            .await
            .unwrap();
        let sink = Arc::new(CollectingSink(StdMutex::new(Vec::new())));
        let ops = OpsRuntime::new(events, sink.clone())
            .with_recovery_retry(Duration::from_millis(120_000));
        let now: chrono::DateTime<chrono::Utc> = "2026-01-01T00:00:05Z".parse().unwrap();
        assert_eq!(ops.watchdog_tick(now).await, 0);
    }

    #[tokio::test]
    async fn health_tick_reports_running_and_failed_counts() {
        let events = EventLog::in_memory().unwrap();
        events
            .append(&event(
                "e1",
                Some("t1".to_owned()),
                EventKind::TaskStarted,
                serde_json::json!({}),
                "2026-01-01T00:00:00Z",
            ))
            .await
            .unwrap();
        events
            .append(&event(
                "e2",
                Some("t2".to_owned()),
                EventKind::TaskFailed,
                serde_json::json!({}),
                "2026-01-01T00:00:00Z",
            ))
            .await
            .unwrap();
        let sink = Arc::new(CollectingSink(StdMutex::new(Vec::new())));
        let ops = OpsRuntime::new(events, sink);
        let snapshot = ops.health_tick(true).await;
        assert_eq!(snapshot.running_tasks, 1);
        assert_eq!(snapshot.failed_tasks, 1);
    }
}
