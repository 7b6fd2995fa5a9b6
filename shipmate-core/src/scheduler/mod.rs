//! Scheduler — cron recurrences and one-shot deliveries over the store's
//! job rows, with a handler registry and a bounded worker pool.
//!
//! Crash safety rests on the store: a due fire is claimed durably
//! ([`Store::claim_job_fire`]) before its handler runs, so a restart
//! mid-fire re-runs nothing that was claimed and fires anything still
//! pending at most one tick late. Handlers are written to be idempotent;
//! a duplicate trigger across restart must not corrupt.
//!
//! Jobs never overlap themselves: the claim is a conditional write, and an
//! in-flight set guards the window between claim and completion for the
//! short-delay timer path.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{MessagingAdapter, SendOptions};
use crate::audit::{AuditLog, AuditStatus};
use crate::error::{SchedulerError, ShipmateError};
use crate::store::{JobSpec, ScheduledJob, Store};

/// Per-fire handler deadline.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays below this also get an in-memory timer so the fire lands on
/// time rather than at the next tick.
const TIMER_THRESHOLD_SECS: i64 = 60;

/// A named job handler. Handlers must be idempotent: a claimed fire that
/// crashes mid-run may be re-attempted by an operator, never by the
/// scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one fire. An `Ok(Some(text))` is delivered to the chat recorded
    /// in `params.chat_id`.
    async fn run(&self, params: &Value) -> Result<Option<String>, ShipmateError>;
}

/// The scheduler service. Constructed shared: the in-memory timer path
/// for short delays needs a handle back to the service from inside its
/// spawned task.
pub struct Scheduler {
    store: Arc<Store>,
    messenger: Arc<dyn MessagingAdapter>,
    audit: Arc<AuditLog>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    in_flight: Mutex<HashSet<String>>,
    pool: tokio::sync::Semaphore,
    tick_interval: Duration,
    weak: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        messenger: Arc<dyn MessagingAdapter>,
        audit: Arc<AuditLog>,
        pool_size: usize,
        tick_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            messenger,
            audit,
            handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            pool: tokio::sync::Semaphore::new(pool_size.max(1)),
            tick_interval,
            weak: weak.clone(),
        })
    }

    /// Register a handler under a name jobs refer to.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        debug!(handler = %name, "registering job handler");
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(name, handler);
    }

    /// Schedule a job. The handler must already be registered; a duplicate
    /// name is a conflict unless `replace` is set.
    pub fn schedule(
        &self,
        job_name: &str,
        spec: JobSpec,
        handler: &str,
        params: Value,
        user_id: Option<&str>,
        replace: bool,
    ) -> Result<(), ShipmateError> {
        if !self
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .contains_key(handler)
        {
            return Err(SchedulerError::HandlerNotFound {
                handler: handler.to_string(),
            }
            .into());
        }
        self.store
            .upsert_job(job_name, &spec, handler, &params, user_id, replace)
            .map_err(|e| match e {
                crate::error::StoreError::Constraint { .. } => {
                    ShipmateError::from(SchedulerError::JobAlreadyExists {
                        name: job_name.to_string(),
                    })
                }
                other => other.into(),
            })?;
        info!(job = job_name, handler, "job scheduled");

        // Short one-shot delays also get an in-memory timer so delivery is
        // punctual; the persisted row makes a restart fire it late instead
        // of losing it.
        if let JobSpec::OneShot { trigger_at } = spec {
            let delay = trigger_at - Utc::now();
            if delay <= ChronoDuration::seconds(TIMER_THRESHOLD_SECS) {
                if let Some(scheduler) = self.weak.upgrade() {
                    let name = job_name.to_string();
                    tokio::spawn(async move {
                        if delay > ChronoDuration::zero() {
                            tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                        }
                        scheduler.fire_if_due(&name, Utc::now()).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Cancel a job by name. Clears any pending in-memory timer's effect
    /// (the claim will fail on the cancelled row) and marks the row.
    pub fn cancel_by_name(&self, job_name: &str) -> Result<(), ShipmateError> {
        self.store.cancel_job(job_name).map_err(|e| match e {
            crate::error::StoreError::RowNotFound { .. } => {
                ShipmateError::from(SchedulerError::JobNotFound {
                    name: job_name.to_string(),
                })
            }
            other => other.into(),
        })?;
        info!(job = job_name, "job cancelled");
        Ok(())
    }

    /// Look up a job by name.
    pub fn get_job_by_name(&self, job_name: &str) -> Result<Option<ScheduledJob>, ShipmateError> {
        Ok(self.store.get_job(job_name)?)
    }

    /// A user's pending reminders, soonest first.
    pub fn reminders_for(&self, user_id: &str) -> Result<Vec<ScheduledJob>, ShipmateError> {
        Ok(self.store.jobs_for_user(user_id)?)
    }

    /// Run every job due at `now`. Each due job fires at most once per
    /// due-instant, even across restart; fires run concurrently on the
    /// bounded pool and this call waits for all of them.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match self.store.due_jobs(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "tick could not read due jobs");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "tick found due jobs");
        let fires = due
            .into_iter()
            .map(|job| async move { self.fire_if_due(&job.name, now).await });
        join_all(fires).await;
    }

    /// Claim and run one job if it is still due. The claim write is the
    /// exactly-once gate; losing the claim means another path already
    /// fired this instant.
    async fn fire_if_due(&self, name: &str, now: DateTime<Utc>) {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(name.to_string()) {
                return;
            }
        }
        let result = self.fire_locked(name, now).await;
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(name);
        if let Err(e) = result {
            error!(job = name, error = %e, "job fire failed");
        }
    }

    async fn fire_locked(&self, name: &str, now: DateTime<Utc>) -> Result<(), ShipmateError> {
        let Some(job) = self.store.get_job(name)? else {
            return Ok(());
        };
        let handler = self
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .get(&job.handler)
            .cloned();
        let Some(handler) = handler else {
            warn!(job = name, handler = %job.handler, "no handler registered; skipping fire");
            return Ok(());
        };

        // Durable claim before dispatch.
        if !self.store.claim_job_fire(name, now)? {
            return Ok(());
        }

        let _permit = self
            .pool
            .acquire()
            .await
            .expect("scheduler pool semaphore closed");

        let outcome = tokio::time::timeout(HANDLER_TIMEOUT, handler.run(&job.params)).await;
        let (success, message, error_text) = match outcome {
            Ok(Ok(message)) => (true, message, None),
            Ok(Err(e)) => (false, None, Some(e.to_string())),
            Err(_) => (
                false,
                None,
                Some(format!("handler deadline ({}s) reached", HANDLER_TIMEOUT.as_secs())),
            ),
        };

        if let JobSpec::OneShot { .. } = job.spec {
            // Claim already moved the row to completed; only demote on failure.
            if !success {
                self.store.mark_job_result(name, false)?;
            }
        } else {
            self.store.mark_job_result(name, success)?;
        }

        self.audit.record(
            "job.fire",
            name,
            if success { AuditStatus::Success } else { AuditStatus::Failed },
            "scheduler",
            serde_json::json!({"handler": job.handler, "error": error_text}),
        );

        if let Some(text) = message {
            let chat_id = job.params.get("chat_id").and_then(Value::as_str);
            match chat_id {
                Some(chat_id) => {
                    if let Err(e) = self.messenger.send(chat_id, &text, SendOptions::default()).await
                    {
                        warn!(job = name, error = %e, "could not deliver job message");
                    }
                }
                None => warn!(job = name, "handler returned a message but params carry no chat_id"),
            }
        }
        Ok(())
    }

    /// Tick until cancelled, then drain: in-flight fires finish before
    /// this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.tick_interval.as_secs(), "scheduler running");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.cancelled() => {
                    info!("scheduler draining");
                    // tick() awaits its fires, so reaching here means no
                    // tick-path work is outstanding; wait out timer fires.
                    while !self.in_flight.lock().expect("in-flight lock poisoned").is_empty() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Messenger that records sends.
    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingAdapter for RecordingMessenger {
        async fn send(
            &self,
            chat_id: &str,
            text: &str,
            _opts: SendOptions,
        ) -> Result<(), AdapterError> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Handler that counts runs and echoes a message.
    struct EchoHandler {
        runs: AtomicUsize,
        fail: bool,
    }

    impl EchoHandler {
        fn new(fail: bool) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(&self, params: &Value) -> Result<Option<String>, ShipmateError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SchedulerError::Persistence {
                    message: "boom".into(),
                }
                .into());
            }
            Ok(params.get("msg").and_then(Value::as_str).map(String::from))
        }
    }

    fn scheduler_with(
        handler: Arc<EchoHandler>,
    ) -> (Arc<Scheduler>, Arc<RecordingMessenger>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let messenger = Arc::new(RecordingMessenger::default());
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            messenger.clone() as Arc<dyn MessagingAdapter>,
            Arc::new(AuditLog::default()),
            4,
            Duration::from_secs(30),
        );
        scheduler.register_handler("echo", handler);
        (scheduler, messenger, store)
    }

    #[tokio::test]
    async fn test_schedule_requires_registered_handler() {
        let (scheduler, _, _) = scheduler_with(Arc::new(EchoHandler::new(false)));
        let err = scheduler
            .schedule(
                "j",
                JobSpec::one_shot(Utc::now() + ChronoDuration::hours(1)),
                "missing",
                serde_json::json!({}),
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Scheduler(SchedulerError::HandlerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflict_and_replace() {
        let (scheduler, _, _) = scheduler_with(Arc::new(EchoHandler::new(false)));
        let at = Utc::now() + ChronoDuration::hours(1);
        scheduler
            .schedule("j", JobSpec::one_shot(at), "echo", serde_json::json!({}), None, false)
            .unwrap();
        let err = scheduler
            .schedule("j", JobSpec::one_shot(at), "echo", serde_json::json!({}), None, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Scheduler(SchedulerError::JobAlreadyExists { .. })
        ));
        scheduler
            .schedule("j", JobSpec::one_shot(at), "echo", serde_json::json!({}), None, true)
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_fires_due_job_and_delivers() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, messenger, _) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "reminder-1",
                JobSpec::one_shot(Utc::now() + ChronoDuration::hours(2)),
                "echo",
                serde_json::json!({"chat_id": "C1", "msg": "standup"}),
                Some("u1"),
                false,
            )
            .unwrap();

        // Not due yet.
        scheduler.tick(Utc::now()).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

        // Due at a simulated later instant.
        scheduler.tick(Utc::now() + ChronoDuration::hours(3)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "C1");
        assert!(sent[0].1.contains("standup"));
    }

    #[tokio::test]
    async fn test_exactly_once_across_double_tick() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, _, _) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "once",
                JobSpec::one_shot(Utc::now() - ChronoDuration::seconds(120)),
                "echo",
                serde_json::json!({"chat_id": "C1", "msg": "hi"}),
                None,
                false,
            )
            .unwrap();

        // Let any short-delay timer fire settle first, then double-tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let runs_after_timer = handler.runs.load(Ordering::SeqCst);
        assert!(runs_after_timer <= 1);

        scheduler.tick(Utc::now()).await;
        scheduler.tick(Utc::now()).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_job_never_refires_across_restart() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, _, store) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "once",
                JobSpec::one_shot(Utc::now() - ChronoDuration::minutes(5)),
                "echo",
                serde_json::json!({"chat_id": "C1"}),
                None,
                false,
            )
            .unwrap();
        scheduler.tick(Utc::now()).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);

        // Simulate a restart: a fresh scheduler over the same store.
        let handler2 = Arc::new(EchoHandler::new(false));
        let scheduler2 = Scheduler::new(
            store,
            Arc::new(RecordingMessenger::default()) as Arc<dyn MessagingAdapter>,
            Arc::new(AuditLog::default()),
            4,
            Duration::from_secs(30),
        );
        scheduler2.register_handler("echo", handler2.clone());
        scheduler2.tick(Utc::now()).await;
        assert_eq!(handler2.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_marks_job_failed() {
        let handler = Arc::new(EchoHandler::new(true));
        let (scheduler, messenger, store) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "doomed",
                JobSpec::one_shot(Utc::now() - ChronoDuration::minutes(1)),
                "echo",
                serde_json::json!({"chat_id": "C1"}),
                None,
                false,
            )
            .unwrap();
        scheduler.tick(Utc::now()).await;

        let job = store.get_job("doomed").unwrap().unwrap();
        assert_eq!(job.status, crate::store::JobStatus::Failed);
        assert!(messenger.sent.lock().unwrap().is_empty());

        // Failed one-shots are not retried.
        scheduler.tick(Utc::now()).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_delay_timer_fires_without_tick() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, messenger, _) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "soon",
                JobSpec::one_shot(Utc::now() + ChronoDuration::milliseconds(50)),
                "echo",
                serde_json::json!({"chat_id": "C1", "msg": "ping"}),
                Some("u1"),
                false,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_clears_pending_reminder() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, _, _) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "r1",
                JobSpec::one_shot(Utc::now() + ChronoDuration::hours(1)),
                "echo",
                serde_json::json!({"chat_id": "C1"}),
                Some("u1"),
                false,
            )
            .unwrap();
        assert_eq!(scheduler.reminders_for("u1").unwrap().len(), 1);

        scheduler.cancel_by_name("r1").unwrap();
        assert!(scheduler.reminders_for("u1").unwrap().is_empty());
        scheduler.tick(Utc::now() + ChronoDuration::hours(2)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

        assert!(matches!(
            scheduler.cancel_by_name("ghost").unwrap_err(),
            ShipmateError::Scheduler(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cron_job_refires_on_subsequent_instants() {
        let handler = Arc::new(EchoHandler::new(false));
        let (scheduler, _, _) = scheduler_with(handler.clone());
        scheduler
            .schedule(
                "minutely",
                JobSpec::cron("* * * * *").unwrap(),
                "echo",
                serde_json::json!({"chat_id": "C1"}),
                None,
                false,
            )
            .unwrap();

        let base = Utc::now();
        scheduler.tick(base + ChronoDuration::minutes(2)).await;
        scheduler.tick(base + ChronoDuration::minutes(4)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

        // Same instant twice does not double-fire.
        scheduler.tick(base + ChronoDuration::minutes(4)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    }
}
