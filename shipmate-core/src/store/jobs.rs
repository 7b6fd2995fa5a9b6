//! Scheduled job rows — cron recurrences and one-shot deliveries.
//!
//! The scheduler's crash-safety contract lives here: a job's
//! `last_run`/`status` transition is written durably *before* its handler
//! runs, so a restart mid-fire can never double-fire a one-shot. `next_run`
//! is recomputed on any write that changes the schedule or enablement.

use chrono::{DateTime, Utc};
use cron::Schedule;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{parse_ts, ts, Store};
use crate::error::{SchedulerError, StoreError};

/// When a job fires: a cron recurrence or a single absolute instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Cron { expression: String },
    OneShot { trigger_at: DateTime<Utc> },
}

impl JobSpec {
    /// Parse and validate a cron spec. Five-field expressions get the
    /// seconds column prepended so operators can write standard crontab
    /// syntax.
    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        let normalized = normalize_cron(expression);
        Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        Ok(JobSpec::Cron {
            expression: normalized,
        })
    }

    /// A one-shot instant.
    pub fn one_shot(trigger_at: DateTime<Utc>) -> Self {
        JobSpec::OneShot { trigger_at }
    }

    /// The next fire instant strictly after `after`. One-shots return their
    /// instant regardless, so a restart past the trigger still sees it due.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSpec::Cron { expression } => Schedule::from_str(expression)
                .ok()
                .and_then(|s| s.after(&after).next()),
            JobSpec::OneShot { trigger_at } => Some(*trigger_at),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, JobSpec::OneShot { .. })
    }
}

/// Prepend a seconds column to 5-field crontab expressions. Expressions
/// with 6+ fields pass through untouched.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::InvalidField {
                field: "status".into(),
                message: other.to_string(),
            }),
        }
    }
}

/// One persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub spec: JobSpec,
    pub handler: String,
    pub params: serde_json::Value,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub user_id: Option<String>,
}

const JOB_COLS: &str =
    "name, kind, cron_expr, trigger_at, handler, params, enabled, last_run, next_run, status, user_id";

type JobRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    bool,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn build_job(raw: JobRow) -> Result<ScheduledJob, StoreError> {
    let (name, kind, cron_expr, trigger_at, handler, params, enabled, last_run, next_run, status, user_id) =
        raw;
    let spec = match kind.as_str() {
        "cron" => JobSpec::Cron {
            expression: cron_expr.ok_or_else(|| StoreError::InvalidField {
                field: "cron_expr".into(),
                message: "missing for cron job".into(),
            })?,
        },
        "one_shot" => JobSpec::OneShot {
            trigger_at: parse_ts(&trigger_at.ok_or_else(|| StoreError::InvalidField {
                field: "trigger_at".into(),
                message: "missing for one-shot job".into(),
            })?)?,
        },
        other => {
            return Err(StoreError::InvalidField {
                field: "kind".into(),
                message: other.to_string(),
            })
        }
    };
    Ok(ScheduledJob {
        name,
        spec,
        handler,
        params: serde_json::from_str(&params).unwrap_or(serde_json::Value::Null),
        enabled,
        last_run: last_run.as_deref().map(parse_ts).transpose()?,
        next_run: next_run.as_deref().map(parse_ts).transpose()?,
        status: JobStatus::parse(&status)?,
        user_id,
    })
}

impl Store {
    /// Insert a job. With `replace` the existing row (if any) is
    /// overwritten; without it a duplicate name is a constraint error.
    /// `next_run` is computed from the spec at write time.
    pub fn upsert_job(
        &self,
        name: &str,
        spec: &JobSpec,
        handler: &str,
        params: &serde_json::Value,
        user_id: Option<&str>,
        replace: bool,
    ) -> Result<(), StoreError> {
        let next_run = spec.next_occurrence(Utc::now());
        let (kind, cron_expr, trigger_at) = match spec {
            JobSpec::Cron { expression } => ("cron", Some(expression.clone()), None),
            JobSpec::OneShot { trigger_at } => ("one_shot", None, Some(ts(*trigger_at))),
        };
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let conn = self.lock();
        conn.execute(
            &format!(
                "{verb} INTO scheduled_jobs
                 (name, kind, cron_expr, trigger_at, handler, params, enabled, next_run, status, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, 'pending', ?8)"
            ),
            params![
                name,
                kind,
                cron_expr,
                trigger_at,
                handler,
                params.to_string(),
                next_run.map(ts),
                user_id
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint {
                    collection: "scheduled_jobs".into(),
                    message: format!("job '{name}' already exists"),
                }
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Fetch a job by name.
    pub fn get_job(&self, name: &str) -> Result<Option<ScheduledJob>, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLS} FROM scheduled_jobs WHERE name = ?1"),
                params![name],
                job_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;
        raw.map(build_job).transpose()
    }

    /// Every enabled job that can still fire.
    pub fn pending_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        self.query_jobs(
            "WHERE enabled = 1 AND (kind = 'cron' OR status = 'pending')
             ORDER BY next_run",
            &[],
        )
    }

    /// Jobs due at `now`: enabled, fireable, with `next_run <= now`.
    /// Cron jobs stay fireable regardless of the last fire's outcome;
    /// one-shots only fire from `pending`.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let now = ts(now);
        self.query_jobs(
            "WHERE enabled = 1 AND (kind = 'cron' OR status = 'pending')
             AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run",
            &[&now as &dyn rusqlite::ToSql],
        )
    }

    /// Pending one-shot jobs owned by a user (their reminders), soonest
    /// first.
    pub fn jobs_for_user(&self, user_id: &str) -> Result<Vec<ScheduledJob>, StoreError> {
        self.query_jobs(
            "WHERE user_id = ?1 AND kind = 'one_shot' AND status = 'pending' AND enabled = 1
             ORDER BY next_run",
            &[&user_id as &dyn rusqlite::ToSql],
        )
    }

    fn query_jobs(
        &self,
        where_clause: &str,
        binds: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLS} FROM scheduled_jobs {where_clause}"))?;
        let raw: Vec<JobRow> = stmt
            .query_map(binds, job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(build_job).collect()
    }

    /// Durably claim a due fire before the handler runs.
    ///
    /// Cron jobs advance `next_run` past `now` and record `last_run`;
    /// one-shots additionally move `pending -> completed` so a crash during
    /// the handler can never re-fire them. Returns `false` when another
    /// claimant (or a concurrent tick) already advanced the row.
    pub fn claim_job_fire(&self, name: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(job) = self.get_job(name)? else {
            return Ok(false);
        };
        let due = job.enabled
            && job.next_run.map(|n| n <= now).unwrap_or(false)
            && (matches!(job.spec, JobSpec::Cron { .. }) || job.status == JobStatus::Pending);
        if !due {
            return Ok(false);
        }
        let conn = self.lock();
        let changed = match &job.spec {
            JobSpec::Cron { .. } => {
                let next = job.spec.next_occurrence(now);
                conn.execute(
                    "UPDATE scheduled_jobs
                     SET last_run = ?1, next_run = ?2
                     WHERE name = ?3 AND next_run = ?4",
                    params![ts(now), next.map(ts), name, job.next_run.map(ts)],
                )?
            }
            JobSpec::OneShot { .. } => conn.execute(
                "UPDATE scheduled_jobs
                 SET last_run = ?1, status = 'completed'
                 WHERE name = ?2 AND status = 'pending'",
                params![ts(now), name],
            )?,
        };
        Ok(changed > 0)
    }

    /// Record the handler outcome after a claimed fire.
    pub fn mark_job_result(&self, name: &str, success: bool) -> Result<(), StoreError> {
        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let conn = self.lock();
        conn.execute(
            "UPDATE scheduled_jobs SET status = ?1 WHERE name = ?2",
            params![status.as_str(), name],
        )?;
        Ok(())
    }

    /// Cancel a job: disable it and mark the row cancelled.
    pub fn cancel_job(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE scheduled_jobs SET status = 'cancelled', enabled = 0 WHERE name = ?1",
            params![name],
        )?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                collection: "scheduled_jobs".into(),
            });
        }
        Ok(())
    }

    /// Enable or disable a job. Enabling recomputes `next_run` so a stale
    /// instant in the past does not cause a burst of catch-up fires.
    pub fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let job = self.get_job(name)?.ok_or_else(|| StoreError::RowNotFound {
            collection: "scheduled_jobs".into(),
        })?;
        let next_run = if enabled {
            job.spec.next_occurrence(Utc::now())
        } else {
            job.next_run
        };
        let conn = self.lock();
        conn.execute(
            "UPDATE scheduled_jobs SET enabled = ?1, next_run = ?2 WHERE name = ?3",
            params![enabled, next_run.map(ts), name],
        )?;
        Ok(())
    }
}
