//! Reminders: one-shot scheduled deliveries back to the requesting chat.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use shipmate_core::error::{ErrorKind, ShipmateError};
use shipmate_core::scheduler::JobHandler;
use shipmate_core::skills::helpers::{usage_error, SkillLogger};
use shipmate_core::skills::{CommandSpec, MessageContext, Skill, SkillContext};
use shipmate_core::store::JobSpec;
use shipmate_core::types::SkillResult;

/// Upper bound on relative delays: 24 hours.
const MAX_MINUTES: i64 = 1440;

/// The scheduler handler reminders fire through.
pub struct ReminderHandler;

#[async_trait]
impl JobHandler for ReminderHandler {
    async fn run(&self, params: &Value) -> Result<Option<String>, ShipmateError> {
        let msg = params.get("msg").and_then(Value::as_str).unwrap_or("(no message)");
        Ok(Some(format!("Reminder: {msg}")))
    }
}

/// Sets, lists, and cancels reminders.
pub struct RemindersSkill {
    relative_re: Regex,
    at_re: Regex,
    cancel_re: Regex,
    log: SkillLogger,
}

impl RemindersSkill {
    pub fn new() -> Self {
        Self {
            relative_re: Regex::new(r"(?i)^remind\s+me\s+(.+?)\s+in\s+(\d+)\s*(m|min|mins|minutes|h|hr|hrs|hours)$")
                .expect("static pattern"),
            at_re: Regex::new(r"(?i)^remind\s+me\s+(.+?)\s+at\s+(\d{1,2}):(\d{2})$")
                .expect("static pattern"),
            cancel_re: Regex::new(r"(?i)^cancel\s+reminder\s+(\d+)$").expect("static pattern"),
            log: SkillLogger::new("reminders"),
        }
    }

    fn schedule_at(
        &self,
        ctx: &MessageContext,
        msg: &str,
        trigger_at: DateTime<Utc>,
    ) -> Result<SkillResult, ShipmateError> {
        let name = format!("reminder-{}", &Uuid::new_v4().simple().to_string()[..10]);
        ctx.services.scheduler.schedule(
            &name,
            JobSpec::one_shot(trigger_at),
            "reminder",
            serde_json::json!({"chat_id": ctx.message.chat_id, "msg": msg}),
            Some(&ctx.message.sender_id),
            false,
        )?;
        self.log.info(&format!("reminder {name} set for {trigger_at}"));
        let delta = trigger_at - Utc::now();
        Ok(SkillResult::ok(format!(
            "Reminder set: \"{msg}\" in {}.",
            human_delta(delta)
        ))
        .with_data(serde_json::json!({"job": name, "at": trigger_at.to_rfc3339()})))
    }

    fn list(&self, ctx: &MessageContext) -> Result<SkillResult, ShipmateError> {
        let reminders = ctx.services.scheduler.reminders_for(&ctx.message.sender_id)?;
        if reminders.is_empty() {
            return Ok(SkillResult::ok("No reminders set."));
        }
        let lines: Vec<String> = reminders
            .iter()
            .enumerate()
            .map(|(i, job)| {
                let msg = job.params.get("msg").and_then(Value::as_str).unwrap_or("?");
                let when = job
                    .next_run
                    .map(|t| human_delta(t - Utc::now()))
                    .unwrap_or_else(|| "?".into());
                format!("{}. \"{msg}\" in {when}", i + 1)
            })
            .collect();
        Ok(SkillResult::ok(format!(
            "Reminders ({}):\n{}",
            reminders.len(),
            lines.join("\n")
        ))
        .with_data(serde_json::json!({"count": reminders.len()})))
    }

    fn cancel(&self, ctx: &MessageContext, index: usize) -> Result<SkillResult, ShipmateError> {
        let reminders = ctx.services.scheduler.reminders_for(&ctx.message.sender_id)?;
        let Some(job) = index.checked_sub(1).and_then(|i| reminders.get(i)) else {
            return Ok(SkillResult::err(
                ErrorKind::NotFound,
                format!("No reminder #{index}."),
            )
            .with_suggestion("my reminders"));
        };
        ctx.services.scheduler.cancel_by_name(&job.name)?;
        Ok(SkillResult::ok(format!("Reminder #{index} cancelled.")))
    }
}

impl Default for RemindersSkill {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a duration the way a person says it.
fn human_delta(delta: Duration) -> String {
    let minutes = delta.num_minutes();
    if minutes < 1 {
        format!("{} seconds", delta.num_seconds().max(0))
    } else if minutes < 60 {
        format!("{minutes} minute(s)")
    } else {
        format!("{}h{:02}m", minutes / 60, minutes % 60)
    }
}

#[async_trait]
impl Skill for RemindersSkill {
    fn name(&self) -> &str {
        "reminders"
    }

    fn description(&self) -> &str {
        "One-shot reminders delivered back to this chat"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                pattern: r"^remind me <msg> in <N> m|h".into(),
                usage: "remind me <msg> in <N> {m|h}".into(),
                description: "relative reminder, up to 24h".into(),
            },
            CommandSpec {
                pattern: r"^remind me <msg> at HH:MM".into(),
                usage: "remind me <msg> at HH:MM".into(),
                description: "absolute reminder, tomorrow if past".into(),
            },
            CommandSpec {
                pattern: r"^my reminders$".into(),
                usage: "my reminders".into(),
                description: "list pending reminders".into(),
            },
            CommandSpec {
                pattern: r"^cancel reminder <n>$".into(),
                usage: "cancel reminder <n>".into(),
                description: "cancel the nth reminder".into(),
            },
        ]
    }

    async fn initialize(&self, ctx: &SkillContext) -> Result<(), ShipmateError> {
        ctx.scheduler
            .register_handler("reminder", std::sync::Arc::new(ReminderHandler));
        Ok(())
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        let t = text.trim().to_lowercase();
        t.starts_with("remind me")
            || t == "my reminders"
            || t == "list reminders"
            || self.cancel_re.is_match(text.trim())
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        let text = text.trim();
        let lower = text.to_lowercase();

        if let Some(c) = self.relative_re.captures(text) {
            let msg = c[1].to_string();
            let n: i64 = c[2].parse().unwrap_or(0);
            let unit = c[3].to_lowercase();
            let minutes = if unit.starts_with('h') { n * 60 } else { n };
            if n <= 0 || minutes > MAX_MINUTES {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    format!("Delay must be between 1 minute and 24 hours, got {n}{unit}."),
                )
                .with_suggestion("remind me <msg> in 30 m"));
            }
            return self.schedule_at(ctx, &msg, Utc::now() + Duration::minutes(minutes));
        }

        if let Some(c) = self.at_re.captures(text) {
            let msg = c[1].to_string();
            let (hour, minute): (u32, u32) = (c[2].parse().unwrap_or(99), c[3].parse().unwrap_or(99));
            let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    format!("{hour}:{minute:02} is not a valid 24-hour time."),
                ));
            };
            // Interpret in the operator's local timezone; tomorrow if past.
            let now = Local::now();
            let mut local = now.date_naive().and_time(time);
            if local <= now.naive_local() {
                local += Duration::days(1);
            }
            let trigger_at = local
                .and_local_timezone(Local)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc::now() + Duration::days(1));
            return self.schedule_at(ctx, &msg, trigger_at);
        }

        if lower == "my reminders" || lower == "list reminders" {
            return self.list(ctx);
        }

        if let Some(c) = self.cancel_re.captures(text) {
            let index: usize = c[1].parse().unwrap_or(0);
            return self.cancel(ctx, index);
        }

        Ok(usage_error("remind me <msg> in <N> {m|h}  |  remind me <msg> at HH:MM"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipmate_core::test_support::services;
    use shipmate_core::types::InboundMessage;

    async fn ctx_for(chat: &str, sender: &str) -> MessageContext {
        let services = services().await;
        let skill = RemindersSkill::new();
        skill.initialize(&services).await.unwrap();
        MessageContext {
            message: InboundMessage::text(chat, sender, "", "test"),
            chat: Default::default(),
            services,
        }
    }

    #[tokio::test]
    async fn test_relative_reminder_roundtrip() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;

        let result = skill
            .execute("remind me standup in 1 minutes", &ctx)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("standup"));

        let listed = skill.execute("my reminders", &ctx).await.unwrap();
        assert!(listed.message.contains("1. \"standup\""));

        // Another user sees nothing.
        let other = ctx_for("C1", "u2").await;
        let skill2 = RemindersSkill::new();
        let listed = skill2.execute("my reminders", &other).await.unwrap();
        assert!(listed.message.contains("No reminders"));
    }

    #[tokio::test]
    async fn test_bounds_rejected() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;

        let result = skill
            .execute("remind me too-long in 1441 m", &ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::BadArgument));

        let result = skill.execute("remind me later in 25 h", &ctx).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_hours_accepted_within_bound() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;
        let result = skill.execute("remind me ship it in 2 h", &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.message.contains("2h00m"));
    }

    #[tokio::test]
    async fn test_at_time_invalid_rejected() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;
        let result = skill.execute("remind me x at 27:00", &ctx).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_at_time_schedules_future_instant() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;
        let result = skill.execute("remind me review PRs at 23:59", &ctx).await.unwrap();
        assert!(result.success, "{}", result.message);

        let reminders = ctx.services.scheduler.reminders_for("u1").unwrap();
        assert_eq!(reminders.len(), 1);
        assert!(reminders[0].next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_cancel_by_index() {
        let skill = RemindersSkill::new();
        let ctx = ctx_for("C1", "u1").await;
        skill.execute("remind me a in 10 m", &ctx).await.unwrap();
        skill.execute("remind me b in 20 m", &ctx).await.unwrap();

        let result = skill.execute("cancel reminder 1", &ctx).await.unwrap();
        assert!(result.success);

        let listed = skill.execute("my reminders", &ctx).await.unwrap();
        assert!(listed.message.contains("\"b\""));
        assert!(!listed.message.contains("\"a\""));

        let missing = skill.execute("cancel reminder 9", &ctx).await.unwrap();
        assert!(!missing.success);
        assert_eq!(missing.kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_reminder_handler_message() {
        let handler = ReminderHandler;
        let msg = handler
            .run(&serde_json::json!({"chat_id": "C1", "msg": "standup"}))
            .await
            .unwrap();
        assert_eq!(msg.as_deref(), Some("Reminder: standup"));
    }
}
