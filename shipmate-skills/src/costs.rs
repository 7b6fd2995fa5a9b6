//! Cost reporting: spend summaries, budgets, and optimization hints.

use async_trait::async_trait;
use regex::Regex;

use shipmate_core::cost::CostPeriod;
use shipmate_core::error::{ErrorKind, ShipmateError};
use shipmate_core::skills::helpers::SkillLogger;
use shipmate_core::skills::{CommandSpec, MessageContext, Skill};
use shipmate_core::types::SkillResult;

/// Reports what the AI providers are costing.
pub struct CostsSkill {
    budget_re: Regex,
    log: SkillLogger,
}

impl CostsSkill {
    pub fn new() -> Self {
        Self {
            budget_re: Regex::new(r"(?i)^cost\s+budget\s+\$?([\d.]+)$").expect("static pattern"),
            log: SkillLogger::new("costs"),
        }
    }

    fn report(&self, ctx: &MessageContext) -> SkillResult {
        let summary = ctx.services.cost.summary(CostPeriod::CurrentMonth);
        let mut lines = vec![format!(
            "This month: ${:.4} across {} calls",
            summary.total, summary.entry_count
        )];
        for (provider, total) in &summary.by_provider {
            lines.push(format!("  {provider}: ${total:.4}"));
        }
        match ctx.services.cost.budget_status() {
            Some(status) => {
                lines.push(format!(
                    "Budget: ${:.2} | spent ${:.4} | remaining ${:.4} | projected ${:.2}{}",
                    status.budget,
                    status.spent,
                    status.remaining,
                    status.projected_month_end,
                    if status.over_budget { " (OVER BUDGET)" } else { "" }
                ));
            }
            None => lines.push("No budget set. Set one with: cost budget <amt>".into()),
        }
        SkillResult::ok(lines.join("\n")).with_data(serde_json::to_value(&summary).unwrap_or_default())
    }

    fn breakdown(&self, ctx: &MessageContext) -> SkillResult {
        let summary = ctx.services.cost.summary(CostPeriod::CurrentMonth);
        if summary.by_breakdown.is_empty() {
            return SkillResult::ok("No provider calls recorded this month.");
        }
        let mut rows: Vec<(&String, &f64)> = summary.by_breakdown.iter().collect();
        rows.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        let lines: Vec<String> = rows
            .iter()
            .map(|(key, total)| format!("  {key}: ${total:.4}"))
            .collect();
        SkillResult::ok(format!("Breakdown (provider/model/task):\n{}", lines.join("\n")))
    }

    fn history(&self, ctx: &MessageContext) -> SkillResult {
        let entries = ctx.services.cost.entries();
        if entries.is_empty() {
            return SkillResult::ok("No provider calls recorded.");
        }
        let lines: Vec<String> = entries
            .iter()
            .rev()
            .take(10)
            .map(|e| {
                format!(
                    "  {} {}/{} {}+{} tokens ${:.4} [{}]",
                    e.timestamp.format("%m-%d %H:%M"),
                    e.provider,
                    e.model,
                    e.input_tokens,
                    e.output_tokens,
                    e.estimated_cost,
                    e.task_type.as_str()
                )
            })
            .collect();
        SkillResult::ok(format!("Recent calls:\n{}", lines.join("\n")))
    }

    fn optimize(&self, ctx: &MessageContext) -> SkillResult {
        let cache_hit_rate = Some(ctx.services.router.metrics().cache_hit_rate);
        let suggestions = ctx.services.cost.optimization_suggestions(cache_hit_rate);
        if suggestions.is_empty() {
            return SkillResult::ok("Nothing to optimize: spend looks healthy.");
        }
        let lines: Vec<String> = suggestions
            .iter()
            .map(|s| format!("  [{}] {}", s.rule, s.message))
            .collect();
        SkillResult::ok(format!("Optimization suggestions:\n{}", lines.join("\n")))
    }
}

impl Default for CostsSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for CostsSkill {
    fn name(&self) -> &str {
        "costs"
    }

    fn description(&self) -> &str {
        "AI provider spend: reports, budgets, optimization"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                pattern: r"^(ai|api) costs$|^cost report$".into(),
                usage: "ai costs | cost report | api costs".into(),
                description: "month-to-date spend by provider".into(),
            },
            CommandSpec {
                pattern: r"^cost breakdown$".into(),
                usage: "cost breakdown".into(),
                description: "spend by provider/model/task".into(),
            },
            CommandSpec {
                pattern: r"^cost budget <amt>$".into(),
                usage: "cost budget <amt>".into(),
                description: "set the monthly budget".into(),
            },
            CommandSpec {
                pattern: r"^cost history$".into(),
                usage: "cost history".into(),
                description: "recent provider calls".into(),
            },
            CommandSpec {
                pattern: r"^cost optimize$".into(),
                usage: "cost optimize".into(),
                description: "static spend-reduction suggestions".into(),
            },
        ]
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        let t = text.trim().to_lowercase();
        t == "ai costs" || t == "api costs" || t == "cost report" || t.starts_with("cost ")
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        let text = text.trim();
        let lower = text.to_lowercase();

        if lower == "ai costs" || lower == "api costs" || lower == "cost report" {
            return Ok(self.report(ctx));
        }
        if lower == "cost breakdown" {
            return Ok(self.breakdown(ctx));
        }
        if lower == "cost history" {
            return Ok(self.history(ctx));
        }
        if lower == "cost optimize" {
            return Ok(self.optimize(ctx));
        }
        if let Some(c) = self.budget_re.captures(text) {
            let Ok(amount) = c[1].parse::<f64>() else {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    format!("'{}' is not an amount.", &c[1]),
                ));
            };
            if amount <= 0.0 {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    "Budget must be positive.",
                ));
            }
            ctx.services.cost.set_budget(Some(amount));
            self.log.info(&format!("budget set to ${amount:.2}"));
            return Ok(SkillResult::ok(format!("Monthly budget set to ${amount:.2}.")));
        }

        Ok(SkillResult::err(ErrorKind::BadArgument, "Unrecognized cost command.")
            .with_attempted(text.to_string())
            .with_suggestion("ai costs | cost breakdown | cost budget <amt> | cost optimize"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipmate_core::test_support::services;
    use shipmate_core::types::{InboundMessage, TaskType};

    async fn ctx() -> MessageContext {
        MessageContext {
            message: InboundMessage::text("C1", "u1", "", "test"),
            chat: Default::default(),
            services: services().await,
        }
    }

    #[tokio::test]
    async fn test_report_totals_match_recorded() {
        let skill = CostsSkill::new();
        let ctx = ctx().await;
        ctx.services
            .cost
            .record("anthropic", "claude-3-5-haiku-20241022", 1_000_000, 0, TaskType::Chat);

        let result = skill.execute("ai costs", &ctx).await.unwrap();
        assert!(result.message.contains("$0.8000"));
        assert!(result.message.contains("anthropic"));
        assert!(result.message.contains("No budget set"));
    }

    #[tokio::test]
    async fn test_budget_flow() {
        let skill = CostsSkill::new();
        let ctx = ctx().await;

        let set = skill.execute("cost budget 25", &ctx).await.unwrap();
        assert!(set.success);

        let report = skill.execute("cost report", &ctx).await.unwrap();
        assert!(report.message.contains("Budget: $25.00"));

        let bad = skill.execute("cost budget 0", &ctx).await.unwrap();
        assert!(!bad.success);
    }

    #[tokio::test]
    async fn test_breakdown_and_history() {
        let skill = CostsSkill::new();
        let ctx = ctx().await;
        ctx.services.cost.record(
            "anthropic",
            "claude-3-5-haiku-20241022",
            500_000,
            100_000,
            TaskType::Classification,
        );

        let breakdown = skill.execute("cost breakdown", &ctx).await.unwrap();
        assert!(breakdown
            .message
            .contains("anthropic/claude-3-5-haiku-20241022/classification"));

        let history = skill.execute("cost history", &ctx).await.unwrap();
        assert!(history.message.contains("500000+100000 tokens"));
    }

    #[tokio::test]
    async fn test_optimize_flags_trivial_spend() {
        let skill = CostsSkill::new();
        let ctx = ctx().await;
        ctx.services.cost.record(
            "anthropic",
            "claude-3-5-haiku-20241022",
            100_000,
            10_000,
            TaskType::Greeting,
        );

        let result = skill.execute("cost optimize", &ctx).await.unwrap();
        assert!(result.message.contains("trivial-on-paid"));
    }

    #[tokio::test]
    async fn test_empty_state_messages() {
        let skill = CostsSkill::new();
        let ctx = ctx().await;
        assert!(skill
            .execute("cost optimize", &ctx)
            .await
            .unwrap()
            .message
            .contains("Nothing to optimize"));
        assert!(skill
            .execute("cost history", &ctx)
            .await
            .unwrap()
            .message
            .contains("No provider calls"));
    }
}
