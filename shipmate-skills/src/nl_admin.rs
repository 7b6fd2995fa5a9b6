//! Router administration: inspect and tune the NL router at runtime.

use async_trait::async_trait;
use regex::Regex;

use shipmate_core::error::{ErrorKind, ShipmateError};
use shipmate_core::router::RouteDecision;
use shipmate_core::skills::helpers::{parse_command, SkillLogger};
use shipmate_core::skills::{CommandSpec, MessageContext, Skill};
use shipmate_core::types::SkillResult;

/// Tunables, cache, and metrics of the NL router, from chat.
pub struct NlAdminSkill {
    set_re: Regex,
    test_re: Regex,
    log: SkillLogger,
}

impl NlAdminSkill {
    pub fn new() -> Self {
        Self {
            set_re: Regex::new(r"(?i)^nl\s+set\s+([\w-]+)\s+([\d.]+)$").expect("static pattern"),
            test_re: Regex::new(r#"(?i)^nl\s+test\s+"#).expect("static pattern"),
            log: SkillLogger::new("nl-admin"),
        }
    }
}

impl Default for NlAdminSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for NlAdminSkill {
    fn name(&self) -> &str {
        "nl-admin"
    }

    fn description(&self) -> &str {
        "Inspect and tune the natural-language router"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                pattern: r"^nl status$".into(),
                usage: "nl status".into(),
                description: "router metrics".into(),
            },
            CommandSpec {
                pattern: r"^nl thresholds$".into(),
                usage: "nl thresholds".into(),
                description: "current tunables".into(),
            },
            CommandSpec {
                pattern: r"^nl set <param> <value>".into(),
                usage: "nl set {ambiguity|clarification|ai-timeout|cache-ttl|cache-size} <value>"
                    .into(),
                description: "change a tunable at runtime".into(),
            },
            CommandSpec {
                pattern: r"^nl cache (clear|stats)$".into(),
                usage: "nl cache clear | nl cache stats".into(),
                description: "classification cache control".into(),
            },
            CommandSpec {
                pattern: r#"^nl test "<msg>""#.into(),
                usage: r#"nl test "<msg>""#.into(),
                description: "dry-run routing for a message".into(),
            },
        ]
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        text.trim().to_lowercase().starts_with("nl ")
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        let text = text.trim();
        let lower = text.to_lowercase();
        let router = &ctx.services.router;

        if lower == "nl status" {
            let m = router.metrics();
            return Ok(SkillResult::ok(format!(
                "Router: {} routed | pattern {} | ai {} | cache {} | passthrough {}\n\
                 cache hit rate {:.0}% | learned patterns {}",
                m.total,
                m.pattern_hits,
                m.ai_hits,
                m.cache_hits,
                m.passthroughs,
                m.cache_hit_rate * 100.0,
                m.learned_patterns
            ))
            .with_data(serde_json::to_value(&m).unwrap_or_default()));
        }

        if lower == "nl thresholds" {
            let t = router.tunables();
            return Ok(SkillResult::ok(format!(
                "ambiguity: {}\nclarification: {}\nai-timeout: {}ms\ncache-ttl: {}ms\ncache-size: {}",
                t.ambiguity_threshold,
                t.clarification_threshold,
                t.ai_timeout_ms,
                t.cache_max_age_ms,
                t.cache_max_size
            )));
        }

        if let Some(c) = self.set_re.captures(text) {
            let param = c[1].to_lowercase();
            let Ok(value) = c[2].parse::<f64>() else {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    format!("'{}' is not a number.", &c[2]),
                ));
            };
            return match router.set_tunable(&param, value) {
                Ok(()) => {
                    self.log.info(&format!("tunable {param} set to {value}"));
                    Ok(SkillResult::ok(format!("{param} set to {value}.")))
                }
                Err(e) => Ok(SkillResult::err(ErrorKind::BadArgument, e.to_string())
                    .with_attempted(text.to_string())
                    .with_suggestion("nl thresholds")),
            };
        }

        if lower == "nl cache clear" {
            router.clear_cache();
            return Ok(SkillResult::ok("Classification cache cleared."));
        }

        if lower == "nl cache stats" {
            let m = router.metrics();
            return Ok(SkillResult::ok(format!(
                "Cache: {} entries, {} hits ({:.0}% of {} routed)",
                router.cache_len(),
                m.cache_hits,
                m.cache_hit_rate * 100.0,
                m.total
            )));
        }

        if self.test_re.is_match(text) {
            let parsed = parse_command(text);
            let Some(message) = parsed.args.get(2) else {
                return Ok(SkillResult::err(
                    ErrorKind::BadArgument,
                    "Quote the message to test.",
                )
                .with_suggestion(r#"nl test "deploy the api""#));
            };
            let decision = router.route(message, &ctx.chat).await;
            let explained = match decision {
                RouteDecision::Command(command) => format!("command: {command}"),
                RouteDecision::Passthrough => "passthrough (conversational)".to_string(),
                RouteDecision::Classified(c) => format!(
                    "classified: intent={} project={} confidence={:.2}{}",
                    c.intent,
                    c.project.as_deref().unwrap_or("-"),
                    c.confidence,
                    if c.ambiguous { " (ambiguous)" } else { "" }
                ),
            };
            return Ok(SkillResult::ok(format!("\"{message}\" -> {explained}")));
        }

        Ok(SkillResult::err(ErrorKind::BadArgument, "Unrecognized nl command.")
            .with_attempted(text.to_string())
            .with_suggestion("nl status | nl thresholds | nl set <param> <value>"))
    }
}
