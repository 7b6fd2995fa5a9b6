//! Chat administration: bind chats to repos, companies, or HQ, and manage
//! notification levels.

use async_trait::async_trait;
use regex::Regex;

use shipmate_core::error::{ErrorKind, ShipmateError};
use shipmate_core::registry::{RegisterRequest, COMPANY_CODES};
use shipmate_core::skills::helpers::SkillLogger;
use shipmate_core::skills::{CommandSpec, MessageContext, Skill};
use shipmate_core::store::{ChatType, NotificationLevel};
use shipmate_core::types::SkillResult;

/// Binds chats to their operating context.
pub struct ChatAdminSkill {
    company_re: Regex,
    repo_re: Regex,
    notify_re: Regex,
    log: SkillLogger,
}

impl ChatAdminSkill {
    pub fn new() -> Self {
        Self {
            company_re: Regex::new(r"(?i)^register\s+chat\s+for\s+company\s+(\w+)$")
                .expect("static pattern"),
            repo_re: Regex::new(r"(?i)^register\s+chat\s+for\s+([\w./-]+)$")
                .expect("static pattern"),
            notify_re: Regex::new(r"(?i)^set\s+notifications?\s+(\w+)$").expect("static pattern"),
            log: SkillLogger::new("chat-admin"),
        }
    }

    fn register(
        &self,
        ctx: &MessageContext,
        chat_type: ChatType,
        target: Option<String>,
    ) -> Result<SkillResult, ShipmateError> {
        let reg = ctx.services.registry.register(
            &ctx.message.chat_id,
            RegisterRequest {
                chat_type,
                target,
                notifications: NotificationLevel::All,
                platform: ctx.message.platform.clone(),
                label: None,
                registered_by: ctx.message.sender_id.clone(),
            },
        )?;
        self.log.info(&format!(
            "chat {} registered as {}",
            reg.chat_id,
            reg.chat_type.as_str()
        ));
        let what = match reg.chat_type {
            ChatType::Repo => format!("repository {}", reg.target.as_deref().unwrap_or("?")),
            ChatType::Company => format!("company {}", reg.target.as_deref().unwrap_or("?")),
            ChatType::Hq => "HQ (receives everything)".to_string(),
        };
        Ok(SkillResult::ok(format!("This chat now tracks {what}.")))
    }

    fn context(&self, ctx: &MessageContext) -> Result<SkillResult, ShipmateError> {
        let Some(reg) = ctx.services.registry.get(&ctx.message.chat_id)? else {
            return Ok(
                SkillResult::err(ErrorKind::NotFound, "This chat is not registered.")
                    .with_suggestion("register chat for <repo>, or: register chat as hq"),
            );
        };
        let mut lines = vec![format!("Type: {}", type_label(reg.chat_type))];
        match reg.chat_type {
            ChatType::Repo => {
                lines.push(format!("Repository: {}", reg.target.as_deref().unwrap_or("?")))
            }
            ChatType::Company => {
                lines.push(format!("Company: {}", reg.target.as_deref().unwrap_or("?")))
            }
            ChatType::Hq => {}
        }
        lines.push(format!("Notifications: {}", reg.notifications.as_str()));
        lines.push(format!("Platform: {}", reg.platform));
        Ok(SkillResult::ok(lines.join("\n")))
    }

    fn list(&self, ctx: &MessageContext) -> Result<SkillResult, ShipmateError> {
        let regs = ctx.services.registry.list()?;
        if regs.is_empty() {
            return Ok(SkillResult::ok("No chats registered yet."));
        }
        let lines: Vec<String> = regs
            .iter()
            .map(|r| {
                format!(
                    "{} -> {} {} [{}]",
                    r.chat_id,
                    type_label(r.chat_type),
                    r.target.as_deref().unwrap_or("-"),
                    r.notifications.as_str()
                )
            })
            .collect();
        Ok(SkillResult::ok(format!(
            "Registered chats ({}):\n{}",
            regs.len(),
            lines.join("\n")
        )))
    }
}

fn type_label(t: ChatType) -> &'static str {
    match t {
        ChatType::Repo => "Repo",
        ChatType::Company => "Company",
        ChatType::Hq => "HQ",
    }
}

impl Default for ChatAdminSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ChatAdminSkill {
    fn name(&self) -> &str {
        "chat-admin"
    }

    fn description(&self) -> &str {
        "Register chats to repos, companies, or HQ and tune their notifications"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                pattern: r"^register chat for <repo>".into(),
                usage: "register chat for <repo>".into(),
                description: "bind this chat to a repository".into(),
            },
            CommandSpec {
                pattern: r"^register chat for company <CODE>".into(),
                usage: format!("register chat for company <{}>", COMPANY_CODES.join("|")),
                description: "bind this chat to a company".into(),
            },
            CommandSpec {
                pattern: r"^register chat as hq$".into(),
                usage: "register chat as hq".into(),
                description: "make this chat receive everything".into(),
            },
            CommandSpec {
                pattern: r"^unregister chat$".into(),
                usage: "unregister chat".into(),
                description: "drop this chat's registration".into(),
            },
            CommandSpec {
                pattern: r"^context$".into(),
                usage: "context".into(),
                description: "show this chat's binding".into(),
            },
            CommandSpec {
                pattern: r"^list chats$".into(),
                usage: "list chats".into(),
                description: "show every registered chat".into(),
            },
            CommandSpec {
                pattern: r"^set notifications <level>".into(),
                usage: "set notifications {all|critical|digest}".into(),
                description: "set this chat's delivery filter".into(),
            },
        ]
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        let t = text.trim().to_lowercase();
        t.starts_with("register chat")
            || t == "unregister chat"
            || t == "context"
            || t == "list chats"
            || self.notify_re.is_match(text.trim())
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        let text = text.trim();
        let lower = text.to_lowercase();

        if lower == "register chat as hq" {
            return self.register(ctx, ChatType::Hq, None);
        }
        if let Some(c) = self.company_re.captures(text) {
            return self.register(ctx, ChatType::Company, Some(c[1].to_string()));
        }
        if let Some(c) = self.repo_re.captures(text) {
            return self.register(ctx, ChatType::Repo, Some(c[1].to_string()));
        }
        if lower == "unregister chat" {
            return Ok(if ctx.services.registry.unregister(&ctx.message.chat_id)? {
                SkillResult::ok("Chat unregistered.")
            } else {
                SkillResult::err(ErrorKind::NotFound, "This chat was not registered.")
            });
        }
        if lower == "context" {
            return self.context(ctx);
        }
        if lower == "list chats" {
            return self.list(ctx);
        }
        if let Some(c) = self.notify_re.captures(text) {
            let level = c[1].to_lowercase();
            ctx.services
                .registry
                .set_notification_level(&ctx.message.chat_id, &level)?;
            return Ok(SkillResult::ok(format!("Notifications set to {level}.")));
        }

        Ok(SkillResult::err(ErrorKind::BadArgument, "Unrecognized chat command.")
            .with_attempted(text.to_string())
            .with_suggestion("register chat for <repo> | register chat as hq | context"))
    }
}
