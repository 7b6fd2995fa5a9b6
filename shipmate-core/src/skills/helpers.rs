//! Conveniences skills use by composition: command parsing and prefixed
//! logging. Result builders live on [`crate::types::SkillResult`].

use crate::types::SkillResult;

/// A pattern-matched command split into arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// The raw text as received.
    pub raw: String,
    /// Whitespace-split arguments, double-quoted spans kept intact.
    pub args: Vec<String>,
}

/// Split command text into arguments. Double-quoted spans stay one
/// argument with the quotes removed; an unterminated quote runs to the
/// end of the text.
pub fn parse_command(text: &str) -> ParsedCommand {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in text.trim().chars() {
        match ch {
            '"' => {
                if in_quotes {
                    args.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }

    ParsedCommand {
        raw: text.to_string(),
        args,
    }
}

/// A logger that prefixes every line with the skill name, so interleaved
/// skill output stays attributable.
#[derive(Debug, Clone)]
pub struct SkillLogger {
    name: String,
}

impl SkillLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn info(&self, message: &str) {
        tracing::info!(skill = %self.name, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(skill = %self.name, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(skill = %self.name, "{message}");
    }
}

/// Shorthand for the common "wrong usage" failure.
pub fn usage_error(usage: &str) -> SkillResult {
    SkillResult::err(
        crate::error::ErrorKind::BadArgument,
        format!("Usage: {usage}"),
    )
    .with_suggestion(format!("try: {usage}"))
}
