//! The synchronous pattern layer: an ordered list of (regex, rewriter)
//! pairs producing canonical command strings, plus the passthrough guards.
//!
//! This layer never does I/O. It resolves the common shorthand people
//! actually type ("deploy the api", "tests for web") into the canonical
//! command surface before anything costly runs.

use regex::Regex;

/// Rewrites a regex match into a canonical command string.
type Rewriter = Box<dyn Fn(&regex::Captures<'_>) -> String + Send + Sync>;

/// One pattern rule.
pub struct PatternRule {
    regex: Regex,
    rewrite: Rewriter,
}

/// Ordered pattern list. First match wins.
#[derive(Default)]
pub struct PatternLayer {
    rules: Vec<PatternRule>,
}

impl PatternLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in shorthand rules.
    pub fn with_defaults() -> Self {
        let mut layer = Self::new();
        layer.add(
            r"(?i)^deploy(?:\s+the)?\s+([\w./-]+)$",
            |c| format!("pipeline deploy {}", &c[1]),
        );
        layer.add(
            r"(?i)^(?:run\s+)?tests?\s+(?:for|on)\s+([\w./-]+)$",
            |c| format!("pipeline test {}", &c[1]),
        );
        layer.add(r"(?i)^roll\s*back\s+([\w./-]+)$", |c| {
            format!("pipeline rollback {}", &c[1])
        });
        layer.add(r"(?i)^(?:deploy|pipeline)\s+history$", |_| {
            "pipeline status".to_string()
        });
        layer.add(r"(?i)^what(?:'s| is)\s+this\s+chat\s+for$", |_| {
            "context".to_string()
        });
        layer.add(r"(?i)^(?:show\s+)?(?:my\s+)?(?:ai|api)\s+spend$", |_| {
            "ai costs".to_string()
        });
        layer
    }

    /// Append a rule. Invalid patterns are a programmer error.
    pub fn add(
        &mut self,
        pattern: &str,
        rewrite: impl Fn(&regex::Captures<'_>) -> String + Send + Sync + 'static,
    ) {
        let regex = Regex::new(pattern).expect("pattern rules are compiled at startup");
        self.rules.push(PatternRule {
            regex,
            rewrite: Box::new(rewrite),
        });
    }

    /// Resolve text to a canonical command, if any rule matches.
    pub fn resolve(&self, text: &str) -> Option<String> {
        let text = text.trim();
        for rule in &self.rules {
            if let Some(captures) = rule.regex.captures(text) {
                return Some((rule.rewrite)(&captures));
            }
        }
        None
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// First words of the structured command surface. Text starting with one
/// of these is treated as a command and never sent to the classifier.
const COMMAND_VERBS: &[&str] = &[
    "register", "unregister", "context", "list", "set", "remind", "my", "cancel", "confirm",
    "pipeline", "deploy", "nl", "ai", "cost", "api", "status", "help",
];

/// Leading verbs of coding instructions, which pass through to the
/// conversational handler rather than the command surface.
const CODING_VERBS: &[&str] = &[
    "write", "implement", "refactor", "rename", "add", "remove", "fix", "debug", "optimize",
    "document",
];

/// Routing verdict of the synchronous guard pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Looks like a structured command; resolve locally.
    Command,
    /// Hand to the free-form conversational handler.
    Passthrough,
    /// Neither; worth asking the classifier.
    Ambiguous,
}

/// Synchronous passthrough guards, applied after the pattern layer.
pub fn guard(text: &str) -> GuardVerdict {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return GuardVerdict::Passthrough;
    }
    // Questions are conversation, not commands.
    if trimmed.ends_with('?') {
        return GuardVerdict::Passthrough;
    }
    let lower = trimmed.to_lowercase();
    let first = lower.split_whitespace().next().unwrap_or("");

    if COMMAND_VERBS.contains(&first) {
        return GuardVerdict::Command;
    }
    if CODING_VERBS.contains(&first) {
        return GuardVerdict::Passthrough;
    }
    // Conversational build requests ("can you build...", "let's create...")
    if lower.starts_with("can you")
        || lower.starts_with("could you")
        || lower.starts_with("let's")
        || lower.starts_with("please ")
        || lower.starts_with("i want")
        || lower.starts_with("i need")
    {
        return GuardVerdict::Passthrough;
    }
    GuardVerdict::Ambiguous
}
