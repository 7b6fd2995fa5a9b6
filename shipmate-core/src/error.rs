//! Error types for the Shipmate kernel.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the store, routing, scheduling, orchestration, and adapter
//! domains. Every error maps onto a small user-facing [`ErrorKind`]
//! taxonomy that skills surface in their result envelopes.

use std::path::PathBuf;

/// User-facing classification carried by result envelopes and the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input validation failure; surfaced with a suggestion.
    BadArgument,
    /// Target repo, job, token, or record absent.
    NotFound,
    /// Duplicate registration or single-flight violation.
    Conflict,
    /// Whitelist or ownership violation; audited.
    Unauthorized,
    /// An adapter deadline was reached; not retried automatically.
    Timeout,
    /// An upstream service (GitHub, CI, provider) failed.
    Upstream,
    /// Unexpected invariant violation; generic message surfaced.
    Internal,
    /// A subsystem is unavailable but a partial answer is possible.
    Degraded,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::BadArgument => "bad_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Internal => "internal",
            ErrorKind::Degraded => "degraded",
        };
        write!(f, "{s}")
    }
}

/// Top-level error type for the Shipmate core library.
#[derive(Debug, thiserror::Error)]
pub enum ShipmateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chat registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Skill error: {0}")]
    Skill(#[from] SkillError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Confirmation error: {0}")]
    Confirm(#[from] ConfirmError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShipmateError {
    /// Map this error onto the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShipmateError::Store(e) => e.kind(),
            ShipmateError::Registry(e) => e.kind(),
            ShipmateError::Skill(e) => e.kind(),
            ShipmateError::Router(e) => e.kind(),
            ShipmateError::Scheduler(e) => e.kind(),
            ShipmateError::Orchestrator(e) => e.kind(),
            ShipmateError::Confirm(e) => e.kind(),
            ShipmateError::Adapter(e) => e.kind(),
            ShipmateError::Config(_) => ErrorKind::BadArgument,
            ShipmateError::Secret(e) => e.kind(),
            ShipmateError::Io(_) => ErrorKind::Internal,
            ShipmateError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unreachable: {message}")]
    Unreachable { message: String },

    #[error("Row not found in {collection}")]
    RowNotFound { collection: String },

    #[error("Constraint violated on {collection}: {message}")]
    Constraint { collection: String, message: String },

    #[error("Schema migration failed: {message}")]
    Migration { message: String },

    #[error("Invalid field value for {field}: {message}")]
    InvalidField { field: String, message: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unreachable { .. } => ErrorKind::Degraded,
            StoreError::RowNotFound { .. } => ErrorKind::NotFound,
            StoreError::Constraint { .. } => ErrorKind::BadArgument,
            StoreError::Migration { .. } => ErrorKind::Internal,
            StoreError::InvalidField { .. } => ErrorKind::BadArgument,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::RowNotFound {
                collection: "unknown".to_string(),
            },
            other => StoreError::Unreachable {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from the chat registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Chat {chat_id} is not registered")]
    NotRegistered { chat_id: String },

    #[error("Invalid notification level '{level}' (expected all, critical, or digest)")]
    InvalidLevel { level: String },

    #[error("Registration type '{reg_type}' requires a target")]
    MissingTarget { reg_type: String },

    #[error("Unknown company code '{code}'")]
    UnknownCompany { code: String },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotRegistered { .. } => ErrorKind::NotFound,
            RegistryError::InvalidLevel { .. } => ErrorKind::BadArgument,
            RegistryError::MissingTarget { .. } => ErrorKind::BadArgument,
            RegistryError::UnknownCompany { .. } => ErrorKind::BadArgument,
        }
    }
}

/// Errors from skill registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("Skill not found: {name}")]
    NotFound { name: String },

    #[error("Skill '{name}' failed to initialize: {message}")]
    InitFailed { name: String, message: String },

    #[error("Skill '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("No skill claimed the message")]
    NoMatch,

    #[error("Skill config error: {message}")]
    Config { message: String },
}

impl SkillError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkillError::NotFound { .. } => ErrorKind::NotFound,
            SkillError::InitFailed { .. } => ErrorKind::Internal,
            SkillError::ExecutionFailed { .. } => ErrorKind::Internal,
            SkillError::NoMatch => ErrorKind::NotFound,
            SkillError::Config { .. } => ErrorKind::BadArgument,
        }
    }
}

/// Errors from the natural-language router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid tunable '{param}': {message}")]
    InvalidTunable { param: String, message: String },

    #[error("Classifier unavailable: {message}")]
    ClassifierUnavailable { message: String },

    #[error("Classifier timed out after {timeout_ms}ms")]
    ClassifierTimeout { timeout_ms: u64 },
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::InvalidTunable { .. } => ErrorKind::BadArgument,
            RouterError::ClassifierUnavailable { .. } => ErrorKind::Degraded,
            RouterError::ClassifierTimeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Errors from the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Job already exists: {name}")]
    JobAlreadyExists { name: String },

    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("Handler not registered: {handler}")]
    HandlerNotFound { handler: String },

    #[error("Trigger instant {instant} is in the past")]
    InstantInPast { instant: String },

    #[error("Scheduler persistence error: {message}")]
    Persistence { message: String },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidCronExpression { .. } => ErrorKind::BadArgument,
            SchedulerError::JobAlreadyExists { .. } => ErrorKind::Conflict,
            SchedulerError::JobNotFound { .. } => ErrorKind::NotFound,
            SchedulerError::HandlerNotFound { .. } => ErrorKind::BadArgument,
            SchedulerError::InstantInPast { .. } => ErrorKind::BadArgument,
            SchedulerError::Persistence { .. } => ErrorKind::Degraded,
        }
    }
}

/// Errors from the deployment orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Unknown project '{project}'")]
    UnknownProject { project: String },

    #[error("Command not allowed: {command}")]
    CommandNotAllowed { command: String },

    #[error("Argument rejected for '{command}': contains disallowed characters")]
    ArgumentRejected { command: String },

    #[error("A pipeline is already running for {target}")]
    PipelineBusy { target: String },

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("No successful deploy found for {target}")]
    NothingToRollback { target: String },

    #[error("Confirmation required: {token}")]
    ConfirmationRequired { token: String },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::UnknownProject { .. } => ErrorKind::NotFound,
            OrchestratorError::CommandNotAllowed { .. } => ErrorKind::Unauthorized,
            OrchestratorError::ArgumentRejected { .. } => ErrorKind::Unauthorized,
            OrchestratorError::PipelineBusy { .. } => ErrorKind::Conflict,
            OrchestratorError::StageTimeout { .. } => ErrorKind::Timeout,
            OrchestratorError::NothingToRollback { .. } => ErrorKind::NotFound,
            OrchestratorError::ConfirmationRequired { .. } => ErrorKind::Unauthorized,
        }
    }
}

/// Errors from the confirmation broker.
#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("Unknown confirmation token")]
    NotFound,

    #[error("Confirmation token has expired")]
    Expired,
}

impl ConfirmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfirmError::NotFound => ErrorKind::NotFound,
            ConfirmError::Expired => ErrorKind::NotFound,
        }
    }
}

/// Errors from external adapters (source control, subprocess, provider,
/// transcription, messaging).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{adapter} request failed: {message}")]
    Request { adapter: String, message: String },

    #[error("{adapter} returned status {status}: {message}")]
    Status {
        adapter: String,
        status: u16,
        message: String,
    },

    #[error("{adapter} timed out after {timeout_secs}s")]
    Timeout { adapter: String, timeout_secs: u64 },

    #[error("{adapter} response parse error: {message}")]
    ResponseParse { adapter: String, message: String },

    #[error("{adapter} is not configured: {message}")]
    NotConfigured { adapter: String, message: String },
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Request { .. } => ErrorKind::Upstream,
            AdapterError::Status { .. } => ErrorKind::Upstream,
            AdapterError::Timeout { .. } => ErrorKind::Timeout,
            AdapterError::ResponseParse { .. } => ErrorKind::Upstream,
            AdapterError::NotConfigured { .. } => ErrorKind::Degraded,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from secret custody.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {name}")]
    NotFound { name: String },

    #[error("Encryption failed: {message}")]
    EncryptFailed { message: String },

    #[error("Decryption failed: {message}")]
    DecryptFailed { message: String },

    #[error("Invalid key length: expected 32 bytes, got {got}")]
    InvalidKeyLength { got: usize },
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::NotFound { .. } => ErrorKind::NotFound,
            SecretError::EncryptFailed { .. } => ErrorKind::Internal,
            SecretError::DecryptFailed { .. } => ErrorKind::Internal,
            SecretError::InvalidKeyLength { .. } => ErrorKind::BadArgument,
        }
    }
}
