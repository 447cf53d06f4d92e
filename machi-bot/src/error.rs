//! Error type for the bot binary's own glue code (CLI parsing, config I/O,
//! model selection). Library-level failures stay in their own error types
//! and are wrapped here at the boundary.

/// A type alias for `Result<T, BotError>`.
pub type Result<T> = std::result::Result<T, BotError>;

/// Errors surfaced by the `orkestra` CLI entry point.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Configuration loading, parsing, or validation failed.
    #[error("configuration error: {0}")]
    Config(String),
    /// I/O failure reading/writing config or workspace files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// No model provider could be resolved from config or environment.
    #[error("model error: {0}")]
    Model(String),
    /// The orchestration core returned an error.
    #[error("orchestrator error: {0}")]
    Agent(#[from] orkestra::error::AgentError),
    /// A library-level storage error (events, secrets, cron).
    #[error("storage error: {0}")]
    Storage(String),
}

impl BotError {
    /// Builds a [`BotError::Config`] from any displayable message.
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config(message.to_string())
    }

    /// Builds a [`BotError::Model`] from any displayable message.
    pub fn model(message: impl std::fmt::Display) -> Self {
        Self::Model(message.to_string())
    }
}
