//! LLM provider abstraction.
//!
//! Orchestration here treats the model as a pluggable collaborator behind the
//! [`Model`] trait: a mock for tests, and [`http::HttpJsonProvider`] for any
//! OpenAI-compatible chat completions backend.

pub mod common;
pub mod http;
pub mod mock;

pub use common::{
    FromEnv, GenerateOptions, Model, ModelResponse, ModelStream, RetryConfig, TokenUsage,
    ToolDefinition,
};
pub use http::HttpJsonProvider;
pub use mock::MockModel;
