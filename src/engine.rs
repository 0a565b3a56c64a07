//! Graph engine contract.
//!
//! A graph engine is the caller-supplied computation a worker runs for each
//! job. Engines are produced by an [`EngineFactory`], once per worker, so any
//! expensive initialization is paid when the worker starts and not per job.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One role/content entry of a job's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Input handed to [`GraphEngine::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInput {
    pub messages: Vec<Message>,
}

/// Terminal status reported by a graph run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphStatus {
    Finished,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finished => write!(f, "FINISHED"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Output of a graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOutput {
    /// Final graph state, stored as the job result.
    pub state: serde_json::Value,
    pub status: GraphStatus,
}

impl GraphOutput {
    pub fn finished(state: serde_json::Value) -> Self {
        Self {
            state,
            status: GraphStatus::Finished,
        }
    }
}

/// A computation unit executed once per job.
#[async_trait]
pub trait GraphEngine: Send + Sync {
    /// Run the graph against the given input.
    async fn execute(&self, input: GraphInput) -> Result<GraphOutput, EngineError>;
}

/// Produces a fresh engine for each worker.
pub trait EngineFactory: Send + Sync {
    fn load(&self) -> Result<Arc<dyn GraphEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Arc<dyn GraphEngine>, EngineError> + Send + Sync,
{
    fn load(&self) -> Result<Arc<dyn GraphEngine>, EngineError> {
        self()
    }
}

/// Built-in engine that answers with the content of the last message.
#[derive(Debug, Default)]
pub struct EchoEngine;

#[async_trait]
impl GraphEngine for EchoEngine {
    async fn execute(&self, input: GraphInput) -> Result<GraphOutput, EngineError> {
        let last = input
            .messages
            .last()
            .ok_or_else(|| EngineError::Failed("no messages to answer".to_string()))?;

        let mut messages = serde_json::to_value(&input.messages)?;
        if let Some(list) = messages.as_array_mut() {
            list.push(serde_json::to_value(Message::new(
                "assistant",
                last.content.clone(),
            ))?);
        }

        Ok(GraphOutput::finished(serde_json::json!({ "messages": messages })))
    }
}

/// Factory for [`EchoEngine`].
pub fn echo_factory() -> Arc<dyn EngineFactory> {
    Arc::new(|| Ok::<_, EngineError>(Arc::new(EchoEngine) as Arc<dyn GraphEngine>))
}
