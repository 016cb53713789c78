//! In-process dispatch target for the `tool` daemon action.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use xbroker_core::{BrokerError, ExecutionId};
use xbroker_engine::{ExecuteOptions, ExecutionEngine};

#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Invoke `name` with `params`, or fail with `UnsupportedTool` if the
    /// name isn't recognised.
    async fn call(&self, name: &str, params: Value) -> Result<Value, BrokerError>;
}

/// Runtime with no registered tools; every call fails with `UnsupportedTool`.
/// Used where a daemon is stood up without a tool surface wired in.
pub struct EmptyToolRuntime;

#[async_trait]
impl ToolRuntime for EmptyToolRuntime {
    async fn call(&self, name: &str, _params: Value) -> Result<Value, BrokerError> {
        Err(BrokerError::UnsupportedTool(name.to_string()))
    }
}

#[derive(Deserialize)]
struct GetParams {
    execution_id: ExecutionId,
}

/// Fronts the daemon's own long-lived `ExecutionEngine`, so a `tool` call
/// over the socket can start and track executions that outlive the client
/// connection that started them — the reason the daemon exists at all per
/// its "keep execution state across client reconnects" role.
pub struct EngineToolRuntime {
    engine: Arc<ExecutionEngine>,
}

impl EngineToolRuntime {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ToolRuntime for EngineToolRuntime {
    async fn call(&self, name: &str, params: Value) -> Result<Value, BrokerError> {
        match name {
            "execute" => {
                let options: ExecuteOptions = serde_json::from_value(params)
                    .map_err(|error| BrokerError::Validation(format!("invalid execute params: {error}")))?;
                let record = self.engine.execute(options).await?;
                serde_json::to_value(record)
                    .map_err(|error| BrokerError::Validation(format!("failed to serialize execution record: {error}")))
            }
            "get" => {
                let parsed: GetParams = serde_json::from_value(params)
                    .map_err(|error| BrokerError::Validation(format!("invalid get params: {error}")))?;
                let record = self.engine.registry().get(parsed.execution_id).await?;
                serde_json::to_value(record)
                    .map_err(|error| BrokerError::Validation(format!("failed to serialize execution record: {error}")))
            }
            other => Err(BrokerError::UnsupportedTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_runtime_rejects_every_call() {
        let runtime = EmptyToolRuntime;
        let result = runtime.call("anything", Value::Null).await;
        assert!(matches!(result, Err(BrokerError::UnsupportedTool(_))));
    }
}
