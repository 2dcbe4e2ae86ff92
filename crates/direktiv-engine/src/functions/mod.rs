//! Boundary to the function sidecar that runs user containers.
//!
//! The sidecar reports outcomes asynchronously as `action` instance messages.

mod http;

pub use http::HttpFunctionInvoker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use direktiv_core::error::Result;
use direktiv_core::model::{FunctionDefinition, FunctionFileDefinition};

/// A request to run one function for one action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRequest {
    pub action_id: String,
    pub instance_id: Uuid,
    pub namespace: String,
    pub workflow_path: String,
    pub step: usize,
    pub state: String,
    pub function: FunctionDefinition,
    pub input: Value,
    #[serde(default)]
    pub files: Vec<FunctionFileDefinition>,
    #[serde(default)]
    pub secrets: Vec<String>,
    pub deadline: DateTime<Utc>,
    /// Branch index inside a foreach or parallel state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<usize>,
    pub attempt: u32,
    /// Fire-and-forget calls report no result.
    #[serde(default)]
    pub asynchronous: bool,
}

/// Hands function requests to whatever executes them.
#[async_trait]
pub trait FunctionInvoker: Send + Sync + 'static {
    async fn invoke(&self, request: FunctionRequest) -> Result<()>;

    /// Ask the executor to stop a running action.
    async fn cancel(&self, action_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_core::model::FunctionType;

    #[test]
    fn test_request_wire_format() {
        let request = FunctionRequest {
            action_id: "a1".to_string(),
            instance_id: Uuid::nil(),
            namespace: "ns".to_string(),
            workflow_path: "/wf.yaml".to_string(),
            step: 2,
            state: "call".to_string(),
            function: FunctionDefinition {
                id: "echo".to_string(),
                kind: FunctionType::Reusable,
                image: Some("direktiv/echo".to_string()),
                cmd: None,
                size: None,
                scale: None,
                service: None,
                workflow: None,
                files: Vec::new(),
            },
            input: serde_json::json!({"x": 1}),
            files: Vec::new(),
            secrets: Vec::new(),
            deadline: Utc::now(),
            iterator: None,
            attempt: 0,
            asynchronous: false,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["actionId"], "a1");
        assert_eq!(json["workflowPath"], "/wf.yaml");
        assert_eq!(json["function"]["type"], "reusable");
        assert!(json.get("iterator").is_none());
    }
}
