use serde::{Deserialize, Serialize};

use super::states::VarScope;

/// Function definition declared at the top of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    /// Identifier referenced by actions.
    pub id: String,
    /// How the function is executed.
    #[serde(rename = "type")]
    pub kind: FunctionType,
    /// Container image (container functions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container command override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Resource size class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<FunctionSize>,
    /// Minimum scale of reusable services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
    /// Service name of namespaced and global functions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Workflow path of subflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Files provisioned into the container before the call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FunctionFileDefinition>,
}

impl FunctionDefinition {
    /// Whether calling this function starts a child workflow instance.
    pub fn is_subflow(&self) -> bool {
        self.kind == FunctionType::Subflow
    }
}

/// Function execution types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionType {
    /// Container reused across calls of the same workflow revision.
    #[serde(rename = "reusable")]
    Reusable,
    /// Fresh container per call.
    #[serde(rename = "isolated")]
    Isolated,
    /// Long-running service owned by the namespace.
    #[serde(rename = "knative-namespace", alias = "namespace")]
    Namespaced,
    /// Long-running service shared by all namespaces.
    #[serde(rename = "knative-global", alias = "global")]
    Global,
    /// Another workflow.
    #[serde(rename = "subflow")]
    Subflow,
}

impl FunctionType {
    /// Convert to string for requests and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reusable => "reusable",
            Self::Isolated => "isolated",
            Self::Namespaced => "knative-namespace",
            Self::Global => "knative-global",
            Self::Subflow => "subflow",
        }
    }
}

/// Container size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FunctionSize {
    #[default]
    Small,
    Medium,
    Large,
}

/// A file to provision for a function call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionFileDefinition {
    /// Variable key holding the file contents.
    pub key: String,
    /// Variable scope.
    #[serde(default)]
    pub scope: VarScope,
    /// File name inside the container.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_name: Option<String>,
    /// Unpacking hint (plain, base64, tar, tar.gz).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}
