//! Namespace and workflow metadata the engine resolves instances against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ref used when no ref is requested and no routes are configured.
pub const LATEST_REF: &str = "latest";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub namespace_id: Uuid,
    /// Absolute path inside the namespace, e.g. `/orders/process.yaml`.
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable workflow source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// YAML source.
    pub source: String,
    /// Hex sha256 of the source.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// A named pointer to a revision (`latest`, tags).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefRecord {
    pub workflow_id: Uuid,
    pub name: String,
    pub revision_id: Uuid,
}

/// Traffic weight of one ref.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub workflow_id: Uuid,
    pub ref_name: String,
    pub weight: u32,
}

/// Split a requested path of the form `/path.yaml:ref` into path and ref.
pub fn split_ref(path: &str) -> (&str, Option<&str>) {
    match path.rsplit_once(':') {
        Some((p, r)) if !r.is_empty() && !r.contains('/') => (p, Some(r)),
        _ => (path, None),
    }
}

/// Normalize a workflow path to start with a single `/`.
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim().trim_start_matches('/'))
}
