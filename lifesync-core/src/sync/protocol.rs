//! Wire types for the records API.
//!
//! Request and response bodies are JSON. Timestamps are RFC 3339 in UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::Filter;
use crate::models::{Operation, Payload, Record};

/// Body of `POST /v1/records/{collection}/{owner}/query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Only records the server received after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Include tombstones. Reconciliation pulls need them; screens do not.
    #[serde(default)]
    pub include_deleted: bool,
}

impl RemoteQuery {
    /// A read on behalf of a screen: live records only.
    pub fn filtered(filter: Option<&Filter>) -> Self {
        Self {
            filter: filter.cloned(),
            since: None,
            include_deleted: false,
        }
    }

    /// A reconciliation pull: every change after the watermark.
    pub fn changes_since(since: Option<DateTime<Utc>>) -> Self {
        Self {
            filter: None,
            since,
            include_deleted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub records: Vec<Record>,
    /// Server clock at the time of the read; the next pull starts here.
    pub synced_at: DateTime<Utc>,
}

/// Body of `POST /v1/records/{collection}/{owner}/write`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Insert {
        id: String,
        payload: Payload,
        updated_at: DateTime<Utc>,
    },
    /// `payload` is merged into the stored body.
    Update {
        id: String,
        payload: Payload,
        updated_at: DateTime<Utc>,
    },
    Delete {
        id: String,
        updated_at: DateTime<Utc>,
    },
}

impl WriteOp {
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Insert { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id, .. } => {
                id
            }
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            WriteOp::Insert { updated_at, .. }
            | WriteOp::Update { updated_at, .. }
            | WriteOp::Delete { updated_at, .. } => *updated_at,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            WriteOp::Insert { .. } => Operation::Insert,
            WriteOp::Update { .. } => Operation::Update,
            WriteOp::Delete { .. } => Operation::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub record: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error body returned with every non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;
    use serde_json::json;

    #[test]
    fn test_write_op_is_tagged() {
        let ts = now();
        let op = WriteOp::Delete {
            id: "t1".into(),
            updated_at: ts,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], json!("delete"));
        assert_eq!(value["id"], json!("t1"));
        assert_eq!(op.operation(), Operation::Delete);
        assert_eq!(op.updated_at(), ts);
    }

    #[test]
    fn test_query_defaults_when_fields_missing() {
        let query: RemoteQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query, RemoteQuery::default());
        assert!(!query.include_deleted);
    }

    #[test]
    fn test_changes_since_includes_tombstones() {
        let query = RemoteQuery::changes_since(None);
        assert!(query.include_deleted);
        assert!(query.filter.is_none());
    }
}
