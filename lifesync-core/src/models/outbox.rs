use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::record::Payload;
use crate::sync::WriteOp;

/// Kind of write waiting in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be sent.
    Pending,
    /// Handed to the remote by a drain; may not be coalesced or superseded.
    InFlight,
    /// Rejected by the remote too many times; kept for inspection.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "in_flight" => Some(OutboxStatus::InFlight),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write not yet acknowledged by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Assigned by the queue on enqueue; zero until then.
    pub sequence: u64,
    pub collection: String,
    pub owner: String,
    pub id: String,
    pub operation: Operation,
    /// Full body for inserts, partial body for updates, none for deletes.
    pub payload: Option<Payload>,
    /// Timestamp the write must carry on the remote.
    pub record_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: OutboxStatus,
}

impl OutboxEntry {
    fn new(
        collection: &str,
        owner: &str,
        id: &str,
        operation: Operation,
        payload: Option<Payload>,
        record_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            collection: collection.to_string(),
            owner: owner.to_string(),
            id: id.to_string(),
            operation,
            payload,
            record_updated_at,
            created_at: super::record::now(),
            retry_count: 0,
            last_error: None,
            status: OutboxStatus::Pending,
        }
    }

    pub fn insert(
        collection: &str,
        owner: &str,
        id: &str,
        payload: Payload,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self::new(collection, owner, id, Operation::Insert, Some(payload), updated_at)
    }

    pub fn update(
        collection: &str,
        owner: &str,
        id: &str,
        partial: Payload,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self::new(collection, owner, id, Operation::Update, Some(partial), updated_at)
    }

    pub fn delete(collection: &str, owner: &str, id: &str, updated_at: DateTime<Utc>) -> Self {
        Self::new(collection, owner, id, Operation::Delete, None, updated_at)
    }

    /// The remote write this entry stands for.
    pub fn to_write_op(&self) -> WriteOp {
        let payload = self.payload.clone().unwrap_or_default();
        match self.operation {
            Operation::Insert => WriteOp::Insert {
                id: self.id.clone(),
                payload,
                updated_at: self.record_updated_at,
            },
            Operation::Update => WriteOp::Update {
                id: self.id.clone(),
                payload,
                updated_at: self.record_updated_at,
            },
            Operation::Delete => WriteOp::Delete {
                id: self.id.clone(),
                updated_at: self.record_updated_at,
            },
        }
    }
}

impl fmt::Display for OutboxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}/{} [{}]",
            self.sequence, self.operation, self.collection, self.id, self.status
        )?;
        if self.retry_count > 0 {
            write!(f, " retries={}", self.retry_count)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, " last_error={}", err)?;
        }
        Ok(())
    }
}
