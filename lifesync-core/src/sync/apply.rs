//! How the backend applies a single write.
//!
//! Shared by the server and [`super::MemoryRemote`] so both behave the same.
//! Every rule is idempotent: applying the same [`WriteOp`] twice leaves the
//! same stored record as applying it once.

use thiserror::Error;

use super::protocol::WriteOp;
use crate::collections::{validate_insert, validate_scope, validate_update, ValidationError};
use crate::models::Record;

#[derive(Error, Debug, PartialEq)]
pub enum WriteRejection {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
}

impl WriteRejection {
    /// HTTP status the server answers with.
    pub fn status(&self) -> u16 {
        match self {
            WriteRejection::Invalid(_) => 422,
            WriteRejection::NotFound { .. } => 404,
        }
    }
}

/// Computes the stored record after applying `op` on top of `existing`.
pub fn apply_write(
    collection: &str,
    owner: &str,
    existing: Option<Record>,
    op: &WriteOp,
) -> Result<Record, WriteRejection> {
    validate_scope(collection, owner)?;
    if op.id().trim().is_empty() {
        return Err(ValidationError::EmptyId.into());
    }

    match op {
        WriteOp::Insert {
            id,
            payload,
            updated_at,
        } => {
            validate_insert(collection, payload)?;
            match existing {
                Some(stored) if stored.updated_at > *updated_at => Ok(stored),
                _ => Ok(Record {
                    collection: collection.to_string(),
                    owner: owner.to_string(),
                    id: id.clone(),
                    payload: payload.clone(),
                    updated_at: *updated_at,
                    deleted: false,
                }),
            }
        }
        WriteOp::Update {
            id,
            payload,
            updated_at,
        } => {
            validate_update(collection, payload)?;
            let mut stored = existing.ok_or_else(|| WriteRejection::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })?;
            if stored.deleted || stored.updated_at > *updated_at {
                return Ok(stored);
            }
            stored.merge_payload(payload);
            stored.updated_at = *updated_at;
            Ok(stored)
        }
        WriteOp::Delete { id, updated_at } => match existing {
            Some(mut stored) => {
                stored.deleted = true;
                stored.updated_at = stored.updated_at.max(*updated_at);
                Ok(stored)
            }
            None => Ok(Record::tombstone(collection, owner, id.clone(), *updated_at)),
        },
    }
}
