//! Last-write-wins conflict resolution between a local and a remote version
//! of the same record.

use crate::models::Record;

/// Which side of a conflict won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Resolves conflicts by `updated_at`.
///
/// - The newer version wins.
/// - Equal timestamps go to the remote, which is the durable copy.
/// - A local tombstone beats a live remote version that is older or equally
///   old, so a delete made on this device is not undone by an unchanged
///   remote copy.
/// - A remote tombstone newer than a local edit wins over the edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn pick(&self, local: &Record, remote: &Record) -> Winner {
        if local.deleted && !remote.deleted && remote.updated_at <= local.updated_at {
            return Winner::Local;
        }
        if local.updated_at > remote.updated_at {
            Winner::Local
        } else {
            Winner::Remote
        }
    }

    pub fn resolve(&self, local: &Record, remote: &Record) -> Record {
        match self.pick(local, remote) {
            Winner::Local => local.clone(),
            Winner::Remote => remote.clone(),
        }
    }
}
