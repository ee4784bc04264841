//! LifeSync Core Library
//!
//! Record model, conflict rules, filters and the remote client shared by the
//! LifeSync CLI and server.

pub mod collections;
pub mod conflict;
pub mod filter;
pub mod models;
pub mod sync;

pub use collections::{Collection, CollectionRecord, Typed, ValidationError};
pub use conflict::{ConflictResolver, Winner};
pub use filter::{apply_filter, Condition, Filter, FilterError, Op, OrderBy};
pub use models::{
    ConnectivityState, Operation, OutboxEntry, OutboxStatus, Payload, Record, SyncCursor,
};
pub use sync::{
    HttpRemoteClient, MemoryRemote, NoRemote, QueryResponse, RemoteClient, RemoteError,
    RemoteQuery, WriteOp,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
