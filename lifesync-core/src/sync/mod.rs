//! Remote side of sync: wire protocol, client facade and write rules.

mod apply;
mod client;
mod error;
mod memory;
mod protocol;

pub use apply::{apply_write, WriteRejection};
pub use client::{HttpRemoteClient, NoRemote, RemoteClient, DEFAULT_CALL_TIMEOUT};
pub use error::RemoteError;
pub use memory::MemoryRemote;
pub use protocol::{
    ErrorResponse, HealthResponse, QueryResponse, RemoteQuery, WriteOp, WriteResponse,
};
