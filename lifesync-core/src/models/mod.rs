mod cursor;
mod outbox;
mod record;

pub use cursor::{ConnectivityState, SyncCursor};
pub use outbox::{Operation, OutboxEntry, OutboxStatus};
pub use record::{next_timestamp, now, timestamp_key, Payload, Record};
