//! LifeSync sync server.
//!
//! Stores every owner's records in SQLite and serves the records API the
//! `life` CLI reconciles against.

pub mod server;
