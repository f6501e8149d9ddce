//! Test infrastructure for the outbox relay.
//!
//! Isolated PostgreSQL databases for integration tests, and fixtures that
//! build well-formed and malformed event payloads.

#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;

pub use database::TestDatabase;
