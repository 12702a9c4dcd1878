//! Persistent storage for pipeline state
//!
//! SQLite-backed storage for file records, the task ledger, the directory tree and chunks.

pub mod database;
mod chunks;
mod ledger;
mod tree;

pub use database::KnowledgeDb;
