//! Mimir: honeypot-telemetry ingestion and enrichment for the Vanopticon
//! suite.
//!
//! The crate streams Cowrie-style JSON event logs into a relational store
//! (embedded SQLite or PostgreSQL) with exactly-once natural keys,
//! checkpointing and a dead-letter queue; scores and defangs live attacker
//! payloads before they are persisted; enriches source IPs and file hashes
//! against external threat-intelligence services through a three-tier cache;
//! classifies source IPs against downloadable prefix lists; and maintains
//! immutable point-in-time enrichment snapshots on session summaries.

pub mod config;
pub mod db;
pub mod dlq;
pub mod enrich;
pub mod event;
pub mod ipclass;
pub mod loader;
pub mod observability;
pub mod status;
