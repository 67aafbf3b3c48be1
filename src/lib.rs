//! # Comment Harness
//!
//! Idempotent ingestion of timestamped chat-comment archives into SQLite,
//! per-subject vector indexes published as immutable generations, and three
//! retrieval modes over them: similarity, centroid (typicality) and
//! weighted emotion axes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Archives   │──▶│   Ingest    │──▶│    SQLite     │
//! │ <id>.json   │   │ + ledger    │   │ store+markers │
//! └─────────────┘   └─────────────┘   └──────┬───────┘
//!                                            │
//!                                     ┌──────▼───────┐
//!                                     │ Index build  │  g<N>/ + CURRENT
//!                                     └──────┬───────┘
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │   CLI    │         │   HTTP   │
//!                 │  (chx)   │         │  (axum)  │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | Database connection and schema |
//! | [`archive`] | Archive discovery and parsing |
//! | [`ledger`] | Per-session ingest markers |
//! | [`store`] | Upserts, reaction counters, lookups |
//! | [`ingest`] | The ingestion pipeline |
//! | [`embedding`] | Embedding providers and retry |
//! | [`index_store`] | On-disk index generations |
//! | [`index_build`] | Incremental per-subject index builds |
//! | [`retrieval`] | Snapshot cache and query execution |
//! | [`search`] | CLI search front-end |
//! | [`notes`] | Context notes for disliked comments |
//! | [`stats`] | Count summaries |
//! | [`server`] | HTTP serving boundary |
//!
//! Pure types and ranking live in the `comment-harness-core` crate.

pub mod archive;
pub mod config;
pub mod db;
pub mod embedding;
pub mod index_build;
pub mod index_store;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod notes;
pub mod retrieval;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
