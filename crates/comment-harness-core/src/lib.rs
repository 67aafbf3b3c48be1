//! # Comment Harness Core
//!
//! Pure logic for Comment Harness: data models, the embedding provider
//! trait, the per-subject index snapshot and its on-disk codec, and the
//! retrieval algorithms (similarity, centroid, emotion).
//!
//! This crate contains no tokio, sqlx, filesystem or network I/O. Every
//! function here is a deterministic function of its inputs, which is what
//! makes retrieval results reproducible across processes.

pub mod embedding;
pub mod index;
pub mod models;
pub mod retrieval;
