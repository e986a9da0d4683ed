//! Core data models for the upload gateway.
//!
//! These types describe what flows through the ingestion pipeline: validated
//! object keys, the transient upload candidate, and the plain result values
//! handed back to the web layer. They serialize as JSON via `serde`.

pub mod identity;
pub mod object;
