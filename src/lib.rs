//! Secure upload gateway: validates untrusted uploads, streams them into an
//! S3-compatible object store under generated keys and hands out short-lived
//! signed links.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
