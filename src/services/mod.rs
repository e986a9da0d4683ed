//! The ingestion and delivery pipeline.
//!
//! Leaf components first: key sanitization, file validation, the streaming
//! transfer engine, the signed-link cache and the error translator. The
//! [`storage_service::StorageService`] facade wires them to a backend.

pub mod backend;
pub mod error_translator;
pub mod file_validator;
pub mod key_sanitizer;
pub mod retry;
pub mod storage_service;
pub mod transfer_engine;
pub mod url_cache;
