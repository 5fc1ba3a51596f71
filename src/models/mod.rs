//! Data models for the file service.
//!
//! Records map to database tables via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod file_record;
