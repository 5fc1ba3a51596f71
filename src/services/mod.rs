//! Business logic: hashing, key derivation, metadata persistence and the
//! ingestion/retrieval pipeline built on top of them.

pub mod file_repository;
pub mod file_service;
pub mod hasher;
pub mod keys;
