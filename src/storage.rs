//! Storage subsystem
//!
//! This module provides abstractions and implementations for persisting
//! participants, their task recordings and final submissions.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform API.
//! - `types`: shared data types used by storage backends.
//! - `database_storage`: ORM-based SQLite implementation using SeaORM.
//! - `file_storage`: filesystem-backed implementation for simple persistence and inspection.
//! - `participant_filter`: helpers to build participant queries.
//! - `db_entities`: SeaORM entity models for the database backend.

pub mod database_storage;
pub mod db_entities;
pub mod file_storage;
pub mod participant_filter;
pub mod storage_trait;
pub mod types;

pub use database_storage::DatabaseStorage;
pub use file_storage::FileStorage;
pub use storage_trait::Storage;
