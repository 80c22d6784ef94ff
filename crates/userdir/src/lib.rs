//! User directory service library.
//!
//! Provides the user directory, its SQLite and in-memory stores, the REST API
//! over it, and configuration loading for the `userdir` binary.

pub mod api;
pub mod db;
pub mod settings;
pub mod user;
