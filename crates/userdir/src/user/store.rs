//! Storage trait for user records.

use async_trait::async_trait;

use super::error::UserResult;
use super::models::{NewUser, User, UserChanges, UserListQuery};

/// Backing store for the user directory.
///
/// Implementations own record persistence and the set of issued ids. Each
/// method is a single atomic step; concurrent mutations of the same record
/// are serialized by the implementation.
#[async_trait]
pub trait UserStore: Send + Sync + std::fmt::Debug {
    /// Record `id` as issued. Returns `false` if it was ever issued before,
    /// whether or not the record still exists.
    async fn reserve_id(&self, id: &str) -> UserResult<bool>;

    /// Insert a new record. Fails with `Conflict` if the email is taken.
    async fn insert(&self, user: NewUser) -> UserResult<User>;

    /// Get a record by id.
    async fn get(&self, id: &str) -> UserResult<Option<User>>;

    /// Get a record by (normalized) email.
    async fn get_by_email(&self, email: &str) -> UserResult<Option<User>>;

    /// Snapshot of records matching `query`, in insertion order.
    async fn list(&self, query: &UserListQuery) -> UserResult<Vec<User>>;

    /// Merge `changes` into the record. `None` if the id is unknown.
    async fn update(&self, id: &str, changes: UserChanges) -> UserResult<Option<User>>;

    /// Remove a record. `false` if the id is unknown.
    async fn delete(&self, id: &str) -> UserResult<bool>;

    /// Number of live records.
    async fn count(&self) -> UserResult<u64>;
}
