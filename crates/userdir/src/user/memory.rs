//! In-memory user store.
//!
//! Mirrors the SQLite repository's semantics without a database. Used by
//! tests and by `serve --ephemeral`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::error::{UserError, UserResult};
use super::models::{NewUser, User, UserChanges, UserListQuery};
use super::store::UserStore;

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, User>,
    /// Live ids in insertion order.
    order: Vec<String>,
    issued: HashSet<String>,
}

impl Inner {
    fn email_owner(&self, email: &str) -> Option<&str> {
        self.users
            .values()
            .find(|u| u.email == email)
            .map(|u| u.id.as_str())
    }
}

/// User store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    inner: RwLock<Inner>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn reserve_id(&self, id: &str) -> UserResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.issued.insert(id.to_string()))
    }

    async fn insert(&self, user: NewUser) -> UserResult<User> {
        let mut inner = self.inner.write().await;

        if inner.users.contains_key(&user.id) {
            return Err(UserError::internal(format!("duplicate user id: {}", user.id)));
        }
        if inner.email_owner(&user.email).is_some() {
            return Err(UserError::conflict("Email is already registered."));
        }

        let user = User::from(user);
        inner.issued.insert(user.id.clone());
        inner.order.push(user.id.clone());
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get(&self, id: &str) -> UserResult<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> UserResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn list(&self, query: &UserListQuery) -> UserResult<Vec<User>> {
        let inner = self.inner.read().await;
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = match query.limit {
            Some(limit) if limit >= 0 => limit as usize,
            _ => usize::MAX,
        };

        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.users.get(id))
            .filter(|u| query.matches(u))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, changes: UserChanges) -> UserResult<Option<User>> {
        let mut inner = self.inner.write().await;

        if let Some(email) = &changes.email {
            if inner.email_owner(email).is_some_and(|owner| owner != id) {
                return Err(UserError::conflict("Email is already registered."));
            }
        }

        let Some(user) = inner.users.get_mut(id) else {
            return Ok(None);
        };
        changes.apply(user, Utc::now());
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: &str) -> UserResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.users.remove(id).is_none() {
            return Ok(false);
        }
        inner.order.retain(|existing| existing != id);
        Ok(true)
    }

    async fn count(&self) -> UserResult<u64> {
        Ok(self.inner.read().await.users.len() as u64)
    }
}
