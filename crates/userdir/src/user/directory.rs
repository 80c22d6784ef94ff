//! The user directory: validation, credentials and id assignment on top of a
//! [`UserStore`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::error::{UserError, UserResult};
use super::models::{
    CreateUserRequest, LoginRequest, NewUser, User, UserChanges, UserListQuery, UserPatch,
};
use super::store::UserStore;

/// Prefix for every generated user id.
pub const USER_ID_PREFIX: &str = "usr_";

/// Attempts at finding an unissued id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// bcrypt ignores input past this many bytes.
const MAX_PASSWORD_BYTES: usize = 72;

const MAX_DISPLAY_NAME_CHARS: usize = 100;
const MAX_AVATAR_URL_CHARS: usize = 2048;

/// Password rules applied by the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    /// Minimum password length in characters.
    pub min_password_length: usize,
    /// bcrypt cost factor (4..=31).
    pub bcrypt_cost: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_password_length: 6,
            bcrypt_cost: 10,
        }
    }
}

impl PasswordPolicy {
    /// Reject settings that would make every hash or every password fail.
    pub fn validate(&self) -> UserResult<()> {
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(UserError::validation(format!(
                "bcrypt_cost must be between 4 and 31, got {}.",
                self.bcrypt_cost
            )));
        }
        if self.min_password_length > MAX_PASSWORD_BYTES {
            return Err(UserError::validation(format!(
                "min_password_length must be at most {}, got {}.",
                MAX_PASSWORD_BYTES, self.min_password_length
            )));
        }
        Ok(())
    }
}

/// Sole authority over user records and their identifiers.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    store: Arc<dyn UserStore>,
    policy: PasswordPolicy,
}

impl UserDirectory {
    /// Create a directory over `store`.
    pub fn new(store: Arc<dyn UserStore>, policy: PasswordPolicy) -> Self {
        Self { store, policy }
    }

    /// Create a new user with a freshly generated id.
    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn create_user(&self, request: CreateUserRequest) -> UserResult<User> {
        let email = normalize_email(&request.email);
        if !is_valid_email(&email) {
            return Err(UserError::validation("Invalid email format."));
        }
        self.check_password(&request.password)?;

        let display_name = match request.display_name {
            Some(name) => validate_display_name(&name)?,
            None => default_display_name(&email),
        };
        let avatar_url = request
            .avatar_url
            .map(|url| validate_avatar_url(&url))
            .transpose()?;

        if self.store.get_by_email(&email).await?.is_some() {
            return Err(UserError::conflict(format!(
                "Email '{}' is already registered.",
                email
            )));
        }

        let password_hash = self.hash_password(request.password).await?;
        let id = self.generate_user_id().await?;

        let user = self
            .store
            .insert(NewUser {
                id,
                email,
                password_hash,
                display_name,
                avatar_url,
                role: request.role.unwrap_or_default(),
                created_at: Utc::now(),
            })
            .await?;

        info!(user_id = %user.id, "Created new user");
        Ok(user)
    }

    /// Check credentials. Unknown email and wrong password both yield `None`.
    #[instrument(skip(self, request))]
    pub async fn login(&self, request: LoginRequest) -> UserResult<Option<User>> {
        let email = normalize_email(&request.email);
        // bcrypt only sees the first 72 bytes, so longer input never matches.
        if !is_valid_email(&email)
            || request.password.is_empty()
            || request.password.len() > MAX_PASSWORD_BYTES
        {
            return Ok(None);
        }

        let Some(user) = self.store.get_by_email(&email).await? else {
            debug!("Login for unknown email");
            return Ok(None);
        };

        if self
            .verify_password(request.password, user.password_hash.clone())
            .await?
        {
            info!(user_id = %user.id, "User logged in");
            Ok(Some(user))
        } else {
            debug!(user_id = %user.id, "Login with wrong password");
            Ok(None)
        }
    }

    /// Get a user by id.
    #[instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: &str) -> UserResult<Option<User>> {
        self.store.get(id).await
    }

    /// Snapshot of every user, in insertion order.
    #[instrument(skip(self))]
    pub async fn get_all_users(&self) -> UserResult<Vec<User>> {
        self.store.list(&UserListQuery::default()).await
    }

    /// List users with optional filters.
    #[instrument(skip(self))]
    pub async fn list_users(&self, query: UserListQuery) -> UserResult<Vec<User>> {
        if query.limit.is_some_and(|limit| limit < 0) {
            return Err(UserError::validation("limit must be non-negative."));
        }
        if query.offset.is_some_and(|offset| offset < 0) {
            return Err(UserError::validation("offset must be non-negative."));
        }
        self.store.list(&query).await
    }

    /// Apply a partial update. `None` if the id is unknown.
    #[instrument(skip(self, patch))]
    pub async fn update_user(&self, id: &str, patch: UserPatch) -> UserResult<Option<User>> {
        if self.store.get(id).await?.is_none() {
            debug!(user_id = %id, "Update for unknown user");
            return Ok(None);
        }

        let mut changes = UserChanges {
            role: patch.role,
            ..Default::default()
        };

        if let Some(email) = &patch.email {
            let email = normalize_email(email);
            if !is_valid_email(&email) {
                return Err(UserError::validation("Invalid email format."));
            }
            // Check if new email is available (excluding current user)
            if let Some(existing) = self.store.get_by_email(&email).await? {
                if existing.id != id {
                    return Err(UserError::conflict(format!(
                        "Email '{}' is already registered.",
                        email
                    )));
                }
            }
            changes.email = Some(email);
        }

        if let Some(name) = &patch.display_name {
            changes.display_name = Some(validate_display_name(name)?);
        }

        if let Some(avatar_url) = &patch.avatar_url {
            changes.avatar_url = Some(
                avatar_url
                    .as_deref()
                    .map(validate_avatar_url)
                    .transpose()?,
            );
        }

        if let Some(password) = patch.password {
            self.check_password(&password)?;
            changes.password_hash = Some(self.hash_password(password).await?);
        }

        let user = self.store.update(id, changes).await?;
        match &user {
            Some(user) => info!(user_id = %user.id, "Updated user"),
            None => debug!(user_id = %id, "Update for unknown user"),
        }
        Ok(user)
    }

    /// Delete a user. `false` if there was nothing to delete.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: &str) -> UserResult<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(user_id = %id, "Deleted user");
        }
        Ok(deleted)
    }

    /// Produce an id that this store has never issued before.
    #[instrument(skip(self))]
    pub async fn generate_user_id(&self) -> UserResult<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = format!("{}{}", USER_ID_PREFIX, nanoid::nanoid!(12));
            if self.store.reserve_id(&candidate).await? {
                return Ok(candidate);
            }
            debug!(candidate = %candidate, "User id collision, retrying");
        }
        Err(UserError::internal("could not generate a unique user id"))
    }

    /// Number of live records.
    pub async fn count(&self) -> UserResult<u64> {
        self.store.count().await
    }

    fn check_password(&self, password: &str) -> UserResult<()> {
        if password.chars().count() < self.policy.min_password_length {
            return Err(UserError::validation(format!(
                "Password must be at least {} characters.",
                self.policy.min_password_length
            )));
        }
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(UserError::validation(format!(
                "Password must be at most {} bytes.",
                MAX_PASSWORD_BYTES
            )));
        }
        Ok(())
    }

    async fn hash_password(&self, password: String) -> UserResult<String> {
        let cost = self.policy.bcrypt_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
        Ok(hash)
    }

    async fn verify_password(&self, password: String, hash: String) -> UserResult<bool> {
        let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
        Ok(ok)
    }
}

/// Trim and lower-case an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email validation.
fn is_valid_email(email: &str) -> bool {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return false;
    }
    let (local, domain) = (parts[0], parts[1]);
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn validate_display_name(name: &str) -> UserResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(UserError::validation("Display name cannot be empty."));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(UserError::validation(format!(
            "Display name must be at most {} characters.",
            MAX_DISPLAY_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}

fn validate_avatar_url(url: &str) -> UserResult<String> {
    let url = url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(UserError::validation(
            "Invalid avatar URL: must start with http:// or https://",
        ));
    }
    if url.chars().count() > MAX_AVATAR_URL_CHARS {
        return Err(UserError::validation(format!(
            "Avatar URL must be at most {} characters.",
            MAX_AVATAR_URL_CHARS
        )));
    }
    Ok(url.to_string())
}

/// Display name derived from the local part of an email.
fn default_display_name(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::memory::MemoryUserStore;
    use crate::user::models::UserRole;
    use std::collections::HashSet;

    fn directory() -> UserDirectory {
        let policy = PasswordPolicy {
            bcrypt_cost: 4,
            ..Default::default()
        };
        UserDirectory::new(Arc::new(MemoryUserStore::new()), policy)
    }

    fn request(email: &str, password: &str) -> CreateUserRequest {
        CreateUserRequest {
            email: email.to_string(),
            password: password.to_string(),
            display_name: None,
            avatar_url: None,
            role: None,
        }
    }

    fn login(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("user.name@sub.domain.com"));
        assert!(!is_valid_email("userexample.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("a@b@example.com"));
        assert!(!is_valid_email("user@example."));
        assert!(!is_valid_email("us er@example.com"));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  A@X.com "), "a@x.com");
    }

    #[test]
    fn test_default_display_name() {
        assert_eq!(default_display_name("john@example.com"), "john");
    }

    #[tokio::test]
    async fn test_account_lifecycle() {
        let dir = directory();

        let created = dir.create_user(request("a@x.com", "p1p1p1")).await.unwrap();
        assert!(created.id.starts_with(USER_ID_PREFIX));
        assert_eq!(created.email, "a@x.com");
        assert_ne!(created.password_hash, "p1p1p1");

        assert!(dir.login(login("a@x.com", "wrong!")).await.unwrap().is_none());
        let logged_in = dir.login(login("a@x.com", "p1p1p1")).await.unwrap();
        assert_eq!(logged_in, Some(created.clone()));

        assert!(dir.delete_user(&created.id).await.unwrap());
        assert!(dir.get_user_by_id(&created.id).await.unwrap().is_none());
        assert!(!dir.delete_user(&created.id).await.unwrap());
        assert!(dir.login(login("a@x.com", "p1p1p1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_rejects_suffix_past_bcrypt_limit() {
        let dir = directory();
        let password = "a".repeat(MAX_PASSWORD_BYTES);
        let created = dir.create_user(request("t@x.com", &password)).await.unwrap();

        let longer = format!("{password}WRONG-SUFFIX");
        assert!(dir.login(login("t@x.com", &longer)).await.unwrap().is_none());

        let user = dir.login(login("t@x.com", &password)).await.unwrap();
        assert_eq!(user.map(|u| u.id), Some(created.id));
    }

    #[test]
    fn test_policy_validation() {
        assert!(PasswordPolicy::default().validate().is_ok());
        assert_eq!(PasswordPolicy::default().bcrypt_cost, 10);

        for cost in [3, 32] {
            let policy = PasswordPolicy {
                bcrypt_cost: cost,
                ..Default::default()
            };
            assert!(matches!(policy.validate(), Err(UserError::Validation(_))));
        }

        let policy = PasswordPolicy {
            min_password_length: MAX_PASSWORD_BYTES + 1,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(UserError::Validation(_))));
    }

    #[tokio::test]
    async fn test_login_unknown_email_is_absent() {
        let dir = directory();
        assert!(dir.login(login("ghost@x.com", "whatever")).await.unwrap().is_none());
        assert!(dir.login(login("not-an-email", "whatever")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_normalizes_email() {
        let dir = directory();
        let created = dir.create_user(request("Mixed@Example.com", "secret1")).await.unwrap();
        assert_eq!(created.email, "mixed@example.com");

        let user = dir.login(login(" MIXED@example.COM ", "secret1")).await.unwrap();
        assert_eq!(user.map(|u| u.id), Some(created.id));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let dir = directory();

        let err = dir.create_user(request("bad", "secret1")).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        let err = dir.create_user(request("a@x.com", "short")).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        let long = "x".repeat(MAX_PASSWORD_BYTES + 1);
        let err = dir.create_user(request("a@x.com", &long)).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        let mut req = request("a@x.com", "secret1");
        req.display_name = Some("   ".to_string());
        let err = dir.create_user(req).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        let mut req = request("a@x.com", "secret1");
        req.avatar_url = Some("ftp://example.com/a.png".to_string());
        let err = dir.create_user(req).await.unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        assert_eq!(dir.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let dir = directory();
        dir.create_user(request("a@x.com", "secret1")).await.unwrap();

        let err = dir
            .create_user(request("A@X.COM", "secret2"))
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let dir = directory();
        let mut seen = HashSet::new();
        for i in 0..20 {
            let user = dir
                .create_user(request(&format!("user{i}@x.com"), "secret1"))
                .await
                .unwrap();
            assert!(!user.id.is_empty());
            assert!(seen.insert(user.id));
        }
        for _ in 0..20 {
            assert!(seen.insert(dir.generate_user_id().await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_update_changes_only_supplied_fields() {
        let dir = directory();
        let mut req = request("a@x.com", "secret1");
        req.display_name = Some("Alice".to_string());
        req.avatar_url = Some("https://example.com/a.png".to_string());
        let created = dir.create_user(req).await.unwrap();

        let patch = UserPatch {
            display_name: Some("Alicia".to_string()),
            ..Default::default()
        };
        let updated = dir.update_user(&created.id, patch).await.unwrap().unwrap();

        assert_eq!(updated.display_name, "Alicia");
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.email, created.email);
        assert_eq!(updated.password_hash, created.password_hash);
        assert_eq!(updated.avatar_url, created.avatar_url);
        assert_eq!(updated.role, created.role);
        assert_eq!(updated.created_at, created.created_at);

        let fetched = dir.get_user_by_id(&created.id).await.unwrap();
        assert_eq!(fetched, Some(updated));
    }

    #[tokio::test]
    async fn test_update_password_and_role() {
        let dir = directory();
        let created = dir.create_user(request("a@x.com", "secret1")).await.unwrap();

        let patch = UserPatch {
            password: Some("secret2".to_string()),
            role: Some(UserRole::Admin),
            avatar_url: Some(None),
            ..Default::default()
        };
        let updated = dir.update_user(&created.id, patch).await.unwrap().unwrap();
        assert_eq!(updated.role, UserRole::Admin);

        assert!(dir.login(login("a@x.com", "secret1")).await.unwrap().is_none());
        assert!(dir.login(login("a@x.com", "secret2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_unknown_and_invalid() {
        let dir = directory();
        let patch = UserPatch {
            display_name: Some("Nobody".to_string()),
            ..Default::default()
        };
        assert!(dir.update_user("usr_missing", patch).await.unwrap().is_none());

        let created = dir.create_user(request("a@x.com", "secret1")).await.unwrap();
        dir.create_user(request("b@x.com", "secret1")).await.unwrap();

        // Unknown id wins over a taken email or a bad password.
        let patch = UserPatch {
            email: Some("b@x.com".to_string()),
            password: Some("123".to_string()),
            ..Default::default()
        };
        assert!(dir.update_user("usr_missing", patch).await.unwrap().is_none());

        let err = dir
            .update_user(
                &created.id,
                UserPatch {
                    email: Some("b@x.com".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Conflict(_)));

        let err = dir
            .update_user(
                &created.id,
                UserPatch {
                    password: Some("123".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Validation(_)));

        let unchanged = dir
            .update_user(&created.id, UserPatch::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged, created);
    }

    #[tokio::test]
    async fn test_get_all_users_in_insertion_order() {
        let dir = directory();
        let mut expected = Vec::new();
        for name in ["c", "a", "b"] {
            let user = dir
                .create_user(request(&format!("{name}@x.com"), "secret1"))
                .await
                .unwrap();
            expected.push(user.id);
        }

        let ids: Vec<_> = dir
            .get_all_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_list_rejects_negative_paging() {
        let dir = directory();
        let query = UserListQuery {
            limit: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            dir.list_users(query).await.unwrap_err(),
            UserError::Validation(_)
        ));
    }
}
