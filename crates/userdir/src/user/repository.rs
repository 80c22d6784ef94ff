//! SQLite-backed user store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::error::UserResult;
use super::models::{NewUser, User, UserChanges, UserListQuery};
use super::store::UserStore;

const USER_COLUMNS: &str =
    "id, email, password_hash, display_name, avatar_url, role, created_at, updated_at";

/// Repository for user database operations.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Create a new user repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for UserRepository {
    #[instrument(skip(self))]
    async fn reserve_id(&self, id: &str) -> UserResult<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO issued_user_ids (id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert(&self, user: NewUser) -> UserResult<User> {
        debug!("Inserting user {}", user.id);

        let sql = format!(
            r#"
            INSERT INTO users (id, email, password_hash, display_name, avatar_url, role, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {USER_COLUMNS}
            "#
        );

        let stored = sqlx::query_as::<_, User>(&sql)
            .bind(&user.id)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.display_name)
            .bind(&user.avatar_url)
            .bind(user.role)
            .bind(user.created_at)
            .bind(user.created_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> UserResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn get_by_email(&self, email: &str) -> UserResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn list(&self, query: &UserListQuery) -> UserResult<Vec<User>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = query.limit.unwrap_or(-1);
        let offset = query.offset.unwrap_or(0);

        let mut sql = format!("SELECT {USER_COLUMNS} FROM users WHERE 1=1");
        let mut bind_values: Vec<String> = Vec::new();

        if let Some(role) = &query.role {
            sql.push_str(" AND role = ?");
            bind_values.push(role.to_string());
        }

        if let Some(search) = &query.search {
            sql.push_str(" AND (email LIKE ? ESCAPE '\\' OR display_name LIKE ? ESCAPE '\\')");
            let pattern = format!("%{}%", escape_like(search));
            bind_values.push(pattern.clone());
            bind_values.push(pattern);
        }

        sql.push_str(" ORDER BY rowid ASC LIMIT ? OFFSET ?");

        let mut query_builder = sqlx::query_as::<_, User>(&sql);
        for value in &bind_values {
            query_builder = query_builder.bind(value);
        }
        query_builder = query_builder.bind(limit).bind(offset);

        Ok(query_builder.fetch_all(&self.pool).await?)
    }

    #[instrument(skip(self, changes))]
    async fn update(&self, id: &str, changes: UserChanges) -> UserResult<Option<User>> {
        if changes.is_empty() {
            return self.get(id).await;
        }

        let mut updates = Vec::new();
        let mut values: Vec<Option<String>> = Vec::new();

        if let Some(email) = changes.email {
            updates.push("email = ?");
            values.push(Some(email));
        }

        if let Some(hash) = changes.password_hash {
            updates.push("password_hash = ?");
            values.push(Some(hash));
        }

        if let Some(display_name) = changes.display_name {
            updates.push("display_name = ?");
            values.push(Some(display_name));
        }

        if let Some(avatar_url) = changes.avatar_url {
            updates.push("avatar_url = ?");
            values.push(avatar_url);
        }

        if let Some(role) = changes.role {
            updates.push("role = ?");
            values.push(Some(role.to_string()));
        }

        updates.push("updated_at = ?");

        let sql = format!(
            "UPDATE users SET {} WHERE id = ? RETURNING {USER_COLUMNS}",
            updates.join(", ")
        );

        let mut query_builder = sqlx::query_as::<_, User>(&sql);
        for value in &values {
            query_builder = query_builder.bind(value);
        }
        query_builder = query_builder.bind(Utc::now()).bind(id);

        Ok(query_builder.fetch_optional(&self.pool).await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> UserResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn count(&self) -> UserResult<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0.max(0) as u64)
    }
}

/// Escape `LIKE` wildcards so `search` matches literally.
fn escape_like(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len());
    for c in search.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::user::UserError;
    use crate::user::models::UserRole;

    async fn setup_repo() -> UserRepository {
        let db = Database::in_memory().await.unwrap();
        UserRepository::new(db.pool().clone())
    }

    fn new_user(id: &str, email: &str) -> NewUser {
        NewUser {
            id: id.to_string(),
            email: email.to_string(),
            password_hash: "hashed_password".to_string(),
            display_name: "Test User".to_string(),
            avatar_url: None,
            role: UserRole::User,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let repo = setup_repo().await;

        let user = repo
            .insert(new_user("usr_a", "test@example.com"))
            .await
            .unwrap();
        assert_eq!(user.id, "usr_a");
        assert_eq!(user.email, "test@example.com");
        assert_eq!(user.role, UserRole::User);
        assert_eq!(user.created_at, user.updated_at);

        let fetched = repo.get("usr_a").await.unwrap().unwrap();
        assert_eq!(fetched, user);

        let by_email = repo.get_by_email("test@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, user.id);

        assert!(repo.get("usr_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let repo = setup_repo().await;
        repo.insert(new_user("usr_a", "dup@example.com")).await.unwrap();

        let err = repo
            .insert(new_user("usr_b", "dup@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reserve_id_never_reissues() {
        let repo = setup_repo().await;

        assert!(repo.reserve_id("usr_a").await.unwrap());
        assert!(!repo.reserve_id("usr_a").await.unwrap());

        repo.insert(new_user("usr_a", "a@example.com")).await.unwrap();
        assert!(repo.delete("usr_a").await.unwrap());
        assert!(!repo.reserve_id("usr_a").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_user() {
        let repo = setup_repo().await;
        let user = repo
            .insert(new_user("usr_a", "update@example.com"))
            .await
            .unwrap();

        let changes = UserChanges {
            display_name: Some("Updated Name".to_string()),
            role: Some(UserRole::Admin),
            avatar_url: Some(Some("https://example.com/a.png".to_string())),
            ..Default::default()
        };

        let updated = repo.update(&user.id, changes).await.unwrap().unwrap();
        assert_eq!(updated.display_name, "Updated Name");
        assert_eq!(updated.role, UserRole::Admin);
        assert_eq!(updated.avatar_url.as_deref(), Some("https://example.com/a.png"));
        assert_eq!(updated.email, user.email);
        assert_eq!(updated.password_hash, user.password_hash);
        assert_eq!(updated.created_at, user.created_at);

        let cleared = repo
            .update(
                &user.id,
                UserChanges {
                    avatar_url: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(cleared.avatar_url.is_none());
        assert_eq!(cleared.display_name, "Updated Name");
    }

    #[tokio::test]
    async fn test_update_unknown_user() {
        let repo = setup_repo().await;
        let changes = UserChanges {
            display_name: Some("Nobody".to_string()),
            ..Default::default()
        };
        assert!(repo.update("usr_missing", changes).await.unwrap().is_none());
        assert!(
            repo.update("usr_missing", UserChanges::default())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_to_taken_email_is_conflict() {
        let repo = setup_repo().await;
        repo.insert(new_user("usr_a", "a@example.com")).await.unwrap();
        repo.insert(new_user("usr_b", "b@example.com")).await.unwrap();

        let err = repo
            .update(
                "usr_b",
                UserChanges {
                    email: Some("a@example.com".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_user() {
        let repo = setup_repo().await;
        repo.insert(new_user("usr_a", "delete@example.com"))
            .await
            .unwrap();

        assert!(repo.delete("usr_a").await.unwrap());
        assert!(repo.get("usr_a").await.unwrap().is_none());
        assert!(!repo.delete("usr_a").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_users() {
        let repo = setup_repo().await;

        for i in 0..5 {
            let mut user = new_user(&format!("usr_{}", i), &format!("user{}@example.com", i));
            if i == 0 {
                user.role = UserRole::Admin;
            }
            repo.insert(user).await.unwrap();
        }

        let all = repo.list(&UserListQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["usr_0", "usr_1", "usr_2", "usr_3", "usr_4"]);
        assert_eq!(repo.count().await.unwrap(), 5);

        let admins = repo
            .list(&UserListQuery {
                role: Some(UserRole::Admin),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(admins.len(), 1);

        let search = repo
            .list(&UserListQuery {
                search: Some("user2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.len(), 1);

        let page = repo
            .list(&UserListQuery {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["usr_1", "usr_2"]);
    }

    #[tokio::test]
    async fn test_search_matches_memory_store() {
        use crate::user::memory::MemoryUserStore;

        let repo = setup_repo().await;
        let memory = MemoryUserStore::new();
        let stores: [&dyn UserStore; 2] = [&repo, &memory];

        for store in stores {
            let mut alice = new_user("usr_a", "alice@x.com");
            alice.display_name = "Älice".to_string();
            store.insert(alice).await.unwrap();
            store.insert(new_user("usr_b", "bob@x.com")).await.unwrap();
            store.insert(new_user("usr_c", "c_100%@x.com")).await.unwrap();
        }

        for (search, expected) in [
            ("_", vec!["usr_c"]),
            ("%", vec!["usr_c"]),
            ("a_i", vec![]),
            ("c_1", vec!["usr_c"]),
            ("ALICE", vec!["usr_a"]),
            ("älice", vec![]),
            ("Älice", vec!["usr_a"]),
            ("\\", vec![]),
        ] {
            let query = UserListQuery {
                search: Some(search.to_string()),
                ..Default::default()
            };
            for store in stores {
                let ids: Vec<String> = store
                    .list(&query)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|u| u.id)
                    .collect();
                assert_eq!(ids, expected, "search {search:?} on {store:?}");
            }
        }
    }
}
