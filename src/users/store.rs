use axum::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database. `refresh_token` is the single active
/// session credential: the stored value is the validity oracle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields supplied at creation; id and timestamps are store-assigned.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: String,
}

/// Store boundary for user records. Uniqueness of username/email is
/// enforced by the store; refresh-token updates are single atomic writes.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    async fn create(&self, new: NewUser) -> anyhow::Result<User>;

    /// Overwrite the stored refresh token unconditionally (login).
    async fn set_refresh_token(&self, id: Uuid, token: &str) -> anyhow::Result<Option<User>>;

    /// Compare-and-swap: replace the stored refresh token with `next` only
    /// if it still equals `current`. Returns `None` when the stored value
    /// no longer matches, so concurrent rotations get exactly one winner.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> anyhow::Result<Option<User>>;

    /// Unset the stored refresh token (logout).
    async fn clear_refresh_token(&self, id: Uuid) -> anyhow::Result<Option<User>>;
}

const USER_COLUMNS: &str =
    "id, username, email, full_name, password_hash, avatar_url, cover_image_url, \
     refresh_token, created_at, updated_at";

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $2"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> anyhow::Result<User> {
        let sql = format!(
            "INSERT INTO users (username, email, full_name, password_hash, avatar_url, cover_image_url) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(new.username)
            .bind(new.email)
            .bind(new.full_name)
            .bind(new.password_hash)
            .bind(new.avatar_url)
            .bind(new.cover_image_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(user)
    }

    async fn set_refresh_token(&self, id: Uuid, token: &str) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET refresh_token = $2, updated_at = now() \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> anyhow::Result<Option<User>> {
        // The WHERE clause is the rotation invariant: the swap lands only
        // if the stored value is still the one the caller presented.
        let sql = format!(
            "UPDATE users SET refresh_token = $3, updated_at = now() \
             WHERE id = $1 AND refresh_token = $2 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(current)
            .bind(next)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn clear_refresh_token(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let sql = format!(
            "UPDATE users SET refresh_token = NULL, updated_at = now() \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }
}

/// In-memory store with the same single-writer semantics as the Postgres
/// one. Backs `AppState::fake()` and the lifecycle tests.
#[derive(Default)]
pub struct MemUserStore {
    users: std::sync::Mutex<Vec<User>>,
}

impl MemUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UserStore for MemUserStore {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .find(|u| {
                username.is_some_and(|n| u.username == n) || email.is_some_and(|e| u.email == e)
            })
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn create(&self, new: NewUser) -> anyhow::Result<User> {
        let mut users = self.users.lock().unwrap();
        if users
            .iter()
            .any(|u| u.username == new.username || u.email == new.email)
        {
            anyhow::bail!("duplicate username or email");
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            full_name: new.full_name,
            password_hash: new.password_hash,
            avatar_url: new.avatar_url,
            cover_image_url: new.cover_image_url,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn set_refresh_token(&self, id: Uuid, token: &str) -> anyhow::Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        Ok(users.iter_mut().find(|u| u.id == id).map(|u| {
            u.refresh_token = Some(token.to_string());
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> anyhow::Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        Ok(users
            .iter_mut()
            .find(|u| u.id == id && u.refresh_token.as_deref() == Some(current))
            .map(|u| {
                u.refresh_token = Some(next.to_string());
                u.updated_at = OffsetDateTime::now_utc();
                u.clone()
            }))
    }

    async fn clear_refresh_token(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        Ok(users.iter_mut().find(|u| u.id == id).map(|u| {
            u.refresh_token = None;
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: email.into(),
            full_name: "Test User".into(),
            password_hash: "$argon2id$fake".into(),
            avatar_url: "https://cdn.test/avatars/a.png".into(),
            cover_image_url: String::new(),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_username_and_email() {
        let store = MemUserStore::new();
        store.create(new_user("dana", "dana@example.com")).await.unwrap();
        assert!(store.create(new_user("dana", "other@example.com")).await.is_err());
        assert!(store.create(new_user("other", "dana@example.com")).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn find_matches_either_identifier() {
        let store = MemUserStore::new();
        let created = store.create(new_user("dana", "dana@example.com")).await.unwrap();

        let by_name = store
            .find_by_username_or_email(Some("dana"), None)
            .await
            .unwrap()
            .expect("found by username");
        assert_eq!(by_name.id, created.id);

        let by_email = store
            .find_by_username_or_email(None, Some("dana@example.com"))
            .await
            .unwrap()
            .expect("found by email");
        assert_eq!(by_email.id, created.id);

        assert!(store
            .find_by_username_or_email(Some("nobody"), Some("nobody@example.com"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rotate_swaps_only_on_matching_value() {
        let store = MemUserStore::new();
        let user = store.create(new_user("dana", "dana@example.com")).await.unwrap();
        store.set_refresh_token(user.id, "t0").await.unwrap();

        let rotated = store
            .rotate_refresh_token(user.id, "t0", "t1")
            .await
            .unwrap()
            .expect("first rotation wins");
        assert_eq!(rotated.refresh_token.as_deref(), Some("t1"));

        // Stale value loses; stored token is untouched.
        assert!(store
            .rotate_refresh_token(user.id, "t0", "t2")
            .await
            .unwrap()
            .is_none());
        let current = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(current.refresh_token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn clear_unsets_refresh_token() {
        let store = MemUserStore::new();
        let user = store.create(new_user("dana", "dana@example.com")).await.unwrap();
        store.set_refresh_token(user.id, "t0").await.unwrap();

        let cleared = store
            .clear_refresh_token(user.id)
            .await
            .unwrap()
            .expect("user exists");
        assert!(cleared.refresh_token.is_none());
        assert!(store
            .rotate_refresh_token(user.id, "t0", "t1")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn secrets_never_serialize() {
        let user = User {
            id: Uuid::new_v4(),
            username: "dana".into(),
            email: "dana@example.com".into(),
            full_name: "Dana".into(),
            password_hash: "$argon2id$fake".into(),
            avatar_url: "https://cdn.test/a.png".into(),
            cover_image_url: String::new(),
            refresh_token: Some("secret-token".into()),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("refresh_token"));
        assert!(!json.contains("secret-token"));
    }
}
