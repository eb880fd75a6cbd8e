/// User store boundary
///
/// The session core only reads users by email and creates them at
/// registration. Uniqueness of username and email is owned by the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, DatabaseError};

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user. Fails with a unique-constraint conflict if the
    /// username or email is taken.
    async fn create(&self, user: NewUser) -> Result<User, AppError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;
}

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
    async fn create(&self, user: NewUser) -> Result<User, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            created_at: now,
        })
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, String, DateTime<Utc>)>(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, username, email, password_hash, created_at)| User {
            id,
            username,
            email,
            password_hash,
            created_at,
        }))
    }
}

/// In-process user store for tests
#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn create(&self, user: NewUser) -> Result<User, AppError> {
        let mut users = self
            .users
            .lock()
            .map_err(|_| AppError::Internal("User store lock poisoned".to_string()))?;

        let constraint = users.values().find_map(|existing| {
            if existing.email.eq_ignore_ascii_case(&user.email) {
                Some("users_email_key")
            } else if existing.username.eq_ignore_ascii_case(&user.username) {
                Some("users_username_lower_key")
            } else {
                None
            }
        });
        if let Some(constraint) = constraint {
            return Err(DatabaseError::UniqueConstraintViolation(constraint.to_string()).into());
        }

        let created = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            created_at: Utc::now(),
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let users = self
            .users
            .lock()
            .map_err(|_| AppError::Internal("User store lock poisoned".to_string()))?;

        Ok(users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }
}
