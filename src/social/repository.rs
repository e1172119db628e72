// Repository pattern - isolates all document store side effects
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, ErrorCode};
use thiserror::Error;

use crate::db::models::{User, UserId};
use crate::state::DbPool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate {0}")]
    Duplicate(UniqueField),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Username,
    Email,
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username => write!(f, "username"),
            Self::Email => write!(f, "email"),
        }
    }
}

/// Selects user documents by one of their unique fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    All,
    Id(UserId),
    Username(String),
    Email(String),
}

impl UserFilter {
    pub fn username(name: impl Into<String>) -> Self {
        Self::Username(name.into())
    }

    pub fn email(email: impl Into<String>) -> Self {
        Self::Email(email.into())
    }

    /// Exact, case-sensitive match as stored.
    pub fn matches(&self, user: &User) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => user.id == *id,
            Self::Username(name) => user.username == *name,
            Self::Email(email) => user.email == *email,
        }
    }

    fn clause(&self) -> (&'static str, Vec<Value>) {
        match self {
            Self::All => ("1 = 1", vec![]),
            Self::Id(id) => ("id = ?", vec![Value::Integer(*id as i64)]),
            Self::Username(name) => ("username = ?", vec![Value::Text(name.clone())]),
            Self::Email(email) => ("email = ?", vec![Value::Text(email.clone())]),
        }
    }
}

impl fmt::Display for UserFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all users"),
            Self::Id(id) => write!(f, "user #{}", id),
            Self::Username(name) => write!(f, "username {:?}", name),
            Self::Email(email) => write!(f, "email {:?}", email),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The stored version moved on since the document was read.
    Conflict,
    NotFound,
}

/// Document store for user records.
///
/// `update_one` is version-checked: it only replaces the stored document if
/// the stored `version` still equals the version carried by `user`, and bumps
/// `user.version` on success. Callers run read-modify-write cycles in a retry
/// loop instead of silently overwriting concurrent changes.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// First document matching `filter`, in id order.
    async fn find_one(&self, filter: &UserFilter) -> Result<Option<User>, StoreError>;

    /// Insert a new document. Fails with `Duplicate` on a username or email clash.
    async fn insert_one(&self, user: &User) -> Result<(), StoreError>;

    /// Replace the document matching `filter` if its version is unchanged.
    async fn update_one(
        &self,
        filter: &UserFilter,
        user: &mut User,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn count_documents(&self, filter: &UserFilter) -> Result<u64, StoreError>;

    /// Atomically increment and return the named counter (starts at 1).
    async fn next_sequence(&self, name: &str) -> Result<u64, StoreError>;
}

/// Type alias for Arc-wrapped store (for AppState)
pub type DynUserStore = Arc<dyn UserStore>;

/// What a read-modify-write step decided to do with the loaded document.
pub enum Mutation<T> {
    Write(T),
    /// Nothing changed, skip the write.
    Skip(T),
}

/// Load the document matching `filter`, apply `apply`, and write it back with
/// a version check. On conflict the document is reloaded and `apply` runs
/// again on the fresh copy, up to `max_attempts` times.
///
/// Returns `Ok(None)` if no document matches.
pub async fn modify_user<T, F>(
    store: &dyn UserStore,
    filter: &UserFilter,
    max_attempts: u32,
    mut apply: F,
) -> Result<Option<(User, T)>, StoreError>
where
    F: FnMut(&mut User) -> Mutation<T> + Send,
    T: Send,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let Some(mut user) = store.find_one(filter).await? else {
            return Ok(None);
        };

        let value = match apply(&mut user) {
            Mutation::Write(value) => value,
            Mutation::Skip(value) => return Ok(Some((user, value))),
        };

        match store.update_one(filter, &mut user).await? {
            UpdateOutcome::Updated => return Ok(Some((user, value))),
            UpdateOutcome::NotFound => return Ok(None),
            UpdateOutcome::Conflict => {
                tracing::debug!(%filter, attempt, "Write conflict, reloading");
            }
        }
    }

    Err(StoreError::Conflict(format!(
        "{filter} still contended after {max_attempts} attempts"
    )))
}

/// SQLite implementation. Each user is one row holding the JSON document;
/// `username`, `email` and `version` are mirrored into columns for lookup,
/// uniqueness and compare-and-swap.
pub struct SqliteUserStore {
    pool: DbPool,
}

impl SqliteUserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn unique_violation(err: &rusqlite::Error) -> Option<UniqueField> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) if e.code == ErrorCode::ConstraintViolation => {
            if msg.contains("users.email") {
                Some(UniqueField::Email)
            } else if msg.contains("users.username") {
                Some(UniqueField::Username)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn find_one(&self, filter: &UserFilter) -> Result<Option<User>, StoreError> {
        let conn = self.pool.get()?;
        let (clause, args) = filter.clause();

        let result: Result<(i64, String), rusqlite::Error> = conn.query_row(
            &format!("SELECT version, document FROM users WHERE {clause} ORDER BY id LIMIT 1"),
            params_from_iter(args),
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match result {
            Ok((version, json)) => {
                let mut user: User = serde_json::from_str(&json)?;
                user.version = version as u64;
                Ok(Some(user))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_one(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let document = serde_json::to_string(user)?;

        conn.execute(
            "INSERT INTO users (id, username, email, version, document)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id as i64,
                user.username,
                user.email,
                user.version as i64,
                document
            ],
        )
        .map_err(|e| match unique_violation(&e) {
            Some(field) => StoreError::Duplicate(field),
            None => e.into(),
        })?;

        Ok(())
    }

    async fn update_one(
        &self,
        filter: &UserFilter,
        user: &mut User,
    ) -> Result<UpdateOutcome, StoreError> {
        let conn = self.pool.get()?;
        let expected = user.version;

        let mut next = user.clone();
        next.version = expected + 1;
        let document = serde_json::to_string(&next)?;

        let (clause, args) = filter.clause();
        let mut values = vec![
            Value::Text(document),
            Value::Text(next.username.clone()),
            Value::Text(next.email.clone()),
        ];
        values.extend(args);
        values.push(Value::Integer(expected as i64));

        let rows = conn
            .execute(
                &format!(
                    "UPDATE users SET document = ?, username = ?, email = ?,
                       version = version + 1, updated_at = datetime('now')
                     WHERE {clause} AND version = ?"
                ),
                params_from_iter(values),
            )
            .map_err(|e| match unique_violation(&e) {
                Some(field) => StoreError::Duplicate(field),
                None => e.into(),
            })?;

        if rows > 0 {
            user.version = next.version;
            return Ok(UpdateOutcome::Updated);
        }

        let (clause, args) = filter.clause();
        let exists: bool = conn.query_row(
            &format!("SELECT COUNT(*) > 0 FROM users WHERE {clause}"),
            params_from_iter(args),
            |row| row.get(0),
        )?;

        Ok(if exists {
            UpdateOutcome::Conflict
        } else {
            UpdateOutcome::NotFound
        })
    }

    async fn count_documents(&self, filter: &UserFilter) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let (clause, args) = filter.clause();

        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM users WHERE {clause}"),
            params_from_iter(args),
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }

    async fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;

        let value: i64 = conn.query_row(
            "INSERT INTO sequences (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            params![name],
            |row| row.get(0),
        )?;

        Ok(value as u64)
    }
}
