//! In-memory user store for tests and ephemeral runs.
//!
//! [`InMemoryUserStore`] keeps every document in a `BTreeMap` behind a
//! `RwLock` and enforces the same uniqueness and version rules as the
//! SQLite backend. Data is lost when the store is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::db::models::{User, UserId};
use crate::social::repository::{StoreError, UniqueField, UpdateOutcome, UserFilter, UserStore};

#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<BTreeMap<UserId, User>>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Unavailable(format!("lock poisoned: {e}"))
}

fn clash(users: &BTreeMap<UserId, User>, candidate: &User) -> Option<UniqueField> {
    users
        .values()
        .filter(|u| u.id != candidate.id)
        .find_map(|u| {
            if u.email == candidate.email {
                Some(UniqueField::Email)
            } else if u.username == candidate.username {
                Some(UniqueField::Username)
            } else {
                None
            }
        })
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_one(&self, filter: &UserFilter) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.values().find(|u| filter.matches(u)).cloned())
    }

    async fn insert_one(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.write().map_err(poisoned)?;

        if users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user #{} already exists", user.id)));
        }
        if let Some(field) = clash(&users, user) {
            return Err(StoreError::Duplicate(field));
        }

        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_one(
        &self,
        filter: &UserFilter,
        user: &mut User,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut users = self.users.write().map_err(poisoned)?;

        let Some(id) = users.values().find(|u| filter.matches(u)).map(|u| u.id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if users[&id].version != user.version {
            return Ok(UpdateOutcome::Conflict);
        }
        if let Some(field) = clash(&users, user) {
            return Err(StoreError::Duplicate(field));
        }

        user.version += 1;
        users.remove(&id);
        users.insert(user.id, user.clone());
        Ok(UpdateOutcome::Updated)
    }

    async fn count_documents(&self, filter: &UserFilter) -> Result<u64, StoreError> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.values().filter(|u| filter.matches(u)).count() as u64)
    }

    async fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let mut sequences = self.sequences.lock().map_err(poisoned)?;
        let value = sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
