use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;

/// A short message. `id` is sequential per author, so `(author_id, id)` is
/// the globally unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub author_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn key(&self) -> (UserId, u64) {
        (self.author_id, self.id)
    }
}

/// The user document. Own posts and the aggregated feed are embedded, there
/// is no separate post collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub following: BTreeSet<String>,
    #[serde(default)]
    pub followers: BTreeSet<String>,
    #[serde(default)]
    pub own_posts: Vec<Post>,
    #[serde(default)]
    pub feed: Vec<Post>,
    /// Optimistic concurrency token, bumped by the store on every update.
    #[serde(default)]
    pub version: u64,
}

impl User {
    pub fn new(id: UserId, username: &str, email: &str, password_hash: String) -> Self {
        Self {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            following: BTreeSet::new(),
            followers: BTreeSet::new(),
            own_posts: Vec::new(),
            feed: Vec::new(),
            version: 0,
        }
    }

    /// Copy of the record with the password hash blanked out.
    pub fn redacted(&self) -> Self {
        Self {
            password_hash: String::new(),
            ..self.clone()
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            following: self.following.iter().cloned().collect(),
            followers: self.followers.iter().cloned().collect(),
            post_count: self.own_posts.len(),
        }
    }
}

/// Public view of a user, safe to hand to the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub following: Vec<String>,
    pub followers: Vec<String>,
    pub post_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: UserId,
    pub token: String,
    pub expires_at: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_hides_secret_and_posts() {
        let mut user = User::new(1, "alice", "alice@example.com", "$2b$hash".into());
        user.following.insert("bob".into());
        let json = serde_json::to_value(user.profile()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("feed").is_none());
        assert_eq!(json["following"][0], "bob");
    }

    #[test]
    fn redacted_clears_only_the_hash() {
        let user = User::new(7, "bob", "bob@example.com", "$2b$hash".into());
        let redacted = user.redacted();
        assert!(redacted.password_hash.is_empty());
        assert_eq!(redacted.username, "bob");
        assert_eq!(redacted.id, 7);
    }

    #[test]
    fn document_defaults_missing_collections() {
        let json = r#"{"id":3,"username":"c","email":"c@x","password_hash":"h"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert!(user.feed.is_empty());
        assert!(user.followers.is_empty());
        assert_eq!(user.version, 0);
    }
}
