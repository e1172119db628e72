use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio::task;

use crate::db::models::{User, UserId};
use crate::social::error::{SocialError, SocialResult};
use crate::social::repository::{DynUserStore, StoreError, UniqueField, UserFilter};
use crate::social::validation::require_well_formed;

/// Counter name used to hand out user ids.
pub const USER_SEQUENCE: &str = "users";

/// Registration candidate as submitted by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Registration and credential checks on top of the user store.
pub struct IdentityService {
    store: DynUserStore,
    bcrypt_cost: u32,
    dummy_hash: OnceCell<String>,
}

impl IdentityService {
    pub fn new(store: DynUserStore, bcrypt_cost: u32) -> Self {
        Self {
            store,
            bcrypt_cost,
            dummy_hash: OnceCell::new(),
        }
    }

    /// Create a user. Email uniqueness is checked before username uniqueness.
    /// The returned record carries the password hash; callers must not expose it.
    pub async fn register(&self, candidate: &Registration) -> SocialResult<User> {
        require_well_formed(&[
            ("username", candidate.username.as_str()),
            ("email", candidate.email.as_str()),
            ("password", candidate.password.as_str()),
        ])?;

        if self
            .store
            .count_documents(&UserFilter::email(&candidate.email))
            .await?
            > 0
        {
            return Err(SocialError::DuplicateEmail);
        }
        if self
            .store
            .count_documents(&UserFilter::username(&candidate.username))
            .await?
            > 0
        {
            return Err(SocialError::DuplicateUsername);
        }

        let id = self.store.next_sequence(USER_SEQUENCE).await?;
        let password_hash = hash_password(&candidate.password, self.bcrypt_cost).await?;
        let user = User::new(id, &candidate.username, &candidate.email, password_hash);

        // The unique indexes catch a concurrent registration that slipped
        // past the checks above.
        self.store.insert_one(&user).await.map_err(|e| match e {
            StoreError::Duplicate(UniqueField::Email) => SocialError::DuplicateEmail,
            StoreError::Duplicate(UniqueField::Username) => SocialError::DuplicateUsername,
            other => other.into(),
        })?;

        tracing::info!(user_id = id, username = %user.username, "Registered user");
        Ok(user)
    }

    /// Verify credentials. Unknown email and wrong password fail identically,
    /// and both run one bcrypt verification.
    pub async fn authenticate(&self, email: &str, password: &str) -> SocialResult<User> {
        require_well_formed(&[("email", email), ("password", password)])?;

        let Some(user) = self.store.find_one(&UserFilter::email(email)).await? else {
            let dummy = self.dummy_hash().await?;
            verify_password(password, dummy).await?;
            tracing::debug!("Login attempt for unknown email");
            return Err(SocialError::AuthenticationFailed);
        };

        if !verify_password(password, &user.password_hash).await? {
            tracing::debug!(user_id = user.id, "Login attempt with wrong password");
            return Err(SocialError::AuthenticationFailed);
        }

        tracing::info!(user_id = user.id, "User authenticated");
        Ok(user.redacted())
    }

    pub async fn find(&self, id: UserId) -> SocialResult<Option<User>> {
        Ok(self.store.find_one(&UserFilter::Id(id)).await?)
    }

    async fn dummy_hash(&self) -> SocialResult<&str> {
        let hash = self
            .dummy_hash
            .get_or_try_init(|| hash_password("not-a-real-password", self.bcrypt_cost))
            .await?;
        Ok(hash)
    }
}

// bcrypt runs on the blocking pool, never on a runtime worker thread.

async fn hash_password(password: &str, cost: u32) -> SocialResult<String> {
    let password = password.to_string();
    Ok(task::spawn_blocking(move || bcrypt::hash(password, cost)).await??)
}

/// A malformed stored hash counts as a mismatch.
async fn verify_password(password: &str, hash: &str) -> SocialResult<bool> {
    let (password, hash) = (password.to_string(), hash.to_string());
    let matched =
        task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false)).await?;
    Ok(matched)
}
