use thiserror::Error;

use crate::db::models::Post;
use crate::social::repository::StoreError;

#[derive(Debug, Error)]
pub enum SocialError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A user with this email already exists")]
    DuplicateEmail,

    #[error("A user with this username already exists")]
    DuplicateUsername,

    /// Deliberately says nothing about which half of the credentials was wrong.
    #[error("Invalid email or password")]
    AuthenticationFailed,

    #[error("No user named {0:?}")]
    UnknownTarget(String),

    #[error("Cannot follow yourself")]
    SelfFollowRejected,

    #[error("Password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),

    #[error("Password hashing task failed: {0}")]
    HashingTask(#[from] tokio::task::JoinError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// The author's record was written but some follower feeds were not.
    /// Feeds that were updated stay updated.
    #[error("Post {} published, but not delivered to {}", .post.id, .not_delivered.join(", "))]
    PartialFanoutFailure {
        post: Post,
        not_delivered: Vec<String>,
    },
}

pub type SocialResult<T> = Result<T, SocialError>;
