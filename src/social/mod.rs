//! Accounts, follow edges and feeds.
//!
//! Everything here works against a [`UserStore`]: a collection of user
//! documents with unique `username` and `email`, a per-document version for
//! compare-and-swap writes, and named counters.

pub mod error;
pub mod fanout;
pub mod graph;
pub mod identity;
pub mod memory;
pub mod repository;
pub mod validation;

pub use error::{SocialError, SocialResult};
pub use fanout::FeedService;
pub use graph::{FollowOutcome, SocialGraph};
pub use identity::{IdentityService, Registration};
pub use memory::InMemoryUserStore;
pub use repository::{DynUserStore, SqliteUserStore, StoreError, UserFilter, UserStore};
