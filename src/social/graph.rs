use serde::Serialize;

use crate::db::models::User;
use crate::social::error::{SocialError, SocialResult};
use crate::social::fanout::seed_follower_feed;
use crate::social::repository::{modify_user, DynUserStore, Mutation, StoreError, UserFilter};
use crate::social::validation::require_well_formed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowOutcome {
    Followed,
    AlreadyFollowing,
}

/// Directed follow edges, stored on both ends of the edge.
pub struct SocialGraph {
    store: DynUserStore,
    max_write_retries: u32,
}

impl SocialGraph {
    pub fn new(store: DynUserStore, max_write_retries: u32) -> Self {
        Self {
            store,
            max_write_retries,
        }
    }

    /// Make `follower` follow `target_username` and seed the follower's feed
    /// with every post the target has authored.
    ///
    /// The target's `followers` set is written first so that from then on the
    /// target's new posts fan out to the follower. The two writes are not
    /// atomic: if the follower's write fails, the error is returned but the
    /// target keeps the follower in `followers`, so the edge exists on one
    /// side only. Calling `follow` again completes it. Following again is a
    /// no-op on the edge but re-seeds the feed.
    pub async fn follow(&self, follower: &User, target_username: &str) -> SocialResult<FollowOutcome> {
        require_well_formed(&[("username", target_username)])?;

        if target_username == follower.username {
            return Err(SocialError::SelfFollowRejected);
        }

        let target_filter = UserFilter::username(target_username);
        let (target, _) = modify_user(
            self.store.as_ref(),
            &target_filter,
            self.max_write_retries,
            |target| {
                if target.followers.insert(follower.username.clone()) {
                    Mutation::Write(())
                } else {
                    Mutation::Skip(())
                }
            },
        )
        .await?
        .ok_or_else(|| SocialError::UnknownTarget(target_username.to_string()))?;

        let follower_filter = UserFilter::Id(follower.id);
        let (_, outcome) = modify_user(
            self.store.as_ref(),
            &follower_filter,
            self.max_write_retries,
            |me| {
                let outcome = if me.following.insert(target.username.clone()) {
                    FollowOutcome::Followed
                } else {
                    FollowOutcome::AlreadyFollowing
                };
                let seeded = seed_follower_feed(me, &target);
                if outcome == FollowOutcome::Followed || seeded > 0 {
                    Mutation::Write(outcome)
                } else {
                    Mutation::Skip(outcome)
                }
            },
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(follower_filter.to_string()))?;

        tracing::info!(
            follower = %follower.username,
            target = %target.username,
            ?outcome,
            seeded_posts = target.own_posts.len(),
            "Follow"
        );
        Ok(outcome)
    }
}
