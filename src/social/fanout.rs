//! Fan-out-on-write feed engine.
//!
//! Publishing appends to the author's own posts and feed, then copies the
//! post into the feed of every current follower. Each document is updated
//! with its own version-checked read-modify-write; there is no transaction
//! spanning the author and the followers, so a failed follower update is
//! reported, never rolled back.
//!
//! Feed insertion is keyed on `(author_id, post id)`, which makes repeated
//! delivery and repeated seeding harmless.

use std::cmp::Ordering;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{FanoutMode, FeedConfig};
use crate::db::models::{Post, User};
use crate::social::error::{SocialError, SocialResult};
use crate::social::repository::{modify_user, DynUserStore, Mutation, StoreError, UserFilter, UserStore};

/// Newest first. Equal timestamps fall back to author id, then post id, both
/// descending, so the order is total and a single author's posts never swap.
pub fn recency_order(a: &Post, b: &Post) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.author_id.cmp(&a.author_id))
        .then_with(|| b.id.cmp(&a.id))
}

pub fn sort_feed(feed: &mut [Post]) {
    feed.sort_by(recency_order);
}

pub fn is_sorted(feed: &[Post]) -> bool {
    feed.windows(2)
        .all(|w| recency_order(&w[0], &w[1]) != Ordering::Greater)
}

/// Append `post` unless the feed already holds it. Returns whether it was added.
pub fn insert_post(feed: &mut Vec<Post>, post: &Post) -> bool {
    if feed.iter().any(|p| p.key() == post.key()) {
        return false;
    }
    feed.push(post.clone());
    true
}

/// Copy every post `target` has authored into `follower`'s feed and restore
/// recency order. Returns how many posts were new to the feed.
pub fn seed_follower_feed(follower: &mut User, target: &User) -> usize {
    let added = target
        .own_posts
        .iter()
        .filter(|post| insert_post(&mut follower.feed, post))
        .count();
    if added > 0 {
        sort_feed(&mut follower.feed);
    }
    added
}

/// A published post waiting to be copied into follower feeds.
#[derive(Debug, Clone)]
pub struct FanoutJob {
    pub post: Post,
    pub followers: Vec<String>,
}

pub struct FeedService {
    store: DynUserStore,
    config: FeedConfig,
    queue: Option<mpsc::Sender<FanoutJob>>,
}

impl FeedService {
    /// Followers are updated before `publish` returns.
    pub fn inline(store: DynUserStore, config: FeedConfig) -> Self {
        Self {
            store,
            config,
            queue: None,
        }
    }

    /// `publish` returns once the author is written; a background task
    /// delivers to followers. The task ends when the service is dropped.
    ///
    /// The queue holds at most `fanout_queue_capacity` jobs. A publish that
    /// finds it full delivers inline instead of waiting.
    pub fn deferred(store: DynUserStore, config: FeedConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.fanout_queue_capacity.max(1));
        let worker = tokio::spawn(run_fanout_worker(store.clone(), config.clone(), rx));
        let service = Self {
            store,
            config,
            queue: Some(tx),
        };
        (service, worker)
    }

    pub fn from_config(store: DynUserStore, config: &FeedConfig) -> (Self, Option<JoinHandle<()>>) {
        match config.fanout {
            FanoutMode::Inline => (Self::inline(store, config.clone()), None),
            FanoutMode::Deferred => {
                let (service, worker) = Self::deferred(store, config.clone());
                (service, Some(worker))
            }
        }
    }

    pub fn mode(&self) -> FanoutMode {
        if self.queue.is_some() {
            FanoutMode::Deferred
        } else {
            FanoutMode::Inline
        }
    }

    /// Publish a post as `author`.
    ///
    /// The post id is `own_posts.len() + 1`, claimed inside the author's
    /// version-checked write so concurrent publishes cannot share an id.
    pub async fn publish(&self, author: &User, text: &str) -> SocialResult<Post> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SocialError::InvalidInput("message must not be empty".into()));
        }
        if text.chars().count() > self.config.max_post_length {
            return Err(SocialError::InvalidInput(format!(
                "message must be at most {} characters",
                self.config.max_post_length
            )));
        }

        let filter = UserFilter::Id(author.id);
        let (author, post) = modify_user(
            self.store.as_ref(),
            &filter,
            self.config.max_write_retries,
            |user| {
                let post = Post {
                    id: user.own_posts.len() as u64 + 1,
                    author_id: user.id,
                    text: text.to_string(),
                    created_at: Utc::now(),
                };
                user.own_posts.push(post.clone());
                insert_post(&mut user.feed, &post);
                sort_feed(&mut user.feed);
                Mutation::Write(post)
            },
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(filter.to_string()))?;

        tracing::info!(
            author_id = author.id,
            post_id = post.id,
            followers = author.followers.len(),
            "Published post"
        );

        let mut followers: Vec<String> = author.followers.iter().cloned().collect();

        if let Some(queue) = &self.queue {
            match queue.try_send(FanoutJob {
                post: post.clone(),
                followers,
            }) {
                Ok(()) => return Ok(post),
                Err(mpsc::error::TrySendError::Full(job)) => {
                    tracing::warn!(post_id = post.id, "Fan-out queue full, delivering inline");
                    followers = job.followers;
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    tracing::warn!(post_id = post.id, "Fan-out worker is gone, delivering inline");
                    followers = job.followers;
                }
            }
        }

        let not_delivered = deliver(
            self.store.as_ref(),
            self.config.max_write_retries,
            &post,
            followers,
        )
        .await;

        if not_delivered.is_empty() {
            Ok(post)
        } else {
            Err(SocialError::PartialFanoutFailure {
                post,
                not_delivered,
            })
        }
    }

    /// The user's feed, newest first. An out-of-order stored feed is sorted
    /// and written back.
    pub async fn get_feed(&self, user: &User) -> SocialResult<Vec<Post>> {
        let filter = UserFilter::Id(user.id);
        let (_, feed) = modify_user(
            self.store.as_ref(),
            &filter,
            self.config.max_write_retries,
            |user| {
                if is_sorted(&user.feed) {
                    Mutation::Skip(user.feed.clone())
                } else {
                    sort_feed(&mut user.feed);
                    Mutation::Write(user.feed.clone())
                }
            },
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(filter.to_string()))?;

        Ok(feed)
    }
}

/// Copy `post` into each follower's feed. Returns the usernames whose feed
/// could not be updated.
async fn deliver(
    store: &dyn UserStore,
    max_write_retries: u32,
    post: &Post,
    followers: Vec<String>,
) -> Vec<String> {
    let mut not_delivered = Vec::new();

    for username in followers {
        let result = modify_user(
            store,
            &UserFilter::username(&username),
            max_write_retries,
            |follower| {
                if insert_post(&mut follower.feed, post) {
                    sort_feed(&mut follower.feed);
                    Mutation::Write(())
                } else {
                    Mutation::Skip(())
                }
            },
        )
        .await;

        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(follower = %username, post_id = post.id, "Follower record missing");
                not_delivered.push(username);
            }
            Err(e) => {
                tracing::warn!(follower = %username, post_id = post.id, error = %e, "Fan-out to follower failed");
                not_delivered.push(username);
            }
        }
    }

    not_delivered
}

async fn run_fanout_worker(
    store: DynUserStore,
    config: FeedConfig,
    mut rx: mpsc::Receiver<FanoutJob>,
) {
    tracing::info!("Fan-out worker started");

    while let Some(job) = rx.recv().await {
        let mut pending = job.followers;

        for attempt in 1..=config.max_delivery_attempts.max(1) {
            pending = deliver(store.as_ref(), config.max_write_retries, &job.post, pending).await;
            if pending.is_empty() {
                break;
            }
            tracing::debug!(
                post_id = job.post.id,
                attempt,
                remaining = pending.len(),
                "Retrying fan-out"
            );
        }

        if !pending.is_empty() {
            tracing::warn!(
                author_id = job.post.author_id,
                post_id = job.post.id,
                not_delivered = ?pending,
                "Giving up on fan-out"
            );
        }
    }

    tracing::info!("Fan-out worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::memory::InMemoryUserStore;
    use crate::social::repository::UpdateOutcome;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn post(author_id: u64, id: u64, secs: i64) -> Post {
        Post {
            id,
            author_id,
            text: format!("{author_id}/{id}"),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn user(id: u64, name: &str) -> User {
        User::new(id, name, &format!("{name}@example.com"), "hash".into())
    }

    /// alice(1) is followed by every name in `followers`, ids from 2 up.
    async fn seeded(store: &dyn UserStore, followers: &[&str]) -> User {
        let mut alice = user(1, "alice");
        for (i, name) in followers.iter().enumerate() {
            let mut follower = user(i as u64 + 2, name);
            follower.following.insert("alice".into());
            store.insert_one(&follower).await.unwrap();
            alice.followers.insert(name.to_string());
        }
        store.insert_one(&alice).await.unwrap();
        alice
    }

    fn texts(feed: &[Post]) -> Vec<&str> {
        feed.iter().map(|p| p.text.as_str()).collect()
    }

    #[test]
    fn recency_order_is_newest_first_with_tiebreaks() {
        let mut feed = vec![post(1, 1, 0), post(2, 1, 5), post(1, 2, 5), post(3, 1, 5)];
        sort_feed(&mut feed);
        let keys: Vec<_> = feed.iter().map(Post::key).collect();
        assert_eq!(keys, vec![(3, 1), (2, 1), (1, 2), (1, 1)]);
        assert!(is_sorted(&feed));
    }

    #[test]
    fn same_author_same_instant_keeps_publication_order() {
        let mut feed = vec![post(1, 1, 0), post(1, 2, 0), post(1, 3, 0)];
        sort_feed(&mut feed);
        let ids: Vec<_> = feed.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn insert_post_ignores_duplicates() {
        let mut feed = Vec::new();
        assert!(insert_post(&mut feed, &post(1, 1, 0)));
        assert!(!insert_post(&mut feed, &post(1, 1, 0)));
        assert!(insert_post(&mut feed, &post(2, 1, 0)));
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn seeding_copies_all_target_posts_once() {
        let mut target = user(1, "alice");
        target.own_posts = vec![post(1, 1, 0), post(1, 2, 10)];
        let mut follower = user(2, "bob");
        follower.feed = vec![post(2, 1, 5)];

        assert_eq!(seed_follower_feed(&mut follower, &target), 2);
        assert_eq!(texts(&follower.feed), vec!["1/2", "2/1", "1/1"]);

        assert_eq!(seed_follower_feed(&mut follower, &target), 0);
        assert_eq!(follower.feed.len(), 3);
    }

    #[tokio::test]
    async fn publish_reaches_author_and_followers() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &["bob"]).await;
        let feed = FeedService::inline(store.clone(), FeedConfig::default());

        let first = feed.publish(&alice, "first").await.unwrap();
        let second = feed.publish(&alice, "second").await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.author_id, 1);

        let stored = store.find_one(&UserFilter::Id(1)).await.unwrap().unwrap();
        assert_eq!(texts(&stored.own_posts), vec!["first", "second"]);

        let bob = store.find_one(&UserFilter::username("bob")).await.unwrap().unwrap();
        assert_eq!(texts(&feed.get_feed(&bob).await.unwrap()), vec!["second", "first"]);
        assert_eq!(texts(&feed.get_feed(&alice).await.unwrap()), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn publish_without_followers_touches_only_author() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &[]).await;
        store.insert_one(&user(2, "carol")).await.unwrap();
        let feed = FeedService::inline(store.clone(), FeedConfig::default());

        feed.publish(&alice, "hello").await.unwrap();

        let carol = store.find_one(&UserFilter::Id(2)).await.unwrap().unwrap();
        assert!(carol.feed.is_empty());
        assert_eq!(texts(&feed.get_feed(&alice).await.unwrap()), vec!["hello"]);
    }

    #[tokio::test]
    async fn publish_rejects_blank_and_oversized_messages() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &[]).await;
        let config = FeedConfig {
            max_post_length: 5,
            ..FeedConfig::default()
        };
        let feed = FeedService::inline(store.clone(), config);

        for text in ["", "   ", "toolong"] {
            let err = feed.publish(&alice, text).await.unwrap_err();
            assert!(matches!(err, SocialError::InvalidInput(_)), "{text:?}");
        }
        // Surrounding whitespace does not count toward the limit
        let post = feed.publish(&alice, "  hello  ").await.unwrap();
        assert_eq!(post.text, "hello");
    }

    #[tokio::test]
    async fn publish_for_missing_author_is_a_persistence_error() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let feed = FeedService::inline(store, FeedConfig::default());
        let err = feed.publish(&user(42, "ghost"), "boo").await.unwrap_err();
        assert!(matches!(err, SocialError::Persistence(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_feed_repairs_out_of_order_feed() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let mut alice = user(1, "alice");
        alice.feed = vec![post(2, 1, 0), post(3, 1, 10)];
        store.insert_one(&alice).await.unwrap();
        let feed = FeedService::inline(store.clone(), FeedConfig::default());

        assert_eq!(texts(&feed.get_feed(&alice).await.unwrap()), vec!["3/1", "2/1"]);

        let stored = store.find_one(&UserFilter::Id(1)).await.unwrap().unwrap();
        assert!(is_sorted(&stored.feed));
        assert_eq!(stored.version, 1);

        // Already sorted, no write
        feed.get_feed(&alice).await.unwrap();
        let stored = store.find_one(&UserFilter::Id(1)).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    /// Refuses every write to the named users.
    struct FlakyStore {
        inner: InMemoryUserStore,
        broken: HashSet<String>,
    }

    #[async_trait]
    impl UserStore for FlakyStore {
        async fn find_one(&self, filter: &UserFilter) -> Result<Option<User>, StoreError> {
            self.inner.find_one(filter).await
        }

        async fn insert_one(&self, user: &User) -> Result<(), StoreError> {
            self.inner.insert_one(user).await
        }

        async fn update_one(
            &self,
            filter: &UserFilter,
            user: &mut User,
        ) -> Result<UpdateOutcome, StoreError> {
            if self.broken.contains(&user.username) {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.update_one(filter, user).await
        }

        async fn count_documents(&self, filter: &UserFilter) -> Result<u64, StoreError> {
            self.inner.count_documents(filter).await
        }

        async fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
            self.inner.next_sequence(name).await
        }
    }

    #[tokio::test]
    async fn partial_fanout_reports_undelivered_followers() {
        let store: DynUserStore = Arc::new(FlakyStore {
            inner: InMemoryUserStore::new(),
            broken: HashSet::from(["carol".to_string()]),
        });
        let alice = seeded(store.as_ref(), &["bob", "carol", "dave"]).await;
        let feed = FeedService::inline(store.clone(), FeedConfig::default());

        let err = feed.publish(&alice, "hi all").await.unwrap_err();
        let SocialError::PartialFanoutFailure { post, not_delivered } = err else {
            panic!("expected partial fan-out failure, got {err:?}");
        };
        assert_eq!(post.id, 1);
        assert_eq!(not_delivered, vec!["carol".to_string()]);

        // Nothing is rolled back
        let alice = store.find_one(&UserFilter::Id(1)).await.unwrap().unwrap();
        assert_eq!(alice.own_posts.len(), 1);
        for name in ["bob", "dave"] {
            let u = store.find_one(&UserFilter::username(name)).await.unwrap().unwrap();
            assert_eq!(texts(&u.feed), vec!["hi all"], "{name}");
        }
        let carol = store.find_one(&UserFilter::username("carol")).await.unwrap().unwrap();
        assert!(carol.feed.is_empty());
    }

    #[tokio::test]
    async fn deferred_mode_delivers_in_background() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &["bob", "carol"]).await;
        let config = FeedConfig {
            fanout: FanoutMode::Deferred,
            ..FeedConfig::default()
        };
        let (feed, worker) = FeedService::from_config(store.clone(), &config);
        assert_eq!(feed.mode(), FanoutMode::Deferred);

        let post = feed.publish(&alice, "later").await.unwrap();
        assert_eq!(post.id, 1);

        // Closing the queue lets the worker drain and exit
        drop(feed);
        worker.expect("deferred mode spawns a worker").await.unwrap();

        for name in ["bob", "carol"] {
            let u = store.find_one(&UserFilter::username(name)).await.unwrap().unwrap();
            assert_eq!(texts(&u.feed), vec!["later"], "{name}");
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_falls_back_to_inline_delivery() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &["bob"]).await;
        let config = FeedConfig {
            fanout: FanoutMode::Deferred,
            fanout_queue_capacity: 1,
            ..FeedConfig::default()
        };
        let (feed, worker) = FeedService::deferred(store.clone(), config);

        // The worker is not polled until this task yields, so the first job
        // fills the queue and the second finds it full.
        feed.publish(&alice, "queued").await.unwrap();
        let overflow = feed.publish(&alice, "overflow").await.unwrap();
        assert_eq!(overflow.id, 2);

        let bob = store.find_one(&UserFilter::username("bob")).await.unwrap().unwrap();
        assert_eq!(texts(&bob.feed), vec!["overflow"]);

        drop(feed);
        worker.await.unwrap();

        let bob = store.find_one(&UserFilter::username("bob")).await.unwrap().unwrap();
        assert_eq!(texts(&bob.feed), vec!["overflow", "queued"]);
    }

    #[tokio::test]
    async fn deferred_worker_gives_up_on_broken_follower() {
        let store: DynUserStore = Arc::new(FlakyStore {
            inner: InMemoryUserStore::new(),
            broken: HashSet::from(["carol".to_string()]),
        });
        let alice = seeded(store.as_ref(), &["bob", "carol"]).await;
        let config = FeedConfig {
            max_delivery_attempts: 2,
            ..FeedConfig::default()
        };
        let (feed, worker) = FeedService::deferred(store.clone(), config);

        // Deferred publish reports success once the author is written
        feed.publish(&alice, "hello").await.unwrap();
        drop(feed);
        worker.await.unwrap();

        let bob = store.find_one(&UserFilter::username("bob")).await.unwrap().unwrap();
        assert_eq!(texts(&bob.feed), vec!["hello"]);
        let carol = store.find_one(&UserFilter::username("carol")).await.unwrap().unwrap();
        assert!(carol.feed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_get_distinct_ids() {
        let store: DynUserStore = Arc::new(InMemoryUserStore::new());
        let alice = seeded(store.as_ref(), &["bob"]).await;
        let config = FeedConfig {
            max_write_retries: 200,
            ..FeedConfig::default()
        };
        let feed = Arc::new(FeedService::inline(store.clone(), config));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let feed = feed.clone();
                let alice = alice.clone();
                tokio::spawn(async move { feed.publish(&alice, &format!("post-{i}")).await })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());

        let alice = store.find_one(&UserFilter::Id(1)).await.unwrap().unwrap();
        assert_eq!(alice.own_posts.len(), 16);
        assert_eq!(alice.feed.len(), 16);
        let bob = store.find_one(&UserFilter::username("bob")).await.unwrap().unwrap();
        assert_eq!(bob.feed.len(), 16);
        assert!(is_sorted(&bob.feed));
    }

    #[test]
    fn tiebreak_respects_time_first() {
        let older_high_ids = post(9, 9, 0);
        let mut newer = older_high_ids.clone();
        newer.created_at += Duration::seconds(1);
        newer.author_id = 1;
        newer.id = 1;
        assert_eq!(recency_order(&newer, &older_high_ids), Ordering::Less);
    }
}
