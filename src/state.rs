use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::social::{DynUserStore, FeedService, IdentityService, SocialGraph, SqliteUserStore};

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub identity: Arc<IdentityService>,
    pub graph: Arc<SocialGraph>,
    pub feed: Arc<FeedService>,
}

impl AppState {
    /// Build the services over the SQLite user store. In deferred fan-out
    /// mode this spawns the delivery worker, so it must run inside a runtime.
    pub fn new(db: DbPool, config: Config) -> (Self, Option<JoinHandle<()>>) {
        let store: DynUserStore = Arc::new(SqliteUserStore::new(db.clone()));
        Self::with_store(db, config, store)
    }

    /// Same as [`AppState::new`] with an explicit user store. Sessions still
    /// live in `db`.
    pub fn with_store(
        db: DbPool,
        config: Config,
        store: DynUserStore,
    ) -> (Self, Option<JoinHandle<()>>) {
        let identity = IdentityService::new(store.clone(), config.auth.bcrypt_cost);
        let graph = SocialGraph::new(store.clone(), config.feed.max_write_retries);
        let (feed, worker) = FeedService::from_config(store, &config.feed);

        let state = Self {
            db,
            config,
            identity: Arc::new(identity),
            graph: Arc::new(graph),
            feed: Arc::new(feed),
        };
        (state, worker)
    }
}
