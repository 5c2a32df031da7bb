// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # users
//!
//! There are no accounts. Identity is an opaque, client-held UUIDv7 in the `user-id` cookie,
//! minted by the pair endpoint when absent or invalid. Validity means: parses as a v7 UUID whose
//! embedded timestamp is in the past — anything else (including a well-formed uuid "from the
//! future") downgrades the request to anonymous rather than erroring, per the silent-fail policy.
//!
//! This module owns the cache-tier user structures (stats hash, vote-count ranking, dirty set)
//! behind the *user repository lock*, and the **activation worker**: a single-writer task that
//! lazily creates durable user rows the first time a uuid is seen. Activation rides a bounded
//! queue — if it overflows, the activation is simply dropped & retried on a later vote, which
//! costs nothing but latency.

use std::sync::Arc;

use chrono::Utc;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cache::{self, Backend, Op},
    entities::UserStats,
    lifecycle::Handle,
    storage::{self, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to warm the user cache: {source}"))]
    Warm {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read users from the durable log: {source}"))]
    Load {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize user stats: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The identity cookie
pub const COOKIE_NAME: &str = "user-id";
/// One year
pub const COOKIE_MAX_AGE_SECS: i64 = 365 * 24 * 60 * 60;
/// Reserved field of the user-stats hash: tallies over *all* votes, anonymous included
pub const TOTAL_STATS_FIELD: &str = "_total_";

/// Page size when rewarming the user hash from the durable log
const WARM_BATCH: i64 = 10_000;
/// Depth of the activation queue
const ACTIVATION_QUEUE_DEPTH: usize = 1000;

/// Mint a fresh identity
pub fn mint_user_id() -> String {
    Uuid::now_v7().to_string()
}

/// A valid identity is a v7 uuid stamped in the past
pub fn is_valid_user_id(text: &str) -> bool {
    let parsed = match Uuid::parse_str(text) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    if parsed.get_version_num() != 7 {
        return false;
    }
    match parsed.get_timestamp() {
        Some(ts) => {
            let (secs, nanos) = ts.to_unix();
            let now = Utc::now();
            (secs as i64) < now.timestamp()
                || ((secs as i64) == now.timestamp()
                    && (nanos as i64) <= now.timestamp_subsec_nanos() as i64)
        }
        None => false,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         user repository                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Owner of the cache tier's user structures & the lock that guards them
///
/// Writers: the vote processor (stat deltas), the snapshot engine (atomic dirty-set capture), and
/// warm rebuild. Reader: the report service.
pub struct Users {
    cache: Arc<dyn Backend>,
    lock: RwLock<()>,
}

impl Users {
    pub fn new(cache: Arc<dyn Backend>) -> Users {
        Users {
            cache,
            lock: RwLock::new(()),
        }
    }

    /// The user repository lock
    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    /// Rebuild the cache tier's user structures from the durable log
    ///
    /// Destructive (clears first) and unlocked: callers run it during single-threaded startup or
    /// under the repository write lock during warm rebuild. The `_total_` field comes from the
    /// durable `total_stats` singleton so anonymous tallies survive restarts.
    pub async fn warm(&self, store: &Store) -> Result<()> {
        self.cache
            .run(Op::Del {
                keys: vec![
                    cache::USER_STATS_KEY.to_owned(),
                    cache::USER_RANKING_KEY.to_owned(),
                    cache::USER_DIRTY_KEY.to_owned(),
                    cache::USER_DIRTY_PROCESSING_KEY.to_owned(),
                    cache::KNOWN_USERS_KEY.to_owned(),
                ],
            })
            .await
            .context(WarmSnafu)?;

        let mut warmed = 0usize;
        let mut after = String::new();
        loop {
            let page = store.users_page(&after, WARM_BATCH).await.context(LoadSnafu)?;
            if page.is_empty() {
                break;
            }
            let mut stats_entries = Vec::with_capacity(page.len());
            let mut ranking_entries = Vec::with_capacity(page.len());
            let mut known = Vec::with_capacity(page.len());
            for (uuid, stats) in &page {
                stats_entries.push((uuid.clone(), serde_json::to_string(stats).context(SerSnafu)?));
                ranking_entries.push((stats.total() as f64, uuid.clone()));
                known.push(uuid.clone());
            }
            self.cache
                .exec(vec![
                    Op::HSet {
                        key: cache::USER_STATS_KEY.to_owned(),
                        entries: stats_entries,
                    },
                    Op::ZAdd {
                        key: cache::USER_RANKING_KEY.to_owned(),
                        entries: ranking_entries,
                    },
                    Op::SAdd {
                        key: cache::KNOWN_USERS_KEY.to_owned(),
                        members: known,
                    },
                ])
                .await
                .context(WarmSnafu)?;
            warmed += page.len();
            if page.len() < WARM_BATCH as usize {
                break;
            }
            after = page.into_iter().last().expect("page is non-empty").0;
        }

        let total = store.total_stats().await.context(LoadSnafu)?;
        self.cache
            .run(Op::HSet {
                key: cache::USER_STATS_KEY.to_owned(),
                entries: vec![(
                    TOTAL_STATS_FIELD.to_owned(),
                    serde_json::to_string(&total).context(SerSnafu)?,
                )],
            })
            .await
            .context(WarmSnafu)?;
        info!("user cache warmed: {} users", warmed);
        Ok(())
    }

    /// Current stats for `uuid` (None = never voted) plus the community total
    pub async fn stats_and_total(&self, uuid: &str) -> Result<(Option<UserStats>, UserStats)> {
        let fields = if uuid.is_empty() {
            vec![TOTAL_STATS_FIELD.to_owned()]
        } else {
            vec![uuid.to_owned(), TOTAL_STATS_FIELD.to_owned()]
        };
        let mut replies = self
            .cache
            .run(Op::HMGet {
                key: cache::USER_STATS_KEY.to_owned(),
                fields,
            })
            .await
            .context(WarmSnafu)?
            .into_opt_list()
            .context(WarmSnafu)?
            .into_iter();
        let user = if uuid.is_empty() {
            None
        } else {
            replies
                .next()
                .flatten()
                .and_then(|json| serde_json::from_str(&json).ok())
        };
        let total = replies
            .next()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        Ok((user, total))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       activation worker                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Producer side of the activation queue; held by the HTTP layer
#[derive(Clone)]
pub struct ActivationQueue {
    tx: mpsc::Sender<String>,
}

impl ActivationQueue {
    /// Validate & enqueue; false means the uuid was invalid (the vote proceeds anonymously)
    pub fn queue_if_valid(&self, uuid: &str) -> bool {
        if !is_valid_user_id(uuid) {
            return false;
        }
        if self.tx.try_send(uuid.to_owned()).is_err() {
            warn!("activation queue full; dropping activation for {}", uuid);
        }
        true
    }
}

/// Spawn the single-writer activation worker; returns the queue handle
pub fn start_activation_worker(
    store: Store,
    cache: Arc<dyn Backend>,
    handle: Handle,
) -> ActivationQueue {
    let (tx, rx) = mpsc::channel(ACTIVATION_QUEUE_DEPTH);
    tokio::spawn(run_activation_worker(store, cache, handle, rx));
    ActivationQueue { tx }
}

async fn run_activation_worker(
    store: Store,
    cache: Arc<dyn Backend>,
    handle: Handle,
    mut rx: mpsc::Receiver<String>,
) {
    info!("user activation worker started");
    loop {
        let uuid = tokio::select! {
            _ = handle.done() => {
                info!("user activation worker shutting down");
                return;
            }
            uuid = rx.recv() => match uuid {
                Some(uuid) => uuid,
                None => return,
            },
        };
        activate(&store, cache.as_ref(), &handle, &uuid).await;
    }
}

async fn activate(store: &Store, cache: &dyn Backend, handle: &Handle, uuid: &str) {
    // Fast path: already known.
    if let Ok(value) = cache
        .run(Op::SIsMember {
            key: cache::KNOWN_USERS_KEY.to_owned(),
            member: uuid.to_owned(),
        })
        .await
    {
        if value.into_bool().unwrap_or(false) {
            return;
        }
    }

    // Durable row first, with backoff; duplicate-key means someone beat us, which is fine.
    let mut delay = std::time::Duration::from_millis(50);
    let max_delay = std::time::Duration::from_secs(60);
    loop {
        match store.insert_user(uuid).await {
            Ok(_) => break,
            Err(err) => {
                if !Store::is_retryable(&err) {
                    error!("failed to create user {}: {}", uuid, err);
                    return;
                }
                if handle.sleep(delay).await.is_err() {
                    return;
                }
                delay = (delay * 2).min(max_delay);
            }
        }
    }

    // Then the cache set, same shape.
    let mut delay = std::time::Duration::from_millis(100);
    loop {
        match cache
            .run(Op::SAdd {
                key: cache::KNOWN_USERS_KEY.to_owned(),
                members: vec![uuid.to_owned()],
            })
            .await
        {
            Ok(_) => return,
            Err(err) => {
                warn!("cache write for user {} failed: {}; retrying in {:?}", uuid, err, delay);
                if handle.sleep(delay).await.is_err() {
                    return;
                }
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::Manager;

    #[test]
    fn identity_validation() {
        assert!(is_valid_user_id(&mint_user_id()));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("not-a-uuid"));
        // v4 is well-formed but the wrong version.
        assert!(!is_valid_user_id("7f8a1d4e-9b3c-4a2f-8d1e-6c5b4a3f2e1d"));
    }

    #[tokio::test]
    async fn warm_and_read_back() {
        let cache = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.insert_user("u1").await.unwrap();
        let mut tx = store.pool().begin().await.unwrap();
        Store::upsert_users(
            &mut tx,
            &[(
                "u1".to_owned(),
                UserStats {
                    wins: 2,
                    draw: 1,
                    skip: 0,
                },
            )],
        )
        .await
        .unwrap();
        Store::upsert_total_stats(
            &mut tx,
            &UserStats {
                wins: 5,
                draw: 2,
                skip: 1,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let users = Users::new(cache.clone());
        users.warm(&store).await.unwrap();

        let (stats, total) = users.stats_and_total("u1").await.unwrap();
        assert_eq!(stats.unwrap().wins, 2);
        assert_eq!(total.wins, 5);
        let (stats, total) = users.stats_and_total("stranger").await.unwrap();
        assert!(stats.is_none());
        assert_eq!(total.skip, 1);
        // The anonymous caller still sees community totals.
        let (stats, total) = users.stats_and_total("").await.unwrap();
        assert!(stats.is_none());
        assert_eq!(total.draw, 2);
    }

    #[tokio::test]
    async fn activation_creates_rows_once() {
        let cache = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let manager = Manager::new();
        let queue = start_activation_worker(
            store.clone(),
            cache.clone(),
            manager.handle("activation").unwrap(),
        );

        let uuid = mint_user_id();
        assert!(queue.queue_if_valid(&uuid));
        assert!(queue.queue_if_valid(&uuid));
        assert!(!queue.queue_if_valid("garbage"));

        // Give the worker a beat.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let page = store.users_page("", 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, uuid);

        manager.shutdown();
        manager.wait_with_timeout(std::time::Duration::from_secs(1)).await;
    }
}
