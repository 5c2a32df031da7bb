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

//! # the snapshot engine
//!
//! Every ten minutes (and once more at shutdown, and after every warm rebuild), the live cache
//! state is folded back into the durable log: item statistics with their current rank, the users
//! whose tallies changed since last time, the community totals, and the checkpoint metadata that
//! ties it all to a vote id.
//!
//! Consistency hinges on two atomic steps. The *read* is one cache transaction that grabs the
//! checkpoint, the counters, the full stats hash & ranking, and the dirty-user set — renaming the
//! dirty set aside in the same breath, so votes applied during the snapshot accumulate in a fresh
//! one. The *write* is one durable transaction. Between them nothing is mutated, only staged; if
//! anything fails, the set-aside dirty users are unioned back and the snapshot never happened.
//! Running a snapshot twice with no intervening vote is a no-op by construction: the checkpoint
//! comparison bails out first.

use std::{collections::HashMap, sync::Arc, time::Duration};

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    cache::{self, Backend, Op},
    entities::{ItemId, ItemStats, UserStats},
    health::HealthStatus,
    lifecycle::Handle,
    storage::{self, ItemSnapshot, Store},
    users::{Users, TOTAL_STATS_FIELD},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache read failed during snapshot: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Durable write failed during snapshot: {source}"))]
    Durable {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to open/commit the snapshot transaction: {source}"))]
    Tx {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The stats hash is missing ranked item {id}"))]
    MissingStats { id: ItemId, backtrace: Backtrace },
    #[snafu(display("The live checkpoint {text} won't parse"))]
    BadCheckpoint { text: String, backtrace: Backtrace },
    #[snafu(display("Snapshot abandoned: shutdown in progress"))]
    Cancelled { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const PERSIST_RETRIES: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Everything staged between the cache read & the durable write
struct Staged {
    checkpoint: i64,
    total_votes: f64,
    items: Vec<ItemSnapshot>,
    dirty_users: Vec<(String, UserStats)>,
    total_stats: UserStats,
}

pub struct Snapshotter {
    cache: Arc<dyn Backend>,
    store: Store,
    users: Arc<Users>,
    /// Serializes snapshots (the scheduler, rebuild & shutdown can all ask for one)
    guard: Mutex<()>,
}

impl Snapshotter {
    pub fn new(cache: Arc<dyn Backend>, store: Store, users: Arc<Users>) -> Snapshotter {
        Snapshotter {
            cache,
            store,
            users,
            guard: Mutex::new(()),
        }
    }

    /// The periodic driver; runs until its handle is cancelled
    pub async fn run_scheduler(&self, health: Arc<HealthStatus>, handle: Handle) {
        info!("snapshot scheduler started");
        loop {
            if handle.sleep(SNAPSHOT_INTERVAL).await.is_err() {
                info!("snapshot scheduler shutting down");
                return;
            }
            if !health.is_healthy() {
                info!("snapshot scheduler: cache unhealthy; skipping this round");
                continue;
            }
            match self.snapshot(Some(&handle)).await {
                Ok(()) => info!("periodic snapshot complete"),
                Err(Error::Cancelled { .. }) => (),
                Err(err) => error!("periodic snapshot failed: {}", err),
            }
        }
    }

    /// Take one consistent snapshot
    ///
    /// `handle` (if any) lets a scheduled snapshot abandon cleanly at shutdown; the final
    /// at-shutdown snapshot passes `None` & runs to completion.
    pub async fn snapshot(&self, handle: Option<&Handle>) -> Result<()> {
        let _g = self.guard.lock().await;

        let mut transferred = false;
        let result = self.capture_and_persist(&mut transferred, handle).await;

        // The dirty set was renamed aside in the atomic read. On success those users are safely
        // durable; on any failure they're folded back in for the next snapshot.
        if transferred {
            let cleanup = match &result {
                Ok(()) => {
                    self.cache
                        .run(Op::Del {
                            keys: vec![cache::USER_DIRTY_PROCESSING_KEY.to_owned()],
                        })
                        .await
                }
                Err(_) => {
                    self.cache
                        .exec(vec![
                            Op::SUnionStore {
                                dest: cache::USER_DIRTY_KEY.to_owned(),
                                keys: vec![
                                    cache::USER_DIRTY_KEY.to_owned(),
                                    cache::USER_DIRTY_PROCESSING_KEY.to_owned(),
                                ],
                            },
                            Op::Del {
                                keys: vec![cache::USER_DIRTY_PROCESSING_KEY.to_owned()],
                            },
                        ])
                        .await
                        .map(|_| cache::Value::Ok)
                }
            };
            if let Err(err) = cleanup {
                warn!("snapshot: dirty-set cleanup failed: {}", err);
            }
        }

        result
    }

    async fn capture_and_persist(
        &self,
        transferred: &mut bool,
        handle: Option<&Handle>,
    ) -> Result<()> {
        let staged = {
            // The user-repository lock pins the dirty set & user stats together; without it a
            // concurrently-applied vote could dirty a user after the rename but before the stats
            // read, tearing the pair.
            let _users = self.users.lock().write().await;

            let dirty_exists = self
                .cache
                .run(Op::Exists {
                    key: cache::USER_DIRTY_KEY.to_owned(),
                })
                .await
                .context(CacheSnafu)?
                .into_bool()
                .context(CacheSnafu)?;

            let mut ops = vec![
                Op::Get {
                    key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                },
                Op::Get {
                    key: cache::TOTAL_VOTES_KEY.to_owned(),
                },
                Op::HGetAll {
                    key: cache::ITEM_STATS_KEY.to_owned(),
                },
                Op::ZRevRange {
                    key: cache::ITEM_RANKING_KEY.to_owned(),
                    start: 0,
                    stop: -1,
                },
                Op::HGet {
                    key: cache::USER_STATS_KEY.to_owned(),
                    field: TOTAL_STATS_FIELD.to_owned(),
                },
                Op::SMembers {
                    key: cache::USER_DIRTY_KEY.to_owned(),
                },
            ];
            if dirty_exists {
                ops.push(Op::Rename {
                    from: cache::USER_DIRTY_KEY.to_owned(),
                    to: cache::USER_DIRTY_PROCESSING_KEY.to_owned(),
                });
            }
            let mut replies = self.cache.exec(ops).await.context(CacheSnafu)?.into_iter();
            *transferred = dirty_exists;

            let checkpoint_text = replies
                .next()
                .and_then(|v| v.opt_text().ok().flatten());
            let Some(checkpoint_text) = checkpoint_text else {
                // No vote has ever been processed; nothing to snapshot.
                return Ok(());
            };
            let checkpoint: i64 = checkpoint_text.parse().ok().context(BadCheckpointSnafu {
                text: checkpoint_text.clone(),
            })?;
            let total_votes = replies
                .next()
                .and_then(|v| v.opt_text().ok().flatten())
                .and_then(|text| text.parse::<f64>().ok())
                .unwrap_or(0.0);
            let stats: HashMap<String, String> = replies
                .next()
                .map(|v| v.into_pairs())
                .transpose()
                .context(CacheSnafu)?
                .unwrap_or_default()
                .into_iter()
                .collect();
            let ranking = replies
                .next()
                .map(|v| v.into_list())
                .transpose()
                .context(CacheSnafu)?
                .unwrap_or_default();
            let total_stats: UserStats = replies
                .next()
                .and_then(|v| v.opt_text().ok().flatten())
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            let dirty_ids = replies
                .next()
                .map(|v| v.into_list())
                .transpose()
                .context(CacheSnafu)?
                .unwrap_or_default();

            let dirty_stats = if dirty_ids.is_empty() {
                Vec::new()
            } else {
                self.cache
                    .run(Op::HMGet {
                        key: cache::USER_STATS_KEY.to_owned(),
                        fields: dirty_ids.clone(),
                    })
                    .await
                    .context(CacheSnafu)?
                    .into_opt_list()
                    .context(CacheSnafu)?
            };

            let mut items = Vec::with_capacity(ranking.len());
            for (position, id) in ranking.iter().enumerate() {
                let json = stats.get(id).context(MissingStatsSnafu {
                    id: ItemId::new(id.clone()),
                })?;
                let parsed: ItemStats =
                    serde_json::from_str(json).ok().context(MissingStatsSnafu {
                        id: ItemId::new(id.clone()),
                    })?;
                items.push(ItemSnapshot {
                    id: ItemId::new(id.clone()),
                    stats: parsed,
                    rank: position as i64 + 1,
                });
            }

            let mut dirty_users = Vec::with_capacity(dirty_ids.len());
            for (uuid, json) in dirty_ids.into_iter().zip(dirty_stats) {
                match json.and_then(|json| serde_json::from_str::<UserStats>(&json).ok()) {
                    Some(parsed) => dirty_users.push((uuid, parsed)),
                    None => warn!("snapshot: dirty user {} has no stats entry; skipping", uuid),
                }
            }

            Staged {
                checkpoint,
                total_votes,
                items,
                dirty_users,
                total_stats,
            }
        };

        // Idempotence: nothing past the last snapshot means nothing to write.
        let last_snapshot = self.store.last_snapshot_vote_id().await.context(DurableSnafu)?;
        if staged.checkpoint == last_snapshot {
            return Ok(());
        }

        if handle.map(|h| h.is_cancelled()).unwrap_or(false) {
            return CancelledSnafu.fail();
        }

        let mut attempt = 0;
        loop {
            match self.persist(&staged).await {
                Ok(()) => {
                    info!(
                        "snapshot persisted through vote {} ({} items, {} dirty users)",
                        staged.checkpoint,
                        staged.items.len(),
                        staged.dirty_users.len()
                    );
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    let retryable = matches!(&err, Error::Durable { source, .. }
                        if storage::Store::is_retryable(source));
                    if !retryable || attempt >= PERSIST_RETRIES {
                        return Err(err);
                    }
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
            }
        }
    }

    /// The single durable transaction
    async fn persist(&self, staged: &Staged) -> Result<()> {
        let mut tx = self.store.pool().begin().await.context(TxSnafu)?;
        Store::upsert_item_snapshots(&mut tx, &staged.items)
            .await
            .context(DurableSnafu)?;
        Store::upsert_users(&mut tx, &staged.dirty_users)
            .await
            .context(DurableSnafu)?;
        Store::upsert_total_stats(&mut tx, &staged.total_stats)
            .await
            .context(DurableSnafu)?;
        Store::set_metadata(
            &mut tx,
            storage::LAST_SNAPSHOT_VOTE_ID_KEY,
            &staged.checkpoint.to_string(),
        )
        .await
        .context(DurableSnafu)?;
        Store::set_metadata(
            &mut tx,
            storage::SNAPSHOT_TOTAL_VOTES_KEY,
            &staged.total_votes.to_string(),
        )
        .await
        .context(DurableSnafu)?;
        tx.commit().await.context(TxSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::{ItemId, ItemInfo};

    async fn rig() -> (Arc<cache::InMemory>, Store, Arc<Users>, Snapshotter) {
        let cache = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        for id in ["w", "x"] {
            store
                .insert_item(
                    &ItemId::from(id),
                    &ItemInfo {
                        name: id.to_owned(),
                        description: String::new(),
                        sprite: String::new(),
                        kind: 0,
                    },
                )
                .await
                .unwrap();
        }
        let users = Arc::new(Users::new(cache.clone()));
        let snap = Snapshotter::new(cache.clone(), store.clone(), users.clone());
        (cache, store, users, snap)
    }

    async fn seed_cache(cache: &cache::InMemory) {
        let stats_w = ItemStats {
            score: 1516.0,
            total: 1.0,
            win: 1.0,
            rank_score: 0.9,
        };
        let stats_x = ItemStats {
            score: 1484.0,
            total: 1.0,
            win: 0.0,
            rank_score: 0.1,
        };
        cache
            .exec(vec![
                Op::HSet {
                    key: cache::ITEM_STATS_KEY.to_owned(),
                    entries: vec![
                        ("w".into(), serde_json::to_string(&stats_w).unwrap()),
                        ("x".into(), serde_json::to_string(&stats_x).unwrap()),
                    ],
                },
                Op::ZAdd {
                    key: cache::ITEM_RANKING_KEY.to_owned(),
                    entries: vec![(0.9, "w".into()), (0.1, "x".into())],
                },
                Op::Set {
                    key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                    value: "1".into(),
                },
                Op::Set {
                    key: cache::TOTAL_VOTES_KEY.to_owned(),
                    value: "1".into(),
                },
                Op::HSet {
                    key: cache::USER_STATS_KEY.to_owned(),
                    entries: vec![
                        (
                            TOTAL_STATS_FIELD.to_owned(),
                            serde_json::to_string(&UserStats {
                                wins: 1,
                                draw: 0,
                                skip: 0,
                            })
                            .unwrap(),
                        ),
                        (
                            "u1".to_owned(),
                            serde_json::to_string(&UserStats {
                                wins: 1,
                                draw: 0,
                                skip: 0,
                            })
                            .unwrap(),
                        ),
                    ],
                },
                Op::SAdd {
                    key: cache::USER_DIRTY_KEY.to_owned(),
                    members: vec!["u1".into()],
                },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_lands_in_the_durable_log() {
        let (cache, store, _users, snap) = rig().await;
        seed_cache(&cache).await;
        snap.snapshot(None).await.unwrap();

        assert_eq!(store.last_snapshot_vote_id().await.unwrap(), 1);
        assert_eq!(store.snapshot_total_votes().await.unwrap(), 1.0);
        let items = store.load_items().await.unwrap();
        let w = items.iter().find(|row| row.id.as_str() == "w").unwrap();
        assert_eq!(w.stats.score, 1516.0);
        assert_eq!(w.rank, 1);
        let x = items.iter().find(|row| row.id.as_str() == "x").unwrap();
        assert_eq!(x.rank, 2);
        let users = store.users_page("", 10).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].1.wins, 1);
        assert_eq!(store.total_stats().await.unwrap().wins, 1);

        // The dirty set was consumed.
        let dirty = cache
            .run(Op::SMembers {
                key: cache::USER_DIRTY_KEY.to_owned(),
            })
            .await
            .unwrap()
            .into_list()
            .unwrap();
        assert!(dirty.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_idempotent() {
        let (cache, store, _users, snap) = rig().await;
        seed_cache(&cache).await;
        snap.snapshot(None).await.unwrap();
        let before = store.load_items().await.unwrap();
        // No intervening vote: the second run must not touch durable state.
        snap.snapshot(None).await.unwrap();
        let after = store.load_items().await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.stats, a.stats);
            assert_eq!(b.rank, a.rank);
        }
        assert_eq!(store.last_snapshot_vote_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nothing_processed_means_nothing_to_do() {
        let (_cache, store, _users, snap) = rig().await;
        snap.snapshot(None).await.unwrap();
        assert_eq!(store.last_snapshot_vote_id().await.unwrap(), 0);
    }
}
