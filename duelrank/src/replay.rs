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

//! # replay defense
//!
//! A pair token is good for exactly one vote. Enforcement is a three-tier lookup:
//!
//! 1. a Bloom filter in the cache tier — a definite "absent" answers the common case with one
//!    round trip & no false negatives;
//! 2. an exact set in the cache tier — confirms the filter's "maybe";
//! 3. the durable `used_pair_ids` table — the authority.
//!
//! The insert protocol is the delicate part. A per-process mutex serializes writers; under it we
//! re-check the exact set (another request may have consumed the id while we waited), write the
//! durable row inside a transaction we do *not* yet commit, write filter + set atomically in the
//! cache tier, and only then commit the durable transaction. If that final commit fails after the
//! cache write, we log loudly and answer "not a replay": the cache now dictates future behavior,
//! and this edge only arises when the cache is about to go down anyway, taking a rebuild with it.
//!
//! The filter & set are rebuilt from the durable table after a cache restart; at *process* start
//! they're wiped instead — the HMAC key is fresh, so no outstanding token can verify and the old
//! ids are dead weight.

use std::sync::Arc;

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{
    cache::{self, Backend, Op},
    storage::{self, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Replay lookup failed: {source}"))]
    Lookup {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to reset the replay tiers: {source}"))]
    Reset {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Durable pair-id write failed: {source}"))]
    Durable {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to begin/commit the pair-id transaction: {source}"))]
    Tx {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bloom parameters: error rate 0.001 at one million pair ids
const BLOOM_ERROR_RATE: f64 = 0.001;
const BLOOM_CAPACITY: u64 = 1_000_000;
/// Page size when reloading the filter from the durable table
const RECOVER_BATCH: i64 = 10_000;
/// Durable-commit retry policy for transient locking errors
const COMMIT_RETRIES: u32 = 3;
const COMMIT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

pub struct ReplayGate {
    cache: Arc<dyn Backend>,
    store: Store,
    insert_lock: Mutex<()>,
}

impl ReplayGate {
    pub fn new(cache: Arc<dyn Backend>, store: Store) -> ReplayGate {
        ReplayGate {
            cache,
            store,
            insert_lock: Mutex::new(()),
        }
    }

    async fn reset_cache_tiers(&self) -> Result<()> {
        self.cache
            .exec(vec![
                Op::Del {
                    keys: vec![
                        cache::PAIR_BLOOM_KEY.to_owned(),
                        cache::PAIR_SET_KEY.to_owned(),
                    ],
                },
                Op::BfReserve {
                    key: cache::PAIR_BLOOM_KEY.to_owned(),
                    error_rate: BLOOM_ERROR_RATE,
                    capacity: BLOOM_CAPACITY,
                },
            ])
            .await
            .context(ResetSnafu)?;
        Ok(())
    }

    /// Process-start initialization: wipe all three tiers & reserve a fresh filter
    pub async fn initialize(&self) -> Result<()> {
        self.reset_cache_tiers().await?;
        self.store.clear_used_pair_ids().await.context(DurableSnafu)?;
        info!("replay defense initialized");
        Ok(())
    }

    /// Cache-restart recovery: reload filter & set from the durable table, in pages
    pub async fn recover(&self) -> Result<()> {
        let _guard = self.insert_lock.lock().await;
        self.reset_cache_tiers().await?;

        let mut restored = 0usize;
        let mut after = String::new();
        loop {
            let page = self
                .store
                .used_pair_ids_page(&after, RECOVER_BATCH)
                .await
                .context(DurableSnafu)?;
            if page.is_empty() {
                break;
            }
            self.cache
                .exec(vec![
                    Op::SAdd {
                        key: cache::PAIR_SET_KEY.to_owned(),
                        members: page.clone(),
                    },
                    Op::BfMAdd {
                        key: cache::PAIR_BLOOM_KEY.to_owned(),
                        items: page.clone(),
                    },
                ])
                .await
                .context(ResetSnafu)?;
            restored += page.len();
            if page.len() < RECOVER_BATCH as usize {
                break;
            }
            after = page.into_iter().last().expect("page is non-empty");
        }
        info!("replay defense: restored {} pair ids from the durable log", restored);
        Ok(())
    }

    /// Is `pair_id` a replay? If not, atomically consume it. Ok(true) = replay, reject the vote.
    pub async fn check_and_use(&self, pair_id: &str) -> Result<bool> {
        // Fast, lock-free read path.
        let in_filter = self
            .cache
            .run(Op::BfExists {
                key: cache::PAIR_BLOOM_KEY.to_owned(),
                item: pair_id.to_owned(),
            })
            .await
            .context(LookupSnafu)?
            .into_bool()
            .context(LookupSnafu)?;
        if in_filter {
            let in_set = self
                .cache
                .run(Op::SIsMember {
                    key: cache::PAIR_SET_KEY.to_owned(),
                    member: pair_id.to_owned(),
                })
                .await
                .context(LookupSnafu)?
                .into_bool()
                .context(LookupSnafu)?;
            if in_set {
                return Ok(true);
            }
            // A filter false positive; fall through to the insert path.
        }
        self.insert(pair_id).await
    }

    async fn insert(&self, pair_id: &str) -> Result<bool> {
        let _guard = self.insert_lock.lock().await;

        // Double-check now that we hold the lock; the id may have been consumed while we waited.
        let in_set = self
            .cache
            .run(Op::SIsMember {
                key: cache::PAIR_SET_KEY.to_owned(),
                member: pair_id.to_owned(),
            })
            .await
            .context(LookupSnafu)?
            .into_bool()
            .context(LookupSnafu)?;
        if in_set {
            return Ok(true);
        }

        // Durable write first, commit withheld until the cache tiers are in.
        let mut tx = self.store.pool().begin().await.context(TxSnafu)?;
        let inserted = Store::try_insert_used_pair(&mut tx, pair_id)
            .await
            .context(DurableSnafu)?;
        if !inserted {
            // The cache lost this id but the durable table remembers it; trust the table.
            return Ok(true);
        }

        self.cache
            .exec(vec![
                Op::BfAdd {
                    key: cache::PAIR_BLOOM_KEY.to_owned(),
                    item: pair_id.to_owned(),
                },
                Op::SAdd {
                    key: cache::PAIR_SET_KEY.to_owned(),
                    members: vec![pair_id.to_owned()],
                },
            ])
            .await
            .context(ResetSnafu)?;
        // If that failed, `tx` dropped here un-committed & the durable row evaporates with it.

        let mut attempt = 0;
        loop {
            match tx.commit().await {
                Ok(()) => return Ok(false),
                Err(err) => {
                    attempt += 1;
                    let retryable = matches!(&err, sqlx::Error::Database(db)
                        if matches!(db.code().as_deref(), Some("5") | Some("6")));
                    if !retryable || attempt >= COMMIT_RETRIES {
                        // The cache tiers already carry the id; future submissions of it will be
                        // rejected as replays for as long as the cache lives. If the cache dies
                        // too, the rebuild reloads from the durable table — which is missing this
                        // row. Nothing to do but say so, loudly.
                        error!(
                            "durable commit failed after cache write for pair id {}: {}",
                            pair_id, err
                        );
                        return Ok(false);
                    }
                    tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                    // Can't retry a consumed transaction; re-open & re-insert.
                    tx = self.store.pool().begin().await.context(TxSnafu)?;
                    Store::try_insert_used_pair(&mut tx, pair_id)
                        .await
                        .context(DurableSnafu)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn gate() -> ReplayGate {
        let cache = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let gate = ReplayGate::new(cache, store);
        gate.initialize().await.unwrap();
        gate
    }

    #[tokio::test]
    async fn a_pair_id_is_one_shot() {
        let gate = gate().await;
        assert!(!gate.check_and_use("pair-1").await.unwrap());
        assert!(gate.check_and_use("pair-1").await.unwrap());
        assert!(gate.check_and_use("pair-1").await.unwrap());
        assert!(!gate.check_and_use("pair-2").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_submissions_admit_exactly_one() {
        let gate = Arc::new(gate().await);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                gate.check_and_use("contested").await.unwrap()
            }));
        }
        let mut fresh = 0;
        for task in tasks {
            if !task.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn recovery_reloads_the_durable_table() {
        let gate = gate().await;
        assert!(!gate.check_and_use("survivor").await.unwrap());

        // Simulate a cache restart: all cache state gone, durable table intact.
        let cache = Arc::new(cache::InMemory::new());
        let revived = ReplayGate::new(cache, gate.store.clone());
        revived.recover().await.unwrap();
        assert!(revived.check_and_use("survivor").await.unwrap());
        assert!(!revived.check_and_use("newcomer").await.unwrap());
    }

    #[tokio::test]
    async fn initialize_wipes_the_durable_table() {
        let gate = gate().await;
        assert!(!gate.check_and_use("stale").await.unwrap());
        gate.initialize().await.unwrap();
        assert!(!gate.check_and_use("stale").await.unwrap());
    }
}
