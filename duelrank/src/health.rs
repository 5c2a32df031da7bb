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

//! # cache health & warm rebuild
//!
//! The cache tier can die and come back empty, and the process has to notice *by itself*: the
//! tell is the server run id, which changes on every cache restart. A poller pings every five
//! seconds and drives a three-state machine:
//!
//! - **Healthy** — all good; write paths open.
//! - **Degraded** — unreachable; write paths 503, read paths fall back to the durable snapshot.
//! - **Rebuilding** — reachable but with a new run id (or a previous rebuild failed); the warm
//!   rebuild reloads the snapshot from the durable log & replays the incremental vote log on top.
//!
//! A rebuild is only *valid* if the run id didn't change across it — the cache restarting mid-
//! rebuild invalidates everything it just wrote. That's checked optimistically after the fact;
//! on mismatch we stay in Rebuilding & try again next tick.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{error, info, warn};

use crate::{
    cache::{self, Backend, Op, RunId},
    catalog::{self, weight_for_total, Catalog},
    elo::{self, EloTracker},
    entities::{ItemStats, UserStats, VoteOutcome},
    ip_limiter::{self, IpLimiter},
    lifecycle::Handle,
    processor::VoteProcessor,
    replay::{self, ReplayGate},
    snapshot::{self, Snapshotter},
    storage::{self, Store},
    users::{Users, TOTAL_STATS_FIELD},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache I/O failed during rebuild: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Durable read failed during rebuild: {source}"))]
    Durable {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Item warmup failed: {source}"))]
    Items {
        source: catalog::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("User warmup failed: {source}"))]
    UserWarm {
        source: crate::users::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Replay-defense recovery failed: {source}"))]
    Replay {
        source: replay::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("IP-window rebuild failed: {source}"))]
    IpWindows {
        source: ip_limiter::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Post-rebuild snapshot failed: {source}"))]
    Snapshot {
        source: snapshot::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("ELO tracker rebuild failed: {source}"))]
    Tracker {
        source: elo::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Incremental replay hit a vote naming unknown item(s)"))]
    UnknownItems { backtrace: Backtrace },
    #[snafu(display("Failed to serialize stats during rebuild: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Page size for the incremental vote replay
const REPLAY_BATCH: i64 = 10_000;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          HealthStatus                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Healthy,
    Degraded,
    Rebuilding,
}

struct Inner {
    state: State,
    last_known_run_id: Option<RunId>,
}

/// The verdict of one health check
#[derive(Clone, Copy, Debug, Default)]
pub struct Assessment {
    pub needs_rebuild: bool,
    /// Degraded → Healthy edge (the mirror report repo flushes on it)
    pub recovered: bool,
}

/// Thread-safe holder of the health state machine; consumed by handlers & the vote processor
pub struct HealthStatus {
    inner: StdMutex<Inner>,
}

impl HealthStatus {
    pub fn new() -> HealthStatus {
        HealthStatus {
            inner: StdMutex::new(Inner {
                state: State::Healthy,
                last_known_run_id: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().expect("lock poisoned").state
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == State::Healthy
    }

    /// Record the run id observed during single-threaded startup
    pub fn set_initial_run_id(&self, run_id: RunId) {
        self.inner.lock().expect("lock poisoned").last_known_run_id = Some(run_id);
    }

    /// Fold one probe result (None = unreachable) into the state machine
    pub fn assess(&self, observed: Option<&RunId>) -> Assessment {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut verdict = Assessment::default();
        match inner.state {
            State::Healthy => match observed {
                None => {
                    inner.state = State::Degraded;
                    warn!("health: cache connection lost; state -> Degraded");
                }
                Some(run_id) => {
                    if inner
                        .last_known_run_id
                        .as_ref()
                        .map(|known| known != run_id)
                        .unwrap_or(false)
                    {
                        inner.state = State::Rebuilding;
                        verdict.needs_rebuild = true;
                        warn!("health: cache restart detected (run id changed); state -> Rebuilding");
                    }
                }
            },
            State::Degraded => {
                if let Some(run_id) = observed {
                    if inner
                        .last_known_run_id
                        .as_ref()
                        .map(|known| known != run_id)
                        .unwrap_or(false)
                    {
                        inner.state = State::Rebuilding;
                        verdict.needs_rebuild = true;
                        warn!("health: cache back but restarted; state -> Rebuilding");
                    } else {
                        inner.state = State::Healthy;
                        verdict.recovered = true;
                        info!("health: cache connection restored; state -> Healthy");
                    }
                }
            }
            State::Rebuilding => match observed {
                None => {
                    inner.state = State::Degraded;
                    warn!("health: cache lost again mid-rebuild; state -> Degraded");
                }
                Some(_) => {
                    // Still Rebuilding means the last attempt failed; go again.
                    verdict.needs_rebuild = true;
                    info!("health: retrying cache rebuild");
                }
            },
        }
        if let Some(run_id) = observed {
            inner.last_known_run_id = Some(run_id.clone());
        }
        verdict
    }

    /// Report the outcome of a rebuild attempt, along with the run id observed just after it
    pub fn mark_rebuild_complete(&self, success: bool, run_id_after: Option<RunId>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != State::Rebuilding {
            return;
        }
        match run_id_after {
            None => {
                error!("health: cache unreachable right after rebuild; attempt voided");
            }
            Some(after) => {
                let same = inner
                    .last_known_run_id
                    .as_ref()
                    .map(|known| known == &after)
                    .unwrap_or(false);
                if success && same {
                    inner.state = State::Healthy;
                    info!("health: cache rebuild succeeded; state -> Healthy");
                } else if success {
                    error!("health: cache restarted during the rebuild; staying in Rebuilding");
                    inner.last_known_run_id = Some(after);
                } else {
                    error!("health: cache rebuild failed; staying in Rebuilding");
                }
            }
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::new()
    }
}

/// Ping with the poller's timeout; None = unreachable
pub async fn probe(cache: &dyn Backend) -> Option<RunId> {
    match tokio::time::timeout(PING_TIMEOUT, cache.ping()).await {
        Ok(Ok(run_id)) => Some(run_id),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the poller                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Monitor {
    pub status: Arc<HealthStatus>,
    pub cache: Arc<dyn Backend>,
    pub rebuilder: Rebuilder,
    pub reports: Arc<crate::report::ReportService>,
}

impl Monitor {
    /// One full check: probe, assess, maybe rebuild, validate
    pub async fn check_once(&self) {
        let observed = probe(self.cache.as_ref()).await;
        let verdict = self.status.assess(observed.as_ref());
        if verdict.recovered {
            self.reports.clear_mirror().await;
        }
        if verdict.needs_rebuild {
            info!("health: starting warm cache rebuild");
            let outcome = self.rebuilder.rebuild().await;
            if let Err(err) = &outcome {
                error!("warm rebuild failed: {}", err);
            }
            let after = probe(self.cache.as_ref()).await;
            self.status.mark_rebuild_complete(outcome.is_ok(), after);
        }
    }

    /// The periodic driver; tied to the *forceful* manager so it keeps watching through the
    /// graceful drain
    pub async fn run(self, handle: Handle) {
        info!("cache health poller started");
        loop {
            if handle.sleep(CHECK_INTERVAL).await.is_err() {
                info!("cache health poller shutting down");
                return;
            }
            self.check_once().await;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          warm rebuild                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Seed the cache's metadata cells from the durable snapshot checkpoint
pub async fn warm_metadata(cache: &dyn Backend, store: &Store) -> Result<()> {
    let last_snapshot = store.last_snapshot_vote_id().await.context(DurableSnafu)?;
    let total_votes = store.snapshot_total_votes().await.context(DurableSnafu)?;
    cache
        .exec(vec![
            Op::Set {
                key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                value: last_snapshot.to_string(),
            },
            Op::Set {
                key: cache::TOTAL_VOTES_KEY.to_owned(),
                value: total_votes.to_string(),
            },
        ])
        .await
        .context(CacheSnafu)?;
    Ok(())
}

/// Everything the warm rebuild touches
#[derive(Clone)]
pub struct Rebuilder {
    pub cache: Arc<dyn Backend>,
    pub store: Store,
    pub catalog: Arc<Catalog>,
    pub tracker: EloTracker,
    pub users: Arc<Users>,
    pub replay: Arc<ReplayGate>,
    pub ip_limiter: Arc<IpLimiter>,
    pub processor: Arc<VoteProcessor>,
    pub snapshotter: Arc<Snapshotter>,
}

impl Rebuilder {
    /// Rebuild the cache tier from the durable log: snapshot rewarm, auxiliary structures, then
    /// incremental vote replay, then an immediate snapshot to re-anchor the checkpoint
    pub async fn rebuild(&self) -> Result<()> {
        warm_metadata(self.cache.as_ref(), &self.store).await?;

        self.catalog
            .warm(&self.store, self.cache.as_ref())
            .await
            .context(ItemsSnafu)?;
        {
            let _users = self.users.lock().write().await;
            self.users.warm(&self.store).await.context(UserWarmSnafu)?;
        }
        self.replay.recover().await.context(ReplaySnafu)?;
        self.ip_limiter
            .rebuild(&self.store)
            .await
            .context(IpWindowsSnafu)?;

        self.apply_incremental_votes().await?;

        self.snapshotter
            .snapshot(None)
            .await
            .context(SnapshotSnafu)?;
        info!("warm rebuild complete");
        Ok(())
    }

    /// Replay votes `(last_snapshot, tail]` into the freshly-warmed cache, batched & aggregated
    /// in memory, landing in a single cache transaction; then reset the ELO tracker & the weight
    /// tree and move the processor's checkpoint forward
    pub async fn apply_incremental_votes(&self) -> Result<()> {
        // Lock order: item repository, then user repository (same as the processor's apply).
        let mut weights = self.catalog.weights().write().await;
        let _users = self.users.lock().write().await;

        let last_snapshot = self
            .store
            .last_snapshot_vote_id()
            .await
            .context(DurableSnafu)?;

        // The freshly-warmed item stats, in memory for the whole replay.
        let mut item_stats: HashMap<String, ItemStats> = self
            .cache
            .run(Op::HGetAll {
                key: cache::ITEM_STATS_KEY.to_owned(),
            })
            .await
            .context(CacheSnafu)?
            .into_pairs()
            .context(CacheSnafu)?
            .into_iter()
            .filter_map(|(id, json)| serde_json::from_str(&json).ok().map(|s| (id, s)))
            .collect();

        let mut total_stats: UserStats = self
            .cache
            .run(Op::HGet {
                key: cache::USER_STATS_KEY.to_owned(),
                field: TOTAL_STATS_FIELD.to_owned(),
            })
            .await
            .context(CacheSnafu)?
            .opt_text()
            .context(CacheSnafu)?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

        let mut user_agg: HashMap<String, UserStats> = HashMap::new();
        let mut last_id = last_snapshot;
        let mut total_increment = 0.0f64;
        let mut replayed = 0usize;

        let mut batch = self
            .store
            .votes_after(last_snapshot, REPLAY_BATCH)
            .await
            .context(DurableSnafu)?;
        while !batch.is_empty() {
            // Pull cache-resident stats for users we haven't seen yet this replay.
            let unseen: Vec<String> = batch
                .iter()
                .filter(|vote| !vote.user.is_empty() && !user_agg.contains_key(&vote.user))
                .map(|vote| vote.user.clone())
                .collect();
            if !unseen.is_empty() {
                let found = self
                    .cache
                    .run(Op::HMGet {
                        key: cache::USER_STATS_KEY.to_owned(),
                        fields: unseen.clone(),
                    })
                    .await
                    .context(CacheSnafu)?
                    .into_opt_list()
                    .context(CacheSnafu)?;
                for (uuid, json) in unseen.into_iter().zip(found) {
                    let stats = json
                        .and_then(|json| serde_json::from_str(&json).ok())
                        .unwrap_or_default();
                    user_agg.insert(uuid, stats);
                }
            }

            for vote in &batch {
                total_stats.record(vote.outcome);
                if !vote.user.is_empty() {
                    user_agg.entry(vote.user.clone()).or_default().record(vote.outcome);
                }
                if vote.outcome != VoteOutcome::Skip {
                    let (Some(mut a), Some(mut b)) = (
                        item_stats.get(vote.item_a.as_str()).copied(),
                        item_stats.get(vote.item_b.as_str()).copied(),
                    ) else {
                        return UnknownItemsSnafu.fail();
                    };
                    match vote.outcome {
                        VoteOutcome::AWins => {
                            let (w, l) = elo::elo_after(a.score, b.score, vote.multiplier);
                            a.score = w;
                            b.score = l;
                            a.win += vote.multiplier;
                            a.total += vote.multiplier;
                            b.total += vote.multiplier;
                        }
                        VoteOutcome::BWins => {
                            let (w, l) = elo::elo_after(b.score, a.score, vote.multiplier);
                            b.score = w;
                            a.score = l;
                            b.win += vote.multiplier;
                            b.total += vote.multiplier;
                            a.total += vote.multiplier;
                        }
                        VoteOutcome::Draw => {
                            a.total += vote.multiplier;
                            b.total += vote.multiplier;
                        }
                        VoteOutcome::Skip => unreachable!(),
                    }
                    item_stats.insert(vote.item_a.to_string(), a);
                    item_stats.insert(vote.item_b.to_string(), b);
                    total_increment += vote.multiplier;
                }
                last_id = vote.id;
            }
            replayed += batch.len();

            if batch.len() < REPLAY_BATCH as usize {
                break;
            }
            batch = self
                .store
                .votes_after(last_id, REPLAY_BATCH)
                .await
                .context(DurableSnafu)?;
        }

        // Re-anchor the tracker on the final scores & recompute every rank score + tree weight.
        let mut tx = self.tracker.begin().await;
        let scores: Vec<f64> = item_stats.values().map(|stats| stats.score).collect();
        tx.reset(&scores).context(TrackerSnafu)?;
        let (min, max) = tx.min_max();

        let mut stats_entries = Vec::with_capacity(item_stats.len());
        let mut ranking_entries = Vec::with_capacity(item_stats.len());
        for (id, stats) in item_stats.iter_mut() {
            stats.rank_score = elo::rank_score(min, max, stats.score, stats.total, stats.win);
            stats_entries.push((id.clone(), serde_json::to_string(stats).context(SerSnafu)?));
            ranking_entries.push((stats.rank_score, id.clone()));
            if let Some(index) = self.catalog.index_of(&crate::entities::ItemId::new(id.clone())) {
                // An in-range index can't fail the update.
                let _ = weights.update(index, weight_for_total(stats.total));
            }
        }

        let mut ops = vec![
            Op::HSet {
                key: cache::ITEM_STATS_KEY.to_owned(),
                entries: stats_entries,
            },
            Op::ZAdd {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                entries: ranking_entries,
            },
            Op::HSet {
                key: cache::USER_STATS_KEY.to_owned(),
                entries: vec![(
                    TOTAL_STATS_FIELD.to_owned(),
                    serde_json::to_string(&total_stats).context(SerSnafu)?,
                )],
            },
        ];
        if total_increment > 0.0 {
            ops.push(Op::IncrByFloat {
                key: cache::TOTAL_VOTES_KEY.to_owned(),
                delta: total_increment,
            });
        }
        if last_id > last_snapshot {
            ops.push(Op::Set {
                key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                value: last_id.to_string(),
            });
        }
        if !user_agg.is_empty() {
            let mut entries = Vec::with_capacity(user_agg.len());
            for (uuid, stats) in &user_agg {
                entries.push((uuid.clone(), serde_json::to_string(stats).context(SerSnafu)?));
                ops.push(Op::ZAdd {
                    key: cache::USER_RANKING_KEY.to_owned(),
                    entries: vec![(stats.total() as f64, uuid.clone())],
                });
            }
            ops.push(Op::HSet {
                key: cache::USER_STATS_KEY.to_owned(),
                entries,
            });
            ops.push(Op::SAdd {
                key: cache::USER_DIRTY_KEY.to_owned(),
                members: user_agg.keys().cloned().collect(),
            });
        }
        self.cache.exec(ops).await.context(CacheSnafu)?;
        tx.commit();

        self.processor.set_last_processed(last_id);
        if replayed > 0 {
            info!(
                "incremental replay: {} votes applied; processor resumes after {}",
                replayed, last_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(id: &str) -> RunId {
        RunId(id.to_owned())
    }

    #[test]
    fn healthy_to_degraded_and_back() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        assert!(status.is_healthy());

        let verdict = status.assess(None);
        assert!(!verdict.needs_rebuild);
        assert_eq!(status.state(), State::Degraded);

        let verdict = status.assess(Some(&run("r1")));
        assert!(!verdict.needs_rebuild);
        assert!(verdict.recovered);
        assert_eq!(status.state(), State::Healthy);
    }

    #[test]
    fn a_new_run_id_triggers_rebuild() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        let verdict = status.assess(Some(&run("r2")));
        assert!(verdict.needs_rebuild);
        assert_eq!(status.state(), State::Rebuilding);

        status.mark_rebuild_complete(true, Some(run("r2")));
        assert_eq!(status.state(), State::Healthy);
    }

    #[test]
    fn degraded_then_new_run_id_triggers_rebuild() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        status.assess(None);
        assert_eq!(status.state(), State::Degraded);
        let verdict = status.assess(Some(&run("r2")));
        assert!(verdict.needs_rebuild);
        assert_eq!(status.state(), State::Rebuilding);
    }

    #[test]
    fn a_failed_rebuild_is_retried() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        status.assess(Some(&run("r2")));
        status.mark_rebuild_complete(false, Some(run("r2")));
        assert_eq!(status.state(), State::Rebuilding);
        // Next tick, still connected: try again.
        let verdict = status.assess(Some(&run("r2")));
        assert!(verdict.needs_rebuild);
    }

    #[test]
    fn a_restart_during_rebuild_invalidates_it() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        status.assess(Some(&run("r2")));
        assert_eq!(status.state(), State::Rebuilding);
        // The rebuild "succeeded", but against a cache that has since restarted again.
        status.mark_rebuild_complete(true, Some(run("r3")));
        assert_eq!(status.state(), State::Rebuilding);
        // And the next success against a stable run id clears it.
        status.mark_rebuild_complete(true, Some(run("r3")));
        assert_eq!(status.state(), State::Healthy);
    }

    #[test]
    fn disconnect_during_rebuild_degrades() {
        let status = HealthStatus::new();
        status.set_initial_run_id(run("r1"));
        status.assess(Some(&run("r2")));
        let verdict = status.assess(None);
        assert!(!verdict.needs_rebuild);
        assert_eq!(status.state(), State::Degraded);
    }
}
