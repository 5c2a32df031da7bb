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

//! # the vote processor
//!
//! The single writer. Every accepted vote is durably appended by the HTTP layer, then handed to
//! this task, which applies votes to the cache tier **strictly in ascending id order, each vote
//! exactly once**. All mutation of shared ranking state funnels through here; that's the whole
//! concurrency story for the hot path.
//!
//! Ordering is maintained with a reorder buffer: votes arriving early (their predecessor still in
//! flight, or lost to a full channel) wait in a min-heap keyed by id until the gap closes. Gaps
//! that never close by themselves — the channel dropped a vote under load, or the process restarted
//! mid-stream — are healed by the **patroller**, a companion task that rescans the durable log
//! every thirty seconds and re-enqueues anything past the checkpoint. The submission channel is
//! bounded and drops the newest vote when full: the durable append happened first, so a drop costs
//! real-time latency, never data.
//!
//! Applying a vote means: take the item-repository write lock (and the user-repository lock for
//! the stat deltas), fold the outcome into both items' statistics, recompute rank scores — all of
//! them if the tracker reports a boundary change, just the two participants' otherwise — and land
//! everything (stats, ranking entries, counters, checkpoint, user deltas) in one atomic cache
//! transaction. The ELO tracker mutation is speculative: it commits only after the cache write
//! sticks, rolling back otherwise.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{self, Backend, Op},
    catalog::{weight_for_total, Catalog},
    define_metric,
    elo::{self, EloTracker},
    entities::{ItemStats, VoteOutcome, VoteRecord},
    health::HealthStatus,
    lifecycle::Handle,
    metrics::Sort,
    storage::Store,
    tree,
    users::{Users, TOTAL_STATS_FIELD},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache write failed while applying a vote: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Weight-tree update failed: {source}"))]
    Tree {
        source: tree::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize stats: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("ELO tracker reset failed: {source}"))]
    Tracker {
        source: elo::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("User stats lookup failed: {source}"))]
    Users {
        source: crate::users::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a retry ladder gave up
enum Interrupt {
    Cancelled,
    Unhealthy,
}

/// Submission channel depth; overflow drops the newest vote (the patroller heals it)
pub const QUEUE_CAPACITY: usize = 10_000;
/// Apply retry ladder: initial delay, doubling to the cap, then steady "alarm" cadence at the cap
const RETRY_INITIAL: Duration = Duration::from_millis(8);
const RETRY_MAX: Duration = Duration::from_secs(2);
/// Pause when the cache is unhealthy, matched to the health poller's cadence
const UNHEALTHY_PAUSE: Duration = Duration::from_secs(5);
/// Patroller cadence & scan page size
const PATROL_INTERVAL: Duration = Duration::from_secs(30);
const PATROL_BATCH: i64 = 1000;

define_metric! { "processor.votes.applied", votes_applied, Sort::IntegralCounter }
define_metric! { "processor.rank.rebuilds", rank_rebuilds, Sort::IntegralCounter }
define_metric! { "processor.queue.dropped", queue_dropped, Sort::IntegralCounter }
define_metric! { "processor.patrol.requeued", patrol_requeued, Sort::IntegralCounter }

/// Everything the processor needs to apply a vote
#[derive(Clone)]
pub struct ProcessorContext {
    pub cache: Arc<dyn Backend>,
    pub store: Store,
    pub catalog: Arc<Catalog>,
    pub tracker: EloTracker,
    pub users: Arc<Users>,
    pub health: Arc<HealthStatus>,
}

/// The handle the rest of the process holds on the single writer
pub struct VoteProcessor {
    tx: mpsc::Sender<VoteRecord>,
    last_processed: StdMutex<i64>,
}

impl VoteProcessor {
    /// Hand a vote to the writer; never blocks. A full queue drops the vote with a warning — it's
    /// already durable & the patroller will re-enqueue it within thirty seconds.
    pub fn submit(&self, vote: VoteRecord) {
        let id = vote.id;
        if self.tx.try_send(vote).is_err() {
            queue_dropped.add(1, &[]);
            warn!("vote queue full; deferring vote {} to the patroller", id);
        }
    }

    pub fn last_processed(&self) -> i64 {
        *self.last_processed.lock().expect("lock poisoned")
    }

    /// Reset the checkpoint; used by warm rebuild after an incremental replay
    pub fn set_last_processed(&self, id: i64) {
        *self.last_processed.lock().expect("lock poisoned") = id;
    }
}

/// Start the writer & its patroller. `start_id` is the durable `last_snapshot_vote_id` — the
/// processor resumes from there and the patroller's first pass re-enqueues whatever the snapshot
/// didn't cover.
pub fn start(
    ctx: ProcessorContext,
    start_id: i64,
    graceful: Handle,
    forceful: Handle,
    patrol: Handle,
) -> Arc<VoteProcessor> {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let processor = Arc::new(VoteProcessor {
        tx,
        last_processed: StdMutex::new(start_id),
    });
    tokio::spawn(run_main_loop(
        ctx.clone(),
        processor.clone(),
        rx,
        graceful,
        forceful,
    ));
    tokio::spawn(run_patroller(ctx, processor.clone(), patrol));
    processor
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the event loop                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Heap entry ordered by vote id
struct OrderedVote(VoteRecord);

impl PartialEq for OrderedVote {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for OrderedVote {}
impl PartialOrd for OrderedVote {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedVote {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

type ReorderBuffer = BinaryHeap<Reverse<OrderedVote>>;

async fn run_main_loop(
    ctx: ProcessorContext,
    vp: Arc<VoteProcessor>,
    mut rx: mpsc::Receiver<VoteRecord>,
    graceful: Handle,
    forceful: Handle,
) {
    info!(
        "vote processor started; resuming after vote {}",
        vp.last_processed()
    );
    let mut heap: ReorderBuffer = BinaryHeap::new();
    loop {
        if graceful.is_cancelled() {
            info!("vote processor: draining the queue for shutdown");
            drain(&ctx, &vp, &mut rx, &mut heap, &forceful).await;
            info!("vote processor: main loop exiting");
            return;
        }
        process_one(&ctx, &vp, &mut rx, &mut heap, &graceful).await;
    }
}

async fn process_one(
    ctx: &ProcessorContext,
    vp: &VoteProcessor,
    rx: &mut mpsc::Receiver<VoteRecord>,
    heap: &mut ReorderBuffer,
    graceful: &Handle,
) {
    let vote = match next_contiguous(vp, rx, heap, graceful).await {
        Some(vote) => vote,
        None => return,
    };

    if !ctx.health.is_healthy() {
        debug!("vote processor: cache unavailable or rebuilding; pausing");
        heap.push(Reverse(OrderedVote(vote)));
        let _ = graceful.sleep(UNHEALTHY_PAUSE).await;
        return;
    }

    match apply_with_retry(ctx, &vote, graceful).await {
        Ok(()) => {
            vp.set_last_processed(vote.id);
            votes_applied.add(1, &[]);
        }
        Err(Interrupt::Cancelled) | Err(Interrupt::Unhealthy) => {
            heap.push(Reverse(OrderedVote(vote)));
        }
    }
}

/// Block until the vote with id `last_processed + 1` is available, feeding early arrivals into
/// the reorder buffer & discarding stale ones. None means cancellation (or a closed channel).
async fn next_contiguous(
    vp: &VoteProcessor,
    rx: &mut mpsc::Receiver<VoteRecord>,
    heap: &mut ReorderBuffer,
    graceful: &Handle,
) -> Option<VoteRecord> {
    loop {
        let last = vp.last_processed();
        while let Some(Reverse(top)) = heap.peek() {
            if top.0.id <= last {
                heap.pop();
            } else {
                break;
            }
        }
        if let Some(Reverse(top)) = heap.peek() {
            if top.0.id == last + 1 {
                return heap.pop().map(|Reverse(v)| v.0);
            }
        }
        tokio::select! {
            _ = graceful.done() => return None,
            received = rx.recv() => {
                let vote = received?;
                let last = vp.last_processed();
                if vote.id <= last {
                    continue;
                }
                if vote.id == last + 1 {
                    return Some(vote);
                }
                heap.push(Reverse(OrderedVote(vote)));
            }
        }
    }
}

/// Bounded backoff (8ms doubling to 2s), then alarm mode: steady 2s retries, re-checking cache
/// health before each & aborting to the outer loop if it's gone
async fn apply_with_retry(
    ctx: &ProcessorContext,
    vote: &VoteRecord,
    handle: &Handle,
) -> std::result::Result<(), Interrupt> {
    let mut delay = RETRY_INITIAL;
    while delay < RETRY_MAX {
        match apply(ctx, vote).await {
            Ok(()) => return Ok(()),
            Err(err) => debug!("applying vote {} failed: {}; retrying", vote.id, err),
        }
        if handle.sleep(delay).await.is_err() {
            return Err(Interrupt::Cancelled);
        }
        delay *= 2;
    }
    loop {
        if !ctx.health.is_healthy() {
            return Err(Interrupt::Unhealthy);
        }
        match apply(ctx, vote).await {
            Ok(()) => return Ok(()),
            Err(err) => error!(
                "cache writes keep failing for vote {}: {}; retrying in {:?}",
                vote.id, err, RETRY_MAX
            ),
        }
        if handle.sleep(RETRY_MAX).await.is_err() {
            return Err(Interrupt::Cancelled);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         applying a vote                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Cache writes for the per-user & community stat deltas of one vote
async fn user_delta_ops(ctx: &ProcessorContext, vote: &VoteRecord) -> Result<Vec<Op>> {
    let (user_stats, mut total) = ctx
        .users
        .stats_and_total(&vote.user)
        .await
        .context(UsersSnafu)?;
    total.record(vote.outcome);

    let mut entries = vec![(
        TOTAL_STATS_FIELD.to_owned(),
        serde_json::to_string(&total).context(SerSnafu)?,
    )];
    let mut ops = Vec::new();
    if !vote.user.is_empty() {
        let mut stats = user_stats.unwrap_or_default();
        stats.record(vote.outcome);
        entries.push((vote.user.clone(), serde_json::to_string(&stats).context(SerSnafu)?));
        ops.push(Op::ZAdd {
            key: cache::USER_RANKING_KEY.to_owned(),
            entries: vec![(stats.total() as f64, vote.user.clone())],
        });
        ops.push(Op::SAdd {
            key: cache::USER_DIRTY_KEY.to_owned(),
            members: vec![vote.user.clone()],
        });
    }
    ops.insert(
        0,
        Op::HSet {
            key: cache::USER_STATS_KEY.to_owned(),
            entries,
        },
    );
    Ok(ops)
}

/// A SKIP touches no item state: user tallies & the checkpoint, one transaction
async fn apply_skip(ctx: &ProcessorContext, vote: &VoteRecord) -> Result<()> {
    let _users = ctx.users.lock().write().await;
    let mut ops = user_delta_ops(ctx, vote).await?;
    ops.push(Op::Set {
        key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
        value: vote.id.to_string(),
    });
    ctx.cache.exec(ops).await.context(CacheSnafu)?;
    Ok(())
}

async fn apply(ctx: &ProcessorContext, vote: &VoteRecord) -> Result<()> {
    if vote.outcome == VoteOutcome::Skip {
        return apply_skip(ctx, vote).await;
    }

    // Lock order: item repository, then user repository (warm rebuild takes them the same way).
    let mut weights = ctx.catalog.weights().write().await;
    let _users = ctx.users.lock().write().await;

    let mut replies = ctx
        .cache
        .run(Op::HMGet {
            key: cache::ITEM_STATS_KEY.to_owned(),
            fields: vec![vote.item_a.to_string(), vote.item_b.to_string()],
        })
        .await
        .context(CacheSnafu)?
        .into_opt_list()
        .context(CacheSnafu)?
        .into_iter();
    let parsed = (
        replies
            .next()
            .flatten()
            .and_then(|json| serde_json::from_str::<ItemStats>(&json).ok()),
        replies
            .next()
            .flatten()
            .and_then(|json| serde_json::from_str::<ItemStats>(&json).ok()),
    );
    let (Some(mut stats_a), Some(mut stats_b)) = parsed else {
        // Integrity violation: the stats hash is missing a participant. Skip the vote but
        // advance the checkpoint, or the stream wedges here forever.
        warn!(
            "vote {} names an item missing from the stats hash ({} or {}); skipping it",
            vote.id, vote.item_a, vote.item_b
        );
        ctx.cache
            .run(Op::Set {
                key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                value: vote.id.to_string(),
            })
            .await
            .context(CacheSnafu)?;
        return Ok(());
    };

    let (old_a, old_b) = (stats_a.score, stats_b.score);
    match vote.outcome {
        VoteOutcome::AWins => {
            let (w, l) = elo::elo_after(stats_a.score, stats_b.score, vote.multiplier);
            stats_a.score = w;
            stats_b.score = l;
            stats_a.win += vote.multiplier;
            stats_a.total += vote.multiplier;
            stats_b.total += vote.multiplier;
        }
        VoteOutcome::BWins => {
            let (w, l) = elo::elo_after(stats_b.score, stats_a.score, vote.multiplier);
            stats_b.score = w;
            stats_a.score = l;
            stats_b.win += vote.multiplier;
            stats_b.total += vote.multiplier;
            stats_a.total += vote.multiplier;
        }
        VoteOutcome::Draw => {
            stats_a.total += vote.multiplier;
            stats_b.total += vote.multiplier;
        }
        VoteOutcome::Skip => unreachable!("handled above"),
    }

    let mut tx = ctx.tracker.begin().await;
    let mut boundary = tx.update(old_a, stats_a.score);
    if !boundary {
        boundary = tx.update(old_b, stats_b.score);
    }

    let user_ops = user_delta_ops(ctx, vote).await?;
    let mut ops: Vec<Op> = Vec::new();

    if boundary {
        // The global min or max moved: every rank score is stale. Pull the full stats hash,
        // overlay the two fresh entries, re-scan the tracker & rewrite everything at once.
        rank_rebuilds.add(1, &[]);
        let mut all: Vec<(String, ItemStats)> = ctx
            .cache
            .run(Op::HGetAll {
                key: cache::ITEM_STATS_KEY.to_owned(),
            })
            .await
            .context(CacheSnafu)?
            .into_pairs()
            .context(CacheSnafu)?
            .into_iter()
            .filter_map(|(id, json)| serde_json::from_str(&json).ok().map(|stats| (id, stats)))
            .collect();
        for (id, stats) in all.iter_mut() {
            if id == vote.item_a.as_str() {
                *stats = stats_a;
            } else if id == vote.item_b.as_str() {
                *stats = stats_b;
            }
        }
        let scores: Vec<f64> = all.iter().map(|(_, stats)| stats.score).collect();
        tx.reset(&scores).context(TrackerSnafu)?;
        let (min, max) = tx.min_max();

        let mut stats_entries = Vec::with_capacity(all.len());
        let mut ranking_entries = Vec::with_capacity(all.len());
        for (id, stats) in all.iter_mut() {
            stats.rank_score = elo::rank_score(min, max, stats.score, stats.total, stats.win);
            stats_entries.push((id.clone(), serde_json::to_string(stats).context(SerSnafu)?));
            ranking_entries.push((stats.rank_score, id.clone()));
        }
        // Keep the local copies in sync with what just went into the hash.
        if let Some((_, s)) = all.iter().find(|(id, _)| id == vote.item_a.as_str()) {
            stats_a = *s;
        }
        if let Some((_, s)) = all.iter().find(|(id, _)| id == vote.item_b.as_str()) {
            stats_b = *s;
        }
        ops.push(Op::HSet {
            key: cache::ITEM_STATS_KEY.to_owned(),
            entries: stats_entries,
        });
        ops.push(Op::ZAdd {
            key: cache::ITEM_RANKING_KEY.to_owned(),
            entries: ranking_entries,
        });
    } else {
        let (min, max) = tx.min_max();
        stats_a.rank_score = elo::rank_score(min, max, stats_a.score, stats_a.total, stats_a.win);
        stats_b.rank_score = elo::rank_score(min, max, stats_b.score, stats_b.total, stats_b.win);
        ops.push(Op::HSet {
            key: cache::ITEM_STATS_KEY.to_owned(),
            entries: vec![
                (
                    vote.item_a.to_string(),
                    serde_json::to_string(&stats_a).context(SerSnafu)?,
                ),
                (
                    vote.item_b.to_string(),
                    serde_json::to_string(&stats_b).context(SerSnafu)?,
                ),
            ],
        });
        ops.push(Op::ZAdd {
            key: cache::ITEM_RANKING_KEY.to_owned(),
            entries: vec![
                (stats_a.rank_score, vote.item_a.to_string()),
                (stats_b.rank_score, vote.item_b.to_string()),
            ],
        });
    }

    ops.push(Op::IncrByFloat {
        key: cache::TOTAL_VOTES_KEY.to_owned(),
        delta: vote.multiplier,
    });
    ops.push(Op::Set {
        key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
        value: vote.id.to_string(),
    });
    ops.extend(user_ops);

    ctx.cache.exec(ops).await.context(CacheSnafu)?;
    // The cache write stuck; the tree & tracker mutations are now safe to make visible.
    if let Some(index) = ctx.catalog.index_of(&vote.item_a) {
        weights
            .update(index, weight_for_total(stats_a.total))
            .context(TreeSnafu)?;
    }
    if let Some(index) = ctx.catalog.index_of(&vote.item_b) {
        weights
            .update(index, weight_for_total(stats_b.total))
            .context(TreeSnafu)?;
    }
    tx.commit();
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the patroller                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn run_patroller(ctx: ProcessorContext, vp: Arc<VoteProcessor>, handle: Handle) {
    info!("vote patroller started");
    patrol_once(&ctx, &vp).await;
    loop {
        if handle.sleep(PATROL_INTERVAL).await.is_err() {
            info!("vote patroller shutting down");
            return;
        }
        patrol_once(&ctx, &vp).await;
    }
}

/// One sweep: anything durably logged past the checkpoint gets re-submitted. Duplicates are
/// harmless — the event loop discards ids at or below the checkpoint.
async fn patrol_once(ctx: &ProcessorContext, vp: &VoteProcessor) {
    if !ctx.health.is_healthy() {
        return;
    }
    let start = vp.last_processed();
    match ctx.store.votes_after(start, PATROL_BATCH).await {
        Ok(votes) if !votes.is_empty() => {
            let current = vp.last_processed();
            let missed: Vec<VoteRecord> =
                votes.into_iter().filter(|vote| vote.id > current).collect();
            if !missed.is_empty() {
                info!("patroller: re-enqueueing {} missed votes", missed.len());
                patrol_requeued.add(missed.len() as u64, &[]);
                for vote in missed {
                    vp.submit(vote);
                }
            }
        }
        Ok(_) => (),
        Err(err) => warn!("patroller scan failed: {}", err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         shutdown drain                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Graceful shutdown: one last patrol, close the intake, move everything into the reorder buffer
/// & apply as far as the ids run contiguous. The forceful handle aborts the drain outright.
async fn drain(
    ctx: &ProcessorContext,
    vp: &VoteProcessor,
    rx: &mut mpsc::Receiver<VoteRecord>,
    heap: &mut ReorderBuffer,
    forceful: &Handle,
) {
    patrol_once(ctx, vp).await;
    if forceful.is_cancelled() {
        return;
    }

    rx.close();
    while let Ok(vote) = rx.try_recv() {
        if vote.id > vp.last_processed() {
            heap.push(Reverse(OrderedVote(vote)));
        }
    }

    loop {
        if forceful.is_cancelled() {
            warn!("vote processor: drain interrupted by forceful shutdown");
            return;
        }
        let last = vp.last_processed();
        while let Some(Reverse(top)) = heap.peek() {
            if top.0.id <= last {
                heap.pop();
            } else {
                break;
            }
        }
        let contiguous = matches!(heap.peek(), Some(Reverse(top)) if top.0.id == last + 1);
        if !contiguous {
            // Empty, or a gap we can't close anymore; the next startup's patroller will.
            return;
        }
        let vote = heap.pop().map(|Reverse(v)| v.0).expect("peeked just above");
        match apply(ctx, &vote).await {
            Ok(()) => {
                vp.set_last_processed(vote.id);
                votes_applied.add(1, &[]);
            }
            Err(err) => {
                warn!("drain: giving up on vote {}: {}", vote.id, err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn the_reorder_buffer_is_a_min_heap_by_id() {
        let mut heap: ReorderBuffer = BinaryHeap::new();
        for id in [5i64, 1, 3] {
            heap.push(Reverse(OrderedVote(VoteRecord {
                id,
                item_a: "a".into(),
                item_b: "b".into(),
                outcome: VoteOutcome::AWins,
                user: String::new(),
                multiplier: 1.0,
                vote_time: chrono::Utc::now(),
            })));
        }
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|Reverse(v)| v.0.id)).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }
}
