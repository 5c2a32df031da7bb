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

//! # application state & startup priming

use std::sync::Arc;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::info;

use crate::{
    cache::Backend,
    catalog::{self, Catalog},
    elo::{self, EloTracker},
    health::{self, HealthStatus},
    ip_limiter::{self, IpLimiter},
    processor::VoteProcessor,
    replay::{self, ReplayGate},
    report::ReportService,
    selector::PairSelector,
    snapshot::Snapshotter,
    storage::{self, Store},
    token::Secret,
    users::{ActivationQueue, Users},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("User priming failed: {source}"))]
    Users {
        source: crate::users::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Item priming failed: {source}"))]
    Items {
        source: catalog::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Metadata priming failed: {source}"))]
    Metadata {
        source: health::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Replay-defense priming failed: {source}"))]
    Replay {
        source: replay::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("IP-window priming failed: {source}"))]
    IpWindows {
        source: ip_limiter::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("ELO tracker priming failed: {source}"))]
    Tracker {
        source: elo::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Durable log access failed while priming: {source}"))]
    Durable {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Application state available to every handler
pub struct Duelrank {
    pub cache: Arc<dyn Backend>,
    pub store: Store,
    pub catalog: Arc<Catalog>,
    pub selector: PairSelector,
    pub tracker: EloTracker,
    pub secret: Secret,
    pub replay: Arc<ReplayGate>,
    pub ip_limiter: Arc<IpLimiter>,
    pub users: Arc<Users>,
    pub activation: ActivationQueue,
    pub health: Arc<HealthStatus>,
    pub processor: Arc<VoteProcessor>,
    pub snapshotter: Arc<Snapshotter>,
    pub reports: Arc<ReportService>,
    pub registry: prometheus::Registry,
    pub image_base_url: String,
}

/// One-time startup priming, run single-threaded before any worker or handler exists
///
/// Order matters: user rows are healed from the vote log first (the cache warmups aggregate over
/// them), then the cache tier is rebuilt wholesale from the durable snapshot, then the auxiliary
/// structures. The vote processor is *not* started here — its patroller's first pass replays
/// whatever the snapshot didn't cover.
pub async fn prime(
    cache: &dyn Backend,
    store: &Store,
    catalog: &Catalog,
    tracker: &EloTracker,
    users: &Users,
    replay: &ReplayGate,
    ip_limiter: &IpLimiter,
) -> Result<()> {
    info!("priming application state");

    // Heal the users table from the vote log; a crash can leave votes from uuids that never got
    // activated.
    let voters = store.distinct_vote_users().await.context(DurableSnafu)?;
    store.insert_users(&voters).await.context(DurableSnafu)?;

    health::warm_metadata(cache, store).await.context(MetadataSnafu)?;
    users.warm(store).await.context(UsersSnafu)?;
    catalog.warm(store, cache).await.context(ItemsSnafu)?;
    replay.initialize().await.context(ReplaySnafu)?;
    ip_limiter.rebuild(store).await.context(IpWindowsSnafu)?;

    let scores = catalog.scores_from_cache(cache).await.context(ItemsSnafu)?;
    tracker.reset_direct(&scores).await.context(TrackerSnafu)?;

    info!("application state primed");
    Ok(())
}
