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

//! # per-user reports
//!
//! Read-only derivations over a user's vote history: tallies, percentile among voters, a few
//! statistical tendencies, a few highlights. Two modes:
//!
//! - **live** — the cache tier supplies current tallies & ranks, the durable log supplies the
//!   vote history (bounded by the live checkpoint, so the two agree);
//! - **mirror** — when the cache is unhealthy, a lazily-populated in-process mirror of the last
//!   durable snapshot stands in. It's flushed when the cache recovers.
//!
//! Produced reports are cached in the cache tier for one minute per user; generating one walks
//! the user's entire history and there's no need to do that on every poll.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    cache::{self, Backend, Op},
    catalog::Catalog,
    entities::{ItemId, UserStats, VoteOutcome, VoteRecord},
    health::HealthStatus,
    storage::{self, Store},
    users::{Users, TOTAL_STATS_FIELD},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache read failed while building a report: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Durable read failed while building a report: {source}"))]
    Durable {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How long a produced report stays good; hard-coded next to its sibling thresholds rather than
/// surfaced in config
pub const REPORT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Minimum total votes before decision rates are reported
const MIN_VOTES_FOR_DECISION_RATE: i64 = 5;
/// Minimum decisive votes before tendency figures are reported
const MIN_WINS_FOR_TENDENCY: i64 = 5;
/// Minimum times an item must be picked to qualify as "most chosen"
const MIN_WINS_FOR_MOST_CHOSEN: i64 = 2;
/// Minimum votes in a day for it to qualify as the busiest
const MIN_VOTES_FOR_BUSIEST_DAY: i64 = 5;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChoiceCounts {
    pub wins: i64,
    pub draw: i64,
    pub skip: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MostChosen {
    pub id: ItemId,
    pub name: String,
    pub count: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstVote {
    pub at: DateTime<Utc>,
    pub item_a: ItemId,
    pub item_b: ItemId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusiestDay {
    pub day: String,
    pub count: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReport {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_votes: i64,
    pub choices: ChoiceCounts,
    /// Position among voters by vote count, as a fraction; 1.0 for users with no history
    pub vote_rank_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_decision_rate: Option<f64>,
    /// Share of the user's decisive votes that agreed with the community ranking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_consistency_index: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_chosen: Option<MostChosen>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_vote: Option<FirstVote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busiest_day: Option<BusiestDay>,
}

impl UserReport {
    fn empty(user_id: &str) -> UserReport {
        UserReport {
            user_id: user_id.to_owned(),
            generated_at: Utc::now(),
            total_votes: 0,
            choices: ChoiceCounts::default(),
            vote_rank_percent: 1.0,
            decision_rate: None,
            community_decision_rate: None,
            community_consistency_index: None,
            most_chosen: None,
            first_vote: None,
            busiest_day: None,
        }
    }
}

/// The lazily-populated stand-in for the cache tier, built from the last durable snapshot
struct Mirror {
    snapshot_vote_id: i64,
    user_stats: HashMap<String, UserStats>,
    user_rank: HashMap<String, i64>,
    total_voters: i64,
    total_stats: UserStats,
    item_rank: HashMap<String, i64>,
}

pub struct ReportService {
    cache: Arc<dyn Backend>,
    store: Store,
    catalog: Arc<Catalog>,
    users: Arc<Users>,
    health: Arc<HealthStatus>,
    mirror: Mutex<Option<Mirror>>,
}

impl ReportService {
    pub fn new(
        cache: Arc<dyn Backend>,
        store: Store,
        catalog: Arc<Catalog>,
        users: Arc<Users>,
        health: Arc<HealthStatus>,
    ) -> ReportService {
        ReportService {
            cache,
            store,
            catalog,
            users,
            health,
            mirror: Mutex::new(None),
        }
    }

    /// Drop the mirror; called when the cache recovers so the next degraded spell re-snapshots
    pub async fn clear_mirror(&self) {
        *self.mirror.lock().await = None;
    }

    pub async fn generate(&self, user_id: &str) -> Result<UserReport> {
        if user_id.is_empty() {
            return Ok(UserReport::empty(user_id));
        }
        if self.health.is_healthy() {
            self.generate_live(user_id).await
        } else {
            self.generate_from_mirror(user_id).await
        }
    }

    async fn generate_live(&self, user_id: &str) -> Result<UserReport> {
        // Cached?
        if let Ok(value) = self
            .cache
            .run(Op::HGet {
                key: cache::REPORT_CACHE_KEY.to_owned(),
                field: user_id.to_owned(),
            })
            .await
        {
            if let Ok(Some(json)) = value.opt_text() {
                if let Ok(report) = serde_json::from_str::<UserReport>(&json) {
                    debug!("report cache hit for {}", user_id);
                    return Ok(report);
                }
            }
        }

        let (checkpoint, stats, total_stats, rank_percent, item_rank) = {
            let _users = self.users.lock().read().await;
            let mut replies = self
                .cache
                .exec(vec![
                    Op::Get {
                        key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
                    },
                    Op::HMGet {
                        key: cache::USER_STATS_KEY.to_owned(),
                        fields: vec![user_id.to_owned(), TOTAL_STATS_FIELD.to_owned()],
                    },
                    Op::ZRank {
                        key: cache::USER_RANKING_KEY.to_owned(),
                        member: user_id.to_owned(),
                    },
                    Op::ZCard {
                        key: cache::USER_RANKING_KEY.to_owned(),
                    },
                    Op::ZRevRange {
                        key: cache::ITEM_RANKING_KEY.to_owned(),
                        start: 0,
                        stop: -1,
                    },
                ])
                .await
                .context(CacheSnafu)?
                .into_iter();

            let checkpoint = replies
                .next()
                .and_then(|v| v.opt_text().ok().flatten())
                .and_then(|text| text.parse::<i64>().ok())
                .unwrap_or(0);
            let mut user_replies = replies
                .next()
                .map(|v| v.into_opt_list())
                .transpose()
                .context(CacheSnafu)?
                .unwrap_or_default()
                .into_iter();
            let stats: Option<UserStats> = user_replies
                .next()
                .flatten()
                .and_then(|json| serde_json::from_str(&json).ok());
            let total_stats: UserStats = user_replies
                .next()
                .flatten()
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            let rank = replies.next().and_then(|v| v.opt_int().ok().flatten());
            let voters = replies
                .next()
                .and_then(|v| v.into_int().ok())
                .unwrap_or(0);
            let ranking = replies
                .next()
                .map(|v| v.into_list())
                .transpose()
                .context(CacheSnafu)?
                .unwrap_or_default();
            let item_rank: HashMap<String, i64> = ranking
                .into_iter()
                .enumerate()
                .map(|(position, id)| (id, position as i64 + 1))
                .collect();
            let rank_percent = match (rank, voters) {
                (Some(rank), voters) if voters > 0 => rank as f64 / voters as f64,
                _ => 1.0,
            };
            (checkpoint, stats, total_stats, rank_percent, item_rank)
        };

        let Some(stats) = stats else {
            return Ok(UserReport::empty(user_id));
        };
        let votes = self
            .store
            .votes_by_user(user_id, checkpoint)
            .await
            .context(DurableSnafu)?;

        let report = build_report(
            user_id,
            &stats,
            &total_stats,
            rank_percent,
            &votes,
            &item_rank,
            &self.catalog,
        );

        if let Ok(json) = serde_json::to_string(&report) {
            let outcome = self
                .cache
                .exec(vec![
                    Op::HSet {
                        key: cache::REPORT_CACHE_KEY.to_owned(),
                        entries: vec![(user_id.to_owned(), json)],
                    },
                    Op::HExpire {
                        key: cache::REPORT_CACHE_KEY.to_owned(),
                        ttl: REPORT_CACHE_TTL,
                        fields: vec![user_id.to_owned()],
                    },
                ])
                .await;
            if let Err(err) = outcome {
                warn!("failed to cache report for {}: {}", user_id, err);
            }
        }
        Ok(report)
    }

    async fn generate_from_mirror(&self, user_id: &str) -> Result<UserReport> {
        let mut guard = self.mirror.lock().await;
        if guard.is_none() {
            *guard = Some(self.populate_mirror().await?);
        }
        let mirror = guard.as_ref().expect("just populated");

        let Some(stats) = mirror.user_stats.get(user_id).copied() else {
            return Ok(UserReport::empty(user_id));
        };
        let rank_percent = if mirror.total_voters > 0 {
            mirror.user_rank.get(user_id).copied().unwrap_or(0) as f64
                / mirror.total_voters as f64
        } else {
            1.0
        };
        let votes = self
            .store
            .votes_by_user(user_id, mirror.snapshot_vote_id)
            .await
            .context(DurableSnafu)?;
        Ok(build_report(
            user_id,
            &stats,
            &mirror.total_stats,
            rank_percent,
            &votes,
            &mirror.item_rank,
            &self.catalog,
        ))
    }

    async fn populate_mirror(&self) -> Result<Mirror> {
        let snapshot_vote_id = self
            .store
            .last_snapshot_vote_id()
            .await
            .context(DurableSnafu)?;
        let total_stats = self.store.total_stats().await.context(DurableSnafu)?;

        let mut user_stats = HashMap::new();
        let mut after = String::new();
        loop {
            let page = self.store.users_page(&after, 10_000).await.context(DurableSnafu)?;
            if page.is_empty() {
                break;
            }
            let len = page.len();
            after = page.last().expect("page is non-empty").0.clone();
            user_stats.extend(page);
            if len < 10_000 {
                break;
            }
        }
        // Ascending by vote count, as the live ranking set would order them.
        let mut by_votes: Vec<(&String, i64)> = user_stats
            .iter()
            .map(|(uuid, stats)| (uuid, stats.total()))
            .collect();
        by_votes.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));
        let user_rank: HashMap<String, i64> = by_votes
            .into_iter()
            .enumerate()
            .map(|(position, (uuid, _))| (uuid.clone(), position as i64))
            .collect();

        let item_rank: HashMap<String, i64> = self
            .store
            .load_items()
            .await
            .context(DurableSnafu)?
            .into_iter()
            .map(|row| (row.id.to_string(), row.rank))
            .collect();

        debug!(
            "report mirror populated at snapshot vote {} ({} users)",
            snapshot_vote_id,
            user_stats.len()
        );
        Ok(Mirror {
            snapshot_vote_id,
            total_voters: user_stats.len() as i64,
            user_stats,
            user_rank,
            total_stats,
            item_rank,
        })
    }
}

fn decision_rate(stats: &UserStats) -> f64 {
    let total = stats.total();
    if total == 0 {
        return 0.0;
    }
    (stats.wins as f64 + stats.draw as f64 * 0.5) / total as f64
}

fn build_report(
    user_id: &str,
    stats: &UserStats,
    total_stats: &UserStats,
    rank_percent: f64,
    votes: &[VoteRecord],
    item_rank: &HashMap<String, i64>,
    catalog: &Catalog,
) -> UserReport {
    let mut report = UserReport::empty(user_id);
    report.total_votes = stats.total();
    report.choices = ChoiceCounts {
        wins: stats.wins,
        draw: stats.draw,
        skip: stats.skip,
    };
    report.vote_rank_percent = rank_percent;

    if report.total_votes >= MIN_VOTES_FOR_DECISION_RATE {
        report.decision_rate = Some(decision_rate(stats));
        report.community_decision_rate = Some(decision_rate(total_stats));
    }

    if stats.wins >= MIN_WINS_FOR_TENDENCY {
        let mut decisive = 0i64;
        let mut consistent = 0i64;
        for vote in votes {
            let (winner, loser) = match vote.outcome {
                VoteOutcome::AWins => (&vote.item_a, &vote.item_b),
                VoteOutcome::BWins => (&vote.item_b, &vote.item_a),
                _ => continue,
            };
            let (Some(wr), Some(lr)) = (
                item_rank.get(winner.as_str()),
                item_rank.get(loser.as_str()),
            ) else {
                continue;
            };
            decisive += 1;
            if wr < lr {
                consistent += 1;
            }
        }
        if decisive > 0 {
            report.community_consistency_index = Some(consistent as f64 / decisive as f64);
        }
    }

    let mut chosen: HashMap<&ItemId, i64> = HashMap::new();
    for vote in votes {
        match vote.outcome {
            VoteOutcome::AWins => *chosen.entry(&vote.item_a).or_default() += 1,
            VoteOutcome::BWins => *chosen.entry(&vote.item_b).or_default() += 1,
            _ => (),
        }
    }
    if let Some((id, count)) = chosen
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
    {
        if count >= MIN_WINS_FOR_MOST_CHOSEN {
            report.most_chosen = Some(MostChosen {
                id: (*id).clone(),
                name: catalog
                    .info_of(id)
                    .map(|info| info.name.clone())
                    .unwrap_or_default(),
                count,
            });
        }
    }

    if let Some(first) = votes.first() {
        report.first_vote = Some(FirstVote {
            at: first.vote_time,
            item_a: first.item_a.clone(),
            item_b: first.item_b.clone(),
        });
    }

    let mut per_day: HashMap<String, i64> = HashMap::new();
    for vote in votes {
        *per_day
            .entry(vote.vote_time.date_naive().to_string())
            .or_default() += 1;
    }
    if let Some((day, count)) = per_day
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    {
        if count >= MIN_VOTES_FOR_BUSIEST_DAY {
            report.busiest_day = Some(BusiestDay { day, count });
        }
    }

    report
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::ItemInfo;
    use crate::storage::Store;

    async fn catalog() -> Arc<Catalog> {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        for id in ["w", "x"] {
            store
                .insert_item(
                    &ItemId::from(id),
                    &ItemInfo {
                        name: id.to_uppercase(),
                        description: String::new(),
                        sprite: String::new(),
                        kind: 0,
                    },
                )
                .await
                .unwrap();
        }
        Arc::new(Catalog::load(&store).await.unwrap())
    }

    fn vote(id: i64, a: &str, b: &str, outcome: VoteOutcome, hours_ago: i64) -> VoteRecord {
        VoteRecord {
            id,
            item_a: ItemId::from(a),
            item_b: ItemId::from(b),
            outcome,
            user: "u1".to_owned(),
            multiplier: 1.0,
            vote_time: Utc::now() - chrono::Duration::hours(hours_ago),
        }
    }

    #[test]
    fn decision_rate_counts_draws_by_half() {
        let stats = UserStats {
            wins: 3,
            draw: 2,
            skip: 1,
        };
        assert!((decision_rate(&stats) - (4.0 / 6.0)).abs() < 1e-12);
        assert_eq!(decision_rate(&UserStats::default()), 0.0);
    }

    #[tokio::test]
    async fn thresholds_suppress_thin_data() {
        let catalog = catalog().await;
        let stats = UserStats {
            wins: 1,
            draw: 0,
            skip: 0,
        };
        let votes = vec![vote(1, "w", "x", VoteOutcome::AWins, 1)];
        let report = build_report(
            "u1",
            &stats,
            &stats,
            0.5,
            &votes,
            &HashMap::new(),
            &catalog,
        );
        assert_eq!(report.total_votes, 1);
        assert!(report.decision_rate.is_none());
        assert!(report.community_consistency_index.is_none());
        assert!(report.most_chosen.is_none());
        assert!(report.busiest_day.is_none());
        assert!(report.first_vote.is_some());
    }

    #[tokio::test]
    async fn consistency_follows_the_community_ranking() {
        let catalog = catalog().await;
        let mut item_rank = HashMap::new();
        item_rank.insert("w".to_owned(), 1i64);
        item_rank.insert("x".to_owned(), 2i64);
        let stats = UserStats {
            wins: 6,
            draw: 0,
            skip: 0,
        };
        // Four with the favorite, two upsets; all on the same day.
        let votes: Vec<VoteRecord> = (0..6)
            .map(|i| {
                if i < 4 {
                    vote(i, "w", "x", VoteOutcome::AWins, 1)
                } else {
                    vote(i, "w", "x", VoteOutcome::BWins, 1)
                }
            })
            .collect();
        let report = build_report("u1", &stats, &stats, 0.1, &votes, &item_rank, &catalog);
        let index = report.community_consistency_index.unwrap();
        assert!((index - 4.0 / 6.0).abs() < 1e-12);
        let most = report.most_chosen.unwrap();
        assert_eq!(most.id, ItemId::from("w"));
        assert_eq!(most.name, "W");
        assert_eq!(most.count, 4);
        assert_eq!(report.busiest_day.unwrap().count, 6);
        assert!((report.decision_rate.unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn anonymous_users_get_the_empty_report() {
        let catalog = catalog().await;
        let cache: Arc<dyn Backend> = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let users = Arc::new(Users::new(cache.clone()));
        let health = Arc::new(HealthStatus::new());
        let service = ReportService::new(cache, store, catalog, users, health);
        let report = service.generate("").await.unwrap();
        assert_eq!(report.total_votes, 0);
        assert_eq!(report.vote_rank_percent, 1.0);
    }

    #[tokio::test]
    async fn the_mirror_serves_when_the_cache_is_down() {
        let catalog = catalog().await;
        let mem = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        // Durable snapshot state: one user with five decisive votes.
        let mut tx = store.pool().begin().await.unwrap();
        Store::upsert_users(
            &mut tx,
            &[(
                "u1".to_owned(),
                UserStats {
                    wins: 5,
                    draw: 0,
                    skip: 0,
                },
            )],
        )
        .await
        .unwrap();
        Store::set_metadata(&mut tx, storage::LAST_SNAPSHOT_VOTE_ID_KEY, "5")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        for i in 0..5 {
            store
                .append_vote(&crate::storage::NewVote {
                    item_a: &ItemId::from("w"),
                    item_b: &ItemId::from("x"),
                    outcome: VoteOutcome::AWins,
                    user: "u1",
                    user_ip: "10.0.0.1",
                    multiplier: 1.0,
                    vote_time: Utc::now() - chrono::Duration::hours(i),
                })
                .await
                .unwrap();
        }

        let users = Arc::new(Users::new(mem.clone()));
        let health = Arc::new(HealthStatus::new());
        // Drive the state machine to Degraded.
        health.set_initial_run_id(cache::RunId("r1".into()));
        health.assess(None);
        assert!(!health.is_healthy());

        let service =
            ReportService::new(mem.clone(), store, catalog, users, health.clone());
        let report = service.generate("u1").await.unwrap();
        assert_eq!(report.total_votes, 5);
        assert_eq!(report.choices.wins, 5);
        assert!(report.first_vote.is_some());

        service.clear_mirror().await;
    }
}
