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

//! # duelrank models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: the item catalog entry, the mutable per-item statistics that live in the cache
//! tier, the vote event that is the unit of the durable log, and the per-user tallies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a recognized vote outcome"))]
    BadOutcome { text: String, backtrace: Backtrace },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The stable, client-visible identifier of an item in the catalog
///
/// Items are referenced from many structures (the ranking set, the stats hash, the segment tree,
/// vote events); none of those structures "owns" the item. Everything is keyed either by this
/// identifier or by the item's startup-assigned index into the catalog. A newtype keeps us from
/// mixing item ids up with the (equally stringly-typed) user uuids.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new<S: Into<String>>(s: S) -> ItemId {
        ItemId(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> ItemId {
        ItemId(s.to_owned())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      catalog & statistics                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Static, immutable-post-startup information about an item
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ItemInfo {
    pub name: String,
    pub description: String,
    /// Opaque asset handle; the HTTP layer turns this into an image URL
    pub sprite: String,
    /// Integer tag carried over from the source data
    #[serde(rename = "type")]
    pub kind: i64,
}

/// Mutable per-item statistics, resident in the cache tier's stats hash as JSON
///
/// `rank_score` is a pure function of (`score`, `total`, `win`) and the current global
/// (min, max) ELO; see [crate::elo::rank_score].
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ItemStats {
    pub score: f64,
    pub total: f64,
    pub win: f64,
    #[serde(rename = "rankScore")]
    pub rank_score: f64,
}

/// ELO every item starts from
pub const INITIAL_SCORE: f64 = 1500.0;

impl ItemStats {
    pub fn fresh() -> ItemStats {
        ItemStats {
            score: INITIAL_SCORE,
            ..Default::default()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          vote events                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The result of a single pairwise comparison
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VoteOutcome {
    #[serde(rename = "A_WINS")]
    AWins,
    #[serde(rename = "B_WINS")]
    BWins,
    #[serde(rename = "DRAW")]
    Draw,
    #[serde(rename = "SKIP")]
    Skip,
}

impl VoteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOutcome::AWins => "A_WINS",
            VoteOutcome::BWins => "B_WINS",
            VoteOutcome::Draw => "DRAW",
            VoteOutcome::Skip => "SKIP",
        }
    }
}

impl std::str::FromStr for VoteOutcome {
    type Err = Error;
    fn from_str(s: &str) -> Result<VoteOutcome, Error> {
        match s {
            "A_WINS" => Ok(VoteOutcome::AWins),
            "B_WINS" => Ok(VoteOutcome::BWins),
            "DRAW" => Ok(VoteOutcome::Draw),
            "SKIP" => Ok(VoteOutcome::Skip),
            _ => BadOutcomeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

impl std::fmt::Display for VoteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A vote event as read back from the durable log
///
/// `id` is assigned by the log (autoincrement) and gives vote events their total order; the vote
/// processor applies events to the cache strictly in ascending `id` order.
#[derive(Clone, Debug, PartialEq)]
pub struct VoteRecord {
    pub id: i64,
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub outcome: VoteOutcome,
    /// Opaque client uuid; empty for anonymous votes
    pub user: String,
    pub multiplier: f64,
    pub vote_time: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         user statistics                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-user vote tallies, resident in the cache tier's user-stats hash as JSON
///
/// The reserved field `_total_` of that hash carries the same shape covering *all* votes,
/// anonymous ones included.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UserStats {
    pub wins: i64,
    pub draw: i64,
    pub skip: i64,
}

impl UserStats {
    pub fn total(&self) -> i64 {
        self.wins + self.draw + self.skip
    }
    /// Fold one outcome into the tally
    pub fn record(&mut self, outcome: VoteOutcome) {
        match outcome {
            VoteOutcome::AWins | VoteOutcome::BWins => self.wins += 1,
            VoteOutcome::Draw => self.draw += 1,
            VoteOutcome::Skip => self.skip += 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outcome_round_trips_through_json() {
        let o: VoteOutcome = serde_json::from_str("\"A_WINS\"").unwrap();
        assert_eq!(o, VoteOutcome::AWins);
        assert!(serde_json::from_str::<VoteOutcome>("\"A_LOSES\"").is_err());
        assert_eq!(serde_json::to_string(&VoteOutcome::Skip).unwrap(), "\"SKIP\"");
    }

    #[test]
    fn stats_serialize_with_the_cache_field_names() {
        let stats = ItemStats {
            score: 1500.0,
            total: 2.0,
            win: 1.0,
            rank_score: 0.5,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"rankScore\":0.5"), "{}", json);
    }

    #[test]
    fn user_stats_tally() {
        let mut stats = UserStats::default();
        stats.record(VoteOutcome::AWins);
        stats.record(VoteOutcome::BWins);
        stats.record(VoteOutcome::Draw);
        stats.record(VoteOutcome::Skip);
        assert_eq!(
            stats,
            UserStats {
                wins: 2,
                draw: 1,
                skip: 1
            }
        );
        assert_eq!(stats.total(), 4);
    }
}
