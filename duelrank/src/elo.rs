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

//! # ELO scoring
//!
//! The scoring math, and a small tracker for the global (min, max) ELO.
//!
//! The ranking key (`rank_score`) is *not* the raw ELO: it's a blend of the item's ELO normalized
//! against the global min/max, and its raw win rate, with the blend shifting toward pure ELO as
//! the item accumulates matches. That normalization is why the tracker exists: a vote that moves
//! the sole holder of the global minimum or maximum (a *boundary change*) invalidates every item's
//! rank score at once, and the vote processor has to know the instant that happens.
//!
//! The tracker's update path is transactional: the vote processor speculatively mutates it, stages
//! its cache writes, and rolls the tracker back if those writes fail. [TrackerTx] holds the
//! tracker's lock for the transaction's lifetime and restores the pre-image on drop unless
//! [TrackerTx::commit] was called.

use std::sync::Arc;

use snafu::{Backtrace, Snafu};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resetting the ELO tracker requires at least one score"))]
    NoScores { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// K-factor: how hard a single match swings the score
pub const K_FACTOR: f64 = 32.0;

/// Weighting base & decay for the normalized-ELO share of the rank score: the share is
/// `1.2 − 0.01·total`, clamped to [0, 1]
const ELO_WEIGHT_BASE: f64 = 1.2;
const ELO_WEIGHT_DECAY: f64 = 0.01;

/// The winner's expected score against the loser
pub fn expected_win(winner_score: f64, loser_score: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((loser_score - winner_score) / 400.0))
}

/// New (winner, loser) scores after a decisive match of weight `multiplier`
pub fn elo_after(winner_score: f64, loser_score: f64, multiplier: f64) -> (f64, f64) {
    let expected = expected_win(winner_score, loser_score);
    (
        winner_score + K_FACTOR * (1.0 - expected) * multiplier,
        loser_score - K_FACTOR * expected * multiplier,
    )
}

/// Share of the rank score contributed by normalized ELO, as a function of matches played
pub fn elo_weight(total: f64) -> f64 {
    (ELO_WEIGHT_BASE - ELO_WEIGHT_DECAY * total).clamp(0.0, 1.0)
}

/// The ranking key: normalized ELO blended with raw win rate
///
/// With fixed (min, max): monotone non-decreasing in `score` at fixed (total, win), and in `win`
/// at fixed (score, total).
pub fn rank_score(min_score: f64, max_score: f64, score: f64, total: f64, win: f64) -> f64 {
    let weight = elo_weight(total);
    let normalized = if max_score == min_score {
        0.5
    } else {
        (score - min_score) / (max_score - min_score)
    };
    let win_rate = if total == 0.0 { 0.5 } else { win / total };
    normalized * weight + win_rate * (1.0 - weight)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          EloTracker                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct TrackerData {
    min_score: f64,
    min_count: u32,
    max_score: f64,
    max_count: u32,
}

/// Tracks the global (min, max) ELO and how many items attain each
#[derive(Clone, Default)]
pub struct EloTracker {
    data: Arc<Mutex<TrackerData>>,
}

/// One transactional update of the tracker
///
/// Holds the tracker's lock exclusively. Dropping without [commit](TrackerTx::commit) restores
/// the state captured at [EloTracker::begin].
pub struct TrackerTx {
    guard: OwnedMutexGuard<TrackerData>,
    backup: TrackerData,
    committed: bool,
}

impl EloTracker {
    pub fn new() -> EloTracker {
        EloTracker::default()
    }

    /// Open a transaction; the returned handle owns the tracker's lock until commit or drop
    pub async fn begin(&self) -> TrackerTx {
        let guard = self.data.clone().lock_owned().await;
        let backup = *guard;
        TrackerTx {
            guard,
            backup,
            committed: false,
        }
    }

    /// Reset outside of any transaction (single-threaded startup path)
    pub async fn reset_direct(&self, scores: &[f64]) -> Result<()> {
        let mut guard = self.data.lock().await;
        *guard = scan(scores)?;
        Ok(())
    }
}

fn scan(scores: &[f64]) -> Result<TrackerData> {
    let first = *scores.first().ok_or_else(|| NoScoresSnafu.build())?;
    let mut data = TrackerData {
        min_score: first,
        min_count: 0,
        max_score: first,
        max_count: 0,
    };
    for &score in scores {
        if score < data.min_score {
            data.min_score = score;
            data.min_count = 1;
        } else if score == data.min_score {
            data.min_count += 1;
        }
        if score > data.max_score {
            data.max_score = score;
            data.max_count = 1;
        } else if score == data.max_score {
            data.max_count += 1;
        }
    }
    Ok(data)
}

impl TrackerTx {
    /// Re-scan all scores from scratch
    pub fn reset(&mut self, scores: &[f64]) -> Result<()> {
        *self.guard = scan(scores)?;
        Ok(())
    }

    /// Fold one score change in; true means the global boundary moved & every rank score is stale
    ///
    /// When the change *vacates* a boundary (the last holder of the min or max moved), the new
    /// score is deliberately not folded in — the caller must [reset](TrackerTx::reset) from the
    /// full score set anyway, since the tracker can't know the runner-up.
    pub fn update(&mut self, old_score: f64, new_score: f64) -> bool {
        if old_score == new_score {
            return false;
        }

        if old_score == self.guard.min_score {
            self.guard.min_count -= 1;
            if self.guard.min_count == 0 {
                return true;
            }
        } else if old_score == self.guard.max_score {
            self.guard.max_count -= 1;
            if self.guard.max_count == 0 {
                return true;
            }
        }

        if new_score < self.guard.min_score || new_score > self.guard.max_score {
            return true;
        }
        if new_score == self.guard.min_score {
            self.guard.min_count += 1;
        } else if new_score == self.guard.max_score {
            self.guard.max_count += 1;
        }
        false
    }

    pub fn min_max(&self) -> (f64, f64) {
        (self.guard.min_score, self.guard.max_score)
    }

    /// Mark the transaction successful; the lock is released on drop
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TrackerTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = self.backup;
            warn!("ELO tracker transaction not committed; state rolled back");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn the_plain_win_case() {
        // Two fresh items at 1500: winner takes 16, loser gives 16.
        let (w, l) = elo_after(1500.0, 1500.0, 1.0);
        assert_eq!(w, 1516.0);
        assert_eq!(l, 1484.0);
        // Weighted by a down-rated multiplier.
        let (w, l) = elo_after(1500.0, 1500.0, 0.5);
        assert_eq!(w, 1508.0);
        assert_eq!(l, 1492.0);
    }

    #[test]
    fn rank_score_degenerate_cases() {
        // All scores equal, no matches: dead center.
        assert_eq!(rank_score(1500.0, 1500.0, 1500.0, 0.0, 0.0), 0.5);
        // Weight clamps to 1 below 20 matches: pure normalized ELO.
        assert_eq!(rank_score(1400.0, 1600.0, 1600.0, 10.0, 10.0), 1.0);
        // At 120 matches the weight clamps to 0: pure win rate.
        assert_eq!(rank_score(1400.0, 1600.0, 1400.0, 120.0, 60.0), 0.5);
    }

    #[test]
    fn rank_score_is_monotone() {
        let (min, max) = (1400.0, 1600.0);
        // In score, at fixed (total, win)...
        let mut last = f64::MIN;
        for i in 0..=20 {
            let score = 1400.0 + 10.0 * i as f64;
            let rs = rank_score(min, max, score, 30.0, 15.0);
            assert!(rs >= last);
            last = rs;
        }
        // ...and in win, at fixed (score, total).
        let mut last = f64::MIN;
        for win in 0..=30 {
            let rs = rank_score(min, max, 1500.0, 30.0, win as f64);
            assert!(rs >= last);
            last = rs;
        }
    }

    #[tokio::test]
    async fn tracker_counts_boundary_holders() {
        let tracker = EloTracker::new();
        tracker
            .reset_direct(&[1500.0, 1500.0, 1500.0])
            .await
            .unwrap();
        let mut tx = tracker.begin().await;
        assert_eq!(tx.min_max(), (1500.0, 1500.0));
        // 1516 exceeds the current maximum: boundary change.
        assert!(tx.update(1500.0, 1516.0));
        tx.reset(&[1516.0, 1500.0, 1500.0]).unwrap();
        assert_eq!(tx.min_max(), (1500.0, 1516.0));
        // A second item joining the existing maximum is quiet.
        assert!(!tx.update(1500.0, 1516.0));
        // The last item leaving the minimum vacates it.
        assert!(tx.update(1500.0, 1516.0));
        tx.commit();
    }

    #[tokio::test]
    async fn vacating_the_sole_max_is_a_boundary_change() {
        let tracker = EloTracker::new();
        tracker
            .reset_direct(&[1484.0, 1500.0, 1516.0])
            .await
            .unwrap();
        let mut tx = tracker.begin().await;
        // The only holder of 1516 moves: rebuild required.
        assert!(tx.update(1516.0, 1520.0));
        tx.reset(&[1484.0, 1500.0, 1520.0]).unwrap();
        assert_eq!(tx.min_max(), (1484.0, 1520.0));
        tx.commit();
    }

    #[tokio::test]
    async fn uncommitted_transactions_roll_back() {
        let tracker = EloTracker::new();
        tracker.reset_direct(&[1500.0, 1600.0]).await.unwrap();
        {
            let mut tx = tracker.begin().await;
            tx.reset(&[0.0, 1.0]).unwrap();
            assert_eq!(tx.min_max(), (0.0, 1.0));
            // Dropped uncommitted.
        }
        let tx = tracker.begin().await;
        assert_eq!(tx.min_max(), (1500.0, 1600.0));
        tx.commit();
    }

    #[tokio::test]
    async fn interior_moves_are_not_boundary_changes() {
        let tracker = EloTracker::new();
        tracker
            .reset_direct(&[1400.0, 1500.0, 1600.0])
            .await
            .unwrap();
        let mut tx = tracker.begin().await;
        assert!(!tx.update(1500.0, 1550.0));
        assert_eq!(tx.min_max(), (1400.0, 1600.0));
        tx.commit();
    }
}
