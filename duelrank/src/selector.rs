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

//! # pair selection
//!
//! Dealing the next matchup is a two-stage weighted draw:
//!
//! 1. **Cold priority.** The first candidate is drawn from the segment tree of per-item weights
//!    `1/(total + 5)` — items that have played less get dealt more, so coverage stays even.
//!
//! 2. **Strength proximity.** The second candidate is drawn by *rank offset* from the first: a
//!    precomputed Gaussian-ish kernel `G[d] = P^((d/(N−1))²)` concentrates mass near the first
//!    pick, blended with a uniform distribution by a mixture factor that ramps up as total votes
//!    accumulate. Early on the matchups are uniform (we don't trust ranks yet); as votes pour in,
//!    matchups tighten toward peers, where a comparison carries the most information.
//!
//! Both stages support excluding the caller's currently-displayed pair: excluded mass is removed
//! from the draw interval up front, and the draw skips over the excluded positions. Floating-point
//! edge cases (a draw landing exactly on an excluded boundary) are resolved by a short linear walk.
//!
//! The selected pair is stamped with a time-ordered pair id and an HMAC over
//! `(pair_id, id_A, id_B)`; see [crate::token].

use rand::Rng;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use uuid::Uuid;

use crate::{
    cache::{self, Backend, Op},
    catalog::Catalog,
    entities::ItemId,
    token::{self, PairToken, Secret},
    tree,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Pair selection requires at least two items; the catalog has {count}"))]
    NotEnoughItems { count: usize, backtrace: Backtrace },
    #[snafu(display("Excluded item {id} is not in the catalog"))]
    UnknownExclude { id: ItemId, backtrace: Backtrace },
    #[snafu(display("No selectable item remains after exclusions"))]
    Exhausted { backtrace: Backtrace },
    #[snafu(display("Cache query failed during pair selection: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Weight-tree lookup failed: {source}"))]
    Tree {
        source: tree::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Item {id} is missing from the ranking set"))]
    MissingRank { id: ItemId, backtrace: Backtrace },
    #[snafu(display("The live total-vote counter is missing"))]
    NoTotalVotes { backtrace: Backtrace },
    #[snafu(display("Failed to sign the pair token: {source}"))]
    Token {
        source: token::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kernel floor: the weight of the farthest rank offset relative to the nearest; tunable, no
/// derivation claimed
const GAUSSIAN_FLOOR: f64 = 0.2;
/// Mixture factor `f(M) = MIXTURE_BASE + MIXTURE_RATE · M/N`, clamped to [0, 1]
const MIXTURE_BASE: f64 = -0.1;
const MIXTURE_RATE: f64 = 0.01;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        GaussianMatcher                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Precomputed rank-offset weight table for the strength-proximity stage
///
/// Offsets are signed, ±1…±(N−1); the table is laid out negative side first, so offset `d` lives
/// at index `N−1+d` for `d<0` and `N−2+d` for `d>0` (there is no slot for `d = 0` — an item can't
/// be matched against itself). All queries are in *mixed* space: `f·G[d] + (1−f)·1`, so the
/// mixture never has to be materialized.
pub struct GaussianMatcher {
    weights: Vec<f64>,
    prefix: Vec<f64>,
    item_count: usize,
}

impl GaussianMatcher {
    pub fn new(item_count: usize) -> GaussianMatcher {
        if item_count <= 1 {
            return GaussianMatcher {
                weights: Vec::new(),
                prefix: Vec::new(),
                item_count,
            };
        }
        let max_diff = (item_count - 1) as f64;
        let mut weights = vec![0.0; 2 * (item_count - 1)];
        for i in 1..item_count {
            let weight = GAUSSIAN_FLOOR.powf((i as f64 / max_diff).powi(2));
            weights[item_count + i - 2] = weight; // d > 0
            weights[item_count - i - 1] = weight; // d < 0
        }
        let mut prefix = vec![0.0; weights.len()];
        let mut sum = 0.0;
        for (i, w) in weights.iter().enumerate() {
            sum += w;
            prefix[i] = sum;
        }
        GaussianMatcher {
            weights,
            prefix,
            item_count,
        }
    }

    /// How much the kernel dominates the uniform distribution, given `total_votes` across
    /// `item_count` items
    pub fn mixture_factor(&self, total_votes: f64) -> f64 {
        if self.item_count == 0 {
            return 0.0;
        }
        (MIXTURE_BASE + MIXTURE_RATE * (total_votes / self.item_count as f64)).clamp(0.0, 1.0)
    }

    fn index_of(&self, rank_diff: i64) -> i64 {
        let n = self.item_count as i64;
        if rank_diff > 0 {
            n - 2 + rank_diff
        } else {
            n - 1 + rank_diff
        }
    }

    /// Mixed weight of one rank offset
    pub fn mixed_weight(&self, rank_diff: i64, factor: f64) -> f64 {
        if rank_diff == 0 || self.item_count <= 1 {
            return 0.0;
        }
        let index = self.index_of(rank_diff);
        if index < 0 || index >= self.weights.len() as i64 {
            return 1.0 - factor;
        }
        factor * self.weights[index as usize] + (1.0 - factor)
    }

    /// Mixed prefix sum through `rank_diff`, inclusive
    pub fn mixed_prefix_sum(&self, rank_diff: i64, factor: f64) -> f64 {
        if rank_diff == 0 || self.item_count <= 1 {
            return 0.0;
        }
        let mut index = self.index_of(rank_diff);
        if index < 0 {
            return 0.0;
        }
        if index >= self.prefix.len() as i64 {
            index = self.prefix.len() as i64 - 1;
        }
        factor * self.prefix[index as usize] + (1.0 - factor) * (index + 1) as f64
    }

    /// Invert a mixed prefix sum back to a rank offset
    pub fn find_rank_offset(&self, target: f64, factor: f64) -> i64 {
        if self.item_count <= 1 {
            return 0;
        }
        let index = partition_by(&self.prefix, |i, prefix| {
            factor * prefix + (1.0 - factor) * (i + 1) as f64 >= target
        });
        let n = self.item_count as i64;
        let index = index as i64;
        if index < n - 1 {
            index - (n - 1)
        } else {
            index - (n - 1) + 1
        }
    }
}

/// Smallest index whose (index, value) satisfies `pred`; `len` if none does
fn partition_by<F: Fn(usize, f64) -> bool>(values: &[f64], pred: F) -> usize {
    let (mut lo, mut hi) = (0usize, values.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid, values[mid]) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          selection                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One side of a dealt pair; `rank` is 1-based (1 = current best)
#[derive(Clone, Debug)]
pub struct PairCandidate {
    pub id: ItemId,
    pub rank: i64,
}

/// A dealt matchup, ready to hand to the client
#[derive(Clone, Debug)]
pub struct SelectedPair {
    pub item_a: PairCandidate,
    pub item_b: PairCandidate,
    pub pair_id: String,
    pub signature: String,
}

pub struct PairSelector {
    matcher: GaussianMatcher,
}

impl PairSelector {
    pub fn new(item_count: usize) -> PairSelector {
        PairSelector {
            matcher: GaussianMatcher::new(item_count),
        }
    }

    pub fn matcher(&self) -> &GaussianMatcher {
        &self.matcher
    }

    /// Deal the next pair
    ///
    /// `exclude` is the caller's currently-displayed pair (both or neither; the HTTP layer
    /// enforces that). The catalog's weight-tree read lock is held across both stages so a
    /// concurrently-applied vote can't skew the draw mid-flight.
    pub async fn select(
        &self,
        catalog: &Catalog,
        cache: &dyn Backend,
        secret: &Secret,
        exclude: Option<(ItemId, ItemId)>,
    ) -> Result<SelectedPair> {
        let item_count = catalog.len();
        if item_count < 2 {
            return NotEnoughItemsSnafu { count: item_count }.fail();
        }

        let excludes = match &exclude {
            None => None,
            Some((a, b)) => {
                let ia = catalog
                    .index_of(a)
                    .context(UnknownExcludeSnafu { id: a.clone() })?;
                let ib = catalog
                    .index_of(b)
                    .context(UnknownExcludeSnafu { id: b.clone() })?;
                Some((ia, ib))
            }
        };

        let tree = catalog.weights().read().await;

        // --- stage one: cold-priority draw over the weight tree ---
        let first_index = {
            let mut total = tree.total_sum();
            let mut skips: Vec<(usize, f64)> = Vec::new();
            if let Some((ia, ib)) = excludes {
                let wa = tree.query(ia).context(TreeSnafu)?;
                let wb = tree.query(ib).context(TreeSnafu)?;
                total -= wa + wb;
                skips = vec![(ia, wa), (ib, wb)];
                skips.sort_by_key(|(i, _)| *i);
            }
            if total <= 0.0 {
                return ExhaustedSnafu.fail();
            }
            let mut draw = rand::thread_rng().gen::<f64>() * total;
            // Walk the excluded indices in ascending order, shifting the draw past each one it
            // clears; this keeps the draw uniform over the *non-excluded* mass.
            for (index, weight) in &skips {
                let prefix_before = if *index == 0 {
                    0.0
                } else {
                    tree.prefix_sum(index - 1).context(TreeSnafu)?
                };
                if draw >= prefix_before {
                    draw += weight;
                }
            }
            let mut candidate = tree.find(draw).context(TreeSnafu)?;
            if let Some((ia, ib)) = excludes {
                let mut fuel = 2;
                while candidate == ia || candidate == ib {
                    if fuel == 0 {
                        return ExhaustedSnafu.fail();
                    }
                    fuel -= 1;
                    candidate = (candidate + 1) % item_count;
                }
            }
            candidate
        };
        let first_id = catalog.id_at(first_index).expect("index came from the tree").clone();

        // --- stage two: strength-proximity draw over rank offsets ---
        let mut ops = vec![Op::ZRevRank {
            key: cache::ITEM_RANKING_KEY.to_owned(),
            member: first_id.to_string(),
        }];
        if let Some((a, b)) = &exclude {
            ops.push(Op::ZRevRank {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                member: a.to_string(),
            });
            ops.push(Op::ZRevRank {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                member: b.to_string(),
            });
        }
        ops.push(Op::Get {
            key: cache::TOTAL_VOTES_KEY.to_owned(),
        });
        let mut replies = cache.exec(ops).await.context(CacheSnafu)?.into_iter();

        let first_rank = replies
            .next()
            .and_then(|v| v.opt_int().ok().flatten())
            .context(MissingRankSnafu {
                id: first_id.clone(),
            })?;
        let mut excluded_ranks: Vec<i64> = Vec::new();
        if let Some((a, b)) = &exclude {
            for id in [a, b] {
                excluded_ranks.push(
                    replies
                        .next()
                        .and_then(|v| v.opt_int().ok().flatten())
                        .context(MissingRankSnafu { id: id.clone() })?,
                );
            }
        }
        let total_votes = replies
            .next()
            .and_then(|v| v.opt_text().ok().flatten())
            .and_then(|text| text.parse::<f64>().ok())
            .context(NoTotalVotesSnafu)?;

        let factor = self.matcher.mixture_factor(total_votes);
        let min_mixed = self.matcher.mixed_prefix_sum(-first_rank, factor);
        let max_mixed = self
            .matcher
            .mixed_prefix_sum((item_count as i64 - 1) - first_rank, factor);
        let mut total_mixed = max_mixed - min_mixed;
        for rank in &excluded_ranks {
            total_mixed -= self.matcher.mixed_weight(rank - first_rank, factor);
        }

        // Nb. when the first pick holds the bottom rank, `total_mixed` can go non-positive; the
        // draw then collapses onto the lowest offset & the collision walk below takes over. The
        // inversion is a plain binary search, so nothing here can go out of range.
        let mut draw = rand::thread_rng().gen::<f64>() * total_mixed + min_mixed;
        excluded_ranks.sort_unstable();
        for rank in &excluded_ranks {
            let rank_diff = rank - first_rank;
            // The offset just before `rank_diff` in table order; offset 0 doesn't exist, so the
            // predecessor of +1 is −1.
            let pre_diff = if rank_diff == 1 { -1 } else { rank_diff - 1 };
            if draw >= self.matcher.mixed_prefix_sum(pre_diff, factor) {
                draw += self.matcher.mixed_weight(rank_diff, factor);
            }
        }

        let offset = self.matcher.find_rank_offset(draw, factor);
        let mut second_rank = (first_rank + offset).clamp(0, item_count as i64 - 1);

        // Collisions (the first pick itself, or an excluded rank) come from floating-point edge
        // cases; resolve by walking forward a bounded number of steps.
        let mut forbidden = excluded_ranks.clone();
        forbidden.push(first_rank);
        let mut fuel = if exclude.is_some() { 3 } else { 1 };
        while forbidden.contains(&second_rank) {
            if fuel == 0 {
                return ExhaustedSnafu.fail();
            }
            fuel -= 1;
            second_rank = (second_rank + 1) % item_count as i64;
        }

        let second_id = cache
            .run(Op::ZRevRange {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                start: second_rank,
                stop: second_rank,
            })
            .await
            .context(CacheSnafu)?
            .into_list()
            .context(CacheSnafu)?
            .into_iter()
            .next()
            .map(ItemId::new)
            .context(ExhaustedSnafu)?;

        drop(tree);

        let (mut first, mut second) = (
            PairCandidate {
                id: first_id,
                rank: first_rank + 1,
            },
            PairCandidate {
                id: second_id,
                rank: second_rank + 1,
            },
        );
        if rand::thread_rng().gen_bool(0.5) {
            std::mem::swap(&mut first, &mut second);
        }

        let pair_id = Uuid::now_v7().to_string();
        let payload = PairToken {
            pair_id: pair_id.clone(),
            item_a: first.id.clone(),
            item_b: second.id.clone(),
        };
        let signature = token::sign(secret, &payload).context(TokenSnafu)?;
        SelectedPair {
            item_a: first,
            item_b: second,
            pair_id,
            signature,
        }
        .pipe(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kernel_is_symmetric_and_decaying() {
        let m = GaussianMatcher::new(5);
        // Offsets ±1…±4, laid out [-4, -3, -2, -1, +1, +2, +3, +4].
        assert_eq!(m.weights.len(), 8);
        for d in 1..=4i64 {
            assert_eq!(m.mixed_weight(d, 1.0), m.mixed_weight(-d, 1.0));
        }
        assert!(m.mixed_weight(1, 1.0) > m.mixed_weight(2, 1.0));
        assert!(m.mixed_weight(3, 1.0) > m.mixed_weight(4, 1.0));
        // The farthest offset carries exactly the floor weight.
        assert!((m.mixed_weight(4, 1.0) - GAUSSIAN_FLOOR).abs() < 1e-12);
    }

    #[test]
    fn fully_uniform_mixture_weighs_everything_equally() {
        let m = GaussianMatcher::new(6);
        for d in [-5i64, -2, 1, 3, 5] {
            assert_eq!(m.mixed_weight(d, 0.0), 1.0);
        }
        // Prefix sums in uniform space just count slots.
        assert_eq!(m.mixed_prefix_sum(-1, 0.0), 5.0);
        assert_eq!(m.mixed_prefix_sum(5, 0.0), 10.0);
    }

    #[test]
    fn mixture_factor_ramps_with_votes() {
        let m = GaussianMatcher::new(100);
        assert_eq!(m.mixture_factor(0.0), 0.0);
        // f = −0.1 + 0.01·M/N.
        assert!((m.mixture_factor(2000.0) - 0.1).abs() < 1e-12);
        assert_eq!(m.mixture_factor(1_000_000.0), 1.0);
    }

    #[test]
    fn find_rank_offset_inverts_prefix_sums() {
        let m = GaussianMatcher::new(4);
        for factor in [0.0, 0.3, 1.0] {
            for d in [-3i64, -2, -1, 1, 2, 3] {
                let pre = if d == -3 {
                    0.0
                } else if d == 1 {
                    m.mixed_prefix_sum(-1, factor)
                } else {
                    m.mixed_prefix_sum(d - 1, factor)
                };
                let target = pre + 0.5 * m.mixed_weight(d, factor);
                assert_eq!(m.find_rank_offset(target, factor), d, "factor {factor} d {d}");
            }
        }
    }

    #[test]
    fn degenerate_catalogs_do_not_panic() {
        let m = GaussianMatcher::new(1);
        assert_eq!(m.mixed_weight(1, 0.5), 0.0);
        assert_eq!(m.mixed_prefix_sum(1, 0.5), 0.0);
        assert_eq!(m.find_rank_offset(0.5, 0.5), 0);
    }
}
