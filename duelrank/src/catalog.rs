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

//! # the item catalog
//!
//! The process-local, read-only item catalog, loaded once at startup: two parallel arrays
//! (`index → id`, `index → static info`) plus the `id → index` map. Indices are assigned by
//! insertion order and used as array/tree indices everywhere except client-visible APIs.
//!
//! The catalog also owns the one *mutable* structure keyed by index: the segment tree of selection
//! weights (`1/(total + 5)` — cold items get picked more). The pair selector reads it under the
//! read lock; the vote processor and warm rebuild write under the write lock. That lock doubles as
//! the "item repository lock" of the wider design: the processor holds it for the entire span of
//! one vote's cache-plus-tree mutation so the selector never observes a half-applied vote.

use std::collections::HashMap;

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    cache::{self, Backend, Op},
    entities::{ItemId, ItemInfo, ItemStats},
    storage::{self, Store},
    tree::{self, SegmentTree},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The item catalog is empty; seed the items table before starting"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("Failed to build the weight tree: {source}"))]
    Tree {
        source: tree::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to load the catalog: {source}"))]
    Load {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to warm the cache tier: {source}"))]
    Warm {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize item stats: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Additive smoothing in the cold-priority weight `1/(total + COLD_WEIGHT_OFFSET)`; tunable, no
/// derivation claimed
pub const COLD_WEIGHT_OFFSET: f64 = 5.0;

/// Selection weight for an item that has played `total` weighted matches
pub fn weight_for_total(total: f64) -> f64 {
    1.0 / (total + COLD_WEIGHT_OFFSET)
}

pub struct Catalog {
    id_to_index: HashMap<ItemId, usize>,
    index_to_id: Vec<ItemId>,
    index_to_info: Vec<ItemInfo>,
    weights: RwLock<SegmentTree>,
}

impl Catalog {
    /// Build the catalog from the durable log's `items` table
    pub async fn load(store: &Store) -> Result<Catalog> {
        let rows = store.load_items().await.context(LoadSnafu)?;
        if rows.is_empty() {
            return EmptySnafu.fail();
        }
        let mut id_to_index = HashMap::with_capacity(rows.len());
        let mut index_to_id = Vec::with_capacity(rows.len());
        let mut index_to_info = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            id_to_index.insert(row.id.clone(), index);
            index_to_id.push(row.id);
            index_to_info.push(row.info);
        }
        let weights = SegmentTree::new(index_to_id.len()).context(TreeSnafu)?;
        info!("item catalog loaded: {} items", index_to_id.len());
        Ok(Catalog {
            id_to_index,
            index_to_id,
            index_to_info,
            weights: RwLock::new(weights),
        })
    }

    pub fn len(&self) -> usize {
        self.index_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_id.is_empty()
    }

    pub fn index_of(&self, id: &ItemId) -> Option<usize> {
        self.id_to_index.get(id).copied()
    }

    pub fn id_at(&self, index: usize) -> Option<&ItemId> {
        self.index_to_id.get(index)
    }

    pub fn info_at(&self, index: usize) -> Option<&ItemInfo> {
        self.index_to_info.get(index)
    }

    pub fn info_of(&self, id: &ItemId) -> Option<&ItemInfo> {
        self.index_of(id).and_then(|i| self.info_at(i))
    }

    /// The weight tree; readers are the pair selector, writers the vote processor & warm rebuild
    pub fn weights(&self) -> &RwLock<SegmentTree> {
        &self.weights
    }

    /// Push the durable snapshot's dynamic item state into the cache tier & rebuild the weight
    /// tree from the same snapshot
    ///
    /// No locking here: callers run this either during single-threaded startup or under the
    /// repository write lock during warm rebuild.
    pub async fn warm(&self, store: &Store, cache: &dyn Backend) -> Result<()> {
        let rows = store.load_items().await.context(LoadSnafu)?;
        let mut ops = vec![Op::Del {
            keys: vec![
                cache::ITEM_STATS_KEY.to_owned(),
                cache::ITEM_RANKING_KEY.to_owned(),
            ],
        }];
        let mut stats_entries = Vec::with_capacity(rows.len());
        let mut ranking_entries = Vec::with_capacity(rows.len());
        let mut initial_weights = vec![0.0; self.len()];
        for row in &rows {
            stats_entries.push((
                row.id.to_string(),
                serde_json::to_string(&row.stats).context(SerSnafu)?,
            ));
            ranking_entries.push((row.stats.rank_score, row.id.to_string()));
            if let Some(index) = self.index_of(&row.id) {
                initial_weights[index] = weight_for_total(row.stats.total);
            }
        }
        ops.push(Op::HSet {
            key: cache::ITEM_STATS_KEY.to_owned(),
            entries: stats_entries,
        });
        ops.push(Op::ZAdd {
            key: cache::ITEM_RANKING_KEY.to_owned(),
            entries: ranking_entries,
        });
        cache.exec(ops).await.context(WarmSnafu)?;

        self.weights
            .write()
            .await
            .rebuild(&initial_weights)
            .context(TreeSnafu)?;
        info!("warmed {} items into the cache tier", rows.len());
        Ok(())
    }

    /// Current scores of every item, straight from the cache's stats hash
    pub async fn scores_from_cache(&self, cache: &dyn Backend) -> Result<Vec<f64>> {
        let pairs = cache
            .run(Op::HGetAll {
                key: cache::ITEM_STATS_KEY.to_owned(),
            })
            .await
            .context(WarmSnafu)?
            .into_pairs()
            .context(WarmSnafu)?;
        Ok(pairs
            .into_iter()
            .filter_map(|(_, json)| serde_json::from_str::<ItemStats>(&json).ok())
            .map(|stats| stats.score)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cold_items_weigh_more() {
        assert_eq!(weight_for_total(0.0), 0.2);
        assert!(weight_for_total(0.0) > weight_for_total(1.0));
        assert!(weight_for_total(10.0) > weight_for_total(100.0));
    }

    #[tokio::test]
    async fn load_and_warm() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        for id in ["w", "x", "y"] {
            store
                .insert_item(
                    &ItemId::from(id),
                    &ItemInfo {
                        name: id.to_uppercase(),
                        description: String::new(),
                        sprite: format!("{id}.png"),
                        kind: 0,
                    },
                )
                .await
                .unwrap();
        }
        let catalog = Catalog::load(&store).await.unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.index_of(&ItemId::from("x")), Some(1));
        assert_eq!(catalog.id_at(2), Some(&ItemId::from("y")));
        assert!(catalog.index_of(&ItemId::from("zzz")).is_none());

        let cache = cache::InMemory::new();
        catalog.warm(&store, &cache).await.unwrap();
        // Fresh items: every weight is 1/5, total 3/5.
        let tree = catalog.weights().read().await;
        assert!((tree.total_sum() - 0.6).abs() < 1e-12);
        drop(tree);
        let ranked = cache
            .run(Op::ZRevRange {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                start: 0,
                stop: -1,
            })
            .await
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(ranked.len(), 3);
    }

    #[tokio::test]
    async fn empty_catalog_is_a_startup_error() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        assert!(matches!(Catalog::load(&store).await, Err(Error::Empty { .. })));
    }
}
