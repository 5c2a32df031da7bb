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

//! # the durable log
//!
//! The system of record: an embedded SQLite database holding the append-only vote log, periodic
//! snapshots of item & user state, consumed pair ids, and a small key-value metadata table. The
//! cache tier can be rebuilt from this store at any time (snapshot + incremental vote replay); the
//! reverse is never true.
//!
//! Two properties the rest of the crate leans on:
//!
//! 1. vote ids are assigned here, by the autoincrement `id` column, giving votes their total
//!    order;
//! 2. `SQLITE_BUSY`/`SQLITE_LOCKED` are *transient* — [Store::is_retryable] classifies them so
//!    callers can apply their bounded-retry policies rather than surfacing the error.

use chrono::{DateTime, Utc};
use snafu::{Backtrace, ResultExt, Snafu};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqlitePool,
};

use std::{str::FromStr, time::Duration};

use crate::{
    config::SqliteConfig,
    entities::{ItemId, ItemInfo, ItemStats, UserStats, VoteOutcome, VoteRecord},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to open the durable log: {source}"))]
    Open {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to apply migrations: {source}"))]
    Migrate {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Query against the durable log failed: {source}"))]
    Query {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Vote {id} carries an invalid outcome: {source}"))]
    BadRow {
        id: i64,
        source: crate::entities::Error,
    },
    #[snafu(display("Metadata value for {key} won't parse: {text}"))]
    BadMetadata {
        key: String,
        text: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Metadata key: id of the last vote included in the last successful snapshot
pub const LAST_SNAPSHOT_VOTE_ID_KEY: &str = "last_snapshot_vote_id";
/// Metadata key: weighted total votes (skips excluded) as of the last snapshot
pub const SNAPSHOT_TOTAL_VOTES_KEY: &str = "snapshot_total_votes";

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id       TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL DEFAULT '',
    description   TEXT NOT NULL DEFAULT '',
    sprite        TEXT NOT NULL DEFAULT '',
    type          INTEGER NOT NULL DEFAULT 0,
    score         REAL NOT NULL DEFAULT 1500.0,
    total         REAL NOT NULL DEFAULT 0.0,
    win           REAL NOT NULL DEFAULT 0.0,
    rank_score    REAL NOT NULL DEFAULT 0.0,
    rank          INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_items_rank ON items(rank);

CREATE TABLE IF NOT EXISTS users (
    uuid        TEXT PRIMARY KEY,
    wins_count  INTEGER NOT NULL DEFAULT 0,
    draw_count  INTEGER NOT NULL DEFAULT 0,
    skip_count  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS total_stats (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    wins_count  INTEGER NOT NULL DEFAULT 0,
    draw_count  INTEGER NOT NULL DEFAULT 0,
    skip_count  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS votes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    item_a_id       TEXT NOT NULL,
    item_b_id       TEXT NOT NULL,
    result          TEXT NOT NULL,
    user_identifier TEXT NOT NULL DEFAULT '',
    user_ip         TEXT NOT NULL DEFAULT '',
    multiplier      REAL NOT NULL DEFAULT 1.0,
    vote_time       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_votes_user ON votes(user_identifier);
CREATE INDEX IF NOT EXISTS idx_votes_time ON votes(vote_time);

CREATE TABLE IF NOT EXISTS used_pair_ids (
    pair_id     TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS metadata (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          row types                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One row of the `items` table: static info plus the last-snapshotted statistics
#[derive(Clone, Debug)]
pub struct ItemRow {
    pub id: ItemId,
    pub info: ItemInfo,
    pub stats: ItemStats,
    pub rank: i64,
}

/// The slice of an item row the snapshot engine writes back
#[derive(Clone, Debug)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub stats: ItemStats,
    pub rank: i64,
}

/// A vote event not yet assigned an id
#[derive(Clone, Debug)]
pub struct NewVote<'a> {
    pub item_a: &'a ItemId,
    pub item_b: &'a ItemId,
    pub outcome: VoteOutcome,
    pub user: &'a str,
    pub user_ip: &'a str,
    pub multiplier: f64,
    pub vote_time: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Store                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle on the durable log; cheap to clone (it's a pool)
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(cfg: &SqliteConfig) -> Result<Store> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", cfg.file_name))
            .context(OpenSnafu)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(250))
            .pragma("cache_size", format!("-{}", cfg.max_cache_size_kb));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context(OpenSnafu)?;
        Ok(Store { pool })
    }

    /// An in-memory store for the test suites
    pub async fn open_in_memory() -> Result<Store> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").context(OpenSnafu)?;
        // A single connection: every handle must see the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context(OpenSnafu)?;
        Ok(Store { pool })
    }

    /// Apply schema migrations; idempotent, run at every startup
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATIONS)
            .execute(&self.pool)
            .await
            .context(MigrateSnafu)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Transient locking error, worth a short retry?
    pub fn is_retryable(err: &Error) -> bool {
        fn busy(err: &sqlx::Error) -> bool {
            matches!(err, sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("5") | Some("6")))
        }
        match err {
            Error::Query { source, .. } => busy(source),
            Error::Open { source, .. } | Error::Migrate { source, .. } => busy(source),
            _ => false,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                          items                                             //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Load the full catalog in insertion order; index `i` in the returned vector is the item's
    /// process-wide index
    pub async fn load_items(&self) -> Result<Vec<ItemRow>> {
        let rows = sqlx::query(
            "SELECT item_id, name, description, sprite, type, score, total, win, rank_score, rank \
             FROM items ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(rows
            .into_iter()
            .map(|row| ItemRow {
                id: ItemId::new(row.get::<String, _>("item_id")),
                info: ItemInfo {
                    name: row.get("name"),
                    description: row.get("description"),
                    sprite: row.get("sprite"),
                    kind: row.get("type"),
                },
                stats: ItemStats {
                    score: row.get("score"),
                    total: row.get("total"),
                    win: row.get("win"),
                    rank_score: row.get("rank_score"),
                },
                rank: row.get("rank"),
            })
            .collect())
    }

    /// Seed the catalog; used by import tooling & the test suites
    pub async fn insert_item(&self, id: &ItemId, info: &ItemInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO items (item_id, name, description, sprite, type, score) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (item_id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(&info.name)
        .bind(&info.description)
        .bind(&info.sprite)
        .bind(info.kind)
        .bind(crate::entities::INITIAL_SCORE)
        .execute(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(())
    }

    /// Upsert item statistics within `tx` (the snapshot transaction)
    pub async fn upsert_item_snapshots(
        tx: &mut sqlx::SqliteConnection,
        items: &[ItemSnapshot],
    ) -> Result<()> {
        for item in items {
            sqlx::query(
                "UPDATE items SET score = ?, total = ?, win = ?, rank_score = ?, rank = ? \
                 WHERE item_id = ?",
            )
            .bind(item.stats.score)
            .bind(item.stats.total)
            .bind(item.stats.win)
            .bind(item.stats.rank_score)
            .bind(item.rank)
            .bind(item.id.as_str())
            .execute(&mut *tx)
            .await
            .context(QuerySnafu)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                          votes                                             //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Append one vote event; returns the assigned id
    pub async fn append_vote(&self, vote: &NewVote<'_>) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO votes (item_a_id, item_b_id, result, user_identifier, user_ip, \
             multiplier, vote_time) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(vote.item_a.as_str())
        .bind(vote.item_b.as_str())
        .bind(vote.outcome.as_str())
        .bind(vote.user)
        .bind(vote.user_ip)
        .bind(vote.multiplier)
        .bind(vote.vote_time)
        .fetch_one(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(row.get::<i64, _>("id"))
    }

    fn vote_from_row(row: sqlx::sqlite::SqliteRow) -> Result<VoteRecord> {
        let id: i64 = row.get("id");
        let outcome: String = row.get("result");
        Ok(VoteRecord {
            id,
            item_a: ItemId::new(row.get::<String, _>("item_a_id")),
            item_b: ItemId::new(row.get::<String, _>("item_b_id")),
            outcome: outcome.parse().context(BadRowSnafu { id })?,
            user: row.get("user_identifier"),
            multiplier: row.get("multiplier"),
            vote_time: row.get("vote_time"),
        })
    }

    /// Scan vote events with `id > after`, ascending, up to `limit` rows
    pub async fn votes_after(&self, after: i64, limit: i64) -> Result<Vec<VoteRecord>> {
        sqlx::query(
            "SELECT id, item_a_id, item_b_id, result, user_identifier, multiplier, vote_time \
             FROM votes WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu)?
        .into_iter()
        .map(Self::vote_from_row)
        .collect()
    }

    /// (ip, vote time) of every vote since `since`; feeds the IP-window rebuild
    pub async fn vote_ips_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = sqlx::query("SELECT user_ip, vote_time FROM votes WHERE vote_time > ?")
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .context(QuerySnafu)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_ip"), row.get("vote_time")))
            .collect())
    }

    /// A user's vote history up to (and including) vote `max_id`, ascending
    pub async fn votes_by_user(&self, user: &str, max_id: i64) -> Result<Vec<VoteRecord>> {
        sqlx::query(
            "SELECT id, item_a_id, item_b_id, result, user_identifier, multiplier, vote_time \
             FROM votes WHERE user_identifier = ? AND id <= ? ORDER BY id ASC",
        )
        .bind(user)
        .bind(max_id)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu)?
        .into_iter()
        .map(Self::vote_from_row)
        .collect()
    }

    /// Every distinct non-empty uuid appearing in the vote log
    pub async fn distinct_vote_users(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT user_identifier FROM votes WHERE user_identifier != ''")
                .fetch_all(&self.pool)
                .await
                .context(QuerySnafu)?;
        Ok(rows.into_iter().map(|row| row.get("user_identifier")).collect())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                          users                                             //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Create a user row; Ok(false) if the uuid already existed
    pub async fn insert_user(&self, uuid: &str) -> Result<bool> {
        let result = sqlx::query("INSERT INTO users (uuid) VALUES (?) ON CONFLICT DO NOTHING")
            .bind(uuid)
            .execute(&self.pool)
            .await
            .context(QuerySnafu)?;
        Ok(result.rows_affected() > 0)
    }

    /// Idempotently create a batch of user rows
    pub async fn insert_users(&self, uuids: &[String]) -> Result<()> {
        for uuid in uuids {
            self.insert_user(uuid).await?;
        }
        Ok(())
    }

    /// Page through users by uuid, ascending; `after` is exclusive
    pub async fn users_page(&self, after: &str, limit: i64) -> Result<Vec<(String, UserStats)>> {
        let rows = sqlx::query(
            "SELECT uuid, wins_count, draw_count, skip_count FROM users \
             WHERE uuid > ? ORDER BY uuid ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("uuid"),
                    UserStats {
                        wins: row.get("wins_count"),
                        draw: row.get("draw_count"),
                        skip: row.get("skip_count"),
                    },
                )
            })
            .collect())
    }

    /// Upsert user statistics within the snapshot transaction
    pub async fn upsert_users(
        tx: &mut sqlx::SqliteConnection,
        users: &[(String, UserStats)],
    ) -> Result<()> {
        for (uuid, stats) in users {
            sqlx::query(
                "INSERT INTO users (uuid, wins_count, draw_count, skip_count) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (uuid) DO UPDATE SET wins_count = excluded.wins_count, \
                 draw_count = excluded.draw_count, skip_count = excluded.skip_count, \
                 updated_at = datetime('now')",
            )
            .bind(uuid)
            .bind(stats.wins)
            .bind(stats.draw)
            .bind(stats.skip)
            .execute(&mut *tx)
            .await
            .context(QuerySnafu)?;
        }
        Ok(())
    }

    /// The community-wide tallies (anonymous votes included)
    pub async fn total_stats(&self) -> Result<UserStats> {
        let row = sqlx::query(
            "SELECT wins_count, draw_count, skip_count FROM total_stats WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(row
            .map(|row| UserStats {
                wins: row.get("wins_count"),
                draw: row.get("draw_count"),
                skip: row.get("skip_count"),
            })
            .unwrap_or_default())
    }

    pub async fn upsert_total_stats(
        tx: &mut sqlx::SqliteConnection,
        stats: &UserStats,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO total_stats (id, wins_count, draw_count, skip_count) \
             VALUES (1, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET wins_count = excluded.wins_count, \
             draw_count = excluded.draw_count, skip_count = excluded.skip_count",
        )
        .bind(stats.wins)
        .bind(stats.draw)
        .bind(stats.skip)
        .execute(&mut *tx)
        .await
        .context(QuerySnafu)?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        pair ids                                            //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Insert a consumed pair id within `tx`; Ok(false) means it was already present
    pub async fn try_insert_used_pair(
        tx: &mut sqlx::SqliteConnection,
        pair_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO used_pair_ids (pair_id) VALUES (?) ON CONFLICT DO NOTHING",
        )
        .bind(pair_id)
        .execute(&mut *tx)
        .await
        .context(QuerySnafu)?;
        Ok(result.rows_affected() > 0)
    }

    /// Page through consumed pair ids, ascending; `after` is exclusive
    pub async fn used_pair_ids_page(&self, after: &str, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT pair_id FROM used_pair_ids WHERE pair_id > ? ORDER BY pair_id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu)?;
        Ok(rows.into_iter().map(|row| row.get("pair_id")).collect())
    }

    /// Wipe the consumed-pair table (pair tokens don't survive a process restart)
    pub async fn clear_used_pair_ids(&self) -> Result<()> {
        sqlx::query("DELETE FROM used_pair_ids")
            .execute(&self.pool)
            .await
            .context(QuerySnafu)?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        metadata                                            //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub async fn metadata(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(QuerySnafu)?;
        Ok(row.map(|row| row.get("value")))
    }

    pub async fn set_metadata(
        tx: &mut sqlx::SqliteConnection,
        key: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .context(QuerySnafu)?;
        Ok(())
    }

    pub async fn last_snapshot_vote_id(&self) -> Result<i64> {
        match self.metadata(LAST_SNAPSHOT_VOTE_ID_KEY).await? {
            None => Ok(0),
            Some(text) => text.parse().ok().ok_or_else(|| {
                BadMetadataSnafu {
                    key: LAST_SNAPSHOT_VOTE_ID_KEY,
                    text,
                }
                .build()
            }),
        }
    }

    pub async fn snapshot_total_votes(&self) -> Result<f64> {
        match self.metadata(SNAPSHOT_TOTAL_VOTES_KEY).await? {
            None => Ok(0.0),
            Some(text) => text.parse().ok().ok_or_else(|| {
                BadMetadataSnafu {
                    key: SNAPSHOT_TOTAL_VOTES_KEY,
                    text,
                }
                .build()
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::VoteOutcome;

    async fn fresh() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = fresh().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn votes_are_totally_ordered() {
        let store = fresh().await;
        let (a, b) = (ItemId::from("w"), ItemId::from("x"));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .append_vote(&NewVote {
                        item_a: &a,
                        item_b: &b,
                        outcome: VoteOutcome::AWins,
                        user: "",
                        user_ip: "10.0.0.1",
                        multiplier: 1.0,
                        vote_time: Utc::now(),
                    })
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(ids, vec![1, 2, 3]);
        let scanned = store.votes_after(1, 10).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].id, 2);
        assert_eq!(scanned[1].id, 3);
        assert_eq!(scanned[0].item_a, a);
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let store = fresh().await;
        assert_eq!(store.last_snapshot_vote_id().await.unwrap(), 0);
        let mut tx = store.pool().begin().await.unwrap();
        Store::set_metadata(&mut tx, LAST_SNAPSHOT_VOTE_ID_KEY, "42")
            .await
            .unwrap();
        Store::set_metadata(&mut tx, SNAPSHOT_TOTAL_VOTES_KEY, "17.5")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.last_snapshot_vote_id().await.unwrap(), 42);
        assert_eq!(store.snapshot_total_votes().await.unwrap(), 17.5);
    }

    #[tokio::test]
    async fn used_pair_ids_are_one_shot() {
        let store = fresh().await;
        let mut tx = store.pool().begin().await.unwrap();
        assert!(Store::try_insert_used_pair(&mut tx, "pair-1").await.unwrap());
        assert!(!Store::try_insert_used_pair(&mut tx, "pair-1").await.unwrap());
        tx.commit().await.unwrap();
        let page = store.used_pair_ids_page("", 10).await.unwrap();
        assert_eq!(page, vec!["pair-1"]);
        store.clear_used_pair_ids().await.unwrap();
        assert!(store.used_pair_ids_page("", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_upserts() {
        let store = fresh().await;
        assert!(store.insert_user("u1").await.unwrap());
        assert!(!store.insert_user("u1").await.unwrap());
        let mut tx = store.pool().begin().await.unwrap();
        Store::upsert_users(
            &mut tx,
            &[(
                "u1".to_owned(),
                UserStats {
                    wins: 3,
                    draw: 1,
                    skip: 2,
                },
            )],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        let page = store.users_page("", 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].1.wins, 3);
    }
}
