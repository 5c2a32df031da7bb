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

//! # the IP limiter
//!
//! Votes aren't rejected by rate — they're *discounted*. Each submitting IP has a 24-hour sliding
//! window in the cache tier (a sorted set keyed by microsecond timestamp); a vote's multiplier
//! falls off from 1.0 once the window holds more than 200 entries, bottoming out at 0.01 past
//! 600. A single enthusiast keeps voting; a flooder stops mattering.
//!
//! Counting a vote and deciding its multiplier must happen *before* the vote is durably appended,
//! so the increment hands back a [Compensator]: if any later step of the submission fails, the
//! caller rolls the window entry back out. The compensator also pins a module-wide read lock that
//! the warm rebuild takes exclusively — compensation must never race with the window being
//! reconstructed from the durable log.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use snafu::{Backtrace, ResultExt, Snafu};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{error, info};

use crate::{
    cache::{self, Backend, Op},
    storage::{self, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A vote arrived without a client IP"))]
    MissingIp { backtrace: Backtrace },
    #[snafu(display("{ip} is not a valid IP address"))]
    InvalidIp { ip: String, backtrace: Backtrace },
    #[snafu(display("Failed to count the vote against {ip}: {source}"))]
    Count {
        ip: String,
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to rebuild the IP windows: {source}"))]
    Rebuild {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read recent votes from the durable log: {source}"))]
    RecentVotes {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The sliding window
pub fn window() -> ChronoDuration {
    ChronoDuration::hours(24)
}
/// Key TTL; a little past the window so idle keys age out on their own
const KEY_TTL: Duration = Duration::from_secs(25 * 60 * 60);

/// Votes within the window before any discount kicks in
pub const GRACE_THRESHOLD: i64 = 200;
/// Window count at which the linear decay bottoms out
pub const HARSH_THRESHOLD: i64 = 600;
/// Multiplier at the end of the decay ramp
const MULTIPLIER_AT_HARSH: f64 = 0.5;
/// Multiplier past the ramp
const CUTOFF_MULTIPLIER: f64 = 0.01;
const DECAY_SLOPE: f64 =
    (MULTIPLIER_AT_HARSH - 1.0) / ((HARSH_THRESHOLD - GRACE_THRESHOLD) as f64);

/// A vote's weight as a function of its IP's current window count
pub fn multiplier_for_count(count: i64) -> f64 {
    if count <= GRACE_THRESHOLD {
        1.0
    } else if count <= HARSH_THRESHOLD {
        1.0 + DECAY_SLOPE * (count - GRACE_THRESHOLD) as f64
    } else {
        CUTOFF_MULTIPLIER
    }
}

fn window_key(ip: &str) -> String {
    format!("{}{}", cache::IP_VOTES_KEY_PREFIX, ip)
}

/// A collision-resistant window member: 8 bytes of big-endian nanosecond timestamp followed by 8
/// random bytes, base64url-encoded
fn unique_member(at: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 16];
    let nanos = at.timestamp_nanos_opt().unwrap_or_default() as u64;
    bytes[..8].copy_from_slice(&nanos.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut bytes[8..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           IpLimiter                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct IpLimiter {
    cache: Arc<dyn Backend>,
    /// Increments take this shared; rebuild takes it exclusive
    rebuild_lock: Arc<RwLock<()>>,
}

/// Undo handle for one window increment
///
/// Holds the limiter's rebuild lock shared for its whole lifetime. Call [commit](Compensator::commit)
/// once the vote is durably recorded, or [rollback](Compensator::rollback) if anything downstream
/// failed.
pub struct Compensator {
    cache: Arc<dyn Backend>,
    key: String,
    member: String,
    _guard: OwnedRwLockReadGuard<()>,
}

impl IpLimiter {
    pub fn new(cache: Arc<dyn Backend>) -> IpLimiter {
        IpLimiter {
            cache,
            rebuild_lock: Arc::new(RwLock::new(())),
        }
    }

    /// Record one vote against `ip` at time `at`; returns the window count *including* this vote,
    /// plus the compensator that can take it back
    pub async fn increment(&self, ip: &str, at: DateTime<Utc>) -> Result<(i64, Compensator)> {
        if ip.is_empty() {
            return MissingIpSnafu.fail();
        }
        if ip.parse::<std::net::IpAddr>().is_err() {
            return InvalidIpSnafu { ip: ip.to_owned() }.fail();
        }

        let key = window_key(ip);
        let member = unique_member(at);
        let score = at.timestamp_micros() as f64;
        let horizon = (at - window()).timestamp_micros() as f64;

        let guard = self.rebuild_lock.clone().read_owned().await;

        let replies = self
            .cache
            .exec(vec![
                Op::ZRemRangeByScore {
                    key: key.clone(),
                    below: horizon,
                },
                Op::ZAdd {
                    key: key.clone(),
                    entries: vec![(score, member.clone())],
                },
                Op::Expire {
                    key: key.clone(),
                    ttl: KEY_TTL,
                },
                Op::ZCard { key: key.clone() },
            ])
            .await
            .context(CountSnafu { ip: ip.to_owned() })?;

        let count = replies
            .into_iter()
            .last()
            .and_then(|v| v.into_int().ok())
            .unwrap_or(0);

        Ok((
            count,
            Compensator {
                cache: self.cache.clone(),
                key,
                member,
                _guard: guard,
            },
        ))
    }

    /// Reconstruct every IP window from the durable log's recent votes
    ///
    /// Takes the rebuild lock exclusively, so no compensation is in flight while the windows are
    /// torn down & rebuilt.
    pub async fn rebuild(&self, store: &Store) -> Result<()> {
        let _guard = self.rebuild_lock.write().await;

        let recent = store
            .vote_ips_since(Utc::now() - window())
            .await
            .context(RecentVotesSnafu)?;

        let stale = self
            .cache
            .run(Op::ScanKeys {
                prefix: cache::IP_VOTES_KEY_PREFIX.to_owned(),
            })
            .await
            .context(RebuildSnafu)?
            .into_list()
            .context(RebuildSnafu)?;
        if !stale.is_empty() {
            self.cache
                .run(Op::Del { keys: stale })
                .await
                .context(RebuildSnafu)?;
        }

        if recent.is_empty() {
            info!("IP limiter: no recent votes to restore");
            return Ok(());
        }

        let mut per_key: std::collections::HashMap<String, Vec<(f64, String)>> =
            std::collections::HashMap::new();
        for (ip, at) in recent {
            if ip.is_empty() {
                continue;
            }
            per_key
                .entry(window_key(&ip))
                .or_default()
                .push((at.timestamp_micros() as f64, unique_member(at)));
        }

        let restored = per_key.len();
        let mut ops = Vec::with_capacity(2 * restored);
        for (key, entries) in per_key {
            ops.push(Op::ZAdd {
                key: key.clone(),
                entries,
            });
            ops.push(Op::Expire { key, ttl: KEY_TTL });
        }
        self.cache.exec(ops).await.context(RebuildSnafu)?;
        info!("IP limiter: restored windows for {} IPs", restored);
        Ok(())
    }
}

impl Compensator {
    /// The vote was durably recorded; the window entry stands
    pub fn commit(self) {}

    /// Something downstream failed; take the window entry back out
    pub async fn rollback(self) {
        if let Err(err) = self
            .cache
            .run(Op::ZRem {
                key: self.key.clone(),
                member: self.member.clone(),
            })
            .await
        {
            error!(
                "IP vote compensation failed for {} member {}: {}",
                self.key, self.member, err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::{ItemId, VoteOutcome};
    use crate::storage::NewVote;

    #[test]
    fn the_multiplier_curve() {
        assert_eq!(multiplier_for_count(0), 1.0);
        assert_eq!(multiplier_for_count(200), 1.0);
        // One past the grace threshold: 1 − 0.5/400.
        assert!((multiplier_for_count(201) - 0.99875).abs() < 1e-12);
        assert!((multiplier_for_count(400) - 0.75).abs() < 1e-12);
        assert!((multiplier_for_count(600) - 0.5).abs() < 1e-12);
        assert_eq!(multiplier_for_count(601), 0.01);
        assert_eq!(multiplier_for_count(1_000_000), 0.01);
    }

    #[tokio::test]
    async fn counts_within_the_window() {
        let cache = Arc::new(cache::InMemory::new());
        let limiter = IpLimiter::new(cache.clone());
        let now = Utc::now();
        for expected in 1..=5 {
            let (count, comp) = limiter.increment("10.1.2.3", now).await.unwrap();
            assert_eq!(count, expected);
            comp.commit();
        }
        // A different IP has its own window.
        let (count, comp) = limiter.increment("10.1.2.4", now).await.unwrap();
        assert_eq!(count, 1);
        comp.commit();
    }

    #[tokio::test]
    async fn old_entries_age_out() {
        let cache = Arc::new(cache::InMemory::new());
        let limiter = IpLimiter::new(cache.clone());
        let start = Utc::now();
        for _ in 0..3 {
            let (_, comp) = limiter.increment("10.0.0.1", start).await.unwrap();
            comp.commit();
        }
        // A vote a day-and-a-bit later sees only itself.
        let (count, comp) = limiter
            .increment("10.0.0.1", start + window() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
        comp.commit();
    }

    #[tokio::test]
    async fn rollback_removes_the_entry() {
        let cache = Arc::new(cache::InMemory::new());
        let limiter = IpLimiter::new(cache.clone());
        let now = Utc::now();
        let (count, comp) = limiter.increment("10.0.0.9", now).await.unwrap();
        assert_eq!(count, 1);
        comp.rollback().await;
        let (count, comp) = limiter.increment("10.0.0.9", now).await.unwrap();
        assert_eq!(count, 1);
        comp.commit();
    }

    #[tokio::test]
    async fn rejects_garbage_ips() {
        let cache = Arc::new(cache::InMemory::new());
        let limiter = IpLimiter::new(cache);
        assert!(limiter.increment("", Utc::now()).await.is_err());
        assert!(limiter.increment("not-an-ip", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn rebuild_restores_windows_from_the_log() {
        let cache = Arc::new(cache::InMemory::new());
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let (a, b) = (ItemId::from("w"), ItemId::from("x"));
        let now = Utc::now();
        for (ip, age) in [
            ("10.0.0.1", ChronoDuration::minutes(5)),
            ("10.0.0.1", ChronoDuration::hours(1)),
            ("10.0.0.2", ChronoDuration::hours(2)),
            // Outside the window; must not be restored.
            ("10.0.0.3", ChronoDuration::hours(30)),
        ] {
            store
                .append_vote(&NewVote {
                    item_a: &a,
                    item_b: &b,
                    outcome: VoteOutcome::AWins,
                    user: "",
                    user_ip: ip,
                    multiplier: 1.0,
                    vote_time: now - age,
                })
                .await
                .unwrap();
        }

        let limiter = IpLimiter::new(cache.clone());
        limiter.rebuild(&store).await.unwrap();

        let (count, comp) = limiter.increment("10.0.0.1", now).await.unwrap();
        assert_eq!(count, 3);
        comp.commit();
        let (count, comp) = limiter.increment("10.0.0.3", now).await.unwrap();
        assert_eq!(count, 1);
        comp.commit();
    }
}
