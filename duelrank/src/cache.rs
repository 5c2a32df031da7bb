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

//! # the cache tier
//!
//! duelrank keeps its live ranking state in a cache tier: a hash of per-item statistics, a sorted
//! set ordering items by rank score, per-IP sliding windows, the replay filter, and a handful of
//! checkpoint cells. In production that tier is Redis; in the test suites it's an in-process map.
//!
//! I want to hide the details of the backing store from application code to the greatest extent
//! possible, so — as with the durable log — the rest of the crate writes to an object-safe trait
//! and a particular *implementation* is chosen at startup. Rather than grow the trait a method per
//! Redis verb, the trait takes a command enum; this buys us the one thing the design genuinely
//! depends on (Redis `MULTI`/`EXEC` in production): the ability to submit an arbitrary *group* of
//! commands for atomic application via [Backend::exec].
//!
//! Every key the crate touches is a fixed literal defined here, next to the trait.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           key names                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hash: item id → JSON-serialized [ItemStats](crate::entities::ItemStats)
pub const ITEM_STATS_KEY: &str = "item_stats";
/// Sorted set: item id scored by rank score, ascending
pub const ITEM_RANKING_KEY: &str = "item_ranking";
/// Hash: user uuid (or [TOTAL_STATS_FIELD](crate::users::TOTAL_STATS_FIELD)) → JSON user stats
pub const USER_STATS_KEY: &str = "user:stats";
/// Sorted set: user uuid scored by total vote count
pub const USER_RANKING_KEY: &str = "user:ranking";
/// Set: uuids whose stats changed since the last snapshot
pub const USER_DIRTY_KEY: &str = "user:dirty";
/// Rename target for [USER_DIRTY_KEY] while a snapshot is in flight
pub const USER_DIRTY_PROCESSING_KEY: &str = "user:dirty:processing";
/// Set: uuids known to have been durably created
pub const KNOWN_USERS_KEY: &str = "known_users";
/// Prefix for the per-IP sliding-window sorted sets
pub const IP_VOTES_KEY_PREFIX: &str = "ip_votes:";
/// Bloom filter over consumed pair ids
pub const PAIR_BLOOM_KEY: &str = "pairid_bloom_filter";
/// Exact set over consumed pair ids
pub const PAIR_SET_KEY: &str = "pairid_cache_set";
/// String cell: id of the last vote the processor applied
pub const LAST_PROCESSED_VOTE_ID_KEY: &str = "meta:last_processed_vote_id";
/// String cell: live weighted vote count (skips excluded)
pub const TOTAL_VOTES_KEY: &str = "meta:total_votes";
/// Hash: user uuid → cached JSON report, fields carrying a short TTL
pub const REPORT_CACHE_KEY: &str = "report:cache";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The cache tier is unavailable"))]
    Unavailable { backtrace: Backtrace },
    #[snafu(display("Cache command failed: {source}"))]
    Redis {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Unexpected reply shape: wanted {wanted}, got {got}"))]
    Reply {
        wanted: &'static str,
        got: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The cache did not report a run id"))]
    NoRunId { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       commands & replies                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One cache-tier command
///
/// This is intentionally the *intersection* of what duelrank needs and what both backends can
/// honor, not a general Redis binding.
#[derive(Clone, Debug)]
pub enum Op {
    Get { key: String },
    Set { key: String, value: String },
    IncrByFloat { key: String, delta: f64 },
    Del { keys: Vec<String> },
    Exists { key: String },
    Rename { from: String, to: String },
    Expire { key: String, ttl: Duration },
    /// Enumerate keys by prefix; `prefix` is a literal, not a glob
    ScanKeys { prefix: String },
    HGet { key: String, field: String },
    HSet { key: String, entries: Vec<(String, String)> },
    HMGet { key: String, fields: Vec<String> },
    HGetAll { key: String },
    /// Expire individual hash fields (`HEXPIRE`); the reply is discarded
    HExpire { key: String, ttl: Duration, fields: Vec<String> },
    ZAdd { key: String, entries: Vec<(f64, String)> },
    ZRevRange { key: String, start: i64, stop: i64 },
    ZRevRangeWithScores { key: String, start: i64, stop: i64 },
    ZRevRank { key: String, member: String },
    ZRank { key: String, member: String },
    ZCard { key: String },
    ZRem { key: String, member: String },
    /// Remove members with score in `[-inf, below)`, exclusive upper bound
    ZRemRangeByScore { key: String, below: f64 },
    SAdd { key: String, members: Vec<String> },
    SIsMember { key: String, member: String },
    SMembers { key: String },
    SUnionStore { dest: String, keys: Vec<String> },
    BfReserve { key: String, error_rate: f64, capacity: u64 },
    BfAdd { key: String, item: String },
    BfMAdd { key: String, items: Vec<String> },
    BfExists { key: String, item: String },
}

/// One cache-tier reply
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
    OptList(Vec<Option<String>>),
    Pairs(Vec<(String, String)>),
    Scored(Vec<(String, f64)>),
}

impl Value {
    fn type_name(&self) -> String {
        format!("{:?}", self)
    }
    pub fn into_text(self) -> Result<String> {
        match self {
            Value::Text(s) => Ok(s),
            other => ReplySnafu {
                wanted: "text",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn opt_text(self) -> Result<Option<String>> {
        match self {
            Value::Nil => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => ReplySnafu {
                wanted: "text-or-nil",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn into_int(self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(n),
            Value::Bool(b) => Ok(b as i64),
            other => ReplySnafu {
                wanted: "integer",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn opt_int(self) -> Result<Option<i64>> {
        match self {
            Value::Nil => Ok(None),
            other => other.into_int().map(Some),
        }
    }
    pub fn into_bool(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Int(n) => Ok(n != 0),
            other => ReplySnafu {
                wanted: "boolean",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn into_list(self) -> Result<Vec<String>> {
        match self {
            Value::Nil => Ok(Vec::new()),
            Value::List(v) => Ok(v),
            other => ReplySnafu {
                wanted: "list",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn into_opt_list(self) -> Result<Vec<Option<String>>> {
        match self {
            Value::Nil => Ok(Vec::new()),
            Value::OptList(v) => Ok(v),
            Value::List(v) => Ok(v.into_iter().map(Some).collect()),
            other => ReplySnafu {
                wanted: "list-of-optionals",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn into_pairs(self) -> Result<Vec<(String, String)>> {
        match self {
            Value::Nil => Ok(Vec::new()),
            Value::Pairs(v) => Ok(v),
            other => ReplySnafu {
                wanted: "field-value pairs",
                got: other.type_name(),
            }
            .fail(),
        }
    }
    pub fn into_scored(self) -> Result<Vec<(String, f64)>> {
        match self {
            Value::Nil => Ok(Vec::new()),
            Value::Scored(v) => Ok(v),
            other => ReplySnafu {
                wanted: "scored members",
                got: other.type_name(),
            }
            .fail(),
        }
    }
}

/// Identifier that changes whenever the cache tier restarts
///
/// For Redis, this is the server `run_id` reported by `INFO server`; the health controller uses it
/// to detect restarts (and hence the loss of everything in the cache).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RunId(pub String);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Backend trait                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the cache-tier implementations
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one command
    async fn run(&self, op: Op) -> Result<Value>;
    /// Run a group of commands atomically (`MULTI`/`EXEC` on Redis); either every command is
    /// applied or none is, and no other client's commands interleave
    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<Value>>;
    /// Probe liveness & return the instance run id
    async fn ping(&self) -> Result<RunId>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Redis backend                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The production cache tier: Redis via a multiplexed connection manager
#[derive(Clone)]
pub struct Redis {
    conn: redis::aio::ConnectionManager,
}

impl Redis {
    pub async fn connect(address: &str, password: &str, db: i64) -> Result<Redis> {
        let info = redis::ConnectionInfo {
            addr: parse_addr(address),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password: if password.is_empty() {
                    None
                } else {
                    Some(password.to_owned())
                },
                protocol: redis::ProtocolVersion::RESP2,
            },
        };
        let client = redis::Client::open(info).context(RedisSnafu)?;
        let conn = client.get_connection_manager().await.context(RedisSnafu)?;
        Ok(Redis { conn })
    }
}

fn parse_addr(address: &str) -> redis::ConnectionAddr {
    let (host, port) = match address.rsplit_once(':') {
        Some((h, p)) => (h.to_owned(), p.parse().unwrap_or(6379)),
        None => (address.to_owned(), 6379),
    };
    redis::ConnectionAddr::Tcp(host, port)
}

/// What shape of reply to expect for a given [Op]; drives the conversion from [redis::Value]
enum Shape {
    Status,
    MaybeText,
    Int,
    MaybeInt,
    Bool,
    List,
    OptList,
    Pairs,
    Scored,
    Ignore,
}

fn shape_of(op: &Op) -> Shape {
    match op {
        Op::Get { .. } | Op::HGet { .. } | Op::IncrByFloat { .. } => Shape::MaybeText,
        Op::Set { .. } | Op::Rename { .. } | Op::BfReserve { .. } => Shape::Status,
        Op::Del { .. }
        | Op::HSet { .. }
        | Op::ZAdd { .. }
        | Op::ZCard { .. }
        | Op::ZRem { .. }
        | Op::ZRemRangeByScore { .. }
        | Op::SAdd { .. }
        | Op::SUnionStore { .. } => Shape::Int,
        Op::Exists { .. }
        | Op::Expire { .. }
        | Op::SIsMember { .. }
        | Op::BfAdd { .. }
        | Op::BfExists { .. } => Shape::Bool,
        Op::ZRevRank { .. } | Op::ZRank { .. } => Shape::MaybeInt,
        Op::ScanKeys { .. } | Op::ZRevRange { .. } | Op::SMembers { .. } => Shape::List,
        Op::HMGet { .. } => Shape::OptList,
        Op::HGetAll { .. } => Shape::Pairs,
        Op::ZRevRangeWithScores { .. } => Shape::Scored,
        Op::HExpire { .. } | Op::BfMAdd { .. } => Shape::Ignore,
    }
}

fn to_cmd(op: &Op) -> redis::Cmd {
    use redis::cmd;
    match op {
        Op::Get { key } => cmd("GET").arg(key).to_owned(),
        Op::Set { key, value } => cmd("SET").arg(key).arg(value).to_owned(),
        Op::IncrByFloat { key, delta } => cmd("INCRBYFLOAT").arg(key).arg(*delta).to_owned(),
        Op::Del { keys } => cmd("DEL").arg(keys).to_owned(),
        Op::Exists { key } => cmd("EXISTS").arg(key).to_owned(),
        Op::Rename { from, to } => cmd("RENAME").arg(from).arg(to).to_owned(),
        Op::Expire { key, ttl } => cmd("EXPIRE").arg(key).arg(ttl.as_secs()).to_owned(),
        // SCAN is cursor-driven & can't appear in a pipeline; `run` special-cases it.
        Op::ScanKeys { prefix } => cmd("SCAN")
            .arg(0)
            .arg("MATCH")
            .arg(format!("{}*", prefix))
            .to_owned(),
        Op::HGet { key, field } => cmd("HGET").arg(key).arg(field).to_owned(),
        Op::HSet { key, entries } => {
            let mut c = cmd("HSET");
            c.arg(key);
            for (field, value) in entries {
                c.arg(field).arg(value);
            }
            c
        }
        Op::HMGet { key, fields } => cmd("HMGET").arg(key).arg(fields).to_owned(),
        Op::HGetAll { key } => cmd("HGETALL").arg(key).to_owned(),
        Op::HExpire { key, ttl, fields } => {
            let mut c = cmd("HEXPIRE");
            c.arg(key).arg(ttl.as_secs()).arg("FIELDS").arg(fields.len());
            for field in fields {
                c.arg(field);
            }
            c
        }
        Op::ZAdd { key, entries } => {
            let mut c = cmd("ZADD");
            c.arg(key);
            for (score, member) in entries {
                c.arg(*score).arg(member);
            }
            c
        }
        Op::ZRevRange { key, start, stop } => {
            cmd("ZREVRANGE").arg(key).arg(*start).arg(*stop).to_owned()
        }
        Op::ZRevRangeWithScores { key, start, stop } => cmd("ZREVRANGE")
            .arg(key)
            .arg(*start)
            .arg(*stop)
            .arg("WITHSCORES")
            .to_owned(),
        Op::ZRevRank { key, member } => cmd("ZREVRANK").arg(key).arg(member).to_owned(),
        Op::ZRank { key, member } => cmd("ZRANK").arg(key).arg(member).to_owned(),
        Op::ZCard { key } => cmd("ZCARD").arg(key).to_owned(),
        Op::ZRem { key, member } => cmd("ZREM").arg(key).arg(member).to_owned(),
        Op::ZRemRangeByScore { key, below } => cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", below))
            .to_owned(),
        Op::SAdd { key, members } => cmd("SADD").arg(key).arg(members).to_owned(),
        Op::SIsMember { key, member } => cmd("SISMEMBER").arg(key).arg(member).to_owned(),
        Op::SMembers { key } => cmd("SMEMBERS").arg(key).to_owned(),
        Op::SUnionStore { dest, keys } => cmd("SUNIONSTORE").arg(dest).arg(keys).to_owned(),
        Op::BfReserve {
            key,
            error_rate,
            capacity,
        } => cmd("BF.RESERVE")
            .arg(key)
            .arg(*error_rate)
            .arg(*capacity)
            .to_owned(),
        Op::BfAdd { key, item } => cmd("BF.ADD").arg(key).arg(item).to_owned(),
        Op::BfMAdd { key, items } => cmd("BF.MADD").arg(key).arg(items).to_owned(),
        Op::BfExists { key, item } => cmd("BF.EXISTS").arg(key).arg(item).to_owned(),
    }
}

fn raw_text(v: redis::Value) -> Result<String> {
    match v {
        redis::Value::BulkString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::SimpleString(s) => Ok(s),
        other => ReplySnafu {
            wanted: "text",
            got: format!("{:?}", other),
        }
        .fail(),
    }
}

fn convert(shape: &Shape, v: redis::Value) -> Result<Value> {
    use redis::Value as R;
    match shape {
        Shape::Ignore => Ok(Value::Ok),
        Shape::Status => Ok(Value::Ok),
        Shape::MaybeText => match v {
            R::Nil => Ok(Value::Nil),
            other => raw_text(other).map(Value::Text),
        },
        Shape::Int => match v {
            R::Int(n) => Ok(Value::Int(n)),
            other => ReplySnafu {
                wanted: "integer",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::MaybeInt => match v {
            R::Nil => Ok(Value::Nil),
            R::Int(n) => Ok(Value::Int(n)),
            other => ReplySnafu {
                wanted: "integer-or-nil",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::Bool => match v {
            R::Int(n) => Ok(Value::Bool(n != 0)),
            R::Boolean(b) => Ok(Value::Bool(b)),
            other => ReplySnafu {
                wanted: "boolean",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::List => match v {
            R::Nil => Ok(Value::List(Vec::new())),
            R::Array(items) => items
                .into_iter()
                .map(raw_text)
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => ReplySnafu {
                wanted: "list",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::OptList => match v {
            R::Nil => Ok(Value::OptList(Vec::new())),
            R::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    R::Nil => Ok(None),
                    other => raw_text(other).map(Some),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::OptList),
            other => ReplySnafu {
                wanted: "list-of-optionals",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::Pairs => match v {
            R::Nil => Ok(Value::Pairs(Vec::new())),
            R::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((raw_text(k)?, raw_text(v)?)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Pairs),
            R::Array(items) => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((raw_text(k)?, raw_text(v)?));
                }
                Ok(Value::Pairs(pairs))
            }
            other => ReplySnafu {
                wanted: "field-value pairs",
                got: format!("{:?}", other),
            }
            .fail(),
        },
        Shape::Scored => match v {
            R::Nil => Ok(Value::Scored(Vec::new())),
            R::Array(items) => {
                let mut scored = Vec::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(m), Some(s)) = (it.next(), it.next()) {
                    let score = raw_text(s)?;
                    scored.push((
                        raw_text(m)?,
                        score.parse::<f64>().map_err(|_| {
                            ReplySnafu {
                                wanted: "float score",
                                got: score.clone(),
                            }
                            .build()
                        })?,
                    ));
                }
                Ok(Value::Scored(scored))
            }
            other => ReplySnafu {
                wanted: "scored members",
                got: format!("{:?}", other),
            }
            .fail(),
        },
    }
}

#[async_trait]
impl Backend for Redis {
    async fn run(&self, op: Op) -> Result<Value> {
        let mut conn = self.conn.clone();
        // SCAN is cursor-driven; drive the cursor to completion here rather than making every
        // caller aware of it.
        if let Op::ScanKeys { prefix } = &op {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(format!("{}*", prefix))
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await
                    .context(RedisSnafu)?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            return Ok(Value::List(keys));
        }
        let raw: redis::Value = to_cmd(&op)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        convert(&shape_of(&op), raw)
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<Value>> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            pipe.add_command(to_cmd(op));
        }
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await.context(RedisSnafu)?;
        ops.iter()
            .zip(raw)
            .map(|(op, v)| convert(&shape_of(op), v))
            .collect()
    }

    async fn ping(&self) -> Result<RunId> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        info.lines()
            .find_map(|line| line.strip_prefix("run_id:"))
            .map(|id| RunId(id.trim().to_owned()))
            .context(NoRunIdSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        InMemory backend                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct MemState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    // A Bloom filter with a zero error rate; close enough for a fake.
    blooms: HashMap<String, std::collections::HashSet<String>>,
}

/// An in-process cache tier for the test suites & local development
///
/// Commands are applied under a single mutex, so an `exec` group is trivially atomic. TTLs are
/// accepted and ignored (nothing in the core *depends* on expiry: the IP window prunes itself by
/// score and the report cache tolerates stale reads for its one-minute lifetime). The run id and a
/// failure switch are settable so the test suites can simulate restarts & outages.
#[derive(Default)]
pub struct InMemory {
    state: Mutex<MemState>,
    run_id: Mutex<String>,
    failing: AtomicBool,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory {
            run_id: Mutex::new("in-memory-0".to_owned()),
            ..Default::default()
        }
    }
    /// Simulate a cache restart: change the run id & drop all data
    pub fn restart(&self, new_run_id: &str) {
        *self.state.lock().expect("lock poisoned") = MemState::default();
        *self.run_id.lock().expect("lock poisoned") = new_run_id.to_owned();
    }
    pub fn set_run_id(&self, run_id: &str) {
        *self.run_id.lock().expect("lock poisoned") = run_id.to_owned();
    }
    /// Make every subsequent command fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn apply(state: &mut MemState, op: &Op) -> Result<Value> {
        match op {
            Op::Get { key } => Ok(state
                .strings
                .get(key)
                .cloned()
                .map(Value::Text)
                .unwrap_or(Value::Nil)),
            Op::Set { key, value } => {
                state.strings.insert(key.clone(), value.clone());
                Ok(Value::Ok)
            }
            Op::IncrByFloat { key, delta } => {
                let cell = state.strings.entry(key.clone()).or_insert_with(|| "0".into());
                let next = cell.parse::<f64>().unwrap_or(0.0) + delta;
                *cell = format!("{}", next);
                Ok(Value::Text(cell.clone()))
            }
            Op::Del { keys } => {
                let mut n = 0;
                for key in keys {
                    if state.strings.remove(key).is_some()
                        || state.hashes.remove(key).is_some()
                        || state.zsets.remove(key).is_some()
                        || state.sets.remove(key).is_some()
                        || state.blooms.remove(key).is_some()
                    {
                        n += 1;
                    }
                }
                Ok(Value::Int(n))
            }
            Op::Exists { key } => Ok(Value::Bool(
                state.strings.contains_key(key)
                    || state.hashes.contains_key(key)
                    || state.zsets.contains_key(key)
                    || state.sets.contains_key(key)
                    || state.blooms.contains_key(key),
            )),
            Op::Rename { from, to } => {
                if let Some(v) = state.strings.remove(from) {
                    state.strings.insert(to.clone(), v);
                } else if let Some(v) = state.hashes.remove(from) {
                    state.hashes.insert(to.clone(), v);
                } else if let Some(v) = state.zsets.remove(from) {
                    state.zsets.insert(to.clone(), v);
                } else if let Some(v) = state.sets.remove(from) {
                    state.sets.insert(to.clone(), v);
                } else if let Some(v) = state.blooms.remove(from) {
                    state.blooms.insert(to.clone(), v);
                }
                Ok(Value::Ok)
            }
            Op::Expire { .. } | Op::HExpire { .. } => Ok(Value::Ok),
            Op::ScanKeys { prefix } => {
                let mut keys: Vec<String> = state
                    .strings
                    .keys()
                    .chain(state.hashes.keys())
                    .chain(state.zsets.keys())
                    .chain(state.sets.keys())
                    .chain(state.blooms.keys())
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                keys.sort();
                keys.dedup();
                Ok(Value::List(keys))
            }
            Op::HGet { key, field } => Ok(state
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .cloned()
                .map(Value::Text)
                .unwrap_or(Value::Nil)),
            Op::HSet { key, entries } => {
                let hash = state.hashes.entry(key.clone()).or_default();
                let mut added = 0;
                for (field, value) in entries {
                    if hash.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(Value::Int(added))
            }
            Op::HMGet { key, fields } => {
                let hash = state.hashes.get(key);
                Ok(Value::OptList(
                    fields
                        .iter()
                        .map(|f| hash.and_then(|h| h.get(f)).cloned())
                        .collect(),
                ))
            }
            Op::HGetAll { key } => {
                let mut pairs: Vec<(String, String)> = state
                    .hashes
                    .get(key)
                    .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                pairs.sort();
                Ok(Value::Pairs(pairs))
            }
            Op::ZAdd { key, entries } => {
                let zset = state.zsets.entry(key.clone()).or_default();
                let mut added = 0;
                for (score, member) in entries {
                    if zset.insert(member.clone(), *score).is_none() {
                        added += 1;
                    }
                }
                Ok(Value::Int(added))
            }
            Op::ZRevRange { key, start, stop } => {
                let members = rev_sorted(state, key);
                Ok(Value::List(
                    slice_range(&members, *start, *stop)
                        .iter()
                        .map(|(m, _)| m.clone())
                        .collect(),
                ))
            }
            Op::ZRevRangeWithScores { key, start, stop } => {
                let members = rev_sorted(state, key);
                Ok(Value::Scored(slice_range(&members, *start, *stop).to_vec()))
            }
            Op::ZRevRank { key, member } => {
                let members = rev_sorted(state, key);
                Ok(members
                    .iter()
                    .position(|(m, _)| m == member)
                    .map(|i| Value::Int(i as i64))
                    .unwrap_or(Value::Nil))
            }
            Op::ZRank { key, member } => {
                let mut members = rev_sorted(state, key);
                members.reverse();
                Ok(members
                    .iter()
                    .position(|(m, _)| m == member)
                    .map(|i| Value::Int(i as i64))
                    .unwrap_or(Value::Nil))
            }
            Op::ZCard { key } => Ok(Value::Int(
                state.zsets.get(key).map(|z| z.len()).unwrap_or(0) as i64,
            )),
            Op::ZRem { key, member } => {
                let n = state
                    .zsets
                    .get_mut(key)
                    .map(|z| z.remove(member).is_some() as i64)
                    .unwrap_or(0);
                Ok(Value::Int(n))
            }
            Op::ZRemRangeByScore { key, below } => {
                let mut n = 0;
                if let Some(zset) = state.zsets.get_mut(key) {
                    let doomed: Vec<String> = zset
                        .iter()
                        .filter(|(_, s)| **s < *below)
                        .map(|(m, _)| m.clone())
                        .collect();
                    n = doomed.len() as i64;
                    for m in doomed {
                        zset.remove(&m);
                    }
                }
                Ok(Value::Int(n))
            }
            Op::SAdd { key, members } => {
                let set = state.sets.entry(key.clone()).or_default();
                let mut added = 0;
                for m in members {
                    if set.insert(m.clone()) {
                        added += 1;
                    }
                }
                Ok(Value::Int(added))
            }
            Op::SIsMember { key, member } => Ok(Value::Bool(
                state.sets.get(key).map(|s| s.contains(member)).unwrap_or(false),
            )),
            Op::SMembers { key } => {
                let mut members: Vec<String> = state
                    .sets
                    .get(key)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                members.sort();
                Ok(Value::List(members))
            }
            Op::SUnionStore { dest, keys } => {
                let mut union = std::collections::HashSet::new();
                for key in keys {
                    if let Some(s) = state.sets.get(key) {
                        union.extend(s.iter().cloned());
                    }
                }
                let n = union.len() as i64;
                state.sets.insert(dest.clone(), union);
                Ok(Value::Int(n))
            }
            Op::BfReserve { key, .. } => {
                state.blooms.insert(key.clone(), Default::default());
                Ok(Value::Ok)
            }
            Op::BfAdd { key, item } => Ok(Value::Bool(
                state.blooms.entry(key.clone()).or_default().insert(item.clone()),
            )),
            Op::BfMAdd { key, items } => {
                let bloom = state.blooms.entry(key.clone()).or_default();
                for item in items {
                    bloom.insert(item.clone());
                }
                Ok(Value::Ok)
            }
            Op::BfExists { key, item } => Ok(Value::Bool(
                state.blooms.get(key).map(|b| b.contains(item)).unwrap_or(false),
            )),
        }
    }
}

/// Members of a zset sorted high-to-low by score, ties broken reverse-lexically (Redis order)
fn rev_sorted(state: &MemState, key: &str) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = state
        .zsets
        .get(key)
        .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
        .unwrap_or_default();
    members.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.0.cmp(&a.0))
    });
    members
}

fn slice_range(members: &[(String, f64)], start: i64, stop: i64) -> &[(String, f64)] {
    let len = members.len() as i64;
    let clamp = |i: i64| -> i64 {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len)
    };
    let lo = clamp(start);
    let hi = (clamp(stop) + 1).min(len);
    if lo >= hi {
        &[]
    } else {
        &members[lo as usize..hi as usize]
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn run(&self, op: Op) -> Result<Value> {
        if self.failing.load(Ordering::SeqCst) {
            return UnavailableSnafu.fail();
        }
        let mut state = self.state.lock().expect("lock poisoned");
        Self::apply(&mut state, &op)
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<Value>> {
        if self.failing.load(Ordering::SeqCst) {
            return UnavailableSnafu.fail();
        }
        let mut state = self.state.lock().expect("lock poisoned");
        ops.iter().map(|op| Self::apply(&mut state, op)).collect()
    }

    async fn ping(&self) -> Result<RunId> {
        if self.failing.load(Ordering::SeqCst) {
            return UnavailableSnafu.fail();
        }
        Ok(RunId(self.run_id.lock().expect("lock poisoned").clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn strings_and_hashes() {
        let mem = InMemory::new();
        assert_eq!(
            mem.run(Op::Get { key: "k".into() }).await.unwrap(),
            Value::Nil
        );
        mem.run(Op::Set {
            key: "k".into(),
            value: "v".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            mem.run(Op::Get { key: "k".into() }).await.unwrap().opt_text().unwrap(),
            Some("v".to_owned())
        );

        mem.run(Op::HSet {
            key: "h".into(),
            entries: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
        })
        .await
        .unwrap();
        let got = mem
            .run(Op::HMGet {
                key: "h".into(),
                fields: vec!["a".into(), "missing".into()],
            })
            .await
            .unwrap()
            .into_opt_list()
            .unwrap();
        assert_eq!(got, vec![Some("1".to_owned()), None]);
    }

    #[tokio::test]
    async fn zset_order_and_ranks() {
        let mem = InMemory::new();
        mem.run(Op::ZAdd {
            key: "z".into(),
            entries: vec![(1.0, "low".into()), (3.0, "high".into()), (2.0, "mid".into())],
        })
        .await
        .unwrap();
        let all = mem
            .run(Op::ZRevRange {
                key: "z".into(),
                start: 0,
                stop: -1,
            })
            .await
            .unwrap()
            .into_list()
            .unwrap();
        assert_eq!(all, vec!["high", "mid", "low"]);
        assert_eq!(
            mem.run(Op::ZRevRank {
                key: "z".into(),
                member: "mid".into()
            })
            .await
            .unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            mem.run(Op::ZRank {
                key: "z".into(),
                member: "mid".into()
            })
            .await
            .unwrap(),
            Value::Int(1)
        );
        mem.run(Op::ZRemRangeByScore {
            key: "z".into(),
            below: 2.0,
        })
        .await
        .unwrap();
        assert_eq!(
            mem.run(Op::ZCard { key: "z".into() }).await.unwrap(),
            Value::Int(2)
        );
    }

    #[tokio::test]
    async fn exec_is_all_or_nothing_under_failures() {
        let mem = InMemory::new();
        mem.set_failing(true);
        assert!(mem
            .exec(vec![Op::Set {
                key: "k".into(),
                value: "v".into()
            }])
            .await
            .is_err());
        mem.set_failing(false);
        assert_eq!(mem.run(Op::Get { key: "k".into() }).await.unwrap(), Value::Nil);
    }

    #[tokio::test]
    async fn restart_changes_run_id_and_wipes() {
        let mem = InMemory::new();
        mem.run(Op::Set {
            key: "k".into(),
            value: "v".into(),
        })
        .await
        .unwrap();
        let before = mem.ping().await.unwrap();
        mem.restart("in-memory-1");
        assert_ne!(before, mem.ping().await.unwrap());
        assert_eq!(mem.run(Op::Get { key: "k".into() }).await.unwrap(), Value::Nil);
    }
}
