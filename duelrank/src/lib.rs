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

//! # duelrank
//!
//! A live pairwise-ranking backend. Clients fetch a pair of items, vote on the matchup, and
//! duelrank folds the vote stream into an ELO-derived ranking held in a cache tier (Redis) backed
//! by an append-only durable log (SQLite).
//!
//! Right now, the library crate has the same name as the binary, meaning that `rustdoc` will
//! ignore the binary crate.
pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod duelrank;
pub mod elo;
pub mod entities;
pub mod health;
pub mod http;
pub mod ip_limiter;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod replay;
pub mod report;
pub mod selector;
pub mod snapshot;
pub mod storage;
pub mod token;
pub mod tree;
pub mod users;
