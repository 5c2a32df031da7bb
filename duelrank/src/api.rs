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

//! # the HTTP API
//!
//! The public surface: ranking, single item, pair dealing, vote submission, per-user report.
//! Handlers follow a common shape — an outer `async fn` that axum can call, wrapping an inner
//! function returning this module's `Result` so the interesting logic gets to use `?`.
//!
//! Two HTTP conventions here deserve a note. *Silent failure*: requests that fail a security
//! check (bad signature, replayed pair id, invalid identity) get HTTP 200 and the one generic
//! body — an attacker probing the vote endpoint learns nothing about which gate tripped. And
//! *degraded reads*: when the cache tier is down, the ranking & report endpoints fall through to
//! the last durable snapshot rather than erroring; only the write paths (pair, vote) return 503.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::{
    cache::{self, Op},
    define_metric,
    duelrank::Duelrank,
    entities::{ItemId, ItemStats, VoteOutcome},
    http::{client_ip, identity_cookie, silent_success, user_id_from_headers, ErrorResponseBody},
    metrics::Sort,
    selector,
    storage::NewVote,
    token::{self, PairToken},
    users,
};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("the cache tier is unavailable"))]
    Unavailable { backtrace: Backtrace },
    #[snafu(display("provide both excludeA and excludeB, or neither"))]
    AsymmetricExcludes { backtrace: Backtrace },
    #[snafu(display("no item named {id}"))]
    NoSuchItem { id: ItemId, backtrace: Backtrace },
    #[snafu(display("{ip} is not a usable client address"))]
    BadClientIp { ip: String, backtrace: Backtrace },
    #[snafu(display("pair selection failed: {source}"))]
    Selection {
        source: selector::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("cache read failed: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("durable read failed: {source}"))]
    Durable {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("report generation failed: {source}"))]
    Report {
        source: crate::report::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map to the HTTP surface; no internal error text crosses the boundary verbatim
    fn into_response_parts(self) -> (StatusCode, String) {
        match &self {
            Error::Unavailable { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable; try again shortly".to_owned(),
            ),
            Error::AsymmetricExcludes { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Error::NoSuchItem { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            Error::BadClientIp { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Selection {
                source: selector::Error::UnknownExclude { .. },
                ..
            } => (StatusCode::BAD_REQUEST, "unknown excluded item".to_owned()),
            _ => {
                error!("request failed: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_owned(),
                )
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error) = self.into_response_parts();
        (status, ErrorResponseBody::new(error)).into_response()
    }
}

define_metric! { "api.pairs.dealt", pairs_dealt, Sort::IntegralCounter }
define_metric! { "api.votes.accepted", votes_accepted, Sort::IntegralCounter }
define_metric! { "api.votes.silently_rejected", votes_silently_rejected, Sort::IntegralCounter }
define_metric! { "api.reports.generated", reports_generated, Sort::IntegralCounter }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       response bodies                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RankingItemRsp {
    id: ItemId,
    name: String,
    image_url: String,
    #[serde(rename = "type")]
    kind: i64,
    score: f64,
    total: f64,
    win: f64,
    rank_score: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemRsp {
    id: ItemId,
    image_url: String,
    #[serde(rename = "type")]
    kind: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairItemRsp {
    id: ItemId,
    name: String,
    description: String,
    image_url: String,
    #[serde(rename = "type")]
    kind: i64,
    rank: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairRsp {
    item_a: PairItemRsp,
    item_b: PairItemRsp,
    pair_id: String,
    signature: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteReq {
    item_a: ItemId,
    item_b: ItemId,
    result: VoteOutcome,
    pair_id: String,
    signature: String,
}

fn image_url(state: &Duelrank, headers: &http::HeaderMap, sprite: &str) -> String {
    let host = headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}{}{}", host, state.image_base_url, sprite)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      `/api/items/ranking`                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn ranking(
    State(state): State<Arc<Duelrank>>,
    headers: http::HeaderMap,
) -> Response {
    async fn ranking1(
        state: &Duelrank,
        headers: &http::HeaderMap,
    ) -> Result<Vec<RankingItemRsp>> {
        if !state.health.is_healthy() {
            // Degraded read: serve the last durable snapshot.
            let rows = state.store.load_items().await.context(DurableSnafu)?;
            return Ok(rows
                .into_iter()
                .sorted_by_key(|row| row.rank)
                .map(|row| RankingItemRsp {
                    image_url: image_url(state, headers, &row.info.sprite),
                    id: row.id,
                    name: row.info.name,
                    kind: row.info.kind,
                    score: row.stats.score,
                    total: row.stats.total,
                    win: row.stats.win,
                    rank_score: row.stats.rank_score,
                })
                .collect());
        }

        let ids = state
            .cache
            .run(Op::ZRevRange {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                start: 0,
                stop: -1,
            })
            .await
            .context(CacheSnafu)?
            .into_list()
            .context(CacheSnafu)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let stats = state
            .cache
            .run(Op::HMGet {
                key: cache::ITEM_STATS_KEY.to_owned(),
                fields: ids.clone(),
            })
            .await
            .context(CacheSnafu)?
            .into_opt_list()
            .context(CacheSnafu)?;

        Ok(ids
            .into_iter()
            .zip(stats)
            .filter_map(|(id, json)| {
                let id = ItemId::new(id);
                let info = state.catalog.info_of(&id)?;
                let stats: ItemStats = json.and_then(|json| serde_json::from_str(&json).ok())?;
                Some(RankingItemRsp {
                    image_url: image_url(state, headers, &info.sprite),
                    id,
                    name: info.name.clone(),
                    kind: info.kind,
                    score: stats.score,
                    total: stats.total,
                    win: stats.win,
                    rank_score: stats.rank_score,
                })
            })
            .collect())
    }

    match ranking1(&state, &headers).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       `/api/items/{id}`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn item_by_id(
    State(state): State<Arc<Duelrank>>,
    headers: http::HeaderMap,
    Path(id): Path<String>,
) -> Response {
    fn item1(state: &Duelrank, headers: &http::HeaderMap, id: ItemId) -> Result<ItemRsp> {
        let info = state
            .catalog
            .info_of(&id)
            .context(NoSuchItemSnafu { id: id.clone() })?;
        Ok(ItemRsp {
            image_url: image_url(state, headers, &info.sprite),
            id,
            kind: info.kind,
        })
    }

    match item1(&state, &headers, ItemId::new(id)) {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       `/api/items/pair`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct PairParams {
    #[serde(rename = "excludeA")]
    exclude_a: Option<ItemId>,
    #[serde(rename = "excludeB")]
    exclude_b: Option<ItemId>,
}

async fn pair(
    State(state): State<Arc<Duelrank>>,
    headers: http::HeaderMap,
    Query(params): Query<PairParams>,
) -> Response {
    async fn pair1(
        state: &Duelrank,
        headers: &http::HeaderMap,
        params: PairParams,
    ) -> Result<PairRsp> {
        if !state.health.is_healthy() {
            return UnavailableSnafu.fail();
        }
        let exclude = match (params.exclude_a, params.exclude_b) {
            (None, None) => None,
            (Some(a), Some(b)) => Some((a, b)),
            _ => return AsymmetricExcludesSnafu.fail(),
        };

        let selected = state
            .selector
            .select(&state.catalog, state.cache.as_ref(), &state.secret, exclude)
            .await
            .context(SelectionSnafu)?;

        let flesh_out = |candidate: &selector::PairCandidate| -> PairItemRsp {
            let info = state.catalog.info_of(&candidate.id);
            PairItemRsp {
                id: candidate.id.clone(),
                name: info.map(|info| info.name.clone()).unwrap_or_default(),
                description: info.map(|info| info.description.clone()).unwrap_or_default(),
                image_url: info
                    .map(|info| image_url(state, headers, &info.sprite))
                    .unwrap_or_default(),
                kind: info.map(|info| info.kind).unwrap_or_default(),
                rank: candidate.rank,
            }
        };
        pairs_dealt.add(1, &[]);
        Ok(PairRsp {
            item_a: flesh_out(&selected.item_a),
            item_b: flesh_out(&selected.item_b),
            pair_id: selected.pair_id,
            signature: selected.signature,
        })
    }

    // The pair endpoint owns identity issuance: absent or invalid cookies get a fresh one.
    let claimed = user_id_from_headers(&headers);
    let minted = if users::is_valid_user_id(&claimed) {
        None
    } else {
        Some(users::mint_user_id())
    };

    let response = match pair1(&state, &headers, params).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    };
    match minted {
        None => response,
        Some(user_id) => {
            let mut response = response;
            if let Ok(value) = identity_cookie(&user_id).parse() {
                response
                    .headers_mut()
                    .insert(http::header::SET_COOKIE, value);
            }
            response
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       `/api/items/vote`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What the vote handler decided to do
enum VoteDisposition {
    Accepted,
    /// Security-motivated rejection: same 200 body as success, no side effects
    Silent(&'static str),
}

async fn vote(
    State(state): State<Arc<Duelrank>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: http::HeaderMap,
    body: std::result::Result<Json<VoteReq>, axum::extract::rejection::JsonRejection>,
) -> Response {
    async fn vote1(
        state: &Duelrank,
        peer: SocketAddr,
        headers: &http::HeaderMap,
        req: VoteReq,
    ) -> Result<VoteDisposition> {
        if !state.health.is_healthy() {
            return UnavailableSnafu.fail();
        }

        // Gate one: the signature. An invalid one gets the generic success & zero side effects —
        // probing attackers are starved of signal.
        let payload = PairToken {
            pair_id: req.pair_id.clone(),
            item_a: req.item_a.clone(),
            item_b: req.item_b.clone(),
        };
        if !token::verify(&state.secret, &payload, &req.signature) {
            return Ok(VoteDisposition::Silent("bad signature"));
        }

        // Identity: invalid downgrades to anonymous, never errors.
        let claimed = user_id_from_headers(headers);
        let user = if state.activation.queue_if_valid(&claimed) {
            claimed
        } else {
            String::new()
        };

        // Gate two: replay.
        let replayed = state
            .replay
            .check_and_use(&req.pair_id)
            .await
            .map_err(|_| UnavailableSnafu.build())?;
        if replayed {
            return Ok(VoteDisposition::Silent("replayed pair id"));
        }

        // Gate three: the IP window decides the vote's weight.
        let now = Utc::now();
        let ip = client_ip(headers, peer);
        let (count, compensator) = match state.ip_limiter.increment(&ip, now).await {
            Ok(pair) => pair,
            Err(
                crate::ip_limiter::Error::MissingIp { .. }
                | crate::ip_limiter::Error::InvalidIp { .. },
            ) => return BadClientIpSnafu { ip }.fail(),
            Err(_) => return UnavailableSnafu.fail(),
        };
        let multiplier = crate::ip_limiter::multiplier_for_count(count);

        // The durable append is the commit point: after it, the vote exists.
        let appended = state
            .store
            .append_vote(&NewVote {
                item_a: &req.item_a,
                item_b: &req.item_b,
                outcome: req.result,
                user: &user,
                user_ip: &ip,
                multiplier,
                vote_time: now,
            })
            .await;
        let id = match appended {
            Ok(id) => id,
            Err(err) => {
                debug!("durable append failed: {}; compensating the IP window", err);
                compensator.rollback().await;
                return UnavailableSnafu.fail();
            }
        };
        compensator.commit();

        state.processor.submit(crate::entities::VoteRecord {
            id,
            item_a: req.item_a,
            item_b: req.item_b,
            outcome: req.result,
            user,
            multiplier,
            vote_time: now,
        });
        Ok(VoteDisposition::Accepted)
    }

    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponseBody::new(format!("malformed vote submission: {}", rejection)),
            )
                .into_response()
        }
    };

    match vote1(&state, peer, &headers, req).await {
        Ok(VoteDisposition::Accepted) => {
            votes_accepted.add(1, &[]);
            silent_success().into_response()
        }
        Ok(VoteDisposition::Silent(reason)) => {
            info!("silently rejecting a vote: {}", reason);
            votes_silently_rejected.add(1, &[]);
            silent_success().into_response()
        }
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      `/api/items/report`                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn report(State(state): State<Arc<Duelrank>>, headers: http::HeaderMap) -> Response {
    let claimed = user_id_from_headers(&headers);
    let user = if users::is_valid_user_id(&claimed) {
        claimed
    } else {
        String::new()
    };
    match state.reports.generate(&user).await.context(ReportSnafu) {
        Ok(report) => {
            reports_generated.add(1, &[]);
            Json(report).into_response()
        }
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        infrastructure                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Duelrank>>) -> Response {
    use prometheus::Encoder;
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("failed to encode metrics: {}", err);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    String::from_utf8_lossy(&buffer).into_owned().into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build the application router
pub fn make_router(state: Arc<Duelrank>, allowed_origins: &[String]) -> Router {
    let origins: Vec<http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(12 * 60 * 60));

    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .route("/api/items/ranking", get(ranking))
        .route("/api/items/pair", get(pair))
        .route("/api/items/vote", post(vote))
        .route("/api/items/report", get(report))
        .route("/api/items/{id}", get(item_by_id))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
