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

//! # duelrank-test
//!
//! Harness for the end-to-end suites: a fully-assembled duelrank application — real router, real
//! vote processor, real snapshot engine — wired to the in-memory cache backend & an in-memory
//! SQLite store. Requests go through the actual axum [Router] via `tower::ServiceExt::oneshot`,
//! so the tests exercise the same code paths production traffic does, including the silent-fail
//! surface.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{body::Body, extract::ConnectInfo, Router};
use tower::ServiceExt;
use uuid::Uuid;

use duelrank::{
    api::make_router,
    cache::{self, Backend, InMemory, Op},
    catalog::Catalog,
    duelrank::{prime, Duelrank},
    elo::EloTracker,
    entities::{ItemId, ItemInfo, ItemStats},
    health::{HealthStatus, Monitor, Rebuilder},
    ip_limiter::IpLimiter,
    lifecycle::Manager,
    processor::{self, ProcessorContext},
    replay::ReplayGate,
    report::ReportService,
    selector::PairSelector,
    snapshot::Snapshotter,
    storage::Store,
    token::{self, PairToken, Secret},
    users::{start_activation_worker, Users},
};

/// A fully-assembled duelrank application over in-memory backends
pub struct TestApp {
    pub state: Arc<Duelrank>,
    /// The same backend as `state.cache`, concretely typed for restart/failure injection
    pub mem: Arc<InMemory>,
    pub router: Router,
    pub monitor: Monitor,
    /// Keep the managers alive; dropping them reads as cancellation to every service
    pub graceful: Manager,
    pub forceful: Manager,
}

impl TestApp {
    /// Build & prime an application over `item_ids`, all starting at the initial ELO
    pub async fn new(item_ids: &[&str]) -> TestApp {
        let mem = Arc::new(InMemory::new());
        let cache: Arc<dyn Backend> = mem.clone();
        let store = Store::open_in_memory().await.expect("open store");
        store.migrate().await.expect("migrate");
        for id in item_ids {
            store
                .insert_item(
                    &ItemId::from(*id),
                    &ItemInfo {
                        name: id.to_uppercase(),
                        description: format!("the {} item", id),
                        sprite: format!("{}.png", id),
                        kind: 0,
                    },
                )
                .await
                .expect("seed item");
        }

        let secret = Secret::from_bytes([42u8; 32]);
        let catalog = Arc::new(Catalog::load(&store).await.expect("load catalog"));
        let selector = PairSelector::new(catalog.len());
        let tracker = EloTracker::new();
        let users = Arc::new(Users::new(cache.clone()));
        let replay = Arc::new(ReplayGate::new(cache.clone(), store.clone()));
        let ip_limiter = Arc::new(IpLimiter::new(cache.clone()));

        prime(
            cache.as_ref(),
            &store,
            &catalog,
            &tracker,
            &users,
            &replay,
            &ip_limiter,
        )
        .await
        .expect("prime");

        let health = Arc::new(HealthStatus::new());
        health.set_initial_run_id(cache.ping().await.expect("initial ping"));

        let graceful = Manager::new();
        let forceful = Manager::new();

        let activation = start_activation_worker(
            store.clone(),
            cache.clone(),
            graceful.handle("UserActivationWorker").expect("handle"),
        );
        let snapshotter = Arc::new(Snapshotter::new(cache.clone(), store.clone(), users.clone()));

        let start_id = store.last_snapshot_vote_id().await.expect("snapshot id");
        let processor = processor::start(
            ProcessorContext {
                cache: cache.clone(),
                store: store.clone(),
                catalog: catalog.clone(),
                tracker: tracker.clone(),
                users: users.clone(),
                health: health.clone(),
            },
            start_id,
            graceful.handle("VoteProcessor").expect("handle"),
            forceful.handle("VoteProcessor").expect("handle"),
            graceful.handle("VotePatroller").expect("handle"),
        );

        let reports = Arc::new(ReportService::new(
            cache.clone(),
            store.clone(),
            catalog.clone(),
            users.clone(),
            health.clone(),
        ));

        let monitor = Monitor {
            status: health.clone(),
            cache: cache.clone(),
            rebuilder: Rebuilder {
                cache: cache.clone(),
                store: store.clone(),
                catalog: catalog.clone(),
                tracker: tracker.clone(),
                users: users.clone(),
                replay: replay.clone(),
                ip_limiter: ip_limiter.clone(),
                processor: processor.clone(),
                snapshotter: snapshotter.clone(),
            },
            reports: reports.clone(),
        };

        let state = Arc::new(Duelrank {
            cache,
            store,
            catalog,
            selector,
            tracker,
            secret,
            replay,
            ip_limiter,
            users,
            activation,
            health,
            processor,
            snapshotter,
            reports,
            registry: prometheus_registry(),
            image_base_url: "/images/items/".to_owned(),
        });
        let router = make_router(state.clone(), &[]);

        TestApp {
            state,
            mem,
            router,
            monitor,
            graceful,
            forceful,
        }
    }

    /// Issue one request through the real router
    pub async fn request(
        &self,
        request: http::Request<Body>,
    ) -> (http::StatusCode, serde_json::Value) {
        let mut request = request;
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("203.0.113.7:4242".parse().unwrap()));
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("read body");
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn get(&self, path: &str) -> (http::StatusCode, serde_json::Value) {
        self.request(
            http::Request::builder()
                .method("GET")
                .uri(path)
                .body(Body::empty())
                .expect("build request"),
        )
        .await
    }

    /// Mint a pair token over `(a, b)` exactly as the pair endpoint would
    pub fn mint_pair(&self, a: &str, b: &str) -> (String, String) {
        let pair_id = Uuid::now_v7().to_string();
        let signature = token::sign(
            &self.state.secret,
            &PairToken {
                pair_id: pair_id.clone(),
                item_a: ItemId::from(a),
                item_b: ItemId::from(b),
            },
        )
        .expect("sign");
        (pair_id, signature)
    }

    /// Submit a vote through the real endpoint, with a freshly-minted (valid) pair token
    pub async fn vote(
        &self,
        a: &str,
        b: &str,
        result: &str,
        forwarded_ip: &str,
    ) -> (http::StatusCode, serde_json::Value) {
        let (pair_id, signature) = self.mint_pair(a, b);
        self.vote_with(a, b, result, &pair_id, &signature, forwarded_ip).await
    }

    /// Submit a vote with explicit token fields (for tamper & replay tests)
    pub async fn vote_with(
        &self,
        a: &str,
        b: &str,
        result: &str,
        pair_id: &str,
        signature: &str,
        forwarded_ip: &str,
    ) -> (http::StatusCode, serde_json::Value) {
        let body = serde_json::json!({
            "itemA": a,
            "itemB": b,
            "result": result,
            "pairId": pair_id,
            "signature": signature,
        });
        self.request(
            http::Request::builder()
                .method("POST")
                .uri("/api/items/vote")
                .header("content-type", "application/json")
                .header("x-forwarded-for", forwarded_ip)
                .body(Body::from(body.to_string()))
                .expect("build request"),
        )
        .await
    }

    /// Wait (bounded) for the processor's checkpoint to reach `id`
    pub async fn wait_processed(&self, id: i64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.state.processor.last_processed() < id {
            assert!(
                tokio::time::Instant::now() < deadline,
                "processor stuck below vote {} (at {})",
                id,
                self.state.processor.last_processed()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Read one item's live statistics from the cache tier
    pub async fn item_stats(&self, id: &str) -> ItemStats {
        let json = self
            .state
            .cache
            .run(Op::HGet {
                key: cache::ITEM_STATS_KEY.to_owned(),
                field: id.to_owned(),
            })
            .await
            .expect("stats hash")
            .opt_text()
            .expect("text")
            .unwrap_or_else(|| panic!("no stats for {}", id));
        serde_json::from_str(&json).expect("parse stats")
    }

    /// The full ranking, best first
    pub async fn ranking_ids(&self) -> Vec<String> {
        self.state
            .cache
            .run(Op::ZRevRange {
                key: cache::ITEM_RANKING_KEY.to_owned(),
                start: 0,
                stop: -1,
            })
            .await
            .expect("ranking")
            .into_list()
            .expect("list")
    }

    /// Count of durably-logged votes
    pub async fn vote_count(&self) -> usize {
        self.state
            .store
            .votes_after(0, i64::MAX)
            .await
            .expect("scan votes")
            .len()
    }
}

fn prometheus_registry() -> prometheus::Registry {
    prometheus::Registry::new()
}
