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

//! Property-style checks of the system invariants: total ordering of applied votes, conservation
//! of weighted participation, selector coverage & cold-priority bias, and the per-user tallies.

use std::collections::HashMap;
use std::sync::Arc;

use duelrank::cache::{self, Op};
use duelrank_test::TestApp;

const ITEMS: &[&str] = &["w", "x", "y", "z"];

/// Concurrently-submitted votes are applied exactly once each, in ascending id order; the cache
/// checkpoint ends at the top of the log with no gaps
#[tokio::test]
async fn total_order_under_concurrency() {
    let app = Arc::new(TestApp::new(ITEMS).await);
    let mut tasks = Vec::new();
    for i in 0..40 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let (a, b) = match i % 4 {
                0 => ("w", "x"),
                1 => ("y", "z"),
                2 => ("w", "z"),
                _ => ("x", "y"),
            };
            let outcome = if i % 3 == 0 { "B_WINS" } else { "A_WINS" };
            let ip = format!("10.20.{}.{}", i / 8, i % 8 + 1);
            let (status, _) = app.vote(a, b, outcome, &ip).await;
            assert_eq!(status, http::StatusCode::OK);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(app.vote_count().await, 40);
    app.wait_processed(40).await;

    // The live checkpoint agrees with the processor's.
    let checkpoint = app
        .state
        .cache
        .run(Op::Get {
            key: cache::LAST_PROCESSED_VOTE_ID_KEY.to_owned(),
        })
        .await
        .unwrap()
        .opt_text()
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint, "40");

    // Conservation: every vote weighs in on exactly two items, so the summed `total` equals
    // twice the summed multipliers (all 1.0 here — forty distinct IPs, far under the grace
    // threshold).
    let mut sum_total = 0.0;
    let mut sum_win = 0.0;
    for id in ITEMS {
        let stats = app.item_stats(id).await;
        sum_total += stats.total;
        sum_win += stats.win;
        assert!(stats.win <= stats.total);
    }
    assert!((sum_total - 80.0).abs() < 1e-9);
    assert!((sum_win - 40.0).abs() < 1e-9);

    // The community tally counted every vote once.
    let total = app
        .state
        .cache
        .run(Op::HGet {
            key: cache::USER_STATS_KEY.to_owned(),
            field: "_total_".to_owned(),
        })
        .await
        .unwrap()
        .opt_text()
        .unwrap()
        .unwrap();
    let total: serde_json::Value = serde_json::from_str(&total).unwrap();
    assert_eq!(total["wins"], 40);
}

/// Ids the processor has already applied are dropped, not re-applied, when the patroller
/// re-submits them
#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let app = TestApp::new(ITEMS).await;
    app.vote("w", "x", "A_WINS", "203.0.113.9").await;
    app.wait_processed(1).await;
    let before = app.item_stats("w").await;

    // Re-submit the already-applied vote directly, as a patroller pass would.
    let votes = app.state.store.votes_after(0, 10).await.unwrap();
    app.state.processor.submit(votes[0].clone());
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let after = app.item_stats("w").await;
    assert_eq!(before, after);
    assert_eq!(app.state.processor.last_processed(), 1);
}

/// Over many draws with no excludes every item gets dealt, and colder items get dealt more
#[tokio::test]
async fn selector_coverage_and_cold_bias() {
    let items: Vec<String> = (0..8).map(|i| format!("item{}", i)).collect();
    let refs: Vec<&str> = items.iter().map(|s| s.as_str()).collect();
    let app = TestApp::new(&refs).await;

    // Heat up half the catalog: forty decisive votes among item0..item3.
    for i in 0..40 {
        let (a, b) = (
            format!("item{}", i % 4),
            format!("item{}", (i + 1) % 4),
        );
        let ip = format!("10.9.{}.{}", i / 8, i % 8 + 1);
        app.vote(&a, &b, "A_WINS", &ip).await;
    }
    app.wait_processed(40).await;

    let mut first_picks: HashMap<String, usize> = HashMap::new();
    for _ in 0..400 {
        let (status, body) = app.get("/api/items/pair").await;
        assert_eq!(status, http::StatusCode::OK);
        // Either side may have been the stage-one pick; count both appearances.
        for side in ["itemA", "itemB"] {
            *first_picks
                .entry(body[side]["id"].as_str().unwrap().to_owned())
                .or_default() += 1;
        }
    }

    // Coverage: every item shows up.
    for id in &items {
        assert!(
            first_picks.get(id).copied().unwrap_or(0) > 0,
            "item {} never dealt; counts {:?}",
            id,
            first_picks
        );
    }

    // Cold bias: the never-played half should collectively out-appear the played half.
    let hot: usize = (0..4).map(|i| first_picks[&format!("item{}", i)]).sum();
    let cold: usize = (4..8).map(|i| first_picks[&format!("item{}", i)]).sum();
    assert!(
        cold > hot,
        "cold items ({}) should be dealt more than hot ones ({})",
        cold,
        hot
    );
}

/// A cookie-bearing voter accumulates per-user tallies & gets a report
#[tokio::test]
async fn user_tallies_and_report() {
    let app = TestApp::new(ITEMS).await;
    let user_id = duelrank::users::mint_user_id();
    let cookie = format!("user-id={}", user_id);

    for i in 0..6 {
        let (pair_id, signature) = app.mint_pair("w", "x");
        let outcome = if i < 5 { "A_WINS" } else { "SKIP" };
        let body = serde_json::json!({
            "itemA": "w",
            "itemB": "x",
            "result": outcome,
            "pairId": pair_id,
            "signature": signature,
        });
        let (status, _) = app
            .request(
                http::Request::builder()
                    .method("POST")
                    .uri("/api/items/vote")
                    .header("content-type", "application/json")
                    .header("cookie", &cookie)
                    .header("x-forwarded-for", "198.51.100.77")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, http::StatusCode::OK);
    }
    app.wait_processed(6).await;

    let (status, report) = app
        .request(
            http::Request::builder()
                .method("GET")
                .uri("/api/items/report")
                .header("cookie", &cookie)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(report["userId"], user_id);
    assert_eq!(report["totalVotes"], 6);
    assert_eq!(report["choices"]["wins"], 5);
    assert_eq!(report["choices"]["skip"], 1);
    assert!(report["decisionRate"].as_f64().is_some());
    assert_eq!(report["mostChosen"]["id"], "w");

    // Anonymous callers get the empty report, not an error.
    let (status, report) = app.get("/api/items/report").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(report["totalVotes"], 0);
}

/// A SKIP advances the checkpoint without touching item state
#[tokio::test]
async fn skip_advances_the_checkpoint_only() {
    let app = TestApp::new(ITEMS).await;
    app.vote("w", "x", "SKIP", "198.51.100.3").await;
    app.wait_processed(1).await;

    let w = app.item_stats("w").await;
    assert_eq!(w.total, 0.0);
    assert_eq!(w.score, 1500.0);

    // Skips are excluded from the live weighted total.
    let total_votes = app
        .state
        .cache
        .run(Op::Get {
            key: cache::TOTAL_VOTES_KEY.to_owned(),
        })
        .await
        .unwrap()
        .opt_text()
        .unwrap()
        .unwrap();
    assert_eq!(total_votes.parse::<f64>().unwrap(), 0.0);
}

/// The dirty-user set drains into the durable log on snapshot & failure restores it
#[tokio::test]
async fn snapshot_consumes_dirty_users() {
    let app = TestApp::new(ITEMS).await;
    let user_id = duelrank::users::mint_user_id();
    let cookie = format!("user-id={}", user_id);
    let (pair_id, signature) = app.mint_pair("w", "x");
    let body = serde_json::json!({
        "itemA": "w", "itemB": "x", "result": "A_WINS",
        "pairId": pair_id, "signature": signature,
    });
    app.request(
        http::Request::builder()
            .method("POST")
            .uri("/api/items/vote")
            .header("content-type", "application/json")
            .header("cookie", &cookie)
            .header("x-forwarded-for", "198.51.100.4")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    app.wait_processed(1).await;

    let dirty = app
        .state
        .cache
        .run(Op::SMembers {
            key: cache::USER_DIRTY_KEY.to_owned(),
        })
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert_eq!(dirty, vec![user_id.clone()]);

    app.state.snapshotter.snapshot(None).await.unwrap();
    let dirty = app
        .state
        .cache
        .run(Op::SMembers {
            key: cache::USER_DIRTY_KEY.to_owned(),
        })
        .await
        .unwrap()
        .into_list()
        .unwrap();
    assert!(dirty.is_empty());

    let users = app.state.store.users_page("", 10).await.unwrap();
    let row = users.iter().find(|(uuid, _)| uuid == &user_id).unwrap();
    assert_eq!(row.1.wins, 1);
}
