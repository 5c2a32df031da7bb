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

//! End-to-end scenarios over the full application: four items `w, x, y, z`, initial ELO 1500,
//! K = 32, driven through the real HTTP surface.

use duelrank::{cache::Op, http::SILENT_SUCCESS_BODY};
use duelrank_test::TestApp;

const ITEMS: &[&str] = &["w", "x", "y", "z"];
const IP: &str = "198.51.100.10";

/// S1: a plain win at equal scores moves 16 points each way & re-ranks every item
#[tokio::test]
async fn plain_win() {
    let app = TestApp::new(ITEMS).await;
    let (status, body) = app.vote("w", "x", "A_WINS", IP).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["message"], SILENT_SUCCESS_BODY);
    app.wait_processed(1).await;

    let w = app.item_stats("w").await;
    let x = app.item_stats("x").await;
    assert_eq!(w.score, 1516.0);
    assert_eq!(x.score, 1484.0);
    assert_eq!(w.win, 1.0);
    assert_eq!(w.total, 1.0);
    assert_eq!(x.win, 0.0);
    assert_eq!(x.total, 1.0);

    // The first decisive vote moves the global boundary, so *every* rank score was rebuilt:
    // bystanders sit dead center, the winner on top, the loser on the bottom.
    let y = app.item_stats("y").await;
    assert!((y.rank_score - 0.5).abs() < 1e-9);
    assert!((w.rank_score - 1.0).abs() < 1e-9);
    assert!(x.rank_score.abs() < 1e-9);

    let ranking = app.ranking_ids().await;
    let pos = |id: &str| ranking.iter().position(|r| r == id).unwrap();
    assert!(pos("w") < pos("x"), "ranking was {:?}", ranking);
}

/// S2: a draw moves no scores, only participation counts
#[tokio::test]
async fn draw_counts_but_does_not_score() {
    let app = TestApp::new(ITEMS).await;
    let (status, _) = app.vote("w", "x", "A_WINS", IP).await;
    assert_eq!(status, http::StatusCode::OK);
    app.wait_processed(1).await;

    let (status, _) = app.vote("w", "x", "DRAW", IP).await;
    assert_eq!(status, http::StatusCode::OK);
    app.wait_processed(2).await;

    let w = app.item_stats("w").await;
    let x = app.item_stats("x").await;
    assert_eq!(w.score, 1516.0);
    assert_eq!(x.score, 1484.0);
    assert_eq!(w.total, 2.0);
    assert_eq!(x.total, 2.0);
    assert_eq!(w.win, 1.0);
    assert_eq!(x.win, 0.0);
}

/// S3: a tampered signature yields generic success & leaves no trace
#[tokio::test]
async fn signature_tamper_is_silent() {
    let app = TestApp::new(ITEMS).await;
    let (pair_id, signature) = app.mint_pair("w", "x");
    // Flip one character of the base64url signature.
    let mut tampered: Vec<char> = signature.chars().collect();
    tampered[0] = if tampered[0] == 'A' { 'B' } else { 'A' };
    let tampered: String = tampered.into_iter().collect();

    let (status, body) = app
        .vote_with("w", "x", "A_WINS", &pair_id, &tampered, IP)
        .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["message"], SILENT_SUCCESS_BODY);

    // No vote was appended & the pair id was not consumed.
    assert_eq!(app.vote_count().await, 0);
    let page = app
        .state
        .store
        .used_pair_ids_page("", 10)
        .await
        .expect("page");
    assert!(page.is_empty());

    // The very same pair id with the *correct* signature still works.
    let signature = duelrank::token::sign(
        &app.state.secret,
        &duelrank::token::PairToken {
            pair_id: pair_id.clone(),
            item_a: "w".into(),
            item_b: "x".into(),
        },
    )
    .unwrap();
    let (status, _) = app
        .vote_with("w", "x", "A_WINS", &pair_id, &signature, IP)
        .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(app.vote_count().await, 1);
}

/// S4: a pair id is good for exactly one vote
#[tokio::test]
async fn replay_is_silent() {
    let app = TestApp::new(ITEMS).await;
    let (pair_id, signature) = app.mint_pair("w", "x");

    let (status, body) = app
        .vote_with("w", "x", "A_WINS", &pair_id, &signature, IP)
        .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["message"], SILENT_SUCCESS_BODY);

    let (status, body) = app
        .vote_with("w", "x", "B_WINS", &pair_id, &signature, IP)
        .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["message"], SILENT_SUCCESS_BODY);

    // Only the first made it into the log.
    assert_eq!(app.vote_count().await, 1);
    app.wait_processed(1).await;
    let w = app.item_stats("w").await;
    assert_eq!(w.score, 1516.0);
}

/// S5: the 201st vote from one IP inside the window is discounted to 1 − 0.5/400
#[tokio::test]
async fn rate_limit_decay() {
    let app = TestApp::new(ITEMS).await;
    for _ in 0..201 {
        let (status, _) = app.vote("w", "x", "A_WINS", IP).await;
        assert_eq!(status, http::StatusCode::OK);
    }
    let votes = app
        .state
        .store
        .votes_after(0, i64::MAX)
        .await
        .expect("scan");
    assert_eq!(votes.len(), 201);
    assert_eq!(votes[0].multiplier, 1.0);
    assert_eq!(votes[199].multiplier, 1.0);
    assert!((votes[200].multiplier - 0.99875).abs() < 1e-9);
}

/// S6: a cache restart is detected by run id & the rebuild reproduces the pre-restart state
#[tokio::test]
async fn cache_restart_rebuild() {
    let app = TestApp::new(ITEMS).await;

    // Ten votes, snapshot, five more.
    let mut pair_ids = Vec::new();
    for i in 0..10 {
        let (a, b) = if i % 2 == 0 { ("w", "x") } else { ("y", "z") };
        let (pair_id, signature) = app.mint_pair(a, b);
        app.vote_with(a, b, "A_WINS", &pair_id, &signature, IP).await;
        pair_ids.push(pair_id);
    }
    app.wait_processed(10).await;
    app.state.snapshotter.snapshot(None).await.expect("snapshot");
    assert_eq!(
        app.state.store.last_snapshot_vote_id().await.unwrap(),
        10
    );

    for i in 0..5 {
        let (a, b) = if i % 2 == 0 { ("w", "y") } else { ("x", "z") };
        let (pair_id, signature) = app.mint_pair(a, b);
        app.vote_with(a, b, "B_WINS", &pair_id, &signature, IP).await;
        pair_ids.push(pair_id);
    }
    app.wait_processed(15).await;

    let before: Vec<_> = [
        app.item_stats("w").await,
        app.item_stats("x").await,
        app.item_stats("y").await,
        app.item_stats("z").await,
    ]
    .into_iter()
    .collect();
    let ranking_before = app.ranking_ids().await;

    // The cache dies & comes back empty with a new run id.
    app.mem.restart("in-memory-1");
    app.monitor.check_once().await;
    assert!(app.state.health.is_healthy(), "rebuild should complete");

    let after: Vec<_> = [
        app.item_stats("w").await,
        app.item_stats("x").await,
        app.item_stats("y").await,
        app.item_stats("z").await,
    ]
    .into_iter()
    .collect();
    for (b, a) in before.iter().zip(after.iter()) {
        assert!((b.score - a.score).abs() < 1e-9, "{:?} vs {:?}", b, a);
        assert!((b.total - a.total).abs() < 1e-9);
        assert!((b.win - a.win).abs() < 1e-9);
        assert!((b.rank_score - a.rank_score).abs() < 1e-9);
    }
    assert_eq!(ranking_before, app.ranking_ids().await);

    // Every one of the fifteen consumed pair ids survived into the rebuilt filter.
    for pair_id in &pair_ids {
        let hit = app
            .state
            .cache
            .run(Op::BfExists {
                key: duelrank::cache::PAIR_BLOOM_KEY.to_owned(),
                item: pair_id.clone(),
            })
            .await
            .expect("bloom")
            .into_bool()
            .expect("bool");
        assert!(hit, "pair id {} missing from the rebuilt filter", pair_id);
    }

    // And the checkpoint picked up where the replay left off.
    assert_eq!(app.state.processor.last_processed(), 15);
}

/// The pair endpoint deals real, distinct items & a verifiable token
#[tokio::test]
async fn pair_endpoint_deals_a_signed_matchup() {
    let app = TestApp::new(ITEMS).await;
    let (status, body) = app.get("/api/items/pair").await;
    assert_eq!(status, http::StatusCode::OK, "body: {}", body);
    let a = body["itemA"]["id"].as_str().unwrap().to_owned();
    let b = body["itemB"]["id"].as_str().unwrap().to_owned();
    assert_ne!(a, b);
    assert!(ITEMS.contains(&a.as_str()));
    assert!(ITEMS.contains(&b.as_str()));
    assert!(body["itemA"]["rank"].as_i64().unwrap() >= 1);

    // The signature it handed out is accepted by the vote endpoint.
    let pair_id = body["pairId"].as_str().unwrap();
    let signature = body["signature"].as_str().unwrap();
    let (status, rsp) = app.vote_with(&a, &b, "A_WINS", pair_id, signature, IP).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(rsp["message"], SILENT_SUCCESS_BODY);
    assert_eq!(app.vote_count().await, 1);
}

/// Excludes must come in pairs
#[tokio::test]
async fn asymmetric_excludes_are_rejected() {
    let app = TestApp::new(ITEMS).await;
    let (status, _) = app.get("/api/items/pair?excludeA=w").await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    let (status, body) = app.get("/api/items/pair?excludeA=w&excludeB=x").await;
    assert_eq!(status, http::StatusCode::OK);
    // Neither excluded item was dealt.
    for side in ["itemA", "itemB"] {
        let id = body[side]["id"].as_str().unwrap();
        assert!(id != "w" && id != "x", "dealt excluded item {}", id);
    }
}

/// Write paths 503 when the cache is degraded; the ranking read falls back to the snapshot
#[tokio::test]
async fn degraded_cache_blocks_writes_but_not_reads() {
    let app = TestApp::new(ITEMS).await;
    app.vote("w", "x", "A_WINS", IP).await;
    app.wait_processed(1).await;
    app.state.snapshotter.snapshot(None).await.expect("snapshot");

    // Sever the cache & let the poller notice.
    app.mem.set_failing(true);
    app.monitor.check_once().await;
    assert!(!app.state.health.is_healthy());

    let (status, _) = app.get("/api/items/pair").await;
    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = app.vote("w", "x", "A_WINS", IP).await;
    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);

    // The ranking endpoint serves the durable snapshot.
    let (status, body) = app.get("/api/items/ranking").await;
    assert_eq!(status, http::StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], "w");

    // Recovery flips the state machine back without a rebuild (same run id).
    app.mem.set_failing(false);
    app.monitor.check_once().await;
    assert!(app.state.health.is_healthy());
}

/// The single-item endpoint: 200 for catalog members, 404 otherwise
#[tokio::test]
async fn single_item_lookup() {
    let app = TestApp::new(ITEMS).await;
    let (status, body) = app.get("/api/items/w").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["id"], "w");
    assert!(body["imageUrl"].as_str().unwrap().contains("w.png"));
    let (status, _) = app.get("/api/items/nonesuch").await;
    assert_eq!(status, http::StatusCode::NOT_FOUND);
}
