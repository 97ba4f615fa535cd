//! Status/query HTTP interface tests over a real listener
//!
//! Run with: cargo test --test api

mod common;

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::ledger::Ledger;
use bridge_relayer::types::ChainSide;

use common::*;

struct TestServer {
    base: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<eyre::Result<()>>,
}

impl TestServer {
    async fn start(harness: &Harness) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let state = AppState {
            ledger: harness.ledger(),
            status: harness.status.clone(),
            validator_count: harness.validators.len(),
            quorum_threshold: harness.validators.threshold(),
        };
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(api::serve(listener, state, rx));
        Self {
            base: format!("http://{}", addr),
            shutdown,
            handle,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = reqwest::get(format!("{}{}", self.base, path)).await.unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

/// One confirmed transfer (nonce 1) and one failed transfer (nonce 2)
async fn populated() -> Harness {
    let harness = Harness::standard();
    harness.chain_a.add_event(lock_event(1, 100, 100));
    harness.chain_a.add_event(lock_event(2, 250, 101));
    harness.chain_a.set_head(120);
    harness.chain_b.set_head(50);

    let watcher = harness.watcher(ChainSide::A);
    let mut checkpoint = None;
    watcher.poll_once(&mut checkpoint).await.unwrap();
    harness.coordinator().process_due().await.unwrap();

    // Nonce 1 is older, so it takes the first submission slot
    let submitter = harness.submitter_with(bridge_relayer::config::SubmitterConfig {
        workers: 1,
        max_attempts: 1,
        ..submitter_config()
    });
    harness
        .chain_b
        .fail_next_submits(&["execution reverted: bad proof"]);
    harness.chain_b.set_head(50);
    submitter.process_due().await.unwrap();

    harness.chain_b.advance_head(CONFIRMATION_DEPTH);
    harness.tracker().process_due().await.unwrap();
    harness
}

#[tokio::test]
async fn test_get_single_event() {
    let harness = populated().await;
    let server = TestServer::start(&harness).await;

    let failed = harness
        .ledger
        .all_records()
        .into_iter()
        .find(|r| r.state == bridge_relayer::types::EventState::Failed)
        .expect("one failed record");
    let path = format!("/events/a/lock/{}", failed.event.nonce);
    let (status, body) = server.get(&path).await;
    assert_eq!(status, 200);
    assert_eq!(body["state"], "failed");
    assert_eq!(body["source_chain"], "a");
    assert_eq!(body["event_type"], "lock");
    assert_eq!(body["attempts"], 1);
    assert!(body["last_error"].as_str().unwrap().contains("reverted"));
    assert_eq!(body["signers"].as_array().unwrap().len(), 3);

    let (status, body) = server.get("/events/a/lock/999").await;
    assert_eq!(status, 404);
    assert!(body["error"].is_string());

    let (status, _) = server.get("/events/c/lock/1").await;
    assert_eq!(status, 400);
    let (status, _) = server.get("/events/a/mint/1").await;
    assert_eq!(status, 400);

    server.stop().await;
}

#[tokio::test]
async fn test_list_events_by_state() {
    let harness = populated().await;
    let server = TestServer::start(&harness).await;

    let (status, body) = server.get("/events").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);
    assert_eq!(body["limit"], 100);

    let (status, body) = server.get("/events?state=confirmed").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 1);
    let record = &body["records"][0];
    assert_eq!(record["state"], "confirmed");
    assert!(record["dest_tx_hash"].is_string());

    let (_, body) = server.get("/events?state=failed&chain=a").await;
    assert_eq!(body["count"], 1);

    let (_, body) = server.get("/events?chain=b").await;
    assert_eq!(body["count"], 0);

    let (_, body) = server.get("/events?limit=1&offset=1").await;
    assert_eq!(body["count"], 1);

    let (_, body) = server.get("/events?from=2100-01-01T00:00:00Z").await;
    assert_eq!(body["count"], 0);

    for bad in [
        "/events?state=done",
        "/events?limit=0",
        "/events?limit=1001",
        "/events?offset=-1",
        "/events?from=yesterday",
    ] {
        let (status, _) = server.get(bad).await;
        assert_eq!(status, 400, "{}", bad);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_stats() {
    let harness = populated().await;
    let server = TestServer::start(&harness).await;

    let (status, body) = server.get("/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["total_records"], 2);
    assert_eq!(body["records_by_state"]["confirmed"], 1);
    assert_eq!(body["records_by_state"]["failed"], 1);
    assert_eq!(body["records_by_state"]["observed"], 0);
    assert_eq!(body["validators"], 5);
    assert_eq!(body["quorum_threshold"], 3);
    assert_eq!(body["checkpoints"]["a"], 110);
    assert!(body["checkpoints"]["b"].is_null());

    server.stop().await;
}

#[tokio::test]
async fn test_health_reflects_polls_and_fatal_flag() {
    let harness = Harness::standard();
    harness.chain_a.set_head(50);
    harness.chain_b.set_head(50);
    let server = TestServer::start(&harness).await;

    // Neither chain polled yet
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 503);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["validator_set_sufficient"], true);

    for side in ChainSide::ALL {
        let mut checkpoint = None;
        harness
            .watcher(side)
            .poll_once(&mut checkpoint)
            .await
            .unwrap();
    }
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["chains"]["a"]["checkpoint"], 40);
    assert!(body["chains"]["b"]["last_successful_poll"].is_string());
    assert!(body["fatal"].is_null());

    harness
        .status
        .set_fatal("watchers: reorg detected on chain a")
        .await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 503);
    assert!(body["fatal"].as_str().unwrap().contains("reorg"));

    server.stop().await;
}

#[tokio::test]
async fn test_insufficient_validator_set_is_unhealthy() {
    let harness = Harness::new(validator_set(honest_validators(2), 3));
    let server = TestServer::start(&harness).await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 503);
    assert_eq!(body["validator_set_sufficient"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_liveness_metrics_and_no_mutation_routes() {
    let harness = populated().await;
    let server = TestServer::start(&harness).await;

    let response = reqwest::get(format!("{}/healthz", server.base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let response = reqwest::get(format!("{}/metrics", server.base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("relayer_events_observed_total"));

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/events", server.base))
        .json(&serde_json::json!({ "state": "confirmed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);

    server.stop().await;
}

#[tokio::test]
async fn test_storage_outage_returns_unavailable() {
    let harness = populated().await;
    let server = TestServer::start(&harness).await;
    harness.ledger.set_unavailable(true);

    let (status, body) = server.get("/events/a/lock/1").await;
    assert_eq!(status, 503);
    assert!(body["error"].is_string());

    harness.ledger.set_unavailable(false);
    let (status, _) = server.get("/events/a/lock/1").await;
    assert_eq!(status, 200);

    server.stop().await;
    assert_eq!(harness.ledger.count_by_state().await.unwrap().len(), 7);
}
