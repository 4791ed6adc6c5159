mod harness;

use harness::config::{ADMIN_TENANT_TOKEN, ConfigBuilder, TENANT_TOKEN, TestChannel};
use harness::mock_upstream::MockUpstream;
use harness::server::TestServer;
use serde_json::{Value, json};

const VIDEO_COST: i64 = 500;

async fn submit(server: &TestServer) -> Value {
    let resp = server
        .client()
        .post(server.url("/v1/videos"))
        .bearer_auth(TENANT_TOKEN)
        .json(&json!({ "model": "sora-2", "prompt": "a lighthouse at dusk", "seconds": "4" }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

async fn fetch(server: &TestServer, token: &str, id: &str) -> reqwest::Response {
    server
        .client()
        .get(server.url(&format!("/v1/videos/{id}")))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
}

async fn setup() -> (TestServer, MockUpstream) {
    let upstream = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_channel(TestChannel::new(1, &upstream.base_url()))
        .build();

    let server = TestServer::start(config).await.unwrap();
    (server, upstream)
}

#[tokio::test]
async fn submission_charges_quote_and_is_visible_to_owner_only() {
    let (server, upstream) = setup().await;

    let task = submit(&server).await;
    assert_eq!(task["object"], "video");
    assert_eq!(task["model"], "sora-2");
    assert_eq!(task["status"], "SUBMITTED");
    assert_eq!(upstream.video_count(), 1);
    assert_eq!(server.balance(7).await, 100_000 - VIDEO_COST);

    let id = task["id"].as_str().unwrap();

    let own = fetch(&server, TENANT_TOKEN, id).await;
    assert_eq!(own.status(), 200);
    let own: Value = own.json().await.unwrap();
    assert_eq!(own["id"], id);

    let foreign = fetch(&server, ADMIN_TENANT_TOKEN, id).await;
    assert_eq!(foreign.status(), 404);

    let missing = fetch(&server, TENANT_TOKEN, "task_does_not_exist").await;
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn completed_task_keeps_its_fixed_price() {
    let (server, upstream) = setup().await;

    let id = submit(&server).await["id"].as_str().unwrap().to_owned();

    upstream.set_video_status(json!({ "status": "in_progress", "progress": 40 }));
    let report = server.gateway().reconciler().unwrap().sweep().await.unwrap();
    assert_eq!(report.updated, 1);

    let view: Value = fetch(&server, TENANT_TOKEN, &id).await.json().await.unwrap();
    assert_eq!(view["status"], "IN_PROGRESS");
    assert_eq!(view["progress"], "40%");

    upstream.set_video_status(json!({
        "status": "completed",
        "progress": 100,
        "url": "https://cdn.example/lighthouse.mp4"
    }));
    let report = server.gateway().reconciler().unwrap().sweep().await.unwrap();
    assert_eq!(report.refunded, 0);

    let view: Value = fetch(&server, TENANT_TOKEN, &id).await.json().await.unwrap();
    assert_eq!(view["status"], "SUCCESS");
    assert_eq!(view["progress"], "100%");
    assert_eq!(view["url"], "https://cdn.example/lighthouse.mp4");
    assert!(view["completed_at"].is_i64());

    assert_eq!(server.balance(7).await, 100_000 - VIDEO_COST);
}

#[tokio::test]
async fn failed_task_is_refunded_once() {
    let (server, upstream) = setup().await;

    let id = submit(&server).await["id"].as_str().unwrap().to_owned();

    upstream.set_video_status(json!({ "status": "failed", "error": { "message": "content policy" } }));

    let reconciler = server.gateway().reconciler().unwrap();
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.refunded, 1);

    let view: Value = fetch(&server, TENANT_TOKEN, &id).await.json().await.unwrap();
    assert_eq!(view["status"], "FAILURE");
    assert_eq!(view["error"], "content policy");
    assert_eq!(server.balance(7).await, 100_000);

    // terminal tasks are no longer polled
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.refunded, 0);
    assert_eq!(server.balance(7).await, 100_000);
}

#[tokio::test]
async fn rejected_submission_is_refunded() {
    let upstream = MockUpstream::start_scripted(&[400]).await.unwrap();
    let config = ConfigBuilder::new()
        .with_channel(TestChannel::new(1, &upstream.base_url()))
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/videos"))
        .bearer_auth(TENANT_TOKEN)
        .json(&json!({ "model": "sora-2", "prompt": "nope" }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    assert_eq!(server.balance(7).await, 100_000);
}
