//! Integration tests for the HTTP surface, served on an ephemeral port and
//! driven with a real HTTP client.

use async_trait::async_trait;
use connector_runtime::cache::{cache_key, SetOptions};
use connector_runtime::config::parse_config;
use connector_runtime::error::TransportError;
use connector_runtime::models::{RequestSpec, Response};
use connector_runtime::runtime::ConnectorRuntime;
use connector_runtime::server::router;
use connector_runtime::transport::Transport;
use connector_runtime::webhook::sign;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "s3cr3t";

/// Always answers 503, so every call fails fast into the breaker.
struct DownUpstream;

#[async_trait]
impl Transport for DownUpstream {
    async fn send(
        &self,
        _request: &RequestSpec,
        _timeout: Duration,
    ) -> Result<Response, TransportError> {
        Ok(Response::new(503, "maintenance"))
    }
}

async fn start_server() -> (String, Arc<ConnectorRuntime>) {
    let config = parse_config(&format!(
        r#"
        [executor]
        max_retries = 0

        [circuit_breaker]
        failure_threshold = 1

        [sync]
        webhook_secret = "{}"
        "#,
        SECRET
    ))
    .unwrap();
    let runtime = Arc::new(ConnectorRuntime::init_with(config, Arc::new(DownUpstream), None).unwrap());

    // Find a free port
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let addr = format!("127.0.0.1:{}", port);
    let app = router(runtime.clone());
    let bind = addr.clone();
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{}", addr);
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client.get(format!("{}/health", base)).send().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    (base, runtime)
}

#[tokio::test]
async fn health_reports_open_circuits() {
    let (base, runtime) = start_server().await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["open_circuits"], json!([]));

    let _ = runtime
        .executor()
        .execute("confluence:eng", &RequestSpec::get("https://wiki.example.com/x"), None)
        .await;

    let resp: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "degraded");
    assert_eq!(resp["open_circuits"], json!(["confluence:eng"]));
}

#[tokio::test]
async fn stats_snapshot_is_json() {
    let (base, _runtime) = start_server().await;
    let resp = reqwest::Client::new()
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["executor"]["total_requests"], 0);
    assert_eq!(body["cache"]["size"], 0);
    assert_eq!(body["sync"]["state"], "stopped");
}

#[tokio::test]
async fn webhook_with_bad_signature_is_unauthorized() {
    let (base, _runtime) = start_server().await;
    let body = r#"{"scope":"acme/docs","kind":"updated","path":"a.md"}"#;

    let resp = reqwest::Client::new()
        .post(format!("{}/webhooks", base))
        .header("X-Hub-Signature-256", sign("wrong", body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_signature");
}

#[tokio::test]
async fn signed_webhook_invalidates_cached_path() {
    let (base, runtime) = start_server().await;
    runtime
        .cache()
        .set(&cache_key("acme/docs", "a.md"), Vec::new(), SetOptions::default())
        .await
        .unwrap();
    runtime
        .cache()
        .set(&cache_key("acme/blog", "b.md"), Vec::new(), SetOptions::default())
        .await
        .unwrap();

    let body = r#"{"scope":"acme/docs","kind":"updated","path":"a.md"}"#;
    let resp = reqwest::Client::new()
        .post(format!("{}/webhooks", base))
        .header("X-Hub-Signature-256", sign(SECRET, body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["accepted"], 1);
    assert_eq!(ack["events"][0]["source_scope"], "acme/docs");
    assert_eq!(runtime.cache().len(), 1);
}

#[tokio::test]
async fn manual_invalidation() {
    let (base, runtime) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/cache/invalidate", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "bad_request");

    for path in ["a.md", "b.md"] {
        runtime
            .cache()
            .set(&cache_key("acme/docs", path), Vec::new(), SetOptions::default())
            .await
            .unwrap();
    }
    runtime
        .cache()
        .set("other", Vec::new(), SetOptions::default().tag("team:ops"))
        .await
        .unwrap();

    let resp: Value = client
        .post(format!("{}/cache/invalidate", base))
        .json(&json!({ "scope": "acme/docs", "tags": ["team:ops"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["removed"], 3);
    assert!(runtime.cache().is_empty());
}
