//! Full round-trips through the authenticated inbound API.

mod helpers;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pollwatch::aggregator::DataAggregator;
use pollwatch::api::{self, ApiState};
use pollwatch::monitor::MonitorStatus;
use pollwatch::outbound::OutboundClient;
use pollwatch::pool::{PoolTelemetry, WorkerPool};
use pollwatch::types::ServerStatus;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::time::timeout;

use helpers::{signed_empty, signed_envelope, test_secret};

struct TestServer {
    base_url: String,
    pool: Arc<WorkerPool>,
    client: reqwest::Client,
    secret: Vec<u8>,
    _shutdown_tx: watch::Sender<()>,
    _controller: mockito::ServerGuard,
}

impl TestServer {
    async fn start() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let secret = test_secret();

        // Outbound reports land on a mock controller that accepts anything.
        let mut controller = mockito::Server::new_async().await;
        controller
            .mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "OK"}"#)
            .create_async()
            .await;

        let outbound = Arc::new(
            OutboundClient::new(url::Url::parse(&controller.url()).unwrap(), secret.clone())
                .unwrap(),
        );
        let telemetry = Arc::new(PoolTelemetry::new(2));
        let aggregator =
            DataAggregator::start(outbound, telemetry.clone(), "test-region", shutdown_rx.clone());

        let (_headers_tx, headers_rx) =
            watch::channel::<pollwatch::monitor::DefaultHeaders>(Arc::new(BTreeMap::new()));
        let pool = Arc::new(
            WorkerPool::start(2, aggregator, telemetry, headers_rx, shutdown_rx.clone()).unwrap(),
        );

        let state = Arc::new(ApiState {
            pool: pool.clone(),
            inbound_secret: Arc::new(RwLock::new(secret.clone())),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(api::serve(listener, state, shutdown_rx));

        Self {
            base_url,
            pool,
            client: reqwest::Client::new(),
            secret,
            _shutdown_tx: shutdown_tx,
            _controller: controller,
        }
    }

    async fn post(&self, path: &str, payload: &Value) -> (u16, Value) {
        let envelope = signed_envelope(&self.secret, payload);
        self.post_raw(path, &envelope).await
    }

    async fn post_empty(&self, path: &str) -> (u16, Value) {
        let envelope = signed_empty(&self.secret);
        self.post_raw(path, &envelope).await
    }

    async fn post_raw(&self, path: &str, envelope: &Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(envelope)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }
}

fn scenario_customer() -> Value {
    json!({
        "7": {
            "polling_interval": 30,
            "ping": true,
            "ssl_expiration": false,
            "latency": true,
            "multi_region": false,
            "host_schemes": {
                "11": {
                    "url": "https://a/",
                    "monitors": {
                        "101": {
                            "uri": "/",
                            "method": "get",
                            "content_check_mode": "no_check"
                        }
                    }
                }
            }
        }
    })
}

#[tokio::test]
async fn customer_add_full_round_trip() {
    let server = TestServer::start().await;

    // A fake pinger captures the host registration.
    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("pinger.sock");
    let pinger = UnixListener::bind(&socket_path).unwrap();
    server.pool.ping_controller().connect(socket_path);

    let (status, body) = server.post("/customer/add", &scenario_customer()).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");

    let customer = server.pool.get_customer(7).await.expect("customer not found");
    assert_eq!(customer.polling_interval, 30);
    assert!(customer.supports_ping_testing);
    assert!(customer.supports_latency_measurements);
    assert!(!customer.supports_multi_region_testing);

    let monitor = server.pool.get_monitor(101).await.expect("monitor not found");
    assert_eq!(monitor.customer_id, 7);
    assert_eq!(monitor.host_scheme_id, 11);
    assert_eq!(monitor.status, MonitorStatus::Unknown);

    let host_scheme = server.pool.get_host_scheme(11).await.expect("host/scheme not found");
    assert_eq!(host_scheme.customer_id, 7);
    assert_eq!(host_scheme.monitor_ids, vec![101]);

    // The pinger received the host keyed by its host/scheme id.
    let (stream, _) = timeout(Duration::from_secs(10), pinger.accept())
        .await
        .expect("ping controller never connected")
        .unwrap();
    let mut reader = tokio::io::BufReader::new(stream);
    let mut line = String::new();
    timeout(Duration::from_secs(10), reader.read_line(&mut line))
        .await
        .expect("no pinger command")
        .unwrap();
    assert_eq!(line.trim_end(), "A 11 a");
}

#[tokio::test]
async fn customer_add_replaces_idempotently() {
    let server = TestServer::start().await;

    let (_, body) = server.post("/customer/add", &scenario_customer()).await;
    assert_eq!(body["status"], "OK");

    // Same customer id, different monitor set.
    let replacement = json!({
        "7": {
            "polling_interval": 30,
            "host_schemes": {
                "11": {
                    "url": "https://a/",
                    "monitors": {
                        "102": {"uri": "/health"}
                    }
                }
            }
        }
    });
    let (_, body) = server.post("/customer/add", &replacement).await;
    assert_eq!(body["status"], "OK");

    assert!(server.pool.get_monitor(101).await.is_none());
    assert!(server.pool.get_monitor(102).await.is_some());
    let customer = server.pool.get_customer(7).await.unwrap();
    assert!(!customer.supports_ping_testing);
}

#[tokio::test]
async fn one_invalid_customer_rejects_the_whole_batch() {
    let server = TestServer::start().await;

    let batch = json!({
        "8": {
            "polling_interval": 30,
            "host_schemes": {}
        },
        "9": {
            "polling_interval": 5,
            "host_schemes": {}
        }
    });
    let (status, body) = server.post("/customer/add", &batch).await;
    assert_eq!(status, 200);
    let reported = body["status"].as_str().unwrap();
    assert!(reported.starts_with("failed"), "unexpected status {reported}");

    // The valid customer in the batch was not adopted either.
    assert!(server.pool.get_customer(8).await.is_none());
}

#[tokio::test]
async fn customer_remove_reports_unknown_ids() {
    let server = TestServer::start().await;

    let (_, body) = server.post("/customer/add", &scenario_customer()).await;
    assert_eq!(body["status"], "OK");

    let (_, body) = server.post("/customer/remove", &json!({"customer_id": 7})).await;
    assert_eq!(body["status"], "OK");
    assert!(server.pool.get_customer(7).await.is_none());

    let (_, body) = server.post("/customer/remove", &json!({"customer_id": 7})).await;
    assert_eq!(body["status"], "failed, unknown customer ID");

    let (_, body) = server.post("/customer/remove", &json!({"customer_id": 0})).await;
    assert_eq!(body["status"], "failed, invalid customer ID");
}

#[tokio::test]
async fn pause_short_circuits_probing_state() {
    let server = TestServer::start().await;

    let (_, body) = server.post("/customer/add", &scenario_customer()).await;
    assert_eq!(body["status"], "OK");

    let (_, body) = server
        .post("/customer/pause", &json!({"customer_id": 7, "pause": true}))
        .await;
    assert_eq!(body["status"], "OK");
    assert!(server.pool.get_customer(7).await.unwrap().paused);

    let (_, body) = server
        .post("/customer/pause", &json!({"customer_id": 7, "pause": false}))
        .await;
    assert_eq!(body["status"], "OK");
    assert!(!server.pool.get_customer(7).await.unwrap().paused);
}

#[tokio::test]
async fn state_endpoints_toggle_the_pool() {
    let server = TestServer::start().await;
    assert_eq!(server.pool.status(), ServerStatus::Inactive);

    let (status, body) = server.post_empty("/state/active").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");
    assert_eq!(server.pool.status(), ServerStatus::Active);

    let (_, body) = server.post_empty("/state/inactive").await;
    assert_eq!(body["status"], "OK");
    assert_eq!(server.pool.status(), ServerStatus::Inactive);
}

#[tokio::test]
async fn region_change_validates_and_activates() {
    let server = TestServer::start().await;

    let (_, body) = server
        .post("/region/change", &json!({"region_index": 2, "number_regions": 2}))
        .await;
    assert_eq!(body["status"], "failed, invalid parameters");
    assert_eq!(server.pool.status(), ServerStatus::Inactive);

    let (_, body) = server
        .post("/region/change", &json!({"region_index": 1, "number_regions": 2}))
        .await;
    assert_eq!(body["status"], "OK");
    assert_eq!(server.pool.status(), ServerStatus::Active);
}

#[tokio::test]
async fn loading_get_reports_grouped_timer_health() {
    let server = TestServer::start().await;

    let (_, body) = server.post("/customer/add", &scenario_customer()).await;
    assert_eq!(body["status"], "OK");

    let (status, body) = server.post_empty("/loading/get").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");
    assert!(body["data"]["cpu"].is_number());
    assert!(body["data"]["memory"].is_number());
    // A single-region customer with a 30 s interval shows up under the
    // single_region group.
    assert!(body["data"]["single_region"]["30"].is_array());
}

#[tokio::test]
async fn bad_signatures_are_rejected() {
    let server = TestServer::start().await;

    let mut wrong_secret = test_secret();
    wrong_secret[0] ^= 0xFF;
    let envelope = signed_envelope(&wrong_secret, &scenario_customer());
    let (status, _) = server.post_raw("/customer/add", &envelope).await;
    assert_eq!(status, 401);

    assert!(server.pool.get_customer(7).await.is_none());
}

#[tokio::test]
async fn malformed_envelopes_are_bad_requests() {
    let server = TestServer::start().await;
    let (status, _) = server
        .post_raw("/customer/add", &json!({"not": "an envelope"}))
        .await;
    assert_eq!(status, 400);
}
