//! Probe execution against a mock endpoint: header rules, bodies, and
//! failure classification.

use std::collections::BTreeMap;
use std::sync::Arc;

use pollwatch::monitor::{
    execute_probe, ContentCheckMode, HttpMethod, Monitor, PostContentType, DEFAULT_USER_AGENT,
};
use url::Url;

fn monitor(method: HttpMethod, user_agent: &str, body: &[u8]) -> Monitor {
    Monitor::new(
        101,
        "/probe".to_string(),
        method,
        ContentCheckMode::NoCheck,
        Vec::new(),
        PostContentType::Json,
        user_agent.to_string(),
        body.to_vec(),
    )
}

fn headers(pairs: &[(&str, &str)]) -> Arc<BTreeMap<String, String>> {
    Arc::new(
        pairs
            .iter()
            .map(|&(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    )
}

#[tokio::test]
async fn get_requests_carry_default_headers_and_no_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/probe")
        .match_header("user-agent", DEFAULT_USER_AGENT)
        .match_header("x-region", "eu-1")
        .with_status(200)
        .with_body("pong")
        .create_async()
        .await;

    let m = monitor(HttpMethod::Get, "", b"ignored");
    let spec = m.probe_spec(
        &Url::parse(&server.url()).unwrap(),
        headers(&[("x-region", "eu-1")]),
    );
    assert!(spec.body.is_empty());

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    let success = outcome.result.expect("probe should succeed");
    assert_eq!(success.body, b"pong");
    mock.assert_async().await;
}

#[tokio::test]
async fn default_header_user_agent_applies_without_an_override() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/probe")
        .match_header("user-agent", "FleetProbe/2")
        .with_status(200)
        .create_async()
        .await;

    let m = monitor(HttpMethod::Get, "", &[]);
    let spec = m.probe_spec(
        &Url::parse(&server.url()).unwrap(),
        headers(&[("user-agent", "FleetProbe/2")]),
    );

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    assert!(outcome.result.is_ok());
    mock.assert_async().await;
}

#[tokio::test]
async fn get_requests_ignore_the_monitor_user_agent() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/probe")
        .match_header("user-agent", DEFAULT_USER_AGENT)
        .with_status(200)
        .create_async()
        .await;

    // The monitor carries an override, but bodyless methods never use it.
    let m = monitor(HttpMethod::Get, "TenantAgent/1", &[]);
    let spec = m.probe_spec(&Url::parse(&server.url()).unwrap(), headers(&[]));
    assert!(spec.user_agent.is_none());

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    assert!(outcome.result.is_ok());
    mock.assert_async().await;
}

#[tokio::test]
async fn monitor_user_agent_overrides_the_default_header() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/probe")
        .match_header("user-agent", "TenantAgent/1")
        .match_header("content-type", "application/json")
        .match_body(r#"{"ping": true}"#)
        .with_status(200)
        .create_async()
        .await;

    let m = monitor(HttpMethod::Post, "TenantAgent/1", br#"{"ping": true}"#);
    let spec = m.probe_spec(
        &Url::parse(&server.url()).unwrap(),
        headers(&[("user-agent", "FleetProbe/2")]),
    );

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    assert!(outcome.result.is_ok());
    mock.assert_async().await;
}

#[tokio::test]
async fn http_error_statuses_take_the_failed_path() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/probe")
        .with_status(503)
        .create_async()
        .await;

    let m = monitor(HttpMethod::Get, "", &[]);
    let spec = m.probe_spec(&Url::parse(&server.url()).unwrap(), headers(&[]));

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    assert!(outcome.result.is_err());
}

#[tokio::test]
async fn connection_refusal_takes_the_failed_path() {
    let m = monitor(HttpMethod::Get, "", &[]);
    // Nothing listens on this port.
    let spec = m.probe_spec(&Url::parse("http://127.0.0.1:9/").unwrap(), headers(&[]));

    let outcome = execute_probe(reqwest::Client::new(), spec).await;
    assert!(outcome.result.is_err());
}
