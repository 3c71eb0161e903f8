//! Remote transport integration tests
//!
//! Drives the reconnect supervisor, heartbeat, refresh and dispatch paths
//! against the in-memory resolver and connector on a paused clock.

use pm2io_transport::transport::remote::mock::{MockConnector, MockResolver};
use pm2io_transport::{
    ActionRegistry, AgentConfig, Dispatcher, RemoteTransport, SessionState, Transport,
    TransportError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config() -> AgentConfig {
    AgentConfig {
        public_key: "pub".to_string(),
        private_key: "priv".to_string(),
        server_name: "web-1".to_string(),
        name: "api".to_string(),
        version: "5.3.0".to_string(),
        ..Default::default()
    }
}

fn registry() -> Arc<ActionRegistry> {
    let registry = Arc::new(ActionRegistry::new());
    registry
        .add("Test", |_| json!("I am the test answer"))
        .unwrap();
    registry
}

fn remote(resolver: &Arc<MockResolver>, connector: &Arc<MockConnector>) -> RemoteTransport {
    RemoteTransport::with_parts(
        config(),
        Arc::new(Dispatcher::new(registry())),
        resolver.clone(),
        connector.clone(),
        "10.0.0.2",
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Poll until `check` holds, giving spawned tasks time to run
async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

async fn connected(
    resolver: &Arc<MockResolver>,
    connector: &Arc<MockConnector>,
) -> RemoteTransport {
    let transport = remote(resolver, connector);
    transport.connect();
    settle().await;
    assert!(transport.is_connected());
    transport
}

// ─── Connection lifecycle ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_connect_sends_handshake_headers() {
    let resolver = Arc::new(MockResolver::fixed("wss://eu1.pm2.io"));
    let connector = Arc::new(MockConnector::new());
    let _transport = connected(&resolver, &connector).await;

    let session = connector.last_session().unwrap();
    assert_eq!(session.endpoint, "wss://eu1.pm2.io");

    let headers = session.handshake.headers();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(header("x-km-public"), "pub");
    assert_eq!(header("x-km-secret"), "priv");
    assert_eq!(header("x-km-server"), "web-1");
    assert_eq!(header("x-pm2-version"), "5.3.0");
    assert_eq!(header("x-protocol-version"), "1");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_connect_is_idempotent() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = remote(&resolver, &connector);

    transport.connect();
    transport.connect();
    transport.connect();
    settle().await;
    transport.connect();
    settle().await;

    assert_eq!(connector.dials(), 1);
    assert_eq!(resolver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dial_failures_never_overlap() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    connector.fail_next(3);
    connector.set_dial_delay(Duration::from_secs(1));

    let transport = remote(&resolver, &connector);
    transport.connect();
    for _ in 0..10 {
        transport.connect();
        transport.close_and_reconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(connector.max_in_flight(), 1);
    assert_eq!(connector.dials(), 4);
    assert!(transport.is_connected());
    // Dial failures keep the cached endpoint
    assert_eq!(resolver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resolution_failure_retries_after_backoff() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    resolver.fail_next(2);
    let connector = Arc::new(MockConnector::new());

    let transport = remote(&resolver, &connector);
    transport.connect();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(resolver.calls(), 1);
    assert_eq!(transport.state(), SessionState::Disconnected);
    assert_eq!(connector.dials(), 0);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(resolver.calls(), 3);
    assert!(transport.is_connected());
    assert_eq!(transport.endpoint().as_deref(), Some("wss://a"));
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_reconnects_without_close_frame() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    let first = connector.last_session().unwrap();
    first.close_from_peer();
    settle().await;

    assert_eq!(connector.dials(), 2);
    assert!(transport.is_connected());
    assert!(!first.was_closed());
}

#[tokio::test(start_paused = true)]
async fn test_read_error_reconnects_and_closes_old_socket() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    let first = connector.last_session().unwrap();
    first.push_error(TransportError::Connection("reset by peer".to_string()));
    settle().await;

    assert_eq!(connector.dials(), 2);
    assert!(transport.is_connected());
    assert!(first.was_closed());
}

#[tokio::test(start_paused = true)]
async fn test_close_and_reconnect_replaces_session() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    transport.close_and_reconnect();
    settle().await;

    let sessions = connector.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].was_closed());
    assert!(!sessions[1].was_closed());
    assert!(transport.is_connected());
}

// ─── Heartbeat ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeat_only_while_connected() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;
    let session = connector.last_session().unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(session.pings(), 3);

    // Lose the session and keep every redial failing
    connector.fail_next(1_000);
    session.close_from_peer();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!transport.is_connected());
    assert_eq!(session.pings(), 3);
    assert_eq!(connector.sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_triggers_one_reconnect() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    let first = connector.last_session().unwrap();
    first.fail_writes();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(connector.dials(), 2);
    assert!(transport.is_connected());

    // The new session keeps beating; no further reconnects
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.dials(), 2);
    assert_eq!(connector.last_session().unwrap().pings(), 1);
}

// ─── Sending ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_is_dropped() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = remote(&resolver, &connector);

    transport.send("human:event", json!({"lost": true}));
    transport.send_json(json!({"channel": "raw"}));
    assert!(connector.sessions().is_empty());

    transport.connect();
    settle().await;

    // Dropped frames are not replayed on the new session
    assert!(connector.last_session().unwrap().sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_reconnects() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    connector.last_session().unwrap().fail_writes();
    transport.send("axm:monitor", json!({"cpu": 3}));
    settle().await;

    assert_eq!(connector.dials(), 2);
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_status_is_wrapped_not_fanned_out() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    transport.send(
        "status",
        json!({"process": [{"name": "api", "axm_actions": [{"action_name": "A"}]}], "server": {}}),
    );
    settle().await;

    let frames = connector.last_session().unwrap().texts();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["channel"], "status");
    assert_eq!(frames[0]["payload"]["data"]["process"][0]["name"], "api");
}

// ─── Refresh ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_refresh_reconnects_only_on_endpoint_change() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    tokio::time::sleep(Duration::from_secs(601)).await;
    assert_eq!(resolver.calls(), 2);
    assert_eq!(connector.dials(), 1);

    resolver.set_endpoint("wss://b");
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(connector.dials(), 2);
    assert_eq!(connector.last_session().unwrap().endpoint, "wss://b");
    assert_eq!(transport.endpoint().as_deref(), Some("wss://b"));
    assert!(connector.sessions()[0].was_closed());
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_keeps_endpoint() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    resolver.fail_next(1);
    tokio::time::sleep(Duration::from_secs(601)).await;

    assert_eq!(resolver.calls(), 2);
    assert_eq!(connector.dials(), 1);
    assert_eq!(transport.endpoint().as_deref(), Some("wss://a"));
    assert!(transport.is_connected());
}

// ─── Inbound dispatch ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_trigger_action_replies_success_then_result() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let _transport = connected(&resolver, &connector).await;
    let session = connector.last_session().unwrap();

    session.push_inbound(
        json!({"channel": "trigger:action", "payload": {"action_name": "Test", "process_id": 42}})
            .to_string(),
    );
    wait_for(|| session.texts().len() == 2).await;

    let frames = session.texts();
    assert_eq!(frames[0]["channel"], "trigger:action:success");
    assert_eq!(
        frames[0]["payload"]["data"],
        json!({"success": true, "id": 42, "action_name": "Test"})
    );
    assert_eq!(frames[1]["channel"], "axm:reply");
    assert_eq!(
        frames[1]["payload"]["data"],
        json!({"action_name": "Test", "return": "I am the test answer"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_action_replies_failure() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let _transport = connected(&resolver, &connector).await;
    let session = connector.last_session().unwrap();

    session.push_inbound(
        json!({"channel": "trigger:action", "payload": {"action_name": "Nope", "process_id": 1}})
            .to_string(),
    );
    wait_for(|| !session.texts().is_empty()).await;
    settle().await;

    let frames = session.texts();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["channel"], "trigger:action:failure");
    let data: &Value = &frames[0]["payload"]["data"];
    assert_eq!(data["success"], false);
    assert_eq!(data["id"], 1);
    assert_eq!(data["action_name"], "Nope");
    assert!(data["err"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_start_logging_reply_is_sent_raw() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let _transport = connected(&resolver, &connector).await;
    let session = connector.last_session().unwrap();

    session.push_inbound(
        r#"{"channel":"trigger:pm2:action","payload":{"method_name":"startLogging"}}"#,
    );
    session.push_inbound(
        r#"{"channel":"trigger:pm2:action","payload":{"method_name":"stopLogging"}}"#,
    );
    wait_for(|| !session.texts().is_empty()).await;
    settle().await;

    assert_eq!(
        session.texts(),
        vec![json!({"channel": "trigger:pm2:result", "payload": {"ret": {"err": null}}})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_keeps_session() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;
    let session = connector.last_session().unwrap();

    session.push_inbound("{oops");
    session.push_inbound(r#"{"channel":"somewhere:else","payload":{}}"#);
    session.push_inbound(
        json!({"channel": "trigger:action", "payload": {"action_name": "Test", "process_id": 0}})
            .to_string(),
    );
    wait_for(|| session.texts().len() == 2).await;

    assert!(transport.is_connected());
    assert_eq!(connector.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconnecting() {
    let resolver = Arc::new(MockResolver::fixed("wss://a"));
    let connector = Arc::new(MockConnector::new());
    let transport = connected(&resolver, &connector).await;

    transport.shutdown().await;
    assert!(!transport.is_connected());
    assert!(connector.last_session().unwrap().was_closed());

    transport.close_and_reconnect();
    tokio::time::sleep(Duration::from_secs(700)).await;
    assert_eq!(connector.dials(), 1);
    assert_eq!(resolver.calls(), 1);
}
