//! End-to-end tests: a real listener on port 0 driven over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_core::errors::GatewayError;
use tether_core::ids::SessionId;
use tether_core::logs::{LogSink, NullLogSink};
use tether_core::messages::ToolCall;
use tether_core::protocol::{Body, ClientLogRecord, Envelope, EnvelopeKind, StatusKind};
use tether_core::provider::LlmProvider;
use tether_engine::{AgentConfig, ToolRegistry, FALLBACK_REPLY};
use tether_llm::mock::{MockProvider, MockResponse};
use tether_server::{ServerConfig, ServerHandle, TurnOrchestrator, BUSY_MESSAGE};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(
    provider: Arc<dyn LlmProvider>,
    max_steps: u32,
    log_sink: Arc<dyn LogSink>,
) -> ServerHandle {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    start_with_config(provider, max_steps, log_sink, config).await
}

async fn start_with_config(
    provider: Arc<dyn LlmProvider>,
    max_steps: u32,
    log_sink: Arc<dyn LogSink>,
    config: ServerConfig,
) -> ServerHandle {
    let orchestrator = Arc::new(TurnOrchestrator::new(
        provider,
        Arc::new(ToolRegistry::new()),
        "You are a test assistant.",
        AgentConfig {
            max_steps,
            ..Default::default()
        },
    ));
    tether_server::start(config, orchestrator, log_sink, None)
        .await
        .unwrap()
}

async fn mock_server(responses: Vec<MockResponse>) -> ServerHandle {
    start_server(Arc::new(MockProvider::new(responses)), 100, Arc::new(NullLogSink)).await
}

/// Connect and consume the greeting.
async fn connect(handle: &ServerHandle) -> Ws {
    let url = format!("ws://127.0.0.1:{}/ws", handle.port());
    let (mut ws, _) = connect_async(&url).await.unwrap();
    let hello = next_envelope(&mut ws).await;
    match hello.body {
        Body::SystemStatus(p) => {
            assert_eq!(p.status, StatusKind::Connected);
            assert_eq!(p.message, "Connected to server");
        }
        other => panic!("expected connected status, got {other:?}"),
    }
    ws
}

async fn send(ws: &mut Ws, envelope: &Envelope) {
    ws.send(Message::text(envelope.encode())).await.unwrap();
}

async fn next_envelope(ws: &mut Ws) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

/// Read envelopes up to and including the first of `kind`.
async fn read_until(ws: &mut Ws, kind: EnvelopeKind) -> Vec<Envelope> {
    let mut out = Vec::new();
    loop {
        let env = next_envelope(ws).await;
        let done = env.kind() == Some(kind);
        out.push(env);
        if done {
            return out;
        }
    }
}

async fn health_sessions(handle: &ServerHandle) -> u64 {
    let url = format!("http://127.0.0.1:{}/health", handle.port());
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    body["sessions"].as_u64().unwrap()
}

#[tokio::test]
async fn sessions_are_tracked_while_open() {
    let handle = mock_server(vec![]).await;
    assert_eq!(health_sessions(&handle).await, 0);

    let mut ws = connect(&handle).await;
    assert_eq!(health_sessions(&handle).await, 1);
    assert_eq!(handle.registry().snapshot().total_sessions, 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if health_sessions(&handle).await == 0 {
            handle.shutdown().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session was not released after close");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let handle = mock_server(vec![]).await;
    let mut ws = connect(&handle).await;

    let ping = Envelope::ping();
    send(&mut ws, &ping).await;

    let pong = next_envelope(&mut ws).await;
    assert_eq!(pong.kind(), Some(EnvelopeKind::Pong));
    assert_eq!(pong.reply_to, Some(ping.id.clone()));
    assert!(pong.timestamp >= ping.timestamp);
}

#[tokio::test]
async fn plain_answer_streams_thinking_then_output() {
    let handle = mock_server(vec![MockResponse::text("hi")]).await;
    let mut ws = connect(&handle).await;

    let input = Envelope::user_input("hello");
    send(&mut ws, &input).await;

    let out = read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    assert_eq!(out.len(), 2);
    match &out[0].body {
        Body::Thinking(p) => assert_eq!(p.step, Some(1)),
        other => panic!("expected thinking, got {other:?}"),
    }
    assert_eq!(out[1].body, Envelope::llm_output("hi").body);
    assert!(out.iter().all(|e| e.reply_to.as_ref() == Some(&input.id)));
}

#[tokio::test]
async fn unregistered_tool_is_reported_and_the_loop_continues() {
    let handle = mock_server(vec![
        MockResponse::tool_calls(vec![ToolCall::new(
            "call_1",
            "get_skill",
            json!({"skill_name": "x"}),
        )]),
        MockResponse::text("I could not find that skill."),
    ])
    .await;
    let mut ws = connect(&handle).await;

    let input = Envelope::user_input("use skill x");
    send(&mut ws, &input).await;

    let out = read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    let kinds: Vec<_> = out.iter().map(|e| e.kind().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![
            EnvelopeKind::Thinking,
            EnvelopeKind::ToolCall,
            EnvelopeKind::ToolResult,
            EnvelopeKind::Thinking,
            EnvelopeKind::LlmOutput,
        ]
    );
    match &out[2].body {
        Body::ToolResult(p) => {
            assert!(!p.success);
            assert_eq!(p.tool_name, "get_skill");
            assert!(p.error.as_deref().unwrap().contains("get_skill"));
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
    assert!(out.iter().all(|e| e.reply_to.as_ref() == Some(&input.id)));
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_ignored() {
    let handle = mock_server(vec![]).await;
    let mut ws = connect(&handle).await;

    ws.send(Message::text("this is not json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"user_input","payload":{}}"#))
        .await
        .unwrap();
    ws.send(Message::text(
        json!({"type": "future_kind", "payload": {"x": 1}, "timestamp": 1, "id": "m1"}).to_string(),
    ))
    .await
    .unwrap();

    let ping = Envelope::ping();
    send(&mut ws, &ping).await;
    let next = next_envelope(&mut ws).await;
    assert_eq!(next.kind(), Some(EnvelopeKind::Pong));
    assert_eq!(next.reply_to, Some(ping.id));
}

#[tokio::test]
async fn concurrent_input_is_rejected() {
    let handle = mock_server(vec![MockResponse::delayed(
        Duration::from_millis(300),
        MockResponse::text("done"),
    )])
    .await;
    let mut ws = connect(&handle).await;

    let first = Envelope::user_input("first");
    let second = Envelope::user_input("second");
    send(&mut ws, &first).await;
    send(&mut ws, &second).await;

    let out = read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    let rejection = out
        .iter()
        .find(|e| e.reply_to.as_ref() == Some(&second.id))
        .expect("second input should be answered");
    match &rejection.body {
        Body::SystemStatus(p) => {
            assert_eq!(p.status, StatusKind::Error);
            assert_eq!(p.message, BUSY_MESSAGE);
        }
        other => panic!("expected error status, got {other:?}"),
    }
    assert_eq!(out.last().unwrap().reply_to, Some(first.id));
}

#[tokio::test]
async fn model_failure_sends_fallback_answer() {
    let handle = mock_server(vec![MockResponse::Error(GatewayError::ServerError {
        status: 503,
        body: "upstream exploded".into(),
    })])
    .await;
    let mut ws = connect(&handle).await;

    let input = Envelope::user_input("hello");
    send(&mut ws, &input).await;

    let out = read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    let answer = out.last().unwrap();
    assert_eq!(answer.body, Envelope::llm_output(FALLBACK_REPLY).body);
    assert_eq!(answer.reply_to, Some(input.id));
    assert!(!answer.encode().contains("upstream exploded"));
}

#[tokio::test]
async fn step_exhaustion_is_an_error_status() {
    let provider = MockProvider::repeating(MockResponse::tool_calls(vec![ToolCall::new(
        "call_loop",
        "missing",
        json!({}),
    )]));
    let handle = start_server(Arc::new(provider), 3, Arc::new(NullLogSink)).await;
    let mut ws = connect(&handle).await;

    let input = Envelope::user_input("loop forever");
    send(&mut ws, &input).await;

    let out = read_until(&mut ws, EnvelopeKind::SystemStatus).await;
    let thinking = out
        .iter()
        .filter(|e| e.kind() == Some(EnvelopeKind::Thinking))
        .count();
    assert_eq!(thinking, 3);
    assert!(out.iter().all(|e| e.kind() != Some(EnvelopeKind::LlmOutput)));

    let last = out.last().unwrap();
    assert_eq!(last.reply_to, Some(input.id));
    match &last.body {
        Body::SystemStatus(p) => {
            assert_eq!(p.status, StatusKind::Error);
            assert!(p.message.contains("(3)"), "got {}", p.message);
        }
        other => panic!("expected error status, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_the_socket_stops_the_turn() {
    let provider = Arc::new(MockProvider::repeating(MockResponse::delayed(
        Duration::from_millis(300),
        MockResponse::tool_calls(vec![ToolCall::new("call_slow", "missing", json!({}))]),
    )));
    let handle = start_server(
        Arc::clone(&provider) as Arc<dyn LlmProvider>,
        100,
        Arc::new(NullLogSink),
    )
    .await;
    let mut ws = connect(&handle).await;

    send(&mut ws, &Envelope::user_input("keep going")).await;
    let first = next_envelope(&mut ws).await;
    assert_eq!(first.kind(), Some(EnvelopeKind::Thinking));

    tokio::time::sleep(Duration::from_millis(100)).await;
    ws.close(None).await.unwrap();
    drop(ws);

    for _ in 0..50 {
        if handle.registry().count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.registry().count(), 0);

    // Long enough for several more steps had the turn kept running.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(provider.call_count(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn zero_periods_do_not_break_sessions() {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ws_ping_interval: Duration::ZERO,
        metrics_interval: Duration::ZERO,
        ..Default::default()
    };
    let handle = start_with_config(
        Arc::new(MockProvider::new(vec![MockResponse::text("still here")])),
        100,
        Arc::new(NullLogSink),
        config,
    )
    .await;
    let mut ws = connect(&handle).await;

    // Several transport ping periods pass without tearing the session down.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let input = Envelope::user_input("are you there");
    send(&mut ws, &input).await;
    let out = read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    assert_eq!(
        out.last().unwrap().body,
        Envelope::llm_output("still here").body
    );
    handle.shutdown().await;
}

#[derive(Default)]
struct RecordingSink {
    appended: Mutex<Vec<(SessionId, Vec<ClientLogRecord>)>>,
}

impl LogSink for RecordingSink {
    fn append(&self, session_id: &SessionId, records: &[ClientLogRecord]) {
        self.appended.lock().push((session_id.clone(), records.to_vec()));
    }
}

#[tokio::test]
async fn client_logs_reach_the_sink() {
    let sink = Arc::new(RecordingSink::default());
    let handle = start_server(
        Arc::new(MockProvider::new(vec![])),
        100,
        Arc::clone(&sink) as Arc<dyn LogSink>,
    )
    .await;
    let mut ws = connect(&handle).await;

    let record: ClientLogRecord = serde_json::from_value(json!({
        "source": "app",
        "level": "error",
        "message": "render failed",
        "timestamp": 1_700_000_000_000i64,
        "screen": "chat",
    }))
    .unwrap();
    send(&mut ws, &Envelope::client_log("client-side-id", vec![record])).await;

    for _ in 0..50 {
        {
            let appended = sink.appended.lock();
            if let Some((session_id, records)) = appended.first() {
                assert!(session_id.as_str().starts_with("conn_"));
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].message, "render failed");
                assert_eq!(records[0].extra["screen"], "chat");
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client logs never reached the sink");
}

#[tokio::test]
async fn history_carries_across_turns() {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::text("first answer"),
        MockResponse::text("second answer"),
    ]));
    let handle = start_server(
        Arc::clone(&provider) as Arc<dyn LlmProvider>,
        100,
        Arc::new(NullLogSink),
    )
    .await;
    let mut ws = connect(&handle).await;

    send(&mut ws, &Envelope::user_input("one")).await;
    read_until(&mut ws, EnvelopeKind::LlmOutput).await;
    send(&mut ws, &Envelope::user_input("two")).await;
    read_until(&mut ws, EnvelopeKind::LlmOutput).await;

    let contexts = provider.contexts();
    assert_eq!(contexts.len(), 2);
    // system, user, assistant, user
    assert_eq!(contexts[1].messages.len(), 4);
    assert_eq!(contexts[1].last_user_text(), Some("two"));
}

#[tokio::test]
async fn sessions_do_not_share_history() {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::text("a"),
        MockResponse::text("b"),
    ]));
    let handle = start_server(
        Arc::clone(&provider) as Arc<dyn LlmProvider>,
        100,
        Arc::new(NullLogSink),
    )
    .await;

    let mut first = connect(&handle).await;
    send(&mut first, &Envelope::user_input("from first")).await;
    read_until(&mut first, EnvelopeKind::LlmOutput).await;

    let mut second = connect(&handle).await;
    send(&mut second, &Envelope::user_input("from second")).await;
    read_until(&mut second, EnvelopeKind::LlmOutput).await;

    let contexts = provider.contexts();
    assert_eq!(contexts[1].messages.len(), 2);
    assert_eq!(contexts[1].last_user_text(), Some("from second"));
}
