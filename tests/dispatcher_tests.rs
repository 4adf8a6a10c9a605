mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use convoy::agent_loop::{PermissionGate, RunStatus};
use convoy::config::AgentConfig;
use convoy::error::Result;
use convoy::protocol::WireProtocol;
use convoy::runner::{BackendFactory, BackendSpec, LoopBackend, ProtocolBackendFactory, RunnerDispatcher};
use convoy::types::{ApprovalMode, ConversationSession, StreamEvent};

/// Counts how many backends the dispatcher asked for.
struct CountingFactory {
    inner: ProtocolBackendFactory,
    created: AtomicUsize,
}

impl BackendFactory for CountingFactory {
    fn create(
        &self,
        spec: &BackendSpec,
        session: Arc<tokio::sync::Mutex<ConversationSession>>,
        gate: Arc<PermissionGate>,
    ) -> Result<Arc<dyn LoopBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.inner.create(spec, session, gate)
    }
}

fn config() -> AgentConfig {
    let mut config = AgentConfig::from_toml_str(
        r#"
        [retry]
        base_backoff_ms = 1
        max_backoff_ms = 1

        [providers.openai]
        continuation_field = "previous_response_id"
        "#,
    )
    .unwrap();
    config.set_api_key("openai", "sk-test");
    config.set_api_key("anthropic", "sk-ant-test");
    config
}

fn dispatcher(transport: Arc<ScriptedTransport>) -> (RunnerDispatcher, Arc<CountingFactory>) {
    let log = CallLog::default();
    let factory = Arc::new(CountingFactory {
        inner: ProtocolBackendFactory::with_transport(config(), tools(&log), transport),
        created: AtomicUsize::new(0),
    });
    (RunnerDispatcher::new(session(), factory.clone()), factory)
}

#[tokio::test]
async fn memoized_backend_carries_the_continuation_token() {
    let transport = ScriptedTransport::new(vec![
        text_turn("resp_1", "Hello."),
        text_turn("resp_2", "Hello again."),
    ]);
    let (dispatcher, factory) = dispatcher(transport.clone());

    let first = dispatcher.run("hi", Vec::new(), None).await;
    let second = dispatcher.run("hi again", Vec::new(), None).await;

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.text, "Hello.");
    assert_eq!(second.text, "Hello again.");
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    let bodies = transport.bodies();
    assert!(bodies[0].get("previous_response_id").is_none());
    assert_eq!(bodies[1]["previous_response_id"], json!("resp_1"));
    assert_eq!(
        dispatcher.session().await.continuation_token.as_deref(),
        Some("resp_2")
    );
}

#[tokio::test]
async fn approval_mode_change_rebuilds_backend_but_keeps_session() {
    let transport = ScriptedTransport::new(vec![
        text_turn("resp_1", "One."),
        text_turn("resp_2", "Two."),
    ]);
    let (dispatcher, factory) = dispatcher(transport.clone());

    dispatcher.run("first", Vec::new(), None).await;
    dispatcher.set_approval_mode(ApprovalMode::Auto).await;
    // Setting the same mode again is not a change.
    dispatcher.set_approval_mode(ApprovalMode::Auto).await;
    dispatcher.run("second", Vec::new(), None).await;

    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.approval_mode(), ApprovalMode::Auto);
    assert_eq!(transport.bodies()[1]["previous_response_id"], json!("resp_1"));
    let session = dispatcher.session().await;
    assert_eq!(session.approval_mode, ApprovalMode::Auto);
    assert_eq!(session.messages.len(), 4);
}

#[tokio::test]
async fn protocol_switch_uses_the_other_encoding() {
    let transport = ScriptedTransport::new(vec![
        text_turn("resp_1", "From chat."),
        Script::Events(vec![
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 5}}})
                .to_string(),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})
                .to_string(),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "From blocks."}})
                .to_string(),
            json!({"type": "content_block_stop", "index": 0}).to_string(),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}})
                .to_string(),
            json!({"type": "message_stop"}).to_string(),
        ]),
    ]);
    let (dispatcher, factory) = dispatcher(transport.clone());

    dispatcher.run("hi", Vec::new(), None).await;
    dispatcher.set_protocol(WireProtocol::Messages).await;
    let result = dispatcher.run("hi again", Vec::new(), None).await;

    assert_eq!(result.text, "From blocks.");
    assert_eq!(result.usage.total_tokens, 8);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    let requests = transport.requests();
    assert!(requests[0].url.ends_with("/chat/completions"));
    assert!(requests[1].url.ends_with("/messages"));
    assert_eq!(requests[1].body["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn stream_run_after_dispose_yields_single_error() {
    let transport = ScriptedTransport::new(vec![text_turn("resp_1", "unused")]);
    let (dispatcher, _factory) = dispatcher(transport.clone());

    dispatcher.dispose();
    dispatcher.dispose();
    let events = collect(dispatcher.stream_run("hello", Vec::new(), None)).await;

    match events.as_slice() {
        [StreamEvent::Error { message }] => assert!(message.contains("disposed")),
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(transport.requests().is_empty());
    assert!(dispatcher.is_disposed());
}

#[tokio::test]
async fn missing_credentials_surface_as_error_event() {
    let transport = ScriptedTransport::new(Vec::new());
    let factory = ProtocolBackendFactory::with_transport(
        AgentConfig::default(),
        tools(&CallLog::default()),
        transport,
    );
    let dispatcher = RunnerDispatcher::new(session(), Arc::new(factory));

    let events = collect(dispatcher.stream_run("hello", Vec::new(), None)).await;

    match events.as_slice() {
        [StreamEvent::Error { message }] => assert!(message.contains("Missing OPENAI_API_KEY")),
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn abort_stops_the_run_and_is_idempotent() {
    let transport = ScriptedTransport::new(vec![Script::Hang]);
    let (dispatcher, _factory) = dispatcher(transport);
    let dispatcher = Arc::new(dispatcher);

    let aborter = dispatcher.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        aborter.abort()
    });

    let result = dispatcher.run("hello", Vec::new(), None).await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert!(handle.await.unwrap());
    assert!(!dispatcher.abort());
}

#[tokio::test(start_paused = true)]
async fn caller_signal_aborts_the_run() {
    let transport = ScriptedTransport::new(vec![Script::Hang]);
    let (dispatcher, _factory) = dispatcher(transport);
    let signal = tokio_util::sync::CancellationToken::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let events = collect(dispatcher.stream_run("hello", Vec::new(), Some(&signal))).await;

    assert_eq!(events, vec![StreamEvent::Aborted]);
}

#[tokio::test]
async fn permission_responses_route_through_the_gate() {
    let transport = ScriptedTransport::new(vec![
        tool_call_turn("resp_1", "call_rm", "rm", r#"{"path":"/tmp/x"}"#),
        text_turn("resp_2", "Removed."),
    ]);
    let (dispatcher, _factory) = dispatcher(transport);
    assert!(!dispatcher.respond_to_permission("perm_unknown", true, None));

    let mut stream = dispatcher.stream_run("remove /tmp/x", Vec::new(), None);
    let mut saw_result = false;
    while let Some(event) = futures::StreamExt::next(&mut stream).await {
        match event {
            StreamEvent::PermissionRequested { request_id, .. } => {
                assert!(dispatcher.respond_to_permission(&request_id, true, None));
                assert!(!dispatcher.respond_to_permission(&request_id, true, None));
            }
            StreamEvent::ToolResult { is_error, .. } => {
                assert!(!is_error);
                saw_result = true;
            }
            _ => {}
        }
    }
    assert!(saw_result);
}

/// Starts a run that hangs on the model call and a second one queued behind it.
async fn hanging_and_queued(
    dispatcher: &Arc<RunnerDispatcher>,
) -> (
    tokio::task::JoinHandle<Vec<StreamEvent>>,
    tokio::task::JoinHandle<Vec<StreamEvent>>,
) {
    let first = tokio::spawn(collect(dispatcher.stream_run("first", Vec::new(), None)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = tokio::spawn(collect(dispatcher.stream_run("second", Vec::new(), None)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(dispatcher.live_runs(), 2);
    (first, second)
}

#[tokio::test(start_paused = true)]
async fn abort_reaches_the_run_holding_the_session() {
    let transport = ScriptedTransport::new(vec![Script::Hang]);
    let (dispatcher, _factory) = dispatcher(transport.clone());
    let dispatcher = Arc::new(dispatcher);
    let (first, second) = hanging_and_queued(&dispatcher).await;

    assert!(dispatcher.abort());

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("running run should stop")
        .unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.last(), Some(&StreamEvent::Aborted));
    assert_eq!(terminal_count(&first), 1);
    assert_eq!(second, vec![StreamEvent::Aborted]);
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(dispatcher.live_runs(), 0);
    assert!(!dispatcher.abort());
}

#[tokio::test(start_paused = true)]
async fn dispose_stops_every_live_run() {
    let transport = ScriptedTransport::new(vec![Script::Hang]);
    let (dispatcher, _factory) = dispatcher(transport);
    let dispatcher = Arc::new(dispatcher);
    let (first, second) = hanging_and_queued(&dispatcher).await;

    dispatcher.dispose();

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("running run should stop")
        .unwrap();
    assert_eq!(first.last(), Some(&StreamEvent::Aborted));
    assert_eq!(second.await.unwrap(), vec![StreamEvent::Aborted]);
    assert_eq!(dispatcher.live_runs(), 0);
}
