//! End-to-end turns driven through `SessionController` with scripted transports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;

use turnstream_client::mock::{MockScript, MockStep, MockTransport};
use turnstream_core::errors::ConnectionError;
use turnstream_core::ids::{AgentId, StepId};
use turnstream_core::trace::{TraceStatus, TraceTree};
use turnstream_engine::{
    InMemoryThreadService, SessionController, StaticAgentRegistry, TraceAnomaly, TurnState,
};
use turnstream_telemetry::{CaptureLayer, LogCapture, LogQuery};

fn controller(transport: Arc<MockTransport>) -> SessionController {
    let agents = StaticAgentRegistry::default().with_agent("agent_1", "Planner");
    SessionController::new(
        transport,
        Arc::new(InMemoryThreadService::new()),
        Arc::new(agents),
        AgentId::from("agent_1"),
    )
}

fn one_stream(steps: Vec<MockStep>) -> Arc<MockTransport> {
    Arc::new(MockTransport::streaming(steps))
}

fn step(id: &str) -> StepId {
    StepId::from(id)
}

/// Every node reachable from `roots` exactly once.
fn reachable(tree: &TraceTree) -> usize {
    tree.walk().len()
}

#[tokio::test]
async fn nested_calls_build_parent_child_tree() {
    let mut session = controller(one_stream(vec![
        MockStep::trace_start("A", "plan", "a2a"),
        MockStep::trace_start("B", "search", "mcp"),
        MockStep::trace_end("B", TraceStatus::Success),
        MockStep::trace_end("A", TraceStatus::Success),
        MockStep::done(),
    ]));

    let outcome = session.send("plan a trip").await.unwrap();
    let tree = &outcome.trace.tree;

    assert_eq!(tree.roots, vec![step("A")]);
    let a = tree.get(&step("A")).unwrap();
    assert_eq!(a.children, vec![step("B")]);
    assert_eq!(a.status, TraceStatus::Success);
    let b = tree.get(&step("B")).unwrap();
    assert_eq!(b.parent_id, Some(step("A")));
    assert_eq!(b.status, TraceStatus::Success);
    assert!(outcome.trace.anomalies.is_empty());
}

#[tokio::test]
async fn tokens_concatenate_into_final_message() {
    let mut session = controller(one_stream(vec![
        MockStep::token("Hel"),
        MockStep::token("lo"),
        MockStep::done(),
    ]));

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Completed);
    let msg = outcome.message.unwrap();
    assert_eq!(msg.content, "Hello");
    assert!(!msg.streaming);
    assert!(msg.error.is_none());
}

#[tokio::test]
async fn server_error_leaves_open_steps_pending() {
    let mut session = controller(one_stream(vec![
        MockStep::trace_start("A", "search", "mcp"),
        MockStep::error("network lost"),
    ]));

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Errored);
    assert_eq!(session.state(), TurnState::Errored);
    assert_eq!(
        outcome.message.unwrap().error.as_deref(),
        Some("network lost")
    );
    let a = outcome.trace.tree.get(&step("A")).unwrap();
    assert_eq!(a.status, TraceStatus::Pending);
    assert!(a.end_time.is_none());
}

#[tokio::test]
async fn orphan_end_creates_nothing() {
    let mut session = controller(one_stream(vec![
        MockStep::trace_start("A", "search", "mcp"),
        MockStep::trace_end("A", TraceStatus::Success),
        MockStep::trace_end("X", TraceStatus::Success),
        MockStep::token("ok"),
        MockStep::done(),
    ]));

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Completed);
    assert_eq!(outcome.trace.tree.roots, vec![step("A")]);
    assert!(outcome.trace.tree.get(&step("X")).is_none());
    assert_eq!(
        outcome.trace.anomalies,
        vec![TraceAnomaly::OrphanEnd { step_id: step("X") }]
    );
    assert_eq!(outcome.message.unwrap().content, "ok");
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_stream_keeps_partial_text() {
    let transport = one_stream(vec![
        MockStep::token("Hi"),
        MockStep::Delay(Duration::from_secs(5)),
        MockStep::token(" there"),
        MockStep::trace_start("late", "search", "mcp"),
        MockStep::done(),
    ]);
    let mut session = controller(transport.clone());
    let handle = session.cancel_handle();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });
    let outcome = session.send("hi").await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome.state, TurnState::Cancelled);
    let msg = outcome.message.unwrap();
    assert_eq!(msg.content, "Hi");
    assert!(!msg.streaming);
    assert!(msg.cancelled);
    assert!(outcome.trace.tree.is_empty());
    // Only the first token was ever pulled from the transport.
    assert_eq!(transport.frames_delivered(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(session.state(), TurnState::Cancelled);
    assert_eq!(session.turn().assembler().content(), "Hi");
    assert!(session.turn().trace().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_first_frame_leaves_empty_reply() {
    let transport = one_stream(vec![MockStep::Hang]);
    let mut session = controller(transport.clone());
    let handle = session.cancel_handle();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let outcome = session.send("hi").await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome.state, TurnState::Cancelled);
    assert_eq!(outcome.message.unwrap().content, "");
    assert_eq!(transport.frames_delivered(), 0);
}

#[tokio::test]
async fn deep_and_wide_trees_keep_arrival_order() {
    let mut steps = Vec::new();
    for root in ["r1", "r2", "r3"] {
        steps.push(MockStep::trace_start(root, "agent", "a2a"));
        for child in 0..3 {
            let id = format!("{root}.{child}");
            steps.push(MockStep::trace_start(&id, "tool", "mcp"));
            let leaf = format!("{id}.leaf");
            steps.push(MockStep::trace_start(&leaf, "llm", "llm"));
            steps.push(MockStep::trace_end(&leaf, TraceStatus::Success));
            steps.push(MockStep::trace_end(&id, TraceStatus::Success));
        }
        steps.push(MockStep::trace_end(root, TraceStatus::Success));
    }
    steps.push(MockStep::done());
    let starts = 3 + 3 * 3 * 2;

    let mut session = controller(one_stream(steps));
    let outcome = session.send("go").await.unwrap();
    let tree = &outcome.trace.tree;

    assert_eq!(tree.len(), starts);
    assert_eq!(reachable(tree), starts);
    assert_eq!(tree.roots, vec![step("r1"), step("r2"), step("r3")]);
    let r2 = tree.get(&step("r2")).unwrap();
    assert_eq!(r2.children, vec![step("r2.0"), step("r2.1"), step("r2.2")]);
    let mid = tree.get(&step("r2.1")).unwrap();
    assert_eq!(mid.children, vec![step("r2.1.leaf")]);
    assert_eq!(tree.summary().max_depth, 3);
    assert!(tree.nodes.values().all(|n| n.status == TraceStatus::Success));
}

#[tokio::test]
async fn repeated_end_does_not_overwrite_result() {
    let end = |output: &str, latency: u64| {
        MockStep::json(json!({
            "type": "trace_end",
            "step_id": "A",
            "status": "success",
            "output": output,
            "latency_ms": latency,
        }))
    };
    let mut session = controller(one_stream(vec![
        MockStep::trace_start("A", "search", "mcp"),
        end("first", 120),
        end("second", 999),
        MockStep::done(),
    ]));

    let outcome = session.send("hi").await.unwrap();
    let a = outcome.trace.tree.get(&step("A")).unwrap();
    assert_eq!(a.latency_ms, Some(120));
    assert_eq!(a.output, Some(json!("first")));
    assert_eq!(
        outcome.trace.anomalies,
        vec![TraceAnomaly::DuplicateEnd { step_id: step("A") }]
    );
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_stream_continues() {
    let mut session = controller(one_stream(vec![
        MockStep::token("a"),
        MockStep::json(json!({"type": "mystery", "x": 1})),
        MockStep::json(json!({"type": "token"})),
        MockStep::json(json!({"type": "trace_end", "step_id": "A", "status": "pending"})),
        MockStep::token("b"),
        MockStep::done(),
    ]));

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Completed);
    assert_eq!(outcome.message.unwrap().content, "ab");
    assert!(outcome.trace.anomalies.is_empty());
}

#[tokio::test]
async fn frames_after_done_are_not_applied() {
    let transport = one_stream(vec![
        MockStep::token("done here"),
        MockStep::done(),
        MockStep::token(" extra"),
    ]);
    let mut session = controller(transport.clone());

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.message.unwrap().content, "done here");
    assert_eq!(transport.frames_delivered(), 2);
}

#[tokio::test]
async fn transport_failure_mid_stream_retains_partial_state() {
    let mut session = controller(one_stream(vec![
        MockStep::trace_start("A", "search", "mcp"),
        MockStep::token("par"),
        MockStep::Fail(ConnectionError::Interrupted("reset by peer".into())),
    ]));

    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Errored);
    let msg = outcome.message.unwrap();
    assert_eq!(msg.content, "par");
    assert!(msg.error.unwrap().contains("reset by peer"));
    assert_eq!(outcome.trace.tree.len(), 1);
}

#[tokio::test]
async fn new_turn_starts_with_clean_context() {
    let transport = Arc::new(MockTransport::new(vec![
        MockScript::Stream(vec![
            MockStep::trace_start("A", "search", "mcp"),
            MockStep::error("boom"),
        ]),
        MockScript::Stream(vec![MockStep::token("fresh"), MockStep::done()]),
    ]));
    let mut session = controller(transport);

    let first = session.send("one").await.unwrap();
    assert_eq!(first.state, TurnState::Errored);
    let second = session.send("two").await.unwrap();

    assert_eq!(second.state, TurnState::Completed);
    assert!(second.trace.tree.is_empty());
    assert_eq!(second.message.unwrap().content, "fresh");
    assert_eq!(session.traces().len(), 2);
    assert_eq!(session.traces()[0].tree.len(), 1);
    assert_eq!(session.history().len(), 4);
}

#[tokio::test]
async fn anomalies_reach_the_log_capture() {
    let capture = Arc::new(LogCapture::new(16));
    let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(capture.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut session = controller(one_stream(vec![
        MockStep::trace_update("ghost", TraceStatus::Success),
        MockStep::done(),
    ]));
    let outcome = session.send("hi").await.unwrap();
    assert_eq!(outcome.state, TurnState::Completed);

    let records = capture.query(&LogQuery::default());
    let anomaly = records
        .iter()
        .find(|r| r.fields.get("anomaly") == Some(&json!("orphan_update")))
        .unwrap();
    assert_eq!(anomaly.level, "WARN");
    assert_eq!(anomaly.step_id.as_deref(), Some("ghost"));
    assert_eq!(
        anomaly.thread_id.as_deref(),
        session.thread_id().map(|t| t.as_str())
    );
    assert!(anomaly.thread_id.is_some());
}
