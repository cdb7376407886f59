use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use turnstream_client::decoder::decode;
use turnstream_client::transport::{ChatRequest, ChatTransport, Connection};
use turnstream_core::collab::{AgentInfo, AgentRegistry, AgentStatus, ThreadService};
use turnstream_core::errors::ConnectionError;
use turnstream_core::events::StreamEvent;
use turnstream_core::ids::{AgentId, MessageId, ThreadId};
use turnstream_core::messages::{ConversationMessage, WireMessage};
use turnstream_core::trace::{TraceNode, TraceTree};
use turnstream_settings::{BusyPolicy, SessionSettings};

use crate::error::SessionError;
use crate::trace::TraceAnomaly;
use crate::turn::{Applied, TurnContext, TurnSignal};

/// Per-turn state machine: `Idle → Sending → Streaming → {Completed | Errored | Cancelled}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl TurnState {
    /// A turn has started and not yet finished.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call tree of one finished turn, keyed by the user message that triggered it.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnTrace {
    pub user_message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub state: TurnState,
    pub tree: TraceTree,
    pub anomalies: Vec<TraceAnomaly>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub state: TurnState,
    pub message: Option<ConversationMessage>,
    pub trace: TurnTrace,
}

/// Live notifications for UI layers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { from: TurnState, to: TurnState },
    MessageDelta { message_id: MessageId, delta: String },
    TraceStarted { node: TraceNode },
    TraceUpdated { node: TraceNode },
    TraceEnded { node: TraceNode },
    Anomaly { anomaly: TraceAnomaly },
    TurnFinished { user_message_id: MessageId, state: TurnState },
}

/// Cancels whichever turn is current when [`CancelHandle::cancel`] is called.
#[derive(Clone)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.current.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current.lock().is_cancelled()
    }
}

/// One conversation with one agent.
///
/// Every mutating operation takes `&mut self`, so exactly one task ever
/// touches the turn context. Cancellation comes from outside through a
/// [`CancelHandle`].
pub struct SessionController {
    transport: Arc<dyn ChatTransport>,
    threads: Arc<dyn ThreadService>,
    agents: Arc<dyn AgentRegistry>,
    settings: SessionSettings,
    agent_id: AgentId,
    agent_name: Option<String>,
    thread_id: Option<ThreadId>,
    history: Vec<ConversationMessage>,
    traces: Vec<TurnTrace>,
    turn: TurnContext,
    state: TurnState,
    cancel: Arc<Mutex<CancellationToken>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        threads: Arc<dyn ThreadService>,
        agents: Arc<dyn AgentRegistry>,
        agent_id: AgentId,
    ) -> Self {
        Self::with_settings(transport, threads, agents, agent_id, SessionSettings::default())
    }

    pub fn with_settings(
        transport: Arc<dyn ChatTransport>,
        threads: Arc<dyn ThreadService>,
        agents: Arc<dyn AgentRegistry>,
        agent_id: AgentId,
        settings: SessionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            transport,
            threads,
            agents,
            settings,
            agent_id,
            agent_name: None,
            thread_id: None,
            history: Vec::new(),
            traces: Vec::new(),
            turn: TurnContext::new(),
            state: TurnState::Idle,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            events,
        }
    }

    /// Send one user message and drive the turn to a terminal state.
    ///
    /// Transport and server failures end the turn as `Errored` and are
    /// returned inside the outcome. `Err` means the turn never started, or
    /// the thread could not be created.
    #[instrument(skip_all, fields(agent_id = %self.agent_id, thread_id = tracing::field::Empty))]
    pub async fn send(&mut self, text: &str) -> Result<TurnOutcome, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.state.is_open() {
            match self.settings.busy_policy {
                BusyPolicy::Reject => return Err(SessionError::TurnInProgress),
                BusyPolicy::CancelPrevious => {
                    warn!(turn_state = %self.state, "previous turn still open, cancelling it");
                    self.abandon_open_turn();
                }
            }
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.turn.clear();
        self.set_state(TurnState::Sending);

        let thread_id = match self.ensure_thread().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not create thread");
                self.set_state(TurnState::Errored);
                return Err(e);
            }
        };
        tracing::Span::current().record("thread_id", tracing::field::display(&thread_id));

        if self.agent_name.is_none() {
            self.agent_name = self.lookup_agent_name().await;
        }
        let user = ConversationMessage::user(text);
        let user_message_id = user.id.clone();
        self.history.push(user);
        self.turn.begin(user_message_id.clone(), self.agent_name.clone())?;

        let request = ChatRequest {
            thread_id,
            agent_id: self.agent_id.clone(),
            messages: self.wire_history(),
        };
        let transport = Arc::clone(&self.transport);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = transport.open(request, token.clone()) => Some(result),
        };

        let state = match opened {
            None => self.cancel_turn(),
            Some(Err(e)) => self.fail_turn(&e),
            Some(Ok(conn)) => {
                self.set_state(TurnState::Streaming);
                self.stream(conn, &token).await
            }
        };
        Ok(self.finish(state, user_message_id))
    }

    async fn stream(&mut self, mut conn: Connection, token: &CancellationToken) -> TurnState {
        let cancel = Arc::clone(&self.cancel);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = conn.next() => Some(next),
            };
            // Held until the frame is applied and published: once
            // `CancelHandle::cancel` returns, no later frame reaches the turn.
            let current = cancel.lock();
            let next = match next {
                Some(next) if !current.is_cancelled() => next,
                _ => {
                    drop(current);
                    conn.cancel();
                    return self.cancel_turn();
                }
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return self.fail_turn(&e),
                None => return self.fail_turn(&ConnectionError::ClosedEarly),
            };
            let Some(event) = decode(&frame) else {
                continue;
            };
            if event.is_terminal() {
                conn.close();
            }

            let applied = self.turn.apply(&event);
            self.publish(&event, &applied);
            match applied.signal {
                TurnSignal::Completed => return TurnState::Completed,
                TurnSignal::Failed => {
                    warn!(error_kind = "server_error", "turn ended by server error event");
                    return TurnState::Errored;
                }
                TurnSignal::Continue | TurnSignal::Ignored => {}
            }
        }
    }

    fn cancel_turn(&mut self) -> TurnState {
        let _ = self.turn.cancel();
        info!(content_len = self.turn.assembler().content().len(), "turn cancelled");
        TurnState::Cancelled
    }

    fn fail_turn(&mut self, error: &ConnectionError) -> TurnState {
        warn!(error_kind = error.error_kind(), error = %error, "stream failed");
        let _ = self.turn.fail(&error.to_string());
        TurnState::Errored
    }

    /// Merge the turn's message and trace into the session and report it.
    fn finish(&mut self, state: TurnState, user_message_id: MessageId) -> TurnOutcome {
        self.set_state(state);

        let message = self.turn.assembler().message().cloned();
        if let Some(msg) = &message {
            self.history.push(msg.clone());
        }
        let trace = TurnTrace {
            user_message_id: user_message_id.clone(),
            agent_name: self.agent_name.clone(),
            state,
            tree: self.turn.trace().snapshot(),
            anomalies: self.turn.trace().anomalies().to_vec(),
        };
        self.traces.push(trace.clone());

        let pending = self.turn.trace().pending().len();
        if pending > 0 {
            debug!(pending, turn_state = %state, "turn finished with open trace steps");
        }
        self.send_event(SessionEvent::TurnFinished {
            user_message_id,
            state,
        });

        TurnOutcome {
            state,
            message,
            trace,
        }
    }

    /// Close out a turn whose `send` future was dropped before it finished.
    fn abandon_open_turn(&mut self) {
        self.cancel.lock().cancel();
        match self.turn.user_message_id().cloned() {
            Some(id) => {
                let _ = self.turn.cancel();
                let _ = self.finish(TurnState::Cancelled, id);
            }
            None => self.set_state(TurnState::Cancelled),
        }
    }

    fn publish(&self, event: &StreamEvent, applied: &Applied) {
        if applied.signal == TurnSignal::Ignored {
            return;
        }
        if let StreamEvent::Token(t) = event {
            if let Some(msg) = self.turn.assembler().message() {
                self.send_event(SessionEvent::MessageDelta {
                    message_id: msg.id.clone(),
                    delta: t.content.clone(),
                });
            }
            return;
        }

        let Some(outcome) = &applied.trace else {
            return;
        };
        if outcome.applied() {
            let node = event
                .step_id()
                .and_then(|id| self.turn.trace().get_node(id))
                .cloned();
            if let Some(node) = node {
                self.send_event(match event {
                    StreamEvent::TraceStart(_) => SessionEvent::TraceStarted { node },
                    StreamEvent::TraceUpdate(_) => SessionEvent::TraceUpdated { node },
                    _ => SessionEvent::TraceEnded { node },
                });
            }
        }
        if let Some(anomaly) = outcome.anomaly() {
            self.send_event(SessionEvent::Anomaly {
                anomaly: anomaly.clone(),
            });
        }
    }

    fn send_event(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("no session event subscribers");
        }
    }

    fn set_state(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, turn_state = %to, "turn state changed");
        self.send_event(SessionEvent::StateChanged { from, to });
    }

    async fn ensure_thread(&mut self) -> Result<ThreadId, SessionError> {
        if let Some(id) = &self.thread_id {
            return Ok(id.clone());
        }
        let thread = self.threads.create_thread(&self.agent_id).await?;
        info!(thread_id = %thread.id, "thread created");
        self.thread_id = Some(thread.id.clone());
        Ok(thread.id)
    }

    async fn lookup_agent_name(&self) -> Option<String> {
        match self.agents.get_agent(&self.agent_id).await {
            Ok(Some(info)) => Some(info.name),
            Ok(None) => {
                warn!(agent_id = %self.agent_id, "agent missing from registry");
                None
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "agent lookup failed");
                None
            }
        }
    }

    fn wire_history(&self) -> Vec<WireMessage> {
        self.history
            .iter()
            .filter(|m| m.is_replayable())
            .map(WireMessage::from)
            .collect()
    }

    fn reset_conversation(&mut self, thread_id: Option<ThreadId>, history: Vec<ConversationMessage>) {
        self.thread_id = thread_id;
        self.history = history;
        self.traces.clear();
        self.turn.clear();
        self.set_state(TurnState::Idle);
    }

    // ── Context switches ────────────────────────────────────────────

    /// Switch to another agent. Starts a fresh, not yet created thread.
    pub async fn select_agent(&mut self, agent_id: AgentId) -> Result<AgentInfo, SessionError> {
        let info = self
            .agents
            .get_agent(&agent_id)
            .await?
            .ok_or(SessionError::AgentNotFound(agent_id))?;
        if info.status != AgentStatus::Active {
            warn!(agent_id = %info.id, status = ?info.status, "selected agent is not active");
        }
        if self.state.is_open() {
            self.abandon_open_turn();
        }
        self.agent_id = info.id.clone();
        self.agent_name = Some(info.name.clone());
        self.reset_conversation(None, Vec::new());
        info!(agent_id = %info.id, "agent selected");
        Ok(info)
    }

    /// Load an existing thread and its history.
    pub async fn open_thread(&mut self, thread_id: &ThreadId) -> Result<(), SessionError> {
        let thread = self
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| SessionError::ThreadNotFound(thread_id.clone()))?;
        if self.state.is_open() {
            self.abandon_open_turn();
        }
        if thread.agent_id != self.agent_id {
            self.agent_id = thread.agent_id.clone();
            self.agent_name = self.lookup_agent_name().await;
        }
        info!(thread_id = %thread.id, messages = thread.messages.len(), "thread opened");
        self.reset_conversation(Some(thread.id), thread.messages);
        Ok(())
    }

    /// Delete a thread; resets the session when it is the current one.
    pub async fn delete_thread(&mut self, thread_id: &ThreadId) -> Result<(), SessionError> {
        self.threads.delete_thread(thread_id).await?;
        if self.thread_id.as_ref() == Some(thread_id) {
            if self.state.is_open() {
                self.abandon_open_turn();
            }
            self.reset_conversation(None, Vec::new());
        }
        Ok(())
    }

    /// Forget the current thread; the next `send` creates a new one.
    pub fn new_thread(&mut self) {
        if self.state.is_open() {
            self.abandon_open_turn();
        }
        self.reset_conversation(None, Vec::new());
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            current: Arc::clone(&self.cancel),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    pub fn traces(&self) -> &[TurnTrace] {
        &self.traces
    }

    pub fn trace_for(&self, user_message_id: &MessageId) -> Option<&TurnTrace> {
        self.traces
            .iter()
            .find(|t| &t.user_message_id == user_message_id)
    }

    /// Context of the current or most recent turn.
    pub fn turn(&self) -> &TurnContext {
        &self.turn
    }

    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use turnstream_client::mock::{MockScript, MockStep, MockTransport};
    use turnstream_core::messages::Role;
    use turnstream_core::trace::TraceStatus;

    use crate::memory::{InMemoryThreadService, StaticAgentRegistry};

    struct Harness {
        controller: SessionController,
        transport: Arc<MockTransport>,
        threads: Arc<InMemoryThreadService>,
    }

    fn harness(scripts: Vec<MockScript>, settings: SessionSettings) -> Harness {
        let transport = Arc::new(MockTransport::new(scripts));
        let threads = Arc::new(InMemoryThreadService::new());
        let agents = Arc::new(
            StaticAgentRegistry::default()
                .with_agent("agent_1", "Planner")
                .with_agent("agent_2", "Researcher"),
        );
        let controller = SessionController::with_settings(
            transport.clone(),
            threads.clone(),
            agents,
            AgentId::from("agent_1"),
            settings,
        );
        Harness {
            controller,
            transport,
            threads,
        }
    }

    fn stream(steps: Vec<MockStep>) -> MockScript {
        MockScript::Stream(steps)
    }

    #[tokio::test]
    async fn completed_turn_merges_message_and_trace() {
        let mut h = harness(
            vec![stream(vec![
                MockStep::trace_start("s1", "search", "mcp"),
                MockStep::token("Found it"),
                MockStep::trace_end("s1", TraceStatus::Success),
                MockStep::done(),
            ])],
            SessionSettings::default(),
        );

        let outcome = h.controller.send("find docs").await.unwrap();
        assert_eq!(outcome.state, TurnState::Completed);
        assert_eq!(h.controller.state(), TurnState::Completed);

        let history = h.controller.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Found it");
        assert_eq!(history[1].author.as_deref(), Some("Planner"));

        let trace = h.controller.trace_for(&history[0].id).unwrap();
        assert_eq!(trace.tree.len(), 1);
        assert_eq!(trace.agent_name.as_deref(), Some("Planner"));
        assert_eq!(h.threads.len(), 1);
    }

    #[tokio::test]
    async fn request_carries_replayable_history() {
        let mut h = harness(
            vec![
                stream(vec![MockStep::token("first"), MockStep::done()]),
                stream(vec![MockStep::token("second"), MockStep::error("boom")]),
                stream(vec![MockStep::done()]),
            ],
            SessionSettings::default(),
        );
        let _ = h.controller.send("one").await.unwrap();
        let _ = h.controller.send("two").await.unwrap();
        let _ = h.controller.send("three").await.unwrap();

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 3);
        let last: Vec<_> = requests[2].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(last, vec!["one", "first", "two", "three"]);
        assert_eq!(requests[0].thread_id, requests[2].thread_id);
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let mut h = harness(vec![], SessionSettings::default());
        assert!(matches!(
            h.controller.send("   ").await,
            Err(SessionError::EmptyMessage)
        ));
        assert_eq!(h.controller.state(), TurnState::Idle);
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn thread_creation_failure_errors_turn() {
        let mut h = harness(vec![], SessionSettings::default());
        h.threads.set_unavailable(true);
        let err = h.controller.send("hi").await.unwrap_err();
        assert!(matches!(err, SessionError::Collab(_)));
        assert_eq!(h.controller.state(), TurnState::Errored);
        assert!(h.controller.history().is_empty());
    }

    #[tokio::test]
    async fn open_failure_becomes_errored_turn() {
        let mut h = harness(
            vec![MockScript::Reject(ConnectionError::Connect("refused".into()))],
            SessionSettings::default(),
        );
        let outcome = h.controller.send("hi").await.unwrap();
        assert_eq!(outcome.state, TurnState::Errored);
        let msg = outcome.message.unwrap();
        assert!(msg.error.unwrap().contains("refused"));
        assert_eq!(msg.content, "");
    }

    #[tokio::test]
    async fn stream_closed_without_terminal_is_error() {
        let mut h = harness(
            vec![stream(vec![MockStep::token("half")])],
            SessionSettings::default(),
        );
        let outcome = h.controller.send("hi").await.unwrap();
        assert_eq!(outcome.state, TurnState::Errored);
        let msg = outcome.message.unwrap();
        assert_eq!(msg.content, "half");
        assert!(msg.error.unwrap().contains("closed before a terminal event"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_with_reject_policy_blocks_next_send() {
        let settings = SessionSettings {
            busy_policy: BusyPolicy::Reject,
            ..SessionSettings::default()
        };
        let mut h = harness(
            vec![stream(vec![MockStep::token("Hi"), MockStep::Hang])],
            settings,
        );
        let timed_out = tokio::time::timeout(Duration::from_secs(1), h.controller.send("hi")).await;
        assert!(timed_out.is_err());
        assert_eq!(h.controller.state(), TurnState::Streaming);

        assert!(matches!(
            h.controller.send("again").await,
            Err(SessionError::TurnInProgress)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_with_cancel_policy_closes_previous_turn() {
        let mut h = harness(
            vec![
                stream(vec![MockStep::token("Hi"), MockStep::Hang]),
                stream(vec![MockStep::token("ok"), MockStep::done()]),
            ],
            SessionSettings::default(),
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), h.controller.send("hi")).await;

        let outcome = h.controller.send("again").await.unwrap();
        assert_eq!(outcome.state, TurnState::Completed);

        let history = h.controller.history();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "Hi", "again", "ok"]);
        assert!(history[1].cancelled);
        assert_eq!(h.controller.traces()[0].state, TurnState::Cancelled);

        let second = &h.transport.requests()[1];
        let sent: Vec<_> = second.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(sent, vec!["hi", "again"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_send_leaves_open_turn_untouched() {
        let mut h = harness(
            vec![stream(vec![MockStep::token("Hi"), MockStep::Hang])],
            SessionSettings::default(),
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), h.controller.send("hi")).await;
        assert_eq!(h.controller.state(), TurnState::Streaming);

        assert!(matches!(
            h.controller.send("   ").await,
            Err(SessionError::EmptyMessage)
        ));
        assert_eq!(h.controller.state(), TurnState::Streaming);
        assert!(h.controller.traces().is_empty());
        assert_eq!(h.controller.history().len(), 1);
        assert!(!h.controller.cancel_handle().is_cancelled());
        assert_eq!(h.controller.turn().assembler().content(), "Hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_delta_published_after_cancel_returns() {
        let mut steps: Vec<MockStep> = (0..20_000).map(|_| MockStep::token("x")).collect();
        steps.push(MockStep::Hang);
        let mut h = harness(vec![stream(steps)], SessionSettings::default());
        let handle = h.controller.cancel_handle();
        let mut rx = h.controller.subscribe();

        let canceller = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::MessageDelta { .. })
                    | Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("channel closed"),
                }
            }
            handle.cancel();
            loop {
                match rx.try_recv() {
                    Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            rx
        });
        let outcome = h.controller.send("go").await.unwrap();
        let mut rx = canceller.await.unwrap();

        assert_eq!(outcome.state, TurnState::Cancelled);
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, SessionEvent::MessageDelta { .. }),
                "delta published after cancel returned"
            );
        }
    }

    #[tokio::test]
    async fn subscribers_see_states_deltas_and_trace_changes() {
        let mut h = harness(
            vec![stream(vec![
                MockStep::trace_start("s1", "search", "mcp"),
                MockStep::token("a"),
                MockStep::trace_end("s1", TraceStatus::Success),
                MockStep::trace_end("ghost", TraceStatus::Success),
                MockStep::done(),
            ])],
            SessionSettings::default(),
        );
        let mut rx = h.controller.subscribe();
        let _ = h.controller.send("go").await.unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                SessionEvent::StateChanged { .. } => "state",
                SessionEvent::MessageDelta { .. } => "delta",
                SessionEvent::TraceStarted { .. } => "trace_started",
                SessionEvent::TraceUpdated { .. } => "trace_updated",
                SessionEvent::TraceEnded { .. } => "trace_ended",
                SessionEvent::Anomaly { .. } => "anomaly",
                SessionEvent::TurnFinished { .. } => "finished",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "state",
                "state",
                "trace_started",
                "delta",
                "trace_ended",
                "anomaly",
                "state",
                "finished"
            ]
        );
        assert_eq!(
            events[0],
            SessionEvent::StateChanged {
                from: TurnState::Idle,
                to: TurnState::Sending
            }
        );
    }

    #[tokio::test]
    async fn select_agent_resets_conversation() {
        let mut h = harness(
            vec![stream(vec![MockStep::token("x"), MockStep::done()])],
            SessionSettings::default(),
        );
        let _ = h.controller.send("hi").await.unwrap();
        assert!(h.controller.thread_id().is_some());

        let info = h.controller.select_agent(AgentId::from("agent_2")).await.unwrap();
        assert_eq!(info.name, "Researcher");
        assert_eq!(h.controller.agent_id().as_str(), "agent_2");
        assert!(h.controller.history().is_empty());
        assert!(h.controller.traces().is_empty());
        assert!(h.controller.thread_id().is_none());
        assert_eq!(h.controller.state(), TurnState::Idle);

        assert!(matches!(
            h.controller.select_agent(AgentId::from("missing")).await,
            Err(SessionError::AgentNotFound(_))
        ));
        assert_eq!(h.controller.agent_id().as_str(), "agent_2");
    }

    #[tokio::test]
    async fn open_and_delete_thread() {
        let mut h = harness(vec![], SessionSettings::default());
        let seeded = h.threads.insert(
            AgentId::from("agent_2"),
            vec![ConversationMessage::user("earlier")],
        );

        h.controller.open_thread(&seeded).await.unwrap();
        assert_eq!(h.controller.thread_id(), Some(&seeded));
        assert_eq!(h.controller.agent_id().as_str(), "agent_2");
        assert_eq!(h.controller.history()[0].content, "earlier");

        assert!(matches!(
            h.controller.open_thread(&ThreadId::from("thread_nope")).await,
            Err(SessionError::ThreadNotFound(_))
        ));

        h.controller.delete_thread(&seeded).await.unwrap();
        assert!(h.controller.thread_id().is_none());
        assert!(h.controller.history().is_empty());
        assert!(h.threads.is_empty());
    }

    #[test]
    fn turn_state_helpers() {
        assert!(TurnState::Streaming.is_open());
        assert!(!TurnState::Completed.is_open());
        assert!(TurnState::Cancelled.is_terminal());
        assert_eq!(TurnState::Errored.to_string(), "errored");
        assert_eq!(
            serde_json::to_value(TurnState::Cancelled).unwrap(),
            serde_json::json!("cancelled")
        );
    }
}
