use chrono::{DateTime, Utc};

use turnstream_core::messages::ConversationMessage;

/// Lifecycle of the assistant message for one turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssemblyState {
    #[default]
    Empty,
    Streaming,
    Done,
    Errored,
    Cancelled,
}

impl AssemblyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }
}

/// Builds the assistant reply from token deltas.
///
/// Content is append-only while streaming and frozen once the message reaches
/// a terminal state; later calls return `false` and change nothing.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    message: Option<ConversationMessage>,
    state: AssemblyState,
    author: Option<String>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent display name stamped on the next message created.
    pub fn set_author(&mut self, author: Option<String>) {
        self.author = author;
    }

    pub fn on_token(&mut self, delta: &str) -> bool {
        self.on_token_at(delta, Utc::now())
    }

    pub fn on_token_at(&mut self, delta: &str, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let msg = self.ensure_message(now);
        msg.content.push_str(delta);
        msg.streaming = true;
        self.state = AssemblyState::Streaming;
        true
    }

    pub fn on_done(&mut self) -> bool {
        self.finish(AssemblyState::Done, |_| {})
    }

    /// Partial content is kept.
    pub fn on_error(&mut self, message: &str) -> bool {
        self.finish(AssemblyState::Errored, |msg| {
            msg.error = Some(message.to_string());
        })
    }

    pub fn on_cancel(&mut self) -> bool {
        self.finish(AssemblyState::Cancelled, |msg| msg.cancelled = true)
    }

    fn finish(&mut self, state: AssemblyState, mark: impl FnOnce(&mut ConversationMessage)) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let msg = self.ensure_message(Utc::now());
        msg.streaming = false;
        mark(msg);
        self.state = state;
        true
    }

    fn ensure_message(&mut self, now: DateTime<Utc>) -> &mut ConversationMessage {
        let author = &self.author;
        self.message.get_or_insert_with(|| {
            let mut msg = ConversationMessage::assistant_streaming(now);
            msg.author = author.clone();
            msg
        })
    }

    pub fn clear(&mut self) {
        self.message = None;
        self.state = AssemblyState::Empty;
        self.author = None;
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn message(&self) -> Option<&ConversationMessage> {
        self.message.as_ref()
    }

    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }
}
