use turnstream_core::events::StreamEvent;
use turnstream_core::ids::MessageId;

use crate::assembler::MessageAssembler;
use crate::error::SessionError;
use crate::trace::{TraceAggregator, TraceOutcome};

/// What the controller should do after one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnSignal {
    Continue,
    /// `done` received.
    Completed,
    /// Server `error` received.
    Failed,
    /// The turn is not active; nothing changed.
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub signal: TurnSignal,
    /// Set for trace events.
    pub trace: Option<TraceOutcome>,
}

impl Applied {
    fn signal(signal: TurnSignal) -> Self {
        Self {
            signal,
            trace: None,
        }
    }
}

/// Owned state of exactly one turn.
///
/// Must be `clear`ed before every `begin`; a context that still holds a
/// previous turn refuses to start a new one.
#[derive(Debug)]
pub struct TurnContext {
    trace: TraceAggregator,
    assembler: MessageAssembler,
    user_message_id: Option<MessageId>,
    cleared: bool,
}

impl Default for TurnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnContext {
    pub fn new() -> Self {
        Self {
            trace: TraceAggregator::new(),
            assembler: MessageAssembler::new(),
            user_message_id: None,
            cleared: true,
        }
    }

    pub fn clear(&mut self) {
        self.trace.clear();
        self.assembler.clear();
        self.user_message_id = None;
        self.cleared = true;
    }

    pub fn begin(
        &mut self,
        user_message_id: MessageId,
        author: Option<String>,
    ) -> Result<(), SessionError> {
        if !self.cleared {
            return Err(SessionError::ContextNotCleared);
        }
        self.user_message_id = Some(user_message_id);
        self.assembler.set_author(author);
        self.cleared = false;
        Ok(())
    }

    /// Begun and not yet finished.
    pub fn is_active(&self) -> bool {
        self.user_message_id.is_some() && !self.assembler.state().is_terminal()
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Applied {
        if !self.is_active() {
            return Applied::signal(TurnSignal::Ignored);
        }
        match event {
            StreamEvent::Token(t) => {
                let _ = self.assembler.on_token(&t.content);
                Applied::signal(TurnSignal::Continue)
            }
            StreamEvent::Done(_) => {
                let _ = self.assembler.on_done();
                Applied::signal(TurnSignal::Completed)
            }
            StreamEvent::Error(e) => {
                let _ = self.assembler.on_error(&e.message);
                Applied::signal(TurnSignal::Failed)
            }
            StreamEvent::TraceStart(_) | StreamEvent::TraceUpdate(_) | StreamEvent::TraceEnd(_) => {
                Applied {
                    signal: TurnSignal::Continue,
                    trace: self.trace.apply(event),
                }
            }
        }
    }

    /// Record a transport failure as the turn's error.
    pub fn fail(&mut self, message: &str) -> bool {
        self.is_active() && self.assembler.on_error(message)
    }

    pub fn cancel(&mut self) -> bool {
        self.is_active() && self.assembler.on_cancel()
    }

    pub fn trace(&self) -> &TraceAggregator {
        &self.trace
    }

    pub fn assembler(&self) -> &MessageAssembler {
        &self.assembler
    }

    pub fn user_message_id(&self) -> Option<&MessageId> {
        self.user_message_id.as_ref()
    }
}
