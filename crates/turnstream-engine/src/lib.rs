//! Turn processing for streamed agent conversations.
//!
//! A [`SessionController`] owns one conversation. Each `send` opens a stream,
//! routes decoded events into a per-turn [`TurnContext`] (a
//! [`TraceAggregator`] plus a [`MessageAssembler`]) and merges the result into
//! the session history when the turn ends.

pub mod assembler;
pub mod controller;
pub mod error;
pub mod memory;
pub mod trace;
pub mod turn;

pub use assembler::{AssemblyState, MessageAssembler};
pub use controller::{CancelHandle, SessionController, SessionEvent, TurnOutcome, TurnState, TurnTrace};
pub use error::SessionError;
pub use memory::{InMemoryThreadService, StaticAgentRegistry};
pub use trace::{TraceAggregator, TraceAnomaly, TraceOutcome};
pub use turn::{Applied, TurnContext, TurnSignal};
