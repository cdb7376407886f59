//! Shared data model for streamed agent turns: wire events, trace nodes,
//! conversation messages, error taxonomy and collaborator interfaces.

pub mod collab;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod trace;
