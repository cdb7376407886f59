//! Client side of the chat stream: opening a connection, splitting the SSE
//! body into frames and decoding frames into [`turnstream_core::events::StreamEvent`]s.

pub mod decoder;
pub mod http;
pub mod mock;
pub mod sse;
pub mod transport;

pub use decoder::{decode, decode_frame};
pub use http::HttpTransport;
pub use mock::{MockScript, MockStep, MockTransport};
pub use transport::{ChatRequest, ChatTransport, Connection, RawFrame};
