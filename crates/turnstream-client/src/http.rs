use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use turnstream_core::errors::ConnectionError;
use turnstream_core::ids::{AgentId, ThreadId};
use turnstream_core::messages::WireMessage;
use turnstream_settings::TransportSettings;

use crate::sse::SseFrameStream;
use crate::transport::{ChatRequest, ChatTransport, Connection};

#[derive(Serialize)]
struct StreamBody<'a> {
    thread_id: &'a ThreadId,
    agent_id: &'a AgentId,
    messages: &'a [WireMessage],
    stream: bool,
}

/// SSE chat transport over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .build()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: reqwest::Client, settings: &TransportSettings) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}{}",
                settings.base_url.trim_end_matches('/'),
                settings.stream_path
            ),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(thread_id = %request.thread_id, messages = request.messages.len()))]
    async fn open(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectionError> {
        if request.messages.is_empty() {
            return Err(ConnectionError::InvalidRequest(
                "message history is empty".into(),
            ));
        }

        let body = StreamBody {
            thread_id: &request.thread_id,
            agent_id: &request.agent_id,
            messages: &request.messages,
            stream: true,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "stream request rejected");
            return Err(ConnectionError::from_status(status, body));
        }

        debug!(endpoint = %self.endpoint, "stream opened");
        let frames = SseFrameStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout);
        Ok(Connection::new(frames, cancel))
    }
}
