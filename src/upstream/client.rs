//! HTTP transport to the vendor's streaming endpoint.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header;
use reqwest_eventsource::{retry::Never, Error as EventSourceError, Event, EventSource};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{UpstreamEvent, UpstreamTransport};
use crate::credentials::Credential;
use crate::error::ProxyError;
use crate::reconstruct::END_MARKER;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settings for [`SidebarClient`].
#[derive(Debug, Clone)]
pub struct SidebarClientConfig {
    /// Streaming chat endpoint.
    pub url: String,
    pub user_agent: String,
    /// Optional outbound proxy (`http://`, `https://` or `socks5://`).
    pub proxy_url: Option<String>,
}

/// reqwest-backed [`UpstreamTransport`].
#[derive(Debug, Clone)]
pub struct SidebarClient {
    http: reqwest::Client,
    config: SidebarClientConfig,
}

impl SidebarClient {
    pub fn new(config: SidebarClientConfig) -> Result<Self, ProxyError> {
        // No overall timeout: it would apply to the whole streamed body.
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(std::time::Duration::from_secs(30));
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| ProxyError::Transport(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| ProxyError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl UpstreamTransport for SidebarClient {
    async fn open_stream(
        &self,
        body: Bytes,
        credential: &Credential,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, ProxyError> {
        let request = self
            .http
            .post(&self.config.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .header(header::COOKIE, credential.token())
            .body(body);

        let mut source = EventSource::new(request)
            .map_err(|e| ProxyError::Transport(format!("Failed to open event stream: {}", e)))?;
        // Failover decides what happens next, never the event source.
        source.set_retry_policy(Box::new(Never));

        debug!(
            url = %self.config.url,
            credential = %credential,
            "Opening upstream stream"
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(forward_events(source, tx));
        Ok(rx)
    }
}

/// Pump SSE messages into `tx` until the stream ends, a terminal event is
/// sent, or the receiver goes away.
async fn forward_events(mut source: EventSource, tx: mpsc::Sender<UpstreamEvent>) {
    loop {
        let item = tokio::select! {
            item = source.next() => item,
            _ = tx.closed() => {
                debug!("Upstream event receiver dropped, closing stream");
                break;
            }
        };

        let event = match item {
            None | Some(Err(EventSourceError::StreamEnded)) => break,
            Some(Ok(Event::Open)) => continue,
            Some(Ok(Event::Message(message))) => {
                let done = message.data.trim() == END_MARKER;
                UpstreamEvent {
                    data: message.data,
                    done,
                }
            }
            Some(Err(EventSourceError::InvalidStatusCode(status, response))) => {
                warn!(status = %status, "Upstream rejected stream");
                UpstreamEvent::terminal(response_text(status, response).await)
            }
            Some(Err(EventSourceError::InvalidContentType(content_type, response))) => {
                warn!(content_type = ?content_type, "Upstream answered without an event stream");
                let status = response.status();
                UpstreamEvent::terminal(response_text(status, response).await)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream stream failed");
                UpstreamEvent::terminal(e.to_string())
            }
        };

        let last = event.done;
        if tx.send(event).await.is_err() {
            debug!("Upstream event receiver dropped");
            break;
        }
        if last {
            break;
        }
    }
    source.close();
}

/// Body of a rejected response, or its status line when the body is empty.
async fn response_text(status: reqwest::StatusCode, response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}
