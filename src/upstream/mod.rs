//! Upstream vendor transport.
//!
//! The failover loop only needs "open a stream with this credential and hand
//! me its events"; [`UpstreamTransport`] is that seam. [`client::SidebarClient`]
//! is the HTTP implementation, tests plug in scripted transports.

pub mod client;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::credentials::Credential;
use crate::error::ProxyError;

pub use client::{SidebarClient, SidebarClientConfig};

/// One raw event from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    /// Raw payload (JSON snapshot, end marker, or status text).
    pub data: String,
    /// Set on the last event the transport will deliver for this stream.
    pub done: bool,
}

impl UpstreamEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            done: false,
        }
    }

    pub fn terminal(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            done: true,
        }
    }
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Open one streaming call carrying `body` (the serialized envelope)
    /// authenticated as `credential`.
    ///
    /// Dropping the receiver cancels the stream and releases the connection.
    async fn open_stream(
        &self,
        body: Bytes,
        credential: &Credential,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, ProxyError>;
}
