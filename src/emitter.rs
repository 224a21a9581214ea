//! Rendering of reconstructed pieces as OpenAI responses.
//!
//! Two sinks receive pieces from the failover loop:
//! - [`Aggregator`] collects everything into one assistant message.
//! - [`ChannelSink`] forwards each piece immediately as its own fragment;
//!   the HTTP layer turns every fragment into one SSE chunk.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, Delta, Usage,
};
use crate::reconstruct::Piece;
use crate::tokens::TokenCounter;

const FINISH_STOP: &str = "stop";
const ASSISTANT: &str = "assistant";

/// Receives reconstructed pieces as they are produced.
#[async_trait]
pub trait FragmentSink: Send + Sync {
    /// Forward one piece. Fails with [`ProxyError::ClientDisconnected`] once
    /// nobody is listening anymore.
    async fn emit(&mut self, piece: Piece) -> Result<(), ProxyError>;

    /// Everything emitted so far, as rendered text.
    fn content(&self) -> &str;

    /// Resolves once the receiving side is gone. Never resolves for sinks
    /// that live inside the request handler itself.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Forget everything from a failed attempt before the next one starts.
    /// Sinks that already delivered their pieces keep them.
    fn reset(&mut self) {}
}

/// Collects pieces into a single message.
#[derive(Debug, Default)]
pub struct Aggregator {
    content: String,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_content(self) -> String {
        self.content
    }
}

#[async_trait]
impl FragmentSink for Aggregator {
    async fn emit(&mut self, piece: Piece) -> Result<(), ProxyError> {
        match piece {
            Piece::ThinkOpen => self.content.push_str("<think>\n\n"),
            Piece::ThinkClose => self.content.push_str("\n\n</think>\n\n"),
            Piece::Content(text) => self.content.push_str(&text),
        }
        Ok(())
    }

    fn content(&self) -> &str {
        &self.content
    }

    fn reset(&mut self) {
        self.content.clear();
    }
}

/// Item delivered to the streaming response body.
#[derive(Debug)]
pub enum StreamItem {
    /// One content fragment, sent as its own chunk.
    Fragment(String),
    /// The stream completed; carries the final usage.
    Finished(Usage),
    /// The request failed.
    Failed(ProxyError),
}

/// Forwards every piece to the streaming response as soon as it exists.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamItem>,
    content: String,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamItem>) -> Self {
        Self {
            tx,
            content: String::new(),
        }
    }
}

#[async_trait]
impl FragmentSink for ChannelSink {
    async fn emit(&mut self, piece: Piece) -> Result<(), ProxyError> {
        let fragment = match piece {
            Piece::ThinkOpen => "<think>".to_string(),
            Piece::ThinkClose => "</think>".to_string(),
            Piece::Content(text) => text,
        };
        if fragment.is_empty() {
            return Ok(());
        }
        self.content.push_str(&fragment);
        self.tx
            .send(StreamItem::Fragment(fragment))
            .await
            .map_err(|_| ProxyError::ClientDisconnected)
    }

    fn content(&self) -> &str {
        &self.content
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Identity and accounting shared by every object of one response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub id: String,
    pub created: i64,
    pub model: String,
    /// Counted once per request over the serialized upstream envelope.
    pub prompt_tokens: u64,
}

impl ResponseContext {
    pub fn new(model: impl Into<String>, prompt_tokens: u64) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            prompt_tokens,
        }
    }

    /// Usage for a finished response with `content` as the completion.
    pub fn usage(&self, counter: &dyn TokenCounter, content: &str) -> Usage {
        Usage::new(self.prompt_tokens, counter.count(content, &self.model))
    }

    /// Streaming chunk carrying one fragment.
    pub fn chunk(&self, fragment: impl Into<String>) -> ChatCompletionChunk {
        self.chunk_with(fragment.into(), None, None)
    }

    /// Last streaming chunk before the `[DONE]` sentinel.
    pub fn final_chunk(&self, usage: Usage) -> ChatCompletionChunk {
        self.chunk_with(String::new(), Some(FINISH_STOP.to_string()), Some(usage))
    }

    fn chunk_with(
        &self,
        content: String,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: ASSISTANT.to_string(),
                    content,
                },
                finish_reason,
            }],
            usage,
        }
    }

    /// Aggregated response for non-streaming requests.
    pub fn completion(&self, content: String, usage: Usage) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: ASSISTANT.to_string(),
                    content,
                },
                finish_reason: Some(FINISH_STOP.to_string()),
            }],
            usage,
        }
    }
}
