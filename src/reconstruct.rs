//! Delta reconstruction over the vendor's cumulative section stream.
//!
//! Every upstream event re-sends the whole message as a list of sections,
//! and only the last section is still being written. Nothing in the stream
//! is a true delta: each event replaces the previous snapshot, and the
//! increment has to be recovered by diffing against what was seen before.
//!
//! [`ReconstructionState::step`] consumes one event and returns a [`Signal`]:
//! content pieces to forward, stream completion, or a classified failure the
//! failover loop acts on. The state belongs to a single upstream attempt and
//! is thrown away when the attempt ends.

use serde::Deserialize;

use crate::upstream::UpstreamEvent;

/// Payload that ends a successful stream.
pub const END_MARKER: &str = "[DONE]";

/// Partial echoes of an internal stop token that trail some text snapshots.
const OPEN_TAG_ARTIFACTS: [&str; 2] = ["</new_", "</new"];

/// Separator placed around code blocks.
const BLOCK_SEPARATOR: &str = "\n\n";

/// One unit of reconstructed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Start of the reasoning phase.
    ThinkOpen,
    /// End of the reasoning phase.
    ThinkClose,
    /// Newly produced text or code.
    Content(String),
}

/// Failures that rotate to the next credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    /// Quota for this credential is gone; drop it from the pool.
    UsageLimitExceeded,
    /// Temporarily throttled; exclude it for the lock duration.
    RateLimited,
    /// Session not logged in; state unknown, leave the pool alone.
    NotLoggedIn,
}

impl std::fmt::Display for RecoverableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsageLimitExceeded => write!(f, "usage_limit_exceeded"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::NotLoggedIn => write!(f, "not_logged_in"),
        }
    }
}

/// Failures that end the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    /// The vendor refused the conversation language.
    UnsupportedLanguage,
    /// A terminal payload that matched no known pattern.
    Unclassified(String),
    /// An event body that isn't the expected JSON.
    Malformed(String),
}

/// Result of processing one upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Keep reading. May carry zero pieces.
    Continue(Vec<Piece>),
    /// The stream ended successfully.
    Complete,
    Recoverable(RecoverableKind),
    Fatal(FatalKind),
}

/// Classification of a terminal, non-end-marker payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalClass {
    UsageLimitExceeded,
    UnsupportedLanguage,
    NotLoggedIn,
    RateLimited,
    Unclassified,
}

/// Classify upstream status text. Checked in order; the first match wins.
pub fn classify_terminal(payload: &str) -> TerminalClass {
    let lower = payload.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["usage limit", "usage_limit", "usage-limit", "quota"]) {
        TerminalClass::UsageLimitExceeded
    } else if has(&["chinese", "use english", "unsupported language"]) {
        TerminalClass::UnsupportedLanguage
    } else if has(&[
        "not logged in",
        "not_logged_in",
        "not login",
        "login required",
        "unauthorized",
    ]) {
        TerminalClass::NotLoggedIn
    } else if has(&["rate limit", "rate_limit", "rate-limit", "too many requests"]) {
        TerminalClass::RateLimited
    } else {
        TerminalClass::Unclassified
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamPayload {
    #[serde(default)]
    sections: Option<Vec<Section>>,
}

#[derive(Debug, Deserialize)]
struct Section {
    #[serde(default)]
    text: Option<TextBlock>,
    #[serde(default)]
    code: Option<CodeBlock>,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_thinking: bool,
}

#[derive(Debug, Deserialize)]
struct CodeBlock {
    #[serde(default)]
    code: String,
}

/// Remove trailing stop-token echoes.
pub fn strip_open_tag_artifacts(text: &str) -> &str {
    OPEN_TAG_ARTIFACTS
        .iter()
        .fold(text, |acc, artifact| acc.strip_suffix(artifact).unwrap_or(acc))
}

/// Newly produced text given the previous snapshot.
///
/// Growth continues the previous text; anything else is a restart and is
/// returned whole behind a line break.
pub fn text_delta(current: &str, last: &str) -> String {
    let current = strip_open_tag_artifacts(current);
    if last.is_empty() {
        return current.to_string();
    }

    let trimmed_current = current.trim();
    let trimmed_last = last.trim();
    if trimmed_current.starts_with(trimmed_last) {
        let trimmed_rest = || trimmed_current.get(trimmed_last.len()..);
        // The byte offset of `last` may fall inside a multi-byte character
        // of `current` when only trailing whitespace differs.
        let delta = if last.len() > current.len() {
            trimmed_rest()
        } else {
            current.get(last.len()..).or_else(trimmed_rest)
        };
        return delta.unwrap_or_default().to_string();
    }

    format!("\n{}", current)
}

/// Newly produced code given the previous snapshot, plus whether this is the
/// first code seen in the section.
pub fn code_delta(current: &str, last: &str) -> (String, bool) {
    let is_first = last.is_empty() && !current.is_empty();
    if last.is_empty() {
        return (current.to_string(), is_first);
    }
    match current.strip_prefix(last) {
        Some(rest) => (rest.to_string(), is_first),
        None => (current.to_string(), is_first),
    }
}

/// Per-attempt reconstruction state.
#[derive(Debug, Default, Clone)]
pub struct ReconstructionState {
    last_text: String,
    last_code: String,
    think_started: bool,
    think_ended: bool,
}

impl ReconstructionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&mut self, event: &UpstreamEvent) -> Signal {
        self.step(&event.data, event.done)
    }

    /// Process one raw event payload. `terminal` marks the transport's last
    /// event for this attempt.
    pub fn step(&mut self, raw: &str, terminal: bool) -> Signal {
        let trimmed = raw.trim();
        let payload = trimmed
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(trimmed);

        if payload == END_MARKER {
            return Signal::Complete;
        }

        if terminal {
            return match classify_terminal(payload) {
                TerminalClass::UsageLimitExceeded => {
                    Signal::Recoverable(RecoverableKind::UsageLimitExceeded)
                }
                TerminalClass::RateLimited => Signal::Recoverable(RecoverableKind::RateLimited),
                TerminalClass::NotLoggedIn => Signal::Recoverable(RecoverableKind::NotLoggedIn),
                TerminalClass::UnsupportedLanguage => Signal::Fatal(FatalKind::UnsupportedLanguage),
                TerminalClass::Unclassified => {
                    Signal::Fatal(FatalKind::Unclassified(payload.to_string()))
                }
            };
        }

        if payload.is_empty() {
            return Signal::Continue(Vec::new());
        }

        let parsed: UpstreamPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => return Signal::Fatal(FatalKind::Malformed(e.to_string())),
        };
        let Some(section) = parsed.sections.as_ref().and_then(|s| s.last()) else {
            return Signal::Continue(Vec::new());
        };

        Signal::Continue(self.section(section))
    }

    fn section(&mut self, section: &Section) -> Vec<Piece> {
        let mut open = false;
        let mut close = false;
        if let Some(text) = &section.text {
            if text.is_thinking && !self.think_started {
                self.think_started = true;
                open = true;
            } else if !text.is_thinking && self.think_started && !self.think_ended {
                self.think_ended = true;
                close = true;
            }
        }

        let mut body = Vec::new();

        // Prose resumed after a code block.
        if !self.last_code.is_empty() && section.text.is_some() && section.code.is_none() {
            body.push(Piece::Content(BLOCK_SEPARATOR.to_string()));
            self.last_code.clear();
        }

        let mut produced_text = false;
        if let Some(text) = section.text.as_ref().filter(|t| !t.text.is_empty()) {
            let delta = text_delta(&text.text, &self.last_text);
            let stripped = strip_open_tag_artifacts(&text.text);
            if stripped != self.last_text {
                self.last_text = stripped.to_string();
            }
            if !delta.is_empty() {
                body.push(Piece::Content(delta));
                produced_text = true;
            }
        }

        if !produced_text {
            if let Some(code) = &section.code {
                let (delta, is_first) = code_delta(&code.code, &self.last_code);
                if !delta.is_empty() {
                    let delta = if is_first {
                        format!("{}{}", BLOCK_SEPARATOR, delta)
                    } else {
                        delta
                    };
                    body.push(Piece::Content(delta));
                    self.last_code = code.code.clone();
                } else if !self.last_code.is_empty() && code.code.is_empty() {
                    body.push(Piece::Content(BLOCK_SEPARATOR.to_string()));
                    self.last_code.clear();
                }
            }
        }

        let mut pieces = Vec::with_capacity(body.len() + 2);
        if open {
            pieces.push(Piece::ThinkOpen);
        }
        pieces.extend(body);
        if close {
            pieces.push(Piece::ThinkClose);
        }
        pieces
    }
}
