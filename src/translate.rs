//! Translation of OpenAI chat requests into the upstream message envelope.

use serde::Serialize;

use crate::models::ModelDescriptor;
use crate::openai::ChatCompletionRequest;

/// `max_tokens` used when the client leaves it unset or sends a value ≤ 1.
pub const DEFAULT_MAX_TOKENS: u32 = 8000;

/// Body of one upstream streaming call.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamEnvelope {
    pub model: String,
    pub prompt: String,
    pub api_keys: ApiKeys,
    pub deps: Vec<serde_json::Value>,
    pub messages: Vec<UpstreamMessage>,
    /// Effective output bound. The vendor takes no such field; kept for logging.
    #[serde(skip)]
    pub max_tokens: u32,
}

/// Bring-your-own-key slots; always sent empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiKeys {
    pub anthropic: String,
    pub perplexity: String,
    pub gemini: String,
    pub openai: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub id: usize,
    pub ts_created: i64,
    pub web_access: bool,
    pub img_urls: Vec<String>,
    pub relevant_files: Vec<String>,
    pub docs: Vec<serde_json::Value>,
    pub code_contexts: Vec<serde_json::Value>,
    pub think_first: bool,
    pub sections: Vec<EnvelopeSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeSection {
    pub text: EnvelopeText,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeText {
    pub text: String,
    pub is_thinking: bool,
}

/// Capitalize a chat role the way the vendor spells it.
pub fn capitalize_role(role: &str) -> String {
    match role.to_ascii_lowercase().as_str() {
        "user" => "User".to_string(),
        "assistant" => "Assistant".to_string(),
        "system" => "System".to_string(),
        _ => {
            let mut chars = role.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

/// Normalize the requested output bound.
pub fn effective_max_tokens(requested: Option<i64>) -> u32 {
    match requested {
        Some(n) if n > 1 => u32::try_from(n).unwrap_or(u32::MAX),
        _ => DEFAULT_MAX_TOKENS,
    }
}

/// Build the upstream envelope for `request` against `model`.
///
/// Empty messages are expected to have been dropped already; ids are the
/// message positions after that filtering.
pub fn translate(request: &ChatCompletionRequest, model: &ModelDescriptor) -> UpstreamEnvelope {
    let now = chrono::Utc::now().timestamp();
    let thinking = model.is_thinking();
    let last = request.messages.len().saturating_sub(1);

    let messages = request
        .messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let sections = msg
                .content
                .texts()
                .into_iter()
                .map(|text| EnvelopeSection {
                    text: EnvelopeText {
                        text: text.to_string(),
                        is_thinking: false,
                    },
                })
                .collect();
            UpstreamMessage {
                role: capitalize_role(&msg.role),
                id: i,
                ts_created: now,
                web_access: false,
                img_urls: Vec::new(),
                relevant_files: Vec::new(),
                docs: Vec::new(),
                code_contexts: Vec::new(),
                think_first: thinking && msg.role == "user" && i == last,
                sections,
            }
        })
        .collect();

    UpstreamEnvelope {
        model: model.upstream_id.to_string(),
        prompt: String::new(),
        api_keys: ApiKeys::default(),
        deps: Vec::new(),
        messages,
        max_tokens: effective_max_tokens(request.max_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str, body: &str) -> ChatCompletionRequest {
        let mut req: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        req.model = model.to_string();
        req
    }

    #[test]
    fn roles_are_capitalized() {
        assert_eq!(capitalize_role("user"), "User");
        assert_eq!(capitalize_role("ASSISTANT"), "Assistant");
        assert_eq!(capitalize_role("system"), "System");
        assert_eq!(capitalize_role("tool"), "Tool");
        assert_eq!(capitalize_role(""), "");
    }

    #[test]
    fn max_tokens_at_or_below_one_uses_default() {
        assert_eq!(effective_max_tokens(None), DEFAULT_MAX_TOKENS);
        assert_eq!(effective_max_tokens(Some(0)), DEFAULT_MAX_TOKENS);
        assert_eq!(effective_max_tokens(Some(1)), DEFAULT_MAX_TOKENS);
        assert_eq!(effective_max_tokens(Some(2)), 2);
        assert_eq!(effective_max_tokens(Some(-5)), DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn thinking_flag_only_on_final_user_message() {
        let model = ModelDescriptor::lookup("claude-3-7-sonnet-thinking").unwrap();
        let req = request(
            model.name,
            r#"{"model":"","messages":[
                {"role":"user","content":"first"},
                {"role":"assistant","content":"reply"},
                {"role":"user","content":"second"}
            ]}"#,
        );
        let env = translate(&req, model);
        let flags: Vec<bool> = env.messages.iter().map(|m| m.think_first).collect();
        assert_eq!(flags, vec![false, false, true]);
        assert_eq!(env.model, "agent_sonnet_37");
    }

    #[test]
    fn thinking_flag_not_set_when_last_message_is_assistant() {
        let model = ModelDescriptor::lookup("claude-3-7-sonnet-thinking").unwrap();
        let req = request(
            model.name,
            r#"{"model":"","messages":[
                {"role":"user","content":"q"},
                {"role":"assistant","content":"partial"}
            ]}"#,
        );
        let env = translate(&req, model);
        assert!(env.messages.iter().all(|m| !m.think_first));
    }

    #[test]
    fn list_content_keeps_only_text_parts() {
        let model = ModelDescriptor::lookup("gpt-4o").unwrap();
        let req = request(
            model.name,
            r#"{"model":"","messages":[{"role":"user","content":[
                {"type":"text","text":"look"},
                {"type":"image_url","image_url":{"url":"http://x"}},
                {"type":"text","text":"here"}
            ]}]}"#,
        );
        let env = translate(&req, model);
        let texts: Vec<&str> = env.messages[0]
            .sections
            .iter()
            .map(|s| s.text.text.as_str())
            .collect();
        assert_eq!(texts, vec!["look", "here"]);
    }

    #[test]
    fn envelope_serializes_vendor_fields() {
        let model = ModelDescriptor::lookup("o1").unwrap();
        let req = request(model.name, r#"{"model":"","messages":[{"role":"user","content":"hi"}]}"#);
        let value = serde_json::to_value(translate(&req, model)).unwrap();
        assert_eq!(value["model"], "o1");
        assert_eq!(value["prompt"], "");
        assert_eq!(value["api_keys"]["anthropic"], "");
        assert!(value["deps"].as_array().unwrap().is_empty());
        assert!(value.get("max_tokens").is_none());
        let msg = &value["messages"][0];
        assert_eq!(msg["role"], "User");
        assert_eq!(msg["id"], 0);
        assert_eq!(msg["web_access"], false);
        assert_eq!(msg["sections"][0]["text"]["text"], "hi");
        assert_eq!(msg["sections"][0]["text"]["is_thinking"], false);
    }
}
