//! Static registry of the public model names this proxy serves.

/// Public model name → upstream model identifier and max-token ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Name clients send in `model`.
    pub name: &'static str,
    /// Identifier the upstream vendor expects.
    pub upstream_id: &'static str,
    /// Largest `max_tokens` a request may ask for.
    pub max_tokens: u32,
}

/// Suffix that selects the reasoning variant of a model.
pub const THINKING_SUFFIX: &str = "-thinking";

const REGISTRY: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "claude-3-7-sonnet",
        upstream_id: "agent_sonnet_37",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "claude-3-7-sonnet-thinking",
        upstream_id: "agent_sonnet_37",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "claude-3-5-sonnet",
        upstream_id: "agent_sonnet",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "deepseek-r1",
        upstream_id: "agent_deepseek_r1",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "deepseek-v3",
        upstream_id: "deepseek_v3",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "o3-mini",
        upstream_id: "agent_o3_mini",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "gpt-4o",
        upstream_id: "gpt4o",
        max_tokens: 100_000,
    },
    ModelDescriptor {
        name: "o1",
        upstream_id: "o1",
        max_tokens: 100_000,
    },
];

impl ModelDescriptor {
    /// Look up a model by its public name.
    pub fn lookup(name: &str) -> Option<&'static ModelDescriptor> {
        REGISTRY.iter().find(|m| m.name == name)
    }

    /// Every registered model, in registry order.
    pub fn all() -> &'static [ModelDescriptor] {
        REGISTRY
    }

    /// Whether requests for this model force a reasoning phase upstream.
    pub fn is_thinking(&self) -> bool {
        self.name.ends_with(THINKING_SUFFIX)
    }
}
