//! Model → provider routing.
//!
//! A model string resolves to an ordered list of candidate providers; the
//! proxy core dispatches to the first candidate the user holds credentials
//! for. The `provider:model` form pins a provider explicitly and the prefix
//! is stripped before dispatch.

use crate::store::ProviderType;

/// Routing outcome: candidate providers in preference order, and the model
/// string to send upstream (prefix-stripped for the colon form).
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub candidates: Vec<ProviderType>,
    pub model: String,
}

pub fn route_model(model: &str) -> Route {
    if model.starts_with("claude-") {
        return Route {
            candidates: vec![ProviderType::AnthropicAgent],
            model: model.to_string(),
        };
    }

    if model.starts_with("gemini-") {
        return Route {
            candidates: vec![ProviderType::VertexAi, ProviderType::Gemini],
            model: model.to_string(),
        };
    }

    if let Some((prefix, rest)) = model.split_once(':') {
        let candidates = ProviderType::parse(prefix.trim())
            .map(|p| vec![p])
            .unwrap_or_default();
        return Route {
            candidates,
            model: rest.to_string(),
        };
    }

    if model.contains('/') {
        return Route {
            candidates: vec![ProviderType::OpenRouter],
            model: model.to_string(),
        };
    }

    Route {
        candidates: Vec::new(),
        model: model.to_string(),
    }
}
