mod convert;
mod stream;
mod types;

use conclave_llm::request::GenerateRequest;
use conclave_llm::response::Response;
use conclave_llm::{
    ChatDriver, ChatDriverBackend, ChatDriverProvider, ChatDriverProviderBackend, RequestBuilder,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Configuration for an OpenAI-compatible provider (§6: the chat driver
/// external interface). `base_url` defaults to the official API but any
/// server implementing the same `/v1/chat/completions` contract works —
/// local inference gateways included.
pub struct OpenAIConfig {
    pub auth_token: String,
    pub base_url: String,
    /// Additional headers to include in every request.
    pub extra_headers: HashMap<String, String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            extra_headers: HashMap::new(),
        }
    }
}

/// Create an OpenAI-compatible provider with the given config.
pub fn provider(config: OpenAIConfig) -> ChatDriverProvider {
    ChatDriverProvider::new(OpenAIProvider {
        state: Arc::new(ProviderState {
            client: reqwest::Client::new(),
            config,
        }),
    })
}

/// Create a provider reading `OPENAI_API_KEY` (and optionally
/// `OPENAI_BASE_URL`) from the environment.
pub fn from_env() -> ChatDriverProvider {
    provider(OpenAIConfig {
        auth_token: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        base_url: std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Extension trait for provider-specific request options
// ---------------------------------------------------------------------------

/// Extension methods for [`RequestBuilder`] that set OpenAI-specific
/// generation options passed through as request metadata.
pub trait OpenAIRequestExt {
    /// Request a non-default sampling seed for reproducibility in tests.
    fn seed(&mut self, seed: i64) -> &mut Self;
}

impl OpenAIRequestExt for RequestBuilder {
    fn seed(&mut self, seed: i64) -> &mut Self {
        self.meta("seed", seed)
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct ProviderState {
    client: reqwest::Client,
    config: OpenAIConfig,
}

struct OpenAIProvider {
    state: Arc<ProviderState>,
}

impl ChatDriverProviderBackend for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self, model_id: &str) -> ChatDriver {
        ChatDriver::new(OpenAIModel {
            model_id: model_id.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct OpenAIModel {
    model_id: String,
    state: Arc<ProviderState>,
}

impl ChatDriverBackend for OpenAIModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: GenerateRequest, cancel: CancellationToken) -> Response {
        let body = convert::to_chat_request(&self.model_id, &request, true);
        let state = Arc::clone(&self.state);
        let event_stream = stream::open(state, body, cancel);
        Response::new(event_stream)
    }
}
