use crate::request::GenerateRequest;
use crate::response::Response;
use tokio_util::sync::CancellationToken;

/// A concrete, type-erased chat driver handle.
///
/// Wraps a [`ChatDriverBackend`] so callers never need generics. This is the
/// Rust shape of the spec's "Chat Driver" external interface (§6): an
/// OpenAI-compatible streaming/non-streaming endpoint, consumed by the Agent
/// Turn Executor.
pub struct ChatDriver {
    inner: Box<dyn ChatDriverBackend>,
}

impl ChatDriver {
    /// Wrap any backend implementation into a driver handle.
    pub fn new(backend: impl ChatDriverBackend + 'static) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    /// The model identifier (e.g. `"gpt-4.1"`).
    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    /// The provider name this model belongs to.
    pub fn provider(&self) -> &str {
        self.inner.provider()
    }

    /// Generate a streaming response. `cancel` is observed at every await
    /// point inside the backend (§5/§9: a cancellation token threaded
    /// through async boundaries rather than a mutable global flag).
    pub fn generate(&self, request: GenerateRequest, cancel: CancellationToken) -> Response {
        self.inner.generate(request, cancel)
    }
}

/// Trait that provider crates implement for a specific model.
pub trait ChatDriverBackend: Send + Sync {
    fn model_id(&self) -> &str;
    fn provider(&self) -> &str;
    fn generate(&self, request: GenerateRequest, cancel: CancellationToken) -> Response;
}
