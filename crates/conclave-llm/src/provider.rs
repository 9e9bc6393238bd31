use crate::model::ChatDriver;

/// A concrete, type-erased chat driver provider.
///
/// Wraps a [`ChatDriverProviderBackend`] behind a `Box<dyn ...>` so that
/// callers never need generic parameters — you can swap providers freely.
pub struct ChatDriverProvider {
    inner: Box<dyn ChatDriverProviderBackend>,
}

impl ChatDriverProvider {
    /// Wrap any backend implementation into a provider.
    pub fn new(backend: impl ChatDriverProviderBackend + 'static) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    /// The provider name (e.g. `"openai"`).
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Create a driver handle for the given model ID.
    pub fn model(&self, model_id: &str) -> ChatDriver {
        self.inner.model(model_id)
    }
}

/// Trait that provider crates implement.
pub trait ChatDriverProviderBackend: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self, model_id: &str) -> ChatDriver;
}
