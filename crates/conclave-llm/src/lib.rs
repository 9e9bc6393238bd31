pub mod error;
pub mod model;
pub mod provider;
pub mod request;
pub mod response;
pub mod stream;

pub use error::Error;
pub use model::{ChatDriver, ChatDriverBackend};
pub use provider::{ChatDriverProvider, ChatDriverProviderBackend};
pub mod describe;

pub use describe::Describe;
pub use request::{
    ChatMessage, FunctionCall, GenerateOptions, GenerateRequest, Property, RequestBuilder, Role,
    Schema, ToolCall, ToolChoice, ToolDefinition, request,
};
pub use response::{GenerateResult, Response};
pub use stream::{FinishReason, StreamEvent, Usage};
