use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// ChatMessage — the data-model record from the spec (role/from/content/...)
// ---------------------------------------------------------------------------

/// The role a [`ChatMessage`] plays in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single function/tool call, either requested by the assistant or, while
/// streaming, accumulated incrementally by `index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, kept as a string on the wire (§9: dynamic
    /// JSON in tool arguments gets a typed coercion layer only at the
    /// dispatch boundary, not in the transport type).
    pub arguments: String,
}

/// A record of one turn in the conversation. Immutable once produced; the
/// memory subsystem refreshes only the head system message in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// The agent or user id that authored this message, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            from: None,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::user_from(None::<String>, content)
    }

    pub fn user_from(from: Option<impl Into<String>>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            from: from.map(Into::into),
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            from: None,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            from: None,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            from: None,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level request
// ---------------------------------------------------------------------------

/// A request to generate a chat-completion response.
#[derive(Default, Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub options: GenerateOptions,
    /// Provider-specific metadata (e.g. reasoning effort). Passed through to
    /// the backend as-is.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Knobs that control generation behavior.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub tool_choice: ToolChoice,
}

/// A tool the model may call.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Schema,
}

/// Controls how the model selects tools.
#[derive(Debug, Clone, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force calling a specific tool by name.
    Tool(String),
}

// ---------------------------------------------------------------------------
// Request builder — fluent, mirrors the ergonomics of the plain option
// records used elsewhere in the stack (§9: explicit config over duck typing)
// ---------------------------------------------------------------------------

/// Build a [`GenerateRequest`] fluently.
///
/// ```
/// use conclave_llm::request;
///
/// let mut builder = request();
/// builder.system("You are helpful").user("hi");
/// let req = builder.build();
/// assert_eq!(req.messages.len(), 2);
/// ```
pub fn request() -> RequestBuilder {
    RequestBuilder::default()
}

#[derive(Default)]
pub struct RequestBuilder {
    req: GenerateRequest,
}

impl RequestBuilder {
    pub fn system(&mut self, text: impl Into<String>) -> &mut Self {
        self.req.messages.push(ChatMessage::system(text));
        self
    }

    pub fn user(&mut self, text: impl Into<String>) -> &mut Self {
        self.req.messages.push(ChatMessage::user(text));
        self
    }

    pub fn messages(&mut self, messages: Vec<ChatMessage>) -> &mut Self {
        self.req.messages = messages;
        self
    }

    pub fn tools(&mut self, tools: Vec<ToolDefinition>) -> &mut Self {
        self.req.tools = tools;
        self
    }

    pub fn temperature(&mut self, temperature: f32) -> &mut Self {
        self.req.options.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(&mut self, max_tokens: u32) -> &mut Self {
        self.req.options.max_tokens = Some(max_tokens);
        self
    }

    pub fn tool_choice(&mut self, choice: ToolChoice) -> &mut Self {
        self.req.options.tool_choice = choice;
        self
    }

    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.req.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(&mut self) -> GenerateRequest {
        std::mem::take(&mut self.req)
    }
}

// ---------------------------------------------------------------------------
// Schema descriptor — Rust-native, converts to JSON Schema downstream
// ---------------------------------------------------------------------------

/// A Rust-native description of a value's shape, convertible to JSON Schema.
#[derive(Debug, Clone)]
pub enum Schema {
    String {
        description: Option<String>,
        enumeration: Option<Vec<String>>,
    },
    Number {
        description: Option<String>,
    },
    Integer {
        description: Option<String>,
    },
    Boolean {
        description: Option<String>,
    },
    Array {
        description: Option<String>,
        items: Box<Schema>,
    },
    Object {
        description: Option<String>,
        properties: Vec<Property>,
        required: Vec<String>,
    },
    /// Escape hatch: a literal JSON Schema value for cases we don't cover.
    Raw(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub schema: Schema,
}

impl Schema {
    /// Convert to a JSON Schema `serde_json::Value`.
    pub fn to_json_schema(&self) -> serde_json::Value {
        match self {
            Schema::String {
                description,
                enumeration,
            } => {
                let mut obj = serde_json::json!({ "type": "string" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                if let Some(e) = enumeration {
                    obj["enum"] = serde_json::json!(e);
                }
                obj
            }
            Schema::Number { description } => {
                let mut obj = serde_json::json!({ "type": "number" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Integer { description } => {
                let mut obj = serde_json::json!({ "type": "integer" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Boolean { description } => {
                let mut obj = serde_json::json!({ "type": "boolean" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Array { description, items } => {
                let mut obj = serde_json::json!({
                    "type": "array",
                    "items": items.to_json_schema(),
                });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Object {
                description,
                properties,
                required,
            } => {
                let props: serde_json::Map<String, serde_json::Value> = properties
                    .iter()
                    .map(|p| (p.name.clone(), p.schema.to_json_schema()))
                    .collect();
                let mut obj = serde_json::json!({
                    "type": "object",
                    "properties": props,
                });
                if !required.is_empty() {
                    obj["required"] = serde_json::json!(required);
                }
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Raw(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_collects_messages() {
        let mut b = request();
        b.system("base").user("hi");
        let req = b.build();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].role, Role::User);
    }

    #[test]
    fn schema_object_round_trips_to_json() {
        let schema = Schema::Object {
            description: None,
            properties: vec![Property {
                name: "cmd".into(),
                schema: Schema::String {
                    description: Some("the command".into()),
                    enumeration: None,
                },
            }],
            required: vec!["cmd".into()],
        };
        let json = schema.to_json_schema();
        assert_eq!(json["type"], "object");
        assert_eq!(json["required"][0], "cmd");
    }
}
