//! Converts between conclave-llm generic types and the OpenAI-compatible
//! `/v1/chat/completions` wire format.

use conclave_llm::request::{ChatMessage, GenerateRequest, Role, ToolChoice};

use crate::types::{
    ChatCompletionFunctionCall, ChatCompletionFunctionDef, ChatCompletionMessage,
    ChatCompletionRequest, ChatCompletionTool, ChatCompletionToolCall, StreamOptions,
};

pub fn to_chat_request(
    model_id: &str,
    req: &GenerateRequest,
    stream: bool,
) -> ChatCompletionRequest {
    let messages = req.messages.iter().map(to_wire_message).collect();

    let tools: Vec<ChatCompletionTool> = req
        .tools
        .iter()
        .map(|t| ChatCompletionTool::Function {
            function: ChatCompletionFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.to_json_schema(),
            },
        })
        .collect();

    let tool_choice = match &req.options.tool_choice {
        ToolChoice::Auto => None,
        ToolChoice::None => Some(serde_json::json!("none")),
        ToolChoice::Required => Some(serde_json::json!("required")),
        ToolChoice::Tool(name) => Some(serde_json::json!({
            "type": "function",
            "function": { "name": name },
        })),
    };

    ChatCompletionRequest {
        model: model_id.to_string(),
        messages,
        stream,
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
        max_tokens: req.options.max_tokens,
        temperature: req.options.temperature,
        top_p: req.options.top_p,
        stop: req.options.stop.clone(),
        tools,
        tool_choice,
    }
}

fn to_wire_message(msg: &ChatMessage) -> ChatCompletionMessage {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let content = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
        None
    } else {
        Some(msg.content.clone())
    };

    let tool_calls = msg
        .tool_calls
        .iter()
        .map(|tc| ChatCompletionToolCall {
            id: tc.id.clone(),
            kind: tc.kind.clone(),
            function: ChatCompletionFunctionCall {
                name: tc.function.name.clone(),
                arguments: tc.function.arguments.clone(),
            },
        })
        .collect();

    ChatCompletionMessage {
        role,
        content,
        name: msg.name.clone().or_else(|| msg.from.clone()),
        tool_call_id: msg.tool_call_id.clone(),
        tool_calls,
    }
}
