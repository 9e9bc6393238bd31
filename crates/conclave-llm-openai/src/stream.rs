//! Opens a connection to an OpenAI-compatible `/v1/chat/completions`
//! endpoint and maps SSE chunks (or, for non-streaming responses, a single
//! JSON body) to the conclave-llm `StreamEvent` type.

use crate::ProviderState;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use conclave_llm::error::Error;
use conclave_llm::request::{FunctionCall, ToolCall};
use conclave_llm::stream::{FinishReason, StreamEvent, Usage};
use eventsource_stream::Eventsource;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// §5/§9: drivers impose an outer watchdog regardless of what the caller's
/// cancellation token does, so a hung connection can never wedge the
/// scheduler indefinitely.
const STREAMING_WATCHDOG: Duration = Duration::from_secs(2 * 60 * 60);
const NON_STREAMING_WATCHDOG: Duration = Duration::from_secs(45);

/// Every this-many SSE events we yield back to the executor even if more
/// data is immediately available, so cancellation and hotkey acks stay
/// responsive on a fast-talking stream (§5).
const YIELD_EVERY: usize = 32;

pub fn open(
    state: Arc<ProviderState>,
    body: ChatCompletionRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent, Error>> + Send {
    async_stream::try_stream! {
        let url = format!("{}/chat/completions", state.config.base_url);
        let mut req = state
            .client
            .post(&url)
            .bearer_auth(&state.config.auth_token);
        for (k, v) in &state.config.extra_headers {
            req = req.header(k, v);
        }

        let watchdog = if body.stream {
            STREAMING_WATCHDOG
        } else {
            NON_STREAMING_WATCHDOG
        };

        let send = req.json(&body).send();
        let resp = tokio::select! {
            result = tokio::time::timeout(watchdog, send) => {
                match result {
                    Ok(Ok(resp)) => resp,
                    Ok(Err(e)) => Err(Error::Http(Box::new(e)))?,
                    Err(_) => Err(Error::Timeout(watchdog))?,
                }
            }
            _ = cancel.cancelled() => {
                Err(Error::Other("generation cancelled".into()))?
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            Err(Error::Api {
                code: status.as_str().to_string(),
                message: body_text,
                metadata: Default::default(),
            })?;
        }

        let is_event_stream = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !body.stream || !is_event_stream {
            // Non-streaming fallback: the whole body is one JSON document.
            let parsed: ChatCompletionResponse = resp
                .json()
                .await
                .map_err(|e| Error::Http(Box::new(e)))?;
            for event in map_full_response(parsed) {
                yield event;
            }
            return;
        }

        let mut sse = resp.bytes_stream().eventsource();
        let mut mapper = ChunkMapper::new();
        let mut events_since_yield = 0usize;

        loop {
            let next = tokio::select! {
                item = sse.next() => item,
                _ = cancel.cancelled() => {
                    Err(Error::Other("generation cancelled".into()))?;
                    unreachable!()
                }
            };
            let Some(event) = next else { break };
            match event {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        break;
                    }
                    for stream_event in mapper.map_chunk(&event.data)? {
                        yield stream_event;
                    }
                }
                Err(e) => {
                    Err(Error::Sse(e.to_string()))?;
                }
            }

            events_since_yield += 1;
            if events_since_yield >= YIELD_EVERY {
                events_since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        for event in mapper.finish() {
            yield event;
        }
    }
}

/// Maps the fully-buffered non-streaming response to the same event
/// sequence a streaming call would have produced, so callers can treat both
/// uniformly via [`conclave_llm::Response::into_result`].
fn map_full_response(resp: ChatCompletionResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let Some(choice) = resp.choices.into_iter().next() else {
        return events;
    };

    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta(text));
        }
    }
    if let Some(reasoning) = choice.message.reasoning_content {
        if !reasoning.is_empty() {
            events.push(StreamEvent::ReasoningDelta(reasoning));
        }
    }

    let has_tool_calls = !choice.message.tool_calls.is_empty();
    for (index, tc) in choice.message.tool_calls.into_iter().enumerate() {
        events.push(StreamEvent::ToolCallEnd {
            index,
            call: ToolCall {
                id: tc.id,
                kind: tc.kind,
                function: FunctionCall {
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                },
            },
        });
    }

    let reason = finish_reason_from_str(choice.finish_reason.as_deref(), has_tool_calls);
    let usage = resp.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        reasoning_tokens: u
            .completion_tokens_details
            .and_then(|d| d.reasoning_tokens),
        cached_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
    });
    events.push(StreamEvent::Finish { reason, usage });
    events
}

fn finish_reason_from_str(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None if has_tool_calls => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    }
}

// ---------------------------------------------------------------------------
// Chunk mapper (stateful — accumulates tool call argument deltas by index)
// ---------------------------------------------------------------------------

struct ChunkMapper {
    has_tool_calls: bool,
    /// Tool calls seen so far, in order of first appearance, keyed by index.
    tool_calls: std::collections::BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
    announced: bool,
}

impl ChunkMapper {
    fn new() -> Self {
        Self {
            has_tool_calls: false,
            tool_calls: std::collections::BTreeMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamEvent>, Error> {
        let parsed: ChatCompletionChunk = serde_json::from_str(data)?;
        let mut events = Vec::new();

        if let Some(usage) = parsed.usage {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                reasoning_tokens: usage
                    .completion_tokens_details
                    .and_then(|d| d.reasoning_tokens),
                cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
            });
        }

        for choice in parsed.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text));
                }
            }
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    events.push(StreamEvent::ReasoningDelta(reasoning));
                }
            }

            for delta in choice.delta.tool_calls {
                self.has_tool_calls = true;
                let entry = self.tool_calls.entry(delta.index).or_insert_with(|| {
                    PartialToolCall {
                        id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                        announced: false,
                    }
                });
                if let Some(id) = delta.id {
                    entry.id = id;
                }
                if let Some(name) = delta.function.name {
                    entry.name = name;
                }
                if let Some(args) = delta.function.arguments {
                    if !entry.announced && !entry.id.is_empty() && !entry.name.is_empty() {
                        entry.announced = true;
                        events.push(StreamEvent::ToolCallBegin {
                            index: delta.index,
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                        });
                    }
                    if entry.announced {
                        events.push(StreamEvent::ToolCallDelta {
                            index: delta.index,
                            arguments_delta: args.clone(),
                        });
                    }
                    entry.arguments.push_str(&args);
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(finish_reason_from_str(
                    Some(&reason),
                    self.has_tool_calls,
                ));
            }
        }

        Ok(events)
    }

    /// Flush completed tool calls followed by the terminal `Finish` event.
    ///
    /// OpenAI splits a single tool call's arguments across many chunks with
    /// no explicit "done" marker, so end-of-stream is the only reliable
    /// completion signal for `ToolCallEnd`.
    fn finish(self) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .tool_calls
            .into_iter()
            .map(|(index, call)| StreamEvent::ToolCallEnd {
                index,
                call: ToolCall {
                    id: call.id,
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name,
                        arguments: call.arguments,
                    },
                },
            })
            .collect();

        events.push(StreamEvent::Finish {
            reason: self.finish_reason.unwrap_or(if self.has_tool_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }),
            usage: self.usage,
        });
        events
    }
}
