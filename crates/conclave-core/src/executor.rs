//! Agent Turn Executor (§4.H): one invocation drives the chat driver across
//! as many hops as the tool budget allows, feeding output through the
//! streaming noise filter and the Tag Router, and updating memory/guard as
//! it goes.

use conclave_llm::request::request;
use conclave_llm::stream::StreamEvent;
use conclave_llm::{ChatMessage, FunctionCall, ToolCall, ToolChoice};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::Agent;
use crate::inbox::Inbox;
use crate::noise::NoiseFilter;
use crate::router::{Effect, apply_side_effects, route_with_tags};
use crate::tool::ToolExecutor;

/// Cooperative-yield cadence for the SSE consumption loop (§5).
const YIELD_EVERY: u32 = 32;

/// Result of one `run_turn` call. `effects` are applied by the scheduler,
/// which is the sole consumer of inboxes and owner of `respondingHint` /
/// `lastUserDMTarget` / `mutedUntil` (§5).
pub struct TurnOutcome {
    pub yield_for_user: bool,
    pub effects: Vec<Effect>,
}

/// Run one turn for `agent` to completion (§4.H steps 1-4).
pub async fn run_turn(
    agent: &Agent,
    inbox: &Inbox,
    agent_ids: &[String],
    max_tools: u32,
    tool_executor: &ToolExecutor,
    cancel: &CancellationToken,
) -> TurnOutcome {
    {
        let mut guard = agent.guard.lock();
        guard.begin_turn(max_tools);
    }

    for msg in inbox.next_prompt_for(&agent.id) {
        let content = match &msg.from {
            Some(from) if from != &agent.id => format!("{from}: {}", msg.content),
            _ => msg.content.clone(),
        };
        agent
            .memory
            .add(ChatMessage::user_from(msg.from.clone(), content))
            .await;
    }

    let mut tools_used = 0u32;
    let mut any_tool_calls = false;
    let mut yield_for_user = false;
    let mut effects = Vec::new();

    // Hop budget doubles as a defensive upper bound on loop iterations: the
    // tool-count cap and the guard's own end-turn decisions are the real
    // stopping conditions, this just prevents a runaway loop if a driver
    // bug keeps returning tool calls the executor never dispatches.
    let max_hops = max_tools.saturating_mul(2).saturating_add(4);

    for hop in 0..max_hops {
        if cancel.is_cancelled() {
            break;
        }
        if tools_used >= max_tools {
            break;
        }

        let (text, tool_calls, stream_failed) = drive_one_hop(agent, cancel).await;

        if tool_calls.is_empty() && text.trim().is_empty() {
            if stream_failed {
                warn!(agent = %agent.id, "chat driver returned no content; ending turn");
            }
            break;
        }

        if !tool_calls.is_empty() {
            any_tool_calls = true;
            agent
                .memory
                .add(ChatMessage::assistant_with_tool_calls(
                    text.clone(),
                    tool_calls.clone(),
                ))
                .await;

            let mut guard = agent.guard.lock();
            let outcome = tool_executor
                .execute(
                    &tool_calls,
                    max_tools,
                    tools_used,
                    cancel,
                    &mut guard,
                    &agent.memory,
                )
                .await;
            drop(guard);
            tools_used = outcome.tools_used;
            if outcome.force_end_turn || tools_used >= max_tools {
                break;
            }
            continue;
        }

        match sanitize_and_repair(&text, hop, &agent.id) {
            SanitizedReply::CoercedToolCall(call) => {
                any_tool_calls = true;
                agent
                    .memory
                    .add(ChatMessage::assistant_with_tool_calls(
                        String::new(),
                        vec![call.clone()],
                    ))
                    .await;
                let mut guard = agent.guard.lock();
                let outcome = tool_executor
                    .execute(
                        std::slice::from_ref(&call),
                        max_tools,
                        tools_used,
                        cancel,
                        &mut guard,
                        &agent.memory,
                    )
                    .await;
                drop(guard);
                tools_used = outcome.tools_used;
                if outcome.force_end_turn || tools_used >= max_tools {
                    break;
                }
                continue;
            }
            SanitizedReply::Plain(clean_text) => {
                agent.memory.add(ChatMessage::assistant(clean_text.clone())).await;
                let route = route_with_tags(&clean_text, agent_ids);
                let mut guard = agent.guard.lock();
                let routed = apply_side_effects(&route.deliveries, &agent.id, agent_ids, &mut guard);
                drop(guard);
                effects.extend(routed.effects);
                yield_for_user = routed.yield_for_user;
                break;
            }
        }
    }

    agent.memory.maybe_distill_persona(&agent.memory.messages()).await;

    {
        let mut guard = agent.guard.lock();
        guard.note_assistant_turn(any_tool_calls);
    }

    TurnOutcome {
        yield_for_user,
        effects,
    }
}

/// Drive one chat-completion call to completion, returning the cleaned text
/// and any tool calls. `stream_failed` is set if the stream ended with an
/// error or produced nothing usable.
async fn drive_one_hop(agent: &Agent, cancel: &CancellationToken) -> (String, Vec<ToolCall>, bool) {
    let mut builder = request();
    builder
        .messages(agent.memory.messages())
        .tools(agent.driver_config.tools.clone());
    if !agent.driver_config.tools.is_empty() {
        builder.tool_choice(ToolChoice::Auto);
    }
    let req = builder.build();

    let response = agent.driver_config.driver.generate(req, cancel.clone());
    let mut stream = response.events();

    let mut filter = NoiseFilter::new();
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut event_count: u32 = 0;
    let mut stream_failed = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => {
                match next {
                    None => break,
                    Some(Err(e)) => {
                        warn!(agent = %agent.id, error = %e, "chat driver stream error");
                        stream_failed = true;
                        break;
                    }
                    Some(Ok(event)) => {
                        event_count += 1;
                        if event_count % YIELD_EVERY == 0 {
                            tokio::task::yield_now().await;
                        }
                        match event {
                            StreamEvent::TextDelta(delta) => {
                                text.push_str(&filter.feed(&delta));
                            }
                            StreamEvent::ToolCallEnd { call, .. } => {
                                tool_calls.push(call);
                            }
                            StreamEvent::Error(msg) => {
                                warn!(agent = %agent.id, error = %msg, "chat driver reported an error event");
                                stream_failed = true;
                            }
                            StreamEvent::Finish { .. } => {}
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    text.push_str(&filter.flush());

    (text, tool_calls, stream_failed)
}

enum SanitizedReply {
    Plain(String),
    CoercedToolCall(ToolCall),
}

/// `sanitizeAndRepairAssistantReply` (§4.H): a model that emits a stray JSON
/// object (instead of calling the `sh` tool properly) gets coerced into a
/// single synthetic `sh` call rather than routed as prose.
fn sanitize_and_repair(text: &str, hop: u32, agent_id: &str) -> SanitizedReply {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let cmd = value
                .get("cmd")
                .or_else(|| value.get("command"))
                .and_then(|v| v.as_str());
            if let Some(cmd) = cmd {
                return SanitizedReply::CoercedToolCall(ToolCall {
                    id: format!("coerced-sh-{agent_id}-{hop}"),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: "sh".to_string(),
                        arguments: serde_json::json!({ "cmd": cmd }).to_string(),
                    },
                });
            }
        }
    }
    SanitizedReply::Plain(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DriverConfig;
    use crate::config::{GuardConfig, MemoryConfig};
    use crate::guard::GuardRail;
    use crate::memory::Memory;
    use crate::sandbox::{ShellResult, ShellSandbox};
    use conclave_llm::request::GenerateRequest;
    use conclave_llm::response::Response;
    use conclave_llm::stream::{FinishReason, Usage};
    use conclave_llm::{ChatDriver, ChatDriverBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedDriver {
        replies: Vec<&'static str>,
        call_count: AtomicUsize,
    }

    impl ChatDriverBackend for ScriptedDriver {
        fn model_id(&self) -> &str {
            "scripted"
        }
        fn provider(&self) -> &str {
            "test"
        }
        fn generate(&self, _request: GenerateRequest, _cancel: CancellationToken) -> Response {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.get(idx).copied().unwrap_or("");
            let events = vec![
                Ok(StreamEvent::TextDelta(reply.to_string())),
                Ok(StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Some(Usage::default()),
                }),
            ];
            Response::new(tokio_stream::iter(events))
        }
    }

    struct FakeSandbox;

    #[async_trait::async_trait]
    impl ShellSandbox for FakeSandbox {
        async fn exec(&self, cmd: &str) -> ShellResult {
            ShellResult {
                ok: true,
                exit_code: 0,
                stdout: format!("ran: {cmd}"),
                stderr: String::new(),
            }
        }
    }

    fn agent_with(reply: &'static str) -> Agent {
        let driver = ChatDriver::new(ScriptedDriver {
            replies: vec![reply],
            call_count: AtomicUsize::new(0),
        });
        let memory = Memory::new("alice", "BASE", MemoryConfig::default().validated());
        let guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        Agent::new(
            "alice",
            memory,
            guard,
            DriverConfig {
                driver: Arc::new(driver),
                tools: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn s4_plain_reply_yields_for_user_on_user_tag() {
        let agent = agent_with("@@user pong");
        let inbox = Inbox::new();
        inbox.push("alice", ChatMessage::user("start"));
        let executor = ToolExecutor::new(FakeSandbox);
        let cancel = CancellationToken::new();

        let outcome = run_turn(
            &agent,
            &inbox,
            &["alice".to_string(), "bob".to_string()],
            12,
            &executor,
            &cancel,
        )
        .await;

        assert!(outcome.yield_for_user);
        assert!(!outcome.effects.iter().any(|e| matches!(e, Effect::Enqueue { .. })));
    }

    #[tokio::test]
    async fn dm_reply_produces_enqueue_effect() {
        let agent = agent_with("@@bob ping");
        let inbox = Inbox::new();
        inbox.push("alice", ChatMessage::user("start"));
        let executor = ToolExecutor::new(FakeSandbox);
        let cancel = CancellationToken::new();

        let outcome = run_turn(
            &agent,
            &inbox,
            &["alice".to_string(), "bob".to_string()],
            12,
            &executor,
            &cancel,
        )
        .await;

        assert!(!outcome.yield_for_user);
        let enqueued = outcome
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Enqueue { target, .. } if target == "bob"));
        assert!(enqueued);
    }

    #[tokio::test]
    async fn stray_json_is_coerced_into_sh_tool_call() {
        let agent = agent_with(r#"{"cmd":"ls -la"}"#);
        let inbox = Inbox::new();
        let executor = ToolExecutor::new(FakeSandbox);
        let cancel = CancellationToken::new();

        let _ = run_turn(&agent, &inbox, &["alice".to_string()], 12, &executor, &cancel).await;

        let messages = agent.memory.messages();
        assert!(messages.iter().any(|m| m.content.contains("ran: ls -la")));
    }
}
