//! Tool Executor (§4.G): resolves and dispatches tool calls returned by a
//! turn's chat-driver call, guard-checked and budget-accounted. The only
//! built-in is `sh` (alias `exec`); anything else is an unknown-tool error.

use conclave_llm::{ChatMessage, ToolCall};
use serde::Deserialize;
use serde_json::json;

use crate::guard::GuardRail;
use crate::memory::Memory;
use crate::sandbox::ShellSandbox;

/// §6 bit-exact wire shape for tool output returned to the model.
#[derive(Debug, Clone, serde::Serialize)]
struct ShOutput {
    ok: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
    cmd: String,
}

#[derive(Debug, Deserialize)]
struct ShArgs {
    #[serde(default, alias = "command")]
    cmd: Option<String>,
}

/// Outcome of one Tool Executor invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOutcome {
    pub tools_used: u32,
    pub force_end_turn: bool,
}

/// Dispatches tool calls to their backing implementation. Holds the shell
/// sandbox collaborator (§6) the `sh` built-in delegates to.
pub struct ToolExecutor {
    sandbox: Box<dyn ShellSandbox>,
}

impl ToolExecutor {
    pub fn new(sandbox: impl ShellSandbox + 'static) -> Self {
        Self {
            sandbox: Box::new(sandbox),
        }
    }

    /// Run `calls` in order, respecting `max_tools` and an external abort
    /// signal, appending tool-result messages to `memory` as it goes.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        max_tools: u32,
        mut tools_used: u32,
        abort: &tokio_util::sync::CancellationToken,
        guard: &mut GuardRail,
        memory: &Memory,
    ) -> ExecuteOutcome {
        let mut force_end_turn = false;

        for call in calls {
            if abort.is_cancelled() {
                break;
            }
            if tools_used >= max_tools || force_end_turn {
                break;
            }

            match call.function.name.as_str() {
                "sh" | "exec" => {
                    let cmd = parse_sh_command(&call.function.arguments);
                    match cmd {
                        Some(cmd) if !cmd.trim().is_empty() => {
                            let result = self.sandbox.exec(&cmd).await;
                            let res_sig = format!(
                                "{}|{}",
                                result.exit_code,
                                head(&result.stdout, 240)
                            );
                            let decision = guard.note_tool_call(
                                "sh",
                                &cmd,
                                &res_sig,
                                result.exit_code,
                            );

                            let wire = ShOutput {
                                ok: result.ok,
                                stdout: result.stdout,
                                stderr: result.stderr,
                                exit_code: result.exit_code,
                                cmd: cmd.clone(),
                            };
                            memory
                                .add(ChatMessage::tool_result(
                                    call.id.clone(),
                                    "sh",
                                    serde_json::to_string(&wire).expect("ShOutput serialises"),
                                ))
                                .await;

                            if let Some(nudge) = &decision.nudge {
                                memory.add(ChatMessage::system(nudge.clone())).await;
                            }
                            if decision.end_turn {
                                force_end_turn = true;
                            }
                        }
                        _ => {
                            let decision = guard.note_bad_tool_call("sh", &["cmd"]);
                            if let Some(nudge) = &decision.nudge {
                                memory.add(ChatMessage::system(nudge.clone())).await;
                            }
                            if decision.end_turn {
                                force_end_turn = true;
                            } else {
                                let wire = ShOutput {
                                    ok: false,
                                    stdout: String::new(),
                                    stderr: "Execution failed: Command required.".to_string(),
                                    exit_code: 1,
                                    cmd: String::new(),
                                };
                                memory
                                    .add(ChatMessage::tool_result(
                                        call.id.clone(),
                                        "sh",
                                        serde_json::to_string(&wire).expect("ShOutput serialises"),
                                    ))
                                    .await;
                            }
                        }
                    }
                }
                other => {
                    let error = json!({
                        "ok": false,
                        "exit_code": 2,
                        "stderr": format!("unknown tool: {other}"),
                    });
                    memory
                        .add(ChatMessage::tool_result(
                            call.id.clone(),
                            other.to_string(),
                            error.to_string(),
                        ))
                        .await;
                }
            }

            tools_used += 1;
        }

        ExecuteOutcome {
            tools_used,
            force_end_turn,
        }
    }
}

fn parse_sh_command(arguments: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<ShArgs>(arguments) {
        if let Some(cmd) = parsed.cmd {
            return Some(cmd);
        }
    }
    // Best-effort: a bare JSON string or raw text argument.
    if let Ok(serde_json::Value::String(s)) = serde_json::from_str(arguments) {
        return Some(s);
    }
    None
}

fn head(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardConfig, MemoryConfig};
    use conclave_llm::FunctionCall;

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    struct FakeSandbox;

    #[async_trait::async_trait]
    impl ShellSandbox for FakeSandbox {
        async fn exec(&self, cmd: &str) -> crate::sandbox::ShellResult {
            crate::sandbox::ShellResult {
                ok: true,
                exit_code: 0,
                stdout: format!("ran: {cmd}"),
                stderr: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn dispatches_sh_and_records_wire_format() {
        let executor = ToolExecutor::new(FakeSandbox);
        let memory = Memory::new("a", "BASE", MemoryConfig::default().validated());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        guard.begin_turn(12);

        let calls = vec![call("1", "sh", r#"{"cmd":"ls"}"#)];
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = executor
            .execute(&calls, 12, 0, &token, &mut guard, &memory)
            .await;

        assert_eq!(outcome.tools_used, 1);
        assert!(!outcome.force_end_turn);
        let messages = memory.messages();
        let tool_msg = messages.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("1"));
        assert!(tool_msg.content.contains("ran: ls"));
    }

    #[tokio::test]
    async fn missing_command_is_a_bad_tool_call() {
        let executor = ToolExecutor::new(FakeSandbox);
        let memory = Memory::new("a", "BASE", MemoryConfig::default().validated());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        guard.begin_turn(12);

        let calls = vec![call("1", "sh", r#"{}"#)];
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = executor
            .execute(&calls, 12, 0, &token, &mut guard, &memory)
            .await;

        assert_eq!(outcome.tools_used, 1);
        assert!(!outcome.force_end_turn);
        let messages = memory.messages();
        assert!(messages.last().unwrap().content.contains("Command required"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_json_error() {
        let executor = ToolExecutor::new(FakeSandbox);
        let memory = Memory::new("a", "BASE", MemoryConfig::default().validated());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        guard.begin_turn(12);

        let calls = vec![call("1", "frobnicate", r#"{}"#)];
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = executor
            .execute(&calls, 12, 0, &token, &mut guard, &memory)
            .await;

        assert_eq!(outcome.tools_used, 1);
        let messages = memory.messages();
        assert!(messages.last().unwrap().content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn s6_repeat_tool_call_ends_turn_via_executor() {
        let executor = ToolExecutor::new(FakeSandbox);
        let memory = Memory::new("a", "BASE", MemoryConfig::default().validated());
        let mut guard = GuardRail::new(GuardConfig::from_max_tool_hops(6));
        guard.begin_turn(6);

        let calls = vec![
            call("1", "sh", r#"{"cmd":"ls"}"#),
            call("2", "sh", r#"{"cmd":"ls"}"#),
            call("3", "sh", r#"{"cmd":"ls"}"#),
        ];
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = executor
            .execute(&calls, 12, 0, &token, &mut guard, &memory)
            .await;

        // repeat_tool_sig_end_turn_limit for hop budget 6 is clamp(6/3,2,4)=2
        assert!(outcome.force_end_turn);
        assert_eq!(outcome.tools_used, 2);
    }
}
