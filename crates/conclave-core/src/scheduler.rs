//! Scheduler (§4.I): the finite-state main loop that decides which agent
//! runs next, enforces per-turn budgets, and mediates human interjection.
//!
//! State machine `{Init, Idle, SelectAgent, RunAgent, Stopped}`. The
//! scheduler owns `mutedUntil`, `lastUserDmTarget`, `respondingHint`, and
//! the interjection slot exclusively (§5) — no other component ever
//! touches them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conclave_llm::ChatMessage;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::config::SchedulerConfig;
use crate::executor::run_turn;
use crate::filewriter::FileWriter;
use crate::inbox::Inbox;
use crate::router::Effect;
use crate::tag::{TagConfig, TagKind, parse_tags};
use crate::tool::ToolExecutor;

/// Bridge to whatever is reading/writing the human side of the
/// conversation (§6: `readUserLine`/`onAskUser`). The CLI binary supplies
/// the real stdin/stdout implementation; tests supply a scripted one.
#[async_trait::async_trait]
pub trait UserBridge: Send + Sync {
    /// Read one interjection line, or `None` if the input stream closed.
    async fn read_line(&self) -> Option<String>;
    /// Surface a prompt to the user (guard idle nudge, mute ask_user, …).
    async fn ask(&self, prompt: &str);
}

/// A `UserBridge` that never produces interjections and drops asks. Used
/// when no terminal is attached (e.g. a scripted kickoff run).
pub struct NullUserBridge;

#[async_trait::async_trait]
impl UserBridge for NullUserBridge {
    async fn read_line(&self) -> Option<String> {
        None
    }
    async fn ask(&self, _prompt: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Idle,
    SelectAgent,
    Stopped,
}

/// The scheduler's main loop. Holds the agent roster and every piece of
/// cross-agent bookkeeping the spec reserves to it exclusively.
pub struct Scheduler {
    agents: HashMap<String, Arc<Agent>>,
    order: Vec<String>,
    inbox: Arc<Inbox>,
    tool_executor: Arc<ToolExecutor>,
    file_writer: Arc<dyn FileWriter>,
    config: SchedulerConfig,
    user_bridge: Arc<dyn UserBridge>,
    cancel: CancellationToken,

    muted_until: Mutex<HashMap<String, Instant>>,
    responding_hint: Mutex<Option<String>>,
    last_user_dm_target: Mutex<Option<String>>,
    interjection: Mutex<Option<String>>,
    idle_ticks: Mutex<u32>,
    draining: Mutex<bool>,
}

impl Scheduler {
    pub fn new(
        agents: Vec<Arc<Agent>>,
        inbox: Arc<Inbox>,
        tool_executor: Arc<ToolExecutor>,
        file_writer: Arc<dyn FileWriter>,
        config: SchedulerConfig,
        user_bridge: Arc<dyn UserBridge>,
        cancel: CancellationToken,
    ) -> Self {
        let order = agents.iter().map(|a| a.id.clone()).collect();
        let agents = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            agents,
            order,
            inbox,
            tool_executor,
            file_writer,
            config,
            user_bridge,
            cancel,
            muted_until: Mutex::new(HashMap::new()),
            responding_hint: Mutex::new(None),
            last_user_dm_target: Mutex::new(None),
            interjection: Mutex::new(None),
            idle_ticks: Mutex::new(0),
            draining: Mutex::new(false),
        }
    }

    fn agent_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// One-shot interjection slot (§4.I): the next Idle pass consumes it.
    pub fn interject(&self, text: impl Into<String>) {
        *self.interjection.lock() = Some(text.into());
    }

    /// Cooperative stop: cancels the in-flight driver call (if any), lets
    /// the current agent turn drop at its next await, and exits without
    /// flushing pending inboxes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Refuse new interjections, wait for the active turn to finish (the
    /// main loop checks this flag between turns, never mid-turn), then
    /// save every agent and stop.
    pub async fn drain(&self) {
        *self.draining.lock() = true;
    }

    /// Seed the kickoff prompt as if the user had sent it as the first
    /// interjection.
    pub fn kickoff(&self, prompt: impl Into<String>) {
        self.interject(prompt);
    }

    /// Run the scheduler to completion (Stopped state or cancellation).
    pub async fn run(&self) {
        let mut state = State::Init;
        loop {
            state = match state {
                State::Init => State::Idle,
                State::Idle => self.tick_idle().await,
                State::SelectAgent => self.tick_select_agent().await,
                State::Stopped => break,
            };
            if self.cancel.is_cancelled() {
                break;
            }
        }
        self.save_all().await;
        info!("scheduler stopped");
    }

    async fn tick_idle(&self) -> State {
        if *self.draining.lock() && !self.inbox.has_any_work() {
            return State::Stopped;
        }

        if let Some(text) = self.interjection.lock().take() {
            self.route_interjection(&text);
            return State::Idle;
        }

        if self.ready_agent_ids().into_iter().any(|id| self.inbox.has_work(&id)) {
            return State::SelectAgent;
        }

        let mut ticks = self.idle_ticks.lock();
        *ticks += 1;
        let tick = *ticks;
        drop(ticks);

        if self.inbox.has_any_work() {
            return State::Idle;
        }

        if self.config.prompt_enabled && tick % self.config.idle_prompt_every == 0 {
            for (id, agent) in &self.agents {
                let guard = agent.guard.lock();
                if let Some(prompt) = guard.on_idle(tick, true) {
                    drop(guard);
                    *self.last_user_dm_target.lock() = Some(id.clone());
                    self.user_bridge.ask(&prompt).await;
                    if let Some(line) = self.user_bridge.read_line().await {
                        self.interject(line);
                    }
                    return State::Idle;
                }
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(self.config.idle_sleep_ms)) => {}
        }
        State::Idle
    }

    /// Agents not currently muted.
    fn ready_agent_ids(&self) -> Vec<String> {
        let now = Instant::now();
        let muted = self.muted_until.lock();
        self.order
            .iter()
            .filter(|id| muted.get(*id).map(|until| *until <= now).unwrap_or(true))
            .cloned()
            .collect()
    }

    async fn tick_select_agent(&self) -> State {
        let mut candidates: Vec<String> = self
            .ready_agent_ids()
            .into_iter()
            .filter(|id| self.inbox.has_work(id))
            .collect();

        if candidates.is_empty() {
            return State::Idle;
        }

        if !self.config.round_robin {
            candidates.shuffle(&mut rand::rng());
        }

        let hint = self.responding_hint.lock().clone();
        let chosen = hint
            .filter(|h| candidates.contains(h))
            .unwrap_or_else(|| candidates[0].clone());

        self.run_agent(&chosen).await;
        State::Idle
    }

    async fn run_agent(&self, id: &str) {
        let Some(agent) = self.agents.get(id).cloned() else {
            warn!(agent = id, "select-agent chose an unknown id");
            return;
        };
        debug!(agent = %id, "running agent turn");

        let outcome = run_turn(
            &agent,
            &self.inbox,
            &self.agent_ids(),
            self.config.max_tools,
            &self.tool_executor,
            &self.cancel,
        )
        .await;

        for effect in outcome.effects {
            self.apply_effect(effect).await;
        }

        if outcome.yield_for_user {
            if let Some(hint) = self.responding_hint.lock().as_ref() {
                if hint == id {
                    *self.responding_hint.lock() = None;
                }
            }
        }
    }

    async fn apply_effect(&self, effect: Effect) {
        match effect {
            Effect::Enqueue { target, message } => {
                self.inbox.push(&target, message);
            }
            Effect::SetRespondingHint(hint) => {
                *self.responding_hint.lock() = hint;
            }
            Effect::SetLastUserDmTarget(target) => {
                *self.last_user_dm_target.lock() = Some(target);
            }
            Effect::WriteFile { from, path, content } => match self.file_writer.write(&path, &content).await {
                Ok(outcome) => debug!(from = %from, path = %outcome.path, bytes = outcome.bytes, "wrote file delivery"),
                Err(e) => warn!(from = %from, path = %path, error = %e, "file delivery write failed"),
            },
            Effect::ApplyGuardDecision { agent, decision } => {
                self.apply_guard_decision(&agent, decision).await;
            }
        }
    }

    /// `applyGuardDecision` (§4.I): appends the nudge to the agent's inbox,
    /// mutes on `mute_ms`, and optionally performs a user read.
    async fn apply_guard_decision(&self, agent: &str, decision: crate::guard::GuardDecision) {
        if let Some(nudge) = &decision.nudge {
            self.inbox.push(agent, ChatMessage::system(nudge.clone()));
        }
        if let Some(mute_ms) = decision.mute_ms {
            let until = Instant::now() + Duration::from_millis(mute_ms.max(250));
            self.muted_until.lock().insert(agent.to_string(), until);
        }
        if let Some(prompt) = &decision.ask_user {
            if self.config.prompt_enabled {
                *self.last_user_dm_target.lock() = Some(agent.to_string());
                self.user_bridge.ask(prompt).await;
                if let Some(line) = self.user_bridge.read_line().await {
                    self.interject(line);
                }
            }
        }
    }

    /// Route a pending interjection (§4.I Idle bullet 1).
    fn route_interjection(&self, text: &str) {
        let agent_ids = self.agent_ids();
        let config = TagConfig::with_agent_tokens(agent_ids.iter().cloned());
        let parsed = parse_tags(text, &config);

        let explicit_targets: Vec<String> = parsed
            .iter()
            .filter(|p| p.kind == TagKind::Agent)
            .filter_map(|p| agent_ids.iter().find(|id| id.eq_ignore_ascii_case(&p.tag)).cloned())
            .collect();

        if !explicit_targets.is_empty() {
            for target in &explicit_targets {
                self.inbox.push(target, ChatMessage::user_from(None::<String>, text.to_string()));
            }
            *self.responding_hint.lock() = explicit_targets.into_iter().next();
            return;
        }

        let default_target = self
            .last_user_dm_target
            .lock()
            .clone()
            .or_else(|| self.responding_hint.lock().clone());

        match default_target {
            Some(target) if agent_ids.contains(&target) => {
                self.inbox.push(&target, ChatMessage::user_from(None::<String>, text.to_string()));
                *self.responding_hint.lock() = Some(target);
            }
            _ => {
                for id in &agent_ids {
                    self.inbox.push(id, ChatMessage::user_from(None::<String>, text.to_string()));
                }
            }
        }
    }

    async fn save_all(&self) {
        for agent in self.agents.values() {
            if let Err(e) = agent.memory.save().await {
                warn!(agent = %agent.id, error = %e, "failed to save agent memory on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DriverConfig;
    use crate::config::{GuardConfig, MemoryConfig};
    use crate::guard::GuardRail;
    use crate::memory::Memory;
    use crate::filewriter::PlainFileWriter;
    use crate::sandbox::{ShellResult, ShellSandbox};
    use conclave_llm::request::GenerateRequest;
    use conclave_llm::response::Response;
    use conclave_llm::stream::{FinishReason, StreamEvent, Usage};
    use conclave_llm::{ChatDriver, ChatDriverBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

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
            let reply = self.replies.get(idx).copied().unwrap_or("@@user done");
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

    fn agent(id: &str, reply: &'static str) -> Arc<Agent> {
        let driver = ChatDriver::new(ScriptedDriver {
            replies: vec![reply],
            call_count: AtomicUsize::new(0),
        });
        let memory = Memory::new(id, "BASE", MemoryConfig::default().validated());
        let guard = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        Arc::new(Agent::new(
            id,
            memory,
            guard,
            DriverConfig {
                driver: Arc::new(driver),
                tools: Vec::new(),
            },
        ))
    }

    #[tokio::test]
    async fn s5_round_robin_visits_every_agent_with_work() {
        let a = agent("alice", "@@user a done");
        let b = agent("bob", "@@user b done");
        let inbox = Arc::new(Inbox::new());
        inbox.push("alice", ChatMessage::user("go"));
        inbox.push("bob", ChatMessage::user("go"));

        let scheduler = Scheduler::new(
            vec![a, b],
            inbox.clone(),
            Arc::new(ToolExecutor::new(FakeSandbox)),
            Arc::new(PlainFileWriter),
            SchedulerConfig {
                round_robin: true,
                idle_sleep_ms: 10,
                ..SchedulerConfig::default()
            },
            Arc::new(NullUserBridge),
            CancellationToken::new(),
        );

        scheduler.tick_select_agent().await;
        scheduler.tick_select_agent().await;

        assert!(!inbox.has_work("alice"));
        assert!(!inbox.has_work("bob"));
    }

    #[tokio::test]
    async fn s4_interjection_with_explicit_tag_enqueues_only_target() {
        let a = agent("alice", "@@user ok");
        let b = agent("bob", "@@user ok");
        let inbox = Arc::new(Inbox::new());

        let scheduler = Scheduler::new(
            vec![a, b],
            inbox.clone(),
            Arc::new(ToolExecutor::new(FakeSandbox)),
            Arc::new(PlainFileWriter),
            SchedulerConfig::default(),
            Arc::new(NullUserBridge),
            CancellationToken::new(),
        );

        scheduler.route_interjection("@@bob please help");
        assert!(!inbox.has_work("alice"));
        assert!(inbox.has_work("bob"));
    }

    #[tokio::test]
    async fn interjection_without_tag_broadcasts_when_no_default_target() {
        let a = agent("alice", "@@user ok");
        let b = agent("bob", "@@user ok");
        let inbox = Arc::new(Inbox::new());

        let scheduler = Scheduler::new(
            vec![a, b],
            inbox.clone(),
            Arc::new(ToolExecutor::new(FakeSandbox)),
            Arc::new(PlainFileWriter),
            SchedulerConfig::default(),
            Arc::new(NullUserBridge),
            CancellationToken::new(),
        );

        scheduler.route_interjection("hello everyone");
        assert!(inbox.has_work("alice"));
        assert!(inbox.has_work("bob"));
    }

    #[tokio::test]
    async fn mute_decision_blocks_agent_from_selection() {
        let a = agent("alice", "@@user ok");
        let inbox = Arc::new(Inbox::new());
        inbox.push("alice", ChatMessage::user("go"));

        let scheduler = Scheduler::new(
            vec![a],
            inbox.clone(),
            Arc::new(ToolExecutor::new(FakeSandbox)),
            Arc::new(PlainFileWriter),
            SchedulerConfig::default(),
            Arc::new(NullUserBridge),
            CancellationToken::new(),
        );

        scheduler
            .apply_guard_decision(
                "alice",
                crate::guard::GuardDecision {
                    mute_ms: Some(5_000),
                    ..Default::default()
                },
            )
            .await;

        assert!(scheduler.ready_agent_ids().is_empty());
    }
}
