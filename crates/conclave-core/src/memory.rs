//! Memory (§4.F): a lane-partitioned, budget-bounded, progressively
//! summarised transcript maintained as a head system message plus a
//! chronological tail.
//!
//! §4.F.1 (expansion) collapses the five historical memory classes
//! (`AdvancedMemory`, `DynamicAdvancedMemory`, `NormativeMemory`,
//! `ScrubbedAdvancedMemory`, `SummaryMemory`) into this one struct,
//! parameterised by [`MemoryConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conclave_llm::request::request;
use conclave_llm::{ChatDriver, ChatMessage, Role};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::{MemoryConfig, PersonaMode};
use crate::error::{ConclaveError, Result};

pub const NORMATIVE_BLOCK: (&str, &str) = ("<!--NORMATIVE_POLICY_BEGIN-->", "<!--NORMATIVE_POLICY_END-->");
pub const SYSTEM_SUMMARY_BLOCK: (&str, &str) = ("<!--SYSTEM_LANE_SUMMARY_BEGIN-->", "<!--SYSTEM_LANE_SUMMARY_END-->");
pub const PERSONA_BLOCK: (&str, &str) = ("<!--DYNAMIC_PERSONA_BEGIN-->", "<!--DYNAMIC_PERSONA_END-->");

// ---------------------------------------------------------------------------
// Persona model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaFacet {
    pub text: String,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaModel {
    pub roles: Vec<PersonaFacet>,
    pub style: Vec<PersonaFacet>,
    pub heuristics: Vec<PersonaFacet>,
    pub goals: Vec<PersonaFacet>,
    pub antigoals: Vec<PersonaFacet>,
    pub languages: Vec<PersonaFacet>,
    pub version: u32,
    pub last_update_turn: u32,
}

impl PersonaModel {
    fn categories_mut(&mut self) -> [(&'static str, &mut Vec<PersonaFacet>); 6] {
        [
            ("roles", &mut self.roles),
            ("style", &mut self.style),
            ("heuristics", &mut self.heuristics),
            ("goals", &mut self.goals),
            ("antigoals", &mut self.antigoals),
            ("languages", &mut self.languages),
        ]
    }

    /// Merge a freshly-distilled facet set in with exponential decay of the
    /// existing weights, cap facets per category, and drop anything below
    /// `min_keep_weight`.
    fn merge(&mut self, fresh: PersonaModel, config: &MemoryConfig) {
        let decay = 1.0 - config.decay_per_pass;
        for (_, existing) in self.categories_mut() {
            for f in existing.iter_mut() {
                f.weight *= decay;
            }
        }

        let fresh_by_category = [
            fresh.roles,
            fresh.style,
            fresh.heuristics,
            fresh.goals,
            fresh.antigoals,
            fresh.languages,
        ];
        for (i, (_, existing)) in self.categories_mut().into_iter().enumerate() {
            for f in &fresh_by_category[i] {
                if let Some(matching) = existing.iter_mut().find(|e| e.text == f.text) {
                    matching.weight = matching.weight.max(f.weight);
                } else {
                    existing.push(f.clone());
                }
            }
            existing.retain(|f| f.weight >= config.min_keep_weight);
            existing.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap());
            existing.truncate(config.facet_capacity_per_category);
        }

        self.version += 1;
    }

    fn render_block(&self) -> String {
        let mut out = String::new();
        for (name, facets) in [
            ("roles", &self.roles),
            ("style", &self.style),
            ("heuristics", &self.heuristics),
            ("goals", &self.goals),
            ("antigoals", &self.antigoals),
            ("languages", &self.languages),
        ] {
            if facets.is_empty() {
                continue;
            }
            out.push_str(&format!("{name}:\n"));
            for f in facets {
                out.push_str(&format!("- ({:.2}) {}\n", f.weight, f.text));
            }
        }
        out.push_str(&format!("version: {}\n", self.version));
        out
    }
}

// ---------------------------------------------------------------------------
// Summarizer capability
// ---------------------------------------------------------------------------

/// The single capability Memory needs from the chat driver stack: turn a
/// lane's worth of messages into a short summary. Kept minimal so Memory
/// doesn't depend on conclave-llm-openai directly.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `text` under a token budget (§4.F step 4: "allocate a
    /// summary-token budget proportional to characters removed per lane").
    /// Implementations should treat `max_tokens` as a soft target for the
    /// model and a hard cap when truncating the result.
    async fn summarize(&self, lane: &str, text: &str, max_tokens: u32) -> String;

    /// Produce a strict-JSON persona update from a chronological window of
    /// transcript text. Returns `None` if distillation isn't supported.
    async fn distill_persona(&self, _window_text: &str) -> Option<PersonaModel> {
        None
    }
}

/// A summarizer that never shortens anything — used in tests and as a safe
/// fallback when no driver-backed summarizer is configured.
pub struct NullSummarizer;

#[async_trait::async_trait]
impl Summarizer for NullSummarizer {
    async fn summarize(&self, lane: &str, text: &str, max_tokens: u32) -> String {
        let cap_chars = (max_tokens as usize).saturating_mul(4).max(40);
        format!("[{lane} summary unavailable] {}", truncate(text, cap_chars))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max])
    }
}

static SECRET_KV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password|passwd|authorization)\b\s*[:=]\s*["']?([^\s"'&,}]{4,})"#)
        .unwrap()
});
static SECRET_BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._~+/=-]{8,}").unwrap());
static SECRET_SK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}").unwrap());

/// `ScrubbedAdvancedMemory` (§4.F.1 expansion): redact values that look like
/// API keys, bearer tokens, or `key=value`/`key: value` secrets before tool
/// output is committed to the transcript.
fn scrub_secrets(text: &str) -> String {
    // Bearer tokens first: `key=value` below would otherwise match
    // `Authorization: Bearer …` and swallow only the word `Bearer`,
    // leaving the actual token behind.
    let redacted = SECRET_BEARER.replace_all(text, "Bearer [REDACTED]");
    let redacted = SECRET_KV.replace_all(&redacted, "$1=[REDACTED]");
    let redacted = SECRET_SK.replace_all(&redacted, "[REDACTED]");
    redacted.into_owned()
}

/// Driver-backed summarizer: any [`ChatDriver`] (provider-agnostic) can
/// back Memory's summarization and persona-distillation passes. This is
/// what a CLI wires in place of [`NullSummarizer`] once a real model is
/// configured.
pub struct DriverSummarizer {
    driver: Arc<ChatDriver>,
}

impl DriverSummarizer {
    pub fn new(driver: Arc<ChatDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait::async_trait]
impl Summarizer for DriverSummarizer {
    async fn summarize(&self, lane: &str, text: &str, max_tokens: u32) -> String {
        let budget_words = (max_tokens * 3 / 4).max(16);
        let mut builder = request();
        builder
            .system(format!(
                "Summarize the following {lane} conversation lane in under {budget_words} words. \
                 Preserve concrete facts, decisions, and open questions; drop pleasantries."
            ))
            .user(text);
        let req = builder.build();

        let cap_chars = (max_tokens as usize).saturating_mul(4).max(40);
        match self.driver.generate(req, CancellationToken::new()).into_result().await {
            Ok(result) if !result.text.trim().is_empty() => truncate(result.text.trim(), cap_chars),
            _ => format!("[{lane} summary unavailable] {}", truncate(text, cap_chars)),
        }
    }

    async fn distill_persona(&self, window_text: &str) -> Option<PersonaModel> {
        let mut builder = request();
        builder
            .system(
                "Given this transcript window, emit a strict JSON object matching \
                 {roles,style,heuristics,goals,antigoals,languages: [{text,weight}], \
                 version,last_update_turn}. No prose, JSON only.",
            )
            .user(window_text);
        let req = builder.build();

        let result = self.driver.generate(req, CancellationToken::new()).into_result().await.ok()?;
        let trimmed = result.text.trim();
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        serde_json::from_str(&trimmed[start..=end]).ok()
    }
}

// ---------------------------------------------------------------------------
// Persistence snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Ledger {
    turns_since_reflect: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemorySnapshot {
    version: u32,
    persona: PersonaModel,
    ledger: Ledger,
    #[serde(rename = "messagesBuffer")]
    messages_buffer: Vec<ChatMessage>,
}

/// Sanitise an agent id for use in a filesystem path: keep
/// `[A-Za-z0-9._-]`, fall back to `"unknown"` if nothing survives.
pub fn sanitise_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() { "unknown".to_string() } else { cleaned }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

struct MemoryState {
    messages: Vec<ChatMessage>,
    persona: PersonaModel,
    ledger: Ledger,
}

pub struct Memory {
    id: String,
    config: MemoryConfig,
    base: String,
    state: Arc<Mutex<MemoryState>>,
    summarizing: Arc<AtomicBool>,
    rerun_requested: Arc<AtomicBool>,
    summarizer: Arc<dyn Summarizer>,
    dir: PathBuf,
}

impl Memory {
    /// Construct a fresh memory with the given immutable BASE policy text
    /// as the head system message.
    pub fn new(id: impl Into<String>, base: impl Into<String>, config: MemoryConfig) -> Self {
        Self::with_summarizer(id, base, config, Arc::new(NullSummarizer))
    }

    pub fn with_summarizer(
        id: impl Into<String>,
        base: impl Into<String>,
        config: MemoryConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let id = id.into();
        let base = base.into();
        let mut head = base.clone();
        if let Some(policy) = &config.normative_policy {
            head = upsert_block(&head, NORMATIVE_BLOCK, policy);
        }

        Self {
            id,
            dir: PathBuf::from(".orgmemories"),
            config,
            state: Arc::new(Mutex::new(MemoryState {
                messages: vec![ChatMessage::system(head)],
                persona: PersonaModel::default(),
                ledger: Ledger::default(),
            })),
            summarizing: Arc::new(AtomicBool::new(false)),
            rerun_requested: Arc::new(AtomicBool::new(false)),
            summarizer,
            base,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current message buffer, head first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    /// Append a message, then run `on_after_add` (possibly kicking off a
    /// background summarisation pass). Never blocks on that pass.
    ///
    /// `scrub_tool_output` (`ScrubbedAdvancedMemory`) redacts likely secrets
    /// out of tool-role content before it ever lands in the buffer.
    pub async fn add(&self, mut msg: ChatMessage) {
        if self.config.scrub_tool_output && msg.role == Role::Tool {
            msg.content = scrub_secrets(&msg.content);
        }
        {
            let mut state = self.state.lock();
            state.messages.push(msg);
        }
        self.on_after_add();
    }

    fn on_after_add(&self) {
        let estimate = {
            let state = self.state.lock();
            estimate_tokens(&state.messages, &self.config)
        };
        let budget = self.config.budget() as f32;
        if (estimate as f32) <= self.config.high_ratio * budget {
            return;
        }
        self.trigger_summarization();
    }

    fn trigger_summarization(&self) {
        if self.summarizing.swap(true, Ordering::SeqCst) {
            self.rerun_requested.store(true, Ordering::SeqCst);
            return;
        }

        let state = Arc::clone(&self.state);
        let summarizer = Arc::clone(&self.summarizer);
        let config = self.config.clone();
        let base = self.base.clone();
        let summarizing = Arc::clone(&self.summarizing);
        let rerun_requested = Arc::clone(&self.rerun_requested);

        tokio::spawn(async move {
            loop {
                run_summarization_pass(&state, summarizer.as_ref(), &config, &base).await;
                if !rerun_requested.swap(false, Ordering::SeqCst) {
                    break;
                }
            }
            summarizing.store(false, Ordering::SeqCst);
        });
    }

    /// Upsert a named tagged block into the head system message in place.
    pub fn upsert_head_block(&self, tags: (&str, &str), body: &str) {
        let mut state = self.state.lock();
        if let Some(head) = state.messages.first_mut() {
            head.content = upsert_block(&head.content, tags, body);
        }
    }

    /// Persist this agent's memory under `dir` (default `.orgmemories`).
    pub async fn save(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock();
            MemorySnapshot {
                version: state.persona.version,
                persona: state.persona.clone(),
                ledger: state.ledger.clone(),
                messages_buffer: state.messages.clone(),
            }
        };
        let path = self.path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConclaveError::MemorySave { path: path.clone(), source })?;
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&snapshot).expect("snapshot always serialises");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|source| ConclaveError::MemorySave { path: path.clone(), source })?;
        file.write_all(&json)
            .await
            .map_err(|source| ConclaveError::MemorySave { path: path.clone(), source })?;
        file.flush()
            .await
            .map_err(|source| ConclaveError::MemorySave { path: path.clone(), source })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| ConclaveError::MemorySave { path: path.clone(), source })?;
        Ok(())
    }

    /// Load a prior snapshot for `id`, falling back to default state if the
    /// file is absent or empty.
    pub async fn load(
        id: impl Into<String>,
        base: impl Into<String>,
        config: MemoryConfig,
        summarizer: Arc<dyn Summarizer>,
        dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let id = id.into();
        let path = dir.as_ref().join(format!("memory-{}.txt", sanitise_id(&id)));
        let mut memory = Self::with_summarizer(id, base, config, summarizer);
        memory.dir = dir.as_ref().to_path_buf();

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(memory),
            Err(source) => return Err(ConclaveError::MemoryLoad { path, source }),
        };
        if bytes.is_empty() {
            return Ok(memory);
        }
        let snapshot: MemorySnapshot = serde_json::from_slice(&bytes)
            .map_err(|source| ConclaveError::MemoryDecode { path, source })?;

        let mut state = memory.state.lock();
        state.persona = snapshot.persona;
        state.ledger = snapshot.ledger;
        if !snapshot.messages_buffer.is_empty() {
            state.messages = snapshot.messages_buffer;
        }
        drop(state);
        Ok(memory)
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("memory-{}.txt", sanitise_id(&self.id)))
    }

    /// §4.F persona distillation: called once per turn by the turn
    /// executor; no-ops unless `min_reflect_gap_turns` has elapsed.
    pub async fn maybe_distill_persona(&self, window: &[ChatMessage]) {
        if self.config.persona_mode == PersonaMode::Off {
            return;
        }
        let due = {
            let mut state = self.state.lock();
            state.ledger.turns_since_reflect += 1;
            state.ledger.turns_since_reflect >= self.config.min_reflect_gap_turns
        };
        if !due {
            return;
        }

        let window_text = window
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let Some(fresh) = self.summarizer.distill_persona(&window_text).await else {
            return;
        };

        let mut state = self.state.lock();
        state.ledger.turns_since_reflect = 0;
        state.persona.merge(fresh, &self.config);
        let rendered = state.persona.render_block();
        drop(state);

        if self.config.persona_mode == PersonaMode::Auto {
            self.upsert_head_block(PERSONA_BLOCK, &rendered);
        }
    }
}

/// §4.F `budget = contextTokens − reserveHeader − reserveResponse` paired
/// with `ceil(chars / avgCharsPerToken)` estimation, a 24 000-char cap on
/// tool outputs, and a small per-message overhead.
fn estimate_tokens(messages: &[ChatMessage], config: &MemoryConfig) -> u32 {
    const PER_MESSAGE_OVERHEAD_TOKENS: u32 = 4;
    messages
        .iter()
        .map(|m| {
            let cap = if m.role == Role::Tool {
                config.tool_output_estimate_cap_chars
            } else {
                usize::MAX
            };
            let chars = m.content.len().min(cap) as f32;
            (chars / config.avg_chars_per_token).ceil() as u32 + PER_MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

/// Idempotently replace the bytes between `tags.0` and `tags.1` in `head`
/// with `body`, or append a new block if the sentinels aren't present.
pub fn upsert_block(head: &str, tags: (&str, &str), body: &str) -> String {
    let (start_tag, end_tag) = tags;
    if let (Some(start), Some(end_rel)) = (head.find(start_tag), head.find(end_tag)) {
        let end = end_rel + end_tag.len();
        if end > start {
            let mut out = String::with_capacity(head.len() + body.len());
            out.push_str(&head[..start]);
            out.push_str(start_tag);
            out.push('\n');
            out.push_str(body.trim_end());
            out.push('\n');
            out.push_str(end_tag);
            out.push_str(&head[end..]);
            return out;
        }
    }
    format!("{head}\n{start_tag}\n{}\n{end_tag}\n", body.trim_end())
}

// ---------------------------------------------------------------------------
// Lane partitioning + summarisation pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Assistant,
    User,
    System,
    Tool,
    Other,
}

fn lane_of(msg: &ChatMessage) -> Lane {
    match msg.role {
        Role::Assistant => Lane::Assistant,
        Role::User => Lane::User,
        Role::System => Lane::System,
        Role::Tool => Lane::Tool,
    }
}

async fn run_summarization_pass(
    state: &Arc<Mutex<MemoryState>>,
    summarizer: &dyn Summarizer,
    config: &MemoryConfig,
    base: &str,
) {
    let (head, tail) = {
        let s = state.lock();
        let head = s.messages.first().cloned();
        let tail = s.messages.iter().skip(1).cloned().collect::<Vec<_>>();
        (head, tail)
    };
    let Some(head) = head else { return };

    let budget = config.budget() as f32;
    let full_estimate = estimate_tokens(&[head.clone()], config) + estimate_tokens(&tail, config);
    if (full_estimate as f32) <= config.high_ratio * budget {
        return; // another add() already brought us back under threshold
    }

    let mut by_lane: HashMap<Lane, Vec<(usize, ChatMessage)>> = HashMap::new();
    for (i, msg) in tail.iter().enumerate() {
        by_lane.entry(lane_of(msg)).or_default().push((i, msg.clone()));
    }

    let keep = |lane: Lane, msgs: &[(usize, ChatMessage)]| -> Vec<(usize, ChatMessage)> {
        if lane == Lane::System {
            return Vec::new(); // folded into head instead
        }
        let n = if lane == Lane::Tool { config.keep_recent_tools } else { config.keep_recent_per_lane };
        let start = msgs.len().saturating_sub(n);
        msgs[start..].to_vec()
    };

    let preserved_tail: Vec<ChatMessage> = {
        let mut all: Vec<(usize, ChatMessage)> = Vec::new();
        for (lane, msgs) in &by_lane {
            all.extend(keep(*lane, msgs));
        }
        all.sort_by_key(|(i, _)| *i);
        all.into_iter().map(|(_, m)| m).collect()
    };

    let preserved_estimate = estimate_tokens(&[head.clone()], config) + estimate_tokens(&preserved_tail, config);
    if (preserved_estimate as f32) <= config.low_ratio * budget {
        let mut s = state.lock();
        let mut rebuilt = vec![head];
        rebuilt.extend(preserved_tail);
        s.messages = rebuilt;
        return;
    }

    // §4.F step 4: allocate the summary-token budget (`summaryRatio · budget`)
    // proportionally to characters removed per lane — a lane that's shedding
    // more text gets more of the summary to spend on it.
    let chars_removed = |lane: Lane, msgs: &[(usize, ChatMessage)]| -> usize {
        let kept_chars: usize = keep(lane, msgs).iter().map(|(_, m)| m.content.len()).sum();
        let total_chars: usize = msgs.iter().map(|(_, m)| m.content.len()).sum();
        total_chars.saturating_sub(kept_chars)
    };
    let removed_per_lane: HashMap<Lane, usize> = by_lane
        .iter()
        .map(|(lane, msgs)| (*lane, chars_removed(*lane, msgs)))
        .collect();
    let total_removed_chars = removed_per_lane.values().sum::<usize>().max(1);
    let summary_token_budget = (config.summary_ratio * budget).round().max(1.0) as u32;
    let lane_token_budget = |lane: Lane| -> u32 {
        let removed = *removed_per_lane.get(&lane).unwrap_or(&0);
        let share = summary_token_budget as f32 * (removed as f32 / total_removed_chars as f32);
        (share.round() as u32).max(16)
    };

    // Summarise each non-empty, non-system lane; fold system into the head.
    let mut summary_messages: Vec<ChatMessage> = Vec::new();
    for lane in [Lane::Assistant, Lane::User, Lane::Tool, Lane::Other] {
        let Some(msgs) = by_lane.get(&lane) else { continue };
        if msgs.is_empty() {
            continue;
        }
        let joined = msgs.iter().map(|(_, m)| m.content.as_str()).collect::<Vec<_>>().join("\n");
        let lane_name = match lane {
            Lane::Assistant => "assistant",
            Lane::User => "user",
            Lane::Tool => "tool",
            Lane::Other => "other",
            Lane::System => unreachable!(),
        };
        let summary = summarizer.summarize(lane_name, &joined, lane_token_budget(lane)).await;
        let role_msg = match lane {
            Lane::Assistant => ChatMessage::assistant(format!("[prior conversation summary] {summary}")),
            Lane::User => ChatMessage::user(format!("[prior conversation summary] {summary}")),
            _ => ChatMessage::system(format!("[{lane_name} summary] {summary}")),
        };
        summary_messages.push(role_msg);
    }

    let mut new_head = base.to_string();
    if let Some(policy) = &config.normative_policy {
        new_head = upsert_block(&new_head, NORMATIVE_BLOCK, policy);
    }
    if let Some(system_msgs) = by_lane.get(&Lane::System) {
        if !system_msgs.is_empty() {
            let joined = system_msgs.iter().map(|(_, m)| m.content.as_str()).collect::<Vec<_>>().join("\n");
            let summary = summarizer
                .summarize("system", &joined, lane_token_budget(Lane::System))
                .await;
            new_head = upsert_block(&new_head, SYSTEM_SUMMARY_BLOCK, &summary);
        }
    }
    let mut new_head_msg = head;
    new_head_msg.content = new_head;

    let mut rebuilt = vec![new_head_msg];
    rebuilt.extend(summary_messages);
    rebuilt.extend(preserved_tail);

    // Drop oldest non-system messages after the summaries until under
    // budget, or until only the head and summaries remain.
    while (estimate_tokens(&rebuilt, config) as f32) > config.low_ratio * budget {
        let drop_at = rebuilt.iter().skip(1).position(|_| true);
        match drop_at {
            Some(_) if rebuilt.len() > 1 => {
                rebuilt.remove(1);
            }
            _ => break,
        }
    }

    let mut s = state.lock();
    s.messages = rebuilt;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig {
            context_tokens: 2_000,
            reserve_header: 0,
            reserve_response: 0,
            avg_chars_per_token: 4.0,
            keep_recent_per_lane: 2,
            keep_recent_tools: 2,
            ..Default::default()
        }
        .validated()
    }

    #[test]
    fn scrub_secrets_redacts_common_shapes() {
        let redacted = scrub_secrets(r#"api_key="sk-abcdef1234567890" Authorization: Bearer abcdef123456"#);
        assert!(!redacted.contains("sk-abcdef1234567890"));
        assert!(!redacted.contains("abcdef123456"));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn scrub_tool_output_config_redacts_on_add() {
        let mut cfg = config();
        cfg.scrub_tool_output = true;
        let mem = Memory::new("dana", "BASE", cfg);
        mem.add(ChatMessage::tool_result("1", "sh", "token=abcdef123456 ran ok"))
            .await;
        let messages = mem.messages();
        assert!(!messages.last().unwrap().content.contains("abcdef123456"));
    }

    #[tokio::test]
    async fn invariant_2_head_preserved_after_add() {
        let mem = Memory::new("alice", "BASE POLICY", config());
        mem.add(ChatMessage::user("hello")).await;
        mem.add(ChatMessage::assistant("hi there")).await;
        let messages = mem.messages();
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.starts_with("BASE POLICY"));
    }

    #[tokio::test]
    async fn invariant_4_block_upsert_is_idempotent() {
        let mem = Memory::new("bob", "BASE", config());
        mem.upsert_head_block(PERSONA_BLOCK, "same body");
        let first = mem.messages()[0].content.clone();
        mem.upsert_head_block(PERSONA_BLOCK, "same body");
        let second = mem.messages()[0].content.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_block_appends_then_replaces() {
        let head = "BASE";
        let once = upsert_block(head, PERSONA_BLOCK, "v1");
        assert!(once.contains("v1"));
        let twice = upsert_block(&once, PERSONA_BLOCK, "v2");
        assert!(twice.contains("v2"));
        assert!(!twice.contains("v1"));
        assert!(twice.starts_with("BASE"));
    }

    #[test]
    fn sanitise_id_strips_unsafe_characters() {
        assert_eq!(sanitise_id("alice-01"), "alice-01");
        assert_eq!(sanitise_id("../../etc"), "etc");
        assert_eq!(sanitise_id("***"), "unknown");
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = Memory::new("carol", "BASE", config());
        mem.add(ChatMessage::user("remember this")).await;
        mem.dir_for_test(dir.path());
        mem.save().await.unwrap();

        let loaded = Memory::load(
            "carol",
            "BASE",
            config(),
            Arc::new(NullSummarizer),
            dir.path(),
        )
        .await
        .unwrap();
        let messages = loaded.messages();
        assert!(messages.iter().any(|m| m.content == "remember this"));
    }

    impl Memory {
        fn dir_for_test(&mut self, dir: &Path) {
            self.dir = dir.to_path_buf();
        }
    }
}
