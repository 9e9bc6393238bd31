//! Explicit configuration records (§9: duck-typed options objects with
//! mutable defaults are replaced with validated, clamped structs).

use serde::{Deserialize, Serialize};

/// Opaque tag threaded through logs and persisted memory snapshots so a
/// single invocation's telemetry can be correlated (`ORG_RUN_ID`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn from_env() -> Self {
        Self(std::env::var("ORG_RUN_ID").unwrap_or_else(|_| "unset".to_string()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self("unset".to_string())
    }
}

/// Persona distillation mode (`ORG_DYNAMIC_MEMORY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersonaMode {
    #[default]
    Off,
    /// Update persona state silently; never refresh the head block.
    Shadow,
    /// Update persona state and refresh the head block.
    Auto,
}

impl PersonaMode {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "shadow" => Some(Self::Shadow),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// §4.F budget model and summarisation policy.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub context_tokens: u32,
    pub reserve_header: u32,
    pub reserve_response: u32,
    pub high_ratio: f32,
    pub low_ratio: f32,
    pub summary_ratio: f32,
    pub avg_chars_per_token: f32,
    pub keep_recent_per_lane: usize,
    pub keep_recent_tools: usize,
    pub tool_output_estimate_cap_chars: usize,

    /// §4.F.1 (expansion): one policy struct replaces the five historical
    /// memory classes; each flag below opts into behavior one of those
    /// classes used to hard-code.
    pub persona_mode: PersonaMode,
    /// When set, the value is upserted as the `NORMATIVE POLICY BLOCK`
    /// tagged block in the head system message (`NormativeMemory`).
    pub normative_policy: Option<String>,
    /// When true, tool output is redacted before being added to memory
    /// (`ScrubbedAdvancedMemory`).
    pub scrub_tool_output: bool,

    pub min_reflect_gap_turns: u32,
    pub decay_per_pass: f32,
    pub min_keep_weight: f32,
    pub facet_capacity_per_category: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_tokens: 128_000,
            reserve_header: 1_024,
            reserve_response: 4_096,
            high_ratio: 0.85,
            low_ratio: 0.65,
            summary_ratio: 0.20,
            avg_chars_per_token: 4.0,
            keep_recent_per_lane: 8,
            keep_recent_tools: 6,
            tool_output_estimate_cap_chars: 24_000,
            persona_mode: PersonaMode::Off,
            normative_policy: None,
            scrub_tool_output: false,
            min_reflect_gap_turns: 12,
            decay_per_pass: 0.15,
            min_keep_weight: 0.05,
            facet_capacity_per_category: 6,
        }
    }
}

impl MemoryConfig {
    /// `budget = contextTokens − reserveHeader − reserveResponse` (min 512).
    pub fn budget(&self) -> u32 {
        self.context_tokens
            .saturating_sub(self.reserve_header)
            .saturating_sub(self.reserve_response)
            .max(512)
    }

    pub fn validated(mut self) -> Self {
        self.high_ratio = self.high_ratio.clamp(0.5, 0.98);
        self.low_ratio = self.low_ratio.clamp(0.2, self.high_ratio - 0.05);
        self.summary_ratio = self.summary_ratio.clamp(0.05, 0.5);
        self.avg_chars_per_token = self.avg_chars_per_token.max(1.0);
        self.decay_per_pass = self.decay_per_pass.clamp(0.0, 1.0);
        self.min_keep_weight = self.min_keep_weight.clamp(0.0, 1.0);
        self
    }
}

/// §4.E guard thresholds, most derived from the scheduler's hop budget.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub bad_tool_end_turn_limit: u32,
    pub repeat_tool_sig_end_turn_limit: u32,
    pub jaccard_threshold: f32,
    pub trigram_threshold: f32,
    pub low_signal_char_threshold: usize,
    pub low_signal_word_threshold: usize,
    pub group_norm_window: usize,
    pub idle_ask_after_ticks: u32,
}

impl GuardConfig {
    /// Derive adaptive per-turn limits from the hop budget (§4.E
    /// `beginTurn`): `badToolEndTurnLimit` clamped to `[1,4]`,
    /// `repeatToolSigEndTurnLimit` clamped to `[2,4]`.
    pub fn from_max_tool_hops(max_tool_hops: u32) -> Self {
        let bad_tool_end_turn_limit = (max_tool_hops / 2).clamp(1, 4);
        let repeat_tool_sig_end_turn_limit = (max_tool_hops / 3).clamp(2, 4);
        Self {
            bad_tool_end_turn_limit,
            repeat_tool_sig_end_turn_limit,
            jaccard_threshold: 0.82,
            trigram_threshold: 0.68,
            low_signal_char_threshold: 12,
            low_signal_word_threshold: 8,
            group_norm_window: 12,
            idle_ask_after_ticks: 3,
        }
    }
}

/// §4.I scheduler inputs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_tools: u32,
    pub idle_sleep_ms: u64,
    pub idle_prompt_every: u32,
    pub prompt_enabled: bool,
    /// Round-robin variant fixes shuffle to identity order.
    pub round_robin: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tools: 12,
            idle_sleep_ms: 120,
            idle_prompt_every: 3,
            prompt_enabled: true,
            round_robin: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validated(mut self) -> Self {
        self.max_tools = self.max_tools.max(1);
        self.idle_sleep_ms = self.idle_sleep_ms.max(10);
        self.idle_prompt_every = self.idle_prompt_every.max(1);
        self
    }
}
