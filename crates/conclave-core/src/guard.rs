//! GuardRail (§4.E): per-turn and cross-turn stagnation, repeat, and
//! low-signal detection. Each agent owns exactly one `GuardRail` instance.

use std::collections::{HashMap, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::GuardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Strong,
    Final,
}

/// The outcome of a guard observation, consumed by the scheduler or the
/// agent turn executor.
#[derive(Debug, Clone, Default)]
pub struct GuardDecision {
    pub nudge: Option<String>,
    pub warnings: Vec<String>,
    pub end_turn: bool,
    pub mute_ms: Option<u64>,
    pub suppress_broadcast: bool,
    pub ask_user: Option<String>,
}

impl GuardDecision {
    fn nudge(text: impl Into<String>) -> Self {
        Self {
            nudge: Some(text.into()),
            ..Default::default()
        }
    }
}

struct ToolSigState {
    count: u32,
    last_res_sig: Option<String>,
    unchanged_count: u32,
    fail_streak: u32,
}

pub struct GuardRail {
    config: GuardConfig,
    bad_tool_limit: u32,
    repeat_limit: u32,
    missing_arg_count: u32,
    consecutive_no_tool_calls: u32,
    tool_sigs: HashMap<String, ToolSigState>,
    group_norm_window: VecDeque<String>,
}

impl GuardRail {
    pub fn new(config: GuardConfig) -> Self {
        let bad_tool_limit = config.bad_tool_end_turn_limit;
        let repeat_limit = config.repeat_tool_sig_end_turn_limit;
        Self {
            config,
            bad_tool_limit,
            repeat_limit,
            missing_arg_count: 0,
            consecutive_no_tool_calls: 0,
            tool_sigs: HashMap::new(),
            group_norm_window: VecDeque::new(),
        }
    }

    /// Zero per-turn counters and recompute the adaptive limits from the
    /// turn's hop budget.
    pub fn begin_turn(&mut self, max_tool_hops: u32) {
        let derived = GuardConfig::from_max_tool_hops(max_tool_hops);
        self.bad_tool_limit = derived.bad_tool_end_turn_limit;
        self.repeat_limit = derived.repeat_tool_sig_end_turn_limit;
        self.missing_arg_count = 0;
        self.tool_sigs.clear();
    }

    /// Cross-turn stagnation tracking: increments only when the turn
    /// produced no tool calls (§9 open question, resolved).
    pub fn note_assistant_turn(&mut self, had_tool_calls: bool) {
        if had_tool_calls {
            self.consecutive_no_tool_calls = 0;
        } else {
            self.consecutive_no_tool_calls += 1;
        }
    }

    pub fn note_bad_tool_call(&mut self, name: &str, missing_args: &[&str]) -> GuardDecision {
        self.missing_arg_count += 1;
        let severity = match self.missing_arg_count {
            1 => Severity::Warning,
            2 => Severity::Strong,
            _ => Severity::Final,
        };
        let label = match severity {
            Severity::Warning => "WARNING",
            Severity::Strong => "STRONG",
            Severity::Final => "FINAL",
        };
        let nudge = format!(
            "{label}: tool `{name}` call missing required argument(s): {}",
            missing_args.join(", ")
        );
        let end_turn = self.missing_arg_count >= self.bad_tool_limit;
        GuardDecision {
            nudge: Some(nudge),
            end_turn,
            ..Default::default()
        }
    }

    pub fn note_tool_call(
        &mut self,
        name: &str,
        args_sig: &str,
        res_sig: &str,
        exit_code: i32,
    ) -> GuardDecision {
        let key = format!("{name}|{}", normalize(args_sig));
        let state = self.tool_sigs.entry(key).or_insert_with(|| ToolSigState {
            count: 0,
            last_res_sig: None,
            unchanged_count: 0,
            fail_streak: 0,
        });

        state.count += 1;
        if exit_code != 0 {
            state.fail_streak += 1;
        } else {
            state.fail_streak = 0;
        }
        if state.last_res_sig.as_deref() == Some(res_sig) {
            state.unchanged_count += 1;
        } else {
            state.unchanged_count = 0;
            state.last_res_sig = Some(res_sig.to_string());
        }

        // Most severe first.
        if state.count >= self.repeat_limit {
            return GuardDecision {
                nudge: Some(format!(
                    "FINAL: `{name}` called with repeating identical arguments"
                )),
                end_turn: true,
                mute_ms: Some(1_500),
                ..Default::default()
            };
        }
        if state.unchanged_count >= 2 {
            return GuardDecision {
                nudge: Some(format!("`{name}` is stuck in a no-progress loop")),
                end_turn: true,
                ..Default::default()
            };
        }
        if state.fail_streak >= 2 {
            return GuardDecision::nudge(format!("`{name}` failed twice in a row"));
        }
        if state.count == 2 {
            return GuardDecision::nudge(format!("`{name}` called again with the same arguments"));
        }

        GuardDecision::default()
    }

    /// For `route == "group"`: compare against the sliding window of this
    /// agent's recent group norms.
    pub fn guard_check(&mut self, route: &str, content: &str) -> GuardDecision {
        if route != "group" {
            return GuardDecision::default();
        }

        let norm = normalize(content);
        let is_low_signal = is_low_signal(
            content,
            &norm,
            self.config.low_signal_char_threshold,
            self.config.low_signal_word_threshold,
        );

        for prior in &self.group_norm_window {
            let jaccard = token_jaccard(prior, &norm);
            let trigram = trigram_overlap(prior, &norm);
            if jaccard >= self.config.jaccard_threshold
                && trigram >= self.config.trigram_threshold
                && is_low_signal
            {
                return GuardDecision {
                    suppress_broadcast: true,
                    nudge: Some(
                        "group message suppressed: near-duplicate, low-signal content".to_string(),
                    ),
                    mute_ms: Some(2_000),
                    ..Default::default()
                };
            }
        }

        self.group_norm_window.push_back(norm);
        while self.group_norm_window.len() > self.config.group_norm_window {
            self.group_norm_window.pop_front();
        }
        GuardDecision::default()
    }

    /// After `idle_ask_after_ticks` idle ticks with empty queues, produce a
    /// prompt for the human.
    pub fn on_idle(&self, idle_ticks: u32, queues_empty: bool) -> Option<String> {
        if queues_empty && idle_ticks >= self.config.idle_ask_after_ticks {
            Some("All agents are idle. What would you like them to do next?".to_string())
        } else {
            None
        }
    }
}

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());
static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const BOILERPLATE: &[&str] = &[
    "ok", "okay", "sounds good", "got it", "sure", "yes", "no problem", "agreed", "thanks",
    "lgtm", "will do", "on it",
];

fn normalize(text: &str) -> String {
    let no_fence = FENCE.replace_all(text, " ");
    let no_punct = PUNCT.replace_all(&no_fence, " ");
    WS.replace_all(&no_punct, " ").trim().to_lowercase()
}

fn is_low_signal(original: &str, norm: &str, char_threshold: usize, word_threshold: usize) -> bool {
    let word_count = norm.split_whitespace().count();
    original.len() < char_threshold
        || word_count <= word_threshold
        || BOILERPLATE.iter().any(|b| norm == *b)
}

fn token_jaccard(a: &str, b: &str) -> f32 {
    use std::collections::HashSet;
    let sa: HashSet<&str> = a.split_whitespace().collect();
    let sb: HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 { 0.0 } else { inter as f32 / union as f32 }
}

fn trigrams(s: &str) -> std::collections::HashSet<&str> {
    let bytes_len = s.len();
    let mut set = std::collections::HashSet::new();
    let chars: Vec<usize> = s.char_indices().map(|(i, _)| i).collect();
    for i in 0..chars.len() {
        let end_char = i + 3;
        if end_char > chars.len() {
            break;
        }
        let start_byte = chars[i];
        let end_byte = if end_char < chars.len() { chars[end_char] } else { bytes_len };
        set.insert(&s[start_byte..end_byte]);
    }
    set
}

fn trigram_overlap(a: &str, b: &str) -> f32 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 { 0.0 } else { inter as f32 / union as f32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> GuardRail {
        let mut g = GuardRail::new(GuardConfig::from_max_tool_hops(12));
        g.begin_turn(12);
        g
    }

    #[test]
    fn invariant_7_guard_end_turn_at_limit() {
        let mut g = guard();
        let limit = g.bad_tool_limit;
        let mut last = GuardDecision::default();
        for _ in 0..limit {
            last = g.note_bad_tool_call("sh", &["cmd"]);
        }
        assert!(last.end_turn);
    }

    #[test]
    fn s6_repeat_tool_call_ends_turn() {
        let mut g = guard();
        g.repeat_limit = 2;
        let d1 = g.note_tool_call("sh", "ls", "0", 0);
        assert!(!d1.end_turn);
        let d2 = g.note_tool_call("sh", "ls", "0", 0);
        assert!(d2.end_turn);
        assert!(d2.nudge.unwrap().contains("FINAL"));
    }

    #[test]
    fn note_assistant_turn_tracks_zero_tool_call_turns_only() {
        let mut g = guard();
        g.note_assistant_turn(false);
        g.note_assistant_turn(false);
        assert_eq!(g.consecutive_no_tool_calls, 2);
        g.note_assistant_turn(true);
        assert_eq!(g.consecutive_no_tool_calls, 0);
    }

    #[test]
    fn guard_check_suppresses_near_duplicate_low_signal() {
        let mut g = guard();
        let first = g.guard_check("group", "ok sounds good");
        assert!(!first.suppress_broadcast);
        let second = g.guard_check("group", "ok sounds good");
        assert!(second.suppress_broadcast);
    }

    #[test]
    fn guard_check_ignores_high_signal_repeats() {
        let mut g = guard();
        let content = "here is a fairly detailed technical explanation of the bug and the fix";
        let _ = g.guard_check("group", content);
        let second = g.guard_check("group", content);
        assert!(!second.suppress_broadcast);
    }

    #[test]
    fn on_idle_prompts_after_threshold() {
        let g = guard();
        assert!(g.on_idle(1, true).is_none());
        assert!(g.on_idle(3, true).is_some());
        assert!(g.on_idle(5, false).is_none());
    }
}
