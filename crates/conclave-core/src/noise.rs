//! Streaming Noise Filter (§4.B). Strips model-emitted meta tags and
//! channel framing while preserving fenced code blocks verbatim and
//! preserving tag tokens across chunk boundaries.
//!
//! `feed` only ever emits the longest *safe prefix* of what it has
//! buffered: bytes past which no partially-observed structure (a fence, a
//! channel envelope, a paired block) could still change meaning. Anything
//! that might still be in flight is held back in `buffer` until the next
//! `feed` or the terminal `flush`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bytes of trailing context always kept unflushed so that a tag token or
/// marker split across two chunks is never mis-stripped.
const TRAILING_CARRY: usize = 48;

static CHANNEL_ENVELOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|channel\|>(?P<header>.*?)<\|message\|>(?P<payload>.*?)(?:\n|$)").unwrap()
});
static PAIRED_STRIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|(memory|analysis|tool_call)_(?:start|begin)\|>.*?<\|\1_(?:end|stop)\|>")
        .unwrap()
});
static PAIRED_UNWRAP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|(tool_result|final)_(?:start|begin)\|>(?P<body>.*?)<\|\1_(?:end|stop)\|>")
        .unwrap()
});
static JSON_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\{.*?\})\s*(.*)$").unwrap());
static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|constrain\|>(@@\w+)").unwrap());
static HEADER_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(@@\w+)").unwrap());

/// A streaming, chunk-safe filter. Construct once per generation turn.
#[derive(Default)]
pub struct NoiseFilter {
    buffer: String,
    in_unterminated_fence: bool,
}

impl NoiseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of model output; returns the cleaned text safe
    /// to route immediately.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);

        if self.in_unterminated_fence {
            // A fence swallows everything until a closing ``` is seen; we
            // cannot safely emit anything from inside it yet.
            if let Some(close) = find_fence_close(&self.buffer) {
                self.in_unterminated_fence = false;
                return self.drain_up_to(close);
            }
            return String::new();
        }

        let safe_len = self.safe_prefix_len();
        self.drain_up_to(safe_len)
    }

    /// Flush all remaining buffered bytes, regardless of whether a
    /// structure looks complete (end of stream: preserve verbatim).
    pub fn flush(&mut self) -> String {
        let raw = std::mem::take(&mut self.buffer);
        self.in_unterminated_fence = false;
        clean_complete(&raw)
    }

    /// The longest prefix of `buffer` containing no partially-observed
    /// fence, channel envelope, or paired block, minus a trailing carry.
    fn safe_prefix_len(&self) -> usize {
        let buf = &self.buffer;

        if let Some(fence_start) = find_unterminated_fence_start(buf) {
            return fence_start;
        }

        if let Some(open) = buf.rfind("<|") {
            // An unterminated `<|...|>` construct near the tail — hold
            // back to the start of the marker.
            if buf[open..].find("|>").is_none() {
                return open.min(buf.len().saturating_sub(TRAILING_CARRY));
            }
        }

        buf.len().saturating_sub(TRAILING_CARRY)
    }

    fn drain_up_to(&mut self, len: usize) -> String {
        let len = len.min(self.buffer.len());
        let safe_boundary = self.buffer[..len]
            .char_indices()
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let emitted: String = self.buffer.drain(..safe_boundary).collect();
        clean_complete(&emitted)
    }
}

fn find_fence_close(buf: &str) -> Option<usize> {
    let mut lines = buf.match_indices('\n').map(|(i, _)| i + 1);
    let mut saw_open = false;
    for line_start in std::iter::once(0).chain(lines.by_ref()) {
        let line = &buf[line_start..buf[line_start..].find('\n').map(|i| line_start + i).unwrap_or(buf.len())];
        if line.trim_start().starts_with("```") {
            if saw_open {
                return Some(line_start + line.len());
            }
            saw_open = true;
        }
    }
    None
}

fn find_unterminated_fence_start(buf: &str) -> Option<usize> {
    let mut fence_start = None;
    let mut pos = 0;
    for line in buf.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            fence_start = match fence_start {
                None => Some(pos),
                Some(_) => None,
            };
        }
        pos += line.len();
    }
    // Also handle a final unterminated line with no trailing newline.
    fence_start
}

/// Apply the non-streaming cleanup rules to a fully-buffered (or flushed)
/// chunk of text: channel envelopes and paired blocks.
fn clean_complete(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let Some(m) = CHANNEL_ENVELOPE.captures(rest) else {
            break;
        };
        let whole = m.get(0).unwrap();
        out.push_str(&rest[..whole.start()]);
        let header = m.name("header").unwrap().as_str().trim();
        let payload = m.name("payload").unwrap().as_str();
        out.push_str(&render_channel(header, payload));
        rest = &rest[whole.end()..];
    }
    out.push_str(rest);

    let out = PAIRED_STRIP.replace_all(&out, "").into_owned();
    let out = PAIRED_UNWRAP
        .replace_all(&out, |caps: &regex::Captures| caps["body"].to_string())
        .into_owned();
    out
}

fn render_channel(header: &str, payload: &str) -> String {
    if header.starts_with("commentary to=functions") {
        // Tool-call envelope: drop header and JSON, keep trailing text.
        if let Some(caps) = JSON_TAIL.captures(payload) {
            return caps[2].to_string();
        }
        return String::new();
    }

    if header == "commentary" {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(payload.trim()) {
            if let Some(stdout) = json.get("stdout").and_then(|v| v.as_str()) {
                return stdout.to_string();
            }
        }
        return String::new();
    }

    if header.starts_with("final") && header.contains("|json") {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(payload.trim()) {
            if let Some(cmd) = json.get("cmd").and_then(|v| v.as_str())
                && let Some(echoed) = parse_echo(cmd)
            {
                let mention = MENTION
                    .captures(header)
                    .map(|c| format!("{} ", &c[1]))
                    .unwrap_or_default();
                return format!("{mention}{echoed}");
            }
        }
        return String::new();
    }

    if header.starts_with("final") {
        // The `|json` variant is handled above and always returns, so
        // reaching here means this is the plain `final` form, optionally
        // carrying a `@@mention` in the header (e.g. `final @@bob`).
        let mention = HEADER_MENTION
            .captures(header)
            .map(|c| format!("{} ", &c[1]))
            .unwrap_or_default();
        let line = payload.split('\n').next().unwrap_or(payload);
        return format!("{mention}{line}");
    }

    // Any other channel header: drop up to newline (already consumed).
    String::new()
}

fn parse_echo(cmd: &str) -> Option<String> {
    let cmd = cmd.trim();
    let rest = cmd.strip_prefix("echo ")?;
    let rest = rest.trim();
    let unquoted = rest
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    unquoted.map(|s| s.to_string()).or_else(|| Some(rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_plain_text_through() {
        let mut filter = NoiseFilter::new();
        let mut out = filter.feed("hello world, this is plain text with no markers");
        out.push_str(&filter.flush());
        assert_eq!(out, "hello world, this is plain text with no markers");
    }

    #[test]
    fn strips_commentary_tool_call_envelope() {
        let mut filter = NoiseFilter::new();
        let chunk = r#"<|channel|>commentary to=functions.sh<|message|>{"cmd":"ls"}
trailing"#;
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out.trim(), "trailing");
    }

    #[test]
    fn unwraps_final_echo_with_mention() {
        let mut filter = NoiseFilter::new();
        let chunk = "<|channel|>final|json <|constrain|>@@bob<|message|>{\"cmd\":\"echo \\\"hi\\\"\"}\n";
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out.trim(), "@@bob hi");
    }

    #[test]
    fn unwraps_plain_final_with_mention() {
        let mut filter = NoiseFilter::new();
        let chunk = "<|channel|>final @@bob<|message|>pong\nrest";
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out.trim(), "@@bob pong");
    }

    #[test]
    fn unwraps_plain_final_without_mention() {
        let mut filter = NoiseFilter::new();
        let chunk = "<|channel|>final<|message|>just the payload\n";
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out.trim(), "just the payload");
    }

    #[test]
    fn keeps_unterminated_fence_verbatim_on_flush() {
        let mut filter = NoiseFilter::new();
        let _ = filter.feed("before\n```rust\nfn main() {}\n");
        let tail = filter.flush();
        assert!(tail.contains("```rust"));
        assert!(tail.contains("fn main"));
    }

    #[test]
    fn strips_paired_analysis_block() {
        let mut filter = NoiseFilter::new();
        let chunk = "keep <|analysis_start|>secret scratch work<|analysis_end|> also keep";
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out, "keep  also keep");
    }

    #[test]
    fn unwraps_tool_result_block() {
        let mut filter = NoiseFilter::new();
        let chunk = "<|tool_result_start|>42<|tool_result_end|>";
        let mut out = filter.feed(chunk);
        out.push_str(&filter.flush());
        assert_eq!(out, "42");
    }
}
