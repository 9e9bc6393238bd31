//! Tag Parser / Splitter (§4.A). Tokenises a line of text into an ordered
//! sequence of addressed parts: `@@agent`, `@@group`, `@@user`, `##file:path`.

/// How a [`ParsedTag`] was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Agent,
    Group,
    User,
    File,
}

/// One addressed part of a parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTag {
    pub kind: TagKind,
    /// The raw tag token: the agent id for `Agent`, the file path for
    /// `File`, empty for `Group`/`User`.
    pub tag: String,
    pub content: String,
    /// Order of appearance among the parts returned for this input.
    pub index: usize,
}

/// Grammar configuration (§4.A). `agent_tokens` is the current allowlist of
/// live agent ids; everything else has sensible defaults.
#[derive(Debug, Clone)]
pub struct TagConfig {
    pub agent_tokens: Vec<String>,
    pub user_tokens: Vec<String>,
    pub group_tokens: Vec<String>,
    pub file_tokens: Vec<String>,
    pub allow_single_at: bool,
    pub allow_single_hash: bool,
    pub allow_file_shorthand: bool,
    pub boundary_chars: Vec<char>,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            agent_tokens: Vec::new(),
            user_tokens: vec!["user".to_string()],
            group_tokens: vec!["group".to_string()],
            file_tokens: vec!["file".to_string()],
            allow_single_at: false,
            allow_single_hash: false,
            allow_file_shorthand: true,
            boundary_chars: " \t\r\n.,!?;:()[]{}'\"<>".chars().collect(),
        }
    }
}

impl TagConfig {
    pub fn with_agent_tokens(agents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            agent_tokens: agents.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn is_boundary(&self, c: char) -> bool {
        self.boundary_chars.contains(&c)
    }
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// A tag-start candidate found by the scanner, before grammar resolution.
struct Candidate {
    /// Byte offset where the tag marker (`@@`, `@`, `##`, `#`) begins.
    start: usize,
    /// Byte offset immediately after the full matched tag (marker + token
    /// [+ `:name`]), where the part's content begins.
    content_start: usize,
    kind: TagKind,
    tag: String,
}

/// Parse `input` into an ordered sequence of [`ParsedTag`]s per §4.A.
pub fn parse_tags(input: &str, config: &TagConfig) -> Vec<ParsedTag> {
    let candidates = scan_candidates(input, config);

    if candidates.is_empty() {
        let trimmed = input.trim();
        return vec![ParsedTag {
            kind: TagKind::Group,
            tag: String::new(),
            content: trimmed.to_string(),
            index: 0,
        }];
    }

    let mut parts = Vec::new();
    let mut index = 0;

    let leading = input[..candidates[0].start].trim();
    if !leading.is_empty() {
        parts.push(ParsedTag {
            kind: TagKind::Group,
            tag: String::new(),
            content: leading.to_string(),
            index,
        });
        index += 1;
    }

    for (i, cand) in candidates.iter().enumerate() {
        let content_end = candidates
            .get(i + 1)
            .map(|next| next.start)
            .unwrap_or(input.len());
        let content = input[cand.content_start..content_end].trim().to_string();
        parts.push(ParsedTag {
            kind: cand.kind,
            tag: cand.tag.clone(),
            content,
            index,
        });
        index += 1;
    }

    parts
}

fn scan_candidates(input: &str, config: &TagConfig) -> Vec<Candidate> {
    let bytes = input.as_bytes();
    let mut candidates = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();

    for (ci, &(pos, c)) in chars.iter().enumerate() {
        if c != '@' && c != '#' {
            continue;
        }
        let at_start = pos == 0;
        let after_boundary = ci > 0 && config.is_boundary(chars[ci - 1].1);
        if !at_start && !after_boundary {
            continue;
        }

        if c == '@' {
            let double = bytes.get(pos + 1) == Some(&b'@');
            let marker_len = if double { 2 } else { 1 };
            if !double && !config.allow_single_at {
                continue;
            }
            let token_start = pos + marker_len;
            let (token, token_end) = read_token(input, token_start);
            if token.is_empty() {
                continue;
            }
            if let Some(kind) = classify_at_token(&token, config) {
                let tag = if kind == TagKind::Agent {
                    resolve_agent_id(&token, config).unwrap_or(token)
                } else {
                    String::new()
                };
                candidates.push(Candidate {
                    start: pos,
                    content_start: token_end,
                    kind,
                    tag,
                });
            }
            continue;
        }

        // c == '#'
        let double = bytes.get(pos + 1) == Some(&b'#');
        let marker_len = if double { 2 } else { 1 };
        if !double && !config.allow_single_hash {
            continue;
        }
        let after_marker = pos + marker_len;
        let (token, token_end) = read_token(input, after_marker);

        let matches_file_token = config
            .file_tokens
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&token));

        if matches_file_token && input[token_end..].starts_with(':') {
            let path_start = token_end + 1;
            let (path, path_end) = read_path(input, path_start);
            if !path.is_empty() {
                candidates.push(Candidate {
                    start: pos,
                    content_start: path_end,
                    kind: TagKind::File,
                    tag: normalize_file_path(&path),
                });
            }
            continue;
        }

        if config.allow_file_shorthand {
            let (path, path_end) = read_path(input, after_marker);
            if !path.is_empty() {
                candidates.push(Candidate {
                    start: pos,
                    content_start: path_end,
                    kind: TagKind::File,
                    tag: normalize_file_path(&path),
                });
            }
        }
    }

    candidates
}

fn read_token(input: &str, start: usize) -> (String, usize) {
    let mut end = start;
    for (pos, c) in input[start..].char_indices() {
        if !is_token_char(c) {
            break;
        }
        end = start + pos + c.len_utf8();
    }
    (input[start..end].to_string(), end)
}

fn read_path(input: &str, start: usize) -> (String, usize) {
    let mut end = start;
    for (pos, c) in input[start..].char_indices() {
        if c.is_whitespace() {
            break;
        }
        end = start + pos + c.len_utf8();
    }
    (input[start..end].to_string(), end)
}

fn classify_at_token(token: &str, config: &TagConfig) -> Option<TagKind> {
    if config.user_tokens.iter().any(|t| t.eq_ignore_ascii_case(token)) {
        Some(TagKind::User)
    } else if config.group_tokens.iter().any(|t| t.eq_ignore_ascii_case(token)) {
        Some(TagKind::Group)
    } else if resolve_agent_id(token, config).is_some() {
        Some(TagKind::Agent)
    } else {
        None
    }
}

fn resolve_agent_id(token: &str, config: &TagConfig) -> Option<String> {
    config
        .agent_tokens
        .iter()
        .find(|id| id.eq_ignore_ascii_case(token))
        .cloned()
}

fn normalize_file_path(path: &str) -> String {
    if path.starts_with('/') || path.starts_with('.') {
        path.to_string()
    } else {
        format!("./{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(names: &[&str]) -> TagConfig {
        TagConfig::with_agent_tokens(names.iter().map(|s| s.to_string()))
    }

    #[test]
    fn s1_dm_routing() {
        let parts = parse_tags("@@bob hi", &agents(&["alice", "bob"]));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::Agent);
        assert_eq!(parts[0].tag, "bob");
        assert_eq!(parts[0].content, "hi");
    }

    #[test]
    fn s2_group_broadcast() {
        let parts = parse_tags("@@group. hi all", &agents(&["alice", "bob", "carol"]));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::Group);
        assert_eq!(parts[0].content, "hi all");
    }

    #[test]
    fn s3_user_noop() {
        let parts = parse_tags("@@user please confirm", &agents(&["alice"]));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::User);
        assert_eq!(parts[0].content, "please confirm");
    }

    #[test]
    fn unknown_agent_name_falls_back_to_group() {
        let parts = parse_tags("@@dave hi", &agents(&["alice", "bob"]));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::Group);
        assert_eq!(parts[0].content, "@@dave hi");
    }

    #[test]
    fn no_tags_yields_single_group_part() {
        let parts = parse_tags("just plain text", &TagConfig::default());
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::Group);
        assert_eq!(parts[0].content, "just plain text");
    }

    #[test]
    fn empty_input_yields_one_empty_group_part() {
        let parts = parse_tags("", &TagConfig::default());
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::Group);
        assert_eq!(parts[0].content, "");
    }

    #[test]
    fn leading_text_becomes_leading_group_part() {
        let parts = parse_tags("intro text @@bob do it", &agents(&["alice", "bob"]));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, TagKind::Group);
        assert_eq!(parts[0].content, "intro text");
        assert_eq!(parts[1].kind, TagKind::Agent);
        assert_eq!(parts[1].content, "do it");
    }

    #[test]
    fn file_tag_with_explicit_token() {
        let parts = parse_tags("##file:src/main.rs put this", &TagConfig::default());
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::File);
        assert_eq!(parts[0].tag, "./src/main.rs");
        assert_eq!(parts[0].content, "put this");
    }

    #[test]
    fn file_shorthand_normalises_path() {
        let parts = parse_tags("##notes.txt write this", &TagConfig::default());
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kind, TagKind::File);
        assert_eq!(parts[0].tag, "./notes.txt");
    }

    #[test]
    fn file_shorthand_respects_absolute_and_dot_paths() {
        let parts = parse_tags("##/etc/passwd x", &TagConfig::default());
        assert_eq!(parts[0].tag, "/etc/passwd");
    }
}
