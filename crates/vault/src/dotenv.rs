//! Dotenv parser and emitter
//!
//! A [`Document`] keeps every line verbatim together with its own line
//! ending, so emitting an untouched document reproduces the input bytes.
//! Assignments are parsed from the raw text on demand; edits rewrite only
//! the lines they touch.

use crate::error::VaultError;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One raw line and the line ending that followed it ("" for the last line)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub nl: String,
}

/// A parsed `KEY=value` line
///
/// `left_raw + "=" + value_ws + value_raw + trailer` is always the original
/// line text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Line uses the `export KEY=...` form
    pub export: bool,
    pub key: String,
    /// Everything before the `=`
    pub left_raw: String,
    /// Whitespace between `=` and the value
    pub value_ws: String,
    /// Value token as written (quotes included)
    pub value_raw: String,
    /// Trailing whitespace and inline comment
    pub trailer: String,
}

impl Assignment {
    /// Render back to line text
    pub fn render(&self) -> String {
        format!(
            "{}={}{}{}",
            self.left_raw, self.value_ws, self.value_raw, self.trailer
        )
    }

    /// Inline comment, `#` included
    pub fn comment(&self) -> Option<&str> {
        let trimmed = self.trailer.trim();
        trimmed.starts_with('#').then_some(trimmed)
    }

    /// Logical value with quotes and escapes resolved
    pub fn value(&self) -> Result<String> {
        normalize_value(&self.value_raw)
            .with_context(|| format!("parse value of {}", self.key))
    }
}

/// An assignment and the index of the line it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: usize,
    pub assignment: Assignment,
}

impl Entry {
    pub fn key(&self) -> &str {
        &self.assignment.key
    }

    pub fn value_raw(&self) -> &str {
        &self.assignment.value_raw
    }
}

/// A dotenv file, line by line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    lines: Vec<Line>,
    default_nl: String,
}

impl Default for Document {
    /// Empty document; new lines end with `\n`
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            default_nl: "\n".to_string(),
        }
    }
}

impl Document {
    /// Split text into lines, keeping each line's ending
    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            match rest.find('\n') {
                Some(pos) => {
                    let (body, nl) = match rest[..pos].strip_suffix('\r') {
                        Some(body) => (body, "\r\n"),
                        None => (&rest[..pos], "\n"),
                    };
                    lines.push(Line {
                        text: body.to_string(),
                        nl: nl.to_string(),
                    });
                    rest = &rest[pos + 1..];
                }
                None => {
                    lines.push(Line {
                        text: rest.to_string(),
                        nl: String::new(),
                    });
                    rest = "";
                }
            }
        }

        let default_nl = lines
            .iter()
            .map(|l| l.nl.as_str())
            .find(|nl| !nl.is_empty())
            .unwrap_or("\n")
            .to_string();

        Self { lines, default_nl }
    }

    /// Parse raw file bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).context("vault file is not valid UTF-8")?;
        Ok(Self::parse(text))
    }

    /// Build a document from already-split lines
    pub fn from_lines(lines: Vec<Line>, default_nl: &str) -> Self {
        Self {
            lines,
            default_nl: default_nl.to_string(),
        }
    }

    /// Emit text with every line's original ending
    pub fn emit(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            out.push_str(&line.nl);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.emit().into_bytes()
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn default_nl(&self) -> &str {
        &self.default_nl
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All assignments in file order, duplicates included
    pub fn entries(&self) -> Vec<Entry> {
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                parse_assignment(&line.text).map(|assignment| Entry { index, assignment })
            })
            .collect()
    }

    /// One entry per key: last assignment wins, order of first appearance
    pub fn effective_entries(&self) -> Vec<Entry> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Entry> = HashMap::new();
        for entry in self.entries() {
            if !latest.contains_key(entry.key()) {
                order.push(entry.key().to_string());
            }
            latest.insert(entry.key().to_string(), entry);
        }
        order
            .into_iter()
            .filter_map(|key| latest.remove(&key))
            .collect()
    }

    /// Last assignment of `key`
    pub fn lookup(&self, key: &str) -> Option<Entry> {
        self.entries().into_iter().rev().find(|e| e.key() == key)
    }

    /// Indices of lines that are neither blank, comments nor assignments
    pub fn malformed(&self) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                let trimmed = line.text.trim();
                !trimmed.is_empty()
                    && !trimmed.starts_with('#')
                    && parse_assignment(&line.text).is_none()
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Set `key` to an already-rendered value
    ///
    /// The last existing assignment is rewritten in place keeping its layout;
    /// otherwise a new line is appended. Returns whether the text changed.
    pub fn upsert(&mut self, key: &str, rendered: &str, comment: Option<&str>) -> bool {
        if let Some(entry) = self.lookup(key) {
            return self.rewrite_entry(entry, rendered, comment);
        }
        let line = render_assignment(key, rendered, comment);
        let at = self.lines.len();
        self.insert_line(at, &line);
        true
    }

    /// Like [`upsert`](Self::upsert) but new keys land in `# [section]`
    pub fn upsert_in_section(
        &mut self,
        section: &str,
        key: &str,
        rendered: &str,
        comment: Option<&str>,
    ) -> bool {
        if let Some(entry) = self.lookup(key) {
            return self.rewrite_entry(entry, rendered, comment);
        }

        let line = render_assignment(key, rendered, comment);
        match self.section_insert_at(section) {
            Some(at) => self.insert_line(at, &line),
            None => {
                if self
                    .lines
                    .last()
                    .map(|l| !l.text.trim().is_empty())
                    .unwrap_or(false)
                {
                    self.push_line("");
                }
                self.push_line(&divider_line());
                self.push_line(&format!("# [{}]", section.trim().to_lowercase()));
                self.push_line(&line);
            }
        }
        true
    }

    /// Remove every assignment of `key`; returns how many were removed
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| {
            parse_assignment(&line.text)
                .map(|a| a.key != key)
                .unwrap_or(true)
        });
        before - self.lines.len()
    }

    /// Replace the value token of the assignment on line `index`
    pub fn replace_value(&mut self, index: usize, rendered: &str) -> bool {
        let Some(line) = self.lines.get(index) else {
            return false;
        };
        let Some(assignment) = parse_assignment(&line.text) else {
            return false;
        };
        self.rewrite_entry(Entry { index, assignment }, rendered, None)
    }

    /// Insert a line before `at`, giving the previous line an ending if needed
    pub fn insert_line(&mut self, at: usize, text: &str) {
        let at = at.min(self.lines.len());
        if at > 0 && self.lines[at - 1].nl.is_empty() {
            self.lines[at - 1].nl = self.default_nl.clone();
        }
        self.lines.insert(
            at,
            Line {
                text: text.to_string(),
                nl: self.default_nl.clone(),
            },
        );
    }

    pub fn push_line(&mut self, text: &str) {
        let at = self.lines.len();
        self.insert_line(at, text);
    }

    pub fn remove_line(&mut self, index: usize) -> Option<Line> {
        (index < self.lines.len()).then(|| self.lines.remove(index))
    }

    fn rewrite_entry(&mut self, entry: Entry, rendered: &str, comment: Option<&str>) -> bool {
        let mut assignment = entry.assignment;
        assignment.value_raw = rendered.to_string();
        if let Some(comment) = comment {
            assignment.trailer = inline_comment(comment);
        } else if !rendered.is_empty() && assignment.trailer.starts_with('#') {
            // `KEY=# note` had no value; keep the note a comment
            assignment.trailer.insert(0, ' ');
        }

        let text = assignment.render();
        let line = &mut self.lines[entry.index];
        if line.text == text {
            return false;
        }
        line.text = text;
        true
    }

    /// Where a new key belongs inside `# [section]`: before the section's
    /// trailing blank lines and before the divider above the next section
    fn section_insert_at(&self, section: &str) -> Option<usize> {
        let name = section.trim().to_lowercase();
        let header = self
            .lines
            .iter()
            .position(|l| section_header(&l.text).as_deref() == Some(name.as_str()))?;
        let start = header + 1;

        let next = self.lines[start..]
            .iter()
            .position(|l| section_header(&l.text).is_some())
            .map(|p| start + p);

        let mut end = next.unwrap_or(self.lines.len());
        if next.is_some() {
            while end > start && is_divider(&self.lines[end - 1].text) {
                end -= 1;
            }
        }
        while end > start && self.lines[end - 1].text.trim().is_empty() {
            end -= 1;
        }
        Some(end)
    }
}

/// Parse one line as an assignment
pub fn parse_assignment(text: &str) -> Option<Assignment> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let eq = text.find('=')?;
    let left = &text[..eq];
    let mut name = left.trim();
    let mut export = false;
    if let Some(rest) = name.strip_prefix("export") {
        if rest.starts_with([' ', '\t']) {
            name = rest.trim();
            export = true;
        }
    }
    if !is_valid_key(name) {
        return None;
    }

    let rhs = &text[eq + 1..];
    let ws_len = rhs.len() - rhs.trim_start_matches([' ', '\t']).len();
    let (value_ws, rest) = rhs.split_at(ws_len);
    let (value_raw, trailer) = split_value(rest);

    Some(Assignment {
        export,
        key: name.to_string(),
        left_raw: left.to_string(),
        value_ws: value_ws.to_string(),
        value_raw: value_raw.to_string(),
        trailer: trailer.to_string(),
    })
}

/// Split the right-hand side into the value token and its trailer
fn split_value(rest: &str) -> (&str, &str) {
    if rest.is_empty() {
        return ("", "");
    }
    if rest.starts_with('#') {
        return ("", rest);
    }

    if rest.starts_with('"') {
        if let Some(end) = closing_double_quote(rest) {
            return rest.split_at(end + 1);
        }
    } else if rest.starts_with('\'') {
        if let Some(end) = rest[1..].find('\'') {
            return rest.split_at(end + 2);
        }
    }

    let bytes = rest.as_bytes();
    let cut = (1..bytes.len())
        .find(|&i| bytes[i] == b'#' && matches!(bytes[i - 1], b' ' | b'\t'))
        .unwrap_or(bytes.len());
    let value = rest[..cut].trim_end_matches([' ', '\t']);
    (value, &rest[value.len()..])
}

/// Byte index of the quote closing a double-quoted token
fn closing_double_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Resolve quoting of a raw value token
pub fn normalize_value(raw: &str) -> Result<String> {
    let raw = raw.trim();

    if raw.starts_with('"') {
        return match closing_double_quote(raw) {
            Some(end) if end == raw.len() - 1 => Ok(unescape_double(&raw[1..end])),
            _ => bail!(VaultError::BadInput(
                "unterminated double-quoted value".to_string()
            )),
        };
    }

    if raw.starts_with('\'') {
        let inner = raw
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .filter(|inner| !inner.contains('\''));
        return match inner {
            Some(inner) => Ok(inner.to_string()),
            None => bail!(VaultError::BadInput(
                "unterminated single-quoted value".to_string()
            )),
        };
    }

    Ok(raw.to_string())
}

fn unescape_double(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('$') => out.push('$'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Render a logical value as a token that parses back to the same value
///
/// Prefers unquoted, then double quotes with control escapes, then single
/// quotes, then fully escaped double quotes.
pub fn render_value(value: &str) -> String {
    if value.is_empty() || is_safe_unquoted(value) {
        return value.to_string();
    }
    if !value.contains(['"', '\\']) {
        return format!("\"{}\"", escape_controls(value));
    }
    if !value.contains('\'') && !value.chars().any(char::is_control) {
        return format!("'{}'", value);
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escape_controls(&escaped))
}

fn is_safe_unquoted(value: &str) -> bool {
    value.trim() == value
        && !value.starts_with(['"', '\'', '#'])
        && !value.contains(" #")
        && !value.chars().any(char::is_control)
}

fn escape_controls(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Normalize an inline comment to ` # text`
pub fn inline_comment(comment: &str) -> String {
    let body = comment.trim().trim_start_matches('#').trim();
    if body.is_empty() {
        String::new()
    } else {
        format!(" # {}", body)
    }
}

/// Render `KEY=value` with an optional inline comment
pub fn render_assignment(key: &str, rendered: &str, comment: Option<&str>) -> String {
    let comment = comment.map(inline_comment).unwrap_or_default();
    format!("{}={}{}", key, rendered, comment)
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid key pattern"))
}

pub fn is_valid_key(key: &str) -> bool {
    key_pattern().is_match(key)
}

/// Reject key names that are not shell identifiers
pub fn validate_key_name(key: &str) -> Result<()> {
    if !is_valid_key(key) {
        bail!(VaultError::BadInput(format!(
            "invalid key name {:?} (expected [A-Za-z_][A-Za-z0-9_]*)",
            key
        )));
    }
    Ok(())
}

/// `# ----...` line placed above section headers
pub fn divider_line() -> String {
    format!("# {}", "-".repeat(78))
}

/// A `#` line made only of ten or more dashes
pub fn is_divider(text: &str) -> bool {
    match text.trim().strip_prefix('#') {
        Some(body) => {
            let body = body.trim();
            body.len() >= 10 && body.chars().all(|c| c == '-')
        }
        None => false,
    }
}

/// Section name of a `# [name]` line, lowercased
pub fn section_header(text: &str) -> Option<String> {
    let body = text.trim().strip_prefix('#')?.trim();
    let name = body.strip_prefix('[')?.strip_suffix(']')?.trim();
    (!name.is_empty()).then(|| name.to_lowercase())
}
