//! Command parsing and batch extraction.

use std::sync::OnceLock;

use regex::Regex;

/// Markers that identify protocol envelope lines rather than commands.
const ENVELOPE_MARKERS: [&str; 2] = ["config>", "cli-config-data>"];

fn embedded_cmd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*<cmd>(.*)</cmd>\s*$").expect("valid regex"))
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(no|do) (.*?)\s*$").expect("valid regex"))
}

/// Optional leading token that changes how a command is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPrefix {
    /// Ordinary configuration command; inserted into the tree.
    Plain,
    /// Negated command; removes configuration state.
    No,
    /// Non-persistent device action; accepted but never stored.
    Do,
}

/// One parsed command line. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub prefix: CommandPrefix,
    pub tokens: Vec<String>,
}

impl Command {
    /// Parses a raw command string (after envelope extraction).
    ///
    /// Returns `None` for strings with no command tokens.
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, rest) = match prefix_re().captures(raw) {
            Some(caps) => {
                let prefix = match caps.get(1).map(|m| m.as_str()) {
                    Some("no") => CommandPrefix::No,
                    Some("do") => CommandPrefix::Do,
                    _ => CommandPrefix::Plain,
                };
                (prefix, caps.get(2).map(|m| m.as_str()).unwrap_or(""))
            }
            None => (CommandPrefix::Plain, raw),
        };
        let tokens: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return None;
        }
        Some(Self { prefix, tokens })
    }

    /// The command head (first token).
    pub fn head(&self) -> &str {
        &self.tokens[0]
    }

    /// Token path as string slices, for tree operations.
    pub fn path(&self) -> Vec<&str> {
        self.tokens.iter().map(String::as_str).collect()
    }
}

/// Extracts the embedded command strings from a submitted snippet.
///
/// Blank lines, protocol envelope lines, and lines without a `<cmd>` wrapper
/// are dropped.
pub(crate) fn extract_batch(snippet: &str) -> Vec<String> {
    snippet
        .lines()
        .filter(|line| !line.is_empty())
        .filter(|line| !ENVELOPE_MARKERS.iter().any(|m| line.contains(m)))
        .filter_map(|line| {
            embedded_cmd_re()
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}
