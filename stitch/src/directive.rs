use regex::Regex;

use crate::comment::CommentDelimiters;

/// A directive comment found in a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub instruction: String,
    /// 1-indexed line holding the comment.
    pub anchor_line: usize,
}

/// Matches directive comments for one comment style and tag.
pub struct DirectiveLocator {
    pattern: Regex,
}

impl DirectiveLocator {
    /// Build the grammar for `delimiters`. The tag matches case-insensitively and
    /// must be followed by a colon, whitespace, or the end of the comment.
    pub fn new(delimiters: &CommentDelimiters, tag: &str) -> Result<Self, regex::Error> {
        let prefix = regex::escape(&delimiters.prefix);
        let tag = regex::escape(tag);
        let source = if delimiters.is_block() {
            let suffix = regex::escape(&delimiters.suffix);
            format!(r"^\s*{prefix}\s*(?i:{tag})(?:(?::|\s)\s*(.*?))?\s*{suffix}\s*$")
        } else {
            format!(r"^\s*{prefix}\s+(?i:{tag})(?::|\s|$)(.*)$")
        };
        Ok(Self {
            pattern: Regex::new(&source)?,
        })
    }

    /// Instruction text if `line` is a directive comment. May be empty.
    pub fn match_line(&self, line: &str) -> Option<String> {
        let caps = self.pattern.captures(line)?;
        let instruction = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        Some(instruction.trim().to_string())
    }

    /// Scan from `from_line` (1-indexed, inclusive) back to line 1 and return the
    /// closest directive.
    pub fn find(&self, lines: &[String], from_line: usize) -> Option<Directive> {
        let start = from_line.min(lines.len());
        (1..=start).rev().find_map(|n| {
            self.match_line(&lines[n - 1]).map(|instruction| Directive {
                instruction,
                anchor_line: n,
            })
        })
    }
}
