//! Parsing of model replies in the `REPLACE <start> <end>` format.
//!
//! ```text
//! REPLACE 3 5
//! <replacement line>
//! <replacement line>
//! ```
//!
//! Models drift from the format in predictable ways: they wrap the answer in a
//! markdown fence, add a sentence of prose before the header, or shout/whisper
//! the keyword. All of that is tolerated. Line numbers are returned as written;
//! range checking belongs to whoever applies the edit.

use std::sync::LazyLock;

use regex::Regex;

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^REPLACE\s+(\d+)\s+(\d+)$").expect("header pattern is valid")
});

static OPENING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```[\w+#.-]*$").expect("fence pattern is valid"));

/// Max chars of the first line quoted in a parse error.
const EXCERPT_CHARS: usize = 50;

/// A line-range replacement produced by the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedEdit {
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub replacement_lines: Vec<String>,
}

/// A parsed edit plus how much prose preceded the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedResponse {
    pub edit: ParsedEdit,
    /// Non-blank lines skipped before the header.
    pub preamble_lines: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("no REPLACE header found (response starts with: {excerpt:?})")]
    MissingHeader { excerpt: String },
}

/// Remove one layer of markdown fence and any trailing blank lines.
pub fn strip_fences(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect();
    trim_trailing_blank(&mut lines);

    if lines
        .first()
        .is_some_and(|first| OPENING_FENCE.is_match(first.trim_end()))
    {
        lines.remove(0);
        if lines.last().is_some_and(|last| last.trim_end() == "```") {
            lines.pop();
        }
    } else if lines.len() > 1 && lines.last().is_some_and(|last| last.trim_end() == "```") {
        lines.pop();
    }

    trim_trailing_blank(&mut lines);
    lines
}

/// Fence-stripped text, used when the reply is not in REPLACE form.
pub fn strip_fences_text(text: &str) -> String {
    strip_fences(text).join("\n")
}

/// Drops trailing empty lines. Whitespace-only lines are body content.
fn trim_trailing_blank(lines: &mut Vec<&str>) {
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
}

fn parse_header(line: &str) -> Option<(usize, usize)> {
    let caps = HEADER.captures(line.trim())?;
    let start = caps[1].parse().ok()?;
    let end = caps[2].parse().ok()?;
    Some((start, end))
}

fn excerpt(lines: &[&str]) -> String {
    let first = lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first.chars().count() <= EXCERPT_CHARS {
        first.to_string()
    } else {
        let cut: String = first.chars().take(EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

/// Parse a raw model reply into a [`ParsedEdit`].
pub fn parse_response(text: &str) -> Result<ParsedResponse, ParseError> {
    let lines = strip_fences(text);
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Err(ParseError::Empty);
    }

    let Some((index, (start_line, end_line))) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| parse_header(line).map(|range| (i, range)))
    else {
        return Err(ParseError::MissingHeader {
            excerpt: excerpt(&lines),
        });
    };

    let preamble_lines = lines[..index]
        .iter()
        .filter(|l| !l.trim().is_empty())
        .count();
    if preamble_lines > 0 {
        tracing::debug!("skipped {preamble_lines} preamble line(s) before REPLACE header");
    }

    Ok(ParsedResponse {
        edit: ParsedEdit {
            start_line,
            end_line,
            replacement_lines: lines[index + 1..].iter().map(|l| l.to_string()).collect(),
        },
        preamble_lines,
    })
}
