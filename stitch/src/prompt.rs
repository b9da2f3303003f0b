use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Built-in prompt. Placeholders are filled by [`render`].
pub const DEFAULT_TEMPLATE: &str = "\
You are editing the file {filename} (filetype: {filetype}).
Line {line} holds an instruction comment:

{line_text}

Instruction: {instruction}

The full file, with line numbers:

{buffer}

Carry out the instruction by replacing a contiguous range of lines, usually the
instruction comment and the code it refers to. Reply with exactly this format
and nothing else:

REPLACE <start_line> <end_line>
<replacement lines>

Line numbers are 1-indexed and inclusive. Do not number the replacement lines.
Do not include the instruction comment in the replacement.";

/// What a prompt is built from.
#[derive(Clone, Debug)]
pub struct PromptContext<'a> {
    pub instruction: &'a str,
    pub filename: &'a str,
    pub filetype: &'a str,
    pub line: usize,
    pub line_text: &'a str,
    pub numbered_buffer: &'a str,
}

#[derive(Debug, thiserror::Error)]
#[error("cannot read prompt template {path}: {source}")]
pub struct TemplateError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Render lines as `<n>| <text>`, numbered from 1.
pub fn numbered_buffer_text(lines: &[String]) -> String {
    let width = lines.len().max(1).to_string().len();
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:>width$}| {}", i + 1, line);
    }
    out
}

/// Fill `{placeholder}`s in `template`. Unknown placeholders are left alone.
pub fn render(template: &str, ctx: &PromptContext<'_>) -> String {
    let line = ctx.line.to_string();
    let values = [
        ("{instruction}", ctx.instruction),
        ("{filename}", ctx.filename),
        ("{filetype}", ctx.filetype),
        ("{line}", line.as_str()),
        ("{line_text}", ctx.line_text),
        ("{buffer}", ctx.numbered_buffer),
    ];

    // Single left-to-right pass so substituted text is never re-expanded.
    let mut out = String::with_capacity(template.len() + ctx.numbered_buffer.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Load a custom template, or the built-in one when `path` is `None`.
pub async fn load_template(path: Option<&Path>) -> Result<String, TemplateError> {
    match path {
        None => Ok(DEFAULT_TEMPLATE.to_string()),
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError {
                path: path.to_path_buf(),
                source,
            }),
    }
}
