use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex as StdMutex;

/// Opaque handle for an editing surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A line within a buffer. Identifies one request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub buffer: BufferId,
    /// 1-indexed.
    pub line: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.buffer, self.line)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EditError {
    #[error("buffer {0} no longer exists")]
    UnknownBuffer(BufferId),
    #[error("invalid range {start}-{end}: end is before start")]
    InvertedRange { start: usize, end: usize },
}

/// The editor side of the world. All line numbers are 1-indexed and ranges are inclusive.
pub trait BufferHost: Send + Sync + 'static {
    /// All lines of the buffer, or `None` if the buffer is gone.
    fn lines(&self, buffer: BufferId) -> Option<Vec<String>>;

    /// Replace lines `start..=end` with `replacement`.
    ///
    /// `end == start - 1` is a pure insertion before `start`.
    fn replace_lines(
        &self,
        buffer: BufferId,
        start: usize,
        end: usize,
        replacement: Vec<String>,
    ) -> Result<(), EditError>;

    fn filename(&self, buffer: BufferId) -> Option<String>;

    fn filetype(&self, buffer: BufferId) -> Option<String>;

    /// Cursor as (line, column), 1-indexed line.
    fn cursor(&self, buffer: BufferId) -> Option<(usize, usize)>;

    fn set_cursor(&self, buffer: BufferId, line: usize, column: usize);

    /// Text of a single line.
    fn line(&self, buffer: BufferId, line: usize) -> Option<String> {
        let lines = self.lines(buffer)?;
        line.checked_sub(1).and_then(|i| lines.get(i).cloned())
    }
}

/// Clamp a model-supplied range onto a buffer of `len` lines.
///
/// Inverted ranges are rejected. A start past the end becomes an append,
/// and an end past the end is cut back to the last line.
pub fn clamp_range(start: usize, end: usize, len: usize) -> Result<(usize, usize), EditError> {
    if end < start {
        return Err(EditError::InvertedRange { start, end });
    }
    let start = start.clamp(1, len + 1);
    let end = end.min(len).max(start - 1);
    Ok((start, end))
}

struct MemoryBuffer {
    name: String,
    filetype: String,
    lines: Vec<String>,
    cursor: (usize, usize),
    changes: u64,
}

/// In-memory buffers for hosts without a real editor.
#[derive(Default)]
pub struct MemoryBuffers {
    inner: StdMutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    buffers: HashMap<BufferId, MemoryBuffer>,
}

impl MemoryBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a buffer from text. Lines are split on `\n`; a single trailing newline is not a line.
    pub fn open(&self, name: &str, filetype: &str, text: &str) -> BufferId {
        let mut lines: Vec<String> = text.split('\n').map(|l| l.to_string()).collect();
        if lines.len() > 1 && lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = BufferId(state.next_id);
        state.buffers.insert(
            id,
            MemoryBuffer {
                name: name.to_string(),
                filetype: filetype.to_string(),
                lines,
                cursor: (1, 0),
                changes: 0,
            },
        );
        id
    }

    pub fn close(&self, buffer: BufferId) {
        self.lock().buffers.remove(&buffer);
    }

    /// Buffer contents joined with `\n`, with a trailing newline.
    pub fn text(&self, buffer: BufferId) -> Option<String> {
        let state = self.lock();
        let buf = state.buffers.get(&buffer)?;
        let mut text = buf.lines.join("\n");
        text.push('\n');
        Some(text)
    }

    /// Overwrite one line, as a user typing would.
    pub fn set_line(&self, buffer: BufferId, line: usize, text: &str) -> bool {
        let mut state = self.lock();
        let Some(buf) = state.buffers.get_mut(&buffer) else {
            return false;
        };
        match line.checked_sub(1).and_then(|i| buf.lines.get_mut(i)) {
            Some(slot) => {
                *slot = text.to_string();
                buf.changes += 1;
                true
            }
            None => false,
        }
    }

    /// Number of modifications since the buffer was opened.
    pub fn change_count(&self, buffer: BufferId) -> u64 {
        self.lock()
            .buffers
            .get(&buffer)
            .map(|b| b.changes)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BufferHost for MemoryBuffers {
    fn lines(&self, buffer: BufferId) -> Option<Vec<String>> {
        self.lock().buffers.get(&buffer).map(|b| b.lines.clone())
    }

    fn replace_lines(
        &self,
        buffer: BufferId,
        start: usize,
        end: usize,
        replacement: Vec<String>,
    ) -> Result<(), EditError> {
        let mut state = self.lock();
        let buf = state
            .buffers
            .get_mut(&buffer)
            .ok_or(EditError::UnknownBuffer(buffer))?;
        let (start, end) = clamp_range(start, end, buf.lines.len())?;
        buf.lines.splice(start - 1..end, replacement);
        buf.changes += 1;
        Ok(())
    }

    fn filename(&self, buffer: BufferId) -> Option<String> {
        self.lock().buffers.get(&buffer).map(|b| b.name.clone())
    }

    fn filetype(&self, buffer: BufferId) -> Option<String> {
        self.lock().buffers.get(&buffer).map(|b| b.filetype.clone())
    }

    fn cursor(&self, buffer: BufferId) -> Option<(usize, usize)> {
        self.lock().buffers.get(&buffer).map(|b| b.cursor)
    }

    fn set_cursor(&self, buffer: BufferId, line: usize, column: usize) {
        if let Some(buf) = self.lock().buffers.get_mut(&buffer) {
            let line = line.clamp(1, buf.lines.len().max(1));
            buf.cursor = (line, column);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(buffers: &MemoryBuffers, id: BufferId) -> Vec<String> {
        buffers.lines(id).unwrap()
    }

    #[test]
    fn open_drops_single_trailing_newline() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "one\ntwo\n");
        assert_eq!(lines(&buffers, id), vec!["one", "two"]);
        assert_eq!(buffers.text(id).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn replace_range_inclusive() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb\nc\nd");
        buffers
            .replace_lines(id, 2, 3, vec!["x".into(), "y".into(), "z".into()])
            .unwrap();
        assert_eq!(lines(&buffers, id), vec!["a", "x", "y", "z", "d"]);
        assert_eq!(buffers.change_count(id), 1);
    }

    #[test]
    fn replace_clamps_end_past_buffer() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb");
        buffers.replace_lines(id, 2, 40, vec!["B".into()]).unwrap();
        assert_eq!(lines(&buffers, id), vec!["a", "B"]);
    }

    #[test]
    fn replace_start_past_end_appends() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb");
        buffers.replace_lines(id, 9, 12, vec!["c".into()]).unwrap();
        assert_eq!(lines(&buffers, id), vec!["a", "b", "c"]);
    }

    #[test]
    fn replace_rejects_inverted_range() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb\nc");
        let err = buffers.replace_lines(id, 3, 1, vec![]).unwrap_err();
        assert_eq!(err, EditError::InvertedRange { start: 3, end: 1 });
        assert_eq!(lines(&buffers, id), vec!["a", "b", "c"]);
        assert_eq!(buffers.change_count(id), 0);
    }

    #[test]
    fn replace_line_zero_treated_as_first() {
        assert_eq!(clamp_range(0, 2, 5).unwrap(), (1, 2));
    }

    #[test]
    fn replace_unknown_buffer() {
        let buffers = MemoryBuffers::new();
        let err = buffers
            .replace_lines(BufferId(99), 1, 1, vec![])
            .unwrap_err();
        assert_eq!(err, EditError::UnknownBuffer(BufferId(99)));
    }

    #[test]
    fn line_lookup_is_one_indexed() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "first\nsecond");
        assert_eq!(buffers.line(id, 1).as_deref(), Some("first"));
        assert_eq!(buffers.line(id, 2).as_deref(), Some("second"));
        assert_eq!(buffers.line(id, 0), None);
        assert_eq!(buffers.line(id, 3), None);
    }

    #[test]
    fn set_line_counts_as_change() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb");
        assert!(buffers.set_line(id, 2, "B"));
        assert!(!buffers.set_line(id, 3, "C"));
        assert_eq!(lines(&buffers, id), vec!["a", "B"]);
        assert_eq!(buffers.change_count(id), 1);
    }

    #[test]
    fn cursor_is_clamped() {
        let buffers = MemoryBuffers::new();
        let id = buffers.open("a.rs", "rust", "a\nb");
        buffers.set_cursor(id, 10, 3);
        assert_eq!(buffers.cursor(id), Some((2, 3)));
    }
}
