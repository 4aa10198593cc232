//! Print buffer for evaluated programs
//!
//! `print` never reaches the host's stdout. Everything is appended here and
//! handed back as the `logs` of an execution.

/// Marker appended when output was cut off
pub const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone)]
pub struct PrintBuffer {
    text: String,
    /// Characters stored so far
    chars: usize,
    limit: usize,
    truncated: bool,
}

impl PrintBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
        self.truncated = false;
    }

    /// Append text, dropping whatever exceeds the limit
    pub fn write(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit - self.chars;
        let len = text.chars().count();
        if len <= room {
            self.text.push_str(text);
            self.chars += len;
            return;
        }
        self.text.extend(text.chars().take(room));
        self.chars = self.limit;
        self.truncated = true;
        tracing::debug!(limit = self.limit, "print output truncated");
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.truncated
    }

    /// Captured text, ending with the truncation marker if output was cut
    pub fn contents(&self) -> String {
        if self.truncated {
            format!("{}{}", self.text, TRUNCATION_MARKER)
        } else {
            self.text.clone()
        }
    }
}

impl Default for PrintBuffer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_OUTPUT_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_verbatim() {
        let mut buffer = PrintBuffer::new(100);
        buffer.write("a\n");
        buffer.write("b\n");
        assert_eq!(buffer.contents(), "a\nb\n");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_truncates_at_limit() {
        let mut buffer = PrintBuffer::new(5);
        buffer.write("abc");
        buffer.write("défgh");
        buffer.write("ignored");
        assert!(buffer.is_truncated());
        assert_eq!(buffer.contents(), "abcdé...");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = PrintBuffer::new(2);
        buffer.write("long");
        buffer.clear();
        assert!(buffer.is_empty());
        buffer.write("ok");
        assert_eq!(buffer.contents(), "ok");
    }
}
