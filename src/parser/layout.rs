//! Indentation layout pass
//!
//! The pest grammar is not indentation aware, so source text is first
//! rewritten into a marked form: one logical line per `\n`, block openings
//! prefixed with [`INDENT`], block closings prefixed with [`DEDENT`].
//! Comments and blank lines are dropped, newlines inside brackets and after
//! a backslash continuation are folded into spaces. A line map records the
//! original line number of every output line so parse errors can point at
//! the user's source.

use crate::error::{Result, SafepyError};

pub const INDENT: char = '\u{1}';
pub const DEDENT: char = '\u{2}';

/// Maximum bracket nesting, matching CPython's parser limit
pub const MAX_BRACKET_DEPTH: usize = 200;
/// Longest run of prefix operators (`- - x`, `not not x`)
pub const MAX_PREFIX_RUN: usize = 100;
/// Right-recursive constructs (`**`, `lambda`, `else`) per logical line
pub const MAX_CHAIN_PER_LINE: usize = 300;

#[derive(Debug, Clone)]
pub struct Layout {
    pub text: String,
    /// Original 1-based line number for each output line
    lines: Vec<usize>,
    /// Byte offset where each output line starts
    starts: Vec<usize>,
}

impl Layout {
    /// Source line for a byte offset into [`Layout::text`]
    pub fn line_for_offset(&self, offset: usize) -> usize {
        let output_line = self.starts.partition_point(|&start| start <= offset);
        self.source_line(output_line)
    }

    /// Map a 1-based output line back to the 1-based source line
    pub fn source_line(&self, output_line: usize) -> usize {
        let index = output_line.saturating_sub(1);
        self.lines
            .get(index)
            .or_else(|| self.lines.last())
            .copied()
            .unwrap_or(1)
    }
}

pub fn layout(source: &str) -> Result<Layout> {
    let normalized = source.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.contains(INDENT) || normalized.contains(DEDENT) {
        return Err(SafepyError::SyntaxRestriction(
            "source contains control characters U+0001/U+0002".to_string(),
        ));
    }
    let mut scanner = Scanner::new(&normalized);
    scanner.run()?;
    let starts = std::iter::once(0)
        .chain(scanner.out.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    Ok(Layout {
        text: scanner.out,
        lines: scanner.lines,
        starts,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    /// Start of a logical line, an operator, an open bracket or a comma
    Operator,
    /// A name, literal or closing bracket
    Operand,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    out: String,
    lines: Vec<usize>,
    at_output_line_start: bool,
    indents: Vec<usize>,
    brackets: usize,
    last: Last,
    prefix_run: usize,
    chain: usize,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            out: String::with_capacity(source.len() + 16),
            lines: Vec::new(),
            at_output_line_start: true,
            indents: vec![0],
            brackets: 0,
            last: Last::Operator,
            prefix_run: 0,
            chain: 0,
        }
    }

    fn error(&self, message: &str) -> SafepyError {
        SafepyError::SyntaxRestriction(message.to_string()).at_line(self.line)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn emit(&mut self, c: char) {
        if self.at_output_line_start {
            self.lines.push(self.line);
            self.at_output_line_start = false;
        }
        self.out.push(c);
        if c == '\n' {
            self.at_output_line_start = true;
        }
    }

    fn run(&mut self) -> Result<()> {
        while self.pos < self.chars.len() {
            if !self.start_line()? {
                continue;
            }
            self.scan_logical_line()?;
        }
        if !self.at_output_line_start {
            self.emit('\n');
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.emit(DEDENT);
        }
        Ok(())
    }

    /// Measure indentation and emit block markers. Returns false for blank
    /// and comment-only lines, which produce no output.
    fn start_line(&mut self) -> Result<bool> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0C' => width = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.emit(INDENT);
        } else if width < current {
            while self.indents.last().copied().unwrap_or(0) > width {
                self.indents.pop();
                self.emit(DEDENT);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn scan_logical_line(&mut self) -> Result<()> {
        self.last = Last::Operator;
        self.prefix_run = 0;
        self.chain = 0;

        while let Some(c) = self.peek(0) {
            match c {
                '#' => self.skip_comment(),
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.brackets > 0 {
                        self.emit(' ');
                    } else {
                        self.emit('\n');
                        return Ok(());
                    }
                }
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                    self.emit(' ');
                }
                '\'' | '"' => {
                    self.scan_string(c)?;
                    self.operand();
                }
                '(' | '[' | '{' => {
                    self.brackets += 1;
                    if self.brackets > MAX_BRACKET_DEPTH {
                        return Err(self.error("too many nested parentheses"));
                    }
                    self.pos += 1;
                    self.emit(c);
                    self.operator();
                }
                ')' | ']' | '}' => {
                    self.brackets = self.brackets.saturating_sub(1);
                    self.pos += 1;
                    self.emit(c);
                    self.operand();
                }
                c if c == '_' || c.is_alphanumeric() => self.scan_word()?,
                ' ' | '\t' | '\x0C' => {
                    self.pos += 1;
                    self.emit(c);
                }
                '*' if self.peek(1) == Some('*') => {
                    self.pos += 2;
                    self.emit('*');
                    self.emit('*');
                    self.bump_chain()?;
                    self.operator();
                }
                '-' | '+' | '~' => {
                    self.pos += 1;
                    self.emit(c);
                    if self.last == Last::Operator {
                        self.bump_prefix()?;
                    } else {
                        self.operator();
                    }
                }
                _ => {
                    self.pos += 1;
                    self.emit(c);
                    self.operator();
                }
            }
        }
        Ok(())
    }

    fn operand(&mut self) {
        self.last = Last::Operand;
        self.prefix_run = 0;
    }

    fn operator(&mut self) {
        self.last = Last::Operator;
        self.prefix_run = 0;
    }

    fn bump_prefix(&mut self) -> Result<()> {
        self.prefix_run += 1;
        if self.prefix_run > MAX_PREFIX_RUN {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn bump_chain(&mut self) -> Result<()> {
        self.chain += 1;
        if self.chain > MAX_CHAIN_PER_LINE {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn scan_word(&mut self) -> Result<()> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c == '_' || c.is_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        // A string prefix such as r"..." or f'...'
        if matches!(self.peek(0), Some('\'' | '"')) && is_string_prefix(&word) {
            word.chars().for_each(|c| self.emit(c));
            let quote = self.peek(0).unwrap_or('"');
            self.scan_string(quote)?;
            self.operand();
            return Ok(());
        }

        word.chars().for_each(|c| self.emit(c));
        match word.as_str() {
            "not" => {
                let run = self.prefix_run;
                self.operator();
                self.prefix_run = run;
                self.bump_prefix()?;
            }
            "lambda" | "else" => {
                self.bump_chain()?;
                self.operator();
            }
            "and" | "or" | "in" | "is" | "if" | "return" | "yield" | "await" => self.operator(),
            _ => self.operand(),
        }
        Ok(())
    }

    fn scan_string(&mut self, quote: char) -> Result<()> {
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let start_line = self.line;
        let width = if triple { 3 } else { 1 };
        for _ in 0..width {
            self.emit(quote);
        }
        self.pos += width;

        loop {
            let Some(c) = self.peek(0) else {
                let message = if triple {
                    format!(
                        "unterminated triple-quoted string literal (detected at line {})",
                        self.line
                    )
                } else {
                    "unterminated string literal".to_string()
                };
                return Err(SafepyError::SyntaxRestriction(message).at_line(start_line));
            };
            match c {
                '\\' => {
                    self.emit('\\');
                    self.pos += 1;
                    if let Some(next) = self.peek(0) {
                        if next == '\n' {
                            self.line += 1;
                        }
                        self.emit(next);
                        self.pos += 1;
                    }
                }
                '\n' if !triple => {
                    return Err(SafepyError::SyntaxRestriction(
                        "unterminated string literal".to_string(),
                    )
                    .at_line(start_line));
                }
                '\n' => {
                    self.line += 1;
                    self.emit('\n');
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.emit(c);
                        self.pos += 1;
                        return Ok(());
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        for _ in 0..3 {
                            self.emit(quote);
                        }
                        self.pos += 3;
                        return Ok(());
                    }
                    self.emit(c);
                    self.pos += 1;
                }
                _ => {
                    self.emit(c);
                    self.pos += 1;
                }
            }
        }
    }
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "f" | "b" | "rb" | "br" | "fr" | "rf"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(source: &str) -> String {
        layout(source)
            .unwrap()
            .text
            .replace(INDENT, "<I>")
            .replace(DEDENT, "<D>")
    }

    #[test]
    fn test_blocks_get_markers() {
        let text = marked("if x:\n    y = 1\nz = 2\n");
        assert_eq!(text, "if x:\n<I>y = 1\n<D>z = 2\n");
    }

    #[test]
    fn test_dedents_closed_at_end() {
        let text = marked("def f():\n    if a:\n        return 1");
        assert_eq!(text, "def f():\n<I>if a:\n<I>return 1\n<D><D>");
    }

    #[test]
    fn test_comments_and_blank_lines_dropped() {
        let out = layout("# header\n\nx = 1  # trailing\n\n\ny = '#not a comment'\n").unwrap();
        assert_eq!(out.text, "x = 1  \ny = '#not a comment'\n");
        assert_eq!(out.source_line(1), 3);
        assert_eq!(out.source_line(2), 6);
    }

    #[test]
    fn test_brackets_join_lines() {
        let out = layout("total = sum([\n    1,\n    2,\n])\nprint(total)\n").unwrap();
        assert!(out.text.starts_with("total = sum([     1,     2, ])\n"));
        assert_eq!(out.source_line(2), 5);
    }

    #[test]
    fn test_triple_quoted_string_keeps_newlines() {
        let out = layout("s = '''a\nb'''\nx = 1\n").unwrap();
        assert_eq!(out.text, "s = '''a\nb'''\nx = 1\n");
        assert_eq!(out.source_line(3), 3);
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let err = layout("x = 'abc\n").unwrap_err();
        assert!(err.to_string().contains("unterminated string literal"));
    }

    #[test]
    fn test_bad_dedent_rejected() {
        let err = layout("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.to_string().contains("unindent does not match"));
    }

    #[test]
    fn test_bracket_depth_limit() {
        let source = format!("x = {}1{}", "(".repeat(250), ")".repeat(250));
        let err = layout(&source).unwrap_err();
        assert!(err.to_string().contains("too many nested parentheses"));
    }

    #[test]
    fn test_prefix_operator_run_limit() {
        let source = format!("x = {}1", "- ".repeat(150));
        assert!(layout(&source).is_err());
        assert!(layout("x = [-1, -2, -3, -4] * 2 - -3").is_ok());
    }

    #[test]
    fn test_line_for_offset() {
        let out = layout("a = 1\n\n\nb = 2\n").unwrap();
        let offset = out.text.find('b').unwrap();
        assert_eq!(out.line_for_offset(0), 1);
        assert_eq!(out.line_for_offset(offset), 4);
    }

    #[test]
    fn test_backslash_continuation() {
        let text = marked("x = 1 + \\\n    2\n");
        assert_eq!(text, "x = 1 +      2\n");
    }
}
