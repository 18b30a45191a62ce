//! Indentation tokenizer for schema source.
//!
//! Turns the flat source text into a tree of word lists: every non-blank,
//! non-comment line becomes a node, and a line's children are the following
//! lines with strictly greater indentation. The grammar of the words is the
//! compiler's business; this module only deals in structure.

use crate::error::{Result, SchemaError};

/// One schema line and everything nested under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Count of leading space characters.
    pub indent: usize,
    /// Whitespace-split words of the line.
    pub words: Vec<String>,
    /// 1-based source line number.
    pub line: usize,
    /// Lines indented strictly deeper than this one.
    pub children: Vec<Node>,
}

impl Node {
    /// The line's words joined back together, for error messages.
    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}

/// Tokenizes schema source into a list of top-level nodes.
///
/// Comment lines (first non-space character `#`) and blank lines are
/// skipped entirely; they do not affect nesting. Tabs in leading
/// whitespace are an error because the format is space-indented.
pub fn tokenize(source: &str) -> Result<Vec<Node>> {
    // Sentinel frame at indent -1 collects the top-level declarations.
    let sentinel = Node {
        indent: 0,
        words: Vec::new(),
        line: 0,
        children: Vec::new(),
    };
    let mut stack: Vec<(isize, Node)> = vec![(-1, sentinel)];

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() || raw.trim_start().starts_with('#') {
            continue;
        }
        let trimmed = raw.trim_start_matches(' ');
        if trimmed.starts_with('\t') {
            return Err(SchemaError::TabIndentation { line });
        }

        let indent = raw.len() - trimmed.len();
        let node = Node {
            indent,
            words: trimmed.split_whitespace().map(str::to_string).collect(),
            line,
            children: Vec::new(),
        };

        // Close every scope at the same or deeper indentation.
        while stack.last().map(|(i, _)| *i >= indent as isize).unwrap_or(false) {
            let (_, closed) = stack.pop().expect("sentinel guards the stack bottom");
            stack
                .last_mut()
                .expect("sentinel guards the stack bottom")
                .1
                .children
                .push(closed);
        }
        stack.push((indent as isize, node));
    }

    // Drain remaining open scopes into their parents.
    while stack.len() > 1 {
        let (_, closed) = stack.pop().expect("len checked");
        stack.last_mut().expect("len checked").1.children.push(closed);
    }

    let (_, sentinel) = stack.pop().expect("sentinel always present");
    Ok(sentinel.children)
}
