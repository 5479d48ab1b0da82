//! Leak suppressions.
//!
//! A suppression file has one rule per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! leak:libfontconfig
//! leak:^my_crate::cache::
//! leak:*::intern$
//! ```
//!
//! A pattern matches a frame when it matches the frame's function name,
//! source file, or module path. `*` matches any run of characters, a leading
//! `^` anchors at the start and a trailing `$` at the end; an unanchored
//! pattern may match anywhere. A leak is suppressed when any frame of its
//! allocation stack matches any rule.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::symbolize::SymbolizedFrame;

/// The only suppression type understood.
pub const LEAK_SUPPRESSION: &str = "leak";

/// Errors loading suppressions.
#[derive(Debug, Error)]
pub enum SuppressionError {
    /// The file could not be read.
    #[error("failed to read suppressions from {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A line has no `type:` prefix.
    #[error("line {line}: expected '<type>:<pattern>'")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },
    /// A line uses a type other than `leak`.
    #[error("line {line}: unsupported suppression type '{kind}'")]
    UnsupportedType {
        /// 1-based line number.
        line: usize,
        /// The type given.
        kind: String,
    },
    /// The pattern after `leak:` is empty.
    #[error("line {line}: empty suppression pattern")]
    EmptyPattern {
        /// 1-based line number.
        line: usize,
    },
}

/// One rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppression {
    /// The pattern as written.
    pub pattern: String,
}

impl Suppression {
    /// Create a rule.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Whether the rule matches `frame`.
    pub fn matches_frame(&self, frame: &SymbolizedFrame) -> bool {
        frame.names().any(|name| template_match(&self.pattern, name))
    }
}

/// An ordered set of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionContext {
    rules: Vec<Suppression>,
}

impl SuppressionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse suppression text.
    pub fn parse(text: &str) -> Result<Self, SuppressionError> {
        let mut context = Self::new();
        context.add_text(text)?;
        Ok(context)
    }

    /// Load a suppression file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SuppressionError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SuppressionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse more rules and append them.
    pub fn add_text(&mut self, text: &str) -> Result<(), SuppressionError> {
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (kind, pattern) = trimmed
                .split_once(':')
                .ok_or(SuppressionError::Malformed { line })?;
            let kind = kind.trim();
            if kind != LEAK_SUPPRESSION {
                return Err(SuppressionError::UnsupportedType {
                    line,
                    kind: kind.to_string(),
                });
            }
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return Err(SuppressionError::EmptyPattern { line });
            }
            self.rules.push(Suppression::new(pattern));
        }
        Ok(())
    }

    /// Append one rule.
    pub fn add(&mut self, pattern: impl Into<String>) {
        self.rules.push(Suppression::new(pattern));
    }

    /// The rules in order.
    pub fn rules(&self) -> &[Suppression] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index of the first rule matching any of `frames`.
    pub fn match_frames(&self, frames: &[SymbolizedFrame]) -> Option<usize> {
        if self.rules.is_empty() {
            return None;
        }
        frames
            .iter()
            .find_map(|frame| self.rules.iter().position(|rule| rule.matches_frame(frame)))
    }
}

/// Match `text` against a suppression template.
pub fn template_match(template: &str, text: &str) -> bool {
    let (anchor_start, rest) = match template.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, template),
    };
    let (anchor_end, body) = match rest.strip_suffix('$') {
        Some(body) => (true, body),
        None => (false, rest),
    };
    let parts: Vec<&str> = body.split('*').collect();
    let last = parts.len() - 1;

    if last == 0 && anchor_start && anchor_end {
        return text == body;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        let remaining = &text[pos..];
        if i == 0 && anchor_start {
            if !remaining.starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == last && anchor_end {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(offset) => pos += offset + part.len(),
                None => return false,
            }
        }
    }
    true
}
