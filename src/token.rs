//! Tokens produced by the lexer.
//!
//! A token knows its terminal kind, its matched text, and where in the
//! source it came from. Position fields are optional so synthetic tokens
//! (end-of-input markers, values built by transformers) can exist without
//! them. Equality deliberately ignores positions: two `PLUS` tokens with
//! the value `+` are the same token wherever they occur, which is what
//! error deduplication and test assertions want.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// A single lexed token. `start_pos`/`end_pos` are byte offsets into the
/// source; `line`/`column` are 1-based and count characters, not bytes.
#[derive(Clone, Serialize)]
pub struct Token {
    pub kind: String,
    pub value: String,
    pub start_pos: Option<usize>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub end_line: Option<usize>,
    pub end_column: Option<usize>,
    pub end_pos: Option<usize>,
}

impl Token {
    /// A token with no position information.
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Token {
            kind: kind.into(),
            value: value.into(),
            start_pos: None,
            line: None,
            column: None,
            end_line: None,
            end_column: None,
            end_pos: None,
        }
    }

    /// A fully positioned token. `start` and `end` are `(byte_pos, line,
    /// column)` triples.
    pub fn with_position(
        kind: impl Into<String>,
        value: impl Into<String>,
        start: (usize, usize, usize),
        end: (usize, usize, usize),
    ) -> Self {
        Token {
            kind: kind.into(),
            value: value.into(),
            start_pos: Some(start.0),
            line: Some(start.1),
            column: Some(start.2),
            end_line: Some(end.1),
            end_column: Some(end.2),
            end_pos: Some(end.0),
        }
    }

    /// A token that borrows every position field from `source`. Used when a
    /// stand-in token must point at an existing location, e.g. the
    /// end-of-input marker pointing at the last real token.
    pub fn new_borrow_pos(
        kind: impl Into<String>,
        value: impl Into<String>,
        source: &Token,
    ) -> Self {
        Token {
            kind: kind.into(),
            value: value.into(),
            start_pos: source.start_pos,
            line: source.line,
            column: source.column,
            end_line: source.end_line,
            end_column: source.end_column,
            end_pos: source.end_pos,
        }
    }

    /// A copy with the kind and/or value replaced and all positions kept.
    /// This is how callbacks and the contextual lexer relabel tokens.
    pub fn update(&self, kind: Option<&str>, value: Option<&str>) -> Self {
        let mut token = self.clone();
        if let Some(kind) = kind {
            token.kind = kind.to_string();
        }
        if let Some(value) = value {
            token.value = value.to_string();
        }
        token
    }

    /// Byte length of the matched text.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl Eq for Token {}

/// Value-only comparison, so `token == "+"` reads the way grammars do.
impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        self.value == *other
    }
}

impl PartialEq<Token> for &str {
    fn eq(&self, other: &Token) -> bool {
        other.value == *self
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}, {:?})", self.kind, self.value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
