//! Step-by-step parsing: a paused parse the caller drives one token at a
//! time.
//!
//! An [`InteractiveParser`] owns a [`ParserState`] and the [`LexerThread`]
//! positioned where the parse left off. It is handed out in two ways: from
//! [`LalrParser::parse_interactive`](crate::parser::LalrParser::parse_interactive)
//! before any input is consumed, and inside unexpected-input errors as the
//! checkpoint of a failed parse. Cloning it forks the parse; feeding it
//! advances only that fork. [`ImmutableInteractiveParser`] is the
//! persistent view, where every feed returns a new parser and the original
//! stays valid.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::lexer::LexerThread;
use crate::parser::{looks_terminal, parse_from_state, Action, ParserState};
use crate::tree::Branch;
use crate::{SkeinError, Token};

/// A parse suspended between tokens.
#[derive(Clone)]
pub struct InteractiveParser {
    state: ParserState,
    lexer: LexerThread,
    /// The final value, once an accepting feed has produced one.
    pub result: Option<Branch>,
}

impl InteractiveParser {
    pub fn new(state: ParserState, lexer: LexerThread) -> Self {
        InteractiveParser { state, lexer, result: None }
    }

    /// Feeds one token to the parser. End-of-input is signaled by feeding a
    /// `$END` token; the accepting feed returns the final value and records
    /// it in `result`. A failed feed leaves the parser unchanged, so a
    /// different token can be tried.
    pub fn feed_token(&mut self, token: Token) -> Result<Option<Branch>, SkeinError> {
        let is_end = token.kind == "$END";
        let value = self.state.feed_token(token, is_end)?;
        if value.is_some() {
            self.result = value.clone();
        }
        Ok(value)
    }

    /// Feeds the `$END` token, pointing it at the last lexed token's
    /// position (or the start of input when nothing was lexed).
    pub fn feed_eof(&mut self) -> Result<Option<Branch>, SkeinError> {
        let eof = match &self.lexer.state.last_token {
            Some(prev) => Token::new_borrow_pos("$END", "", prev),
            None => {
                let mut token = Token::new("$END", "");
                token.start_pos = Some(0);
                token.line = Some(1);
                token.column = Some(1);
                token
            }
        };
        self.feed_token(eof)
    }

    fn step(&mut self) -> Result<Option<Token>, SkeinError> {
        let mark = self.state.mark();
        match self.lexer.next_token(Some(mark))? {
            Some(token) => {
                let value = self.state.feed_token(token.clone(), false)?;
                if value.is_some() {
                    self.result = value;
                }
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    /// Lexes and feeds one token per item, yielding each token after it was
    /// fed. Ends when the input does, without feeding `$END`. Stop on the
    /// first `Err`; pulling again would retry the same failed step.
    pub fn iter_parse(&mut self) -> impl Iterator<Item = Result<Token, SkeinError>> + '_ {
        std::iter::from_fn(move || self.step().transpose())
    }

    /// Feeds the rest of the lexer's tokens and returns them. `$END` is not
    /// fed; follow with [`feed_eof`](Self::feed_eof) to finish the parse.
    pub fn exhaust_lexer(&mut self) -> Result<Vec<Token>, SkeinError> {
        let mut consumed = Vec::new();
        while let Some(token) = self.step()? {
            consumed.push(token);
        }
        Ok(consumed)
    }

    /// Runs the parse to completion from here, consuming the parser. Errors
    /// carry a fresh checkpoint, so a failed resume can be resumed again.
    pub fn resume_parse(self) -> Result<Branch, SkeinError> {
        let last_token = self.lexer.state.last_token.clone();
        parse_from_state(self.state, self.lexer, last_token)
    }

    /// The terminals that would actually advance the parse from here,
    /// sorted. Each candidate from [`choices`](Self::choices) is probed
    /// against a throwaway clone with callbacks suppressed, so reductions
    /// triggered by the probe have no side effects.
    pub fn accepts(&self) -> Vec<String> {
        let row = match self.state.conf.table.states.get(self.state.position()) {
            Some(row) => row,
            None => return Vec::new(),
        };
        let mut candidates: Vec<&String> = row.keys().filter(|name| looks_terminal(name)).collect();
        candidates.sort();
        let mut accepted = Vec::new();
        for name in candidates {
            let mut probe = self.state.clone();
            let token = Token::new(name.clone(), "");
            if probe.probe_token(token, name == "$END").is_ok() {
                accepted.push(name.clone());
            }
        }
        accepted
    }

    /// The raw action row of the current state: terminals and rule origins
    /// (gotos) alike. [`accepts`](Self::accepts) is the filtered, verified
    /// version.
    pub fn choices(&self) -> HashMap<String, Action> {
        self.state
            .conf
            .table
            .states
            .get(self.state.position())
            .cloned()
            .unwrap_or_default()
    }

    /// A readable dump of `choices` and the stack depth, for debugging
    /// grammars from inside an error handler.
    pub fn pretty(&self) -> String {
        let choices = self.choices();
        let mut names: Vec<&String> = choices.keys().collect();
        names.sort();
        let mut out = vec!["Parser choices:".to_string()];
        for name in names {
            out.push(format!("\t- {} -> {:?}", name, choices[name]));
        }
        out.push(format!("stack size: {}", self.state.stack_depth()));
        out.join("\n")
    }

    /// The lexer's current character offset into the input.
    pub fn lexer_position(&self) -> usize {
        self.lexer.position()
    }

    /// Freezes this parser into the persistent interface.
    pub fn as_immutable(self) -> ImmutableInteractiveParser {
        ImmutableInteractiveParser { inner: self }
    }

    /// Steps the lexer past one character without feeding anything, so a
    /// resumed parse does not re-hit the same unlexable input.
    pub(crate) fn skip_input_char(&mut self) {
        let text = Rc::clone(&self.lexer.state.text);
        let pos = self.lexer.state.line_ctr.char_pos;
        if let Some(c) = text[pos..].chars().next() {
            self.lexer.state.line_ctr.feed(&text[pos..pos + c.len_utf8()], true);
        }
    }
}

/// Two parsers compare equal when they would behave identically on the
/// next feed: same stack shape, same place in the input.
impl PartialEq for InteractiveParser {
    fn eq(&self, other: &Self) -> bool {
        self.state.mark() == other.state.mark() && self.lexer.position() == other.lexer.position()
    }
}

impl fmt::Debug for InteractiveParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveParser")
            .field("state", &self.state.mark())
            .field("lexer_pos", &self.lexer.position())
            .finish()
    }
}

/// The persistent counterpart of [`InteractiveParser`]: feeding returns a
/// new parser and never mutates the receiver, so earlier positions remain
/// usable as backtrack points.
#[derive(Clone)]
pub struct ImmutableInteractiveParser {
    inner: InteractiveParser,
}

impl ImmutableInteractiveParser {
    /// Feeds one token to a copy and returns the advanced parser.
    pub fn feed_token(&self, token: Token) -> Result<ImmutableInteractiveParser, SkeinError> {
        let mut next = self.inner.clone();
        next.feed_token(token)?;
        Ok(ImmutableInteractiveParser { inner: next })
    }

    pub fn feed_eof(&self) -> Result<ImmutableInteractiveParser, SkeinError> {
        let mut next = self.inner.clone();
        next.feed_eof()?;
        Ok(ImmutableInteractiveParser { inner: next })
    }

    /// Feeds the rest of the input to a copy. The consumed tokens are
    /// discarded; use the mutable interface to observe them.
    pub fn exhaust_lexer(&self) -> Result<ImmutableInteractiveParser, SkeinError> {
        let mut next = self.inner.clone();
        next.exhaust_lexer()?;
        Ok(ImmutableInteractiveParser { inner: next })
    }

    /// The final value, present once an accepting feed has happened.
    pub fn result(&self) -> Option<&Branch> {
        self.inner.result.as_ref()
    }

    pub fn accepts(&self) -> Vec<String> {
        self.inner.accepts()
    }

    pub fn choices(&self) -> HashMap<String, Action> {
        self.inner.choices()
    }

    pub fn pretty(&self) -> String {
        self.inner.pretty()
    }

    /// A mutable copy starting from this position.
    pub fn as_mutable(&self) -> InteractiveParser {
        self.inner.clone()
    }
}

impl PartialEq for ImmutableInteractiveParser {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl fmt::Debug for ImmutableInteractiveParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableInteractiveParser").field("inner", &self.inner).finish()
    }
}
