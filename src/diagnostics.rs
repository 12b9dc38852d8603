//! Unified, `miette`-based diagnostics for the skein runtime.
//!
//! Every failure mode of the pipeline is a variant of [`SkeinError`]: setup
//! failures (`Configuration`, `LexBuild`, `Grammar`, `MalformedTable`), the
//! three unexpected-input errors raised while consuming text
//! (`UnexpectedCharacters`, `UnexpectedToken`, `UnexpectedEof`), and the
//! transform-time wrapper (`Visit`).
//!
//! Unexpected-input errors carry structured data first (position, offending
//! token or char, the expected set, a [`StateMark`]) and rendering context
//! second: an [`ErrorContext`] holding the source text and span that `miette`
//! turns into a labeled report. They also own an [`InteractiveParser`]
//! checkpoint when raised from a running parse; the checkpoint powers error
//! recovery and, for `UnexpectedToken`, the lazily computed `accepts` set.
//!
//! Use `err_msg!` for message-only errors and `err_ctx!` when a source and
//! span are at hand; constructing `ErrorContext` manually is rarely needed.

use std::sync::Arc;

use miette::{Diagnostic, LabeledSpan, NamedSource, SourceCode};
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::interactive::InteractiveParser;
use crate::token::Token;
use crate::tree::Tree;

pub type SourceArc = Arc<NamedSource<String>>;

/// A half-open byte range into the source text.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn point(pos: usize) -> Self {
        Span { start: pos, end: pos }
    }

    fn label_len(&self) -> usize {
        if self.end > self.start {
            self.end - self.start
        } else {
            1
        }
    }
}

/// A single additional label for multi-span diagnostics.
#[derive(Debug)]
pub struct RelatedLabel {
    pub span: Span,
    pub label: String,
}

/// Minimal, composable error context for diagnostics.
#[derive(Debug, Default)]
pub struct ErrorContext {
    /// The source text this error points into (if any).
    pub source: Option<SourceArc>,
    /// The primary span for this error (if any).
    pub span: Option<Span>,
    /// An optional help message.
    pub help: Option<String>,
    /// Additional labeled spans.
    pub related: Vec<RelatedLabel>,
}

impl ErrorContext {
    /// Returns an empty error context (no source, span, or help).
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a context with both source and span.
    pub fn with_source_and_span(source: SourceArc, span: Span) -> Self {
        Self {
            source: Some(source),
            span: Some(span),
            help: None,
            related: vec![],
        }
    }
}

/// The equality view of a parser state used by error classification: stack
/// depth plus the state id on top. Two failures whose marks compare equal
/// are failures "in the same place" for `match_examples` and for the
/// recovery loop's termination guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateMark {
    pub depth: usize,
    pub state: usize,
}

/// Unified error type for all skein failure modes.
#[derive(Debug, Error)]
pub enum SkeinError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, ctx: ErrorContext },

    #[error("Lexer build error: {message}")]
    LexBuild { message: String, ctx: ErrorContext },

    #[error("Grammar error: {message}")]
    Grammar { message: String, ctx: ErrorContext },

    #[error("Malformed parser table: {message}")]
    MalformedTable { message: String, ctx: ErrorContext },

    /// No terminal matched at the current position.
    #[error("No terminal matches {found:?} at line {line} column {column}")]
    UnexpectedCharacters {
        pos: usize,
        line: usize,
        column: usize,
        found: char,
        /// Terminal names the scanner could have produced here.
        allowed: Vec<String>,
        /// The token lexed immediately before the failure.
        token_history: Option<Token>,
        state: Option<StateMark>,
        /// Checkpoint of the parse at the failure, if one was attached.
        interactive: Option<Box<InteractiveParser>>,
        ctx: ErrorContext,
    },

    /// A lexically valid token with no action in the current parser state.
    #[error("Unexpected token {token:?}")]
    UnexpectedToken {
        token: Token,
        /// Terminal names with an action in the failing state's row, sorted.
        expected: Vec<String>,
        state: Option<StateMark>,
        /// Checkpoint of the parse at the failure, if one was attached.
        interactive: Option<Box<InteractiveParser>>,
        /// Lazily computed set of terminals that would actually advance the
        /// checkpoint; preferred over `expected` in reports when present.
        accepts: OnceCell<Vec<String>>,
        ctx: ErrorContext,
    },

    /// The synthetic end-of-input feed found no action.
    #[error("Unexpected end of input")]
    UnexpectedEof {
        token: Token,
        expected: Vec<String>,
        state: Option<StateMark>,
        interactive: Option<Box<InteractiveParser>>,
        ctx: ErrorContext,
    },

    /// A transformer or visitor callback failed; the grammar-level cause is
    /// preserved underneath.
    #[error("Transform error in rule '{rule}'")]
    Visit {
        rule: String,
        node: Box<Tree>,
        #[source]
        cause: Box<SkeinError>,
        ctx: ErrorContext,
    },
}

impl SkeinError {
    fn get_ctx(&self) -> &ErrorContext {
        match self {
            SkeinError::Configuration { ctx, .. }
            | SkeinError::LexBuild { ctx, .. }
            | SkeinError::Grammar { ctx, .. }
            | SkeinError::MalformedTable { ctx, .. }
            | SkeinError::UnexpectedCharacters { ctx, .. }
            | SkeinError::UnexpectedToken { ctx, .. }
            | SkeinError::UnexpectedEof { ctx, .. }
            | SkeinError::Visit { ctx, .. } => ctx,
        }
    }

    fn get_ctx_mut(&mut self) -> &mut ErrorContext {
        match self {
            SkeinError::Configuration { ctx, .. }
            | SkeinError::LexBuild { ctx, .. }
            | SkeinError::Grammar { ctx, .. }
            | SkeinError::MalformedTable { ctx, .. }
            | SkeinError::UnexpectedCharacters { ctx, .. }
            | SkeinError::UnexpectedToken { ctx, .. }
            | SkeinError::UnexpectedEof { ctx, .. }
            | SkeinError::Visit { ctx, .. } => ctx,
        }
    }

    /// True for the three errors raised while consuming input, i.e. the ones
    /// the recovery loop and `match_examples` know how to handle.
    pub fn is_unexpected_input(&self) -> bool {
        matches!(
            self,
            SkeinError::UnexpectedCharacters { .. }
                | SkeinError::UnexpectedToken { .. }
                | SkeinError::UnexpectedEof { .. }
        )
    }

    /// The offending token, where the failure has one. `UnexpectedEof`
    /// reports the synthetic end token.
    pub fn token(&self) -> Option<&Token> {
        match self {
            SkeinError::UnexpectedToken { token, .. } | SkeinError::UnexpectedEof { token, .. } => {
                Some(token)
            }
            _ => None,
        }
    }

    /// The parser-state mark recorded at the failure, if any.
    pub fn state_mark(&self) -> Option<StateMark> {
        match self {
            SkeinError::UnexpectedCharacters { state, .. }
            | SkeinError::UnexpectedToken { state, .. }
            | SkeinError::UnexpectedEof { state, .. } => *state,
            _ => None,
        }
    }

    /// Attaches the source text the error points into.
    pub fn with_source(mut self, source: SourceArc) -> Self {
        self.get_ctx_mut().source = Some(source);
        self
    }

    /// Attaches the primary span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.get_ctx_mut().span = Some(span);
        self
    }

    /// Stores a parse checkpoint inside an unexpected-input error.
    pub fn set_interactive(&mut self, parser: InteractiveParser) {
        match self {
            SkeinError::UnexpectedCharacters { interactive, .. }
            | SkeinError::UnexpectedToken { interactive, .. }
            | SkeinError::UnexpectedEof { interactive, .. } => {
                *interactive = Some(Box::new(parser));
            }
            _ => {}
        }
    }

    /// Removes and returns the checkpoint, leaving the error intact.
    pub fn take_interactive(&mut self) -> Option<Box<InteractiveParser>> {
        match self {
            SkeinError::UnexpectedCharacters { interactive, .. }
            | SkeinError::UnexpectedToken { interactive, .. }
            | SkeinError::UnexpectedEof { interactive, .. } => interactive.take(),
            _ => None,
        }
    }

    /// A borrow of the checkpoint, if present.
    pub fn interactive(&self) -> Option<&InteractiveParser> {
        match self {
            SkeinError::UnexpectedCharacters { interactive, .. }
            | SkeinError::UnexpectedToken { interactive, .. }
            | SkeinError::UnexpectedEof { interactive, .. } => interactive.as_deref(),
            _ => None,
        }
    }

    /// For `UnexpectedToken`: the set of terminals that would actually
    /// advance the parse, probed on the stored checkpoint and cached on
    /// first use. `None` when no checkpoint was attached.
    pub fn accepts(&self) -> Option<&[String]> {
        match self {
            SkeinError::UnexpectedToken { interactive, accepts, .. } => {
                if let Some(cached) = accepts.get() {
                    return Some(cached);
                }
                let probe = interactive.as_ref()?;
                let computed = probe.accepts();
                Some(accepts.get_or_init(|| computed))
            }
            _ => None,
        }
    }

    /// Replays a list of labeled malformed inputs through `parse_fn` and
    /// returns the label whose failure best matches this one: same state
    /// mark and equal token is an exact hit; with `token_kind_fallback`,
    /// same state and same token kind is a strong candidate; the first
    /// example that fails in the same state is the weak fallback.
    pub fn match_examples<'a, L, F, T>(
        &self,
        mut parse_fn: F,
        examples: &'a [(L, Vec<&str>)],
        token_kind_fallback: bool,
    ) -> Option<&'a L>
    where
        F: FnMut(&str) -> Result<T, SkeinError>,
    {
        let own_mark = self.state_mark()?;
        let mut candidate: Option<&'a L> = None;
        let mut candidate_is_strong = false;
        for (label, samples) in examples {
            for malformed in samples {
                let err = match parse_fn(malformed) {
                    Ok(_) => continue,
                    Err(e) => e,
                };
                if !err.is_unexpected_input() {
                    continue;
                }
                if err.state_mark() == Some(own_mark) {
                    if let (Some(theirs), Some(ours)) = (err.token(), self.token()) {
                        if theirs == ours {
                            return Some(label);
                        }
                        if token_kind_fallback && theirs.kind == ours.kind && !candidate_is_strong {
                            candidate = Some(label);
                            candidate_is_strong = true;
                        }
                    }
                    if candidate.is_none() {
                        candidate = Some(label);
                    }
                }
            }
        }
        candidate
    }

    fn expected_help(&self) -> Option<String> {
        let list: &[String] = match self {
            SkeinError::UnexpectedCharacters { allowed, .. } => allowed,
            SkeinError::UnexpectedToken { expected, .. } => {
                self.accepts().unwrap_or(expected.as_slice())
            }
            SkeinError::UnexpectedEof { expected, .. } => expected,
            _ => return None,
        };
        if list.is_empty() {
            return None;
        }
        Some(format!("Expected one of: {}", list.join(", ")))
    }

    fn primary_label(&self) -> String {
        match self {
            SkeinError::Configuration { message, .. }
            | SkeinError::LexBuild { message, .. }
            | SkeinError::Grammar { message, .. }
            | SkeinError::MalformedTable { message, .. } => message.clone(),
            SkeinError::UnexpectedCharacters { .. } => "no terminal matches this input".to_string(),
            SkeinError::UnexpectedToken { token, .. } => {
                format!("unexpected {}", token.kind)
            }
            SkeinError::UnexpectedEof { .. } => "input ended here".to_string(),
            SkeinError::Visit { rule, .. } => format!("while transforming '{rule}'"),
        }
    }
}

impl Diagnostic for SkeinError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        None
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        if let Some(help) = self.expected_help() {
            return Some(Box::new(help) as Box<dyn std::fmt::Display + 'a>);
        }
        self.get_ctx()
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn std::fmt::Display + 'a>)
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        self.get_ctx()
            .source
            .as_ref()
            .map(|s| s.as_ref() as &dyn SourceCode)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let ctx = self.get_ctx();
        let mut labels = Vec::new();
        if let Some(span) = ctx.span {
            labels.push(LabeledSpan::new(
                Some(self.primary_label()),
                span.start,
                span.label_len(),
            ));
        }
        for rel in &ctx.related {
            labels.push(LabeledSpan::new(
                Some(rel.label.clone()),
                rel.span.start,
                rel.span.label_len(),
            ));
        }
        if labels.is_empty() {
            None
        } else {
            Some(Box::new(labels.into_iter()))
        }
    }
}

/// Wraps a source string into an `Arc<NamedSource<String>>` for error contexts.
pub fn to_error_source<S: AsRef<str>>(source: S) -> SourceArc {
    Arc::new(NamedSource::new("input", source.as_ref().to_string()))
}

/// Constructs a [`SkeinError`] setup variant with a formatted message and no
/// context. Only the four message-shaped variants are valid here.
#[macro_export]
macro_rules! err_msg {
    ($variant:ident, $($arg:tt)*) => {
        $crate::SkeinError::$variant {
            message: format!($($arg)*),
            ctx: $crate::ErrorContext::none(),
        }
    };
}

/// Constructs a [`SkeinError`] setup variant with a message, source, and span.
#[macro_export]
macro_rules! err_ctx {
    ($variant:ident, $msg:expr, $src:expr, $span:expr) => {
        $crate::SkeinError::$variant {
            message: $msg.to_string(),
            ctx: $crate::ErrorContext::with_source_and_span(
                $crate::diagnostics::SourceArc::clone($src),
                $span,
            ),
        }
    };
}
