//! The scanning layer: basic and contextual lexers, lexer state, and the
//! post-lex hook.
//!
//! Terminal priority is encoded entirely in alternation order. Terminals are
//! sorted by descending priority, then descending maximum width, then
//! descending literal length, then name, and joined into one anchored
//! alternation; the regex crate's leftmost-first semantics then makes the
//! earliest alternative win at every position. Keyword/identifier overlaps
//! are resolved by the carve-out pass in [`BasicLexer`]: an equal-priority
//! literal fully covered by a regex terminal is matched *through* the regex
//! and relabeled afterwards.
//!
//! [`ContextualLexer`] narrows the terminal set per parser state, so text
//! that is only a valid token elsewhere in the grammar fails early and
//! precisely. [`LexerThread`] binds a lexer to one input and owns the
//! [`PostLex`] queue.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::diagnostics::{ErrorContext, RelatedLabel, Span, StateMark};
use crate::grammar::{FlagSet, TerminalDef};
use crate::{err_msg, SkeinError, Token};

/// A per-terminal token rewrite supplied by the caller. Runs after the
/// token is built and positioned, before it is emitted.
pub type TokenCallback = Rc<dyn Fn(Token) -> Token>;

/// Everything a lexer needs to know, unbundled from the parser: the
/// terminal definitions, which ones to skip, global regex flags to fold
/// into every pattern, and user token callbacks.
#[derive(Clone, Default)]
pub struct LexerConf {
    pub terminals: Vec<TerminalDef>,
    pub ignore: Vec<String>,
    pub g_regex_flags: FlagSet,
    pub callbacks: HashMap<String, TokenCallback>,
}

impl LexerConf {
    pub fn new(terminals: Vec<TerminalDef>, ignore: Vec<String>) -> Self {
        LexerConf { terminals, ignore, g_regex_flags: FlagSet::new(), callbacks: HashMap::new() }
    }
}

/// Tracks where the lexer is in the text. `char_pos` is a byte offset;
/// `line` and `column` are 1-based, and columns count characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCounter {
    pub char_pos: usize,
    pub line: usize,
    pub column: usize,
    pub line_start_pos: usize,
}

impl LineCounter {
    pub fn new() -> Self {
        LineCounter { char_pos: 0, line: 1, column: 1, line_start_pos: 0 }
    }

    /// Advances past `text`. `test_newline` may be false only when the
    /// caller knows the text cannot contain a newline; it skips the scan.
    pub fn feed(&mut self, text: &str, test_newline: bool) {
        if test_newline {
            if let Some(last_nl) = text.rfind('\n') {
                self.line += text.matches('\n').count();
                self.line_start_pos = self.char_pos + last_nl + 1;
                self.char_pos += text.len();
                self.column = text[last_nl + 1..].chars().count() + 1;
                return;
            }
        }
        self.char_pos += text.len();
        self.column += text.chars().count();
    }
}

impl Default for LineCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The mutable cursor of one lex run: the shared input text, the position
/// counter, and the last token emitted (for error context).
#[derive(Clone)]
pub struct LexerState {
    pub text: Rc<String>,
    pub line_ctr: LineCounter,
    pub last_token: Option<Token>,
}

impl LexerState {
    pub fn new(text: Rc<String>) -> Self {
        LexerState { text, line_ctr: LineCounter::new(), last_token: None }
    }
}

/// One compiled alternation over a set of terminals, probed at a fixed
/// position. The winning terminal is recovered through named-group
/// participation.
pub struct Scanner {
    names: Vec<String>,
    regex: Option<Regex>,
    pub allowed_types: HashSet<String>,
}

impl Scanner {
    /// Compiles the terminals into `\A(?:(?P<NAME>pat)|...)`, in the order
    /// given. With `match_whole`, every alternative must also consume the
    /// entire haystack.
    pub fn new(terminals: &[TerminalDef], match_whole: bool) -> Result<Self, SkeinError> {
        let names: Vec<String> = terminals.iter().map(|t| t.name.clone()).collect();
        let allowed_types: HashSet<String> = names.iter().cloned().collect();
        if terminals.is_empty() {
            return Ok(Scanner { names, regex: None, allowed_types });
        }
        let alternatives: Vec<String> = terminals
            .iter()
            .map(|t| {
                if match_whole {
                    format!(r"(?P<{}>(?:{})\z)", t.name, t.pattern.to_regexp())
                } else {
                    format!("(?P<{}>{})", t.name, t.pattern.to_regexp())
                }
            })
            .collect();
        let pattern = format!(r"\A(?:{})", alternatives.join("|"));
        let regex = Regex::new(&pattern)
            .map_err(|e| err_msg!(LexBuild, "cannot compile terminal alternation: {}", e))?;
        Ok(Scanner { names, regex: Some(regex), allowed_types })
    }

    /// The match starting exactly at `pos`, as `(value, terminal name)`.
    pub fn match_at<'t>(&self, text: &'t str, pos: usize) -> Option<(&'t str, &str)> {
        let regex = self.regex.as_ref()?;
        let caps = regex.captures(&text[pos..])?;
        let value = caps.get(0)?.as_str();
        for name in &self.names {
            if caps.name(name).is_some() {
                return Some((value, name));
            }
        }
        None
    }
}

/// The rewrite chain attached to one terminal: the carve-out relabel first,
/// then the user callback, which only runs if the kind is still its own.
#[derive(Default)]
struct LexCallback {
    unless: Option<Scanner>,
    user: Option<TokenCallback>,
}

impl LexCallback {
    fn apply(&self, name: &str, mut token: Token) -> Token {
        if let Some(scanner) = &self.unless {
            if let Some((_, kind)) = scanner.match_at(&token.value, 0) {
                token.kind = kind.to_string();
            }
        }
        if let Some(user) = &self.user {
            if token.kind == name {
                token = user(token);
            }
        }
        token
    }
}

fn regexp_has_newline(r: &str) -> bool {
    r.contains('\n')
        || r.contains("\\n")
        || r.contains("\\s")
        || r.contains("[^")
        || (r.contains("(?s") && r.contains('.'))
}

/// A lexer over one fixed terminal set. All validation happens at
/// construction: every pattern must compile, nothing may match the empty
/// string, and every ignored name must be defined.
pub struct BasicLexer {
    terminals: Vec<TerminalDef>,
    ignore_types: HashSet<String>,
    newline_types: HashSet<String>,
    scanner: Scanner,
    callbacks: HashMap<String, LexCallback>,
}

impl BasicLexer {
    pub fn new(conf: &LexerConf) -> Result<Self, SkeinError> {
        let defined: HashSet<&str> = conf.terminals.iter().map(|t| t.name.as_str()).collect();
        for name in &conf.ignore {
            if !defined.contains(name.as_str()) {
                return Err(err_msg!(LexBuild, "ignored terminal {} is not defined", name));
            }
        }
        Self::with_terminals(conf, conf.terminals.clone())
    }

    /// Builds over an explicit terminal subset; the contextual lexer calls
    /// this once per distinct accepts-set.
    fn with_terminals(conf: &LexerConf, terminals: Vec<TerminalDef>) -> Result<Self, SkeinError> {
        let mut keyed: Vec<(i64, usize, usize, TerminalDef)> = Vec::with_capacity(terminals.len());
        for mut t in terminals {
            t.pattern.add_flags(&conf.g_regex_flags);
            let regexp = t.pattern.to_regexp();
            Regex::new(&regexp)
                .map_err(|e| err_msg!(LexBuild, "cannot compile terminal {}: {}", t.name, e))?;
            let (min_width, max_width) = t.pattern.width()?;
            if min_width == 0 {
                return Err(err_msg!(
                    LexBuild,
                    "terminal {} may match the empty string (pattern /{}/)",
                    t.name,
                    regexp
                ));
            }
            keyed.push((t.priority, max_width, t.pattern.value().len(), t));
        }
        keyed.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.cmp(&a.2))
                .then(a.3.name.cmp(&b.3.name))
        });
        let terminals: Vec<TerminalDef> = keyed.into_iter().map(|k| k.3).collect();

        let newline_types: HashSet<String> = terminals
            .iter()
            .filter(|t| regexp_has_newline(&t.pattern.to_regexp()))
            .map(|t| t.name.clone())
            .collect();

        let (scan_terminals, mut callbacks) = build_carve_outs(&terminals)?;
        for (name, cb) in &conf.callbacks {
            callbacks.entry(name.clone()).or_default().user = Some(Rc::clone(cb));
        }
        let scanner = Scanner::new(&scan_terminals, false)?;

        Ok(BasicLexer {
            terminals,
            ignore_types: conf.ignore.iter().cloned().collect(),
            newline_types,
            scanner,
            callbacks,
        })
    }

    pub fn terminals(&self) -> &[TerminalDef] {
        &self.terminals
    }

    /// The next non-ignored token, or `None` at end of input. Ignored
    /// matches advance the position; they only materialize as tokens when
    /// they have a callback to run.
    pub fn next_token(
        &self,
        state: &mut LexerState,
        mark: Option<StateMark>,
    ) -> Result<Option<Token>, SkeinError> {
        let text = Rc::clone(&state.text);
        loop {
            let start = state.line_ctr.char_pos;
            if start >= text.len() {
                return Ok(None);
            }
            let Some((value, kind)) = self.scanner.match_at(&text, start) else {
                return Err(self.unexpected_characters(state, mark));
            };
            let ignored = self.ignore_types.contains(kind);
            let callback = self.callbacks.get(kind);
            let mut token = if !ignored || callback.is_some() {
                let mut t = Token::new(kind, value);
                t.start_pos = Some(start);
                t.line = Some(state.line_ctr.line);
                t.column = Some(state.line_ctr.column);
                Some(t)
            } else {
                None
            };
            state.line_ctr.feed(value, self.newline_types.contains(kind));
            if let Some(t) = &mut token {
                t.end_line = Some(state.line_ctr.line);
                t.end_column = Some(state.line_ctr.column);
                t.end_pos = Some(state.line_ctr.char_pos);
            }
            if let Some(mut t) = token {
                if let Some(cb) = callback {
                    t = cb.apply(kind, t);
                }
                if !ignored {
                    state.last_token = Some(t.clone());
                    return Ok(Some(t));
                }
            }
        }
    }

    fn unexpected_characters(&self, state: &LexerState, mark: Option<StateMark>) -> SkeinError {
        let pos = state.line_ctr.char_pos;
        let found = state.text[pos..].chars().next().unwrap_or('\0');
        let mut allowed: Vec<String> = self
            .scanner
            .allowed_types
            .difference(&self.ignore_types)
            .cloned()
            .collect();
        allowed.sort();
        if allowed.is_empty() {
            allowed.push("<END-OF-FILE>".to_string());
        }
        let mut ctx = ErrorContext::none();
        ctx.span = Some(Span::new(pos, pos + found.len_utf8()));
        if let Some(prev) = &state.last_token {
            if let (Some(s), Some(e)) = (prev.start_pos, prev.end_pos) {
                ctx.related.push(RelatedLabel {
                    span: Span::new(s, e),
                    label: format!("last token was this {}", prev.kind),
                });
            }
        }
        SkeinError::UnexpectedCharacters {
            pos,
            line: state.line_ctr.line,
            column: state.line_ctr.column,
            found,
            allowed,
            token_history: state.last_token.clone(),
            state: mark,
            interactive: None,
            ctx,
        }
    }
}

/// The carve-out pass. For every regex terminal, every equal-priority
/// literal it fully matches becomes a relabel entry in a whole-match
/// scanner; literals whose flags are a subset of the regex terminal's are
/// then dropped from the main alternation entirely.
fn build_carve_outs(
    terminals: &[TerminalDef],
) -> Result<(Vec<TerminalDef>, HashMap<String, LexCallback>), SkeinError> {
    let mut embedded: HashSet<&str> = HashSet::new();
    let mut callbacks: HashMap<String, LexCallback> = HashMap::new();
    for retok in terminals.iter().filter(|t| !t.pattern.is_literal()) {
        let anchored = format!(r"\A(?:{})", retok.pattern.to_regexp());
        let regex = Regex::new(&anchored)
            .map_err(|e| err_msg!(LexBuild, "cannot compile terminal {}: {}", retok.name, e))?;
        let mut carved: Vec<TerminalDef> = Vec::new();
        for strtok in terminals.iter().filter(|t| t.pattern.is_literal()) {
            if strtok.priority != retok.priority {
                continue;
            }
            let literal = strtok.pattern.value();
            match regex.find(literal) {
                Some(m) if m.as_str() == literal => {
                    carved.push(strtok.clone());
                    if strtok.pattern.flags().is_subset(retok.pattern.flags()) {
                        embedded.insert(strtok.name.as_str());
                    }
                }
                _ => {}
            }
        }
        if !carved.is_empty() {
            let scanner = Scanner::new(&carved, true)?;
            callbacks.insert(
                retok.name.clone(),
                LexCallback { unless: Some(scanner), user: None },
            );
        }
    }
    let kept: Vec<TerminalDef> = terminals
        .iter()
        .filter(|t| !embedded.contains(t.name.as_str()))
        .cloned()
        .collect();
    Ok((kept, callbacks))
}

/// One [`BasicLexer`] per distinct parser-state accepts-set, plus a root
/// lexer over every terminal. When a state-local lexer fails on text the
/// root lexer *can* tokenize, the failure is reclassified: the input was a
/// real token in the wrong place, which is an `UnexpectedToken`.
pub struct ContextualLexer {
    lexers: HashMap<usize, Rc<BasicLexer>>,
    root_lexer: BasicLexer,
}

impl ContextualLexer {
    /// `states` maps each parser state to the terminal names with an action
    /// there. Each accepts-set is widened with the ignored terminals and
    /// `always_accept` (the post-lex processor's output kinds), then
    /// filtered to defined terminals; identical sets share one lexer.
    pub fn new(
        conf: &LexerConf,
        states: &HashMap<usize, Vec<String>>,
        always_accept: &[String],
    ) -> Result<Self, SkeinError> {
        let root_lexer = BasicLexer::new(conf)?;
        let terminals_by_name: HashMap<&str, &TerminalDef> =
            conf.terminals.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut by_key: HashMap<BTreeSet<&str>, Rc<BasicLexer>> = HashMap::new();
        let mut lexers: HashMap<usize, Rc<BasicLexer>> = HashMap::new();
        for (&state, accepts) in states {
            let key: BTreeSet<&str> = accepts.iter().map(|s| s.as_str()).collect();
            let lexer = if let Some(existing) = by_key.get(&key) {
                Rc::clone(existing)
            } else {
                let mut widened = key.clone();
                widened.extend(conf.ignore.iter().map(|s| s.as_str()));
                widened.extend(always_accept.iter().map(|s| s.as_str()));
                let terminals: Vec<TerminalDef> = widened
                    .iter()
                    .filter_map(|n| terminals_by_name.get(n).map(|t| (*t).clone()))
                    .collect();
                let built = Rc::new(BasicLexer::with_terminals(conf, terminals)?);
                by_key.insert(key, Rc::clone(&built));
                built
            };
            lexers.insert(state, lexer);
        }
        Ok(ContextualLexer { lexers, root_lexer })
    }

    pub fn next_token(
        &self,
        state: &mut LexerState,
        mark: Option<StateMark>,
    ) -> Result<Option<Token>, SkeinError> {
        let lexer: &BasicLexer = mark
            .and_then(|m| self.lexers.get(&m.state).map(Rc::as_ref))
            .unwrap_or(&self.root_lexer);
        match lexer.next_token(state, mark) {
            Err(err) if matches!(err, SkeinError::UnexpectedCharacters { .. }) => {
                // Retry against every terminal. If that succeeds, the text
                // was a valid token that this state cannot accept.
                let last = state.last_token.clone();
                match self.root_lexer.next_token(state, mark) {
                    Ok(Some(token)) => {
                        let expected = match &err {
                            SkeinError::UnexpectedCharacters { allowed, .. } => allowed.clone(),
                            _ => Vec::new(),
                        };
                        let mut ctx = ErrorContext::none();
                        if let (Some(s), Some(e)) = (token.start_pos, token.end_pos) {
                            ctx.span = Some(Span::new(s, e));
                        }
                        if let Some(prev) = last {
                            if let (Some(s), Some(e)) = (prev.start_pos, prev.end_pos) {
                                ctx.related.push(RelatedLabel {
                                    span: Span::new(s, e),
                                    label: format!("last token was this {}", prev.kind),
                                });
                            }
                        }
                        Err(SkeinError::UnexpectedToken {
                            token,
                            expected,
                            state: mark,
                            interactive: None,
                            accepts: OnceCell::new(),
                            ctx,
                        })
                    }
                    // The root lexer failed too (with a further position);
                    // the original error has the right location.
                    _ => Err(err),
                }
            }
            other => other,
        }
    }
}

/// The lexer driving a parse: one terminal set for the whole input, or one
/// per parser state.
pub enum Lexer {
    Basic(BasicLexer),
    Contextual(ContextualLexer),
}

impl Lexer {
    pub fn next_token(
        &self,
        state: &mut LexerState,
        mark: Option<StateMark>,
    ) -> Result<Option<Token>, SkeinError> {
        match self {
            Lexer::Basic(lexer) => lexer.next_token(state, mark),
            Lexer::Contextual(lexer) => lexer.next_token(state, mark),
        }
    }
}

/// A stateful token-stream rewriter that runs between the lexer and the
/// parser. For every input token it may emit zero or more tokens; `finish`
/// runs once after the last input token.
pub trait PostLex {
    /// Called once per run before any token is processed.
    fn reset(&mut self) {}

    fn process_token(&mut self, token: Token, out: &mut VecDeque<Token>);

    /// Last chance to emit, e.g. closing synthetic block-end tokens.
    fn finish(&mut self, _out: &mut VecDeque<Token>) {}

    /// Token kinds this processor emits that no parser state would
    /// otherwise ask the contextual lexer for.
    fn always_accept(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Binds a lexer to one input text and owns the pending-token queue the
/// post-lex processor writes into. Cloning a thread clones its position
/// and queue; a post-lex processor, being caller state, stays shared.
#[derive(Clone)]
pub struct LexerThread {
    lexer: Rc<Lexer>,
    pub state: LexerState,
    postlex: Option<Rc<RefCell<dyn PostLex>>>,
    pending: VecDeque<Token>,
    postlex_done: bool,
}

impl LexerThread {
    pub fn new(
        lexer: Rc<Lexer>,
        text: Rc<String>,
        postlex: Option<Rc<RefCell<dyn PostLex>>>,
    ) -> Self {
        if let Some(post) = &postlex {
            post.borrow_mut().reset();
        }
        LexerThread {
            lexer,
            state: LexerState::new(text),
            postlex,
            pending: VecDeque::new(),
            postlex_done: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.state.text
    }

    /// Byte offset of the next unconsumed character.
    pub fn position(&self) -> usize {
        self.state.line_ctr.char_pos
    }

    /// The next token for the parser, routed through the post-lex processor
    /// when one is attached. `mark` selects the contextual sub-lexer.
    pub fn next_token(&mut self, mark: Option<StateMark>) -> Result<Option<Token>, SkeinError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            let Some(post) = &self.postlex else {
                return self.lexer.next_token(&mut self.state, mark);
            };
            match self.lexer.next_token(&mut self.state, mark)? {
                Some(token) => {
                    post.borrow_mut().process_token(token, &mut self.pending);
                }
                None => {
                    if self.postlex_done {
                        return Ok(None);
                    }
                    self.postlex_done = true;
                    post.borrow_mut().finish(&mut self.pending);
                }
            }
        }
    }
}
