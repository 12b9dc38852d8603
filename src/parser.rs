//! The LALR(1) core: parse table, parser state, and the parse drivers.
//!
//! The machine itself is the textbook loop. [`ParserState`] keeps two
//! stacks in lock step (`state_stack` is always one deeper than
//! `value_stack`) and advances one token at a time through
//! [`ParserState::feed_token`]: a missing action raises, a shift pushes the
//! token, a reduce pops one expansion, runs the rule callback, and follows
//! the goto. Everything else in this module is about failure: errors raised
//! mid-parse capture the dead state and lexer as an [`InteractiveParser`]
//! checkpoint, and [`LalrParser::parse_with_recovery`] drives that
//! checkpoint through an error handler until the input is salvaged or the
//! parse provably stops advancing.

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::OnceCell;

use crate::diagnostics::{ErrorContext, Span, StateMark};
use crate::grammar::Rule;
use crate::interactive::InteractiveParser;
use crate::lexer::LexerThread;
use crate::tree::Branch;
use crate::{err_msg, SkeinError, Token};

pub type StateId = usize;
pub type RuleId = usize;

/// One table cell: consume the token and go to a state, or replay a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Shift(StateId),
    Reduce(RuleId),
}

/// The deserialized automaton. State ids are dense indices into `states`;
/// rows map terminal names (and, for gotos, rule origins) to actions.
#[derive(Debug, Clone)]
pub struct ParseTable {
    pub states: Vec<HashMap<String, Action>>,
    pub start_states: HashMap<String, StateId>,
    pub end_states: HashMap<String, StateId>,
}

impl ParseTable {
    /// Per-state terminal candidates, for the contextual lexer. Rows also
    /// hold goto entries and the end marker; the lexer filters those out by
    /// name.
    pub fn state_accepts(&self) -> HashMap<usize, Vec<String>> {
        self.states
            .iter()
            .enumerate()
            .map(|(id, row)| (id, row.keys().cloned().collect()))
            .collect()
    }

    /// Structural cross-check against the rule list, for debug loads and
    /// hand-built tables: shift targets and start/end states must exist,
    /// reduce ids must name real rules, non-terminal rows must be gotos,
    /// and every reducible rule needs a goto row to land on.
    pub fn validate(&self, rules: &[Rc<Rule>]) -> Result<(), SkeinError> {
        let states = self.states.len();
        for (id, row) in self.states.iter().enumerate() {
            for (name, action) in row {
                match action {
                    Action::Shift(target) => {
                        if *target >= states {
                            return Err(err_msg!(
                                MalformedTable,
                                "state {id}: shift on '{name}' targets missing state {target}"
                            ));
                        }
                    }
                    Action::Reduce(rule_id) => {
                        if *rule_id >= rules.len() {
                            return Err(err_msg!(
                                MalformedTable,
                                "state {id}: reduce on '{name}' names missing rule {rule_id}"
                            ));
                        }
                        if !looks_terminal(name) {
                            return Err(err_msg!(
                                MalformedTable,
                                "state {id}: non-terminal '{name}' carries a reduce, expected a goto"
                            ));
                        }
                    }
                }
            }
        }
        for (start, state) in self.start_states.iter().chain(self.end_states.iter()) {
            if *state >= states {
                return Err(err_msg!(
                    MalformedTable,
                    "start symbol '{start}' points at missing state {state}"
                ));
            }
        }
        for (rule_id, rule) in rules.iter().enumerate() {
            let reduced = self.states.iter().any(|row| {
                row.values().any(|action| matches!(action, Action::Reduce(id) if *id == rule_id))
            });
            if reduced && !self.states.iter().any(|row| row.contains_key(rule.origin.name())) {
                return Err(err_msg!(
                    MalformedTable,
                    "rule {rule} is reducible but no state has a goto for '{}'",
                    rule.origin.name()
                ));
            }
        }
        Ok(())
    }
}

/// A rule callback: consumes the popped children, produces the value pushed
/// on the goto.
pub type BuildFn = Box<dyn Fn(Vec<Branch>) -> Result<Branch, SkeinError>>;

/// A shift callback: rewrites a token into the stack value for its slot.
pub type TokenShiftFn = Box<dyn Fn(Token) -> Result<Branch, SkeinError>>;

/// The callback tables the parse runs against: one builder per rule id,
/// plus optional per-terminal shift rewrites.
pub struct Callbacks {
    pub rules: Vec<BuildFn>,
    pub token_shift: HashMap<String, TokenShiftFn>,
}

/// Everything one parse run needs, resolved for a single start symbol.
/// Cheap to clone; the table, rules, and callbacks are shared.
#[derive(Clone)]
pub struct ParseConf {
    pub table: Rc<ParseTable>,
    pub rules: Rc<Vec<Rc<Rule>>>,
    pub callbacks: Rc<Callbacks>,
    pub start_state: StateId,
    pub end_state: StateId,
}

impl ParseConf {
    pub fn new(
        table: Rc<ParseTable>,
        rules: Rc<Vec<Rc<Rule>>>,
        callbacks: Rc<Callbacks>,
        start: &str,
    ) -> Result<Self, SkeinError> {
        let start_state = *table
            .start_states
            .get(start)
            .ok_or_else(|| err_msg!(Configuration, "unknown start symbol {:?}", start))?;
        let end_state = *table
            .end_states
            .get(start)
            .ok_or_else(|| err_msg!(MalformedTable, "start symbol {:?} has no end state", start))?;
        Ok(ParseConf { table, rules, callbacks, start_state, end_state })
    }
}

// Python's str.isupper, which the expected-terminal filter is defined by:
// at least one cased character, and no lowercase ones. "$END" passes.
pub(crate) fn looks_terminal(name: &str) -> bool {
    let mut has_cased = false;
    for c in name.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}

fn token_span(token: &Token) -> Option<Span> {
    match (token.start_pos, token.end_pos) {
        (Some(s), Some(e)) => Some(Span::new(s, e)),
        (Some(s), None) => Some(Span::point(s)),
        _ => None,
    }
}

/// The live automaton: configuration plus the two stacks. Cloning yields a
/// fully independent parse that shares only the immutable configuration.
#[derive(Clone)]
pub struct ParserState {
    pub conf: ParseConf,
    state_stack: Vec<StateId>,
    value_stack: Vec<Branch>,
}

impl ParserState {
    pub fn new(conf: ParseConf) -> Self {
        let start = conf.start_state;
        ParserState { conf, state_stack: vec![start], value_stack: Vec::new() }
    }

    /// The state id on top of the stack.
    pub fn position(&self) -> StateId {
        *self.state_stack.last().unwrap_or(&self.conf.start_state)
    }

    /// The equality view used by error classification and the recovery
    /// loop's no-progress guard.
    pub fn mark(&self) -> StateMark {
        StateMark { depth: self.state_stack.len(), state: self.position() }
    }

    pub fn stack_depth(&self) -> usize {
        self.state_stack.len()
    }

    /// The value slots accumulated so far, bottom of stack first.
    pub fn values(&self) -> &[Branch] {
        &self.value_stack
    }

    /// Feeds one token. Shifts return `None`; the accepting reduce (only
    /// reachable with `is_end`) returns the final value. A missing action
    /// raises without consuming the token, so the same state can be fed a
    /// different one (reduces the dead lookahead forced have already run).
    pub fn feed_token(&mut self, token: Token, is_end: bool) -> Result<Option<Branch>, SkeinError> {
        self.feed(token, is_end, true)
    }

    /// `feed_token` with callbacks suppressed: reduces push `Null`. Used to
    /// probe which terminals a state accepts without side effects.
    pub(crate) fn probe_token(
        &mut self,
        token: Token,
        is_end: bool,
    ) -> Result<Option<Branch>, SkeinError> {
        self.feed(token, is_end, false)
    }

    fn feed(
        &mut self,
        token: Token,
        is_end: bool,
        run_callbacks: bool,
    ) -> Result<Option<Branch>, SkeinError> {
        loop {
            let state = self.position();
            let row = self
                .conf
                .table
                .states
                .get(state)
                .ok_or_else(|| err_msg!(MalformedTable, "state {} is out of range", state))?;
            let action = match row.get(&token.kind) {
                Some(action) => *action,
                None => return Err(self.unexpected(token, is_end)),
            };
            match action {
                Action::Shift(next) => {
                    self.state_stack.push(next);
                    let value = if run_callbacks {
                        match self.conf.callbacks.token_shift.get(&token.kind) {
                            Some(shift) => shift(token)?,
                            None => Branch::Token(token),
                        }
                    } else {
                        Branch::Token(token)
                    };
                    self.value_stack.push(value);
                    return Ok(None);
                }
                Action::Reduce(rule_id) => {
                    let rule = Rc::clone(self.conf.rules.get(rule_id).ok_or_else(|| {
                        err_msg!(MalformedTable, "reduce references unknown rule {}", rule_id)
                    })?);
                    let size = rule.expansion.len();
                    let at = self.value_stack.len().checked_sub(size).ok_or_else(|| {
                        err_msg!(MalformedTable, "reduce of {} pops past the stack bottom", rule)
                    })?;
                    let keep = self.state_stack.len().checked_sub(size).ok_or_else(|| {
                        err_msg!(MalformedTable, "reduce of {} pops past the stack bottom", rule)
                    })?;
                    let children = self.value_stack.split_off(at);
                    self.state_stack.truncate(keep);

                    let value = if run_callbacks {
                        let callback = self.conf.callbacks.rules.get(rule_id).ok_or_else(|| {
                            err_msg!(MalformedTable, "rule {} has no callback", rule_id)
                        })?;
                        callback(children)?
                    } else {
                        Branch::Null
                    };

                    let top = self.position();
                    let goto_row = self
                        .conf
                        .table
                        .states
                        .get(top)
                        .ok_or_else(|| err_msg!(MalformedTable, "state {} is out of range", top))?;
                    let next = match goto_row.get(rule.origin.name()) {
                        Some(Action::Shift(next)) => *next,
                        _ => {
                            return Err(err_msg!(
                                MalformedTable,
                                "state {} has no goto for {}",
                                top,
                                rule.origin.name()
                            ))
                        }
                    };
                    self.state_stack.push(next);
                    self.value_stack.push(value);

                    if is_end && self.position() == self.conf.end_state {
                        // The stacks keep the accepted value, so the state
                        // still reads consistently after the parse is done.
                        return Ok(self.value_stack.last().cloned());
                    }
                }
            }
        }
    }

    fn unexpected(&self, token: Token, is_end: bool) -> SkeinError {
        let mut expected: Vec<String> = self
            .conf
            .table
            .states
            .get(self.position())
            .map(|row| row.keys().filter(|name| looks_terminal(name)).cloned().collect())
            .unwrap_or_default();
        expected.sort();
        let mut ctx = ErrorContext::none();
        ctx.span = token_span(&token);
        if is_end {
            ctx.span = Some(Span::point(token.end_pos.or(token.start_pos).unwrap_or(0)));
            SkeinError::UnexpectedEof {
                token,
                expected,
                state: Some(self.mark()),
                interactive: None,
                ctx,
            }
        } else {
            SkeinError::UnexpectedToken {
                token,
                expected,
                state: Some(self.mark()),
                interactive: None,
                accepts: OnceCell::new(),
                ctx,
            }
        }
    }
}

/// Runs a parse to completion from an existing state, consuming the lexer.
/// On an unexpected-input error the dead state and lexer move into the
/// error as a checkpoint, so callers can inspect or resume it.
pub(crate) fn parse_from_state(
    mut state: ParserState,
    mut lexer: LexerThread,
    last_token: Option<Token>,
) -> Result<Branch, SkeinError> {
    fn run(
        state: &mut ParserState,
        lexer: &mut LexerThread,
        mut last: Option<Token>,
    ) -> Result<Branch, SkeinError> {
        while let Some(token) = lexer.next_token(Some(state.mark()))? {
            last = Some(token.clone());
            state.feed_token(token, false)?;
        }
        let end_token = match &last {
            Some(prev) => Token::new_borrow_pos("$END", "", prev),
            None => {
                let mut t = Token::new("$END", "");
                t.start_pos = Some(0);
                t.line = Some(1);
                t.column = Some(1);
                t
            }
        };
        match state.feed_token(end_token, true)? {
            Some(value) => Ok(value),
            None => Err(err_msg!(
                MalformedTable,
                "parse consumed all input without reaching the accept state"
            )),
        }
    }

    match run(&mut state, &mut lexer, last_token) {
        Ok(value) => Ok(value),
        Err(mut err) => {
            if err.is_unexpected_input() {
                err.set_interactive(InteractiveParser::new(state, lexer));
            }
            Err(err)
        }
    }
}

/// The parser facade the engine holds: the shared table, rules, and
/// callbacks, with entry points per start symbol.
pub struct LalrParser {
    table: Rc<ParseTable>,
    rules: Rc<Vec<Rc<Rule>>>,
    callbacks: Rc<Callbacks>,
}

impl LalrParser {
    pub fn new(table: Rc<ParseTable>, rules: Rc<Vec<Rc<Rule>>>, callbacks: Rc<Callbacks>) -> Self {
        LalrParser { table, rules, callbacks }
    }

    pub fn conf_for(&self, start: &str) -> Result<ParseConf, SkeinError> {
        ParseConf::new(
            Rc::clone(&self.table),
            Rc::clone(&self.rules),
            Rc::clone(&self.callbacks),
            start,
        )
    }

    pub fn parse(&self, lexer: LexerThread, start: &str) -> Result<Branch, SkeinError> {
        let state = ParserState::new(self.conf_for(start)?);
        parse_from_state(state, lexer, None)
    }

    /// Begins a parse without consuming any input; the caller feeds tokens.
    pub fn parse_interactive(
        &self,
        lexer: LexerThread,
        start: &str,
    ) -> Result<InteractiveParser, SkeinError> {
        let state = ParserState::new(self.conf_for(start)?);
        Ok(InteractiveParser::new(state, lexer))
    }

    /// Parses with error recovery. Each unexpected-input error is shown to
    /// `on_error`; returning false re-raises it, returning true resumes
    /// from the checkpoint (skipping one character when the lexer itself
    /// failed). A repeat of the same token failure in the same place stops
    /// the loop.
    pub fn parse_with_recovery(
        &self,
        lexer: LexerThread,
        start: &str,
        on_error: &mut dyn FnMut(&SkeinError) -> bool,
    ) -> Result<Branch, SkeinError> {
        let state = ParserState::new(self.conf_for(start)?);
        let mut err = match parse_from_state(state, lexer, None) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        loop {
            if !err.is_unexpected_input() {
                return Err(err);
            }
            if !on_error(&err) {
                return Err(err);
            }
            let prev_token = err.token().cloned();
            let prev_mark = err.state_mark();
            let was_token_err = !matches!(err, SkeinError::UnexpectedCharacters { .. });
            let Some(mut checkpoint) = err.take_interactive() else {
                return Err(err);
            };
            if !was_token_err {
                // The failed character was never consumed; step over it so
                // the loop cannot stall.
                checkpoint.skip_input_char();
            }
            let prev_pos = checkpoint.lexer_position();
            match checkpoint.resume_parse() {
                Ok(value) => return Ok(value),
                Err(next) => {
                    if was_token_err && next.is_unexpected_input() {
                        // A token failure consumes its token, so a genuine
                        // repeat means the lexer is stuck at one offset too
                        // (in practice, at end of input).
                        let same_place = next.interactive().map(InteractiveParser::lexer_position)
                            == Some(prev_pos);
                        if let (Some(t1), Some(t2), Some(m1), Some(m2)) = (
                            prev_token.as_ref(),
                            next.token(),
                            prev_mark,
                            next.state_mark(),
                        ) {
                            if same_place && t1 == t2 && m1 == m2 {
                                return Err(next);
                            }
                        }
                    }
                    err = next;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::grammar::Symbol;
    use crate::tree::Tree;

    fn tree_cb(label: &str) -> BuildFn {
        let label = label.to_string();
        Box::new(move |children| Ok(Branch::Tree(Tree::new(label.clone(), children))))
    }

    /// `start: start PLUS NUMBER | NUMBER`, tables derived by hand.
    pub(crate) fn expr_conf() -> ParseConf {
        let mut s0 = HashMap::new();
        s0.insert("NUMBER".to_string(), Action::Shift(2));
        s0.insert("start".to_string(), Action::Shift(1));
        let mut s1 = HashMap::new();
        s1.insert("PLUS".to_string(), Action::Shift(3));
        let mut s2 = HashMap::new();
        s2.insert("PLUS".to_string(), Action::Reduce(0));
        s2.insert("$END".to_string(), Action::Reduce(0));
        let mut s3 = HashMap::new();
        s3.insert("NUMBER".to_string(), Action::Shift(4));
        let mut s4 = HashMap::new();
        s4.insert("PLUS".to_string(), Action::Reduce(1));
        s4.insert("$END".to_string(), Action::Reduce(1));

        let table = ParseTable {
            states: vec![s0, s1, s2, s3, s4],
            start_states: [("start".to_string(), 0)].into_iter().collect(),
            end_states: [("start".to_string(), 1)].into_iter().collect(),
        };
        let rules = vec![
            Rc::new(Rule::new(Symbol::non_terminal("start"), vec![Symbol::terminal("NUMBER")])),
            Rc::new(Rule::new(
                Symbol::non_terminal("start"),
                vec![
                    Symbol::non_terminal("start"),
                    Symbol::terminal("PLUS"),
                    Symbol::terminal("NUMBER"),
                ],
            )),
        ];
        let callbacks =
            Callbacks { rules: vec![tree_cb("start"), tree_cb("start")], token_shift: HashMap::new() };
        ParseConf::new(Rc::new(table), Rc::new(rules), Rc::new(callbacks), "start")
            .expect("start symbol exists")
    }

    fn num(value: &str) -> Token {
        Token::new("NUMBER", value)
    }

    fn plus() -> Token {
        Token::new("PLUS", "+")
    }

    fn end() -> Token {
        Token::new("$END", "")
    }

    #[test]
    fn test_shift_reduce_accept() {
        let mut state = ParserState::new(expr_conf());
        assert!(state.feed_token(num("1"), false).expect("shift").is_none());
        assert!(state.feed_token(plus(), false).expect("reduce+shift").is_none());
        assert!(state.feed_token(num("2"), false).expect("shift").is_none());
        let result = state
            .feed_token(end(), true)
            .expect("accepting feed")
            .expect("a final value");
        let tree = result.as_tree().expect("a tree");
        assert_eq!(tree.data, "start");
        assert_eq!(tree.children.len(), 3);
        let inner = tree.children[0].as_tree().expect("nested start");
        assert_eq!(inner.children[0].as_token().expect("number").value, "1");
    }

    #[test]
    fn test_stacks_move_in_lock_step() {
        // The state stack carries the start state, so it stays exactly one
        // entry ahead of the value stack through every shift and reduce,
        // including the accepting one.
        let mut state = ParserState::new(expr_conf());
        assert_eq!(state.mark().depth, state.values().len() + 1);
        state.feed_token(num("1"), false).expect("shift");
        assert_eq!(state.mark().depth, state.values().len() + 1);
        state.feed_token(plus(), false).expect("reduce+shift");
        assert_eq!(state.mark().depth, state.values().len() + 1);
        state.feed_token(num("2"), false).expect("shift");
        assert_eq!(state.mark().depth, state.values().len() + 1);
        let result = state
            .feed_token(end(), true)
            .expect("accepting feed")
            .expect("a final value");
        assert_eq!(state.mark().depth, state.values().len() + 1);
        assert_eq!(state.values().last(), Some(&result));
    }

    #[test]
    fn test_missing_action_lists_expected_terminals() {
        let mut state = ParserState::new(expr_conf());
        let err = state.feed_token(plus(), false).err().expect("PLUS is invalid at the start");
        match err {
            SkeinError::UnexpectedToken { token, expected, state: mark, .. } => {
                assert_eq!(token.kind, "PLUS");
                assert_eq!(expected, vec!["NUMBER".to_string()]);
                assert_eq!(mark, Some(StateMark { depth: 1, state: 0 }));
            }
            other => panic!("expected UnexpectedToken, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_feed_leaves_stacks_intact() {
        let mut state = ParserState::new(expr_conf());
        state.feed_token(num("1"), false).expect("shift");
        let before = state.mark();
        let _ = state.feed_token(num("2"), false).err().expect("NUMBER NUMBER is invalid");
        assert_eq!(state.mark(), before);
        // the same state still accepts the right continuation
        state.feed_token(plus(), false).expect("PLUS still works");
    }

    #[test]
    fn test_end_of_input_uses_eof_variant() {
        let mut state = ParserState::new(expr_conf());
        state.feed_token(num("1"), false).expect("shift");
        state.feed_token(plus(), false).expect("reduce+shift");
        let err = state.feed_token(end(), true).err().expect("dangling PLUS cannot accept");
        match &err {
            SkeinError::UnexpectedEof { expected, .. } => {
                assert_eq!(expected, &vec!["NUMBER".to_string()]);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn test_probe_suppresses_callbacks() {
        let mut state = ParserState::new(expr_conf());
        state.feed_token(num("1"), false).expect("shift");
        let mut probe = state.clone();
        probe.probe_token(plus(), false).expect("probe reduce+shift");
        assert!(probe.values().iter().any(|v| v.is_null()));
        // the original state is untouched by the probe's clone
        assert_eq!(state.mark(), StateMark { depth: 2, state: 2 });
    }

    #[test]
    fn test_clone_is_independent() {
        let mut state = ParserState::new(expr_conf());
        state.feed_token(num("1"), false).expect("shift");
        let mut copy = state.clone();
        copy.feed_token(plus(), false).expect("reduce+shift");
        copy.feed_token(num("2"), false).expect("shift");
        assert_eq!(state.mark(), StateMark { depth: 2, state: 2 });
        let result = copy
            .feed_token(end(), true)
            .expect("accepting feed")
            .expect("a final value");
        assert_eq!(result.as_tree().expect("a tree").children.len(), 3);
    }

    #[test]
    fn test_unknown_start_symbol_is_rejected() {
        let conf = expr_conf();
        let err = ParseConf::new(
            Rc::clone(&conf.table),
            Rc::clone(&conf.rules),
            Rc::clone(&conf.callbacks),
            "statement",
        )
        .err()
        .expect("unknown start symbol should be rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_validate_accepts_consistent_tables() {
        let conf = expr_conf();
        conf.table.validate(&conf.rules).expect("table is consistent");
    }

    #[test]
    fn test_validate_flags_out_of_range_shift() {
        let conf = expr_conf();
        let mut table = (*conf.table).clone();
        table.states[0].insert("NUMBER".to_string(), Action::Shift(99));
        let err = table.validate(&conf.rules).err().expect("bad shift target rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }

    #[test]
    fn test_validate_flags_missing_goto() {
        let conf = expr_conf();
        let mut table = (*conf.table).clone();
        for row in &mut table.states {
            row.remove("start");
        }
        let err = table.validate(&conf.rules).err().expect("missing goto rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }
}
