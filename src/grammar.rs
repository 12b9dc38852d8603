//! The loaded grammar model: symbols, terminal patterns, and rules.
//!
//! These types arrive pre-compiled inside a serialized parser table; the
//! runtime never builds them from grammar text. They are immutable after
//! load and shared by `Rc` between the parse table, the lexer
//! configuration, and the tree-builder callbacks.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{err_msg, SkeinError};

/// A grammar symbol. Terminals carry `filter_out`, which marks tokens the
/// tree builder drops from rule children unless `keep_all_tokens` is set
/// (anonymous string literals in the source grammar).
#[derive(Debug, Clone)]
pub enum Symbol {
    Terminal { name: String, filter_out: bool },
    NonTerminal { name: String },
}

impl Symbol {
    pub fn terminal(name: impl Into<String>) -> Self {
        Symbol::Terminal { name: name.into(), filter_out: false }
    }

    pub fn non_terminal(name: impl Into<String>) -> Self {
        Symbol::NonTerminal { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Symbol::Terminal { name, .. } | Symbol::NonTerminal { name } => name,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Symbol::Terminal { .. })
    }

    pub fn is_filtered_out(&self) -> bool {
        matches!(self, Symbol::Terminal { filter_out: true, .. })
    }
}

// Equality and hashing ignore `filter_out`: a symbol is identified by its
// name and which side of the terminal divide it is on.
impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.is_terminal() == other.is_terminal() && self.name() == other.name()
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_terminal().hash(state);
        self.name().hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The set of regex flag characters attached to a pattern (`i`, `m`, `s`, `x`).
pub type FlagSet = BTreeSet<char>;

/// What a terminal matches: either a literal string or a regular expression.
/// `to_regexp` renders both into regex-crate syntax, with flags applied as a
/// scoped inline group so patterns with different flags can share one
/// alternation.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Str {
        value: String,
        flags: FlagSet,
    },
    Regex {
        value: String,
        flags: FlagSet,
        /// Minimum and maximum match width, when the table serialized them.
        width: Option<(usize, usize)>,
    },
}

impl Pattern {
    pub fn literal(value: impl Into<String>) -> Self {
        Pattern::Str { value: value.into(), flags: FlagSet::new() }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Pattern::Regex { value: value.into(), flags: FlagSet::new(), width: None }
    }

    pub fn value(&self) -> &str {
        match self {
            Pattern::Str { value, .. } | Pattern::Regex { value, .. } => value,
        }
    }

    pub fn flags(&self) -> &FlagSet {
        match self {
            Pattern::Str { flags, .. } | Pattern::Regex { flags, .. } => flags,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Pattern::Str { .. })
    }

    /// Folds extra flags into the pattern, e.g. a table's global regex flags.
    pub fn add_flags(&mut self, extra: &FlagSet) {
        match self {
            Pattern::Str { flags, .. } | Pattern::Regex { flags, .. } => {
                flags.extend(extra.iter().copied());
            }
        }
    }

    /// Renders the pattern as regex-crate syntax. Literals are escaped;
    /// flags become a scoped group, e.g. `(?i:def)`.
    pub fn to_regexp(&self) -> String {
        let inner = match self {
            Pattern::Str { value, .. } => regex::escape(value),
            Pattern::Regex { value, .. } => value.clone(),
        };
        let flags = self.flags();
        if flags.is_empty() {
            inner
        } else {
            let flag_str: String = flags.iter().collect();
            format!("(?{flag_str}:{inner})")
        }
    }

    /// Minimum and maximum match width in bytes. Uses the serialized width
    /// when present, otherwise analyzes the pattern; an unbounded maximum
    /// reports as `usize::MAX`.
    pub fn width(&self) -> Result<(usize, usize), SkeinError> {
        match self {
            Pattern::Str { value, .. } => Ok((value.len(), value.len())),
            Pattern::Regex { width: Some(w), .. } => Ok(*w),
            Pattern::Regex { value, .. } => {
                let mut parser = regex_syntax::Parser::new();
                let hir = parser.parse(&self.to_regexp()).map_err(|e| {
                    err_msg!(LexBuild, "cannot analyze pattern /{}/: {}", value, e)
                })?;
                let props = hir.properties();
                let min = props.minimum_len().unwrap_or(0);
                let max = props.maximum_len().unwrap_or(usize::MAX);
                Ok((min, max))
            }
        }
    }
}

/// A named terminal: its pattern plus a match priority. Higher priority wins
/// position ties in the lexer regardless of declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalDef {
    pub name: String,
    pub pattern: Pattern,
    pub priority: i64,
}

impl TerminalDef {
    pub fn new(name: impl Into<String>, pattern: Pattern) -> Self {
        TerminalDef { name: name.into(), pattern, priority: 0 }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// How the terminal reads in an error message: the literal itself when
    /// it has one, the name otherwise.
    pub fn user_repr(&self) -> String {
        match &self.pattern {
            Pattern::Str { value, .. } => format!("{value:?}"),
            Pattern::Regex { .. } => self.name.clone(),
        }
    }
}

/// Tree-shaping options attached to a rule by the grammar compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOptions {
    /// Keep tokens that would otherwise be filtered out.
    pub keep_all_tokens: bool,
    /// Collapse the node into its child when exactly one child remains.
    pub expand1: bool,
    pub priority: Option<i64>,
    /// For `maybe_placeholders`: one flag per pre-expansion slot, true where
    /// an optional was compiled out and a `Null` belongs in the children.
    pub empty_indices: Vec<bool>,
}

/// One production: `origin -> expansion`, with the bookkeeping the tree
/// builder needs. `order` disambiguates rules sharing an origin; `alias`
/// overrides the origin name as the produced node's label.
#[derive(Debug, Clone)]
pub struct Rule {
    pub origin: Symbol,
    pub expansion: Vec<Symbol>,
    pub order: usize,
    pub alias: Option<String>,
    pub options: RuleOptions,
}

impl Rule {
    pub fn new(origin: Symbol, expansion: Vec<Symbol>) -> Self {
        Rule { origin, expansion, order: 0, alias: None, options: RuleOptions::default() }
    }

    /// The label this rule's nodes carry, and the name a transformer handler
    /// must register under: the alias when present, else the origin.
    pub fn callback_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.origin.name())
    }
}

// Identity is (origin, expansion): two rules that produce the same symbols
// from the same origin are the same rule, whatever their alias or options.
impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.expansion == other.expansion
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.expansion.hash(state);
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} : ", self.origin)?;
        let names: Vec<&str> = self.expansion.iter().map(|s| s.name()).collect();
        write!(f, "{}>", names.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_to_regexp_escapes() {
        let p = Pattern::literal("a+b");
        assert_eq!(p.to_regexp(), r"a\+b");
    }

    #[test]
    fn test_flagged_pattern_wraps_scoped_group() {
        let mut flags = FlagSet::new();
        flags.insert('i');
        let p = Pattern::Str { value: "def".to_string(), flags };
        assert_eq!(p.to_regexp(), "(?i:def)");
    }

    #[test]
    fn test_regex_width_analysis() {
        let cases = vec![
            ("ab?", (1, 2)),
            ("[0-9]+", (1, usize::MAX)),
            ("abc", (3, 3)),
        ];
        for (pattern, expected) in cases {
            let p = Pattern::regex(pattern);
            let width = p.width().expect("width should analyze");
            assert_eq!(width, expected, "pattern /{pattern}/");
        }
    }

    #[test]
    fn test_zero_width_pattern_reports_zero_minimum() {
        let p = Pattern::regex("a?");
        let (min, _) = p.width().expect("width should analyze");
        assert_eq!(min, 0);
    }

    #[test]
    fn test_symbol_equality_ignores_filter_out() {
        let a = Symbol::Terminal { name: "A".to_string(), filter_out: true };
        let b = Symbol::Terminal { name: "A".to_string(), filter_out: false };
        assert_eq!(a, b);
        assert_ne!(a, Symbol::non_terminal("A"));
    }

    #[test]
    fn test_rule_identity_is_origin_and_expansion() {
        let mut r1 = Rule::new(Symbol::non_terminal("start"), vec![Symbol::terminal("A")]);
        let mut r2 = r1.clone();
        r1.alias = Some("first".to_string());
        r2.order = 9;
        assert_eq!(r1, r2);
        assert_eq!(r1.callback_name(), "first");
        assert_eq!(r2.callback_name(), "start");
    }
}
