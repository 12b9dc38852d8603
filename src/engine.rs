//! The frontend: options, wiring, and the parse entry points.
//!
//! An [`Engine`] is assembled from a compiled table plus [`EngineOptions`].
//! Everything that can be rejected is rejected at construction, so a built
//! engine parses without configuration surprises: the table must be an
//! LALR table, the lexer strategy must fit it, start symbols must exist,
//! and option combinations that contradict the table fail fast.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::{to_error_source, SourceArc};
use crate::grammar::TerminalDef;
use crate::interactive::InteractiveParser;
use crate::lexer::{
    BasicLexer, ContextualLexer, Lexer, LexerConf, LexerThread, PostLex, TokenCallback,
};
use crate::parser::LalrParser;
use crate::serialize::{CompiledGrammar, LexerType, SerializeRegistry};
use crate::tree::Branch;
use crate::tree_builder::{ParseTreeBuilder, PropagatePositions};
use crate::visit::Transformer;
use crate::{err_msg, SkeinError, Token};

/// Which lexer the engine should run. `Auto` takes whatever the table was
/// compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexerChoice {
    #[default]
    Auto,
    Basic,
    Contextual,
}

/// Construction-time engine configuration. Every field is validated in
/// [`Engine::from_compiled`]; a built engine never re-checks them.
#[derive(Clone)]
pub struct EngineOptions {
    /// Start symbols this engine may parse from. Each must exist in the
    /// table's start states.
    pub start: Vec<String>,
    pub lexer: LexerChoice,
    /// Parser algorithm; only `"lalr"` is available.
    pub parser: String,
    /// In-parse transformer: rule handlers replace tree construction at
    /// reduce time, token handlers rewrite tokens at shift time.
    pub transformer: Option<Rc<Transformer>>,
    pub propagate_positions: PropagatePositions,
    /// Represent compiled-out optionals as `Null` children (on by default).
    pub maybe_placeholders: bool,
    pub keep_all_tokens: bool,
    pub postlex: Option<Rc<RefCell<dyn PostLex>>>,
    /// Per-terminal token rewrites applied inside the lexer.
    pub lexer_callbacks: HashMap<String, TokenCallback>,
    pub use_bytes: bool,
    /// Extra regex flags folded into every terminal pattern.
    pub g_regex_flags: String,
    /// Cross-check the decoded table against its rule list at load time.
    pub debug: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            start: vec!["start".to_string()],
            lexer: LexerChoice::Auto,
            parser: "lalr".to_string(),
            transformer: None,
            propagate_positions: PropagatePositions::Off,
            maybe_placeholders: true,
            keep_all_tokens: false,
            postlex: None,
            lexer_callbacks: HashMap::new(),
            use_bytes: false,
            g_regex_flags: String::new(),
            debug: false,
        }
    }
}

const SUPPORTED_REGEX_FLAGS: &str = "imsxuUR";

/// A ready-to-parse grammar: compiled table, lexer, and tree-building
/// callbacks wired together.
pub struct Engine {
    options: EngineOptions,
    lexer_conf: LexerConf,
    lexer: Rc<Lexer>,
    parser: LalrParser,
}

impl Engine {
    pub fn from_json(text: &str, options: EngineOptions) -> Result<Self, SkeinError> {
        Self::from_compiled(CompiledGrammar::from_json(text, &SerializeRegistry::standard())?, options)
    }

    pub fn from_value(value: &Value, options: EngineOptions) -> Result<Self, SkeinError> {
        Self::from_compiled(
            CompiledGrammar::from_value(value, &SerializeRegistry::standard())?,
            options,
        )
    }

    pub fn from_compiled(
        grammar: CompiledGrammar,
        options: EngineOptions,
    ) -> Result<Self, SkeinError> {
        if options.parser != "lalr" {
            return Err(err_msg!(
                Configuration,
                "parser '{}' is not available, only 'lalr' is",
                options.parser
            ));
        }
        if grammar.parser_type != "lalr" {
            return Err(err_msg!(
                Configuration,
                "table was compiled for parser '{}', only lalr tables can be loaded",
                grammar.parser_type
            ));
        }
        if matches!(grammar.lexer_type, LexerType::Dynamic | LexerType::DynamicComplete) {
            return Err(err_msg!(
                Configuration,
                "lexer_type '{}' requires an earley parser",
                grammar.lexer_type.as_str()
            ));
        }
        if options.use_bytes || grammar.use_bytes {
            return Err(err_msg!(Configuration, "byte-based lexing is not supported"));
        }
        for start in &options.start {
            if !grammar.table.start_states.contains_key(start) {
                return Err(err_msg!(
                    Configuration,
                    "start symbol '{start}' is not in the table's start states"
                ));
            }
        }
        if !options.maybe_placeholders
            && grammar.rules.iter().any(|r| !r.options.empty_indices.is_empty())
        {
            return Err(err_msg!(
                Configuration,
                "maybe_placeholders is off but the table's rules carry placeholder slots"
            ));
        }
        for flag in options.g_regex_flags.chars() {
            if !SUPPORTED_REGEX_FLAGS.contains(flag) {
                return Err(err_msg!(Configuration, "unsupported regex flag '{flag}'"));
            }
        }
        if options.debug {
            grammar.table.validate(&grammar.rules)?;
        }

        let mut lexer_conf = grammar.lexer_conf;
        for flag in options.g_regex_flags.chars() {
            lexer_conf.g_regex_flags.insert(flag);
        }
        lexer_conf.callbacks = options.lexer_callbacks.clone();

        let always_accept: Vec<String> = options
            .postlex
            .as_ref()
            .map(|post| post.borrow().always_accept())
            .unwrap_or_default();

        let builder = ParseTreeBuilder::new(
            options.propagate_positions.clone(),
            options.maybe_placeholders,
            options.keep_all_tokens,
            false,
        )?;
        let terminal_names: Vec<String> =
            lexer_conf.terminals.iter().map(|t| t.name.clone()).collect();
        let callbacks = builder.create_callbacks(
            &grammar.rules,
            &terminal_names,
            options.transformer.as_deref(),
        )?;

        let table = Rc::new(grammar.table);
        let parser =
            LalrParser::new(Rc::clone(&table), Rc::new(grammar.rules), Rc::new(callbacks));

        let run_contextual = match options.lexer {
            LexerChoice::Auto => grammar.lexer_type == LexerType::Contextual,
            LexerChoice::Basic => false,
            LexerChoice::Contextual => true,
        };
        let lexer = if run_contextual {
            let accepts = table.state_accepts();
            Lexer::Contextual(ContextualLexer::new(&lexer_conf, &accepts, &always_accept)?)
        } else {
            Lexer::Basic(BasicLexer::new(&lexer_conf)?)
        };

        Ok(Engine { options, lexer_conf, lexer: Rc::new(lexer), parser })
    }

    pub fn terminals(&self) -> &[TerminalDef] {
        &self.lexer_conf.terminals
    }

    /// Parses from the engine's single configured start symbol.
    pub fn parse(&self, text: &str) -> Result<Branch, SkeinError> {
        let start = self.sole_start()?.to_string();
        self.parse_with_start(text, &start)
    }

    pub fn parse_with_start(&self, text: &str, start: &str) -> Result<Branch, SkeinError> {
        self.check_start(start)?;
        self.parser
            .parse(self.thread_for(text), start)
            .map_err(|e| e.with_source(to_error_source(text)))
    }

    /// Parses with error recovery; see
    /// [`LalrParser::parse_with_recovery`] for the resumption contract.
    pub fn parse_with_recovery(
        &self,
        text: &str,
        start: Option<&str>,
        on_error: &mut dyn FnMut(&SkeinError) -> bool,
    ) -> Result<Branch, SkeinError> {
        let start = self.pick_start(start)?;
        self.parser
            .parse_with_recovery(self.thread_for(text), &start, on_error)
            .map_err(|e| e.with_source(to_error_source(text)))
    }

    /// Starts a parse the caller drives token by token.
    pub fn parse_interactive(
        &self,
        text: &str,
        start: Option<&str>,
    ) -> Result<InteractiveParser, SkeinError> {
        let start = self.pick_start(start)?;
        self.parser.parse_interactive(self.thread_for(text), &start)
    }

    /// Tokenizes without parsing, through a basic lexer over the engine's
    /// terminals. The parse lexer is untouched.
    pub fn lex(&self, text: &str) -> Result<TokenStream, SkeinError> {
        self.lex_with_conf(text, self.lexer_conf.clone())
    }

    /// Like [`lex`](Self::lex), but ignored terminals come through too.
    pub fn lex_unfiltered(&self, text: &str) -> Result<TokenStream, SkeinError> {
        let mut conf = self.lexer_conf.clone();
        conf.ignore.clear();
        self.lex_with_conf(text, conf)
    }

    fn lex_with_conf(&self, text: &str, conf: LexerConf) -> Result<TokenStream, SkeinError> {
        let basic = BasicLexer::new(&conf)?;
        let thread = LexerThread::new(
            Rc::new(Lexer::Basic(basic)),
            Rc::new(text.to_string()),
            self.options.postlex.clone(),
        );
        Ok(TokenStream { thread, source: to_error_source(text), done: false })
    }

    fn thread_for(&self, text: &str) -> LexerThread {
        LexerThread::new(
            Rc::clone(&self.lexer),
            Rc::new(text.to_string()),
            self.options.postlex.clone(),
        )
    }

    fn sole_start(&self) -> Result<&str, SkeinError> {
        match self.options.start.as_slice() {
            [only] => Ok(only),
            _ => Err(err_msg!(
                Configuration,
                "several start symbols are configured, pass one explicitly"
            )),
        }
    }

    fn check_start(&self, start: &str) -> Result<(), SkeinError> {
        if self.options.start.iter().any(|s| s == start) {
            return Ok(());
        }
        Err(err_msg!(Configuration, "start symbol '{start}' is not configured for this engine"))
    }

    fn pick_start(&self, start: Option<&str>) -> Result<String, SkeinError> {
        match start {
            Some(name) => {
                self.check_start(name)?;
                Ok(name.to_string())
            }
            None => Ok(self.sole_start()?.to_string()),
        }
    }
}

/// Lazy token iterator over a lexer thread; stops permanently after the
/// first error.
pub struct TokenStream {
    thread: LexerThread,
    source: SourceArc,
    done: bool,
}

impl Iterator for TokenStream {
    type Item = Result<Token, SkeinError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.thread.next_token(None) {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.with_source(SourceArc::clone(&self.source))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visit::Transformed;
    use serde_json::json;

    fn number_envelope() -> Value {
        json!({
            "memo": {
                "0": {
                    "__type__": "Rule",
                    "origin": {"__type__": "NonTerminal", "name": "start"},
                    "expansion": [
                        {"__type__": "Terminal", "name": "NUMBER", "filter_out": false}
                    ],
                    "order": 0,
                    "alias": null,
                    "options": {
                        "__type__": "RuleOptions",
                        "keep_all_tokens": false,
                        "expand1": false,
                        "priority": null,
                        "empty_indices": []
                    }
                },
                "1": {
                    "__type__": "TerminalDef",
                    "name": "NUMBER",
                    "pattern": {"__type__": "PatternRE", "value": "[0-9]+", "flags": []},
                    "priority": 0
                },
                "2": {
                    "__type__": "TerminalDef",
                    "name": "WS",
                    "pattern": {"__type__": "PatternRE", "value": "[ \\t]+", "flags": []},
                    "priority": 0
                }
            },
            "data": {
                "lexer_conf": {
                    "terminals": [{"@": 1}, {"@": 2}],
                    "ignore": ["WS"],
                    "g_regex_flags": "",
                    "use_bytes": false,
                    "lexer_type": "basic"
                },
                "parser_conf": {
                    "rules": [{"@": 0}],
                    "start": ["start"],
                    "parser_type": "lalr"
                },
                "parser": {
                    "tokens": {"0": "NUMBER", "1": "$END", "2": "start"},
                    "states": {
                        "0": {"0": [0, 2], "2": [0, 1]},
                        "1": {},
                        "2": {"1": [1, {"@": 0}]}
                    },
                    "start_states": {"start": 0},
                    "end_states": {"start": 1}
                }
            }
        })
    }

    #[test]
    fn test_parse_end_to_end() {
        let engine =
            Engine::from_value(&number_envelope(), EngineOptions::default()).expect("engine");
        let result = engine.parse(" 42 ").expect("parse");
        let tree = result.into_tree().expect("a tree");
        assert_eq!(tree.data, "start");
        assert_eq!(tree.children[0].as_token().expect("token").value, "42");
    }

    #[test]
    fn test_contextual_lexer_runs_against_lalr_table() {
        let mut envelope = number_envelope();
        envelope["data"]["lexer_conf"]["lexer_type"] = json!("contextual");
        let engine = Engine::from_value(&envelope, EngineOptions::default()).expect("engine");
        let tree = engine.parse("7").expect("parse").into_tree().expect("a tree");
        assert_eq!(tree.children[0].as_token().expect("token").value, "7");
    }

    #[test]
    fn test_dynamic_lexer_table_is_rejected() {
        let mut envelope = number_envelope();
        envelope["data"]["lexer_conf"]["lexer_type"] = json!("dynamic");
        let err = Engine::from_value(&envelope, EngineOptions::default())
            .err()
            .expect("dynamic lexer rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_use_bytes_is_rejected() {
        let mut envelope = number_envelope();
        envelope["data"]["lexer_conf"]["use_bytes"] = json!(true);
        let err = Engine::from_value(&envelope, EngineOptions::default())
            .err()
            .expect("byte tables rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");

        let options = EngineOptions { use_bytes: true, ..EngineOptions::default() };
        let err = Engine::from_value(&number_envelope(), options)
            .err()
            .expect("byte option rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_unknown_start_symbol_is_rejected() {
        let options =
            EngineOptions { start: vec!["missing".to_string()], ..EngineOptions::default() };
        let err = Engine::from_value(&number_envelope(), options)
            .err()
            .expect("unknown start rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_placeholder_contradiction_is_rejected() {
        let mut envelope = number_envelope();
        envelope["memo"]["0"]["options"]["empty_indices"] = json!([true, false]);
        let options = EngineOptions { maybe_placeholders: false, ..EngineOptions::default() };
        let err = Engine::from_value(&envelope, options)
            .err()
            .expect("contradictory options rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_unsupported_regex_flag_is_rejected() {
        let options =
            EngineOptions { g_regex_flags: "q".to_string(), ..EngineOptions::default() };
        let err =
            Engine::from_value(&number_envelope(), options).err().expect("bad flag rejected");
        assert!(matches!(err, SkeinError::Configuration { .. }), "got {err:?}");
    }

    #[test]
    fn test_debug_mode_cross_checks_the_table() {
        let mut envelope = number_envelope();
        envelope["data"]["parser"]["states"]["0"]
            .as_object_mut()
            .expect("object")
            .remove("2");
        // Decodes fine without the goto row; only the debug cross-check
        // notices the inconsistency.
        Engine::from_value(&envelope, EngineOptions::default()).expect("non-debug load");
        let options = EngineOptions { debug: true, ..EngineOptions::default() };
        let err = Engine::from_value(&envelope, options).err().expect("debug load fails");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }

    #[test]
    fn test_lex_respects_ignore_and_unfiltered_does_not() {
        let engine =
            Engine::from_value(&number_envelope(), EngineOptions::default()).expect("engine");
        let kinds: Vec<String> = engine
            .lex("1 2")
            .expect("lex")
            .map(|t| t.expect("token").kind)
            .collect();
        assert_eq!(kinds, ["NUMBER", "NUMBER"]);

        let kinds: Vec<String> = engine
            .lex_unfiltered("1 2")
            .expect("lex")
            .map(|t| t.expect("token").kind)
            .collect();
        assert_eq!(kinds, ["NUMBER", "WS", "NUMBER"]);
    }

    #[test]
    fn test_parse_interactive_drives_to_completion() {
        let engine =
            Engine::from_value(&number_envelope(), EngineOptions::default()).expect("engine");
        let mut parser = engine.parse_interactive("42", None).expect("interactive");
        parser.exhaust_lexer().expect("tokens all fit");
        parser.feed_eof().expect("accept");
        let tree = parser.result.expect("a result").into_tree().expect("a tree");
        assert_eq!(tree.data, "start");
    }

    #[test]
    fn test_in_parse_transformer_replaces_trees() {
        let transformer = Transformer::new()
            .on_token("NUMBER", |token| {
                let value: i64 = token
                    .value
                    .parse()
                    .map_err(|_| err_msg!(Configuration, "bad number {:?}", token.value))?;
                Ok(Transformed::Value(Branch::custom(value)))
            })
            .on_rule("start", |children| {
                let total: i64 = children.iter().filter_map(|c| c.custom_ref::<i64>()).sum();
                Ok(Transformed::Value(Branch::custom(total)))
            });
        let options =
            EngineOptions { transformer: Some(Rc::new(transformer)), ..EngineOptions::default() };
        let engine = Engine::from_value(&number_envelope(), options).expect("engine");
        let result = engine.parse("42").expect("parse");
        assert_eq!(result.custom_ref::<i64>(), Some(&42));
    }
}
