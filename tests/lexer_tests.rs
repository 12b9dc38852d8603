//! Lexing through the engine: positions, priorities, callbacks, and the
//! contextual lexer's parser-state awareness.

mod common;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use common::{command_envelope, letters_envelope, sketch};
use skein::lexer::{PostLex, TokenCallback};
use skein::{Engine, EngineOptions, LexerChoice, SkeinError, Token};

// ---
// Standalone lexing
// ---

#[test]
fn test_lex_reports_positions() {
    let engine =
        Engine::from_value(&letters_envelope(), EngineOptions::default()).expect("engine");
    let tokens: Vec<Token> =
        engine.lex("a b").expect("lex").map(|t| t.expect("token")).collect();
    assert_eq!(tokens.len(), 2);

    assert_eq!(tokens[0].kind, "A");
    assert_eq!(tokens[0].start_pos, Some(0));
    assert_eq!(tokens[0].end_pos, Some(1));
    assert_eq!(tokens[0].line, Some(1));
    assert_eq!(tokens[0].column, Some(1));

    assert_eq!(tokens[1].kind, "B");
    assert_eq!(tokens[1].start_pos, Some(2));
    assert_eq!(tokens[1].column, Some(3));
}

#[test]
fn test_lex_unfiltered_keeps_ignored_whitespace() {
    let engine =
        Engine::from_value(&letters_envelope(), EngineOptions::default()).expect("engine");
    let kinds: Vec<String> = engine
        .lex_unfiltered("a b")
        .expect("lex")
        .map(|t| t.expect("token").kind)
        .collect();
    assert_eq!(kinds, ["A", "WS", "B"]);
}

#[test]
fn test_priority_breaks_length_ties() {
    let engine =
        Engine::from_value(&command_envelope(), EngineOptions::default()).expect("engine");
    let kinds: Vec<String> =
        engine.lex("print").expect("lex").map(|t| t.expect("token").kind).collect();
    assert_eq!(kinds, ["CMD"]);
}

// ---
// Contextual lexing
// ---

#[test]
fn test_contextual_lexer_follows_parser_state() {
    // The second `print` can only be a NAME, and only the contextual lexer
    // knows that.
    let engine =
        Engine::from_value(&command_envelope(), EngineOptions::default()).expect("engine");
    let result = engine.parse("print print").expect("parse should succeed");
    assert_eq!(sketch(&result), "start(CMD:print NAME:print)");
}

#[test]
fn test_basic_lexer_cannot_reclassify() {
    let options = EngineOptions { lexer: LexerChoice::Basic, ..EngineOptions::default() };
    let engine = Engine::from_value(&command_envelope(), options).expect("engine");
    let err = engine.parse("print print").err().expect("basic lexing fails here");
    match err {
        SkeinError::UnexpectedToken { token, expected, .. } => {
            assert_eq!(token.kind, "CMD");
            assert!(expected.contains(&"NAME".to_string()), "expected {expected:?}");
        }
        other => panic!("expected an unexpected-token error, got {other:?}"),
    }
}

// ---
// Token callbacks and post-lexing
// ---

#[test]
fn test_lexer_callbacks_rewrite_matches() {
    let mut callbacks: HashMap<String, TokenCallback> = HashMap::new();
    callbacks.insert(
        "B".to_string(),
        Rc::new(|token: Token| {
            let upper = token.value.to_uppercase();
            token.update(None, Some(&upper))
        }),
    );
    let options = EngineOptions { lexer_callbacks: callbacks, ..EngineOptions::default() };
    let engine = Engine::from_value(&letters_envelope(), options).expect("engine");
    let result = engine.parse("a b b").expect("parse should succeed");
    assert_eq!(sketch(&result), "start(B:B B:B)");
}

/// Swallows `M` tokens and counts them, the way an indentation post-lexer
/// swallows newlines.
struct MarkFilter {
    seen: usize,
}

impl PostLex for MarkFilter {
    fn process_token(&mut self, token: Token, out: &mut VecDeque<Token>) {
        if token.kind == "M" {
            self.seen += 1;
        } else {
            out.push_back(token);
        }
    }

    fn always_accept(&self) -> Vec<String> {
        vec!["M".to_string()]
    }
}

#[test]
fn test_postlex_runs_between_lexer_and_parser() {
    // No parser state asks for M; the lexer only produces it because the
    // post-lexer declares it in always_accept.
    let filter = Rc::new(RefCell::new(MarkFilter { seen: 0 }));
    let options = EngineOptions {
        lexer: LexerChoice::Contextual,
        postlex: Some(filter.clone()),
        ..EngineOptions::default()
    };
    let engine = Engine::from_value(&letters_envelope(), options).expect("engine");
    let result = engine.parse("a . b").expect("parse should succeed");
    assert_eq!(sketch(&result), "start(B:b)");
    assert_eq!(filter.borrow().seen, 1);
}
