//! # Skein Test Grammars
//!
//! Hand-built table envelopes shared by the integration tests, in the JSON
//! form a grammar compiler emits. Each grammar is small enough that its
//! states can be checked by hand against the rule set.

#![allow(dead_code)]

use serde_json::{json, Value};
use skein::Branch;

pub fn nt(name: &str) -> Value {
    json!({"__type__": "NonTerminal", "name": name})
}

pub fn sym(name: &str) -> Value {
    json!({"__type__": "Terminal", "name": name, "filter_out": false})
}

/// A terminal the tree builder drops, like an inlined literal.
pub fn hidden(name: &str) -> Value {
    json!({"__type__": "Terminal", "name": name, "filter_out": true})
}

pub fn rule(
    origin: &str,
    expansion: Vec<Value>,
    order: usize,
    alias: Option<&str>,
    empty_indices: Vec<bool>,
) -> Value {
    json!({
        "__type__": "Rule",
        "origin": nt(origin),
        "expansion": expansion,
        "order": order,
        "alias": match alias {
            Some(name) => json!(name),
            None => Value::Null,
        },
        "options": {
            "__type__": "RuleOptions",
            "keep_all_tokens": false,
            "expand1": false,
            "priority": null,
            "empty_indices": empty_indices
        }
    })
}

pub fn re_def(name: &str, pattern: &str, priority: i64) -> Value {
    json!({
        "__type__": "TerminalDef",
        "name": name,
        "pattern": {"__type__": "PatternRE", "value": pattern, "flags": []},
        "priority": priority
    })
}

pub fn str_def(name: &str, literal: &str, priority: i64) -> Value {
    json!({
        "__type__": "TerminalDef",
        "name": name,
        "pattern": {"__type__": "PatternStr", "value": literal, "flags": []},
        "priority": priority
    })
}

fn envelope(
    memo: Value,
    terminals: Vec<Value>,
    ignore: Vec<&str>,
    lexer_type: &str,
    rules: Vec<Value>,
    parser: Value,
) -> Value {
    json!({
        "memo": memo,
        "data": {
            "lexer_conf": {
                "terminals": terminals,
                "ignore": ignore,
                "g_regex_flags": "",
                "use_bytes": false,
                "lexer_type": lexer_type
            },
            "parser_conf": {
                "rules": rules,
                "start": ["start"],
                "parser_type": "lalr"
            },
            "parser": parser
        }
    })
}

fn back(index: usize) -> Value {
    json!({"@": index})
}

/// `start: A __bs` / `__bs: __bs B | B`, i.e. `start: "a" B+` with the "a"
/// inlined away and the underscore rule spliced. `M` (a literal dot) is
/// defined for the lexer but appears in no parser state, which is exactly
/// what a post-lexer's synthetic input looks like. Whitespace is ignored.
///
/// States: 0 is the entry (shift A), 2 expects the first B, 3 holds a
/// finished `start` that may still grow, 4/5 reduce the two `__bs` bodies.
pub fn letters_envelope() -> Value {
    let memo = json!({
        "0": rule("start", vec![hidden("A"), nt("__bs")], 0, None, vec![]),
        "1": rule("__bs", vec![nt("__bs"), sym("B")], 0, None, vec![]),
        "2": rule("__bs", vec![sym("B")], 1, None, vec![]),
        "3": re_def("A", "a", 0),
        "4": re_def("B", "b", 0),
        "5": re_def("WS", "[ \\t]+", 0),
        "6": str_def("M", ".", 0),
    });
    let parser = json!({
        "tokens": {"0": "A", "1": "B", "2": "$END", "3": "start", "4": "__bs"},
        "states": {
            "0": {"0": [0, 2], "3": [0, 1]},
            "1": {},
            "2": {"1": [0, 4], "4": [0, 3]},
            "3": {"1": [0, 5], "2": [1, {"@": 0}]},
            "4": {"1": [1, {"@": 2}], "2": [1, {"@": 2}]},
            "5": {"1": [1, {"@": 1}], "2": [1, {"@": 1}]}
        },
        "start_states": {"start": 0},
        "end_states": {"start": 1}
    });
    envelope(
        memo,
        vec![back(3), back(4), back(5), back(6)],
        vec!["WS"],
        "basic",
        vec![back(0), back(1), back(2)],
        parser,
    )
}

/// `start: A B C | A C`, the second body compiled from `start: A [B] C`
/// with the missing `B` recorded in `empty_indices` and the short body
/// aliased to `short`. Whitespace is ignored.
pub fn optional_envelope() -> Value {
    let memo = json!({
        "0": rule("start", vec![sym("A"), sym("B"), sym("C")], 0, None, vec![]),
        "1": rule("start", vec![sym("A"), sym("C")], 1, Some("short"), vec![false, true, false]),
        "2": re_def("A", "a", 0),
        "3": re_def("B", "b", 0),
        "4": re_def("C", "c", 0),
        "5": re_def("WS", "[ \\t]+", 0),
    });
    let parser = json!({
        "tokens": {"0": "A", "1": "B", "2": "C", "3": "$END", "4": "start"},
        "states": {
            "0": {"0": [0, 2], "4": [0, 1]},
            "1": {},
            "2": {"1": [0, 3], "2": [0, 4]},
            "3": {"2": [0, 5]},
            "4": {"3": [1, {"@": 1}]},
            "5": {"3": [1, {"@": 0}]}
        },
        "start_states": {"start": 0},
        "end_states": {"start": 1}
    });
    envelope(
        memo,
        vec![back(2), back(3), back(4), back(5)],
        vec!["WS"],
        "basic",
        vec![back(0), back(1)],
        parser,
    )
}

/// `start: CMD NAME` where `CMD` is the literal `print` and `NAME` matches
/// any lowercase word, so `print print` only parses when the lexer knows
/// which state it is in. Compiled for the contextual lexer.
pub fn command_envelope() -> Value {
    let memo = json!({
        "0": rule("start", vec![sym("CMD"), sym("NAME")], 0, None, vec![]),
        "1": str_def("CMD", "print", 1),
        "2": re_def("NAME", "[a-z]+", 0),
        "3": re_def("WS", "[ ]+", 0),
    });
    let parser = json!({
        "tokens": {"0": "CMD", "1": "NAME", "2": "$END", "3": "start"},
        "states": {
            "0": {"0": [0, 2], "3": [0, 1]},
            "1": {},
            "2": {"1": [0, 3]},
            "3": {"2": [1, {"@": 0}]}
        },
        "start_states": {"start": 0},
        "end_states": {"start": 1}
    });
    envelope(
        memo,
        vec![back(1), back(2), back(3)],
        vec!["WS"],
        "contextual",
        vec![back(0)],
        parser,
    )
}

/// Compact one-line rendering of a parse result, for shape assertions:
/// trees become `label(child child)`, tokens `KIND:value`, placeholders `_`.
pub fn sketch(branch: &Branch) -> String {
    match branch {
        Branch::Tree(tree) => {
            let children: Vec<String> = tree.children.iter().map(sketch).collect();
            format!("{}({})", tree.data, children.join(" "))
        }
        Branch::Token(token) => format!("{}:{}", token.kind, token.value),
        Branch::Null => "_".to_string(),
        Branch::Custom(_) => "<custom>".to_string(),
    }
}
