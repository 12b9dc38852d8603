//! Decoding of compiled grammar tables from their JSON envelope.
//!
//! A table file is `{ "data": ..., "memo": ... }`. The memo maps
//! decimal-string indices to typed objects (rules and terminal
//! definitions); everywhere else those objects appear as `{"@": n}`
//! back-references. Typed payloads carry a `"__type__"` tag that is
//! resolved against an explicit [`SerializeRegistry`]. Anything off-shape
//! is a fatal [`SkeinError::MalformedTable`] naming the offender; extra
//! fields are ignored.
//!
//! State ids in the file may be sparse. Decoding renumbers them densely in
//! ascending order so [`ParseTable::states`] can be a plain vector, and
//! rewrites shift targets and start/end states to match.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::grammar::{Pattern, Rule, RuleOptions, Symbol, TerminalDef};
use crate::lexer::LexerConf;
use crate::parser::{Action, ParseTable};
use crate::{err_msg, SkeinError};

/// The lexer strategy a table was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexerType {
    Basic,
    Contextual,
    Dynamic,
    DynamicComplete,
}

impl LexerType {
    fn from_tag(tag: &str) -> Result<Self, SkeinError> {
        Ok(match tag {
            "basic" => LexerType::Basic,
            "contextual" => LexerType::Contextual,
            "dynamic" => LexerType::Dynamic,
            "dynamic_complete" => LexerType::DynamicComplete,
            other => return Err(err_msg!(MalformedTable, "unknown lexer_type '{other}'")),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LexerType::Basic => "basic",
            LexerType::Contextual => "contextual",
            LexerType::Dynamic => "dynamic",
            LexerType::DynamicComplete => "dynamic_complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Terminal,
    NonTerminal,
    RuleOptions,
    PatternStr,
    PatternRE,
    TerminalDef,
    Rule,
    ParseTable,
}

/// Maps `__type__` tag names to decoders. A tag absent from the registry
/// is rejected, so a caller controls exactly which payload types a table
/// file may carry.
pub struct SerializeRegistry {
    tags: HashMap<&'static str, TypeTag>,
}

impl SerializeRegistry {
    /// All the types a compiled table uses.
    pub fn standard() -> Self {
        let mut tags = HashMap::new();
        tags.insert("Terminal", TypeTag::Terminal);
        tags.insert("NonTerminal", TypeTag::NonTerminal);
        tags.insert("RuleOptions", TypeTag::RuleOptions);
        tags.insert("PatternStr", TypeTag::PatternStr);
        tags.insert("PatternRE", TypeTag::PatternRE);
        tags.insert("TerminalDef", TypeTag::TerminalDef);
        tags.insert("Rule", TypeTag::Rule);
        tags.insert("ParseTable", TypeTag::ParseTable);
        SerializeRegistry { tags }
    }

    fn resolve(&self, name: &str, what: &str) -> Result<TypeTag, SkeinError> {
        self.tags
            .get(name)
            .copied()
            .ok_or_else(|| err_msg!(MalformedTable, "{what}: unknown __type__ '{name}'"))
    }
}

/// A decoded table file: everything the frontend needs to assemble a
/// working parser.
pub struct CompiledGrammar {
    pub lexer_conf: LexerConf,
    pub lexer_type: LexerType,
    pub use_bytes: bool,
    pub rules: Vec<Rc<Rule>>,
    pub start: Vec<String>,
    pub parser_type: String,
    pub table: ParseTable,
}

impl CompiledGrammar {
    pub fn from_json(text: &str, registry: &SerializeRegistry) -> Result<Self, SkeinError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| err_msg!(MalformedTable, "table is not valid JSON: {e}"))?;
        Self::from_value(&value, registry)
    }

    pub fn from_value(value: &Value, registry: &SerializeRegistry) -> Result<Self, SkeinError> {
        let root = as_object(value, "table envelope")?;
        let mut decoder = Decoder { registry, memo: HashMap::new() };
        decoder.decode_memo(field(root, "memo", "table envelope")?)?;

        let data = as_object(field(root, "data", "table envelope")?, "table data")?;
        let (lexer_conf, lexer_type, use_bytes) =
            decoder.decode_lexer_conf(field(data, "lexer_conf", "table data")?)?;
        let (rules, start, parser_type) =
            decoder.decode_parser_conf(field(data, "parser_conf", "table data")?)?;
        let table = decoder.decode_parse_table(field(data, "parser", "table data")?, &rules)?;

        Ok(CompiledGrammar { lexer_conf, lexer_type, use_bytes, rules, start, parser_type, table })
    }
}

#[derive(Clone)]
enum MemoEntry {
    Rule(Rc<Rule>),
    TerminalDef(Rc<TerminalDef>),
}

struct Decoder<'a> {
    registry: &'a SerializeRegistry,
    memo: HashMap<usize, MemoEntry>,
}

impl Decoder<'_> {
    fn decode_memo(&mut self, value: &Value) -> Result<(), SkeinError> {
        let obj = as_object(value, "memo")?;
        let mut entries: Vec<(usize, &Value)> = Vec::with_capacity(obj.len());
        for (key, entry) in obj {
            entries.push((parse_index(key, "memo index")?, entry));
        }
        entries.sort_unstable_by_key(|(index, _)| *index);
        for (index, entry_value) in entries {
            let entry_obj = as_object(entry_value, "memo entry")?;
            let tag_name = as_str(field(entry_obj, "__type__", "memo entry")?, "memo entry type")?;
            let entry = match self.registry.resolve(tag_name, "memo entry")? {
                TypeTag::Rule => MemoEntry::Rule(self.decode_rule(entry_value, "memoized rule")?),
                TypeTag::TerminalDef => {
                    MemoEntry::TerminalDef(self.decode_terminal_def(entry_value, "memoized terminal")?)
                }
                _ => {
                    return Err(err_msg!(
                        MalformedTable,
                        "memo entry {index}: type '{tag_name}' is not memoized"
                    ))
                }
            };
            self.memo.insert(index, entry);
        }
        Ok(())
    }

    fn lookup(&self, index_value: &Value, what: &str) -> Result<&MemoEntry, SkeinError> {
        let index = as_usize(index_value, "back-reference index")?;
        self.memo
            .get(&index)
            .ok_or_else(|| err_msg!(MalformedTable, "{what}: dangling back-reference @{index}"))
    }

    fn decode_rule(&self, value: &Value, what: &str) -> Result<Rc<Rule>, SkeinError> {
        if let Some(index) = back_ref(value) {
            return match self.lookup(index, what)? {
                MemoEntry::Rule(rule) => Ok(Rc::clone(rule)),
                MemoEntry::TerminalDef(_) => Err(err_msg!(
                    MalformedTable,
                    "{what}: back-reference resolves to a terminal, expected a rule"
                )),
            };
        }
        let obj = self.typed_object(value, TypeTag::Rule, what)?;
        let origin = self.decode_symbol(field(obj, "origin", what)?, "rule origin")?;
        let expansion = as_array(field(obj, "expansion", what)?, "rule expansion")?
            .iter()
            .map(|sym| self.decode_symbol(sym, "rule expansion symbol"))
            .collect::<Result<Vec<_>, _>>()?;
        let order = as_usize(field(obj, "order", what)?, "rule order")?;
        let alias_value = field(obj, "alias", what)?;
        let alias = if alias_value.is_null() {
            None
        } else {
            Some(as_str(alias_value, "rule alias")?.to_string())
        };
        let options = self.decode_options(field(obj, "options", what)?)?;
        Ok(Rc::new(Rule { origin, expansion, order, alias, options }))
    }

    fn decode_terminal_def(&self, value: &Value, what: &str) -> Result<Rc<TerminalDef>, SkeinError> {
        if let Some(index) = back_ref(value) {
            return match self.lookup(index, what)? {
                MemoEntry::TerminalDef(def) => Ok(Rc::clone(def)),
                MemoEntry::Rule(_) => Err(err_msg!(
                    MalformedTable,
                    "{what}: back-reference resolves to a rule, expected a terminal"
                )),
            };
        }
        let obj = self.typed_object(value, TypeTag::TerminalDef, what)?;
        let name = as_str(field(obj, "name", what)?, "terminal name")?.to_string();
        let pattern = self.decode_pattern(field(obj, "pattern", what)?)?;
        let priority = as_i64(field(obj, "priority", what)?, "terminal priority")?;
        Ok(Rc::new(TerminalDef { name, pattern, priority }))
    }

    fn decode_symbol(&self, value: &Value, what: &str) -> Result<Symbol, SkeinError> {
        let obj = as_object(value, what)?;
        let tag_name = as_str(field(obj, "__type__", what)?, what)?;
        match self.registry.resolve(tag_name, what)? {
            TypeTag::Terminal => Ok(Symbol::Terminal {
                name: as_str(field(obj, "name", what)?, what)?.to_string(),
                filter_out: as_bool(field(obj, "filter_out", what)?, what)?,
            }),
            TypeTag::NonTerminal => Ok(Symbol::NonTerminal {
                name: as_str(field(obj, "name", what)?, what)?.to_string(),
            }),
            _ => Err(err_msg!(MalformedTable, "{what}: '{tag_name}' is not a symbol type")),
        }
    }

    fn decode_pattern(&self, value: &Value) -> Result<Pattern, SkeinError> {
        let what = "pattern";
        let obj = as_object(value, what)?;
        let tag_name = as_str(field(obj, "__type__", what)?, what)?;
        let raw = as_str(field(obj, "value", what)?, "pattern value")?;
        let flags = decode_flags(field(obj, "flags", what)?)?;
        let mut pattern = match self.registry.resolve(tag_name, what)? {
            TypeTag::PatternStr => Pattern::literal(raw),
            TypeTag::PatternRE => Pattern::regex(raw),
            _ => {
                return Err(err_msg!(MalformedTable, "{what}: '{tag_name}' is not a pattern type"))
            }
        };
        pattern.add_flags(&flags);
        // Tables carry the compiler's width analysis; keeping it saves
        // re-deriving the bounds from the pattern.
        if let (Some(raw_width), Pattern::Regex { width, .. }) = (obj.get("_width"), &mut pattern) {
            let pair = as_array(raw_width, "pattern width")?;
            if pair.len() != 2 {
                return Err(err_msg!(MalformedTable, "pattern width: expected [min, max]"));
            }
            let min = as_usize(&pair[0], "pattern width")?;
            let max = as_usize(&pair[1], "pattern width")?;
            *width = Some((min, max));
        }
        Ok(pattern)
    }

    fn decode_options(&self, value: &Value) -> Result<RuleOptions, SkeinError> {
        let what = "rule options";
        let obj = self.typed_object(value, TypeTag::RuleOptions, what)?;
        let priority_value = field(obj, "priority", what)?;
        let priority = if priority_value.is_null() {
            None
        } else {
            Some(as_i64(priority_value, "rule priority")?)
        };
        let empty_indices = as_array(field(obj, "empty_indices", what)?, "empty_indices")?
            .iter()
            .map(|flag| as_bool(flag, "empty_indices entry"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleOptions {
            keep_all_tokens: as_bool(field(obj, "keep_all_tokens", what)?, what)?,
            expand1: as_bool(field(obj, "expand1", what)?, what)?,
            priority,
            empty_indices,
        })
    }

    fn decode_lexer_conf(
        &self,
        value: &Value,
    ) -> Result<(LexerConf, LexerType, bool), SkeinError> {
        let what = "lexer_conf";
        let obj = as_object(value, what)?;
        let mut terminals = Vec::new();
        for def in as_array(field(obj, "terminals", what)?, "lexer_conf.terminals")? {
            terminals.push((*self.decode_terminal_def(def, "lexer terminal")?).clone());
        }
        let ignore = as_array(field(obj, "ignore", what)?, "lexer_conf.ignore")?
            .iter()
            .map(|name| Ok(as_str(name, "ignored terminal name")?.to_string()))
            .collect::<Result<Vec<_>, SkeinError>>()?;
        let flags = as_str(field(obj, "g_regex_flags", what)?, "lexer_conf.g_regex_flags")?;
        let use_bytes = as_bool(field(obj, "use_bytes", what)?, "lexer_conf.use_bytes")?;
        let lexer_type =
            LexerType::from_tag(as_str(field(obj, "lexer_type", what)?, "lexer_conf.lexer_type")?)?;
        let mut conf = LexerConf::new(terminals, ignore);
        conf.g_regex_flags = flags.chars().collect();
        Ok((conf, lexer_type, use_bytes))
    }

    fn decode_parser_conf(
        &self,
        value: &Value,
    ) -> Result<(Vec<Rc<Rule>>, Vec<String>, String), SkeinError> {
        let what = "parser_conf";
        let obj = as_object(value, what)?;
        let rules = as_array(field(obj, "rules", what)?, "parser_conf.rules")?
            .iter()
            .map(|rule| self.decode_rule(rule, "grammar rule"))
            .collect::<Result<Vec<_>, _>>()?;
        let start = as_array(field(obj, "start", what)?, "parser_conf.start")?
            .iter()
            .map(|name| Ok(as_str(name, "start symbol")?.to_string()))
            .collect::<Result<Vec<_>, SkeinError>>()?;
        let parser_type = as_str(field(obj, "parser_type", what)?, "parser_conf.parser_type")?;
        Ok((rules, start, parser_type.to_string()))
    }

    fn decode_parse_table(
        &self,
        value: &Value,
        rules: &[Rc<Rule>],
    ) -> Result<ParseTable, SkeinError> {
        let what = "parser table";
        let obj = as_object(value, what)?;
        if let Some(tag_value) = obj.get("__type__") {
            let tag_name = as_str(tag_value, "parser table type")?;
            if self.registry.resolve(tag_name, what)? != TypeTag::ParseTable {
                return Err(err_msg!(
                    MalformedTable,
                    "{what}: expected a ParseTable, found '{tag_name}'"
                ));
            }
        }

        let tokens_obj = as_object(field(obj, "tokens", what)?, "token enumeration")?;
        let mut token_names: HashMap<usize, String> = HashMap::with_capacity(tokens_obj.len());
        for (key, name) in tokens_obj {
            token_names.insert(parse_index(key, "token id")?, as_str(name, "token name")?.to_string());
        }

        let states_obj = as_object(field(obj, "states", what)?, "parser states")?;
        let mut ordered: Vec<(usize, &Value)> = Vec::with_capacity(states_obj.len());
        for (key, row) in states_obj {
            ordered.push((parse_index(key, "state id")?, row));
        }
        ordered.sort_unstable_by_key(|(id, _)| *id);
        let dense: HashMap<usize, usize> =
            ordered.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

        let mut rule_ids: HashMap<Rc<Rule>, usize> = HashMap::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            rule_ids.insert(Rc::clone(rule), i);
        }

        let mut states = Vec::with_capacity(ordered.len());
        for (_, row_value) in &ordered {
            let row_obj = as_object(row_value, "parser state row")?;
            let mut row = HashMap::with_capacity(row_obj.len());
            for (token_key, action_value) in row_obj {
                let token_id = parse_index(token_key, "state row token id")?;
                let name = token_names.get(&token_id).ok_or_else(|| {
                    err_msg!(MalformedTable, "state row references unknown token id {token_id}")
                })?;
                let entry = as_array(action_value, "state action")?;
                if entry.len() != 2 {
                    return Err(err_msg!(
                        MalformedTable,
                        "state action for '{name}' is not a [kind, argument] pair"
                    ));
                }
                let action = match as_usize(&entry[0], "state action kind")? {
                    0 => {
                        let target = as_usize(&entry[1], "shift target")?;
                        let mapped = dense.get(&target).ok_or_else(|| {
                            err_msg!(
                                MalformedTable,
                                "shift on '{name}' targets unknown state {target}"
                            )
                        })?;
                        Action::Shift(*mapped)
                    }
                    1 => {
                        let rule = self.decode_rule(&entry[1], "reduce rule")?;
                        let id = rule_ids.get(&rule).ok_or_else(|| {
                            err_msg!(
                                MalformedTable,
                                "reduce on '{name}' references a rule missing from the rule list: {rule}"
                            )
                        })?;
                        Action::Reduce(*id)
                    }
                    other => {
                        return Err(err_msg!(
                            MalformedTable,
                            "state action kind {other} is not shift (0) or reduce (1)"
                        ))
                    }
                };
                row.insert(name.clone(), action);
            }
            states.push(row);
        }

        let start_states =
            decode_state_map(field(obj, "start_states", what)?, &dense, "start state")?;
        let end_states = decode_state_map(field(obj, "end_states", what)?, &dense, "end state")?;
        Ok(ParseTable { states, start_states, end_states })
    }

    fn typed_object<'v>(
        &self,
        value: &'v Value,
        expected: TypeTag,
        what: &str,
    ) -> Result<&'v Map<String, Value>, SkeinError> {
        let obj = as_object(value, what)?;
        let tag_name = as_str(field(obj, "__type__", what)?, what)?;
        let tag = self.registry.resolve(tag_name, what)?;
        if tag != expected {
            return Err(err_msg!(
                MalformedTable,
                "{what}: expected {expected:?}, found '{tag_name}'"
            ));
        }
        Ok(obj)
    }
}

fn decode_state_map(
    value: &Value,
    dense: &HashMap<usize, usize>,
    what: &str,
) -> Result<HashMap<String, usize>, SkeinError> {
    let obj = as_object(value, what)?;
    let mut out = HashMap::with_capacity(obj.len());
    for (start, state_value) in obj {
        let state = as_usize(state_value, what)?;
        let mapped = dense
            .get(&state)
            .ok_or_else(|| err_msg!(MalformedTable, "{what} for '{start}' is not a known state"))?;
        out.insert(start.clone(), *mapped);
    }
    Ok(out)
}

fn decode_flags(value: &Value) -> Result<crate::grammar::FlagSet, SkeinError> {
    let mut flags = crate::grammar::FlagSet::new();
    for entry in as_array(value, "pattern flags")? {
        let flag = as_str(entry, "pattern flag")?;
        let mut chars = flag.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                flags.insert(c);
            }
            _ => {
                return Err(err_msg!(
                    MalformedTable,
                    "pattern flag '{flag}' is not a single character"
                ))
            }
        }
    }
    Ok(flags)
}

fn back_ref(value: &Value) -> Option<&Value> {
    value.as_object().and_then(|obj| obj.get("@"))
}

fn parse_index(key: &str, what: &str) -> Result<usize, SkeinError> {
    key.parse().map_err(|_| err_msg!(MalformedTable, "{what} '{key}' is not a number"))
}

fn as_object<'v>(value: &'v Value, what: &str) -> Result<&'v Map<String, Value>, SkeinError> {
    value.as_object().ok_or_else(|| err_msg!(MalformedTable, "{what} is not an object"))
}

fn field<'v>(obj: &'v Map<String, Value>, name: &str, what: &str) -> Result<&'v Value, SkeinError> {
    obj.get(name).ok_or_else(|| err_msg!(MalformedTable, "{what} is missing field '{name}'"))
}

fn as_array<'v>(value: &'v Value, what: &str) -> Result<&'v Vec<Value>, SkeinError> {
    value.as_array().ok_or_else(|| err_msg!(MalformedTable, "{what} is not an array"))
}

fn as_str<'v>(value: &'v Value, what: &str) -> Result<&'v str, SkeinError> {
    value.as_str().ok_or_else(|| err_msg!(MalformedTable, "{what} is not a string"))
}

fn as_bool(value: &Value, what: &str) -> Result<bool, SkeinError> {
    value.as_bool().ok_or_else(|| err_msg!(MalformedTable, "{what} is not a boolean"))
}

fn as_usize(value: &Value, what: &str) -> Result<usize, SkeinError> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| err_msg!(MalformedTable, "{what} is not a non-negative integer"))
}

fn as_i64(value: &Value, what: &str) -> Result<i64, SkeinError> {
    value.as_i64().ok_or_else(|| err_msg!(MalformedTable, "{what} is not an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_envelope() -> Value {
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
                }
            },
            "data": {
                "lexer_conf": {
                    "terminals": [{"@": 1}],
                    "ignore": [],
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

    fn decode(value: &Value) -> Result<CompiledGrammar, SkeinError> {
        CompiledGrammar::from_value(value, &SerializeRegistry::standard())
    }

    #[test]
    fn test_decodes_minimal_envelope() {
        let grammar = decode(&minimal_envelope()).expect("decode");
        assert_eq!(grammar.lexer_type, LexerType::Basic);
        assert!(!grammar.use_bytes);
        assert_eq!(grammar.parser_type, "lalr");
        assert_eq!(grammar.start, ["start"]);
        assert_eq!(grammar.rules.len(), 1);
        assert_eq!(grammar.rules[0].origin.name(), "start");
        assert_eq!(grammar.lexer_conf.terminals.len(), 1);
        assert_eq!(grammar.lexer_conf.terminals[0].name, "NUMBER");
        assert!(!grammar.lexer_conf.terminals[0].pattern.is_literal());

        assert_eq!(grammar.table.states.len(), 3);
        assert_eq!(grammar.table.states[0].get("NUMBER"), Some(&Action::Shift(2)));
        assert_eq!(grammar.table.states[0].get("start"), Some(&Action::Shift(1)));
        assert_eq!(grammar.table.states[2].get("$END"), Some(&Action::Reduce(0)));
        assert_eq!(grammar.table.start_states.get("start"), Some(&0));
        assert_eq!(grammar.table.end_states.get("start"), Some(&1));
    }

    #[test]
    fn test_sparse_state_ids_are_renumbered() {
        let mut envelope = minimal_envelope();
        envelope["data"]["parser"] = json!({
            "tokens": {"0": "NUMBER", "1": "$END", "2": "start"},
            "states": {
                "10": {"0": [0, 30], "2": [0, 20]},
                "20": {},
                "30": {"1": [1, {"@": 0}]}
            },
            "start_states": {"start": 10},
            "end_states": {"start": 20}
        });
        let grammar = decode(&envelope).expect("decode");
        assert_eq!(grammar.table.states.len(), 3);
        assert_eq!(grammar.table.states[0].get("NUMBER"), Some(&Action::Shift(2)));
        assert_eq!(grammar.table.start_states.get("start"), Some(&0));
        assert_eq!(grammar.table.end_states.get("start"), Some(&1));
    }

    #[test]
    fn test_inline_reduce_rule_matches_by_rule_identity() {
        let mut envelope = minimal_envelope();
        envelope["data"]["parser"]["states"]["2"]["1"] = json!([1, {
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
        }]);
        let grammar = decode(&envelope).expect("decode");
        assert_eq!(grammar.table.states[2].get("$END"), Some(&Action::Reduce(0)));
    }

    #[test]
    fn test_reduce_to_unlisted_rule_is_rejected() {
        let mut envelope = minimal_envelope();
        envelope["data"]["parser"]["states"]["2"]["1"] = json!([1, {
            "__type__": "Rule",
            "origin": {"__type__": "NonTerminal", "name": "other"},
            "expansion": [],
            "order": 0,
            "alias": null,
            "options": {
                "__type__": "RuleOptions",
                "keep_all_tokens": false,
                "expand1": false,
                "priority": null,
                "empty_indices": []
            }
        }]);
        let err = decode(&envelope).err().expect("unlisted rule rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }

    #[test]
    fn test_missing_field_is_fatal() {
        let mut envelope = minimal_envelope();
        envelope["data"]["parser"].as_object_mut().expect("object").remove("states");
        let err = decode(&envelope).err().expect("missing field rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
        assert!(err.to_string().contains("states"), "got {err}");
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut envelope = minimal_envelope();
        envelope["memo"]["0"]["__type__"] = json!("Widget");
        let err = decode(&envelope).err().expect("unknown type rejected");
        assert!(err.to_string().contains("Widget"), "got {err}");
    }

    #[test]
    fn test_dangling_back_reference_is_fatal() {
        let mut envelope = minimal_envelope();
        envelope["data"]["lexer_conf"]["terminals"] = json!([{"@": 99}]);
        let err = decode(&envelope).err().expect("dangling reference rejected");
        assert!(err.to_string().contains("99"), "got {err}");
    }

    #[test]
    fn test_lexer_type_tags() {
        let mut envelope = minimal_envelope();
        envelope["data"]["lexer_conf"]["lexer_type"] = json!("contextual");
        assert_eq!(decode(&envelope).expect("decode").lexer_type, LexerType::Contextual);

        envelope["data"]["lexer_conf"]["lexer_type"] = json!("dynamic");
        assert_eq!(decode(&envelope).expect("decode").lexer_type, LexerType::Dynamic);

        envelope["data"]["lexer_conf"]["lexer_type"] = json!("quantum");
        let err = decode(&envelope).err().expect("unknown lexer type rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }

    #[test]
    fn test_pattern_shapes_and_flags() {
        let mut envelope = minimal_envelope();
        envelope["memo"]["1"]["pattern"] =
            json!({"__type__": "PatternStr", "value": "if", "flags": ["i"]});
        let grammar = decode(&envelope).expect("decode");
        let pattern = &grammar.lexer_conf.terminals[0].pattern;
        assert!(pattern.is_literal());
        assert!(pattern.flags().contains(&'i'));

        envelope["memo"]["1"]["pattern"] =
            json!({"__type__": "PatternStr", "value": "if", "flags": ["im"]});
        let err = decode(&envelope).err().expect("multi-char flag rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }

    #[test]
    fn test_serialized_width_is_kept() {
        let mut envelope = minimal_envelope();
        envelope["memo"]["1"]["pattern"] = json!({
            "__type__": "PatternRE",
            "value": "[0-9]+",
            "flags": [],
            "_width": [1, 4294967295u64]
        });
        let grammar = decode(&envelope).expect("decode");
        let pattern = &grammar.lexer_conf.terminals[0].pattern;
        assert_eq!(pattern.width().expect("width"), (1, 4294967295));
    }

    #[test]
    fn test_rule_options_fields() {
        let mut envelope = minimal_envelope();
        envelope["memo"]["0"]["options"] = json!({
            "__type__": "RuleOptions",
            "keep_all_tokens": true,
            "expand1": true,
            "priority": 3,
            "empty_indices": [false, true]
        });
        let grammar = decode(&envelope).expect("decode");
        assert_eq!(
            grammar.rules[0].options,
            RuleOptions {
                keep_all_tokens: true,
                expand1: true,
                priority: Some(3),
                empty_indices: vec![false, true],
            }
        );
    }

    #[test]
    fn test_action_kind_out_of_range_is_fatal() {
        let mut envelope = minimal_envelope();
        envelope["data"]["parser"]["states"]["0"]["0"] = json!([2, 5]);
        let err = decode(&envelope).err().expect("bad action kind rejected");
        assert!(matches!(err, SkeinError::MalformedTable { .. }), "got {err:?}");
    }
}
