//! Reduction callbacks: from grammar rules to tree-building closures.
//!
//! For every rule the builder composes one closure the parser calls at
//! reduce time with the popped children. The closure filters the children
//! per the rule's options (anonymous-token dropping, placeholder `Null`s,
//! inline splicing of `_`-prefixed rules), collapses single-child `expand1`
//! nodes, dispatches to an in-parse transformer handler when one is
//! registered, and stamps source positions onto the result when position
//! propagation is on.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::grammar::{Rule, Symbol};
use crate::parser::{BuildFn, Callbacks, TokenShiftFn};
use crate::tree::{Branch, Meta, Tree};
use crate::visit::{RuleEntry, RuleHandler, RuleMetaHandler, Transformed, Transformer};
use crate::{err_msg, SkeinError, Token};

/// Whether reduce results inherit positions from their children, and from
/// which children. `Filter` consults the predicate per child and skips
/// rejected ones when picking the first and last position sources.
#[derive(Clone, Default)]
pub enum PropagatePositions {
    #[default]
    Off,
    On,
    Filter(Rc<dyn Fn(&Branch) -> bool>),
}

impl std::fmt::Debug for PropagatePositions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropagatePositions::Off => f.write_str("Off"),
            PropagatePositions::On => f.write_str("On"),
            PropagatePositions::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

/// Per-slot instruction inside a [`ChildPlan::Filter`]: which original
/// child to take, whether to splice its children inline, and how many
/// placeholder `Null`s precede it.
struct IncludeSlot {
    index: usize,
    expand: bool,
    nulls_before: usize,
}

/// Precompiled per-rule child shaping. `Passthrough` is the common case
/// where every child is kept verbatim.
enum ChildPlan {
    Passthrough,
    Filter { include: Vec<IncludeSlot>, append_nulls: usize },
}

impl ChildPlan {
    fn apply(&self, children: Vec<Branch>) -> Vec<Branch> {
        let ChildPlan::Filter { include, append_nulls } = self else {
            return children;
        };
        let mut slots: Vec<Option<Branch>> = children.into_iter().map(Some).collect();
        let mut filtered: Vec<Branch> = Vec::new();
        for slot in include {
            for _ in 0..slot.nulls_before {
                filtered.push(Branch::Null);
            }
            let child = slots.get_mut(slot.index).and_then(Option::take).unwrap_or(Branch::Null);
            if slot.expand {
                match child {
                    Branch::Tree(sub) => {
                        let mut sub_children = sub.children;
                        if filtered.is_empty() {
                            // Left-recursive rules splice at slot zero on
                            // every reduce; taking the vector avoids
                            // re-copying the accumulated children each time.
                            filtered = sub_children;
                        } else {
                            filtered.append(&mut sub_children);
                        }
                    }
                    other => filtered.push(other),
                }
            } else {
                filtered.push(child);
            }
        }
        for _ in 0..*append_nulls {
            filtered.push(Branch::Null);
        }
        filtered
    }
}

/// Inline rules are non-terminals spelled with a leading underscore; their
/// children replace the node in the parent.
fn should_expand(sym: &Symbol) -> bool {
    !sym.is_terminal() && sym.name().starts_with('_')
}

/// Turns a rule's `empty_indices` bitmap into placeholder counts per gap:
/// entry `i` is how many `Null`s sit before kept child `i`, with one extra
/// trailing entry for `Null`s after the last child.
fn decode_empty_indices(empty_indices: &[bool], len: usize) -> Result<Vec<usize>, SkeinError> {
    if empty_indices.is_empty() {
        return Ok(vec![0; len + 1]);
    }
    let kept = empty_indices.iter().filter(|&&b| !b).count();
    if kept != len {
        return Err(err_msg!(
            Grammar,
            "empty_indices marks {} kept children but the expansion has {}",
            kept,
            len
        ));
    }
    let mut gaps = vec![0usize];
    for &empty in empty_indices {
        if empty {
            let last = gaps.len() - 1;
            gaps[last] += 1;
        } else {
            gaps.push(0);
        }
    }
    Ok(gaps)
}

fn child_plan(
    expansion: &[Symbol],
    keep_all_tokens: bool,
    empty_indices: &[bool],
    maybe_placeholders: bool,
) -> Result<ChildPlan, SkeinError> {
    let effective: &[bool] = if maybe_placeholders { empty_indices } else { &[] };
    let has_placeholders = !effective.is_empty();
    let gaps = decode_empty_indices(effective, expansion.len())?;

    let mut include = Vec::new();
    let mut pending_nulls = 0;
    for (i, sym) in expansion.iter().enumerate() {
        pending_nulls += gaps[i];
        if keep_all_tokens || !(sym.is_terminal() && sym.is_filtered_out()) {
            include.push(IncludeSlot {
                index: i,
                expand: should_expand(sym),
                nulls_before: pending_nulls,
            });
            pending_nulls = 0;
        }
    }
    let append_nulls = pending_nulls + gaps[expansion.len()];

    let needs_filter = has_placeholders
        || include.len() < expansion.len()
        || include.iter().any(|slot| slot.expand);
    Ok(if needs_filter {
        ChildPlan::Filter { include, append_nulls }
    } else {
        ChildPlan::Passthrough
    })
}

/// What a reduce produces once the children are shaped: a plain node under
/// the rule's label, or a transformer handler's value.
enum BaseBuild {
    Node(String),
    Plain(RuleHandler),
    WithMeta(RuleMetaHandler),
}

impl BaseBuild {
    fn invoke(&self, children: Vec<Branch>) -> Result<Branch, SkeinError> {
        let outcome = match self {
            BaseBuild::Node(label) => {
                return Ok(Branch::Tree(Tree::new(label.clone(), children)));
            }
            BaseBuild::Plain(handler) => handler(children)?,
            BaseBuild::WithMeta(handler) => {
                // Mid-parse there is no assembled node yet, so meta-aware
                // handlers see an empty meta.
                let empty = Meta::default();
                handler(children, &empty)?
            }
        };
        Ok(match outcome {
            Transformed::Value(value) => value,
            Transformed::Discard => Branch::Null,
        })
    }
}

#[derive(Clone, Copy)]
struct StartSnap {
    line: Option<usize>,
    column: Option<usize>,
    start_pos: Option<usize>,
}

#[derive(Clone, Copy)]
struct EndSnap {
    end_line: Option<usize>,
    end_column: Option<usize>,
    end_pos: Option<usize>,
}

/// First qualifying child's start position. Trees qualify once they carry
/// real positions, tokens always do; container positions win over the
/// node's own so inlined rules keep covering their full extent.
fn start_snapshot<'a>(
    children: impl Iterator<Item = &'a Branch>,
    filter: Option<&dyn Fn(&Branch) -> bool>,
) -> Option<StartSnap> {
    for child in children {
        if let Some(accept) = filter {
            if !accept(child) {
                continue;
            }
        }
        match child {
            Branch::Tree(sub) => {
                let meta = sub.meta();
                if !meta.empty {
                    return Some(StartSnap {
                        line: meta.container_line.or(meta.line),
                        column: meta.container_column.or(meta.column),
                        start_pos: meta.container_start_pos.or(meta.start_pos),
                    });
                }
            }
            Branch::Token(token) => {
                return Some(StartSnap {
                    line: token.line,
                    column: token.column,
                    start_pos: token.start_pos,
                });
            }
            _ => {}
        }
    }
    None
}

fn end_snapshot<'a>(
    children: impl Iterator<Item = &'a Branch>,
    filter: Option<&dyn Fn(&Branch) -> bool>,
) -> Option<EndSnap> {
    for child in children {
        if let Some(accept) = filter {
            if !accept(child) {
                continue;
            }
        }
        match child {
            Branch::Tree(sub) => {
                let meta = sub.meta();
                if !meta.empty {
                    return Some(EndSnap {
                        end_line: meta.container_end_line.or(meta.end_line),
                        end_column: meta.container_end_column.or(meta.end_column),
                        end_pos: meta.container_end_pos.or(meta.end_pos),
                    });
                }
            }
            Branch::Token(token) => {
                return Some(EndSnap {
                    end_line: token.end_line,
                    end_column: token.end_column,
                    end_pos: token.end_pos,
                });
            }
            _ => {}
        }
    }
    None
}

/// Own positions are only written where none exist yet, so a child passed
/// through by `expand1` keeps its own extent; container positions always
/// reflect the enclosing rule.
fn write_positions(result: &mut Branch, first: Option<StartSnap>, last: Option<EndSnap>) {
    if first.is_none() && last.is_none() {
        return;
    }
    let Branch::Tree(tree) = result else {
        return;
    };
    let meta = tree.meta_mut();
    if let Some(snap) = first {
        if meta.line.is_none() {
            meta.line = snap.line;
            meta.column = snap.column;
            meta.start_pos = snap.start_pos;
            meta.empty = false;
        }
        meta.container_line = snap.line;
        meta.container_column = snap.column;
        meta.container_start_pos = snap.start_pos;
    }
    if let Some(snap) = last {
        if meta.end_line.is_none() {
            meta.end_line = snap.end_line;
            meta.end_column = snap.end_column;
            meta.end_pos = snap.end_pos;
            meta.empty = false;
        }
        meta.container_end_line = snap.end_line;
        meta.container_end_column = snap.end_column;
        meta.container_end_pos = snap.end_pos;
    }
}

/// Compiles the per-rule reduce callbacks and per-terminal shift callbacks
/// for a rule set.
#[derive(Debug)]
pub struct ParseTreeBuilder {
    propagate_positions: PropagatePositions,
    maybe_placeholders: bool,
    keep_all_tokens: bool,
}

impl ParseTreeBuilder {
    pub fn new(
        propagate_positions: PropagatePositions,
        maybe_placeholders: bool,
        keep_all_tokens: bool,
        ambiguous: bool,
    ) -> Result<Self, SkeinError> {
        if ambiguous {
            return Err(err_msg!(
                Configuration,
                "ambiguous tree building requires an earley parser, which this runtime does not provide"
            ));
        }
        Ok(ParseTreeBuilder { propagate_positions, maybe_placeholders, keep_all_tokens })
    }

    /// Builds one callback per rule, in rule order, plus shift callbacks
    /// for every terminal the transformer registers a handler for.
    /// Transformer rule handlers are matched by the rule's callback name
    /// (its alias when present).
    pub fn create_callbacks(
        &self,
        rules: &[Rc<Rule>],
        terminal_names: &[String],
        transformer: Option<&Transformer>,
    ) -> Result<Callbacks, SkeinError> {
        let mut seen: HashSet<Rc<Rule>> = HashSet::new();
        let mut rule_callbacks: Vec<BuildFn> = Vec::with_capacity(rules.len());
        for rule in rules {
            if !seen.insert(Rc::clone(rule)) {
                return Err(err_msg!(Grammar, "rule {} is registered twice", rule));
            }
            let keep_all = self.keep_all_tokens || rule.options.keep_all_tokens;
            let plan = child_plan(
                &rule.expansion,
                keep_all,
                &rule.options.empty_indices,
                self.maybe_placeholders,
            )?;
            let expand_single = rule.options.expand1 && rule.alias.is_none();
            let base = match transformer.and_then(|t| t.rule_entry(rule.callback_name())) {
                Some(RuleEntry::Plain(handler)) => BaseBuild::Plain(Rc::clone(handler)),
                Some(RuleEntry::WithMeta(handler)) => BaseBuild::WithMeta(Rc::clone(handler)),
                None => BaseBuild::Node(rule.callback_name().to_string()),
            };
            let propagate = self.propagate_positions.clone();
            rule_callbacks.push(Box::new(move |children: Vec<Branch>| {
                // Positions come from the raw children, before filtering
                // drops the anonymous tokens that may carry them.
                let (first, last) = match &propagate {
                    PropagatePositions::Off => (None, None),
                    PropagatePositions::On => (
                        start_snapshot(children.iter(), None),
                        end_snapshot(children.iter().rev(), None),
                    ),
                    PropagatePositions::Filter(accept) => (
                        start_snapshot(children.iter(), Some(&**accept)),
                        end_snapshot(children.iter().rev(), Some(&**accept)),
                    ),
                };
                let mut filtered = plan.apply(children);
                let mut result = if expand_single && filtered.len() == 1 {
                    filtered.pop().unwrap_or(Branch::Null)
                } else {
                    base.invoke(filtered)?
                };
                write_positions(&mut result, first, last);
                Ok(result)
            }));
        }

        let mut token_shift: HashMap<String, TokenShiftFn> = HashMap::new();
        if let Some(transformer) = transformer {
            for name in terminal_names {
                if let Some(handler) = transformer.token_entry(name) {
                    let handler = Rc::clone(handler);
                    token_shift.insert(
                        name.clone(),
                        Box::new(move |token: Token| {
                            Ok(match handler(token)? {
                                Transformed::Value(value) => value,
                                Transformed::Discard => Branch::Null,
                            })
                        }),
                    );
                }
            }
        }

        Ok(Callbacks { rules: rule_callbacks, token_shift })
    }
}
