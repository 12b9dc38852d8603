//! Tree consumption: transformers, visitors, and the interpreter.
//!
//! Dispatch is an explicit name-to-handler registry built at construction,
//! not reflection over method names. A [`Transformer`] rebuilds bottom-up
//! and offers four drivers that trade recursion, mutation, and memory
//! differently; a [`Visitor`] walks read-only; an [`Interpreter`] descends
//! top-down only where its handlers ask it to. Handler failures other than
//! grammar errors are wrapped as [`SkeinError::Visit`] with the rule name
//! and offending node attached.

use std::collections::HashMap;
use std::rc::Rc;

use crate::diagnostics::ErrorContext;
use crate::tree::{Branch, Meta, Tree};
use crate::{err_msg, SkeinError, Token};

/// What a handler did with its node.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Replace the node with this value.
    Value(Branch),
    /// Remove the node from its parent's children.
    Discard,
}

pub type RuleHandler = Rc<dyn Fn(Vec<Branch>) -> Result<Transformed, SkeinError>>;
pub type RuleMetaHandler = Rc<dyn Fn(Vec<Branch>, &Meta) -> Result<Transformed, SkeinError>>;
pub type TokenHandler = Rc<dyn Fn(Token) -> Result<Transformed, SkeinError>>;
pub type DefaultRuleHandler = Rc<dyn Fn(&str, Vec<Branch>) -> Result<Transformed, SkeinError>>;

/// One registered rule handler, with or without access to the node's meta.
pub(crate) enum RuleEntry {
    Plain(RuleHandler),
    WithMeta(RuleMetaHandler),
}

fn wrap_visit_error(rule: &str, node: Tree, cause: SkeinError) -> SkeinError {
    match cause {
        grammar @ SkeinError::Grammar { .. } => grammar,
        cause => SkeinError::Visit {
            rule: rule.to_string(),
            node: Box::new(node),
            cause: Box::new(cause),
            ctx: ErrorContext::none(),
        },
    }
}

/// Bottom-up tree rewriter: children are transformed first, then the
/// node's handler is called with the transformed children. Rules without a
/// handler rebuild themselves unchanged (or go through the default
/// handler, when one is set).
pub struct Transformer {
    rules: HashMap<String, RuleEntry>,
    tokens: HashMap<String, TokenHandler>,
    default_rule: Option<DefaultRuleHandler>,
    default_token: Option<TokenHandler>,
    visit_tokens: bool,
}

impl Default for Transformer {
    fn default() -> Self {
        Transformer::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Transformer {
            rules: HashMap::new(),
            tokens: HashMap::new(),
            default_rule: None,
            default_token: None,
            visit_tokens: true,
        }
    }

    pub fn on_rule(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Branch>) -> Result<Transformed, SkeinError> + 'static,
    ) -> Self {
        self.rules.insert(name.into(), RuleEntry::Plain(Rc::new(handler)));
        self
    }

    /// Like [`on_rule`](Self::on_rule), but the handler also receives the
    /// node's meta (positions). During a parse the meta is still empty;
    /// positions are only available when transforming a finished tree.
    pub fn on_rule_with_meta(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Branch>, &Meta) -> Result<Transformed, SkeinError> + 'static,
    ) -> Self {
        self.rules.insert(name.into(), RuleEntry::WithMeta(Rc::new(handler)));
        self
    }

    pub fn on_token(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Token) -> Result<Transformed, SkeinError> + 'static,
    ) -> Self {
        self.tokens.insert(name.into(), Rc::new(handler));
        self
    }

    /// Handler for rules with no registered handler; receives the rule name.
    pub fn set_default(
        mut self,
        handler: impl Fn(&str, Vec<Branch>) -> Result<Transformed, SkeinError> + 'static,
    ) -> Self {
        self.default_rule = Some(Rc::new(handler));
        self
    }

    pub fn set_default_token(
        mut self,
        handler: impl Fn(Token) -> Result<Transformed, SkeinError> + 'static,
    ) -> Self {
        self.default_token = Some(Rc::new(handler));
        self
    }

    /// Whether token leaves are routed through token handlers (on by
    /// default). When off, tokens pass through untouched.
    pub fn visit_tokens(mut self, enabled: bool) -> Self {
        self.visit_tokens = enabled;
        self
    }

    pub(crate) fn rule_entry(&self, name: &str) -> Option<&RuleEntry> {
        self.rules.get(name)
    }

    pub(crate) fn token_entry(&self, name: &str) -> Option<&TokenHandler> {
        self.tokens.get(name)
    }

    /// Recursive post-order transform, consuming the tree. A discarded
    /// root yields `Null`.
    pub fn transform(&self, tree: Tree) -> Result<Branch, SkeinError> {
        Ok(match self.transform_branch(Branch::Tree(tree))? {
            Transformed::Value(value) => value,
            Transformed::Discard => Branch::Null,
        })
    }

    /// Same result as [`transform`](Self::transform), but the tree is
    /// flattened to reverse postorder first and replayed with an explicit
    /// value stack, so call-stack depth stays constant however deep the
    /// tree is.
    pub fn transform_non_recursive(&self, tree: Tree) -> Result<Branch, SkeinError> {
        enum Entry {
            Node { data: String, meta: Option<Meta>, arity: usize },
            Leaf(Branch),
        }

        let mut rev_postfix = Vec::new();
        let mut queue = vec![Branch::Tree(tree)];
        while let Some(branch) = queue.pop() {
            match branch {
                Branch::Tree(node) => {
                    let meta = if node.has_meta() { Some(node.meta().clone()) } else { None };
                    let data = node.data;
                    let children = node.children;
                    rev_postfix.push(Entry::Node { data, meta, arity: children.len() });
                    queue.extend(children);
                }
                leaf => rev_postfix.push(Entry::Leaf(leaf)),
            }
        }

        // Discarded results stay on the stack as markers so arities keep
        // lining up; parents filter them out of their argument lists.
        let mut stack: Vec<Transformed> = Vec::new();
        for entry in rev_postfix.into_iter().rev() {
            match entry {
                Entry::Leaf(Branch::Token(token)) => stack.push(self.apply_token(token)?),
                Entry::Leaf(other) => stack.push(Transformed::Value(other)),
                Entry::Node { data, meta, arity } => {
                    let at = stack.len().saturating_sub(arity);
                    let popped = stack.split_off(at);
                    let mut children = Vec::with_capacity(popped.len());
                    for item in popped {
                        if let Transformed::Value(value) = item {
                            children.push(value);
                        }
                    }
                    let result = self.apply_rule(data, children, meta)?;
                    stack.push(result);
                }
            }
        }
        Ok(match stack.pop() {
            Some(Transformed::Value(value)) => value,
            _ => Branch::Null,
        })
    }

    /// Iterative bottom-up in-place rewrite: every node's children are
    /// replaced with their transformed values while the spine stays where
    /// it is. The root's own handler, when one applies, must produce a
    /// tree, which takes the root's place. On error the tree is left in a
    /// valid but partially rewritten state.
    pub fn transform_in_place(&self, tree: &mut Tree) -> Result<(), SkeinError> {
        let paths = reverse_preorder_paths(tree);
        for path in paths.iter().rev() {
            let Some(node) = navigate_mut(tree, path) else { continue };
            let children = std::mem::take(&mut node.children);
            let mut rebuilt = Vec::with_capacity(children.len());
            for child in children {
                if let Transformed::Value(value) = self.apply_child(child)? {
                    rebuilt.push(value);
                }
            }
            node.children = rebuilt;
        }
        self.replace_root(tree)
    }

    /// Recursive equivalent of [`transform_in_place`](Self::transform_in_place).
    pub fn transform_in_place_recursive(&self, tree: &mut Tree) -> Result<(), SkeinError> {
        self.rewrite_children_recursive(tree)?;
        self.replace_root(tree)
    }

    fn rewrite_children_recursive(&self, node: &mut Tree) -> Result<(), SkeinError> {
        let children = std::mem::take(&mut node.children);
        let mut rebuilt = Vec::with_capacity(children.len());
        for child in children {
            let value = match child {
                Branch::Tree(mut sub) => {
                    self.rewrite_children_recursive(&mut sub)?;
                    self.apply_node(sub)?
                }
                Branch::Token(token) => self.apply_token(token)?,
                other => Transformed::Value(other),
            };
            if let Transformed::Value(value) = value {
                rebuilt.push(value);
            }
        }
        node.children = rebuilt;
        Ok(())
    }

    fn replace_root(&self, tree: &mut Tree) -> Result<(), SkeinError> {
        if !self.rules.contains_key(&tree.data) && self.default_rule.is_none() {
            return Ok(());
        }
        let label = tree.data.clone();
        let node = std::mem::replace(tree, Tree::new(String::new(), Vec::new()));
        match self.apply_node(node)? {
            Transformed::Value(Branch::Tree(replacement)) => {
                *tree = replacement;
                Ok(())
            }
            _ => Err(err_msg!(
                Configuration,
                "in-place transform of '{}' must produce a tree to stand in for the root",
                label
            )),
        }
    }

    fn transform_branch(&self, branch: Branch) -> Result<Transformed, SkeinError> {
        match branch {
            Branch::Tree(tree) => {
                let meta = if tree.has_meta() { Some(tree.meta().clone()) } else { None };
                let data = tree.data;
                let children = tree.children;
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    if let Transformed::Value(value) = self.transform_branch(child)? {
                        out.push(value);
                    }
                }
                self.apply_rule(data, out, meta)
            }
            Branch::Token(token) => self.apply_token(token),
            other => Ok(Transformed::Value(other)),
        }
    }

    /// Applies the node handler for a tree whose children are already
    /// transformed. Without a matching handler or default the node passes
    /// through untouched.
    fn apply_node(&self, tree: Tree) -> Result<Transformed, SkeinError> {
        if !self.rules.contains_key(&tree.data) && self.default_rule.is_none() {
            return Ok(Transformed::Value(Branch::Tree(tree)));
        }
        let meta = if tree.has_meta() { Some(tree.meta().clone()) } else { None };
        let data = tree.data;
        let children = tree.children;
        self.apply_rule(data, children, meta)
    }

    fn apply_child(&self, child: Branch) -> Result<Transformed, SkeinError> {
        match child {
            Branch::Tree(sub) => self.apply_node(sub),
            Branch::Token(token) => self.apply_token(token),
            other => Ok(Transformed::Value(other)),
        }
    }

    fn apply_rule(
        &self,
        data: String,
        children: Vec<Branch>,
        meta: Option<Meta>,
    ) -> Result<Transformed, SkeinError> {
        enum Chosen<'a> {
            Plain(&'a RuleHandler),
            WithMeta(&'a RuleMetaHandler),
            Default(&'a DefaultRuleHandler),
        }

        let chosen = match self.rules.get(&data) {
            Some(RuleEntry::Plain(handler)) => Some(Chosen::Plain(handler)),
            Some(RuleEntry::WithMeta(handler)) => Some(Chosen::WithMeta(handler)),
            None => self.default_rule.as_ref().map(Chosen::Default),
        };
        let Some(chosen) = chosen else {
            let mut tree = Tree::new(data, children);
            if let Some(meta) = meta {
                *tree.meta_mut() = meta;
            }
            return Ok(Transformed::Value(Branch::Tree(tree)));
        };

        // Handlers consume their children, so the error path keeps a copy
        // to report the failing node with.
        let snapshot = children.clone();
        let outcome = match chosen {
            Chosen::Plain(handler) => handler(children),
            Chosen::WithMeta(handler) => {
                let empty = Meta::default();
                handler(children, meta.as_ref().unwrap_or(&empty))
            }
            Chosen::Default(handler) => handler(&data, children),
        };
        outcome.map_err(|cause| {
            let mut node = Tree::new(data.clone(), snapshot);
            if let Some(meta) = meta {
                *node.meta_mut() = meta;
            }
            wrap_visit_error(&data, node, cause)
        })
    }

    fn apply_token(&self, token: Token) -> Result<Transformed, SkeinError> {
        if !self.visit_tokens {
            return Ok(Transformed::Value(Branch::Token(token)));
        }
        let handler = self.tokens.get(&token.kind).or(self.default_token.as_ref());
        let Some(handler) = handler else {
            return Ok(Transformed::Value(Branch::Token(token)));
        };
        let kind = token.kind.clone();
        let snapshot = token.clone();
        handler(token).map_err(|cause| {
            let node = Tree::new(kind.clone(), vec![Branch::Token(snapshot)]);
            wrap_visit_error(&kind, node, cause)
        })
    }
}

/// Paths of every subtree, ancestors before descendants; reversed, this
/// is a valid bottom-up processing order.
fn reverse_preorder_paths(tree: &Tree) -> Vec<Vec<usize>> {
    let mut paths = Vec::new();
    let mut stack: Vec<(Vec<usize>, &Tree)> = vec![(Vec::new(), tree)];
    while let Some((path, node)) = stack.pop() {
        for (i, child) in node.children.iter().enumerate() {
            if let Branch::Tree(sub) = child {
                let mut next = path.clone();
                next.push(i);
                stack.push((next, sub));
            }
        }
        paths.push(path);
    }
    paths
}

fn navigate_mut<'a>(root: &'a mut Tree, path: &[usize]) -> Option<&'a mut Tree> {
    let mut node = root;
    for &index in path {
        match node.children.get_mut(index) {
            Some(Branch::Tree(sub)) => node = sub,
            _ => return None,
        }
    }
    Some(node)
}

/// Read-only walker: callbacks see each subtree, nothing is rebuilt.
#[derive(Default)]
pub struct Visitor {
    handlers: HashMap<String, Box<dyn FnMut(&Tree)>>,
    default: Option<Box<dyn FnMut(&Tree)>>,
}

impl Visitor {
    pub fn new() -> Self {
        Visitor { handlers: HashMap::new(), default: None }
    }

    pub fn on(mut self, name: impl Into<String>, handler: impl FnMut(&Tree) + 'static) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn set_default(mut self, handler: impl FnMut(&Tree) + 'static) -> Self {
        self.default = Some(Box::new(handler));
        self
    }

    fn call(&mut self, tree: &Tree) {
        if let Some(handler) = self.handlers.get_mut(&tree.data) {
            handler(tree);
        } else if let Some(handler) = &mut self.default {
            handler(tree);
        }
    }

    /// Bottom-up iterative walk: children before parents.
    pub fn visit(&mut self, tree: &Tree) {
        for subtree in tree.iter_subtrees() {
            self.call(subtree);
        }
    }

    /// Preorder iterative walk: parents before children.
    pub fn visit_topdown(&mut self, tree: &Tree) {
        for subtree in tree.iter_subtrees_topdown() {
            self.call(subtree);
        }
    }

    pub fn visit_recursive(&mut self, tree: &Tree) {
        for child in &tree.children {
            if let Branch::Tree(sub) = child {
                self.visit_recursive(sub);
            }
        }
        self.call(tree);
    }

    pub fn visit_topdown_recursive(&mut self, tree: &Tree) {
        self.call(tree);
        for child in &tree.children {
            if let Branch::Tree(sub) = child {
                self.visit_topdown_recursive(sub);
            }
        }
    }
}

pub type InterpretFn = Rc<dyn Fn(&Interpreter, &Tree) -> Result<Branch, SkeinError>>;

/// Top-down, explicitly recursive evaluator: a handler decides whether and
/// how to descend by calling [`visit`](Self::visit) or
/// [`visit_children`](Self::visit_children) itself, so subtrees can be
/// skipped or short-circuited.
#[derive(Default)]
pub struct Interpreter {
    handlers: HashMap<String, InterpretFn>,
    default: Option<InterpretFn>,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter { handlers: HashMap::new(), default: None }
    }

    pub fn on(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&Interpreter, &Tree) -> Result<Branch, SkeinError> + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Rc::new(handler));
        self
    }

    pub fn set_default(
        mut self,
        handler: impl Fn(&Interpreter, &Tree) -> Result<Branch, SkeinError> + 'static,
    ) -> Self {
        self.default = Some(Rc::new(handler));
        self
    }

    /// Evaluates one node. Without a handler (or default), children are
    /// visited and the node is rebuilt from their results.
    pub fn visit(&self, tree: &Tree) -> Result<Branch, SkeinError> {
        if let Some(handler) = self.handlers.get(&tree.data) {
            return handler(self, tree);
        }
        if let Some(handler) = &self.default {
            return handler(self, tree);
        }
        let children = self.visit_children(tree)?;
        Ok(Branch::Tree(Tree::new(tree.data.clone(), children)))
    }

    /// Evaluates every child, leaving non-tree children as they are.
    pub fn visit_children(&self, tree: &Tree) -> Result<Vec<Branch>, SkeinError> {
        tree.children
            .iter()
            .map(|child| match child {
                Branch::Tree(sub) => self.visit(sub),
                other => Ok(other.clone()),
            })
            .collect()
    }
}
