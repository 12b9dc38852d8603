//! Parse trees and the values that flow through the parser's value stack.
//!
//! Every slot on the value stack, and every child of a tree node, is a
//! [`Branch`]: an interior node, a token, an explicit null placeholder, or
//! an opaque value produced by a user transformer. Trees own their children
//! outright, so cloning one yields a fully independent copy.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use crate::Token;

/// One value in a parse result: a subtree, a leaf token, a placeholder for
/// an optional that matched nothing, or a user-produced value carried
/// through by an in-flight transformer.
#[derive(Clone)]
pub enum Branch {
    Tree(Tree),
    Token(Token),
    Null,
    Custom(Rc<dyn Any>),
}

impl Branch {
    /// Wraps an arbitrary value so a transformer can push it through the
    /// parse without the runtime inspecting it.
    pub fn custom<T: Any>(value: T) -> Self {
        Branch::Custom(Rc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Branch::Null)
    }

    pub fn as_tree(&self) -> Option<&Tree> {
        match self {
            Branch::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&Token> {
        match self {
            Branch::Token(token) => Some(token),
            _ => None,
        }
    }

    pub fn into_tree(self) -> Option<Tree> {
        match self {
            Branch::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn into_token(self) -> Option<Token> {
        match self {
            Branch::Token(token) => Some(token),
            _ => None,
        }
    }

    pub fn custom_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Branch::Custom(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

// Custom values have no general notion of equality, so they compare by
// identity. Everything else compares structurally.
impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Branch::Tree(a), Branch::Tree(b)) => a == b,
            (Branch::Token(a), Branch::Token(b)) => a == b,
            (Branch::Null, Branch::Null) => true,
            (Branch::Custom(a), Branch::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Tree(tree) => tree.fmt(f),
            Branch::Token(token) => token.fmt(f),
            Branch::Null => f.write_str("Null"),
            Branch::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<Tree> for Branch {
    fn from(tree: Tree) -> Self {
        Branch::Tree(tree)
    }
}

impl From<Token> for Branch {
    fn from(token: Token) -> Self {
        Branch::Token(token)
    }
}

/// Source position of a node. `line`/`column` span the node's own kept
/// children; the `container_*` fields span everything the rule consumed,
/// including children the tree builder filtered away. `empty` stays true
/// until position propagation writes something.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub start_pos: Option<usize>,
    pub end_line: Option<usize>,
    pub end_column: Option<usize>,
    pub end_pos: Option<usize>,
    pub container_line: Option<usize>,
    pub container_column: Option<usize>,
    pub container_start_pos: Option<usize>,
    pub container_end_line: Option<usize>,
    pub container_end_column: Option<usize>,
    pub container_end_pos: Option<usize>,
    pub empty: bool,
}

impl Default for Meta {
    fn default() -> Self {
        EMPTY_META.clone()
    }
}

static EMPTY_META: Meta = Meta {
    line: None,
    column: None,
    start_pos: None,
    end_line: None,
    end_column: None,
    end_pos: None,
    container_line: None,
    container_column: None,
    container_start_pos: None,
    container_end_line: None,
    container_end_column: None,
    container_end_pos: None,
    empty: true,
};

/// An interior parse-tree node: a rule label and its children. Metadata is
/// allocated lazily; most nodes never touch it unless position propagation
/// is on.
#[derive(Clone)]
pub struct Tree {
    pub data: String,
    pub children: Vec<Branch>,
    meta: Option<Box<Meta>>,
}

impl Tree {
    pub fn new(data: impl Into<String>, children: Vec<Branch>) -> Self {
        Tree { data: data.into(), children, meta: None }
    }

    pub fn with_meta(data: impl Into<String>, children: Vec<Branch>, meta: Meta) -> Self {
        Tree { data: data.into(), children, meta: Some(Box::new(meta)) }
    }

    /// The node's metadata, or a shared empty record when none was ever
    /// written. Callers can always read positions without forcing an
    /// allocation.
    pub fn meta(&self) -> &Meta {
        self.meta.as_deref().unwrap_or(&EMPTY_META)
    }

    /// The node's metadata for writing, allocating it on first use.
    pub fn meta_mut(&mut self) -> &mut Meta {
        self.meta.get_or_insert_with(Default::default)
    }

    pub fn has_meta(&self) -> bool {
        self.meta.is_some()
    }

    /// All subtrees, deepest first; the root comes last. Children are
    /// visited before their parents, which is the order a bottom-up
    /// rewrite wants.
    pub fn iter_subtrees(&self) -> impl Iterator<Item = &Tree> {
        let mut seen: HashSet<*const Tree> = HashSet::new();
        let mut queue: VecDeque<&Tree> = VecDeque::new();
        let mut ordered: Vec<&Tree> = Vec::new();
        seen.insert(self as *const Tree);
        queue.push_back(self);
        while let Some(tree) = queue.pop_front() {
            ordered.push(tree);
            for child in tree.children.iter().rev() {
                if let Branch::Tree(sub) = child {
                    if seen.insert(sub as *const Tree) {
                        queue.push_back(sub);
                    }
                }
            }
        }
        ordered.into_iter().rev()
    }

    /// All subtrees in preorder: each node before its children.
    pub fn iter_subtrees_topdown(&self) -> impl Iterator<Item = &Tree> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            for child in node.children.iter().rev() {
                if let Branch::Tree(sub) = child {
                    stack.push(sub);
                }
            }
            Some(node)
        })
    }

    /// Subtrees whose label equals `data`, deepest first.
    pub fn find_data<'a>(&'a self, data: &'a str) -> impl Iterator<Item = &'a Tree> + 'a {
        self.iter_subtrees().filter(move |t| t.data == data)
    }

    /// Subtrees satisfying `pred`, deepest first.
    pub fn find_pred<'a, P>(&'a self, mut pred: P) -> impl Iterator<Item = &'a Tree> + 'a
    where
        P: FnMut(&Tree) -> bool + 'a,
    {
        self.iter_subtrees().filter(move |t| pred(t))
    }

    /// Leaves satisfying `pred`, in source order.
    pub fn scan_values<'a, P>(&'a self, mut pred: P) -> impl Iterator<Item = &'a Branch> + 'a
    where
        P: FnMut(&Branch) -> bool + 'a,
    {
        fn collect<'a>(
            tree: &'a Tree,
            pred: &mut dyn FnMut(&Branch) -> bool,
            out: &mut Vec<&'a Branch>,
        ) {
            for child in &tree.children {
                match child {
                    Branch::Tree(sub) => collect(sub, pred, out),
                    leaf => {
                        if pred(leaf) {
                            out.push(leaf);
                        }
                    }
                }
            }
        }
        let mut leaves = Vec::new();
        collect(self, &mut pred, &mut leaves);
        leaves.into_iter()
    }

    /// An indented rendering for debugging. A node whose only child is a
    /// leaf prints on one line, tab-separated.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.pretty_into(0, &mut out);
        out
    }

    fn pretty_into(&self, level: usize, out: &mut String) {
        for _ in 0..level {
            out.push_str("  ");
        }
        out.push_str(&self.data);
        if self.children.len() == 1 && !matches!(self.children[0], Branch::Tree(_)) {
            out.push('\t');
            out.push_str(&leaf_repr(&self.children[0]));
            out.push('\n');
            return;
        }
        out.push('\n');
        for child in &self.children {
            match child {
                Branch::Tree(sub) => sub.pretty_into(level + 1, out),
                leaf => {
                    for _ in 0..=level {
                        out.push_str("  ");
                    }
                    out.push_str(&leaf_repr(leaf));
                    out.push('\n');
                }
            }
        }
    }
}

fn leaf_repr(leaf: &Branch) -> String {
    match leaf {
        Branch::Token(token) => token.value.clone(),
        Branch::Null => "None".to_string(),
        Branch::Custom(_) => "<custom>".to_string(),
        Branch::Tree(tree) => tree.data.clone(),
    }
}

// Metadata is bookkeeping, not structure.
impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.children == other.children
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree({:?}, {:?})", self.data, self.children)
    }
}

/// One-line rendering: `data(child, child)`, tokens by value.
impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.data)?;
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match child {
                Branch::Tree(sub) => write!(f, "{sub}")?,
                leaf => f.write_str(&leaf_repr(leaf))?,
            }
        }
        f.write_str(")")
    }
}
