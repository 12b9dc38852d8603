pub use crate::diagnostics::{to_error_source, ErrorContext, SkeinError, SourceArc, Span};
pub use crate::engine::{Engine, EngineOptions, LexerChoice, TokenStream};
pub use crate::interactive::{ImmutableInteractiveParser, InteractiveParser};
pub use crate::token::Token;
pub use crate::tree::{Branch, Meta, Tree};
pub use crate::tree_builder::PropagatePositions;
pub use crate::visit::{Interpreter, Transformed, Transformer, Visitor};

pub mod diagnostics;
pub mod engine;
pub mod grammar;
pub mod interactive;
pub mod lexer;
pub mod parser;
pub mod serialize;
pub mod token;
pub mod tree;
pub mod tree_builder;
pub mod visit;
