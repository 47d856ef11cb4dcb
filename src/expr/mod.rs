//! # Expression language
//!
//! The `${{ ... }}` mini-language used throughout package files: typed
//! values, pipe-filter composition, jq-style built-ins, and a deferral
//! mechanism for expressions that reference runtime-only data.
//!
//! - [`lexer`] / [`parser`] - tokens and AST
//! - [`eval`] - scope-based evaluation and built-ins
//! - [`template`] - `${{ ... }}` splicing within parameter strings
//! - [`deferred`] - build-time capture, run-time evaluation

pub mod deferred;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use deferred::{eval_embedded, runtime_names, value_references, DeferredExpr};
pub use eval::{truthy, EvalCtx};
pub use parser::{parse, Expr};
pub use template::{expand_nested, Template};
