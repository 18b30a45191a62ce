//! Protocol schema language (PDL) tooling.
//!
//! The protocol that the runtime speaks is described in a small
//! indentation-structured schema language: top-level `type`, `union` and
//! `interface` declarations, with nested `initializer`, `command` and
//! `event` blocks inside interfaces. This crate turns that source text into
//! typed declarations and renders them as Rust code:
//!
//! ```text
//! schema source -> tokenizer -> compiler -> Declarations -> codegen -> .rs
//! ```
//!
//! Compilation is pure and deterministic: the same source always produces
//! the same model and byte-identical generated code, so the artifact can be
//! checked into source control and diffed.

pub mod codegen;
pub mod compiler;
pub mod error;
pub mod model;
pub mod tokenizer;

pub use codegen::render;
pub use compiler::compile;
pub use error::{Result, SchemaError};
pub use model::{
    CommandDecl, Declaration, Declarations, EventDecl, Field, InterfaceDecl, TypeDecl, TypeRef,
    UnionDecl,
};
pub use tokenizer::{Node, tokenize};
