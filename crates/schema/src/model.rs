//! Typed declarations produced by the schema compiler.
//!
//! The model preserves declaration order from the source so that code
//! generation is deterministic. It derives `Serialize` so a compiled schema
//! can be dumped as JSON and diffed.

use serde::Serialize;

/// A complete compiled schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declarations {
    /// Top-level declarations in source order.
    pub items: Vec<Declaration>,
}

/// One top-level schema declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Declaration {
    Type(TypeDecl),
    Union(UnionDecl),
    Interface(InterfaceDecl),
}

/// `type NAME` - a plain object type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeDecl {
    pub name: String,
    pub fields: Vec<Field>,
}

/// `union NAME` - a sum over previously declared type names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnionDecl {
    pub name: String,
    pub members: Vec<String>,
}

/// `interface NAME` - a channel with commands and events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceDecl {
    pub name: String,
    /// Fields of the `initializer` block; empty when the block is absent.
    pub initializer: Vec<Field>,
    pub commands: Vec<CommandDecl>,
    pub events: Vec<EventDecl>,
}

/// `command NAME` inside an interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandDecl {
    pub name: String,
    /// Fields of the `parameters` block; empty when absent.
    pub params: Vec<Field>,
    /// Fields of the `returns` block; empty when absent.
    pub returns: Vec<Field>,
}

/// `event NAME` inside an interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDecl {
    pub name: String,
    /// Fields of the event payload; empty for bare notifications.
    pub params: Vec<Field>,
}

/// A single `name: type` line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    /// `name?: type` marks the field optional.
    pub optional: bool,
    pub ty: TypeRef,
}

/// A resolved type reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeRef {
    String,
    Boolean,
    Number,
    Undefined,
    Binary,
    /// Inline `enum` with a closed set of string literals.
    Enum(Vec<String>),
    /// Inline `object` with nested fields.
    Object(Vec<Field>),
    /// Reference to a declared interface - a channel reference on the wire.
    Channel(String),
    /// Reference to a declared type or an opaque alias.
    Named(String),
    /// `T[]`.
    Array(Box<TypeRef>),
}

impl Declarations {
    /// Iterates over the interface declarations in source order.
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDecl> {
        self.items.iter().filter_map(|item| match item {
            Declaration::Interface(interface) => Some(interface),
            _ => None,
        })
    }

    /// Looks up an interface by name.
    pub fn interface(&self, name: &str) -> Option<&InterfaceDecl> {
        self.interfaces().find(|interface| interface.name == name)
    }

    /// `(interface name, command names)` pairs for registration-time
    /// validation of dispatcher handler tables.
    pub fn catalog(&self) -> Vec<(String, Vec<String>)> {
        self.interfaces()
            .map(|interface| {
                (
                    interface.name.clone(),
                    interface
                        .commands
                        .iter()
                        .map(|command| command.name.clone())
                        .collect(),
                )
            })
            .collect()
    }
}
