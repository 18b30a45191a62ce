//! Two-pass schema compiler.
//!
//! Pass 1 collects every declared interface name so that pass 2 can tell a
//! channel reference apart from a plain type reference. The interface set
//! lives in an explicit [`CompilerContext`] threaded through the walk; there
//! is no global state, and compiling the same source twice yields an equal
//! model.

use std::collections::HashSet;

use crate::error::{Result, SchemaError};
use crate::model::{
    CommandDecl, Declaration, Declarations, EventDecl, Field, InterfaceDecl, TypeDecl, TypeRef,
    UnionDecl,
};
use crate::tokenizer::{Node, tokenize};

/// Names gathered in pass 1, consulted while resolving type references.
pub struct CompilerContext {
    channels: HashSet<String>,
}

impl CompilerContext {
    fn scan(nodes: &[Node]) -> Result<Self> {
        let mut channels = HashSet::new();
        let mut declared = HashSet::new();
        for node in nodes {
            let (kind, name) = declaration_header(node)?;
            if !declared.insert(name.to_string()) {
                return Err(SchemaError::malformed(
                    node.line,
                    format!("duplicate declaration `{name}`"),
                ));
            }
            if kind == "interface" {
                channels.insert(name.to_string());
            }
        }
        Ok(Self { channels })
    }

    /// True when `name` refers to a declared interface.
    pub fn is_channel(&self, name: &str) -> bool {
        self.channels.contains(name)
    }
}

/// Compiles schema source into typed declarations.
///
/// Fails on the first malformed line; there is no partial output.
pub fn compile(source: &str) -> Result<Declarations> {
    let nodes = tokenize(source)?;
    let ctx = CompilerContext::scan(&nodes)?;

    let mut items = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let (kind, name) = declaration_header(node)?;
        let item = match kind {
            "type" => Declaration::Type(TypeDecl {
                name: name.to_string(),
                fields: compile_fields(&node.children, &ctx)?,
            }),
            "union" => Declaration::Union(compile_union(name, node)?),
            "interface" => Declaration::Interface(compile_interface(name, node, &ctx)?),
            _ => unreachable!("declaration_header only admits known kinds"),
        };
        items.push(item);
    }
    Ok(Declarations { items })
}

/// Splits a top-level line into `(kind, name)`, rejecting anything that is
/// not `type NAME`, `union NAME` or `interface NAME`.
fn declaration_header(node: &Node) -> Result<(&str, &str)> {
    match node.words.as_slice() {
        [kind, name] if matches!(kind.as_str(), "type" | "union" | "interface") => {
            if !is_identifier(name) {
                return Err(SchemaError::unclassified(node.line, &node.words));
            }
            Ok((kind.as_str(), name.as_str()))
        }
        _ => Err(SchemaError::unclassified(node.line, &node.words)),
    }
}

fn compile_union(name: &str, node: &Node) -> Result<UnionDecl> {
    if node.children.is_empty() {
        return Err(SchemaError::malformed(
            node.line,
            format!("union `{name}` has no members"),
        ));
    }
    let mut members = Vec::with_capacity(node.children.len());
    for child in &node.children {
        match child.words.as_slice() {
            [member] if is_identifier(member) && child.children.is_empty() => {
                members.push(member.clone());
            }
            _ => return Err(SchemaError::unclassified(child.line, &child.words)),
        }
    }
    Ok(UnionDecl {
        name: name.to_string(),
        members,
    })
}

fn compile_interface(name: &str, node: &Node, ctx: &CompilerContext) -> Result<InterfaceDecl> {
    let mut initializer = Vec::new();
    let mut commands: Vec<CommandDecl> = Vec::new();
    let mut events: Vec<EventDecl> = Vec::new();

    for child in &node.children {
        match child.words.as_slice() {
            [word] if word == "initializer" => {
                if !initializer.is_empty() {
                    return Err(SchemaError::malformed(
                        child.line,
                        format!("interface `{name}` has more than one initializer"),
                    ));
                }
                initializer = compile_fields(&child.children, ctx)?;
            }
            [word, command_name] if word == "command" && is_identifier(command_name) => {
                if commands.iter().any(|c| &c.name == command_name) {
                    return Err(SchemaError::malformed(
                        child.line,
                        format!("duplicate command `{command_name}` in interface `{name}`"),
                    ));
                }
                commands.push(compile_command(command_name, child, ctx)?);
            }
            [word, event_name] if word == "event" && is_identifier(event_name) => {
                if events.iter().any(|e| &e.name == event_name) {
                    return Err(SchemaError::malformed(
                        child.line,
                        format!("duplicate event `{event_name}` in interface `{name}`"),
                    ));
                }
                events.push(EventDecl {
                    name: event_name.clone(),
                    params: compile_fields(&child.children, ctx)?,
                });
            }
            _ => return Err(SchemaError::unclassified(child.line, &child.words)),
        }
    }

    Ok(InterfaceDecl {
        name: name.to_string(),
        initializer,
        commands,
        events,
    })
}

fn compile_command(name: &str, node: &Node, ctx: &CompilerContext) -> Result<CommandDecl> {
    let mut params = Vec::new();
    let mut returns = Vec::new();
    for child in &node.children {
        match child.words.as_slice() {
            [word] if word == "parameters" => params = compile_fields(&child.children, ctx)?,
            [word] if word == "returns" => returns = compile_fields(&child.children, ctx)?,
            _ => return Err(SchemaError::unclassified(child.line, &child.words)),
        }
    }
    Ok(CommandDecl {
        name: name.to_string(),
        params,
        returns,
    })
}

fn compile_fields(nodes: &[Node], ctx: &CompilerContext) -> Result<Vec<Field>> {
    let mut fields: Vec<Field> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let field = compile_field(node, ctx)?;
        if fields.iter().any(|f| f.name == field.name) {
            return Err(SchemaError::malformed(
                node.line,
                format!("duplicate field `{}`", field.name),
            ));
        }
        fields.push(field);
    }
    Ok(fields)
}

/// Compiles one `name: type` or `name?: type` line.
fn compile_field(node: &Node, ctx: &CompilerContext) -> Result<Field> {
    let [name_word, type_word] = node.words.as_slice() else {
        return Err(SchemaError::unclassified(node.line, &node.words));
    };
    let Some(mut name) = name_word.strip_suffix(':') else {
        return Err(SchemaError::unclassified(node.line, &node.words));
    };
    let optional = if let Some(stripped) = name.strip_suffix('?') {
        name = stripped;
        true
    } else {
        false
    };
    if !is_identifier(name) {
        return Err(SchemaError::unclassified(node.line, &node.words));
    }
    Ok(Field {
        name: name.to_string(),
        optional,
        ty: compile_type(type_word, node, ctx)?,
    })
}

/// Resolves a type word, recursing through a trailing `[]`.
fn compile_type(word: &str, node: &Node, ctx: &CompilerContext) -> Result<TypeRef> {
    if let Some(element) = word.strip_suffix("[]") {
        return Ok(TypeRef::Array(Box::new(compile_type(element, node, ctx)?)));
    }
    let ty = match word {
        "string" => TypeRef::String,
        "boolean" => TypeRef::Boolean,
        "number" => TypeRef::Number,
        "undefined" => TypeRef::Undefined,
        "binary" => TypeRef::Binary,
        "enum" => {
            if node.children.is_empty() {
                return Err(SchemaError::malformed(
                    node.line,
                    "inline enum has no literals",
                ));
            }
            let mut literals = Vec::with_capacity(node.children.len());
            for child in &node.children {
                match child.words.as_slice() {
                    [literal] if child.children.is_empty() => literals.push(literal.clone()),
                    _ => return Err(SchemaError::unclassified(child.line, &child.words)),
                }
            }
            return Ok(TypeRef::Enum(literals));
        }
        "object" => return Ok(TypeRef::Object(compile_fields(&node.children, ctx)?)),
        name if is_identifier(name) => {
            if ctx.is_channel(name) {
                TypeRef::Channel(name.to_string())
            } else {
                TypeRef::Named(name.to_string())
            }
        }
        _ => return Err(SchemaError::unclassified(node.line, &node.words)),
    };
    // Only inline enum/object lines may carry nested children.
    if !node.children.is_empty() {
        return Err(SchemaError::malformed(
            node.line,
            format!("type `{word}` does not take a nested block"),
        ));
    }
    Ok(ty)
}

fn is_identifier(word: &str) -> bool {
    !word.is_empty()
        && word.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_example_compiles_to_a_channel_with_one_command() {
        let source = "interface Foo\n  command bar\n    parameters\n      x: number\n";
        let decls = compile(source).unwrap();
        let foo = decls.interface("Foo").unwrap();
        assert!(foo.initializer.is_empty());
        assert_eq!(foo.commands.len(), 1);
        let bar = &foo.commands[0];
        assert_eq!(bar.name, "bar");
        assert_eq!(bar.params.len(), 1);
        assert_eq!(bar.params[0].name, "x");
        assert_eq!(bar.params[0].ty, TypeRef::Number);
        assert!(bar.returns.is_empty());
    }

    #[test]
    fn test_optional_field_marker() {
        let decls = compile("type Point\n  x: number\n  label?: string\n").unwrap();
        let Declaration::Type(point) = &decls.items[0] else {
            panic!("expected type declaration");
        };
        assert!(!point.fields[0].optional);
        assert!(point.fields[1].optional);
        assert_eq!(point.fields[1].ty, TypeRef::String);
    }

    #[test]
    fn test_interface_reference_becomes_channel() {
        let source = "interface Page\ninterface Browser\n  command newPage\n    returns\n      page: Page\n";
        let decls = compile(source).unwrap();
        let browser = decls.interface("Browser").unwrap();
        assert_eq!(
            browser.commands[0].returns[0].ty,
            TypeRef::Channel("Page".to_string())
        );
    }

    #[test]
    fn test_unknown_name_becomes_named_reference() {
        let decls = compile("type Box\n  frame: Rect\n").unwrap();
        let Declaration::Type(decl) = &decls.items[0] else {
            panic!("expected type declaration");
        };
        assert_eq!(decl.fields[0].ty, TypeRef::Named("Rect".to_string()));
    }

    #[test]
    fn test_array_suffix_wraps_resolved_type() {
        let decls = compile("type Path\n  points: number[]\n").unwrap();
        let Declaration::Type(decl) = &decls.items[0] else {
            panic!("expected type declaration");
        };
        assert_eq!(
            decl.fields[0].ty,
            TypeRef::Array(Box::new(TypeRef::Number))
        );
    }

    #[test]
    fn test_inline_enum_and_object() {
        let source = "type Options\n  kind: enum\n    fast\n    slow\n  extra: object\n    depth: number\n";
        let decls = compile(source).unwrap();
        let Declaration::Type(decl) = &decls.items[0] else {
            panic!("expected type declaration");
        };
        assert_eq!(
            decl.fields[0].ty,
            TypeRef::Enum(vec!["fast".to_string(), "slow".to_string()])
        );
        let TypeRef::Object(fields) = &decl.fields[1].ty else {
            panic!("expected inline object");
        };
        assert_eq!(fields[0].name, "depth");
    }

    #[test]
    fn test_initializer_and_events() {
        let source = "interface Worker\n  initializer\n    url: string\n  event closed\n  event message\n    data: string\n";
        let decls = compile(source).unwrap();
        let worker = decls.interface("Worker").unwrap();
        assert_eq!(worker.initializer[0].name, "url");
        assert_eq!(worker.events.len(), 2);
        assert!(worker.events[0].params.is_empty());
        assert_eq!(worker.events[1].params[0].name, "data");
    }

    #[test]
    fn test_union_members() {
        let decls = compile("union Input\n  Keyboard\n  Mouse\n").unwrap();
        let Declaration::Union(union) = &decls.items[0] else {
            panic!("expected union declaration");
        };
        assert_eq!(union.members, ["Keyboard", "Mouse"]);
    }

    #[test]
    fn test_unclassified_line_reports_words_and_line() {
        let err = compile("interface Foo\n  frobnicate quickly now\n").unwrap_err();
        assert_eq!(
            err,
            SchemaError::Unclassified {
                line: 2,
                words: "frobnicate quickly now".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_top_level_keyword_fails() {
        let err = compile("gadget Foo\n").unwrap_err();
        assert!(matches!(err, SchemaError::Unclassified { line: 1, .. }));
    }

    #[test]
    fn test_duplicate_declaration_fails() {
        let err = compile("type A\ntype A\n").unwrap_err();
        assert!(matches!(err, SchemaError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_scalar_type_rejects_nested_block() {
        let err = compile("type A\n  x: number\n    y: number\n").unwrap_err();
        assert!(matches!(err, SchemaError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_catalog_lists_commands_per_interface() {
        let source = "interface Foo\n  command bar\n  command baz\ninterface Quux\n";
        let decls = compile(source).unwrap();
        assert_eq!(
            decls.catalog(),
            vec![
                ("Foo".to_string(), vec!["bar".to_string(), "baz".to_string()]),
                ("Quux".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let source = "interface Foo\n  initializer\n    name: string\n  command bar\n    parameters\n      x: number\n";
        assert_eq!(compile(source).unwrap(), compile(source).unwrap());
    }
}
