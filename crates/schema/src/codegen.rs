//! Deterministic Rust code generation from compiled declarations.
//!
//! The generated artifact is meant to be checked into source control:
//! rendering the same [`Declarations`] twice produces byte-identical
//! output. For each interface it emits the initializer struct, per-command
//! params/result structs, per-event payload structs, method and event name
//! enums, and a `CATALOG` constant for registration-time validation.

use std::collections::VecDeque;
use std::fmt::Write as _;

use crate::model::{Declaration, Declarations, Field, InterfaceDecl, TypeRef};

/// Renders the compiled schema as a Rust source file.
pub fn render(decls: &Declarations) -> String {
    let mut w = CodeWriter::new();
    w.line("//! Generated protocol bindings. Do not edit by hand.");
    w.line("//!");
    w.line("//! Rendering is deterministic: regenerating from unchanged schema");
    w.line("//! source is a byte-for-byte no-op.");
    w.blank();
    w.line("use serde::{Deserialize, Serialize};");
    emit_protocol_imports(&mut w, decls);
    w.blank();

    for item in &decls.items {
        match item {
            Declaration::Type(decl) => {
                emit_struct_with_aux(&mut w, &decl.name, &decl.fields, None);
            }
            Declaration::Union(decl) => {
                w.line(&format!("/// Union of {}.", decl.members.join(" | ")));
                w.line("#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]");
                w.line("#[serde(untagged)]");
                w.open(&format!("pub enum {}", decl.name));
                for member in &decl.members {
                    w.line(&format!("{member}({member}),"));
                }
                w.close();
                w.blank();
            }
            Declaration::Interface(interface) => emit_interface(&mut w, interface),
        }
    }

    emit_catalog(&mut w, decls);
    w.finish()
}

fn emit_protocol_imports(w: &mut CodeWriter, decls: &Declarations) {
    let mut uses_binary = false;
    let mut uses_channel = false;
    let mut scan = |fields: &[Field]| {
        let mut stack: Vec<&TypeRef> = fields.iter().map(|f| &f.ty).collect();
        while let Some(ty) = stack.pop() {
            match ty {
                TypeRef::Binary => uses_binary = true,
                TypeRef::Channel(_) => uses_channel = true,
                TypeRef::Array(inner) => stack.push(inner),
                TypeRef::Object(fields) => stack.extend(fields.iter().map(|f| &f.ty)),
                _ => {}
            }
        }
    };
    for item in &decls.items {
        match item {
            Declaration::Type(decl) => scan(&decl.fields),
            Declaration::Union(_) => {}
            Declaration::Interface(interface) => {
                scan(&interface.initializer);
                for command in &interface.commands {
                    scan(&command.params);
                    scan(&command.returns);
                }
                for event in &interface.events {
                    scan(&event.params);
                }
            }
        }
    }
    match (uses_binary, uses_channel) {
        (true, true) => w.line("use tiller_protocol::{Binary, ChannelRef};"),
        (true, false) => w.line("use tiller_protocol::Binary;"),
        (false, true) => w.line("use tiller_protocol::ChannelRef;"),
        (false, false) => {}
    }
}

fn emit_interface(w: &mut CodeWriter, interface: &InterfaceDecl) {
    let name = &interface.name;

    emit_struct_with_aux(
        w,
        &format!("{name}Initializer"),
        &interface.initializer,
        Some(&format!("Initializer payload for `{name}` objects.")),
    );

    for command in &interface.commands {
        let verb = to_pascal(&command.name);
        if !command.params.is_empty() {
            emit_struct_with_aux(
                w,
                &format!("{name}{verb}Params"),
                &command.params,
                Some(&format!("Parameters of `{name}.{}`.", command.name)),
            );
        }
        if !command.returns.is_empty() {
            emit_struct_with_aux(
                w,
                &format!("{name}{verb}Result"),
                &command.returns,
                Some(&format!("Result of `{name}.{}`.", command.name)),
            );
        }
    }

    for event in &interface.events {
        if !event.params.is_empty() {
            emit_struct_with_aux(
                w,
                &format!("{name}{}Event", to_pascal(&event.name)),
                &event.params,
                Some(&format!("Payload of the `{name}.{}` event.", event.name)),
            );
        }
    }

    if !interface.commands.is_empty() {
        let variants: Vec<(String, &str)> = interface
            .commands
            .iter()
            .map(|c| (to_pascal(&c.name), c.name.as_str()))
            .collect();
        emit_name_enum(
            w,
            &format!("{name}Method"),
            &format!("Commands of the `{name}` channel."),
            &variants,
        );
    }

    if !interface.events.is_empty() {
        let variants: Vec<(String, &str)> = interface
            .events
            .iter()
            .map(|e| (to_pascal(&e.name), e.name.as_str()))
            .collect();
        emit_name_enum(
            w,
            &format!("{name}EventKind"),
            &format!("Events emitted by the `{name}` channel."),
            &variants,
        );
    }
}

/// Emits a struct plus every inline enum/object type reachable from its
/// fields, breadth-first in field order.
fn emit_struct_with_aux(w: &mut CodeWriter, name: &str, fields: &[Field], doc: Option<&str>) {
    let mut queue: VecDeque<Aux> = VecDeque::new();
    emit_struct(w, name, fields, doc, &mut queue);
    while let Some(aux) = queue.pop_front() {
        match aux {
            Aux::Enum { name, literals } => {
                w.line("#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]");
                w.open(&format!("pub enum {name}"));
                for literal in &literals {
                    w.line(&format!("#[serde(rename = \"{literal}\")]"));
                    w.line(&format!("{},", to_pascal(literal)));
                }
                w.close();
                w.blank();
            }
            Aux::Object { name, fields } => {
                emit_struct(w, &name, &fields, None, &mut queue);
            }
        }
    }
}

enum Aux {
    Enum { name: String, literals: Vec<String> },
    Object { name: String, fields: Vec<Field> },
}

fn emit_struct(
    w: &mut CodeWriter,
    name: &str,
    fields: &[Field],
    doc: Option<&str>,
    queue: &mut VecDeque<Aux>,
) {
    if let Some(doc) = doc {
        w.line(&format!("/// {doc}"));
    }
    w.line("#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]");
    if fields.is_empty() {
        w.line(&format!("pub struct {name} {{}}"));
        w.blank();
        return;
    }
    w.open(&format!("pub struct {name}"));
    for field in fields {
        let rust_name = to_snake(&field.name);
        let mut serde_attrs = Vec::new();
        if rust_name != field.name {
            serde_attrs.push(format!("rename = \"{}\"", field.name));
        }
        if field.optional {
            serde_attrs.push("skip_serializing_if = \"Option::is_none\"".to_string());
        }
        if !serde_attrs.is_empty() {
            w.line(&format!("#[serde({})]", serde_attrs.join(", ")));
        }
        let base = rust_type(&field.ty, name, &field.name, queue);
        let ty = if field.optional {
            format!("Option<{base}>")
        } else {
            base
        };
        w.line(&format!("pub {}: {ty},", escape_keyword(&rust_name)));
    }
    w.close();
    w.blank();
}

fn rust_type(ty: &TypeRef, owner: &str, field: &str, queue: &mut VecDeque<Aux>) -> String {
    match ty {
        TypeRef::String => "String".to_string(),
        TypeRef::Boolean => "bool".to_string(),
        TypeRef::Number => "f64".to_string(),
        TypeRef::Undefined => "()".to_string(),
        TypeRef::Binary => "Binary".to_string(),
        TypeRef::Channel(_) => "ChannelRef".to_string(),
        TypeRef::Named(name) => name.clone(),
        TypeRef::Array(inner) => format!("Vec<{}>", rust_type(inner, owner, field, queue)),
        TypeRef::Enum(literals) => {
            let name = format!("{owner}{}", to_pascal(field));
            queue.push_back(Aux::Enum {
                name: name.clone(),
                literals: literals.clone(),
            });
            name
        }
        TypeRef::Object(fields) => {
            let name = format!("{owner}{}", to_pascal(field));
            queue.push_back(Aux::Object {
                name: name.clone(),
                fields: fields.clone(),
            });
            name
        }
    }
}

fn emit_name_enum(w: &mut CodeWriter, name: &str, doc: &str, variants: &[(String, &str)]) {
    w.line(&format!("/// {doc}"));
    w.line("#[derive(Debug, Clone, Copy, PartialEq, Eq)]");
    w.open(&format!("pub enum {name}"));
    for (variant, _) in variants {
        w.line(&format!("{variant},"));
    }
    w.close();
    w.blank();
    w.open(&format!("impl {name}"));
    w.line("/// Wire name.");
    w.open("pub fn name(&self) -> &'static str");
    w.open("match self");
    for (variant, wire) in variants {
        w.line(&format!("Self::{variant} => \"{wire}\","));
    }
    w.close();
    w.close();
    w.blank();
    w.line("/// Parses a wire name.");
    w.open("pub fn from_name(name: &str) -> Option<Self>");
    w.open("match name");
    for (variant, wire) in variants {
        w.line(&format!("\"{wire}\" => Some(Self::{variant}),"));
    }
    w.line("_ => None,");
    w.close();
    w.close();
    w.close();
    w.blank();
}

fn emit_catalog(w: &mut CodeWriter, decls: &Declarations) {
    w.line("/// `(interface, commands)` pairs for handler registration validation.");
    w.open("pub const CATALOG: &[(&str, &[&str])] = &[");
    for interface in decls.interfaces() {
        let commands: Vec<String> = interface
            .commands
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        w.line(&format!(
            "(\"{}\", &[{}]),",
            interface.name,
            commands.join(", ")
        ));
    }
    w.indent -= 1;
    w.line("];");
}

/// Minimal indentation-tracking writer for the generated source.
struct CodeWriter {
    out: String,
    indent: usize,
}

impl CodeWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        let _ = writeln!(self.out, "{text}");
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Writes `header {` and indents until the matching [`Self::close`].
    fn open(&mut self, header: &str) {
        if header.ends_with('[') {
            self.line(header);
        } else {
            self.line(&format!("{header} {{"));
        }
        self.indent += 1;
    }

    fn close(&mut self) {
        self.indent -= 1;
        self.line("}");
    }

    fn finish(self) -> String {
        self.out
    }
}

/// camelCase (or dashed) name to snake_case.
fn to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// camelCase / snake_case / dashed name to PascalCase.
fn to_pascal(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for segment in name.split(['_', '-']) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

fn escape_keyword(name: &str) -> String {
    const KEYWORDS: &[&str] = &[
        "as", "async", "await", "box", "break", "const", "continue", "crate", "dyn", "else",
        "enum", "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod",
        "move", "mut", "pub", "ref", "return", "static", "struct", "super", "trait", "true",
        "type", "union", "unsafe", "use", "where", "while",
    ];
    if KEYWORDS.contains(&name) {
        format!("r#{name}")
    } else {
        name.to_string()
    }
}
