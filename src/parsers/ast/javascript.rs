// JavaScript / TypeScript symbol and relationship extraction

use super::scope::ScopeStack;
use super::{node_range, node_start_line, node_text};
use crate::types::{CodeRelationship, RelationshipKind, Symbol, SymbolKind};
use std::collections::HashMap;
use tree_sitter::Node;

pub fn extract_symbols(source: &[u8], root: Node<'_>) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        match node.kind() {
            "class_declaration" | "class" => {
                if let Some(name) = node.child_by_field_name("name") {
                    symbols.push(Symbol::new(
                        node_text(source, name),
                        SymbolKind::Class,
                        node_range(node),
                    ));
                }
            }
            "function_declaration" | "generator_function_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    symbols.push(Symbol::new(
                        node_text(source, name),
                        SymbolKind::Function,
                        node_range(node),
                    ));
                }
            }
            "variable_declarator" => {
                // Arrow functions bound to const/let names count as
                // functions; everything else is skipped.
                let name = node.child_by_field_name("name");
                let value = node.child_by_field_name("value");
                if let (Some(name), Some(value)) = (name, value) {
                    if matches!(name.kind(), "identifier" | "property_identifier")
                        && value.kind() == "arrow_function"
                    {
                        symbols.push(Symbol::new(
                            node_text(source, name),
                            SymbolKind::Function,
                            node_range(node),
                        ));
                    }
                }
            }
            "method_definition" if has_class_ancestor(node) => {
                if let Some(name) = node.child_by_field_name("name") {
                    let name_text = node_text(source, name);
                    if name_text != "constructor" {
                        symbols.push(Symbol::new(
                            name_text,
                            SymbolKind::Method,
                            node_range(node),
                        ));
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<_> = node.children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }

    symbols
}

fn has_class_ancestor(node: Node<'_>) -> bool {
    let mut parent = node.parent();
    while let Some(current) = parent {
        if matches!(current.kind(), "class_declaration" | "class") {
            return true;
        }
        parent = current.parent();
    }
    false
}

pub fn extract_relationships(
    source: &[u8],
    root: Node<'_>,
    source_file: &str,
) -> Vec<CodeRelationship> {
    let mut visitor = RelationshipVisitor {
        source,
        source_file,
        scopes: ScopeStack::new(),
        relationships: Vec::new(),
    };
    visitor.visit(root);
    visitor.relationships
}

struct RelationshipVisitor<'a> {
    source: &'a [u8],
    source_file: &'a str,
    scopes: ScopeStack,
    relationships: Vec<CodeRelationship>,
}

impl RelationshipVisitor<'_> {
    fn record(&mut self, kind: RelationshipKind, target: &str, line: u32) {
        let target = target.trim();
        if target.is_empty() {
            return;
        }
        self.relationships.push(CodeRelationship {
            source_symbol: self.scopes.current().to_string(),
            target_symbol: target.to_string(),
            kind,
            source_file: self.source_file.to_string(),
            target_file: None,
            source_line: line,
        });
    }

    fn record_call(&mut self, target: &str, line: u32) {
        let base = target.split('.').next().unwrap_or("");
        if matches!(base, "this" | "super") {
            return;
        }
        self.record(RelationshipKind::Call, target, line);
    }

    fn try_push_scope(&mut self, name_node: Option<Node<'_>>) -> bool {
        if let Some(name_node) = name_node {
            let scope_name = node_text(self.source, name_node).trim().to_string();
            if !scope_name.is_empty() {
                self.scopes.push(&scope_name);
                return true;
            }
        }
        false
    }

    fn visit(&mut self, node: Node<'_>) {
        let mut pushed_scope = false;

        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                pushed_scope = self.try_push_scope(node.child_by_field_name("name"));
            }
            "class_declaration" | "class" => {
                pushed_scope = self.try_push_scope(node.child_by_field_name("name"));

                if pushed_scope {
                    if let Some(superclass) = find_superclass(node) {
                        let dotted = expression_to_dotted(self.source, superclass);
                        if !dotted.is_empty() {
                            let resolved = self.scopes.resolve(&dotted);
                            self.record(
                                RelationshipKind::Inherits,
                                &resolved,
                                node_start_line(node),
                            );
                        }
                    }
                }
            }
            "variable_declarator" => {
                let name = node.child_by_field_name("name");
                let value = node.child_by_field_name("value");

                if let (Some(name_node), Some(value_node)) = (name, value) {
                    if matches!(name_node.kind(), "identifier" | "property_identifier")
                        && value_node.kind() == "arrow_function"
                    {
                        pushed_scope = self.try_push_scope(Some(name_node));
                    }

                    // CommonJS: const fs = require("fs")
                    if name_node.kind() == "identifier" && value_node.kind() == "call_expression" {
                        let callee = value_node.child_by_field_name("function");
                        let args = value_node.child_by_field_name("arguments");
                        if let (Some(callee), Some(args)) = (callee, args) {
                            if node_text(self.source, callee).trim() == "require" {
                                if let Some(module) = first_string_argument(self.source, args) {
                                    let local =
                                        node_text(self.source, name_node).trim().to_string();
                                    self.scopes.add_alias(&local, &module);
                                    self.record(
                                        RelationshipKind::Imports,
                                        &module,
                                        node_start_line(node),
                                    );
                                }
                            }
                        }
                    }
                }
            }
            "method_definition" if has_class_ancestor(node) => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let scope_name = node_text(self.source, name_node).trim().to_string();
                    if !scope_name.is_empty() && scope_name != "constructor" {
                        self.scopes.push(&scope_name);
                        pushed_scope = true;
                    }
                }
            }
            "import_statement" | "import_declaration" => {
                let (aliases, targets) = import_aliases_and_targets(self.source, node);
                for (name, target) in aliases {
                    self.scopes.add_alias(&name, &target);
                }
                for target in targets {
                    self.record(RelationshipKind::Imports, &target, node_start_line(node));
                }
            }
            "call_expression" => {
                if let Some(function) = node.child_by_field_name("function") {
                    let dotted = expression_to_dotted(self.source, function);
                    // `require` itself is handled as an import above.
                    if !dotted.is_empty() && dotted != "require" {
                        let resolved = self.scopes.resolve(&dotted);
                        self.record_call(&resolved, node_start_line(node));
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.visit(child);
        }

        if pushed_scope {
            self.scopes.pop();
        }
    }
}

/// `class X extends Y` - the superclass expression lives inside the
/// class_heritage child (TypeScript) or the `superclass` field (JavaScript).
fn find_superclass(node: Node<'_>) -> Option<Node<'_>> {
    if let Some(superclass) = node.child_by_field_name("superclass") {
        return Some(superclass);
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "class_heritage" {
            let mut inner = child.walk();
            for grandchild in child.children(&mut inner) {
                if matches!(
                    grandchild.kind(),
                    "identifier" | "member_expression" | "extends_clause"
                ) {
                    if grandchild.kind() == "extends_clause" {
                        let mut deep = grandchild.walk();
                        for value in grandchild.children(&mut deep) {
                            if matches!(value.kind(), "identifier" | "member_expression") {
                                return Some(value);
                            }
                        }
                        continue;
                    }
                    return Some(grandchild);
                }
            }
        }
    }
    None
}

fn expression_to_dotted(source: &[u8], node: Node<'_>) -> String {
    match node.kind() {
        "this" | "super" => node.kind().to_string(),
        "identifier" | "property_identifier" => node_text(source, node).trim().to_string(),
        "member_expression" => {
            let object = node
                .child_by_field_name("object")
                .map(|n| expression_to_dotted(source, n))
                .unwrap_or_default();
            let property = node
                .child_by_field_name("property")
                .map(|n| expression_to_dotted(source, n))
                .unwrap_or_default();
            match (object.is_empty(), property.is_empty()) {
                (false, false) => format!("{object}.{property}"),
                (false, true) => object,
                _ => property,
            }
        }
        _ => String::new(),
    }
}

fn strip_string_quotes(text: &str) -> String {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

fn first_string_argument(source: &[u8], args: Node<'_>) -> Option<String> {
    let mut cursor = args.walk();
    for child in args.children(&mut cursor) {
        if child.kind() == "string" {
            let module = strip_string_quotes(node_text(source, child));
            if !module.is_empty() {
                return Some(module);
            }
        }
    }
    None
}

/// Alias bindings and IMPORTS targets of one ES import declaration.
fn import_aliases_and_targets(
    source: &[u8],
    node: Node<'_>,
) -> (HashMap<String, String>, Vec<String>) {
    let mut aliases = HashMap::new();
    let mut targets = Vec::new();

    let module = node
        .child_by_field_name("source")
        .map(|n| strip_string_quotes(node_text(source, n)))
        .unwrap_or_default();
    if !module.is_empty() {
        targets.push(module.clone());
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() != "import_clause" {
            continue;
        }
        let mut clause_cursor = child.walk();
        for clause_child in child.children(&mut clause_cursor) {
            match clause_child.kind() {
                // Default import: import React from "react"
                "identifier" => {
                    let local = node_text(source, clause_child).trim().to_string();
                    if !local.is_empty() && !module.is_empty() {
                        aliases.insert(local, module.clone());
                    }
                }
                // Namespace import: import * as fs from "fs"
                "namespace_import" => {
                    let mut inner = clause_child.walk();
                    for part in clause_child.children(&mut inner) {
                        if part.kind() == "identifier" {
                            let local = node_text(source, part).trim().to_string();
                            if !local.is_empty() && !module.is_empty() {
                                aliases.insert(local, module.clone());
                            }
                        }
                    }
                }
                "named_imports" => {
                    let mut inner = clause_child.walk();
                    for spec in clause_child.children(&mut inner) {
                        if spec.kind() != "import_specifier" {
                            continue;
                        }
                        let Some(name_node) = spec.child_by_field_name("name") else {
                            continue;
                        };
                        let imported = node_text(source, name_node).trim().to_string();
                        if imported.is_empty() {
                            continue;
                        }
                        let local = spec
                            .child_by_field_name("alias")
                            .map(|n| node_text(source, n).trim().to_string())
                            .unwrap_or_else(|| imported.clone());
                        if !local.is_empty() && !module.is_empty() {
                            let target = format!("{module}.{imported}");
                            aliases.insert(local, target.clone());
                            targets.push(target);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    (aliases, targets)
}
