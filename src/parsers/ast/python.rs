// Python symbol and relationship extraction

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
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    symbols.push(Symbol::new(
                        node_text(source, name),
                        SymbolKind::Class,
                        node_range(node),
                    ));
                }
            }
            "function_definition" | "async_function_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    symbols.push(Symbol::new(
                        node_text(source, name),
                        function_kind(node),
                        node_range(node),
                    ));
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

/// Method when the nearest enclosing definition is a class, function when
/// it is another function (or nothing).
fn function_kind(node: Node<'_>) -> SymbolKind {
    let mut parent = node.parent();
    while let Some(current) = parent {
        match current.kind() {
            "function_definition" | "async_function_definition" => return SymbolKind::Function,
            "class_definition" => return SymbolKind::Method,
            _ => {}
        }
        parent = current.parent();
    }
    SymbolKind::Function
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
        if matches!(base, "self" | "cls" | "super") {
            return;
        }
        self.record(RelationshipKind::Call, target, line);
    }

    fn visit(&mut self, node: Node<'_>) {
        let mut pushed_scope = false;

        match node.kind() {
            "class_definition" | "function_definition" | "async_function_definition" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let scope_name = node_text(self.source, name_node).trim().to_string();
                    if !scope_name.is_empty() {
                        self.scopes.push(&scope_name);
                        pushed_scope = true;
                    }
                }

                if node.kind() == "class_definition" && pushed_scope {
                    if let Some(superclasses) = node.child_by_field_name("superclasses") {
                        let mut cursor = superclasses.walk();
                        for child in superclasses.children(&mut cursor) {
                            let dotted = expression_to_dotted(self.source, child);
                            if dotted.is_empty() {
                                continue;
                            }
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
            "import_statement" | "import_from_statement" => {
                let (aliases, targets) = import_aliases_and_targets(self.source, node);
                for (name, target) in aliases {
                    self.scopes.add_alias(&name, &target);
                }
                for target in targets {
                    self.record(RelationshipKind::Imports, &target, node_start_line(node));
                }
            }
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    let dotted = expression_to_dotted(self.source, function);
                    if !dotted.is_empty() {
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

/// Flatten identifier / dotted_name / attribute chains into a dotted path.
fn expression_to_dotted(source: &[u8], node: Node<'_>) -> String {
    match node.kind() {
        "identifier" | "dotted_name" => node_text(source, node).trim().to_string(),
        "attribute" => {
            let object = node
                .child_by_field_name("object")
                .map(|n| expression_to_dotted(source, n))
                .unwrap_or_default();
            let attribute = node
                .child_by_field_name("attribute")
                .map(|n| node_text(source, n).trim().to_string())
                .unwrap_or_default();
            match (object.is_empty(), attribute.is_empty()) {
                (false, false) => format!("{object}.{attribute}"),
                (false, true) => object,
                _ => attribute,
            }
        }
        _ => String::new(),
    }
}

/// Alias bindings and IMPORTS targets introduced by one import statement.
///
/// `import a.b` binds `a ↦ a` and targets `a.b`; `import a.b as c` binds
/// `c ↦ a.b`; `from m import A as B` binds `B ↦ m.A` and targets `m.A`.
fn import_aliases_and_targets(
    source: &[u8],
    node: Node<'_>,
) -> (HashMap<String, String>, Vec<String>) {
    let mut aliases = HashMap::new();
    let mut targets = Vec::new();

    if node.kind() == "import_statement" {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "aliased_import" => {
                    let Some(name_node) = child.child_by_field_name("name") else {
                        continue;
                    };
                    let module = node_text(source, name_node).trim().to_string();
                    if module.is_empty() {
                        continue;
                    }
                    let bound = child
                        .child_by_field_name("alias")
                        .map(|n| node_text(source, n).trim().to_string())
                        .unwrap_or_else(|| {
                            module.split('.').next().unwrap_or(&module).to_string()
                        });
                    if !bound.is_empty() {
                        aliases.insert(bound, module.clone());
                    }
                    targets.push(module);
                }
                "dotted_name" => {
                    let module = node_text(source, child).trim().to_string();
                    if module.is_empty() {
                        continue;
                    }
                    let bound = module.split('.').next().unwrap_or(&module).to_string();
                    aliases.insert(bound.clone(), bound);
                    targets.push(module);
                }
                _ => {}
            }
        }
    }

    if node.kind() == "import_from_statement" {
        let module_node = node.child_by_field_name("module_name").or_else(|| {
            let mut cursor = node.walk();
            node.children(&mut cursor).find(|c| c.kind() == "dotted_name")
        });
        let module = module_node
            .map(|n| node_text(source, n).trim().to_string())
            .unwrap_or_default();

        let mut cursor = node.walk();
        for (i, child) in node.children(&mut cursor).enumerate() {
            let field = node.field_name_for_child(i as u32);
            match child.kind() {
                "aliased_import" => {
                    let Some(name_node) = child.child_by_field_name("name") else {
                        continue;
                    };
                    let imported = node_text(source, name_node).trim().to_string();
                    if imported.is_empty() || imported == "*" {
                        continue;
                    }
                    let target = if module.is_empty() {
                        imported.clone()
                    } else {
                        format!("{module}.{imported}")
                    };
                    let bound = child
                        .child_by_field_name("alias")
                        .map(|n| node_text(source, n).trim().to_string())
                        .unwrap_or_else(|| imported.clone());
                    if !bound.is_empty() {
                        aliases.insert(bound, target.clone());
                    }
                    targets.push(target);
                }
                // `from X import A, B` arrives as dotted_name/identifier
                // children in the "name" field.
                "dotted_name" | "identifier" if field == Some("name") => {
                    let imported = node_text(source, child).trim().to_string();
                    if imported.is_empty() || imported == "*" {
                        continue;
                    }
                    let target = if module.is_empty() {
                        imported.clone()
                    } else {
                        format!("{module}.{imported}")
                    };
                    aliases.insert(imported, target.clone());
                    targets.push(target);
                }
                _ => {}
            }
        }
    }

    (aliases, targets)
}
