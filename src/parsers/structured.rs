// Structured line-oriented fallback parsers
//
// Used only when no AST grammar is available for a language. Matchers are
// best-effort: they emit declaration symbols and coarse IMPORTS/CALL
// relationships, and an empty result is a valid outcome.

use crate::parsers::ParseStrategy;
use crate::parsers::ast::scope::MODULE_SCOPE;
use crate::types::{CodeRelationship, ParsedFile, RelationshipKind, Symbol, SymbolKind};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub struct StructuredParser {
    language: String,
}

impl StructuredParser {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
        }
    }
}

impl ParseStrategy for StructuredParser {
    fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile> {
        let source_file = path.to_string_lossy().to_string();

        let (symbols, relationships) = match self.language.as_str() {
            "rust" => extract_rust(text, &source_file),
            "go" => extract_go(text, &source_file),
            "python" => extract_python_lines(text, &source_file),
            _ => return None,
        };

        Some(ParsedFile {
            path: path.to_path_buf(),
            language: self.language.clone(),
            symbols,
            relationships,
        })
    }
}

struct LineMatchers {
    rust_fn: Regex,
    rust_type: Regex,
    rust_use: Regex,
    go_func: Regex,
    go_type: Regex,
    go_import: Regex,
    py_def: Regex,
    py_class: Regex,
    py_import: Regex,
    py_from_import: Regex,
    call: Regex,
}

fn matchers() -> &'static LineMatchers {
    static MATCHERS: OnceLock<LineMatchers> = OnceLock::new();
    MATCHERS.get_or_init(|| LineMatchers {
        rust_fn: Regex::new(r"^\s*(?:pub\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)").unwrap(),
        rust_type: Regex::new(r"^\s*(?:pub\s+)?(struct|enum|trait)\s+(\w+)").unwrap(),
        rust_use: Regex::new(r"^\s*(?:pub\s+)?use\s+([\w:]+)").unwrap(),
        go_func: Regex::new(r"^func\s+(?:\([^)]*\)\s+)?(\w+)").unwrap(),
        go_type: Regex::new(r"^type\s+(\w+)\s+(?:struct|interface)").unwrap(),
        go_import: Regex::new(r#"^\s*(?:import\s+)?"([^"]+)"\s*$"#).unwrap(),
        py_def: Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)").unwrap(),
        py_class: Regex::new(r"^\s*class\s+(\w+)(?:\(([\w.]+)[^)]*\))?").unwrap(),
        py_import: Regex::new(r"^import\s+([\w.]+)").unwrap(),
        py_from_import: Regex::new(r"^from\s+([\w.]+)\s+import\s+(\w+)").unwrap(),
        call: Regex::new(r"\b([a-zA-Z_][\w]*)\s*\(").unwrap(),
    })
}

const CALL_NOISE: &[&str] = &[
    "if", "for", "while", "match", "return", "fn", "def", "class", "func", "switch", "catch",
    "print", "println",
];

fn push_calls(
    relationships: &mut Vec<CodeRelationship>,
    line: &str,
    scope: &str,
    source_file: &str,
    line_no: u32,
) {
    for captures in matchers().call.captures_iter(line) {
        let target = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        if target.is_empty() || CALL_NOISE.contains(&target) || target == scope {
            continue;
        }
        relationships.push(CodeRelationship {
            source_symbol: scope.to_string(),
            target_symbol: target.to_string(),
            kind: RelationshipKind::Call,
            source_file: source_file.to_string(),
            target_file: None,
            source_line: line_no,
        });
    }
}

fn extract_rust(text: &str, source_file: &str) -> (Vec<Symbol>, Vec<CodeRelationship>) {
    let m = matchers();
    let mut symbols = Vec::new();
    let mut relationships = Vec::new();
    let mut scope = MODULE_SCOPE.to_string();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as u32 + 1;

        if let Some(captures) = m.rust_fn.captures(line) {
            let name = captures[1].to_string();
            symbols.push(Symbol::new(&name, SymbolKind::Function, (line_no, line_no)));
            scope = name;
            continue;
        }
        if let Some(captures) = m.rust_type.captures(line) {
            let kind = match &captures[1] {
                "struct" => SymbolKind::Struct,
                "trait" => SymbolKind::Interface,
                _ => SymbolKind::Class,
            };
            symbols.push(Symbol::new(&captures[2], kind, (line_no, line_no)));
            continue;
        }
        if let Some(captures) = m.rust_use.captures(line) {
            relationships.push(CodeRelationship {
                source_symbol: MODULE_SCOPE.to_string(),
                target_symbol: captures[1].replace("::", "."),
                kind: RelationshipKind::Imports,
                source_file: source_file.to_string(),
                target_file: None,
                source_line: line_no,
            });
            continue;
        }

        push_calls(&mut relationships, line, &scope, source_file, line_no);
    }

    (symbols, relationships)
}

fn extract_go(text: &str, source_file: &str) -> (Vec<Symbol>, Vec<CodeRelationship>) {
    let m = matchers();
    let mut symbols = Vec::new();
    let mut relationships = Vec::new();
    let mut scope = MODULE_SCOPE.to_string();
    let mut in_import_block = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as u32 + 1;
        let trimmed = line.trim();

        if trimmed.starts_with("import (") {
            in_import_block = true;
            continue;
        }
        if in_import_block {
            if trimmed == ")" {
                in_import_block = false;
                continue;
            }
            if let Some(captures) = m.go_import.captures(trimmed) {
                relationships.push(CodeRelationship {
                    source_symbol: MODULE_SCOPE.to_string(),
                    target_symbol: captures[1].to_string(),
                    kind: RelationshipKind::Imports,
                    source_file: source_file.to_string(),
                    target_file: None,
                    source_line: line_no,
                });
            }
            continue;
        }

        if let Some(captures) = m.go_func.captures(line) {
            let name = captures[1].to_string();
            symbols.push(Symbol::new(&name, SymbolKind::Function, (line_no, line_no)));
            scope = name;
            continue;
        }
        if let Some(captures) = m.go_type.captures(line) {
            symbols.push(Symbol::new(&captures[1], SymbolKind::Struct, (line_no, line_no)));
            continue;
        }

        push_calls(&mut relationships, line, &scope, source_file, line_no);
    }

    (symbols, relationships)
}

/// Line-oriented Python extraction, used only when the grammar failed to
/// load. Indentation decides method-vs-function.
fn extract_python_lines(text: &str, source_file: &str) -> (Vec<Symbol>, Vec<CodeRelationship>) {
    let m = matchers();
    let mut symbols = Vec::new();
    let mut relationships = Vec::new();
    let mut scope = MODULE_SCOPE.to_string();
    let mut in_class = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as u32 + 1;

        if let Some(captures) = m.py_class.captures(line) {
            let name = captures.get(1).map(|c| c.as_str()).unwrap_or("");
            symbols.push(Symbol::new(name, SymbolKind::Class, (line_no, line_no)));
            if let Some(base) = captures.get(2) {
                relationships.push(CodeRelationship {
                    source_symbol: name.to_string(),
                    target_symbol: base.as_str().to_string(),
                    kind: RelationshipKind::Inherits,
                    source_file: source_file.to_string(),
                    target_file: None,
                    source_line: line_no,
                });
            }
            in_class = true;
            continue;
        }
        if let Some(captures) = m.py_def.captures(line) {
            let indented = !captures[1].is_empty();
            let name = captures.get(2).map(|c| c.as_str()).unwrap_or("");
            let kind = if indented && in_class {
                SymbolKind::Method
            } else {
                SymbolKind::Function
            };
            symbols.push(Symbol::new(name, kind, (line_no, line_no)));
            scope = name.to_string();
            if !indented {
                in_class = false;
            }
            continue;
        }
        if let Some(captures) = m.py_from_import.captures(line) {
            relationships.push(CodeRelationship {
                source_symbol: MODULE_SCOPE.to_string(),
                target_symbol: format!("{}.{}", &captures[1], &captures[2]),
                kind: RelationshipKind::Imports,
                source_file: source_file.to_string(),
                target_file: None,
                source_line: line_no,
            });
            continue;
        }
        if let Some(captures) = m.py_import.captures(line) {
            relationships.push(CodeRelationship {
                source_symbol: MODULE_SCOPE.to_string(),
                target_symbol: captures[1].to_string(),
                kind: RelationshipKind::Imports,
                source_file: source_file.to_string(),
                target_file: None,
                source_line: line_no,
            });
            continue;
        }

        let base = line.trim_start();
        if base.starts_with("self.") || base.starts_with("cls.") {
            continue;
        }
        push_calls(&mut relationships, line, &scope, source_file, line_no);
    }

    (symbols, relationships)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_fallback_finds_functions_and_uses() {
        let mut parser = StructuredParser::new("rust");
        let parsed = parser
            .parse(
                "use std::fs;\n\npub fn read_all() {\n    helper();\n}\nstruct Cache;\n",
                Path::new("/src/lib.rs"),
            )
            .unwrap();

        assert!(parsed.symbols.iter().any(|s| s.name == "read_all"));
        assert!(parsed.symbols.iter().any(|s| s.name == "Cache"));
        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "std.fs"
        }));
        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Call
                && r.source_symbol == "read_all"
                && r.target_symbol == "helper"
        }));
    }

    #[test]
    fn go_import_blocks_are_understood() {
        let mut parser = StructuredParser::new("go");
        let parsed = parser
            .parse(
                "package main\n\nimport (\n    \"fmt\"\n    \"net/http\"\n)\n\nfunc main() {\n    fmt.Println(\"x\")\n}\n",
                Path::new("/src/main.go"),
            )
            .unwrap();

        let imports: Vec<_> = parsed
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Imports)
            .map(|r| r.target_symbol.as_str())
            .collect();
        assert_eq!(imports, vec!["fmt", "net/http"]);
    }

    #[test]
    fn unknown_language_is_declined() {
        let mut parser = StructuredParser::new("cobol");
        assert!(parser.parse("PERFORM X", Path::new("/s")).is_none());
    }
}
