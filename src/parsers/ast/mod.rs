// Grammar-driven AST parsing via tree-sitter
//
// Supported grammars: Python, JavaScript, TypeScript (TSX picked by file
// extension). Symbol extraction walks declarations; relationship
// extraction maintains a lexical scope stack plus per-scope alias maps
// inherited copy-on-write from the parent scope.

mod javascript;
mod python;
pub mod scope;

use crate::types::ParsedFile;
use std::path::Path;
use tree_sitter::{Node, Parser};

pub use scope::{MODULE_SCOPE, ScopeStack};

pub struct AstParser {
    language_id: String,
    parser: Parser,
}

impl AstParser {
    /// `None` when no grammar is available for `language` (callers fall
    /// back to the structured parser).
    pub fn new(language: &str, path: &Path) -> Option<Self> {
        let mut parser = Parser::new();

        let grammar = match language {
            "python" => tree_sitter_python::LANGUAGE.into(),
            "javascript" => tree_sitter_javascript::LANGUAGE.into(),
            "typescript" => {
                let is_tsx = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("tsx"));
                if is_tsx {
                    tree_sitter_typescript::LANGUAGE_TSX.into()
                } else {
                    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
                }
            }
            _ => return None,
        };

        parser.set_language(&grammar).ok()?;
        Some(Self {
            language_id: language.to_string(),
            parser,
        })
    }

    pub fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile> {
        let tree = self.parser.parse(text, None)?;
        let root = tree.root_node();
        let source = text.as_bytes();
        let source_file = path.to_string_lossy().to_string();

        let (symbols, relationships) = match self.language_id.as_str() {
            "python" => (
                python::extract_symbols(source, root),
                python::extract_relationships(source, root, &source_file),
            ),
            "javascript" | "typescript" => (
                javascript::extract_symbols(source, root),
                javascript::extract_relationships(source, root, &source_file),
            ),
            _ => return None,
        };

        Some(ParsedFile {
            path: path.to_path_buf(),
            language: self.language_id.clone(),
            symbols,
            relationships,
        })
    }
}

impl super::ParseStrategy for AstParser {
    fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile> {
        AstParser::parse(self, text, path)
    }
}

pub(crate) fn node_text<'a>(source: &'a [u8], node: Node<'_>) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

/// 1-based inclusive line range of a node.
pub(crate) fn node_range(node: Node<'_>) -> (u32, u32) {
    let start = node.start_position().row as u32 + 1;
    let end = node.end_position().row as u32 + 1;
    (start, end.max(start))
}

pub(crate) fn node_start_line(node: Node<'_>) -> u32 {
    node.start_position().row as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RelationshipKind, SymbolKind};

    fn parse_python(text: &str) -> ParsedFile {
        let path = Path::new("/src/sample.py");
        AstParser::new("python", path)
            .unwrap()
            .parse(text, path)
            .unwrap()
    }

    fn parse_ts(text: &str, name: &str) -> ParsedFile {
        let path_buf = Path::new("/src").join(name);
        AstParser::new("typescript", &path_buf)
            .unwrap()
            .parse(text, &path_buf)
            .unwrap()
    }

    #[test]
    fn python_classes_functions_and_methods() {
        let parsed = parse_python(
            "class Dog(Animal):\n    def bark(self):\n        pass\n\ndef feed():\n    pass\n",
        );

        let kinds: Vec<_> = parsed
            .symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind))
            .collect();
        assert!(kinds.contains(&("Dog", SymbolKind::Class)));
        assert!(kinds.contains(&("bark", SymbolKind::Method)));
        assert!(kinds.contains(&("feed", SymbolKind::Function)));
    }

    #[test]
    fn python_inherits_edge_is_alias_resolved() {
        let parsed = parse_python(
            "from zoo import Animal as Base\n\nclass Dog(Base):\n    pass\n",
        );

        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Inherits
                && r.source_symbol == "Dog"
                && r.target_symbol == "zoo.Animal"
        }));
    }

    #[test]
    fn python_self_and_cls_calls_are_dropped() {
        let parsed = parse_python(
            "class A:\n    def run(self):\n        self.step()\n        cls.make()\n        helper()\n",
        );

        let calls: Vec<_> = parsed
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Call)
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target_symbol, "helper");
        assert_eq!(calls[0].source_symbol, "run");
    }

    #[test]
    fn python_module_level_calls_attribute_to_module_scope() {
        let parsed = parse_python("import os\nos.getcwd()\n");

        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Call
                && r.source_symbol == MODULE_SCOPE
                && r.target_symbol == "os.getcwd"
        }));
    }

    #[test]
    fn typescript_symbols_and_imports() {
        let parsed = parse_ts(
            "import { render as draw } from \"ui\";\n\nexport class Panel {\n    show() { draw(); }\n}\nconst helper = () => 1;\n",
            "panel.ts",
        );

        assert!(parsed.symbols.iter().any(|s| s.name == "Panel" && s.kind == SymbolKind::Class));
        assert!(parsed.symbols.iter().any(|s| s.name == "show" && s.kind == SymbolKind::Method));
        assert!(parsed.symbols.iter().any(|s| s.name == "helper" && s.kind == SymbolKind::Function));

        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "ui.render"
        }));
        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Call
                && r.source_symbol == "show"
                && r.target_symbol == "ui.render"
        }));
    }

    #[test]
    fn javascript_require_records_an_import() {
        let path = Path::new("/src/app.js");
        let parsed = AstParser::new("javascript", path)
            .unwrap()
            .parse("const fs = require(\"fs\");\nfs.readFile(\"x\");\n", path)
            .unwrap();

        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "fs"
        }));
        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Call && r.target_symbol == "fs.readFile"
        }));
    }
}
