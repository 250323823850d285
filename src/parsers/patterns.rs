// Declarative pattern engine for relationship extraction
//
// An optional replacement for AST relationship extraction: each language
// declares a rule table (regex + relationship kind + capture layout), and
// a shared engine applies the rules line by line while tracking the
// enclosing scope by indentation (Python) or brace depth (JS/TS). Symbol
// extraction always stays on the AST side; when this engine fails the
// caller silently keeps the AST relationships.

use crate::parsers::ParseStrategy;
use crate::parsers::ast::scope::MODULE_SCOPE;
use crate::types::{CodeRelationship, ParsedFile, RelationshipKind};
use regex::Regex;
use std::path::Path;

struct PatternRule {
    kind: RelationshipKind,
    pattern: Regex,
    /// Capture group holding the relationship target
    target_group: usize,
    /// Optional capture group holding a module prefix joined as `module.target`
    module_group: Option<usize>,
}

struct ScopeRule {
    /// Matches a scope-opening declaration; group 1 captures the name
    pattern: Regex,
}

pub struct PatternExtractor {
    language: String,
    rules: Vec<PatternRule>,
    scope_rules: Vec<ScopeRule>,
}

impl PatternExtractor {
    pub fn supports(language: &str) -> bool {
        matches!(language, "python" | "javascript" | "typescript")
    }

    pub fn new(language: &str) -> Self {
        let (rules, scope_rules) = match language {
            "python" => python_rules(),
            "javascript" | "typescript" => js_rules(),
            _ => (Vec::new(), Vec::new()),
        };
        Self {
            language: language.to_string(),
            rules,
            scope_rules,
        }
    }

    fn extract(&self, text: &str, path: &Path) -> Vec<CodeRelationship> {
        let source_file = path.to_string_lossy().to_string();
        let mut relationships = Vec::new();

        // (scope name, indentation) stack; module scope sits at depth -1.
        let mut scopes: Vec<(String, usize)> = Vec::new();

        for (line_idx, line) in text.lines().enumerate() {
            let line_no = line_idx as u32 + 1;
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
                continue;
            }
            let indent = line.len() - trimmed.len();

            // Close scopes that this line has dedented out of.
            while let Some((_, scope_indent)) = scopes.last() {
                if indent <= *scope_indent {
                    scopes.pop();
                } else {
                    break;
                }
            }

            let current_scope = scopes
                .last()
                .map(|(name, _)| name.as_str())
                .unwrap_or(MODULE_SCOPE);

            for rule in &self.rules {
                for captures in rule.pattern.captures_iter(trimmed) {
                    let Some(target) = captures.get(rule.target_group) else {
                        continue;
                    };
                    let mut target = target.as_str().trim().to_string();
                    if target.is_empty() {
                        continue;
                    }
                    if let Some(module_group) = rule.module_group {
                        if let Some(module) = captures.get(module_group) {
                            let module = module.as_str().trim();
                            if !module.is_empty() {
                                target = format!("{module}.{target}");
                            }
                        }
                    }

                    let base = target.split('.').next().unwrap_or("");
                    if rule.kind == RelationshipKind::Call
                        && matches!(base, "self" | "cls" | "super" | "this")
                    {
                        continue;
                    }

                    relationships.push(CodeRelationship {
                        source_symbol: current_scope.to_string(),
                        target_symbol: target,
                        kind: rule.kind,
                        source_file: source_file.clone(),
                        target_file: None,
                        source_line: line_no,
                    });
                }
            }

            for scope_rule in &self.scope_rules {
                if let Some(captures) = scope_rule.pattern.captures(trimmed) {
                    if let Some(name) = captures.get(1) {
                        scopes.push((name.as_str().to_string(), indent));
                    }
                }
            }
        }

        relationships
    }
}

impl ParseStrategy for PatternExtractor {
    fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile> {
        if self.rules.is_empty() {
            return None;
        }
        Some(ParsedFile {
            path: path.to_path_buf(),
            language: self.language.clone(),
            symbols: Vec::new(),
            relationships: self.extract(text, path),
        })
    }
}

fn python_rules() -> (Vec<PatternRule>, Vec<ScopeRule>) {
    let rules = vec![
        PatternRule {
            kind: RelationshipKind::Imports,
            pattern: Regex::new(r"^from\s+([\w.]+)\s+import\s+(\w+)").unwrap(),
            target_group: 2,
            module_group: Some(1),
        },
        PatternRule {
            kind: RelationshipKind::Imports,
            pattern: Regex::new(r"^import\s+([\w.]+)").unwrap(),
            target_group: 1,
            module_group: None,
        },
        PatternRule {
            kind: RelationshipKind::Inherits,
            pattern: Regex::new(r"^class\s+\w+\(([\w.]+)").unwrap(),
            target_group: 1,
            module_group: None,
        },
        PatternRule {
            kind: RelationshipKind::Call,
            pattern: Regex::new(r"\b([a-zA-Z_][\w.]*)\s*\(").unwrap(),
            target_group: 1,
            module_group: None,
        },
    ];
    let scope_rules = vec![ScopeRule {
        pattern: Regex::new(r"^(?:async\s+)?(?:def|class)\s+(\w+)").unwrap(),
    }];
    (rules, scope_rules)
}

fn js_rules() -> (Vec<PatternRule>, Vec<ScopeRule>) {
    let rules = vec![
        PatternRule {
            kind: RelationshipKind::Imports,
            pattern: Regex::new(r#"^import\s+.*from\s+["']([^"']+)["']"#).unwrap(),
            target_group: 1,
            module_group: None,
        },
        PatternRule {
            kind: RelationshipKind::Imports,
            pattern: Regex::new(r#"require\(\s*["']([^"']+)["']\s*\)"#).unwrap(),
            target_group: 1,
            module_group: None,
        },
        PatternRule {
            kind: RelationshipKind::Inherits,
            pattern: Regex::new(r"^(?:export\s+)?class\s+\w+\s+extends\s+([\w.]+)").unwrap(),
            target_group: 1,
            module_group: None,
        },
        PatternRule {
            kind: RelationshipKind::Call,
            pattern: Regex::new(r"\b([a-zA-Z_$][\w.$]*)\s*\(").unwrap(),
            target_group: 1,
            module_group: None,
        },
    ];
    let scope_rules = vec![
        ScopeRule {
            pattern: Regex::new(r"^(?:export\s+)?(?:async\s+)?function\s*\*?\s*(\w+)").unwrap(),
        },
        ScopeRule {
            pattern: Regex::new(r"^(?:export\s+)?class\s+(\w+)").unwrap(),
        },
    ];
    (rules, scope_rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(language: &str, text: &str) -> Vec<CodeRelationship> {
        let mut extractor = PatternExtractor::new(language);
        extractor
            .parse(text, Path::new("/src/sample"))
            .unwrap()
            .relationships
    }

    #[test]
    fn python_from_import_joins_module_and_name() {
        let rels = extract("python", "from os.path import join\n");
        assert!(rels.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "os.path.join"
        }));
    }

    #[test]
    fn calls_attribute_to_the_enclosing_scope() {
        let rels = extract(
            "python",
            "def outer():\n    helper()\n\ntop_level()\n",
        );

        let helper = rels
            .iter()
            .find(|r| r.target_symbol == "helper")
            .expect("helper call");
        assert_eq!(helper.source_symbol, "outer");

        let top = rels
            .iter()
            .find(|r| r.target_symbol == "top_level")
            .expect("top-level call");
        assert_eq!(top.source_symbol, MODULE_SCOPE);
    }

    #[test]
    fn self_calls_are_dropped() {
        let rels = extract("python", "class A:\n    def f(self):\n        self.g()\n");
        assert!(!rels.iter().any(|r| r.target_symbol.starts_with("self")));
    }

    #[test]
    fn js_extends_and_imports() {
        let rels = extract(
            "javascript",
            "import { x } from \"lib\";\nclass Panel extends Widget {}\n",
        );
        assert!(rels.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "lib"
        }));
        assert!(rels.iter().any(|r| {
            r.kind == RelationshipKind::Inherits && r.target_symbol == "Widget"
        }));
    }

    #[test]
    fn unsupported_language_yields_none() {
        let mut extractor = PatternExtractor::new("fortran");
        assert!(extractor.parse("x", Path::new("/s")).is_none());
    }
}
