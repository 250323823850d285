// Parser strategies: AST-level extraction with declarative-pattern and
// structured line-oriented fallbacks
//
// Strategies compose under a "try in order, empty result is valid" policy.
// A failing strategy never propagates; the next one runs, and a file that
// defeats every strategy simply indexes with no symbols.

pub mod ast;
pub mod patterns;
pub mod structured;

use crate::config::Config;
use crate::types::ParsedFile;
use std::path::Path;
use tracing::debug;

pub use ast::AstParser;
pub use patterns::PatternExtractor;
pub use structured::StructuredParser;

/// Uniform contract every strategy implements.
pub trait ParseStrategy {
    /// Parse one file. `None` means this strategy cannot handle the input
    /// (missing grammar, engine failure); an empty `ParsedFile` is a valid
    /// success.
    fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile>;
}

/// Tagged strategy variant, dispatched through `ParseStrategy`.
pub enum ParserStrategy {
    AstBased(AstParser),
    PatternBased(PatternExtractor),
    Structured(StructuredParser),
}

impl ParseStrategy for ParserStrategy {
    fn parse(&mut self, text: &str, path: &Path) -> Option<ParsedFile> {
        match self {
            Self::AstBased(parser) => parser.parse(text, path),
            Self::PatternBased(extractor) => extractor.parse(text, path),
            Self::Structured(parser) => parser.parse(text, path),
        }
    }
}

pub struct ParserFactory {
    use_pattern_extractor: bool,
}

impl ParserFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            use_pattern_extractor: config.use_pattern_extractor,
        }
    }

    /// Parse a file with the best available strategy chain for `language`.
    /// Always returns a `ParsedFile`; the worst case is an empty one.
    pub fn parse(&self, text: &str, path: &Path, language: &str) -> ParsedFile {
        if let Some(mut parsed) = AstParser::new(language, path)
            .and_then(|mut parser| parser.parse(text, path))
        {
            // The pattern engine, when enabled, replaces relationship
            // extraction only; symbols stay on the AST side. Any failure
            // falls back to the AST relationships silently.
            if self.use_pattern_extractor && PatternExtractor::supports(language) {
                let mut extractor = PatternExtractor::new(language);
                if let Some(pattern_parsed) = extractor.parse(text, path) {
                    parsed.relationships = pattern_parsed.relationships;
                } else {
                    debug!(
                        "Pattern extractor failed for {}, keeping AST relationships",
                        path.display()
                    );
                }
            }
            return parsed;
        }

        let mut fallback = StructuredParser::new(language);
        fallback.parse(text, path).unwrap_or_else(|| ParsedFile {
            path: path.to_path_buf(),
            language: language.to_string(),
            symbols: Vec::new(),
            relationships: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelationshipKind;

    #[test]
    fn factory_always_returns_a_parsed_file() {
        let factory = ParserFactory::new(&Config::default());
        let parsed = factory.parse("not really code {{{", Path::new("/x/strange.py"), "python");
        assert_eq!(parsed.language, "python");
    }

    #[test]
    fn unknown_language_falls_back_to_structured() {
        let factory = ParserFactory::new(&Config::default());
        let parsed = factory.parse(
            "fn main() {\n    helper();\n}\n",
            Path::new("/x/main.rs"),
            "rust",
        );
        assert!(parsed.symbols.iter().any(|s| s.name == "main"));
    }

    #[test]
    fn alias_resolution_survives_the_whole_chain() {
        let factory = ParserFactory::new(&Config::default());
        let parsed = factory.parse(
            "from numpy import array as A\ndef g():\n    return A([1])\n",
            Path::new("/x/f.py"),
            "python",
        );

        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Imports && r.target_symbol == "numpy.array"
        }));
        assert!(parsed.relationships.iter().any(|r| {
            r.kind == RelationshipKind::Call
                && r.source_symbol == "g"
                && r.target_symbol == "numpy.array"
        }));
    }
}
