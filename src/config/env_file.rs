// `.env`-style override files
//
// Loaded from `.codexlens/.env` in the workspace with fallback to the
// project root `.env`. Values already present in the process environment
// win unless `override_existing` is set.

use std::collections::HashMap;
use std::path::Path;

/// Parse a single `.env` line into `(key, value)`.
///
/// Supports `#` comments, an optional `export ` prefix, and single or
/// double quotes around the value.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();

    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim();
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut value = value.trim();

    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            value = &value[1..value.len() - 1];
        }
    }

    if key.is_empty() {
        return None;
    }

    Some((key.to_string(), value.to_string()))
}

/// Load key/value pairs from a `.env` file. Missing files yield an empty map.
pub fn load_env_file(path: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    let Ok(content) = std::fs::read_to_string(path) else {
        return vars;
    };

    for line in content.lines() {
        if let Some((key, value)) = parse_env_line(line) {
            vars.insert(key, value);
        }
    }

    vars
}

/// Collect overrides for a workspace: `.codexlens/.env` first, then the
/// workspace root `.env`, then the process environment (highest priority).
pub fn load_workspace_env(workspace_root: &Path) -> HashMap<String, String> {
    let mut vars = load_env_file(&workspace_root.join(".env"));
    // Workspace-local file shadows the project-root one.
    vars.extend(load_env_file(&workspace_root.join(".codexlens").join(".env")));

    for (key, value) in std::env::vars() {
        if key.starts_with("CODEXLENS_")
            || key.starts_with("CASCADE_")
            || key.starts_with("STAGED_")
            || key.starts_with("EMBEDDING_")
            || key.starts_with("RERANKER_")
            || key == "ENABLE_CASCADE_SEARCH"
            || key == "ENABLE_STAGED_RERANK"
        {
            vars.insert(key, value);
        }
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_lines() {
        assert_eq!(
            parse_env_line("KEY=value"),
            Some(("KEY".into(), "value".into()))
        );
        assert_eq!(
            parse_env_line("export KEY=value"),
            Some(("KEY".into(), "value".into()))
        );
        assert_eq!(
            parse_env_line("KEY=\"quoted value\""),
            Some(("KEY".into(), "quoted value".into()))
        );
        assert_eq!(
            parse_env_line("KEY='single'"),
            Some(("KEY".into(), "single".into()))
        );
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line("   "), None);
        assert_eq!(parse_env_line("not a pair"), None);
    }

    #[test]
    fn loads_file_with_mixed_content() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(
            &env_path,
            "# reranker\nRERANKER_ENABLED=true\nexport CASCADE_STRATEGY='staged'\n\nbadline\n",
        )
        .unwrap();

        let vars = load_env_file(&env_path);
        assert_eq!(vars.get("RERANKER_ENABLED").map(String::as_str), Some("true"));
        assert_eq!(vars.get("CASCADE_STRATEGY").map(String::as_str), Some("staged"));
        assert_eq!(vars.len(), 2);
    }
}
