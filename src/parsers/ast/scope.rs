// Lexical scope stack with copy-on-write alias maps
//
// Scopes and alias maps move together: entering a named scope pushes the
// scope name and a shallow copy of the parent's alias map, so imports seen
// inside a function never leak out while outer aliases stay visible.

use std::collections::HashMap;

pub const MODULE_SCOPE: &str = "<module>";

pub struct ScopeStack {
    scopes: Vec<String>,
    aliases: Vec<HashMap<String, String>>,
}

impl ScopeStack {
    /// A fresh stack rooted at the synthetic `<module>` scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![MODULE_SCOPE.to_string()],
            aliases: vec![HashMap::new()],
        }
    }

    pub fn current(&self) -> &str {
        self.scopes.last().map(String::as_str).unwrap_or(MODULE_SCOPE)
    }

    pub fn push(&mut self, name: &str) {
        self.scopes.push(name.to_string());
        let inherited = self.aliases.last().cloned().unwrap_or_default();
        self.aliases.push(inherited);
    }

    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
            self.aliases.pop();
        }
    }

    /// Bind `name` to a qualified target in the current scope.
    pub fn add_alias(&mut self, name: &str, target: &str) {
        if let Some(top) = self.aliases.last_mut() {
            top.insert(name.to_string(), target.to_string());
        }
    }

    /// Resolve a dotted expression through the current alias map by its
    /// base identifier: `A.b.c` with alias `A ↦ numpy.array` becomes
    /// `numpy.array.b.c`.
    pub fn resolve(&self, dotted: &str) -> String {
        let dotted = dotted.trim();
        if dotted.is_empty() {
            return String::new();
        }

        let aliases = match self.aliases.last() {
            Some(map) => map,
            None => return dotted.to_string(),
        };

        match dotted.split_once('.') {
            Some((base, rest)) => {
                let resolved = aliases.get(base).map(String::as_str).unwrap_or(base);
                format!("{resolved}.{rest}")
            }
            None => aliases
                .get(dotted)
                .cloned()
                .unwrap_or_else(|| dotted.to_string()),
        }
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_inherit_downward_but_not_upward() {
        let mut stack = ScopeStack::new();
        stack.add_alias("np", "numpy");

        stack.push("inner");
        assert_eq!(stack.resolve("np.array"), "numpy.array");
        stack.add_alias("pd", "pandas");
        assert_eq!(stack.resolve("pd.DataFrame"), "pandas.DataFrame");
        stack.pop();

        // The inner alias is gone once the scope closes.
        assert_eq!(stack.resolve("pd.DataFrame"), "pd.DataFrame");
        assert_eq!(stack.resolve("np.array"), "numpy.array");
    }

    #[test]
    fn inner_scopes_can_shadow_outer_aliases() {
        let mut stack = ScopeStack::new();
        stack.add_alias("A", "numpy.array");
        stack.push("f");
        stack.add_alias("A", "local.array");
        assert_eq!(stack.resolve("A"), "local.array");
        stack.pop();
        assert_eq!(stack.resolve("A"), "numpy.array");
    }

    #[test]
    fn module_scope_never_pops() {
        let mut stack = ScopeStack::new();
        stack.pop();
        stack.pop();
        assert_eq!(stack.current(), MODULE_SCOPE);
    }
}
