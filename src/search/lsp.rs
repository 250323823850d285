// Live language-server expansion seam
//
// The language-server integration itself is an external collaborator: the
// crate defines the bridge interface, the keep-alive slot, and the bounded
// breadth-first graph builder that drives it. A bridge is obtained through
// a factory registered on the engine; without one, realtime expansion
// degrades to the precomputed mode.

use crate::errors::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One node in the reference/call-hierarchy graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LspLocation {
    pub path: String,
    /// 1-based line
    pub line: u32,
    pub symbol_name: Option<String>,
}

pub trait LspBridge: Send + Sync {
    /// All references to the symbol at a location.
    fn references(&self, location: &LspLocation) -> Result<Vec<LspLocation>>;

    /// Incoming and outgoing call-hierarchy edges at a location.
    fn call_hierarchy(&self, location: &LspLocation) -> Result<Vec<LspLocation>>;

    /// Terminate the underlying server processes.
    fn stop(&self);
}

pub trait LspBridgeFactory: Send + Sync {
    fn create(
        &self,
        workspace_root: &Path,
        config_file: Option<&Path>,
    ) -> Result<Arc<dyn LspBridge>>;
}

/// Key identifying one keep-alive bridge instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveKey {
    pub workspace_root: PathBuf,
    pub config_file: Option<PathBuf>,
    pub timeout_ms: u64,
}

/// Bounded BFS over references and call-hierarchy edges.
pub struct LspGraphBuilder {
    pub max_depth: usize,
    pub max_nodes: usize,
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl LspGraphBuilder {
    /// Expand from `seeds`. The timeout is honored strictly: on expiry
    /// whatever graph exists so far is returned.
    pub fn expand(&self, bridge: &dyn LspBridge, seeds: &[LspLocation]) -> Vec<LspLocation> {
        let deadline = Instant::now() + self.timeout;
        let mut visited: HashSet<LspLocation> = seeds.iter().cloned().collect();
        let mut frontier: Vec<LspLocation> = seeds.to_vec();
        let mut collected: Vec<LspLocation> = Vec::new();

        for depth in 0..self.max_depth {
            if frontier.is_empty() || collected.len() >= self.max_nodes {
                break;
            }

            let mut next_frontier = Vec::new();
            // `max_concurrent` bounds how many requests fly per wave.
            for wave in frontier.chunks(self.max_concurrent.max(1)) {
                if Instant::now() >= deadline {
                    debug!("LSP expansion timed out at depth {depth}, returning partial graph");
                    return collected;
                }

                for node in wave {
                    let mut edges = Vec::new();
                    match bridge.references(node) {
                        Ok(references) => edges.extend(references),
                        Err(e) => debug!("references failed for {}: {e}", node.path),
                    }
                    match bridge.call_hierarchy(node) {
                        Ok(calls) => edges.extend(calls),
                        Err(e) => debug!("call hierarchy failed for {}: {e}", node.path),
                    }

                    for edge in edges {
                        if collected.len() >= self.max_nodes {
                            return collected;
                        }
                        if visited.insert(edge.clone()) {
                            collected.push(edge.clone());
                            next_frontier.push(edge);
                        }
                    }
                }
            }

            frontier = next_frontier;
        }

        collected
    }
}

/// Workspace root for LSP initialization: nearest ancestor carrying an
/// `lsp-servers.json`, then common project markers, then the start dir.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let start = if start.is_file() {
        start.parent().unwrap_or(start)
    } else {
        start
    };

    for dir in std::iter::successors(Some(start), |d| d.parent()) {
        if dir.join("lsp-servers.json").is_file() {
            return dir.to_path_buf();
        }
    }
    for dir in std::iter::successors(Some(start), |d| d.parent()) {
        if dir.join(".git").exists() || dir.join("pyproject.toml").is_file() {
            return dir.to_path_buf();
        }
    }
    start.to_path_buf()
}

pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() {
        start.parent().unwrap_or(start)
    } else {
        start
    };
    std::iter::successors(Some(start), |d| d.parent())
        .map(|d| d.join("lsp-servers.json"))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scripted bridge: adjacency list plus a call counter.
    struct MockBridge {
        edges: HashMap<String, Vec<LspLocation>>,
    }

    impl LspBridge for MockBridge {
        fn references(&self, location: &LspLocation) -> Result<Vec<LspLocation>> {
            Ok(self.edges.get(&location.path).cloned().unwrap_or_default())
        }

        fn call_hierarchy(&self, _location: &LspLocation) -> Result<Vec<LspLocation>> {
            Ok(Vec::new())
        }

        fn stop(&self) {}
    }

    fn loc(path: &str) -> LspLocation {
        LspLocation {
            path: path.into(),
            line: 1,
            symbol_name: None,
        }
    }

    #[test]
    fn bfs_respects_depth_and_node_caps() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec![loc("b"), loc("c")]);
        edges.insert("b".to_string(), vec![loc("d")]);
        edges.insert("d".to_string(), vec![loc("e")]);
        let bridge = MockBridge { edges };

        let one_hop = LspGraphBuilder {
            max_depth: 1,
            max_nodes: 50,
            max_concurrent: 2,
            timeout: Duration::from_secs(5),
        }
        .expand(&bridge, &[loc("a")]);
        let paths: Vec<&str> = one_hop.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c"]);

        let capped = LspGraphBuilder {
            max_depth: 3,
            max_nodes: 3,
            max_concurrent: 2,
            timeout: Duration::from_secs(5),
        }
        .expand(&bridge, &[loc("a")]);
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn cycles_do_not_loop() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec![loc("b")]);
        edges.insert("b".to_string(), vec![loc("a")]);
        let bridge = MockBridge { edges };

        let expanded = LspGraphBuilder {
            max_depth: 10,
            max_nodes: 50,
            max_concurrent: 1,
            timeout: Duration::from_secs(5),
        }
        .expand(&bridge, &[loc("a")]);
        assert_eq!(expanded.len(), 1);
    }

    #[test]
    fn expired_timeout_returns_partial_graph() {
        let mut edges = HashMap::new();
        edges.insert("a".to_string(), vec![loc("b")]);
        let bridge = MockBridge { edges };

        let expanded = LspGraphBuilder {
            max_depth: 5,
            max_nodes: 50,
            max_concurrent: 1,
            timeout: Duration::from_secs(0),
        }
        .expand(&bridge, &[loc("a")]);
        assert!(expanded.is_empty());
    }
}
