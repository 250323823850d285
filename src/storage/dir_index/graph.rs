// Precomputed symbol neighborhood graph
//
// `graph_neighbors` holds undirected 1- and 2-hop pairs derived from
// `code_relationships`. Relationship targets resolve to symbol ids within
// the same file first, then cross-file by name only when the name is
// unambiguous in this store. Two-hop sets are hop-of-hop minus the origin
// and the direct neighbors, so cycles never recurse.

use super::DirIndexStore;
use crate::errors::Result;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A neighbor row joined back to its defining symbol and file.
#[derive(Debug, Clone)]
pub struct NeighborSymbol {
    pub name: String,
    pub kind: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub depth: u32,
}

/// Best-effort reduction of a relationship target to a bare symbol name:
/// strip call parentheses, keep the leaf of qualified names, trim
/// non-identifier noise.
fn normalize_relationship_target(target: &str) -> String {
    let mut target = target.trim();
    if let Some(stripped) = target.strip_suffix("()") {
        target = stripped;
    }

    for separator in ["::", ".", "#"] {
        if let Some(idx) = target.rfind(separator) {
            target = &target[idx + separator.len()..];
        }
    }

    target
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .to_string()
}

impl DirIndexStore {
    /// Recompute the full `graph_neighbors` table from current symbols and
    /// relationships. `max_depth` is bounded to 2.
    pub fn compute_graph_neighbors(&self, max_depth: u32) -> Result<usize> {
        let max_depth = max_depth.clamp(1, 2);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM graph_neighbors", [])?;

        let symbol_rows: Vec<(i64, i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, file_id, name FROM symbols")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        let rel_rows: Vec<(Option<i64>, i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT source_symbol_id, file_id, target_qualified_name FROM code_relationships",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        if symbol_rows.is_empty() || rel_rows.is_empty() {
            tx.commit()?;
            return Ok(0);
        }

        let mut by_file_and_name: HashMap<(i64, &str), Vec<i64>> = HashMap::new();
        let mut by_name: HashMap<&str, Vec<i64>> = HashMap::new();
        for (id, file_id, name) in &symbol_rows {
            by_file_and_name
                .entry((*file_id, name.as_str()))
                .or_default()
                .push(*id);
            by_name.entry(name.as_str()).or_default().push(*id);
        }

        let mut adjacency: HashMap<i64, HashSet<i64>> = HashMap::new();
        for (source_id, file_id, target_raw) in &rel_rows {
            let Some(source_id) = source_id else { continue };
            let target_name = normalize_relationship_target(target_raw);
            if target_name.is_empty() {
                continue;
            }

            let candidates = match by_file_and_name.get(&(*file_id, target_name.as_str())) {
                Some(local) => local.as_slice(),
                None => {
                    // Cross-file resolution only when the name is unique.
                    match by_name.get(target_name.as_str()) {
                        Some(global) if global.len() == 1 => global.as_slice(),
                        _ => &[],
                    }
                }
            };

            for target_id in candidates {
                if target_id == source_id {
                    continue;
                }
                adjacency.entry(*source_id).or_default().insert(*target_id);
                adjacency.entry(*target_id).or_default().insert(*source_id);
            }
        }

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO graph_neighbors
                     (source_symbol_id, neighbor_symbol_id, relationship_depth)
                 VALUES (?1, ?2, ?3)",
            )?;

            for (source_id, first_hop) in &adjacency {
                for neighbor_id in first_hop {
                    stmt.execute(params![source_id, neighbor_id, 1])?;
                    inserted += 1;
                }

                if max_depth < 2 {
                    continue;
                }

                let mut second_hop: HashSet<i64> = HashSet::new();
                for neighbor_id in first_hop {
                    if let Some(next) = adjacency.get(neighbor_id) {
                        second_hop.extend(next);
                    }
                }
                second_hop.remove(source_id);
                for direct in first_hop {
                    second_hop.remove(direct);
                }

                for neighbor_id in second_hop {
                    stmt.execute(params![source_id, neighbor_id, 2])?;
                    inserted += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            "Computed {inserted} graph neighbor pairs in {}",
            self.db_path.display()
        );
        Ok(inserted)
    }

    /// Symbol id for `(file path, symbol name)`, when indexed here.
    pub fn find_symbol_id(&self, file_path: &str, name: &str) -> Result<Option<i64>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT s.id FROM symbols s
                 JOIN files f ON f.id = s.file_id
                 WHERE f.full_path = ?1 AND s.name = ?2
                 LIMIT 1",
                params![file_path, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Neighbors of one symbol at depth 1 and 2, joined back to their
    /// defining files.
    pub fn get_neighbors(&self, symbol_id: i64) -> Result<Vec<NeighborSymbol>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.name, s.kind, f.full_path, s.start_line, s.end_line, g.relationship_depth
             FROM graph_neighbors g
             JOIN symbols s ON s.id = g.neighbor_symbol_id
             JOIN files f ON f.id = s.file_id
             WHERE g.source_symbol_id = ?1
             ORDER BY g.relationship_depth, s.name",
        )?;
        let rows = stmt.query_map(params![symbol_id], |row| {
            Ok(NeighborSymbol {
                name: row.get(0)?,
                kind: row.get(1)?,
                file_path: row.get(2)?,
                start_line: row.get(3)?,
                end_line: row.get(4)?,
                depth: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodeRelationship, RelationshipKind, Symbol, SymbolKind};
    use std::path::Path;
    use tempfile::TempDir;

    fn rel(source: &str, target: &str, kind: RelationshipKind, file: &str) -> CodeRelationship {
        CodeRelationship {
            source_symbol: source.into(),
            target_symbol: target.into(),
            kind,
            source_file: file.into(),
            target_file: None,
            source_line: 1,
        }
    }

    /// A defines `Dog(Animal)`, B defines `Animal`, C defines `train`
    /// calling `Dog`. Expect Dog-Animal at depth 1 and Animal-train at
    /// depth 2 (through Dog).
    fn store_with_graph() -> (TempDir, DirIndexStore) {
        let dir = TempDir::new().unwrap();
        let store = DirIndexStore::open(&dir.path().join("_index.db")).unwrap();

        store
            .add_file(
                "a.py",
                Path::new("/src/a.py"),
                "class Dog(Animal): ...\n",
                "python",
                &[Symbol::new("Dog", SymbolKind::Class, (1, 1))],
                &[rel("Dog", "Animal", RelationshipKind::Inherits, "/src/a.py")],
            )
            .unwrap();
        store
            .add_file(
                "b.py",
                Path::new("/src/b.py"),
                "class Animal: pass\n",
                "python",
                &[Symbol::new("Animal", SymbolKind::Class, (1, 1))],
                &[],
            )
            .unwrap();
        store
            .add_file(
                "c.py",
                Path::new("/src/c.py"),
                "def train():\n    Dog()\n",
                "python",
                &[Symbol::new("train", SymbolKind::Function, (1, 2))],
                &[rel("train", "Dog", RelationshipKind::Call, "/src/c.py")],
            )
            .unwrap();

        store.compute_graph_neighbors(2).unwrap();
        (dir, store)
    }

    #[test]
    fn inheritance_produces_an_undirected_depth1_edge() {
        let (_dir, store) = store_with_graph();

        let dog_id = store.find_symbol_id("/src/a.py", "Dog").unwrap().unwrap();
        let neighbors = store.get_neighbors(dog_id).unwrap();
        assert!(
            neighbors
                .iter()
                .any(|n| n.name == "Animal" && n.depth == 1)
        );

        let animal_id = store.find_symbol_id("/src/b.py", "Animal").unwrap().unwrap();
        let neighbors = store.get_neighbors(animal_id).unwrap();
        assert!(neighbors.iter().any(|n| n.name == "Dog" && n.depth == 1));
    }

    #[test]
    fn two_hop_excludes_origin_and_direct_neighbors() {
        let (_dir, store) = store_with_graph();

        let animal_id = store.find_symbol_id("/src/b.py", "Animal").unwrap().unwrap();
        let neighbors = store.get_neighbors(animal_id).unwrap();

        let at_depth2: Vec<_> = neighbors.iter().filter(|n| n.depth == 2).collect();
        assert_eq!(at_depth2.len(), 1);
        assert_eq!(at_depth2[0].name, "train");
        assert!(!neighbors.iter().any(|n| n.name == "Animal"));
    }

    #[test]
    fn qualified_targets_resolve_to_leaf_names() {
        assert_eq!(normalize_relationship_target("pkg.mod.Class"), "Class");
        assert_eq!(normalize_relationship_target("ns::func()"), "func");
        assert_eq!(normalize_relationship_target("  weird!! "), "");
    }

    #[test]
    fn ambiguous_cross_file_names_are_not_linked() {
        let dir = TempDir::new().unwrap();
        let store = DirIndexStore::open(&dir.path().join("_index.db")).unwrap();

        // Two files both define `helper`; a caller elsewhere must not pick
        // either arbitrarily.
        for name in ["x.py", "y.py"] {
            let path = format!("/src/{name}");
            store
                .add_file(
                    name,
                    Path::new(&path),
                    "def helper(): pass\n",
                    "python",
                    &[Symbol::new("helper", SymbolKind::Function, (1, 1))],
                    &[],
                )
                .unwrap();
        }
        store
            .add_file(
                "z.py",
                Path::new("/src/z.py"),
                "def run():\n    helper()\n",
                "python",
                &[Symbol::new("run", SymbolKind::Function, (1, 2))],
                &[rel("run", "helper", RelationshipKind::Call, "/src/z.py")],
            )
            .unwrap();

        store.compute_graph_neighbors(2).unwrap();

        let run_id = store.find_symbol_id("/src/z.py", "run").unwrap().unwrap();
        assert!(store.get_neighbors(run_id).unwrap().is_empty());
    }
}
