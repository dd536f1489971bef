//! Visualization support for rhizome trees
//!
//! Renders one or more tree versions as a Graphviz digraph. Nodes shared
//! between versions are drawn once, which makes structural sharing visible.
//! Also provides the serializable commit summary the CLI prints.

use crate::model::{Commit, Hash};
use crate::trie::{walk, MerkleTrie, TrieNode, ValueRef};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;

/// A commit in export format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VizCommit {
    /// The commit hash
    pub hash: String,
    pub root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Logical timestamp
    pub timestamp: u64,
    /// Parent commit hashes
    pub parents: Vec<String>,
}

impl VizCommit {
    pub fn new(id: &Hash, commit: &Commit) -> Self {
        VizCommit {
            hash: id.to_hex(),
            root: commit.root.to_hex(),
            message: commit.message.clone(),
            author: commit.author.clone(),
            timestamp: commit.timestamp,
            parents: commit.parents.iter().map(Hash::to_hex).collect(),
        }
    }
}

/// Render the given versions as a DOT digraph
///
/// Each `(label, root)` pair becomes a box pointing at its root node.
pub fn to_dot(trie: &MerkleTrie, versions: &[(String, Hash)]) -> Result<String> {
    let mut out = String::from("digraph rhizome {\n  node [shape=record, fontname=monospace];\n");
    let mut visited = HashSet::new();

    for (i, (label, root)) in versions.iter().enumerate() {
        let _ = writeln!(
            out,
            "  v{} [shape=box, style=filled, fillcolor=lightgrey, label=\"{}\"];",
            i,
            escape(label)
        );
        if root.is_zero() {
            let _ = writeln!(out, "  v{}_empty [shape=point];\n  v{} -> v{}_empty;", i, i, i);
            continue;
        }
        let _ = writeln!(out, "  v{} -> {};", i, node_id(root));

        walk(trie.store(), *root, &mut visited, |hash, node| {
            let _ = writeln!(out, "  {} [label=\"{}\"];", node_id(hash), node_label(hash, node));
            if let TrieNode::Branch { children, .. } = node {
                for (byte, child) in children {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [label=\"{}\"];",
                        node_id(hash),
                        node_id(child),
                        escape(&display_bytes(&[*byte]))
                    );
                }
            }
            Ok(())
        })?;
    }

    out.push_str("}\n");
    Ok(out)
}

fn node_id(hash: &Hash) -> String {
    format!("n{}", hash.short())
}

fn node_label(hash: &Hash, node: &TrieNode) -> String {
    let (kind, path) = match node {
        TrieNode::Leaf { suffix, .. } => ("leaf", suffix),
        TrieNode::Branch { prefix, .. } => ("branch", prefix),
    };
    let mut label = format!("{} {}|path: {}", kind, hash.short(), escape(&display_bytes(path)));
    if let Some(entry) = node.entry() {
        if let Some(key) = &entry.key {
            let _ = write!(label, "|key: {}", escape(&display_bytes(key)));
        }
        let value = match &entry.value {
            ValueRef::Inline(bytes) => display_bytes(bytes),
            ValueRef::Stored(value) => format!("-> {}", value.short()),
        };
        let _ = write!(label, "|value: {}", escape(&value));
    }
    label
}

/// Printable ASCII as-is, anything else as hex
fn display_bytes(bytes: &[u8]) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        format!("0x{}", hex::encode(bytes))
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '{' | '}' | '|' | '<' | '>') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::CommitInfo;
    use crate::store::NodeStore;

    #[test]
    fn test_dot_draws_shared_nodes_once() {
        let config = Config::default();
        let store = NodeStore::in_memory(&config);
        let trie = MerkleTrie::new(&store, &config);

        let v1 = trie.insert(Hash::ZERO, b"alpha", b"1").unwrap();
        let v1 = trie.insert(v1, b"beta", b"2").unwrap();
        let v2 = trie.insert(v1, b"beta", b"3").unwrap();

        let dot = to_dot(&trie, &[("v1".into(), v1), ("v2".into(), v2)]).unwrap();
        assert!(dot.starts_with("digraph rhizome {"));
        assert!(dot.trim_end().ends_with('}'));

        let all: HashSet<Hash> = trie
            .node_digests(v1)
            .unwrap()
            .union(&trie.node_digests(v2).unwrap())
            .copied()
            .collect();
        let declared = dot.lines().filter(|l| l.contains("[label=\"leaf") || l.contains("[label=\"branch")).count();
        assert_eq!(declared, all.len());
    }

    #[test]
    fn test_dot_empty_version_and_escaping() {
        let config = Config::default();
        let store = NodeStore::in_memory(&config);
        let trie = MerkleTrie::new(&store, &config);
        let root = trie.insert(Hash::ZERO, b"a\"b", &[0xff, 0x00]).unwrap();

        let dot = to_dot(&trie, &[("empty".into(), Hash::ZERO), ("quoted".into(), root)]).unwrap();
        assert!(dot.contains("v0_empty"));
        assert!(dot.contains("a\\\"b"));
        assert!(dot.contains("0xff00"));
    }

    #[test]
    fn test_viz_commit_export() {
        let commit = Commit::new(Hash::ZERO, vec![], 0, CommitInfo::message("init"));
        let id = commit.id().unwrap();
        let viz = VizCommit::new(&id, &commit);
        assert_eq!(viz.hash, id.to_hex());
        let json = serde_json::to_string(&viz).unwrap();
        assert!(json.contains("\"message\":\"init\""));
        assert!(!json.contains("author"));
    }
}
