//! Arena-backed taxonomy tree.
//!
//! Nodes live in a flat `Vec` and refer to each other by index. The
//! pruned Augustus derivation is a fresh arena built by a filtered
//! top-down walk; the source tree is never mutated.

use std::collections::BTreeSet;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::taxdump::SlimTaxonTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub taxid: u32,
    /// Node label as stored in the source tree (the taxid as text).
    pub name: String,
    pub rank: String,
    parent: usize,
    children: Vec<usize>,
    depth: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaxonomyTree {
    nodes: Vec<TreeNode>,
    id_index: AHashMap<u32, usize>,
    name_index: AHashMap<String, usize>,
    root: usize,
}

impl TaxonomyTree {
    /// Builds the tree from the slim taxon table.
    ///
    /// Exactly one taxon must be its own parent (the root); every other
    /// parent id must resolve, and every node must be reachable from
    /// the root.
    pub fn from_slim(table: &SlimTaxonTable) -> Result<Self> {
        let mut taxids: Vec<u32> = table.parents.keys().copied().collect();
        taxids.sort_unstable();

        let mut tree = TaxonomyTree::default();
        tree.nodes.reserve(taxids.len());
        for (idx, &taxid) in taxids.iter().enumerate() {
            let name = taxid.to_string();
            tree.id_index.insert(taxid, idx);
            tree.name_index.insert(name.clone(), idx);
            tree.nodes.push(TreeNode {
                taxid,
                name,
                rank: table.rank(taxid).unwrap_or_default().to_string(),
                parent: idx,
                children: Vec::new(),
                depth: 0,
            });
        }

        let mut root: Option<usize> = None;
        for (idx, &taxid) in taxids.iter().enumerate() {
            let parent_id = table.parents[&taxid];
            if parent_id == taxid {
                if let Some(first) = root {
                    return Err(Error::MalformedTree(format!(
                        "more than one root ({} and {taxid})",
                        tree.nodes[first].taxid
                    )));
                }
                root = Some(idx);
                continue;
            }
            let parent_idx = *tree.id_index.get(&parent_id).ok_or_else(|| {
                Error::MalformedTree(format!("taxid {taxid} has unknown parent {parent_id}"))
            })?;
            tree.nodes[idx].parent = parent_idx;
            tree.nodes[parent_idx].children.push(idx);
        }
        tree.root = root.ok_or_else(|| Error::MalformedTree("no root node".to_string()))?;

        // depths via BFS; anything unreached sits on a cycle
        let mut queue = std::collections::VecDeque::from([tree.root]);
        let mut reached = 0usize;
        while let Some(idx) = queue.pop_front() {
            reached += 1;
            let depth = tree.nodes[idx].depth;
            let children = tree.nodes[idx].children.clone();
            for child in children {
                tree.nodes[child].depth = depth + 1;
                queue.push_back(child);
            }
        }
        if reached != tree.nodes.len() {
            return Err(Error::MalformedTree(format!(
                "{} nodes unreachable from the root",
                tree.nodes.len() - reached
            )));
        }

        Ok(tree)
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn depth(&self, idx: usize) -> u32 {
        self.nodes[idx].depth
    }

    /// Node lookup: numeric id first, then the string-name index.
    pub fn find(&self, taxid: u32) -> Option<usize> {
        if let Some(&idx) = self.id_index.get(&taxid) {
            return Some(idx);
        }
        log::debug!("Node {taxid} not found, trying a string search");
        self.name_index.get(taxid.to_string().as_str()).copied()
    }

    /// Ancestor taxids from the immediate parent up to and including
    /// the root, exclusive of the query node. A missing node logs a
    /// warning and yields an empty chain.
    pub fn ancestor_taxids(&self, taxid: u32) -> Vec<u32> {
        let Some(idx) = self.find(taxid) else {
            log::warn!("Node for taxid {taxid} not found in tree.");
            return Vec::new();
        };

        let mut chain = Vec::with_capacity(self.nodes[idx].depth as usize);
        let mut cur = idx;
        while cur != self.root {
            cur = self.nodes[cur].parent;
            chain.push(self.nodes[cur].taxid);
        }
        chain
    }

    /// Lowest common ancestor of two arena indices.
    pub fn lca(&self, a: usize, b: usize) -> usize {
        let mut seen = AHashSet::with_capacity(16);
        let mut cur = a;
        loop {
            seen.insert(cur);
            if cur == self.root {
                break;
            }
            cur = self.nodes[cur].parent;
        }

        let mut cur = b;
        while !seen.contains(&cur) {
            cur = self.nodes[cur].parent;
        }
        cur
    }

    /// Unweighted topological distance (edge count) between two nodes.
    pub fn distance(&self, a: usize, b: usize) -> u32 {
        let lca = self.lca(a, b);
        self.nodes[a].depth + self.nodes[b].depth - 2 * self.nodes[lca].depth
    }

    /// All ranks reachable at or below nodes of `top_rank`, excluding
    /// `"no rank"`, sorted and deduplicated.
    pub fn ranks_at_or_below(&self, top_rank: &str) -> Vec<String> {
        let mut ranks = BTreeSet::new();
        if self.is_empty() {
            return Vec::new();
        }

        let mut stack = vec![(self.root, false)];
        while let Some((idx, mut below)) = stack.pop() {
            let node = &self.nodes[idx];
            if node.rank == top_rank {
                below = true;
            }
            if below {
                ranks.insert(node.rank.clone());
            }
            for &child in &node.children {
                stack.push((child, below));
            }
        }

        ranks.remove("no rank");
        ranks.into_iter().collect()
    }

    /// Derives a pruned tree containing every ancestor of a mapped
    /// taxon plus the mapped taxa themselves. The walk never descends
    /// below a mapped node, so each mapped taxon present in the result
    /// is a leaf even if it had descendants here.
    pub fn shear_to(&self, mapped_taxids: &[u32]) -> TaxonomyTree {
        let mut mapped = AHashSet::new();
        let mut keep = AHashSet::new();
        for &taxid in mapped_taxids {
            let Some(idx) = self.find(taxid) else {
                log::warn!("Node for taxid {taxid} not found in tree.");
                continue;
            };
            mapped.insert(idx);
            let mut cur = idx;
            loop {
                if !keep.insert(cur) {
                    break;
                }
                if cur == self.root {
                    break;
                }
                cur = self.nodes[cur].parent;
            }
        }

        let mut out = TaxonomyTree::default();
        if keep.is_empty() {
            return out;
        }

        const NO_PARENT: usize = usize::MAX;
        let mut stack = vec![(self.root, NO_PARENT)];
        while let Some((idx, new_parent)) = stack.pop() {
            let node = &self.nodes[idx];
            let new_idx = out.nodes.len();
            let (parent, depth) = if new_parent == NO_PARENT {
                (new_idx, 0)
            } else {
                (new_parent, out.nodes[new_parent].depth + 1)
            };
            out.nodes.push(TreeNode {
                taxid: node.taxid,
                name: node.name.clone(),
                rank: node.rank.clone(),
                parent,
                children: Vec::new(),
                depth,
            });
            if new_parent != NO_PARENT {
                out.nodes[new_parent].children.push(new_idx);
            }
            out.id_index.insert(node.taxid, new_idx);
            out.name_index.insert(node.name.clone(), new_idx);

            if !mapped.contains(&idx) {
                for &child in &node.children {
                    if keep.contains(&child) {
                        stack.push((child, new_idx));
                    }
                }
            }
        }
        out
    }

    /// Names of the leaves, in arena order.
    pub fn leaf_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| n.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slim(rows: &[(u32, u32, &str)]) -> SlimTaxonTable {
        let mut table = SlimTaxonTable::default();
        for &(taxid, parent, rank) in rows {
            table.parents.insert(taxid, parent);
            table.ranks.insert(taxid, rank.to_string());
        }
        table
    }

    fn fixture() -> TaxonomyTree {
        // 1 (root) -> 2 (order) -> 3 (family) -> 4 (species) -> 5 (subspecies)
        //                       -> 6 (family)
        TaxonomyTree::from_slim(&slim(&[
            (1, 1, "no rank"),
            (2, 1, "order"),
            (3, 2, "family"),
            (4, 3, "species"),
            (5, 4, "subspecies"),
            (6, 2, "family"),
        ]))
        .unwrap()
    }

    #[test]
    fn ancestors_end_at_root_and_match_depth() {
        let tree = fixture();
        for taxid in [2u32, 3, 4, 5, 6] {
            let chain = tree.ancestor_taxids(taxid);
            assert_eq!(*chain.last().unwrap(), 1);
            let depth = tree.depth(tree.find(taxid).unwrap());
            assert_eq!(chain.len(), depth as usize);
        }
        assert!(tree.ancestor_taxids(1).is_empty());
    }

    #[test]
    fn missing_node_yields_empty_chain() {
        let tree = fixture();
        assert!(tree.find(99).is_none());
        assert!(tree.ancestor_taxids(99).is_empty());
    }

    #[test]
    fn distance_counts_edges() {
        let tree = fixture();
        let a = tree.find(5).unwrap();
        let b = tree.find(6).unwrap();
        assert_eq!(tree.distance(a, b), 4);
        assert_eq!(tree.distance(b, a), 4);
        assert_eq!(tree.distance(a, a), 0);
    }

    #[test]
    fn ranks_at_or_below_excludes_no_rank() {
        let tree = TaxonomyTree::from_slim(&slim(&[
            (1, 1, "no rank"),
            (2, 1, "species"),
            (3, 2, "no rank"),
            (4, 3, "subspecies"),
            (5, 1, "family"),
        ]))
        .unwrap();

        let ranks = tree.ranks_at_or_below("species");
        assert_eq!(ranks, vec!["species".to_string(), "subspecies".to_string()]);
    }

    #[test]
    fn shear_forces_mapped_nodes_to_leaves() {
        let tree = fixture();
        // 3 has descendants 4 and 5 in the full tree
        let pruned = tree.shear_to(&[3, 6]);

        assert_eq!(pruned.count(), 4); // 1, 2, 3, 6
        let idx = pruned.find(3).unwrap();
        assert!(pruned.node(idx).children.is_empty());
        assert!(pruned.find(4).is_none());
        assert!(pruned.find(5).is_none());

        let mut leaves = pruned.leaf_names();
        leaves.sort();
        assert_eq!(leaves, vec!["3".to_string(), "6".to_string()]);
    }

    #[test]
    fn shear_skips_mapped_descendants_of_mapped_nodes() {
        let tree = fixture();
        let pruned = tree.shear_to(&[3, 4]);
        // 4 sits below mapped 3, so it is absent and 3 is a leaf
        assert!(pruned.find(4).is_none());
        let idx = pruned.find(3).unwrap();
        assert!(pruned.node(idx).children.is_empty());
    }

    #[test]
    fn dangling_parent_is_an_error() {
        let result = TaxonomyTree::from_slim(&slim(&[(1, 1, "no rank"), (2, 7, "species")]));
        assert!(matches!(result, Err(Error::MalformedTree(_))));
    }

    #[test]
    fn duplicate_root_is_an_error() {
        let result = TaxonomyTree::from_slim(&slim(&[(1, 1, "no rank"), (2, 2, "no rank")]));
        assert!(matches!(result, Err(Error::MalformedTree(_))));
    }
}
