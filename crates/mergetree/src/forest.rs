//! Arena-backed rooted forest over pixel indices.
//!
//! Each node stores at most one parent and an ordered list of children.
//! Parent and child links are always updated together, so the successor
//! lists are the exact inverse of the parent pointers.

use serde::{Deserialize, Serialize};

/// Rooted forest indexed by pixel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Forest {
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl Forest {
    /// A forest of `len` isolated nodes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            parents: vec![None; len],
            children: vec![Vec::new(); len],
        }
    }

    /// Build from a parent array where `parents[i] == i` means "no parent".
    ///
    /// Children are listed in ascending index order.
    #[must_use]
    pub fn from_parent_array(parents: &[usize]) -> Self {
        let mut forest = Self::new(parents.len());
        for (child, &parent) in parents.iter().enumerate() {
            if parent != child {
                forest.parents[child] = Some(parent);
                forest.children[parent].push(child);
            }
        }
        forest
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// `true` if the forest has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Parent of `node`, if any.
    #[must_use]
    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    /// Children of `node`.
    #[must_use]
    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    /// Parent pointer of every node.
    #[must_use]
    pub fn parents(&self) -> &[Option<usize>] {
        &self.parents
    }

    /// Nodes without a parent, ascending.
    #[must_use]
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&n| self.parents[n].is_none())
            .collect()
    }

    /// Iterate over the strict ancestors of `node`, nearest first.
    pub fn ancestors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.parents[node], |&n| self.parents[n])
    }

    /// `true` if `ancestor` is `node` or lies on its parent chain.
    #[must_use]
    pub fn is_ancestor_or_self(&self, ancestor: usize, node: usize) -> bool {
        node == ancestor || self.ancestors(node).any(|n| n == ancestor)
    }

    /// Re-point `child` at `parent`, detaching it from its old parent.
    ///
    /// The caller is responsible for not closing a cycle; see
    /// [`would_cycle`](Self::would_cycle).
    pub fn set_parent(&mut self, child: usize, parent: Option<usize>) {
        if self.parents[child] == parent {
            return;
        }
        if let Some(old) = self.parents[child] {
            self.children[old].retain(|&c| c != child);
        }
        self.parents[child] = parent;
        if let Some(new) = parent {
            self.children[new].push(child);
        }
    }

    /// `true` if making `parent` the parent of `child` would create a cycle.
    #[must_use]
    pub fn would_cycle(&self, child: usize, parent: usize) -> bool {
        self.is_ancestor_or_self(child, parent)
    }

    /// Depth of `node` (number of edges to its root).
    #[must_use]
    pub fn depth(&self, node: usize) -> usize {
        self.ancestors(node).count()
    }
}
