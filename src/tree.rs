// src/tree.rs
//! # Ledger Merkle Tree
//!
//! Append-only Merkle tree used for the per-epoch global state trees and for
//! sealing epoch trees. Leaves and internal nodes are both combined with
//! `hash_pair`; on odd levels the last node is paired with itself.

use serde::{Deserialize, Serialize};

use crate::hash::hash_pair;
use crate::types::Bytes32;

/// Append-only Merkle tree kept fully materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTree {
    leaves: Vec<Bytes32>,
    root: Bytes32,
    /// Level 0: padded leaves, last level: root
    #[serde(skip)]
    levels: Vec<Vec<Bytes32>>,
}

impl StateTree {
    pub fn new() -> Self { Self::default() }

    /// Builds a tree from leaves in order.
    pub fn from_leaves(leaves: impl IntoIterator<Item = Bytes32>) -> Self {
        let mut tree = Self { leaves: leaves.into_iter().collect(), ..Self::default() };
        tree.rebuild();
        tree
    }

    /// Appends a leaf and returns its index.
    pub fn insert(&mut self, leaf: Bytes32) -> usize {
        self.leaves.push(leaf);
        self.rebuild();
        self.leaves.len() - 1
    }

    pub fn root(&self) -> Bytes32 { self.root }

    pub fn len(&self) -> usize { self.leaves.len() }

    pub fn is_empty(&self) -> bool { self.leaves.is_empty() }

    pub fn leaves(&self) -> &[Bytes32] { &self.leaves }

    pub fn position(&self, leaf: &Bytes32) -> Option<usize> {
        self.leaves.iter().position(|x| x == leaf)
    }

    /// Recomputes the cached levels after deserialization.
    pub fn restore(&mut self) { self.rebuild(); }

    fn rebuild(&mut self) {
        self.levels.clear();
        if self.leaves.is_empty() {
            self.root = [0u8; 32];
            return;
        }
        let mut current_level = self.leaves.clone();
        while current_level.len() > 1 {
            if current_level.len() % 2 != 0 {
                let last = current_level[current_level.len() - 1];
                current_level.push(last);
            }
            let next_level: Vec<Bytes32> =
                current_level.chunks(2).map(|pair| hash_pair(pair[0], pair[1])).collect();
            self.levels.push(current_level);
            current_level = next_level;
        }
        self.root = current_level[0];
        self.levels.push(current_level);
    }

    /// Sibling path for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<Vec<Bytes32>> {
        if index >= self.leaves.len() {
            return None;
        }
        if self.levels.is_empty() {
            // Deserialized without `restore`.
            return StateTree::from_leaves(self.leaves.clone()).proof(index);
        }
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut pos = index;
        for level in self.levels.iter().take(self.levels.len() - 1) {
            let sibling = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            path.push(level[sibling]);
            pos /= 2;
        }
        Some(path)
    }

    /// Checks `leaf` at `index` against `root` using `path`.
    pub fn verify(leaf: &Bytes32, index: usize, path: &[Bytes32], root: &Bytes32) -> bool {
        let mut pos = index;
        let mut computed = *leaf;
        for sibling in path {
            computed = if pos % 2 == 0 {
                hash_pair(computed, *sibling)
            } else {
                hash_pair(*sibling, computed)
            };
            pos /= 2;
        }
        computed == *root
    }
}
