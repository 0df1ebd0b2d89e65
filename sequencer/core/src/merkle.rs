//! Binary Merkle tree over batch leaves.
//!
//! Construction:
//! - `leaf = H(0x00 ‖ public_commitment)`
//! - `node = H(0x01 ‖ left ‖ right)`
//! - a level with an odd number of nodes pairs its last node with itself
//! - a single-leaf tree's root is that leaf
//!
//! `H` is blake3. The prefixes keep an interior node from ever hashing like
//! a leaf, and inclusion proofs carry the leaf count so a path of the wrong
//! depth is refused.

use serde::{Deserialize, Serialize};

pub type Hash = [u8; 32];

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

pub fn hash_leaf(public_commitment: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_TAG]);
    hasher.update(public_commitment);
    *hasher.finalize().as_bytes()
}

pub fn hash_node(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_TAG]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Which side of the running hash the sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: usize,
    /// Leaves in the tree the proof was cut from.
    pub leaf_count: usize,
    pub leaf: Hash,
    pub path: Vec<ProofStep>,
}

/// Levels above the leaves in a tree of `leaf_count` leaves.
pub fn tree_depth(leaf_count: usize) -> usize {
    let mut width = leaf_count;
    let mut depth = 0;
    while width > 1 {
        width = width.div_ceil(2);
        depth += 1;
    }
    depth
}

impl InclusionProof {
    /// The path must have the tree's depth and turn the way `leaf_index`
    /// dictates at every level.
    pub fn verify(&self, root: &Hash) -> bool {
        if self.leaf_index >= self.leaf_count || self.path.len() != tree_depth(self.leaf_count) {
            return false;
        }
        let mut index = self.leaf_index;
        for step in &self.path {
            let expected = if index % 2 == 0 { Side::Right } else { Side::Left };
            if step.side != expected {
                return false;
            }
            index /= 2;
        }
        let computed = self.path.iter().fold(self.leaf, |acc, step| match step.side {
            Side::Left => hash_node(&step.sibling, &acc),
            Side::Right => hash_node(&acc, &step.sibling),
        });
        &computed == root
    }

    /// Checks that `public_commitment` is the leaf this proof places under
    /// `root`.
    pub fn verify_commitment(&self, public_commitment: &Hash, root: &Hash) -> bool {
        hash_leaf(public_commitment) == self.leaf && self.verify(root)
    }
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// `None` for an empty leaf set.
    pub fn build(leaves: Vec<Hash>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut levels = vec![leaves];
        while let Some(level) = levels.last() {
            if level.len() == 1 {
                break;
            }
            let next = level
                .chunks(2)
                .map(|pair| hash_node(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.levels[0]
    }

    pub fn proof(&self, leaf_index: usize) -> Option<InclusionProof> {
        let leaf = *self.levels[0].get(leaf_index)?;
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_index, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            let sibling = *level.get(sibling_index).unwrap_or(&level[index]);
            path.push(ProofStep { sibling, side });
            index /= 2;
        }
        Some(InclusionProof {
            leaf_index,
            leaf_count: self.levels[0].len(),
            leaf,
            path,
        })
    }

    pub fn proofs(&self) -> Vec<InclusionProof> {
        (0..self.leaves().len())
            .filter_map(|i| self.proof(i))
            .collect()
    }
}

pub fn merkle_root(leaves: &[Hash]) -> Option<Hash> {
    MerkleTree::build(leaves.to_vec()).map(|tree| tree.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_level_duplicates_last_node() {
        let leaves = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let left = hash_node(&leaves[0], &leaves[1]);
        let right = hash_node(&leaves[2], &leaves[2]);
        assert_eq!(merkle_root(&leaves), Some(hash_node(&left, &right)));
    }

    #[test]
    fn single_leaf_is_root() {
        let tree = MerkleTree::build(vec![[7u8; 32]]).unwrap();
        assert_eq!(tree.root(), [7u8; 32]);
        let proof = tree.proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify(&[7u8; 32]));
    }

    #[test]
    fn depth_follows_odd_duplication() {
        assert_eq!(tree_depth(1), 0);
        assert_eq!(tree_depth(2), 1);
        assert_eq!(tree_depth(3), 2);
        assert_eq!(tree_depth(5), 3);
    }

    #[test]
    fn leaf_and_node_hashes_are_separated() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(hash_node(&a, &b), *blake3::hash(&[a, b].concat()).as_bytes());
        assert_ne!(hash_leaf(&a), *blake3::hash(&a).as_bytes());
    }

    #[test]
    fn empty_has_no_tree() {
        assert!(MerkleTree::build(vec![]).is_none());
        assert!(merkle_root(&[]).is_none());
    }
}
