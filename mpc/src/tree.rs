//! Deterministic k-ary broadcast tree over the sorted party set.
//!
//! Node i has parent ⌊(i−1)/k⌋ (itself for the root) and children
//! i·k+1 ..= i·k+k, clipped to the set, so every party derives the exact
//! same tree from the shared address book. Party 0 is the unique root.

use std::collections::BTreeMap;

use beavergen_network::{PartyId, RemoteParty};

use crate::ProtocolError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeNode {
    /// Parent ID; equal to the node's own ID for the root.
    pub parent: PartyId,
    /// Children in increasing ID order.
    pub children: Vec<PartyId>,
}

pub type Tree = BTreeMap<PartyId, TreeNode>;

/// Builds the broadcast tree over `peers` with the given branching factor.
pub fn build_tree(
    peers: &BTreeMap<PartyId, RemoteParty>,
    branching: u64,
) -> Result<Tree, ProtocolError> {
    if branching == 0 {
        return Err(ProtocolError::InvalidInput(
            "tree branching factor must be positive".into(),
        ));
    }
    if peers.is_empty() {
        return Err(ProtocolError::InvalidInput(
            "cannot build a tree over an empty party set".into(),
        ));
    }

    let n_peers = peers.len() as u64;
    let mut tree = Tree::new();
    for i in 0..n_peers {
        let mut node = TreeNode {
            parent: if i == 0 { 0 } else { (i - 1) / branching },
            children: Vec::new(),
        };
        for j in 0..branching {
            let id = i * branching + 1 + j;
            if !peers.contains_key(&id) {
                break;
            }
            node.children.push(id);
        }
        tree.insert(i, node);
    }
    Ok(tree)
}
