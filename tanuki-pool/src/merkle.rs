//! Double-SHA256 and the merkle branch math behind `mining.notify`.
//!
//! The pool never ships full merkle trees to miners. Each job carries a
//! branch: the list of sibling nodes on the path from the coinbase (always
//! leaf 0) to the root. Miners, and the submit pipeline, reconstruct the
//! root by hashing the coinbase txid against each sibling in turn.

use bitcoin::hash_types::{Txid, TxMerkleNode};
use bitcoin::hashes::Hash;
use sha2::{Digest, Sha256};

/// The elementary proof-of-work primitive: SHA-256 applied twice.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    double_sha256(&buf)
}

/// Compute the merkle branch for leaf 0 (the coinbase) given the txids of
/// the non-coinbase transactions in template order.
///
/// At each level the first remaining node is the coinbase path's sibling;
/// the rest pair up, with an odd tail promoted by duplicating the last
/// element. The branch length is `ceil(log2(1 + tx_count))`; a
/// coinbase-only template yields an empty branch.
pub fn merkle_branch(txids: &[Txid]) -> Vec<TxMerkleNode> {
    let mut branch = Vec::new();
    let mut level: Vec<[u8; 32]> = txids.iter().map(|id| id.to_byte_array()).collect();

    while !level.is_empty() {
        branch.push(TxMerkleNode::from_byte_array(level[0]));

        let rest = &level[1..];
        let mut next = Vec::with_capacity(rest.len().div_ceil(2));
        let mut i = 0;
        while i < rest.len() {
            let left = rest[i];
            let right = if i + 1 < rest.len() { rest[i + 1] } else { left };
            next.push(hash_pair(&left, &right));
            i += 2;
        }
        level = next;
    }

    branch
}

/// Reconstruct the merkle root from a coinbase txid and a branch.
pub fn fold_branch(coinbase_txid: &Txid, branch: &[TxMerkleNode]) -> TxMerkleNode {
    let mut acc = coinbase_txid.to_byte_array();
    for sibling in branch {
        acc = hash_pair(&acc, &sibling.to_byte_array());
    }
    TxMerkleNode::from_byte_array(acc)
}
