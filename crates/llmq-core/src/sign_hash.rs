//! Request ids and sign hashes
//!
//! A signing request is named by `(llmq_type, id, msg_hash)`. The id names
//! *what* is being decided (a height, a set of inputs, a version bit) and the
//! message hash names the decision. Members sign the sign hash, which also
//! binds the quorum so a share can never be replayed against another quorum.

use crate::hash::{Hash32, Hasher};
use crate::types::{BlockHeight, LlmqType, OutPoint};

/// Hash actually signed by quorum members
pub fn build_sign_hash(
    llmq_type: LlmqType,
    quorum_hash: &Hash32,
    id: &Hash32,
    msg_hash: &Hash32,
) -> Hash32 {
    let mut h = Hasher::new();
    h.update(&[llmq_type.as_u8()])
        .update_hash(quorum_hash)
        .update_hash(id)
        .update_hash(msg_hash);
    h.finalize()
}

/// Score used to pick the signing quorum for a request; lowest wins
pub fn quorum_selection_score(llmq_type: LlmqType, quorum_hash: &Hash32, id: &Hash32) -> Hash32 {
    let mut h = Hasher::new();
    h.update(&[llmq_type.as_u8()])
        .update_hash(quorum_hash)
        .update_hash(id);
    h.finalize()
}

/// Request id of the chain lock at `height`
pub fn chain_lock_request_id(height: BlockHeight) -> Hash32 {
    let mut h = Hasher::tagged("clsig");
    h.update_u32(height);
    h.finalize()
}

/// Request id of the instant lock over `inputs`
pub fn instant_lock_request_id(inputs: &[OutPoint]) -> Hash32 {
    let mut h = Hasher::tagged("islock");
    h.update_u32(inputs.len() as u32);
    for input in inputs {
        h.update_hash(&input.txid).update_u32(input.vout);
    }
    h.finalize()
}

/// Request id of the upgrade signal for `version_bit`
pub fn upgrade_signal_request_id(version_bit: u8) -> Hash32 {
    let mut h = Hasher::tagged("mnhf");
    h.update(&[version_bit]);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    #[test]
    fn test_sign_hash_binds_quorum() {
        let id = chain_lock_request_id(100);
        let msg = sha256d(b"block");
        let a = build_sign_hash(LlmqType::LlmqTest, &sha256d(b"qa"), &id, &msg);
        let b = build_sign_hash(LlmqType::LlmqTest, &sha256d(b"qb"), &id, &msg);
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_ids_distinct() {
        assert_ne!(chain_lock_request_id(1), chain_lock_request_id(2));
        let inputs = [OutPoint::new(sha256d(b"tx"), 0)];
        assert_ne!(instant_lock_request_id(&inputs), chain_lock_request_id(0));
        assert_ne!(upgrade_signal_request_id(1), upgrade_signal_request_id(2));
    }
}
