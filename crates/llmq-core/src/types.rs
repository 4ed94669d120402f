//! Core value types shared by every LLMQ service

use crate::errors::{LlmqError, Result};
use crate::hash::Hash32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height
pub type BlockHeight = u32;

/// Masternode registration hash, the stable identity of a committee member
pub type ProTxHash = Hash32;

/// Quorum type. Each type has its own parameters and its own signing topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LlmqType {
    /// 50 members, 60% threshold
    #[serde(rename = "llmq_50_60")]
    Llmq50_60 = 1,
    /// 400 members, 60% threshold
    #[serde(rename = "llmq_400_60")]
    Llmq400_60 = 2,
    /// 400 members, 85% threshold
    #[serde(rename = "llmq_400_85")]
    Llmq400_85 = 3,
    /// 100 members, 67% threshold
    #[serde(rename = "llmq_100_67")]
    Llmq100_67 = 4,
    /// Small regression-test quorum
    #[serde(rename = "llmq_test")]
    LlmqTest = 100,
    /// Devnet quorum
    #[serde(rename = "llmq_devnet")]
    LlmqDevnet = 101,
    /// Regression-test quorum dedicated to instant send
    #[serde(rename = "llmq_test_instantsend")]
    LlmqTestInstantSend = 104,
}

impl LlmqType {
    /// All known types
    pub const ALL: [LlmqType; 7] = [
        LlmqType::Llmq50_60,
        LlmqType::Llmq400_60,
        LlmqType::Llmq400_85,
        LlmqType::Llmq100_67,
        LlmqType::LlmqTest,
        LlmqType::LlmqDevnet,
        LlmqType::LlmqTestInstantSend,
    ];

    /// Wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte
    pub fn from_u8(v: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_u8() == v)
            .ok_or_else(|| LlmqError::invalid(format!("unknown llmq type {v}")))
    }

    /// Configuration name
    pub fn name(self) -> &'static str {
        match self {
            LlmqType::Llmq50_60 => "llmq_50_60",
            LlmqType::Llmq400_60 => "llmq_400_60",
            LlmqType::Llmq400_85 => "llmq_400_85",
            LlmqType::Llmq100_67 => "llmq_100_67",
            LlmqType::LlmqTest => "llmq_test",
            LlmqType::LlmqDevnet => "llmq_devnet",
            LlmqType::LlmqTestInstantSend => "llmq_test_instantsend",
        }
    }
}

impl fmt::Display for LlmqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport-level peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Funding transaction
    pub txid: Hash32,
    /// Output index
    pub vout: u32,
}

impl OutPoint {
    /// Create an outpoint
    pub fn new(txid: Hash32, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid.short(), self.vout)
    }
}

/// The slice of a transaction the lock handlers need: its id and spent inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub txid: Hash32,
    /// Spent outpoints, in transaction order
    pub inputs: Vec<OutPoint>,
}

impl Transaction {
    /// Create a transaction
    pub fn new(txid: Hash32, inputs: Vec<OutPoint>) -> Self {
        Self { txid, inputs }
    }
}

/// Fixed-size member bitset, indexed by position in the quorum member list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemberSet {
    bits: Vec<bool>,
}

impl MemberSet {
    /// An all-clear set of `size` members
    pub fn new(size: usize) -> Self {
        Self {
            bits: vec![false; size],
        }
    }

    /// An all-set set of `size` members
    pub fn full(size: usize) -> Self {
        Self {
            bits: vec![true; size],
        }
    }

    /// Build from explicit bits
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Number of positions
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the set has no positions
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set positions
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Whether position `i` is set; out-of-range positions are clear
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    /// Set position `i`; out-of-range positions are ignored
    pub fn set(&mut self, i: usize, value: bool) {
        if let Some(bit) = self.bits.get_mut(i) {
            *bit = value;
        }
    }

    /// Iterate set positions
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }

    /// Raw bits
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llmq_type_wire_byte() {
        for t in LlmqType::ALL {
            assert_eq!(LlmqType::from_u8(t.as_u8()).unwrap(), t);
        }
        assert!(LlmqType::from_u8(0).is_err());
    }

    #[test]
    fn test_member_set() {
        let mut set = MemberSet::new(5);
        set.set(1, true);
        set.set(3, true);
        set.set(9, true);
        assert_eq!(set.count(), 2);
        assert!(set.get(3));
        assert!(!set.get(9));
        assert_eq!(set.iter_set().collect::<Vec<_>>(), vec![1, 3]);
    }
}
