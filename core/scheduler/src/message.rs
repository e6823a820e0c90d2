use serde::{Deserialize, Serialize};
use shardex_primitives::{Address, Hash, Log, TransactionReceipt};

/// Identifies one top-level transaction's call tree within a block
pub type ContextId = u64;

/// Identifies one call frame within a context
pub type Seq = u64;

/// Gas budget for transactions that do not carry their own limit
pub const DEFAULT_TX_GAS: u64 = 3_000_000;

/// Message type tag exchanged with the execution shards.
///
/// The discriminants are part of the shard wire contract and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Request by transaction hash; the shard resolves the body from its pool
    #[default]
    TxHash = 0,
    /// Request with a full payload
    Message = 1,
    /// Call frame completed
    Finished = 2,
    /// Call frame reverted
    Reverted = 3,
    /// Frame suspended on a contended key; retried once the key frees up
    WaitKey = 4,
    /// Shard asks for the message to be re-routed
    SendBack = 5,
}

impl MessageKind {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageKind::TxHash | MessageKind::Message)
    }

    pub fn is_return(&self) -> bool {
        matches!(self, MessageKind::Finished | MessageKind::Reverted)
    }
}

/// One inter-contract call message, travelling scheduler -> shard as a
/// request and shard -> scheduler as the frame's next step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub kind: MessageKind,
    pub context_id: ContextId,
    pub seq: Seq,
    pub tx_hash: Hash,
    /// Target contract; routing key for shard dispatch
    pub to: Address,
    pub from: Address,
    /// Original transaction sender, stable across the whole call tree
    pub origin: Address,
    /// Call payload on requests, output on returns
    pub data: Vec<u8>,
    pub gas_available: u64,
    /// 0 on success, executor-defined code otherwise
    pub status: i32,
    pub logs: Vec<Log>,
    pub depth: u32,
    /// Target address was derived for a contract creation
    pub create: bool,
    pub static_call: bool,
    /// Key this frame is suspended on; only meaningful for `WaitKey`
    pub pending_key: Option<Vec<u8>>,
    /// Keys of the target contract currently held by other contexts,
    /// attached by the scheduler on every dispatch
    pub external_locks: Vec<Vec<u8>>,
}

/// Final outcome of one context, produced exactly once when its call stack
/// empties
#[derive(Debug, Clone)]
pub struct ExecutiveResult {
    pub tx_hash: Hash,
    pub contract: Address,
    pub receipt: TransactionReceipt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_discriminants_are_stable() {
        assert_eq!(MessageKind::TxHash as u8, 0);
        assert_eq!(MessageKind::Message as u8, 1);
        assert_eq!(MessageKind::Finished as u8, 2);
        assert_eq!(MessageKind::Reverted as u8, 3);
        assert_eq!(MessageKind::WaitKey as u8, 4);
        assert_eq!(MessageKind::SendBack as u8, 5);
    }

    #[test]
    fn kind_classification() {
        assert!(MessageKind::TxHash.is_request());
        assert!(MessageKind::Message.is_request());
        assert!(MessageKind::Finished.is_return());
        assert!(MessageKind::Reverted.is_return());
        assert!(!MessageKind::WaitKey.is_request());
        assert!(!MessageKind::SendBack.is_return());
    }
}
