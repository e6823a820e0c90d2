use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash type for block and transaction identifiers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord,
)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn new(data: [u8; 32]) -> Self {
        Self(data)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[..32]);
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// Public key of a transaction sender or block sealer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn new(data: [u8; 32]) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Contract or account address (20 bytes)
#[derive(
    Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_public_key(pubkey: &PublicKey) -> Self {
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::default();
        hasher.update(pubkey.0);
        let hash = hasher.finalize();

        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash[12..32]);
        Address(addr)
    }

    pub fn zero() -> Self {
        Address([0u8; 20])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Transaction structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub nonce: u64,
    pub from: PublicKey,
    /// None deploys a new contract; the scheduler derives the address.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Pre-hashed transaction reference carried by blocks whose bodies live in
/// the transaction pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub hash: Hash,
    pub to: Address,
}

/// Block header containing consensus-critical fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub number: u64,
    pub parent_hash: Hash,
    pub timestamp: u64,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub state_root: Hash,
    pub gas_used: u64,
    pub sealer: u64,
    pub sealer_list: Vec<PublicKey>,
    pub extra_data: Vec<u8>,
}

/// Full block structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// When non-empty, takes precedence over `transactions` and the shards
    /// resolve the bodies by hash.
    pub tx_metadata: Vec<TransactionMeta>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn tx_count(&self) -> usize {
        if self.tx_metadata.is_empty() {
            self.transactions.len()
        } else {
            self.tx_metadata.len()
        }
    }
}

/// Event log emitted during contract execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
}

/// Transaction receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_hash: Hash,
    pub block_number: u64,
    pub contract: Address,
    pub gas_used: u64,
    /// 0 on success, executor-defined revert code otherwise.
    pub status: i32,
    pub logs: Vec<Log>,
    pub output: Vec<u8>,
}

/// Block-production parameters read back from storage after each commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub block_tx_count_limit: u64,
    pub consensus_timeout: u64,
    pub leader_switch_period: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_from_public_key_is_deterministic() {
        let pubkey = PublicKey::new([7; 32]);
        let a = Address::from_public_key(&pubkey);
        let b = Address::from_public_key(&pubkey);
        assert_eq!(a, b);
        assert_ne!(a, Address::zero());
    }

    #[test]
    fn display_formats() {
        let hash = Hash::new([0xab; 32]);
        assert_eq!(format!("{}", hash), "abababab");

        let addr = Address([0x01; 20]);
        assert_eq!(format!("{}", addr), "0x0101010101010101010101010101010101010101");
    }

    #[test]
    fn block_tx_count_prefers_metadata() {
        let header = BlockHeader {
            version: 1,
            number: 5,
            parent_hash: Hash::default(),
            timestamp: 0,
            tx_root: Hash::default(),
            receipt_root: Hash::default(),
            state_root: Hash::default(),
            gas_used: 0,
            sealer: 0,
            sealer_list: vec![],
            extra_data: vec![],
        };
        let block = Block {
            header,
            transactions: vec![],
            tx_metadata: vec![TransactionMeta { hash: Hash::new([1; 32]), to: Address::zero() }],
        };
        assert_eq!(block.tx_count(), 1);
        assert_eq!(block.number(), 5);
    }
}
