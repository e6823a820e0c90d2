pub mod types;

pub use types::{
    Address, Block, BlockHeader, Hash, LedgerConfig, Log, PublicKey, Transaction,
    TransactionMeta, TransactionReceipt,
};
