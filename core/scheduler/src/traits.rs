use crate::message::ExecutionMessage;
use async_trait::async_trait;
use shardex_primitives::{BlockHeader, Hash};

/// Storage table holding the chain's system configuration
pub const SYS_CONFIG_TABLE: &str = "sys_config";
pub const SYS_KEY_TX_COUNT_LIMIT: &str = "tx_count_limit";
pub const SYS_KEY_CONSENSUS_TIMEOUT: &str = "consensus_timeout";
pub const SYS_KEY_LEADER_SWITCH_PERIOD: &str = "leader_switch_period";

/// Capability contract of an execution shard.
///
/// The scheduler is polymorphic over anything that can execute messages,
/// stage writes through the two-phase protocol and report its table hashes.
/// Contract interpretation, gas metering and state mutation all live behind
/// this seam.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Execute one call message and return the frame's next step
    async fn execute_transaction(
        &self,
        message: ExecutionMessage,
    ) -> anyhow::Result<ExecutionMessage>;

    /// Read-only execution outside any block
    async fn call(&self, message: ExecutionMessage) -> anyhow::Result<ExecutionMessage>;

    /// Announce the header of the block about to execute
    async fn next_block_header(&self, header: &BlockHeader) -> anyhow::Result<()>;

    /// Stage this block's writes
    async fn prepare(&self, block_number: u64) -> anyhow::Result<()>;

    /// Make staged writes durable
    async fn commit(&self, block_number: u64) -> anyhow::Result<()>;

    /// Discard staged writes
    async fn rollback(&self, block_number: u64) -> anyhow::Result<()>;

    /// Per-table state hashes for state-root aggregation
    async fn get_table_hashes(&self, block_number: u64) -> anyhow::Result<Vec<(String, Hash)>>;
}

/// Row entry returned by the storage collaborator
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: String,
}

/// Narrow contract against the ledger storage, used to read the system
/// configuration after a commit
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_rows(&self, table: &str, keys: &[&str]) -> anyhow::Result<Vec<Option<Entry>>>;
}
