use crate::batch::BatchRunner;
use crate::error::SchedulerError;
use crate::executive::ExecutiveState;
use crate::executor_manager::ExecutorManager;
use crate::key_locks::KeyLockTable;
use crate::message::{ContextId, ExecutionMessage, ExecutiveResult, MessageKind, DEFAULT_TX_GAS};
use crate::traits::ShardExecutor;
use futures::future::join_all;
use parking_lot::Mutex;
use sha3::{Digest, Keccak256};
use shardex_primitives::{Address, Block, BlockHeader, Hash, TransactionReceipt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes one block: owns its executive states, key-lock table and
/// results, drives rounds to exhaustion and assembles the result header.
/// Created on admission, dropped once the pipeline pops the block.
pub struct BlockExecutive {
    block: Block,
    executors: Arc<ExecutorManager>,
    start_context_id: ContextId,
    states: Arc<Mutex<BTreeMap<ContextId, ExecutiveState>>>,
    key_locks: Arc<Mutex<KeyLockTable>>,
    results: Arc<Mutex<BTreeMap<ContextId, ExecutiveResult>>>,
    result_header: Mutex<Option<BlockHeader>>,
    rounds: AtomicU64,
}

impl BlockExecutive {
    pub fn new(block: Block, executors: Arc<ExecutorManager>, start_context_id: ContextId) -> Self {
        Self {
            block,
            executors,
            start_context_id,
            states: Arc::new(Mutex::new(BTreeMap::new())),
            key_locks: Arc::new(Mutex::new(KeyLockTable::new())),
            results: Arc::new(Mutex::new(BTreeMap::new())),
            result_header: Mutex::new(None),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn number(&self) -> u64 {
        self.block.header.number
    }

    /// Result header, once execution finished.
    pub fn result(&self) -> Option<BlockHeader> {
        self.result_header.lock().clone()
    }

    /// Rounds driven so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Execute the whole block and produce its result header.
    pub async fn execute(&self) -> Result<BlockHeader, SchedulerError> {
        if self.result_header.lock().is_some() {
            return Err(SchedulerError::WrongStatus("block already executed"));
        }

        self.seed_states();
        self.notify_next_block().await?;

        let runner = BatchRunner::new(
            self.executors.clone(),
            self.states.clone(),
            self.key_locks.clone(),
            self.results.clone(),
            self.number(),
        );
        loop {
            let stats = runner.run_round().await?;
            self.rounds.fetch_add(1, Ordering::Relaxed);
            if stats.failed > 0 {
                warn!(
                    number = self.number(),
                    failed = stats.failed,
                    "block finished with failed transactions"
                );
                return Err(SchedulerError::Batch {
                    failed: stats.failed,
                });
            }
            if stats.remaining == 0 {
                break;
            }
            if stats.dispatched == 0 && stats.retired == 0 {
                // every live state is stuck behind a key another context holds
                if self.key_locks.lock().detect_deadlock() {
                    return Err(SchedulerError::DeadlockDetected);
                }
                return Err(SchedulerError::Unknown("round made no progress".into()));
            }
        }

        let state_root = self.collect_state_root().await?;
        let header = self.assemble_header(state_root);
        info!(
            number = header.number,
            gas_used = header.gas_used,
            rounds = self.rounds(),
            "block executed"
        );
        *self.result_header.lock() = Some(header.clone());
        Ok(header)
    }

    /// One executive state per transaction: metadata-only blocks seed hash
    /// requests, full blocks seed complete messages.
    fn seed_states(&self) {
        let mut states = self.states.lock();
        let number = self.block.header.number;

        if !self.block.tx_metadata.is_empty() {
            for (index, meta) in self.block.tx_metadata.iter().enumerate() {
                let context_id = self.start_context_id + index as u64;
                let message = ExecutionMessage {
                    kind: MessageKind::TxHash,
                    context_id,
                    tx_hash: meta.hash,
                    to: meta.to,
                    gas_available: DEFAULT_TX_GAS,
                    ..Default::default()
                };
                states.insert(context_id, ExecutiveState::new(context_id, message));
            }
        } else {
            for (index, tx) in self.block.transactions.iter().enumerate() {
                let context_id = self.start_context_id + index as u64;
                let sender = Address::from_public_key(&tx.from);
                let (to, create) = match tx.to {
                    Some(to) => (to, false),
                    None => (derive_create_address(&sender, number, context_id), true),
                };
                let gas_available = if tx.gas_limit > 0 {
                    tx.gas_limit
                } else {
                    DEFAULT_TX_GAS
                };
                let message = ExecutionMessage {
                    kind: MessageKind::Message,
                    context_id,
                    tx_hash: tx.hash,
                    to,
                    from: sender,
                    origin: sender,
                    data: tx.data.clone(),
                    gas_available,
                    create,
                    ..Default::default()
                };
                states.insert(context_id, ExecutiveState::new(context_id, message));
            }
        }
        debug!(number, states = states.len(), "seeded executive states");
    }

    async fn notify_next_block(&self) -> Result<(), SchedulerError> {
        let shards = self.executors.shards();
        let header = &self.block.header;
        let outcomes = join_all(shards.iter().map(|shard| shard.next_block_header(header))).await;
        for outcome in outcomes {
            outcome.map_err(|err| SchedulerError::NextBlock(err.to_string()))?;
        }
        Ok(())
    }

    /// Fold every shard's table hashes into one state root: sorted by table
    /// name, hashed as `table || hash` so the result is shard-order
    /// independent.
    async fn collect_state_root(&self) -> Result<Hash, SchedulerError> {
        let shards = self.executors.shards();
        let number = self.number();
        let outcomes = join_all(shards.iter().map(|shard| shard.get_table_hashes(number))).await;

        let mut tables: Vec<(String, Hash)> = Vec::new();
        for outcome in outcomes {
            tables.extend(outcome.map_err(|err| SchedulerError::Storage(err.to_string()))?);
        }
        tables.sort();

        let mut hasher = Keccak256::default();
        for (table, hash) in &tables {
            hasher.update(table.as_bytes());
            hasher.update(hash.as_bytes());
        }
        Ok(Hash::from_bytes(&hasher.finalize()))
    }

    /// Carry the input header's consensus metadata forward and fill in the
    /// computed gas and state root.
    fn assemble_header(&self, state_root: Hash) -> BlockHeader {
        let input = &self.block.header;
        let gas_used = self
            .results
            .lock()
            .values()
            .map(|result| result.receipt.gas_used)
            .sum();
        BlockHeader {
            version: input.version,
            number: input.number,
            parent_hash: input.parent_hash,
            timestamp: input.timestamp,
            tx_root: input.tx_root,
            receipt_root: input.receipt_root,
            state_root,
            gas_used,
            sealer: input.sealer,
            sealer_list: input.sealer_list.clone(),
            extra_data: input.extra_data.clone(),
        }
    }

    /// Receipts in original transaction order.
    pub fn receipts(&self) -> Vec<TransactionReceipt> {
        let results = self.results.lock();
        (0..self.block.tx_count() as u64)
            .filter_map(|index| {
                results
                    .get(&(self.start_context_id + index))
                    .map(|result| result.receipt.clone())
            })
            .collect()
    }

    /// Two-phase commit across every registered shard: prepare everywhere,
    /// roll everything back on the first failure, otherwise commit.
    pub async fn commit(&self) -> Result<(), SchedulerError> {
        if self.result_header.lock().is_none() {
            return Err(SchedulerError::WrongStatus("block is not executed"));
        }
        let shards = self.executors.shards();
        let number = self.number();

        let prepared = join_all(shards.iter().map(|shard| shard.prepare(number))).await;
        if let Some(err) = prepared.into_iter().find_map(|outcome| outcome.err()) {
            warn!(number, error = %err, "prepare failed, rolling back");
            for outcome in join_all(shards.iter().map(|shard| shard.rollback(number))).await {
                if let Err(rollback_err) = outcome {
                    warn!(number, error = %rollback_err, "rollback failed");
                }
            }
            return Err(SchedulerError::Prewrite(err.to_string()));
        }

        for outcome in join_all(shards.iter().map(|shard| shard.commit(number))).await {
            outcome.map_err(|err| SchedulerError::Commit(err.to_string()))?;
        }
        info!(number, "block committed");
        Ok(())
    }
}

fn derive_create_address(sender: &Address, block_number: u64, context_id: ContextId) -> Address {
    let mut hasher = Keccak256::default();
    hasher.update(sender.0);
    hasher.update(block_number.to_be_bytes());
    hasher.update(context_id.to_be_bytes());
    let digest = hasher.finalize();

    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..32]);
    Address(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ShardExecutor;
    use async_trait::async_trait;
    use shardex_primitives::{PublicKey, Transaction};
    use std::sync::atomic::AtomicUsize;

    /// Responds to every request with an immediate completion.
    struct EchoShard {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShardExecutor for EchoShard {
        async fn execute_transaction(
            &self,
            mut message: ExecutionMessage,
        ) -> anyhow::Result<ExecutionMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            message.kind = MessageKind::Finished;
            message.gas_available = message.gas_available.saturating_sub(21_000);
            message.data = b"ok".to_vec();
            Ok(message)
        }

        async fn call(&self, message: ExecutionMessage) -> anyhow::Result<ExecutionMessage> {
            Ok(message)
        }

        async fn next_block_header(&self, _header: &BlockHeader) -> anyhow::Result<()> {
            Ok(())
        }

        async fn prepare(&self, _block_number: u64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn commit(&self, _block_number: u64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn rollback(&self, _block_number: u64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_table_hashes(
            &self,
            _block_number: u64,
        ) -> anyhow::Result<Vec<(String, Hash)>> {
            Ok(vec![("accounts".into(), Hash::new([3; 32]))])
        }
    }

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            number,
            parent_hash: Hash::new([9; 32]),
            timestamp: 1_000,
            tx_root: Hash::new([1; 32]),
            receipt_root: Hash::new([2; 32]),
            state_root: Hash::default(),
            gas_used: 0,
            sealer: 3,
            sealer_list: vec![PublicKey::new([4; 32])],
            extra_data: b"seal".to_vec(),
        }
    }

    fn transfer(nonce: u64, to: Address) -> Transaction {
        Transaction {
            hash: Hash::new([nonce as u8 + 1; 32]),
            nonce,
            from: PublicKey::new([1; 32]),
            to: Some(to),
            value: 10u64.into(),
            gas_limit: 100_000,
            gas_price: 1,
            data: vec![],
            signature: vec![],
        }
    }

    fn manager_with_echo() -> (Arc<ExecutorManager>, Arc<EchoShard>) {
        let manager = Arc::new(ExecutorManager::new());
        let shard = Arc::new(EchoShard {
            calls: AtomicUsize::new(0),
        });
        manager.register("echo", shard.clone()).unwrap();
        (manager, shard)
    }

    #[tokio::test]
    async fn empty_block_produces_header_without_dispatch() {
        let (manager, shard) = manager_with_echo();
        let block = Block {
            header: header(1),
            transactions: vec![],
            tx_metadata: vec![],
        };
        let executive = BlockExecutive::new(block, manager, 0);

        let result = executive.execute().await.unwrap();
        assert_eq!(result.number, 1);
        assert_eq!(result.gas_used, 0);
        assert_eq!(shard.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn executed_header_carries_input_metadata() {
        let (manager, _) = manager_with_echo();
        let block = Block {
            header: header(7),
            transactions: vec![transfer(0, Address([0xaa; 20]))],
            tx_metadata: vec![],
        };
        let executive = BlockExecutive::new(block, manager, 0);

        let result = executive.execute().await.unwrap();
        assert_eq!(result.version, 1);
        assert_eq!(result.sealer, 3);
        assert_eq!(result.extra_data, b"seal");
        assert_eq!(result.gas_used, 21_000);
        assert_ne!(result.state_root, Hash::default());

        let receipts = executive.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].block_number, 7);
        assert_eq!(receipts[0].gas_used, 21_000);
    }

    #[tokio::test]
    async fn create_transaction_derives_a_target() {
        let (manager, shard) = manager_with_echo();
        let mut tx = transfer(0, Address::zero());
        tx.to = None;
        let block = Block {
            header: header(2),
            transactions: vec![tx],
            tx_metadata: vec![],
        };
        let executive = BlockExecutive::new(block, manager, 0);

        executive.execute().await.unwrap();
        let receipts = executive.receipts();
        assert_eq!(receipts.len(), 1);
        assert_ne!(receipts[0].contract, Address::zero());
        assert_eq!(shard.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_execute_is_rejected() {
        let (manager, _) = manager_with_echo();
        let block = Block {
            header: header(1),
            transactions: vec![],
            tx_metadata: vec![],
        };
        let executive = BlockExecutive::new(block, manager, 0);

        executive.execute().await.unwrap();
        assert!(matches!(
            executive.execute().await,
            Err(SchedulerError::WrongStatus(_))
        ));
    }

    #[tokio::test]
    async fn commit_before_execute_is_rejected() {
        let (manager, _) = manager_with_echo();
        let block = Block {
            header: header(1),
            transactions: vec![],
            tx_metadata: vec![],
        };
        let executive = BlockExecutive::new(block, manager, 0);
        assert!(matches!(
            executive.commit().await,
            Err(SchedulerError::WrongStatus(_))
        ));
    }

    #[test]
    fn create_address_depends_on_context() {
        let sender = Address([5; 20]);
        let a = derive_create_address(&sender, 1, 0);
        let b = derive_create_address(&sender, 1, 1);
        let c = derive_create_address(&sender, 2, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_create_address(&sender, 1, 0));
    }
}
