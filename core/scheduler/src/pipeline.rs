use crate::block_executive::BlockExecutive;
use crate::error::SchedulerError;
use crate::executor_manager::ExecutorManager;
use crate::message::ExecutionMessage;
use crate::traits::{
    ShardExecutor, Storage, SYS_CONFIG_TABLE, SYS_KEY_CONSENSUS_TIMEOUT,
    SYS_KEY_LEADER_SWITCH_PERIOD, SYS_KEY_TX_COUNT_LIMIT,
};
use parking_lot::Mutex;
use shardex_primitives::{Block, BlockHeader, LedgerConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

/// Serializes block admission, execution and commit across the block
/// sequence.
///
/// Admission accepts only strictly consecutive numbers, execution and commit
/// are each single-flight behind their own guard, and commit of block N may
/// overlap execution of block N+1. Only the oldest queued block can commit,
/// and only once its execution result exists.
pub struct SchedulerPipeline {
    executors: Arc<ExecutorManager>,
    storage: Arc<dyn Storage>,
    blocks: Mutex<VecDeque<Arc<BlockExecutive>>>,
    last_admitted: Mutex<Option<u64>>,
    execute_guard: AsyncMutex<()>,
    commit_guard: AsyncMutex<()>,
    /// Start of the next block's context-id range, so pipelined blocks never
    /// share context ids
    context_counter: AtomicU64,
}

impl SchedulerPipeline {
    pub fn new(executors: Arc<ExecutorManager>, storage: Arc<dyn Storage>) -> Self {
        Self {
            executors,
            storage,
            blocks: Mutex::new(VecDeque::new()),
            last_admitted: Mutex::new(None),
            execute_guard: AsyncMutex::new(()),
            commit_guard: AsyncMutex::new(()),
            context_counter: AtomicU64::new(0),
        }
    }

    pub fn executor_manager(&self) -> &Arc<ExecutorManager> {
        &self.executors
    }

    pub fn register_executor(
        &self,
        name: impl Into<String>,
        shard: Arc<dyn ShardExecutor>,
    ) -> Result<(), SchedulerError> {
        self.executors.register(name, shard)
    }

    pub fn unregister_executor(&self, name: &str) -> Result<(), SchedulerError> {
        self.executors.unregister(name)
    }

    /// Number of blocks queued (executed but uncommitted, plus in flight).
    pub fn queued(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Execute `block`. Resubmitting an already-executed queued number
    /// returns the cached header without touching any shard; `verify` marks
    /// sealed blocks resubmitted for verification and does not change the
    /// execution path.
    pub async fn execute_block(
        &self,
        block: Block,
        verify: bool,
    ) -> Result<BlockHeader, SchedulerError> {
        let number = block.header.number;
        info!(number, verify, "execute block request");

        let Ok(_guard) = self.execute_guard.try_lock() else {
            return Err(SchedulerError::WrongStatus("another block is executing"));
        };

        {
            let mut blocks = self.blocks.lock();
            if let Some(existing) = blocks.iter().find(|b| b.number() == number) {
                return match existing.result() {
                    Some(header) => {
                        info!(number, "returning previously executed block");
                        Ok(header)
                    }
                    None => Err(SchedulerError::WrongStatus("block is executing")),
                };
            }

            let mut last_admitted = self.last_admitted.lock();
            if let Some(last) = *last_admitted {
                if number != last + 1 {
                    return Err(SchedulerError::InvalidBlockNumber {
                        number,
                        expected: last + 1,
                    });
                }
            }
            *last_admitted = Some(number);

            let start_context_id = self
                .context_counter
                .fetch_add(block.tx_count() as u64, Ordering::AcqRel);
            let executive = Arc::new(BlockExecutive::new(
                block,
                self.executors.clone(),
                start_context_id,
            ));
            blocks.push_back(executive);
        }

        // drain every queued block that still lacks a result; one failed
        // block is removed so its number can be resubmitted
        let mut requested = None;
        loop {
            let next = {
                let blocks = self.blocks.lock();
                blocks.iter().find(|b| b.result().is_none()).cloned()
            };
            let Some(next) = next else { break };

            match next.execute().await {
                Ok(header) => {
                    if next.number() == number {
                        requested = Some(header);
                    }
                }
                Err(err) => {
                    error!(number = next.number(), error = %err, "block execution failed");
                    self.blocks.lock().retain(|b| b.number() != next.number());
                    *self.last_admitted.lock() = next.number().checked_sub(1);
                    return Err(err);
                }
            }
        }

        requested.ok_or_else(|| {
            SchedulerError::Unknown("executed block produced no result header".into())
        })
    }

    /// Commit the oldest queued block and read back the ledger
    /// configuration.
    pub async fn commit_block(&self, header: &BlockHeader) -> Result<LedgerConfig, SchedulerError> {
        let number = header.number;
        info!(number, "commit block request");

        let Ok(_guard) = self.commit_guard.try_lock() else {
            return Err(SchedulerError::WrongStatus("another block is committing"));
        };

        let front = {
            let blocks = self.blocks.lock();
            let Some(front) = blocks.front() else {
                return Err(SchedulerError::InvalidBlocks);
            };
            if front.result().is_none() {
                return Err(SchedulerError::WrongStatus("block is executing"));
            }
            if number != front.number() {
                return Err(SchedulerError::InvalidBlockNumber {
                    number,
                    expected: front.number(),
                });
            }
            front.clone()
        };

        front.commit().await?;
        self.blocks.lock().pop_front();
        info!(number, "block committed, reading ledger config");
        self.read_ledger_config().await
    }

    /// Read-only execution path; routes by target without touching the block
    /// queue.
    pub async fn call(
        &self,
        mut message: ExecutionMessage,
    ) -> Result<ExecutionMessage, SchedulerError> {
        message.static_call = true;
        let shard = self.executors.route(&message.to)?;
        shard
            .call(message)
            .await
            .map_err(|err| SchedulerError::Unknown(err.to_string()))
    }

    async fn read_ledger_config(&self) -> Result<LedgerConfig, SchedulerError> {
        let keys = [
            SYS_KEY_TX_COUNT_LIMIT,
            SYS_KEY_CONSENSUS_TIMEOUT,
            SYS_KEY_LEADER_SWITCH_PERIOD,
        ];
        let rows = self
            .storage
            .get_rows(SYS_CONFIG_TABLE, &keys)
            .await
            .map_err(|err| SchedulerError::Storage(err.to_string()))?;
        if rows.len() < keys.len() {
            return Err(SchedulerError::Storage(format!(
                "expected {} system entries, got {}",
                keys.len(),
                rows.len()
            )));
        }

        let mut values = [0u64; 3];
        for (index, (key, row)) in keys.iter().zip(rows.iter()).enumerate() {
            let entry = row.as_ref().ok_or_else(|| {
                SchedulerError::Storage(format!("missing system entry {key}"))
            })?;
            values[index] = entry.value.parse().map_err(|_| {
                SchedulerError::Storage(format!(
                    "unparseable system entry {key}: {}",
                    entry.value
                ))
            })?;
        }

        Ok(LedgerConfig {
            block_tx_count_limit: values[0],
            consensus_timeout: values[1],
            leader_switch_period: values[2],
        })
    }
}
