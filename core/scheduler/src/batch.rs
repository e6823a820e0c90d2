use crate::error::SchedulerError;
use crate::executive::{ExecutiveState, Step};
use crate::executor_manager::ExecutorManager;
use crate::key_locks::KeyLockTable;
use crate::message::{ContextId, ExecutiveResult};
use crate::traits::ShardExecutor;
use parking_lot::Mutex;
use shardex_primitives::Address;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Progress counters for one round. Dispatch callbacks and the sweep itself
/// race through `check`; the compare-and-set picks exactly one winner to
/// fire the completion signal.
struct BatchStatus {
    total: AtomicUsize,
    received: AtomicUsize,
    failed: AtomicUsize,
    all_sent: AtomicBool,
    finished: AtomicBool,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl BatchStatus {
    fn new(done: oneshot::Sender<()>) -> Self {
        Self {
            total: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            all_sent: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done: Mutex::new(Some(done)),
        }
    }

    fn check(&self) {
        if self.all_sent.load(Ordering::Acquire)
            && self.received.load(Ordering::Acquire) == self.total.load(Ordering::Acquire)
            && self
                .finished
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            if let Some(done) = self.done.lock().take() {
                let _ = done.send(());
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RoundStats {
    pub dispatched: usize,
    pub retired: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Drives one round over the live executive states: every state is visited
/// once, at most one message per target contract goes out, and the round
/// completes when every dispatched message's callback has fired.
pub(crate) struct BatchRunner {
    executors: Arc<ExecutorManager>,
    states: Arc<Mutex<BTreeMap<ContextId, ExecutiveState>>>,
    key_locks: Arc<Mutex<KeyLockTable>>,
    results: Arc<Mutex<BTreeMap<ContextId, ExecutiveResult>>>,
    block_number: u64,
}

impl BatchRunner {
    pub fn new(
        executors: Arc<ExecutorManager>,
        states: Arc<Mutex<BTreeMap<ContextId, ExecutiveState>>>,
        key_locks: Arc<Mutex<KeyLockTable>>,
        results: Arc<Mutex<BTreeMap<ContextId, ExecutiveResult>>>,
        block_number: u64,
    ) -> Self {
        Self {
            executors,
            states,
            key_locks,
            results,
            block_number,
        }
    }

    pub async fn run_round(&self) -> Result<RoundStats, SchedulerError> {
        let mut stats = RoundStats::default();
        let mut outbound = Vec::new();

        {
            let mut states = self.states.lock();
            let mut key_locks = self.key_locks.lock();
            let mut active: HashSet<Address> = HashSet::new();
            let mut retired: Vec<(ContextId, ExecutiveResult)> = Vec::new();

            for (&context_id, state) in states.iter_mut() {
                let Some(target) = state.target() else { continue };
                // the contract is claimed before the transition runs, so a
                // state deferred on lock contention still reserves it
                if !active.insert(target) {
                    continue;
                }
                match state.advance(&mut key_locks, self.block_number)? {
                    Step::Dispatch(mut message) => {
                        message.external_locks =
                            key_locks.held_by_others(&message.to, context_id);
                        outbound.push(message);
                    }
                    Step::Retire(result) => retired.push((context_id, *result)),
                    Step::Defer => {}
                }
            }

            let mut results = self.results.lock();
            for (context_id, result) in retired {
                states.remove(&context_id);
                results.insert(context_id, result);
                stats.retired += 1;
            }
        }

        stats.dispatched = outbound.len();

        let (done_tx, done_rx) = oneshot::channel();
        let status = Arc::new(BatchStatus::new(done_tx));
        status.total.store(outbound.len(), Ordering::Release);

        for message in outbound {
            let context_id = message.context_id;
            let status = status.clone();
            let states = self.states.clone();
            let executors = self.executors.clone();
            tokio::spawn(async move {
                let outcome = match executors.route(&message.to) {
                    Ok(shard) => shard.execute_transaction(message).await,
                    Err(err) => Err(anyhow::Error::new(err)),
                };
                match outcome {
                    Ok(response) => {
                        if let Some(state) = states.lock().get_mut(&context_id) {
                            state.message = Some(response);
                        }
                    }
                    Err(err) => {
                        status.failed.fetch_add(1, Ordering::AcqRel);
                        let mut states = states.lock();
                        if let Some(state) = states.get_mut(&context_id) {
                            state.last_error = Some(err.to_string());
                        }
                        if let Some(state) = states.remove(&context_id) {
                            error!(
                                context_id,
                                error = state.last_error.as_deref().unwrap_or("unknown"),
                                "execute transaction failed, context retired"
                            );
                        }
                    }
                }
                // counted only after the state mutation, so a completed
                // round never observes a half-written response
                status.received.fetch_add(1, Ordering::AcqRel);
                status.check();
            });
        }

        status.all_sent.store(true, Ordering::Release);
        status.check();

        done_rx
            .await
            .map_err(|_| SchedulerError::Unknown("round completion channel dropped".into()))?;

        stats.failed = status.failed.load(Ordering::Acquire);
        stats.remaining = self.states.lock().len();
        debug!(
            dispatched = stats.dispatched,
            retired = stats.retired,
            failed = stats.failed,
            remaining = stats.remaining,
            "round complete"
        );
        Ok(stats)
    }
}
