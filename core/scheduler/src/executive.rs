use crate::error::SchedulerError;
use crate::key_locks::KeyLockTable;
use crate::message::{ContextId, ExecutionMessage, ExecutiveResult, MessageKind, Seq};
use shardex_primitives::{Address, TransactionReceipt};
use tracing::trace;

/// Outcome of advancing one executive state by a round.
pub(crate) enum Step {
    /// Send this message to its target shard
    Dispatch(ExecutionMessage),
    /// Call stack emptied; the context is done
    Retire(Box<ExecutiveResult>),
    /// Nothing to do this round, retry in the next one
    Defer,
}

/// Per-transaction call-stack state.
///
/// Owned exclusively by the block executive processing its block; the
/// message slot is `None` while a dispatch is in flight and holds the
/// frame's next step between rounds.
pub(crate) struct ExecutiveState {
    pub context_id: ContextId,
    call_stack: Vec<Seq>,
    pub message: Option<ExecutionMessage>,
    current_seq: Seq,
    initial_gas: u64,
    pub last_error: Option<String>,
}

impl ExecutiveState {
    pub fn new(context_id: ContextId, message: ExecutionMessage) -> Self {
        Self {
            context_id,
            call_stack: Vec::new(),
            current_seq: 0,
            initial_gas: message.gas_available,
            message: Some(message),
            last_error: None,
        }
    }

    /// Contract the pending message targets; `None` while in flight.
    pub fn target(&self) -> Option<Address> {
        self.message.as_ref().map(|message| message.to)
    }

    /// Apply one state-machine transition for the current round.
    pub fn advance(
        &mut self,
        locks: &mut KeyLockTable,
        block_number: u64,
    ) -> Result<Step, SchedulerError> {
        let Some(mut message) = self.message.take() else {
            return Ok(Step::Defer);
        };

        match message.kind {
            // Request: push a fresh frame and dispatch
            MessageKind::TxHash | MessageKind::Message => {
                Ok(Step::Dispatch(self.push_frame(message)))
            }

            // Return: pop the finished frame and resume its parent, or
            // retire the context when the stack empties
            MessageKind::Finished | MessageKind::Reverted => {
                let Some(seq) = self.call_stack.pop() else {
                    return Err(SchedulerError::Unknown(format!(
                        "context {} returned with an empty call stack",
                        self.context_id
                    )));
                };
                locks.release(self.context_id, seq)?;

                if let Some(&top) = self.call_stack.last() {
                    message.seq = top;
                    return Ok(Step::Dispatch(message));
                }

                // normally a no-op: each frame released on its own pop
                locks.release_context(self.context_id)?;

                let gas_used = self.initial_gas.saturating_sub(message.gas_available);
                trace!(
                    context_id = self.context_id,
                    gas_used,
                    status = message.status,
                    "context retired"
                );
                let receipt = TransactionReceipt {
                    tx_hash: message.tx_hash,
                    block_number,
                    contract: message.to,
                    gas_used,
                    status: message.status,
                    logs: std::mem::take(&mut message.logs),
                    output: std::mem::take(&mut message.data),
                };
                Ok(Step::Retire(Box::new(ExecutiveResult {
                    tx_hash: message.tx_hash,
                    contract: message.to,
                    receipt,
                })))
            }

            // Suspended on a key: resume as a fresh request once acquired,
            // otherwise sit the round out
            MessageKind::WaitKey => {
                let Some(key) = message.pending_key.clone() else {
                    return Err(SchedulerError::UnexpectedKeyLock(format!(
                        "context {} suspended without a key",
                        self.context_id
                    )));
                };
                if locks.acquire(&message.to, &key, self.context_id, self.current_seq) {
                    Ok(Step::Dispatch(self.push_frame(message)))
                } else {
                    self.message = Some(message);
                    Ok(Step::Defer)
                }
            }

            // Shard asked for re-routing; replay as a hash request
            MessageKind::SendBack => {
                message.kind = MessageKind::TxHash;
                Ok(Step::Dispatch(self.push_frame(message)))
            }
        }
    }

    fn push_frame(&mut self, mut message: ExecutionMessage) -> ExecutionMessage {
        let seq = self.current_seq;
        self.current_seq += 1;
        self.call_stack.push(seq);
        message.seq = seq;
        message
    }

    #[cfg(test)]
    fn stack_depth(&self) -> usize {
        self.call_stack.len()
    }
}
