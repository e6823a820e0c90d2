use crate::error::SchedulerError;
use crate::message::{ContextId, Seq};
use shardex_primitives::Address;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::trace;

type LockKey = (Address, Vec<u8>);

#[derive(Debug, Default)]
struct LockState {
    /// A resource has at most one holding context at a time
    holder: Option<ContextId>,
    /// Seqs of the holder's frames that acquired the key; the resource frees
    /// only when the last one releases
    holder_seqs: BTreeSet<Seq>,
    waiters: BTreeSet<(ContextId, Seq)>,
}

/// Ownership and wait tracking for (contract, key) resources.
///
/// Every edge is tagged with the (context, seq) of the call frame that
/// created it, so unwinding a frame releases exactly its own claims and an
/// ancestor frame's locks survive. Semantics are set-based, not FIFO-fair:
/// after a release, the first context to retry wins regardless of how long
/// the others waited.
#[derive(Debug, Default)]
pub struct KeyLockTable {
    locks: HashMap<LockKey, LockState>,
    /// Reverse index: frame -> keys it holds or waits on
    frames: HashMap<(ContextId, Seq), HashSet<LockKey>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `(contract, key)` for `context_id`. Succeeds when the
    /// resource is free or already held by the same context (a deeper frame
    /// adds its own edge). On failure a wait edge is recorded and the caller
    /// retries in a later round.
    pub fn acquire(
        &mut self,
        contract: &Address,
        key: &[u8],
        context_id: ContextId,
        seq: Seq,
    ) -> bool {
        let lock_key = (*contract, key.to_vec());
        let state = self.locks.entry(lock_key.clone()).or_default();
        match state.holder {
            Some(holder) if holder != context_id => {
                trace!(
                    %contract,
                    key = %hex::encode(key),
                    context_id,
                    seq,
                    holder,
                    "key lock held by another context"
                );
                state.waiters.insert((context_id, seq));
                self.frames
                    .entry((context_id, seq))
                    .or_default()
                    .insert(lock_key);
                false
            }
            _ => {
                state.holder = Some(context_id);
                state.holder_seqs.insert(seq);
                state.waiters.remove(&(context_id, seq));
                self.frames
                    .entry((context_id, seq))
                    .or_default()
                    .insert(lock_key);
                trace!(%contract, key = %hex::encode(key), context_id, seq, "key lock acquired");
                true
            }
        }
    }

    /// Remove every edge, held or waiting, tagged `(context_id, seq)`.
    /// Releasing a frame with no edges is a no-op; the error arises only when
    /// the reverse index and the lock table disagree, which is a programming
    /// invariant failure rather than a retryable condition.
    pub fn release(&mut self, context_id: ContextId, seq: Seq) -> Result<(), SchedulerError> {
        let Some(keys) = self.frames.remove(&(context_id, seq)) else {
            return Ok(());
        };
        trace!(context_id, seq, keys = keys.len(), "releasing key locks");
        for lock_key in keys {
            let state = self.locks.get_mut(&lock_key).ok_or_else(|| {
                SchedulerError::UnexpectedKeyLock(format!(
                    "frame ({context_id}, {seq}) references missing lock {}:{}",
                    lock_key.0,
                    hex::encode(&lock_key.1)
                ))
            })?;
            if state.holder == Some(context_id) {
                state.holder_seqs.remove(&seq);
                if state.holder_seqs.is_empty() {
                    state.holder = None;
                }
            }
            state.waiters.remove(&(context_id, seq));
            if state.holder.is_none() && state.waiters.is_empty() {
                self.locks.remove(&lock_key);
            }
        }
        Ok(())
    }

    /// Drop every remaining edge of a context, used as the defensive sweep
    /// when a context retires.
    pub fn release_context(&mut self, context_id: ContextId) -> Result<(), SchedulerError> {
        let seqs: Vec<Seq> = self
            .frames
            .keys()
            .filter(|(ctx, _)| *ctx == context_id)
            .map(|(_, seq)| *seq)
            .collect();
        for seq in seqs {
            self.release(context_id, seq)?;
        }
        Ok(())
    }

    /// Keys of `contract` currently held by contexts other than `exclude`.
    /// Read-only; sorted for deterministic output.
    pub fn held_by_others(&self, contract: &Address, exclude: ContextId) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .locks
            .iter()
            .filter(|(lock_key, state)| {
                lock_key.0 == *contract && matches!(state.holder, Some(h) if h != exclude)
            })
            .map(|(lock_key, _)| lock_key.1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// DFS over the wait-for graph (waiting context -> context holding the
    /// awaited key). A cycle means no round can make progress and external
    /// arbitration is required; this only detects, it does not pick a victim.
    pub fn detect_deadlock(&self) -> bool {
        let mut edges: HashMap<ContextId, BTreeSet<ContextId>> = HashMap::new();
        for state in self.locks.values() {
            let Some(holder) = state.holder else { continue };
            for (waiter, _) in &state.waiters {
                if *waiter != holder {
                    edges.entry(*waiter).or_default().insert(holder);
                }
            }
        }

        let mut visited: HashSet<ContextId> = HashSet::new();
        let starts: Vec<ContextId> = edges.keys().copied().collect();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            visited.insert(start);
            let mut on_path: HashSet<ContextId> = HashSet::new();
            on_path.insert(start);
            let mut stack = vec![(
                start,
                edges.get(&start).cloned().unwrap_or_default().into_iter(),
            )];
            while let Some(frame) = stack.last_mut() {
                if let Some(next) = frame.1.next() {
                    if on_path.contains(&next) {
                        return true;
                    }
                    if visited.insert(next) {
                        on_path.insert(next);
                        stack.push((
                            next,
                            edges.get(&next).cloned().unwrap_or_default().into_iter(),
                        ));
                    }
                } else {
                    let node = frame.0;
                    stack.pop();
                    on_path.remove(&node);
                }
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[test]
    fn free_key_is_acquired() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"balance", 0, 0));
        assert!(!table.is_empty());
    }

    #[test]
    fn held_key_refuses_other_context() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k", 0, 0));
        assert!(!table.acquire(&addr(1), b"k", 1, 0));
        // same key on a different contract is a different resource
        assert!(table.acquire(&addr(2), b"k", 1, 0));
    }

    #[test]
    fn same_context_reacquires_under_deeper_frame() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k", 0, 0));
        assert!(table.acquire(&addr(1), b"k", 0, 3));

        // unwinding the child frame keeps the ancestor's edge alive
        table.release(0, 3).unwrap();
        assert!(!table.acquire(&addr(1), b"k", 1, 0));

        table.release(0, 0).unwrap();
        assert!(table.acquire(&addr(1), b"k", 1, 1));
    }

    #[test]
    fn release_frees_key_for_waiter() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k", 0, 0));
        assert!(!table.acquire(&addr(1), b"k", 1, 0));

        table.release(0, 0).unwrap();
        assert!(table.acquire(&addr(1), b"k", 1, 0));
    }

    #[test]
    fn release_unknown_frame_is_noop() {
        let mut table = KeyLockTable::new();
        table.release(9, 9).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn release_context_drops_all_edges() {
        let mut table = KeyLockTable::new();
        table.acquire(&addr(1), b"a", 0, 0);
        table.acquire(&addr(1), b"b", 0, 1);
        table.acquire(&addr(2), b"c", 0, 2);
        table.acquire(&addr(1), b"a", 1, 0); // waiter

        table.release_context(0).unwrap();
        assert!(table.acquire(&addr(1), b"a", 2, 0));
        assert!(table.acquire(&addr(1), b"b", 2, 0));
        assert!(table.acquire(&addr(2), b"c", 2, 0));
    }

    #[test]
    fn held_by_others_excludes_own_context() {
        let mut table = KeyLockTable::new();
        table.acquire(&addr(1), b"a", 0, 0);
        table.acquire(&addr(1), b"b", 1, 0);
        table.acquire(&addr(2), b"c", 1, 0);

        let keys = table.held_by_others(&addr(1), 0);
        assert_eq!(keys, vec![b"b".to_vec()]);
        assert!(table.held_by_others(&addr(2), 1).is_empty());
    }

    #[test]
    fn waiters_are_not_reported_as_holders() {
        let mut table = KeyLockTable::new();
        table.acquire(&addr(1), b"a", 0, 0);
        assert!(!table.acquire(&addr(1), b"a", 1, 0));

        let keys = table.held_by_others(&addr(1), 2);
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn two_context_cycle_is_detected() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k1", 0, 0));
        assert!(table.acquire(&addr(2), b"k2", 1, 0));
        assert!(!table.acquire(&addr(2), b"k2", 0, 1));
        assert!(!table.acquire(&addr(1), b"k1", 1, 1));
        assert!(table.detect_deadlock());
    }

    #[test]
    fn waiting_chain_without_cycle_is_clean() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k1", 0, 0));
        assert!(table.acquire(&addr(2), b"k2", 1, 0));
        assert!(!table.acquire(&addr(1), b"k1", 1, 1));
        assert!(!table.acquire(&addr(2), b"k2", 2, 0));
        assert!(!table.detect_deadlock());
    }

    #[test]
    fn three_context_cycle_is_detected() {
        let mut table = KeyLockTable::new();
        assert!(table.acquire(&addr(1), b"k", 0, 0));
        assert!(table.acquire(&addr(2), b"k", 1, 0));
        assert!(table.acquire(&addr(3), b"k", 2, 0));
        assert!(!table.acquire(&addr(2), b"k", 0, 1));
        assert!(!table.acquire(&addr(3), b"k", 1, 1));
        assert!(!table.acquire(&addr(1), b"k", 2, 1));
        assert!(table.detect_deadlock());
    }

    proptest! {
        /// Random interleavings keep the single-holder invariant and leave
        /// nothing behind once every context releases everything.
        #[test]
        fn acquire_release_invariants(
            ops in prop::collection::vec(
                (0u64..3, 0u64..4, 0u8..3, prop::bool::ANY),
                1..64,
            )
        ) {
            let mut table = KeyLockTable::new();
            let contract = addr(1);
            for (context_id, seq, key_byte, is_release) in &ops {
                let key = [*key_byte];
                if *is_release {
                    table.release(*context_id, *seq).unwrap();
                } else {
                    let granted = table.acquire(&contract, &key, *context_id, *seq);
                    let others: Vec<Vec<u8>> = table.held_by_others(&contract, *context_id);
                    if granted {
                        // a granted key can never show up as held by someone else
                        prop_assert!(!others.contains(&key.to_vec()));
                    } else {
                        // a refused key must be visibly held by another context
                        prop_assert!(others.contains(&key.to_vec()));
                    }
                }
            }
            for context_id in 0..3 {
                table.release_context(context_id).unwrap();
            }
            prop_assert!(table.is_empty());
        }
    }
}
