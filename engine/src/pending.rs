//! Queue of publishes that could not reach the remote store.
//!
//! Operations are buffered while the device is offline, unauthenticated or
//! has sync disabled, and replayed once sync becomes available again. Only the
//! final state of an entity matters, so operations targeting the same
//! `(collection, id)` collapse to the most recently enqueued one before replay.

use crate::{CollectionName, Entity, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Default maximum number of queued operations.
pub const DEFAULT_CAPACITY: usize = 500;

/// Default depth past which every enqueue reports a backlog.
pub const DEFAULT_WARN_THRESHOLD: usize = 100;

/// Why a publish was queued instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueReason {
    /// No network connectivity
    Offline,
    /// No authenticated session
    AuthRequired,
    /// Cloud sync turned off by the user
    SyncDisabled,
    /// The remote store reported itself unavailable
    RemoteUnavailable,
    /// The remote store did not answer in time
    Timeout,
}

/// A publish waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Target collection
    pub entity_collection: CollectionName,
    /// Target entity
    pub entity_id: EntityId,
    /// Full entity as it was when the publish was attempted
    pub payload_snapshot: Entity,
    /// When the operation was queued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
    /// Why the publish did not go out
    pub reason: QueueReason,
}

impl PendingOperation {
    /// Create a pending operation for an entity snapshot.
    pub fn new(
        collection: impl Into<CollectionName>,
        snapshot: Entity,
        enqueued_at: Timestamp,
        reason: QueueReason,
    ) -> Self {
        Self {
            entity_collection: collection.into(),
            entity_id: snapshot.id.clone(),
            payload_snapshot: snapshot,
            enqueued_at,
            reason,
        }
    }

    /// Whether this operation targets the given entity.
    pub fn targets(&self, collection: &str, id: &str) -> bool {
        self.entity_collection == collection && self.entity_id == id
    }

    fn key(&self) -> (&str, &str) {
        (&self.entity_collection, &self.entity_id)
    }
}

/// Result of adding an operation to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Queued normally
    Queued { depth: usize },
    /// Queued, but the queue is deeper than the warning threshold
    Backlogged { depth: usize },
    /// Queued after evicting the oldest operation to stay within capacity
    Evicted {
        depth: usize,
        evicted: PendingOperation,
    },
}

impl EnqueueOutcome {
    /// Queue depth after the enqueue.
    pub fn depth(&self) -> usize {
        match self {
            EnqueueOutcome::Queued { depth }
            | EnqueueOutcome::Backlogged { depth }
            | EnqueueOutcome::Evicted { depth, .. } => *depth,
        }
    }
}

/// FIFO queue of pending operations with per-entity collapse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOpsQueue {
    ops: VecDeque<PendingOperation>,
    capacity: usize,
    warn_threshold: usize,
}

impl PendingOpsQueue {
    /// Create an empty queue with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_WARN_THRESHOLD)
    }

    /// Create an empty queue with explicit limits.
    ///
    /// A capacity of zero is raised to one so the latest write is never lost.
    pub fn with_limits(capacity: usize, warn_threshold: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            capacity: capacity.max(1),
            warn_threshold,
        }
    }

    /// Add an operation to the back of the queue.
    pub fn enqueue(&mut self, op: PendingOperation) -> EnqueueOutcome {
        if self.ops.len() >= self.capacity {
            self.collapse();
        }

        let evicted = if self.ops.len() >= self.capacity {
            self.ops.pop_front()
        } else {
            None
        };

        self.ops.push_back(op);
        let depth = self.ops.len();

        match evicted {
            Some(evicted) => EnqueueOutcome::Evicted { depth, evicted },
            None if depth > self.warn_threshold => EnqueueOutcome::Backlogged { depth },
            None => EnqueueOutcome::Queued { depth },
        }
    }

    /// Drop every operation superseded by a later one for the same entity.
    ///
    /// Survivors keep the relative order of their latest enqueue.
    pub fn collapse(&mut self) {
        let mut seen = HashSet::new();
        let mut survivors: Vec<PendingOperation> = Vec::with_capacity(self.ops.len());

        for op in self.ops.drain(..).rev() {
            let key = (op.key().0.to_string(), op.key().1.to_string());
            if seen.insert(key) {
                survivors.push(op);
            }
        }

        survivors.reverse();
        self.ops = survivors.into();
    }

    /// Collapse and take every operation for replay, leaving the queue empty.
    pub fn take_collapsed(&mut self) -> Vec<PendingOperation> {
        self.collapse();
        self.ops.drain(..).collect()
    }

    /// Get all queued operations in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.iter()
    }

    /// Latest queued operation for an entity, if any.
    pub fn latest_for(&self, collection: &str, id: &str) -> Option<&PendingOperation> {
        self.ops.iter().rev().find(|op| op.targets(collection, id))
    }

    /// Number of queued operations (before collapse).
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Maximum number of queued operations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Depth past which enqueues report a backlog.
    pub fn warn_threshold(&self) -> usize {
        self.warn_threshold
    }

    /// Clear all queued operations.
    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

impl Default for PendingOpsQueue {
    fn default() -> Self {
        Self::new()
    }
}
