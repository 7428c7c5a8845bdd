//! Replicated growable array (RGA) for shared text.
//!
//! Each Unicode scalar value is one element with a permanent [`OperationId`].
//! An insert places its run right after an *anchor* element; when several
//! runs share an anchor, the one with the greater id sits closer to it. Every
//! replica applies the same rule, so the final order does not depend on the
//! order operations arrive in.
//!
//! ```text
//!  START ── h(1@r1) ── i(2@r1)          insert "hi" after START
//!    │
//!    └─ concurrent "yo" (1@r2) > 1@r1  →  START ── y ── o ── h ── i
//! ```
//!
//! Deletes only flip the tombstone flag. Operations whose anchor or target is
//! not known yet are parked until the element shows up; a delete that
//! arrives before its insert wins once the insert lands (tombstone-wins).
//! An operation that finds the queue full is rejected without being recorded,
//! so the sender can deliver it again later.
//!
//! Reference: Roh et al., "Replicated abstract data types", JPDC 2011

pub mod id;

pub use id::{LamportClock, OperationId, ReplicaId};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::dedup::Deduplicator;

/// Default cap on operations parked while waiting for a dependency.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert `text` right after `anchor`.
    Insert { anchor: OperationId, text: String },
    /// Tombstone `length` consecutive ids of one replica starting at `target`.
    Delete { target: OperationId, length: u64 },
}

/// An id-based CRDT operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(flatten)]
    pub kind: OperationKind,
    /// User that produced the operation (opaque, informational).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

impl Operation {
    pub fn insert(id: OperationId, anchor: OperationId, text: impl Into<String>) -> Self {
        Self {
            id,
            kind: OperationKind::Insert {
                anchor,
                text: text.into(),
            },
            origin: String::new(),
        }
    }

    pub fn delete(id: OperationId, target: OperationId, length: u64) -> Self {
        Self {
            id,
            kind: OperationKind::Delete { target, length },
            origin: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Lamport time of the operation.
    pub fn logical_clock(&self) -> u64 {
        self.id.counter
    }

    /// Highest counter value the operation occupies.
    pub fn last_counter(&self) -> u64 {
        match &self.kind {
            OperationKind::Insert { text, .. } => {
                self.id.counter + (text.chars().count() as u64).saturating_sub(1)
            }
            OperationKind::Delete { .. } => self.id.counter,
        }
    }
}

/// One element of the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: OperationId,
    pub value: char,
    pub tombstone: bool,
    /// Anchor this element was inserted after.
    pub predecessor: OperationId,
}

/// Result of applying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Took effect now.
    Applied,
    /// Parked until its anchor or target arrives.
    Deferred,
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Accepted but had nothing to do (e.g. deleting a tombstone).
    NoOp,
}

/// RGA errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RgaError {
    /// The anchor is unknown and can never arrive.
    #[error("unknown anchor {0}")]
    UnknownAnchor(OperationId),
    /// Counter 0 is reserved for the start sentinel.
    #[error("operation id {0} is reserved")]
    ReservedId(OperationId),
    /// The pending queue is full; `{0}` could not be parked. Redeliver later.
    #[error("pending queue full, cannot park {0}")]
    QueueFull(OperationId),
}

/// The sequence store for one replica.
#[derive(Debug, Clone)]
pub struct Rga {
    replica: ReplicaId,
    clock: LamportClock,
    elements: Vec<Element>,
    /// Ids of integrated elements.
    known: HashSet<OperationId>,
    /// anchor id → inserts waiting for it
    pending_inserts: HashMap<OperationId, Vec<Operation>>,
    /// Ids of the parked inserts.
    parked: HashSet<OperationId>,
    /// Element ids deleted before they were inserted.
    pending_deletes: HashSet<OperationId>,
    max_pending: usize,
    dedup: Deduplicator<OperationId>,
}

impl Rga {
    /// Create an empty replica.
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self::with_pending_limit(replica, DEFAULT_MAX_PENDING)
    }

    /// Create an empty replica with a custom pending-queue cap.
    ///
    /// A cap of 0 disables queueing: inserts with unknown anchors fail.
    pub fn with_pending_limit(replica: impl Into<ReplicaId>, max_pending: usize) -> Self {
        Self {
            replica: replica.into(),
            clock: LamportClock::new(),
            elements: Vec::new(),
            known: HashSet::new(),
            pending_inserts: HashMap::new(),
            parked: HashSet::new(),
            pending_deletes: HashSet::new(),
            max_pending,
            dedup: Deduplicator::new(),
        }
    }

    /// Seed a replica with stored text.
    ///
    /// The text becomes one run owned by [`ReplicaId::SNAPSHOT`], so every
    /// replica seeded from the same snapshot agrees on its ids.
    pub fn from_snapshot(replica: impl Into<ReplicaId>, text: &str) -> Self {
        let mut rga = Self::new(replica);
        let len = text.chars().count() as u64;
        if len > 0 {
            let first = OperationId::new(1, ReplicaId::SNAPSHOT);
            rga.integrate_run(first, OperationId::START, text);
            rga.clock.observe(len);
            rga.dedup.advance_watermark(len);
        }
        rga
    }

    /// Change the pending-queue cap.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    // ─── Core operations ──────────────────────────────────────────────

    /// Insert `text` right after `anchor`, with ids starting at `op_id`.
    pub fn insert(
        &mut self,
        anchor: OperationId,
        text: &str,
        op_id: OperationId,
    ) -> Result<ApplyOutcome, RgaError> {
        if op_id.counter == 0 {
            return Err(RgaError::ReservedId(op_id));
        }
        if text.is_empty() {
            return Ok(ApplyOutcome::NoOp);
        }
        if self.known.contains(&op_id) || self.parked.contains(&op_id) {
            return Ok(ApplyOutcome::Duplicate);
        }

        if anchor.is_start() || self.known.contains(&anchor) {
            self.integrate_run(op_id, anchor, text);
            self.clock.observe(op_id.counter + text.chars().count() as u64 - 1);
            return Ok(ApplyOutcome::Applied);
        }

        // Anchor not here yet: park it unless it can never arrive.
        if self.dedup.is_settled(anchor.counter) || self.pending_len() >= self.max_pending {
            return Err(RgaError::UnknownAnchor(anchor));
        }
        log::debug!("Deferring insert {op_id}: anchor {anchor} not yet seen");
        self.pending_inserts
            .entry(anchor)
            .or_default()
            .push(Operation::insert(op_id, anchor, text));
        self.parked.insert(op_id);
        Ok(ApplyOutcome::Deferred)
    }

    /// Tombstone the element `target`.
    ///
    /// An unseen target is parked so the element lands already deleted.
    /// Fails with [`RgaError::QueueFull`] when it cannot be parked.
    pub fn delete(&mut self, target: OperationId) -> Result<ApplyOutcome, RgaError> {
        self.delete_from(target, 0).map(|(outcome, _)| outcome)
    }

    /// Apply an operation at most once.
    pub fn apply_operation(&mut self, op: &Operation) -> Result<ApplyOutcome, RgaError> {
        if op.id.counter == 0 {
            return Err(RgaError::ReservedId(op.id));
        }
        if self.dedup.contains(&op.id) || self.dedup.is_settled(op.id.counter) {
            log::trace!("Skipping duplicate operation {}", op.id);
            return Ok(ApplyOutcome::Duplicate);
        }

        let outcome = match &op.kind {
            OperationKind::Insert { anchor, text } => self.insert(*anchor, text, op.id)?,
            OperationKind::Delete { target, length } => self.delete_span(*target, *length)?,
        };

        self.clock.observe(op.last_counter());
        self.dedup.record(op.id, op.id.counter);
        Ok(outcome)
    }

    /// Apply a batch in order, stopping at the first error.
    pub fn apply_all<'a>(
        &mut self,
        ops: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<Vec<ApplyOutcome>, RgaError> {
        ops.into_iter().map(|op| self.apply_operation(op)).collect()
    }

    /// Visible text.
    pub fn materialize(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .map(|e| e.value)
            .collect()
    }

    // ─── Local generation ─────────────────────────────────────────────

    /// Translate "insert `text` at visible `position`" into an operation
    /// authored by `replica`. Positions past the end are clamped.
    ///
    /// The operation is not applied. Returns `None` for empty text.
    pub fn generate_insert(
        &mut self,
        replica: ReplicaId,
        position: usize,
        text: &str,
    ) -> Option<Operation> {
        let len = text.chars().count() as u64;
        if len == 0 {
            return None;
        }
        let anchor = match position.min(self.len()) {
            0 => OperationId::START,
            pos => self.visible_id(pos - 1)?,
        };
        let counter = self.clock.reserve(len);
        Some(Operation::insert(OperationId::new(counter, replica), anchor, text))
    }

    /// Translate "delete `length` visible chars at `position`" into delete
    /// operations, one per contiguous id span. The operations are not applied.
    pub fn generate_delete(
        &mut self,
        replica: ReplicaId,
        position: usize,
        length: usize,
    ) -> Vec<Operation> {
        let targets: Vec<OperationId> = self
            .elements
            .iter()
            .filter(|e| !e.tombstone)
            .skip(position)
            .take(length)
            .map(|e| e.id)
            .collect();

        let mut spans: Vec<(OperationId, u64)> = Vec::new();
        for id in targets {
            match spans.last_mut() {
                Some((start, len)) if start.offset(*len - 1).is_followed_by(&id) => *len += 1,
                _ => spans.push((id, 1)),
            }
        }

        spans
            .into_iter()
            .map(|(target, len)| {
                let counter = self.clock.reserve(1);
                Operation::delete(OperationId::new(counter, replica), target, len)
            })
            .collect()
    }

    /// Generate and apply a local insert.
    pub fn insert_at(&mut self, position: usize, text: &str) -> Result<Option<Operation>, RgaError> {
        let Some(op) = self.generate_insert(self.replica, position, text) else {
            return Ok(None);
        };
        self.apply_operation(&op)?;
        Ok(Some(op))
    }

    /// Generate and apply a local delete.
    pub fn delete_range(&mut self, position: usize, length: usize) -> Result<Vec<Operation>, RgaError> {
        let ops = self.generate_delete(self.replica, position, length);
        self.apply_all(&ops)?;
        Ok(ops)
    }

    // ─── Compaction ───────────────────────────────────────────────────

    /// Advance the dedup watermark to `stable`, the counter at or below
    /// which no operation can still arrive. Capped below anything parked.
    ///
    /// Returns the number of dedup entries dropped.
    pub fn compact(&mut self, stable: u64) -> usize {
        let pending_floor = self
            .parked
            .iter()
            .map(|id| id.counter)
            .chain(self.pending_deletes.iter().map(|id| id.counter))
            .min();
        let watermark = match pending_floor {
            Some(floor) => stable.min(floor.saturating_sub(1)),
            None => stable,
        };
        self.dedup.advance_watermark(watermark)
    }

    /// Current dedup watermark.
    pub fn watermark(&self) -> u64 {
        self.dedup.watermark()
    }

    /// Number of ids retained by the deduplicator.
    pub fn tracked_ids(&self) -> usize {
        self.dedup.len()
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.tombstone).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements including tombstones, in document order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.iter().filter(|e| e.tombstone).count()
    }

    /// Operations and deletes parked waiting for a dependency.
    pub fn pending_len(&self) -> usize {
        self.parked.len() + self.pending_deletes.len()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.known.contains(id)
    }

    /// Id of the visible element at `position`.
    pub fn visible_id(&self, position: usize) -> Option<OperationId> {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .nth(position)
            .map(|e| e.id)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn delete_span(&mut self, target: OperationId, length: u64) -> Result<ApplyOutcome, RgaError> {
        let mut outcome = ApplyOutcome::NoOp;
        // Ids of one run usually sit next to each other.
        let mut hint = 0;
        for n in 0..length.max(1) {
            let (step, index) = self.delete_from(target.offset(n), hint)?;
            if let Some(index) = index {
                hint = index + 1;
            }
            match step {
                ApplyOutcome::Applied => outcome = ApplyOutcome::Applied,
                ApplyOutcome::Deferred if outcome == ApplyOutcome::NoOp => {
                    outcome = ApplyOutcome::Deferred
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Delete `target`, searching from `hint` first. Also returns the
    /// element's index when it is present.
    fn delete_from(
        &mut self,
        target: OperationId,
        hint: usize,
    ) -> Result<(ApplyOutcome, Option<usize>), RgaError> {
        if self.known.contains(&target) {
            let Some(index) = self.locate(target, hint) else {
                return Ok((ApplyOutcome::NoOp, None));
            };
            let element = &mut self.elements[index];
            if element.tombstone {
                return Ok((ApplyOutcome::NoOp, Some(index)));
            }
            element.tombstone = true;
            return Ok((ApplyOutcome::Applied, Some(index)));
        }

        if self.pending_deletes.contains(&target) {
            return Ok((ApplyOutcome::NoOp, None));
        }
        if self.dedup.is_settled(target.counter) {
            log::debug!("Dropping delete of {target}: element can no longer arrive");
            return Ok((ApplyOutcome::NoOp, None));
        }
        if self.pending_len() >= self.max_pending {
            log::warn!("Cannot defer delete of {target}: pending queue full");
            return Err(RgaError::QueueFull(target));
        }
        log::debug!("Deferring delete of {target}: element not yet seen");
        self.pending_deletes.insert(target);
        Ok((ApplyOutcome::Deferred, None))
    }

    /// Index of element `id`, scanning forward from `hint` and then the
    /// part before it.
    fn locate(&self, id: OperationId, hint: usize) -> Option<usize> {
        let hint = hint.min(self.elements.len());
        self.elements[hint..]
            .iter()
            .position(|e| e.id == id)
            .map(|i| i + hint)
            .or_else(|| self.elements[..hint].iter().position(|e| e.id == id))
    }

    /// Integrate a run and then everything that was waiting on it.
    fn integrate_run(&mut self, first: OperationId, anchor: OperationId, text: &str) {
        let mut work = vec![(first, anchor, text.to_string())];

        while let Some((first, anchor, text)) = work.pop() {
            let mut prev = anchor;
            let mut prev_index: Option<usize> = None;
            for (n, value) in text.chars().enumerate() {
                let id = first.offset(n as u64);
                // Later chars of a run anchor on the one just placed.
                let start = match prev_index {
                    Some(i) => i + 1,
                    None => self.index_after(prev),
                };
                let index = self.skip_newer(start, id);
                let tombstone = self.pending_deletes.remove(&id);
                self.elements.insert(
                    index,
                    Element {
                        id,
                        value,
                        tombstone,
                        predecessor: prev,
                    },
                );
                self.known.insert(id);

                if let Some(waiting) = self.pending_inserts.remove(&id) {
                    for op in waiting {
                        self.parked.remove(&op.id);
                        if let OperationKind::Insert { anchor, text } = op.kind {
                            log::debug!("Resolving deferred insert {} after {anchor}", op.id);
                            self.clock.observe(op.id.counter + text.chars().count() as u64 - 1);
                            work.push((op.id, anchor, text));
                        }
                    }
                }
                prev = id;
                prev_index = Some(index);
            }
        }
    }

    /// First index after `anchor`.
    fn index_after(&self, anchor: OperationId) -> usize {
        if anchor.is_start() {
            return 0;
        }
        self.locate(anchor, 0).map_or(self.elements.len(), |i| i + 1)
    }

    /// Where `id` goes when placed at or after `index`: skip every element
    /// with a greater id (newer siblings and their runs).
    fn skip_newer(&self, mut index: usize, id: OperationId) -> usize {
        while index < self.elements.len() && self.elements[index].id > id {
            index += 1;
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica_with(replica: u64, text: &str) -> (Rga, Option<Operation>) {
        let mut rga = Rga::new(replica);
        let op = rga.insert_at(0, text).unwrap();
        (rga, op)
    }

    #[test]
    fn test_insert_at_start_and_append() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "world").unwrap();
        rga.insert_at(0, "hello ").unwrap();
        rga.insert_at(100, "!").unwrap();
        assert_eq!(rga.materialize(), "hello world!");
        assert_eq!(rga.len(), 12);
    }

    #[test]
    fn test_insert_delete_round_trip() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "hello").unwrap();
        rga.delete_range(0, 5).unwrap();
        assert_eq!(rga.materialize(), "");
        assert_eq!(rga.tombstone_count(), 5);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let (mut a, op) = replica_with(1, "abc");
        let op = op.unwrap();
        let mut b = Rga::new(2);

        assert_eq!(b.apply_operation(&op).unwrap(), ApplyOutcome::Applied);
        let once = b.materialize();
        assert_eq!(b.apply_operation(&op).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(b.materialize(), once);

        // The author re-receiving its own op is also a no-op.
        assert_eq!(a.apply_operation(&op).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(a.materialize(), "abc");
    }

    #[test]
    fn test_concurrent_inserts_same_anchor_tie_break() {
        let (mut a, op_a) = replica_with(1, "AB");
        let (mut b, op_b) = replica_with(2, "CD");
        let (op_a, op_b) = (op_a.unwrap(), op_b.unwrap());

        a.apply_operation(&op_b).unwrap();
        b.apply_operation(&op_a).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        // Same counter, replica 2 > replica 1: its run sits closer to START.
        assert_eq!(a.materialize(), "CDAB");
    }

    #[test]
    fn test_concurrent_inserts_mid_document() {
        let mut base = Rga::new(1);
        let seed = base.insert_at(0, "ac").unwrap().unwrap();

        let mut a = Rga::new(2);
        let mut b = Rga::new(3);
        a.apply_operation(&seed).unwrap();
        b.apply_operation(&seed).unwrap();

        let x = a.insert_at(1, "X").unwrap().unwrap();
        let y = b.insert_at(1, "Y").unwrap().unwrap();

        a.apply_operation(&y).unwrap();
        b.apply_operation(&x).unwrap();
        base.apply_operation(&y).unwrap();
        base.apply_operation(&x).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.materialize(), base.materialize());
        assert_eq!(a.materialize(), "aYXc");
    }

    #[test]
    fn test_delete_before_insert_tombstone_wins() {
        let mut author = Rga::new(1);
        let insert = author.insert_at(0, "xyz").unwrap().unwrap();
        let deletes = author.delete_range(1, 1).unwrap();
        assert_eq!(author.materialize(), "xz");

        let mut late = Rga::new(2);
        assert_eq!(late.apply_operation(&deletes[0]).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(late.pending_len(), 1);
        assert_eq!(late.apply_operation(&insert).unwrap(), ApplyOutcome::Applied);

        assert_eq!(late.materialize(), "xz");
        assert_eq!(late.pending_len(), 0);
    }

    #[test]
    fn test_insert_before_anchor_is_deferred_then_resolved() {
        let mut author = Rga::new(1);
        let first = author.insert_at(0, "ab").unwrap().unwrap();
        let second = author.insert_at(2, "cd").unwrap().unwrap();
        let third = author.insert_at(4, "ef").unwrap().unwrap();

        let mut late = Rga::new(2);
        assert_eq!(late.apply_operation(&third).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(late.apply_operation(&second).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(late.materialize(), "");
        assert_eq!(late.apply_operation(&first).unwrap(), ApplyOutcome::Applied);

        assert_eq!(late.materialize(), "abcdef");
        assert_eq!(late.pending_len(), 0);
        assert!(late.clock().current() >= third.last_counter());
    }

    #[test]
    fn test_unknown_anchor_without_queue() {
        let mut rga = Rga::with_pending_limit(1, 0);
        let op = Operation::insert(OperationId::new(5, 2), OperationId::new(4, 2), "x");
        assert_eq!(
            rga.apply_operation(&op),
            Err(RgaError::UnknownAnchor(OperationId::new(4, 2)))
        );
        assert_eq!(rga.tracked_ids(), 0);
    }

    #[test]
    fn test_unknown_anchor_below_watermark() {
        let mut rga = Rga::new(1);
        rga.compact(10);
        let op = Operation::insert(OperationId::new(12, 2), OperationId::new(3, 2), "x");
        assert!(matches!(rga.apply_operation(&op), Err(RgaError::UnknownAnchor(_))));
    }

    #[test]
    fn test_reserved_id_rejected() {
        let mut rga = Rga::new(1);
        let op = Operation::insert(OperationId::START, OperationId::START, "x");
        assert!(matches!(rga.apply_operation(&op), Err(RgaError::ReservedId(_))));
    }

    #[test]
    fn test_delete_tombstone_twice_is_noop() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "a").unwrap();
        let id = rga.visible_id(0).unwrap();
        assert_eq!(rga.delete(id), Ok(ApplyOutcome::Applied));
        assert_eq!(rga.delete(id), Ok(ApplyOutcome::NoOp));
    }

    #[test]
    fn test_delete_with_full_queue_is_redeliverable() {
        let mut author = Rga::new(1);
        let insert = author.insert_at(0, "xy").unwrap().unwrap();
        let deletes = author.delete_range(0, 2).unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(author.materialize(), "");

        // Room for one parked id: "x" parks, "y" does not fit.
        let mut capped = Rga::with_pending_limit(2, 1);
        assert!(matches!(
            capped.apply_operation(&deletes[0]),
            Err(RgaError::QueueFull(_))
        ));
        capped.apply_operation(&insert).unwrap();
        assert_eq!(capped.materialize(), "y");

        // The failed delete was not recorded, so redelivery lands.
        assert_eq!(capped.apply_operation(&deletes[0]), Ok(ApplyOutcome::Applied));
        assert_eq!(capped.materialize(), author.materialize());
        assert_eq!(capped.pending_len(), 0);
    }

    #[test]
    fn test_parked_insert_is_idempotent() {
        let mut author = Rga::new(1);
        let first = author.insert_at(0, "a").unwrap().unwrap();
        let second = author.insert_at(1, "b").unwrap().unwrap();
        let OperationKind::Insert { anchor, text } = &second.kind else {
            panic!("expected an insert, got {second:?}");
        };

        let mut replica = Rga::new(2);
        assert_eq!(replica.insert(*anchor, text, second.id), Ok(ApplyOutcome::Deferred));
        assert_eq!(replica.insert(*anchor, text, second.id), Ok(ApplyOutcome::Duplicate));
        assert_eq!(replica.pending_len(), 1);

        assert_eq!(replica.apply_operation(&first), Ok(ApplyOutcome::Applied));
        assert_eq!(replica.materialize(), "ab");
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.insert(*anchor, text, second.id), Ok(ApplyOutcome::Duplicate));
    }

    #[test]
    fn test_long_run_split_by_concurrent_insert() {
        let mut a = Rga::new(1);
        let paste: String = "0123456789".repeat(50);
        let run = a.insert_at(0, &paste).unwrap().unwrap();

        let mut b = Rga::new(2);
        b.apply_operation(&run).unwrap();
        let wedge = b.insert_at(250, "WEDGE").unwrap().unwrap();
        a.apply_operation(&wedge).unwrap();

        // Run, wedge, run again: three id spans.
        let deletes = a.delete_range(245, 15).unwrap();
        assert_eq!(deletes.len(), 3);
        b.apply_all(&deletes).unwrap();

        let mut expected = paste.clone();
        expected.insert_str(250, "WEDGE");
        expected.replace_range(245..260, "");
        assert_eq!(a.materialize(), expected);
        assert_eq!(b.materialize(), expected);

        // A late replica receiving the tail run first still converges.
        let mut late = Rga::new(3);
        for op in deletes.iter().rev().chain([&wedge, &run]) {
            late.apply_operation(op).unwrap();
        }
        assert_eq!(late.materialize(), expected);
    }

    #[test]
    fn test_generate_delete_splits_spans() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "ad").unwrap();
        rga.insert_at(1, "bc").unwrap();
        assert_eq!(rga.materialize(), "abcd");

        let ops = rga.generate_delete(ReplicaId(1), 0, 4);
        // "a" | "bc" | "d" are three separate id runs.
        assert_eq!(ops.len(), 3);
        rga.apply_all(&ops).unwrap();
        assert_eq!(rga.materialize(), "");
    }

    #[test]
    fn test_generate_delete_clamps() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "abc").unwrap();
        assert!(rga.generate_delete(ReplicaId(1), 10, 2).is_empty());
        rga.delete_range(1, 50).unwrap();
        assert_eq!(rga.materialize(), "a");
    }

    #[test]
    fn test_from_snapshot_replicas_agree_on_ids() {
        let mut a = Rga::from_snapshot(1, "base");
        let mut b = Rga::from_snapshot(2, "base");
        assert_eq!(a.materialize(), "base");

        let op = a.insert_at(4, "!").unwrap().unwrap();
        b.apply_operation(&op).unwrap();
        assert_eq!(b.materialize(), "base!");
        assert!(a.clock().current() > 4);
    }

    #[test]
    fn test_compaction_bounds_tracked_ids() {
        let mut rga = Rga::new(1);
        for i in 0..20 {
            rga.insert_at(i, "x").unwrap();
        }
        assert_eq!(rga.tracked_ids(), 20);
        let dropped = rga.compact(rga.clock().current());
        assert_eq!(dropped, 20);
        assert_eq!(rga.tracked_ids(), 0);
        assert_eq!(rga.materialize().len(), 20);
    }

    #[test]
    fn test_compaction_capped_by_pending() {
        let mut rga = Rga::new(1);
        let op = Operation::insert(OperationId::new(8, 2), OperationId::new(7, 2), "x");
        assert_eq!(rga.apply_operation(&op).unwrap(), ApplyOutcome::Deferred);
        rga.compact(100);
        assert_eq!(rga.watermark(), 7);
    }

    #[test]
    fn test_unicode_positions() {
        let mut rga = Rga::new(1);
        rga.insert_at(0, "héllo").unwrap();
        rga.insert_at(2, "→").unwrap();
        assert_eq!(rga.materialize(), "hé→llo");
        rga.delete_range(1, 2).unwrap();
        assert_eq!(rga.materialize(), "hllo");
    }

    #[test]
    fn test_convergence_across_all_delivery_orders() {
        let mut a = Rga::new(1);
        let mut b = Rga::new(2);
        let mut c = Rga::new(3);

        let mut ops = Vec::new();
        ops.push(a.insert_at(0, "hello").unwrap().unwrap());
        ops.push(b.insert_at(0, "world").unwrap().unwrap());
        ops.push(c.insert_at(0, "!").unwrap().unwrap());
        // A edits on top of its own run.
        ops.extend(a.delete_range(1, 3).unwrap());
        ops.push(a.insert_at(1, "EL").unwrap().unwrap());

        let orders: [[usize; 5]; 6] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 4, 0, 1, 3],
            [1, 3, 4, 2, 0],
            [3, 0, 4, 2, 1],
            [4, 2, 1, 0, 3],
        ];

        let mut results = Vec::new();
        for (replica, order) in orders.iter().enumerate() {
            let mut rga = Rga::new(10 + replica as u64);
            for &i in order {
                rga.apply_operation(&ops[i]).unwrap();
            }
            assert_eq!(rga.pending_len(), 0);
            results.push(rga.materialize());
        }

        assert!(results.windows(2).all(|w| w[0] == w[1]), "{results:?}");
        assert_eq!(results[0].chars().count(), 10);
    }

    #[test]
    fn test_operation_json_shape() {
        let op = Operation::insert(OperationId::new(3, 1), OperationId::START, "hi").with_origin("u1");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "insert");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["id"]["counter"], 3);
        assert_eq!(json["origin"], "u1");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
