// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Input queue and in-flight bookkeeping shared between the host-facing
//! component API and the worker thread.
//!
//! Two structures live behind one lock: the FIFO of not-yet-processed work
//! (with drain markers interleaved at their queueing position) and the
//! pending map of work already submitted to the engine, keyed by
//! `frame_index` and resolvable in insertion order for streams that cannot
//! echo identity back.

use std::collections::{HashMap, VecDeque};

use crate::work::{DrainMode, Status, Work};

struct QueueEntry {
    work: Option<Work>,
    drain: DrainMode,
    generation: u32,
}

/// An entry handed to the worker: at most one work item and the drain mode
/// active at its queue position.
pub struct WorkEntry {
    pub work: Option<Work>,
    pub drain: DrainMode,
}

/// The component work queue.
///
/// Not internally synchronized; callers wrap it in a mutex shared between
/// the host thread and the worker.
#[derive(Default)]
pub struct WorkQueue {
    generation: u32,
    queue: VecDeque<QueueEntry>,
    pending: HashMap<u64, Work>,
    pending_order: VecDeque<u64>,
    pending_flush: bool,
    signalled_error: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Invalidate all queued-but-unprocessed work. Entries stamped with an
    /// older generation are returned to the listener as [`Status::NotFound`].
    pub fn inc_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Append one work item at the current generation.
    pub fn push_work(&mut self, work: Work) {
        self.queue.push_back(QueueEntry {
            work: Some(work),
            drain: DrainMode::NoDrain,
            generation: self.generation,
        });
    }

    /// Append a drain marker. Chained draining is not supported.
    pub fn mark_drain(&mut self, mode: DrainMode) -> Status {
        match mode {
            DrainMode::NoDrain => Status::Ok,
            DrainMode::Chain => Status::Omitted,
            DrainMode::WithEos | DrainMode::NoEos => {
                self.queue.push_back(QueueEntry {
                    work: None,
                    drain: mode,
                    generation: self.generation,
                });
                Status::Ok
            }
        }
    }

    /// Pop the next current-generation entry. Stale entries are skipped and
    /// returned separately so the caller can fail them without processing.
    pub fn pop(&mut self) -> (Option<WorkEntry>, Vec<Work>) {
        let mut stale = Vec::new();
        while let Some(entry) = self.queue.pop_front() {
            if entry.generation != self.generation {
                if let Some(mut work) = entry.work {
                    work.result = Status::NotFound;
                    work.fill_empty();
                    stale.push(work);
                }
                continue;
            }
            return (Some(WorkEntry { work: entry.work, drain: entry.drain }), stale);
        }
        (None, stale)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Track work whose input has been submitted to the engine. A key
    /// collision means the engine lost the older item; it is evicted as
    /// [`Status::Corrupted`] for the caller to return.
    pub fn pending_insert(&mut self, work: Work) -> Option<Work> {
        let frame_index = work.frame_index();
        let evicted = self.pending.insert(frame_index, work).map(|mut old| {
            old.result = Status::Corrupted;
            old.fill_empty();
            old
        });
        if evicted.is_some() {
            self.pending_order.retain(|&idx| idx != frame_index);
        }
        self.pending_order.push_back(frame_index);
        evicted
    }

    /// Resolve pending work by identity.
    pub fn pending_take(&mut self, frame_index: u64) -> Option<Work> {
        let work = self.pending.remove(&frame_index)?;
        self.pending_order.retain(|&idx| idx != frame_index);
        Some(work)
    }

    /// Resolve the oldest pending work by insertion order. Used when the
    /// stream cannot carry identity through the engine.
    pub fn pending_take_oldest(&mut self) -> Option<Work> {
        let frame_index = self.pending_order.pop_front()?;
        self.pending.remove(&frame_index)
    }

    /// Peek the oldest pending identity without removing it.
    pub fn pending_oldest(&self) -> Option<u64> {
        self.pending_order.front().copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_contains(&self, frame_index: u64) -> bool {
        self.pending.contains_key(&frame_index)
    }

    /// Remove everything; returns queued work first, then pending work in
    /// insertion order. Drain markers are dropped.
    pub fn take_all(&mut self) -> Vec<Work> {
        let mut all: Vec<Work> =
            self.queue.drain(..).filter_map(|entry| entry.work).collect();
        while let Some(frame_index) = self.pending_order.pop_front() {
            if let Some(work) = self.pending.remove(&frame_index) {
                all.push(work);
            }
        }
        self.pending.clear();
        all
    }

    /// Raise the flush request for the worker thread.
    pub fn set_pending_flush(&mut self) {
        self.pending_flush = true;
    }

    /// One-shot read of the flush request.
    pub fn take_pending_flush(&mut self) -> bool {
        std::mem::take(&mut self.pending_flush)
    }

    pub fn has_pending_flush(&self) -> bool {
        self.pending_flush
    }

    /// Mark the stream unrecoverable. Later queue calls are accepted but
    /// their work comes back `Corrupted` until the component is reset.
    pub fn set_signalled_error(&mut self) {
        self.signalled_error = true;
    }

    pub fn signalled_error(&self) -> bool {
        self.signalled_error
    }

    pub fn clear_signalled_error(&mut self) {
        self.signalled_error = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkInput, WorkOrdinal};

    fn work(frame_index: u64) -> Work {
        Work::new(WorkInput {
            ordinal: WorkOrdinal::new(frame_index, frame_index as i64 * 33_333),
            ..Default::default()
        })
    }

    #[test]
    fn fifo_order_with_drain_marker() {
        let mut queue = WorkQueue::new();
        queue.push_work(work(0));
        assert_eq!(queue.mark_drain(DrainMode::WithEos), Status::Ok);
        queue.push_work(work(1));

        let (entry, stale) = queue.pop();
        let entry = entry.unwrap();
        assert!(stale.is_empty());
        assert_eq!(entry.work.unwrap().frame_index(), 0);
        assert_eq!(entry.drain, DrainMode::NoDrain);

        let (entry, _) = queue.pop();
        let entry = entry.unwrap();
        assert!(entry.work.is_none());
        assert_eq!(entry.drain, DrainMode::WithEos);

        let (entry, _) = queue.pop();
        assert_eq!(entry.unwrap().work.unwrap().frame_index(), 1);
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn chain_drain_rejected() {
        let mut queue = WorkQueue::new();
        assert_eq!(queue.mark_drain(DrainMode::Chain), Status::Omitted);
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn stale_generation_fails_as_not_found() {
        let mut queue = WorkQueue::new();
        queue.push_work(work(0));
        queue.push_work(work(1));
        queue.inc_generation();
        queue.push_work(work(2));

        let (entry, stale) = queue.pop();
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|w| w.result == Status::NotFound));
        assert!(stale.iter().all(|w| w.worklets_processed == 1));
        assert_eq!(entry.unwrap().work.unwrap().frame_index(), 2);
    }

    #[test]
    fn pending_collision_evicts_as_corrupted() {
        let mut queue = WorkQueue::new();
        assert!(queue.pending_insert(work(5)).is_none());
        let evicted = queue.pending_insert(work(5)).unwrap();
        assert_eq!(evicted.result, Status::Corrupted);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn pending_resolution_orders() {
        let mut queue = WorkQueue::new();
        queue.pending_insert(work(10));
        queue.pending_insert(work(11));
        queue.pending_insert(work(12));

        // By identity.
        assert_eq!(queue.pending_take(11).unwrap().frame_index(), 11);
        // By insertion order.
        assert_eq!(queue.pending_take_oldest().unwrap().frame_index(), 10);
        assert_eq!(queue.pending_oldest(), Some(12));
    }

    #[test]
    fn take_all_returns_queued_then_pending() {
        let mut queue = WorkQueue::new();
        queue.pending_insert(work(0));
        queue.push_work(work(1));
        queue.mark_drain(DrainMode::NoEos);
        queue.push_work(work(2));

        let all = queue.take_all();
        let indices: Vec<u64> = all.iter().map(|w| w.frame_index()).collect();
        assert_eq!(indices, vec![1, 2, 0]);
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn pending_flush_is_one_shot() {
        let mut queue = WorkQueue::new();
        assert!(!queue.take_pending_flush());
        queue.set_pending_flush();
        assert!(queue.take_pending_flush());
        assert!(!queue.take_pending_flush());
    }
}
