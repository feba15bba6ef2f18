// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Graphic/linear blocks, the external block-pool contract and the decoder's
//! output-buffer registry.
//!
//! Blocks are allocated by a host-owned pool and travel between three
//! parties: the registry (which teaches them to the engine once and tracks
//! ownership), the engine (which renders into them) and the host (which
//! consumes and eventually releases them). The registry is the single point
//! of truth for who currently owns each buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::work::Status;
use crate::RawFormat;
use crate::Resolution;

/// Metadata carried by a gralloc-style native handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeHandle {
    /// Stable identity of the underlying allocation; survives import/export.
    pub buffer_id: u32,
    pub width: u32,
    pub height: u32,
    pub format: RawFormat,
    pub usage: u64,
    /// Pixels per row of the Y plane.
    pub stride: u32,
    /// Rows allocated for the Y plane.
    pub ver_stride: u32,
    pub generation: u32,
    pub bq_id: u64,
    pub bq_slot: u32,
    pub size: usize,
}

/// Crop rectangle applied to a graphic block before display.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A 2D buffer vended by the block pool. Cheap to clone; the pixel storage
/// is shared.
#[derive(Clone, Debug)]
pub struct GraphicBlock {
    handle: NativeHandle,
    crop: Rect,
    data: Arc<Mutex<Vec<u8>>>,
}

impl GraphicBlock {
    pub fn new(handle: NativeHandle) -> Self {
        let size = handle.size;
        let crop = Rect { x: 0, y: 0, width: handle.width, height: handle.height };
        Self { handle, crop, data: Arc::new(Mutex::new(vec![0u8; size])) }
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    pub fn crop(&self) -> Rect {
        self.crop
    }

    pub fn set_crop(&mut self, crop: Rect) {
        self.crop = crop;
    }

    pub fn map(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }
}

/// A 1D buffer vended by the block pool for compressed output.
#[derive(Clone, Debug)]
pub struct LinearBlock {
    capacity: usize,
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl LinearBlock {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, len: 0, data: Arc::new(Mutex::new(vec![0u8; capacity])) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `bytes` into the block and set the readable range.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Status> {
        if bytes.len() > self.capacity {
            return Err(Status::BadValue);
        }
        self.data.lock().unwrap()[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    pub fn map(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }
}

/// Host-owned allocator contract. Either fetch may report
/// [`Status::Blocking`] when the pool has momentarily run dry.
pub trait BlockPool: Send {
    fn fetch_graphic_block(
        &mut self,
        size: Resolution,
        format: RawFormat,
        usage: u64,
    ) -> Result<GraphicBlock, Status>;

    fn fetch_linear_block(&mut self, capacity: usize, usage: u64) -> Result<LinearBlock, Status>;
}

const POOL_FETCH_RETRY_MAX: u32 = 1000;
const POOL_FETCH_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Busy-retry adapter turning [`Status::Blocking`] into a bounded spin.
/// Exhausting the budget surfaces [`Status::Corrupted`], never an unbounded
/// wait.
pub struct BlockingPool {
    inner: Box<dyn BlockPool>,
}

impl BlockingPool {
    pub fn new(inner: Box<dyn BlockPool>) -> Self {
        Self { inner }
    }

    pub fn fetch_graphic_block(
        &mut self,
        size: Resolution,
        format: RawFormat,
        usage: u64,
    ) -> Result<GraphicBlock, Status> {
        let mut retry = 0;
        loop {
            match self.inner.fetch_graphic_block(size, format, usage) {
                Err(Status::Blocking) => {
                    retry += 1;
                    if retry > POOL_FETCH_RETRY_MAX {
                        log::error!("graphic block fetch stuck after {} retries", retry - 1);
                        return Err(Status::Corrupted);
                    }
                    std::thread::sleep(POOL_FETCH_RETRY_PAUSE);
                }
                other => return other,
            }
        }
    }

    pub fn fetch_linear_block(&mut self, capacity: usize, usage: u64) -> Result<LinearBlock, Status> {
        let mut retry = 0;
        loop {
            match self.inner.fetch_linear_block(capacity, usage) {
                Err(Status::Blocking) => {
                    retry += 1;
                    if retry > POOL_FETCH_RETRY_MAX {
                        log::error!("linear block fetch stuck after {} retries", retry - 1);
                        return Err(Status::Corrupted);
                    }
                    std::thread::sleep(POOL_FETCH_RETRY_PAUSE);
                }
                other => return other,
            }
        }
    }
}

/// Reference pool implementation vending from a fixed set of slots with
/// stable buffer ids, the way a buffer-queue-backed allocator behaves. Hosts
/// bring their own pool; this one backs the test suite and standalone use.
pub struct SlotPool {
    slots: u32,
    next_slot: u32,
    next_linear_id: u32,
    /// When set, the next `blocking_budget` fetches report `Blocking`.
    blocking_budget: u32,
}

impl SlotPool {
    pub fn new(slots: u32) -> Self {
        Self { slots, next_slot: 0, next_linear_id: 0, blocking_budget: 0 }
    }

    /// Make the next `count` fetches report [`Status::Blocking`].
    pub fn set_blocking_budget(&mut self, count: u32) {
        self.blocking_budget = count;
    }
}

impl BlockPool for SlotPool {
    fn fetch_graphic_block(
        &mut self,
        size: Resolution,
        format: RawFormat,
        usage: u64,
    ) -> Result<GraphicBlock, Status> {
        if self.blocking_budget > 0 {
            self.blocking_budget -= 1;
            return Err(Status::Blocking);
        }
        let slot = self.next_slot % self.slots;
        self.next_slot = self.next_slot.wrapping_add(1);
        let stride = crate::utils::align(size.width, 16);
        let ver_stride = crate::utils::align(size.height, 8);
        let handle = NativeHandle {
            buffer_id: slot,
            width: size.width,
            height: size.height,
            format,
            usage,
            stride,
            ver_stride,
            generation: 0,
            bq_id: 1,
            bq_slot: slot,
            size: format.frame_size(stride as usize, ver_stride as usize),
        };
        Ok(GraphicBlock::new(handle))
    }

    fn fetch_linear_block(&mut self, capacity: usize, _usage: u64) -> Result<LinearBlock, Status> {
        if self.blocking_budget > 0 {
            self.blocking_budget -= 1;
            return Err(Status::Blocking);
        }
        self.next_linear_id = self.next_linear_id.wrapping_add(1);
        Ok(LinearBlock::new(capacity))
    }
}

/// One entry of the decoder's output-buffer registry.
#[derive(Clone, Debug)]
pub struct OutBufferRecord {
    pub buffer_id: u32,
    pub size: usize,
    /// Slot index the engine was taught for this buffer.
    pub engine_handle: u32,
    pub block: GraphicBlock,
    /// true while the engine may write into the buffer; false once the
    /// matching frame was handed to the client.
    pub owned_by_decoder: bool,
}

/// Bidirectional map between client graphic blocks and engine buffer slots.
/// All access is serialized by the owner's mutex; the registry itself is a
/// plain map.
#[derive(Default)]
pub struct BufferRegistry {
    records: HashMap<u32, OutBufferRecord>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of buffers the engine currently owns.
    pub fn owned_count(&self) -> usize {
        self.records.values().filter(|r| r.owned_by_decoder).count()
    }

    pub fn get(&self, buffer_id: u32) -> Option<&OutBufferRecord> {
        self.records.get(&buffer_id)
    }

    /// Register or refresh a freshly fetched block and hand it to the
    /// engine. Returns the engine slot the block maps to.
    ///
    /// A known `buffer_id` means the allocator re-mapped the same slot; the
    /// stored block reference is replaced and the engine just gets the
    /// existing slot re-submitted. A new `buffer_id` is taught to the engine
    /// once.
    pub fn import<F>(&mut self, block: GraphicBlock, mut register: F) -> Result<u32, Status>
    where
        F: FnMut(&NativeHandle) -> Result<u32, Status>,
    {
        let buffer_id = block.handle().buffer_id;
        match self.records.get_mut(&buffer_id) {
            Some(record) => {
                record.block = block;
                record.owned_by_decoder = true;
                Ok(record.engine_handle)
            }
            None => {
                let engine_handle = register(block.handle())?;
                let size = block.handle().size;
                self.records.insert(
                    buffer_id,
                    OutBufferRecord {
                        buffer_id,
                        size,
                        engine_handle,
                        block,
                        owned_by_decoder: true,
                    },
                );
                log::debug!("registered buffer {} as engine slot {}", buffer_id, engine_handle);
                Ok(engine_handle)
            }
        }
    }

    /// The engine emitted a frame into `buffer_id`; ownership moves to the
    /// client. Returns the block to wrap into the outbound worklet.
    pub fn take_for_client(&mut self, buffer_id: u32) -> Option<GraphicBlock> {
        let record = self.records.get_mut(&buffer_id)?;
        record.owned_by_decoder = false;
        Some(record.block.clone())
    }

    /// Same as [`BufferRegistry::take_for_client`], keyed by the engine slot
    /// the frame was reported in.
    pub fn take_for_client_by_slot(&mut self, slot: u32) -> Option<(u32, GraphicBlock)> {
        let record = self.records.values_mut().find(|r| r.engine_handle == slot)?;
        record.owned_by_decoder = false;
        Some((record.buffer_id, record.block.clone()))
    }

    /// Engine slots of every buffer the decoder currently owns.
    pub fn owned_slots(&self) -> Vec<u32> {
        self.records.values().filter(|r| r.owned_by_decoder).map(|r| r.engine_handle).collect()
    }

    /// Engine slots of every registered buffer, regardless of ownership.
    pub fn all_slots(&self) -> Vec<u32> {
        self.records.values().map(|r| r.engine_handle).collect()
    }

    /// The client released a buffer; it may be re-submitted to the engine.
    pub fn submit_to_decoder(&mut self, buffer_id: u32) -> bool {
        match self.records.get_mut(&buffer_id) {
            Some(record) => {
                record.owned_by_decoder = true;
                true
            }
            None => false,
        }
    }

    /// Drop every record. Buffers held by the client survive through their
    /// own references until the host releases them.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(pool: &mut SlotPool) -> GraphicBlock {
        pool.fetch_graphic_block(Resolution::new(320, 240), RawFormat::Nv12, 0).unwrap()
    }

    #[test]
    fn slot_pool_stable_ids() {
        let mut pool = SlotPool::new(4);
        let ids: Vec<u32> = (0..8).map(|_| fetch(&mut pool).handle().buffer_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn import_registers_once_per_buffer_id() {
        let mut registry = BufferRegistry::new();
        let mut pool = SlotPool::new(2);
        let mut registered = 0;

        for _ in 0..6 {
            let block = fetch(&mut pool);
            registry
                .import(block, |handle| {
                    registered += 1;
                    Ok(handle.buffer_id + 100)
                })
                .unwrap();
        }

        assert_eq!(registered, 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.owned_count(), 2);
    }

    #[test]
    fn ownership_round_trip() {
        let mut registry = BufferRegistry::new();
        let mut pool = SlotPool::new(1);
        registry.import(fetch(&mut pool), |h| Ok(h.buffer_id)).unwrap();

        assert!(registry.take_for_client(0).is_some());
        assert_eq!(registry.owned_count(), 0);
        assert!(registry.submit_to_decoder(0));
        assert_eq!(registry.owned_count(), 1);
        assert!(!registry.submit_to_decoder(42));
    }

    #[test]
    fn blocking_pool_bounded_spin() {
        let mut inner = SlotPool::new(2);
        inner.set_blocking_budget(3);
        let mut pool = BlockingPool::new(Box::new(inner));
        // Three blocked attempts, then success.
        assert!(pool
            .fetch_graphic_block(Resolution::new(64, 64), RawFormat::Nv12, 0)
            .is_ok());
    }

    #[test]
    fn linear_block_write_bounds() {
        let mut block = LinearBlock::new(8);
        assert!(block.write(&[1, 2, 3]).is_ok());
        assert_eq!(block.len(), 3);
        assert_eq!(block.map()[..3], [1, 2, 3]);
        assert_eq!(block.write(&[0u8; 16]), Err(Status::BadValue));
    }
}
