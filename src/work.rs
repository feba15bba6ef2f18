// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Work-item data model shared by the decoder and encoder pipelines.
//!
//! A work item pairs one input access unit (or raw frame) with one empty
//! worklet that the component fills before handing the item back to the
//! listener. Identity of a work item is its input `frame_index`; everything
//! in-flight is keyed by it.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use thiserror::Error;

use crate::buffer::{GraphicBlock, LinearBlock};
use crate::params::Param;

/// Status taxonomy surfaced through the component API and carried on
/// completed work.
#[derive(Error, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    #[error("ok")]
    Ok,
    #[error("operation not permitted in the current state")]
    BadState,
    #[error("argument rejected")]
    BadValue,
    #[error("out of memory or pool needs reconfiguration")]
    NoMemory,
    #[error("operation would block")]
    Blocking,
    #[error("engine unresponsive within the drain budget")]
    TimedOut,
    #[error("work belongs to a stale generation")]
    NotFound,
    #[error("optional feature not implemented")]
    Omitted,
    #[error("unrecoverable engine failure")]
    Corrupted,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

/// Bit set carried on both the input and the output side of a work item.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct WorkFlags(u32);

impl WorkFlags {
    /// The frame is decoded but must not be rendered.
    pub const DROP_FRAME: WorkFlags = WorkFlags(1 << 0);
    /// Terminal item of the stream.
    pub const END_OF_STREAM: WorkFlags = WorkFlags(1 << 1);
    /// The engine discarded the frame (error concealment or reorder drop).
    pub const DISCARD_FRAME: WorkFlags = WorkFlags(1 << 2);
    /// The worklet does not carry the full result for its input.
    pub const INCOMPLETE: WorkFlags = WorkFlags(1 << 3);
    /// The input carries codec-specific data only; no renderable output.
    pub const CODEC_CONFIG: WorkFlags = WorkFlags(1 << 6);
    /// Output geometry changed; a `PictureSize` update rides along.
    pub const INFO_CHANGE: WorkFlags = WorkFlags(1 << 7);

    pub const fn empty() -> Self {
        WorkFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        WorkFlags(bits)
    }

    pub const fn contains(&self, other: WorkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: WorkFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: WorkFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for WorkFlags {
    type Output = WorkFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        WorkFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for WorkFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for WorkFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkFlags({:#x})", self.0)
    }
}

/// Ordering information of a work item. `frame_index` is the stable identity
/// used as the pending-map key; `timestamp` is display time in microseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkOrdinal {
    pub frame_index: u64,
    pub timestamp: i64,
    pub custom_ordinal: i64,
}

impl WorkOrdinal {
    pub fn new(frame_index: u64, timestamp: i64) -> Self {
        Self { frame_index, timestamp, custom_ordinal: 0 }
    }
}

/// An output buffer produced by the component, with attached per-buffer
/// info (picture type, color aspects and the like).
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    pub block: OutputBlock,
    pub infos: Vec<Param>,
}

impl OutputBuffer {
    pub fn graphic(block: GraphicBlock) -> Self {
        Self { block: OutputBlock::Graphic(block), infos: Vec::new() }
    }

    pub fn linear(block: LinearBlock) -> Self {
        Self { block: OutputBlock::Linear(block), infos: Vec::new() }
    }

    pub fn with_info(mut self, info: Param) -> Self {
        self.infos.push(info);
        self
    }
}

#[derive(Clone, Debug)]
pub enum OutputBlock {
    Graphic(GraphicBlock),
    Linear(LinearBlock),
}

/// Input half of a work item.
#[derive(Clone, Debug, Default)]
pub struct WorkInput {
    pub ordinal: WorkOrdinal,
    pub flags: WorkFlags,
    pub buffers: Vec<Bytes>,
    pub config_updates: Vec<Param>,
}

/// Output placeholder, filled exactly once by the component.
#[derive(Clone, Debug, Default)]
pub struct Worklet {
    pub ordinal: WorkOrdinal,
    pub flags: WorkFlags,
    pub buffers: Vec<OutputBuffer>,
    pub config_updates: Vec<Param>,
}

/// One unit of the asynchronous pipeline.
#[derive(Clone, Debug, Default)]
pub struct Work {
    pub input: WorkInput,
    pub worklet: Worklet,
    /// One-in-one-out marker: 1 once the worklet has been filled.
    pub worklets_processed: u32,
    pub result: Status,
}

impl Work {
    pub fn new(input: WorkInput) -> Self {
        Self { input, ..Default::default() }
    }

    pub fn frame_index(&self) -> u64 {
        self.input.ordinal.frame_index
    }

    /// Fill the worklet with an empty output echoing the input ordinal. Used
    /// for codec-config echoes, dropped frames and error returns.
    pub fn fill_empty(&mut self) {
        let eos = self.input.flags.contains(WorkFlags::END_OF_STREAM);
        self.worklet.flags = if eos { WorkFlags::END_OF_STREAM } else { WorkFlags::empty() };
        self.worklet.buffers.clear();
        self.worklet.ordinal = self.input.ordinal;
        self.worklets_processed = 1;
    }

    /// Fill the worklet with one output buffer, echoing the input ordinal.
    pub fn fill_output(&mut self, buffer: OutputBuffer, flags: WorkFlags) {
        self.worklet.flags = flags;
        self.worklet.buffers.clear();
        self.worklet.buffers.push(buffer);
        self.worklet.ordinal = self.input.ordinal;
        self.worklets_processed = 1;
    }
}

/// Drain request accompanying a drain marker in the work queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DrainMode {
    #[default]
    NoDrain,
    /// Drain and terminate the stream with an EOS worklet.
    WithEos,
    /// Drain but keep the stream open.
    NoEos,
    /// Drain into a chained component. Unsupported; rejected with
    /// [`Status::Omitted`].
    Chain,
}
