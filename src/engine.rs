// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract between the component adapters and the vendor video processing
//! engine.
//!
//! The engine surface is deliberately minimal: packet/frame exchange, a
//! key/value configuration store applied in one shot, a handful of control
//! commands and buffer-group registration for the decoder. The adapters
//! never assume anything about the engine's internal threading; all exchange
//! is poll based.

pub mod fake;

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::buffer::NativeHandle;
use crate::work::Status;
use crate::CodedFormat;
use crate::RawFormat;
use crate::Resolution;

/// A compressed access unit handed to the decode engine.
#[derive(Clone, Debug, Default)]
pub struct EnginePacket {
    pub data: Bytes,
    /// Display timestamp in microseconds.
    pub pts: i64,
    /// Unused by the engine's own timing; carries `frame_index + 1` so the
    /// engine echoes work identity back on the matching frame. Zero means
    /// "no DTS".
    pub dts: i64,
    pub eos: bool,
    /// The payload is codec-specific data, not a picture.
    pub extra_data: bool,
}

/// Mode bits reported on a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameModes(pub u32);

impl FrameModes {
    pub const DEINTERLACED: FrameModes = FrameModes(1 << 0);

    pub const fn contains(&self, other: FrameModes) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A decoded frame surfaced by the engine.
#[derive(Clone, Debug)]
pub struct EngineFrame {
    pub size: Resolution,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub format: RawFormat,
    pub pts: i64,
    pub dts: i64,
    pub eos: bool,
    /// The engine flagged decode errors on this frame.
    pub errinfo: bool,
    /// The engine asks for this frame to be discarded.
    pub discard: bool,
    /// Geometry/format changed; no picture carried.
    pub info_change: bool,
    pub modes: FrameModes,
    /// Engine buffer slot the picture landed in; `None` for info-change and
    /// buffer-less EOS frames, or when the engine decoded into its own pool.
    pub slot: Option<u32>,
    /// Pixel data when the engine decoded into its internal pool
    /// (buffer-mode output path).
    pub data: Option<Bytes>,
    /// ISO color description parsed from the VUI, when present.
    pub iso_color: Option<crate::utils::IsoColorDescription>,
}

impl Default for EngineFrame {
    fn default() -> Self {
        Self {
            size: Resolution::default(),
            hor_stride: 0,
            ver_stride: 0,
            format: RawFormat::Nv12,
            pts: 0,
            dts: 0,
            eos: false,
            errinfo: false,
            discard: false,
            info_change: false,
            modes: FrameModes::default(),
            slot: None,
            data: None,
            iso_color: None,
        }
    }
}

/// Decoder control commands.
#[derive(Clone, Debug, PartialEq)]
pub enum DecControl {
    /// Enable immediate output of display-ready frames.
    ImmediateOut(bool),
    /// Do not mark concealed frames as errored.
    DisableErrorMark(bool),
    /// Skip DPB conformance checks.
    DisableDpbCheck(bool),
    /// Low-latency splitting of input access units.
    LowLatency(bool),
    /// Ask the engine to output into its internal pool instead of the
    /// registered buffer group.
    InternalPoolMode(bool),
}

/// Decode engine surface.
pub trait DecodeEngine: Send {
    fn init(&mut self, coding: CodedFormat) -> Result<(), Status>;

    /// May return [`Status::Blocking`] when the input channel is full.
    fn put_packet(&mut self, packet: EnginePacket) -> Result<(), Status>;

    /// Non-blocking; `None` when no frame is ready.
    fn get_frame(&mut self) -> Result<Option<EngineFrame>, Status>;

    /// Teach the engine one external buffer; returns the engine slot.
    fn register_buffer(&mut self, handle: &NativeHandle) -> Result<u32, Status>;

    /// Re-arm a known slot for engine writing.
    fn submit_buffer(&mut self, slot: u32) -> Result<(), Status>;

    /// The client took the buffer; the engine must stop using the slot.
    fn release_buffer(&mut self, slot: u32) -> Result<(), Status>;

    /// Acknowledge an info-change frame once the buffer group has been
    /// reprovisioned; decoding resumes after this call.
    fn set_info_change_ready(&mut self) -> Result<(), Status>;

    /// Drop all in-flight state but keep the session configured.
    fn reset(&mut self) -> Result<(), Status>;

    fn control(&mut self, cmd: DecControl) -> Result<(), Status>;
}

/// A raw frame descriptor handed to the encode engine. The pixel storage is
/// either shared via `data` or already engine-visible (scratch DMA), in
/// which case only the geometry matters.
#[derive(Clone, Debug, Default)]
pub struct EngineFrameDesc {
    pub data: Option<Bytes>,
    pub size: Resolution,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub format: RawFormat,
    /// Carries the work's `frame_index`; echoed back as the packet PTS.
    pub pts: i64,
    pub eos: bool,
    pub meta: FrameMeta,
}

/// Per-frame side-channel metadata.
#[derive(Clone, Debug, Default)]
pub struct FrameMeta {
    pub mark_ltr: Option<i32>,
    pub use_ltr: Option<i32>,
    pub frame_qp: Option<i32>,
    pub base_layer_pid: Option<i32>,
    pub slice_mbs: Option<i32>,
    /// Quantized ROI map, one 16-bit word per CTU (force-intra and QP-mode
    /// bits plus the signed QP byte).
    pub roi_map: Option<Bytes>,
    pub force_idr: bool,
}

impl FrameMeta {
    pub fn is_empty(&self) -> bool {
        self.mark_ltr.is_none()
            && self.use_ltr.is_none()
            && self.frame_qp.is_none()
            && self.base_layer_pid.is_none()
            && self.slice_mbs.is_none()
            && self.roi_map.is_none()
            && !self.force_idr
    }
}

/// A coded packet produced by the encode engine.
#[derive(Clone, Debug, Default)]
pub struct EngineCodedPacket {
    pub data: Bytes,
    /// Echo of the submitted frame's `pts` (the work `frame_index`).
    pub pts: i64,
    pub eos: bool,
    pub intra: bool,
    pub temporal_id: Option<u32>,
}

/// Encode engine surface.
pub trait EncodeEngine: Send {
    fn init(&mut self, coding: CodedFormat) -> Result<(), Status>;

    /// Apply a full configuration snapshot. Keys the engine does not know
    /// are rejected with [`Status::BadValue`].
    fn apply_config(&mut self, cfg: &EncCfg) -> Result<(), Status>;

    /// Codec-specific headers (SPS/PPS or equivalent) for the current
    /// configuration.
    fn get_header(&mut self) -> Result<Bytes, Status>;

    /// May return [`Status::Blocking`] when the input channel is full.
    fn put_frame(&mut self, frame: EngineFrameDesc) -> Result<(), Status>;

    /// Non-blocking; `None` when no packet is ready.
    fn get_packet(&mut self) -> Result<Option<EngineCodedPacket>, Status>;

    /// Force the next submitted frame to be a sync frame.
    fn request_sync_frame(&mut self) -> Result<(), Status>;

    fn reset(&mut self) -> Result<(), Status>;
}

/// A picture region reported by an external detector, with a confidence
/// score in `0.0..=1.0`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DetectRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub score: f32,
}

/// External region-detection runtime behind the NN-driven super-encoding
/// mode. Sessions run on their own cadence; the encoder never waits on one.
/// A frame submitted while the session is busy simply goes unanalyzed.
pub trait DetectSession: Send {
    /// Hand a frame to the detector. Returns [`Status::Blocking`] while a
    /// previous frame is still being analyzed.
    fn submit(&mut self, data: &Bytes, size: Resolution) -> Result<(), Status>;

    /// Most recent finished detection; `None` while none is ready.
    fn poll_regions(&mut self) -> Option<Vec<DetectRegion>>;
}

/// A staged configuration value.
#[derive(Clone, Debug, PartialEq)]
pub enum CfgValue {
    I32(i32),
    U32(u32),
    F32(f32),
    Str(&'static str),
}

/// Key/value staging area mirroring the engine's configuration namespace
/// (`rc:gop`, `prep:format`, ...). The compiler fills it; the engine
/// consumes it atomically through [`EncodeEngine::apply_config`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncCfg {
    entries: BTreeMap<&'static str, CfgValue>,
}

impl EncCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_i32(&mut self, key: &'static str, value: i32) {
        self.entries.insert(key, CfgValue::I32(value));
    }

    pub fn set_u32(&mut self, key: &'static str, value: u32) {
        self.entries.insert(key, CfgValue::U32(value));
    }

    pub fn set_f32(&mut self, key: &'static str, value: f32) {
        self.entries.insert(key, CfgValue::F32(value));
    }

    pub fn set_str(&mut self, key: &'static str, value: &'static str) {
        self.entries.insert(key, CfgValue::Str(value));
    }

    pub fn get(&self, key: &str) -> Option<&CfgValue> {
        self.entries.get(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(CfgValue::I32(v)) => Some(*v),
            Some(CfgValue::U32(v)) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.entries.get(key) {
            Some(CfgValue::U32(v)) => Some(*v),
            Some(CfgValue::I32(v)) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        match self.entries.get(key) {
            Some(CfgValue::F32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&'static str> {
        match self.entries.get(key) {
            Some(CfgValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Overlay `other` on top of this configuration, key by key.
    pub fn merge(&mut self, other: &EncCfg) {
        for (&key, value) in other.entries.iter() {
            self.entries.insert(key, value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &CfgValue)> {
        self.entries.iter()
    }
}
