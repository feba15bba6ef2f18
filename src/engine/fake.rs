// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scripted in-memory engine.
//!
//! Behaves like a well-mannered vendor engine with deterministic timing:
//! every packet put produces exactly one frame on the next poll, every frame
//! put produces one packet. Tests script edge behavior (info changes,
//! blocking, decode errors, oversized packets) through the builder-style
//! setters.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::buffer::NativeHandle;
use crate::engine::{
    DecControl, DecodeEngine, EncCfg, EncodeEngine, EngineCodedPacket, EngineFrame,
    EngineFrameDesc, EnginePacket, FrameMeta, FrameModes,
};
use crate::work::Status;
use crate::CodedFormat;
use crate::RawFormat;
use crate::Resolution;

#[derive(Default)]
struct SlotState {
    armed: bool,
}

/// Scripted decode engine.
pub struct FakeDecodeEngine {
    coding: Option<CodedFormat>,
    geometry: Resolution,
    format: RawFormat,
    slots: HashMap<u32, SlotState>,
    next_slot: u32,
    packets: VecDeque<EnginePacket>,
    pictures_emitted: u64,
    awaiting_info_ready: bool,
    /// (emit after N pictures, new geometry)
    scheduled_info_change: Option<(u64, Resolution)>,
    /// Emit an info-change frame before the first picture.
    initial_info_change: bool,
    /// Value `initial_info_change` rearms to on (re)init.
    announce_geometry: bool,
    error_pts: HashSet<i64>,
    discard_pts: HashSet<i64>,
    zero_dts: bool,
    deinterlace: bool,
    internal_pool: bool,
    blocking_budget: u32,
    iso_color: Option<crate::utils::IsoColorDescription>,
    controls: Vec<DecControl>,
}

impl FakeDecodeEngine {
    pub fn new(geometry: Resolution) -> Self {
        Self {
            coding: None,
            geometry,
            format: RawFormat::Nv12,
            slots: HashMap::new(),
            next_slot: 0,
            packets: VecDeque::new(),
            pictures_emitted: 0,
            awaiting_info_ready: false,
            scheduled_info_change: None,
            initial_info_change: true,
            announce_geometry: true,
            error_pts: HashSet::new(),
            discard_pts: HashSet::new(),
            zero_dts: false,
            deinterlace: false,
            internal_pool: false,
            blocking_budget: 0,
            iso_color: None,
            controls: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: RawFormat) -> Self {
        self.format = format;
        self
    }

    /// Skip the initial info-change handshake (streams the engine can size
    /// from the first packet alone).
    pub fn without_initial_info_change(mut self) -> Self {
        self.initial_info_change = false;
        self.announce_geometry = false;
        self
    }

    pub fn schedule_info_change(&mut self, after_pictures: u64, new_size: Resolution) {
        self.scheduled_info_change = Some((after_pictures, new_size));
    }

    pub fn script_error(&mut self, pts: i64) {
        self.error_pts.insert(pts);
    }

    pub fn script_discard(&mut self, pts: i64) {
        self.discard_pts.insert(pts);
    }

    pub fn set_zero_dts(&mut self, on: bool) {
        self.zero_dts = on;
    }

    pub fn set_deinterlace(&mut self, on: bool) {
        self.deinterlace = on;
    }

    pub fn set_blocking_budget(&mut self, count: u32) {
        self.blocking_budget = count;
    }

    pub fn set_iso_color(&mut self, iso: crate::utils::IsoColorDescription) {
        self.iso_color = Some(iso);
    }

    pub fn armed_slots(&self) -> usize {
        self.slots.values().filter(|s| s.armed).count()
    }

    pub fn registered_slots(&self) -> usize {
        self.slots.len()
    }

    /// Every control command received since creation, in order.
    pub fn received_controls(&self) -> &[DecControl] {
        &self.controls
    }

    fn take_armed_slot(&mut self) -> Option<u32> {
        let slot = self
            .slots
            .iter()
            .filter(|(_, state)| state.armed)
            .map(|(&slot, _)| slot)
            .min()?;
        self.slots.get_mut(&slot).unwrap().armed = false;
        Some(slot)
    }

    /// Byte stride of one row; packed 10-bit rows carry 5 bytes per 4
    /// pixels.
    fn hor_stride(&self, width: u32) -> u32 {
        if self.format == RawFormat::Nv12_10 {
            crate::utils::align(width * 10 / 8, 16)
        } else {
            crate::utils::align(width, 16)
        }
    }

    fn info_change_frame(&self, size: Resolution) -> EngineFrame {
        EngineFrame {
            size,
            hor_stride: self.hor_stride(size.width),
            ver_stride: crate::utils::align(size.height, 8),
            format: self.format,
            info_change: true,
            ..Default::default()
        }
    }
}

impl DecodeEngine for FakeDecodeEngine {
    fn init(&mut self, coding: CodedFormat) -> Result<(), Status> {
        self.coding = Some(coding);
        // A fresh session re-announces the stream geometry.
        self.initial_info_change = self.announce_geometry;
        self.packets.clear();
        self.pictures_emitted = 0;
        self.awaiting_info_ready = false;
        Ok(())
    }

    fn put_packet(&mut self, packet: EnginePacket) -> Result<(), Status> {
        if self.coding.is_none() {
            return Err(Status::BadState);
        }
        if self.blocking_budget > 0 {
            self.blocking_budget -= 1;
            return Err(Status::Blocking);
        }
        self.packets.push_back(packet);
        Ok(())
    }

    fn get_frame(&mut self) -> Result<Option<EngineFrame>, Status> {
        if self.awaiting_info_ready {
            return Ok(None);
        }

        loop {
            let packet = match self.packets.front() {
                Some(p) => p.clone(),
                None => return Ok(None),
            };

            if packet.extra_data {
                // Header payload; the first one sizes the stream.
                self.packets.pop_front();
                if self.initial_info_change {
                    self.initial_info_change = false;
                    self.awaiting_info_ready = true;
                    return Ok(Some(self.info_change_frame(self.geometry)));
                }
                continue;
            }

            if let Some((after, new_size)) = self.scheduled_info_change {
                if self.pictures_emitted >= after {
                    self.scheduled_info_change = None;
                    self.geometry = new_size;
                    self.awaiting_info_ready = true;
                    return Ok(Some(self.info_change_frame(new_size)));
                }
            }

            if packet.eos && packet.data.is_empty() {
                self.packets.pop_front();
                return Ok(Some(EngineFrame { eos: true, ..Default::default() }));
            }

            let (slot, data) = if self.internal_pool {
                let size = self.format.frame_size(
                    self.hor_stride(self.geometry.width) as usize,
                    crate::utils::align(self.geometry.height, 8) as usize,
                );
                (None, Some(Bytes::from(vec![0u8; size])))
            } else {
                match self.take_armed_slot() {
                    Some(slot) => (Some(slot), None),
                    // Starved; decoding stalls until a buffer arrives.
                    None => return Ok(None),
                }
            };

            self.packets.pop_front();
            self.pictures_emitted += 1;

            let mut modes = FrameModes::default();
            if self.deinterlace {
                modes = FrameModes::DEINTERLACED;
            }

            return Ok(Some(EngineFrame {
                size: self.geometry,
                hor_stride: self.hor_stride(self.geometry.width),
                ver_stride: crate::utils::align(self.geometry.height, 8),
                format: self.format,
                pts: packet.pts,
                dts: if self.zero_dts { 0 } else { packet.dts },
                eos: packet.eos,
                errinfo: self.error_pts.contains(&packet.pts),
                discard: self.discard_pts.contains(&packet.pts),
                info_change: false,
                modes,
                slot,
                data,
                iso_color: self.iso_color,
            }));
        }
    }

    fn register_buffer(&mut self, _handle: &NativeHandle) -> Result<u32, Status> {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(slot, SlotState { armed: false });
        Ok(slot)
    }

    fn submit_buffer(&mut self, slot: u32) -> Result<(), Status> {
        match self.slots.get_mut(&slot) {
            Some(state) => {
                state.armed = true;
                Ok(())
            }
            None => Err(Status::BadValue),
        }
    }

    fn release_buffer(&mut self, slot: u32) -> Result<(), Status> {
        match self.slots.get_mut(&slot) {
            Some(state) => {
                state.armed = false;
                Ok(())
            }
            None => Err(Status::BadValue),
        }
    }

    fn set_info_change_ready(&mut self) -> Result<(), Status> {
        self.awaiting_info_ready = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Status> {
        self.packets.clear();
        for state in self.slots.values_mut() {
            state.armed = false;
        }
        Ok(())
    }

    fn control(&mut self, cmd: DecControl) -> Result<(), Status> {
        if let DecControl::InternalPoolMode(on) = cmd {
            self.internal_pool = on;
        }
        self.controls.push(cmd);
        Ok(())
    }
}

/// Scripted encode engine.
pub struct FakeEncodeEngine {
    coding: Option<CodedFormat>,
    cfg: EncCfg,
    frames: VecDeque<EngineFrameDesc>,
    input_count: u64,
    frames_since_idr: u64,
    sync_requested: bool,
    blocking_budget: u32,
    oversize_pts: HashSet<i64>,
    /// pts -> polls left before the oversized packet is surfaced.
    reenc_in_flight: HashMap<i64, u32>,
    last_meta: Option<FrameMeta>,
}

impl FakeEncodeEngine {
    pub fn new() -> Self {
        Self {
            coding: None,
            cfg: EncCfg::new(),
            frames: VecDeque::new(),
            input_count: 0,
            frames_since_idr: 0,
            sync_requested: false,
            blocking_budget: 0,
            oversize_pts: HashSet::new(),
            reenc_in_flight: HashMap::new(),
            last_meta: None,
        }
    }

    pub fn set_blocking_budget(&mut self, count: u32) {
        self.blocking_budget = count;
    }

    /// Mark a frame (by pts) as producing an oversized packet, exercising
    /// the large-frame re-encode path.
    pub fn script_oversize(&mut self, pts: i64) {
        self.oversize_pts.insert(pts);
    }

    pub fn applied_config(&self) -> &EncCfg {
        &self.cfg
    }

    /// Side-channel metadata of the most recently accepted frame.
    pub fn last_frame_meta(&self) -> Option<&FrameMeta> {
        self.last_meta.as_ref()
    }

    fn gop(&self) -> u64 {
        self.cfg.get_i32("rc:gop").map(|g| g.max(1) as u64).unwrap_or(30)
    }
}

impl Default for FakeEncodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeEngine for FakeEncodeEngine {
    fn init(&mut self, coding: CodedFormat) -> Result<(), Status> {
        self.coding = Some(coding);
        Ok(())
    }

    fn apply_config(&mut self, cfg: &EncCfg) -> Result<(), Status> {
        // Real engines treat every apply as an overlay on the session state.
        self.cfg.merge(cfg);
        Ok(())
    }

    fn get_header(&mut self) -> Result<Bytes, Status> {
        let coding = self.coding.ok_or(Status::BadState)?;
        let mut header = vec![0u8, 0, 0, 1];
        header.extend_from_slice(coding.to_string().as_bytes());
        Ok(Bytes::from(header))
    }

    fn put_frame(&mut self, frame: EngineFrameDesc) -> Result<(), Status> {
        if self.coding.is_none() {
            return Err(Status::BadState);
        }
        if self.blocking_budget > 0 {
            self.blocking_budget -= 1;
            return Err(Status::Blocking);
        }
        self.last_meta = Some(frame.meta.clone());
        self.frames.push_back(frame);
        Ok(())
    }

    fn get_packet(&mut self) -> Result<Option<EngineCodedPacket>, Status> {
        let frame = match self.frames.front() {
            Some(f) => f.clone(),
            None => return Ok(None),
        };

        // Large-frame re-encode: hold the packet back for the configured
        // number of attempts, then emit it anyway.
        if self.cfg.get_u32("sp:mode") == Some(2) && self.oversize_pts.contains(&frame.pts) {
            let budget = self.cfg.get_u32("sp:reenc_times").unwrap_or(1);
            let left = self.reenc_in_flight.entry(frame.pts).or_insert(budget);
            if *left > 0 {
                *left -= 1;
                return Ok(None);
            }
            self.reenc_in_flight.remove(&frame.pts);
        }

        self.frames.pop_front();

        if frame.eos && frame.data.is_none() && frame.size.get_area() == 0 {
            return Ok(Some(EngineCodedPacket { eos: true, pts: frame.pts, ..Default::default() }));
        }

        // Layer ids come from the compiled reference cycle, not from any
        // knowledge of the layering scheme.
        let layer_count = self.cfg.get_u32("ref:tsvc_layers").unwrap_or(1);
        let cycle_len = self.cfg.get_u32("ref:cycle_len").unwrap_or(1).clamp(1, 8);
        let slot = (self.input_count % cycle_len as u64) as usize;
        let temporal_id = self
            .cfg
            .get_u32(crate::encoder_config::REF_SLOT_TID[slot])
            .unwrap_or(0);

        let intra = self.frames_since_idr % self.gop() == 0
            || self.sync_requested
            || frame.meta.force_idr;
        if intra {
            self.frames_since_idr = 0;
            self.sync_requested = false;
        }
        self.frames_since_idr += 1;
        self.input_count += 1;

        let payload_len = if self.oversize_pts.contains(&frame.pts) { 4096 } else { 256 };

        Ok(Some(EngineCodedPacket {
            data: Bytes::from(vec![0xAB; payload_len]),
            pts: frame.pts,
            eos: frame.eos,
            intra,
            temporal_id: if layer_count > 1 { Some(temporal_id) } else { None },
        }))
    }

    fn request_sync_frame(&mut self) -> Result<(), Status> {
        self.sync_requested = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Status> {
        self.frames.clear();
        self.reenc_in_flight.clear();
        self.input_count = 0;
        self.frames_since_idr = 0;
        self.sync_requested = false;
        Ok(())
    }
}
