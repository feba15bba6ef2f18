// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder pipeline: packet submission with work-identity smuggling, the
//! output buffer choreography against the block pool, and frame-to-work
//! resolution.
//!
//! Work identity travels through the engine in the packet DTS field as
//! `frame_index + 1` (zero is reserved for "no DTS"), and comes back on the
//! matching decoded frame. Streams that cannot carry it (zero timestamps,
//! deinterlaced output) fall back to insertion-order resolution.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::buffer::{BlockPool, BlockingPool, BufferRegistry, Rect};
use crate::caps::{ChipCapInfo, FbcMode};
use crate::component::{ErrorCb, PipelineWorker, WorkDoneCb};
use crate::engine::{DecControl, DecodeEngine, EngineFrame, EnginePacket};
use crate::engine::FrameModes;
use crate::inspect;
use crate::params::{ColorAspects, ColorMatrix, ColorPrimaries, ColorRange, ColorTransfer, Param};
use crate::params::Params;
use crate::utils;
use crate::work::{DrainMode, OutputBuffer, Status, Work, WorkFlags};
use crate::work_queue::WorkQueue;
use crate::{CodedFormat, RawFormat, Resolution};

const PACKET_RETRY_MAX: u32 = 1000;
const PACKET_RETRY_PAUSE: Duration = Duration::from_millis(3);
/// Every this many blocked sends, re-run the buffer/output choreography to
/// unwedge the engine.
const PACKET_RETRY_PROBE: u32 = 200;
/// Wall-clock budget for an end-of-stream drain.
const DRAIN_EOS_BUDGET: Duration = Duration::from_secs(2);
/// In insertion-order mode, more in-flight work than this means the engine
/// swallowed frames; the oldest items are returned incomplete.
const STUCK_PENDING_MAX: usize = 5;
/// Frames drained from the engine per tick.
const OUTPUT_DRAIN_CAP: u32 = 16;

/// Host-side handle for returning display buffers to the decoder.
#[derive(Clone)]
pub struct OutputBufferReleaser {
    registry: Arc<Mutex<BufferRegistry>>,
    released: Arc<Mutex<Vec<u32>>>,
}

impl OutputBufferReleaser {
    /// The client is done with `buffer_id`; the worker re-arms the matching
    /// engine slot on its next tick.
    pub fn release(&self, buffer_id: u32) {
        if self.registry.lock().unwrap().submit_to_decoder(buffer_id) {
            self.released.lock().unwrap().push(buffer_id);
        } else {
            log::debug!("release of unknown buffer {}", buffer_id);
        }
    }
}

/// Vendor sideband path for tunneled playback. Decoded pictures bypass the
/// host and go straight to the display sink; buffers come back through
/// [`SidebandChannel::dequeue_returned`] once presentation is done.
pub trait SidebandChannel: Send {
    /// Queue a decoded buffer for presentation at `timestamp` microseconds.
    fn queue_frame(&mut self, buffer_id: u32, timestamp: i64) -> Result<(), Status>;

    /// Buffers the sink finished with since the last call.
    fn dequeue_returned(&mut self) -> Vec<u32>;
}

pub struct DecoderPipeline {
    coding: CodedFormat,
    engine: Box<dyn DecodeEngine>,
    pool: BlockingPool,
    queue: Arc<Mutex<WorkQueue>>,
    params: Arc<Mutex<Params>>,
    error_cb: ErrorCb,
    work_done_cb: WorkDoneCb,
    registry: Arc<Mutex<BufferRegistry>>,
    released: Arc<Mutex<Vec<u32>>>,
    blitter: Option<Box<dyn utils::Blitter>>,
    sideband: Option<Box<dyn SidebandChannel>>,

    size: Resolution,
    hor_stride: u32,
    ver_stride: u32,
    /// Layout the engine produces.
    frame_format: RawFormat,
    /// Layout handed to the client.
    output_format: RawFormat,
    /// The engine decodes into its internal pool and frames are copied out.
    buffer_mode: bool,
    num_output_slots: u32,
    detected_ref_count: Option<u32>,
    /// Insertion-order resolution fallback engaged.
    non_standard: bool,
    drop_frames: HashSet<u64>,
    eos_frame_index: Option<u64>,
    eos_deadline: Option<Instant>,
    eos_reached: bool,
    pending_updates: Vec<Param>,
    info_change_pending: bool,
    published_aspects: Option<ColorAspects>,
}

impl DecoderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coding: CodedFormat,
        engine: Box<dyn DecodeEngine>,
        pool: Box<dyn BlockPool>,
        queue: Arc<Mutex<WorkQueue>>,
        params: Arc<Mutex<Params>>,
        error_cb: ErrorCb,
        work_done_cb: WorkDoneCb,
    ) -> Self {
        Self {
            coding,
            engine,
            pool: BlockingPool::new(pool),
            queue,
            params,
            error_cb,
            work_done_cb,
            registry: Arc::new(Mutex::new(BufferRegistry::new())),
            released: Arc::new(Mutex::new(Vec::new())),
            blitter: None,
            sideband: None,
            size: Resolution::default(),
            hor_stride: 0,
            ver_stride: 0,
            frame_format: RawFormat::Nv12,
            output_format: RawFormat::Nv12,
            buffer_mode: false,
            num_output_slots: 0,
            detected_ref_count: None,
            non_standard: false,
            drop_frames: HashSet::new(),
            eos_frame_index: None,
            eos_deadline: None,
            eos_reached: false,
            pending_updates: Vec::new(),
            info_change_pending: false,
            published_aspects: None,
        }
    }

    pub fn releaser(&self) -> OutputBufferReleaser {
        OutputBufferReleaser { registry: self.registry.clone(), released: self.released.clone() }
    }

    /// Install a hardware copy service for the copy-out path.
    pub fn set_blitter(&mut self, blitter: Box<dyn utils::Blitter>) {
        self.blitter = Some(blitter);
    }

    /// Install the vendor sideband path for tunneled playback.
    pub fn set_sideband_channel(&mut self, channel: Box<dyn SidebandChannel>) {
        self.sideband = Some(channel);
    }

    fn report_error(&self, status: Status) {
        if status == Status::Corrupted {
            self.queue.lock().unwrap().set_signalled_error();
        }
        (*self.error_cb.lock().unwrap())(status);
    }

    /// Hand submitted work to the in-flight map, unless a flush advanced the
    /// queue generation while the engine call was under way.
    fn track_pending(&mut self, mut work: Work, generation: u32) {
        let handed_back = {
            let mut queue = self.queue.lock().unwrap();
            if queue.generation() != generation {
                work.result = Status::NotFound;
                work.fill_empty();
                Some(work)
            } else {
                queue.pending_insert(work)
            }
        };
        if let Some(work) = handed_back {
            (*self.work_done_cb.lock().unwrap())(work);
        }
    }

    /// Complete one work item: attach the optional output, merge in any
    /// parameter updates waiting since the last stream change, and hand it
    /// to the listener.
    fn finish(&mut self, mut work: Work, extra_flags: WorkFlags, buffer: Option<OutputBuffer>) {
        match buffer {
            Some(buffer) => work.fill_output(buffer, extra_flags),
            None => {
                work.fill_empty();
                let mut flags = work.worklet.flags;
                flags |= extra_flags;
                work.worklet.flags = flags;
            }
        }
        if self.info_change_pending {
            self.info_change_pending = false;
            let mut flags = work.worklet.flags;
            flags |= WorkFlags::INFO_CHANGE;
            work.worklet.flags = flags;
            work.worklet.config_updates.append(&mut self.pending_updates);
        }
        (*self.work_done_cb.lock().unwrap())(work);
    }

    /// Top the engine up to the provisioned slot count.
    fn ensure_decoder_state(&mut self) {
        if self.buffer_mode || self.size.get_area() == 0 {
            return;
        }
        let (needed, usage) = {
            let registry = self.registry.lock().unwrap();
            let owned = registry.owned_count() as u32;
            (self.num_output_slots.saturating_sub(owned), self.params.lock().unwrap().usage)
        };
        for _ in 0..needed {
            let block = match self.pool.fetch_graphic_block(self.size, self.frame_format, usage) {
                Ok(block) => block,
                Err(Status::NoMemory) => {
                    log::debug!("block pool dry, retrying next tick");
                    return;
                }
                Err(status) => {
                    self.report_error(status);
                    return;
                }
            };
            let slot = {
                let mut registry = self.registry.lock().unwrap();
                match registry.import(block, |handle| self.engine.register_buffer(handle)) {
                    Ok(slot) => slot,
                    Err(status) => {
                        self.report_error(status);
                        return;
                    }
                }
            };
            if let Err(status) = self.engine.submit_buffer(slot) {
                self.report_error(status);
                return;
            }
        }
    }

    /// Re-arm slots the host released since the last tick.
    fn process_released(&mut self) {
        let released: Vec<u32> = self.released.lock().unwrap().drain(..).collect();
        for buffer_id in released {
            let slot = self.registry.lock().unwrap().get(buffer_id).map(|r| r.engine_handle);
            if let Some(slot) = slot {
                if let Err(status) = self.engine.submit_buffer(slot) {
                    log::warn!("re-arming slot {} failed: {}", slot, status);
                }
            }
        }
    }

    fn drain_outputs(&mut self) {
        for _ in 0..OUTPUT_DRAIN_CAP {
            let frame = match self.engine.get_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(status) => {
                    self.report_error(status);
                    break;
                }
            };

            if frame.info_change {
                self.handle_info_change(&frame);
                continue;
            }
            if frame.eos {
                if frame.slot.is_none() && frame.data.is_none() {
                    self.handle_eos_frame();
                } else {
                    // Terminal frame carrying a picture.
                    self.eos_reached = true;
                    self.eos_deadline = None;
                    self.eos_frame_index = None;
                    self.handle_picture(frame);
                }
                break;
            }
            self.handle_picture(frame);
        }
    }

    fn handle_info_change(&mut self, frame: &EngineFrame) {
        log::info!(
            "stream info change: {} ({}x{} stride), format {:?}",
            frame.size,
            frame.hor_stride,
            frame.ver_stride,
            frame.format
        );
        self.size = frame.size;
        self.hor_stride = frame.hor_stride;
        self.ver_stride = frame.ver_stride;
        self.frame_format = frame.format;

        let caps = ChipCapInfo::get();
        let (requested_p010, fbc_disable) = {
            let params = self.params.lock().unwrap();
            (params.pixel_format == RawFormat::P010, params.fbc_disable)
        };
        // Copy-out engages whenever the client cannot consume what the
        // engine produces directly: 10-bit layouts, or compressed output
        // the platform (or the host's fbc-disable knob) rules out.
        if frame.format.is_10bit() {
            self.buffer_mode = true;
            // Platforms with an HDR metadata path keep the full depth even
            // when the host did not ask for it.
            self.output_format =
                if requested_p010 || caps.hdr_meta_cap || caps.is_10bit_supported(self.coding) {
                    RawFormat::P010
                } else {
                    RawFormat::Nv12
                };
        } else if frame.format.is_compressed()
            && (fbc_disable || caps.fbc_output_mode(self.coding) == FbcMode::None)
        {
            self.buffer_mode = true;
            self.output_format = RawFormat::Nv12;
        } else {
            self.buffer_mode = false;
            self.output_format = frame.format;
        }
        if let Err(status) = self.engine.control(DecControl::InternalPoolMode(self.buffer_mode)) {
            log::warn!("engine rejected pool mode: {}", status);
        }

        let (low_memory, tunneled) = {
            let params = self.params.lock().unwrap();
            (params.low_memory_mode, params.tunneled_playback)
        };
        let ref_count = self.detected_ref_count.unwrap_or_else(|| {
            let level = self.params.lock().unwrap().level;
            utils::video_ref_count(self.coding, self.size, level)
        });
        // The advertised delay is the trimmed reference count; the render
        // smoothness headroom only widens the slot provision, never what the
        // host is told to budget for.
        let (delay, reduced) = utils::derive_output_delay(ref_count, low_memory);
        if reduced > 0 {
            log::info!("low memory mode, trimming {} output slots", reduced);
        }
        self.num_output_slots = delay + utils::RENDER_SMOOTHNESS_FACTOR;
        if tunneled {
            // The display sink sits on frames longer than a host client
            // would; provision a second round of headroom.
            self.num_output_slots += utils::RENDER_SMOOTHNESS_FACTOR;
        }

        let max_input = utils::max_input_size(self.size);
        {
            let mut params = self.params.lock().unwrap();
            params.picture_size = self.size;
            params.output_delay = delay;
            params.max_input_size = max_input;
        }
        self.pending_updates = vec![
            Param::PictureSize(self.size),
            Param::OutputDelay(delay),
            Param::MaxInputSize(max_input),
        ];
        self.info_change_pending = true;

        // The previous buffer group is void; the engine must forget every
        // slot before the registry re-provisions at the new geometry.
        let old_slots = {
            let mut registry = self.registry.lock().unwrap();
            let slots = registry.all_slots();
            registry.clear();
            slots
        };
        for slot in old_slots {
            if let Err(status) = self.engine.release_buffer(slot) {
                log::warn!("releasing slot {} failed: {}", slot, status);
            }
        }
        if !self.buffer_mode {
            self.ensure_decoder_state();
        }
        if let Err(status) = self.engine.set_info_change_ready() {
            self.report_error(status);
        }
    }

    fn handle_eos_frame(&mut self) {
        self.eos_reached = true;
        self.eos_deadline = None;
        if let Some(frame_index) = self.eos_frame_index.take() {
            let resolved = self.queue.lock().unwrap().pending_take(frame_index);
            if let Some(work) = resolved {
                self.finish(work, WorkFlags::END_OF_STREAM, None);
            }
        }
    }

    fn handle_picture(&mut self, frame: EngineFrame) {
        if frame.modes.contains(FrameModes::DEINTERLACED) {
            self.non_standard = true;
        }
        if frame.dts == 0 {
            // Smuggled identities start at 1; the engine dropped ours.
            self.non_standard = true;
        }

        let resolved = {
            let mut queue = self.queue.lock().unwrap();
            if self.non_standard {
                queue.pending_take_oldest()
            } else {
                queue.pending_take(frame.dts as u64 - 1)
            }
        };
        let work = match resolved {
            Some(work) => work,
            None => {
                log::debug!("frame pts {} has no in-flight owner, recycling", frame.pts);
                self.recycle_frame(&frame);
                return;
            }
        };
        let frame_index = work.frame_index();

        if frame.errinfo || frame.discard {
            self.recycle_frame(&frame);
            self.finish(work, WorkFlags::DISCARD_FRAME, None);
            return;
        }
        if self.drop_frames.remove(&frame_index) {
            self.recycle_frame(&frame);
            self.finish(work, WorkFlags::DROP_FRAME, None);
            return;
        }

        match self.send_to_sideband(&frame) {
            Some(Ok(())) => {
                let eos = work.input.flags.contains(WorkFlags::END_OF_STREAM);
                let flags = if eos { WorkFlags::END_OF_STREAM } else { WorkFlags::empty() };
                self.finish(work, flags, None);
                return;
            }
            Some(Err(_)) => {
                self.recycle_frame(&frame);
                self.finish(work, WorkFlags::INCOMPLETE, None);
                return;
            }
            None => {}
        }

        let buffer = if self.buffer_mode {
            self.copy_out_frame(&frame)
        } else {
            self.wrap_surface_frame(&frame)
        };
        let mut buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                self.finish(work, WorkFlags::INCOMPLETE, None);
                return;
            }
        };

        if let Some(update) = self.resolve_color_aspects(&frame) {
            buffer.infos.push(update);
        }

        let eos = work.input.flags.contains(WorkFlags::END_OF_STREAM);
        let flags = if eos { WorkFlags::END_OF_STREAM } else { WorkFlags::empty() };
        self.finish(work, flags, Some(buffer));
    }

    /// Tunneled path: hand the picture to the display sink instead of the
    /// host. `None` when the frame is not eligible (no channel installed,
    /// copy-out output, or an unknown slot); `Some(Err)` when the sink
    /// refused the buffer and the frame must be reclaimed.
    fn send_to_sideband(&mut self, frame: &EngineFrame) -> Option<Result<(), Status>> {
        if self.buffer_mode {
            return None;
        }
        let channel = self.sideband.as_mut()?;
        let slot = frame.slot?;
        let (buffer_id, _) = self.registry.lock().unwrap().take_for_client_by_slot(slot)?;
        match channel.queue_frame(buffer_id, frame.pts) {
            Ok(()) => Some(Ok(())),
            Err(status) => {
                log::warn!("sideband rejected buffer {}: {}", buffer_id, status);
                self.registry.lock().unwrap().submit_to_decoder(buffer_id);
                Some(Err(status))
            }
        }
    }

    /// Re-arm buffers the display sink finished presenting.
    fn process_sideband(&mut self) {
        let returned = match self.sideband.as_mut() {
            Some(channel) => channel.dequeue_returned(),
            None => return,
        };
        for buffer_id in returned {
            let slot = {
                let mut registry = self.registry.lock().unwrap();
                if !registry.submit_to_decoder(buffer_id) {
                    log::debug!("sideband returned unknown buffer {}", buffer_id);
                    continue;
                }
                registry.get(buffer_id).map(|r| r.engine_handle)
            };
            if let Some(slot) = slot {
                if let Err(status) = self.engine.submit_buffer(slot) {
                    log::warn!("re-arming slot {} failed: {}", slot, status);
                }
            }
        }
    }

    /// Give a frame's backing storage straight back to the engine.
    fn recycle_frame(&mut self, frame: &EngineFrame) {
        if let Some(slot) = frame.slot {
            if let Err(status) = self.engine.submit_buffer(slot) {
                log::warn!("recycling slot {} failed: {}", slot, status);
            }
        }
    }

    fn wrap_surface_frame(&mut self, frame: &EngineFrame) -> Option<OutputBuffer> {
        let slot = frame.slot?;
        let taken = self.registry.lock().unwrap().take_for_client_by_slot(slot);
        let (_, mut block) = match taken {
            Some(taken) => taken,
            None => {
                log::warn!("engine used unknown slot {}", slot);
                return None;
            }
        };
        let (offset_x, offset_y) = if self.frame_format.is_compressed() {
            ChipCapInfo::get().fbc_output_offset(self.coding)
        } else {
            (0, 0)
        };
        block.set_crop(Rect {
            x: offset_x,
            y: offset_y,
            width: frame.size.width,
            height: frame.size.height,
        });
        Some(OutputBuffer::graphic(block))
    }

    /// Buffer-mode output: fetch a fresh block and copy or convert the
    /// engine-pool pixels into it.
    fn copy_out_frame(&mut self, frame: &EngineFrame) -> Option<OutputBuffer> {
        let data = frame.data.as_ref()?;
        let usage = self.params.lock().unwrap().usage;
        let mut block = match self.pool.fetch_graphic_block(self.size, self.output_format, usage) {
            Ok(block) => block,
            Err(status) => {
                self.report_error(status);
                return None;
            }
        };

        let width = frame.size.width as usize;
        let height = frame.size.height as usize;
        let hor_stride = frame.hor_stride as usize;
        let ver_stride = frame.ver_stride as usize;
        {
            let mut mapping = block.map();
            let mut blitted = false;
            if let Some(blitter) = self.blitter.as_mut() {
                let request = utils::BlitRequest {
                    data,
                    src_format: self.frame_format,
                    dst_format: self.output_format,
                    size: frame.size,
                    hor_stride: frame.hor_stride,
                    ver_stride: frame.ver_stride,
                };
                match blitter.convert(&request, &mut mapping) {
                    Ok(()) => blitted = true,
                    Err(status) => {
                        log::warn!("blit failed ({}), copying on the cpu", status)
                    }
                }
            }
            if !blitted {
                if self.frame_format.is_compressed() {
                    // Only the blitter can resolve a compressed layout.
                    log::error!("no blitter for compressed source {:?}", self.frame_format);
                    self.report_error(Status::Corrupted);
                    return None;
                }
                match (self.frame_format, self.output_format) {
                    (RawFormat::Nv12_10, RawFormat::P010) => utils::convert_10bit_nv12_to_p010(
                        &mut mapping,
                        width * 2,
                        data,
                        hor_stride,
                        ver_stride,
                        width,
                        height,
                    ),
                    (RawFormat::Nv12_10, RawFormat::Nv12) => utils::convert_10bit_nv12_to_nv12(
                        &mut mapping,
                        width,
                        data,
                        hor_stride,
                        ver_stride,
                        width,
                        height,
                    ),
                    _ => {
                        utils::nv12_copy(data, &mut mapping, width, height, hor_stride, ver_stride)
                    }
                }
            }
        }
        block.set_crop(Rect { x: 0, y: 0, width: frame.size.width, height: frame.size.height });
        Some(OutputBuffer::graphic(block))
    }

    /// Combine bitstream color information with the host defaults and
    /// publish when the effective value changes.
    fn resolve_color_aspects(&mut self, frame: &EngineFrame) -> Option<Param> {
        if !self.coding.has_vui_color_aspects() {
            return None;
        }
        let defaults = self.params.lock().unwrap().default_color_aspects;
        let mut aspects = match frame.iso_color {
            Some(iso) => utils::iso_to_color_aspects(iso),
            None => defaults,
        };
        if aspects.range == ColorRange::Unspecified {
            aspects.range = defaults.range;
        }
        if aspects.primaries == ColorPrimaries::Unspecified {
            aspects.primaries = defaults.primaries;
        }
        if aspects.transfer == ColorTransfer::Unspecified {
            aspects.transfer = defaults.transfer;
        }
        if aspects.matrix == ColorMatrix::Unspecified {
            aspects.matrix = defaults.matrix;
        }
        utils::pair_default_color_aspects(&mut aspects, self.size);

        if self.published_aspects == Some(aspects) {
            return None;
        }
        self.published_aspects = Some(aspects);
        self.params.lock().unwrap().coded_color_aspects = aspects;
        Some(Param::ColorAspects(aspects))
    }

    fn process_config(&mut self, mut work: Work) {
        let data = work.input.buffers.first().cloned().unwrap_or_default();
        if self.detected_ref_count.is_none() {
            self.detected_ref_count = inspect::detect_max_ref_count(&data, self.coding);
            let depth = inspect::detect_bit_depth(&data, self.coding);
            log::info!(
                "stream probe: depth {} bits, ref count {:?}",
                depth,
                self.detected_ref_count
            );
        }

        let packet = EnginePacket {
            data,
            pts: work.input.ordinal.timestamp,
            dts: 0,
            eos: false,
            extra_data: true,
        };
        if let Err(status) = self.engine.put_packet(packet) {
            work.result = status;
            self.report_error(status);
        }

        let eos = work.input.flags.contains(WorkFlags::END_OF_STREAM);
        work.fill_empty();
        let mut flags = WorkFlags::CODEC_CONFIG;
        if eos {
            flags |= WorkFlags::END_OF_STREAM;
        }
        work.worklet.flags = flags;
        (*self.work_done_cb.lock().unwrap())(work);
    }
}

impl PipelineWorker for DecoderPipeline {
    fn on_start(&mut self) -> Result<(), Status> {
        self.engine.init(self.coding)?;

        // Session tuning knobs go down before the first packet; the engine
        // cannot change them mid-stream.
        let (low_latency, disable_dpb_check, disable_error_mark) = {
            let params = self.params.lock().unwrap();
            (params.low_latency_mode, params.disable_dpb_check, params.disable_error_mark)
        };
        if low_latency {
            self.engine.control(DecControl::LowLatency(true))?;
            self.engine.control(DecControl::ImmediateOut(true))?;
        }
        if disable_dpb_check {
            self.engine.control(DecControl::DisableDpbCheck(true))?;
        }
        if disable_error_mark {
            self.engine.control(DecControl::DisableErrorMark(true))?;
        }

        self.eos_reached = false;
        Ok(())
    }

    fn process_work(&mut self, mut work: Work) {
        let updates = std::mem::take(&mut work.input.config_updates);
        if !updates.is_empty() {
            for failure in self.params.lock().unwrap().apply(updates) {
                log::warn!("config update rejected: {} ({})", failure.field, failure.status);
            }
        }

        if work.input.flags.contains(WorkFlags::CODEC_CONFIG) {
            self.process_config(work);
            return;
        }

        let frame_index = work.frame_index();
        let eos = work.input.flags.contains(WorkFlags::END_OF_STREAM);
        let data = work.input.buffers.first().cloned().unwrap_or_default();
        let generation = self.queue.lock().unwrap().generation();

        if work.input.flags.contains(WorkFlags::DROP_FRAME) {
            self.drop_frames.insert(frame_index);
        }

        if data.is_empty() && eos {
            // Bare end-of-stream carrier.
            let packet = EnginePacket { data: Bytes::new(), eos: true, ..Default::default() };
            if let Err(status) = self.engine.put_packet(packet) {
                work.result = status;
                self.finish(work, WorkFlags::END_OF_STREAM, None);
                return;
            }
            self.eos_frame_index = Some(frame_index);
            self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
            self.track_pending(work, generation);
            return;
        }

        let packet = EnginePacket {
            data: data.clone(),
            pts: work.input.ordinal.timestamp,
            dts: frame_index as i64 + 1,
            eos,
            extra_data: false,
        };

        let mut sent = false;
        for retry in 0..=PACKET_RETRY_MAX {
            match self.engine.put_packet(packet.clone()) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(Status::Blocking) => {
                    if retry == PACKET_RETRY_MAX {
                        break;
                    }
                    if retry % PACKET_RETRY_PROBE == PACKET_RETRY_PROBE - 1 {
                        self.ensure_decoder_state();
                        self.drain_outputs();
                    }
                    std::thread::sleep(PACKET_RETRY_PAUSE);
                }
                Err(status) => {
                    work.result = status;
                    self.report_error(status);
                    self.finish(work, WorkFlags::empty(), None);
                    return;
                }
            }
        }
        if !sent {
            log::error!("input channel stuck after {} retries", PACKET_RETRY_MAX);
            work.result = Status::Corrupted;
            self.report_error(Status::Corrupted);
            self.finish(work, WorkFlags::empty(), None);
            return;
        }

        if eos {
            self.eos_frame_index = Some(frame_index);
            self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
        }
        self.track_pending(work, generation);
    }

    fn begin_drain(&mut self, mode: DrainMode) {
        match mode {
            DrainMode::WithEos => {
                let packet = EnginePacket { data: Bytes::new(), eos: true, ..Default::default() };
                if let Err(status) = self.engine.put_packet(packet) {
                    self.report_error(status);
                    return;
                }
                self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
            }
            // Outputs flow out on subsequent ticks; the stream stays open.
            DrainMode::NoEos => {}
            DrainMode::NoDrain | DrainMode::Chain => {}
        }
    }

    fn poll(&mut self) {
        self.process_released();
        self.process_sideband();
        self.ensure_decoder_state();
        self.drain_outputs();

        if self.non_standard {
            // The engine holds frames we cannot match; cap the damage.
            loop {
                let stuck = {
                    let mut queue = self.queue.lock().unwrap();
                    if queue.pending_len() > STUCK_PENDING_MAX {
                        queue.pending_take_oldest()
                    } else {
                        None
                    }
                };
                match stuck {
                    Some(work) => self.finish(work, WorkFlags::INCOMPLETE, None),
                    None => break,
                }
            }
        }

        if let Some(deadline) = self.eos_deadline {
            if !self.eos_reached && Instant::now() >= deadline {
                log::error!("end-of-stream drain exceeded its budget");
                self.eos_deadline = None;
                self.report_error(Status::TimedOut);
                if let Some(frame_index) = self.eos_frame_index.take() {
                    let resolved = self.queue.lock().unwrap().pending_take(frame_index);
                    if let Some(mut work) = resolved {
                        work.result = Status::TimedOut;
                        self.finish(work, WorkFlags::END_OF_STREAM, None);
                    }
                }
            }
        }
    }

    fn on_flush(&mut self) {
        if let Err(status) = self.engine.reset() {
            self.report_error(status);
        }
        self.drop_frames.clear();
        self.eos_frame_index = None;
        self.eos_deadline = None;
        self.eos_reached = false;
        // Everything the decoder still owns goes straight back to work.
        let slots = self.registry.lock().unwrap().owned_slots();
        for slot in slots {
            if let Err(status) = self.engine.submit_buffer(slot) {
                log::warn!("re-arming slot {} after flush failed: {}", slot, status);
            }
        }
    }

    fn on_stop(&mut self) {
        let _ = self.engine.reset();
        self.registry.lock().unwrap().clear();
        self.released.lock().unwrap().clear();
        self.drop_frames.clear();
        self.eos_frame_index = None;
        self.eos_deadline = None;
        self.eos_reached = false;
        self.info_change_pending = false;
        self.pending_updates.clear();
        self.published_aspects = None;
        self.num_output_slots = 0;
        self.size = Resolution::default();
    }
}
