// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder pipeline: parameter compilation, raw-frame submission and
//! coded-packet retrieval.
//!
//! The engine is configured lazily on the first frame so late host
//! configuration still lands in the initial compile. Afterwards each
//! submission diffs the parameter snapshot against the last applied one and
//! pushes only the changed key groups. Work identity travels as the frame
//! descriptor's pts (the work `frame_index`) and comes back as the packet
//! pts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::buffer::{BlockPool, BlockingPool};
use crate::caps::ChipCapInfo;
use crate::component::{ErrorCb, PipelineWorker, WorkDoneCb};
use crate::encoder_config;
use crate::engine::{DetectSession, EncCfg, EncodeEngine, EngineFrameDesc, FrameMeta};
use crate::params::{Param, Params, PictureType, RoiRegion, SuperEncoding};
use crate::utils::align;
use crate::work::{DrainMode, OutputBuffer, Status, Work, WorkFlags};
use crate::work_queue::WorkQueue;
use crate::{CodedFormat, RawFormat, Resolution};

const FRAME_RETRY_MAX: u32 = 1000;
const FRAME_RETRY_PAUSE: Duration = Duration::from_millis(3);
/// Every this many blocked submissions, drain coded output to unwedge the
/// engine.
const FRAME_RETRY_PROBE: u32 = 200;
/// Wall-clock budget for an end-of-stream drain.
const DRAIN_EOS_BUDGET: Duration = Duration::from_secs(2);
/// Packets drained from the engine per tick.
const PACKET_DRAIN_CAP: u32 = 16;

pub struct EncoderPipeline {
    coding: CodedFormat,
    engine: Box<dyn EncodeEngine>,
    pool: BlockingPool,
    queue: Arc<Mutex<WorkQueue>>,
    params: Arc<Mutex<Params>>,
    error_cb: ErrorCb,
    work_done_cb: WorkDoneCb,
    /// External NN region detector feeding the NN-driven super-encoding
    /// mode; absent on most sessions.
    detector: Option<Box<dyn DetectSession>>,

    configured: bool,
    /// Snapshot the current engine configuration was compiled from.
    last_params: Params,
    /// Cumulative key/value state as applied to the engine.
    cfg: EncCfg,
    /// Codec-specific data, attached to the first completed work.
    header: Option<Bytes>,
    /// Pictures submitted; drives the temporal layer cycle.
    input_count: u64,
    eos_deadline: Option<Instant>,
    eos_reached: bool,
}

impl EncoderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coding: CodedFormat,
        engine: Box<dyn EncodeEngine>,
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
            detector: None,
            configured: false,
            last_params: Params::default(),
            cfg: EncCfg::new(),
            header: None,
            input_count: 0,
            eos_deadline: None,
            eos_reached: false,
        }
    }

    pub fn set_detect_session(&mut self, session: Box<dyn DetectSession>) {
        self.detector = Some(session);
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

    fn finish(&mut self, mut work: Work, extra_flags: WorkFlags, buffer: Option<OutputBuffer>) {
        match buffer {
            Some(buffer) => work.fill_output(buffer, extra_flags),
            None => {
                work.fill_empty();
                work.worklet.flags |= extra_flags;
            }
        }
        if let Some(header) = self.header.take() {
            work.worklet.config_updates.push(Param::CodecSpecificData(header));
        }
        (*self.work_done_cb.lock().unwrap())(work);
    }

    /// First-frame full compile, later frames a delta of the changed key
    /// groups only.
    fn ensure_configured(&mut self, snapshot: &Params) -> Result<(), Status> {
        if !self.configured {
            self.engine.init(self.coding)?;
            let cfg = encoder_config::compile(snapshot, self.coding)?;
            self.engine.apply_config(&cfg)?;
            self.cfg = cfg;
            self.header = Some(self.engine.get_header()?);
            self.last_params = snapshot.clone();
            self.configured = true;
            return Ok(());
        }

        let change = encoder_config::diff(&self.last_params, snapshot);
        if let Some(delta) = encoder_config::compile_dynamic(snapshot, self.coding, change)? {
            log::info!("dynamic reconfiguration: {:?}", change);
            self.engine.apply_config(&delta)?;
            self.cfg.merge(&delta);
        }
        self.last_params = snapshot.clone();
        Ok(())
    }

    /// Pull the one-shot controls out of the shared parameter store. Sync
    /// frame and LTR requests are only honored on a base-layer input so the
    /// reference structure stays decodable; everything else fires
    /// immediately.
    fn take_frame_meta(&mut self) -> FrameMeta {
        let layer_count = self.cfg.get_u32("ref:tsvc_layers").unwrap_or(1);
        let at_base = encoder_config::layer_position(self.input_count, layer_count) == 0;

        let mut meta = FrameMeta::default();
        let mut params = self.params.lock().unwrap();
        if params.request_sync_frame && at_base {
            meta.force_idr = true;
            params.request_sync_frame = false;
        }
        if params.mlvec.mark_ltr >= 0 && at_base {
            meta.mark_ltr = Some(params.mlvec.mark_ltr);
            params.mlvec.mark_ltr = -1;
        }
        if params.mlvec.use_ltr >= 0 && at_base {
            meta.use_ltr = Some(params.mlvec.use_ltr);
            params.mlvec.use_ltr = -1;
        }
        if params.mlvec.frame_qp >= 0 {
            meta.frame_qp = Some(params.mlvec.frame_qp);
            params.mlvec.frame_qp = -1;
        }
        if params.mlvec.base_layer_pid >= 0 {
            meta.base_layer_pid = Some(params.mlvec.base_layer_pid);
            params.mlvec.base_layer_pid = -1;
        }
        if !params.roi_regions.is_empty() {
            meta.roi_map = build_roi_map(&params.roi_regions, params.picture_size);
        }
        meta
    }

    /// Region hints from the external detection session. The detector runs
    /// at its own cadence: a busy session means this frame goes unanalyzed,
    /// and the newest finished result is applied to whichever frame polls it
    /// out. Detected foreground blocks get a QP drop scaled by confidence,
    /// bounded by the mode's table.
    fn nn_roi_map(&mut self, data: &Bytes, snapshot: &Params) -> Option<Bytes> {
        if snapshot.super_encoding != SuperEncoding::NnDriven {
            return None;
        }
        let detector = self.detector.as_mut()?;
        match detector.submit(data, snapshot.picture_size) {
            Ok(()) => {}
            Err(Status::Blocking) => {
                log::debug!("detection session busy, frame not analyzed");
            }
            Err(status) => {
                log::warn!("detection session rejected frame: {}", status);
                return None;
            }
        }

        let regions = detector.poll_regions()?;
        let bounds = encoder_config::super_encoding_qp_bounds(SuperEncoding::NnDriven);
        let hinted: Vec<RoiRegion> = regions
            .iter()
            .map(|r| {
                let qp = ((bounds.fg_min as f32) * r.score.clamp(0.0, 1.0)).round() as i32;
                RoiRegion {
                    x: r.x,
                    y: r.y,
                    w: r.w,
                    h: r.h,
                    force_intra: false,
                    qp_mode: false,
                    qp_val: qp.clamp(bounds.fg_min, bounds.fg_max),
                }
            })
            .collect();
        build_roi_map(&hinted, snapshot.picture_size)
    }

    fn submit_frame(&mut self, desc: EngineFrameDesc) -> Result<(), Status> {
        for retry in 0..=FRAME_RETRY_MAX {
            match self.engine.put_frame(desc.clone()) {
                Ok(()) => return Ok(()),
                Err(Status::Blocking) => {
                    if retry == FRAME_RETRY_MAX {
                        break;
                    }
                    if retry % FRAME_RETRY_PROBE == FRAME_RETRY_PROBE - 1 {
                        self.drain_packets();
                    }
                    std::thread::sleep(FRAME_RETRY_PAUSE);
                }
                Err(other) => return Err(other),
            }
        }
        log::error!("input channel stuck after {} retries", FRAME_RETRY_MAX);
        Err(Status::Corrupted)
    }

    fn drain_packets(&mut self) {
        for _ in 0..PACKET_DRAIN_CAP {
            let packet = match self.engine.get_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(status) => {
                    self.report_error(status);
                    break;
                }
            };

            if packet.eos {
                self.eos_reached = true;
                self.eos_deadline = None;
                if packet.pts < 0 {
                    // Terminal packet of a drain marker; no work to resolve.
                    continue;
                }
            }

            let resolved = self.queue.lock().unwrap().pending_take(packet.pts as u64);
            let work = match resolved {
                Some(work) => work,
                None => {
                    log::debug!("packet for frame {} has no in-flight owner", packet.pts);
                    continue;
                }
            };

            if packet.eos && packet.data.is_empty() {
                self.finish(work, WorkFlags::END_OF_STREAM, None);
                continue;
            }

            let usage = self.params.lock().unwrap().usage;
            let mut block = match self.pool.fetch_linear_block(packet.data.len().max(1), usage) {
                Ok(block) => block,
                Err(status) => {
                    self.report_error(status);
                    self.finish(work, WorkFlags::INCOMPLETE, None);
                    continue;
                }
            };
            if let Err(status) = block.write(&packet.data) {
                self.report_error(status);
                self.finish(work, WorkFlags::INCOMPLETE, None);
                continue;
            }

            let mut buffer = OutputBuffer::linear(block);
            if packet.intra {
                buffer
                    .infos
                    .push(Param::PictureType(PictureType::SYNC_FRAME.union(PictureType::I_FRAME)));
            }

            let flags = if packet.eos { WorkFlags::END_OF_STREAM } else { WorkFlags::empty() };
            self.finish(work, flags, Some(buffer));
        }
    }
}

impl PipelineWorker for EncoderPipeline {
    fn on_start(&mut self) -> Result<(), Status> {
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

        let snapshot = self.params.lock().unwrap().clone();
        if let Err(status) = self.ensure_configured(&snapshot) {
            work.result = status;
            self.report_error(status);
            self.finish(work, WorkFlags::empty(), None);
            return;
        }

        let frame_index = work.frame_index();
        let eos = work.input.flags.contains(WorkFlags::END_OF_STREAM);
        let data = work.input.buffers.first().cloned().unwrap_or_default();
        let generation = self.queue.lock().unwrap().generation();

        if data.is_empty() {
            if !eos {
                // Nothing to encode and no stream consequence.
                work.fill_empty();
                (*self.work_done_cb.lock().unwrap())(work);
                return;
            }
            let desc = EngineFrameDesc { pts: frame_index as i64, eos: true, ..Default::default() };
            if let Err(status) = self.submit_frame(desc) {
                work.result = status;
                self.finish(work, WorkFlags::END_OF_STREAM, None);
                return;
            }
            self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
            self.track_pending(work, generation);
            return;
        }

        let mut meta = self.take_frame_meta();
        if meta.roi_map.is_none() {
            // Host-supplied regions win over detector hints.
            meta.roi_map = self.nn_roi_map(&data, &snapshot);
        }
        let size = snapshot.picture_size;
        let hor_stride = self.cfg.get_u32("prep:hor_stride").unwrap_or(align(size.width, 16));
        let ver_stride = self.cfg.get_u32("prep:ver_stride").unwrap_or(align(size.height, 8));

        // Hosts hand over tightly packed frames. Engines without stride
        // freedom get a padded copy.
        let (data, hor_stride, ver_stride) = if ChipCapInfo::get().free_align_encoder
            || (size.width == hor_stride && size.height == ver_stride)
        {
            (data, size.width, size.height)
        } else if snapshot.pixel_format == RawFormat::Nv12 {
            (pad_nv12(&data, size, hor_stride, ver_stride), hor_stride, ver_stride)
        } else {
            (data, size.width, size.height)
        };

        let desc = EngineFrameDesc {
            data: Some(data),
            size,
            hor_stride,
            ver_stride,
            format: snapshot.pixel_format,
            pts: frame_index as i64,
            eos,
            meta,
        };
        if let Err(status) = self.submit_frame(desc) {
            work.result = status;
            self.report_error(status);
            self.finish(work, WorkFlags::empty(), None);
            return;
        }
        self.input_count += 1;

        if eos {
            self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
        }
        self.track_pending(work, generation);
    }

    fn begin_drain(&mut self, mode: DrainMode) {
        match mode {
            DrainMode::WithEos => {
                if !self.configured {
                    return;
                }
                // A bare drain marker owns no work; pts 0 would collide with
                // a real frame identity.
                let desc = EngineFrameDesc { pts: -1, eos: true, ..Default::default() };
                if let Err(status) = self.submit_frame(desc) {
                    self.report_error(status);
                    return;
                }
                self.eos_deadline = Some(Instant::now() + DRAIN_EOS_BUDGET);
            }
            DrainMode::NoEos => {}
            DrainMode::NoDrain | DrainMode::Chain => {}
        }
    }

    fn poll(&mut self) {
        self.drain_packets();

        if let Some(deadline) = self.eos_deadline {
            if !self.eos_reached && Instant::now() >= deadline {
                log::error!("end-of-stream drain exceeded its budget");
                self.eos_deadline = None;
                self.report_error(Status::TimedOut);
                let stuck = self.queue.lock().unwrap().pending_take_oldest();
                if let Some(mut work) = stuck {
                    work.result = Status::TimedOut;
                    self.finish(work, WorkFlags::END_OF_STREAM, None);
                }
            }
        }
    }

    fn on_flush(&mut self) {
        if let Err(status) = self.engine.reset() {
            self.report_error(status);
        }
        self.input_count = 0;
        self.eos_deadline = None;
        self.eos_reached = false;
    }

    fn on_stop(&mut self) {
        let _ = self.engine.reset();
        self.configured = false;
        self.cfg = EncCfg::new();
        self.header = None;
        self.input_count = 0;
        self.eos_deadline = None;
        self.eos_reached = false;
    }
}

/// Expand a tightly packed NV12 frame to the engine's stride requirements.
fn pad_nv12(data: &Bytes, size: Resolution, hor_stride: u32, ver_stride: u32) -> Bytes {
    let width = size.width as usize;
    let height = size.height as usize;
    let hor_stride = hor_stride as usize;
    let ver_stride = ver_stride as usize;
    if data.len() < width * height * 3 / 2 {
        // Short payload; hand it over untouched and let the engine complain.
        return data.clone();
    }

    let mut out = vec![0u8; hor_stride * ver_stride * 3 / 2];
    for row in 0..height {
        let src = &data[row * width..row * width + width];
        out[row * hor_stride..row * hor_stride + width].copy_from_slice(src);
    }
    let src_chroma = &data[width * height..];
    let dst_chroma_base = hor_stride * ver_stride;
    for row in 0..height / 2 {
        let src = &src_chroma[row * width..row * width + width];
        let dst = dst_chroma_base + row * hor_stride;
        out[dst..dst + width].copy_from_slice(src);
    }
    Bytes::from(out)
}

/// Quantized region-of-interest map, one little-endian 16-bit word per
/// 16x16 block: bit 15 forces the block intra, bit 14 marks the QP value as
/// absolute instead of a delta, the low byte carries the signed QP. Regions
/// that fall outside the picture are dropped.
fn build_roi_map(regions: &[RoiRegion], size: Resolution) -> Option<Bytes> {
    let mb_w = size.width.div_ceil(16) as usize;
    let mb_h = size.height.div_ceil(16) as usize;
    let mut map = vec![0u8; mb_w * mb_h * 2];
    let mut any = false;

    for region in regions {
        if region.x + region.w > size.width || region.y + region.h > size.height {
            log::warn!(
                "roi region {}x{}+{}+{} outside picture {}, skipping",
                region.w,
                region.h,
                region.x,
                region.y,
                size
            );
            continue;
        }
        any = true;
        let x0 = (region.x / 16) as usize;
        let y0 = (region.y / 16) as usize;
        let x1 = ((region.x + region.w).div_ceil(16) as usize).min(mb_w);
        let y1 = ((region.y + region.h).div_ceil(16) as usize).min(mb_h);
        let mut word = (region.qp_val.clamp(-128, 127) as i8 as u8) as u16;
        if region.qp_mode {
            word |= 1 << 14;
        }
        if region.force_intra {
            word |= 1 << 15;
        }
        for y in y0..y1 {
            for x in x0..x1 {
                let at = (y * mb_w + x) * 2;
                map[at..at + 2].copy_from_slice(&word.to_le_bytes());
            }
        }
    }

    any.then(|| Bytes::from(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SlotPool;
    use crate::engine::fake::FakeEncodeEngine;
    use crate::engine::{DetectRegion, EngineCodedPacket};
    use crate::params::{SuperProcess, TemporalLayering};
    use crate::work::{OutputBlock, WorkInput, WorkOrdinal};

    #[derive(Clone)]
    struct SharedEngine(Arc<Mutex<FakeEncodeEngine>>);

    impl EncodeEngine for SharedEngine {
        fn init(&mut self, coding: CodedFormat) -> Result<(), Status> {
            self.0.lock().unwrap().init(coding)
        }
        fn apply_config(&mut self, cfg: &EncCfg) -> Result<(), Status> {
            self.0.lock().unwrap().apply_config(cfg)
        }
        fn get_header(&mut self) -> Result<Bytes, Status> {
            self.0.lock().unwrap().get_header()
        }
        fn put_frame(&mut self, frame: EngineFrameDesc) -> Result<(), Status> {
            self.0.lock().unwrap().put_frame(frame)
        }
        fn get_packet(&mut self) -> Result<Option<EngineCodedPacket>, Status> {
            self.0.lock().unwrap().get_packet()
        }
        fn request_sync_frame(&mut self) -> Result<(), Status> {
            self.0.lock().unwrap().request_sync_frame()
        }
        fn reset(&mut self) -> Result<(), Status> {
            self.0.lock().unwrap().reset()
        }
    }

    struct Harness {
        pipeline: EncoderPipeline,
        engine: Arc<Mutex<FakeEncodeEngine>>,
        queue: Arc<Mutex<WorkQueue>>,
        params: Arc<Mutex<Params>>,
        done: Arc<Mutex<Vec<Work>>>,
        errors: Arc<Mutex<Vec<Status>>>,
    }

    fn harness() -> Harness {
        let engine = Arc::new(Mutex::new(FakeEncodeEngine::new()));
        let queue = Arc::new(Mutex::new(WorkQueue::new()));
        let params = Arc::new(Mutex::new(Params::default()));
        let done: Arc<Mutex<Vec<Work>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));

        let done_in_cb = done.clone();
        let errors_in_cb = errors.clone();
        let mut pipeline = EncoderPipeline::new(
            CodedFormat::H264,
            Box::new(SharedEngine(engine.clone())),
            Box::new(SlotPool::new(16)),
            queue.clone(),
            params.clone(),
            Arc::new(Mutex::new(move |status: Status| {
                errors_in_cb.lock().unwrap().push(status)
            })),
            Arc::new(Mutex::new(move |work: Work| done_in_cb.lock().unwrap().push(work))),
        );
        pipeline.on_start().unwrap();
        Harness { pipeline, engine, queue, params, done, errors }
    }

    fn frame_work(frame_index: u64) -> Work {
        Work::new(WorkInput {
            ordinal: WorkOrdinal::new(frame_index, frame_index as i64 * 33_333),
            buffers: vec![Bytes::from(vec![0u8; 320 * 240 * 3 / 2])],
            ..Default::default()
        })
    }

    fn eos_work(frame_index: u64) -> Work {
        Work::new(WorkInput {
            ordinal: WorkOrdinal::new(frame_index, frame_index as i64 * 33_333),
            flags: WorkFlags::END_OF_STREAM,
            ..Default::default()
        })
    }

    fn is_sync(work: &Work) -> bool {
        work.worklet.buffers.iter().flat_map(|b| b.infos.iter()).any(
            |p| matches!(p, Param::PictureType(t) if t.contains(PictureType::SYNC_FRAME)),
        )
    }

    #[test]
    fn first_work_carries_codec_specific_data() {
        let mut h = harness();
        h.pipeline.process_work(frame_work(0));
        h.pipeline.poll();

        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 1);
        let first = &done[0];
        assert_eq!(first.result, Status::Ok);
        assert!(first
            .worklet
            .config_updates
            .iter()
            .any(|p| matches!(p, Param::CodecSpecificData(data) if !data.is_empty())));
        assert!(is_sync(first));
        match &first.worklet.buffers[0].block {
            OutputBlock::Linear(block) => assert!(block.len() > 0),
            _ => panic!("expected linear output"),
        }
    }

    #[test]
    fn packets_resolve_in_order() {
        let mut h = harness();
        for i in 0..4 {
            h.pipeline.process_work(frame_work(i));
        }
        h.pipeline.poll();

        let done = h.done.lock().unwrap();
        let indices: Vec<u64> = done.iter().map(|w| w.frame_index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        // The header rides on the first work only.
        let csd_count = done
            .iter()
            .flat_map(|w| w.worklet.config_updates.iter())
            .filter(|p| matches!(p, Param::CodecSpecificData(_)))
            .count();
        assert_eq!(csd_count, 1);
    }

    #[test]
    fn sync_request_deferred_to_base_layer() {
        let mut h = harness();
        h.params.lock().unwrap().temporal_layering =
            TemporalLayering { layer_count: 3, b_layer_count: 0 };
        h.pipeline.process_work(frame_work(0));
        // Arrives while the cycle is mid-pattern; the next base-layer input
        // (the fifth) honors it.
        h.params.lock().unwrap().request_sync_frame = true;
        for i in 1..6 {
            h.pipeline.process_work(frame_work(i));
        }
        h.pipeline.poll();

        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 6);
        assert!(is_sync(&done[0]));
        assert!(!is_sync(&done[1]) && !is_sync(&done[2]) && !is_sync(&done[3]));
        assert!(is_sync(&done[4]));
        assert!(!h.params.lock().unwrap().request_sync_frame);
    }

    #[test]
    fn dynamic_bitrate_applies_delta() {
        let mut h = harness();
        h.pipeline.process_work(frame_work(0));

        let mut work = frame_work(1);
        work.input.config_updates = vec![Param::Bitrate(4_000_000)];
        h.pipeline.process_work(work);
        h.pipeline.poll();

        let engine = h.engine.lock().unwrap();
        let cfg = engine.applied_config();
        assert_eq!(cfg.get_u32("rc:bps_target"), Some(4_000_000));
        // The delta merged into the standing configuration.
        assert_eq!(cfg.get_str("codec:type"), Some("h264"));
        assert!(cfg.get_f32("rc:fps").is_some());
    }

    #[test]
    fn mlvec_controls_are_one_shot() {
        let mut h = harness();
        {
            let mut params = h.params.lock().unwrap();
            params.mlvec.num_ltr_frames = 2;
            params.mlvec.mark_ltr = 0;
            params.mlvec.frame_qp = 30;
        }
        h.pipeline.process_work(frame_work(0));
        h.pipeline.poll();

        let params = h.params.lock().unwrap();
        assert_eq!(params.mlvec.mark_ltr, -1);
        assert_eq!(params.mlvec.frame_qp, -1);
        assert_eq!(h.done.lock().unwrap().len(), 1);
    }

    #[test]
    fn oversized_packet_emitted_after_reencode_budget() {
        let mut h = harness();
        h.params.lock().unwrap().super_process =
            SuperProcess { mode: 2, i_thd: 2, p_thd: 2, reenc_times: 2 };
        h.engine.lock().unwrap().script_oversize(1);

        h.pipeline.process_work(frame_work(0));
        h.pipeline.process_work(frame_work(1));
        h.pipeline.poll();
        assert_eq!(h.done.lock().unwrap().len(), 1);

        // Two held polls for the re-encode attempts, then the packet lands.
        h.pipeline.poll();
        h.pipeline.poll();
        h.pipeline.poll();
        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].frame_index(), 1);
        match &done[1].worklet.buffers[0].block {
            OutputBlock::Linear(block) => assert!(block.len() > 1024),
            _ => panic!("expected linear output"),
        }
    }

    #[test]
    fn drain_eos_packet_leaves_pending_work_alone() {
        let mut h = harness();
        h.pipeline.process_work(frame_work(5));
        h.pipeline.poll();
        assert_eq!(h.done.lock().unwrap().len(), 1);

        // A frame the engine is still sitting on; its index is 0, the same
        // value an identity-less descriptor would default to.
        h.queue.lock().unwrap().pending_insert(frame_work(0));
        h.pipeline.begin_drain(DrainMode::WithEos);
        h.pipeline.poll();

        // The drain's terminal packet resolves nothing.
        assert_eq!(h.queue.lock().unwrap().pending_len(), 1);
        assert_eq!(h.done.lock().unwrap().len(), 1);
    }

    #[test]
    fn eos_work_terminates_stream() {
        let mut h = harness();
        h.pipeline.process_work(frame_work(0));
        h.pipeline.process_work(eos_work(1));
        h.pipeline.poll();

        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 2);
        let last = &done[1];
        assert_eq!(last.frame_index(), 1);
        assert!(last.worklet.flags.contains(WorkFlags::END_OF_STREAM));
        assert!(last.worklet.buffers.is_empty());
    }

    #[test]
    fn blocked_input_retries_until_accepted() {
        let mut h = harness();
        h.pipeline.process_work(frame_work(0));
        h.engine.lock().unwrap().set_blocking_budget(2);
        h.pipeline.process_work(frame_work(1));
        h.pipeline.poll();

        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|w| w.result == Status::Ok));
        assert!(h.errors.lock().unwrap().is_empty());
    }

    fn roi_word(map: &Bytes, mb_w: usize, x: usize, y: usize) -> u16 {
        let at = (y * mb_w + x) * 2;
        u16::from_le_bytes([map[at], map[at + 1]])
    }

    #[test]
    fn out_of_bounds_roi_is_dropped() {
        let regions = [
            RoiRegion { x: 0, y: 0, w: 64, h: 64, force_intra: false, qp_mode: false, qp_val: -5 },
            RoiRegion {
                x: 300,
                y: 200,
                w: 100,
                h: 100,
                force_intra: false,
                qp_mode: false,
                qp_val: 4,
            },
        ];
        let map = build_roi_map(&regions, Resolution::new(320, 240)).unwrap();
        let mb_w = 320usize.div_ceil(16);
        let delta = (-5i8 as u8) as u16;
        // First region covers 4x4 blocks at the origin.
        assert_eq!(roi_word(&map, mb_w, 0, 0), delta);
        assert_eq!(roi_word(&map, mb_w, 3, 3), delta);
        assert_eq!(roi_word(&map, mb_w, 4, 4), 0);
        // Second region exceeds the picture; nothing written for it.
        assert_eq!(roi_word(&map, mb_w, 300 / 16, 200 / 16), 0);

        let only_bad = [regions[1]];
        assert!(build_roi_map(&only_bad, Resolution::new(320, 240)).is_none());
    }

    #[test]
    fn roi_map_encodes_intra_and_qp_mode() {
        let regions = [
            RoiRegion { x: 0, y: 0, w: 32, h: 32, force_intra: true, qp_mode: true, qp_val: 28 },
            RoiRegion { x: 64, y: 0, w: 32, h: 32, force_intra: false, qp_mode: false, qp_val: -3 },
        ];
        let map = build_roi_map(&regions, Resolution::new(320, 240)).unwrap();
        let mb_w = 320usize.div_ceil(16);
        // Absolute QP 28 with the intra and mode bits set.
        assert_eq!(roi_word(&map, mb_w, 0, 0), (1 << 15) | (1 << 14) | 28);
        // Plain delta region carries only the signed QP byte.
        assert_eq!(roi_word(&map, mb_w, 4, 0), (-3i8 as u8) as u16);
    }

    struct ScriptedDetector {
        busy: bool,
        regions: Option<Vec<DetectRegion>>,
        submitted: Arc<Mutex<u32>>,
    }

    impl DetectSession for ScriptedDetector {
        fn submit(&mut self, _data: &Bytes, _size: Resolution) -> Result<(), Status> {
            *self.submitted.lock().unwrap() += 1;
            if self.busy {
                Err(Status::Blocking)
            } else {
                Ok(())
            }
        }

        fn poll_regions(&mut self) -> Option<Vec<DetectRegion>> {
            self.regions.take()
        }
    }

    #[test]
    fn detector_regions_become_roi_hints() {
        let mut h = harness();
        h.params.lock().unwrap().super_encoding = crate::params::SuperEncoding::NnDriven;
        let submitted = Arc::new(Mutex::new(0u32));
        h.pipeline.set_detect_session(Box::new(ScriptedDetector {
            busy: false,
            regions: Some(vec![DetectRegion { x: 0, y: 0, w: 32, h: 32, score: 1.0 }]),
            submitted: submitted.clone(),
        }));

        h.pipeline.process_work(frame_work(0));
        h.pipeline.poll();

        assert_eq!(*submitted.lock().unwrap(), 1);
        let engine = h.engine.lock().unwrap();
        let map = engine.last_frame_meta().unwrap().roi_map.clone().unwrap();
        let mb_w = 320usize.div_ceil(16);
        // Full-confidence foreground gets the deepest allowed QP drop.
        assert_eq!(roi_word(&map, mb_w, 0, 0), (-6i8 as u8) as u16);
        assert_eq!(roi_word(&map, mb_w, 4, 0), 0);
        assert_eq!(h.done.lock().unwrap().len(), 1);
    }

    #[test]
    fn busy_detector_skips_frame_without_error() {
        let mut h = harness();
        h.params.lock().unwrap().super_encoding = crate::params::SuperEncoding::NnDriven;
        let submitted = Arc::new(Mutex::new(0u32));
        h.pipeline.set_detect_session(Box::new(ScriptedDetector {
            busy: true,
            regions: None,
            submitted: submitted.clone(),
        }));

        h.pipeline.process_work(frame_work(0));
        h.pipeline.process_work(frame_work(1));
        h.pipeline.poll();

        // Both frames were offered and declined; encoding went on untouched.
        assert_eq!(*submitted.lock().unwrap(), 2);
        let done = h.done.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|w| w.result == Status::Ok));
        assert!(h.errors.lock().unwrap().is_empty());
        assert!(h.engine.lock().unwrap().last_frame_meta().unwrap().roi_map.is_none());
    }

    #[test]
    fn host_roi_wins_over_detector() {
        let mut h = harness();
        {
            let mut params = h.params.lock().unwrap();
            params.super_encoding = crate::params::SuperEncoding::NnDriven;
            params.roi_regions = vec![RoiRegion {
                x: 16,
                y: 16,
                w: 16,
                h: 16,
                force_intra: false,
                qp_mode: false,
                qp_val: 4,
            }];
        }
        let submitted = Arc::new(Mutex::new(0u32));
        h.pipeline.set_detect_session(Box::new(ScriptedDetector {
            busy: false,
            regions: Some(vec![DetectRegion { x: 0, y: 0, w: 32, h: 32, score: 1.0 }]),
            submitted: submitted.clone(),
        }));

        h.pipeline.process_work(frame_work(0));
        h.pipeline.poll();

        // The detector never saw the frame; the host map went down as-is.
        assert_eq!(*submitted.lock().unwrap(), 0);
        let engine = h.engine.lock().unwrap();
        let map = engine.last_frame_meta().unwrap().roi_map.clone().unwrap();
        let mb_w = 320usize.div_ceil(16);
        assert_eq!(roi_word(&map, mb_w, 1, 1), 4);
        assert_eq!(roi_word(&map, mb_w, 0, 0), 0);
    }

    #[test]
    fn pad_expands_to_engine_strides() {
        let size = Resolution::new(100, 50);
        let mut tight = vec![0u8; 100 * 50 * 3 / 2];
        tight[0] = 7;
        tight[100 * 50] = 9; // first chroma byte
        let padded = pad_nv12(&Bytes::from(tight), size, 112, 56);
        assert_eq!(padded.len(), 112 * 56 * 3 / 2);
        assert_eq!(padded[0], 7);
        assert_eq!(padded[112 * 56], 9);
    }

    #[test]
    fn flush_restarts_layer_cycle() {
        let mut h = harness();
        h.params.lock().unwrap().temporal_layering =
            TemporalLayering { layer_count: 2, b_layer_count: 0 };
        h.pipeline.process_work(frame_work(0));
        h.pipeline.process_work(frame_work(1));
        h.pipeline.poll();
        h.pipeline.on_flush();

        // After the flush the next input sits at the base-layer slot again
        // and a pending sync request fires immediately.
        h.params.lock().unwrap().request_sync_frame = true;
        h.pipeline.process_work(frame_work(2));
        h.pipeline.poll();
        let done = h.done.lock().unwrap();
        assert!(is_sync(done.last().unwrap()));
    }
}
