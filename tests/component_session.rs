// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Full-session exercises through the threaded component envelope, backed by
//! the scripted engine.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use mpp_c2::buffer::{NativeHandle, SlotPool};
use mpp_c2::component::decoder::DecoderPipeline;
use mpp_c2::component::encoder::EncoderPipeline;
use mpp_c2::component::{Component, ComponentState, ErrorCb, FlushMode, WorkDoneCb};
use mpp_c2::engine::fake::{FakeDecodeEngine, FakeEncodeEngine};
use mpp_c2::engine::{
    DecControl, DecodeEngine, EncCfg, EncodeEngine, EngineCodedPacket, EngineFrame,
    EngineFrameDesc, EnginePacket,
};
use mpp_c2::params::{Param, Params, PictureType, TemporalLayering};
use mpp_c2::work::{DrainMode, Status, Work, WorkFlags, WorkInput, WorkOrdinal};
use mpp_c2::work_queue::WorkQueue;
use mpp_c2::{CodedFormat, Resolution};

#[derive(Clone)]
struct SharedDecodeEngine(Arc<Mutex<FakeDecodeEngine>>);

impl DecodeEngine for SharedDecodeEngine {
    fn init(&mut self, coding: CodedFormat) -> Result<(), Status> {
        self.0.lock().unwrap().init(coding)
    }
    fn put_packet(&mut self, packet: EnginePacket) -> Result<(), Status> {
        self.0.lock().unwrap().put_packet(packet)
    }
    fn get_frame(&mut self) -> Result<Option<EngineFrame>, Status> {
        self.0.lock().unwrap().get_frame()
    }
    fn register_buffer(&mut self, handle: &NativeHandle) -> Result<u32, Status> {
        self.0.lock().unwrap().register_buffer(handle)
    }
    fn submit_buffer(&mut self, slot: u32) -> Result<(), Status> {
        self.0.lock().unwrap().submit_buffer(slot)
    }
    fn release_buffer(&mut self, slot: u32) -> Result<(), Status> {
        self.0.lock().unwrap().release_buffer(slot)
    }
    fn set_info_change_ready(&mut self) -> Result<(), Status> {
        self.0.lock().unwrap().set_info_change_ready()
    }
    fn reset(&mut self) -> Result<(), Status> {
        self.0.lock().unwrap().reset()
    }
    fn control(&mut self, cmd: DecControl) -> Result<(), Status> {
        self.0.lock().unwrap().control(cmd)
    }
}

#[derive(Clone)]
struct SharedEncodeEngine(Arc<Mutex<FakeEncodeEngine>>);

impl EncodeEngine for SharedEncodeEngine {
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

struct Session {
    component: Component,
    queue: Arc<Mutex<WorkQueue>>,
    done: Arc<Mutex<Vec<Work>>>,
    errors: Arc<Mutex<Vec<Status>>>,
}

fn decode_session(engine: Arc<Mutex<FakeDecodeEngine>>) -> Session {
    let queue = Arc::new(Mutex::new(WorkQueue::new()));
    let params = Arc::new(Mutex::new(Params::default()));
    let done: Arc<Mutex<Vec<Work>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));

    let done_in_cb = done.clone();
    let work_done_cb: WorkDoneCb =
        Arc::new(Mutex::new(move |work: Work| done_in_cb.lock().unwrap().push(work)));
    let errors_in_cb = errors.clone();
    let error_cb: ErrorCb =
        Arc::new(Mutex::new(move |status: Status| errors_in_cb.lock().unwrap().push(status)));

    let pipeline = DecoderPipeline::new(
        CodedFormat::H264,
        Box::new(SharedDecodeEngine(engine)),
        Box::new(SlotPool::new(64)),
        queue.clone(),
        params.clone(),
        error_cb.clone(),
        work_done_cb.clone(),
    );
    let component =
        Component::new(Box::new(pipeline), queue.clone(), params, error_cb, work_done_cb).unwrap();
    Session { component, queue, done, errors }
}

fn encode_session(engine: Arc<Mutex<FakeEncodeEngine>>, params: Params) -> Session {
    let queue = Arc::new(Mutex::new(WorkQueue::new()));
    let params = Arc::new(Mutex::new(params));
    let done: Arc<Mutex<Vec<Work>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));

    let done_in_cb = done.clone();
    let work_done_cb: WorkDoneCb =
        Arc::new(Mutex::new(move |work: Work| done_in_cb.lock().unwrap().push(work)));
    let errors_in_cb = errors.clone();
    let error_cb: ErrorCb =
        Arc::new(Mutex::new(move |status: Status| errors_in_cb.lock().unwrap().push(status)));

    let pipeline = EncoderPipeline::new(
        CodedFormat::H264,
        Box::new(SharedEncodeEngine(engine)),
        Box::new(SlotPool::new(32)),
        queue.clone(),
        params.clone(),
        error_cb.clone(),
        work_done_cb.clone(),
    );
    let component =
        Component::new(Box::new(pipeline), queue.clone(), params, error_cb, work_done_cb).unwrap();
    Session { component, queue, done, errors }
}

fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(deadline_ms) {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

fn config_work() -> Work {
    Work::new(WorkInput {
        ordinal: WorkOrdinal::new(0, 0),
        flags: WorkFlags::CODEC_CONFIG,
        buffers: vec![Bytes::from_static(b"sps-and-pps")],
        ..Default::default()
    })
}

fn picture_work(frame_index: u64) -> Work {
    Work::new(WorkInput {
        ordinal: WorkOrdinal::new(frame_index, frame_index as i64 * 33_333),
        buffers: vec![Bytes::from_static(&[0u8; 32])],
        ..Default::default()
    })
}

fn raw_frame_work(frame_index: u64) -> Work {
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

#[test]
fn decode_session_with_resolution_change() {
    let engine = Arc::new(Mutex::new(FakeDecodeEngine::new(Resolution::new(320, 240))));
    let mut s = decode_session(engine.clone());
    assert_eq!(s.component.start(), Status::Ok);

    let mut works = vec![config_work()];
    works.extend((1..=4).map(picture_work));
    assert_eq!(s.component.queue_nb(works), Status::Ok);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 5));

    engine.lock().unwrap().schedule_info_change(6, Resolution::new(640, 480));
    assert_eq!(s.component.queue_nb((5..=8).map(picture_work).collect()), Status::Ok);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 9));

    let done = s.done.lock().unwrap();
    let indices: Vec<u64> = done[1..].iter().map(|w| w.frame_index()).collect();
    assert_eq!(indices, (1..=8).collect::<Vec<u64>>());
    assert!(done[1..].iter().all(|w| w.result == Status::Ok));

    // One republish for the initial geometry, one for the mid-stream change.
    let info_changes: Vec<&Work> = done
        .iter()
        .filter(|w| w.worklet.flags.contains(WorkFlags::INFO_CHANGE))
        .collect();
    assert_eq!(info_changes.len(), 2);
    assert!(info_changes[1].worklet.config_updates.iter().any(
        |p| matches!(p, Param::PictureSize(size) if *size == Resolution::new(640, 480))
    ));
    assert_eq!(s.component.query().picture_size, Resolution::new(640, 480));
    assert!(s.errors.lock().unwrap().is_empty());
}

#[test]
fn decode_flush_then_resume() {
    let engine = Arc::new(Mutex::new(FakeDecodeEngine::new(Resolution::new(320, 240))));
    let mut s = decode_session(engine);
    s.component.start();

    s.component.queue_nb(vec![config_work(), picture_work(1)]);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 2));

    s.component.queue_nb((2..=11).map(picture_work).collect());
    let mut flushed = Vec::new();
    assert_eq!(s.component.flush_sm(FlushMode::Component, &mut flushed), Status::Ok);
    // The call blocks until the worker retires the flush.
    assert!(!s.component.is_flushing());

    // Every work item is accounted for exactly once: completed before the
    // flush landed, returned through it, or still parked in flight.
    assert!(wait_until(2000, || {
        let done = s.done.lock().unwrap().len();
        let parked = s.queue.lock().unwrap().pending_len();
        done + flushed.len() + parked == 12
    }));
    assert!(flushed.iter().all(|w| w.worklets_processed == 1));

    s.component.queue_nb(vec![picture_work(20)]);
    assert!(wait_until(2000, || {
        s.done.lock().unwrap().last().map(|w| w.frame_index()) == Some(20)
    }));
    assert_eq!(s.done.lock().unwrap().last().unwrap().result, Status::Ok);
}

#[test]
fn decode_stop_and_restart_renegotiates_geometry() {
    let engine = Arc::new(Mutex::new(FakeDecodeEngine::new(Resolution::new(320, 240))));
    let mut s = decode_session(engine);
    s.component.start();
    s.component.queue_nb(vec![config_work(), picture_work(1)]);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 2));
    assert_eq!(s.component.stop(), Status::Ok);
    assert_eq!(s.component.state(), ComponentState::Stopped);

    assert_eq!(s.component.start(), Status::Ok);
    s.component.queue_nb(vec![config_work(), picture_work(1), picture_work(2)]);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 5));

    let done = s.done.lock().unwrap();
    // Both streams open with a geometry handshake on their first picture.
    let info_changes = done
        .iter()
        .filter(|w| w.worklet.flags.contains(WorkFlags::INFO_CHANGE))
        .count();
    assert_eq!(info_changes, 2);
    assert!(done.iter().all(|w| w.result == Status::Ok));
}

#[test]
fn decode_drain_completes_queued_work() {
    let engine = Arc::new(Mutex::new(FakeDecodeEngine::new(Resolution::new(320, 240))));
    let mut s = decode_session(engine);
    s.component.start();

    let mut works = vec![config_work()];
    works.extend((1..=3).map(picture_work));
    s.component.queue_nb(works);
    assert_eq!(s.component.drain_nb(DrainMode::WithEos), Status::Ok);

    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 4));
    assert_eq!(s.component.state(), ComponentState::Running);
    assert!(s.component.is_alive());
}

#[test]
fn encode_session_with_temporal_layers_and_eos() {
    let engine = Arc::new(Mutex::new(FakeEncodeEngine::new()));
    let mut params = Params::default();
    params.temporal_layering = TemporalLayering { layer_count: 3, b_layer_count: 0 };
    let mut s = encode_session(engine, params);
    s.component.start();

    let mut works: Vec<Work> = (0..8).map(raw_frame_work).collect();
    works.push(eos_work(8));
    s.component.queue_nb(works);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 9));

    let done = s.done.lock().unwrap();
    let indices: Vec<u64> = done.iter().map(|w| w.frame_index()).collect();
    assert_eq!(indices, (0..=8).collect::<Vec<u64>>());

    let csd_count = done
        .iter()
        .flat_map(|w| w.worklet.config_updates.iter())
        .filter(|p| matches!(p, Param::CodecSpecificData(_)))
        .count();
    assert_eq!(csd_count, 1);

    let last = done.last().unwrap();
    assert!(last.worklet.flags.contains(WorkFlags::END_OF_STREAM));
    assert!(last.worklet.buffers.is_empty());
    assert!(s.errors.lock().unwrap().is_empty());
}

#[test]
fn encode_sync_frame_request_mid_stream() {
    let engine = Arc::new(Mutex::new(FakeEncodeEngine::new()));
    let mut s = encode_session(engine, Params::default());
    s.component.start();

    s.component.queue_nb((0..4).map(raw_frame_work).collect());
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 4));

    assert!(s.component.config(vec![Param::RequestSyncFrame(true)]).is_empty());
    s.component.queue_nb((4..6).map(raw_frame_work).collect());
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 6));

    let done = s.done.lock().unwrap();
    let sync: Vec<bool> = done
        .iter()
        .map(|w| {
            w.worklet.buffers.iter().flat_map(|b| b.infos.iter()).any(
                |p| matches!(p, Param::PictureType(t) if t.contains(PictureType::SYNC_FRAME)),
            )
        })
        .collect();
    // First frame opens the GOP; the requested one follows mid-stream.
    assert!(sync[0]);
    assert!(!sync[1] && !sync[2] && !sync[3]);
    assert!(sync[4]);
    assert!(!sync[5]);
}

#[test]
fn encode_dynamic_bitrate_mid_stream() {
    let engine = Arc::new(Mutex::new(FakeEncodeEngine::new()));
    let mut s = encode_session(engine.clone(), Params::default());
    s.component.start();

    s.component.queue_nb(vec![raw_frame_work(0)]);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 1));

    let mut work = raw_frame_work(1);
    work.input.config_updates = vec![Param::Bitrate(8_000_000)];
    s.component.queue_nb(vec![work]);
    assert!(wait_until(2000, || s.done.lock().unwrap().len() == 2));

    let engine = engine.lock().unwrap();
    assert_eq!(engine.applied_config().get_u32("rc:bps_target"), Some(8_000_000));
    assert_eq!(engine.applied_config().get_str("codec:type"), Some("h264"));
}
