// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Component envelope: lifecycle state machine, the host-facing non-blocking
//! calls and the worker thread that drives a pipeline against the engine.
//!
//! The host owns one [`Component`] per codec session. All host calls return
//! quickly; actual engine work happens on the worker thread, which wakes on
//! an eventfd when work arrives and otherwise ticks on a 10ms timeout to
//! poll the engine for output. One work item is consumed per tick so output
//! draining keeps pace with input.

pub mod decoder;
pub mod encoder;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crate::params::{Param, Params, SettingFailure};
use crate::work::{DrainMode, Status, Work};
use crate::work_queue::WorkQueue;

pub type WorkDoneCb = Arc<Mutex<dyn FnMut(Work) + Send + 'static>>;
pub type ErrorCb = Arc<Mutex<dyn FnMut(Status) + Send + 'static>>;

/// Scope of a `flush_sm` call. Chain flushing would reach into downstream
/// components and is not supported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushMode {
    Component,
    Chain,
}

/// Lifecycle states of a component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentState {
    /// Released; only destruction is valid.
    Uninitialized,
    Stopped,
    Running,
}

/// Per-tick pipeline body. The decoder and encoder implement this; the
/// envelope owns the thread, the queue and the wakeup plumbing.
pub trait PipelineWorker: Send {
    /// Called on the host thread before the worker starts.
    fn on_start(&mut self) -> Result<(), Status>;

    /// Consume one work item. Completion is reported through the pipeline's
    /// own callbacks, possibly on a later tick.
    fn process_work(&mut self, work: Work);

    /// A drain marker reached the head of the queue.
    fn begin_drain(&mut self, mode: DrainMode);

    /// Engine output poll; runs every tick, with or without input.
    fn poll(&mut self);

    /// Deferred half of `flush_sm`: reset engine-side state.
    fn on_flush(&mut self);

    /// Called after the worker has been joined.
    fn on_stop(&mut self);
}

pub struct Component {
    awaiting_job_event: Arc<EventFd>,
    queue: Arc<Mutex<WorkQueue>>,
    params: Arc<Mutex<Params>>,
    pipeline: Arc<Mutex<Box<dyn PipelineWorker>>>,
    state: Arc<Mutex<ComponentState>>,
    error_cb: ErrorCb,
    work_done_cb: WorkDoneCb,
    flushing: Arc<AtomicBool>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Component {
    pub fn new(
        pipeline: Box<dyn PipelineWorker>,
        queue: Arc<Mutex<WorkQueue>>,
        params: Arc<Mutex<Params>>,
        error_cb: ErrorCb,
        work_done_cb: WorkDoneCb,
    ) -> Result<Self, Status> {
        let awaiting_job_event = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE).map_err(|err| {
            log::error!("failed to create job eventfd: {}", err);
            Status::Corrupted
        })?;
        Ok(Self {
            awaiting_job_event: Arc::new(awaiting_job_event),
            queue,
            params,
            pipeline: Arc::new(Mutex::new(pipeline)),
            state: Arc::new(Mutex::new(ComponentState::Stopped)),
            error_cb,
            work_done_cb,
            flushing: Arc::new(AtomicBool::new(false)),
            worker_thread: None,
        })
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    /// Bulk parameter update; valid in every state. Dynamic parameters take
    /// effect on the next processed work.
    pub fn config(&self, updates: Vec<Param>) -> Vec<SettingFailure> {
        self.params.lock().unwrap().apply(updates)
    }

    /// Snapshot of the current parameter values.
    pub fn query(&self) -> Params {
        self.params.lock().unwrap().clone()
    }

    /// Start processing. Valid from `Stopped`.
    pub fn start(&mut self) -> Status {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ComponentState::Stopped {
                (*self.error_cb.lock().unwrap())(Status::BadState);
                return Status::BadState;
            }
            if let Err(status) = self.pipeline.lock().unwrap().on_start() {
                (*self.error_cb.lock().unwrap())(status);
                return status;
            }
            *state = ComponentState::Running;
        }

        let queue = self.queue.clone();
        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let flushing = self.flushing.clone();
        let work_done_cb = self.work_done_cb.clone();
        let error_cb = self.error_cb.clone();
        let awaiting_job_event = self.awaiting_job_event.clone();
        self.worker_thread = Some(thread::spawn(move || {
            process_loop(
                queue,
                pipeline,
                state,
                flushing,
                work_done_cb,
                error_cb,
                awaiting_job_event,
            );
        }));

        Status::Ok
    }

    /// Stop processing and abandon everything in flight. Valid from
    /// `Running`.
    pub fn stop(&mut self) -> Status {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ComponentState::Running {
                (*self.error_cb.lock().unwrap())(Status::BadState);
                return Status::BadState;
            }
            *state = ComponentState::Stopped;
        }
        self.join_worker();

        {
            let mut queue = self.queue.lock().unwrap();
            queue.take_all();
            queue.clear_signalled_error();
        }
        self.pipeline.lock().unwrap().on_stop();
        Status::Ok
    }

    /// Return the component to its freshly-created configuration. Also stops
    /// it if running.
    pub fn reset(&mut self) -> Status {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ComponentState::Uninitialized {
                return Status::BadState;
            }
            *state = ComponentState::Stopped;
        }
        self.join_worker();

        {
            let mut queue = self.queue.lock().unwrap();
            queue.take_all();
            queue.clear_signalled_error();
        }
        self.pipeline.lock().unwrap().on_stop();
        *self.params.lock().unwrap() = Params::default();
        Status::Ok
    }

    /// Final teardown; the component is unusable afterwards. Releasing an
    /// already released component is a no-op.
    pub fn release(&mut self) -> Status {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ComponentState::Uninitialized {
                return Status::Ok;
            }
            *state = ComponentState::Stopped;
        }
        self.join_worker();
        self.pipeline.lock().unwrap().on_stop();
        *self.state.lock().unwrap() = ComponentState::Uninitialized;
        Status::Ok
    }

    /// Queue work. Valid from `Running` only.
    pub fn queue_nb(&mut self, works: Vec<Work>) -> Status {
        if *self.state.lock().unwrap() != ComponentState::Running {
            (*self.error_cb.lock().unwrap())(Status::BadState);
            return Status::BadState;
        }

        // After an unrecoverable failure the call is still accepted, but
        // nothing reaches the engine until the component is reset.
        if self.queue.lock().unwrap().signalled_error() {
            for mut work in works {
                work.result = Status::Corrupted;
                work.fill_empty();
                (*self.work_done_cb.lock().unwrap())(work);
            }
            return Status::Ok;
        }

        let count = works.len() as u64;
        {
            let mut queue = self.queue.lock().unwrap();
            for work in works {
                queue.push_work(work);
            }
        }
        if count > 0 {
            // Semaphore semantics: one wakeup per queued item.
            let _ = self.awaiting_job_event.write(count);
        }
        Status::Ok
    }

    /// Append a drain marker. Valid from `Running` only.
    pub fn drain_nb(&mut self, mode: DrainMode) -> Status {
        if *self.state.lock().unwrap() != ComponentState::Running {
            (*self.error_cb.lock().unwrap())(Status::BadState);
            return Status::BadState;
        }

        let status = self.queue.lock().unwrap().mark_drain(mode);
        if status == Status::Ok && mode != DrainMode::NoDrain {
            let _ = self.awaiting_job_event.write(1);
        }
        status
    }

    /// Flush all queued and in-flight work back to the host. The returned
    /// items carry their input ordinals and empty worklets. Returns once the
    /// worker has retired the engine-side reset, so nothing queued afterwards
    /// can meet stale engine state.
    pub fn flush_sm(&mut self, mode: FlushMode, flushed_work: &mut Vec<Work>) -> Status {
        if mode == FlushMode::Chain {
            return Status::Omitted;
        }
        if *self.state.lock().unwrap() != ComponentState::Running {
            (*self.error_cb.lock().unwrap())(Status::BadState);
            return Status::BadState;
        }

        self.flushing.store(true, Ordering::Release);
        let mut flushed = {
            let mut queue = self.queue.lock().unwrap();
            queue.inc_generation();
            queue.set_pending_flush();
            queue.take_all()
        };
        for work in &mut flushed {
            work.fill_empty();
        }
        flushed_work.append(&mut flushed);

        let _ = self.awaiting_job_event.write(1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while self.flushing.load(Ordering::Acquire) {
            if !self.is_alive() || Instant::now() >= deadline {
                return Status::TimedOut;
            }
            thread::sleep(Duration::from_millis(1));
        }
        Status::Ok
    }

    /// Whether a flush is still being retired on the worker thread.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    fn join_worker(&mut self) {
        let _ = self.awaiting_job_event.write(1);
        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[allow(clippy::too_many_arguments)]
fn process_loop(
    queue: Arc<Mutex<WorkQueue>>,
    pipeline: Arc<Mutex<Box<dyn PipelineWorker>>>,
    state: Arc<Mutex<ComponentState>>,
    flushing: Arc<AtomicBool>,
    work_done_cb: WorkDoneCb,
    error_cb: ErrorCb,
    awaiting_job_event: Arc<EventFd>,
) {
    let epoll_fd = match Epoll::new(EpollCreateFlags::empty()) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to create epoll: {}", err);
            (*error_cb.lock().unwrap())(Status::Corrupted);
            return;
        }
    };
    if let Err(err) =
        epoll_fd.add(awaiting_job_event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
    {
        log::error!("failed to add job event to epoll: {}", err);
        (*error_cb.lock().unwrap())(Status::Corrupted);
        return;
    }

    while *state.lock().unwrap() == ComponentState::Running {
        let mut events = [EpollEvent::empty()];
        // The engine is poll based, so tick even without a wakeup.
        let timeout = EpollTimeout::try_from(Duration::from_millis(10)).unwrap();
        if let Err(err) = epoll_fd.wait(&mut events, timeout) {
            log::error!("epoll wait failed: {}", err);
            (*error_cb.lock().unwrap())(Status::Corrupted);
            break;
        }

        if queue.lock().unwrap().take_pending_flush() {
            pipeline.lock().unwrap().on_flush();
            flushing.store(false, Ordering::Release);
        }

        if events == [EpollEvent::new(EpollFlags::EPOLLIN, 1)] {
            let _ = awaiting_job_event.read();

            let (entry, stale) = queue.lock().unwrap().pop();
            for work in stale {
                (*work_done_cb.lock().unwrap())(work);
            }
            if let Some(entry) = entry {
                let mut pipeline = pipeline.lock().unwrap();
                if let Some(work) = entry.work {
                    pipeline.process_work(work);
                }
                if entry.drain != DrainMode::NoDrain {
                    pipeline.begin_drain(entry.drain);
                }
            }
        }

        pipeline.lock().unwrap().poll();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkInput, WorkOrdinal};
    use std::time::Instant;

    /// Pipeline stub that completes every work item on the spot.
    struct EchoPipeline {
        work_done_cb: WorkDoneCb,
        flushes: Arc<Mutex<u32>>,
        drains: Arc<Mutex<Vec<DrainMode>>>,
    }

    impl PipelineWorker for EchoPipeline {
        fn on_start(&mut self) -> Result<(), Status> {
            Ok(())
        }

        fn process_work(&mut self, mut work: Work) {
            work.fill_empty();
            (*self.work_done_cb.lock().unwrap())(work);
        }

        fn begin_drain(&mut self, mode: DrainMode) {
            self.drains.lock().unwrap().push(mode);
        }

        fn poll(&mut self) {}

        fn on_flush(&mut self) {
            *self.flushes.lock().unwrap() += 1;
        }

        fn on_stop(&mut self) {}
    }

    struct Harness {
        component: Component,
        queue: Arc<Mutex<WorkQueue>>,
        done: Arc<Mutex<Vec<Work>>>,
        errors: Arc<Mutex<Vec<Status>>>,
        flushes: Arc<Mutex<u32>>,
        drains: Arc<Mutex<Vec<DrainMode>>>,
    }

    fn harness() -> Harness {
        let queue = Arc::new(Mutex::new(WorkQueue::new()));
        let done: Arc<Mutex<Vec<Work>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));
        let flushes = Arc::new(Mutex::new(0));
        let drains = Arc::new(Mutex::new(Vec::new()));

        let done_in_cb = done.clone();
        let work_done_cb: WorkDoneCb =
            Arc::new(Mutex::new(move |work: Work| done_in_cb.lock().unwrap().push(work)));
        let errors_in_cb = errors.clone();
        let error_cb: ErrorCb =
            Arc::new(Mutex::new(move |status: Status| errors_in_cb.lock().unwrap().push(status)));

        let pipeline = Box::new(EchoPipeline {
            work_done_cb: work_done_cb.clone(),
            flushes: flushes.clone(),
            drains: drains.clone(),
        });
        let component = Component::new(
            pipeline,
            queue.clone(),
            Arc::new(Mutex::new(Params::default())),
            error_cb,
            work_done_cb,
        )
        .unwrap();

        Harness { component, queue, done, errors, flushes, drains }
    }

    fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    fn work(frame_index: u64) -> Work {
        Work::new(WorkInput {
            ordinal: WorkOrdinal::new(frame_index, frame_index as i64 * 33_333),
            ..Default::default()
        })
    }

    #[test]
    fn lifecycle_transitions() {
        let mut h = harness();
        assert_eq!(h.component.state(), ComponentState::Stopped);
        assert_eq!(h.component.stop(), Status::BadState);
        assert_eq!(h.component.start(), Status::Ok);
        assert_eq!(h.component.start(), Status::BadState);
        assert_eq!(h.component.stop(), Status::Ok);
        assert_eq!(h.component.start(), Status::Ok);
        assert_eq!(h.component.release(), Status::Ok);
        assert_eq!(h.component.state(), ComponentState::Uninitialized);
        assert_eq!(h.component.start(), Status::BadState);
        assert_eq!(h.errors.lock().unwrap().len(), 3);
    }

    #[test]
    fn release_is_idempotent() {
        let mut h = harness();
        h.component.start();
        assert_eq!(h.component.release(), Status::Ok);
        assert_eq!(h.component.release(), Status::Ok);
        assert_eq!(h.component.state(), ComponentState::Uninitialized);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn queue_requires_running() {
        let mut h = harness();
        assert_eq!(h.component.queue_nb(vec![work(0)]), Status::BadState);
        h.component.start();
        assert_eq!(h.component.queue_nb(vec![work(0)]), Status::Ok);
        assert!(wait_until(1000, || h.done.lock().unwrap().len() == 1));
        assert_eq!(h.done.lock().unwrap()[0].frame_index(), 0);
    }

    #[test]
    fn worker_processes_in_order() {
        let mut h = harness();
        h.component.start();
        h.component.queue_nb((0..16).map(work).collect());
        assert!(wait_until(1000, || h.done.lock().unwrap().len() == 16));
        let indices: Vec<u64> =
            h.done.lock().unwrap().iter().map(|w| w.frame_index()).collect();
        assert_eq!(indices, (0..16).collect::<Vec<u64>>());
    }

    #[test]
    fn drain_marker_reaches_pipeline() {
        let mut h = harness();
        assert_eq!(h.component.drain_nb(DrainMode::WithEos), Status::BadState);
        h.component.start();
        assert_eq!(h.component.drain_nb(DrainMode::Chain), Status::Omitted);
        assert_eq!(h.component.drain_nb(DrainMode::WithEos), Status::Ok);
        assert!(wait_until(1000, || h.drains.lock().unwrap().len() == 1));
        assert_eq!(h.drains.lock().unwrap()[0], DrainMode::WithEos);
    }

    #[test]
    fn flush_returns_queued_work_and_resets_pipeline() {
        let mut h = harness();
        h.component.start();
        // Stuff the queue while the worker is busy; some items may complete
        // before the flush lands, the rest must come back through it.
        h.component.queue_nb((0..32).map(work).collect());
        let mut flushed = Vec::new();
        assert_eq!(h.component.flush_sm(FlushMode::Component, &mut flushed), Status::Ok);
        // The call returns only after the worker retired the engine reset.
        assert_eq!(*h.flushes.lock().unwrap(), 1);
        assert!(!h.component.is_flushing());

        let done = h.done.lock().unwrap().len();
        assert_eq!(done + flushed.len(), 32);
        assert!(flushed.iter().all(|w| w.worklets_processed == 1));
    }

    #[test]
    fn signalled_error_fails_new_work_until_reset() {
        let mut h = harness();
        h.component.start();
        h.queue.lock().unwrap().set_signalled_error();

        // Still accepted, but every item comes back corrupted.
        assert_eq!(h.component.queue_nb(vec![work(0), work(1)]), Status::Ok);
        assert!(wait_until(1000, || h.done.lock().unwrap().len() == 2));
        assert!(h.done.lock().unwrap().iter().all(|w| w.result == Status::Corrupted));

        assert_eq!(h.component.reset(), Status::Ok);
        assert!(!h.queue.lock().unwrap().signalled_error());
        h.component.start();
        assert_eq!(h.component.queue_nb(vec![work(2)]), Status::Ok);
        assert!(wait_until(1000, || h.done.lock().unwrap().len() == 3));
        assert_eq!(h.done.lock().unwrap()[2].result, Status::Ok);
    }

    #[test]
    fn chain_flush_is_omitted() {
        let mut h = harness();
        h.component.start();
        h.component.queue_nb(vec![work(0)]);
        let mut flushed = Vec::new();
        assert_eq!(h.component.flush_sm(FlushMode::Chain, &mut flushed), Status::Omitted);
        assert!(flushed.is_empty());
    }

    #[test]
    fn flush_invalidates_queued_generation() {
        let mut h = harness();
        h.component.start();
        let mut flushed = Vec::new();
        h.component.flush_sm(FlushMode::Component, &mut flushed);
        assert!(flushed.is_empty());
        // Work queued after the flush runs normally.
        h.component.queue_nb(vec![work(7)]);
        assert!(wait_until(1000, || h.done.lock().unwrap().len() == 1));
        assert_eq!(h.done.lock().unwrap()[0].result, Status::Ok);
    }
}
