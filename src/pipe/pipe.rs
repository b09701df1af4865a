//! Pipe: one dispatch context and its worker thread
//!
//! A pipe owns one or more stages. Stages chained on the fly share their
//! predecessor's pipe and run back to back on the same worker; a
//! memory-to-memory link starts a new pipe with its own input queue.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::cancel::{CancelToken, Wait};
use crate::error::{PipelineError, Result};
use crate::frame::{
    BufferTap, EntityBufferState, EntityState, EntityType, Frame, SourceBinding, StageId,
};
use crate::pipe::device::{StageDevice, StageJob, StageOutput};
use crate::pipe::queue::FrameQueue;
use crate::utils::lock;
use crate::PipelineConfig;

/// Destination pool for one output position of a stage
#[derive(Debug, Clone)]
pub struct OutputBinding {
    pub manager: Arc<BufferManager>,
    /// Exhaustion drops the output instead of failing the stage
    pub optional: bool,
}

/// Everything a pipe needs to run one stage
pub struct PipeMember {
    pub stage: StageId,
    pub kind: EntityType,
    pub outputs: Vec<OutputBinding>,
    pub device: Box<dyn StageDevice>,
}

struct Member {
    stage: StageId,
    kind: EntityType,
    outputs: Vec<OutputBinding>,
    device: Mutex<Box<dyn StageDevice>>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    aborted: AtomicU64,
    dispatch_us: AtomicU64,
}

/// Point-in-time view of a pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeStats {
    pub name: String,
    pub running: bool,
    /// Stage dispatches that reached a terminal state
    pub processed: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Frames aborted by stop
    pub aborted: u64,
    pub queued: usize,
    pub avg_dispatch: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    stage_timeout: Duration,
    pop_timeout: Duration,
    retry_attempts: u32,
}

enum Flow {
    Continue,
    Cancelled,
}

struct Shared {
    name: String,
    members: Vec<Member>,
    input: Arc<FrameQueue>,
    output: OnceCell<Arc<FrameQueue>>,
    /// Frames interrupted by stop, for the owner to release
    abort_sink: Arc<FrameQueue>,
    cancel: Mutex<CancelToken>,
    running: AtomicBool,
    in_dispatch: AtomicUsize,
    settings: Settings,
    counters: CachePadded<Counters>,
}

pub struct Pipe {
    id: StageId,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipe {
    /// Build a stopped pipe. `members` run in order for every frame.
    pub fn new(
        name: impl Into<String>,
        members: Vec<PipeMember>,
        config: &PipelineConfig,
        abort_sink: Arc<FrameQueue>,
    ) -> Result<Self> {
        let name = name.into();
        let Some(first) = members.first() else {
            return Err(PipelineError::Topology(format!("pipe {} has no stages", name)));
        };
        let id = first.stage;

        let members = members
            .into_iter()
            .map(|member| Member {
                stage: member.stage,
                kind: member.kind,
                outputs: member.outputs,
                device: Mutex::new(member.device),
            })
            .collect();

        let cancel = CancelToken::new();
        cancel.cancel();

        Ok(Self {
            id,
            shared: Arc::new(Shared {
                input: Arc::new(FrameQueue::bounded(format!("{}-in", name), config.queue_depth)),
                name,
                members,
                output: OnceCell::new(),
                abort_sink,
                cancel: Mutex::new(cancel),
                running: AtomicBool::new(false),
                in_dispatch: AtomicUsize::new(0),
                settings: Settings {
                    stage_timeout: config.stage_timeout(),
                    pop_timeout: config.pop_timeout(),
                    retry_attempts: config.buffer_retry_attempts.max(1),
                },
                counters: CachePadded::new(Counters::default()),
            }),
            worker: Mutex::new(None),
        })
    }

    /// First stage of the pipe, used as its identifier
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stages(&self) -> Vec<StageId> {
        self.shared.members.iter().map(|member| member.stage).collect()
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.shared.members.iter().any(|member| member.stage == stage)
    }

    pub fn input(&self) -> Arc<FrameQueue> {
        self.shared.input.clone()
    }

    /// Wire where finished frames go. Fixed for the pipe's lifetime.
    pub fn set_output_queue(&self, queue: Arc<FrameQueue>) -> Result<()> {
        self.shared
            .output
            .set(queue)
            .map_err(|_| {
                PipelineError::AlreadyConfigured(format!("output of {}", self.shared.name))
            })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(pipe = %self.shared.name))]
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!("{} already running", self.shared.name);
            return Ok(());
        }

        for member in &self.shared.members {
            lock(&member.device).start()?;
        }

        let cancel = CancelToken::new();
        *lock(&self.shared.cancel) = cancel.clone();
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("pipe-{}", self.shared.name))
            .spawn(move || shared.run(cancel))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                PipelineError::InvalidState(format!("failed to spawn {}: {}", self.shared.name, e))
            })?;
        *worker = Some(handle);

        info!("Pipe {} started ({:?})", self.shared.name, self.stages());
        Ok(())
    }

    /// Signal the worker to stop without waiting for it
    pub fn request_stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        lock(&self.shared.cancel).cancel();
    }

    /// Wait for the worker, then abort whatever is still queued.
    /// Returns how many queued frames were drained.
    pub fn join(&self) -> usize {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Pipe {} worker panicked", self.shared.name);
            }
        }

        let drained = self.shared.input.drain();
        let count = drained.len();
        for frame in drained {
            self.shared.abort(frame, "drained on stop");
        }
        count
    }

    /// Idempotent full stop: signal, join, drain, stop devices
    #[instrument(skip(self), fields(pipe = %self.shared.name))]
    pub fn stop(&self) -> Result<()> {
        let was_running = self.is_running();
        self.request_stop();
        let drained = self.join();

        let mut result = Ok(());
        for member in &self.shared.members {
            if let Err(e) = lock(&member.device).stop() {
                warn!("{} failed to stop {}: {}", self.shared.name, member.stage, e);
                result = Err(e);
            }
        }
        if was_running {
            info!("Pipe {} stopped, {} queued frames drained", self.shared.name, drained);
        }
        result
    }

    /// Enqueue a frame, blocking while the input queue is full.
    ///
    /// A frame rejected because the pipe is not running is aborted and
    /// handed to the abort sink.
    pub fn push_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_running() {
            self.shared.abort(frame, "pipe not running");
            return Err(PipelineError::PipeStopped(self.id));
        }
        let cancel = lock(&self.shared.cancel).clone();
        trace!("{} <- F{}", self.shared.name, frame.frame_count());
        match self.shared.input.push(frame, &cancel) {
            Ok(()) => Ok(()),
            Err(frame) => {
                self.shared.abort(frame, "pipe stopped during push");
                Err(PipelineError::PipeStopped(self.id))
            }
        }
    }

    pub fn set_control(&self, stage: StageId, id: u32, value: i64) -> Result<()> {
        let member = self.shared.member(stage)?;
        debug!("{} control {} = {}", stage, id, value);
        lock(&member.device).set_control(id, value)
    }

    pub fn control(&self, stage: StageId, id: u32) -> Result<Option<i64>> {
        let member = self.shared.member(stage)?;
        Ok(lock(&member.device).control(id))
    }

    /// Frames queued plus the one being dispatched
    pub fn running_frame_count(&self) -> usize {
        self.shared.input.len() + self.shared.in_dispatch.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipeStats {
        let counters = &self.shared.counters;
        let processed = counters.processed.load(Ordering::Relaxed);
        let dispatch_us = counters.dispatch_us.load(Ordering::Relaxed);
        PipeStats {
            name: self.shared.name.clone(),
            running: self.is_running(),
            processed,
            errors: counters.errors.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            aborted: counters.aborted.load(Ordering::Relaxed),
            queued: self.shared.input.len(),
            avg_dispatch: Duration::from_micros(dispatch_us.checked_div(processed).unwrap_or(0)),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.shared.name)
            .field("stages", &self.stages())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Shared {
    fn member(&self, stage: StageId) -> Result<&Member> {
        self.members
            .iter()
            .find(|member| member.stage == stage)
            .ok_or(PipelineError::UnknownStage(stage))
    }

    fn run(&self, cancel: CancelToken) {
        debug!("Pipe {} worker up", self.name);
        loop {
            match self.input.pop(self.settings.pop_timeout, &cancel) {
                Wait::Ready(frame) => {
                    self.in_dispatch.fetch_add(1, Ordering::AcqRel);
                    self.process(frame, &cancel);
                    self.in_dispatch.fetch_sub(1, Ordering::AcqRel);
                }
                Wait::TimedOut => continue,
                Wait::Cancelled | Wait::Closed => break,
            }
        }
        debug!("Pipe {} worker down", self.name);
    }

    fn process(&self, frame: Frame, cancel: &CancelToken) {
        for member in &self.members {
            if !frame.has_stage(member.stage) {
                continue;
            }
            if let Flow::Cancelled = self.dispatch(member, &frame, cancel) {
                self.abort(frame, "pipe stopped during dispatch");
                return;
            }
        }
        self.forward(frame, cancel);
    }

    fn forward(&self, frame: Frame, cancel: &CancelToken) {
        let Some(output) = self.output.get() else {
            warn!("{} has no output queue, F{} aborted", self.name, frame.frame_count());
            self.abort(frame, "no output queue");
            return;
        };
        trace!("{} -> {} F{}", self.name, output.name(), frame.frame_count());
        if let Err(frame) = output.push(frame, cancel) {
            self.abort(frame, "pipe stopped during forward");
        }
    }

    /// Abort remaining stages and hand the frame to the owner for release
    fn abort(&self, frame: Frame, reason: &str) {
        let aborted = frame.abort_remaining(reason);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} aborted F{} ({} stages): {}",
            self.name,
            frame.frame_count(),
            aborted,
            reason
        );
        if let Err(frame) = self.abort_sink.try_push(frame) {
            let released = frame.release_buffers();
            warn!(
                "{} abort sink unavailable, F{} released {} buffers directly",
                self.name,
                frame.frame_count(),
                released
            );
        }
    }

    fn dispatch(&self, member: &Member, frame: &Frame, cancel: &CancelToken) -> Flow {
        let stage = member.stage;
        let started = Instant::now();
        let state = match frame.entity_state(stage) {
            Ok(state) => state,
            Err(e) => {
                error!("{} F{}: {}", self.name, frame.frame_count(), e);
                return Flow::Continue;
            }
        };

        match state {
            EntityState::Complete | EntityState::Error => return Flow::Continue,
            EntityState::Processing => {
                error!("{} F{} {} dispatched twice", self.name, frame.frame_count(), stage);
                return Flow::Continue;
            }
            EntityState::Unprepared | EntityState::Requested => {}
        }

        let input = self.check_input(member, frame);
        if state == EntityState::Unprepared {
            if input.is_ok() {
                if let Flow::Cancelled = self.prepare(member, frame, cancel) {
                    return Flow::Cancelled;
                }
            }
            if let Err(e) = frame.setup_stage(stage) {
                return self.reject(frame, stage, e);
            }
        }
        if let Err(e) = frame.begin_stage(stage) {
            return self.reject(frame, stage, e);
        }

        let validated = input.and_then(|()| self.check_output(member, frame));
        if let Err(reason) = validated {
            debug!("{} F{} {} invalid: {}", self.name, frame.frame_count(), stage, reason);
            self.finish_failed(frame, stage, reason);
            return Flow::Continue;
        }

        let job = StageJob {
            frame: frame.clone(),
            stage,
            src: frame.src_buffer(stage),
            dst: (0..member.outputs.len())
                .map(|pos| match frame.dst_state(stage, pos) {
                    Some(EntityBufferState::Processing) => frame.dst_buffer(stage, pos),
                    _ => None,
                })
                .collect(),
        };
        let outputs: Vec<Option<Buffer>> = job.dst.clone();

        let submitted = lock(&member.device).submit(job);
        let completion = match submitted {
            Ok(completion) => completion,
            Err(e) => {
                warn!("{} F{} {} submit failed: {}", self.name, frame.frame_count(), stage, e);
                self.finish_failed(frame, stage, e.to_string());
                return Flow::Continue;
            }
        };

        let flow = match completion.wait(self.settings.stage_timeout, cancel) {
            Wait::Ready(Ok(output)) => {
                self.finish_ok(member, frame, output, &outputs);
                Flow::Continue
            }
            Wait::Ready(Err(e)) => {
                warn!("{} F{} {} failed: {}", self.name, frame.frame_count(), stage, e);
                self.finish_failed(frame, stage, e.to_string());
                Flow::Continue
            }
            Wait::TimedOut => {
                let e = PipelineError::StageTimeout {
                    stage,
                    frame_count: frame.frame_count(),
                    timeout: self.settings.stage_timeout,
                };
                warn!("{}: {}", self.name, e);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("campipe_stage_timeouts_total", "stage" => stage.to_string())
                    .increment(1);
                lock(&member.device).abort_job(frame.frame_count());
                self.finish_failed(frame, stage, e.to_string());
                Flow::Continue
            }
            Wait::Closed => {
                self.finish_failed(frame, stage, "device dropped the job".to_string());
                Flow::Continue
            }
            Wait::Cancelled => {
                lock(&member.device).abort_job(frame.frame_count());
                if let Err(e) = frame.abort_stage(stage, "pipe stopped during dispatch") {
                    warn!(
                        "{} F{} abort of {} failed: {}",
                        self.name,
                        frame.frame_count(),
                        stage,
                        e
                    );
                }
                Flow::Cancelled
            }
        };

        self.counters
            .dispatch_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        flow
    }

    /// Attach destination buffers for an unprepared stage.
    ///
    /// Exhausted optional outputs are dropped; an exhausted mandatory output
    /// leaves the slot empty so validation fails the stage.
    fn prepare(&self, member: &Member, frame: &Frame, cancel: &CancelToken) -> Flow {
        for (pos, binding) in member.outputs.iter().enumerate() {
            let manager = &binding.manager;
            match manager.get_buffer_with_backoff(self.settings.retry_attempts, cancel) {
                Ok(buffer) => {
                    let index = buffer.index();
                    if let Err(e) = frame.attach_dst(member.stage, pos, index, manager.clone()) {
                        error!("{} F{}: {}", self.name, frame.frame_count(), e);
                        if let Err(e) = manager.cancel_buffer(index) {
                            warn!("{} could not return buffer {}: {}", self.name, index, e);
                        }
                    }
                }
                Err(PipelineError::Cancelled) => return Flow::Cancelled,
                Err(e) => {
                    if let Err(e) = frame.drop_dst(member.stage, pos) {
                        warn!(
                            "{} F{} drop of output {}: {}",
                            self.name,
                            frame.frame_count(),
                            pos,
                            e
                        );
                    }
                    if binding.optional {
                        debug!(
                            "{} F{} dropped optional output {} of {}: {}",
                            self.name,
                            frame.frame_count(),
                            pos,
                            member.stage,
                            e
                        );
                    } else {
                        warn!("{} F{} {}: {}", self.name, frame.frame_count(), member.stage, e);
                    }
                }
            }
        }
        Flow::Continue
    }

    fn check_input(&self, member: &Member, frame: &Frame) -> std::result::Result<(), String> {
        if !member.kind.needs_input() {
            return Ok(());
        }
        let source = frame
            .entity(member.stage)
            .map(|entity| entity.source())
            .map_err(|e| e.to_string())?;
        match source {
            SourceBinding::None => Err("stage needs an input but has no source".to_string()),
            SourceBinding::Upstream { stage, pos } => {
                match frame.tap_state(BufferTap::src(member.stage)) {
                    Some(EntityBufferState::Valid) => Ok(()),
                    state => Err(format!("upstream {} output {} is {:?}", stage, pos, state)),
                }
            }
            SourceBinding::External => match frame.src_buffer(member.stage) {
                Some(_) => Ok(()),
                None => Err("no input buffer attached".to_string()),
            },
        }
    }

    fn check_output(&self, member: &Member, frame: &Frame) -> std::result::Result<(), String> {
        if !member.kind.needs_output() {
            return Ok(());
        }
        let has_output = frame
            .with_entity(member.stage, |entity| entity.has_requested_output())
            .unwrap_or(false);
        if has_output {
            Ok(())
        } else {
            Err("no output buffer available".to_string())
        }
    }

    fn finish_ok(
        &self,
        member: &Member,
        frame: &Frame,
        output: StageOutput,
        outputs: &[Option<Buffer>],
    ) {
        for (pos, buffer) in outputs.iter().enumerate() {
            let valid = output.valid.get(pos).copied().unwrap_or(false);
            if let (true, Some(buffer)) = (valid, buffer) {
                if let Err(e) = member.outputs[pos].manager.mark_filled(buffer.index()) {
                    warn!(
                        "{} F{} could not mark buffer {} filled: {}",
                        self.name,
                        frame.frame_count(),
                        buffer.index(),
                        e
                    );
                }
            }
        }
        match frame.complete_stage(member.stage, &output.valid) {
            Ok(EntityState::Complete) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                trace!("{} F{} {} complete", self.name, frame.frame_count(), member.stage);
            }
            Ok(_) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{} F{} {} produced no valid output",
                    self.name,
                    frame.frame_count(),
                    member.stage
                );
            }
            Err(e) => {
                self.reject(frame, member.stage, e);
            }
        }
    }

    fn finish_failed(&self, frame: &Frame, stage: StageId, reason: String) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = frame.fail_stage(stage, reason) {
            self.reject(frame, stage, e);
        }
    }

    /// A state-machine violation: report it and force the entity terminal
    fn reject(&self, frame: &Frame, stage: StageId, e: PipelineError) -> Flow {
        error!("{} F{} {}: {}", self.name, frame.frame_count(), stage, e);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = frame.abort_stage(stage, &e.to_string()) {
            warn!(
                "{} F{} {} could not be aborted: {}",
                self.name,
                frame.frame_count(),
                stage,
                e
            );
        }
        Flow::Continue
    }
}
