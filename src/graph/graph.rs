//! PipelineGraph: pipes, pools and the frame tracking list for one mode

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument, warn};

use crate::buffer::{BufferManager, MemoryBudget};
use crate::cancel::{CancelToken, Wait};
use crate::error::{PipelineError, Result};
use crate::frame::{BufferTap, Entity, Frame, FrameList, StageId};
use crate::graph::topology::{OperatingMode, Topology};
use crate::pipe::{FrameQueue, OutputBinding, Pipe, PipeMember, PipeStats, StageDevice};
use crate::utils::lock;
use crate::PipelineConfig;

/// Devices keyed by the stage they serve
pub type DeviceSet = BTreeMap<StageId, Box<dyn StageDevice>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Pipes wired, pools not yet allocated
    Created,
    /// Pools allocated
    Initialized,
    Running,
    Stopped,
}

/// What `stop` had to clean up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Frames interrupted in a pipe or its queue
    pub aborted: usize,
    /// Finished frames nobody consumed
    pub unconsumed: usize,
    /// Tracked frames that never entered a pipe
    pub orphaned: usize,
    pub buffers_released: usize,
    /// Frames still pinned by a capture selector
    pub still_locked: usize,
}

pub struct PipelineGraph {
    topology: Topology,
    frames: Arc<FrameList>,
    managers: BTreeMap<String, Arc<BufferManager>>,
    /// One pipe per dispatch context, producers first
    pipes: Vec<Pipe>,
    stage_to_pipe: BTreeMap<StageId, usize>,
    completed: Arc<FrameQueue>,
    abort_sink: Arc<FrameQueue>,
    /// Optional-stage switches, read by `create_frame`
    requests: ArcSwap<BTreeMap<StageId, bool>>,
    next_count: AtomicU32,
    state: Mutex<GraphState>,
    cancel: Mutex<CancelToken>,
}

impl PipelineGraph {
    /// Validate `topology`, create its pools and wire one pipe per dispatch
    /// context. Pools are allocated on `initialize`/`start`.
    pub fn new(
        topology: Topology,
        config: &PipelineConfig,
        frames: Arc<FrameList>,
        mut devices: DeviceSet,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        topology.validate()?;

        let managers: BTreeMap<String, Arc<BufferManager>> = topology
            .managers
            .iter()
            .map(|cfg| {
                let manager = BufferManager::new(&cfg.name, cfg.mode, budget.clone());
                (cfg.name.clone(), Arc::new(manager))
            })
            .collect();

        let abort_sink = Arc::new(FrameQueue::unbounded("aborted"));
        let completed = Arc::new(FrameQueue::bounded("completed", config.queue_depth * 2));

        let mut pipes = Vec::new();
        let mut stage_to_pipe = BTreeMap::new();
        for group in topology.dispatch_contexts() {
            let mut members = Vec::with_capacity(group.len());
            for stage in &group {
                let device = devices.remove(&stage.id).ok_or_else(|| {
                    PipelineError::Topology(format!("no device for stage {}", stage.name))
                })?;
                let outputs = stage
                    .outputs
                    .iter()
                    .map(|output| OutputBinding {
                        manager: managers[&output.manager].clone(),
                        optional: output.optional,
                    })
                    .collect();
                stage_to_pipe.insert(stage.id, pipes.len());
                members.push(PipeMember {
                    stage: stage.id,
                    kind: stage.kind,
                    outputs,
                    device,
                });
            }
            pipes.push(Pipe::new(group[0].name.clone(), members, config, abort_sink.clone())?);
        }

        for (index, pipe) in pipes.iter().enumerate() {
            let output = match pipes.get(index + 1) {
                Some(next) => next.input(),
                None => completed.clone(),
            };
            pipe.set_output_queue(output)?;
        }

        if !devices.is_empty() {
            warn!(
                "Unused devices for stages {:?}",
                devices.keys().collect::<Vec<_>>()
            );
        }

        let requests = topology
            .stages
            .iter()
            .filter(|stage| stage.optional)
            .map(|stage| (stage.id, stage.requested_by_default))
            .collect();

        let cancel = CancelToken::new();
        cancel.cancel();

        info!(
            "Built {:?} graph: {} stages in {} pipes",
            topology.mode,
            topology.stages.len(),
            pipes.len()
        );

        Ok(Self {
            topology,
            frames,
            managers,
            pipes,
            stage_to_pipe,
            completed,
            abort_sink,
            requests: ArcSwap::from_pointee(requests),
            next_count: AtomicU32::new(1),
            state: Mutex::new(GraphState::Created),
            cancel: Mutex::new(cancel),
        })
    }

    pub fn mode(&self) -> OperatingMode {
        self.topology.mode
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> GraphState {
        *lock(&self.state)
    }

    pub fn frames(&self) -> Arc<FrameList> {
        self.frames.clone()
    }

    pub fn selector_tap(&self) -> Option<BufferTap> {
        self.topology.selector_tap
    }

    pub fn manager(&self, name: &str) -> Result<Arc<BufferManager>> {
        self.managers
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownManager(name.to_string()))
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<BufferManager>> {
        self.managers.values()
    }

    /// Allocate every pool. Any failure is fatal and rolls the others back.
    #[instrument(skip(self), fields(mode = ?self.topology.mode))]
    pub fn initialize(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != GraphState::Created {
            return Ok(());
        }

        for cfg in &self.topology.managers {
            let manager = &self.managers[&cfg.name];
            let sizes = cfg.plane_sizes();
            if let Err(e) = manager.allocate(sizes.len(), &sizes, cfg.min_count, cfg.max_count) {
                for manager in self.managers.values() {
                    if let Err(e) = manager.deinit() {
                        warn!("{} rollback failed: {}", manager.name(), e);
                    }
                }
                return Err(e);
            }
        }
        *state = GraphState::Initialized;
        Ok(())
    }

    /// The tracked frame for `hint`, or a new one registered exactly once.
    ///
    /// Optional stages are included according to the request switches as
    /// they stand at this call.
    pub fn create_frame(&self, hint: Option<u32>) -> Result<Frame> {
        let frame_count = match hint {
            Some(count) => {
                self.next_count
                    .fetch_max(count.wrapping_add(1), Ordering::AcqRel);
                count
            }
            None => self.next_count.fetch_add(1, Ordering::AcqRel),
        };

        let requests = self.requests.load();
        let kind = self.topology.mode.frame_kind();
        let (frame, inserted) = self.frames.get_or_insert_with(frame_count, || {
            let entities = self
                .topology
                .stages
                .iter()
                .filter(|stage| {
                    !stage.optional || requests.get(&stage.id).copied().unwrap_or(false)
                })
                .map(|stage| Entity::new(stage.id, stage.kind, stage.source))
                .collect();
            Frame::new(frame_count, kind, entities)
        });

        if inserted {
            metrics::counter!("campipe_frames_created").increment(1);
            debug!("F{} created ({:?})", frame_count, frame.stages());
        }
        Ok(frame)
    }

    /// Hand `frame` to the pipe that runs `stage`.
    ///
    /// A rejected frame is finished on the spot so it does not linger in the
    /// tracking list.
    pub fn push_frame_to_pipe(&self, frame: Frame, stage: StageId) -> Result<()> {
        let pipe = match self.pipe(stage) {
            Ok(pipe) => pipe,
            Err(e) => {
                self.finish_frame(&frame);
                return Err(e);
            }
        };
        let tracked = frame.clone();
        let result = pipe.push_frame(frame);
        if let Err(e) = &result {
            let reaped = self.reap_aborted();
            self.finish_frame(&tracked);
            debug!(
                "F{} rejected by {}: {} ({} reaped)",
                tracked.frame_count(),
                stage,
                e,
                reaped
            );
        }
        result
    }

    /// Toggle an optional stage for frames created from now on
    pub fn set_request(&self, stage: StageId, enabled: bool) -> Result<()> {
        let descriptor = self
            .topology
            .stage(stage)
            .ok_or(PipelineError::UnknownStage(stage))?;
        if !descriptor.optional {
            return Err(PipelineError::InvalidState(format!(
                "stage {} is not optional",
                stage
            )));
        }
        self.requests.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(stage, enabled);
            next
        });
        debug!("request {} = {}", stage, enabled);
        Ok(())
    }

    /// Whether frames created now include `stage`
    pub fn request(&self, stage: StageId) -> bool {
        match self.topology.stage(stage) {
            Some(descriptor) if descriptor.optional => {
                self.requests.load().get(&stage).copied().unwrap_or(false)
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Allocate if needed, then start pipes producers first
    #[instrument(skip(self), fields(mode = ?self.topology.mode))]
    pub fn start(&self) -> Result<()> {
        self.initialize()?;
        let mut state = lock(&self.state);
        if *state == GraphState::Running {
            return Ok(());
        }

        *lock(&self.cancel) = CancelToken::new();
        for (index, pipe) in self.pipes.iter().enumerate() {
            if let Err(e) = pipe.start() {
                for started in self.pipes[..index].iter().rev() {
                    if let Err(e) = started.stop() {
                        warn!("{} did not stop cleanly: {}", started.name(), e);
                    }
                }
                lock(&self.cancel).cancel();
                return Err(e);
            }
        }
        *state = GraphState::Running;
        info!("Graph {:?} running", self.topology.mode);
        Ok(())
    }

    /// Stop every pipe and release every buffer not pinned by a selector.
    ///
    /// All pipes are signalled before any is joined, then joined consumers
    /// first, so a producer blocked on a full downstream queue wakes up.
    #[instrument(skip(self), fields(mode = ?self.topology.mode))]
    pub fn stop(&self) -> StopReport {
        let mut state = lock(&self.state);

        lock(&self.cancel).cancel();
        for pipe in &self.pipes {
            pipe.request_stop();
        }
        for pipe in self.pipes.iter().rev() {
            if let Err(e) = pipe.stop() {
                warn!("Pipe {} stop: {}", pipe.name(), e);
            }
        }

        let mut report = StopReport::default();
        for frame in self.abort_sink.drain() {
            report.aborted += 1;
            report.buffers_released += self.finish_frame(&frame);
        }
        for frame in self.completed.drain() {
            report.unconsumed += 1;
            report.buffers_released += self.finish_frame(&frame);
        }
        for frame in self.frames.drain_unlocked() {
            frame.abort_remaining("graph stopped");
            report.orphaned += 1;
            report.buffers_released += frame.release_buffers();
        }
        report.still_locked = self.frames.len();

        if *state == GraphState::Running {
            info!("Graph {:?} stopped: {:?}", self.topology.mode, report);
            *state = GraphState::Stopped;
        }
        report
    }

    pub fn start_pipe(&self, stage: StageId) -> Result<()> {
        self.pipe(stage)?.start()
    }

    /// Stop one pipe; frames it drained are released immediately
    pub fn stop_pipe(&self, stage: StageId) -> Result<usize> {
        self.pipe(stage)?.stop()?;
        Ok(self.reap_aborted())
    }

    /// Release frames pipes gave up on. Returns how many were reaped.
    pub fn reap_aborted(&self) -> usize {
        let frames = self.abort_sink.drain();
        for frame in &frames {
            self.finish_frame(frame);
        }
        frames.len()
    }

    pub fn set_control(&self, stage: StageId, id: u32, value: i64) -> Result<()> {
        self.pipe(stage)?.set_control(stage, id, value)
    }

    pub fn control(&self, stage: StageId, id: u32) -> Result<Option<i64>> {
        self.pipe(stage)?.control(stage, id)
    }

    /// Next finished frame from the last pipe. Errors with `Cancelled` once
    /// the graph stops.
    pub fn pop_completed(&self, timeout: Duration) -> Result<Option<Frame>> {
        let cancel = lock(&self.cancel).clone();
        match self.completed.pop(timeout, &cancel) {
            Wait::Ready(frame) => Ok(Some(frame)),
            Wait::TimedOut => Ok(None),
            Wait::Cancelled | Wait::Closed => Err(PipelineError::Cancelled),
        }
    }

    pub fn completion_queue(&self) -> Arc<FrameQueue> {
        self.completed.clone()
    }

    /// Release what the frame still owns and drop it from the tracking list
    /// unless a selector pinned it. Returns buffers released.
    pub fn finish_frame(&self, frame: &Frame) -> usize {
        frame.abort_remaining("finished early");
        if frame.has_error() {
            metrics::counter!("campipe_frames_errored").increment(1);
        } else {
            metrics::counter!("campipe_frames_completed").increment(1);
        }
        let released = frame.release_buffers();
        self.frames.remove_completed(frame.frame_count());
        released
    }

    pub fn pipe_stats(&self, stage: StageId) -> Result<PipeStats> {
        Ok(self.pipe(stage)?.stats())
    }

    pub fn all_pipe_stats(&self) -> Vec<PipeStats> {
        self.pipes.iter().map(Pipe::stats).collect()
    }

    pub fn running_frame_count(&self, stage: StageId) -> Result<usize> {
        Ok(self.pipe(stage)?.running_frame_count())
    }

    fn pipe(&self, stage: StageId) -> Result<&Pipe> {
        self.stage_to_pipe
            .get(&stage)
            .map(|index| &self.pipes[*index])
            .ok_or(PipelineError::UnknownStage(stage))
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.stop();
        for manager in self.managers.values() {
            if let Err(e) = manager.deinit() {
                warn!("{}", e);
            }
        }
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("mode", &self.topology.mode)
            .field("state", &self.state())
            .field("pipes", &self.pipes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{SoftwareStage, StageJob};

    fn devices(topology: &Topology) -> DeviceSet {
        topology
            .stages
            .iter()
            .map(|stage| {
                let device: Box<dyn StageDevice> = Box::new(SoftwareStage::new(
                    stage.name.clone(),
                    |job: &StageJob| Ok(job.all_valid()),
                ));
                (stage.id, device)
            })
            .collect()
    }

    fn graph(topology: Topology) -> PipelineGraph {
        let devices = devices(&topology);
        PipelineGraph::new(
            topology,
            &PipelineConfig::default(),
            Arc::new(FrameList::new()),
            devices,
            Arc::default(),
        )
        .unwrap()
    }

    #[test]
    fn create_frame_reuses_hinted_frame() {
        let graph = graph(Topology::vision());
        let first = graph.create_frame(Some(10)).unwrap();
        let again = graph.create_frame(Some(10)).unwrap();
        assert!(first.ptr_eq(&again));
        assert_eq!(graph.create_frame(None).unwrap().frame_count(), 11);
        assert_eq!(graph.frames().len(), 2);
    }

    #[test]
    fn set_request_applies_to_next_frame() {
        let graph = graph(Topology::preview());
        let before = graph.create_frame(None).unwrap();
        assert!(!before.has_stage(StageId::THUMBNAIL));
        assert!(!graph.request(StageId::THUMBNAIL));

        graph.set_request(StageId::THUMBNAIL, true).unwrap();
        let after = graph.create_frame(None).unwrap();
        assert!(after.has_stage(StageId::THUMBNAIL));
        assert!(!before.has_stage(StageId::THUMBNAIL));
        assert!(graph.set_request(StageId::ISP, false).is_err());
        assert!(graph.set_request(StageId(99), true).is_err());
    }

    #[test]
    fn missing_device_is_a_topology_error() {
        let topology = Topology::vision();
        let mut devices = devices(&topology);
        devices.remove(&StageId::VISION);
        let result = PipelineGraph::new(
            topology,
            &PipelineConfig::default(),
            Arc::new(FrameList::new()),
            devices,
            Arc::default(),
        );
        assert!(matches!(result, Err(PipelineError::Topology(_))));
    }

    #[test]
    fn allocation_failure_surfaces_on_start() {
        let topology = Topology::preview();
        let devices = devices(&topology);
        let budget = Arc::new(MemoryBudget::new(4096));
        let graph = PipelineGraph::new(
            topology,
            &PipelineConfig::default(),
            Arc::new(FrameList::new()),
            devices,
            budget.clone(),
        )
        .unwrap();
        let err = graph.start().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(graph.state(), GraphState::Created);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn rejected_push_leaves_no_tracked_frame() {
        let graph = graph(Topology::vision());
        let frame = graph.create_frame(None).unwrap();
        assert!(matches!(
            graph.push_frame_to_pipe(frame, StageId::SENSOR),
            Err(PipelineError::PipeStopped(_))
        ));
        let frame = graph.create_frame(None).unwrap();
        assert!(matches!(
            graph.push_frame_to_pipe(frame, StageId::ISP),
            Err(PipelineError::UnknownStage(_))
        ));
        assert!(graph.frames().is_empty());
        assert_eq!(graph.frames().removed_total(), 2);
    }

    #[test]
    fn unknown_stage_lookups() {
        let graph = graph(Topology::vision());
        assert!(matches!(
            graph.pipe_stats(StageId::ISP),
            Err(PipelineError::UnknownStage(_))
        ));
        assert!(matches!(
            graph.manager("nope"),
            Err(PipelineError::UnknownManager(_))
        ));
    }
}
