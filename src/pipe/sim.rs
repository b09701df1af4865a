//! In-process stage devices for tests and the demo binary

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, trace, warn};

use crate::error::{PipelineError, Result};
use crate::pipe::device::{Completion, CompletionSender, StageDevice, StageJob, StageOutput};
use crate::utils::lock;

/// Control id understood by [`SimulatedHardware`]: per-job latency in µs
pub const CONTROL_LATENCY_US: u32 = 0x100;

/// Synchronous software transform
pub struct SoftwareStage<F> {
    name: String,
    transform: F,
    controls: BTreeMap<u32, i64>,
}

impl<F> SoftwareStage<F>
where
    F: FnMut(&StageJob) -> Result<StageOutput> + Send,
{
    pub fn new(name: impl Into<String>, transform: F) -> Self {
        Self {
            name: name.into(),
            transform,
            controls: BTreeMap::new(),
        }
    }
}

impl<F> StageDevice for SoftwareStage<F>
where
    F: FnMut(&StageJob) -> Result<StageOutput> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, job: StageJob) -> Result<Completion> {
        Ok(Completion::ready((self.transform)(&job)))
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        self.controls.insert(id, value);
        Ok(())
    }

    fn control(&self, id: u32) -> Option<i64> {
        self.controls.get(&id).copied()
    }
}

/// Fault injection for [`SimulatedHardware`], keyed on the job sequence
/// number (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Normal,
    /// Every n-th job reports a device error
    FailEvery(u32),
    /// Every n-th job never completes
    HangEvery(u32),
}

impl Behavior {
    fn hits(every: u32, seq: u64) -> bool {
        every > 0 && seq % u64::from(every) == 0
    }
}

type Hung = Arc<Mutex<Vec<(u32, CompletionSender)>>>;

/// Threaded device with a fixed latency.
///
/// Writes a sync count, a sensor timestamp and a focus score into the frame
/// metadata and stamps the frame count into every output.
pub struct SimulatedHardware {
    name: String,
    behavior: Behavior,
    latency_us: Arc<AtomicU64>,
    seq: u64,
    controls: BTreeMap<u32, i64>,
    jobs: Option<Sender<(u64, StageJob, CompletionSender)>>,
    hung: Hung,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedHardware {
    pub fn new(name: impl Into<String>, latency: Duration, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            latency_us: Arc::new(AtomicU64::new(latency.as_micros() as u64)),
            seq: 0,
            controls: BTreeMap::new(),
            jobs: None,
            hung: Arc::default(),
            worker: None,
        }
    }

    /// Sharpness the device reports for `frame_count`
    pub fn focus_score_for(frame_count: u32) -> f32 {
        (frame_count.wrapping_mul(37) % 100) as f32 / 100.0
    }

    fn work(
        name: String,
        behavior: Behavior,
        latency_us: Arc<AtomicU64>,
        hung: Hung,
        jobs: flume::Receiver<(u64, StageJob, CompletionSender)>,
    ) {
        let epoch = Instant::now();
        for (seq, job, done) in jobs.iter() {
            thread::sleep(Duration::from_micros(latency_us.load(Ordering::Relaxed)));
            let frame_count = job.frame_count();
            match behavior {
                Behavior::HangEvery(every) if Behavior::hits(every, seq) => {
                    trace!("{} hanging on F{}", name, frame_count);
                    lock(&hung).push((frame_count, done));
                    continue;
                }
                Behavior::FailEvery(every) if Behavior::hits(every, seq) => {
                    done.complete(Err(PipelineError::device(job.stage, "injected fault")));
                    continue;
                }
                _ => {}
            }

            job.frame.update_meta(|meta| {
                meta.sync_count.get_or_insert(frame_count);
                meta.sensor_timestamp.get_or_insert(epoch.elapsed());
                meta.focus_score = Some(Self::focus_score_for(frame_count));
            });
            for buffer in job.dst.iter().flatten() {
                if let Some(plane) = buffer.plane(0) {
                    plane.write(|bytes| bytes[0] = frame_count as u8);
                }
            }
            done.complete(Ok(job.all_valid()));
        }
    }
}

impl StageDevice for SimulatedHardware {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = flume::unbounded();
        let name = self.name.clone();
        let behavior = self.behavior;
        let latency_us = self.latency_us.clone();
        let hung = self.hung.clone();
        let worker = thread::Builder::new()
            .name(format!("sim-{}", self.name))
            .spawn(move || Self::work(name, behavior, latency_us, hung, rx))
            .map_err(|e| {
                PipelineError::InvalidState(format!("failed to spawn {}: {}", self.name, e))
            })?;
        self.jobs = Some(tx);
        self.worker = Some(worker);
        debug!("{} started", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("{} worker panicked", self.name);
            }
        }
        lock(&self.hung).clear();
        Ok(())
    }

    fn submit(&mut self, job: StageJob) -> Result<Completion> {
        let Some(jobs) = &self.jobs else {
            return Err(PipelineError::device(job.stage, format!("{} not started", self.name)));
        };
        self.seq += 1;
        let (done, completion) = Completion::channel();
        let stage = job.stage;
        jobs.send((self.seq, job, done))
            .map_err(|_| PipelineError::device(stage, "device worker gone"))?;
        Ok(completion)
    }

    fn abort_job(&mut self, frame_count: u32) {
        lock(&self.hung).retain(|(count, _)| *count != frame_count);
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        if id == CONTROL_LATENCY_US {
            self.latency_us.store(value.max(0) as u64, Ordering::Relaxed);
        }
        self.controls.insert(id, value);
        Ok(())
    }

    fn control(&self, id: u32) -> Option<i64> {
        self.controls.get(&id).copied()
    }
}

impl Drop for SimulatedHardware {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
