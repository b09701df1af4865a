//! Completion router: the frame-done handler of a running graph

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::cancel::{CancelToken, Wait};
use crate::error::{PipelineError, Result};
use crate::frame::{EntityBufferState, Frame};
use crate::graph::graph::PipelineGraph;
use crate::selector::CaptureSelector;

/// Called for every finished frame before its buffers are released
pub type FrameSink = Box<dyn FnMut(&Frame) + Send>;

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    held: AtomicU64,
    errored: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    pub routed: u64,
    /// Frames whose tap buffer went to the selector
    pub held: u64,
    pub errored: u64,
}

/// Drains the graph's completion queue on its own thread.
///
/// Each frame's selector tap is offered to the capture selector when it came
/// out valid, the sink sees the frame, then the frame is finished.
pub struct CompletionRouter {
    cancel: CancelToken,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<()>>,
}

impl CompletionRouter {
    pub fn spawn(
        graph: Arc<PipelineGraph>,
        selector: Option<Arc<CaptureSelector>>,
        sink: Option<FrameSink>,
        poll: Duration,
    ) -> Result<Self> {
        let cancel = CancelToken::new();
        let counters = Arc::new(Counters::default());
        let worker = {
            let cancel = cancel.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name("completion-router".into())
                .spawn(move || route_loop(graph, selector, sink, poll, cancel, counters))
                .map_err(|e| PipelineError::InvalidState(format!("failed to spawn router: {}", e)))?
        };
        Ok(Self {
            cancel,
            counters,
            worker: Some(worker),
        })
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            held: self.counters.held.load(Ordering::Relaxed),
            errored: self.counters.errored.load(Ordering::Relaxed),
        }
    }

    /// Stop routing. Frames still queued are left for `PipelineGraph::stop`.
    pub fn stop(mut self) -> RouterStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Completion router panicked");
            }
        }
    }
}

impl Drop for CompletionRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn route_loop(
    graph: Arc<PipelineGraph>,
    selector: Option<Arc<CaptureSelector>>,
    mut sink: Option<FrameSink>,
    poll: Duration,
    cancel: CancelToken,
    counters: Arc<Counters>,
) {
    let queue = graph.completion_queue();
    let tap = graph.selector_tap();
    debug!("Completion router up (tap {:?})", tap);

    loop {
        let frame = match queue.pop(poll, &cancel) {
            Wait::Ready(frame) => frame,
            Wait::TimedOut => continue,
            Wait::Cancelled | Wait::Closed => break,
        };
        counters.routed.fetch_add(1, Ordering::Relaxed);
        if frame.has_error() {
            counters.errored.fetch_add(1, Ordering::Relaxed);
        }

        if let (Some(selector), Some(tap)) = (&selector, tap) {
            if frame.tap_state(tap) == Some(EntityBufferState::Valid) {
                match selector.manage_frame_hold_list(&frame, tap) {
                    Ok(true) => {
                        counters.held.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => trace!("F{} not held", frame.frame_count()),
                    Err(e) => warn!("F{} hold failed: {}", frame.frame_count(), e),
                }
            }
        }

        if let Some(sink) = sink.as_mut() {
            sink(&frame);
        }
        graph.finish_frame(&frame);
    }
    debug!("Completion router down");
}
