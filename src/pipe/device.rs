//! Boundary between a pipe and the hardware (or software) it drives

use std::time::Duration;

use flume::{Receiver, Sender};

use crate::buffer::Buffer;
use crate::cancel::{CancelToken, Wait};
use crate::error::Result;
use crate::frame::{Frame, StageId};

/// Work handed to a device for one frame
#[derive(Debug, Clone)]
pub struct StageJob {
    pub frame: Frame,
    pub stage: StageId,
    /// Resolved input, if the stage reads one
    pub src: Option<Buffer>,
    /// One entry per output position; `None` where the output was dropped
    pub dst: Vec<Option<Buffer>>,
}

impl StageJob {
    pub fn frame_count(&self) -> u32 {
        self.frame.frame_count()
    }

    /// Every output that has a buffer attached reported valid
    pub fn all_valid(&self) -> StageOutput {
        StageOutput {
            valid: self.dst.iter().map(Option::is_some).collect(),
        }
    }
}

/// Per-output validity reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageOutput {
    pub valid: Vec<bool>,
}

impl StageOutput {
    pub fn invalid(outputs: usize) -> Self {
        Self {
            valid: vec![false; outputs],
        }
    }
}

/// One-shot completion of a submitted job
pub struct Completion {
    rx: Receiver<Result<StageOutput>>,
}

/// Device side of a [`Completion`]. Dropping it unsent closes the completion.
pub struct CompletionSender {
    tx: Sender<Result<StageOutput>>,
}

impl Completion {
    /// Already finished (synchronous devices)
    pub fn ready(outcome: Result<StageOutput>) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Finished later from the device's own thread
    pub fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = flume::bounded(1);
        (CompletionSender { tx }, Completion { rx })
    }

    pub fn wait(&self, timeout: Duration, cancel: &CancelToken) -> Wait<Result<StageOutput>> {
        cancel.recv_timeout(&self.rx, timeout)
    }
}

impl CompletionSender {
    pub fn complete(self, outcome: Result<StageOutput>) {
        // The pipe may have given up on the job already
        let _ = self.tx.send(outcome);
    }
}

/// A hardware block or software transform behind a pipe stage.
///
/// `submit` must not block for the duration of the job: long jobs return a
/// [`Completion::channel`] and finish elsewhere. The pipe holds the device
/// lock only while calling into it, so control calls interleave with frames.
pub trait StageDevice: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, job: StageJob) -> Result<Completion>;

    /// The pipe stopped waiting for `frame_count` (timeout or cancel)
    fn abort_job(&mut self, _frame_count: u32) {}

    /// Opaque key/value pass-through (frame rate, exposure limits, ...)
    fn set_control(&mut self, id: u32, value: i64) -> Result<()>;

    fn control(&self, id: u32) -> Option<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_completion_is_immediate() {
        let cancel = CancelToken::new();
        let completion = Completion::ready(Ok(StageOutput { valid: vec![true] }));
        assert!(matches!(
            completion.wait(Duration::from_millis(1), &cancel),
            Wait::Ready(Ok(out)) if out.valid == vec![true]
        ));
    }

    #[test]
    fn dropped_sender_closes_completion() {
        let cancel = CancelToken::new();
        let (tx, completion) = Completion::channel();
        drop(tx);
        assert!(matches!(
            completion.wait(Duration::from_secs(1), &cancel),
            Wait::Closed
        ));
    }

    #[test]
    fn late_completion_times_out() {
        let cancel = CancelToken::new();
        let (_tx, completion) = Completion::channel();
        assert!(matches!(
            completion.wait(Duration::from_millis(5), &cancel),
            Wait::TimedOut
        ));
    }
}
