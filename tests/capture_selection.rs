use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use campipe::buffer::AllocationMode;
use campipe::frame::{BufferTap, Entity, EntityType, FrameKind, FrameList, SourceBinding};
use campipe::graph::{CompletionRouter, DeviceSet, Topology};
use campipe::pipe::{Behavior, SimulatedHardware, StageDevice};
use campipe::selector::{CaptureSelector, SelectRequest, SelectionPolicy};
use campipe::{
    BufferManager, Frame, PipelineConfig, PipelineError, PipelineGraph, SelectorConfig, StageId,
};

fn tap() -> BufferTap {
    BufferTap::dst(StageId::BAYER, 0)
}

struct Bench {
    bayer: Arc<BufferManager>,
    frames: Arc<FrameList>,
    selector: CaptureSelector,
}

impl Bench {
    fn new(hold_count: usize) -> Self {
        let bayer = BufferManager::new("bayer", AllocationMode::AtOnce, Arc::default());
        bayer.allocate(1, &[256], 8, 8).unwrap();
        let frames = Arc::new(FrameList::new());
        let config = SelectorConfig {
            hold_count,
            wait_time_ms: 100,
            ..SelectorConfig::default()
        };
        Self {
            bayer: Arc::new(bayer),
            selector: CaptureSelector::new(frames.clone(), &config),
            frames,
        }
    }

    /// Complete a one-stage frame and offer it to the selector
    fn offer(&self, frame_count: u32, sync_count: u32) -> Frame {
        let frame = Frame::new(
            frame_count,
            FrameKind::Preview,
            vec![Entity::new(StageId::BAYER, EntityType::OutputOnly, SourceBinding::None)],
        );
        let buffer = self.bayer.get_buffer().unwrap();
        frame
            .attach_dst(StageId::BAYER, 0, buffer.index(), self.bayer.clone())
            .unwrap();
        frame.setup_stage(StageId::BAYER).unwrap();
        frame.begin_stage(StageId::BAYER).unwrap();
        frame.complete_stage(StageId::BAYER, &[true]).unwrap();
        frame.update_meta(|meta| meta.sync_count = Some(sync_count));
        self.frames.register(frame.clone()).unwrap();
        assert!(self.selector.manage_frame_hold_list(&frame, tap()).unwrap());
        frame
    }
}

#[test]
fn hold_list_keeps_newest_frames() {
    let bench = Bench::new(3);
    for count in 1..=4 {
        bench.offer(count, count);
    }
    assert_eq!(bench.selector.held_frame_counts(), vec![2, 3, 4]);
    assert_eq!(bench.bayer.in_flight(), 3);
    assert!(!bench.frames.contains(1));

    assert_eq!(bench.selector.release(), 3);
    assert_eq!(bench.bayer.in_flight(), 0);
    assert!(bench.frames.is_empty());
}

#[test]
fn match_count_returns_the_target() {
    let bench = Bench::new(3);
    let target = 40;
    bench.offer(1, target - 1);
    bench.offer(2, target);
    bench.offer(3, target + 1);

    let selected = bench
        .selector
        .select_frames(&SelectRequest::new(tap()).policy(SelectionPolicy::MatchCount { target }))
        .unwrap();
    assert_eq!(selected.frame().sync_count(), target);
    assert_eq!(selected.frame_count(), 2);
    assert_eq!(bench.selector.held_frame_counts(), vec![1, 3]);

    drop(selected);
    assert_eq!(bench.bayer.in_flight(), 2);
    assert!(!bench.frames.contains(2));
}

#[test]
fn empty_hold_list_times_out() {
    let bench = Bench::new(3);
    let started = Instant::now();
    let result = bench
        .selector
        .select_frames(&SelectRequest::new(tap()).timeout(Duration::from_millis(50)));
    assert!(matches!(result, Err(PipelineError::SelectionTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(bench.selector.stats().timeouts, 1);
}

#[test]
fn cancel_interrupts_a_waiting_capture() {
    let bench = Arc::new(Bench::new(3));
    let waiter = {
        let bench = bench.clone();
        thread::spawn(move || {
            bench
                .selector
                .select_frames(&SelectRequest::new(tap()).timeout(Duration::from_secs(5)))
        })
    };
    thread::sleep(Duration::from_millis(20));
    bench.selector.cancel_picture(true);
    assert!(matches!(
        waiter.join().unwrap(),
        Err(PipelineError::Cancelled)
    ));

    bench.selector.cancel_picture(false);
    assert!(!bench.selector.is_cancelled());
    bench.offer(7, 7);
    let selected = bench.selector.select_frames(&SelectRequest::new(tap())).unwrap();
    assert_eq!(selected.frame_count(), 7);
}

#[test]
fn match_count_takes_oldest_held_frame_at_the_deadline() {
    let bench = Bench::new(3);
    bench.offer(1, 1);
    bench.offer(2, 2);

    let started = Instant::now();
    let selected = bench
        .selector
        .select_frames(
            &SelectRequest::new(tap())
                .policy(SelectionPolicy::MatchCount { target: 10 })
                .timeout(Duration::from_millis(50)),
        )
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(selected.frame_count(), 1);
    assert_eq!(bench.selector.held_frame_counts(), vec![2]);
    assert_eq!(bench.selector.stats().timeouts, 0);
}

#[test]
fn each_waiter_sees_every_arrival() {
    let bench = Arc::new(Bench::new(3));
    let waiter = |target: u32| {
        let bench = bench.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = bench.selector.select_frames(
                &SelectRequest::new(tap())
                    .policy(SelectionPolicy::MatchCount { target })
                    .timeout(Duration::from_secs(3)),
            );
            (result, started.elapsed())
        })
    };
    let far = waiter(50);
    let near = waiter(3);
    thread::sleep(Duration::from_millis(20));
    bench.offer(3, 3);

    let (result, elapsed) = near.join().unwrap();
    assert_eq!(result.unwrap().frame_count(), 3);
    assert!(elapsed < Duration::from_secs(1));

    bench.offer(4, 4);
    thread::sleep(Duration::from_millis(20));
    bench.selector.cancel_picture(true);
    let (result, elapsed) = far.join().unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(elapsed < Duration::from_secs(3));
}

#[test]
fn first_frame_overrides_the_policy() {
    let bench = Bench::new(3);
    bench.offer(1, 5);
    bench.offer(2, 6);

    let started = Instant::now();
    let selected = bench
        .selector
        .select_frames(
            &SelectRequest::new(tap())
                .policy(SelectionPolicy::MatchCount { target: 100 })
                .first_frame(true)
                .timeout(Duration::from_secs(2)),
        )
        .unwrap();
    assert_eq!(selected.frame_count(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn first_frame_on_empty_list_takes_next_arrival() {
    let bench = Arc::new(Bench::new(3));
    let waiter = {
        let bench = bench.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = bench.selector.select_frames(
                &SelectRequest::new(tap())
                    .policy(SelectionPolicy::MatchCount { target: 100 })
                    .first_frame(true)
                    .timeout(Duration::from_secs(3)),
            );
            (result, started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(20));
    bench.offer(9, 9);

    let (result, elapsed) = waiter.join().unwrap();
    assert_eq!(result.unwrap().frame_count(), 9);
    assert!(elapsed < Duration::from_secs(1));
    assert!(bench.selector.held_frame_counts().is_empty());
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn simulated(topology: &Topology) -> DeviceSet {
    topology
        .stages
        .iter()
        .map(|stage| {
            let device: Box<dyn StageDevice> = Box::new(SimulatedHardware::new(
                stage.name.clone(),
                Duration::from_millis(1),
                Behavior::Normal,
            ));
            (stage.id, device)
        })
        .collect()
}

#[test]
fn preview_feeds_selector_and_still_is_reprocessed() {
    let config = PipelineConfig::default();
    let frames = Arc::new(FrameList::new());
    let topology = Topology::preview();
    let devices = simulated(&topology);
    let preview = Arc::new(
        PipelineGraph::new(topology, &config, frames.clone(), devices, Arc::default()).unwrap(),
    );
    preview.start().unwrap();

    let selector = Arc::new(CaptureSelector::new(
        frames.clone(),
        &SelectorConfig {
            hold_count: 3,
            ..SelectorConfig::default()
        },
    ));
    let shown = Arc::new(AtomicU64::new(0));
    let router = {
        let shown = shown.clone();
        CompletionRouter::spawn(
            preview.clone(),
            Some(selector.clone()),
            Some(Box::new(move |_: &Frame| {
                shown.fetch_add(1, Ordering::Relaxed);
            })),
            Duration::from_millis(10),
        )
        .unwrap()
    };

    for _ in 0..6 {
        let frame = preview.create_frame(None).unwrap();
        preview.push_frame_to_pipe(frame, StageId::BAYER).unwrap();
    }
    let isp = preview.manager("isp").unwrap();
    let scaled = preview.manager("preview").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        shown.load(Ordering::Relaxed) == 6 && isp.in_flight() == 0 && scaled.in_flight() == 0
    }));
    assert_eq!(selector.held_frame_counts(), vec![4, 5, 6]);
    assert_eq!(frames.frame_counts(), vec![4, 5, 6]);

    let bayer = preview.manager("bayer").unwrap();
    assert_eq!(bayer.in_flight(), 3);

    let reprocessing_topology = Topology::reprocessing();
    let devices = simulated(&reprocessing_topology);
    let reprocessing = PipelineGraph::new(
        reprocessing_topology,
        &config,
        Arc::new(FrameList::new()),
        devices,
        Arc::default(),
    )
    .unwrap();
    reprocessing.start().unwrap();

    let selected = selector
        .select_frames(
            &SelectRequest::new(preview.selector_tap().unwrap())
                .policy(SelectionPolicy::Sharpest)
                .count(3),
        )
        .unwrap();
    let expected = [4, 5, 6]
        .into_iter()
        .max_by(|a, b| {
            SimulatedHardware::focus_score_for(*a)
                .total_cmp(&SimulatedHardware::focus_score_for(*b))
        })
        .unwrap();
    assert_eq!(selected.frame_count(), expected);

    let still = reprocessing.create_frame(None).unwrap();
    selected.attach_as_source(&still, StageId::ISP).unwrap();
    reprocessing.push_frame_to_pipe(still, StageId::ISP).unwrap();
    let done = reprocessing
        .pop_completed(Duration::from_secs(2))
        .unwrap()
        .expect("still should complete");
    assert!(done.is_complete());
    assert!(!done.has_error());
    let source = done.src_buffer(StageId::ISP).unwrap();
    assert_eq!(
        source.plane(0).unwrap().read(|bytes| bytes[0]),
        expected as u8
    );
    reprocessing.finish_frame(&done);
    assert_eq!(bayer.in_flight(), 2);

    let routed = router.stop();
    assert_eq!(routed.routed, 6);
    assert_eq!(selector.release(), 2);
    preview.stop();
    reprocessing.stop();
    assert_eq!(bayer.in_flight(), 0);
    assert!(frames.is_empty());
}
