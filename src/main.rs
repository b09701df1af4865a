//! campipe demo: preview on simulated hardware plus one still capture

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use campipe::frame::FrameList;
use campipe::graph::{CompletionRouter, DeviceSet, Topology};
use campipe::pipe::{Behavior, SimulatedHardware, StageDevice};
use campipe::selector::{CaptureSelector, SelectRequest, SelectionPolicy};
use campipe::{CancelToken, Config, PipelineGraph, StageId};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const STAGE_LATENCY: Duration = Duration::from_millis(4);

fn simulated_devices(topology: &Topology) -> DeviceSet {
    topology
        .stages
        .iter()
        .map(|stage| {
            let device: Box<dyn StageDevice> = Box::new(SimulatedHardware::new(
                stage.name.clone(),
                STAGE_LATENCY,
                Behavior::Normal,
            ));
            (stage.id, device)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("campipe=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("campipe launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let budget = Arc::new(config.pipeline.memory_budget());

    // Preview graph feeding the capture selector
    let preview_frames = Arc::new(FrameList::new());
    let topology = Topology::preview();
    let tap = topology
        .selector_tap
        .ok_or_else(|| eyre!("preview topology has no selector tap"))?;
    let devices = simulated_devices(&topology);
    let preview = Arc::new(PipelineGraph::new(
        topology,
        &config.pipeline,
        preview_frames.clone(),
        devices,
        budget.clone(),
    )?);
    preview.start()?;

    let selector = Arc::new(CaptureSelector::new(preview_frames, &config.selector));
    let shown = Arc::new(AtomicU64::new(0));
    let shown_bytes = Arc::new(AtomicU64::new(0));
    let router = {
        let shown = shown.clone();
        let shown_bytes = shown_bytes.clone();
        CompletionRouter::spawn(
            preview.clone(),
            Some(selector.clone()),
            Some(Box::new(move |frame: &campipe::Frame| {
                // Display stand-in: copy the scaled plane out of the pool
                let image = frame
                    .dst_buffer(StageId::SCALER, 0)
                    .and_then(|buffer| buffer.plane(0).map(|plane| plane.to_bytes()));
                if let Some(image) = image {
                    shown.fetch_add(1, Ordering::Relaxed);
                    shown_bytes.fetch_add(image.len() as u64, Ordering::Relaxed);
                }
            })),
            config.pipeline.pop_timeout(),
        )?
    };

    // Reprocessing graph for the still
    let topology = Topology::reprocessing();
    let devices = simulated_devices(&topology);
    let reprocessing = PipelineGraph::new(
        topology,
        &config.pipeline,
        Arc::new(FrameList::new()),
        devices,
        budget.clone(),
    )?;
    reprocessing.start()?;

    // Preview loop
    let stop = CancelToken::new();
    let preview_loop = {
        let preview = preview.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            while stop.sleep(FRAME_INTERVAL) {
                let pushed = preview
                    .create_frame(None)
                    .and_then(|frame| preview.push_frame_to_pipe(frame, StageId::BAYER));
                if let Err(e) = pushed {
                    warn!("Preview frame dropped: {}", e);
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
    }

    // Take picture: sharpest of three held Bayer frames, reprocessed
    let capture = {
        let selector = selector.clone();
        let wait = config.selector.wait_time();
        tokio::task::spawn_blocking(move || -> campipe::Result<u32> {
            let selected = selector.select_frames(
                &SelectRequest::new(tap)
                    .policy(SelectionPolicy::Sharpest)
                    .count(3)
                    .timeout(wait),
            )?;
            let source_count = selected.frame_count();

            let still = reprocessing.create_frame(None)?;
            selected.attach_as_source(&still, StageId::ISP)?;
            reprocessing.push_frame_to_pipe(still.clone(), StageId::ISP)?;

            let done = reprocessing
                .pop_completed(wait)?
                .ok_or_else(|| {
                    campipe::PipelineError::InvalidState("still did not complete".into())
                })?;
            let ok = !done.has_error();
            let output = done.dst_buffer(StageId::SCALER, 0).map(|b| b.total_size());
            info!(
                "Still from F{}: {} ({:?} bytes)",
                source_count,
                if ok { "ok" } else { "failed" },
                output
            );
            reprocessing.finish_frame(&done);
            let report = reprocessing.stop();
            info!("Reprocessing graph stopped: {:?}", report);
            Ok(source_count)
        })
    };
    match capture.await? {
        Ok(count) => info!("Captured from preview frame {}", count),
        Err(e) => error!("Capture failed: {}", e),
    }

    stop.cancel();
    preview_loop.await?;
    let routed = router.stop();
    let released = selector.release();
    let report = preview.stop();

    info!(
        "Shown {} preview frames ({} bytes), router {:?}, selector released {}, {:?}",
        shown.load(Ordering::Relaxed),
        shown_bytes.load(Ordering::Relaxed),
        routed,
        released,
        report
    );
    for manager in preview.managers() {
        info!("{:?}", manager.stats());
    }

    info!("campipe shutting down");
    Ok(())
}
