use anyhow::Result;
use facelens_core::{DefaultFetcher, Pipeline, PipelineDeps, RasterSurface, Surface, SurfacePool};
use facelens_hw::V4lCamera;
use facelens_infer::OnnxPerception;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod snapshot;

use config::Config;
use snapshot::SnapshotWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelensd starting");

    let config = Config::from_env()?;
    tracing::info!(
        video_source = %config.pipeline.video_source,
        model_source = %config.pipeline.model_source,
        labels = ?config.pipeline.enrollment_labels,
        expressions = config.expressions,
        "configuration loaded"
    );

    let camera = V4lCamera::new(config.camera_width, config.camera_height).skip_dark_frames(config.skip_dark_frames);
    let surfaces = SurfacePool::new(|| Box::new(RasterSurface::new()) as Box<dyn Surface>);
    let mut deps = PipelineDeps::new(
        Arc::new(camera),
        Arc::new(OnnxPerception::new(config.expressions)),
        Arc::new(DefaultFetcher::new()),
        Arc::new(surfaces),
    );
    if let Some(path) = &config.snapshot_path {
        tracing::info!(path = %path.display(), "writing overlay snapshots");
        let interval = Duration::from_millis(config.snapshot_interval_ms);
        deps = deps.with_observer(Arc::new(SnapshotWriter::new(path.clone(), interval)));
    }

    let mut pipeline = Pipeline::new(config.pipeline.clone(), deps)?;
    pipeline.start().await?;

    let stats = pipeline.stats();
    let mut status = tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
    status.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("facelensd shutting down");
                break;
            }
            exit = pipeline.wait() => {
                tracing::warn!(?exit, "frame loop exited on its own");
                break;
            }
            _ = status.tick() => {
                tracing::info!(
                    phase = %phase_label(&stats),
                    iterations = stats.iterations(),
                    failures = stats.failures(),
                    faces = stats.faces(),
                    "status"
                );
            }
        }
    }

    pipeline.stop().await;
    tracing::info!("facelensd stopped");
    Ok(())
}

fn phase_label(stats: &facelens_core::FrameStats) -> &'static str {
    match stats.phase() {
        facelens_core::LoopPhase::Idle => "idle",
        facelens_core::LoopPhase::Capturing => "capturing",
        facelens_core::LoopPhase::Rendering => "rendering",
        facelens_core::LoopPhase::Stopped => "stopped",
    }
}
