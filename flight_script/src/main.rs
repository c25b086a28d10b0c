// THEORY:
// `flight_script` flies one scripted session: enter SDK mode, start the video
// stream, take off, fly the relative moves listed in the config, servo onto the
// marker and land. The same sequence runs against three links:
// - `drone`: the real vehicle over UDP,
// - `dry-run`: a recording link that answers `ok` to everything,
// - `plan`: the dead-reckoning planner, which prints the expected path instead
//   of flying it (alignment is skipped, there is no vehicle to servo).
//
// Ctrl-C or a failure abandons the session. `land` is sent only if takeoff had
// succeeded and the vehicle has not landed since.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tello_align::{
    CaptureThread, ColorMarkerDetector, Command, CommandLink, DisplayHandle, Drone, FrameBus,
    ImageDirSource, PlannerLink, RecordingLink, Settings, SnapshotSink, UdpLink, VideoFeed,
};
use tracing::{error, info, warn};

const DEFAULT_FILTER: &str = "tello_align=info,flight_script=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Fly the real vehicle.
    Drone,
    /// Log every command without a vehicle.
    DryRun,
    /// Dead-reckon the script and print the waypoints.
    Plan,
}

#[derive(Parser, Debug)]
#[command(name = "flight_script")]
#[command(about = "Scripted flight with visual alignment onto a nested-square marker")]
#[command(version)]
struct Cli {
    /// YAML configuration file. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Drone)]
    mode: Mode,

    /// Directory of still frames to use as the camera feed.
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Fly the script but do not align onto the marker.
    #[arg(long)]
    skip_align: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Settings::default(),
    };
    if cli.frames.is_some() {
        settings.video.frames_dir = cli.frames.clone();
    }
    let align = !cli.skip_align && cli.mode != Mode::Plan;
    info!(mode = ?cli.mode, align, moves = settings.script.len(), "flight script starting");

    match cli.mode {
        Mode::Drone => {
            let link = UdpLink::bind(&settings.link)
                .await
                .context("binding the command socket")?;
            run(Arc::new(link), &settings, align).await
        }
        Mode::DryRun => {
            let link = Arc::new(RecordingLink::new());
            run(link.clone(), &settings, align).await?;
            info!(commands = link.history().len(), "dry run complete");
            Ok(())
        }
        Mode::Plan => {
            let link = Arc::new(PlannerLink::new());
            run(link.clone(), &settings, false).await?;
            for (step, w) in link.waypoints().iter().enumerate() {
                info!(step, x = w.x, y = w.y, z = w.z, heading = w.heading_deg, "waypoint");
            }
            Ok(())
        }
    }
}

/// Flies the session, landing on Ctrl-C or on any failure once airborne.
async fn run<L: CommandLink>(link: Arc<L>, settings: &Settings, align: bool) -> Result<()> {
    let airborne = AtomicBool::new(false);
    let outcome = tokio::select! {
        result = fly(link.clone(), settings, align, &airborne) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            warn!("interrupted");
            Err(anyhow::anyhow!("interrupted"))
        }
    };
    if let Err(e) = &outcome {
        error!(error = %e, "session aborted");
        if airborne.load(Ordering::SeqCst) {
            warn!("landing");
            if let Err(land_error) = link.request(&Command::Land).await {
                warn!(error = %land_error, "emergency landing command failed");
            }
        }
    }
    outcome
}

async fn fly<L: CommandLink>(
    link: Arc<L>,
    settings: &Settings,
    align: bool,
    airborne: &AtomicBool,
) -> Result<()> {
    let mut drone = Drone::new(link, settings.alignment.clone());
    drone
        .connect(settings.link.keep_alive_interval())
        .await
        .context("entering SDK mode")?;
    drone.stream_on().await.context("starting the video stream")?;
    match drone.battery().await {
        Ok(percent) => info!(battery = percent, "battery"),
        Err(e) => warn!(error = %e, "cannot read battery"),
    }

    drone.takeoff().await.context("takeoff")?;
    airborne.store(true, Ordering::SeqCst);
    drone
        .run_script(&settings.script)
        .await
        .context("flying the scripted moves")?;

    if align {
        match open_video(settings)? {
            Some(video) => {
                drone.attach_video(video);
                let detector = ColorMarkerDetector::new(settings.marker.clone());
                let report = drone
                    .align_to_target(&detector)
                    .await
                    .context("aligning onto the marker")?;
                info!(outcome = ?report.outcome, ticks = report.ticks, elapsed = ?report.elapsed, "alignment");
            }
            None => warn!("no video source configured, skipping alignment"),
        }
    }

    drone.land().await.context("landing")?;
    airborne.store(false, Ordering::SeqCst);
    drone.shutdown().await;
    Ok(())
}

fn open_video(settings: &Settings) -> Result<Option<VideoFeed>> {
    let Some(dir) = &settings.video.frames_dir else {
        return Ok(None);
    };
    let source = ImageDirSource::open(
        dir,
        Duration::from_millis(settings.video.frame_interval_ms),
        settings.video.looping,
    )
    .with_context(|| format!("opening frames in {}", dir.display()))?;
    let capture = CaptureThread::spawn(source).context("starting frame capture")?;
    let display = match &settings.video.snapshot_path {
        Some(path) => DisplayHandle::spawn(capture.subscribe(), SnapshotSink::new(path)),
        None => DisplayHandle::spawn(
            capture.subscribe(),
            FrameBus::new(settings.video.display_capacity),
        ),
    };
    Ok(Some(VideoFeed::new(capture, Some(display))))
}
