// THEORY:
// `run_alignment` is the single place where the three concurrent actors meet:
// the capture thread (through a `FrameSlot`), the display task (through its
// handle) and the alignment driver, which runs right here on the caller's task.
//
// The display is paused for the whole run, so every frame used for a control
// decision is pulled by this loop alone; the display only gets the annotated
// copies pushed to it. It is resumed on every exit path.

use crate::config::AlignmentConfig;
use crate::core_modules::alignment::{AlignmentDriver, AlignmentOutcome};
use crate::core_modules::controller::MotionController;
use crate::core_modules::display::{DisplayHandle, annotate};
use crate::core_modules::perception::TargetPerception;
use crate::core_modules::transport::CommandLink;
use crate::core_modules::video::{Frame, FrameSlot};
use crate::error::AlignError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Summary of one finished alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentReport {
    pub outcome: AlignmentOutcome,
    /// Frames the driver reacted to.
    pub ticks: u64,
    pub elapsed: Duration,
}

/// Runs the alignment state machine against the video feed until it reports
/// an outcome.
pub async fn run_alignment<L, P>(
    config: AlignmentConfig,
    controller: MotionController<L>,
    perception: &P,
    frames: &mut FrameSlot,
    display: Option<&DisplayHandle>,
) -> Result<AlignmentReport, AlignError>
where
    L: CommandLink,
    P: TargetPerception + ?Sized,
{
    if let Some(display) = display {
        display.pause().await?;
        debug!("display paused");
    }

    let result = drive(config, controller, perception, frames, display).await;

    if let Some(display) = display {
        if let Err(e) = display.resume().await {
            warn!(error = %e, "cannot resume display");
        }
    }
    result
}

async fn drive<L, P>(
    config: AlignmentConfig,
    controller: MotionController<L>,
    perception: &P,
    frames: &mut FrameSlot,
    display: Option<&DisplayHandle>,
) -> Result<AlignmentReport, AlignError>
where
    L: CommandLink,
    P: TargetPerception + ?Sized,
{
    let started = Instant::now();
    let mut driver = AlignmentDriver::new(config, controller)?;
    info!("alignment started");

    loop {
        let frame = frames.next().await?;
        let target = perception.find_target(&frame.image);
        debug!(frame = frame.id, ?target, state = ?driver.state().kind(), "tick");
        let outcome = driver.on_measurement(target)?;

        if let Some(display) = display {
            let annotated = Frame {
                image: Arc::new(annotate(&frame.image, target.as_ref())),
                ..frame
            };
            if let Err(e) = display.show_single(annotated) {
                warn!(error = %e, "cannot show annotated frame");
            }
        }

        if let Some(outcome) = outcome {
            let report = AlignmentReport {
                outcome,
                ticks: driver.ticks(),
                elapsed: started.elapsed(),
            };
            info!(outcome = ?report.outcome, ticks = report.ticks, elapsed = ?report.elapsed, "alignment run finished");
            return Ok(report);
        }
    }
}
