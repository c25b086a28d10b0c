// THEORY:
// The `alignment` module is the decision-making heart of the system. It consumes
// one perception result per video frame and steers the vehicle, through the
// `MotionController`, until it hovers centered in front of the marker at the
// right distance and square-on to it.
//
// Key architectural principles:
// 1.  **Explicit states**: `AlignmentState` is a plain enum. Each variant reacts
//     to one frame's measurement and returns a `Transition`: either the next
//     state (possibly itself) or a terminal `AlignmentOutcome`. Entry actions
//     (stopping the vehicle, starting the search yaw) run exactly once, when a
//     state is entered.
// 2.  **Progression**: Seek -> Center -> Approach -> Strafe -> Aligned. Each state
//     re-checks the criteria of the states before it first, so a drift in
//     centering always wins over distance, and distance over lateral skew.
// 3.  **Same-frame cascade**: when a frame satisfies a state's exit criterion,
//     the next of Center/Approach/Strafe reacts to that same frame right away.
//     Entering Aligned (or Seek) ends the tick: Aligned re-validates everything
//     against a *later* frame, so one lucky frame cannot finish the run.
// 4.  **Missed-frame tolerance**: the `AlignmentDriver` counts consecutive frames
//     without a marker. Isolated misses leave the current state alone; once the
//     count exceeds the limit, the driver abandons the current state for a fresh
//     Seek, whose timeout starts over.

use crate::config::AlignmentConfig;
use crate::core_modules::controller::{Channel, MotionController};
use crate::core_modules::perception::Measurement;
use crate::core_modules::transport::CommandLink;
use crate::error::{AlignError, TransportError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How an alignment run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentOutcome {
    /// All criteria held on two consecutive checks.
    Aligned,
    /// Seek gave up without seeing the marker.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Seek,
    Center,
    Approach,
    Strafe,
    Aligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentState {
    /// Rotating in place looking for the marker.
    Seek { entered_at: Instant },
    /// Yawing and climbing/descending to bring the marker to the image centre.
    Center,
    /// Flying forward or back into the distance band.
    Approach,
    /// Sliding sideways until the marker is seen head-on.
    Strafe,
    /// Criteria met once; waiting for one more frame to confirm.
    Aligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(AlignmentState),
    Done(AlignmentOutcome),
}

impl AlignmentConfig {
    pub fn is_centered(&self, m: &Measurement) -> bool {
        let (dx, dy) = (m.dx as f64, m.dy as f64);
        dx * dx + dy * dy <= self.centered_radius * self.centered_radius
    }

    pub fn distance_ok(&self, m: &Measurement) -> bool {
        self.distance_min < m.distance && m.distance < self.distance_max
    }

    pub fn ratio_ok(&self, m: &Measurement) -> bool {
        self.ratio_min < m.ratio && m.ratio < self.ratio_max
    }
}

impl AlignmentState {
    pub fn kind(&self) -> StateKind {
        match self {
            AlignmentState::Seek { .. } => StateKind::Seek,
            AlignmentState::Center => StateKind::Center,
            AlignmentState::Approach => StateKind::Approach,
            AlignmentState::Strafe => StateKind::Strafe,
            AlignmentState::Aligned => StateKind::Aligned,
        }
    }

    /// Creates a state of `kind` and runs its entry actions.
    pub fn enter<L: CommandLink>(
        kind: StateKind,
        controller: &mut MotionController<L>,
        config: &AlignmentConfig,
        now: Instant,
    ) -> Result<Self, TransportError> {
        controller.stop()?;
        let state = match kind {
            StateKind::Seek => {
                controller.set(Channel::Yaw, config.search_yaw);
                controller.send()?;
                AlignmentState::Seek { entered_at: now }
            }
            StateKind::Center => AlignmentState::Center,
            StateKind::Approach => AlignmentState::Approach,
            StateKind::Strafe => AlignmentState::Strafe,
            StateKind::Aligned => AlignmentState::Aligned,
        };
        info!(state = ?kind, "enter");
        Ok(state)
    }

    /// Reacts to one frame. `None` means the marker was not seen; every state
    /// except Seek holds its ground on a miss.
    pub fn react<L: CommandLink>(
        self,
        target: Option<&Measurement>,
        controller: &mut MotionController<L>,
        config: &AlignmentConfig,
        now: Instant,
    ) -> Result<Transition, TransportError> {
        let enter = |kind, controller: &mut MotionController<L>| {
            Self::enter(kind, controller, config, now).map(Transition::Next)
        };

        if let AlignmentState::Seek { entered_at } = self {
            return match target {
                Some(_) => {
                    debug!("Seek: target found");
                    enter(StateKind::Center, controller)
                }
                None if now.duration_since(entered_at) > config.timeout() => {
                    warn!(timeout = ?config.timeout(), "Seek: timed out");
                    controller.stop()?;
                    Ok(Transition::Done(AlignmentOutcome::TimedOut))
                }
                None => Ok(Transition::Next(self)),
            };
        }

        let Some(m) = target else {
            return Ok(Transition::Next(self));
        };

        match self {
            AlignmentState::Seek { .. } => Ok(Transition::Next(self)),
            AlignmentState::Center => {
                if config.is_centered(m) {
                    debug!("Center: target centered");
                    return enter(StateKind::Approach, controller);
                }
                controller.set(Channel::Yaw, m.dx.signum() * config.center_speed);
                // Image y grows downward: a marker below centre means descend.
                controller.set(Channel::UpDown, -m.dy.signum() * config.center_speed);
                controller.send()?;
                Ok(Transition::Next(self))
            }
            AlignmentState::Approach => {
                if !config.is_centered(m) {
                    debug!("Approach: target not centered");
                    return enter(StateKind::Center, controller);
                }
                if config.distance_ok(m) {
                    debug!(distance = m.distance, "Approach: distance good");
                    return enter(StateKind::Strafe, controller);
                }
                let value = if m.distance >= config.distance_max {
                    config.approach_speed
                } else {
                    -config.approach_speed
                };
                controller.set(Channel::ForwardBack, value);
                controller.send()?;
                Ok(Transition::Next(self))
            }
            AlignmentState::Strafe => {
                if !config.is_centered(m) {
                    debug!("Strafe: target not centered");
                    return enter(StateKind::Center, controller);
                }
                if !config.distance_ok(m) {
                    debug!(distance = m.distance, "Strafe: distance wrong");
                    return enter(StateKind::Approach, controller);
                }
                if config.ratio_ok(m) {
                    debug!(ratio = m.ratio, "Strafe: square to target");
                    return enter(StateKind::Aligned, controller);
                }
                let value = if m.ratio <= config.ratio_min {
                    -config.strafe_speed
                } else {
                    config.strafe_speed
                };
                controller.set(Channel::LeftRight, value);
                controller.send()?;
                Ok(Transition::Next(self))
            }
            AlignmentState::Aligned => {
                if config.is_centered(m) && config.distance_ok(m) && config.ratio_ok(m) {
                    info!("Aligned: criteria confirmed");
                    controller.stop()?;
                    Ok(Transition::Done(AlignmentOutcome::Aligned))
                } else {
                    debug!("Aligned: confirmation failed");
                    enter(StateKind::Center, controller)
                }
            }
        }
    }
}

/// Drives the state machine one frame at a time.
pub struct AlignmentDriver<L> {
    config: AlignmentConfig,
    controller: MotionController<L>,
    state: AlignmentState,
    outcome: Option<AlignmentOutcome>,
    missed_frames: u32,
    entries: u64,
    ticks: u64,
}

impl<L: CommandLink> AlignmentDriver<L> {
    /// Validates `config` and enters Seek, which starts the search rotation.
    pub fn new(config: AlignmentConfig, mut controller: MotionController<L>) -> Result<Self, AlignError> {
        config.validate()?;
        let state = AlignmentState::enter(StateKind::Seek, &mut controller, &config, Instant::now())?;
        Ok(Self {
            config,
            controller,
            state,
            outcome: None,
            missed_frames: 0,
            entries: 1,
            ticks: 0,
        })
    }

    /// Advances the machine by one frame. Returns the outcome once the run has
    /// ended; further calls keep returning it without touching the vehicle.
    pub fn on_measurement(
        &mut self,
        target: Option<Measurement>,
    ) -> Result<Option<AlignmentOutcome>, TransportError> {
        if let Some(outcome) = self.outcome {
            return Ok(Some(outcome));
        }
        self.ticks += 1;
        let now = Instant::now();

        if target.is_some() {
            self.missed_frames = 0;
        } else {
            self.missed_frames = self.missed_frames.saturating_add(1);
            if self.missed_frames > self.config.missed_frame_limit
                && self.state.kind() != StateKind::Seek
            {
                warn!(missed = self.missed_frames, from = ?self.state.kind(), "target lost, searching again");
                self.state =
                    AlignmentState::enter(StateKind::Seek, &mut self.controller, &self.config, now)?;
                self.entries += 1;
            }
        }

        loop {
            let from = self.state.kind();
            match self
                .state
                .react(target.as_ref(), &mut self.controller, &self.config, now)?
            {
                Transition::Done(outcome) => {
                    info!(?outcome, ticks = self.ticks, "alignment finished");
                    self.outcome = Some(outcome);
                    return Ok(Some(outcome));
                }
                Transition::Next(next) => {
                    self.state = next;
                    let to = next.kind();
                    if to == from {
                        break;
                    }
                    self.entries += 1;
                    if target.is_none() || matches!(to, StateKind::Seek | StateKind::Aligned) {
                        break;
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn state(&self) -> &AlignmentState {
        &self.state
    }

    pub fn outcome(&self) -> Option<AlignmentOutcome> {
        self.outcome
    }

    /// Consecutive frames without a marker.
    pub fn missed_frames(&self) -> u32 {
        self.missed_frames
    }

    /// Number of state entries so far, the initial Seek included.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn controller(&self) -> &MotionController<L> {
        &self.controller
    }

    pub fn into_controller(self) -> MotionController<L> {
        self.controller
    }
}
