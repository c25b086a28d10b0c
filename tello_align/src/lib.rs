// THEORY:
// This file is the entry point of the `tello_align` library crate. It exposes
// the building blocks of a visually servoed flight: the typed command
// vocabulary and the links that carry it, the debounced `MotionController`, the
// alignment state machine and its driver, marker perception, the video slot
// shared by the control loop and the display, and the `Drone` facade that ties
// them into one session.
//
// The internals live in `core_modules`; the most common types are re-exported
// here so a flight script only needs `use tello_align::...`.

pub mod config;
pub mod core_modules;
pub mod error;

pub use config::{AlignmentConfig, LinkConfig, MarkerConfig, Settings, VideoConfig};
pub use core_modules::alignment::{AlignmentDriver, AlignmentOutcome, AlignmentState, StateKind};
pub use core_modules::command::{Command, Direction, RcIntent, Rotation, ScriptStep};
pub use core_modules::controller::{Channel, MotionController};
pub use core_modules::display::{DisplayHandle, DisplaySink, FrameBus, SnapshotSink, annotate};
pub use core_modules::drone::{Drone, VideoFeed};
pub use core_modules::ledger::{PositionLedger, Waypoint};
pub use core_modules::orchestrator::{AlignmentReport, run_alignment};
pub use core_modules::perception::{ColorMarkerDetector, Measurement, TargetPerception};
pub use core_modules::planner::PlannerLink;
pub use core_modules::transport::{CommandLink, KeepAlive, RecordingLink, UdpLink};
pub use core_modules::video::{CaptureThread, Frame, FrameSlot, FrameSource, ImageDirSource};
pub use error::{AlignError, CaptureError, CommandError, ConfigError, TransportError};
