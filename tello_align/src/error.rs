// THEORY:
// Every failure the library can surface is named here. The taxonomy follows the
// flight loop: a missed target is *not* an error (it is `None` from perception),
// and a Seek timeout is *not* an error (it is `AlignmentOutcome::TimedOut`).
// What remains are the things a caller genuinely has to react to: a link that
// went quiet, a command the vehicle would reject anyway, a configuration that
// could never converge, and a video feed that ended underneath us.

use std::io;
use thiserror::Error;

/// Failures of the command link to the vehicle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no response to `{command}` within {timeout_ms} ms")]
    NoResponse { command: String, timeout_ms: u64 },
    #[error("vehicle rejected `{command}`: {reply}")]
    Rejected { command: String, reply: String },
    #[error("unexpected reply to `{command}`: {reply}")]
    BadReply { command: String, reply: String },
    #[error("link is disconnected")]
    Disconnected,
}

/// A command that the vehicle's text protocol cannot express.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{command}` expects {expected} argument(s), got {got}")]
    Arity {
        command: String,
        expected: usize,
        got: usize,
    },
    #[error("`{command}` argument `{arg}` is not an integer")]
    NotInteger { command: String, arg: String },
    #[error("`{command}` argument {value} is outside {min}..={max}")]
    OutOfRange {
        command: String,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("go({x}, {y}, {z}): one of x, y, z must be outside -20..20")]
    GoTooShort { x: i32, y: i32, z: i32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no frames found in {0}")]
    Empty(String),
}

/// Errors that abort an alignment run or a drone session.
#[derive(Debug, Error)]
pub enum AlignError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("video feed closed before alignment finished")]
    FeedClosed,
    #[error("display task is gone")]
    DisplayClosed,
    #[error("no video attached to this drone")]
    NoVideo,
}
