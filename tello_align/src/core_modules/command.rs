// THEORY:
// The vehicle speaks a small text protocol: one ASCII command per datagram.
// `Command` is the typed form of that vocabulary. Construction goes through
// validating constructors so an out-of-range distance or angle is caught on the
// ground instead of being answered with `error` by the vehicle mid-flight.
//
// Two delivery classes exist. Everything except `rc` is a request/response
// exchange; `rc` is a joystick sample and is fire-and-forget.
//
// Flight scripts add one word the vehicle never sees: `wait <s>` hovers for a
// few seconds between moves.

use crate::error::CommandError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const MOVE_RANGE_CM: (i32, i32) = (20, 500);
pub const ROTATE_RANGE_DEG: (i32, i32) = (1, 360);
pub const GO_RANGE_CM: (i32, i32) = (-500, 500);
pub const GO_SPEED_RANGE: (i32, i32) = (10, 100);
pub const RC_RANGE: (i32, i32) = (-100, 100);
pub const WAIT_RANGE_S: (i32, i32) = (0, 15);

/// The four joystick channels of an `rc` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RcIntent {
    pub left_right: i32,
    pub forward_back: i32,
    pub up_down: i32,
    pub yaw: i32,
}

impl RcIntent {
    pub const ZERO: RcIntent = RcIntent {
        left_right: 0,
        forward_back: 0,
        up_down: 0,
        yaw: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
}

impl Direction {
    fn keyword(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Forward => "forward",
            Direction::Back => "back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Battery,
    Speed,
    FlightTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enter SDK mode. Also used as the keep-alive no-op.
    Command,
    StreamOn,
    StreamOff,
    Takeoff,
    Land,
    /// Cuts the motors immediately.
    Emergency,
    /// Hover in place.
    Stop,
    Query(Query),
    Move(Direction, i32),
    Rotate(Rotation, i32),
    Go { x: i32, y: i32, z: i32, speed: i32 },
    Rc(RcIntent),
}

fn check_range(command: &str, value: i32, (min, max): (i32, i32)) -> Result<i32, CommandError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(CommandError::OutOfRange {
            command: command.to_string(),
            value,
            min,
            max,
        })
    }
}

impl Command {
    pub fn movement(direction: Direction, cm: i32) -> Result<Self, CommandError> {
        check_range(direction.keyword(), cm, MOVE_RANGE_CM)?;
        Ok(Command::Move(direction, cm))
    }

    pub fn rotate(rotation: Rotation, degrees: i32) -> Result<Self, CommandError> {
        let keyword = match rotation {
            Rotation::Clockwise => "cw",
            Rotation::CounterClockwise => "ccw",
        };
        check_range(keyword, degrees, ROTATE_RANGE_DEG)?;
        Ok(Command::Rotate(rotation, degrees))
    }

    pub fn go(x: i32, y: i32, z: i32, speed: i32) -> Result<Self, CommandError> {
        for value in [x, y, z] {
            check_range("go", value, GO_RANGE_CM)?;
        }
        check_range("go", speed, GO_SPEED_RANGE)?;
        if [x, y, z].iter().all(|v| v.abs() < MOVE_RANGE_CM.0) {
            return Err(CommandError::GoTooShort { x, y, z });
        }
        Ok(Command::Go { x, y, z, speed })
    }

    pub fn rc(intent: RcIntent) -> Result<Self, CommandError> {
        for value in [intent.left_right, intent.forward_back, intent.up_down, intent.yaw] {
            check_range("rc", value, RC_RANGE)?;
        }
        Ok(Command::Rc(intent))
    }

    /// Whether the vehicle answers this command with a reply datagram.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Command::Rc(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Command => f.write_str("command"),
            Command::StreamOn => f.write_str("streamon"),
            Command::StreamOff => f.write_str("streamoff"),
            Command::Takeoff => f.write_str("takeoff"),
            Command::Land => f.write_str("land"),
            Command::Emergency => f.write_str("emergency"),
            Command::Stop => f.write_str("stop"),
            Command::Query(Query::Battery) => f.write_str("battery?"),
            Command::Query(Query::Speed) => f.write_str("speed?"),
            Command::Query(Query::FlightTime) => f.write_str("time?"),
            Command::Move(direction, cm) => write!(f, "{} {}", direction.keyword(), cm),
            Command::Rotate(Rotation::Clockwise, deg) => write!(f, "cw {}", deg),
            Command::Rotate(Rotation::CounterClockwise, deg) => write!(f, "ccw {}", deg),
            Command::Go { x, y, z, speed } => write!(f, "go {} {} {} {}", x, y, z, speed),
            Command::Rc(rc) => write!(
                f,
                "rc {} {} {} {}",
                rc.left_right, rc.forward_back, rc.up_down, rc.yaw
            ),
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let keyword = parts.next().unwrap_or_default().to_ascii_lowercase();
        let raw_args: Vec<&str> = parts.collect();
        let args = raw_args
            .iter()
            .map(|arg| {
                arg.parse::<i32>().map_err(|_| CommandError::NotInteger {
                    command: keyword.clone(),
                    arg: arg.to_string(),
                })
            })
            .collect::<Result<Vec<i32>, _>>()?;

        let arity = |expected: usize| -> Result<(), CommandError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(CommandError::Arity {
                    command: keyword.clone(),
                    expected,
                    got: args.len(),
                })
            }
        };

        let direction = match keyword.as_str() {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            "forward" => Some(Direction::Forward),
            "back" => Some(Direction::Back),
            _ => None,
        };
        if let Some(direction) = direction {
            arity(1)?;
            return Command::movement(direction, args[0]);
        }

        let command = match keyword.as_str() {
            "command" => Command::Command,
            "streamon" => Command::StreamOn,
            "streamoff" => Command::StreamOff,
            "takeoff" => Command::Takeoff,
            "land" => Command::Land,
            "emergency" => Command::Emergency,
            "stop" => Command::Stop,
            "battery?" => Command::Query(Query::Battery),
            "speed?" => Command::Query(Query::Speed),
            "time?" => Command::Query(Query::FlightTime),
            "cw" => {
                arity(1)?;
                return Command::rotate(Rotation::Clockwise, args[0]);
            }
            "ccw" => {
                arity(1)?;
                return Command::rotate(Rotation::CounterClockwise, args[0]);
            }
            "go" => {
                arity(4)?;
                return Command::go(args[0], args[1], args[2], args[3]);
            }
            "rc" => {
                arity(4)?;
                return Command::rc(RcIntent {
                    left_right: args[0],
                    forward_back: args[1],
                    up_down: args[2],
                    yaw: args[3],
                });
            }
            _ => return Err(CommandError::Unknown(s.trim().to_string())),
        };
        arity(0)?;
        Ok(command)
    }
}

/// One line of a flight script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Command(Command),
    /// Hover in place, handled on the ground side.
    Wait(Duration),
}

impl ScriptStep {
    pub fn wait(seconds: i32) -> Result<Self, CommandError> {
        let seconds = check_range("wait", seconds, WAIT_RANGE_S)?;
        Ok(ScriptStep::Wait(Duration::from_secs(seconds.unsigned_abs().into())))
    }
}

impl FromStr for ScriptStep {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        if !parts.next().is_some_and(|k| k.eq_ignore_ascii_case("wait")) {
            return s.parse().map(ScriptStep::Command);
        }
        let args: Vec<&str> = parts.collect();
        let [arg] = args.as_slice() else {
            return Err(CommandError::Arity {
                command: "wait".into(),
                expected: 1,
                got: args.len(),
            });
        };
        let seconds = arg.parse::<i32>().map_err(|_| CommandError::NotInteger {
            command: "wait".into(),
            arg: arg.to_string(),
        })?;
        ScriptStep::wait(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_wire_text() {
        let rc = Command::Rc(RcIntent {
            left_right: -20,
            forward_back: 0,
            up_down: 10,
            yaw: 40,
        });
        assert_eq!(rc.to_string(), "rc -20 0 10 40");
        assert_eq!(Command::Query(Query::Battery).to_string(), "battery?");
        assert_eq!(
            Command::go(500, 0, 0, 40).unwrap().to_string(),
            "go 500 0 0 40"
        );
    }

    #[test]
    fn parses_script_lines() {
        assert_eq!(
            "forward 100".parse::<Command>().unwrap(),
            Command::Move(Direction::Forward, 100)
        );
        assert_eq!(
            "  CW 90 ".parse::<Command>().unwrap(),
            Command::Rotate(Rotation::Clockwise, 90)
        );
        assert_eq!("takeoff".parse::<Command>().unwrap(), Command::Takeoff);
    }

    #[test]
    fn rejects_out_of_range_moves() {
        assert!(matches!(
            "down 10".parse::<Command>(),
            Err(CommandError::OutOfRange { value: 10, .. })
        ));
        assert!(matches!(
            "ccw 0".parse::<Command>(),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            Command::go(10, -10, 19, 40),
            Err(CommandError::GoTooShort { .. })
        ));
        assert!(matches!(
            "rc 0 0 0 101".parse::<Command>(),
            Err(CommandError::OutOfRange { value: 101, .. })
        ));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            "forward".parse::<Command>(),
            Err(CommandError::Arity { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            "land now".parse::<Command>(),
            Err(CommandError::NotInteger { .. })
        ));
        assert!(matches!(
            "flip l".parse::<Command>(),
            Err(CommandError::NotInteger { .. }) | Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            "barrel_roll".parse::<Command>(),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn script_steps_include_waits() {
        assert_eq!(
            "wait 3".parse::<ScriptStep>().unwrap(),
            ScriptStep::Wait(Duration::from_secs(3))
        );
        assert_eq!(
            " WAIT 0".parse::<ScriptStep>().unwrap(),
            ScriptStep::Wait(Duration::ZERO)
        );
        assert_eq!(
            "cw 90".parse::<ScriptStep>().unwrap(),
            ScriptStep::Command(Command::Rotate(Rotation::Clockwise, 90))
        );
        assert!(matches!(
            "wait 16".parse::<ScriptStep>(),
            Err(CommandError::OutOfRange { value: 16, min: 0, max: 15, .. })
        ));
        assert!(matches!(
            "wait -1".parse::<ScriptStep>(),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            "wait".parse::<ScriptStep>(),
            Err(CommandError::Arity { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            "wait 1.5".parse::<ScriptStep>(),
            Err(CommandError::NotInteger { .. })
        ));
        // The vehicle itself has no such command.
        assert!(matches!(
            "wait 3".parse::<Command>(),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn only_rc_is_fire_and_forget() {
        assert!(!Command::Rc(RcIntent::ZERO).expects_reply());
        assert!(Command::Command.expects_reply());
        assert!(Command::Land.expects_reply());
    }
}
