// THEORY:
// Dead reckoning for the scripted part of a flight. The vehicle reports no
// position, so the ledger integrates the relative move commands it was given:
// every move is expressed in the body frame, rotated by the current heading and
// added to the last absolute position.
//
// Frame convention: x points along the initial heading, y to the initial right,
// z up. Heading is in degrees, counter-clockwise positive, so `cw 90` leaves the
// heading at -90 and the next `forward` moves along +y.
//
// The ledger is append-only and seeded with the origin, so it is never empty.

use crate::core_modules::command::{Command, Direction, Rotation};

/// Height gained by `takeoff`, in centimetres.
pub const TAKEOFF_HEIGHT_CM: f64 = 50.0;

/// One absolute pose in the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading_deg: f64,
}

impl Waypoint {
    pub const ORIGIN: Waypoint = Waypoint {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        heading_deg: 0.0,
    };
}

#[derive(Debug, Clone)]
pub struct PositionLedger {
    waypoints: Vec<Waypoint>,
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            waypoints: vec![Waypoint::ORIGIN],
        }
    }

    pub fn last(&self) -> Waypoint {
        // Seeded with the origin and never shrinks.
        self.waypoints[self.waypoints.len() - 1]
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Appends the pose reached by moving `forward`, `right` and `up` in the body frame.
    pub fn move_relative(&mut self, forward: f64, right: f64, up: f64) -> Waypoint {
        let cur = self.last();
        let (sin, cos) = cur.heading_deg.to_radians().sin_cos();
        let next = Waypoint {
            x: cur.x + forward * cos + right * sin,
            y: cur.y - forward * sin + right * cos,
            z: cur.z + up,
            heading_deg: cur.heading_deg,
        };
        self.waypoints.push(next);
        next
    }

    /// Appends the current position with the heading turned by `degrees` (counter-clockwise positive).
    pub fn rotate(&mut self, degrees: f64) -> Waypoint {
        let cur = self.last();
        let next = Waypoint {
            heading_deg: normalize_heading(cur.heading_deg + degrees),
            ..cur
        };
        self.waypoints.push(next);
        next
    }

    /// Applies a vehicle command. Returns the new waypoint, or `None` for
    /// commands that do not move the vehicle in a predictable way.
    pub fn apply(&mut self, command: &Command) -> Option<Waypoint> {
        let waypoint = match *command {
            Command::Takeoff => self.move_relative(0.0, 0.0, TAKEOFF_HEIGHT_CM),
            Command::Land => {
                let z = self.last().z;
                self.move_relative(0.0, 0.0, -z)
            }
            Command::Move(direction, cm) => {
                let d = cm as f64;
                match direction {
                    Direction::Forward => self.move_relative(d, 0.0, 0.0),
                    Direction::Back => self.move_relative(-d, 0.0, 0.0),
                    Direction::Right => self.move_relative(0.0, d, 0.0),
                    Direction::Left => self.move_relative(0.0, -d, 0.0),
                    Direction::Up => self.move_relative(0.0, 0.0, d),
                    Direction::Down => self.move_relative(0.0, 0.0, -d),
                }
            }
            Command::Rotate(Rotation::Clockwise, deg) => self.rotate(-(deg as f64)),
            Command::Rotate(Rotation::CounterClockwise, deg) => self.rotate(deg as f64),
            // go: x forward, y right, z up, all in the body frame.
            Command::Go { x, y, z, .. } => self.move_relative(x as f64, y as f64, z as f64),
            _ => return None,
        };
        Some(waypoint)
    }
}

/// Wraps a heading into (-180, 180].
fn normalize_heading(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped > 180.0 { wrapped - 360.0 } else { wrapped }
}
