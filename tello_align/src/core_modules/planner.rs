// THEORY:
// `PlannerLink` is a command link with no vehicle behind it. It accepts the same
// commands a real link would and feeds every one into a `PositionLedger`, so a
// flight script can be rehearsed on the ground and its dead-reckoned path
// inspected before anything takes off.

use crate::core_modules::command::Command;
use crate::core_modules::ledger::{PositionLedger, Waypoint};
use crate::core_modules::transport::CommandLink;
use crate::error::TransportError;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Default)]
pub struct PlannerLink {
    ledger: Mutex<PositionLedger>,
    history: Mutex<Vec<Command>>,
}

impl PlannerLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waypoints(&self) -> Vec<Waypoint> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waypoints()
            .to_vec()
    }

    pub fn history(&self) -> Vec<Command> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, command: &Command) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        let waypoint = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(command);
        if let Some(w) = waypoint {
            debug!(command = %command, x = w.x, y = w.y, z = w.z, heading = w.heading_deg, "planned");
        }
    }
}

impl CommandLink for PlannerLink {
    fn send(&self, command: &Command) -> Result<(), TransportError> {
        self.record(command);
        Ok(())
    }

    async fn request(&self, command: &Command) -> Result<String, TransportError> {
        self.record(command);
        Ok("ok".to_string())
    }
}
