// THEORY:
// The `MotionController` sits between the alignment states and the command link.
// The states think in terms of "yaw right at 10" once per frame; the vehicle only
// needs to hear about it when the intent actually changes. The controller holds
// the pending four-channel intent plus a dirty flag and turns a stream of
// per-frame writes into a sparse stream of `rc` commands.
//
// Invariants:
// - Only a value change marks the intent dirty. Re-writing the current value is a
//   no-op.
// - `send` transmits only when dirty, and never transmits the same tuple twice in
//   a row.
// - After a failed transmission the intent stays dirty and `last_sent` keeps the
//   last tuple the vehicle actually received.
//
// The controller is owned by whoever runs the active state (`&mut self` on every
// mutation), so only one writer can exist between two sends.

use crate::core_modules::command::{Command, RC_RANGE, RcIntent};
use crate::core_modules::transport::CommandLink;
use crate::error::TransportError;
use std::sync::Arc;
use tracing::debug;

/// One of the four `rc` channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    LeftRight,
    ForwardBack,
    UpDown,
    Yaw,
}

pub struct MotionController<L> {
    link: Arc<L>,
    intent: RcIntent,
    last_sent: Option<RcIntent>,
    dirty: bool,
    sends: u64,
}

impl<L: CommandLink> MotionController<L> {
    pub fn new(link: Arc<L>) -> Self {
        Self {
            link,
            intent: RcIntent::ZERO,
            last_sent: None,
            dirty: false,
            sends: 0,
        }
    }

    /// Updates `channel` if the clamped `value` differs from the pending one.
    /// Returns whether the intent changed.
    pub fn set(&mut self, channel: Channel, value: i32) -> bool {
        let value = value.clamp(RC_RANGE.0, RC_RANGE.1);
        let slot = match channel {
            Channel::LeftRight => &mut self.intent.left_right,
            Channel::ForwardBack => &mut self.intent.forward_back,
            Channel::UpDown => &mut self.intent.up_down,
            Channel::Yaw => &mut self.intent.yaw,
        };
        if *slot == value {
            return false;
        }
        *slot = value;
        self.dirty = true;
        true
    }

    /// Transmits the pending intent as one `rc` command if it is dirty.
    /// Returns whether a command went out.
    pub fn send(&mut self) -> Result<bool, TransportError> {
        if !self.dirty {
            return Ok(false);
        }
        if self.last_sent == Some(self.intent) {
            // Changed and changed back since the last transmission.
            self.dirty = false;
            return Ok(false);
        }
        self.link.send(&Command::Rc(self.intent))?;
        debug!(intent = ?self.intent, "rc sent");
        self.last_sent = Some(self.intent);
        self.dirty = false;
        self.sends += 1;
        Ok(true)
    }

    /// Zeroes every channel and sends.
    pub fn stop(&mut self) -> Result<bool, TransportError> {
        for channel in [
            Channel::LeftRight,
            Channel::ForwardBack,
            Channel::UpDown,
            Channel::Yaw,
        ] {
            self.set(channel, 0);
        }
        self.send()
    }

    pub fn intent(&self) -> RcIntent {
        self.intent
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The last tuple the link accepted, if any.
    pub fn last_sent(&self) -> Option<RcIntent> {
        self.last_sent
    }

    /// Number of `rc` commands transmitted so far.
    pub fn sends(&self) -> u64 {
        self.sends
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::transport::RecordingLink;

    fn controller() -> (Arc<RecordingLink>, MotionController<RecordingLink>) {
        let link = Arc::new(RecordingLink::new());
        (link.clone(), MotionController::new(link))
    }

    #[test]
    fn identical_writes_mark_dirty_once() {
        let (link, mut ctl) = controller();
        assert!(ctl.set(Channel::Yaw, 10));
        for _ in 0..5 {
            assert!(!ctl.set(Channel::Yaw, 10));
            ctl.send().unwrap();
        }
        assert_eq!(ctl.sends(), 1);
        assert_eq!(link.rc_history().len(), 1);
        assert!(!ctl.is_dirty());
    }

    #[test]
    fn send_count_tracks_distinct_transitions() {
        let (link, mut ctl) = controller();
        for value in [10, 10, -10, -10, -10, 0, 0, 10] {
            ctl.set(Channel::UpDown, value);
            ctl.send().unwrap();
        }
        let sent: Vec<i32> = link.rc_history().iter().map(|rc| rc.up_down).collect();
        assert_eq!(sent, vec![10, -10, 0, 10]);
    }

    #[test]
    fn values_are_clamped() {
        let (link, mut ctl) = controller();
        ctl.set(Channel::ForwardBack, 250);
        ctl.set(Channel::LeftRight, -1000);
        ctl.send().unwrap();
        assert_eq!(
            link.rc_history(),
            vec![RcIntent {
                left_right: -100,
                forward_back: 100,
                up_down: 0,
                yaw: 0
            }]
        );
        assert!(!ctl.set(Channel::ForwardBack, 101));
    }

    #[test]
    fn stop_sends_only_when_something_moved() {
        let (link, mut ctl) = controller();
        assert!(!ctl.stop().unwrap());
        assert!(link.history().is_empty());

        ctl.set(Channel::LeftRight, 20);
        ctl.set(Channel::Yaw, -40);
        ctl.send().unwrap();
        assert!(ctl.stop().unwrap());
        assert!(ctl.intent().is_zero());
        assert!(!ctl.stop().unwrap());
        assert_eq!(link.rc_history().last(), Some(&RcIntent::ZERO));
        assert_eq!(link.rc_history().len(), 2);
    }

    #[test]
    fn change_and_revert_does_not_repeat_last_tuple() {
        let (link, mut ctl) = controller();
        ctl.set(Channel::Yaw, 40);
        ctl.send().unwrap();
        ctl.set(Channel::Yaw, 0);
        ctl.set(Channel::Yaw, 40);
        assert!(!ctl.send().unwrap());
        assert_eq!(link.rc_history().len(), 1);
    }

    #[test]
    fn failed_send_keeps_intent_dirty() {
        let (link, mut ctl) = controller();
        ctl.set(Channel::Yaw, 40);
        ctl.send().unwrap();

        link.disconnect();
        ctl.set(Channel::Yaw, 10);
        assert!(ctl.send().is_err());
        assert!(ctl.is_dirty());
        assert_eq!(ctl.last_sent().map(|rc| rc.yaw), Some(40));
    }
}
