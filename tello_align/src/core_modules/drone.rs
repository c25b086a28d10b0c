// THEORY:
// `Drone` is the session-level facade a flight script talks to. It owns the
// command link, the keep-alive task and, when attached, the video feed with its
// display. Discrete commands (takeoff, moves, queries) go straight through the
// link; `align_to_target` hands the link to a fresh `MotionController` for the
// duration of one alignment run.
//
// A transport failure in the middle of an alignment leaves the vehicle with
// whatever `rc` it last received. The facade makes one attempt to zero the
// sticks before handing the error back.

use crate::config::AlignmentConfig;
use crate::core_modules::command::{Command, Direction, Query, RcIntent, Rotation, ScriptStep};
use crate::core_modules::controller::MotionController;
use crate::core_modules::display::DisplayHandle;
use crate::core_modules::orchestrator::{AlignmentReport, run_alignment};
use crate::core_modules::perception::TargetPerception;
use crate::core_modules::transport::{CommandLink, KeepAlive};
use crate::core_modules::video::{CaptureThread, FrameSlot};
use crate::error::{AlignError, TransportError};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Capture thread, control-loop subscription and optional display.
pub struct VideoFeed {
    capture: CaptureThread,
    frames: FrameSlot,
    display: Option<DisplayHandle>,
}

impl VideoFeed {
    pub fn new(capture: CaptureThread, display: Option<DisplayHandle>) -> Self {
        let frames = capture.subscribe();
        Self {
            capture,
            frames,
            display,
        }
    }

    pub fn display(&self) -> Option<&DisplayHandle> {
        self.display.as_ref()
    }

    async fn close(self) {
        if let Some(display) = self.display {
            display.close().await;
        }
        self.capture.stop();
    }
}

pub struct Drone<L: CommandLink> {
    link: Arc<L>,
    alignment: AlignmentConfig,
    keep_alive: Option<KeepAlive>,
    video: Option<VideoFeed>,
}

impl<L: CommandLink> Drone<L> {
    pub fn new(link: Arc<L>, alignment: AlignmentConfig) -> Self {
        Self {
            link,
            alignment,
            keep_alive: None,
            video: None,
        }
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Enters SDK mode and starts the keep-alive task.
    pub async fn connect(&mut self, keep_alive: Duration) -> Result<(), TransportError> {
        self.execute(&Command::Command).await?;
        self.keep_alive = Some(KeepAlive::spawn(self.link.clone(), keep_alive));
        info!("connected");
        Ok(())
    }

    pub fn attach_video(&mut self, video: VideoFeed) {
        self.video = Some(video);
    }

    pub fn video(&self) -> Option<&VideoFeed> {
        self.video.as_ref()
    }

    /// Sends one command. Returns the reply, or an empty string for `rc`.
    pub async fn execute(&self, command: &Command) -> Result<String, TransportError> {
        if command.expects_reply() {
            let reply = self.link.request(command).await?;
            info!(%command, %reply, "executed");
            Ok(reply)
        } else {
            self.link.send(command)?;
            Ok(String::new())
        }
    }

    /// Parses every line of a flight script, then executes them in order.
    /// A bad line fails the script before anything is sent.
    pub async fn run_script<S: AsRef<str>>(&self, lines: &[S]) -> Result<(), AlignError> {
        let steps = lines
            .iter()
            .map(|line| ScriptStep::from_str(line.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;
        for step in &steps {
            match step {
                ScriptStep::Command(command) => {
                    self.execute(command).await?;
                }
                ScriptStep::Wait(duration) => self.hover(*duration).await,
            }
        }
        Ok(())
    }

    /// Hovers for `seconds` (0..=15) without sending anything.
    pub async fn wait(&self, seconds: i32) -> Result<(), AlignError> {
        if let ScriptStep::Wait(duration) = ScriptStep::wait(seconds)? {
            self.hover(duration).await;
        }
        Ok(())
    }

    async fn hover(&self, duration: Duration) {
        info!(?duration, "waiting");
        tokio::time::sleep(duration).await;
    }

    pub async fn stream_on(&self) -> Result<(), TransportError> {
        self.execute(&Command::StreamOn).await.map(drop)
    }

    pub async fn stream_off(&self) -> Result<(), TransportError> {
        self.execute(&Command::StreamOff).await.map(drop)
    }

    pub async fn takeoff(&self) -> Result<(), TransportError> {
        self.execute(&Command::Takeoff).await.map(drop)
    }

    pub async fn land(&self) -> Result<(), TransportError> {
        self.execute(&Command::Land).await.map(drop)
    }

    /// Cuts the motors immediately.
    pub async fn emergency(&self) -> Result<(), TransportError> {
        self.execute(&Command::Emergency).await.map(drop)
    }

    /// Hovers in place.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.execute(&Command::Stop).await.map(drop)
    }

    /// Battery charge in percent.
    pub async fn battery(&self) -> Result<u32, TransportError> {
        self.query(Query::Battery).await
    }

    /// Speed setting in cm/s.
    pub async fn speed(&self) -> Result<f64, TransportError> {
        self.query(Query::Speed).await
    }

    /// Motor time since takeoff, in seconds.
    pub async fn flight_time(&self) -> Result<u32, TransportError> {
        self.query(Query::FlightTime).await
    }

    async fn query<T: FromStr>(&self, query: Query) -> Result<T, TransportError> {
        let command = Command::Query(query);
        let reply = self.execute(&command).await?;
        // Durations come back as e.g. `12s`.
        reply
            .trim()
            .trim_end_matches('s')
            .parse()
            .map_err(|_| TransportError::BadReply {
                command: command.to_string(),
                reply,
            })
    }

    pub async fn move_by(&self, direction: Direction, cm: i32) -> Result<(), AlignError> {
        self.execute(&Command::movement(direction, cm)?).await?;
        Ok(())
    }

    pub async fn rotate(&self, rotation: Rotation, degrees: i32) -> Result<(), AlignError> {
        self.execute(&Command::rotate(rotation, degrees)?).await?;
        Ok(())
    }

    pub async fn go(&self, x: i32, y: i32, z: i32, speed: i32) -> Result<(), AlignError> {
        self.execute(&Command::go(x, y, z, speed)?).await?;
        Ok(())
    }

    pub fn rc(&self, intent: RcIntent) -> Result<(), AlignError> {
        self.link.send(&Command::rc(intent)?)?;
        Ok(())
    }

    /// Servoes onto the marker using the attached video feed.
    pub async fn align_to_target<P>(&mut self, perception: &P) -> Result<AlignmentReport, AlignError>
    where
        P: TargetPerception + ?Sized,
    {
        let video = self.video.as_mut().ok_or(AlignError::NoVideo)?;
        let controller = MotionController::new(self.link.clone());
        let result = run_alignment(
            self.alignment.clone(),
            controller,
            perception,
            &mut video.frames,
            video.display.as_ref(),
        )
        .await;

        if let Err(AlignError::Transport(e)) = &result {
            error!(error = %e, "link failed during alignment, zeroing sticks");
            if let Err(stop_error) = self.link.send(&Command::Rc(RcIntent::ZERO)) {
                warn!(error = %stop_error, "cannot zero sticks");
            }
        }
        result
    }

    /// Stops the keep-alive, the display and the capture thread.
    pub async fn shutdown(mut self) {
        self.keep_alive = None;
        if let Some(video) = self.video.take() {
            video.close().await;
        }
        info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::alignment::AlignmentOutcome;
    use crate::core_modules::perception::Measurement;
    use crate::core_modules::transport::RecordingLink;
    use crate::error::CaptureError;
    use image::RgbImage;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records like `RecordingLink` but answers queries from a table.
    #[derive(Default)]
    struct QueryLink {
        inner: RecordingLink,
        replies: Mutex<HashMap<String, String>>,
    }

    impl QueryLink {
        fn with_reply(self, command: &str, reply: &str) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(command.to_string(), reply.to_string());
            self
        }
    }

    impl CommandLink for QueryLink {
        fn send(&self, command: &Command) -> Result<(), TransportError> {
            self.inner.send(command)
        }

        async fn request(&self, command: &Command) -> Result<String, TransportError> {
            let default = self.inner.request(command).await?;
            Ok(self
                .replies
                .lock()
                .unwrap()
                .get(&command.to_string())
                .cloned()
                .unwrap_or(default))
        }
    }

    /// Sees the marker head-on in every frame, and drops the link after `cut_after` calls.
    struct SteadyMarker {
        link: Arc<RecordingLink>,
        calls: AtomicUsize,
        cut_after: usize,
        target: Measurement,
    }

    impl TargetPerception for SteadyMarker {
        fn find_target(&self, _frame: &RgbImage) -> Option<Measurement> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.cut_after {
                self.link.disconnect();
            }
            Some(self.target)
        }
    }

    fn endless_feed() -> VideoFeed {
        let capture = CaptureThread::spawn(|| -> Result<Option<RgbImage>, CaptureError> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(Some(RgbImage::new(32, 24)))
        })
        .unwrap();
        VideoFeed::new(capture, None)
    }

    #[tokio::test]
    async fn discrete_commands_go_out_in_order() {
        let link = Arc::new(RecordingLink::new());
        let mut drone = Drone::new(link.clone(), AlignmentConfig::default());
        drone.connect(Duration::from_secs(5)).await.unwrap();
        drone.stream_on().await.unwrap();
        drone.takeoff().await.unwrap();
        drone.move_by(Direction::Forward, 100).await.unwrap();
        drone.rotate(Rotation::Clockwise, 90).await.unwrap();
        drone.go(50, -20, 0, 30).await.unwrap();
        drone.land().await.unwrap();

        let wire: Vec<String> = link.history().iter().map(ToString::to_string).collect();
        assert_eq!(
            wire,
            [
                "command",
                "streamon",
                "takeoff",
                "forward 100",
                "cw 90",
                "go 50 -20 0 30",
                "land"
            ]
        );
        drone.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_moves_never_reach_the_link() {
        let link = Arc::new(RecordingLink::new());
        let drone = Drone::new(link.clone(), AlignmentConfig::default());
        assert!(matches!(
            drone.move_by(Direction::Up, 5).await,
            Err(AlignError::Command(_))
        ));
        assert!(matches!(
            drone.rc(RcIntent {
                yaw: 150,
                ..RcIntent::ZERO
            }),
            Err(AlignError::Command(_))
        ));
        assert!(matches!(
            drone.run_script(&["forward 100", "sideways 3"]).await,
            Err(AlignError::Command(_))
        ));
        assert!(link.history().is_empty());
    }

    #[tokio::test]
    async fn script_lines_are_executed() {
        let link = Arc::new(RecordingLink::new());
        let drone = Drone::new(link.clone(), AlignmentConfig::default());
        drone.run_script(&[" up 30 ", "ccw 45"]).await.unwrap();
        assert_eq!(link.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn script_waits_hover_between_moves() {
        let link = Arc::new(RecordingLink::new());
        let drone = Drone::new(link.clone(), AlignmentConfig::default());
        let started = tokio::time::Instant::now();
        drone
            .run_script(&["up 30", "wait 3", "ccw 45", "wait 0"])
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        let wire: Vec<String> = link.history().iter().map(ToString::to_string).collect();
        assert_eq!(wire, ["up 30", "ccw 45"]);

        assert!(matches!(
            drone.run_script(&["up 30", "wait 16"]).await,
            Err(AlignError::Command(_))
        ));
        assert!(matches!(drone.wait(-2).await, Err(AlignError::Command(_))));
        assert_eq!(link.history().len(), 2);
    }

    #[tokio::test]
    async fn queries_are_parsed() {
        let link = Arc::new(
            QueryLink::default()
                .with_reply("battery?", "87")
                .with_reply("speed?", "100.0")
                .with_reply("time?", "12s"),
        );
        let drone = Drone::new(link, AlignmentConfig::default());
        assert_eq!(drone.battery().await.unwrap(), 87);
        assert_eq!(drone.speed().await.unwrap(), 100.0);
        assert_eq!(drone.flight_time().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn garbage_query_reply_is_an_error() {
        let link = Arc::new(QueryLink::default());
        let drone = Drone::new(link, AlignmentConfig::default());
        assert!(matches!(
            drone.battery().await,
            Err(TransportError::BadReply { .. })
        ));
    }

    #[tokio::test]
    async fn alignment_needs_video() {
        let link = Arc::new(RecordingLink::new());
        let mut drone = Drone::new(link, AlignmentConfig::default());
        let marker = SteadyMarker {
            link: Arc::new(RecordingLink::new()),
            calls: AtomicUsize::new(0),
            cut_after: usize::MAX,
            target: Measurement::new(0, 0, 0.9, 1.0),
        };
        assert!(matches!(
            drone.align_to_target(&marker).await,
            Err(AlignError::NoVideo)
        ));
    }

    #[tokio::test]
    async fn aligns_on_attached_feed() {
        let link = Arc::new(RecordingLink::new());
        let mut drone = Drone::new(link.clone(), AlignmentConfig::default());
        drone.attach_video(endless_feed());
        let marker = SteadyMarker {
            link: link.clone(),
            calls: AtomicUsize::new(0),
            cut_after: usize::MAX,
            target: Measurement::new(0, 0, 0.9, 1.0),
        };
        let report = drone.align_to_target(&marker).await.unwrap();
        assert_eq!(report.outcome, AlignmentOutcome::Aligned);
        assert_eq!(report.ticks, 2);
        drone.shutdown().await;
    }

    #[tokio::test]
    async fn link_loss_mid_run_is_returned() {
        let link = Arc::new(RecordingLink::new());
        let mut drone = Drone::new(link.clone(), AlignmentConfig::default());
        drone.attach_video(endless_feed());
        let marker = SteadyMarker {
            link: link.clone(),
            calls: AtomicUsize::new(0),
            cut_after: 1,
            target: Measurement::new(200, 0, 0.9, 1.0),
        };
        let result = drone.align_to_target(&marker).await;
        assert!(matches!(
            result,
            Err(AlignError::Transport(TransportError::Disconnected))
        ));
        // Only the search yaw made it out before the link dropped.
        assert_eq!(
            link.rc_history(),
            vec![RcIntent {
                yaw: 40,
                ..RcIntent::ZERO
            }]
        );
        drone.shutdown().await;
    }
}
