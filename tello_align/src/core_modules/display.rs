// THEORY:
// The display is a consumer of the same latest-frame slot the alignment loop
// reads, running as its own tokio task. It shows the live feed until an
// alignment run starts; during the run it is paused and only shows the
// annotated frames the run pushes to it, so the control loop is the only thing
// pulling frames for decisions.
//
// Control is message based. `Pause` carries a oneshot that the actor answers
// after it has finished presenting its current frame, which gives the caller a
// hard "display is quiet now" point. `Resume` and `Single` need no answer.
//
// Sinks are pluggable: `FrameBus` fans JPEG packets out to any number of
// viewers over a broadcast channel, `SnapshotSink` keeps a PNG on disk.

use crate::core_modules::perception::Measurement;
use crate::core_modules::video::{Frame, FrameSlot};
use crate::error::AlignError;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CONTROL_CAPACITY: usize = 8;
const JPEG_QUALITY: u8 = 80;
const CROSSHAIR_HALF: i64 = 6;
const CENTRE_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const TARGET_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);

/// Anything that can show a frame.
pub trait DisplaySink: Send + 'static {
    fn present(&mut self, frame: &Frame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

#[derive(Debug, Clone)]
pub struct FramePacket {
    pub frame_id: u64,
    pub ts_millis: u64,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

/// Broadcasts encoded frames to external viewers. Viewers that fall behind
/// lose the oldest packets.
#[derive(Clone)]
pub struct FrameBus {
    frames_tx: broadcast::Sender<FramePacket>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        Self { frames_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FramePacket> {
        self.frames_tx.subscribe()
    }

    pub fn viewers(&self) -> usize {
        self.frames_tx.receiver_count()
    }
}

impl DisplaySink for FrameBus {
    fn present(&mut self, frame: &Frame) {
        if self.frames_tx.receiver_count() == 0 {
            return;
        }
        let mut data = Vec::new();
        if let Err(e) = JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY).encode_image(&*frame.image) {
            warn!(frame = frame.id, error = %e, "cannot encode frame");
            return;
        }
        let ts_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let packet = FramePacket {
            frame_id: frame.id,
            ts_millis,
            width: frame.image.width(),
            height: frame.image.height(),
            format: FrameFormat::Jpeg,
            data: data.into(),
        };
        // Only fails when the last viewer left since the check above.
        let _ = self.frames_tx.send(packet);
    }
}

/// Rewrites one PNG file with every presented frame.
pub struct SnapshotSink {
    path: PathBuf,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, image: &RgbImage) -> Result<(), image::ImageError> {
        let staging = self.path.with_extension("png.partial");
        let output = std::fs::File::create(&staging)?;
        PngEncoder::new(output).write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl DisplaySink for SnapshotSink {
    fn present(&mut self, frame: &Frame) {
        if let Err(e) = self.write(&frame.image) {
            warn!(path = %self.path.display(), error = %e, "cannot write snapshot");
        }
    }
}

#[derive(Debug)]
pub enum DisplayMessage {
    /// Stop presenting the live feed; the sender is answered once the actor is idle.
    Pause(oneshot::Sender<()>),
    Resume,
    /// Present this frame once, paused or not.
    Single(Frame),
}

/// Handle to the display task.
pub struct DisplayHandle {
    tx: mpsc::Sender<DisplayMessage>,
    task: JoinHandle<()>,
}

impl DisplayHandle {
    /// Starts the display task on the current runtime.
    pub fn spawn<S: DisplaySink>(slot: FrameSlot, sink: S) -> Self {
        let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
        let task = tokio::spawn(run_display(slot, sink, rx));
        Self { tx, task }
    }

    /// Pauses the live feed and waits until the display has gone quiet.
    pub async fn pause(&self) -> Result<(), AlignError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(DisplayMessage::Pause(ack_tx))
            .await
            .map_err(|_| AlignError::DisplayClosed)?;
        ack_rx.await.map_err(|_| AlignError::DisplayClosed)
    }

    pub async fn resume(&self) -> Result<(), AlignError> {
        self.tx
            .send(DisplayMessage::Resume)
            .await
            .map_err(|_| AlignError::DisplayClosed)
    }

    /// Queues one frame for display. Drops it if the display is backed up.
    pub fn show_single(&self, frame: Frame) -> Result<(), AlignError> {
        match self.tx.try_send(DisplayMessage::Single(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("display busy, annotated frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AlignError::DisplayClosed),
        }
    }

    /// Stops the task after it has drained its queued messages.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "display task failed");
        }
    }
}

async fn run_display<S: DisplaySink>(
    mut slot: FrameSlot,
    mut sink: S,
    mut rx: mpsc::Receiver<DisplayMessage>,
) {
    let mut paused = false;
    let mut feed_open = true;
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(DisplayMessage::Pause(ack)) => {
                    paused = true;
                    let _ = ack.send(());
                }
                Some(DisplayMessage::Resume) => paused = false,
                Some(DisplayMessage::Single(frame)) => sink.present(&frame),
                None => break,
            },
            frame = slot.next(), if feed_open && !paused => match frame {
                Ok(frame) => sink.present(&frame),
                Err(_) => {
                    debug!("display feed closed");
                    feed_open = false;
                }
            },
        }
    }
    debug!("display stopped");
}

/// Copy of `image` with a crosshair on the image centre and, when a target
/// is known, a line from the centre to the target.
pub fn annotate(image: &RgbImage, target: Option<&Measurement>) -> RgbImage {
    let mut out = image.clone();
    let (cx, cy) = ((out.width() / 2) as i64, (out.height() / 2) as i64);
    if let Some(m) = target {
        draw_line(
            &mut out,
            (cx, cy),
            (cx + m.dx as i64, cy + m.dy as i64),
            TARGET_COLOUR,
        );
    }
    for d in -CROSSHAIR_HALF..=CROSSHAIR_HALF {
        put(&mut out, cx + d, cy, CENTRE_COLOUR);
        put(&mut out, cx, cy + d, CENTRE_COLOUR);
    }
    out
}

fn put(image: &mut RgbImage, x: i64, y: i64, colour: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
        image.put_pixel(x as u32, y as u32, colour);
    }
}

// Bresenham, clipped per pixel.
fn draw_line(image: &mut RgbImage, from: (i64, i64), to: (i64, i64), colour: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(image, x, y, colour);
        if (x, y) == to {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::video::frame_slot;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingSink {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl RecordingSink {
        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DisplaySink for RecordingSink {
        fn present(&mut self, frame: &Frame) {
            self.seen.lock().unwrap().push(frame.id);
        }
    }

    fn blank() -> RgbImage {
        RgbImage::new(16, 12)
    }

    async fn wait_until(sink: &RecordingSink, id: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !sink.seen().contains(&id) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn paused_display_only_shows_pushed_frames() {
        let (mut publisher, slot) = frame_slot();
        let sink = RecordingSink::default();
        let display = DisplayHandle::spawn(slot, sink.clone());

        publisher.publish(blank());
        wait_until(&sink, 0).await;

        display.pause().await.unwrap();
        publisher.publish(blank());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.seen(), vec![0]);

        display.show_single(Frame::new(99, blank())).unwrap();
        // A second pause doubles as a barrier behind the queued frame.
        display.pause().await.unwrap();
        assert_eq!(sink.seen(), vec![0, 99]);

        display.resume().await.unwrap();
        wait_until(&sink, 1).await;
        assert_eq!(sink.seen(), vec![0, 99, 1]);
        display.close().await;
    }

    #[tokio::test]
    async fn control_survives_closed_feed() {
        let (publisher, slot) = frame_slot();
        let sink = RecordingSink::default();
        let display = DisplayHandle::spawn(slot, sink.clone());
        drop(publisher);

        display.pause().await.unwrap();
        display.show_single(Frame::new(7, blank())).unwrap();
        display.resume().await.unwrap();
        wait_until(&sink, 7).await;
        display.close().await;
    }

    #[tokio::test]
    async fn frame_bus_delivers_jpeg_packets() {
        let mut bus = FrameBus::new(2);
        let mut viewer = bus.subscribe();
        assert_eq!(bus.viewers(), 1);
        bus.present(&Frame::new(3, RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]))));

        let packet = viewer.recv().await.unwrap();
        assert_eq!(packet.frame_id, 3);
        assert_eq!((packet.width, packet.height), (8, 8));
        assert_eq!(packet.format, FrameFormat::Jpeg);
        assert_eq!(&packet.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn snapshot_sink_writes_png() {
        let path = std::env::temp_dir().join(format!("tello_align_snapshot_{}.png", std::process::id()));
        let mut sink = SnapshotSink::new(&path);
        sink.present(&Frame::new(0, RgbImage::from_pixel(5, 4, Rgb([1, 2, 3]))));

        let written = image::open(&path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (5, 4));
        assert_eq!(written.get_pixel(4, 3), &Rgb([1, 2, 3]));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn annotate_marks_centre_and_target() {
        let image = RgbImage::new(40, 30);
        let m = Measurement::new(10, -8, 1.0, 1.0);
        let out = annotate(&image, Some(&m));
        assert_eq!(out.get_pixel(20, 15), &CENTRE_COLOUR);
        assert_eq!(out.get_pixel(30, 7), &TARGET_COLOUR);
        assert_eq!(image.get_pixel(20, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn annotate_clips_far_targets() {
        let image = RgbImage::new(10, 10);
        let m = Measurement::new(500, 500, 1.0, 1.0);
        let out = annotate(&image, Some(&m));
        assert_eq!(out.get_pixel(9, 9), &TARGET_COLOUR);
        let plain = annotate(&image, None);
        assert_eq!(plain.get_pixel(9, 9), &Rgb([0, 0, 0]));
    }
}
