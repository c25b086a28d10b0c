// THEORY:
// The `video` module owns frame acquisition. A capture device is a blocking
// thing (a socket, a camera, a directory being replayed), so it runs on its own
// OS thread and publishes every frame into a single shared slot.
//
// Key architectural principles:
// 1.  **Latest-frame slot**: the slot is a `tokio::sync::watch` channel holding
//     `Option<Frame>`. Publishing overwrites; there is no queue. Each reader holds
//     its own `FrameSlot` subscription and sees the newest frame, and the channel
//     gives a happens-before edge between publish and read.
// 2.  **Cheap frames**: a `Frame` wraps its pixels in an `Arc`, so handing the same
//     frame to the display and to the alignment loop costs a reference count.
// 3.  **Two read modes**: `latest()` returns whatever is current (repeats allowed),
//     `next()` waits for a frame this subscription has not seen yet.
// 4.  **Shutdown**: the capture thread ends when the source runs dry or fails,
//     and when its `CaptureThread` handle is stopped or dropped. Readers then get
//     `AlignError::FeedClosed` from `next()` once the last frame is consumed.

use crate::error::{AlignError, CaptureError};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// One captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the capture thread, starting at 0.
    pub id: u64,
    pub captured_at: Instant,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self {
            id,
            captured_at: Instant::now(),
            image: Arc::new(image),
        }
    }
}

/// A blocking producer of frames. `Ok(None)` marks the end of the stream.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<Option<RgbImage>, CaptureError> + Send + 'static,
{
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        self()
    }
}

/// Replays the still images of a directory, in file-name order, at a fixed rate.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    position: usize,
    interval: Duration,
    looping: bool,
    last_capture: Option<Instant>,
}

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>, interval: Duration, looping: bool) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        if paths.is_empty() {
            return Err(CaptureError::Empty(dir.display().to_string()));
        }
        paths.sort();
        info!(frames = paths.len(), dir = %dir.display(), "replaying frames");
        Ok(Self {
            paths,
            position: 0,
            interval,
            looping,
            last_capture: None,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        if self.position == self.paths.len() {
            if !self.looping {
                return Ok(None);
            }
            self.position = 0;
        }
        if let Some(last) = self.last_capture {
            let since = last.elapsed();
            if since < self.interval {
                std::thread::sleep(self.interval - since);
            }
        }
        let image = image::open(&self.paths[self.position])?.to_rgb8();
        self.position += 1;
        self.last_capture = Some(Instant::now());
        Ok(Some(image))
    }
}

/// A reader's view of the shared latest-frame slot.
#[derive(Clone)]
pub struct FrameSlot {
    rx: watch::Receiver<Option<Frame>>,
}

impl FrameSlot {
    /// The current frame, waiting only until the first one exists.
    pub async fn latest(&mut self) -> Result<Frame, AlignError> {
        let current = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AlignError::FeedClosed)?;
        current.clone().ok_or(AlignError::FeedClosed)
    }

    /// A frame this subscription has not returned before.
    pub async fn next(&mut self) -> Result<Frame, AlignError> {
        loop {
            // Returns at once while an unseen frame is pending, even after the
            // capture side has gone away.
            self.rx.changed().await.map_err(|_| AlignError::FeedClosed)?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Ok(frame);
            }
        }
    }
}

/// A stand-alone slot that frames are published into by hand.
pub fn frame_slot() -> (FramePublisher, FrameSlot) {
    let (tx, rx) = watch::channel(None);
    (FramePublisher { tx, next_id: 0 }, FrameSlot { rx })
}

/// Write side of a frame slot.
pub struct FramePublisher {
    tx: watch::Sender<Option<Frame>>,
    next_id: u64,
}

impl FramePublisher {
    /// Overwrites the slot. Returns `false` once no reader is left.
    pub fn publish(&mut self, image: RgbImage) -> bool {
        let frame = Frame::new(self.next_id, image);
        self.next_id += 1;
        self.tx.send(Some(frame)).is_ok()
    }
}

/// The frame-capture thread and the slot it fills.
pub struct CaptureThread {
    slot: FrameSlot,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn<S: FrameSource>(mut source: S) -> Result<Self, CaptureError> {
        let (mut publisher, slot) = frame_slot();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("frame-capture".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match source.capture() {
                        // The handle keeps a subscription of its own, so the
                        // slot always has a reader while the thread runs.
                        Ok(Some(image)) => {
                            publisher.publish(image);
                        }
                        Ok(None) => {
                            info!("video source exhausted");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "video capture failed");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            slot,
            stop,
            handle: Some(handle),
        })
    }

    /// A new reader of the latest-frame slot.
    pub fn subscribe(&self) -> FrameSlot {
        self.slot.clone()
    }

    /// Asks the capture thread to finish after its current frame and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("frame-capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb([value, value, value]))
    }

    #[tokio::test]
    async fn latest_waits_for_first_frame_then_repeats() {
        let (mut publisher, mut slot) = frame_slot();
        let reader = tokio::spawn(async move {
            let a = slot.latest().await.unwrap();
            let b = slot.latest().await.unwrap();
            (a.id, b.id)
        });
        tokio::task::yield_now().await;
        assert!(publisher.publish(solid(1)));
        assert_eq!(reader.await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn next_skips_to_newest_and_never_repeats() {
        let (mut publisher, mut slot) = frame_slot();
        publisher.publish(solid(1));
        publisher.publish(solid(2));
        publisher.publish(solid(3));
        let frame = slot.next().await.unwrap();
        assert_eq!(frame.id, 2);
        assert_eq!(frame.image.get_pixel(0, 0), &Rgb([3, 3, 3]));

        let pending = tokio::time::timeout(Duration::from_millis(20), slot.next()).await;
        assert!(pending.is_err());

        publisher.publish(solid(4));
        assert_eq!(slot.next().await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn closed_feed_is_reported() {
        let (publisher, mut slot) = frame_slot();
        drop(publisher);
        assert!(matches!(slot.next().await, Err(AlignError::FeedClosed)));
        assert!(matches!(slot.latest().await, Err(AlignError::FeedClosed)));
    }

    #[tokio::test]
    async fn capture_thread_publishes_until_source_ends() {
        let mut remaining = 3u8;
        let capture = CaptureThread::spawn(move || -> Result<Option<RgbImage>, CaptureError> {
            if remaining == 0 {
                return Ok(None);
            }
            remaining -= 1;
            std::thread::sleep(Duration::from_millis(5));
            Ok(Some(solid(remaining)))
        })
        .unwrap();
        let mut slot = capture.subscribe();

        let mut seen = Vec::new();
        while let Ok(frame) = slot.next().await {
            seen.push(frame.id);
        }
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 2);
        capture.stop();
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_an_endless_source() {
        let captured = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = captured.clone();
        let capture = CaptureThread::spawn(move || -> Result<Option<RgbImage>, CaptureError> {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            Ok(Some(solid(7)))
        })
        .unwrap();
        let mut slot = capture.subscribe();
        slot.next().await.unwrap();

        drop(capture);
        let after_drop = captured.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(captured.load(Ordering::SeqCst), after_drop);

        // The last frame is still readable, then the feed reports closed.
        assert!(slot.latest().await.is_ok());
        while slot.next().await.is_ok() {}
        assert!(matches!(slot.next().await, Err(AlignError::FeedClosed)));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = std::env::temp_dir().join(format!("tello_align_empty_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            ImageDirSource::open(&dir, Duration::ZERO, false),
            Err(CaptureError::Empty(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn directory_replays_in_name_order() {
        let dir = std::env::temp_dir().join(format!("tello_align_frames_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        solid(20).save(dir.join("b.png")).unwrap();
        solid(10).save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::open(&dir, Duration::ZERO, false).unwrap();
        assert_eq!(source.capture().unwrap().unwrap().get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert_eq!(source.capture().unwrap().unwrap().get_pixel(0, 0), &Rgb([20, 20, 20]));
        assert!(source.capture().unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
