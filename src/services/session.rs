//! One camera session: capture → detect → report → display
//!
//! The session owns the capture and display handles. Teardown (stop display,
//! then release capture) runs exactly once on every exit path: normal quit,
//! any loop error, or drop during unwinding.
//!
//! The loop is sequential. Commands are drained without blocking at the top
//! of each iteration, but a capture read that never returns can only be
//! interrupted by ending the process.

use crate::domain::frame::{ColorFrame, VideoMode};
use crate::domain::types::{DeltaEvent, DeviceKey};
use crate::infra::config::DisplayMode;
use crate::io::capture::{CaptureDevice, CaptureError};
use crate::io::display::{DisplayDevice, DisplayError};
use crate::io::sensor_client::ClientError;
use crate::services::detector::FrameDiffDetector;
use async_trait::async_trait;
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{error, info, warn};

/// Destination for detected occupancy changes
#[async_trait]
pub trait DeltaSink: Send + Sync {
    async fn send(&self, event: DeltaEvent) -> Result<(), ClientError>;
}

/// Operator input delivered to a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Quit,
    ShowColor,
    ShowMask,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SessionError {
    fn kind(&self) -> &'static str {
        match self {
            SessionError::Capture(_) => "capture",
            SessionError::Display(_) => "display",
            SessionError::Client(_) => "client",
        }
    }
}

/// Counters for one session, logged on exit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_read: u64,
    pub events_sent: u64,
    pub enter_total: u64,
    pub exit_total: u64,
}

pub struct Session {
    capture: Box<dyn CaptureDevice>,
    display: Box<dyn DisplayDevice>,
    mode: VideoMode,
    display_mode: DisplayMode,
    closed: bool,
}

impl Session {
    pub fn new(
        capture: Box<dyn CaptureDevice>,
        display: Box<dyn DisplayDevice>,
        mode: VideoMode,
        display_mode: DisplayMode,
    ) -> Self {
        Self { capture, display, mode, display_mode, closed: false }
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    /// Run until quit or the first error. Resources are released before
    /// this returns, whatever the outcome.
    pub async fn run(
        mut self,
        detector: &mut FrameDiffDetector,
        sink: &dyn DeltaSink,
        key: DeviceKey,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<SessionSummary, SessionError> {
        let started = Instant::now();
        let mut summary = SessionSummary::default();

        let result = self.run_loop(detector, sink, key, commands, &mut summary).await;
        self.close();

        info!(
            device_key = %key,
            frames = %summary.frames_read,
            events = %summary.events_sent,
            enter_total = %summary.enter_total,
            exit_total = %summary.exit_total,
            duration_s = %started.elapsed().as_secs(),
            "session_summary"
        );

        if let Err(e) = &result {
            error!(device_key = %key, kind = %e.kind(), error = %e, "session_failed");
        }
        result.map(|()| summary)
    }

    async fn run_loop(
        &mut self,
        detector: &mut FrameDiffDetector,
        sink: &dyn DeltaSink,
        key: DeviceKey,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        summary: &mut SessionSummary,
    ) -> Result<(), SessionError> {
        if !self.capture.is_open() {
            warn!(device_key = %key, "capture_not_open");
            return Err(CaptureError::NotOpen.into());
        }

        self.display.configure(self.mode)?;
        self.display.start()?;
        info!(
            device_key = %key,
            width = %self.mode.width,
            height = %self.mode.height,
            display_mode = ?self.display_mode,
            "session_started"
        );

        loop {
            if self.drain_commands(commands) {
                info!(device_key = %key, frames = %summary.frames_read, "session_quit_requested");
                return Ok(());
            }

            let capture = &mut self.capture;
            let (frame, observed) = blocking(|| {
                let frame = capture.read_frame()?;
                let observed = detector.observe(&frame);
                Ok::<_, CaptureError>((frame, observed))
            })?;
            summary.frames_read += 1;

            if let Some(delta) = observed {
                sink.send(DeltaEvent { device_key: key, delta }).await?;
                summary.events_sent += 1;
                summary.enter_total += u64::from(delta.enter);
                summary.exit_total += u64::from(delta.exit);
            }

            self.show(&frame, detector)?;
        }
    }

    /// Apply queued commands; true when quit was requested
    fn drain_commands(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(SessionCommand::Quit) => return true,
                Ok(SessionCommand::ShowColor) => self.display_mode = DisplayMode::Color,
                Ok(SessionCommand::ShowMask) => self.display_mode = DisplayMode::Mask,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn show(&mut self, frame: &ColorFrame, detector: &FrameDiffDetector) -> Result<(), SessionError> {
        let mask_pixels;
        let source = match (self.display_mode, detector.last_mask()) {
            (DisplayMode::Mask, Some(mask)) if mask.seq == frame.seq() => {
                mask_pixels = mask.to_bgr();
                mask_pixels.as_slice()
            }
            _ => frame.as_bytes(),
        };

        let mut buffer = self.display.acquire_frame_buffer()?;
        let n = source.len().min(buffer.len());
        buffer[..n].copy_from_slice(&source[..n]);
        self.display.submit(buffer)?;
        Ok(())
    }

    /// Stop display, then release capture. Runs once.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.display.stop() {
            warn!(error = %e, "display_stop_failed");
        }
        self.capture.release();
        info!("session_closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a blocking read or CPU-heavy step without stalling other tasks on the worker
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OccupancyDelta;
    use crate::infra::config::{Axis, EventsConfig, Inbound};
    use crate::io::capture::FrameSequence;
    use crate::io::display::NullDisplay;
    use crate::services::detector::{DetectorSettings, FixedBackground};
    use crate::services::events::AreaEpisodePolicy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counts {
        reads: AtomicUsize,
        releases: AtomicUsize,
        stops: AtomicUsize,
        submits: AtomicUsize,
    }

    struct CountingCapture {
        inner: FrameSequence,
        counts: Arc<Counts>,
    }

    impl CaptureDevice for CountingCapture {
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn read_frame(&mut self) -> Result<ColorFrame, CaptureError> {
            self.counts.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_frame()
        }

        fn release(&mut self) {
            self.counts.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release();
        }
    }

    struct CountingDisplay {
        inner: NullDisplay,
        counts: Arc<Counts>,
    }

    impl DisplayDevice for CountingDisplay {
        fn configure(&mut self, mode: VideoMode) -> Result<(), DisplayError> {
            self.inner.configure(mode)
        }

        fn start(&mut self) -> Result<(), DisplayError> {
            self.inner.start()
        }

        fn acquire_frame_buffer(&mut self) -> Result<Vec<u8>, DisplayError> {
            self.inner.acquire_frame_buffer()
        }

        fn submit(&mut self, buffer: Vec<u8>) -> Result<(), DisplayError> {
            self.counts.submits.fetch_add(1, Ordering::SeqCst);
            self.inner.submit(buffer)
        }

        fn stop(&mut self) -> Result<(), DisplayError> {
            self.counts.stops.fetch_add(1, Ordering::SeqCst);
            self.inner.stop()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DeltaEvent>>,
        fail_with_unknown: bool,
    }

    #[async_trait]
    impl DeltaSink for RecordingSink {
        async fn send(&self, event: DeltaEvent) -> Result<(), ClientError> {
            if self.fail_with_unknown {
                return Err(ClientError::UnknownDevice(event.device_key));
            }
            self.events.lock().push(event);
            Ok(())
        }
    }

    const W: u32 = 64;
    const H: u32 = 48;

    fn frame_with_square(seq: u64, x: u32, side: u32) -> ColorFrame {
        let mut frame = ColorFrame::filled(W, H, seq, [40, 40, 40]);
        let data = frame.as_bytes_mut();
        for yy in 14..(14 + side).min(H) {
            for xx in x..(x + side).min(W) {
                let i = ((yy * W + xx) * 3) as usize;
                data[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        frame
    }

    /// Background, a square crossing left to right, then empty again
    fn crossing() -> Vec<ColorFrame> {
        let mut frames = vec![frame_with_square(0, 0, 0)];
        for (i, x) in [2u32, 12, 22, 32, 42].iter().enumerate() {
            frames.push(frame_with_square(i as u64 + 1, *x, 12));
        }
        frames.push(frame_with_square(6, 0, 0));
        frames
    }

    fn detector() -> FrameDiffDetector {
        let events = EventsConfig {
            activate_area: 100,
            release_area: 10,
            axis: Axis::Horizontal,
            inbound: Inbound::Positive,
            min_travel: 10.0,
        };
        FrameDiffDetector::new(
            DetectorSettings::default(),
            Box::new(FixedBackground::default()),
            Box::new(AreaEpisodePolicy::from_config(&events)),
        )
    }

    fn session(frames: FrameSequence, counts: &Arc<Counts>) -> Session {
        Session::new(
            Box::new(CountingCapture { inner: frames, counts: counts.clone() }),
            Box::new(CountingDisplay { inner: NullDisplay::new(), counts: counts.clone() }),
            VideoMode::bgr24(W, H),
            DisplayMode::Color,
        )
    }

    #[tokio::test]
    async fn test_closed_capture_ends_session_and_releases_once() {
        let counts = Arc::new(Counts::default());
        let sink = RecordingSink::default();
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let result =
            session(FrameSequence::closed(), &counts).run(&mut detector(), &sink, DeviceKey(1), &mut rx).await;

        assert!(matches!(result, Err(SessionError::Capture(CaptureError::NotOpen))));
        assert_eq!(counts.reads.load(Ordering::SeqCst), 0);
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counts.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_crossing_sends_one_entry_then_ends_on_eof() {
        let counts = Arc::new(Counts::default());
        let sink = RecordingSink::default();
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let result = session(FrameSequence::new(crossing()), &counts)
            .run(&mut detector(), &sink, DeviceKey(7), &mut rx)
            .await;

        assert!(matches!(result, Err(SessionError::Capture(CaptureError::EndOfStream(7)))));
        assert_eq!(*sink.events.lock(), vec![DeltaEvent { device_key: DeviceKey(7), delta: OccupancyDelta::ENTER }]);
        assert_eq!(counts.submits.load(Ordering::SeqCst), 7);
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crossing_on_multi_thread_runtime() {
        let counts = Arc::new(Counts::default());
        let sink = RecordingSink::default();
        let (_tx, mut rx) = mpsc::unbounded_channel();

        // Another task keeps making progress while frames are read and diffed
        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        });

        let result = session(FrameSequence::new(crossing()), &counts)
            .run(&mut detector(), &sink, DeviceKey(9), &mut rx)
            .await;

        assert!(matches!(result, Err(SessionError::Capture(CaptureError::EndOfStream(7)))));
        assert_eq!(*sink.events.lock(), vec![DeltaEvent { device_key: DeviceKey(9), delta: OccupancyDelta::ENTER }]);
        assert_eq!(counts.reads.load(Ordering::SeqCst), 8);
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_quit_reads_nothing() {
        let counts = Arc::new(Counts::default());
        let sink = RecordingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionCommand::ShowMask).unwrap();
        tx.send(SessionCommand::Quit).unwrap();

        let summary = session(FrameSequence::new(crossing()), &counts)
            .run(&mut detector(), &sink, DeviceKey(1), &mut rx)
            .await
            .unwrap();

        assert_eq!(summary, SessionSummary::default());
        assert_eq!(counts.reads.load(Ordering::SeqCst), 0);
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_ends_session() {
        let counts = Arc::new(Counts::default());
        let sink = RecordingSink { fail_with_unknown: true, ..Default::default() };
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let result = session(FrameSequence::new(crossing()), &counts)
            .run(&mut detector(), &sink, DeviceKey(3), &mut rx)
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Client(ClientError::UnknownDevice(DeviceKey(3))))
        ));
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_without_run_releases_once() {
        let counts = Arc::new(Counts::default());
        drop(session(FrameSequence::new(crossing()), &counts));
        assert_eq!(counts.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counts.stops.load(Ordering::SeqCst), 1);
    }
}
