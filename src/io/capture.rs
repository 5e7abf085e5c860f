//! Frame sources for the capture loop
//!
//! A raw stream is a sequence of packed BGR24 frames of a fixed resolution,
//! read from a file or from stdin (`-`). Reads block; there is no timeout.

use crate::domain::frame::{ColorFrame, VideoMode};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device is not open")]
    NotOpen,
    #[error("end of stream after {0} frame(s)")]
    EndOfStream(u64),
    #[error("failed to open capture source {source_name}: {error}")]
    Open { source_name: String, error: std::io::Error },
    #[error("capture read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A camera or equivalent frame source
pub trait CaptureDevice: Send {
    fn is_open(&self) -> bool;

    /// Next frame; end of stream and read failures are both errors
    fn read_frame(&mut self) -> Result<ColorFrame, CaptureError>;

    /// Release the underlying handle. Safe to call more than once.
    fn release(&mut self);
}

pub struct RawStreamCapture {
    source: String,
    reader: Option<Box<dyn Read + Send>>,
    mode: VideoMode,
    seq: u64,
}

impl RawStreamCapture {
    /// Open a raw BGR24 stream; `-` reads stdin
    pub fn open(source: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
        let reader: Box<dyn Read + Send> = if source == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file = File::open(source).map_err(|error| CaptureError::Open {
                source_name: source.to_string(),
                error,
            })?;
            Box::new(BufReader::new(file))
        };

        info!(source = %source, width = %width, height = %height, "capture_opened");
        Ok(Self::from_reader(source, reader, width, height))
    }

    pub fn from_reader(
        source: &str,
        reader: Box<dyn Read + Send>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            source: source.to_string(),
            reader: Some(reader),
            mode: VideoMode::bgr24(width, height),
            seq: 0,
        }
    }
}

impl CaptureDevice for RawStreamCapture {
    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    fn read_frame(&mut self) -> Result<ColorFrame, CaptureError> {
        let reader = self.reader.as_mut().ok_or(CaptureError::NotOpen)?;

        let mut data = vec![0u8; self.mode.frame_len()];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(CaptureError::EndOfStream(self.seq));
            }
            Err(e) => return Err(CaptureError::Io(e)),
        }

        let frame = ColorFrame::from_bgr(self.mode.width, self.mode.height, self.seq, data)
            .ok_or(CaptureError::NotOpen)?;
        self.seq += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if self.reader.take().is_some() {
            debug!(source = %self.source, frames = %self.seq, "capture_released");
        }
    }
}

/// In-memory frame source, used for replays and tests
#[derive(Debug, Default)]
pub struct FrameSequence {
    frames: VecDeque<ColorFrame>,
    open: bool,
    served: u64,
}

impl FrameSequence {
    pub fn new(frames: impl IntoIterator<Item = ColorFrame>) -> Self {
        Self { frames: frames.into_iter().collect(), open: true, served: 0 }
    }

    /// A source that reports closed from the start
    pub fn closed() -> Self {
        Self::default()
    }
}

impl CaptureDevice for FrameSequence {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Result<ColorFrame, CaptureError> {
        if !self.open {
            return Err(CaptureError::NotOpen);
        }
        let frame = self.frames.pop_front().ok_or(CaptureError::EndOfStream(self.served))?;
        self.served += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.open = false;
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_raw_stream_reads_whole_frames() {
        let mode = VideoMode::bgr24(4, 2);
        let mut bytes = vec![10u8; mode.frame_len()];
        bytes.extend(vec![20u8; mode.frame_len()]);
        // Trailing partial frame is not delivered
        bytes.extend(vec![30u8; 5]);

        let mut capture = RawStreamCapture::from_reader("test", Box::new(Cursor::new(bytes)), 4, 2);
        assert!(capture.is_open());

        let first = capture.read_frame().unwrap();
        assert_eq!(first.seq(), 0);
        assert!(first.as_bytes().iter().all(|&b| b == 10));
        let second = capture.read_frame().unwrap();
        assert_eq!(second.seq(), 1);
        assert!(second.as_bytes().iter().all(|&b| b == 20));

        assert!(matches!(capture.read_frame(), Err(CaptureError::EndOfStream(2))));
    }

    #[test]
    fn test_released_capture_is_closed() {
        let mut capture =
            RawStreamCapture::from_reader("test", Box::new(Cursor::new(vec![0u8; 24])), 4, 2);
        capture.release();
        capture.release();
        assert!(!capture.is_open());
        assert!(matches!(capture.read_frame(), Err(CaptureError::NotOpen)));
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let err = RawStreamCapture::open("/nonexistent/frames.raw", 4, 2).err().unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
    }

    #[test]
    fn test_frame_sequence() {
        let mut seq = FrameSequence::new([ColorFrame::filled(2, 2, 0, [0, 0, 0])]);
        assert!(seq.read_frame().is_ok());
        assert!(matches!(seq.read_frame(), Err(CaptureError::EndOfStream(1))));
        assert!(matches!(FrameSequence::closed().read_frame(), Err(CaptureError::NotOpen)));
    }
}
