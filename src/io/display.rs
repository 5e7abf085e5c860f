//! Output devices for the capture loop
//!
//! Lifecycle is `configure` → `start` → (`acquire_frame_buffer` → `submit`)* →
//! `stop`. Calls out of order are rejected with `DisplayError::OutOfOrder`.

use crate::domain::frame::VideoMode;
use std::fs::File;
use std::io::{BufWriter, Write};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display {op} called while {state}")]
    OutOfOrder { op: &'static str, state: &'static str },
    #[error("submitted buffer has {actual} bytes, mode needs {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("display output failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait DisplayDevice: Send {
    fn configure(&mut self, mode: VideoMode) -> Result<(), DisplayError>;
    fn start(&mut self) -> Result<(), DisplayError>;

    /// Writable buffer of exactly one frame in the configured mode
    fn acquire_frame_buffer(&mut self) -> Result<Vec<u8>, DisplayError>;
    fn submit(&mut self, buffer: Vec<u8>) -> Result<(), DisplayError>;

    /// Stop output. Safe to call more than once.
    fn stop(&mut self) -> Result<(), DisplayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Stage {
    #[default]
    Idle,
    Configured(VideoMode),
    Running(VideoMode),
    Stopped,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Configured(_) => "configured",
            Stage::Running(_) => "running",
            Stage::Stopped => "stopped",
        }
    }
}

/// Lifecycle bookkeeping plus a recycled frame buffer
#[derive(Debug, Default)]
struct Lifecycle {
    stage: Stage,
    spare: Option<Vec<u8>>,
}

impl Lifecycle {
    fn configure(&mut self, mode: VideoMode) -> Result<(), DisplayError> {
        match self.stage {
            Stage::Idle | Stage::Configured(_) => {
                self.stage = Stage::Configured(mode);
                self.spare = None;
                Ok(())
            }
            other => Err(DisplayError::OutOfOrder { op: "configure", state: other.name() }),
        }
    }

    fn start(&mut self) -> Result<VideoMode, DisplayError> {
        match self.stage {
            Stage::Configured(mode) => {
                self.stage = Stage::Running(mode);
                Ok(mode)
            }
            other => Err(DisplayError::OutOfOrder { op: "start", state: other.name() }),
        }
    }

    fn running(&self, op: &'static str) -> Result<VideoMode, DisplayError> {
        match self.stage {
            Stage::Running(mode) => Ok(mode),
            other => Err(DisplayError::OutOfOrder { op, state: other.name() }),
        }
    }

    fn acquire(&mut self) -> Result<Vec<u8>, DisplayError> {
        let mode = self.running("acquire_frame_buffer")?;
        let mut buffer = self.spare.take().unwrap_or_default();
        buffer.clear();
        buffer.resize(mode.frame_len(), 0);
        Ok(buffer)
    }

    fn check_submit(&self, buffer: &[u8]) -> Result<(), DisplayError> {
        let mode = self.running("submit")?;
        if buffer.len() != mode.frame_len() {
            return Err(DisplayError::BufferSize { expected: mode.frame_len(), actual: buffer.len() });
        }
        Ok(())
    }

    fn recycle(&mut self, buffer: Vec<u8>) {
        self.spare = Some(buffer);
    }

    /// Returns true on the first stop after start
    fn stop(&mut self) -> bool {
        let was_running = matches!(self.stage, Stage::Running(_));
        self.stage = Stage::Stopped;
        self.spare = None;
        was_running
    }
}

/// Discards frames; used when no display sink is configured
#[derive(Debug, Default)]
pub struct NullDisplay {
    lifecycle: Lifecycle,
    frames: u64,
}

impl NullDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames
    }
}

impl DisplayDevice for NullDisplay {
    fn configure(&mut self, mode: VideoMode) -> Result<(), DisplayError> {
        self.lifecycle.configure(mode)
    }

    fn start(&mut self) -> Result<(), DisplayError> {
        self.lifecycle.start().map(|_| ())
    }

    fn acquire_frame_buffer(&mut self) -> Result<Vec<u8>, DisplayError> {
        self.lifecycle.acquire()
    }

    fn submit(&mut self, buffer: Vec<u8>) -> Result<(), DisplayError> {
        self.lifecycle.check_submit(&buffer)?;
        self.frames += 1;
        self.lifecycle.recycle(buffer);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DisplayError> {
        self.lifecycle.stop();
        Ok(())
    }
}

/// Appends every submitted frame as raw bytes to a file or stdout (`-`)
pub struct RawFileDisplay {
    path: String,
    lifecycle: Lifecycle,
    out: Option<BufWriter<Box<dyn Write + Send>>>,
    frames: u64,
}

impl RawFileDisplay {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string(), lifecycle: Lifecycle::default(), out: None, frames: 0 }
    }
}

impl DisplayDevice for RawFileDisplay {
    fn configure(&mut self, mode: VideoMode) -> Result<(), DisplayError> {
        self.lifecycle.configure(mode)
    }

    fn start(&mut self) -> Result<(), DisplayError> {
        let mode = self.lifecycle.start()?;
        let sink: Box<dyn Write + Send> = if self.path == "-" {
            Box::new(std::io::stdout())
        } else {
            Box::new(File::create(&self.path)?)
        };
        self.out = Some(BufWriter::new(sink));
        info!(
            sink = %self.path,
            width = %mode.width,
            height = %mode.height,
            bpp = %mode.bits_per_pixel,
            "display_started"
        );
        Ok(())
    }

    fn acquire_frame_buffer(&mut self) -> Result<Vec<u8>, DisplayError> {
        self.lifecycle.acquire()
    }

    fn submit(&mut self, buffer: Vec<u8>) -> Result<(), DisplayError> {
        self.lifecycle.check_submit(&buffer)?;
        if let Some(out) = self.out.as_mut() {
            out.write_all(&buffer)?;
        }
        self.frames += 1;
        self.lifecycle.recycle(buffer);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DisplayError> {
        if self.lifecycle.stop() {
            debug!(sink = %self.path, frames = %self.frames, "display_stopped");
        }
        match self.out.take() {
            Some(mut out) => out.flush().map_err(DisplayError::from),
            None => Ok(()),
        }
    }
}
