//! IO modules - external system interfaces
//!
//! - `api_server` - HTTP aggregator endpoint (register, report, lots, metrics)
//! - `sensor_client` - HTTP client used by edge sensors
//! - `capture` - Frame sources (raw BGR24 streams)
//! - `display` - Frame sinks with an enforced device lifecycle
//! - `keyboard` - Interactive session commands

pub mod api_server;
pub mod capture;
pub mod display;
pub mod keyboard;
pub mod sensor_client;

// Re-export commonly used types
pub use api_server::{serve, start_api_server, ApiState};
pub use capture::{CaptureDevice, CaptureError, RawStreamCapture};
pub use display::{DisplayDevice, DisplayError, NullDisplay, RawFileDisplay};
pub use sensor_client::{ClientError, RetryPolicy, SensorClient};
