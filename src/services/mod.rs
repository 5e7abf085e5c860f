//! Services - business logic and state management
//!
//! - `registry` - Device keys and their lot assignment
//! - `aggregator` - Per-lot occupancy counters
//! - `detector` - Frame differencing motion detector
//! - `events` - Motion mask to enter/exit mapping
//! - `session` - Capture loop for one camera session

pub mod aggregator;
pub mod detector;
pub mod events;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use aggregator::{CounterStore, IngestError, MemoryStore, OccupancyAggregator};
pub use detector::FrameDiffDetector;
pub use registry::{Registry, RegistryError};
pub use session::{DeltaSink, Session, SessionCommand, SessionError, SessionSummary};
