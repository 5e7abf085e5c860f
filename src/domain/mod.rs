//! Domain models - identifiers, wire records and frames
//!
//! - `types` - Device keys, lot ids, delta events and the JSON wire records
//! - `frame` - Color and grayscale frame buffers

pub mod frame;
pub mod types;
