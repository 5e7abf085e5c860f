//! Parking lot occupancy library
//!
//! Shared by the aggregator server and the edge sensor binaries, and exposed
//! for integration testing.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
