//! Recording core of a low-overhead sampling profiler for managed-runtime
//! processes: sampling collaborators hand it resolved events, and it
//! persists them into self-describing, chunked flight-recording files.

pub mod recording;

pub use recording::{Arguments, FlightRecorder, RecorderError};
