//! Runtime bootstrap shared by the binary and embedding services.

pub mod error;
pub mod telemetry;
