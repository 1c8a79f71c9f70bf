//! # Transcode Module
//!
//! End-to-end sequencing of one crop transcode.

pub mod engine;
pub mod state;

pub use engine::{TranscodeHandle, TranscodeOrchestrator, TranscodeRequest, TranscodeResult};
pub use state::TranscodeState;
