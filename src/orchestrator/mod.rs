//! Playback-to-recording orchestration

mod engine;

pub use engine::*;
