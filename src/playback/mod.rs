//! Playback engine process handle and lifecycle event stream

mod engine;
mod events;

pub use engine::*;
pub use events::*;
