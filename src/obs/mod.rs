//! OBS WebSocket recording controller

mod controller;

pub use controller::*;
