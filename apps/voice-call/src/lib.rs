pub mod call;
pub mod config;
pub mod media;
pub mod playback;
pub mod signaling;
pub mod telemetry;
pub mod transport;
