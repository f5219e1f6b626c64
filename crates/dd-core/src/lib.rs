pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use engine::CaptureEngine;
pub use error::{EngineError, Result};
pub use types::{EngineStats, FrameSink, FrameStamp};

// Re-export for convenience
pub use dd_capture;
