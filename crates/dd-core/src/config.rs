use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames buffered between the capture thread and the sink. When full, new
    /// frames are dropped rather than stalling capture.
    pub frame_channel_capacity: usize,
    /// Overrides the source's frame rate.
    pub frame_rate: Option<u32>,
    /// Forward repeat markers to the sink so it can duplicate the last frame.
    pub forward_repeats: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_channel_capacity: 8,
            frame_rate: None,
            forward_repeats: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_channel_capacity == 0 {
            return Err(EngineError::Config("frame_channel_capacity must be at least 1".into()));
        }
        if let Some(rate) = self.frame_rate {
            if rate == 0 || rate > 240 {
                return Err(EngineError::Config(format!("frame_rate {} out of range 1-240", rate)));
            }
        }
        Ok(())
    }
}
