use anyhow::{Context, Result};
use dd_capture::{FrameSourceDescriptor, PointerSnapshot, PoolStats};
use dd_core::EngineStats;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::metrics::MetricsSnapshot;

/// Summary of one recording, written as JSON on exit.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub backend: String,
    pub mode: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub engine: EngineStats,
    pub output: MetricsSnapshot,
    pub pool: Option<PoolStats>,
    pub pointer: Option<PointerReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointerReport {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub timestamp: i64,
    pub last_writer: Option<u32>,
    pub shape_bytes: usize,
}

impl From<&PointerSnapshot> for PointerReport {
    fn from(snapshot: &PointerSnapshot) -> Self {
        Self {
            x: snapshot.position.x,
            y: snapshot.position.y,
            visible: snapshot.visible,
            timestamp: snapshot.timestamp,
            last_writer: snapshot.last_writer,
            shape_bytes: snapshot.shape.len(),
        }
    }
}

impl RunReport {
    pub fn new(name: &str, backend: &str, mode: String, descriptor: FrameSourceDescriptor) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            mode,
            width: descriptor.width,
            height: descriptor.height,
            frame_rate: descriptor.frame_rate,
            engine: EngineStats::default(),
            output: MetricsSnapshot::default(),
            pool: None,
            pointer: None,
            error: None,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("Failed to write report")?;
        Ok(())
    }
}
