use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

/// Local JSONL event buffer. Events queue in memory and flush to disk in
/// batches; the buffer file rotates once it exceeds the configured cap.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join("telemetry-buffer.jsonl");

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(TelemetryEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            incoming += (line.len() + 1) as u64;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        // One previous generation is kept; older rotations are replaced.
        let rotated = self
            .buffer_path
            .with_file_name("telemetry-buffer.prev.jsonl");
        if self.buffer_path.exists() {
            fs::rename(&self.buffer_path, &rotated)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}
