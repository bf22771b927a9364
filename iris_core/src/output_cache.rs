//! # Per-team Output Cache
//!
//! Bounded ring of the most recent bytes a team's child wrote to stdout
//! (unstructured lines only) and stderr (everything). The cache outlives
//! the process status transitions so that `report` can post-mortem a
//! crashed child; it is destroyed with the `ChildProcess` entry and can be
//! cleared explicitly by `wake`/`sleep`.

use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::constants::OUTPUT_CACHE_CAP;

#[derive(Debug, Default)]
struct ByteRing {
    bytes: VecDeque<u8>,
    cap: usize,
}

impl ByteRing {
    fn with_cap(cap: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            cap,
        }
    }

    fn append(&mut self, data: &[u8]) {
        // A single oversized write keeps only its tail.
        let data = if data.len() > self.cap {
            &data[data.len() - self.cap..]
        } else {
            data
        };
        while self.bytes.len() + data.len() > self.cap {
            self.bytes.pop_front();
        }
        self.bytes.extend(data);
    }

    fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.bytes.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

/// Point-in-time view of one team's cached output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSnapshot {
    pub team: String,
    pub stdout: String,
    pub stderr: String,
    /// Total bytes ever appended, including bytes already evicted.
    pub total_bytes: u64,
}

/// Bounded stdout/stderr rings for one team.
#[derive(Debug)]
pub struct OutputCache {
    team: String,
    inner: Mutex<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    stdout: ByteRing,
    stderr: ByteRing,
    total_bytes: u64,
}

impl OutputCache {
    pub fn new(team: impl Into<String>) -> Self {
        Self::with_cap(team, OUTPUT_CACHE_CAP)
    }

    pub fn with_cap(team: impl Into<String>, cap: usize) -> Self {
        Self {
            team: team.into(),
            inner: Mutex::new(CacheInner {
                stdout: ByteRing::with_cap(cap),
                stderr: ByteRing::with_cap(cap),
                total_bytes: 0,
            }),
        }
    }

    pub async fn append_stdout(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.total_bytes += data.len() as u64;
        inner.stdout.append(data);
    }

    pub async fn append_stderr(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.total_bytes += data.len() as u64;
        inner.stderr.append(data);
    }

    pub async fn snapshot(&self) -> OutputSnapshot {
        let inner = self.inner.lock().await;
        OutputSnapshot {
            team: self.team.clone(),
            stdout: inner.stdout.snapshot(),
            stderr: inner.stderr.snapshot(),
            total_bytes: inner.total_bytes,
        }
    }

    /// Reset both rings. The running total is kept; it counts lifetime
    /// output, not current occupancy.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.stdout.bytes.clear();
        inner.stderr.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_evicts_oldest_bytes() {
        let cache = OutputCache::with_cap("alpha", 8);
        cache.append_stdout(b"abcdefgh").await;
        cache.append_stdout(b"XY").await;
        let snap = cache.snapshot().await;
        assert_eq!(snap.stdout, "cdefghXY");
        assert_eq!(snap.total_bytes, 10);
    }

    #[tokio::test]
    async fn oversized_write_keeps_tail() {
        let cache = OutputCache::with_cap("alpha", 4);
        cache.append_stderr(b"0123456789").await;
        let snap = cache.snapshot().await;
        assert_eq!(snap.stderr, "6789");
    }

    #[tokio::test]
    async fn clear_resets_rings_but_not_total() {
        let cache = OutputCache::with_cap("alpha", 64);
        cache.append_stdout(b"hello").await;
        cache.clear().await;
        let snap = cache.snapshot().await;
        assert!(snap.stdout.is_empty());
        assert_eq!(snap.total_bytes, 5);
    }
}
