use crate::engine::FrameCategory;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Progress counters for one acquisition run
pub struct RunMetrics {
    run_name: String,
    frames_received: AtomicU64,
    per_category: [AtomicU64; 4],
    extra_frames: AtomicU64,
    files_written: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetricsSnapshot {
    pub run_name: String,
    pub frames_received: u64,
    pub skip: u64,
    pub background: u64,
    pub data: u64,
    pub post_background: u64,
    pub extra: u64,
    pub files_written: u64,
    pub write_errors: u64,
}

fn category_index(category: FrameCategory) -> usize {
    match category {
        FrameCategory::Skip => 0,
        FrameCategory::Background => 1,
        FrameCategory::Data => 2,
        FrameCategory::PostBackground => 3,
    }
}

impl RunMetrics {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            frames_received: AtomicU64::new(0),
            per_category: Default::default(),
            extra_frames: AtomicU64::new(0),
            files_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn category_count(&self, category: FrameCategory) -> u64 {
        self.per_category[category_index(category)].load(Ordering::Relaxed)
    }

    pub fn record_frame(&self, category: Option<FrameCategory>) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        match category {
            Some(c) => self.per_category[category_index(c)].fetch_add(1, Ordering::Relaxed),
            None => self.extra_frames.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_write(&self, ok: bool) {
        if ok {
            self.files_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        RunMetricsSnapshot {
            run_name: self.run_name.clone(),
            frames_received: self.frames_received(),
            skip: self.category_count(FrameCategory::Skip),
            background: self.category_count(FrameCategory::Background),
            data: self.category_count(FrameCategory::Data),
            post_background: self.category_count(FrameCategory::PostBackground),
            extra: self.extra_frames.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one forwarding direction of the relay
pub struct DirectionMetrics {
    direction: String,
    messages_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    messages_dropped: AtomicU64,
    total_latency_us: AtomicU64,
}

impl DirectionMetrics {
    pub fn new(direction: impl Into<String>) -> Self {
        Self {
            direction: direction.into(),
            messages_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> &str {
        &self.direction
    }

    pub fn messages_forwarded(&self) -> u64 {
        self.messages_forwarded.load(Ordering::Relaxed)
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Messages discarded because the destination peer was absent
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn start_forwarding(&self) -> Instant {
        Instant::now()
    }

    pub fn record_forwarded(&self, start: Instant, bytes: usize) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.messages_forwarded();
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }
}
