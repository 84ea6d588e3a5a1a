use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// The counters named as the peripheral metrics-sink seam: put-count,
/// get-count, queue-size, journal-bytes, open-read-count. The core only
/// maintains these; exporting them (Prometheus, stats endpoint, ...) is an
/// external collaborator's job.
#[derive(Debug, Default)]
pub struct Metrics {
    put_count: AtomicU64,
    get_count: AtomicU64,
    queue_size: AtomicI64,
    journal_bytes: AtomicU64,
    open_read_count: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub put_count: u64,
    pub get_count: u64,
    pub queue_size: i64,
    pub journal_bytes: u64,
    pub open_read_count: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_put(&self, frame_bytes: u64) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.journal_bytes.fetch_add(frame_bytes, Ordering::Relaxed);
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.queue_size.fetch_sub(1, Ordering::Relaxed);
        self.open_read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.open_read_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.open_read_count.fetch_sub(1, Ordering::Relaxed);
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_journal_bytes_reclaimed(&self, bytes: u64) {
        self.journal_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            put_count: self.put_count.load(Ordering::Relaxed),
            get_count: self.get_count.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            journal_bytes: self.journal_bytes.load(Ordering::Relaxed),
            open_read_count: self.open_read_count.load(Ordering::Relaxed),
        }
    }
}
