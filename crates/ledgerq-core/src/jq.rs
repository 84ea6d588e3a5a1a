//! Component G: a Journal plus one in-memory [`CbQueue`] per reader,
//! exposing the durable, fan-out put/get/commit/abort surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::info;

use ledgerq_common::{Clock, Error, Result};

use crate::cbq::CbQueue;
use crate::item::{ItemId, QueueItem};
use crate::journal::{Durable, Journal, JournalConfig};
use crate::metrics::{Metrics, MetricsSnapshot};

struct ReaderRuntime {
    queue: Arc<CbQueue<QueueItem>>,
    open: Mutex<HashMap<ItemId, QueueItem>>,
}

#[derive(Debug, Clone, Copy)]
pub struct JournaledQueueStats {
    pub metrics: MetricsSnapshot,
    pub writer_file_count: usize,
    pub reader_count: usize,
}

/// A durable, multi-reader queue: one [`Journal`] fanning out into one
/// [`CbQueue`] per named reader.
pub struct JournaledQueue {
    journal: Arc<Journal>,
    readers: RwLock<HashMap<String, ReaderRuntime>>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl JournaledQueue {
    pub fn open(
        dir: impl Into<PathBuf>,
        queue_name: impl Into<String>,
        config: JournalConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let journal = Journal::open(dir, queue_name, config, clock.clone(), metrics.clone())?;
        let jq = Arc::new(JournaledQueue {
            journal,
            readers: RwLock::new(HashMap::new()),
            metrics,
            clock,
        });
        let existing: Vec<String> = jq.journal.reader_names();
        for name in existing {
            jq.load_reader_runtime(&name)?;
        }
        Ok(jq)
    }

    /// Creates the named reader if absent, replaying any backlog already on
    /// disk into its in-memory queue.
    pub fn ensure_reader(&self, name: &str) -> Result<()> {
        if self.readers.read().contains_key(name) {
            return Ok(());
        }
        self.journal.ensure_reader(name)?;
        if !name.is_empty() {
            // I2: the first named reader supersedes the default reader,
            // discarding whatever backlog the default had not yet consumed.
            self.readers.write().remove("");
        }
        if self.readers.read().contains_key(name) {
            return Ok(());
        }
        self.load_reader_runtime(name)
    }

    fn load_reader_runtime(&self, name: &str) -> Result<()> {
        let head = self.journal.reader_head(name)?;
        let max_id = self.journal.max_assigned_id();
        let queue = Arc::new(CbQueue::new());
        for id in (head + 1)..=max_id {
            if self.journal.reader_done_contains(name, id)? {
                continue;
            }
            if let Some(item) = self.journal.read_item(id)? {
                queue.put(item);
            }
        }
        let mut readers = self.readers.write();
        readers.entry(name.to_string()).or_insert(ReaderRuntime {
            queue,
            open: Mutex::new(HashMap::new()),
        });
        info!(reader = name, "reader runtime loaded");
        Ok(())
    }

    /// Appends `payload` to the journal and fans it out to every live
    /// reader's in-memory queue. Returns the assigned item and a future
    /// that resolves once the record is durable.
    pub fn put(
        &self,
        payload: impl Into<Bytes>,
        add_time_ms: u64,
        expire_time_ms: Option<u64>,
    ) -> Result<(QueueItem, Durable)> {
        let (item, durable) = self.journal.put(payload, add_time_ms, expire_time_ms)?;
        for runtime in self.readers.read().values() {
            runtime.queue.put(item.clone());
        }
        Ok((item, durable))
    }

    /// Delivers the next unexpired item to `name` as an open read, or `None`
    /// if `deadline` passes first. An item already past its `expireTime` is
    /// committed on its reader's behalf instead of delivered, so a queue
    /// full of stale items can't block `commit`/reclamation forever waiting
    /// on a caller that will never see them.
    pub async fn get(&self, name: &str, deadline: Option<Instant>) -> Result<Option<QueueItem>> {
        self.ensure_reader(name)?;
        loop {
            let queue = {
                let readers = self.readers.read();
                readers.get(name).expect("just ensured").queue.clone()
            };
            let Some(item) = queue.get(deadline).await else {
                return Ok(None);
            };
            if item.is_expired(self.clock.now_ms()) {
                self.journal.commit(name, item.id)?;
                continue;
            }
            self.metrics.record_get();
            let readers = self.readers.read();
            readers
                .get(name)
                .expect("reader still exists")
                .open
                .lock()
                .insert(item.id, item.clone());
            return Ok(Some(item));
        }
    }

    /// Marks `id` done for `name`. Advances head and absorbs contiguous
    /// doneSet entries if `id` closes the gap.
    pub fn commit(&self, name: &str, id: ItemId) -> Result<()> {
        let removed = {
            let readers = self.readers.read();
            let runtime = readers
                .get(name)
                .ok_or_else(|| Error::UnknownReader(name.to_string()))?;
            runtime.open.lock().remove(&id)
        };
        if removed.is_none() {
            return Err(Error::UnknownId(id));
        }
        self.metrics.record_commit();
        self.journal.commit(name, id)
    }

    /// Returns `id` to the front of `name`'s in-memory queue, ahead of
    /// freshly put items, making it `Available` again.
    pub fn abort(&self, name: &str, id: ItemId) -> Result<()> {
        let item = {
            let readers = self.readers.read();
            let runtime = readers
                .get(name)
                .ok_or_else(|| Error::UnknownReader(name.to_string()))?;
            runtime.open.lock().remove(&id)
        };
        let Some(item) = item else {
            return Err(Error::UnknownId(id));
        };
        self.metrics.record_abort();
        let readers = self.readers.read();
        readers
            .get(name)
            .expect("reader still exists")
            .queue
            .put_priority(item);
        Ok(())
    }

    /// Durably persists every reader's `(head, doneSet)` and reclaims any
    /// writer file every reader has advanced past.
    pub fn checkpoint(&self) -> Result<()> {
        self.journal.checkpoint()
    }

    pub fn erase(&self) -> Result<()> {
        self.journal.erase()?;
        self.readers.write().clear();
        Ok(())
    }

    pub fn reader_size(&self, name: &str) -> Result<usize> {
        self.readers
            .read()
            .get(name)
            .map(|r| r.queue.size())
            .ok_or_else(|| Error::UnknownReader(name.to_string()))
    }

    pub fn reader_to_debug(&self, name: &str) -> Result<String> {
        self.readers
            .read()
            .get(name)
            .map(|r| r.queue.to_debug())
            .ok_or_else(|| Error::UnknownReader(name.to_string()))
    }

    pub fn stats(&self) -> JournaledQueueStats {
        JournaledQueueStats {
            metrics: self.metrics.snapshot(),
            writer_file_count: self.journal.writer_file_count(),
            reader_count: self.readers.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerq_common::{FrozenClock, SystemClock};

    fn open_jq(dir: &std::path::Path) -> Arc<JournaledQueue> {
        JournaledQueue::open(dir, "test", JournalConfig::default(), Arc::new(SystemClock)).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_then_commit() {
        let dir = tempfile::tempdir().unwrap();
        let jq = open_jq(dir.path());
        jq.ensure_reader("r").unwrap();
        let (item, durable) = jq.put(Bytes::from_static(b"hi"), 1, None).unwrap();
        durable.await;
        let got = jq.get("r", None).await.unwrap().unwrap();
        assert_eq!(got.id, item.id);
        jq.commit("r", got.id).unwrap();
        assert_eq!(jq.journal.reader_head("r").unwrap(), got.id);
    }

    #[tokio::test]
    async fn abort_requeues_item_with_priority() {
        let dir = tempfile::tempdir().unwrap();
        let jq = open_jq(dir.path());
        jq.ensure_reader("r").unwrap();
        jq.put(Bytes::from_static(b"a"), 1, None).unwrap();
        jq.put(Bytes::from_static(b"b"), 2, None).unwrap();
        let first = jq.get("r", None).await.unwrap().unwrap();
        jq.abort("r", first.id).unwrap();
        let redelivered = jq.get("r", None).await.unwrap().unwrap();
        assert_eq!(redelivered.id, first.id);
    }

    #[tokio::test]
    async fn commit_unknown_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let jq = open_jq(dir.path());
        jq.ensure_reader("r").unwrap();
        assert!(matches!(jq.commit("r", 42), Err(Error::UnknownId(42))));
    }

    #[tokio::test]
    async fn backlog_replays_into_new_reader() {
        let dir = tempfile::tempdir().unwrap();
        let jq = open_jq(dir.path());
        jq.put(Bytes::from_static(b"a"), 1, None).unwrap();
        jq.put(Bytes::from_static(b"b"), 2, None).unwrap();
        jq.ensure_reader("late").unwrap();
        assert_eq!(jq.reader_size("late").unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_item_is_auto_committed_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FrozenClock::at(1_000));
        let jq =
            JournaledQueue::open(dir.path(), "test", JournalConfig::default(), clock.clone())
                .unwrap();
        jq.ensure_reader("r").unwrap();
        jq.put(Bytes::from_static(b"stale"), 1_000, Some(1_500))
            .unwrap();
        jq.put(Bytes::from_static(b"fresh"), 1_000, None).unwrap();

        clock.set(2_000);
        let got = jq.get("r", None).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"fresh"));
        assert_eq!(jq.journal.reader_head("r").unwrap(), 1);
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_reader() {
        let dir = tempfile::tempdir().unwrap();
        let jq = open_jq(dir.path());
        jq.ensure_reader("a").unwrap();
        jq.ensure_reader("b").unwrap();
        jq.put(Bytes::from_static(b"x"), 1, None).unwrap();
        let got_a = jq.get("a", None).await.unwrap().unwrap();
        let got_b = jq.get("b", None).await.unwrap().unwrap();
        assert_eq!(got_a.id, got_b.id);
    }
}
