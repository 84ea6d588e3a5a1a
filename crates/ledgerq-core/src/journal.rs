//! Component E: the collection of writer files and per-reader checkpoint
//! files that make up one durable queue's on-disk state.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use ledgerq_common::{Clock, Error, Result};

use crate::codec::{read_frame, FrameOutcome, ReaderRecord, WriterRecord};
use crate::idset::SmallIdSet;
use crate::item::{ItemId, QueueItem};
use crate::metrics::Metrics;
use crate::syncfile::SyncFile;

const MAX_FILE_SIZE_DEFAULT: u64 = 16 * 1024 * 1024;
const TEMP_SUFFIX: &str = "~~";
const READER_INFIX: &str = "read.";

/// Per-file summary used for id -> file resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub head_id: ItemId,
    pub tail_id: ItemId,
    pub item_count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub max_file_size: u64,
    /// `None` means sync on every append (component C's "disabled" mode);
    /// `Some(d)` starts a background task syncing every `d`.
    pub sync_interval: Option<Duration>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            max_file_size: MAX_FILE_SIZE_DEFAULT,
            sync_interval: None,
        }
    }
}

struct ReaderState {
    head: ItemId,
    done: SmallIdSet,
}

struct JournalState {
    files: Vec<FileInfo>,
    writer: Option<Arc<SyncFile>>,
    /// Running stats for the currently-open last file. Not reflected into
    /// `files.last()` until the file rotates -- mirrors the spec's own
    /// worked example where the actively-written file reports zeroed
    /// tail/count/bytes.
    writer_tail_id: ItemId,
    writer_item_count: u64,
    writer_bytes: u64,
    next_id: ItemId,
    readers: HashMap<String, ReaderState>,
    pending_durability: Vec<oneshot::Sender<()>>,
}

/// Owns every writer file and reader checkpoint file for one queue.
pub struct Journal {
    dir: PathBuf,
    queue_name: String,
    config: JournalConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<JournalState>,
    metrics: Arc<Metrics>,
    sync_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Some(handle) = self.sync_task.lock().take() {
            handle.abort();
        }
    }
}

/// Resolves when the put it was returned from is durable on disk.
pub struct Durable(oneshot::Receiver<()>);

impl Future for Durable {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Journal {
    pub fn open(
        dir: impl Into<PathBuf>,
        queue_name: impl Into<String>,
        config: JournalConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let dir = dir.into();
        let queue_name = queue_name.into();
        fs::create_dir_all(&dir)?;

        let (files, readers, next_id) = scan_directory(&dir, &queue_name).map_err(|err| {
            if err.is_corruption() {
                error!(error = %err, "journal failed to open: unrecoverable corruption");
            } else if err.is_retryable() {
                warn!(error = %err, "journal failed to open: retryable io error");
            }
            err
        })?;

        // Carry forward the recovered last file's own counters so a
        // mid-session rotation finalizes its `FileInfo` with the complete
        // pre- and post-restart totals, not just what this session wrote.
        let (writer_tail_id, writer_item_count, writer_bytes) = files
            .last()
            .map(|f| (f.tail_id, f.item_count, f.total_bytes))
            .unwrap_or((0, 0, 0));

        let mut state = JournalState {
            files,
            writer: None,
            writer_tail_id,
            writer_item_count,
            writer_bytes,
            next_id,
            readers,
            pending_durability: Vec::new(),
        };

        if state.readers.is_empty() {
            state.readers.insert(
                String::new(),
                ReaderState {
                    head: 0,
                    done: SmallIdSet::new(),
                },
            );
        }

        if state.files.is_empty() {
            open_new_writer_file(&dir, &queue_name, &mut state, &clock, config.sync_interval.is_none())?;
        } else {
            let last_path = state.files.last().unwrap().path.clone();
            let writer = Arc::new(SyncFile::open_append(
                &last_path,
                config.sync_interval.is_none(),
            )?);
            state.writer = writer.into();
        }

        let journal = Arc::new(Journal {
            dir,
            queue_name,
            config: config.clone(),
            clock,
            state: Mutex::new(state),
            metrics,
            sync_task: Mutex::new(None),
        });

        if let Some(persist_default) = journal.persist_default_reader_if_alone() {
            persist_default?;
        }

        if let Some(interval) = config.sync_interval {
            let journal_for_tick = journal.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(err) = journal_for_tick.sync_now() {
                        warn!(error = %err, "periodic journal sync failed");
                    }
                }
            });
            *journal.sync_task.lock() = Some(handle);
        }

        Ok(journal)
    }

    fn persist_default_reader_if_alone(&self) -> Option<Result<()>> {
        let has_default_only = {
            let state = self.state.lock();
            state.readers.len() == 1 && state.readers.contains_key("")
        };
        if has_default_only {
            Some(self.checkpoint())
        } else {
            None
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Appends a `Put` record and returns the assigned item plus a future
    /// that resolves once the record is durable.
    pub fn put(
        &self,
        payload: impl Into<Bytes>,
        add_time_ms: u64,
        expire_time_ms: Option<u64>,
    ) -> Result<(QueueItem, Durable)> {
        let mut state = self.state.lock();
        let id = state.next_id;
        let item = QueueItem::new(id, add_time_ms, expire_time_ms, payload);
        let body = WriterRecord::Put(item.clone()).encode();
        let mut frame = Vec::with_capacity(body.len() + 8);
        crate::codec::write_frame(&mut frame, &body)?;
        let frame_len = frame.len() as u64;

        if state.writer_bytes > 0 && state.writer_bytes + frame_len > self.config.max_file_size {
            self.rotate_locked(&mut state)?;
        }

        state.writer.as_ref().unwrap().append(&frame)?;
        state.writer_tail_id = id;
        state.writer_item_count += 1;
        state.writer_bytes += frame_len;
        state.next_id += 1;

        self.metrics.record_put(frame_len);

        let (tx, rx) = oneshot::channel();
        state.pending_durability.push(tx);
        let sync_inline = self.config.sync_interval.is_none();
        drop(state);

        if sync_inline {
            self.sync_now()?;
        }

        Ok((item, Durable(rx)))
    }

    /// Flushes the active writer file and resolves every durability future
    /// registered before the flush.
    pub fn sync_now(&self) -> Result<()> {
        let (writer, pending) = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending_durability);
            (state.writer.clone(), pending)
        };
        if let Some(writer) = writer {
            writer.flush()?;
        }
        for tx in pending {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// The `FileInfo` for the writer file logically containing `id`, per the
    /// lookup rule in the journal's component design (the `id == 0` and
    /// "below first file" cases are handled explicitly).
    pub fn file_info_for_id(&self, id: ItemId) -> Option<FileInfo> {
        let state = self.state.lock();
        if id == 0 || state.files.is_empty() {
            return None;
        }
        if id < state.files[0].head_id {
            return Some(state.files[0].clone());
        }
        state
            .files
            .iter()
            .rev()
            .find(|f| f.head_id <= id)
            .cloned()
    }

    /// Reads the item with the given id back off disk, or `None` if it has
    /// been reclaimed, was never written, or falls in a truncated gap.
    pub fn read_item(&self, id: ItemId) -> Result<Option<QueueItem>> {
        let Some(info) = self.file_info_for_id(id) else {
            return Ok(None);
        };
        let mut file = fs::File::open(&info.path)?;
        let mut offset = 0u64;
        loop {
            match read_frame(&mut file, offset)? {
                FrameOutcome::Eof => return Ok(None),
                FrameOutcome::Frame(body, frame_len) => {
                    offset += frame_len;
                    match WriterRecord::decode(&body) {
                        Ok(WriterRecord::Put(item)) if item.id == id => return Ok(Some(item)),
                        Ok(WriterRecord::Put(item)) if item.id > id => return Ok(None),
                        Ok(_) => continue,
                        Err(_) => return Ok(None),
                    }
                }
                FrameOutcome::Invalid { .. } => return Ok(None),
            }
        }
    }

    pub fn max_assigned_id(&self) -> ItemId {
        self.state.lock().next_id.saturating_sub(1)
    }

    pub fn writer_file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.state.lock().readers.keys().cloned().collect()
    }

    pub fn reader_done_contains(&self, name: &str, id: ItemId) -> Result<bool> {
        let state = self.state.lock();
        state
            .readers
            .get(name)
            .map(|r| r.done.contains(id))
            .ok_or_else(|| Error::UnknownReader(name.to_string()))
    }

    fn rotate_locked(&self, state: &mut JournalState) -> Result<()> {
        if let Some(info) = state.files.last_mut() {
            info.tail_id = state.writer_tail_id;
            info.item_count = state.writer_item_count;
            info.total_bytes = state.writer_bytes;
        }
        if let Some(writer) = state.writer.take() {
            if let Ok(writer) = Arc::try_unwrap(writer) {
                writer.close()?;
            }
        }
        open_new_writer_file(
            &self.dir,
            &self.queue_name,
            state,
            &self.clock,
            self.config.sync_interval.is_none(),
        )?;
        state.writer_tail_id = 0;
        state.writer_item_count = 0;
        state.writer_bytes = 0;
        info!(queue = %self.queue_name, "rotated writer file");
        Ok(())
    }

    /// Creates the named reader if it does not already exist, enforcing I2
    /// (the default reader's file exists iff no named reader exists).
    pub fn ensure_reader(&self, name: &str) -> Result<()> {
        let is_new = {
            let mut state = self.state.lock();
            if state.readers.contains_key(name) {
                false
            } else {
                state.readers.insert(
                    name.to_string(),
                    ReaderState {
                        head: 0,
                        done: SmallIdSet::new(),
                    },
                );
                true
            }
        };
        if is_new {
            if !name.is_empty() {
                self.remove_default_reader_if_present()?;
            }
            self.persist_reader(name)?;
        }
        Ok(())
    }

    fn remove_default_reader_if_present(&self) -> Result<()> {
        let had_default = {
            let mut state = self.state.lock();
            state.readers.remove("").is_some()
        };
        if had_default {
            let path = reader_path(&self.dir, &self.queue_name, "");
            if path.exists() {
                fs::remove_file(&path)?;
            }
            info!(queue = %self.queue_name, "removed default reader file for first named reader");
        }
        Ok(())
    }

    pub fn reader_head(&self, name: &str) -> Result<ItemId> {
        let state = self.state.lock();
        state
            .readers
            .get(name)
            .map(|r| r.head)
            .ok_or_else(|| Error::UnknownReader(name.to_string()))
    }

    /// Records `id` as committed for reader `name`, advancing head and
    /// absorbing any now-contiguous doneSet entries.
    pub fn commit(&self, name: &str, id: ItemId) -> Result<()> {
        let mut state = self.state.lock();
        let reader = state
            .readers
            .get_mut(name)
            .ok_or_else(|| Error::UnknownReader(name.to_string()))?;
        if id <= reader.head {
            return Ok(());
        }
        if id == reader.head + 1 {
            reader.head = reader.done.contiguous_prefix_from(id);
        } else {
            reader.done.insert(id);
        }
        Ok(())
    }

    /// Durably records every live reader's `(head, doneSet)`, then reclaims
    /// any writer file whose tail has been passed by every reader.
    pub fn checkpoint(&self) -> Result<()> {
        let names: Vec<String> = self.state.lock().readers.keys().cloned().collect();
        for name in &names {
            self.persist_reader(name)?;
        }
        self.reclaim()
    }

    fn persist_reader(&self, name: &str) -> Result<()> {
        let (head, done_ids) = {
            let state = self.state.lock();
            let reader = state
                .readers
                .get(name)
                .ok_or_else(|| Error::UnknownReader(name.to_string()))?;
            (reader.head, reader.done.iter().collect::<Vec<_>>())
        };
        let final_path = reader_path(&self.dir, &self.queue_name, name);
        let temp_path = {
            let mut p = final_path.clone().into_os_string();
            p.push(TEMP_SUFFIX);
            PathBuf::from(p)
        };
        if temp_path.exists() {
            fs::remove_file(&temp_path)?;
        }
        let file = SyncFile::create(&temp_path, true)?;
        let mut frame = Vec::new();
        crate::codec::write_frame(&mut frame, &ReaderRecord::ReadHead(head).encode())?;
        file.append(&frame)?;
        frame.clear();
        crate::codec::write_frame(&mut frame, &ReaderRecord::ReadDone(done_ids).encode())?;
        file.append(&frame)?;
        file.close()?;
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    /// A file is eligible once every reader's head has reached or passed its
    /// `tailId` -- `head` here is the highest id a reader has *confirmed*
    /// done, so `tail_id <= head` means the reader has nothing left to read
    /// in that file, not `tail_id < head`.
    fn reclaim(&self) -> Result<()> {
        let mut state = self.state.lock();
        let min_head = match state.readers.values().map(|r| r.head).min() {
            Some(h) => h,
            None => return Ok(()),
        };
        if state.files.len() <= 1 {
            return Ok(());
        }
        let last_index = state.files.len() - 1;
        let mut to_delete = Vec::new();
        for (idx, info) in state.files.iter().enumerate() {
            if idx == last_index {
                continue;
            }
            if info.tail_id > 0 && info.tail_id <= min_head {
                to_delete.push(idx);
            }
        }
        for &idx in to_delete.iter().rev() {
            let info = state.files.remove(idx);
            if info.path.exists() {
                fs::remove_file(&info.path)?;
            }
            self.metrics.record_journal_bytes_reclaimed(info.total_bytes);
            info!(path = %info.path.display(), "reclaimed writer file");
        }
        Ok(())
    }

    /// Deletes every file owned by this journal: writer files and reader
    /// checkpoint files. Files belonging to other queues in the same
    /// directory are left untouched.
    pub fn erase(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.writer = None;
        for info in state.files.drain(..) {
            if info.path.exists() {
                fs::remove_file(&info.path)?;
            }
        }
        for name in state.readers.keys().cloned().collect::<Vec<_>>() {
            let path = reader_path(&self.dir, &self.queue_name, &name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        state.readers.clear();
        Ok(())
    }
}

fn reader_path(dir: &Path, queue_name: &str, name: &str) -> PathBuf {
    dir.join(format!("{queue_name}.{READER_INFIX}{name}"))
}

fn writer_path(dir: &Path, queue_name: &str, timestamp_ms: u64) -> PathBuf {
    dir.join(format!("{queue_name}.{timestamp_ms}"))
}

fn open_new_writer_file(
    dir: &Path,
    queue_name: &str,
    state: &mut JournalState,
    clock: &Arc<dyn Clock>,
    sync_every_flush: bool,
) -> Result<()> {
    let mut timestamp = clock.now_ms();
    if let Some(last) = state.files.last() {
        if let Some(last_ts) = file_timestamp(&last.path) {
            if timestamp <= last_ts {
                timestamp = last_ts + 1;
            }
        }
    }
    let path = writer_path(dir, queue_name, timestamp);
    let file = Arc::new(SyncFile::create(&path, sync_every_flush)?);
    state.files.push(FileInfo {
        path,
        head_id: state.next_id,
        tail_id: 0,
        item_count: 0,
        total_bytes: 0,
    });
    state.writer = Some(file);
    Ok(())
}

fn file_timestamp(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .rsplit('.')
        .next()?
        .parse()
        .ok()
}

/// Scans `dir` for files belonging to `queue_name`, classifying and
/// recovering them per the journal's startup algorithm.
fn scan_directory(
    dir: &Path,
    queue_name: &str,
) -> Result<(Vec<FileInfo>, HashMap<String, ReaderState>, ItemId)> {
    let writer_prefix = format!("{queue_name}.");
    let reader_prefix = format!("{queue_name}.{READER_INFIX}");

    let mut writer_candidates: Vec<(u64, PathBuf)> = Vec::new();
    let mut reader_candidates: Vec<(String, PathBuf)> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };

        if name.ends_with(TEMP_SUFFIX) {
            fs::remove_file(&path)?;
            continue;
        }

        if let Some(reader_name) = name.strip_prefix(&reader_prefix) {
            reader_candidates.push((reader_name.to_string(), path));
            continue;
        }

        if let Some(suffix) = name.strip_prefix(&writer_prefix) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(ts) = suffix.parse::<u64>() {
                    writer_candidates.push((ts, path));
                }
            }
        }
        // anything else (foreign files, `queue.readmenot`, ...) is ignored.
    }

    writer_candidates.sort_by_key(|(ts, _)| *ts);

    let mut files = Vec::with_capacity(writer_candidates.len());
    let mut next_id: ItemId = 1;
    let last_index = writer_candidates.len().checked_sub(1);

    for (idx, (_, path)) in writer_candidates.iter().enumerate() {
        let is_last = Some(idx) == last_index;
        let (info, scanned_next_id, truncate_to) = scan_writer_file(path, is_last)?;
        if let Some(offset) = truncate_to {
            let file = fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            warn!(path = %path.display(), offset, "truncated torn tail on recovery");
        }
        if info.item_count > 0 {
            next_id = scanned_next_id;
        }
        files.push(info);
    }

    let max_existing_id = next_id.saturating_sub(1);
    let mut readers = HashMap::new();
    for (name, path) in reader_candidates {
        let (head, done) = replay_reader_checkpoint(&path)?;
        let (clamped_head, mut clamped_done) = if head > max_existing_id {
            (max_existing_id, done)
        } else {
            (head, done)
        };
        clamped_done.retain_existing(|id| id >= 1 && id <= max_existing_id && id > clamped_head);
        readers.insert(
            name,
            ReaderState {
                head: clamped_head,
                done: clamped_done,
            },
        );
    }

    Ok((files, readers, next_id))
}

/// Scans one writer file fully, returning its `FileInfo`, the id the
/// journal should assign next, and, if a torn tail was found, the byte
/// offset the file must be truncated to.
fn scan_writer_file(
    path: &Path,
    is_last: bool,
) -> Result<(FileInfo, ItemId, Option<u64>)> {
    let mut file = fs::File::open(path)?;
    let mut head_id = 0;
    let mut tail_id = 0;
    let mut item_count = 0u64;
    let mut total_bytes = 0u64;
    let mut offset = 0u64;
    let mut truncate_to = None;

    loop {
        match read_frame(&mut file, offset)? {
            FrameOutcome::Eof => break,
            FrameOutcome::Frame(body, frame_len) => match WriterRecord::decode(&body) {
                Ok(WriterRecord::Put(item)) => {
                    if item_count == 0 {
                        head_id = item.id;
                    }
                    tail_id = item.id;
                    item_count += 1;
                    total_bytes += frame_len;
                    offset += frame_len;
                }
                Err(reason) => {
                    if is_last {
                        truncate_to = Some(offset);
                        break;
                    }
                    return Err(Error::corrupt_interior(
                        path.display().to_string(),
                        offset,
                        reason,
                    ));
                }
            },
            FrameOutcome::Invalid { reason, .. } => {
                if is_last {
                    truncate_to = Some(offset);
                    break;
                }
                return Err(Error::corrupt_interior(
                    path.display().to_string(),
                    offset,
                    reason,
                ));
            }
        }
    }

    let next_id = if item_count > 0 { tail_id + 1 } else { 1 };
    let info = FileInfo {
        path: path.to_path_buf(),
        head_id,
        tail_id,
        item_count,
        total_bytes,
    };
    Ok((info, next_id, truncate_to))
}

fn replay_reader_checkpoint(path: &Path) -> Result<(ItemId, SmallIdSet)> {
    let mut file = fs::File::open(path)?;
    let mut head = 0;
    let mut done = SmallIdSet::new();
    let mut offset = 0u64;

    loop {
        match read_frame(&mut file, offset)? {
            FrameOutcome::Eof => break,
            FrameOutcome::Frame(body, frame_len) => {
                offset += frame_len;
                match ReaderRecord::decode(&body) {
                    Ok(ReaderRecord::ReadHead(id)) => head = id,
                    Ok(ReaderRecord::ReadDone(ids)) => {
                        done = SmallIdSet::new();
                        for id in ids {
                            done.insert(id);
                        }
                    }
                    Err(_) => break,
                }
            }
            FrameOutcome::Invalid { .. } => break,
        }
    }
    Ok((head, done))
}
