use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use ledgerq_common::Result;

/// A buffered, write-through file handle. Bytes are buffered in memory by a
/// `BufWriter`; durability syncs happen either on every `flush()`/`close()`
/// (when no background cadence is configured) or are left to the caller's
/// own periodic schedule -- `Journal` drives this one with a `tokio::time::interval`
/// loop over its current writer, since the writer changes across rotations.
///
/// After `close()` returns, every byte written is durable. A crash before
/// that can only lose a trailing suffix of buffered-but-unflushed bytes --
/// interior bytes already passed to the OS are never reordered or dropped.
pub struct SyncFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    dirty: AtomicBool,
    sync_every_flush: bool,
}

impl SyncFile {
    pub fn create(path: impl AsRef<Path>, sync_every_flush: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(SyncFile {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            dirty: AtomicBool::new(false),
            sync_every_flush,
        })
    }

    pub fn open_append(path: impl AsRef<Path>, sync_every_flush: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(SyncFile {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            dirty: AtomicBool::new(false),
            sync_every_flush,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bytes` to the buffer. Does not itself guarantee durability;
    /// call `flush()` or wait for the next scheduled sync.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        self.dirty.store(true, Ordering::Release);
        trace!(path = %self.path.display(), len = bytes.len(), "appended bytes to sync file");
        if self.sync_every_flush {
            drop(writer);
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the in-memory buffer to the OS and, if there is unsynced data,
    /// fsyncs it to disk.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        if self
            .dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            writer.get_ref().sync_all()?;
            debug!(path = %self.path.display(), "synced sync file to disk");
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.writer.lock().get_ref().metadata()?.len())
    }
}
