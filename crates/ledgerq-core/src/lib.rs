//! Durable, multi-reader journaled queue and in-process blocking queue
//! primitives.
//!
//! [`CbQueue`] is the standalone in-memory blocking FIFO (component F).
//! [`JournaledQueue`] composes it with a [`Journal`] (component E) backed by
//! [`codec`]-framed on-disk files, giving every named reader its own durable
//! acknowledgement state.

mod cbq;
mod codec;
mod idset;
mod item;
mod journal;
mod metrics;
mod jq;
mod syncfile;

pub use cbq::{CbQueue, SharedCbQueue};
pub use codec::{FrameOutcome, ReaderRecord, WriterRecord};
pub use idset::SmallIdSet;
pub use item::{ItemId, QueueItem};
pub use journal::{Durable, FileInfo, Journal, JournalConfig};
pub use jq::{JournaledQueue, JournaledQueueStats};
pub use metrics::{Metrics, MetricsSnapshot};
pub use syncfile::SyncFile;

pub use ledgerq_common::{Clock, Error, FrozenClock, Result, SystemClock};
