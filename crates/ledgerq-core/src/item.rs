use bytes::Bytes;

/// Monotonically increasing, globally-unique-within-a-queue identifier.
pub type ItemId = u64;

/// An immutable item once it has been journaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: ItemId,
    pub add_time_ms: u64,
    pub expire_time_ms: Option<u64>,
    pub payload: Bytes,
}

impl QueueItem {
    pub fn new(
        id: ItemId,
        add_time_ms: u64,
        expire_time_ms: Option<u64>,
        payload: impl Into<Bytes>,
    ) -> Self {
        QueueItem {
            id,
            add_time_ms,
            expire_time_ms,
            payload: payload.into(),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expire_time_ms, Some(t) if t != 0 && now_ms >= t)
    }
}
