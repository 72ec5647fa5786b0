use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// What to throw away when a chunk arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "oldest" => Ok(DropPolicy::DropOldest),
            "drop-newest" | "newest" => Ok(DropPolicy::DropNewest),
            other => Err(format!(
                "unknown drop policy {:?}, expected drop-oldest or drop-newest",
                other
            )),
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropPolicy::DropOldest => f.write_str("drop-oldest"),
            DropPolicy::DropNewest => f.write_str("drop-newest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// The chunk was queued after evicting the oldest unwritten chunk.
    EvictedOldest,
    /// The incoming chunk itself was discarded.
    RejectedNewest,
}

impl Admission {
    pub fn dropped(self) -> bool {
        self != Admission::Queued
    }
}

/// Bounded FIFO of chunks waiting for the transcoder's stdin.
///
/// The head chunk may be partially written; `offset` tracks how much of it
/// the pipe already accepted. A partially written chunk is never evicted,
/// since dropping it would splice a truncated frame into the stream.
pub struct ChunkQueue {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
    capacity: usize,
    policy: DropPolicy,
    dropped: u64,
}

impl ChunkQueue {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        ChunkQueue {
            chunks: VecDeque::with_capacity(capacity),
            offset: 0,
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) -> Admission {
        if self.chunks.len() < self.capacity {
            self.chunks.push_back(chunk);
            return Admission::Queued;
        }

        let evictable = if self.offset > 0 { 1 } else { 0 };
        if self.policy == DropPolicy::DropOldest && evictable < self.chunks.len() {
            self.chunks.remove(evictable);
            self.chunks.push_back(chunk);
            self.dropped += 1;
            Admission::EvictedOldest
        } else {
            self.dropped += 1;
            Admission::RejectedNewest
        }
    }

    /// Bytes of the head chunk not yet accepted by the pipe.
    pub fn front_remaining(&self) -> Option<&[u8]> {
        self.chunks.front().map(|chunk| &chunk[self.offset..])
    }

    /// Records that `written` bytes of the head chunk reached the pipe.
    pub fn advance(&mut self, written: usize) {
        let Some(front) = self.chunks.front() else {
            return;
        };
        self.offset += written;
        if self.offset >= front.len() {
            self.chunks.pop_front();
            self.offset = 0;
        }
    }

    /// Discards everything still queued, returning how many chunks were lost.
    pub fn clear(&mut self) -> usize {
        let discarded = self.chunks.len();
        self.chunks.clear();
        self.offset = 0;
        discarded
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
