// src/core/replication/backlog.rs

//! The replication backlog: a fixed-size circular byte buffer holding the
//! tail of the outgoing replication stream, indexed by the global byte
//! offset. A follower that reconnects quickly replays the missed bytes from
//! here instead of taking a full snapshot.

use bytes::Bytes;

/// The byte ring plus the offset bookkeeping that maps global stream offsets
/// onto it.
///
/// Invariant: after every `append`,
/// `first_valid_offset + history_len == master_repl_offset + 1`, where
/// `master_repl_offset` is owned by the surrounding replication core and
/// passed in. Bytes at global offsets
/// `[first_valid_offset, master_repl_offset]` are retrievable; anything
/// outside forces a full resync.
#[derive(Debug)]
pub struct ReplicationBacklog {
    buffer: Vec<u8>,
    capacity: usize,
    /// Index into `buffer` where the next byte lands.
    write_cursor: usize,
    /// Number of valid bytes currently retained, at most `capacity`.
    history_len: usize,
    /// Global offset of the oldest retained byte.
    first_valid_offset: u64,
}

impl ReplicationBacklog {
    /// Creates an empty backlog. The first byte it will ever hold is the next
    /// byte of the stream, so `first_valid_offset` starts one past the
    /// current global offset.
    pub fn new(capacity: usize, master_repl_offset: u64) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            capacity,
            write_cursor: 0,
            history_len: 0,
            first_valid_offset: master_repl_offset + 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn history_len(&self) -> usize {
        self.history_len
    }

    pub fn first_valid_offset(&self) -> u64 {
        self.first_valid_offset
    }

    /// Writes `bytes` into the ring at the write cursor, wrapping as needed.
    /// The caller advances `master_repl_offset` by `bytes.len()` first and
    /// passes the advanced value in, so the offset bookkeeping stays in one
    /// place.
    pub fn append(&mut self, mut bytes: &[u8], master_repl_offset_after: u64) {
        while !bytes.is_empty() {
            let room = self.capacity - self.write_cursor;
            let chunk = room.min(bytes.len());
            self.buffer[self.write_cursor..self.write_cursor + chunk]
                .copy_from_slice(&bytes[..chunk]);
            self.write_cursor += chunk;
            if self.write_cursor == self.capacity {
                self.write_cursor = 0;
            }
            self.history_len += chunk;
            bytes = &bytes[chunk..];
        }
        if self.history_len > self.capacity {
            self.history_len = self.capacity;
        }
        self.first_valid_offset = master_repl_offset_after - self.history_len as u64 + 1;
    }

    /// Returns the retained bytes from global offset `from_offset` to the end
    /// of the stream, or `None` when the offset falls outside the retained
    /// window. A request may cross the physical wrap, in which case the run
    /// is stitched from two segments.
    ///
    /// `from_offset == first_valid_offset + history_len` is accepted and
    /// yields an empty slice: the follower already has every retained byte.
    pub fn slice(&self, from_offset: u64) -> Option<Bytes> {
        if self.history_len == 0 {
            return if from_offset == self.first_valid_offset {
                Some(Bytes::new())
            } else {
                None
            };
        }
        let end_exclusive = self.first_valid_offset + self.history_len as u64;
        if from_offset < self.first_valid_offset || from_offset > end_exclusive {
            return None;
        }

        let skip = (from_offset - self.first_valid_offset) as usize;
        let len = self.history_len - skip;
        let mut out = Vec::with_capacity(len);

        // Physical index of the oldest retained byte.
        let oldest = (self.write_cursor + self.capacity - self.history_len) % self.capacity;
        let mut j = (oldest + skip) % self.capacity;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = (self.capacity - j).min(remaining);
            out.extend_from_slice(&self.buffer[j..j + chunk]);
            remaining -= chunk;
            j = 0;
        }
        Some(Bytes::from(out))
    }

    /// Changes the capacity by flushing the contents and allocating a fresh
    /// ring. No copy: moving gigabytes would stall the data plane, and the
    /// backlog refills from the live stream anyway.
    pub fn resize(&mut self, new_capacity: usize, master_repl_offset: u64) {
        if new_capacity == self.capacity {
            return;
        }
        self.buffer = vec![0u8; new_capacity];
        self.capacity = new_capacity;
        self.write_cursor = 0;
        self.history_len = 0;
        self.first_valid_offset = master_repl_offset + 1;
    }
}
