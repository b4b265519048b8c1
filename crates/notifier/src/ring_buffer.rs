use std::collections::VecDeque;

/// Fixed-capacity record of recent binary-protocol sends.
///
/// Holds `(sequence_id, entry)` pairs in send order. When full, the oldest
/// entry is evicted. Positions are used instead of numeric comparison so a
/// wrapped sequence counter still replays in send order.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<(u32, T)>,
    capacity: usize,
}

/// Result of splitting the buffer at an error frame.
#[derive(Debug, PartialEq)]
pub struct ErrorSplit<T> {
    /// The entry the provider rejected, if it is still in the window.
    pub failed: Option<(u32, T)>,
    /// Every entry sent after the rejected one, in send order.
    pub suffix: Vec<(u32, T)>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a send. Returns the evicted entry when the window was full.
    pub fn push(&mut self, sequence_id: u32, entry: T) -> Option<(u32, T)> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back((sequence_id, entry));
        evicted
    }

    /// Empty the buffer around the entry named by an error frame.
    ///
    /// Entries up to and including `sequence_id` are dropped (the rejected one
    /// is returned separately). When `sequence_id` is no longer in the window
    /// it is older than everything recorded, so the whole buffer is the suffix.
    pub fn split_at_error(&mut self, sequence_id: u32) -> ErrorSplit<T> {
        match self.entries.iter().position(|(id, _)| *id == sequence_id) {
            Some(pos) => {
                let suffix: Vec<(u32, T)> = self.entries.drain(pos + 1..).collect();
                let failed = self.entries.pop_back();
                self.entries.clear();
                ErrorSplit { failed, suffix }
            }
            None => ErrorSplit {
                failed: None,
                suffix: self.entries.drain(..).collect(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sequence_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }
}
