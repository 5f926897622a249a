use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// An owned FIFO of byte segments.
///
/// Segments are moved in with [`push`](Self::push) and moved out with
/// [`take`](Self::take); no segment is ever shared mutably. Splitting the head
/// segment is zero-copy, only requests spanning several segments coalesce.
#[derive(Debug, Default)]
pub struct ByteQueue {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    pub const fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
        }
    }

    /// Total number of queued bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `chunk` to the tail. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.segments.push_back(chunk);
    }

    /// Removes and returns up to `max` bytes from the head, preserving order.
    pub fn take(&mut self, max: usize) -> Bytes {
        let want = max.min(self.len);
        if want == 0 {
            return Bytes::new();
        }

        // Fast path: the head segment satisfies the whole request.
        if let Some(head) = self.segments.front_mut() {
            if head.len() >= want {
                let out = head.split_to(want);
                if head.is_empty() {
                    self.segments.pop_front();
                }
                self.len -= want;
                return out;
            }
        }

        let mut out = BytesMut::with_capacity(want);
        while out.len() < want {
            let Some(mut head) = self.segments.pop_front() else {
                break;
            };
            let needed = want - out.len();
            if head.len() > needed {
                out.extend_from_slice(&head.split_to(needed));
                self.segments.push_front(head);
            } else {
                out.extend_from_slice(&head);
            }
        }
        self.len -= out.len();
        out.freeze()
    }

    /// Returns a read-only view of every queued byte without consuming them.
    ///
    /// Multiple segments are coalesced once; later calls are a cheap clone of
    /// the same buffer.
    pub fn contiguous(&mut self) -> Option<Bytes> {
        match self.segments.len() {
            0 => None,
            1 => self.segments.front().cloned(),
            _ => {
                let mut merged = BytesMut::with_capacity(self.len);
                for segment in self.segments.drain(..) {
                    merged.extend_from_slice(&segment);
                }
                let merged = merged.freeze();
                self.segments.push_back(merged.clone());
                Some(merged)
            }
        }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}
