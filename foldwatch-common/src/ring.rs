//! Circular index iteration over fixed-size ring buffers.
//!
//! The worker's queue is a ten-slot ring whose oldest entry sits just after
//! the active one. [`RingIter`] walks such a ring once, starting anywhere and
//! wrapping at the end.

/// Iterator over ring indexes `start, start+1, ... (mod len)`, visiting each
/// index at most once.
#[derive(Debug, Clone)]
pub struct RingIter {
    len: usize,
    next: usize,
    remaining: usize,
}

impl RingIter {
    /// Walk all `len` indexes beginning at `start` (taken modulo `len`).
    pub fn new(len: usize, start: usize) -> Self {
        let next = if len == 0 { 0 } else { start % len };
        Self {
            len,
            next,
            remaining: len,
        }
    }

    /// Walk from the slot after `newest` around to `newest` itself, i.e. from
    /// oldest to newest.
    pub fn oldest_first(len: usize, newest: usize) -> Self {
        Self::new(len, newest.wrapping_add(1))
    }
}

impl Iterator for RingIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.next = (self.next + 1) % self.len;
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RingIter {}
