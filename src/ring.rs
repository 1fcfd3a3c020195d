use std::time::Instant;

/// Instant at which one message was observed.
pub type EventTimestamp = Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    Accepted,
    Full,
}

/// Fixed-capacity ring of event timestamps. Drains oldest first.
#[derive(Debug)]
pub struct EventBuffer {
    inner: Box<[Option<EventTimestamp>]>,
    head: usize,
    len: usize,
}

impl EventBuffer {
    /// Panics if `capacity` is zero; config validation rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event buffer capacity must be positive");
        EventBuffer {
            inner: vec![None; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[inline]
    pub fn offer(&mut self, ts: EventTimestamp) -> OfferResult {
        if self.is_full() {
            return OfferResult::Full;
        }
        let idx = (self.head + self.len) % self.capacity();
        self.inner[idx] = Some(ts);
        self.len += 1;
        OfferResult::Accepted
    }

    /// Empties the buffer, returning its content in insertion order.
    pub fn drain_all(&mut self) -> Vec<EventTimestamp> {
        let cap = self.capacity();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            if let Some(ts) = self.inner[(self.head + i) % cap].take() {
                out.push(ts);
            }
        }
        self.head = 0;
        self.len = 0;
        out
    }
}
