//! Multi-queue muxer: merges per-pin frame queues into one ascending-
//! timestamp stream, ties broken by pin index.

use std::collections::VecDeque;

use crate::frame::Buffer;

/// One FIFO per input pin, merged in ascending-timestamp order.
#[derive(Debug, Default)]
pub struct Muxer {
    queues: Vec<VecDeque<Buffer>>,
}

impl Muxer {
    pub fn new(pin_count: usize) -> Self {
        Muxer { queues: (0..pin_count).map(|_| VecDeque::new()).collect() }
    }

    pub fn pin_count(&self) -> usize {
        self.queues.len()
    }

    pub fn put(&mut self, pin: usize, buf: Buffer) {
        self.queues[pin].push_back(buf);
    }

    /// Returns the oldest-timestamped buffer across all pins, or `None` if
    /// every queue is empty. Ties are broken by the lowest pin index.
    pub fn get(&mut self) -> Option<(usize, Buffer)> {
        let pin = self
            .queues
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.front().map(|b| (i, b.timestamp)))
            .min_by_key(|&(i, ts)| (ts, i))
            .map(|(i, _)| i)?;
        self.queues[pin].pop_front().map(|b| (pin, b))
    }

    /// Whether every pin's queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self, pin: usize) -> usize {
        self.queues[pin].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buf(ts: i64) -> Buffer {
        Buffer::single(ts, Bytes::from_static(b"x"))
    }

    #[test]
    fn merges_by_ascending_timestamp() {
        let mut m = Muxer::new(2);
        m.put(0, buf(10));
        m.put(0, buf(30));
        m.put(1, buf(20));
        assert_eq!(m.get().map(|(p, b)| (p, b.timestamp)), Some((0, 10)));
        assert_eq!(m.get().map(|(p, b)| (p, b.timestamp)), Some((1, 20)));
        assert_eq!(m.get().map(|(p, b)| (p, b.timestamp)), Some((0, 30)));
        assert!(m.get().is_none());
    }

    #[test]
    fn ties_favor_lowest_pin_index() {
        let mut m = Muxer::new(3);
        m.put(2, buf(5));
        m.put(0, buf(5));
        m.put(1, buf(5));
        assert_eq!(m.get().map(|(p, _)| p), Some(0));
        assert_eq!(m.get().map(|(p, _)| p), Some(1));
        assert_eq!(m.get().map(|(p, _)| p), Some(2));
    }

    #[test]
    fn empty_when_all_queues_drained() {
        let mut m = Muxer::new(1);
        assert!(m.is_empty());
        m.put(0, buf(1));
        assert!(!m.is_empty());
        m.get();
        assert!(m.is_empty());
    }
}
