//! In-order release buffer for messages flagged reliable on an unreliable
//!  transport.
//!
//! Datagrams arrive in arbitrary order; this queue releases the longest prefix
//!  of ids starting right after the last delivered one. A gap holds everything
//!  behind it until the missing id arrives (retransmission takes care of that)
//!  or the connection is torn down.

use std::collections::BTreeMap;
use tracing::debug;

pub struct ReliableQueue<T> {
    last_delivered: u32,
    pending: BTreeMap<u32, T>,
}

impl<T> ReliableQueue<T> {
    pub fn new() -> ReliableQueue<T> {
        ReliableQueue {
            last_delivered: 0,
            pending: BTreeMap::new(),
        }
    }

    /// number of buffered out-of-order entries waiting for a gap to fill
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Register an arrived message. Returns the messages that became deliverable,
    ///  in strictly increasing id order. Duplicates are dropped.
    pub fn enqueue(&mut self, message_id: u32, message: T) -> Vec<T> {
        if message_id <= self.last_delivered {
            debug!("dropping duplicate of already delivered message #{}", message_id);
            return Vec::new();
        }
        if self.pending.contains_key(&message_id) {
            debug!("dropping duplicate of buffered message #{}", message_id);
            return Vec::new();
        }

        self.pending.insert(message_id, message);

        let mut deliverable = Vec::new();
        while let Some(message) = self.pending.remove(&(self.last_delivered + 1)) {
            self.last_delivered += 1;
            deliverable.push(message);
        }
        deliverable
    }

    /// discard all buffered state on disconnect
    pub fn clear(&mut self) {
        self.last_delivered = 0;
        self.pending.clear();
    }
}

impl<T> Default for ReliableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![vec![1], vec![2], vec![3]])]
    #[case::scrambled(vec![3, 1, 5, 2, 4], vec![vec![], vec![1], vec![], vec![2, 3], vec![4, 5]])]
    #[case::reversed(vec![3, 2, 1], vec![vec![], vec![], vec![1, 2, 3]])]
    #[case::gap_holds(vec![1, 3, 4], vec![vec![1], vec![], vec![]])]
    #[case::duplicate_delivered(vec![1, 1, 2], vec![vec![1], vec![], vec![2]])]
    #[case::duplicate_buffered(vec![2, 2, 1], vec![vec![], vec![], vec![1, 2]])]
    fn test_enqueue(#[case] arrivals: Vec<u32>, #[case] expected: Vec<Vec<u32>>) {
        let mut queue = ReliableQueue::new();
        for (id, expected_batch) in arrivals.into_iter().zip(expected) {
            assert_eq!(queue.enqueue(id, id), expected_batch);
        }
    }

    #[test]
    fn test_delivery_is_strictly_monotonic_without_duplicates() {
        let mut queue = ReliableQueue::new();
        let mut delivered = Vec::new();
        for id in [4, 2, 7, 1, 1, 3, 6, 5, 2] {
            delivered.extend(queue.enqueue(id, id));
        }
        assert_eq!(delivered, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(queue.num_pending(), 0);
    }

    #[test]
    fn test_memory_bounded_by_buffered_future_ids() {
        let mut queue = ReliableQueue::new();
        for id in 2..=50 {
            queue.enqueue(id, id);
        }
        assert_eq!(queue.num_pending(), 49);

        let released = queue.enqueue(1, 1);
        assert_eq!(released.len(), 50);
        assert_eq!(queue.num_pending(), 0);
    }

    #[test]
    fn test_clear_resets_delivery_position() {
        let mut queue = ReliableQueue::new();
        assert_eq!(queue.enqueue(1, 1), vec![1]);

        queue.enqueue(3, 3);
        queue.clear();
        assert_eq!(queue.num_pending(), 0);

        // a fresh stream starts over at id 1
        assert_eq!(queue.enqueue(1, 10), vec![10]);
    }
}
