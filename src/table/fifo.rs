use super::{Op, PolicyValue, ReplacementPolicy};
use std::collections::VecDeque;

/// First-in first-out: the oldest inserted slot is the victim; reads and
/// updates do not reorder.
#[derive(Debug, Clone)]
pub struct Fifo {
    queue: VecDeque<u32>,
}

impl Fifo {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity as usize),
        }
    }
}

impl ReplacementPolicy for Fifo {
    fn update(&mut self, index: u32, op: Op, _pval: PolicyValue) {
        match op {
            Op::Insert => self.queue.push_back(index),
            Op::Replace => {
                self.queue.pop_front();
                self.queue.push_back(index);
            }
            Op::Invalidate => self.queue.retain(|&i| i != index),
            Op::Read | Op::Update => {}
        }
    }

    fn victim(&mut self, _valid: &dyn Fn(u32) -> bool) -> u32 {
        *self.queue.front().expect("victim from an empty fifo")
    }

    fn victim_peek(&self, _valid: &dyn Fn(u32) -> bool) -> u32 {
        *self.queue.front().expect("victim from an empty fifo")
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Op, PolicyValue, ReplacementPolicy};
    use super::Fifo;

    #[test]
    fn invalidate_removes_from_queue() {
        let mut fifo = Fifo::new(3);
        for i in 0..3 {
            fifo.update(i, Op::Insert, PolicyValue::High);
        }
        fifo.update(0, Op::Invalidate, PolicyValue::High);
        assert_eq!(fifo.victim(&|_| true), 1);
    }
}
