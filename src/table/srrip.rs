use super::{Op, PolicyValue, ReplacementPolicy};
use crate::counter::SaturatingCounter;

/// Static re-reference interval prediction.
///
/// Orientation: RRPV 0 predicts a distant re-reference (victim), higher
/// values predict nearer reuse. Insertions land at 1, hits climb, and when
/// no slot sits at 0 the whole set ages downward.
#[derive(Debug, Clone)]
pub struct Srrip {
    rrpv: Vec<SaturatingCounter>,
}

impl Srrip {
    pub const DEFAULT_MAX: u32 = 7;

    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self::with_max(capacity, Self::DEFAULT_MAX)
    }

    #[must_use]
    pub fn with_max(capacity: u32, max: u32) -> Self {
        Self {
            rrpv: vec![SaturatingCounter::new(max); capacity as usize],
        }
    }
}

impl ReplacementPolicy for Srrip {
    fn update(&mut self, index: u32, op: Op, _pval: PolicyValue) {
        let rrpv = &mut self.rrpv[index as usize];
        match op {
            Op::Insert | Op::Replace => rrpv.set(1),
            Op::Read | Op::Update => rrpv.increment(),
            Op::Invalidate => rrpv.set(0),
        }
    }

    fn victim(&mut self, _valid: &dyn Fn(u32) -> bool) -> u32 {
        loop {
            if let Some(index) = self.rrpv.iter().position(|r| r.get() == 0) {
                return index as u32;
            }
            for rrpv in &mut self.rrpv {
                rrpv.decrement();
            }
        }
    }

    fn victim_peek(&self, valid: &dyn Fn(u32) -> bool) -> u32 {
        self.clone().victim(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Op, PolicyValue, ReplacementPolicy};
    use super::Srrip;

    #[test]
    fn touched_slot_is_not_the_victim() {
        let mut srrip = Srrip::with_max(4, 3);
        for i in 0..4 {
            srrip.update(i, Op::Insert, PolicyValue::High);
        }
        srrip.update(0, Op::Read, PolicyValue::High);
        // one aging round zeroes slots 1..3 while slot 0 keeps credit
        assert_eq!(srrip.victim(&|_| true), 1);
    }

    #[test]
    fn untouched_slot_survives_at_most_max_sweeps() {
        let mut srrip = Srrip::with_max(2, 3);
        srrip.update(0, Op::Insert, PolicyValue::High);
        srrip.update(1, Op::Insert, PolicyValue::High);
        for _ in 0..3 {
            srrip.update(0, Op::Read, PolicyValue::High);
        }
        for _ in 0..4 {
            let victim = srrip.victim(&|_| true);
            srrip.update(victim, Op::Replace, PolicyValue::High);
            if victim == 0 {
                return;
            }
        }
        panic!("slot 0 never aged out");
    }
}
