use super::{Op, PolicyValue, ReplacementPolicy};
use crate::counter::{CyclicIndex, SaturatingCounter};

const MAX_RRPV: u32 = 7;

/// Period of the bimodal counter: one in 67 bimodal insertions is placed
/// near instead of distant.
const BRRIP_PERIOD: u32 = 67;

/// Dynamic RRIP over the same inverted orientation as
/// [`Srrip`](super::Srrip): RRPV 0 is the victim.
///
/// The insertion hint picks between near (1) and distant (0) placement;
/// bimodal placement is distant except once per [`BRRIP_PERIOD`]
/// replacements. The hit-priority flavour promotes high-priority hits all
/// the way instead of one step.
#[derive(Debug, Clone)]
pub struct Drrip {
    rrpv: Vec<SaturatingCounter>,
    brrip: CyclicIndex,
    hit_priority: bool,
}

impl Drrip {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            rrpv: vec![SaturatingCounter::new(MAX_RRPV); capacity as usize],
            brrip: CyclicIndex::new(BRRIP_PERIOD),
            hit_priority: false,
        }
    }

    /// The `drrip-hp` flavour.
    #[must_use]
    pub fn hit_priority(capacity: u32) -> Self {
        Self {
            hit_priority: true,
            ..Self::new(capacity)
        }
    }
}

impl ReplacementPolicy for Drrip {
    fn update(&mut self, index: u32, op: Op, pval: PolicyValue) {
        let bimodal_near = self.brrip.get() == 0;
        let rrpv = &mut self.rrpv[index as usize];
        match op {
            Op::Invalidate => {}
            Op::Read | Op::Update => match pval {
                PolicyValue::High => {
                    if self.hit_priority {
                        rrpv.set(MAX_RRPV);
                    } else {
                        rrpv.increment();
                    }
                }
                PolicyValue::Low => rrpv.set(0),
                PolicyValue::Bimodal => {
                    if bimodal_near {
                        rrpv.increment();
                    } else {
                        rrpv.set(0);
                    }
                }
            },
            Op::Insert | Op::Replace => match pval {
                PolicyValue::High => rrpv.set(1),
                PolicyValue::Low => rrpv.set(0),
                PolicyValue::Bimodal => rrpv.set(u32::from(bimodal_near)),
            },
        }
    }

    fn victim(&mut self, _valid: &dyn Fn(u32) -> bool) -> u32 {
        self.brrip.increment();
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
    use super::{Drrip, BRRIP_PERIOD};

    #[test]
    fn high_insertions_age_like_srrip() {
        let mut drrip = Drrip::new(4);
        for i in 0..4 {
            drrip.update(i, Op::Insert, PolicyValue::High);
        }
        drrip.update(0, Op::Read, PolicyValue::High);
        assert_eq!(drrip.victim(&|_| true), 1);
    }

    #[test]
    fn bimodal_insertions_are_mostly_distant() {
        let mut drrip = Drrip::new(2);
        drrip.update(0, Op::Insert, PolicyValue::High);
        drrip.update(1, Op::Insert, PolicyValue::High);
        let mut distant = 0;
        for _ in 0..BRRIP_PERIOD {
            let victim = drrip.victim(&|_| true);
            drrip.update(victim, Op::Replace, PolicyValue::Bimodal);
            if drrip.victim_peek(&|_| true) == victim {
                distant += 1;
            }
        }
        assert!(distant >= BRRIP_PERIOD - 2);
    }

    #[test]
    fn hit_priority_promotes_fully() {
        let mut drrip = Drrip::hit_priority(2);
        drrip.update(0, Op::Insert, PolicyValue::High);
        drrip.update(1, Op::Insert, PolicyValue::High);
        drrip.update(0, Op::Read, PolicyValue::High);
        // slot 0 sits at max RRPV; slot 1 must age out first, repeatedly
        for _ in 0..3 {
            let victim = drrip.victim(&|_| true);
            assert_eq!(victim, 1);
            drrip.update(victim, Op::Replace, PolicyValue::High);
        }
    }
}
