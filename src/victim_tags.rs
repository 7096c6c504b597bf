//! Victim tag store (evicted-address filter): tracks recently evicted block
//! tags.

use crate::address;
use crate::bloom::BloomFilter;
use std::collections::{HashSet, VecDeque};

/// Construction options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Tracked block count. Zero disables the store entirely.
    pub num_blocks: u32,
    /// Back the exact set with a bloom filter and answer negative lookups
    /// from it.
    pub use_bloom: bool,
    /// Remove a tag on hit so it is only counted once.
    pub ideal: bool,
    /// Evict FIFO when full instead of clearing everything.
    pub no_clear: bool,
    /// Clear only after hits reach three quarters of the capacity.
    pub decouple_clear: bool,
    /// Two half-capacity generations, rotated when the active one fills.
    pub segmented: bool,
    /// Bloom filter bits per element.
    pub alpha: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_blocks: 0,
            use_bloom: false,
            ideal: false,
            no_clear: false,
            decouple_clear: false,
            segmented: false,
            alpha: 8,
        }
    }
}

impl Options {
    #[must_use]
    pub fn exact(num_blocks: u32) -> Self {
        Self {
            num_blocks,
            ..Self::default()
        }
    }
}

pub struct VictimTagStore {
    opts: Options,

    index: HashSet<address>,
    removed: HashSet<address>,
    fifo: VecDeque<address>,
    bloom: Option<BloomFilter>,
    current_blocks: u32,
    hits: u32,

    segments: [HashSet<address>; 2],
    active_segment: usize,
}

impl VictimTagStore {
    #[must_use]
    pub fn new(opts: Options) -> Self {
        let bloom = (opts.use_bloom && opts.num_blocks > 0)
            .then(|| BloomFilter::new(opts.num_blocks, opts.alpha, None));
        Self {
            opts,
            index: HashSet::new(),
            removed: HashSet::new(),
            fifo: VecDeque::new(),
            bloom,
            current_blocks: 0,
            hits: 0,
            segments: [HashSet::new(), HashSet::new()],
            active_segment: 0,
        }
    }

    fn clear_all(&mut self) {
        if let Some(bloom) = self.bloom.as_mut() {
            bloom.clear();
        }
        self.fifo.clear();
        self.index.clear();
        self.current_blocks = 0;
    }

    pub fn insert(&mut self, tag: address) {
        if self.opts.num_blocks == 0 || self.index.contains(&tag) {
            return;
        }

        if self.opts.segmented {
            if self.current_blocks == self.opts.num_blocks / 2 {
                self.active_segment = 1 - self.active_segment;
                self.segments[self.active_segment].clear();
                self.current_blocks = 0;
            }
            self.segments[self.active_segment].insert(tag);
            self.current_blocks += 1;
            return;
        }

        if !self.opts.decouple_clear && self.current_blocks == self.opts.num_blocks {
            if self.opts.no_clear {
                // drop the oldest live tag; ideal-mode removals were
                // already taken out of the index
                loop {
                    let oldest = *self.fifo.front().expect("tracked blocks have fifo slots");
                    if !self.removed.remove(&oldest) {
                        break;
                    }
                    self.fifo.pop_front();
                }
                let oldest = self.fifo.pop_front().expect("fifo nonempty");
                self.index.remove(&oldest);
                self.current_blocks -= 1;
            } else {
                self.clear_all();
            }
        } else if self.current_blocks == 2 * self.opts.num_blocks {
            // safety valve for the decoupled-clear mode
            self.clear_all();
        }

        if let Some(bloom) = self.bloom.as_mut() {
            bloom.insert(tag);
        }
        self.index.insert(tag);
        self.fifo.push_back(tag);
        self.current_blocks += 1;
    }

    pub fn test(&mut self, tag: address) -> bool {
        if self.opts.num_blocks == 0 {
            return false;
        }

        if self.opts.segmented {
            return self.segments[0].contains(&tag) || self.segments[1].contains(&tag);
        }

        if self.index.contains(&tag) {
            if self.opts.ideal {
                self.index.remove(&tag);
                self.removed.insert(tag);
                self.current_blocks -= 1;
            }

            let result = match self.bloom.as_mut() {
                Some(bloom) => bloom.test(tag, true),
                None => true,
            };

            self.hits += 1;
            if self.opts.decouple_clear && 100 * self.hits == 75 * self.opts.num_blocks {
                self.clear_all();
                self.hits = 0;
            }
            return result;
        }

        match self.bloom.as_mut() {
            Some(bloom) => bloom.test(tag, false),
            None => false,
        }
    }

    #[must_use]
    pub fn false_positives(&self) -> u64 {
        self.bloom.as_ref().map_or(0, BloomFilter::false_positives)
    }

    #[must_use]
    pub fn false_positive_rate(&self) -> f64 {
        self.bloom
            .as_ref()
            .map_or(0.0, BloomFilter::false_positive_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::{Options, VictimTagStore};

    #[test]
    fn fill_triggers_clear_by_default() {
        let mut vts = VictimTagStore::new(Options::exact(4));
        for tag in 1..=4u64 {
            vts.insert(tag);
        }
        assert!(vts.test(1));
        // fifth insert clears everything first
        vts.insert(5);
        assert!(!vts.test(1));
        assert!(vts.test(5));
    }

    #[test]
    fn no_clear_evicts_fifo() {
        let mut vts = VictimTagStore::new(Options {
            no_clear: true,
            ..Options::exact(4)
        });
        for tag in 1..=4u64 {
            vts.insert(tag);
        }
        vts.insert(5);
        assert!(!vts.test(1));
        for tag in 2..=5u64 {
            assert!(vts.test(tag));
        }
    }

    #[test]
    fn ideal_mode_counts_each_tag_once() {
        let mut vts = VictimTagStore::new(Options {
            ideal: true,
            no_clear: true,
            ..Options::exact(4)
        });
        vts.insert(7);
        assert!(vts.test(7));
        assert!(!vts.test(7));
    }

    #[test]
    fn segmented_rotation_forgets_the_older_half() {
        let mut vts = VictimTagStore::new(Options {
            segmented: true,
            ..Options::exact(4)
        });
        // active half holds 2 tags
        vts.insert(1);
        vts.insert(2);
        vts.insert(3); // rotates, clears the now-active half, inserts 3
        assert!(vts.test(1));
        assert!(vts.test(3));
        vts.insert(4);
        vts.insert(5); // rotates again: 1, 2 are gone
        assert!(!vts.test(1));
        assert!(!vts.test(2));
        assert!(vts.test(3));
        assert!(vts.test(5));
    }

    #[test]
    fn decoupled_clear_fires_on_hit_threshold() {
        let mut vts = VictimTagStore::new(Options {
            decouple_clear: true,
            ..Options::exact(4)
        });
        for tag in 1..=6u64 {
            vts.insert(tag);
        }
        // capacity is not the trigger in this mode
        assert!(vts.test(1));
        assert!(vts.test(2));
        // third hit reaches 75% of capacity: store clears
        assert!(vts.test(3));
        assert!(!vts.test(4));
    }

    #[test]
    fn bloom_mode_has_no_false_negatives() {
        let mut vts = VictimTagStore::new(Options {
            use_bloom: true,
            no_clear: true,
            ..Options::exact(64)
        });
        for tag in 0..64u64 {
            vts.insert(tag * 31);
        }
        for tag in 0..64u64 {
            assert!(vts.test(tag * 31));
        }
    }

    #[test]
    fn zero_capacity_is_inert() {
        let mut vts = VictimTagStore::new(Options::exact(0));
        vts.insert(1);
        assert!(!vts.test(1));
    }
}
