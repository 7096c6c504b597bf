use bitvec::vec::BitVec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed for the hash constants. Fixed so that runs are reproducible.
const HASH_SEED: u64 = 29346;

/// Hash inputs are block tags; only the low bits carry entropy.
const MAX_BIT_POSITION: u32 = 34;

#[derive(Debug, Clone)]
enum Hasher {
    /// Multiply-shift with one odd constant per hash function.
    Flat { odds: Vec<u64> },
    /// H3: one random column per output bit, parity-reduced.
    H3 { matrices: Vec<Vec<u64>> },
}

impl Hasher {
    fn flat(num_hashes: u32, rng: &mut StdRng) -> Self {
        let odds = (0..num_hashes).map(|_| 2 * rng.gen::<u32>() as u64 + 1).collect();
        Hasher::Flat { odds }
    }

    fn h3(num_hashes: u32, log_size: u32, rng: &mut StdRng) -> Self {
        let mask = (1u64 << MAX_BIT_POSITION) - 1;
        let matrices = (0..num_hashes)
            .map(|_| (0..log_size).map(|_| rng.gen::<u64>() & mask).collect())
            .collect();
        Hasher::H3 { matrices }
    }

    fn indices(&self, element: u64, log_size: u32, out: &mut Vec<usize>) {
        out.clear();
        match self {
            Hasher::Flat { odds } => {
                let mask = (1u64 << MAX_BIT_POSITION) - 1;
                for odd in odds {
                    let hashed = (element.wrapping_mul(*odd)) & mask;
                    out.push((hashed >> (MAX_BIT_POSITION - log_size)) as usize);
                }
            }
            Hasher::H3 { matrices } => {
                for columns in matrices {
                    let mut index = 0usize;
                    for column in columns {
                        let bit = (element & column).count_ones() & 1;
                        index = (index << 1) | bit as usize;
                    }
                    out.push(index);
                }
            }
        }
    }
}

/// Set-membership approximator over block tags.
///
/// Sized for `expected_max_count` elements with `alpha` bits per element;
/// the hash count defaults to `ceil(ln 2 * alpha)`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec,
    log_size: u32,
    hasher: Hasher,
    scratch: Vec<usize>,

    num_elements: u32,
    false_positives: u64,
    tests: u64,
}

impl BloomFilter {
    #[must_use]
    pub fn new(expected_max_count: u32, alpha: u32, num_hashes: Option<u32>) -> Self {
        Self::build(expected_max_count, alpha, num_hashes, false)
    }

    /// Variant with H3 hash functions.
    #[must_use]
    pub fn h3(expected_max_count: u32, alpha: u32, num_hashes: Option<u32>) -> Self {
        Self::build(expected_max_count, alpha, num_hashes, true)
    }

    fn build(expected_max_count: u32, alpha: u32, num_hashes: Option<u32>, h3: bool) -> Self {
        assert!(expected_max_count > 0 && alpha > 0);
        let num_hashes =
            num_hashes.unwrap_or_else(|| (std::f64::consts::LN_2 * f64::from(alpha)).ceil() as u32);
        let log_size = (f64::from(expected_max_count) * f64::from(alpha)).log2() as u32;

        let mut rng = StdRng::seed_from_u64(HASH_SEED);
        let hasher = if h3 {
            Hasher::h3(num_hashes, log_size, &mut rng)
        } else {
            Hasher::flat(num_hashes, &mut rng)
        };

        Self {
            bits: BitVec::repeat(false, 1 << log_size),
            log_size,
            hasher,
            scratch: Vec::with_capacity(num_hashes as usize),
            num_elements: 0,
            false_positives: 0,
            tests: 0,
        }
    }

    pub fn insert(&mut self, element: u64) {
        let mut scratch = std::mem::take(&mut self.scratch);
        self.hasher.indices(element, self.log_size, &mut scratch);
        for &index in &scratch {
            self.bits.set(index, true);
        }
        self.scratch = scratch;
        self.num_elements += 1;
    }

    /// Test membership. `exists` tells the filter whether the element is
    /// actually present, for false-positive accounting.
    pub fn test(&mut self, element: u64, exists: bool) -> bool {
        self.tests += 1;
        let mut scratch = std::mem::take(&mut self.scratch);
        self.hasher.indices(element, self.log_size, &mut scratch);
        let hit = scratch.iter().all(|&index| self.bits[index]);
        self.scratch = scratch;

        if hit && !exists {
            self.false_positives += 1;
        }
        hit
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.num_elements = 0;
    }

    #[must_use]
    pub fn false_positives(&self) -> u64 {
        self.false_positives
    }

    #[must_use]
    pub fn false_positive_rate(&self) -> f64 {
        if self.tests == 0 {
            return 0.0;
        }
        self.false_positives as f64 * 100.0 / self.tests as f64
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::BloomFilter;

    #[test]
    fn inserted_elements_always_hit() {
        let mut filter = BloomFilter::new(256, 8, None);
        for tag in 0..64u64 {
            filter.insert(tag * 97);
        }
        for tag in 0..64u64 {
            assert!(filter.test(tag * 97, true));
        }
        assert_eq!(filter.false_positives(), 0);
    }

    #[test]
    fn clear_empties_the_filter() {
        let mut filter = BloomFilter::new(256, 8, None);
        for tag in 0..64u64 {
            filter.insert(tag);
        }
        filter.clear();
        assert_eq!(filter.count(), 0);
        for tag in 1000..1064u64 {
            assert!(!filter.test(tag, false));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        // alpha = 8 bits/element, k = ceil(ln2 * 8) = 6 hashes:
        // analytic rate (1 - e^{-k/alpha})^k is about 2.2%
        let mut filter = BloomFilter::new(1024, 8, None);
        for tag in 0..1024u64 {
            filter.insert(tag);
        }
        let mut hits = 0;
        let probes = 20_000u64;
        for tag in 0..probes {
            if filter.test(1_000_000 + tag * 13, false) {
                hits += 1;
            }
        }
        let rate = hits as f64 / probes as f64;
        assert!(rate < 0.05, "false positive rate {rate} too high");
    }

    #[test]
    fn h3_variant_behaves_like_a_filter() {
        let mut filter = BloomFilter::h3(256, 8, None);
        for tag in 0..64u64 {
            filter.insert(tag * 131);
        }
        for tag in 0..64u64 {
            assert!(filter.test(tag * 131, true));
        }
        filter.clear();
        assert!(!filter.test(131, false));
    }
}
