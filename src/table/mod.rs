//! Bounded associative table with pluggable replacement.
//!
//! A table owns a fixed arena of slots. The replacement policy never sees
//! keys or values, only slot indices and the operation that touched them;
//! eviction asks the policy for a victim index. Policies refer to slots by
//! index exclusively, so the arena can hand out stable `index` values for
//! the lifetime of an entry.

mod dip;
mod drrip;
mod fifo;
mod generation;
mod list;
mod lru;
mod nru;
mod reuse;
mod srrip;
mod weight;

pub use dip::Dip;
pub use drrip::Drrip;
pub use fifo::Fifo;
pub use generation::Generation;
pub use lru::Lru;
pub use nru::Nru;
pub use reuse::Reuse;
pub use srrip::Srrip;
pub use weight::{MaxWeight, MinWeight};

pub(crate) use list::LinkedOrder;

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Insertion priority hint passed through to the replacement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PolicyValue {
    #[default]
    High,
    Bimodal,
    Low,
}

impl PolicyValue {
    /// Numeric form, used by policies that treat the hint as a level.
    #[must_use]
    pub fn level(self) -> u32 {
        match self {
            PolicyValue::High => 0,
            PolicyValue::Bimodal => 1,
            PolicyValue::Low => 2,
        }
    }

    /// Decode the `policy-value` configuration parameter.
    #[must_use]
    pub fn from_level(level: u32) -> Self {
        match level {
            1 => PolicyValue::Bimodal,
            2 => PolicyValue::Low,
            _ => PolicyValue::High,
        }
    }
}

/// Operation reported to the replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Replace,
    Read,
    Update,
    Invalidate,
}

/// Replacement bookkeeping over slot indices.
pub trait ReplacementPolicy: std::fmt::Debug {
    fn update(&mut self, index: u32, op: Op, pval: PolicyValue);

    /// Pick (and commit to) a victim slot. May mutate policy state.
    fn victim(&mut self, valid: &dyn Fn(u32) -> bool) -> u32;

    /// Victim the next `victim` call would pick, without mutating.
    fn victim_peek(&self, valid: &dyn Fn(u32) -> bool) -> u32;

    /// Record an externally computed weight for a slot. Only the weight
    /// ordered policies care.
    fn set_weight(&mut self, _index: u32, _weight: u32) {}
}

/// Construct a policy by its configuration name.
#[must_use]
pub fn policy_by_name(name: &str, capacity: u32) -> Option<Box<dyn ReplacementPolicy>> {
    let policy: Box<dyn ReplacementPolicy> = match name {
        "lru" => Box::new(Lru::new(capacity)),
        "fifo" => Box::new(Fifo::new(capacity)),
        "nru" => Box::new(Nru::new(capacity)),
        "reuse" => Box::new(Reuse::new(capacity)),
        "srrip" => Box::new(Srrip::new(capacity)),
        "generation" => Box::new(Generation::new(capacity)),
        "dip" => Box::new(Dip::new(capacity)),
        "drrip" => Box::new(Drrip::new(capacity)),
        "drrip-hp" => Box::new(Drrip::hit_priority(capacity)),
        "maxw" => Box::new(MaxWeight::new(capacity)),
        "minw" => Box::new(MinWeight::new(capacity)),
        _ => return None,
    };
    Some(policy)
}

#[must_use]
pub fn policy_exists(name: &str) -> bool {
    policy_by_name(name, 1).is_some()
}

/// Key type of a [`Table`].
pub trait Key: Copy + Eq + Hash {
    fn as_index(self) -> u64;
}

impl Key for u32 {
    fn as_index(self) -> u64 {
        u64::from(self)
    }
}

impl Key for u64 {
    fn as_index(self) -> u64 {
        self
    }
}

/// An entry evicted from or found in a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<K, V> {
    /// Slot the entry occupied; stable for the entry's lifetime.
    pub index: u32,
    pub key: K,
    pub value: V,
}

/// Outcome of [`Table::insert`].
#[derive(Debug)]
pub enum Insertion<K, V> {
    /// The key was already present; nothing changed.
    Present,
    /// A free slot was used.
    Free { index: u32 },
    /// The policy's victim was evicted to make room.
    Evicted(Entry<K, V>),
}

impl<K, V> Insertion<K, V> {
    /// The evicted entry, if the insertion displaced one.
    #[must_use]
    pub fn evicted(self) -> Option<Entry<K, V>> {
        match self {
            Insertion::Evicted(entry) => Some(entry),
            _ => None,
        }
    }

    /// True unless a free slot absorbed the insertion.
    #[must_use]
    pub fn displaced(&self) -> bool {
        !matches!(self, Insertion::Free { .. })
    }
}

pub struct Table<K, V> {
    slots: Vec<Option<(K, V)>>,
    key_index: HashMap<K, u32>,
    free: VecDeque<u32>,
    policy: Box<dyn ReplacementPolicy>,
    index_is_key: bool,
    capacity: u32,
}

impl<K: Key, V> Table<K, V> {
    #[must_use]
    pub fn new(capacity: u32, policy: &str) -> Self {
        let policy = policy_by_name(policy, capacity)
            .unwrap_or_else(|| panic!("unknown table policy `{policy}`"));
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            key_index: HashMap::new(),
            free: (0..capacity).collect(),
            policy,
            index_is_key: false,
            capacity,
        }
    }

    /// Table whose keys are known to lie in `[0, capacity)`; the key map is
    /// skipped and keys address slots directly.
    #[must_use]
    pub fn with_direct_index(capacity: u32, policy: &str) -> Self {
        let mut table = Self::new(capacity, policy);
        table.index_is_key = true;
        table
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of valid entries.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.capacity - self.free.len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.slot_of(key).is_some()
    }

    fn slot_of(&self, key: K) -> Option<u32> {
        if self.index_is_key {
            let index = key.as_index();
            assert!(index < u64::from(self.capacity), "direct key out of range");
            self.slots[index as usize].is_some().then_some(index as u32)
        } else {
            self.key_index.get(&key).copied()
        }
    }

    fn install(&mut self, index: u32, key: K, value: V) {
        if !self.index_is_key {
            self.key_index.insert(key, index);
        }
        self.slots[index as usize] = Some((key, value));
    }

    fn valid_fn(&self) -> impl Fn(u32) -> bool + '_ {
        |index: u32| self.slots[index as usize].is_some()
    }

    /// Insert a key-value pair.
    ///
    /// A key that is already present is left untouched. Otherwise a free
    /// slot is used if one exists, else the policy's victim is evicted and
    /// its slot reused.
    pub fn insert(&mut self, key: K, value: V, pval: PolicyValue) -> Insertion<K, V> {
        if self.contains(key) {
            return Insertion::Present;
        }

        if self.index_is_key {
            let index = key.as_index() as u32;
            self.free.retain(|&i| i != index);
            self.policy.update(index, Op::Insert, pval);
            self.install(index, key, value);
            return Insertion::Free { index };
        }

        if let Some(index) = self.free.pop_front() {
            self.policy.update(index, Op::Insert, pval);
            self.install(index, key, value);
            return Insertion::Free { index };
        }

        let index = {
            let slots = &self.slots;
            self.policy.victim(&|i| slots[i as usize].is_some())
        };
        self.policy.update(index, Op::Replace, pval);
        let (old_key, old_value) = self.slots[index as usize]
            .take()
            .expect("victim slot holds a valid entry");
        self.key_index.remove(&old_key);
        self.install(index, key, value);
        Insertion::Evicted(Entry {
            index,
            key: old_key,
            value: old_value,
        })
    }

    /// Look up a key, updating the replacement policy on a hit.
    pub fn read(&mut self, key: K, pval: PolicyValue) -> Option<&V> {
        let index = self.slot_of(key)?;
        self.policy.update(index, Op::Read, pval);
        self.slots[index as usize].as_ref().map(|(_, v)| v)
    }

    /// Replace the value of a key, updating the replacement policy.
    pub fn update(&mut self, key: K, value: V, pval: PolicyValue) -> Option<&V> {
        let index = self.slot_of(key)?;
        self.slots[index as usize].as_mut().expect("valid slot").1 = value;
        self.policy.update(index, Op::Update, pval);
        self.slots[index as usize].as_ref().map(|(_, v)| v)
    }

    /// Promotion-only touch: the policy is updated, the value untouched.
    pub fn silent_update(&mut self, key: K, pval: PolicyValue) -> bool {
        let Some(index) = self.slot_of(key) else {
            return false;
        };
        self.policy.update(index, Op::Update, pval);
        true
    }

    pub fn invalidate(&mut self, key: K) -> Option<Entry<K, V>> {
        let index = self.slot_of(key)?;
        self.policy.update(index, Op::Invalidate, PolicyValue::High);
        let (key, value) = self.slots[index as usize].take().expect("valid slot");
        if !self.index_is_key {
            self.key_index.remove(&key);
        }
        self.free.push_back(index);
        Some(Entry { index, key, value })
    }

    /// Evict the policy's victim.
    pub fn force_evict(&mut self) -> Option<Entry<K, V>> {
        if self.is_empty() {
            return None;
        }
        let index = {
            let slots = &self.slots;
            self.policy.victim(&|i| slots[i as usize].is_some())
        };
        let key = self.slots[index as usize].as_ref().map(|(k, _)| *k)?;
        self.invalidate(key)
    }

    /// Key the policy would evict next, without changing any state.
    #[must_use]
    pub fn to_be_evicted(&self) -> Option<K> {
        if self.is_empty() {
            return None;
        }
        let index = self.policy.victim_peek(&self.valid_fn());
        self.slots[index as usize].as_ref().map(|(k, _)| *k)
    }

    #[must_use]
    pub fn get(&self, key: K) -> Option<&V> {
        let index = self.slot_of(key)?;
        self.slots[index as usize].as_ref().map(|(_, v)| v)
    }

    /// In-place value access; does not touch the replacement policy.
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let index = self.slot_of(key)?;
        self.slots[index as usize].as_mut().map(|(_, v)| v)
    }

    #[must_use]
    pub fn entry_at(&self, index: u32) -> Option<(K, &V)> {
        self.slots[index as usize].as_ref().map(|(k, v)| (*k, v))
    }

    /// Iterate valid entries as `(slot index, key, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, K, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|(k, v)| (i as u32, *k, v)))
    }

    /// Feed a weight for the key's slot to the policy.
    pub fn set_weight(&mut self, key: K, weight: u32) {
        if let Some(index) = self.slot_of(key) {
            self.policy.set_weight(index, weight);
        }
    }

}

#[cfg(test)]
impl<K: Key + std::fmt::Debug, V> Table<K, V> {
    fn check_conservation(&self) {
        let valid = self.slots.iter().filter(|s| s.is_some()).count() as u32;
        assert_eq!(valid + self.free.len() as u32, self.capacity);
        if !self.index_is_key {
            assert_eq!(valid as usize, self.key_index.len());
            for (key, index) in &self.key_index {
                assert_eq!(self.slots[*index as usize].as_ref().map(|(k, _)| k), Some(key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Insertion, PolicyValue, Table};

    const POLICIES: &[&str] = &[
        "lru",
        "fifo",
        "nru",
        "reuse",
        "srrip",
        "generation",
        "dip",
        "drrip",
        "drrip-hp",
        "maxw",
        "minw",
    ];

    #[test]
    fn insert_then_lookup_hits_for_every_policy() {
        for policy in POLICIES {
            let mut table: Table<u64, u32> = Table::new(4, policy);
            for key in 0..8u64 {
                table.insert(key * 1000, key as u32, PolicyValue::High);
                assert!(
                    table.read(key * 1000, PolicyValue::High).is_some(),
                    "policy {policy}: freshly inserted key misses"
                );
            }
            table.check_conservation();
        }
    }

    #[test]
    fn conservation_under_mixed_operations() {
        for policy in POLICIES {
            let mut table: Table<u64, u32> = Table::new(8, policy);
            for round in 0..64u64 {
                let key = (round * 7) % 23;
                match round % 4 {
                    0 | 1 => {
                        table.insert(key, round as u32, PolicyValue::High);
                    }
                    2 => {
                        table.read(key, PolicyValue::High);
                        table.update(key, round as u32, PolicyValue::Bimodal);
                    }
                    _ => {
                        table.invalidate(key);
                    }
                }
                table.check_conservation();
            }
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut table: Table<u64, ()> = Table::new(4, "lru");
        for key in [1u64, 2, 3, 4] {
            table.insert(key, (), PolicyValue::High);
        }
        table.read(1, PolicyValue::High);
        let evicted = table.insert(5, (), PolicyValue::High).evicted().unwrap();
        assert_eq!(evicted.key, 2);
    }

    #[test]
    fn fifo_ignores_reads() {
        let mut table: Table<u64, ()> = Table::new(4, "fifo");
        for key in [1u64, 2, 3, 4] {
            table.insert(key, (), PolicyValue::High);
        }
        table.read(1, PolicyValue::High);
        let evicted = table.insert(5, (), PolicyValue::High).evicted().unwrap();
        assert_eq!(evicted.key, 1);
    }

    #[test]
    fn evicted_slot_is_reused() {
        let mut table: Table<u64, ()> = Table::new(2, "lru");
        table.insert(10, (), PolicyValue::High);
        table.insert(20, (), PolicyValue::High);
        let Insertion::Evicted(evicted) = table.insert(30, (), PolicyValue::High) else {
            panic!("full table must evict");
        };
        // new key lives in the evicted entry's slot
        assert_eq!(table.to_be_evicted(), Some(20));
        assert!(table.contains(30));
        assert!(!table.contains(evicted.key));
        table.check_conservation();
    }

    #[test]
    fn reinsertion_of_present_key_is_a_noop() {
        let mut table: Table<u64, u32> = Table::new(2, "lru");
        table.insert(10, 1, PolicyValue::High);
        assert!(matches!(
            table.insert(10, 2, PolicyValue::High),
            Insertion::Present
        ));
        assert_eq!(table.get(10), Some(&1));
    }

    #[test]
    fn direct_index_mode() {
        let mut table: Table<u32, u32> = Table::with_direct_index(4, "lru");
        table.insert(2, 20, PolicyValue::High);
        assert!(table.contains(2));
        assert!(!table.contains(3));
        assert_eq!(table.get(2), Some(&20));
        table.check_conservation();
        table.invalidate(2);
        assert!(!table.contains(2));
        table.check_conservation();
    }

    #[test]
    fn peek_does_not_disturb_victim_choice() {
        for policy in POLICIES {
            let mut table: Table<u64, ()> = Table::new(4, policy);
            for key in [1u64, 2, 3, 4] {
                table.insert(key, (), PolicyValue::High);
            }
            let peeked = table.to_be_evicted().unwrap();
            let peeked_again = table.to_be_evicted().unwrap();
            assert_eq!(peeked, peeked_again, "policy {policy}: peek not stable");
            let evicted = table.insert(99, (), PolicyValue::High).evicted().unwrap();
            assert_eq!(evicted.key, peeked, "policy {policy}: peek disagrees");
        }
    }
}
