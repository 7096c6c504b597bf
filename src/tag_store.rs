//! Set-associative tag indexes built from [`table::Table`] sets.

use crate::counter::{CyclicIndex, SaturatingCounter};
use crate::table::{self, Entry, Insertion, Key, PolicyValue, Table};

/// Stride used to scatter leader sets across the index space.
pub const DUELING_STRIDE: u32 = 443;

/// Set-associative tag store: one policy table per set, `key mod num_sets`
/// set selection.
pub struct TagStore<K, V> {
    sets: Vec<Table<K, V>>,
    num_sets: u32,
}

impl<K: Key, V> TagStore<K, V> {
    #[must_use]
    pub fn new(num_sets: u32, associativity: u32, policy: &str) -> Self {
        assert!(num_sets > 0, "tag store needs at least one set");
        assert!(
            table::policy_exists(policy),
            "unknown table policy `{policy}`"
        );
        Self {
            sets: (0..num_sets)
                .map(|_| Table::new(associativity, policy))
                .collect(),
            num_sets,
        }
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, key: K) -> u32 {
        (key.as_index() % u64::from(self.num_sets)) as u32
    }

    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> u32 {
        self.num_sets
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.sets.iter().map(Table::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn len_of_set(&self, set: u32) -> u32 {
        self.sets[set as usize].len()
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.sets[self.set_index(key) as usize].contains(key)
    }

    pub fn insert(&mut self, key: K, value: V, pval: PolicyValue) -> Insertion<K, V> {
        let set = self.set_index(key);
        self.sets[set as usize].insert(key, value, pval)
    }

    pub fn read(&mut self, key: K, pval: PolicyValue) -> Option<&V> {
        let set = self.set_index(key);
        self.sets[set as usize].read(key, pval)
    }

    pub fn update(&mut self, key: K, value: V, pval: PolicyValue) -> Option<&V> {
        let set = self.set_index(key);
        self.sets[set as usize].update(key, value, pval)
    }

    pub fn silent_update(&mut self, key: K, pval: PolicyValue) -> bool {
        let set = self.set_index(key);
        self.sets[set as usize].silent_update(key, pval)
    }

    pub fn invalidate(&mut self, key: K) -> Option<Entry<K, V>> {
        let set = self.set_index(key);
        self.sets[set as usize].invalidate(key)
    }

    pub fn force_evict(&mut self, set: u32) -> Option<Entry<K, V>> {
        self.sets[set as usize].force_evict()
    }

    #[must_use]
    pub fn to_be_evicted(&self, set: u32) -> Option<K> {
        self.sets[set as usize].to_be_evicted()
    }

    #[must_use]
    pub fn get(&self, key: K) -> Option<&V> {
        self.sets[self.set_index(key) as usize].get(key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let set = self.set_index(key);
        self.sets[set as usize].get_mut(key)
    }

    #[must_use]
    pub fn entry_at(&self, set: u32, slot: u32) -> Option<(K, &V)> {
        self.sets[set as usize].entry_at(slot)
    }

    pub fn set_weight(&mut self, key: K, weight: u32) {
        let set = self.set_index(key);
        self.sets[set as usize].set_weight(key, weight);
    }
}

/// Ownership and forced policy of one set in a dueling tag store.
#[derive(Debug, Clone, Copy)]
pub struct LeaderInfo {
    pub leader: bool,
    pub app: u32,
    pub policy: PolicyValue,
}

impl Default for LeaderInfo {
    fn default() -> Self {
        Self {
            leader: false,
            app: 0,
            policy: PolicyValue::High,
        }
    }
}

/// Application-aware set-dueling tag store.
///
/// Per application, `num_dueling_sets` leader sets are pinned to
/// high-priority insertion and as many to bimodal insertion; leader
/// assignments never change. Misses charged to an application's own leader
/// sets steer its PSEL counter, and all follower sets insert with the
/// PSEL winner.
pub struct SetDuelingTagStore<K, V> {
    sets: Vec<Table<K, V>>,
    leaders: Vec<LeaderInfo>,
    psel: Vec<SaturatingCounter>,
    threshold: u32,
    num_sets: u32,
}

impl<K: Key, V> SetDuelingTagStore<K, V> {
    #[must_use]
    pub fn new(
        num_apps: u32,
        num_sets: u32,
        associativity: u32,
        policy: &str,
        num_dueling_sets: u32,
        max_psel: u32,
    ) -> Self {
        assert!(
            2 * num_dueling_sets * num_apps <= num_sets,
            "not enough sets for {num_dueling_sets} dueling sets over {num_apps} apps"
        );

        let mut leaders = vec![LeaderInfo::default(); num_sets as usize];
        let mut current = CyclicIndex::new(num_sets);
        for app in 0..num_apps {
            for _ in 0..num_dueling_sets {
                for policy in [PolicyValue::High, PolicyValue::Bimodal] {
                    let slot = &mut leaders[current.get() as usize];
                    assert!(!slot.leader, "leader set conflict at {}", current.get());
                    *slot = LeaderInfo {
                        leader: true,
                        app,
                        policy,
                    };
                    current.add(DUELING_STRIDE);
                }
            }
        }

        Self {
            sets: (0..num_sets)
                .map(|_| Table::new(associativity, policy))
                .collect(),
            leaders,
            psel: vec![SaturatingCounter::with_initial(max_psel, max_psel / 2); num_apps as usize],
            threshold: max_psel / 2,
            num_sets,
        }
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, key: K) -> u32 {
        (key.as_index() % u64::from(self.num_sets)) as u32
    }

    #[must_use]
    pub fn leader_info(&self, set: u32) -> LeaderInfo {
        self.leaders[set as usize]
    }

    /// 0 if the application currently favours the high-priority policy,
    /// 1 for the bimodal one.
    #[must_use]
    pub fn policy(&self, app: u32) -> u32 {
        u32::from(self.psel[app as usize].get() <= self.threshold)
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.sets.iter().map(Table::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.sets[self.set_index(key) as usize].contains(key)
    }

    /// Insert on behalf of `app`.
    ///
    /// In one of the app's own leader sets the pinned policy applies and
    /// (unless `update_psel` is off) the PSEL counter moves: down for the
    /// high leader, up for the bimodal leader. Everywhere else the PSEL
    /// winner picks between `pval_high` and `pval_bimodal`.
    pub fn insert(
        &mut self,
        app: u32,
        key: K,
        value: V,
        update_psel: bool,
        pval_high: PolicyValue,
        pval_bimodal: PolicyValue,
    ) -> Insertion<K, V> {
        let set = self.set_index(key);
        let leader = self.leaders[set as usize];

        if update_psel && leader.leader && leader.app == app {
            return if leader.policy == PolicyValue::High {
                self.psel[app as usize].decrement();
                self.sets[set as usize].insert(key, value, pval_high)
            } else {
                self.psel[app as usize].increment();
                self.sets[set as usize].insert(key, value, pval_bimodal)
            };
        }

        let pval = if self.psel[app as usize].get() > self.threshold {
            pval_high
        } else {
            pval_bimodal
        };
        self.sets[set as usize].insert(key, value, pval)
    }

    pub fn read(&mut self, key: K, pval: PolicyValue) -> Option<&V> {
        let set = self.set_index(key);
        self.sets[set as usize].read(key, pval)
    }

    pub fn silent_update(&mut self, key: K, pval: PolicyValue) -> bool {
        let set = self.set_index(key);
        self.sets[set as usize].silent_update(key, pval)
    }

    pub fn invalidate(&mut self, key: K) -> Option<Entry<K, V>> {
        let set = self.set_index(key);
        self.sets[set as usize].invalidate(key)
    }

    #[must_use]
    pub fn get(&self, key: K) -> Option<&V> {
        self.sets[self.set_index(key) as usize].get(key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let set = self.set_index(key);
        self.sets[set as usize].get_mut(key)
    }

    #[cfg(test)]
    pub(crate) fn psel_value(&self, app: u32) -> u32 {
        self.psel[app as usize].get()
    }
}

/// Tag store with per-application sampling sets and a single insertion
/// priority.
///
/// The install/bypass decision itself is made by the owning component from
/// periodic miss-rate measurements; the store only pins the sampling sets
/// that keep those measurements flowing.
pub struct BypassTagStore<K, V> {
    sets: Vec<Table<K, V>>,
    leaders: Vec<LeaderInfo>,
    num_sets: u32,
}

impl<K: Key, V> BypassTagStore<K, V> {
    #[must_use]
    pub fn new(
        num_apps: u32,
        num_sets: u32,
        associativity: u32,
        policy: &str,
        num_sampling_sets: u32,
    ) -> Self {
        assert!(
            num_sampling_sets * num_apps <= num_sets,
            "not enough sets for {num_sampling_sets} sampling sets over {num_apps} apps"
        );

        let mut leaders = vec![LeaderInfo::default(); num_sets as usize];
        let mut current = CyclicIndex::new(num_sets);
        for app in 0..num_apps {
            for _ in 0..num_sampling_sets {
                let slot = &mut leaders[current.get() as usize];
                assert!(!slot.leader, "sampling set conflict at {}", current.get());
                *slot = LeaderInfo {
                    leader: true,
                    app,
                    policy: PolicyValue::High,
                };
                current.add(DUELING_STRIDE);
            }
        }

        Self {
            sets: (0..num_sets)
                .map(|_| Table::new(associativity, policy))
                .collect(),
            leaders,
            num_sets,
        }
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, key: K) -> u32 {
        (key.as_index() % u64::from(self.num_sets)) as u32
    }

    #[must_use]
    pub fn leader_info(&self, set: u32) -> LeaderInfo {
        self.leaders[set as usize]
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.sets[self.set_index(key) as usize].contains(key)
    }

    pub fn insert(&mut self, key: K, value: V, pval: PolicyValue) -> Insertion<K, V> {
        let set = self.set_index(key);
        self.sets[set as usize].insert(key, value, pval)
    }

    pub fn read(&mut self, key: K, pval: PolicyValue) -> Option<&V> {
        let set = self.set_index(key);
        self.sets[set as usize].read(key, pval)
    }

    pub fn invalidate(&mut self, key: K) -> Option<Entry<K, V>> {
        let set = self.set_index(key);
        self.sets[set as usize].invalidate(key)
    }

    #[must_use]
    pub fn get(&self, key: K) -> Option<&V> {
        self.sets[self.set_index(key) as usize].get(key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let set = self.set_index(key);
        self.sets[set as usize].get_mut(key)
    }
}

#[cfg(test)]
mod tests {
    use super::{BypassTagStore, SetDuelingTagStore, TagStore};
    use crate::table::PolicyValue;

    #[test]
    fn keys_map_to_their_set() {
        let mut store: TagStore<u64, u32> = TagStore::new(16, 2, "lru");
        store.insert(5, 50, PolicyValue::High);
        store.insert(5 + 16, 66, PolicyValue::High);
        store.insert(5 + 32, 82, PolicyValue::High);
        assert_eq!(store.len_of_set(5), 2);
        assert!(store.contains(5 + 16));
        // third mapping to the same 2-way set displaced the oldest
        assert!(!store.contains(5));
    }

    #[test]
    fn psel_moves_only_for_owned_leader_sets() {
        let mut store: SetDuelingTagStore<u64, ()> =
            SetDuelingTagStore::new(2, 1024, 2, "dip", 4, 1024);

        let high_leader_of_app0 = (0..1024u32)
            .find(|set| {
                let info = store.leader_info(*set);
                info.leader && info.app == 0 && info.policy == PolicyValue::High
            })
            .unwrap();
        let follower = (0..1024u32)
            .find(|set| !store.leader_info(*set).leader)
            .unwrap();

        let before = store.psel_value(0);
        store.insert(
            0,
            u64::from(high_leader_of_app0),
            (),
            true,
            PolicyValue::High,
            PolicyValue::Bimodal,
        );
        assert_eq!(store.psel_value(0), before - 1);

        // other app inserting into app 0's leader set: no movement
        let before = (store.psel_value(0), store.psel_value(1));
        store.insert(
            1,
            u64::from(high_leader_of_app0),
            (),
            true,
            PolicyValue::High,
            PolicyValue::Bimodal,
        );
        assert_eq!((store.psel_value(0), store.psel_value(1)), before);

        // follower sets never move PSEL
        let before = store.psel_value(0);
        store.insert(
            0,
            u64::from(follower),
            (),
            true,
            PolicyValue::High,
            PolicyValue::Bimodal,
        );
        assert_eq!(store.psel_value(0), before);
    }

    #[test]
    fn leader_allocation_is_disjoint_and_complete() {
        let store: SetDuelingTagStore<u64, ()> =
            SetDuelingTagStore::new(4, 2048, 16, "drrip", 32, 1024);
        let leaders = (0..2048u32)
            .filter(|set| store.leader_info(*set).leader)
            .count();
        assert_eq!(leaders, 4 * 32 * 2);
    }

    #[test]
    fn bypass_store_pins_sampling_sets() {
        let store: BypassTagStore<u64, ()> = BypassTagStore::new(2, 512, 8, "lru", 8);
        let sampled = (0..512u32)
            .filter(|set| store.leader_info(*set).leader)
            .count();
        assert_eq!(sampled, 16);
    }
}
