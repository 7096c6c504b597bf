//! PACMan: prefetch-aware cache management.
//!
//! PACMan-H keeps prefetch-request hits from promoting a block, PACMan-M
//! duels prefetch-demotion against the baseline insertion policy and lets
//! PSEL steer prefetch installs on the follower sets.

use crate::cache::PrefetchState;
use crate::component::{Base, Component, Outbox, Processed, SimulationLog};
use crate::counter::{CyclicIndex, SaturatingCounter};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::{TagStore, DUELING_STRIDE};
use crate::{address, config, Cycle};

const NUM_DUELING_SETS: u32 = 32;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,

    pref_state: PrefetchState,
    low_priority: bool,

    prefetch_miss: u64,
    use_miss: u64,
    prefetch_cycle: Cycle,
    use_cycle: Cycle,
}

#[derive(Debug, Clone, Copy, Default)]
struct SetInfo {
    leader: bool,
    pacman: bool,
}

pub struct PacmanCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    policy_value: u32,
    tag_store_latency: u32,
    data_store_latency: u32,
    pacman_h: bool,
    pacman_m: bool,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,
    pval: PolicyValue,
    duel_info: Vec<SetInfo>,
    psel: SaturatingCounter,
    psel_threshold: u32,
    miss_counter: Vec<u64>,
    proc_misses: Vec<u64>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
    c_prefetches: stats::Counter,
    c_prefetch_misses: stats::Counter,
    c_unused_prefetches: stats::Counter,
    c_used_prefetches: stats::Counter,
    c_unreused_prefetches: stats::Counter,
    c_reused_prefetches: stats::Counter,
    c_prefetch_use_cycle: stats::Counter,
    c_prefetch_use_miss: stats::Counter,
    c_prefetch_lifetime_cycle: stats::Counter,
    c_prefetch_lifetime_miss: stats::Counter,
}

impl PacmanCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "lru".to_string(),
            policy_value: 0,
            tag_store_latency: 6,
            data_store_latency: 15,
            pacman_h: true,
            pacman_m: true,
            num_sets: 0,
            tags: TagStore::new(1, 1, "lru"),
            pval: PolicyValue::High,
            duel_info: Vec::new(),
            psel: SaturatingCounter::with_initial(1024, 512),
            psel_threshold: 1024,
            miss_counter: Vec::new(),
            proc_misses: Vec::new(),
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writebacks: stats::Counter::default(),
            c_misses: stats::Counter::default(),
            c_evictions: stats::Counter::default(),
            c_dirty_evictions: stats::Counter::default(),
            c_prefetches: stats::Counter::default(),
            c_prefetch_misses: stats::Counter::default(),
            c_unused_prefetches: stats::Counter::default(),
            c_used_prefetches: stats::Counter::default(),
            c_unreused_prefetches: stats::Counter::default(),
            c_reused_prefetches: stats::Counter::default(),
            c_prefetch_use_cycle: stats::Counter::default(),
            c_prefetch_use_miss: stats::Counter::default(),
            c_prefetch_lifetime_cycle: stats::Counter::default(),
            c_prefetch_lifetime_miss: stats::Counter::default(),
        }
    }

    fn block_tag(&self, request: &MemoryRequest) -> address {
        request.virtual_address / u64::from(self.block_size)
    }

    /// Insertion priority for prefetches on a PACMan-M store.
    fn prefetch_priority(&self, set: u32) -> PolicyValue {
        let info = self.duel_info[set as usize];
        if (info.leader && info.pacman) || self.psel.get() > self.psel_threshold / 2 {
            PolicyValue::Low
        } else {
            PolicyValue::High
        }
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let set = self.tags.set_index(ctag);

        let mut priority = self.pval;
        if self.pacman_m && request.kind == Kind::Prefetch {
            priority = self.prefetch_priority(set);
        }

        let mut entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
            low_priority: priority == PolicyValue::Low,
            ..TagEntry::default()
        };
        if request.kind == Kind::Prefetch {
            entry.pref_state = PrefetchState::PrefetchedUnused;
            entry.prefetch_cycle = request.current_cycle;
            entry.prefetch_miss = self.miss_counter[set as usize];
        }

        let Some(evicted) = self.tags.insert(ctag, entry, priority).evicted() else {
            return;
        };
        self.base.stats.inc(self.c_evictions);

        let lifetime = |end_cycle: Cycle, end_miss: u64| {
            (
                end_cycle - evicted.value.prefetch_cycle,
                end_miss - evicted.value.prefetch_miss,
            )
        };
        let stats = &mut self.base.stats;
        match evicted.value.pref_state {
            PrefetchState::PrefetchedUnused => {
                stats.inc(self.c_unused_prefetches);
                let (cycles, misses) =
                    lifetime(request.current_cycle, self.miss_counter[set as usize]);
                stats.add(self.c_prefetch_lifetime_cycle, cycles);
                stats.add(self.c_prefetch_lifetime_miss, misses);
            }
            PrefetchState::PrefetchedUsed => {
                stats.inc(self.c_unreused_prefetches);
                let (cycles, misses) =
                    lifetime(request.current_cycle, self.miss_counter[set as usize]);
                stats.add(self.c_prefetch_lifetime_cycle, cycles);
                stats.add(self.c_prefetch_lifetime_miss, misses);
            }
            PrefetchState::PrefetchedReused => {
                let (cycles, misses) = lifetime(evicted.value.use_cycle, evicted.value.use_miss);
                stats.add(self.c_prefetch_lifetime_cycle, cycles);
                stats.add(self.c_prefetch_lifetime_miss, misses);
            }
            PrefetchState::NotPrefetched => {}
        }

        if !evicted.value.low_priority {
            self.miss_counter[set as usize] += 1;
        }

        if evicted.value.dirty {
            self.base.stats.inc(self.c_dirty_evictions);
            let writeback = MemoryRequest::spawned(
                self.base.id,
                Kind::Writeback,
                request,
                evicted.value.vcla,
                evicted.value.pcla,
                self.block_size,
            );
            out.send(Box::new(writeback));
        }
    }
}

impl Default for PacmanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for PacmanCache {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "size" => self.size = config::parse(component, name, value)?,
            "block-size" => self.block_size = config::parse(component, name, value)?,
            "associativity" => self.associativity = config::parse(component, name, value)?,
            "policy" => self.policy = config::parse_policy(component, name, value)?,
            "policy-value" => self.policy_value = config::parse(component, name, value)?,
            "tag-store-latency" => {
                self.tag_store_latency = config::parse(component, name, value)?;
            }
            "data-store-latency" => {
                self.data_store_latency = config::parse(component, name, value)?;
            }
            "pacman-h" => self.pacman_h = config::parse_bool(component, name, value)?,
            "pacman-m" => self.pacman_m = config::parse_bool(component, name, value)?,
            _ => {
                return Err(config::Error::UnknownParameter {
                    component: component.clone(),
                    parameter: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn init_stats(&mut self) {
        let stats = &mut self.base.stats;
        self.c_accesses = stats.register("accesses", "Total Accesses");
        self.c_reads = stats.register("reads", "Read Accesses");
        self.c_writebacks = stats.register("writebacks", "Writeback Accesses");
        self.c_misses = stats.register("misses", "Total Misses");
        self.c_evictions = stats.register("evictions", "Evictions");
        self.c_dirty_evictions = stats.register("dirty_evictions", "Dirty Evictions");
        self.c_prefetches = stats.register("prefetches", "Total prefetches");
        self.c_prefetch_misses = stats.register("prefetch_misses", "Prefetch misses");
        self.c_unused_prefetches = stats.register("unused_prefetches", "Unused prefetches");
        self.c_used_prefetches = stats.register("used_prefetches", "Used prefetches");
        self.c_unreused_prefetches = stats.register("unreused_prefetches", "Unreused prefetches");
        self.c_reused_prefetches = stats.register("reused_prefetches", "Reused prefetches");
        self.c_prefetch_use_cycle = stats.register("prefetch_use_cycle", "Prefetch-to-use Cycles");
        self.c_prefetch_use_miss = stats.register("prefetch_use_miss", "Prefetch-to-use Misses");
        self.c_prefetch_lifetime_cycle =
            stats.register("prefetch_lifetime_cycle", "Prefetch-lifetime Cycles");
        self.c_prefetch_lifetime_miss =
            stats.register("prefetch_lifetime_miss", "Prefetch-lifetime Misses");
    }

    fn start_simulation(&mut self) {
        self.num_sets = (self.size * 1024) / (self.block_size * self.associativity);
        self.tags = TagStore::new(self.num_sets, self.associativity, &self.policy);
        self.pval = PolicyValue::from_level(self.policy_value);
        self.miss_counter = vec![0; self.num_sets as usize];
        self.proc_misses = vec![0; self.base.num_cpus];

        if self.pacman_m {
            self.psel =
                SaturatingCounter::with_initial(self.psel_threshold, self.psel_threshold / 2);
            self.duel_info = vec![SetInfo::default(); self.num_sets as usize];
            let mut current = CyclicIndex::new(self.num_sets);
            for _ in 0..NUM_DUELING_SETS {
                for pacman in [true, false] {
                    self.duel_info[current.get() as usize] = SetInfo {
                        leader: true,
                        pacman,
                    };
                    current.add(DUELING_STRIDE);
                }
            }
        }
    }

    fn end_proc_warm_up(&mut self, cpu: usize) {
        self.proc_misses[cpu] = 0;
    }

    fn end_simulation(&mut self, log: &mut SimulationLog) {
        self.base.dump_stats(log);
        for cpu in 0..self.base.num_cpus {
            log.entry(
                &self.base.name,
                format_args!("misses-{cpu} = {}", self.proc_misses[cpu]),
            );
        }
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        self.base.stats.inc(self.c_accesses);

        assert!(
            !request.kind.is_direct_write(),
            "{}: cannot handle direct writes",
            self.base.name
        );

        let ctag = self.block_tag(&request);
        let set = self.tags.set_index(ctag);
        let latency = u64::from(self.tag_store_latency);

        match request.kind {
            Kind::Read | Kind::ReadForWrite => {
                self.base.stats.inc(self.c_reads);

                if self.tags.contains(ctag) {
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
                    self.tags.read(ctag, PolicyValue::High);

                    let miss_count = self.miss_counter[set as usize];
                    let entry = self.tags.get_mut(ctag).expect("line present");
                    entry.low_priority = false;
                    match entry.pref_state {
                        PrefetchState::PrefetchedUnused => {
                            entry.pref_state = PrefetchState::PrefetchedUsed;
                            entry.use_miss = miss_count;
                            entry.use_cycle = request.current_cycle;
                            let use_cycles = entry.use_cycle - entry.prefetch_cycle;
                            let use_misses = entry.use_miss - entry.prefetch_miss;
                            self.base.stats.inc(self.c_used_prefetches);
                            self.base.stats.add(self.c_prefetch_use_cycle, use_cycles);
                            self.base.stats.add(self.c_prefetch_use_miss, use_misses);
                        }
                        PrefetchState::PrefetchedUsed => {
                            entry.pref_state = PrefetchState::PrefetchedReused;
                            self.base.stats.inc(self.c_reused_prefetches);
                        }
                        _ => {}
                    }
                } else {
                    if self.pacman_m {
                        let info = self.duel_info[set as usize];
                        if info.leader {
                            if info.pacman {
                                self.psel.decrement();
                            } else {
                                self.psel.increment();
                            }
                        }
                    }
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);
                    if !self.base.is_done(request.cpu) {
                        self.proc_misses[request.cpu] += 1;
                    }
                }
                (latency, Some(request))
            }

            Kind::Prefetch => {
                self.base.stats.inc(self.c_prefetches);

                if self.tags.contains(ctag) {
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
                    self.tags.get_mut(ctag).expect("line present").low_priority = false;
                    // PACMan-H: prefetch hits do not promote
                    if !self.pacman_h {
                        self.tags.read(ctag, PolicyValue::High);
                    }
                } else {
                    self.base.stats.inc(self.c_prefetch_misses);
                    request.add_latency(latency);
                }
                (latency, Some(request))
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_writebacks);
                if let Some(entry) = self.tags.get_mut(ctag) {
                    entry.dirty = true;
                } else {
                    self.insert_block(ctag, true, &request, out);
                }
                request.serviced = true;
                (latency, Some(request))
            }

            Kind::FakeRead => {
                request.serviced = true;
                (0, Some(request))
            }

            kind => unreachable!("{}: unexpected request kind {kind:?}", self.base.name),
        }
    }

    fn process_return(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        if request.initiator.is_component(self.base.id) {
            request.destroy = true;
            return (0, Some(request));
        }

        let ctag = self.block_tag(&request);
        if !self.tags.contains(ctag) {
            self.insert_block(ctag, false, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::PacmanCache;
    use crate::cache::PrefetchState;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> PacmanCache {
        let mut cache = PacmanCache::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.set_param("policy", "dip").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn fill(cache: &mut PacmanCache, kind: Kind, addr: u64, out: &mut Outbox) {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, kind, 1, addr, addr, 8, 10);
        request.serviced = true;
        cache.process_return(Box::new(request), out);
    }

    #[test]
    fn demand_use_walks_the_prefetch_states() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        fill(&mut cache, Kind::Prefetch, 0x1000, &mut out);
        let ctag = 0x1000u64 / 64;
        assert_eq!(
            cache.tags.get(ctag).unwrap().pref_state,
            PrefetchState::PrefetchedUnused
        );

        for (expected, _) in [
            (PrefetchState::PrefetchedUsed, 0),
            (PrefetchState::PrefetchedReused, 1),
        ] {
            let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x1000, 0x1000, 8, 20);
            let (_, hit) = cache.process(Box::new(read), &mut out);
            assert!(hit.unwrap().serviced);
            assert_eq!(cache.tags.get(ctag).unwrap().pref_state, expected);
        }
    }

    #[test]
    fn prefetch_hits_do_not_promote_under_pacman_h() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        // two lines in one set; lru order: first is the victim
        fill(&mut cache, Kind::Read, 0x1000, &mut out);
        let stride = u64::from(cache.num_sets) * 64;
        fill(&mut cache, Kind::Read, 0x1000 + stride, &mut out);

        let set = cache.tags.set_index(0x1000 / 64);
        let victim_before = cache.tags.to_be_evicted(set);

        let prefetch =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Prefetch, 1, 0x1000, 0x1000, 8, 30);
        let (_, hit) = cache.process(Box::new(prefetch), &mut out);
        assert!(hit.unwrap().serviced);
        // untouched victim order
        assert_eq!(cache.tags.to_be_evicted(set), victim_before);
    }
}
