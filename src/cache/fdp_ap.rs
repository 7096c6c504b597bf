//! Feedback-directed prefetching with per-prefetcher accuracy tracking.
//!
//! Each prefetcher id carries running averages of prefetches issued and
//! prefetches used, halved every half-cache of evictions. Prefetchers whose
//! used fraction stays under one half insert at low priority, and their
//! low-priority evictions flow into a small per-prefetcher filter so a
//! late demand miss can still flag the prediction as wrong.

use crate::cache::PrefetchState;
use crate::component::{Base, Component, Outbox, Processed, SimulationLog};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::TagStore;
use crate::{address, config, Cycle};

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,

    pref_state: PrefetchState,
    low_priority: bool,
    prefetcher: u32,

    prefetch_miss: u64,
    use_miss: u64,
    prefetch_cycle: Cycle,
    use_cycle: Cycle,
}

struct AccuracyEntry {
    avg_prefetches: u64,
    avg_used: u64,
    cur_prefetches: u64,
    cur_used: u64,
    /// Low-priority prefetches evicted unused; a demand miss that hits
    /// here means the low-priority call was wrong.
    evicted_filter: TagStore<address, ()>,
}

impl AccuracyEntry {
    fn new(prefetch_distance: u32) -> Self {
        Self {
            avg_prefetches: 0,
            avg_used: 0,
            cur_prefetches: 0,
            cur_used: 0,
            evicted_filter: TagStore::new(prefetch_distance, 1, "fifo"),
        }
    }

    fn accurate(&self) -> bool {
        let total = (self.avg_prefetches + self.cur_prefetches) / 2;
        let used = (self.avg_used + self.cur_used) / 2;
        used * 2 > total
    }

    fn halve(&mut self) {
        self.avg_prefetches = (self.avg_prefetches + self.cur_prefetches) / 2;
        self.avg_used = (self.avg_used + self.cur_used) / 2;
        self.cur_prefetches = 0;
        self.cur_used = 0;
    }
}

pub struct FdpApCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    policy_value: u32,
    tag_store_latency: u32,
    data_store_latency: u32,
    accuracy_table_size: u32,
    prefetch_distance: u32,

    num_sets: u32,
    num_blocks: u32,
    tags: TagStore<address, TagEntry>,
    pval: PolicyValue,
    accuracy: Vec<AccuracyEntry>,
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
    c_predicted_accurate: stats::Counter,
    c_accurate_predicted_inaccurate: stats::Counter,
    c_inaccurate_predicted_accurate: stats::Counter,
    c_unused_prefetches: stats::Counter,
    c_used_prefetches: stats::Counter,
    c_unreused_prefetches: stats::Counter,
    c_reused_prefetches: stats::Counter,
    c_prefetch_use_cycle: stats::Counter,
    c_prefetch_use_miss: stats::Counter,
    c_prefetch_lifetime_cycle: stats::Counter,
    c_prefetch_lifetime_miss: stats::Counter,
}

impl FdpApCache {
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
            accuracy_table_size: 128,
            prefetch_distance: 24,
            num_sets: 0,
            num_blocks: 0,
            tags: TagStore::new(1, 1, "lru"),
            pval: PolicyValue::High,
            accuracy: Vec::new(),
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
            c_predicted_accurate: stats::Counter::default(),
            c_accurate_predicted_inaccurate: stats::Counter::default(),
            c_inaccurate_predicted_accurate: stats::Counter::default(),
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

    fn prefetcher_slot(&self, id: u32) -> usize {
        (id % self.accuracy_table_size) as usize
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let mut priority = self.pval;
        if request.kind == Kind::Prefetch {
            let entry = &self.accuracy[self.prefetcher_slot(request.prefetcher_id)];
            if entry.accurate() {
                priority = PolicyValue::High;
                self.base.stats.inc(self.c_predicted_accurate);
            } else {
                priority = PolicyValue::Low;
            }
        }

        let set = self.tags.set_index(ctag);
        let mut entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
            ..TagEntry::default()
        };
        if request.kind == Kind::Prefetch {
            entry.pref_state = PrefetchState::PrefetchedUnused;
            entry.prefetch_cycle = request.current_cycle;
            entry.prefetch_miss = self.miss_counter[set as usize];
            entry.prefetcher = request.prefetcher_id;
            entry.low_priority = priority == PolicyValue::Low;
        }

        let Some(evicted) = self.tags.insert(ctag, entry, priority).evicted() else {
            return;
        };
        self.base.stats.inc(self.c_evictions);

        // halve all running averages once per half-cache of evictions
        if self.base.stats.get(self.c_evictions) % u64::from(self.num_blocks / 2) == 0 {
            for entry in &mut self.accuracy {
                entry.halve();
            }
        }

        let lifetime = |end_cycle: Cycle, end_miss: u64| {
            (
                end_cycle - evicted.value.prefetch_cycle,
                end_miss - evicted.value.prefetch_miss,
            )
        };
        match evicted.value.pref_state {
            PrefetchState::PrefetchedUnused => {
                self.base.stats.inc(self.c_unused_prefetches);
                let (cycles, misses) =
                    lifetime(request.current_cycle, self.miss_counter[set as usize]);
                self.base.stats.add(self.c_prefetch_lifetime_cycle, cycles);
                self.base.stats.add(self.c_prefetch_lifetime_miss, misses);

                if evicted.value.low_priority {
                    let slot = self.prefetcher_slot(evicted.value.prefetcher);
                    self.accuracy[slot].evicted_filter.insert(
                        evicted.key,
                        (),
                        PolicyValue::High,
                    );
                } else {
                    self.base.stats.inc(self.c_inaccurate_predicted_accurate);
                }
            }
            PrefetchState::PrefetchedUsed => {
                self.base.stats.inc(self.c_unreused_prefetches);
                let (cycles, misses) =
                    lifetime(request.current_cycle, self.miss_counter[set as usize]);
                self.base.stats.add(self.c_prefetch_lifetime_cycle, cycles);
                self.base.stats.add(self.c_prefetch_lifetime_miss, misses);
            }
            PrefetchState::PrefetchedReused => {
                let (cycles, misses) = lifetime(evicted.value.use_cycle, evicted.value.use_miss);
                self.base.stats.add(self.c_prefetch_lifetime_cycle, cycles);
                self.base.stats.add(self.c_prefetch_lifetime_miss, misses);
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

impl Default for FdpApCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for FdpApCache {
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
            "accuracy-table-size" => {
                self.accuracy_table_size = config::parse(component, name, value)?;
            }
            "prefetch-distance" => {
                self.prefetch_distance = config::parse(component, name, value)?;
            }
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
        self.c_predicted_accurate =
            stats.register("predicted_accurate", "Prefetches predicted to be accurate");
        self.c_accurate_predicted_inaccurate = stats.register(
            "accurate_predicted_inaccurate",
            "Accurate prefetches predicted inaccurate",
        );
        self.c_inaccurate_predicted_accurate = stats.register(
            "inaccurate_predicted_accurate",
            "Inaccurate prefetches predicted accurate",
        );
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
        self.num_blocks = self.num_sets * self.associativity;
        self.tags = TagStore::new(self.num_sets, self.associativity, &self.policy);
        self.pval = PolicyValue::from_level(self.policy_value);
        self.accuracy = (0..self.accuracy_table_size)
            .map(|_| AccuracyEntry::new(self.prefetch_distance))
            .collect();
        self.miss_counter = vec![0; self.num_sets as usize];
        self.proc_misses = vec![0; self.base.num_cpus];
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
                    match entry.pref_state {
                        PrefetchState::PrefetchedUnused => {
                            entry.pref_state = PrefetchState::PrefetchedUsed;
                            entry.use_miss = miss_count;
                            entry.use_cycle = request.current_cycle;
                            let use_cycles = entry.use_cycle - entry.prefetch_cycle;
                            let use_misses = entry.use_miss - entry.prefetch_miss;
                            let was_low = entry.low_priority;
                            entry.low_priority = false;
                            let prefetcher = entry.prefetcher;

                            self.base.stats.inc(self.c_used_prefetches);
                            self.base.stats.add(self.c_prefetch_use_cycle, use_cycles);
                            self.base.stats.add(self.c_prefetch_use_miss, use_misses);
                            if was_low {
                                self.base.stats.inc(self.c_accurate_predicted_inaccurate);
                            }
                            let slot = self.prefetcher_slot(prefetcher);
                            self.accuracy[slot].cur_used += 1;
                        }
                        PrefetchState::PrefetchedUsed => {
                            entry.pref_state = PrefetchState::PrefetchedReused;
                            self.base.stats.inc(self.c_reused_prefetches);
                        }
                        _ => {}
                    }
                } else {
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);
                    self.proc_misses[request.cpu] += 1;

                    // late demand for a dropped-priority prefetch?
                    if request.demand_prefetched {
                        let slot = self.prefetcher_slot(request.demand_prefetcher_id);
                        let filter = &mut self.accuracy[slot].evicted_filter;
                        if filter.contains(ctag) {
                            filter.invalidate(ctag);
                            self.base.stats.inc(self.c_accurate_predicted_inaccurate);
                        }
                    }
                }
                (latency, Some(request))
            }

            Kind::Prefetch => {
                self.base.stats.inc(self.c_prefetches);
                let slot = self.prefetcher_slot(request.prefetcher_id);
                self.accuracy[slot].cur_prefetches += 1;

                if self.tags.read(ctag, PolicyValue::High).is_some() {
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
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
    use super::FdpApCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> FdpApCache {
        let mut cache = FdpApCache::new();
        cache.set_param("size", "16").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.set_param("accuracy-table-size", "4").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    #[test]
    fn unused_prefetchers_lose_their_accuracy() {
        let mut cache = cache();
        let mut out = Outbox::new(0);

        // prefetcher 1 issues plenty, nothing gets used
        for i in 0..32u64 {
            let mut prefetch = MemoryRequest::new(
                Initiator::Cpu,
                0,
                Kind::Prefetch,
                1,
                0x1000 + i * 64,
                0x1000 + i * 64,
                8,
                10,
            );
            prefetch.prefetcher_id = 1;
            cache.process(Box::new(prefetch.clone()), &mut out);
            prefetch.serviced = true;
            cache.process_return(Box::new(prefetch), &mut out);
        }
        assert!(!cache.accuracy[1].accurate());
    }

    #[test]
    fn used_prefetches_keep_a_prefetcher_accurate() {
        let mut cache = cache();
        let mut out = Outbox::new(0);

        for i in 0..8u64 {
            let addr = 0x2000 + i * 64;
            let mut prefetch =
                MemoryRequest::new(Initiator::Cpu, 0, Kind::Prefetch, 1, addr, addr, 8, 10);
            prefetch.prefetcher_id = 2;
            cache.process(Box::new(prefetch.clone()), &mut out);
            prefetch.serviced = true;
            cache.process_return(Box::new(prefetch), &mut out);

            let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 20);
            let (_, hit) = cache.process(Box::new(read), &mut out);
            assert!(hit.unwrap().serviced);
        }
        assert!(cache.accuracy[2].accurate());
    }
}
