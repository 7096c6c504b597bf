//! Feedback-directed prefetching LLC.
//!
//! Tracks how much of the recent miss traffic was caused by prefetch
//! pollution: demand misses to blocks a prefetch evicted are counted
//! through a pollution filter, and when they dominate, prefetches are
//! inserted at low priority for the next epoch.

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

pub struct FdpCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    policy_value: u32,
    tag_store_latency: u32,
    data_store_latency: u32,

    num_sets: u32,
    num_blocks: u32,
    tags: TagStore<address, TagEntry>,
    pval: PolicyValue,
    pref_pval: PolicyValue,

    cur_misses: u64,
    avg_misses: u64,
    cur_pref_misses: u64,
    avg_pref_misses: u64,
    /// Blocks evicted by a prefetch; a demand miss here is pollution.
    pref_evicted: TagStore<address, ()>,

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
    c_unused_prefetches: stats::Counter,
    c_used_prefetches: stats::Counter,
    c_unreused_prefetches: stats::Counter,
    c_reused_prefetches: stats::Counter,
    c_prefetch_use_cycle: stats::Counter,
    c_prefetch_use_miss: stats::Counter,
    c_prefetch_lifetime_cycle: stats::Counter,
    c_prefetch_lifetime_miss: stats::Counter,
}

impl FdpCache {
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
            num_sets: 0,
            num_blocks: 0,
            tags: TagStore::new(1, 1, "lru"),
            pval: PolicyValue::High,
            pref_pval: PolicyValue::High,
            cur_misses: 0,
            avg_misses: 0,
            cur_pref_misses: 0,
            avg_pref_misses: 0,
            pref_evicted: TagStore::new(1, 1, "lru"),
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

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        if request.kind != Kind::Writeback {
            self.cur_misses += 1;
        }

        // pollution filter: a demand miss to a prefetch-evicted block
        if self.pref_evicted.contains(ctag) {
            if request.kind == Kind::Prefetch {
                self.pref_evicted.invalidate(ctag);
            } else if request.kind != Kind::Writeback {
                self.pref_evicted.invalidate(ctag);
                self.cur_pref_misses += 1;
            }
        }

        let priority = if request.kind == Kind::Prefetch {
            self.pref_pval
        } else {
            self.pval
        };

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

        if evicted.value.pref_state == PrefetchState::NotPrefetched
            && request.kind == Kind::Prefetch
        {
            self.pref_evicted.insert(evicted.key, (), PolicyValue::High);
        }

        // epoch boundary: refresh the running averages and re-decide the
        // prefetch insertion priority
        if self.base.stats.get(self.c_evictions) % u64::from(self.num_blocks / 2) == 0 {
            let total = (self.cur_misses + self.avg_misses) / 2;
            let pollution = (self.cur_pref_misses + self.avg_pref_misses) / 2;
            self.pref_pval = if pollution * 4 > total {
                PolicyValue::Low
            } else {
                PolicyValue::High
            };
            self.avg_misses = total;
            self.avg_pref_misses = pollution;
            self.cur_misses = 0;
            self.cur_pref_misses = 0;
        }

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

impl Default for FdpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for FdpCache {
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
        self.pref_evicted = TagStore::new(self.num_sets, self.associativity, &self.policy);
        self.pref_pval = PolicyValue::High;
        self.pval = PolicyValue::from_level(self.policy_value);
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
                            entry.low_priority = false;
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
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);
                    self.proc_misses[request.cpu] += 1;
                }
                (latency, Some(request))
            }

            Kind::Prefetch => {
                self.base.stats.inc(self.c_prefetches);
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
    use super::FdpCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};
    use crate::table::PolicyValue;

    fn cache() -> FdpCache {
        let mut cache = FdpCache::new();
        cache.set_param("size", "16").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn fill(cache: &mut FdpCache, kind: Kind, addr: u64, out: &mut Outbox) {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, kind, 1, addr, addr, 8, 10);
        request.serviced = true;
        cache.process_return(Box::new(request), out);
    }

    #[test]
    fn pollution_demotes_prefetch_insertions() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let stride = u64::from(cache.num_sets) * 64;

        assert_eq!(cache.pref_pval, PolicyValue::High);

        // prefetches keep evicting demand blocks from one set, and the
        // demand blocks keep missing back in: pure pollution
        let mut pref_round = 1000u64;
        for round in 0..cache.num_blocks as u64 {
            let demand = 0x1000 + (round % 2) * stride;
            fill(&mut cache, Kind::Read, demand, &mut out);
            for _ in 0..2 {
                fill(&mut cache, Kind::Prefetch, 0x1000 + pref_round * stride, &mut out);
                pref_round += 1;
            }
        }

        assert_eq!(cache.pref_pval, PolicyValue::Low);
    }
}
