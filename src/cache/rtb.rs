//! Region-temperature bypass cache.
//!
//! A memory access table counts hits to 16-block regions. On a potential
//! install the incoming block's region temperature is compared with the
//! to-be-evicted block's; colder incomers are bypassed instead of evicting
//! a hotter candidate.

use crate::component::{Base, Component, Outbox, Processed};
use crate::counter::SaturatingCounter;
use crate::request::{Kind, MemoryRequest};
use crate::table::{PolicyValue, Table};
use crate::tag_store::TagStore;
use crate::{address, config};
use itertools::Itertools;
use std::collections::HashMap;

/// Blocks per tracked region.
const REGION_SHIFT: u32 = 4;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,
}

enum AccessTable {
    /// Bounded, LRU-managed.
    Bounded(Table<address, SaturatingCounter>),
    /// Unbounded ("perfect") map.
    Perfect(HashMap<address, SaturatingCounter>),
}

impl AccessTable {
    fn touch(&mut self, region: address, max: u32) {
        match self {
            AccessTable::Bounded(table) => {
                if table.contains(region) {
                    table.get_mut(region).expect("present").increment();
                } else {
                    table.insert(region, SaturatingCounter::new(max), PolicyValue::High);
                }
            }
            AccessTable::Perfect(map) => match map.entry(region) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    entry.into_mut().increment();
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(SaturatingCounter::new(max));
                }
            },
        }
    }

    fn value(&self, region: address) -> Option<u32> {
        match self {
            AccessTable::Bounded(table) => table.get(region).map(SaturatingCounter::get),
            AccessTable::Perfect(map) => map.get(&region).map(SaturatingCounter::get),
        }
    }

    /// Decrement and return the candidate's remaining temperature, if
    /// tracked at all.
    fn cool_down(&mut self, region: address) -> Option<u32> {
        let counter = match self {
            AccessTable::Bounded(table) => table.get_mut(region),
            AccessTable::Perfect(map) => map.get_mut(&region),
        }?;
        counter.decrement();
        Some(counter.get())
    }
}

pub struct RtbCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    tag_store_latency: u32,
    data_store_latency: u32,
    mat_size: u32,
    mat_max: u32,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,
    mat: AccessTable,
    occupancy: Vec<u32>,
    hits: Vec<u32>,
    misses: Vec<u32>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl RtbCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "lru".to_string(),
            tag_store_latency: 6,
            data_store_latency: 15,
            mat_size: 0,
            mat_max: 256,
            num_sets: 0,
            tags: TagStore::new(1, 1, "lru"),
            mat: AccessTable::Perfect(HashMap::new()),
            occupancy: Vec::new(),
            hits: Vec::new(),
            misses: Vec::new(),
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writebacks: stats::Counter::default(),
            c_misses: stats::Counter::default(),
            c_evictions: stats::Counter::default(),
            c_dirty_evictions: stats::Counter::default(),
        }
    }

    fn block_tag(&self, request: &MemoryRequest) -> address {
        request.physical_address / u64::from(self.block_size)
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let set = self.tags.set_index(ctag);

        // with the set full, duel the incoming region against the victim's
        let candidate = if self.tags.len_of_set(set) == self.associativity {
            let candidate = self.tags.to_be_evicted(set).expect("full set");
            let incoming = self
                .mat
                .value(ctag >> REGION_SHIFT)
                .expect("incoming region was touched on access");
            let remaining = self.mat.cool_down(candidate >> REGION_SHIFT).unwrap_or(0);
            if remaining >= incoming {
                // incoming block is colder: bypass the install
                return;
            }
            Some(candidate)
        } else {
            None
        };

        let evicted = candidate.and_then(|candidate| self.tags.invalidate(candidate));

        let entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
        };
        self.tags.insert(ctag, entry, PolicyValue::High);
        self.occupancy[request.cpu] += 1;

        if let Some(evicted) = evicted {
            self.occupancy[evicted.value.app] -= 1;
            self.base.stats.inc(self.c_evictions);

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
}

impl Default for RtbCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for RtbCache {
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
            "tag-store-latency" => {
                self.tag_store_latency = config::parse(component, name, value)?;
            }
            "data-store-latency" => {
                self.data_store_latency = config::parse(component, name, value)?;
            }
            "mat-size" => self.mat_size = config::parse(component, name, value)?,
            "mat-max" => self.mat_max = config::parse(component, name, value)?,
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
    }

    fn start_simulation(&mut self) {
        self.num_sets = (self.size * 1024) / (self.block_size * self.associativity);
        self.tags = TagStore::new(self.num_sets, self.associativity, &self.policy);
        self.mat = if self.mat_size != 0 {
            AccessTable::Bounded(Table::new(self.mat_size, "lru"))
        } else {
            AccessTable::Perfect(HashMap::new())
        };
        self.occupancy = vec![0; self.base.num_cpus];
        self.hits = vec![0; self.base.num_cpus];
        self.misses = vec![0; self.base.num_cpus];
        self.base.new_log_file("occupancy", "occupancy");
    }

    fn heartbeat(&mut self, _elapsed: u64) {
        if self.base.num_cpus > 1 {
            let occupancy = self.occupancy.iter().map(u32::to_string).join(" ");
            let cycle = self.base.local_cycle;
            self.base
                .log("occupancy", format_args!("{cycle} {occupancy}\n"));
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
        let latency = u64::from(self.tag_store_latency);

        match request.kind {
            kind if kind.is_read_class() => {
                self.base.stats.inc(self.c_reads);
                self.mat.touch(ctag >> REGION_SHIFT, self.mat_max);

                if self.tags.read(ctag, PolicyValue::High).is_some() {
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
                    self.hits[request.cpu] += 1;
                } else {
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);
                    self.misses[request.cpu] += 1;
                }
                (latency, Some(request))
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_writebacks);
                if let Some(entry) = self.tags.get_mut(ctag) {
                    entry.dirty = true;
                } else {
                    self.mat.touch(ctag >> REGION_SHIFT, self.mat_max);
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
    use super::RtbCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> RtbCache {
        let mut cache = RtbCache::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn read(cache: &mut RtbCache, addr: u64, out: &mut Outbox) -> bool {
        let request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        let (_, passed) = cache.process(Box::new(request), out);
        passed.unwrap().serviced
    }

    fn fill(cache: &mut RtbCache, addr: u64, out: &mut Outbox) {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        request.serviced = true;
        cache.process_return(Box::new(request), out);
    }

    #[test]
    fn cold_region_bypasses_hot_candidates() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let stride = u64::from(cache.num_sets) * 64;

        // heat two resident regions with repeated reads
        for addr in [0x1000u64, 0x1000 + stride] {
            assert!(!read(&mut cache, addr, &mut out));
            fill(&mut cache, addr, &mut out);
            for _ in 0..4 {
                assert!(read(&mut cache, addr, &mut out));
            }
        }

        // a cold region missing into the full set loses the duel
        let cold = 0x1000 + 2 * stride;
        assert!(!read(&mut cache, cold, &mut out));
        fill(&mut cache, cold, &mut out);
        assert!(!cache.tags.contains(cold / 64));
        assert!(cache.tags.contains(0x1000 / 64));

        // but a region that keeps missing heats up and eventually installs
        let mut installed = false;
        for _ in 0..8 {
            if cache.tags.contains(cold / 64) {
                installed = true;
                break;
            }
            assert!(!read(&mut cache, cold, &mut out));
            fill(&mut cache, cold, &mut out);
        }
        assert!(installed);
    }
}
