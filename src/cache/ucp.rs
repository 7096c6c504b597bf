//! Utility-based cache partitioning.
//!
//! Each application owns a full tag directory whose per-way hit counters
//! describe how much utility additional ways would buy it. Every partition
//! period the greedy look-ahead algorithm redistributes the ways; the
//! partition is enforced lazily by evicting from whichever application
//! exceeds its target when space is needed.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::{address, config, Cycle};
use itertools::Itertools;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    valid: bool,
    dirty: bool,
    ctag: address,
    vcla: address,
    pcla: address,
}

pub struct UcpCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    tag_store_latency: u32,
    data_store_latency: u32,
    partition_period: Cycle,

    num_sets: u32,
    /// Way targets per application.
    target: Vec<u32>,
    /// Ways currently held, per set and application.
    current: Vec<Vec<u32>>,
    free: Vec<u32>,
    /// Per-application directory: `tags[app][set][way]`, MRU at way 0.
    tags: Vec<Vec<Vec<TagEntry>>>,
    /// Per-application, per-way hit counters for the utility curves.
    hits: Vec<Vec<u32>>,
    misses: Vec<u32>,
    utility: Vec<Vec<u32>>,
    previous_partition_cycle: Cycle,
    occupancy: Vec<u32>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl UcpCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 32,
            block_size: 64,
            associativity: 2,
            tag_store_latency: 1,
            data_store_latency: 2,
            partition_period: 5_000_000,
            num_sets: 0,
            target: Vec::new(),
            current: Vec::new(),
            free: Vec::new(),
            tags: Vec::new(),
            hits: Vec::new(),
            misses: Vec::new(),
            utility: Vec::new(),
            previous_partition_cycle: 0,
            occupancy: Vec::new(),
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writebacks: stats::Counter::default(),
            c_misses: stats::Counter::default(),
            c_evictions: stats::Counter::default(),
            c_dirty_evictions: stats::Counter::default(),
        }
    }

    fn set_of(&self, ctag: address) -> usize {
        (ctag % u64::from(self.num_sets)) as usize
    }

    /// Directory probe; a hit promotes to MRU and bumps the way counter.
    /// A tag that matches an invalid entry is a "false hit": it trains the
    /// utility counters but misses in the cache.
    fn check_block(&mut self, cpu: usize, ctag: address) -> bool {
        let set = self.set_of(ctag);
        let ways = &mut self.tags[cpu][set];
        for way in 0..self.associativity as usize {
            if ways[way].ctag == ctag {
                self.hits[cpu][way] += 1;
                if ways[way].valid {
                    let entry = ways.remove(way);
                    ways.insert(0, entry);
                    return true;
                }
                self.misses[cpu] += 1;
                return false;
            }
        }
        self.misses[cpu] += 1;
        false
    }

    fn mark_dirty(&mut self, cpu: usize, ctag: address) -> bool {
        let set = self.set_of(ctag);
        let ways = &mut self.tags[cpu][set];
        for way in 0..self.associativity as usize {
            if ways[way].ctag == ctag {
                if ways[way].valid {
                    self.hits[cpu][way] += 1;
                    ways[way].dirty = true;
                    return true;
                }
                self.hits[cpu][way] += 1;
                return false;
            }
        }
        false
    }

    fn evict_entry(&mut self, entry: TagEntry, request: &MemoryRequest, out: &mut Outbox) {
        if !entry.valid {
            return;
        }
        self.base.stats.inc(self.c_evictions);
        if entry.dirty {
            self.base.stats.inc(self.c_dirty_evictions);
            let writeback = MemoryRequest::spawned(
                self.base.id,
                Kind::Writeback,
                request,
                entry.vcla,
                entry.pcla,
                self.block_size,
            );
            out.send(Box::new(writeback));
        }
    }

    fn insert_block(
        &mut self,
        cpu: usize,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let set = self.set_of(ctag);

        if self.free[set] == 0 {
            // evict from an application above its target, or from the
            // inserting one when everybody fits
            let victim = (0..self.base.num_cpus)
                .find(|&app| self.current[set][app] > self.target[app])
                .unwrap_or(cpu);

            let way = self.current[set][victim] as usize - 1;
            let entry = std::mem::take(&mut self.tags[victim][set][way]);
            self.evict_entry(entry, request, out);
            self.current[set][victim] -= 1;
            self.occupancy[victim] -= 1;
        } else {
            self.free[set] -= 1;
        }

        let ways = &mut self.tags[cpu][set];
        ways.pop();
        ways.insert(
            0,
            TagEntry {
                valid: true,
                dirty,
                ctag,
                vcla: request.virtual_block_address(self.block_size),
                pcla: request.physical_block_address(self.block_size),
            },
        );
        self.current[set][cpu] += 1;
        self.occupancy[cpu] += 1;
    }

    fn compute_utility(&mut self) {
        for cpu in 0..self.base.num_cpus {
            self.utility[cpu][0] = self.hits[cpu][0];
            for way in 1..self.associativity as usize {
                self.utility[cpu][way] = self.utility[cpu][way - 1] + self.hits[cpu][way];
            }
        }
    }

    fn marginal_utility(&self, cpu: usize, from: u32, to: u32) -> u32 {
        if from == to {
            return 0;
        }
        (self.utility[cpu][to as usize - 1] - self.utility[cpu][from as usize - 1]) / (to - from)
    }

    /// Best `(marginal utility, ways)` an application can get from up to
    /// `available` more ways.
    fn max_marginal_utility(&self, cpu: usize, allocated: u32, available: u32) -> (u32, u32) {
        let mut best = (0, 0);
        for extra in 1..=available {
            let utility = self.marginal_utility(cpu, allocated, allocated + extra);
            if utility > best.0 {
                best = (utility, extra);
            }
        }
        best
    }

    /// Greedy look-ahead: repeatedly hand ways to whichever application
    /// gains the most utility from them.
    fn repartition(&mut self) {
        self.compute_utility();

        let num_cpus = self.base.num_cpus;
        let mut available = self.associativity - num_cpus as u32;
        let mut allocated = vec![1u32; num_cpus];

        while available > 0 {
            let mut best_cpu = 0;
            let mut best = self.max_marginal_utility(0, allocated[0], available);
            for cpu in 1..num_cpus {
                let candidate = self.max_marginal_utility(cpu, allocated[cpu], available);
                if candidate.0 > best.0 {
                    best_cpu = cpu;
                    best = candidate;
                }
            }
            if best.0 == 0 {
                break;
            }
            allocated[best_cpu] += best.1;
            available -= best.1;
        }

        // leftovers go round-robin
        let mut cpu = 0;
        while available > 0 {
            allocated[cpu] += 1;
            available -= 1;
            cpu = (cpu + 1) % num_cpus;
        }

        for cpu in 0..num_cpus {
            self.target[cpu] = allocated[cpu];
            for way in 0..self.associativity as usize {
                self.hits[cpu][way] /= 2;
            }
        }
    }
}

impl Default for UcpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for UcpCache {
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
            "tag-store-latency" => {
                self.tag_store_latency = config::parse(component, name, value)?;
            }
            "data-store-latency" => {
                self.data_store_latency = config::parse(component, name, value)?;
            }
            "partition-period" => self.partition_period = config::parse(component, name, value)?,
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
        self.c_dirty_evictions = stats.register("dirtyevictions", "Dirty Evictions");
    }

    fn start_simulation(&mut self) {
        let num_cpus = self.base.num_cpus;
        assert!(
            self.associativity >= num_cpus as u32,
            "{}: fewer ways than applications",
            self.base.name
        );
        self.num_sets = (self.size * 1024) / (self.block_size * self.associativity);
        self.target = vec![self.associativity / num_cpus as u32; num_cpus];
        self.free = vec![self.associativity; self.num_sets as usize];
        self.current = vec![vec![0; num_cpus]; self.num_sets as usize];
        self.misses = vec![0; num_cpus];
        self.hits = vec![vec![0; self.associativity as usize]; num_cpus];
        self.utility = vec![vec![0; self.associativity as usize]; num_cpus];
        self.tags = vec![
            vec![vec![TagEntry::default(); self.associativity as usize]; self.num_sets as usize];
            num_cpus
        ];
        self.previous_partition_cycle = 0;
        self.occupancy = vec![0; num_cpus];
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

        if self.base.local_cycle > self.previous_partition_cycle + self.partition_period {
            self.repartition();
            self.previous_partition_cycle += self.partition_period;
        }

        // same size coercions as the data cache
        if request.kind == Kind::PartialWrite && request.size == self.block_size {
            request.kind = Kind::Writeback;
        } else if request.kind == Kind::Writeback && request.size < self.block_size {
            request.kind = Kind::PartialWrite;
        }

        assert!(
            !request.kind.is_direct_write(),
            "{}: cannot handle direct writes",
            self.base.name
        );

        let ctag = request.physical_address / u64::from(self.block_size);
        let cpu = request.cpu;
        let tag_latency = u64::from(self.tag_store_latency);

        match request.kind {
            kind if kind.is_read_class() => {
                self.base.stats.inc(self.c_reads);
                if self.check_block(cpu, ctag) {
                    request.serviced = true;
                    request.add_latency(tag_latency + u64::from(self.data_store_latency));
                } else {
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(tag_latency);
                }
                (tag_latency, Some(request))
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_writebacks);
                if !self.mark_dirty(cpu, ctag) {
                    self.insert_block(cpu, ctag, true, &request, out);
                }
                request.serviced = true;
                (tag_latency, Some(request))
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

        let ctag = request.physical_address / u64::from(self.block_size);
        let dirty = request.kind.is_direct_write();
        self.insert_block(request.cpu, ctag, dirty, &request, out);
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::UcpCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache(num_cpus: usize) -> UcpCache {
        let mut ucp = UcpCache::new();
        ucp.set_param("size", "32").unwrap();
        ucp.set_param("associativity", "4").unwrap();
        ucp.base_mut().num_cpus = num_cpus;
        ucp.init_stats();
        ucp.start_simulation();
        ucp
    }

    fn touch(ucp: &mut UcpCache, cpu: usize, addr: u64, out: &mut Outbox) {
        let read = MemoryRequest::new(Initiator::Cpu, cpu, Kind::Read, 1, addr, addr, 8, 10);
        let (_, passed) = ucp.process(Box::new(read), out);
        let mut reply = passed.unwrap();
        if !reply.serviced {
            reply.serviced = true;
            ucp.process_return(reply, out);
        }
    }

    #[test]
    fn hits_after_install() {
        let mut ucp = cache(2);
        let mut out = Outbox::new(0);
        touch(&mut ucp, 0, 0x5000, &mut out);
        let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x5000, 0x5000, 8, 11);
        let (_, hit) = ucp.process(Box::new(read), &mut out);
        assert!(hit.unwrap().serviced);
    }

    #[test]
    fn over_target_application_is_the_victim() {
        let mut ucp = cache(2);
        let mut out = Outbox::new(0);
        // targets start at 2 ways each; cpu 0 grabs all 4 ways of set 0
        let stride = u64::from(ucp.num_sets) * 64;
        for way in 0..4u64 {
            touch(&mut ucp, 0, way * stride, &mut out);
        }
        assert_eq!(ucp.current[0][0], 4);

        // cpu 1 missing into the same set must evict from cpu 0
        touch(&mut ucp, 1, 5 * stride, &mut out);
        assert_eq!(ucp.current[0][0], 3);
        assert_eq!(ucp.current[0][1], 1);
    }

    #[test]
    fn repartition_favours_the_heavy_hitter() {
        let mut ucp = cache(2);
        // cpu 0 piles hits on deep ways, cpu 1 stays idle
        ucp.hits[0] = vec![100, 80, 60, 40];
        ucp.hits[1] = vec![1, 0, 0, 0];
        ucp.repartition();
        assert!(ucp.target[0] >= 3);
        assert_eq!(ucp.target[0] + ucp.target[1], 4);
    }
}
