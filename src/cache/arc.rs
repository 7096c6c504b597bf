//! Adaptive replacement cache as a last-level cache.
//!
//! Each set keeps the four ARC lists: resident T1 (seen once) and T2 (seen
//! at least twice), plus ghost lists B1/B2 of recently evicted tags. The
//! adaptation parameter `p` shifts capacity between recency and frequency
//! whenever a miss hits one of the ghost lists.

use crate::component::{Base, Component, Outbox, Processed};
use crate::counter::SaturatingCounter;
use crate::request::{Kind, MemoryRequest};
use crate::{address, config};
use itertools::Itertools;
use std::collections::VecDeque;

const REPL_MAX: u32 = 7;

#[derive(Debug, Clone)]
struct TagEntry {
    tag: address,
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,
    repl: SaturatingCounter,
}

impl TagEntry {
    fn ghost(mut self) -> Self {
        self.repl.set(1);
        self
    }
}

#[derive(Debug, Default)]
struct ArcSet {
    t1: VecDeque<TagEntry>,
    t2: VecDeque<TagEntry>,
    b1: VecDeque<TagEntry>,
    b2: VecDeque<TagEntry>,
    p: i32,
}

fn position(list: &VecDeque<TagEntry>, tag: address) -> Option<usize> {
    list.iter().position(|entry| entry.tag == tag)
}

pub struct ArcCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    tag_store_latency: u32,
    data_store_latency: u32,
    use_rrip: bool,

    num_sets: u32,
    sets: Vec<ArcSet>,
    occupancy: Vec<u32>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl ArcCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 1024,
            block_size: 64,
            associativity: 16,
            tag_store_latency: 6,
            data_store_latency: 16,
            use_rrip: false,
            num_sets: 0,
            sets: Vec::new(),
            occupancy: Vec::new(),
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

    fn set_index(&self, ctag: address) -> usize {
        (ctag % u64::from(self.num_sets)) as usize
    }

    fn lookup(&self, ctag: address) -> bool {
        let set = &self.sets[self.set_index(ctag)];
        position(&set.t1, ctag).is_some() || position(&set.t2, ctag).is_some()
    }

    fn mark_dirty(&mut self, ctag: address) -> bool {
        let index = self.set_index(ctag);
        let set = &mut self.sets[index];
        for list in [&mut set.t1, &mut set.t2] {
            if let Some(pos) = position(list, ctag) {
                list[pos].dirty = true;
                return true;
            }
        }
        false
    }

    /// On a hit, promote the block to the tail of T2.
    fn read_block(&mut self, ctag: address) -> bool {
        let index = self.set_index(ctag);
        let set = &mut self.sets[index];

        if let Some(pos) = position(&set.t1, ctag) {
            let mut entry = set.t1.remove(pos).expect("position valid");
            entry.repl.set(1);
            set.t2.push_back(entry);
            return true;
        }
        if let Some(pos) = position(&set.t2, ctag) {
            let mut entry = set.t2.remove(pos).expect("position valid");
            entry.repl.increment();
            set.t2.push_back(entry);
            return true;
        }
        false
    }

    /// Evict from a list: FIFO by default, RRIP sweep when configured.
    fn evict_from(list: &mut VecDeque<TagEntry>, use_rrip: bool) -> TagEntry {
        if use_rrip {
            loop {
                if let Some(pos) = list.iter().position(|entry| entry.repl.get() == 0) {
                    return list.remove(pos).expect("position valid");
                }
                for entry in list.iter_mut() {
                    entry.repl.decrement();
                }
            }
        } else {
            list.pop_front().expect("eviction from an empty arc list")
        }
    }

    /// The standard ARC replace rule: drain T1 or T2 into its ghost list.
    fn replace(&mut self, index: usize, b2_hit: bool) -> TagEntry {
        let use_rrip = self.use_rrip;
        let set = &mut self.sets[index];
        let t1 = set.t1.len() as i32;

        if t1 > 0 && (t1 > set.p || (t1 == set.p && b2_hit) || set.t2.is_empty()) {
            let replaced = Self::evict_from(&mut set.t1, use_rrip);
            set.b1.push_back(replaced.clone().ghost());
            replaced
        } else {
            let replaced = Self::evict_from(&mut set.t2, use_rrip);
            set.b2.push_back(replaced.clone().ghost());
            replaced
        }
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let index = self.set_index(ctag);
        let associativity = self.associativity as i32;
        let use_rrip = self.use_rrip;
        let mut replaced: Option<TagEntry> = None;

        let b1_pos = position(&self.sets[index].b1, ctag);
        let b2_pos = if b1_pos.is_none() {
            position(&self.sets[index].b2, ctag)
        } else {
            None
        };

        if let Some(pos) = b1_pos {
            // ghost hit in B1: recency is winning, grow p
            let set = &self.sets[index];
            let (b1, b2, p) = (set.b1.len() as i32, set.b2.len() as i32, set.p);
            self.sets[index].p = if b1 == 0 {
                associativity
            } else {
                associativity.min(p + (b2 / b1).max(1))
            };
            replaced = Some(self.replace(index, false));

            let set = &mut self.sets[index];
            let mut entry = set.b1.remove(pos).expect("position valid");
            entry.repl.set(1);
            entry.dirty = dirty || entry.dirty;
            set.t2.push_back(entry);
        } else if let Some(pos) = b2_pos {
            // ghost hit in B2: frequency is winning, shrink p
            let set = &self.sets[index];
            let (b1, b2, p) = (set.b1.len() as i32, set.b2.len() as i32, set.p);
            self.sets[index].p = if b2 == 0 { 0 } else { 0.max(p - (b1 / b2).max(1)) };
            replaced = Some(self.replace(index, true));

            let set = &mut self.sets[index];
            let mut entry = set.b2.remove(pos).expect("position valid");
            entry.repl.set(1);
            entry.dirty = dirty || entry.dirty;
            set.t2.push_back(entry);
        } else {
            // genuinely new block
            let set = &self.sets[index];
            let (t1, t2) = (set.t1.len() as i32, set.t2.len() as i32);
            let (b1, b2) = (set.b1.len() as i32, set.b2.len() as i32);
            assert!(t1 + t2 <= associativity, "more blocks than ways in a set");
            assert!(b1 + b2 <= associativity, "more ghosts than ways in a set");

            let cache_full = t1 + t2 == associativity;
            let directory_full = t1 + t2 + b1 + b2 == 2 * associativity;

            if cache_full {
                if directory_full {
                    let set = &mut self.sets[index];
                    if t1 + b1 >= associativity && !set.b1.is_empty() {
                        Self::evict_from(&mut set.b1, use_rrip);
                    } else {
                        Self::evict_from(&mut set.b2, use_rrip);
                    }
                }

                if t1 == associativity {
                    let set = &mut self.sets[index];
                    let entry = Self::evict_from(&mut set.t1, use_rrip);
                    set.b1.push_back(entry.clone().ghost());
                    replaced = Some(entry);
                } else if t2 == associativity {
                    let set = &mut self.sets[index];
                    let entry = Self::evict_from(&mut set.t2, use_rrip);
                    set.b2.push_back(entry.clone().ghost());
                    replaced = Some(entry);
                } else {
                    replaced = Some(self.replace(index, false));
                }
            }

            let mut entry = TagEntry {
                tag: ctag,
                dirty,
                vcla: request.virtual_block_address(self.block_size),
                pcla: request.physical_block_address(self.block_size),
                app: request.cpu,
                repl: SaturatingCounter::new(REPL_MAX),
            };
            entry.repl.set(1);
            self.sets[index].t1.push_back(entry);
        }

        self.occupancy[request.cpu] += 1;

        if let Some(replaced) = replaced {
            self.occupancy[replaced.app] -= 1;
            self.base.stats.inc(self.c_evictions);

            if replaced.dirty {
                self.base.stats.inc(self.c_dirty_evictions);
                let writeback = MemoryRequest::spawned(
                    self.base.id,
                    Kind::Writeback,
                    request,
                    replaced.vcla,
                    replaced.pcla,
                    self.block_size,
                );
                out.send(Box::new(writeback));
            }
        }
    }
}

impl Default for ArcCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for ArcCache {
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
            "use-rrip" => self.use_rrip = config::parse_bool(component, name, value)?,
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
        self.sets = (0..self.num_sets).map(|_| ArcSet::default()).collect();
        self.occupancy = vec![0; self.base.num_cpus];
        if self.base.num_cpus > 1 {
            self.base.new_log_file("occupancy", "occupancy");
        }
    }

    fn heartbeat(&mut self, _elapsed: u64) {
        if self.base.num_cpus > 1 {
            let occupancy = self.occupancy.iter().map(u32::to_string).join(" ");
            self.base.log("occupancy", format_args!("{occupancy}\n"));
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
                if self.read_block(ctag) {
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
                } else {
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);
                }
                (latency, Some(request))
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_writebacks);
                if !self.mark_dirty(ctag) {
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
        if !self.lookup(ctag) {
            self.insert_block(ctag, false, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::ArcCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> ArcCache {
        let mut cache = ArcCache::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "4").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn fill(cache: &mut ArcCache, addr: u64, out: &mut Outbox) {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        request.serviced = true;
        cache.process_return(Box::new(request), out);
    }

    fn hit(cache: &mut ArcCache, addr: u64, out: &mut Outbox) -> bool {
        let request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        let (_, passed) = cache.process(Box::new(request), out);
        passed.unwrap().serviced
    }

    #[test]
    fn hits_promote_from_t1_to_t2() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        fill(&mut cache, 0x1000, &mut out);
        assert_eq!(cache.sets[cache.set_index(0x1000 / 64)].t1.len(), 1);
        assert!(hit(&mut cache, 0x1000, &mut out));
        let set = &cache.sets[cache.set_index(0x1000 / 64)];
        assert!(set.t1.is_empty());
        assert_eq!(set.t2.len(), 1);
    }

    #[test]
    fn ghost_hit_in_b1_grows_p_and_reinstalls_in_t2() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let stride = u64::from(cache.num_sets) * 64;

        // overflow t1 so its head spills into b1
        for way in 0..5u64 {
            fill(&mut cache, 0x1000 + way * stride, &mut out);
        }
        let index = cache.set_index(0x1000 / 64);
        assert_eq!(cache.sets[index].b1.len(), 1);
        let ghost = cache.sets[index].b1[0].tag;

        let p_before = cache.sets[index].p;
        fill(&mut cache, ghost * 64, &mut out);
        let set = &cache.sets[index];
        assert!(set.p > p_before);
        assert_eq!(set.b1.len(), 1, "replace pushed a new ghost");
        assert!(set.t2.iter().any(|entry| entry.tag == ghost));
    }

    #[test]
    fn list_sizes_stay_bounded() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let stride = u64::from(cache.num_sets) * 64;

        for round in 0..64u64 {
            let addr = 0x1000 + (round % 11) * stride;
            if !hit(&mut cache, addr, &mut out) {
                fill(&mut cache, addr, &mut out);
            }
        }
        let index = cache.set_index(0x1000 / 64);
        let set = &cache.sets[index];
        let resident = set.t1.len() + set.t2.len();
        let ghosts = set.b1.len() + set.b2.len();
        assert!(resident <= 4);
        assert!(resident + ghosts <= 8);
    }
}
