//! First-level data cache.
//!
//! Unlike the last-level variants this component accepts direct writes:
//! full-block partial writes are coerced into writebacks (and undersized
//! writebacks back into partial writes), plain writes are fire-and-forget
//! dirty marks.

use crate::component::{Base, Component, Outbox, Processed, SimulationLog};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::TagStore;
use crate::{address, config};
use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    prefetched: bool,
    vcla: address,
    pcla: address,
    reuse: u32,
}

#[derive(Debug, Clone, Default)]
struct EvictionData {
    count: u32,
    dirty: u32,
    reuse: Vec<u32>,
}

pub struct DataCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    tag_store_latency: u32,
    data_store_latency: u32,
    virtual_tag: bool,
    serial_lookup: bool,
    eviction_log: bool,
    exclusive: bool,
    forward_fake: bool,
    demote_prefetched_hit: bool,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,

    eviction_data: BTreeMap<address, EvictionData>,
    reuse_histogram: BTreeMap<u32, u64>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writes: stats::Counter,
    c_partial_writes: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_read_misses: stats::Counter,
    c_write_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl DataCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 32768,
            block_size: 64,
            associativity: 2,
            policy: "lru".to_string(),
            tag_store_latency: 1,
            data_store_latency: 2,
            virtual_tag: true,
            serial_lookup: false,
            eviction_log: false,
            exclusive: false,
            forward_fake: false,
            demote_prefetched_hit: false,
            num_sets: 0,
            tags: TagStore::new(1, 1, "lru"),
            eviction_data: BTreeMap::new(),
            reuse_histogram: BTreeMap::new(),
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writes: stats::Counter::default(),
            c_partial_writes: stats::Counter::default(),
            c_writebacks: stats::Counter::default(),
            c_misses: stats::Counter::default(),
            c_read_misses: stats::Counter::default(),
            c_write_misses: stats::Counter::default(),
            c_evictions: stats::Counter::default(),
            c_dirty_evictions: stats::Counter::default(),
        }
    }

    fn block_tag(&self, request: &MemoryRequest) -> address {
        let addr = if self.virtual_tag {
            request.virtual_address
        } else {
            request.physical_address
        };
        addr / u64::from(self.block_size)
    }

    fn hit_latency(&self) -> u64 {
        let serial = if self.serial_lookup {
            u64::from(self.tag_store_latency)
        } else {
            0
        };
        serial + u64::from(self.data_store_latency)
    }

    /// Evict `entry`, recording statistics and spawning a writeback if it
    /// was dirty (or unconditionally in exclusive mode).
    fn evict_block(
        &mut self,
        key: address,
        entry: &TagEntry,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        if self.eviction_log {
            let data = self.eviction_data.entry(key).or_default();
            data.count += 1;
            data.reuse.push(entry.reuse);
            if entry.dirty {
                data.dirty += 1;
            }
            *self.reuse_histogram.entry(entry.reuse).or_insert(0) += 1;
        }
        self.base.stats.inc(self.c_evictions);

        if entry.dirty || self.exclusive {
            if entry.dirty {
                self.base.stats.inc(self.c_dirty_evictions);
            }
            let mut writeback = MemoryRequest::spawned(
                self.base.id,
                Kind::Writeback,
                request,
                entry.vcla,
                entry.pcla,
                self.block_size,
            );
            writeback.dirty_reply = entry.dirty;
            out.send(Box::new(writeback));
        }
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DataCache {
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
            "virtual-tag" => self.virtual_tag = config::parse_bool(component, name, value)?,
            "serial-lookup" => self.serial_lookup = config::parse_bool(component, name, value)?,
            "eviction-log" => self.eviction_log = config::parse_bool(component, name, value)?,
            "exclusive" => self.exclusive = config::parse_bool(component, name, value)?,
            "forward-fake" => self.forward_fake = config::parse_bool(component, name, value)?,
            "demote-ph" => {
                self.demote_prefetched_hit = config::parse_bool(component, name, value)?;
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
        self.c_writes = stats.register("writes", "Write Accesses");
        self.c_partial_writes = stats.register("partialwrites", "Partial Write Accesses");
        self.c_writebacks = stats.register("writebacks", "Writeback Accesses");
        self.c_misses = stats.register("misses", "Total Misses");
        self.c_read_misses = stats.register("readmisses", "Read Misses");
        self.c_write_misses = stats.register("writemisses", "Write Misses");
        self.c_evictions = stats.register("evictions", "Evictions");
        self.c_dirty_evictions = stats.register("dirtyevictions", "Dirty Evictions");
    }

    fn start_simulation(&mut self) {
        self.num_sets = self.size / (self.block_size * self.associativity);
        self.tags = TagStore::new(self.num_sets, self.associativity, &self.policy);
    }

    fn end_simulation(&mut self, log: &mut SimulationLog) {
        self.base.dump_stats(log);
        if !self.eviction_log {
            return;
        }

        let eviction_path = self
            .base
            .sim_folder()
            .join(format!("{}.eviction", self.base.name));
        let mut file = std::fs::File::create(&eviction_path)
            .unwrap_or_else(|err| panic!("cannot write {}: {err}", eviction_path.display()));
        for (block, data) in &self.eviction_data {
            let _ = write!(file, "{block} {} {}", data.count, data.dirty);
            for reuse in &data.reuse {
                let _ = write!(file, " {reuse}");
            }
            let _ = writeln!(file);
        }

        let reuse_path = self
            .base
            .sim_folder()
            .join(format!("{}.reuse", self.base.name));
        let mut file = std::fs::File::create(&reuse_path)
            .unwrap_or_else(|err| panic!("cannot write {}: {err}", reuse_path.display()));
        for (reuse, count) in &self.reuse_histogram {
            let _ = writeln!(file, "{reuse} {count}");
        }
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        self.base.stats.inc(self.c_accesses);

        // size coercions between partial writes and writebacks
        if request.kind == Kind::PartialWrite && request.size == self.block_size {
            request.kind = Kind::Writeback;
        } else if request.kind == Kind::Writeback && request.size < self.block_size {
            request.kind = Kind::PartialWrite;
        }

        let ctag = self.block_tag(&request);
        let tag_latency = u64::from(self.tag_store_latency);

        match request.kind {
            kind if kind.is_read_class() => {
                self.base.stats.inc(self.c_reads);

                if self.tags.read(ctag, PolicyValue::High).is_some() {
                    let latency = self.hit_latency();
                    let entry = self.tags.get_mut(ctag).expect("line just hit");
                    entry.reuse += 1;

                    if entry.prefetched {
                        entry.prefetched = false;
                        if self.demote_prefetched_hit {
                            self.tags.read(ctag, PolicyValue::Low);
                        }
                        if self.forward_fake {
                            let mut fake = MemoryRequest::spawned(
                                self.base.id,
                                Kind::FakeRead,
                                &request,
                                request.virtual_address,
                                request.physical_address,
                                request.size,
                            );
                            fake.ip = request.ip;
                            out.send(Box::new(fake));
                        }
                    }
                    request.serviced = true;
                    request.add_latency(latency);
                } else {
                    self.base.stats.inc(self.c_misses);
                    self.base.stats.inc(self.c_read_misses);
                    request.add_latency(tag_latency);
                }
                (tag_latency, Some(request))
            }

            Kind::Write => {
                self.base.stats.inc(self.c_writes);

                // the processor does not wait for writes; the data latency
                // is hidden
                if self.tags.silent_update(ctag, PolicyValue::High) {
                    self.tags.get_mut(ctag).expect("line present").dirty = true;
                    request.serviced = true;
                } else {
                    self.base.stats.inc(self.c_misses);
                    self.base.stats.inc(self.c_write_misses);
                }
                (tag_latency, Some(request))
            }

            Kind::PartialWrite => {
                self.base.stats.inc(self.c_partial_writes);

                if self.tags.read(ctag, PolicyValue::High).is_some() {
                    self.tags.get_mut(ctag).expect("line present").dirty = true;
                    request.serviced = true;
                    request.add_latency(self.hit_latency());
                } else {
                    self.base.stats.inc(self.c_misses);
                    self.base.stats.inc(self.c_write_misses);
                    request.add_latency(tag_latency);
                }
                (tag_latency, Some(request))
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_writebacks);

                if let Some(entry) = self.tags.get_mut(ctag) {
                    entry.dirty = true;
                } else {
                    let entry = TagEntry {
                        dirty: true,
                        prefetched: false,
                        vcla: request.virtual_block_address(self.block_size),
                        pcla: request.physical_block_address(self.block_size),
                        reuse: 0,
                    };
                    if let Some(evicted) =
                        self.tags.insert(ctag, entry, PolicyValue::High).evicted()
                    {
                        self.evict_block(evicted.key, &evicted.value, &request, out);
                    }
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
        // a writeback of ours has completed
        if request.initiator.is_component(self.base.id) {
            request.destroy = true;
            return (0, Some(request));
        }

        let ctag = self.block_tag(&request);
        if self.tags.contains(ctag) {
            return (0, Some(request));
        }

        let dirty = request.kind.is_direct_write() || request.dirty_reply;
        let entry = TagEntry {
            dirty,
            prefetched: request.kind == Kind::Prefetch,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            reuse: 0,
        };
        request.dirty_reply = false;

        if let Some(evicted) = self.tags.insert(ctag, entry, PolicyValue::High).evicted() {
            self.evict_block(evicted.key, &evicted.value, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::DataCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> DataCache {
        let mut cache = DataCache::new();
        cache.set_param("size", "4096").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn request(kind: Kind, addr: u64, size: u32) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            kind,
            1,
            addr,
            addr,
            size,
            10,
        ))
    }

    #[test]
    fn full_block_partial_write_becomes_writeback() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let (_, passed) = cache.process(request(Kind::PartialWrite, 0x2000, 64), &mut out);
        let passed = passed.unwrap();
        assert_eq!(passed.kind, Kind::Writeback);
        // writebacks install and complete locally
        assert!(passed.serviced);
    }

    #[test]
    fn undersized_writeback_becomes_partial_write() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let (_, passed) = cache.process(request(Kind::Writeback, 0x2000, 8), &mut out);
        let passed = passed.unwrap();
        assert_eq!(passed.kind, Kind::PartialWrite);
        // missed, so it travels on toward the next level
        assert!(!passed.serviced);
    }

    #[test]
    fn write_misses_are_fire_and_forget() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let (_, passed) = cache.process(request(Kind::Write, 0x3000, 8), &mut out);
        // not serviced: flows to the mshr which will complete it
        assert!(!passed.unwrap().serviced);
    }

    #[test]
    fn exclusive_mode_writes_back_clean_victims() {
        let mut cache = cache();
        cache.exclusive = true;
        let mut out = Outbox::new(0);

        let sets = u64::from(cache.num_sets) * 64;
        for way in 0..3u64 {
            let mut fill = request(Kind::Read, 0x1000 + way * sets, 8);
            fill.serviced = true;
            cache.process_return(fill, &mut out);
        }
        let clean_writeback = out
            .sends
            .iter()
            .find(|r| r.kind == Kind::Writeback)
            .expect("clean eviction still writes back in exclusive mode");
        assert!(!clean_writeback.dirty_reply);
    }
}
