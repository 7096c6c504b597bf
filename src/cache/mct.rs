//! Last-level cache with a per-set miss counter tag: each set remembers the
//! last tag it evicted, and a block that comes straight back is installed
//! with high priority.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::TagStore;
use crate::{address, config};

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,
}

pub struct MctCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    tag_store_latency: u32,
    data_store_latency: u32,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,
    /// Last evicted tag per set.
    miss_tags: Vec<address>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl MctCache {
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
            num_sets: 0,
            tags: TagStore::new(1, 1, "lru"),
            miss_tags: Vec::new(),
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
        let priority = if self.miss_tags[set as usize] == ctag {
            PolicyValue::High
        } else {
            PolicyValue::Bimodal
        };

        let entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
        };

        let Some(evicted) = self.tags.insert(ctag, entry, priority).evicted() else {
            return;
        };
        self.base.stats.inc(self.c_evictions);

        let evicted_set = self.tags.set_index(evicted.key);
        self.miss_tags[evicted_set as usize] = evicted.key;

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

impl Default for MctCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for MctCache {
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
        self.miss_tags = vec![0; self.num_sets as usize];
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
                if self.tags.read(ctag, PolicyValue::High).is_some() {
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
    use super::MctCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    #[test]
    fn bounced_tag_returns_with_high_priority() {
        let mut cache = MctCache::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.set_param("policy", "dip").unwrap();
        cache.init_stats();
        cache.start_simulation();
        let mut out = Outbox::new(0);

        let stride = u64::from(cache.num_sets) * 64;
        let mut fill = |cache: &mut MctCache, addr: u64| {
            let mut request =
                MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
            request.serviced = true;
            cache.process_return(Box::new(request), &mut out);
        };

        fill(&mut cache, 0x1000);
        fill(&mut cache, 0x1000 + stride);
        fill(&mut cache, 0x1000 + 2 * stride);

        let bounced = 0x1000 / 64;
        let set = cache.tags.set_index(bounced);
        assert_eq!(cache.miss_tags[set as usize], bounced);

        // the bounced tag reinstalls protected
        fill(&mut cache, 0x1000);
        assert!(cache.tags.contains(bounced));
        assert_ne!(cache.tags.to_be_evicted(set), Some(bounced));
    }
}
