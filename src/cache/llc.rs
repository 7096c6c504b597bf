//! Baseline last-level cache.

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

pub struct BaselineLlc {
    base: Base,

    /// Cache size in KB.
    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    policy_value: u32,
    tag_store_latency: u32,
    data_store_latency: u32,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,
    pval: PolicyValue,

    hits: Vec<u32>,
    misses: Vec<u32>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl BaselineLlc {
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
            tags: TagStore::new(1, 1, "lru"),
            pval: PolicyValue::High,
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
        request.virtual_address / u64::from(self.block_size)
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
        };

        let Some(evicted) = self.tags.insert(ctag, entry, self.pval).evicted() else {
            return;
        };
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

impl Default for BaselineLlc {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for BaselineLlc {
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
    }

    fn start_simulation(&mut self) {
        self.num_sets = (self.size * 1024) / (self.block_size * self.associativity);
        self.tags = TagStore::new(self.num_sets, self.associativity, &self.policy);
        self.pval = PolicyValue::from_level(self.policy_value);
        self.hits = vec![0; self.base.num_cpus];
        self.misses = vec![0; self.base.num_cpus];
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
                    self.insert_block(ctag, true, &request, out);
                }
                request.serviced = true;
                (latency, Some(request))
            }

            // demand-use hints carry no data; nothing to do here
            Kind::FakeRead => {
                request.serviced = true;
                (0, Some(request))
            }

            kind => unreachable!("{}: unexpected request kind {kind:?}", self.base.name),
        }
    }

    fn process_return(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        // our own writeback came back: it has done its job
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
    use super::BaselineLlc;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    pub(crate) fn small_llc() -> BaselineLlc {
        let mut llc = BaselineLlc::new();
        llc.set_param("size", "64").unwrap();
        llc.set_param("associativity", "4").unwrap();
        llc.base_mut().num_cpus = 1;
        llc.init_stats();
        llc.start_simulation();
        llc
    }

    fn read_at(addr: u64) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            Kind::Read,
            2,
            addr,
            addr,
            8,
            50,
        ))
    }

    #[test]
    fn miss_then_fill_then_hit() {
        let mut llc = small_llc();
        let mut out = Outbox::new(0);

        let (_, missed) = llc.process(read_at(0x1000), &mut out);
        let mut reply = missed.unwrap();
        assert!(!reply.serviced);

        // the reply installs the line
        reply.serviced = true;
        llc.process_return(reply, &mut out);

        let (_, hit) = llc.process(read_at(0x1000), &mut out);
        assert!(hit.unwrap().serviced);
    }

    #[test]
    fn own_writeback_destroyed_on_return() {
        let mut llc = small_llc();
        llc.base_mut().id = 4;
        let mut out = Outbox::new(4);

        // install a dirty line, then force an eviction storm through the
        // same set to make it write back
        let mut writeback =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Writeback, 2, 0x1000, 0x1000, 64, 1);
        writeback.icount = 3;
        llc.process(Box::new(writeback), &mut out);

        let sets = u64::from(llc.num_sets) * 64;
        for way in 1..=4u64 {
            let mut fill = read_at(0x1000 + way * sets);
            fill.serviced = true;
            llc.process_return(fill, &mut out);
        }

        let spawned = out
            .sends
            .iter()
            .position(|r| r.kind == Kind::Writeback)
            .expect("dirty eviction spawned a writeback");
        let mut spawned = out.sends.remove(spawned);
        assert_eq!(spawned.initiator, Initiator::Component(4));

        spawned.serviced = true;
        let (_, back) = llc.process_return(spawned, &mut out);
        assert!(back.unwrap().destroy);
    }
}
