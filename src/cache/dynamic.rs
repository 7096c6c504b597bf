//! Last-level cache over a set-dueling tag store: insertion priority is
//! whatever the per-application PSEL race currently favours.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::SetDuelingTagStore;
use crate::{address, config};
use itertools::Itertools;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    app: usize,
}

pub struct DynamicLlc {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    tag_store_latency: u32,
    data_store_latency: u32,
    num_dueling_sets: u32,
    max_psel: u32,

    num_sets: u32,
    tags: Option<SetDuelingTagStore<address, TagEntry>>,
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

impl DynamicLlc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "dip".to_string(),
            tag_store_latency: 8,
            data_store_latency: 20,
            num_dueling_sets: 32,
            max_psel: 1024,
            num_sets: 0,
            tags: None,
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
        let entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
        };
        self.occupancy[request.cpu] += 1;

        let tags = self.tags.as_mut().expect("started");
        // dirty installs are not demand behaviour; keep them out of the race
        let update_psel = !dirty;
        let Some(evicted) = tags
            .insert(
                request.cpu as u32,
                ctag,
                entry,
                update_psel,
                PolicyValue::High,
                PolicyValue::Bimodal,
            )
            .evicted()
        else {
            return;
        };
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

impl Default for DynamicLlc {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DynamicLlc {
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
            "num-dueling-sets" => self.num_dueling_sets = config::parse(component, name, value)?,
            "max-psel-value" => self.max_psel = config::parse(component, name, value)?,
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
        self.tags = Some(SetDuelingTagStore::new(
            self.base.num_cpus as u32,
            self.num_sets,
            self.associativity,
            &self.policy,
            self.num_dueling_sets,
            self.max_psel,
        ));
        self.occupancy = vec![0; self.base.num_cpus];
        self.hits = vec![0; self.base.num_cpus];
        self.misses = vec![0; self.base.num_cpus];
        self.base.new_log_file("occupancy", "occupancy");
        self.base.new_log_file("policy", "policy");
    }

    fn heartbeat(&mut self, _elapsed: u64) {
        if self.base.num_cpus > 1 {
            let occupancy = self.occupancy.iter().map(u32::to_string).join(" ");
            let cycle = self.base.local_cycle;
            self.base
                .log("occupancy", format_args!("{cycle} {occupancy}\n"));
        }
        let tags = self.tags.as_ref().expect("started");
        let winners = (0..self.base.num_cpus)
            .map(|cpu| tags.policy(cpu as u32).to_string())
            .join(" ");
        self.base.log("policy", format_args!("{winners}\n"));
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
                let tags = self.tags.as_mut().expect("started");
                if tags.read(ctag, PolicyValue::High).is_some() {
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
                let tags = self.tags.as_mut().expect("started");
                if let Some(entry) = tags.get_mut(ctag) {
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
        if !self.tags.as_ref().expect("started").contains(ctag) {
            self.insert_block(ctag, false, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicLlc;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    #[test]
    fn installs_and_hits() {
        let mut llc = DynamicLlc::new();
        llc.set_param("size", "256").unwrap();
        llc.set_param("num-dueling-sets", "4").unwrap();
        llc.base_mut().num_cpus = 1;
        llc.init_stats();
        llc.start_simulation();
        let mut out = Outbox::new(0);

        let mut fill = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x8000, 0x8000, 8, 5);
        fill.serviced = true;
        llc.process_return(Box::new(fill), &mut out);

        let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x8000, 0x8000, 8, 6);
        let (_, hit) = llc.process(Box::new(read), &mut out);
        assert!(hit.unwrap().serviced);
    }
}
