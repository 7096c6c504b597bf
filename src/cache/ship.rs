//! SHiP-IP last-level cache: a signature history counter table indexed by
//! instruction pointer predicts whether an install will see reuse.

use crate::component::{Base, Component, Outbox, Processed};
use crate::counter::{CyclicIndex, SaturatingCounter};
use crate::request::{Kind, MemoryRequest};
use crate::table::PolicyValue;
use crate::tag_store::{TagStore, DUELING_STRIDE};
use crate::{address, config};
use itertools::Itertools;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    dirty: bool,
    vcla: address,
    pcla: address,
    ip: address,
    app: usize,
    reused: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SetInfo {
    leader: bool,
    ship: bool,
    app: u32,
}

pub struct ShipIpCache {
    base: Base,

    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    shct_max: u32,
    use_bimodal: bool,
    no_increment: bool,
    tag_store_latency: u32,
    data_store_latency: u32,
    use_dueling: bool,
    num_dueling_sets: u32,
    psel_max: u32,

    num_sets: u32,
    tags: TagStore<address, TagEntry>,
    /// Signature history counters, by instruction pointer.
    shct: HashMap<address, SaturatingCounter>,
    sets: Vec<SetInfo>,
    psel: Vec<SaturatingCounter>,
    occupancy: Vec<u32>,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
}

impl ShipIpCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "drrip".to_string(),
            shct_max: 3,
            use_bimodal: false,
            no_increment: false,
            tag_store_latency: 6,
            data_store_latency: 15,
            use_dueling: false,
            num_dueling_sets: 32,
            psel_max: 1024,
            num_sets: 0,
            tags: TagStore::new(1, 1, "lru"),
            shct: HashMap::new(),
            sets: Vec::new(),
            psel: Vec::new(),
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

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        let shct = self
            .shct
            .get(&request.ip)
            .expect("signature registered on access");
        let mut priority = if shct.get() == 0 {
            if self.use_bimodal {
                PolicyValue::Bimodal
            } else {
                PolicyValue::Low
            }
        } else {
            PolicyValue::High
        };

        if self.use_dueling {
            let info = self.sets[self.tags.set_index(ctag) as usize];
            if info.leader && info.app as usize == request.cpu {
                if !info.ship {
                    priority = PolicyValue::Bimodal;
                }
            } else if self.psel[request.cpu].get() <= self.psel_max / 2 {
                priority = PolicyValue::Bimodal;
            }
        }

        let entry = TagEntry {
            dirty,
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            ip: request.ip,
            app: request.cpu,
            reused: false,
        };
        self.occupancy[request.cpu] += 1;

        let Some(evicted) = self.tags.insert(ctag, entry, priority).evicted() else {
            return;
        };
        self.occupancy[evicted.value.app] -= 1;
        self.base.stats.inc(self.c_evictions);

        // a line that died without reuse votes its signature down
        if !evicted.value.reused {
            if let Some(counter) = self.shct.get_mut(&evicted.value.ip) {
                counter.decrement();
            }
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

impl Default for ShipIpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for ShipIpCache {
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
            "shct-max" => self.shct_max = config::parse(component, name, value)?,
            "use-bimodal" => self.use_bimodal = config::parse_bool(component, name, value)?,
            "use-dueling" => self.use_dueling = config::parse_bool(component, name, value)?,
            "no-increment" => self.no_increment = config::parse_bool(component, name, value)?,
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
        self.occupancy = vec![0; self.base.num_cpus];
        self.psel = vec![
            SaturatingCounter::with_initial(self.psel_max, self.psel_max / 2);
            self.base.num_cpus
        ];

        self.sets = vec![SetInfo::default(); self.num_sets as usize];
        let mut current = CyclicIndex::new(self.num_sets);
        for app in 0..self.base.num_cpus as u32 {
            for _ in 0..self.num_dueling_sets {
                for ship in [true, false] {
                    self.sets[current.get() as usize] = SetInfo {
                        leader: true,
                        ship,
                        app,
                    };
                    current.add(DUELING_STRIDE);
                }
            }
        }

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

        // make sure the signature exists
        self.shct
            .entry(request.ip)
            .or_insert_with(|| SaturatingCounter::new(self.shct_max));

        match request.kind {
            kind if kind.is_read_class() => {
                self.base.stats.inc(self.c_reads);

                if self.tags.read(ctag, PolicyValue::High).is_some() {
                    self.tags.get_mut(ctag).expect("line present").reused = true;
                    let counter = self.shct.get_mut(&request.ip).expect("registered");
                    if self.no_increment {
                        counter.set(self.shct_max);
                    } else {
                        counter.increment();
                    }
                    request.serviced = true;
                    request.add_latency(latency + u64::from(self.data_store_latency));
                } else {
                    self.base.stats.inc(self.c_misses);
                    request.add_latency(latency);

                    if self.use_dueling {
                        let info = self.sets[self.tags.set_index(ctag) as usize];
                        if info.leader && info.app as usize == request.cpu {
                            if info.ship {
                                self.psel[request.cpu].decrement();
                            } else {
                                self.psel[request.cpu].increment();
                            }
                        }
                    }
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
        self.shct
            .entry(request.ip)
            .or_insert_with(|| SaturatingCounter::new(self.shct_max));
        if !self.tags.contains(ctag) {
            self.insert_block(ctag, false, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::ShipIpCache;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};
    use crate::table::PolicyValue;

    fn cache() -> ShipIpCache {
        let mut cache = ShipIpCache::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.set_param("policy", "dip").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.set_param("use-dueling", "0").unwrap();
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn fill(cache: &mut ShipIpCache, addr: u64, ip: u64, out: &mut Outbox) {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        request.ip = ip;
        request.serviced = true;
        cache.process_return(Box::new(request), out);
    }

    #[test]
    fn unreused_signatures_install_cold() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let stride = u64::from(cache.num_sets) * 64;
        let cold_ip = 0x9999;

        // cycle blocks from one ip through a set without ever rereading
        // them: the signature counter decays to zero
        for round in 0..4u64 {
            fill(&mut cache, 0x1000 + round * stride, cold_ip, &mut out);
        }
        assert_eq!(cache.shct.get(&cold_ip).unwrap().get(), 0);

        // the next install from that ip goes in at low priority: it is the
        // immediate victim of its set
        fill(&mut cache, 0x1000 + 5 * stride, cold_ip, &mut out);
        let ctag = (0x1000 + 5 * stride) / 64;
        let set = cache.tags.set_index(ctag);
        assert_eq!(cache.tags.to_be_evicted(set), Some(ctag));
    }

    #[test]
    fn reuse_trains_the_signature_up() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        let hot_ip = 0x1234;

        fill(&mut cache, 0x2000, hot_ip, &mut out);
        let mut read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x2000, 0x2000, 8, 11);
        read.ip = hot_ip;
        let (_, hit) = cache.process(Box::new(read), &mut out);
        assert!(hit.unwrap().serviced);
        assert_eq!(cache.shct.get(&hot_ip).unwrap().get(), 1);
        assert!(cache
            .tags
            .read((0x2000u64) / 64, PolicyValue::High)
            .is_some());
    }
}
