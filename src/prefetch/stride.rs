//! Per-IP stride prefetcher: once an instruction pointer shows a stable
//! stride it prefetches up to `degree` blocks ahead, never running more
//! than `distance` strides past the demand stream.

use crate::component::{Base, Component, Outbox, Processed};
use crate::config;
use crate::request::{Kind, MemoryRequest};
use crate::table::{PolicyValue, Table};
use crate::address;

#[derive(Debug, Clone, Default)]
struct StrideEntry {
    /// Last demand block addresses.
    vaddr: address,
    paddr: address,
    /// Last prefetched block addresses.
    vpref: address,
    ppref: address,
    stride: i64,
    train_hits: u32,
    trained: bool,
}

pub struct StridePrefetcher {
    base: Base,

    degree: u32,
    block_size: u32,
    prefetch_on_write: bool,
    table_size: u32,
    table_policy: String,
    num_trains: u32,
    train_distance: u32,
    distance: u32,

    table: Table<address, StrideEntry>,

    c_prefetches: stats::Counter,
}

impl StridePrefetcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            degree: 4,
            block_size: 64,
            prefetch_on_write: false,
            table_size: 16,
            table_policy: "lru".to_string(),
            num_trains: 2,
            train_distance: 16,
            distance: 24,
            table: Table::new(1, "lru"),
            c_prefetches: stats::Counter::default(),
        }
    }
}

impl Default for StridePrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for StridePrefetcher {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "degree" => self.degree = config::parse(component, name, value)?,
            "block-size" => self.block_size = config::parse(component, name, value)?,
            "prefetch-on-write" => {
                self.prefetch_on_write = config::parse_bool(component, name, value)?;
            }
            "table-size" => self.table_size = config::parse(component, name, value)?,
            "table-policy" => self.table_policy = config::parse_policy(component, name, value)?,
            "train-distance" => self.train_distance = config::parse(component, name, value)?,
            "num-trains" => self.num_trains = config::parse(component, name, value)?,
            "distance" => self.distance = config::parse(component, name, value)?,
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
        self.c_prefetches = self
            .base
            .stats
            .register("num_prefetches", "Number of prefetches issued");
    }

    fn start_simulation(&mut self) {
        self.table = Table::new(self.table_size, &self.table_policy);
    }

    fn process(&mut self, request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        if !super::trains(request.kind, self.prefetch_on_write) {
            return (0, Some(request));
        }

        let vcla = request.virtual_block_address(self.block_size);
        let pcla = request.physical_block_address(self.block_size);
        let ip = request.ip;
        let block = i64::from(self.block_size);

        if self.table.read(ip, PolicyValue::High).is_none() {
            let entry = StrideEntry {
                vaddr: vcla,
                paddr: pcla,
                ..StrideEntry::default()
            };
            self.table.insert(ip, entry, PolicyValue::High);
            return (0, Some(request));
        }

        let entry = self.table.get_mut(ip).expect("read hit");

        // stride change restarts training
        let stride = vcla as i64 - entry.vaddr as i64;
        let stride = stride / block;
        if entry.stride != stride {
            entry.train_hits = 0;
            entry.trained = false;
            entry.stride = stride;
        }
        entry.vaddr = vcla;
        entry.paddr = pcla;

        if !entry.trained {
            entry.train_hits += 1;
            entry.vpref = vcla;
            entry.ppref = pcla;
        }
        if entry.train_hits >= self.num_trains {
            entry.trained = true;
        }
        if entry.stride == 0 || !entry.trained {
            return (0, Some(request));
        }

        // clamp to the prefetch window ahead of the demand stream
        let step = entry.stride * block;
        let max_address = entry.vaddr as i64 + i64::from(self.distance + 1) * step;
        let max_prefetches = (max_address - entry.vpref as i64) / step;
        let count = max_prefetches.clamp(0, i64::from(self.degree)) as u32;

        let mut issued = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entry.vpref = (entry.vpref as i64 + step) as address;
            entry.ppref = (entry.ppref as i64 + step) as address;
            issued.push((entry.vpref, entry.ppref));
        }
        for (vpref, ppref) in issued {
            let prefetch = MemoryRequest::spawned(
                self.base.id,
                Kind::Prefetch,
                &request,
                vpref,
                ppref,
                self.block_size,
            );
            out.send(Box::new(prefetch));
        }
        self.base.stats.add(self.c_prefetches, u64::from(count));

        (0, Some(request))
    }

    fn process_return(&mut self, mut request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        if request.initiator.is_component(self.base.id) {
            request.destroy = true;
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::StridePrefetcher;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn demand(ip: u64, addr: u64) -> Box<MemoryRequest> {
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, addr, addr, 8, 10);
        request.ip = ip;
        Box::new(request)
    }

    fn prefetcher() -> StridePrefetcher {
        let mut prefetcher = StridePrefetcher::new();
        prefetcher.init_stats();
        prefetcher.start_simulation();
        prefetcher
    }

    #[test]
    fn trains_on_consistent_stride_and_prefetches_ahead() {
        let mut prefetcher = prefetcher();
        let mut out = Outbox::new(0);

        // stride of 2 blocks (0x80)
        prefetcher.process(demand(0x99, 0x1000), &mut out);
        prefetcher.process(demand(0x99, 0x1080), &mut out);
        assert!(out.sends.is_empty(), "not trained yet");
        prefetcher.process(demand(0x99, 0x1100), &mut out);

        assert_eq!(out.sends.len(), 4);
        assert_eq!(out.sends[0].virtual_address, 0x1180);
        assert_eq!(out.sends[1].virtual_address, 0x1200);
        assert_eq!(out.sends[3].kind, Kind::Prefetch);
    }

    #[test]
    fn stride_change_retrains() {
        let mut prefetcher = prefetcher();
        let mut out = Outbox::new(0);

        prefetcher.process(demand(0x7, 0x1000), &mut out);
        prefetcher.process(demand(0x7, 0x1040), &mut out);
        prefetcher.process(demand(0x7, 0x1080), &mut out);
        assert!(!out.sends.is_empty());
        out.sends.clear();

        // direction flips: training restarts, no prefetches
        prefetcher.process(demand(0x7, 0x0800), &mut out);
        assert!(out.sends.is_empty());
    }

    #[test]
    fn zero_stride_never_prefetches() {
        let mut prefetcher = prefetcher();
        let mut out = Outbox::new(0);
        for _ in 0..4 {
            prefetcher.process(demand(0x5, 0x2000), &mut out);
        }
        assert!(out.sends.is_empty());
    }
}
