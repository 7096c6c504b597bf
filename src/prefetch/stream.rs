//! Stream prefetcher in the IBM Power style.
//!
//! A miss allocates a stream entry that first gathers direction evidence
//! within a training window; once trained it maintains a monitor window
//! `[sp, ep]` and keeps the prefetch head up to `distance` blocks ahead of
//! the demand stream. Optionally it emits fake reads for the span between
//! the previous demand and the new stream position, so downstream accuracy
//! predictors can see the implied demand use, and drains a trained stream's
//! outstanding span as fake reads when the entry is evicted.

use crate::component::{Base, Component, Outbox, Processed};
use crate::config;
use crate::request::{Kind, MemoryRequest};
use crate::table::{PolicyValue, Table};
use crate::address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
    None,
}

impl Direction {
    fn step(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
            Direction::None => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct StreamEntry {
    /// Miss that allocated the stream.
    alloc_address: address,
    app: usize,

    /// Start (demand side) and end (prefetch head) of the monitor window.
    sp: address,
    ep: address,
    psp: address,
    pep: address,

    /// Demand-use tracking for fake reads.
    last_demand_v: address,
    last_demand_p: address,

    train_hits: u32,
    trained: bool,
    direction: Direction,
}

pub struct StreamPrefetcher {
    base: Base,

    block_size: u32,
    prefetch_on_write: bool,
    table_size: u32,
    table_policy: String,
    num_trains: u32,
    train_distance: u32,
    distance: u32,
    degree: u32,
    fake: bool,

    table: Table<u32, StreamEntry>,
    running_index: u32,
    train_span: u64,
    prefetch_span: u64,

    c_prefetches: stats::Counter,
}

impl StreamPrefetcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            block_size: 64,
            prefetch_on_write: false,
            table_size: 16,
            table_policy: "lru".to_string(),
            num_trains: 2,
            train_distance: 16,
            distance: 24,
            degree: 4,
            fake: false,
            table: Table::new(1, "lru"),
            running_index: 0,
            train_span: 0,
            prefetch_span: 0,
            c_prefetches: stats::Counter::default(),
        }
    }

    /// Stream whose window (or training span) covers the block address.
    fn matching_stream(&self, vcla: address) -> Option<u32> {
        for (_, key, entry) in self.table.iter() {
            if !entry.trained {
                if entry.alloc_address.abs_diff(vcla) < self.train_span {
                    return Some(key);
                }
            } else {
                let (lo, hi) = match entry.direction {
                    Direction::Backward => (entry.ep, entry.sp),
                    _ => (entry.sp, entry.ep),
                };
                if lo <= vcla && vcla <= hi {
                    return Some(key);
                }
            }
        }
        None
    }

    fn send_fake(&self, parent: &MemoryRequest, v: address, p: address, id: u32, out: &mut Outbox) {
        let mut fake = MemoryRequest::spawned(
            self.base.id,
            Kind::FakeRead,
            parent,
            v,
            p,
            self.block_size,
        );
        fake.prefetcher_id = id;
        out.send(Box::new(fake));
    }

    /// Drain an evicted trained stream's window as fake reads.
    fn drain_evicted(
        &self,
        evicted: &StreamEntry,
        slot: u32,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        if !self.fake || !evicted.trained {
            return;
        }
        let block = u64::from(self.block_size);
        let span = match evicted.direction {
            Direction::Forward if evicted.sp < evicted.ep => evicted.ep - evicted.sp,
            Direction::Backward if evicted.sp > evicted.ep => evicted.sp - evicted.ep,
            _ => return,
        };
        let count = span / block;
        if count > u64::from(self.distance) {
            return;
        }
        let step = evicted.direction.step() * i64::from(self.block_size);
        let mut v = evicted.sp as i64;
        let mut p = evicted.psp as i64;
        for _ in 0..count {
            self.send_fake(request, v as address, p as address, slot, out);
            v += step;
            p += step;
        }
    }
}

impl Default for StreamPrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for StreamPrefetcher {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "block-size" => self.block_size = config::parse(component, name, value)?,
            "prefetch-on-write" => {
                self.prefetch_on_write = config::parse_bool(component, name, value)?;
            }
            "fake" => self.fake = config::parse_bool(component, name, value)?,
            "table-size" => self.table_size = config::parse(component, name, value)?,
            "table-policy" => self.table_policy = config::parse_policy(component, name, value)?,
            "train-distance" => self.train_distance = config::parse(component, name, value)?,
            "num-trains" => self.num_trains = config::parse(component, name, value)?,
            "distance" => self.distance = config::parse(component, name, value)?,
            "degree" => self.degree = config::parse(component, name, value)?,
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
        self.running_index = 0;
        self.train_span = u64::from(self.train_distance) * u64::from(self.block_size);
        self.prefetch_span = u64::from(self.distance) * u64::from(self.block_size);
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        if !super::trains(request.kind, self.prefetch_on_write) {
            return (0, Some(request));
        }

        let vcla = request.virtual_block_address(self.block_size);
        let pcla = request.physical_block_address(self.block_size);
        let block = u64::from(self.block_size);

        let Some(key) = self.matching_stream(vcla) else {
            // no covering stream: allocate a new entry
            let entry = StreamEntry {
                alloc_address: vcla,
                app: request.cpu,
                sp: vcla,
                ep: vcla,
                psp: pcla,
                pep: pcla,
                last_demand_v: vcla,
                last_demand_p: pcla,
                train_hits: 0,
                trained: false,
                direction: Direction::None,
            };
            let slot = self.running_index;
            self.running_index += 1;
            if let Some(evicted) = self.table.insert(slot, entry, PolicyValue::High).evicted() {
                self.drain_evicted(&evicted.value, evicted.index, &request, out);
            }
            return (0, Some(request));
        };

        // refresh replacement state, then mutate the stream
        self.table.read(key, PolicyValue::High);
        let slot = self
            .table
            .iter()
            .find(|(_, k, _)| *k == key)
            .map(|(index, _, _)| index)
            .expect("stream present");
        let entry = self.table.get_mut(key).expect("stream present");

        if !entry.trained {
            let direction = if entry.alloc_address < vcla {
                Direction::Forward
            } else {
                Direction::Backward
            };
            if entry.direction == direction {
                entry.train_hits += 1;
                let extends = match direction {
                    Direction::Forward => vcla > entry.ep,
                    _ => vcla < entry.ep,
                };
                if extends {
                    entry.ep = vcla;
                    entry.pep = pcla;
                }
            } else {
                entry.train_hits = 1;
                entry.direction = direction;
                entry.ep = vcla;
                entry.pep = pcla;
            }
            if entry.train_hits >= self.num_trains {
                entry.trained = true;
            }
        }

        if entry.trained {
            request.demand_prefetched = true;
            request.demand_prefetcher_id = slot;

            let step = entry.direction.step() * i64::from(self.block_size);

            // the demand catches the window up
            entry.sp = vcla;
            entry.psp = pcla;

            let max_prefetches = match entry.direction {
                Direction::Forward => {
                    let max_address = entry.sp + self.prefetch_span + block;
                    (max_address.saturating_sub(entry.ep)) / block
                }
                Direction::Backward => {
                    let min_address = entry.sp - (self.prefetch_span + block);
                    (entry.ep.saturating_sub(min_address)) / block
                }
                Direction::None => 0,
            };
            let count = max_prefetches.min(u64::from(self.degree));

            for _ in 0..count {
                entry.ep = (entry.ep as i64 + step) as address;
                entry.pep = (entry.pep as i64 + step) as address;
                let mut prefetch = MemoryRequest::spawned(
                    self.base.id,
                    Kind::Prefetch,
                    &request,
                    entry.ep,
                    entry.pep,
                    self.block_size,
                );
                prefetch.prefetcher_id = slot;
                out.send(Box::new(prefetch));
            }
            self.base.stats.add(self.c_prefetches, count);

            // fake reads for the span the demand stream has consumed
            if self.fake {
                let gap_start_v = entry.last_demand_v as i64 + step;
                let gap_start_p = entry.last_demand_p as i64 + step;
                let gap = match entry.direction {
                    Direction::Forward => (vcla as i64 - gap_start_v) / i64::from(self.block_size),
                    Direction::Backward => (gap_start_v - vcla as i64) / i64::from(self.block_size),
                    Direction::None => 0,
                };
                if gap >= 0 && gap <= i64::from(self.distance) {
                    let mut v = gap_start_v;
                    let mut p = gap_start_p;
                    let fakes: Vec<(address, address)> = (0..gap)
                        .map(|_| {
                            let pair = (v as address, p as address);
                            v += step;
                            p += step;
                            pair
                        })
                        .collect();
                    for (fake_v, fake_p) in fakes {
                        self.send_fake(&request, fake_v, fake_p, slot, out);
                    }
                }
            }

            let entry = self.table.get_mut(key).expect("stream present");
            entry.last_demand_v = vcla;
            entry.last_demand_p = pcla;

            // keep the window no wider than the prefetch distance
            match entry.direction {
                Direction::Forward if entry.ep - entry.sp > self.prefetch_span => {
                    entry.sp = entry.ep - self.prefetch_span;
                }
                Direction::Backward if entry.sp - entry.ep > self.prefetch_span => {
                    entry.sp = entry.ep + self.prefetch_span;
                }
                _ => {}
            }

            // invalidate streams that now overlap this one
            let window = self.table.get(key).expect("stream present").clone();
            let overlapping: Vec<u32> = self
                .table
                .iter()
                .filter(|(_, k, other)| {
                    *k != key && {
                        let (lo, hi) = match window.direction {
                            Direction::Backward => (window.ep, window.sp),
                            _ => (window.sp, window.ep),
                        };
                        (other.sp >= lo && other.sp <= hi) || (other.ep >= lo && other.ep <= hi)
                    }
                })
                .map(|(_, k, _)| k)
                .collect();
            for stale in overlapping {
                self.table.invalidate(stale);
            }
        }

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
    use super::StreamPrefetcher;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn demand(addr: u64) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            Kind::Read,
            1,
            addr,
            addr,
            8,
            10,
        ))
    }

    fn prefetcher(fake: bool) -> StreamPrefetcher {
        let mut prefetcher = StreamPrefetcher::new();
        prefetcher.fake = fake;
        prefetcher.init_stats();
        prefetcher.start_simulation();
        prefetcher
    }

    #[test]
    fn forward_stream_trains_and_prefetches() {
        let mut prefetcher = prefetcher(false);
        let mut out = Outbox::new(0);

        prefetcher.process(demand(0x10000), &mut out);
        assert!(out.sends.is_empty());
        prefetcher.process(demand(0x10040), &mut out);
        assert!(out.sends.is_empty(), "one hit is not trained");
        prefetcher.process(demand(0x10080), &mut out);

        let prefetches: Vec<u64> = out
            .sends
            .iter()
            .filter(|r| r.kind == Kind::Prefetch)
            .map(|r| r.virtual_address)
            .collect();
        assert_eq!(prefetches.len(), 4);
        assert!(prefetches.iter().all(|&addr| addr > 0x10080));
        // marks the triggering demand for downstream predictors
        assert_eq!(out.sends.len(), 4);
    }

    #[test]
    fn backward_stream_prefetches_downward() {
        let mut prefetcher = prefetcher(false);
        let mut out = Outbox::new(0);

        prefetcher.process(demand(0x20000), &mut out);
        prefetcher.process(demand(0x1ffc0), &mut out);
        prefetcher.process(demand(0x1ff80), &mut out);

        let prefetches: Vec<u64> = out
            .sends
            .iter()
            .filter(|r| r.kind == Kind::Prefetch)
            .map(|r| r.virtual_address)
            .collect();
        assert!(!prefetches.is_empty());
        assert!(prefetches.iter().all(|&addr| addr < 0x1ff80));
    }

    #[test]
    fn fake_reads_cover_the_demand_gap() {
        let mut prefetcher = prefetcher(true);
        let mut out = Outbox::new(0);

        prefetcher.process(demand(0x30000), &mut out);
        prefetcher.process(demand(0x30040), &mut out);
        prefetcher.process(demand(0x30080), &mut out);
        out.sends.clear();

        // skip two blocks: the gap is covered by fake reads
        prefetcher.process(demand(0x30140), &mut out);
        let fakes: Vec<u64> = out
            .sends
            .iter()
            .filter(|r| r.kind == Kind::FakeRead)
            .map(|r| r.virtual_address)
            .collect();
        assert_eq!(fakes, vec![0x300c0, 0x30100]);
    }

    #[test]
    fn demand_is_tagged_with_the_stream_slot() {
        let mut prefetcher = prefetcher(false);
        let mut out = Outbox::new(0);
        prefetcher.process(demand(0x40000), &mut out);
        prefetcher.process(demand(0x40040), &mut out);
        let request = demand(0x40080);
        let (_, passed) = prefetcher.process(request, &mut out);
        assert!(passed.unwrap().demand_prefetched);
    }
}
