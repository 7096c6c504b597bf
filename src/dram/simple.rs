//! Lightweight memory controller: a single channel of open-row banks with
//! flat row-hit / row-conflict latencies, bus turnaround penalties and
//! FR-FCFS drain-when-full scheduling. For runs that do not need the full
//! timing model.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::{address, config, Cycle};

pub struct SimpleMemoryController {
    base: Base,

    num_banks: u32,
    /// Row size in bytes.
    row_size: u32,
    row_hit_latency: u32,
    row_conflict_latency: u32,
    read_to_write_latency: u32,
    write_to_read_latency: u32,
    num_write_buffer_entries: u32,
    channel_delay: u32,
    bus_processor_ratio: u32,

    read_queue: Vec<Box<MemoryRequest>>,
    write_queue: Vec<Box<MemoryRequest>>,
    last_op: Kind,
    open_rows: Vec<address>,
    draining: bool,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writes: stats::Counter,
    c_row_hits: stats::Counter,
    c_row_conflicts: stats::Counter,
    c_read_to_writes: stats::Counter,
    c_write_to_reads: stats::Counter,
}

impl SimpleMemoryController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            num_banks: 8,
            row_size: 8192,
            row_hit_latency: 14,
            row_conflict_latency: 34,
            read_to_write_latency: 2,
            write_to_read_latency: 6,
            num_write_buffer_entries: 64,
            channel_delay: 4,
            bus_processor_ratio: 6,
            read_queue: Vec::new(),
            write_queue: Vec::new(),
            last_op: Kind::Read,
            open_rows: Vec::new(),
            draining: false,
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writes: stats::Counter::default(),
            c_row_hits: stats::Counter::default(),
            c_row_conflicts: stats::Counter::default(),
            c_read_to_writes: stats::Counter::default(),
            c_write_to_reads: stats::Counter::default(),
        }
    }

    fn bank_and_row(&self, request: &MemoryRequest) -> (usize, address) {
        let logical_row = request.virtual_address / u64::from(self.row_size);
        let bank = (logical_row % u64::from(self.num_banks)) as usize;
        (bank, logical_row / u64::from(self.num_banks))
    }

    fn is_row_hit(&self, request: &MemoryRequest) -> bool {
        let (bank, row) = self.bank_and_row(request);
        self.open_rows[bank] == row
    }

    /// FR-FCFS with drain-when-full: writes drain as a batch once their
    /// queue fills; within a queue, the first row hit wins, else the
    /// oldest request.
    fn next_request(&mut self) -> Option<Box<MemoryRequest>> {
        if self.write_queue.len() >= self.num_write_buffer_entries as usize {
            self.draining = true;
        }

        if self.draining {
            if self.write_queue.is_empty() {
                self.draining = false;
            } else {
                let position = (0..self.write_queue.len())
                    .find(|&i| self.is_row_hit(&self.write_queue[i]))
                    .unwrap_or(0);
                return Some(self.write_queue.remove(position));
            }
        }

        if self.read_queue.is_empty() {
            return None;
        }
        let position = (0..self.read_queue.len())
            .find(|&i| self.is_row_hit(&self.read_queue[i]))
            .unwrap_or(0);
        Some(self.read_queue.remove(position))
    }

    /// Service one request: turnaround penalty plus row hit or conflict
    /// latency. Returns the busy cycles for the channel.
    fn service(&mut self, request: &mut MemoryRequest) -> Cycle {
        self.base.stats.inc(self.c_accesses);

        let mut latency = 0u64;
        let mut turnaround = 0u64;
        match request.kind {
            kind if kind.is_read_class() => {
                self.base.stats.inc(self.c_reads);
                if self.last_op == Kind::Writeback {
                    self.base.stats.inc(self.c_write_to_reads);
                    latency += u64::from(self.write_to_read_latency);
                    turnaround = u64::from(self.write_to_read_latency);
                }
            }
            Kind::Writeback => {
                self.base.stats.inc(self.c_writes);
                if self.last_op == Kind::Read {
                    self.base.stats.inc(self.c_read_to_writes);
                    latency += u64::from(self.read_to_write_latency);
                    turnaround = u64::from(self.read_to_write_latency);
                }
            }
            kind => panic!("{}: invalid request kind {kind:?}", self.base.name),
        }
        self.last_op = if request.kind == Kind::Writeback {
            Kind::Writeback
        } else {
            Kind::Read
        };

        let (bank, row) = self.bank_and_row(request);
        if self.open_rows[bank] == row {
            self.base.stats.inc(self.c_row_hits);
            latency += u64::from(self.row_hit_latency);
        } else {
            self.base.stats.inc(self.c_row_conflicts);
            latency += u64::from(self.row_conflict_latency);
            self.open_rows[bank] = row;
        }

        request.add_latency(latency);
        request.serviced = true;
        u64::from(self.channel_delay) + turnaround
    }
}

impl Default for SimpleMemoryController {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for SimpleMemoryController {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "num-banks" => self.num_banks = config::parse(component, name, value)?,
            "row-size" => self.row_size = config::parse(component, name, value)?,
            "num-write-buffer-entries" => {
                self.num_write_buffer_entries = config::parse(component, name, value)?;
            }
            "scheduling-algo" => {
                if value != "frfcfs-dwf" {
                    return Err(config::Error::InvalidValue {
                        component: component.clone(),
                        parameter: name.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "row-hit-latency" => self.row_hit_latency = config::parse(component, name, value)?,
            "row-conflict-latency" => {
                self.row_conflict_latency = config::parse(component, name, value)?;
            }
            "read-to-write-latency" => {
                self.read_to_write_latency = config::parse(component, name, value)?;
            }
            "write-to-read-latency" => {
                self.write_to_read_latency = config::parse(component, name, value)?;
            }
            "channel-delay" => self.channel_delay = config::parse(component, name, value)?,
            "bus-processor-ratio" => {
                self.bus_processor_ratio = config::parse(component, name, value)?;
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
        self.c_row_hits = stats.register("rowhits", "Row Buffer Hits");
        self.c_row_conflicts = stats.register("rowconflicts", "Row Buffer Conflicts");
        self.c_read_to_writes = stats.register("readtowrites", "Read to Write Switches");
        self.c_write_to_reads = stats.register("writetoreads", "Write to Read Switches");
    }

    fn start_simulation(&mut self) {
        self.open_rows = vec![0; self.num_banks as usize];
        self.draining = false;
        self.last_op = Kind::Read;

        let ratio = self.bus_processor_ratio;
        self.row_hit_latency *= ratio;
        self.row_conflict_latency *= ratio;
        self.read_to_write_latency *= ratio;
        self.write_to_read_latency *= ratio;
        self.channel_delay *= ratio;
    }

    /// Arrivals are sorted into read/write queues; the scheduler then
    /// serves them in FR-FCFS-DWF order while the channel keeps up with
    /// the simulator.
    fn drain(&mut self, sim_now: Cycle, out: &mut Outbox) {
        while let Some(head_cycle) = self.base.queue.peek_cycle() {
            if head_cycle > sim_now {
                break;
            }
            let request = self.base.queue.pop().expect("peeked head");

            if request.serviced {
                // replies only reach us when another component spawned
                // traffic below; just pass them along
                out.send(request);
                continue;
            }
            match request.kind {
                kind if kind.is_read_class() => self.read_queue.push(request),
                Kind::Writeback => self.write_queue.push(request),
                kind => panic!("{}: invalid request kind {kind:?}", self.base.name),
            }
        }

        while self.base.local_cycle <= sim_now {
            let Some(mut request) = self.next_request() else {
                break;
            };
            let now = request.current_cycle.max(self.base.local_cycle);
            self.base.local_cycle = now;
            request.current_cycle = now;
            let busy = self.service(&mut request);
            self.base.local_cycle += busy;
            out.send(request);
        }
    }

    fn earliest_ready(&self) -> Option<Cycle> {
        let queued = self
            .read_queue
            .iter()
            .chain(&self.write_queue)
            .map(|request| request.current_cycle)
            .min();
        let arriving = self.base.queue.peek_cycle();
        match (queued, arriving) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn process(&mut self, _request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        unreachable!("the memory controller drains through its scheduler")
    }

    fn process_return(&mut self, _request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        unreachable!("the memory controller drains through its scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::SimpleMemoryController;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn controller() -> SimpleMemoryController {
        let mut mc = SimpleMemoryController::new();
        mc.set_param("bus-processor-ratio", "1").unwrap();
        mc.init_stats();
        mc.start_simulation();
        mc
    }

    fn request(kind: Kind, addr: u64, cycle: u64) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            kind,
            2,
            addr,
            addr,
            8,
            cycle,
        ))
    }

    #[test]
    fn row_hits_cost_less_than_conflicts() {
        let mut mc = controller();
        let mut out = Outbox::new(0);

        // same row twice, then a different row of the same bank
        mc.base_mut().queue.push(request(Kind::Read, 0x10_0000, 0));
        mc.base_mut().queue.push(request(Kind::Read, 0x10_0040, 0));
        mc.drain(10_000, &mut out);

        assert_eq!(mc.base.stats.get(mc.c_row_conflicts), 1);
        assert_eq!(mc.base.stats.get(mc.c_row_hits), 1);
        // the row hit finishes earlier even though it started later
        assert!(out.sends[1].current_cycle < out.sends[0].current_cycle);
    }

    #[test]
    fn writes_wait_until_the_buffer_fills() {
        let mut mc = controller();
        mc.num_write_buffer_entries = 4;
        let mut out = Outbox::new(0);

        for i in 0..3u64 {
            mc.base_mut()
                .queue
                .push(request(Kind::Writeback, i * 0x2000, 0));
        }
        mc.drain(10_000, &mut out);
        assert!(out.sends.is_empty(), "writes sit below the drain threshold");

        mc.base_mut()
            .queue
            .push(request(Kind::Writeback, 0x8000, 10_001));
        mc.drain(20_000, &mut out);
        assert_eq!(out.sends.len(), 4, "full buffer drains completely");
    }

    #[test]
    fn row_hit_write_drains_first() {
        let mut mc = controller();
        mc.num_write_buffer_entries = 2;
        let mut out = Outbox::new(0);

        // open a row in bank 0
        mc.base_mut().queue.push(request(Kind::Read, 0x0, 0));
        mc.drain(1_000, &mut out);
        out.sends.clear();

        // two writes: first conflicts, second hits the open row
        mc.base_mut()
            .queue
            .push(request(Kind::Writeback, 0x10_0000, 2_000));
        mc.base_mut().queue.push(request(Kind::Writeback, 0x40, 2_000));
        mc.drain(30_000, &mut out);

        assert_eq!(out.sends[0].virtual_address, 0x40, "row hit first");
    }
}
