//! Miss status holding registers: coalesces outstanding misses per block
//! and stalls the requests waiting on them.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::{address, block_address, config, Cycle};
use std::collections::{HashMap, VecDeque};

pub struct Mshr {
    base: Base,

    /// Number of MSHRs; zero means unlimited.
    count: u32,
    block_size: u32,

    /// Requests parked on an outstanding miss, by block address.
    missed: HashMap<address, Vec<Box<MemoryRequest>>>,
    /// Kind of the in-flight miss for each block. A later demand `Read`
    /// upgrades a `ReadForWrite` here so the reply unblocks readers.
    outstanding: HashMap<address, Kind>,
    /// Requests that could not get an MSHR.
    wait_queue: VecDeque<Box<MemoryRequest>>,
}

impl Mshr {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            count: 32,
            block_size: 64,
            missed: HashMap::new(),
            outstanding: HashMap::new(),
            wait_queue: VecDeque::new(),
        }
    }
}

impl Default for Mshr {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Mshr {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "count" => self.count = config::parse(component, name, value)?,
            "block-size" => self.block_size = config::parse(component, name, value)?,
            _ => {
                return Err(config::Error::UnknownParameter {
                    component: component.clone(),
                    parameter: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn start_simulation(&mut self) {
        self.missed.clear();
        self.outstanding.clear();
        self.wait_queue.clear();
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        // writebacks pass straight through
        if request.kind == Kind::Writeback {
            return (0, Some(request));
        }

        let block = block_address(request.physical_address, self.block_size);

        // a miss for this block is already outstanding: coalesce
        if let Some(waiting) = self.missed.get_mut(&block) {
            // writes complete right away; the line will arrive anyway
            if request.kind == Kind::Write {
                request.serviced = true;
                return (0, Some(request));
            }

            if request.kind == Kind::Read {
                self.outstanding.insert(block, Kind::Read);
            }
            request.stalling = true;
            waiting.push(request);
            return (0, None);
        }

        // no free MSHR: park the request until one frees up
        if self.count != 0 && self.missed.len() == self.count as usize {
            request.stalling = true;
            self.wait_queue.push_back(request);
            return (0, None);
        }

        // allocate an MSHR and send the miss onward
        let miss_kind = if request.kind == Kind::Write {
            Kind::ReadForWrite
        } else {
            request.kind
        };
        let miss = MemoryRequest::spawned(
            self.base.id,
            miss_kind,
            &request,
            request.virtual_address,
            block,
            self.block_size,
        );
        self.outstanding.insert(block, miss_kind);

        let mut waiting = Vec::new();
        if request.kind == Kind::Write {
            request.serviced = true;
            out.send(Box::new(miss));
            self.missed.insert(block, waiting);
            return (0, Some(request));
        }

        request.stalling = true;
        waiting.push(request);
        self.missed.insert(block, waiting);
        out.send(Box::new(miss));
        (0, None)
    }

    fn process_return(&mut self, mut request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        // replies for misses we did not issue just pass through
        if !request.initiator.is_component(self.base.id) {
            return (0, Some(request));
        }

        let block = request.physical_address;
        let waiting = self
            .missed
            .remove(&block)
            .expect("reply for a block with no outstanding miss");
        self.outstanding.remove(&block);

        // release every coalesced request at the reply cycle
        for mut waiter in waiting {
            waiter.stalling = false;
            waiter.serviced = true;
            waiter.current_cycle = request.current_cycle;
            if request.dirty_reply {
                waiter.dirty_reply = true;
            }
            self.base.queue.push(waiter);
        }

        // an MSHR freed up; retry the oldest parked request
        if let Some(mut parked) = self.wait_queue.pop_front() {
            parked.stalling = false;
            self.base.queue.push(parked);
        }

        request.destroy = true;
        (0, Some(request))
    }

    /// Skip stalled entries: the earliest *advanceable* request decides how
    /// far the driver may auto-advance.
    fn earliest_ready(&self) -> Option<Cycle> {
        self.base
            .queue
            .iter()
            .filter(|request| !request.stalling)
            .map(|request| request.current_cycle)
            .min()
    }

    fn debug_state(&self) -> String {
        format!(
            "{}: queued={}, misses={}, parked={}",
            self.base.name,
            self.base.queue.len(),
            self.missed.len(),
            self.wait_queue.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Mshr;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn read_at(addr: u64, cycle: u64) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            Kind::Read,
            0,
            addr,
            addr,
            8,
            cycle,
        ))
    }

    #[test]
    fn coalesces_and_releases_on_reply() {
        let mut mshr = Mshr::new();
        let mut out = Outbox::new(7);
        mshr.base_mut().id = 7;

        // first miss allocates an MSHR and forwards a derived read
        let (_, kept) = mshr.process(read_at(0x1000, 10), &mut out);
        assert!(kept.is_none());
        assert_eq!(out.sends.len(), 1);
        let miss = out.sends.pop().unwrap();
        assert_eq!(miss.kind, Kind::Read);
        assert_eq!(miss.physical_address, 0x1000);

        // same-block read coalesces without a second miss
        let (_, kept) = mshr.process(read_at(0x1008, 11), &mut out);
        assert!(kept.is_none());
        assert!(out.sends.is_empty());

        // write to the same block completes immediately
        let write = MemoryRequest::new(Initiator::Cpu, 0, Kind::Write, 0, 0x1010, 0x1010, 8, 12);
        let (_, kept) = mshr.process(Box::new(write), &mut out);
        assert!(kept.expect("write is fire-and-forget").serviced);

        // reply releases both readers at the reply cycle
        let mut reply = miss;
        reply.serviced = true;
        reply.current_cycle = 200;
        reply.dirty_reply = true;
        let (_, gone) = mshr.process_return(reply, &mut out);
        assert!(gone.unwrap().destroy);

        let mut released = Vec::new();
        while let Some(request) = mshr.base_mut().queue.pop() {
            released.push(request);
        }
        assert_eq!(released.len(), 2);
        for request in &released {
            assert!(request.serviced);
            assert!(!request.stalling);
            assert!(request.dirty_reply);
            assert!(request.current_cycle >= 200);
        }
    }

    #[test]
    fn write_upgrades_outstanding_miss_to_read() {
        let mut mshr = Mshr::new();
        let mut out = Outbox::new(0);

        let mut write =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Write, 0, 0x2000, 0x2000, 8, 5);
        write.icount = 9;
        let (_, kept) = mshr.process(Box::new(write), &mut out);
        assert!(kept.unwrap().serviced);
        let miss = out.sends.pop().unwrap();
        assert_eq!(miss.kind, Kind::ReadForWrite);

        // a read for the same block stalls and upgrades the record
        let (_, kept) = mshr.process(read_at(0x2008, 6), &mut out);
        assert!(kept.is_none());
        assert_eq!(mshr.outstanding.get(&0x2000), Some(&Kind::Read));
    }

    #[test]
    fn full_mshrs_park_requests() {
        let mut mshr = Mshr::new();
        mshr.count = 1;
        let mut out = Outbox::new(0);

        let (_, kept) = mshr.process(read_at(0x1000, 1), &mut out);
        assert!(kept.is_none());
        out.sends.clear();

        // second block: no MSHR left
        let (_, kept) = mshr.process(read_at(0x4000, 2), &mut out);
        assert!(kept.is_none());
        assert!(out.sends.is_empty());
        assert_eq!(mshr.wait_queue.len(), 1);

        // no advanceable request is queued
        assert_eq!(mshr.earliest_ready(), None);
    }
}
