//! The component contract: every pipeline stage owns a request queue and a
//! local clock, and advances by draining requests the simulator has released
//! up to its global cycle.

use crate::request::MemoryRequest;
use crate::{config, Cycle};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Handle to a registered component.
pub type ComponentId = usize;

struct Pending {
    cycle: Cycle,
    seq: u64,
    request: Box<MemoryRequest>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cycle == other.cycle && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap over (cycle, insertion order); the sequence number makes
        // ties deterministic
        other
            .cycle
            .cmp(&self.cycle)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of in-flight requests keyed by `current_cycle`, ties
/// broken first-in first-out.
#[derive(Default)]
pub struct RequestQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: Box<MemoryRequest>) {
        self.heap.push(Pending {
            cycle: request.current_cycle,
            seq: self.next_seq,
            request,
        });
        self.next_seq += 1;
    }

    #[must_use]
    pub fn peek_cycle(&self) -> Option<Cycle> {
        self.heap.peek().map(|pending| pending.cycle)
    }

    pub fn pop(&mut self) -> Option<Box<MemoryRequest>> {
        self.heap.pop().map(|pending| pending.request)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Unordered view of the queued requests.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRequest> {
        self.heap.iter().map(|pending| pending.request.as_ref())
    }
}

/// Requests a component hands back to the simulator for routing.
///
/// Routing rules (destroy, clean self-requeue, direction) are applied by
/// the simulator when the outbox is distributed, so a component never
/// touches another component's queue directly.
pub struct Outbox {
    pub(crate) from: ComponentId,
    pub(crate) sends: Vec<Box<MemoryRequest>>,
}

impl Outbox {
    #[must_use]
    pub fn new(from: ComponentId) -> Self {
        Self {
            from,
            sends: Vec::new(),
        }
    }

    pub fn send(&mut self, request: Box<MemoryRequest>) {
        debug_assert!(!request.stalling, "stalled requests stay with their component");
        self.sends.push(request);
    }
}

/// Shared per-run log file (one per simulation folder).
pub struct SimulationLog {
    writer: Box<dyn Write>,
}

impl SimulationLog {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let file = File::create(path.into())?;
        Ok(Self {
            writer: Box::new(BufWriter::new(file)),
        })
    }

    /// Log that discards everything; used by tests.
    #[must_use]
    pub fn sink() -> Self {
        Self {
            writer: Box::new(std::io::sink()),
        }
    }

    pub fn entry(&mut self, component: &str, args: std::fmt::Arguments<'_>) {
        let _ = writeln!(self.writer, "{component}: {args}");
    }
}

/// State common to every pipeline component.
pub struct Base {
    pub name: String,
    pub id: ComponentId,
    pub local_cycle: Cycle,
    pub warm_up: bool,
    pub num_cpus: usize,
    pub done: Vec<bool>,
    pub queue: RequestQueue,
    pub stats: stats::Registry,

    sim_folder: PathBuf,
    logs: Vec<(String, BufWriter<File>)>,
}

impl Base {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "no-name".into(),
            id: 0,
            local_cycle: 0,
            warm_up: true,
            num_cpus: 0,
            done: Vec::new(),
            queue: RequestQueue::new(),
            stats: stats::Registry::new(),
            sim_folder: std::env::temp_dir(),
            logs: Vec::new(),
        }
    }

    /// Wire the component into a simulation. Called once by the simulator
    /// before `init_stats`/`start_simulation`.
    pub fn attach(
        &mut self,
        id: ComponentId,
        name: &str,
        num_cpus: usize,
        sim_folder: PathBuf,
        start_cycle: Cycle,
    ) {
        self.id = id;
        self.name = name.to_string();
        self.num_cpus = num_cpus;
        self.done = vec![false; num_cpus];
        self.sim_folder = sim_folder;
        self.local_cycle = start_cycle;
    }

    #[must_use]
    pub fn sim_folder(&self) -> &std::path::Path {
        &self.sim_folder
    }

    /// Has this core already crossed its end-of-simulation milestone?
    #[must_use]
    pub fn is_done(&self, cpu: usize) -> bool {
        self.done.get(cpu).copied().unwrap_or(false)
    }

    /// Open a per-component log file `{folder}/{name}.{suffix}`.
    pub fn new_log_file(&mut self, key: &str, suffix: &str) {
        assert!(
            !self.logs.iter().any(|(k, _)| k == key),
            "log `{key}` opened twice"
        );
        let path = self.sim_folder.join(format!("{}.{suffix}", self.name));
        let file = File::create(&path)
            .unwrap_or_else(|err| panic!("cannot create log file {}: {err}", path.display()));
        self.logs.push((key.to_string(), BufWriter::new(file)));
    }

    pub fn log(&mut self, key: &str, args: std::fmt::Arguments<'_>) {
        let (_, writer) = self
            .logs
            .iter_mut()
            .find(|(k, _)| k == key)
            .unwrap_or_else(|| panic!("log `{key}` was never opened"));
        let _ = writer.write_fmt(args);
    }

    /// Dump every counter, in registration order.
    pub fn dump_stats(&self, log: &mut SimulationLog) {
        for (name, _long_name, value) in self.stats.iter() {
            log.entry(&self.name, format_args!("{name} = {value}"));
        }
    }
}

impl Default for Base {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy cycles plus the request, unless the component kept it (a stall) or
/// already forwarded derived work through the outbox.
pub type Processed = (Cycle, Option<Box<MemoryRequest>>);

pub trait Component {
    fn base(&self) -> &Base;
    fn base_mut(&mut self) -> &mut Base;

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let _ = value;
        Err(config::Error::UnknownParameter {
            component: self.base().name.clone(),
            parameter: name.to_string(),
        })
    }

    /// Register statistics counters. Runs before `start_simulation`.
    fn init_stats(&mut self) {}

    fn start_simulation(&mut self) {}

    fn end_simulation(&mut self, log: &mut SimulationLog) {
        self.base().dump_stats(log);
    }

    fn end_warm_up(&mut self) {
        let base = self.base_mut();
        base.warm_up = false;
        base.stats.reset_all();
    }

    fn end_proc_warm_up(&mut self, _cpu: usize) {}

    fn end_proc_simulation(&mut self, cpu: usize) {
        self.base_mut().done[cpu] = true;
    }

    /// Called every heartbeat; `elapsed` is the cycles since the previous
    /// one.
    fn heartbeat(&mut self, _elapsed: Cycle) {}

    /// Handle a request flowing toward memory.
    fn process(&mut self, request: Box<MemoryRequest>, out: &mut Outbox) -> Processed;

    /// Handle a request on its way back to the issuing core.
    fn process_return(&mut self, request: Box<MemoryRequest>, out: &mut Outbox) -> Processed;

    /// Drain queued requests that are ready at the simulator's cycle.
    ///
    /// The local clock models port occupancy: each processed request
    /// advances it by the returned busy cycles, and once it runs past the
    /// simulator the head is re-stamped to the local clock and left queued.
    fn drain(&mut self, sim_now: Cycle, out: &mut Outbox) {
        loop {
            let Some(head_cycle) = self.base().queue.peek_cycle() else {
                break;
            };
            if head_cycle > sim_now {
                break;
            }

            let mut request = self.base_mut().queue.pop().expect("peeked head");
            if self.base().local_cycle > sim_now {
                request.current_cycle = self.base().local_cycle;
                self.base_mut().queue.push(request);
                break;
            }

            let now = request.current_cycle.max(self.base().local_cycle);
            self.base_mut().local_cycle = now;

            let (busy, pass) = if request.serviced {
                self.process_return(request, out)
            } else {
                request.current_cycle = now;
                self.process(request, out)
            };
            self.base_mut().local_cycle += busy;

            if let Some(request) = pass {
                out.send(request);
            }
        }
    }

    /// Earliest cycle at which this component has work, for auto-advance.
    fn earliest_ready(&self) -> Option<Cycle> {
        self.base().queue.peek_cycle()
    }

    /// One-line queue summary for stuck-simulation diagnostics.
    fn debug_state(&self) -> String {
        format!(
            "{}: local_cycle={}, queued={}",
            self.base().name,
            self.base().local_cycle,
            self.base().queue.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::RequestQueue;
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn request_at(cycle: u64, tag: u64) -> Box<MemoryRequest> {
        let mut request =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 0, tag, tag, 8, cycle);
        request.icount = tag;
        Box::new(request)
    }

    #[test]
    fn orders_by_cycle() {
        let mut queue = RequestQueue::new();
        queue.push(request_at(30, 1));
        queue.push(request_at(10, 2));
        queue.push(request_at(20, 3));
        assert_eq!(queue.peek_cycle(), Some(10));
        assert_eq!(queue.pop().unwrap().icount, 2);
        assert_eq!(queue.pop().unwrap().icount, 3);
        assert_eq!(queue.pop().unwrap().icount, 1);
    }

    #[test]
    fn ties_break_in_insertion_order() {
        let mut queue = RequestQueue::new();
        for tag in 0..16u64 {
            queue.push(request_at(5, tag));
        }
        for tag in 0..16u64 {
            assert_eq!(queue.pop().unwrap().icount, tag);
        }
    }
}
