//! The simulator: component registry, per-core pipelines, request routing
//! and global time.

use crate::component::{Base, Component, ComponentId, Outbox, SimulationLog};
use crate::request::{Initiator, Kind, MemoryRequest};
use crate::{config, Cycle};
use console::style;
use std::collections::HashMap;
use std::path::PathBuf;

pub struct Simulator {
    components: Vec<Box<dyn Component>>,
    names: HashMap<String, ComponentId>,
    kinds: Vec<String>,
    pipelines: Vec<Vec<ComponentId>>,
    cycle: Cycle,
    folder: PathBuf,
    log: SimulationLog,
    retired: Vec<Box<MemoryRequest>>,
}

impl Simulator {
    pub fn new(num_cpus: usize, folder: impl Into<PathBuf>) -> std::io::Result<Self> {
        let folder = folder.into();
        let log = SimulationLog::create(folder.join("SimulationLog"))?;
        Ok(Self::with_log(num_cpus, folder, log))
    }

    /// Simulator writing its run log nowhere; components still place their
    /// own log files in the system temp directory.
    #[must_use]
    pub fn for_testing(num_cpus: usize) -> Self {
        Self::with_log(num_cpus, std::env::temp_dir(), SimulationLog::sink())
    }

    fn with_log(num_cpus: usize, folder: PathBuf, log: SimulationLog) -> Self {
        Self {
            components: Vec::new(),
            names: HashMap::new(),
            kinds: Vec::new(),
            pipelines: vec![Vec::new(); num_cpus],
            cycle: 0,
            folder,
            log,
            retired: Vec::new(),
        }
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub fn current_cycle(&self) -> Cycle {
        self.cycle
    }

    /// Create and register a component of the given type under `name`.
    pub fn register(&mut self, kind: &str, name: &str) -> Result<ComponentId, config::Error> {
        if self.names.contains_key(name) {
            return Err(config::Error::DuplicateComponent {
                name: name.to_string(),
            });
        }
        let component =
            config::create_component(kind).ok_or_else(|| config::Error::UnknownComponentKind {
                kind: kind.to_string(),
            })?;
        let id = self.components.len();
        self.components.push(component);
        self.kinds.push(kind.to_string());
        self.names.insert(name.to_string(), id);
        // the name is also wanted before `attach`, for diagnostics
        self.components[id].base_mut().name = name.to_string();
        Ok(id)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ComponentId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn kind_of(&self, id: ComponentId) -> &str {
        &self.kinds[id]
    }

    pub fn component_mut(&mut self, id: ComponentId) -> &mut dyn Component {
        self.components[id].as_mut()
    }

    /// Append a component to one core's pipeline. Components may appear in
    /// several pipelines (a shared LLC, for instance).
    pub fn push_pipeline(&mut self, cpu: usize, id: ComponentId) {
        self.pipelines[cpu].push(id);
    }

    pub fn push_all_pipelines(&mut self, id: ComponentId) {
        for pipeline in &mut self.pipelines {
            pipeline.push(id);
        }
    }

    pub fn set_start_cycle(&mut self, now: Cycle) {
        self.cycle = now;
        for component in &mut self.components {
            component.base_mut().local_cycle = now;
        }
    }

    pub fn start_simulation(&mut self) {
        let num_cpus = self.num_cpus();
        for (name, &id) in &self.names {
            let base: &mut Base = self.components[id].base_mut();
            base.attach(id, name, num_cpus, self.folder.clone(), self.cycle);
        }
        for component in &mut self.components {
            component.init_stats();
            component.start_simulation();
        }
    }

    pub fn end_simulation(&mut self) {
        for component in &mut self.components {
            component.end_simulation(&mut self.log);
        }
    }

    pub fn end_warm_up(&mut self) {
        for component in &mut self.components {
            component.end_warm_up();
        }
    }

    pub fn end_proc_warm_up(&mut self, cpu: usize) {
        for component in &mut self.components {
            component.end_proc_warm_up(cpu);
        }
    }

    pub fn end_proc_simulation(&mut self, cpu: usize) {
        for component in &mut self.components {
            component.end_proc_simulation(cpu);
        }
    }

    pub fn heartbeat(&mut self, elapsed: Cycle) {
        for component in &mut self.components {
            component.heartbeat(elapsed);
        }
    }

    /// Advance global time to `now` and let every component drain the
    /// requests that became ready.
    ///
    /// Components communicate through outboxes; routed requests may make
    /// earlier components ready again, so the sweep repeats until no
    /// component emits anything.
    pub fn advance_to(&mut self, now: Cycle) {
        if now > self.cycle {
            self.cycle = now;
        }

        loop {
            let mut routed_any = false;
            for id in 0..self.components.len() {
                let mut out = Outbox::new(id);
                self.components[id].drain(self.cycle, &mut out);
                routed_any |= !out.sends.is_empty();
                self.route(out);
            }
            if !routed_any {
                break;
            }
        }
    }

    /// Advance to the earliest request any component is waiting on.
    ///
    /// Panics if nothing is pending anywhere; the driver only calls this
    /// while it has outstanding requests, so that state means a request is
    /// waiting on nothing and the simulation is wedged.
    pub fn auto_advance(&mut self) {
        let Some(earliest) = self.earliest_pending() else {
            for component in &self.components {
                eprintln!("{}", style(component.debug_state()).red());
            }
            panic!("auto-advance with no pending request anywhere");
        };
        self.advance_to(earliest);
    }

    /// Earliest ready cycle over all components, if any.
    #[must_use]
    pub fn earliest_pending(&self) -> Option<Cycle> {
        self.components
            .iter()
            .filter_map(|component| component.earliest_ready())
            .min()
    }

    /// Accept a fresh CPU request and hand it to stage 0 of its core's
    /// pipeline.
    pub fn process_memory_request(&mut self, mut request: Box<MemoryRequest>) {
        assert!(
            matches!(request.initiator, Initiator::Cpu),
            "only the driver issues CPU requests"
        );
        assert!(request.cpu < self.num_cpus());

        let pipeline = &self.pipelines[request.cpu];
        if pipeline.is_empty() {
            request.finished = true;
            self.retired.push(request);
            return;
        }

        request.cmp = 0;
        let target = pipeline[0];
        let ready_at = request.current_cycle;
        log::trace!("issue {request}");
        self.components[target].base_mut().queue.push(request);
        self.advance_to(ready_at.max(self.cycle));
    }

    /// Take the requests that completed their round trip since the last
    /// call.
    pub fn take_finished(&mut self) -> Vec<Box<MemoryRequest>> {
        std::mem::take(&mut self.retired)
    }

    fn route(&mut self, out: Outbox) {
        let from = out.from;
        for mut request in out.sends {
            if request.destroy {
                log::trace!("destroy {request}");
                continue;
            }

            // clean requests recur on their own component
            if request.kind == Kind::Clean {
                self.components[from].base_mut().queue.push(request);
                continue;
            }

            if request.serviced {
                if request.cmp == 0 {
                    request.finished = true;
                    log::trace!("retire {request}");
                    self.retired.push(request);
                    continue;
                }
                request.cmp -= 1;
            } else {
                let depth = self.pipelines[request.cpu].len();
                if request.cmp + 1 == depth {
                    // end of the pipeline acts as the memory sink
                    request.serviced = true;
                } else {
                    request.cmp += 1;
                }
            }

            let target = self.pipelines[request.cpu][request.cmp];
            self.components[target].base_mut().queue.push(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Simulator;
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn relay_pipeline(latency: u32) -> Simulator {
        let mut sim = Simulator::for_testing(1);
        for name in ["first", "second"] {
            let id = sim.register("stall", name).unwrap();
            sim.component_mut(id)
                .set_param("stall-count", &latency.to_string())
                .unwrap();
            sim.component_mut(id)
                .set_param("cmp-stall-count", "0")
                .unwrap();
            sim.push_pipeline(0, id);
        }
        sim.start_simulation();
        sim
    }

    #[test]
    fn round_trip_through_relays() {
        let mut sim = relay_pipeline(10);
        let mut request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 0, 0x40, 0x40, 8, 0);
        request.icount = 100;
        sim.process_memory_request(Box::new(request));

        let mut finished = sim.take_finished();
        for _ in 0..8 {
            if !finished.is_empty() {
                break;
            }
            sim.auto_advance();
            finished = sim.take_finished();
        }

        assert_eq!(finished.len(), 1);
        let done = &finished[0];
        assert!(done.finished);
        assert!(done.serviced);
        assert_eq!(done.cmp, 0);
        assert_eq!(done.icount, 100);
        // both relays added latency on the way in
        assert!(done.current_cycle >= 20);
    }

    #[test]
    fn empty_pipeline_finishes_immediately() {
        let mut sim = Simulator::for_testing(1);
        sim.start_simulation();
        let request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 0, 0, 0, 8, 0);
        sim.process_memory_request(Box::new(request));
        assert_eq!(sim.take_finished().len(), 1);
    }
}
