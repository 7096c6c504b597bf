//! Fixed-latency relay: adds a constant delay to every request and keeps
//! its port busy for a configurable number of cycles.

use crate::component::{Base, Component, Outbox, Processed};
use crate::config;
use crate::request::{Kind, MemoryRequest};

pub struct Stall {
    base: Base,

    stall_count: u32,
    cmp_stall_count: u32,

    reads: stats::Counter,
    prefetches: stats::Counter,
    writes: stats::Counter,
}

impl Stall {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            stall_count: 300,
            cmp_stall_count: 0,
            reads: stats::Counter::default(),
            prefetches: stats::Counter::default(),
            writes: stats::Counter::default(),
        }
    }
}

impl Default for Stall {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Stall {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "stall-count" => self.stall_count = config::parse(component, name, value)?,
            "cmp-stall-count" => self.cmp_stall_count = config::parse(component, name, value)?,
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
        self.reads = self.base.stats.register("reads", "reads");
        self.prefetches = self.base.stats.register("prefetches", "prefetches");
        self.writes = self.base.stats.register("writes", "writes");
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        match request.kind {
            Kind::Read | Kind::ReadForWrite => self.base.stats.inc(self.reads),
            Kind::Prefetch => self.base.stats.inc(self.prefetches),
            Kind::Writeback => self.base.stats.inc(self.writes),
            _ => {}
        }
        request.add_latency(u64::from(self.stall_count));
        (u64::from(self.cmp_stall_count), Some(request))
    }

    fn process_return(&mut self, request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::Stall;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    #[test]
    fn adds_latency_without_consuming() {
        let mut stall = Stall::new();
        stall.init_stats();
        let request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 0, 0, 0, 8, 100);
        let mut out = Outbox::new(0);
        let (busy, passed) = stall.process(Box::new(request), &mut out);
        assert_eq!(busy, 0);
        assert_eq!(passed.unwrap().current_cycle, 400);
    }
}
