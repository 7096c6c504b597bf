//! Next-line prefetcher: a demand read triggers prefetches for the next
//! `degree` cache lines.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::config;

pub struct NextLinePrefetcher {
    base: Base,

    degree: u32,
    block_size: u32,
    prefetch_on_write: bool,
}

impl NextLinePrefetcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            degree: 4,
            block_size: 64,
            prefetch_on_write: false,
        }
    }
}

impl Default for NextLinePrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for NextLinePrefetcher {
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
            _ => {
                return Err(config::Error::UnknownParameter {
                    component: component.clone(),
                    parameter: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn process(&mut self, request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        if !super::trains(request.kind, self.prefetch_on_write) {
            return (0, Some(request));
        }

        let mut vcla = request.virtual_block_address(self.block_size);
        let mut pcla = request.physical_block_address(self.block_size);
        for _ in 0..self.degree {
            vcla += u64::from(self.block_size);
            pcla += u64::from(self.block_size);
            let prefetch = MemoryRequest::spawned(
                self.base.id,
                Kind::Prefetch,
                &request,
                vcla,
                pcla,
                self.block_size,
            );
            out.send(Box::new(prefetch));
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
    use super::NextLinePrefetcher;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    #[test]
    fn emits_degree_prefetches_at_successive_lines() {
        let mut prefetcher = NextLinePrefetcher::new();
        prefetcher.degree = 2;
        let mut out = Outbox::new(0);

        let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x1008, 0x1008, 8, 10);
        prefetcher.process(Box::new(read), &mut out);

        assert_eq!(out.sends.len(), 2);
        assert_eq!(out.sends[0].kind, Kind::Prefetch);
        assert_eq!(out.sends[0].virtual_address, 0x1040);
        assert_eq!(out.sends[1].virtual_address, 0x1080);
    }

    #[test]
    fn writebacks_and_prefetches_do_not_train() {
        let mut prefetcher = NextLinePrefetcher::new();
        let mut out = Outbox::new(0);
        for kind in [Kind::Writeback, Kind::Prefetch, Kind::Write] {
            let request = MemoryRequest::new(Initiator::Cpu, 0, kind, 1, 0x2000, 0x2000, 8, 10);
            prefetcher.process(Box::new(request), &mut out);
        }
        assert!(out.sends.is_empty());
    }

    #[test]
    fn own_prefetch_destroyed_on_return() {
        let mut prefetcher = NextLinePrefetcher::new();
        prefetcher.base_mut().id = 5;
        let mut out = Outbox::new(5);

        let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x1000, 0x1000, 8, 10);
        prefetcher.process(Box::new(read), &mut out);
        let mut prefetch = out.sends.remove(0);
        prefetch.serviced = true;

        let (_, back) = prefetcher.process_return(prefetch, &mut out);
        assert!(back.unwrap().destroy);
    }
}
