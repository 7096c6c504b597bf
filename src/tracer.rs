//! Trace-dump component: writes every forward request it sees to a gzip
//! trace in the simulation folder, in the same record format the trace
//! reader consumes. Warm-up traffic is skipped.

use crate::component::{Base, Component, Outbox, Processed, SimulationLog};
use crate::config;
use crate::request::MemoryRequest;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;

pub struct TraceDump {
    base: Base,
    trace_file_name: String,
    encoder: Option<GzEncoder<File>>,
}

impl TraceDump {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            trace_file_name: "trace".to_string(),
            encoder: None,
        }
    }

    fn kind_code(request: &MemoryRequest) -> u32 {
        request.kind as u32
    }
}

impl Default for TraceDump {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for TraceDump {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        match name {
            "trace-file-name" => self.trace_file_name = value.to_string(),
            _ => {
                return Err(config::Error::UnknownParameter {
                    component: self.base.name.clone(),
                    parameter: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn start_simulation(&mut self) {
        let path = self
            .base
            .sim_folder()
            .join(format!("{}.gz", self.trace_file_name));
        let file = File::create(&path)
            .unwrap_or_else(|err| panic!("cannot create trace {}: {err}", path.display()));
        self.encoder = Some(GzEncoder::new(file, Compression::default()));
    }

    fn end_simulation(&mut self, log: &mut SimulationLog) {
        if let Some(encoder) = self.encoder.take() {
            let _ = encoder.finish();
        }
        self.base.dump_stats(log);
    }

    fn process(&mut self, request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        if !self.base.warm_up {
            if let Some(encoder) = self.encoder.as_mut() {
                let _ = writeln!(
                    encoder,
                    "{} {} {} {} {} {}",
                    request.icount,
                    request.ip,
                    request.virtual_address,
                    request.physical_address,
                    request.size,
                    Self::kind_code(&request),
                );
            }
        }
        (0, Some(request))
    }

    fn process_return(&mut self, request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        (0, Some(request))
    }
}
