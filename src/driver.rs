//! Trace driver with a crude out-of-order model.
//!
//! All instructions are assumed independent: non-memory instructions take
//! one cycle, memory instructions take whatever the simulator says. Each
//! core holds a window of `ooo_window` instructions; memory references in
//! the window are issued to the simulator, and the window head retires as
//! soon as its reference completes, pulling new references in from the
//! trace.

use crate::request::MemoryRequest;
use crate::sim::Simulator;
use crate::Cycle;
use color_eyre::eyre::{self, eyre, WrapErr};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use trace_model::{MemoryReference, SyntheticTrace, TraceReader};

const PROGRESS_LEAP: u64 = 10_000_000;

pub enum TraceSource {
    File(TraceReader),
    Synthetic(SyntheticTrace),
}

impl TraceSource {
    fn next_reference(&mut self) -> eyre::Result<Option<MemoryReference>> {
        match self {
            TraceSource::File(reader) => reader
                .next_reference()
                .wrap_err("reading trace record")
                .map_err(Into::into),
            TraceSource::Synthetic(generator) => Ok(Some(generator.next_reference())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Milestone {
    WarmUp,
    EndSimulation,
}

struct Slot {
    reference: MemoryReference,
    issued: bool,
    completed: bool,
    complete_cycle: Cycle,
}

struct Proc {
    source: TraceSource,
    window: VecDeque<Slot>,

    current_icount: u64,
    current_cycle: Cycle,
    checkpoint_icount: u64,
    checkpoint_cycle: Cycle,
    finish_icount: u64,
    finish_cycle: Cycle,

    milestone_index: usize,
    progress_checkpoint: u64,
    issued_any: bool,
    priming: bool,
}

pub struct OooDriver {
    sim: Simulator,
    procs: Vec<Proc>,
    ooo_window: u64,
    milestones: Vec<(u64, Milestone)>,
    warmed: Vec<bool>,
    finished: Vec<bool>,
    ipc_file: File,
    progress_file: File,
}

impl OooDriver {
    /// Build a driver over a configured simulator; one trace source per
    /// core.
    pub fn new(
        sim: Simulator,
        sources: Vec<TraceSource>,
        ooo_window: u64,
        folder: &Path,
    ) -> eyre::Result<Self> {
        let num_cpus = sim.num_cpus();
        assert_eq!(sources.len(), num_cpus, "one trace source per cpu");

        let ipc_file = File::create(folder.join("sim.ipc")).wrap_err("creating sim.ipc")?;
        let progress_file =
            File::create(folder.join("progress")).wrap_err("creating progress file")?;

        let procs = sources
            .into_iter()
            .map(|source| Proc {
                source,
                window: VecDeque::new(),
                current_icount: 0,
                current_cycle: 0,
                checkpoint_icount: 0,
                checkpoint_cycle: 0,
                finish_icount: 0,
                finish_cycle: 0,
                milestone_index: 0,
                progress_checkpoint: 0,
                issued_any: false,
                priming: true,
            })
            .collect();

        Ok(Self {
            sim,
            procs,
            ooo_window,
            milestones: Vec::new(),
            warmed: vec![false; num_cpus],
            finished: vec![false; num_cpus],
            ipc_file,
            progress_file,
        })
    }

    fn issue(&mut self, cpu: usize, index: usize) {
        let proc = &mut self.procs[cpu];
        let slot = &mut proc.window[index];
        debug_assert!(!slot.issued);
        slot.issued = true;

        let mut request = Box::new(MemoryRequest::from_reference(cpu, &slot.reference));
        let issue_cycle = if !proc.issued_any {
            0
        } else if proc.priming {
            // before retirement starts, time simply tracks the counts
            slot.reference.icount
        } else {
            (proc.current_cycle + slot.reference.icount - proc.current_icount)
                .saturating_sub(self.ooo_window)
        };
        proc.issued_any = true;
        request.issue_cycle = issue_cycle;
        request.current_cycle = issue_cycle;
        self.sim.process_memory_request(request);
    }

    /// Pull references from the trace until the window spans the full
    /// out-of-order depth, issuing each reference that enters it.
    fn refill_window(&mut self, cpu: usize) -> eyre::Result<()> {
        loop {
            let proc = &self.procs[cpu];
            let (front, back) = match (proc.window.front(), proc.window.back()) {
                (Some(front), Some(back)) => (front.reference.icount, back.reference.icount),
                _ => break,
            };
            if back - front >= self.ooo_window {
                break;
            }

            let back_index = self.procs[cpu].window.len() - 1;
            if !self.procs[cpu].window[back_index].issued {
                self.issue(cpu, back_index);
            }

            let Some(reference) = self.procs[cpu].source.next_reference()? else {
                return Err(eyre!("no requests from processor {cpu}"));
            };
            self.procs[cpu].window.push_back(Slot {
                reference,
                issued: false,
                completed: false,
                complete_cycle: 0,
            });
        }
        Ok(())
    }

    fn prime(&mut self) -> eyre::Result<()> {
        self.sim.set_start_cycle(0);
        self.sim.start_simulation();

        for cpu in 0..self.procs.len() {
            let Some(reference) = self.procs[cpu].source.next_reference()? else {
                return Err(eyre!("no requests from processor {cpu}"));
            };
            self.procs[cpu].window.push_back(Slot {
                reference,
                issued: false,
                completed: false,
                complete_cycle: 0,
            });
            self.refill_window(cpu)?;
            self.procs[cpu].priming = false;
        }
        Ok(())
    }

    fn mark_completions(&mut self) -> bool {
        let mut any = false;
        for request in self.sim.take_finished() {
            let proc = &mut self.procs[request.cpu];
            if let Some(slot) = proc
                .window
                .iter_mut()
                .find(|slot| slot.issued && !slot.completed && slot.reference.icount == request.icount)
            {
                slot.completed = true;
                slot.complete_cycle = request.current_cycle;
                any = true;
            }
        }
        any
    }

    /// Retire completed window heads, refilling and crossing milestones.
    fn retire(&mut self, cpu: usize) -> eyre::Result<()> {
        loop {
            if !self.procs[cpu].window.front().is_some_and(|slot| slot.completed) {
                return Ok(());
            }
            let slot = self.procs[cpu].window.pop_front().expect("checked head");

            let proc = &mut self.procs[cpu];
            let retire_cycle = slot.complete_cycle.max(
                proc.current_cycle + slot.reference.icount - proc.current_icount,
            );

            if slot.reference.icount > proc.progress_checkpoint {
                let _ = writeln!(
                    self.progress_file,
                    "P{cpu}, {}",
                    proc.progress_checkpoint / PROGRESS_LEAP
                );
                proc.progress_checkpoint += PROGRESS_LEAP;
            }

            proc.current_icount = slot.reference.icount;
            proc.current_cycle = retire_cycle;

            self.refill_window(cpu)?;

            let proc = &self.procs[cpu];
            let Some(&(milestone_icount, milestone)) = self.milestones.get(proc.milestone_index)
            else {
                continue;
            };
            if proc.current_icount <= milestone_icount {
                continue;
            }

            let mut warm_up_milestone = false;
            if !self.finished[cpu] {
                match milestone {
                    Milestone::WarmUp => {
                        let proc = &mut self.procs[cpu];
                        proc.checkpoint_icount = proc.current_icount;
                        proc.checkpoint_cycle = proc.current_cycle;
                        proc.milestone_index += 1;
                        warm_up_milestone = true;
                        self.warmed[cpu] = true;
                        self.sim.end_proc_warm_up(cpu);
                        if self.warmed.iter().all(|&warm| warm) {
                            self.sim.end_warm_up();
                        }
                    }
                    Milestone::EndSimulation => {
                        let proc = &mut self.procs[cpu];
                        proc.finish_icount = proc.current_icount;
                        proc.finish_cycle = proc.current_cycle;
                        self.finished[cpu] = true;
                        self.sim.end_proc_simulation(cpu);
                        let instructions = proc.finish_icount - proc.checkpoint_icount;
                        let cycles = proc.finish_cycle - proc.checkpoint_cycle;
                        let _ = writeln!(self.ipc_file, "{cpu} {instructions} {cycles}");
                    }
                }
            }
            if !warm_up_milestone {
                return Ok(());
            }
        }
    }

    /// Run the simulation: `warm_up` instructions of warm-up, then
    /// `run_time` measured instructions per core, with a heartbeat every
    /// `heart_beat` cycles.
    pub fn run(
        &mut self,
        warm_up: u64,
        run_time: u64,
        heart_beat: Cycle,
    ) -> eyre::Result<stats::Sim> {
        self.milestones = vec![
            (warm_up, Milestone::WarmUp),
            (warm_up + run_time, Milestone::EndSimulation),
        ];
        self.prime()?;

        let mut next_heart_beat = heart_beat;

        while !self.finished.iter().all(|&done| done) {
            if heart_beat > 0 && self.sim.current_cycle() > next_heart_beat {
                self.sim.heartbeat(heart_beat);
                next_heart_beat += heart_beat;
            }

            if self.mark_completions() {
                for cpu in 0..self.procs.len() {
                    self.retire(cpu)?;
                }
            } else {
                self.sim.auto_advance();
            }
        }

        self.sim.end_simulation();

        Ok(stats::Sim {
            cores: self
                .procs
                .iter()
                .enumerate()
                .map(|(cpu, proc)| stats::Core {
                    cpu,
                    instructions: proc.finish_icount - proc.checkpoint_icount,
                    cycles: proc.finish_cycle - proc.checkpoint_cycle,
                })
                .collect(),
            end_cycle: self.sim.current_cycle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{OooDriver, TraceSource};
    use crate::sim::Simulator;
    use trace_model::SyntheticTrace;

    fn pipeline(num_cpus: usize, latency: u32) -> Simulator {
        let mut sim = Simulator::for_testing(num_cpus);
        let id = sim.register("stall", "RELAY").unwrap();
        sim.component_mut(id)
            .set_param("stall-count", &latency.to_string())
            .unwrap();
        sim.push_all_pipelines(id);
        sim
    }

    #[test]
    fn runs_a_synthetic_trace_to_completion() -> color_eyre::eyre::Result<()> {
        let sim = pipeline(1, 20);
        let sources = vec![TraceSource::Synthetic(SyntheticTrace::new(4, 50, 0, 64))];
        let mut driver = OooDriver::new(sim, sources, 128, &std::env::temp_dir())?;

        let stats = driver.run(1_000, 5_000, 0)?;
        assert_eq!(stats.cores.len(), 1);
        let core = &stats.cores[0];
        assert!(core.instructions >= 5_000);
        assert!(core.cycles > 0);
        // one memory instruction every 50: ipc is dominated by the relay
        assert!(core.ipc() > 0.0);
        Ok(())
    }

    #[test]
    fn two_cores_share_the_pipeline() -> color_eyre::eyre::Result<()> {
        let sim = pipeline(2, 10);
        let sources = vec![
            TraceSource::Synthetic(SyntheticTrace::new(4, 25, 0, 64)),
            TraceSource::Synthetic(SyntheticTrace::new(4, 25, 1, 64)),
        ];
        let mut driver = OooDriver::new(sim, sources, 64, &std::env::temp_dir())?;
        let stats = driver.run(500, 2_000, 1_000)?;
        assert!(stats.cores.iter().all(|core| core.cycles > 0));
        Ok(())
    }
}
