//! Timing-accurate DRAM controller: per-channel FR-FCFS scheduling with
//! drain-when-full write handling over a full bank-state model.
//!
//! All timing parameters are configured in memory clocks and scaled to
//! processor cycles at start-up; the scheduler itself ticks once per
//! `mem-processor-ratio` processor cycles and walks every channel.

use super::{BankState, Channel, Command, Mode};
use crate::component::{Base, Component, Outbox, Processed, SimulationLog};
use crate::request::{Kind, MemoryRequest};
use crate::{config, Cycle};
use bitvec::bitarr;
use bitvec::order::Lsb0;
use strum::EnumCount;

#[derive(Debug, Clone, Copy)]
struct Timing {
    trc: Cycle,
    trcd: Cycle,
    tras: Cycle,
    tcl: Cycle,
    tcwl: Cycle,
    tccd: Cycle,
    tbl: Cycle,
    trp: Cycle,
    trtw: Cycle,
    twtr: Cycle,
    twr: Cycle,
    tfaw: Cycle,
}

impl Timing {
    fn scaled(&self, ratio: Cycle) -> Self {
        Self {
            trc: self.trc * ratio,
            trcd: self.trcd * ratio,
            tras: self.tras * ratio,
            tcl: self.tcl * ratio,
            tcwl: self.tcwl * ratio,
            tccd: self.tccd * ratio,
            tbl: self.tbl * ratio,
            trp: self.trp * ratio,
            trtw: self.trtw * ratio,
            twtr: self.twtr * ratio,
            twr: self.twr * ratio,
            tfaw: self.tfaw * ratio,
        }
    }
}

pub struct DramController {
    base: Base,

    num_channels: u32,
    num_ranks: u32,
    num_banks: u32,
    /// Columns per row.
    row_size: u32,
    column_size: u32,
    raw_timing: Timing,
    mem_processor_ratio: u32,
    num_write_buffers: u32,

    timing: Timing,
    channels: Vec<Channel>,
}

impl DramController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            num_channels: 1,
            num_ranks: 1,
            num_banks: 8,
            row_size: 128,
            column_size: 64,
            raw_timing: Timing {
                trc: 34,
                trcd: 10,
                tras: 24,
                tcl: 10,
                tcwl: 7,
                tccd: 4,
                tbl: 4,
                trp: 10,
                trtw: 2,
                twtr: 6,
                twr: 10,
                tfaw: 34,
            },
            mem_processor_ratio: 4,
            num_write_buffers: 8,
            timing: Timing {
                trc: 0,
                trcd: 0,
                tras: 0,
                tcl: 0,
                tcwl: 0,
                tccd: 0,
                tbl: 0,
                trp: 0,
                trtw: 0,
                twtr: 0,
                twr: 0,
                tfaw: 0,
            },
            channels: Vec::new(),
        }
    }

    /// Peel channel, column, rank, bank and row out of the virtual
    /// address (the `rbRcC` interleaving).
    fn map_address(&self, request: &mut MemoryRequest) {
        let mut addr = request.virtual_address;
        addr /= u64::from(self.column_size);
        request.dram.channel = (addr % u64::from(self.num_channels)) as u32;
        addr /= u64::from(self.num_channels);
        request.dram.column = addr % u64::from(self.row_size);
        addr /= u64::from(self.row_size);
        request.dram.rank = (addr % u64::from(self.num_ranks)) as u32;
        addr /= u64::from(self.num_ranks);
        request.dram.bank = (addr % u64::from(self.num_banks)) as u32;
        addr /= u64::from(self.num_banks);
        request.dram.row = addr;
    }

    fn enqueue(&mut self, mut request: Box<MemoryRequest>) {
        self.map_address(&mut request);
        let channel = request.dram.channel as usize;
        match request.kind {
            kind if kind.is_read_class() => {
                self.channels[channel].queues[Mode::Read as usize].push(request);
            }
            Kind::Writeback => {
                self.channels[channel].queues[Mode::Write as usize].push(request);
            }
            kind => panic!("{}: invalid request kind {kind:?}", self.base.name),
        }
    }

    fn all_queues_empty(&self) -> bool {
        self.channels
            .iter()
            .all(|channel| channel.queues.iter().all(Vec::is_empty))
    }

    fn earliest_queued(&self) -> Option<Cycle> {
        self.channels
            .iter()
            .flat_map(|channel| channel.queues.iter().flatten())
            .map(|request| request.current_cycle)
            .min()
    }

    /// Issue `cmd` to a bank and advance every dependent constraint.
    fn issue(&mut self, ch: usize, rank: usize, bank: usize, cmd: Command, row: u64) {
        let now = self.base.local_cycle;
        let timing = self.timing;
        let mode = self.channels[ch].mode;

        let advance = |slot: &mut Cycle, value: Cycle| {
            if *slot < value {
                *slot = value;
            }
        };

        {
            let bank = &mut self.channels[ch].ranks[rank].banks[bank];
            bank.last_issue[cmd as usize] = now;
            bank.num_commands[cmd as usize] += 1;

            match cmd {
                Command::Activate => {
                    bank.state = BankState::Activated;
                    bank.open_row = row;
                    advance(&mut bank.next_issue[Command::Activate as usize], now + timing.trc);
                    advance(&mut bank.next_issue[Command::Read as usize], now + timing.trcd);
                    advance(&mut bank.next_issue[Command::Write as usize], now + timing.trcd);
                    advance(&mut bank.next_issue[Command::Precharge as usize], now + timing.tras);
                    bank.num_activates[mode as usize] += 1;
                }
                Command::Read => {
                    advance(&mut bank.next_issue[Command::Activate as usize], now + timing.tcl);
                    advance(&mut bank.next_issue[Command::Read as usize], now + timing.tccd);
                    advance(&mut bank.next_issue[Command::Write as usize], now + timing.tccd);
                    advance(&mut bank.next_issue[Command::Precharge as usize], now + timing.tcl);
                }
                Command::Write => {
                    advance(
                        &mut bank.next_issue[Command::Activate as usize],
                        now + timing.tcl + timing.twr,
                    );
                    advance(&mut bank.next_issue[Command::Read as usize], now + timing.tccd);
                    advance(&mut bank.next_issue[Command::Write as usize], now + timing.tccd);
                    advance(
                        &mut bank.next_issue[Command::Precharge as usize],
                        now + timing.tcwl + timing.twr,
                    );
                }
                Command::Precharge => {
                    bank.state = BankState::Precharged;
                    advance(&mut bank.next_issue[Command::Activate as usize], now + timing.trp);
                    advance(
                        &mut bank.next_issue[Command::Read as usize],
                        now + timing.trp + timing.trcd,
                    );
                    advance(
                        &mut bank.next_issue[Command::Write as usize],
                        now + timing.trp + timing.trcd,
                    );
                    advance(&mut bank.next_issue[Command::Precharge as usize], now + timing.trc);
                }
            }
        }

        match cmd {
            Command::Activate => {
                self.channels[ch].ranks[rank].record_activate(now, timing.tfaw);
            }
            Command::Read => {
                let channel = &mut self.channels[ch];
                advance(&mut channel.next_issue[Command::Read as usize], now + timing.tccd);
                advance(
                    &mut channel.next_issue[Command::Write as usize],
                    now + timing.tcl + timing.tbl + timing.trtw - timing.tcwl,
                );
            }
            Command::Write => {
                let channel = &mut self.channels[ch];
                advance(&mut channel.next_issue[Command::Write as usize], now + timing.tccd);
                advance(
                    &mut channel.next_issue[Command::Read as usize],
                    now + timing.tcwl + timing.tbl + timing.twtr,
                );
            }
            Command::Precharge => {}
        }
    }

    /// One scheduler step for one channel.
    ///
    /// Row hits ready this cycle win outright; otherwise the oldest
    /// activate-ready request gets its row opened, and failing that the
    /// oldest request whose bank shows no pending row hit gets its bank
    /// precharged.
    fn schedule_channel(&mut self, ch: usize, out: &mut Outbox) {
        let now = self.base.local_cycle;

        {
            let channel = &mut self.channels[ch];
            if channel.mode == Mode::Read
                && channel.queues[Mode::Write as usize].len() >= self.num_write_buffers as usize
            {
                channel.mode = Mode::Write;
                channel.num_read_to_writes += 1;
            } else if channel.mode == Mode::Write
                && channel.queues[Mode::Write as usize].is_empty()
            {
                channel.mode = Mode::Read;
                channel.num_write_to_reads += 1;
            }
        }

        let mode = self.channels[ch].mode;
        if self.channels[ch].queues[mode as usize].is_empty() {
            return;
        }
        let col_cmd = if mode == Mode::Read {
            Command::Read
        } else {
            Command::Write
        };

        let mut row_hit_present = bitarr![u64, Lsb0; 0; 64];

        // pass 1: schedulable row hits, then schedulable activates
        for i in 0..self.channels[ch].queues[mode as usize].len() {
            let (rank_id, bank_id, row) = {
                let request = &self.channels[ch].queues[mode as usize][i];
                (
                    request.dram.rank as usize,
                    request.dram.bank as usize,
                    request.dram.row,
                )
            };
            let bank = &self.channels[ch].ranks[rank_id].banks[bank_id];

            if bank.state == BankState::Activated && bank.open_row == row {
                let ready_at = bank.next_issue[col_cmd as usize]
                    .max(self.channels[ch].next_issue[col_cmd as usize]);
                let request = &mut self.channels[ch].queues[mode as usize][i];
                if request.current_cycle < ready_at {
                    request.current_cycle = ready_at;
                }

                if request.current_cycle <= now {
                    self.issue(ch, rank_id, bank_id, col_cmd, row);
                    let mut request = self.channels[ch].queues[mode as usize].remove(i);
                    let data_latency = match col_cmd {
                        Command::Read => self.timing.tcl + self.timing.tbl,
                        _ => self.timing.tcwl + self.timing.tbl,
                    };
                    request.current_cycle = now + data_latency;
                    request.serviced = true;
                    log::trace!("{}: serve {request}", self.base.name);
                    out.send(request);
                    return;
                }
                row_hit_present.set(bank_id, true);
            } else if bank.state == BankState::Precharged {
                let ready_at = bank.next_issue[Command::Activate as usize]
                    .max(self.channels[ch].ranks[rank_id].next_activate);
                let request = &mut self.channels[ch].queues[mode as usize][i];
                if request.current_cycle < ready_at {
                    request.current_cycle = ready_at;
                }
                if request.current_cycle <= now {
                    self.issue(ch, rank_id, bank_id, Command::Activate, row);
                    return;
                }
            }
        }

        // pass 2: no ready request; precharge for the oldest conflicting
        // request whose bank has no pending row hit
        for i in 0..self.channels[ch].queues[mode as usize].len() {
            let (rank_id, bank_id, row) = {
                let request = &self.channels[ch].queues[mode as usize][i];
                (
                    request.dram.rank as usize,
                    request.dram.bank as usize,
                    request.dram.row,
                )
            };

            if !row_hit_present[bank_id] {
                let ready_at = self.channels[ch].ranks[rank_id].banks[bank_id].next_issue
                    [Command::Precharge as usize];
                let request = &mut self.channels[ch].queues[mode as usize][i];
                if request.current_cycle < ready_at {
                    request.current_cycle = ready_at;
                }
                if request.current_cycle <= now {
                    self.issue(ch, rank_id, bank_id, Command::Precharge, row);
                    return;
                }
            } else {
                let request = &mut self.channels[ch].queues[mode as usize][i];
                if request.current_cycle <= now {
                    // blocked behind its bank's row hit this cycle
                    request.current_cycle = now + Cycle::from(self.mem_processor_ratio);
                }
            }
        }
    }
}

impl Default for DramController {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DramController {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "num-channels" => self.num_channels = config::parse(component, name, value)?,
            "num-ranks" => self.num_ranks = config::parse(component, name, value)?,
            "num-banks" => self.num_banks = config::parse(component, name, value)?,
            "row-size" => self.row_size = config::parse(component, name, value)?,
            "column-size" => self.column_size = config::parse(component, name, value)?,
            "trc" => self.raw_timing.trc = config::parse(component, name, value)?,
            "trcd" => self.raw_timing.trcd = config::parse(component, name, value)?,
            "tras" => self.raw_timing.tras = config::parse(component, name, value)?,
            "tcl" => self.raw_timing.tcl = config::parse(component, name, value)?,
            "tcwl" => self.raw_timing.tcwl = config::parse(component, name, value)?,
            "tccd" => self.raw_timing.tccd = config::parse(component, name, value)?,
            "tbl" => self.raw_timing.tbl = config::parse(component, name, value)?,
            "trp" => self.raw_timing.trp = config::parse(component, name, value)?,
            "trtw" => self.raw_timing.trtw = config::parse(component, name, value)?,
            "twtr" => self.raw_timing.twtr = config::parse(component, name, value)?,
            "twr" => self.raw_timing.twr = config::parse(component, name, value)?,
            "trtrs" => {
                // rank-to-rank switch; accepted, the single-rank-aware
                // scheduler does not consume it
                let _: Cycle = config::parse(component, name, value)?;
            }
            "tfaw" => self.raw_timing.tfaw = config::parse(component, name, value)?,
            "mem-processor-ratio" => {
                self.mem_processor_ratio = config::parse(component, name, value)?;
            }
            "num-write-buffers" => self.num_write_buffers = config::parse(component, name, value)?,
            "address-mapping" => {
                if value != "rbRcC" {
                    return Err(config::Error::InvalidValue {
                        component: component.clone(),
                        parameter: name.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "scheduler" => {
                if value != "frfcfs-dwf" {
                    return Err(config::Error::InvalidValue {
                        component: component.clone(),
                        parameter: name.to_string(),
                        value: value.to_string(),
                    });
                }
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

    fn start_simulation(&mut self) {
        assert!(self.num_banks <= 64, "row-hit mask covers 64 banks");
        self.channels = (0..self.num_channels)
            .map(|_| Channel::new(self.num_ranks, self.num_banks))
            .collect();
        self.timing = self.raw_timing.scaled(Cycle::from(self.mem_processor_ratio));
    }

    fn end_warm_up(&mut self) {
        for channel in &mut self.channels {
            channel.num_read_to_writes = 0;
            channel.num_write_to_reads = 0;
            for rank in &mut channel.ranks {
                for bank in &mut rank.banks {
                    bank.reset_counters();
                }
            }
        }
        self.base.warm_up = false;
        self.base.stats.reset_all();
    }

    fn end_simulation(&mut self, log: &mut SimulationLog) {
        let name = self.base.name.clone();
        let mut totals = [0u64; Command::COUNT];
        let mut total_activates = [0u64; 2];
        let mut total_switches = (0u64, 0u64);

        for (c, channel) in self.channels.iter().enumerate() {
            for (r, rank) in channel.ranks.iter().enumerate() {
                for (b, bank) in rank.banks.iter().enumerate() {
                    let prefix = format!("C{c}-R{r}-B{b}");
                    log.entry(
                        &name,
                        format_args!(
                            "{prefix}-acts = {}",
                            bank.num_commands[Command::Activate as usize]
                        ),
                    );
                    log.entry(
                        &name,
                        format_args!("{prefix}-readacts = {}", bank.num_activates[0]),
                    );
                    log.entry(
                        &name,
                        format_args!("{prefix}-writeacts = {}", bank.num_activates[1]),
                    );
                    log.entry(
                        &name,
                        format_args!(
                            "{prefix}-reads = {}",
                            bank.num_commands[Command::Read as usize]
                        ),
                    );
                    log.entry(
                        &name,
                        format_args!(
                            "{prefix}-writes = {}",
                            bank.num_commands[Command::Write as usize]
                        ),
                    );
                    log.entry(
                        &name,
                        format_args!(
                            "{prefix}-pres = {}",
                            bank.num_commands[Command::Precharge as usize]
                        ),
                    );
                    for (total, count) in totals.iter_mut().zip(bank.num_commands) {
                        *total += count;
                    }
                    total_activates[0] += bank.num_activates[0];
                    total_activates[1] += bank.num_activates[1];
                }
            }
            log.entry(
                &name,
                format_args!("C{c}-read-to-writes = {}", channel.num_read_to_writes),
            );
            log.entry(
                &name,
                format_args!("C{c}-write-to-reads = {}", channel.num_write_to_reads),
            );
            total_switches.0 += channel.num_read_to_writes;
            total_switches.1 += channel.num_write_to_reads;
        }

        log.entry(
            &name,
            format_args!("total-acts = {}", totals[Command::Activate as usize]),
        );
        log.entry(
            &name,
            format_args!("total-readacts = {}", total_activates[0]),
        );
        log.entry(
            &name,
            format_args!("total-writeacts = {}", total_activates[1]),
        );
        log.entry(
            &name,
            format_args!("total-reads = {}", totals[Command::Read as usize]),
        );
        log.entry(
            &name,
            format_args!("total-writes = {}", totals[Command::Write as usize]),
        );
        log.entry(
            &name,
            format_args!("total-pres = {}", totals[Command::Precharge as usize]),
        );
        self.base.dump_stats(log);
    }

    /// Requests never flow through the default path: arrivals are parked
    /// in per-channel queues and the memory-clock scheduler serves them.
    fn drain(&mut self, sim_now: Cycle, out: &mut Outbox) {
        let was_idle = self.all_queues_empty();

        // move ready arrivals into their channel queues
        while let Some(head_cycle) = self.base.queue.peek_cycle() {
            if head_cycle > sim_now {
                break;
            }
            let request = self.base.queue.pop().expect("peeked head");
            debug_assert!(!request.serviced, "replies do not reach the dram queue");
            self.enqueue(request);
        }

        let ratio = Cycle::from(self.mem_processor_ratio);

        if self.all_queues_empty() {
            // idle: no command could issue, skip the vacuous ticks
            if self.base.local_cycle <= sim_now {
                let steps = (sim_now - self.base.local_cycle) / ratio + 1;
                self.base.local_cycle += steps * ratio;
            }
            return;
        }

        if was_idle {
            // nothing was in flight before these arrivals, so nothing
            // could have been scheduled in the gap
            if let Some(earliest) = self.earliest_queued() {
                if self.base.local_cycle + ratio <= earliest {
                    let steps = (earliest - self.base.local_cycle) / ratio;
                    self.base.local_cycle += steps * ratio;
                }
            }
        }

        while self.base.local_cycle <= sim_now {
            for ch in 0..self.channels.len() {
                self.schedule_channel(ch, out);
            }
            self.base.local_cycle += ratio;
        }

        // nothing left behind may claim a cycle in the past
        let local = self.base.local_cycle;
        for channel in &mut self.channels {
            for queue in &mut channel.queues {
                for request in queue.iter_mut() {
                    if request.current_cycle < local {
                        request.current_cycle = local;
                    }
                }
            }
        }
    }

    fn process(&mut self, _request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        unreachable!("the dram controller drains through its scheduler")
    }

    fn process_return(&mut self, _request: Box<MemoryRequest>, _out: &mut Outbox) -> Processed {
        unreachable!("the dram controller drains through its scheduler")
    }

    fn earliest_ready(&self) -> Option<Cycle> {
        let queued = self.earliest_queued();
        let arriving = self.base.queue.peek_cycle();
        match (queued, arriving) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn debug_state(&self) -> String {
        let queued: usize = self
            .channels
            .iter()
            .map(|channel| channel.queues[0].len() + channel.queues[1].len())
            .sum();
        format!(
            "{}: local_cycle={}, arriving={}, queued={}",
            self.base.name,
            self.base.local_cycle,
            self.base.queue.len(),
            queued
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, DramController, Mode};
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn controller() -> DramController {
        let mut ctlr = DramController::new();
        ctlr.set_param("mem-processor-ratio", "1").unwrap();
        ctlr.set_param("num-banks", "4").unwrap();
        ctlr.init_stats();
        ctlr.start_simulation();
        ctlr
    }

    /// Address of `row` in `bank` under the rbRcC mapping (one channel,
    /// one rank).
    fn addr(ctlr: &DramController, bank: u64, row: u64, column: u64) -> u64 {
        (((row * u64::from(ctlr.num_banks) + bank) * u64::from(ctlr.num_ranks))
            * u64::from(ctlr.row_size)
            + column)
            * u64::from(ctlr.column_size)
    }

    fn read_at(addr: u64, cycle: u64) -> Box<MemoryRequest> {
        Box::new(MemoryRequest::new(
            Initiator::Cpu,
            0,
            Kind::Read,
            3,
            addr,
            addr,
            8,
            cycle,
        ))
    }

    fn run_until_served(ctlr: &mut DramController, out: &mut Outbox, count: usize) {
        for _ in 0..100_000 {
            if out.sends.iter().filter(|r| r.serviced).count() >= count {
                return;
            }
            let next = ctlr.earliest_ready().expect("work pending");
            ctlr.drain(next, out);
        }
        panic!("requests never completed");
    }

    #[test]
    fn address_mapping_peels_fields_in_order() {
        let mut ctlr = controller();
        let mut request = read_at(addr(&ctlr, 3, 7, 5), 0);
        ctlr.map_address(&mut request);
        assert_eq!(request.dram.channel, 0);
        assert_eq!(request.dram.bank, 3);
        assert_eq!(request.dram.row, 7);
        assert_eq!(request.dram.column, 5);
    }

    #[test]
    fn same_bank_activates_respect_trc() {
        let mut ctlr = controller();
        let mut out = Outbox::new(0);
        let trc = ctlr.timing.trc;

        // two different rows of one bank, issued back to back
        let addr1 = addr(&ctlr, 0, 1, 0);
        let addr2 = addr(&ctlr, 0, 2, 0);
        ctlr.base_mut().queue.push(read_at(addr1, 0));
        ctlr.base_mut().queue.push(read_at(addr2, 1));
        run_until_served(&mut ctlr, &mut out, 2);

        let bank = &ctlr.channels[0].ranks[0].banks[0];
        assert_eq!(bank.num_commands[Command::Activate as usize], 2);
        // the second activate waited out tRC
        assert!(bank.last_issue[Command::Activate as usize] >= trc);
    }

    #[test]
    fn row_hits_beat_activate_ready_requests() {
        let mut ctlr = controller();
        let mut out = Outbox::new(0);

        // open bank 0 row 1
        let open_addr = addr(&ctlr, 0, 1, 0);
        ctlr.base_mut().queue.push(read_at(open_addr, 0));
        run_until_served(&mut ctlr, &mut out, 1);
        let opener = out.sends.pop().unwrap();

        // a conflicting request on the same bank arrives first, then a row
        // hit; the hit must finish first
        let conflict_addr = addr(&ctlr, 0, 9, 0);
        let hit_addr = addr(&ctlr, 0, 1, 4);
        ctlr.base_mut()
            .queue
            .push(read_at(conflict_addr, opener.current_cycle));
        ctlr.base_mut()
            .queue
            .push(read_at(hit_addr, opener.current_cycle));
        run_until_served(&mut ctlr, &mut out, 2);

        let hit = out
            .sends
            .iter()
            .find(|request| request.dram.row == 1)
            .unwrap();
        let conflict = out
            .sends
            .iter()
            .find(|request| request.dram.row == 9)
            .unwrap();
        assert!(hit.current_cycle < conflict.current_cycle);
    }

    #[test]
    fn full_write_queue_switches_the_channel_mode() {
        let mut ctlr = controller();
        ctlr.num_write_buffers = 2;
        let mut out = Outbox::new(0);

        for i in 0..2u64 {
            let mut writeback = read_at(addr(&ctlr, 1, i, 0), 0);
            writeback.kind = Kind::Writeback;
            ctlr.base_mut().queue.push(writeback);
        }
        run_until_served(&mut ctlr, &mut out, 2);
        assert_eq!(ctlr.channels[0].num_read_to_writes, 1);

        // a following read finds the write queue drained and flips the
        // channel back
        let arrival = ctlr.base().local_cycle;
        let arrival_addr = addr(&ctlr, 2, 0, 0);
        ctlr.base_mut().queue.push(read_at(arrival_addr, arrival));
        run_until_served(&mut ctlr, &mut out, 3);
        assert_eq!(ctlr.channels[0].mode, Mode::Read);
        assert_eq!(ctlr.channels[0].num_write_to_reads, 1);
    }

    #[test]
    fn writes_are_not_served_in_read_mode() {
        let mut ctlr = controller();
        let mut out = Outbox::new(0);

        // one lone writeback below the drain threshold
        let mut writeback = read_at(addr(&ctlr, 1, 0, 0), 0);
        writeback.kind = Kind::Writeback;
        ctlr.base_mut().queue.push(writeback);

        ctlr.drain(1_000, &mut out);
        assert!(out.sends.is_empty());
        assert_eq!(ctlr.channels[0].queues[Mode::Write as usize].len(), 1);
    }
}
