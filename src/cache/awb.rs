//! Last-level cache with a dirty-bit index and aggressive writeback.
//!
//! Per-block dirty bits move out of the tag store into a small cache of
//! DBI rows, one dirty-bit vector per `granularity` consecutive blocks.
//! Evicting a row flushes every block it marks dirty. After a dirty tag
//! eviction a self-recurring `Clean` request walks the victim's row and
//! writes the remaining dirty blocks back one per visit, stepping aside
//! whenever demand reads are queued. A per-core bypass kicks in when both
//! measured insertion policies miss badly.
//!
//! The tag store runs in set-dueling mode; the `awb-generic-tags` and
//! `awb-bypass-tags` features switch in the plain and bypass-sampling
//! backends instead.

use crate::component::{Base, Component, Outbox, Processed};
use crate::request::{Kind, MemoryRequest};
use crate::table::{Insertion, PolicyValue};
use crate::{address, config, Cycle};
use bitvec::array::BitArray;

/// Upper bound on blocks per DBI row.
const MAX_GRANULARITY: usize = 128;

type DirtyBits = BitArray<[u64; MAX_GRANULARITY / 64]>;

#[derive(Debug, Clone, Default)]
struct TagEntry {
    vcla: address,
    pcla: address,
    app: usize,
}

#[derive(Debug, Clone, Default)]
struct DbiEntry {
    dirty_bits: DirtyBits,
}

#[cfg(not(any(feature = "awb-generic-tags", feature = "awb-bypass-tags")))]
type Tags = crate::tag_store::SetDuelingTagStore<address, TagEntry>;
#[cfg(feature = "awb-generic-tags")]
type Tags = crate::tag_store::TagStore<address, TagEntry>;
#[cfg(feature = "awb-bypass-tags")]
type Tags = crate::tag_store::BypassTagStore<address, TagEntry>;

pub struct AwbLlc {
    base: Base,

    do_awb: bool,
    do_bypass: bool,
    size: u32,
    block_size: u32,
    associativity: u32,
    policy: String,
    dbi_policy: String,
    policy_value: u32,
    dbi_policy_value: u32,
    tag_store_latency: u32,
    data_store_latency: u32,
    dbi_size: u32,
    dbi_associativity: u32,
    granularity: u32,
    bypass_threshold: f64,
    num_dueling_sets: u32,
    epoch: Cycle,
    max_psel: u32,

    num_sets: u32,
    dbi_latency: u32,
    tags: Option<Tags>,
    dbi: crate::tag_store::TagStore<address, DbiEntry>,
    pval: PolicyValue,
    dbi_pval: PolicyValue,

    hits_high: Vec<u32>,
    misses_high: Vec<u32>,
    hits_bimodal: Vec<u32>,
    misses_bimodal: Vec<u32>,
    bypass: Vec<bool>,
    milestone: Cycle,

    clean_row: address,
    /// True when no clean walk is pending.
    clean_done: bool,

    c_accesses: stats::Counter,
    c_reads: stats::Counter,
    c_writebacks: stats::Counter,
    c_misses: stats::Counter,
    c_evictions: stats::Counter,
    c_dirty_evictions: stats::Counter,
    c_dbi_evictions: stats::Counter,
    c_agg_writebacks: stats::Counter,
    c_dbi_eviction_writebacks: stats::Counter,
    c_tag_eviction_writebacks: stats::Counter,
    c_clean_requests: stats::Counter,
    c_dbi_misses: stats::Counter,
    c_dbi_hits: stats::Counter,
    c_writeback_hits: stats::Counter,
    c_writeback_misses: stats::Counter,
    c_bypasses: stats::Counter,
    c_insertions: stats::Counter,
    c_dbi_reads: stats::Counter,
    c_dbi_insertions: stats::Counter,
}

impl AwbLlc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::new(),
            do_awb: true,
            do_bypass: true,
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "lru".to_string(),
            dbi_policy: "drrip".to_string(),
            policy_value: 0,
            dbi_policy_value: 0,
            tag_store_latency: 6,
            data_store_latency: 15,
            dbi_size: 128,
            dbi_associativity: 16,
            granularity: 128,
            bypass_threshold: 0.8,
            num_dueling_sets: 32,
            epoch: 50_000_000,
            max_psel: 1024,
            num_sets: 0,
            dbi_latency: 2,
            tags: None,
            dbi: crate::tag_store::TagStore::new(1, 1, "lru"),
            pval: PolicyValue::High,
            dbi_pval: PolicyValue::High,
            hits_high: Vec::new(),
            misses_high: Vec::new(),
            hits_bimodal: Vec::new(),
            misses_bimodal: Vec::new(),
            bypass: Vec::new(),
            milestone: 0,
            clean_row: 0,
            clean_done: true,
            c_accesses: stats::Counter::default(),
            c_reads: stats::Counter::default(),
            c_writebacks: stats::Counter::default(),
            c_misses: stats::Counter::default(),
            c_evictions: stats::Counter::default(),
            c_dirty_evictions: stats::Counter::default(),
            c_dbi_evictions: stats::Counter::default(),
            c_agg_writebacks: stats::Counter::default(),
            c_dbi_eviction_writebacks: stats::Counter::default(),
            c_tag_eviction_writebacks: stats::Counter::default(),
            c_clean_requests: stats::Counter::default(),
            c_dbi_misses: stats::Counter::default(),
            c_dbi_hits: stats::Counter::default(),
            c_writeback_hits: stats::Counter::default(),
            c_writeback_misses: stats::Counter::default(),
            c_bypasses: stats::Counter::default(),
            c_insertions: stats::Counter::default(),
            c_dbi_reads: stats::Counter::default(),
            c_dbi_insertions: stats::Counter::default(),
        }
    }

    fn block_tag(&self, request: &MemoryRequest) -> address {
        request.virtual_address / u64::from(self.block_size)
    }

    fn row_of(&self, ctag: address) -> address {
        ctag / u64::from(self.granularity)
    }

    fn bit_of(&self, ctag: address) -> usize {
        (ctag % u64::from(self.granularity)) as usize
    }

    fn tags(&self) -> &Tags {
        self.tags.as_ref().expect("started")
    }

    fn tags_mut(&mut self) -> &mut Tags {
        self.tags.as_mut().expect("started")
    }

    fn make_tags(&self) -> Tags {
        #[cfg(not(any(feature = "awb-generic-tags", feature = "awb-bypass-tags")))]
        {
            crate::tag_store::SetDuelingTagStore::new(
                self.base.num_cpus as u32,
                self.num_sets,
                self.associativity,
                &self.policy,
                self.num_dueling_sets,
                self.max_psel,
            )
        }
        #[cfg(feature = "awb-generic-tags")]
        {
            crate::tag_store::TagStore::new(self.num_sets, self.associativity, &self.policy)
        }
        #[cfg(feature = "awb-bypass-tags")]
        {
            crate::tag_store::BypassTagStore::new(
                self.base.num_cpus as u32,
                self.num_sets,
                self.associativity,
                &self.policy,
                self.num_dueling_sets,
            )
        }
    }

    fn tags_insert(
        &mut self,
        ctag: address,
        entry: TagEntry,
        dirty: bool,
    ) -> Insertion<address, TagEntry> {
        #[cfg(not(any(feature = "awb-generic-tags", feature = "awb-bypass-tags")))]
        {
            let app = entry.app as u32;
            let pval_high = self.pval;
            self.tags_mut().insert(
                app,
                ctag,
                entry,
                // dirty installs are refills, not demand behaviour
                !dirty,
                pval_high,
                PolicyValue::Bimodal,
            )
        }
        #[cfg(feature = "awb-generic-tags")]
        {
            let _ = dirty;
            let pval = self.pval;
            self.tags_mut().insert(ctag, entry, pval)
        }
        #[cfg(feature = "awb-bypass-tags")]
        {
            let _ = dirty;
            self.tags_mut().insert(ctag, entry, PolicyValue::High)
        }
    }

    /// Leader bookkeeping for the measuring sets; absent in the plain
    /// backend.
    fn leader_info(&self, set: u32) -> Option<crate::tag_store::LeaderInfo> {
        #[cfg(not(feature = "awb-generic-tags"))]
        {
            Some(self.tags().leader_info(set))
        }
        #[cfg(feature = "awb-generic-tags")]
        {
            let _ = set;
            None
        }
    }

    fn measuring_set(&self, set: u32, cpu: usize) -> bool {
        self.leader_info(set)
            .is_some_and(|info| info.leader && info.app as usize == cpu)
    }

    fn bypassed(&self, set: u32, cpu: usize) -> bool {
        self.do_bypass && self.bypass[cpu] && !self.measuring_set(set, cpu)
    }

    fn update_dbi_weight(&mut self, row: address) {
        let weight = self
            .dbi
            .get(row)
            .map_or(0, |entry| entry.dirty_bits.count_ones() as u32);
        self.dbi.set_weight(row, weight);
    }

    /// Periodic bypass decision from the leader-set miss rates.
    fn update_bypass_epoch(&mut self, sim_now: Cycle) {
        if !self.do_bypass {
            return;
        }
        if sim_now % self.epoch >= 1000 || sim_now < self.milestone + self.epoch - 1000 {
            return;
        }
        for cpu in 0..self.base.num_cpus {
            let rate = |misses: u32, hits: u32| {
                if misses + hits == 0 {
                    0.0
                } else {
                    f64::from(misses) / f64::from(misses + hits)
                }
            };
            let miss_rate_high = rate(self.misses_high[cpu], self.hits_high[cpu]);
            let miss_rate_bimodal = rate(self.misses_bimodal[cpu], self.hits_bimodal[cpu]);
            self.bypass[cpu] = miss_rate_high.min(miss_rate_bimodal) > self.bypass_threshold;
            self.hits_high[cpu] = 0;
            self.misses_high[cpu] = 0;
            self.hits_bimodal[cpu] = 0;
            self.misses_bimodal[cpu] = 0;
        }
        self.milestone = sim_now;
    }

    fn record_leader_outcome(&mut self, set: u32, cpu: usize, hit: bool) {
        let Some(info) = self.leader_info(set) else {
            return;
        };
        if !(info.leader && info.app as usize == cpu) {
            return;
        }
        let counters = if info.policy == PolicyValue::High {
            if hit {
                &mut self.hits_high[cpu]
            } else {
                &mut self.misses_high[cpu]
            }
        } else if hit {
            &mut self.hits_bimodal[cpu]
        } else {
            &mut self.misses_bimodal[cpu]
        };
        *counters += 1;
    }

    /// Install a row (or just its bit) into the DBI; an eviction flushes
    /// every block the evicted row still marks dirty. Returns the evicted
    /// row for the caller's bookkeeping.
    fn handle_dbi_insertion(
        &mut self,
        ctag: address,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) -> Option<(address, DbiEntry)> {
        self.base.stats.inc(self.c_dbi_insertions);

        let row = self.row_of(ctag);
        let was_present = self.dbi.contains(row);
        let dbi_pval = self.dbi_pval;
        let evicted = self.dbi.insert(row, DbiEntry::default(), dbi_pval).evicted();

        let bit = self.bit_of(ctag);
        self.dbi
            .get_mut(row)
            .expect("row just inserted")
            .dirty_bits
            .set(bit, true);
        self.update_dbi_weight(row);

        let evicted = evicted.filter(|_| !was_present)?;
        self.base.stats.inc(self.c_dbi_evictions);

        // flush everything the discarded row still marked dirty
        for bit in evicted.value.dirty_bits.iter_ones() {
            let discard_tag = evicted.key * u64::from(self.granularity) + bit as u64;
            let Some((vcla, pcla)) = self
                .tags()
                .get(discard_tag)
                .map(|entry| (entry.vcla, entry.pcla))
            else {
                continue;
            };
            self.base.stats.inc(self.c_dbi_eviction_writebacks);
            let writeback = MemoryRequest::spawned(
                self.base.id,
                Kind::Writeback,
                request,
                vcla,
                pcla,
                self.block_size,
            );
            out.send(Box::new(writeback));
        }
        Some((evicted.key, evicted.value))
    }

    fn insert_block(
        &mut self,
        ctag: address,
        dirty: bool,
        request: &MemoryRequest,
        out: &mut Outbox,
    ) {
        self.base.stats.inc(self.c_insertions);

        let evicted_row = if dirty {
            self.handle_dbi_insertion(ctag, request, out)
        } else {
            None
        };

        let entry = TagEntry {
            vcla: request.virtual_block_address(self.block_size),
            pcla: request.physical_block_address(self.block_size),
            app: request.cpu,
        };
        let Some(evicted) = self.tags_insert(ctag, entry, dirty).evicted() else {
            return;
        };
        self.base.stats.inc(self.c_evictions);

        let victim_row = self.row_of(evicted.key);
        let victim_bit = self.bit_of(evicted.key);

        // is the victim still marked dirty, either in the live DBI or in
        // the row this very insertion displaced?
        let dirty_in_dbi = self
            .dbi
            .get(victim_row)
            .is_some_and(|row| row.dirty_bits[victim_bit]);
        let dirty_in_displaced = evicted_row
            .as_ref()
            .is_some_and(|(key, row)| *key == victim_row && row.dirty_bits[victim_bit]);

        if !(dirty_in_dbi || dirty_in_displaced) {
            return;
        }
        self.base.stats.inc(self.c_dirty_evictions);

        if dirty_in_dbi {
            let row = self.dbi.get_mut(victim_row).expect("checked above");
            row.dirty_bits.set(victim_bit, false);
            if row.dirty_bits.not_any() {
                self.dbi.invalidate(victim_row);
            }
            self.update_dbi_weight(victim_row);
        }

        self.base.stats.inc(self.c_tag_eviction_writebacks);
        let writeback = MemoryRequest::spawned(
            self.base.id,
            Kind::Writeback,
            request,
            evicted.value.vcla,
            evicted.value.pcla,
            self.block_size,
        );
        out.send(Box::new(writeback));

        // kick off a clean walk over the victim's row if it still has
        // dirty residents
        if self.clean_done && self.do_awb && self.dbi.contains(victim_row) {
            let clean = MemoryRequest::spawned(
                self.base.id,
                Kind::Clean,
                request,
                evicted.value.vcla,
                evicted.value.pcla,
                self.block_size,
            );
            self.clean_done = false;
            self.clean_row = victim_row;
            self.base.stats.inc(self.c_clean_requests);
            self.base.queue.push(Box::new(clean));
        }
    }

    fn process_clean(&mut self, request: &mut MemoryRequest, out: &mut Outbox) {
        if self.clean_done {
            request.serviced = true;
            return;
        }

        let row = self.clean_row;
        if !self.dbi.contains(row) {
            // the row was evicted meanwhile and its dirty blocks flushed
            self.clean_done = true;
            request.serviced = true;
            return;
        }

        let first_dirty = self
            .dbi
            .get(row)
            .expect("checked above")
            .dirty_bits
            .first_one();
        let Some(bit) = first_dirty else {
            self.dbi.invalidate(row);
            self.clean_done = true;
            request.serviced = true;
            return;
        };

        let wb_tag = row * u64::from(self.granularity) + bit as u64;
        let (vcla, pcla) = match self.tags().get(wb_tag) {
            Some(entry) => (entry.vcla, entry.pcla),
            None => {
                let addr = wb_tag * u64::from(self.block_size);
                (addr, addr)
            }
        };
        self.base.stats.inc(self.c_agg_writebacks);
        let writeback = MemoryRequest::spawned(
            self.base.id,
            Kind::Writeback,
            request,
            vcla,
            pcla,
            self.block_size,
        );
        out.send(Box::new(writeback));

        let dbi_row = self.dbi.get_mut(row).expect("checked above");
        dbi_row.dirty_bits.set(bit, false);
        self.update_dbi_weight(row);
    }
}

impl Default for AwbLlc {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for AwbLlc {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), config::Error> {
        let component = &self.base.name;
        match name {
            "do-awb" => self.do_awb = config::parse_bool(component, name, value)?,
            "do-bypass" => self.do_bypass = config::parse_bool(component, name, value)?,
            "size" => self.size = config::parse(component, name, value)?,
            "block-size" => self.block_size = config::parse(component, name, value)?,
            "associativity" => self.associativity = config::parse(component, name, value)?,
            "policy" => self.policy = config::parse_policy(component, name, value)?,
            "dbi-policy" => self.dbi_policy = config::parse_policy(component, name, value)?,
            "policy-value" => self.policy_value = config::parse(component, name, value)?,
            "dbi-policy-value" => self.dbi_policy_value = config::parse(component, name, value)?,
            "tag-store-latency" => {
                self.tag_store_latency = config::parse(component, name, value)?;
            }
            "data-store-latency" => {
                self.data_store_latency = config::parse(component, name, value)?;
            }
            "dbi-size" => self.dbi_size = config::parse(component, name, value)?,
            "dbi-associativity" => self.dbi_associativity = config::parse(component, name, value)?,
            "granularity" => {
                self.granularity = config::parse(component, name, value)?;
                if self.granularity as usize > MAX_GRANULARITY {
                    return Err(config::Error::InvalidValue {
                        component: component.clone(),
                        parameter: name.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "bypass-threshold" => self.bypass_threshold = config::parse(component, name, value)?,
            "num-dueling-sets" => self.num_dueling_sets = config::parse(component, name, value)?,
            "epoch" => self.epoch = config::parse(component, name, value)?,
            "max-psel-value" => self.max_psel = config::parse(component, name, value)?,
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
        self.c_writebacks = stats.register("writebacks", "Writeback Accesses");
        self.c_misses = stats.register("misses", "Total Misses");
        self.c_evictions = stats.register("evictions", "Evictions");
        self.c_dirty_evictions = stats.register("dirty_evictions", "Dirty Evictions");
        self.c_dbi_evictions = stats.register("dbievictions", "DBI Evictions");
        self.c_agg_writebacks = stats.register("agg_writebacks", "Aggressive Writebacks");
        self.c_dbi_eviction_writebacks =
            stats.register("dbi_eviction_writebacks", "DBI Eviction Writebacks");
        self.c_tag_eviction_writebacks =
            stats.register("tagstore_eviction_writebacks", "Tagstore Eviction Writebacks");
        self.c_clean_requests = stats.register("clean_requests", "Clean Requests");
        self.c_dbi_misses = stats.register("dbi_misses", "DBI Misses");
        self.c_dbi_hits = stats.register("dbi_hits", "DBI Hits");
        self.c_writeback_hits = stats.register("writebackhits", "Writeback hits");
        self.c_writeback_misses = stats.register("writebackmisses", "Writeback misses");
        self.c_bypasses = stats.register("bypasses", "LLC bypasses");
        self.c_insertions = stats.register("insertions", "Tagstore insertions");
        self.c_dbi_reads = stats.register("dbi_reads", "Reads from the DBI");
        self.c_dbi_insertions = stats.register("dbi_insertions", "DBI Insertions");
    }

    fn start_simulation(&mut self) {
        assert!(
            self.granularity as usize <= MAX_GRANULARITY,
            "dbi granularity above {MAX_GRANULARITY}"
        );
        self.num_sets = (self.size * 1024) / (self.block_size * self.associativity);
        self.tags = Some(self.make_tags());
        self.dbi = crate::tag_store::TagStore::new(
            self.dbi_size / self.dbi_associativity,
            self.dbi_associativity,
            &self.dbi_policy,
        );
        self.pval = PolicyValue::from_level(self.policy_value);
        self.dbi_pval = PolicyValue::from_level(self.dbi_policy_value);

        // latencies from cacti sweeps; only the entry count matters
        self.dbi_latency = if self.dbi_size >= 1024 { 3 } else { 2 };

        self.hits_high = vec![0; self.base.num_cpus];
        self.misses_high = vec![0; self.base.num_cpus];
        self.hits_bimodal = vec![0; self.base.num_cpus];
        self.misses_bimodal = vec![0; self.base.num_cpus];
        self.bypass = vec![false; self.base.num_cpus];
        self.milestone = 0;
        self.clean_done = true;
    }

    /// Clean walks yield to queued demand reads: when the head is a clean
    /// request and reads are waiting, it is pushed one cycle into the
    /// future and the queue re-examined.
    fn drain(&mut self, sim_now: Cycle, out: &mut Outbox) {
        self.update_bypass_epoch(sim_now);

        loop {
            let Some(head_cycle) = self.base.queue.peek_cycle() else {
                break;
            };
            if head_cycle > sim_now {
                break;
            }

            let mut request = self.base.queue.pop().expect("peeked head");
            if self.base.local_cycle > sim_now {
                request.current_cycle = self.base.local_cycle;
                self.base.queue.push(request);
                break;
            }

            if !request.serviced
                && request.kind == Kind::Clean
                && self
                    .base
                    .queue
                    .iter()
                    .any(|queued| !queued.serviced && queued.kind.is_read_class())
            {
                request.current_cycle += 1;
                self.base.queue.push(request);
                continue;
            }

            let now = request.current_cycle.max(self.base.local_cycle);
            self.base.local_cycle = now;

            let (busy, pass) = if request.serviced {
                self.process_return(request, out)
            } else {
                request.current_cycle = now;
                self.process(request, out)
            };
            self.base.local_cycle += busy;

            if let Some(request) = pass {
                out.send(request);
            }
        }
    }

    fn process(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        assert!(
            !request.kind.is_direct_write(),
            "{}: cannot handle direct writes",
            self.base.name
        );

        let ctag = self.block_tag(&request);
        let row = self.row_of(ctag);
        let set = self.tags().set_index(ctag);
        let tag_latency = u64::from(self.tag_store_latency);

        match request.kind {
            kind if kind.is_read_class() => {
                if !self.bypassed(set, request.cpu) {
                    self.base.stats.inc(self.c_accesses);
                    self.base.stats.inc(self.c_reads);

                    let hit = self.tags_mut().read(ctag, PolicyValue::High).is_some();
                    self.record_leader_outcome(set, request.cpu, hit);
                    if hit {
                        request.serviced = true;
                        request.add_latency(tag_latency + u64::from(self.data_store_latency));
                    } else {
                        self.base.stats.inc(self.c_misses);
                        request.add_latency(tag_latency);
                    }
                    (tag_latency, Some(request))
                } else {
                    // bypassing: only the DBI can answer, and only for
                    // blocks it marks dirty
                    self.base.stats.inc(self.c_bypasses);
                    self.base.stats.inc(self.c_dbi_reads);
                    let dbi_latency = u64::from(self.dbi_latency);

                    let dirty_here = self
                        .dbi
                        .get(row)
                        .is_some_and(|entry| entry.dirty_bits[self.bit_of(ctag)]);
                    if dirty_here {
                        self.base.stats.inc(self.c_dbi_hits);
                        request.serviced = true;
                        request.add_latency(
                            dbi_latency + tag_latency + u64::from(self.data_store_latency),
                        );
                    } else {
                        self.base.stats.inc(self.c_dbi_misses);
                        request.add_latency(dbi_latency);
                    }
                    (dbi_latency, Some(request))
                }
            }

            Kind::Writeback => {
                self.base.stats.inc(self.c_accesses);
                self.base.stats.inc(self.c_writebacks);

                if self.tags().contains(ctag) {
                    self.base.stats.inc(self.c_writeback_hits);
                    if self.dbi.contains(row) {
                        self.base.stats.inc(self.c_dbi_reads);
                        let bit = self.bit_of(ctag);
                        self.dbi
                            .get_mut(row)
                            .expect("row present")
                            .dirty_bits
                            .set(bit, true);
                        self.update_dbi_weight(row);
                        self.dbi.read(row, PolicyValue::High);
                    } else {
                        self.handle_dbi_insertion(ctag, &request, out);
                    }
                } else {
                    self.base.stats.inc(self.c_writeback_misses);
                    self.insert_block(ctag, true, &request, out);
                }
                request.serviced = true;
                (tag_latency, Some(request))
            }

            Kind::Clean => {
                self.process_clean(&mut request, out);
                (tag_latency, Some(request))
            }

            Kind::FakeRead => {
                request.serviced = true;
                (0, Some(request))
            }

            kind => unreachable!("{}: unexpected request kind {kind:?}", self.base.name),
        }
    }

    fn process_return(&mut self, mut request: Box<MemoryRequest>, out: &mut Outbox) -> Processed {
        // our own writebacks and cleans die here
        if request.initiator.is_component(self.base.id) {
            request.destroy = true;
            return (0, Some(request));
        }

        let ctag = self.block_tag(&request);
        let set = self.tags().set_index(ctag);
        if self.bypassed(set, request.cpu) {
            return (0, Some(request));
        }

        if !self.tags().contains(ctag) {
            self.insert_block(ctag, false, &request, out);
        }
        (0, Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::AwbLlc;
    use crate::component::{Component, Outbox};
    use crate::request::{Initiator, Kind, MemoryRequest};

    fn cache() -> AwbLlc {
        let mut cache = AwbLlc::new();
        cache.set_param("size", "64").unwrap();
        cache.set_param("associativity", "2").unwrap();
        cache.set_param("granularity", "4").unwrap();
        cache.set_param("dbi-size", "8").unwrap();
        cache.set_param("dbi-associativity", "2").unwrap();
        cache.set_param("dbi-policy", "minw").unwrap();
        cache.set_param("do-bypass", "0").unwrap();
        cache.base_mut().num_cpus = 1;
        cache.init_stats();
        cache.start_simulation();
        cache
    }

    fn writeback(cache: &mut AwbLlc, addr: u64, out: &mut Outbox) {
        let request =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Writeback, 1, addr, addr, 64, 10);
        cache.process(Box::new(request), out);
    }

    #[test]
    fn writeback_sets_a_dirty_bit_in_the_dbi() {
        let mut cache = cache();
        let mut out = Outbox::new(0);
        writeback(&mut cache, 0x1000, &mut out);

        let ctag = 0x1000u64 / 64;
        let row = ctag / 4;
        assert!(cache.tags().contains(ctag));
        let bits = &cache.dbi.get(row).unwrap().dirty_bits;
        assert!(bits[(ctag % 4) as usize]);
        assert_eq!(bits.count_ones(), 1);
    }

    #[test]
    fn dbi_row_eviction_flushes_all_dirty_blocks() {
        let mut cache = cache();
        let mut out = Outbox::new(0);

        // dirty two blocks in each of 5 distinct rows mapping to the same
        // dbi set (dbi has 4 rows total across 2 sets)
        let row_stride = 4u64 * 64 * 4; // rows advance by granularity blocks; x4 keeps one dbi set
        for row in 0..5u64 {
            let base_addr = 0x4_0000 + row * row_stride;
            writeback(&mut cache, base_addr, &mut out);
            writeback(&mut cache, base_addr + 64, &mut out);
        }

        // some dbi row overflowed: its two dirty blocks were written back
        let flushed = out
            .sends
            .iter()
            .filter(|request| request.kind == Kind::Writeback)
            .count();
        assert!(flushed >= 2, "expected flushes, saw {flushed}");
        assert!(cache.base.stats.get(cache.c_dbi_evictions) >= 1);
        assert_eq!(
            cache.base.stats.get(cache.c_dbi_eviction_writebacks) % 2,
            0,
            "rows flush in pairs of dirty bits"
        );
    }

    #[test]
    fn clean_walk_drains_a_row_and_yields_to_reads() {
        let mut cache = cache();
        cache.base_mut().id = 3;
        let mut out = Outbox::new(3);

        // dirty a second block in the victim's row so the row survives the
        // tag eviction, then overflow the tag set to spawn a clean walk
        let set_stride = u64::from(cache.num_sets) * 64;
        writeback(&mut cache, 0x1040, &mut out); // ctag 0x41, row 0x10
        writeback(&mut cache, 0x1000, &mut out); // ctag 0x40, row 0x10
        writeback(&mut cache, 0x1000 + set_stride, &mut out);
        writeback(&mut cache, 0x1000 + 2 * set_stride, &mut out);

        assert!(!cache.clean_done);
        assert_eq!(cache.base.stats.get(cache.c_clean_requests), 1);
        assert_eq!(cache.base.queue.len(), 1, "clean request queued on self");

        // drive the clean walk, playing the simulator's clean-requeue role
        for _ in 0..8 {
            if cache.clean_done {
                break;
            }
            cache.drain(1_000, &mut out);
            if let Some(position) = out
                .sends
                .iter()
                .position(|request| request.kind == Kind::Clean && !request.destroy)
            {
                let clean = out.sends.remove(position);
                cache.base.queue.push(clean);
            }
        }
        assert!(cache.clean_done);
        assert!(cache.base.stats.get(cache.c_agg_writebacks) >= 1);
        assert!(!cache.dbi.contains(0x10));
    }

    #[test]
    fn clean_yields_to_queued_demand_reads() {
        let mut cache = cache();
        cache.base_mut().id = 3;
        let mut out = Outbox::new(3);

        let mut clean =
            MemoryRequest::new(Initiator::Cpu, 0, Kind::Clean, 1, 0x1000, 0x1000, 64, 10);
        clean.initiator = crate::request::Initiator::Component(3);
        cache.clean_done = false;
        cache.clean_row = 0x10;
        cache.base.queue.push(Box::new(clean));

        let read = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 1, 0x9000, 0x9000, 8, 20);
        cache.base.queue.push(Box::new(read));

        cache.drain(30, &mut out);
        // the read was processed even though the clean was ahead of it
        assert!(out
            .sends
            .iter()
            .any(|request| request.virtual_address == 0x9000));
    }
}
