use crate::component::ComponentId;
use crate::{address, block_address, Cycle};
use serde::{Deserialize, Serialize};

/// Kind of an in-flight memory request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumCount,
)]
pub enum Kind {
    Read,
    Write,
    PartialWrite,
    Writeback,
    ReadForWrite,
    FakeRead,
    Prefetch,
    Clean,
    AggressiveWriteback,
}

impl Kind {
    /// Demand-or-prefetch read class: everything a cache services out of
    /// its data array.
    #[must_use]
    pub fn is_read_class(self) -> bool {
        matches!(self, Kind::Read | Kind::ReadForWrite | Kind::Prefetch)
    }

    #[must_use]
    pub fn is_direct_write(self) -> bool {
        matches!(self, Kind::Write | Kind::PartialWrite)
    }
}

impl From<trace_model::AccessKind> for Kind {
    fn from(kind: trace_model::AccessKind) -> Self {
        use trace_model::AccessKind;
        match kind {
            AccessKind::Read => Kind::Read,
            AccessKind::Write => Kind::Write,
            AccessKind::PartialWrite => Kind::PartialWrite,
            AccessKind::Writeback => Kind::Writeback,
            AccessKind::ReadForWrite => Kind::ReadForWrite,
            AccessKind::FakeRead => Kind::FakeRead,
            AccessKind::Prefetch => Kind::Prefetch,
            AccessKind::Clean => Kind::Clean,
            AccessKind::AggressiveWriteback => Kind::AggressiveWriteback,
        }
    }
}

/// Who created a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Cpu,
    /// Spawned by a pipeline component (writeback, prefetch, fake read,
    /// clean); such requests die at their origin on the return path.
    Component(ComponentId),
}

impl Initiator {
    #[must_use]
    pub fn is_component(self, id: ComponentId) -> bool {
        self == Initiator::Component(id)
    }
}

/// DRAM address decomposition, filled in by the memory controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DramLocation {
    pub channel: u32,
    pub rank: u32,
    pub bank: u32,
    pub row: address,
    pub column: address,
}

/// The message threaded through a core's component pipeline.
///
/// `serviced` gives the direction: `false` while flowing toward memory,
/// `true` on the way back to the issuing core. `cmp` is the index of the
/// component currently holding the request within its core's pipeline.
#[derive(Debug, Clone)]
pub struct MemoryRequest {
    pub initiator: Initiator,
    pub cpu: usize,
    pub kind: Kind,

    pub ip: address,
    pub virtual_address: address,
    pub physical_address: address,
    pub size: u32,
    pub icount: u64,

    pub issue_cycle: Cycle,
    /// Cycle at which this request is next ready to be processed.
    pub current_cycle: Cycle,

    pub cmp: usize,
    pub serviced: bool,
    /// Held back by an MSHR-class component; not advanceable until released.
    pub stalling: bool,
    /// The spawner wants the request dropped instead of routed.
    pub destroy: bool,
    /// Reached stage 0 on the return path; the driver may retire it.
    pub finished: bool,

    /// A lower-level cache delivered a dirty copy of this line.
    pub dirty_reply: bool,

    pub prefetcher_id: u32,
    /// The triggering demand access hit a trained prefetch stream.
    pub demand_prefetched: bool,
    pub demand_prefetcher_id: u32,

    pub dram: DramLocation,
}

impl MemoryRequest {
    #[must_use]
    pub fn new(
        initiator: Initiator,
        cpu: usize,
        kind: Kind,
        cmp: usize,
        virtual_address: address,
        physical_address: address,
        size: u32,
        cycle: Cycle,
    ) -> Self {
        Self {
            initiator,
            cpu,
            kind,
            ip: 0,
            virtual_address,
            physical_address,
            size,
            icount: 0,
            issue_cycle: cycle,
            current_cycle: cycle,
            cmp,
            serviced: false,
            stalling: false,
            destroy: false,
            finished: false,
            dirty_reply: false,
            prefetcher_id: 0,
            demand_prefetched: false,
            demand_prefetcher_id: 0,
            dram: DramLocation::default(),
        }
    }

    /// Request issued by the driver for a traced reference.
    #[must_use]
    pub fn from_reference(cpu: usize, reference: &trace_model::MemoryReference) -> Self {
        let mut request = Self::new(
            Initiator::Cpu,
            cpu,
            reference.kind.into(),
            0,
            reference.virtual_address,
            reference.physical_address,
            reference.size,
            0,
        );
        request.ip = reference.ip;
        request.icount = reference.icount;
        request
    }

    /// Request spawned by a component on behalf of `parent`; inherits the
    /// parent's position, timing and instruction context.
    #[must_use]
    pub fn spawned(
        origin: ComponentId,
        kind: Kind,
        parent: &MemoryRequest,
        virtual_address: address,
        physical_address: address,
        size: u32,
    ) -> Self {
        let mut request = Self::new(
            Initiator::Component(origin),
            parent.cpu,
            kind,
            parent.cmp,
            virtual_address,
            physical_address,
            size,
            parent.current_cycle,
        );
        request.icount = parent.icount;
        request.ip = parent.ip;
        request
    }

    pub fn add_latency(&mut self, latency: Cycle) {
        self.current_cycle += latency;
    }

    #[must_use]
    pub fn virtual_block_address(&self, block_size: u32) -> address {
        block_address(self.virtual_address, block_size)
    }

    #[must_use]
    pub fn physical_block_address(&self, block_size: u32) -> address {
        block_address(self.physical_address, block_size)
    }
}

impl std::fmt::Display for MemoryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}(cpu={}, va={:#x}, cmp={}, cycle={}{}{})",
            self.kind,
            self.cpu,
            self.virtual_address,
            self.cmp,
            self.current_cycle,
            if self.serviced { ", serviced" } else { "" },
            if self.stalling { ", stalling" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Initiator, Kind, MemoryRequest};

    #[test]
    fn spawned_requests_inherit_context() {
        let mut parent = MemoryRequest::new(Initiator::Cpu, 1, Kind::Read, 3, 0x1000, 0x2000, 8, 77);
        parent.icount = 42;
        parent.ip = 0xbeef;

        let writeback =
            MemoryRequest::spawned(9, Kind::Writeback, &parent, 0x3000, 0x4000, 64);
        assert_eq!(writeback.initiator, Initiator::Component(9));
        assert_eq!(writeback.cpu, 1);
        assert_eq!(writeback.cmp, 3);
        assert_eq!(writeback.current_cycle, 77);
        assert_eq!(writeback.icount, 42);
        assert!(!writeback.serviced);
    }

    #[test]
    fn block_addresses() {
        let request = MemoryRequest::new(Initiator::Cpu, 0, Kind::Read, 0, 0x1234, 0x5678, 8, 0);
        assert_eq!(request.virtual_block_address(64), 0x1200);
        assert_eq!(request.physical_block_address(64), 0x5640);
    }
}
