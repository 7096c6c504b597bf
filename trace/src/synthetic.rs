use super::{AccessKind, MemoryReference};

/// Synthetic reference generator: a cyclic read sweep over a fixed working
/// set, one memory instruction every `mem_inst_gap` instructions.
#[derive(Debug, Clone)]
pub struct SyntheticTrace {
    block_size: u32,
    mem_inst_gap: u32,
    cpu: usize,

    icount: u64,
    virtual_base: u64,
    physical_base: u64,
    index: u64,
    num_blocks: u64,
}

impl SyntheticTrace {
    /// `working_set_size` is in KB.
    #[must_use]
    pub fn new(working_set_size: u32, mem_inst_gap: u32, cpu: usize, block_size: u32) -> Self {
        Self {
            block_size,
            mem_inst_gap,
            cpu,
            icount: 1,
            virtual_base: 0xdead_0000,
            physical_base: 0xbeef_0000,
            index: 0,
            num_blocks: u64::from(working_set_size) * 1024 / u64::from(block_size),
        }
    }

    fn normalize(&self, value: u64) -> u64 {
        value + ((self.cpu as u64) << 48)
    }

    pub fn next_reference(&mut self) -> MemoryReference {
        let offset = self.index * u64::from(self.block_size);
        let reference = MemoryReference {
            icount: self.icount,
            ip: self.normalize(0xdead_beef),
            virtual_address: self.normalize(self.virtual_base + offset),
            physical_address: self.normalize(self.physical_base + offset),
            size: 8,
            kind: AccessKind::Read,
        };

        self.icount += u64::from(self.mem_inst_gap);
        self.index += 1;
        if self.index == self.num_blocks {
            self.index = 0;
        }
        reference
    }
}

#[cfg(test)]
mod tests {
    use super::SyntheticTrace;

    #[test]
    fn walks_the_working_set_cyclically() {
        // 1 KB working set, 64 B blocks: 16 distinct blocks
        let mut generator = SyntheticTrace::new(1, 50, 0, 64);
        let first = generator.next_reference();
        let mut last = first;
        for _ in 0..15 {
            last = generator.next_reference();
        }
        assert_ne!(first.virtual_address, last.virtual_address);

        let wrapped = generator.next_reference();
        assert_eq!(wrapped.virtual_address, first.virtual_address);
        assert_eq!(wrapped.icount, first.icount + 16 * 50);
    }

    #[test]
    fn core_id_separates_addresses() {
        let mut a = SyntheticTrace::new(1, 50, 0, 64);
        let mut b = SyntheticTrace::new(1, 50, 1, 64);
        assert_ne!(
            a.next_reference().virtual_address,
            b.next_reference().virtual_address
        );
    }
}
