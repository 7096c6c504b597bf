use super::{AccessKind, Error, MemoryReference};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

type TraceLines = Lines<BufReader<MultiGzDecoder<File>>>;

/// Reader for gzip-compressed textual traces.
///
/// Each record is one line of six whitespace-separated fields:
/// `icount ip vaddr paddr size kind`.
///
/// Addresses are normalised per core so that several cores can replay the
/// same trace without colliding: the core id is folded into the top 16 bits
/// of the virtual address and instruction pointer and the top 32 bits of the
/// physical address.
///
/// Instruction counts are rebased to start at 1 and forced strictly
/// increasing. With `wrap_around` the file is reopened at the end and
/// icounts continue past the last observed count; without it the reader
/// reports end of trace.
pub struct TraceReader {
    path: PathBuf,
    cpu: usize,
    wrap_around: bool,

    lines: Option<TraceLines>,
    first: bool,
    start_icount: u64,
    last_icount: u64,
    icount_shift: u64,
}

impl TraceReader {
    pub fn open(path: impl Into<PathBuf>, cpu: usize, wrap_around: bool) -> Result<Self, Error> {
        let path = path.into();
        let lines = Self::open_lines(&path)?;
        Ok(Self {
            path,
            cpu,
            wrap_around,
            lines: Some(lines),
            first: true,
            start_icount: 0,
            last_icount: 0,
            icount_shift: 0,
        })
    }

    fn open_lines(path: &PathBuf) -> Result<TraceLines, Error> {
        let file = File::open(path)?;
        Ok(BufReader::new(MultiGzDecoder::new(file)).lines())
    }

    fn normalize(&self, value: u64, shift: u32) -> u64 {
        value + ((self.cpu as u64) << shift)
    }

    fn parse(&self, line: &str) -> Result<MemoryReference, Error> {
        let malformed = || Error::MalformedRecord {
            line: line.to_string(),
        };
        let mut fields = line.split_whitespace();
        let mut next = || fields.next().ok_or_else(malformed);

        let icount: u64 = next()?.parse().map_err(|_| malformed())?;
        let ip: u64 = next()?.parse().map_err(|_| malformed())?;
        let virtual_address: u64 = next()?.parse().map_err(|_| malformed())?;
        let physical_address: u64 = next()?.parse().map_err(|_| malformed())?;
        let size: u32 = next()?.parse().map_err(|_| malformed())?;
        let kind: u32 = next()?.parse().map_err(|_| malformed())?;

        Ok(MemoryReference {
            icount,
            ip: self.normalize(ip, 48),
            virtual_address: self.normalize(virtual_address, 48),
            physical_address: self.normalize(physical_address, 32),
            size,
            kind: AccessKind::try_from(kind)?,
        })
    }

    /// Next reference, or `None` when the trace is exhausted.
    pub fn next_reference(&mut self) -> Result<Option<MemoryReference>, Error> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        match lines.next() {
            Some(line) => {
                let mut reference = self.parse(&line?)?;

                if self.first {
                    self.first = false;
                    self.start_icount = reference.icount;
                    reference.icount = 1;
                    self.last_icount = 0;
                } else {
                    reference.icount -= self.start_icount;
                }
                reference.icount += self.icount_shift;
                while self.last_icount >= reference.icount {
                    reference.icount += 1;
                }
                self.last_icount = reference.icount;
                Ok(Some(reference))
            }
            None if self.first => {
                // empty trace
                self.lines = None;
                Ok(None)
            }
            None if self.wrap_around => {
                log::debug!("trace {} wrapped for cpu {}", self.path.display(), self.cpu);
                self.icount_shift = self.last_icount + 1;
                self.lines = Some(Self::open_lines(&self.path)?);
                self.next_reference()
            }
            None => {
                self.lines = None;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TraceReader;
    use crate::AccessKind;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_trace(name: &str, records: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::fast());
        for record in records {
            writeln!(encoder, "{record}").unwrap();
        }
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn reads_and_normalizes_records() -> Result<(), crate::Error> {
        let path = write_trace(
            "cachesim-reader-basic.gz",
            &["100 4096 8192 12288 8 0", "105 4100 8200 12296 8 1"],
        );
        let mut reader = TraceReader::open(&path, 2, false)?;

        let first = reader.next_reference()?.unwrap();
        assert_eq!(first.icount, 1);
        assert_eq!(first.kind, AccessKind::Read);
        assert_eq!(first.ip, 4096 + (2u64 << 48));
        assert_eq!(first.virtual_address, 8192 + (2u64 << 48));
        assert_eq!(first.physical_address, 12288 + (2u64 << 32));

        let second = reader.next_reference()?.unwrap();
        assert_eq!(second.icount, 5);
        assert_eq!(second.kind, AccessKind::Write);

        assert!(reader.next_reference()?.is_none());
        // stays exhausted
        assert!(reader.next_reference()?.is_none());
        Ok(())
    }

    #[test]
    fn icounts_are_strictly_increasing() -> Result<(), crate::Error> {
        let path = write_trace(
            "cachesim-reader-icount.gz",
            &["7 1 1 1 8 0", "7 2 2 2 8 0", "7 3 3 3 8 0"],
        );
        let mut reader = TraceReader::open(&path, 0, false)?;
        let a = reader.next_reference()?.unwrap().icount;
        let b = reader.next_reference()?.unwrap().icount;
        let c = reader.next_reference()?.unwrap().icount;
        assert!(a < b && b < c);
        Ok(())
    }

    #[test]
    fn wrap_around_shifts_icounts() -> Result<(), crate::Error> {
        let path = write_trace("cachesim-reader-wrap.gz", &["10 1 1 1 8 0", "20 2 2 2 8 0"]);
        let mut reader = TraceReader::open(&path, 0, true)?;
        assert_eq!(reader.next_reference()?.unwrap().icount, 1);
        assert_eq!(reader.next_reference()?.unwrap().icount, 10);
        // wrapped: continues past the last count
        let wrapped = reader.next_reference()?.unwrap();
        assert_eq!(wrapped.icount, 11);
        Ok(())
    }

    #[test]
    fn malformed_record_is_an_error() {
        let path = write_trace("cachesim-reader-bad.gz", &["not a record"]);
        let mut reader = TraceReader::open(&path, 0, false).unwrap();
        assert!(reader.next_reference().is_err());
    }
}
