use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::{FdOrigin, RawRecord, SampleFormat};
use crate::events::{
    ExitEvent, ForkEvent, LostEvent, MmapEvent, SchedSwitchEvent, StackSampleEvent,
    ThreadNameEvent, TracepointEvent, TypedEvent, UnknownEvent, UprobeEvent, UretprobeEvent,
};
use crate::linux::sys::{
    self, sample_reg_index, PERF_REG_X86_AX, PERF_SAMPLE_REGS_ABI_NONE, SAMPLE_REGS_COUNT,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record of kind {kind} ended after {len} bytes, needed {needed}")]
    UnexpectedEnd { kind: u32, len: usize, needed: usize },

    #[error("sampled register set uses unsupported ABI {abi}")]
    UnsupportedRegsAbi { abi: u64 },
}

/// Forward-only reader over a record payload.
struct Reader<'a> {
    kind: u32,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: u32, data: &'a [u8]) -> Self {
        Reader { kind, data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(ParseError::UnexpectedEnd {
                kind: self.kind,
                len: self.data.len(),
                needed: self.pos + n,
            }),
        }
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn read_u64(&mut self) -> Result<u64, ParseError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }
}

/// The `sample_id` block appended to every non-sample record when
/// `sample_id_all` is set. Field presence follows the fd's sample format.
#[derive(Debug, Clone, Copy, Default)]
struct SampleIdTrailer {
    pid: i32,
    tid: i32,
    time: u64,
    cpu: u32,
}

impl SampleIdTrailer {
    fn len(format: SampleFormat) -> usize {
        let mut len = 0;
        if format.contains(SampleFormat::TID) {
            len += 8;
        }
        if format.contains(SampleFormat::TIME) {
            len += 8;
        }
        if format.contains(SampleFormat::ID) {
            len += 8;
        }
        if format.contains(SampleFormat::STREAM_ID) {
            len += 8;
        }
        if format.contains(SampleFormat::CPU) {
            len += 8;
        }
        len
    }

    fn parse(kind: u32, data: &[u8], format: SampleFormat) -> Result<Self, ParseError> {
        let len = Self::len(format);
        let start = data.len().checked_sub(len).ok_or(ParseError::UnexpectedEnd {
            kind,
            len: data.len(),
            needed: len,
        })?;
        let mut r = Reader::new(kind, &data[start..]);
        let mut trailer = SampleIdTrailer::default();
        if format.contains(SampleFormat::TID) {
            trailer.pid = r.read_i32()?;
            trailer.tid = r.read_i32()?;
        }
        if format.contains(SampleFormat::TIME) {
            trailer.time = r.read_u64()?;
        }
        if format.contains(SampleFormat::ID) {
            r.read_u64()?;
        }
        if format.contains(SampleFormat::STREAM_ID) {
            r.read_u64()?;
        }
        if format.contains(SampleFormat::CPU) {
            trailer.cpu = r.read_u32()?;
            r.read_u32()?;
        }
        Ok(trailer)
    }
}

struct SampleFields {
    pid: i32,
    tid: i32,
    time: u64,
    cpu: u32,
    raw: Option<Vec<u8>>,
    regs: [u64; SAMPLE_REGS_COUNT],
    stack: Vec<u8>,
}

/// Parses [`RawRecord`]s into typed events, given the sample format the fd
/// was opened with and the fd's [`FdOrigin`].
#[derive(Debug, Clone)]
pub struct RecordParser {
    sample_format: SampleFormat,
}

impl RecordParser {
    pub fn new(sample_type: u64) -> Self {
        RecordParser {
            sample_format: SampleFormat::from_bits_truncate(sample_type),
        }
    }

    pub fn parse(&self, origin: FdOrigin, record: &RawRecord) -> Result<TypedEvent, ParseError> {
        let kind = record.header.kind;
        let data = &record.data[..];
        match kind {
            sys::PERF_RECORD_SAMPLE => self.parse_sample(origin, record),
            sys::PERF_RECORD_SWITCH => {
                let t = SampleIdTrailer::parse(kind, data, self.sample_format)?;
                Ok(TypedEvent::SchedSwitch(SchedSwitchEvent {
                    pid: t.pid,
                    tid: t.tid,
                    cpu: t.cpu,
                    timestamp: t.time,
                    is_switch_out: record.header.misc & sys::PERF_RECORD_MISC_SWITCH_OUT != 0,
                    is_switch_out_preempt: record.header.misc
                        & sys::PERF_RECORD_MISC_SWITCH_OUT_PREEMPT
                        != 0,
                }))
            }
            sys::PERF_RECORD_FORK | sys::PERF_RECORD_EXIT => {
                let mut r = Reader::new(kind, data);
                let pid = r.read_i32()?;
                let ppid = r.read_i32()?;
                let tid = r.read_i32()?;
                let ptid = r.read_i32()?;
                let body_time = r.read_u64()?;
                let timestamp = if self.sample_format.contains(SampleFormat::TIME) {
                    SampleIdTrailer::parse(kind, data, self.sample_format)?.time
                } else {
                    body_time
                };
                Ok(if kind == sys::PERF_RECORD_FORK {
                    TypedEvent::Fork(ForkEvent {
                        pid,
                        ppid,
                        tid,
                        ptid,
                        timestamp,
                    })
                } else {
                    TypedEvent::Exit(ExitEvent {
                        pid,
                        ppid,
                        tid,
                        ptid,
                        timestamp,
                    })
                })
            }
            sys::PERF_RECORD_COMM => {
                let trailer = SampleIdTrailer::parse(kind, data, self.sample_format)?;
                let mut r = Reader::new(kind, data);
                let pid = r.read_i32()?;
                let tid = r.read_i32()?;
                let name_end = data.len() - SampleIdTrailer::len(self.sample_format);
                let name_area = data.get(r.pos..name_end).unwrap_or(&[]);
                let name_len = memchr::memchr(0, name_area).unwrap_or(name_area.len());
                let name = String::from_utf8_lossy(&name_area[..name_len]).into_owned();
                Ok(TypedEvent::ThreadName(ThreadNameEvent {
                    pid,
                    tid,
                    timestamp: trailer.time,
                    name,
                }))
            }
            sys::PERF_RECORD_MMAP2 => {
                let trailer = SampleIdTrailer::parse(kind, data, self.sample_format)?;
                let mut r = Reader::new(kind, data);
                let pid = r.read_i32()?;
                let tid = r.read_i32()?;
                let address = r.read_u64()?;
                let length = r.read_u64()?;
                let page_offset = r.read_u64()?;
                let _major = r.read_u32()?;
                let _minor = r.read_u32()?;
                let _inode = r.read_u64()?;
                let _inode_generation = r.read_u64()?;
                let protection = r.read_u32()?;
                let _flags = r.read_u32()?;
                let path_end = data.len() - SampleIdTrailer::len(self.sample_format);
                let path_area = data.get(r.pos..path_end).unwrap_or(&[]);
                let path_len = memchr::memchr(0, path_area).unwrap_or(path_area.len());
                Ok(TypedEvent::Mmap(MmapEvent {
                    pid,
                    tid,
                    timestamp: trailer.time,
                    address,
                    length,
                    page_offset,
                    is_executable: protection & libc::PROT_EXEC as u32 != 0,
                    path: path_area[..path_len].to_vec(),
                }))
            }
            sys::PERF_RECORD_LOST => {
                let trailer = SampleIdTrailer::parse(kind, data, self.sample_format)?;
                let mut r = Reader::new(kind, data);
                let _id = r.read_u64()?;
                let lost = r.read_u64()?;
                Ok(TypedEvent::Lost(LostEvent {
                    timestamp: trailer.time,
                    lost,
                }))
            }
            _ => {
                let timestamp = SampleIdTrailer::parse(kind, data, self.sample_format)
                    .map(|t| t.time)
                    .unwrap_or(0);
                Ok(TypedEvent::Unknown(UnknownEvent { kind, timestamp }))
            }
        }
    }

    // https://www.kernel.org/doc/html/latest/ (perf_event_open(2)): sample
    // fields appear in a fixed order, each present iff its sample_type bit
    // is set.
    fn parse_sample(
        &self,
        origin: FdOrigin,
        record: &RawRecord,
    ) -> Result<TypedEvent, ParseError> {
        let format = self.sample_format;
        let kind = record.header.kind;
        let mut r = Reader::new(kind, &record.data);

        if format.contains(SampleFormat::IDENTIFIER) {
            r.read_u64()?;
        }
        if format.contains(SampleFormat::IP) {
            r.read_u64()?;
        }
        let (mut pid, mut tid) = (0, 0);
        if format.contains(SampleFormat::TID) {
            pid = r.read_i32()?;
            tid = r.read_i32()?;
        }
        let mut time = 0;
        if format.contains(SampleFormat::TIME) {
            time = r.read_u64()?;
        }
        if format.contains(SampleFormat::ADDR) {
            r.read_u64()?;
        }
        if format.contains(SampleFormat::ID) {
            r.read_u64()?;
        }
        if format.contains(SampleFormat::STREAM_ID) {
            r.read_u64()?;
        }
        let mut cpu = 0;
        if format.contains(SampleFormat::CPU) {
            cpu = r.read_u32()?;
            r.read_u32()?;
        }
        if format.contains(SampleFormat::PERIOD) {
            r.read_u64()?;
        }
        let mut raw = None;
        if format.contains(SampleFormat::RAW) {
            let size = r.read_u32()? as usize;
            raw = Some(r.take(size)?.to_vec());
        }
        let mut regs = [0u64; SAMPLE_REGS_COUNT];
        if format.contains(SampleFormat::REGS_USER) {
            let abi = r.read_u64()?;
            if abi != PERF_SAMPLE_REGS_ABI_NONE {
                if abi != sys::PERF_SAMPLE_REGS_ABI_64 {
                    return Err(ParseError::UnsupportedRegsAbi { abi });
                }
                for reg in regs.iter_mut() {
                    *reg = r.read_u64()?;
                }
            }
        }
        let mut stack = Vec::new();
        if format.contains(SampleFormat::STACK_USER) {
            let size = r.read_u64()? as usize;
            if size > 0 {
                let bytes = r.take(size)?;
                let dyn_size = r.read_u64()? as usize;
                stack = bytes[..dyn_size.min(size)].to_vec();
            }
        }

        let fields = SampleFields {
            pid,
            tid,
            time,
            cpu,
            raw,
            regs,
            stack,
        };
        Ok(Self::classify_sample(origin, fields))
    }

    fn classify_sample(origin: FdOrigin, fields: SampleFields) -> TypedEvent {
        match origin {
            FdOrigin::TimeSample => TypedEvent::SampleWithStack(StackSampleEvent {
                pid: fields.pid,
                tid: fields.tid,
                cpu: fields.cpu,
                timestamp: fields.time,
                regs: fields.regs,
                stack: fields.stack,
            }),
            FdOrigin::Uprobe { function_id } => TypedEvent::Uprobe(UprobeEvent {
                pid: fields.pid,
                tid: fields.tid,
                cpu: fields.cpu,
                timestamp: fields.time,
                function_id,
                regs: fields.regs,
                stack: fields.stack,
            }),
            FdOrigin::Uretprobe { function_id } => TypedEvent::Uretprobe(UretprobeEvent {
                pid: fields.pid,
                tid: fields.tid,
                cpu: fields.cpu,
                timestamp: fields.time,
                function_id,
                return_value: fields.regs[sample_reg_index(PERF_REG_X86_AX)],
            }),
            FdOrigin::Tracepoint { id } => TypedEvent::Tracepoint(TracepointEvent {
                pid: fields.pid,
                tid: fields.tid,
                cpu: fields.cpu,
                timestamp: fields.time,
                tracepoint_id: id,
                raw: fields.raw.unwrap_or_default(),
            }),
        }
    }
}
