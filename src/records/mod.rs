//! Raw record framing and the parse step that turns ring-buffer bytes into
//! [`TypedEvent`](crate::events::TypedEvent)s.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

mod parse;

pub use parse::{ParseError, RecordParser};

use crate::linux::sys;

/// Every record starts with this 8-byte header; `size` includes the header
/// itself.
pub const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8]) -> Self {
        RecordHeader {
            kind: LittleEndian::read_u32(&bytes[0..4]),
            misc: LittleEndian::read_u16(&bytes[4..6]),
            size: LittleEndian::read_u16(&bytes[6..8]),
        }
    }
}

/// A record copied out of one ring buffer. `data` is the payload after the
/// header; it only lives until the parser has consumed it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub header: RecordHeader,
    pub data: Vec<u8>,
}

bitflags! {
    /// The `perf_event_attr::sample_type` bits this crate knows how to parse.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SampleFormat: u64 {
        const IP = sys::PERF_SAMPLE_IP;
        const TID = sys::PERF_SAMPLE_TID;
        const TIME = sys::PERF_SAMPLE_TIME;
        const ADDR = sys::PERF_SAMPLE_ADDR;
        const ID = sys::PERF_SAMPLE_ID;
        const STREAM_ID = sys::PERF_SAMPLE_STREAM_ID;
        const CPU = sys::PERF_SAMPLE_CPU;
        const PERIOD = sys::PERF_SAMPLE_PERIOD;
        const RAW = sys::PERF_SAMPLE_RAW;
        const REGS_USER = sys::PERF_SAMPLE_REGS_USER;
        const STACK_USER = sys::PERF_SAMPLE_STACK_USER;
        const IDENTIFIER = sys::PERF_SAMPLE_IDENTIFIER;
    }
}

/// What kind of event stream one fd carries. Decided at `perf_event_open`
/// time and used by the parser to classify `PERF_RECORD_SAMPLE` records,
/// which otherwise all look alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdOrigin {
    /// Time-based sampling (cpu-clock or cycles).
    TimeSample,
    /// A uprobe attached at the entry of the instrumented function.
    Uprobe { function_id: u64 },
    /// A uretprobe attached at the return of the instrumented function.
    Uretprobe { function_id: u64 },
    /// A raw tracepoint; the id comes from the tracefs `id` file.
    Tracepoint { id: u64 },
}
