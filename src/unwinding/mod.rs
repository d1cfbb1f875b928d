//! Call stack reconstruction.
//!
//! [`StackUnwinder`] turns `(registers, stack copy, process maps)` into a
//! [`Callstack`]; [`UprobesCallstackManager`] repairs callstacks that were
//! broken by uretprobe return-address hijacking; [`thread_state`] turns
//! context switches into scheduling and thread-state slices.

pub mod modules;
pub mod thread_state;
pub mod unwinder;
pub mod uprobes;

pub use unwinder::StackUnwinder;
pub use uprobes::{FunctionCallManager, TimerSpan, UprobesCallstackManager};

use crate::linux::proc_maps::UPROBES_MAP_NAME;

/// How a callstack ended up in its current shape: complete, or degraded in
/// a specific way. Travels with the callstack all the way to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallstackKind {
    #[default]
    Complete,
    DwarfUnwindingError,
    FramePointerUnwindingError,
    InMapNotExecutable,
    StackTopForDwarf,
    Empty,
}

/// One reconstructed frame: the absolute pc, the containing map's name, and
/// the pc's offset inside that map. Symbol names are resolved by a separate
/// stage; this crate only reports `(module, offset)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    /// Name of the containing map (a file path or a `[special]` name), or
    /// `None` if no map contains the pc.
    pub module: Option<String>,
    pub offset_in_module: u64,
}

impl Frame {
    pub fn is_uprobes(&self) -> bool {
        self.module
            .as_deref()
            .is_some_and(|name| name.ends_with(UPROBES_MAP_NAME))
    }
}

/// An ordered sequence of frames plus the status of its reconstruction.
///
/// Frame order: index 0 is the innermost (leaf) frame; the outermost/root
/// frame is last. A callstack broken by uretprobe hijacking ends with a
/// frame in the `[uprobes]` map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Callstack {
    pub frames: Vec<Frame>,
    pub kind: CallstackKind,
}

impl Callstack {
    pub fn new(frames: Vec<Frame>, kind: CallstackKind) -> Self {
        Callstack { frames, kind }
    }

    pub fn empty(kind: CallstackKind) -> Self {
        Callstack {
            frames: Vec::new(),
            kind,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.kind == CallstackKind::Complete
    }

    /// The pcs, innermost first, as they appear on the wire.
    pub fn pcs(&self) -> Vec<u64> {
        self.frames.iter().map(|frame| frame.pc).collect()
    }
}
