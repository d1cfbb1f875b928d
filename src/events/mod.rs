//! Typed events and the visitor that consumes them.
//!
//! Records read from the ring buffers are parsed into [`TypedEvent`]s, merged
//! into timestamp order, and then handed to an [`EventVisitor`]. The visitor
//! is the single dispatch mechanism between the merger and downstream
//! consumers; nothing downstream matches on tags by hand.

use crate::linux::sys::SAMPLE_REGS_COUNT;

/// A context switch for one thread, in or out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedSwitchEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp: u64,
    pub is_switch_out: bool,
    pub is_switch_out_preempt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkEvent {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub timestamp: u64,
}

/// A time-based sample: registers plus a copy of the user stack starting at
/// the sampled stack pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSampleEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp: u64,
    pub regs: [u64; SAMPLE_REGS_COUNT],
    pub stack: Vec<u8>,
}

/// Fired on entry to a dynamically instrumented function. Carries the same
/// register/stack payload as a time-based sample so the entry callstack can
/// be reconstructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UprobeEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp: u64,
    pub function_id: u64,
    pub regs: [u64; SAMPLE_REGS_COUNT],
    pub stack: Vec<u8>,
}

/// Fired on return from a dynamically instrumented function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UretprobeEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp: u64,
    pub function_id: u64,
    /// AX at return time, i.e. the integer return value.
    pub return_value: u64,
}

/// A raw tracepoint hit. The body keeps the kernel's binary layout; it is
/// decoded by whoever knows the tracepoint's format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracepointEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp: u64,
    pub tracepoint_id: u64,
    pub raw: Vec<u8>,
}

/// A new executable mapping in the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp: u64,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub is_executable: bool,
    pub path: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNameEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp: u64,
    pub name: String,
}

/// The kernel dropped records on this fd (wakeup too slow or buffer full).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostEvent {
    pub timestamp: u64,
    pub lost: u64,
}

/// A record of a kind this crate does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEvent {
    pub kind: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    SchedSwitch(SchedSwitchEvent),
    Fork(ForkEvent),
    Exit(ExitEvent),
    SampleWithStack(StackSampleEvent),
    Uprobe(UprobeEvent),
    Uretprobe(UretprobeEvent),
    Tracepoint(TracepointEvent),
    Mmap(MmapEvent),
    ThreadName(ThreadNameEvent),
    Lost(LostEvent),
    Unknown(UnknownEvent),
}

impl TypedEvent {
    /// Nanosecond timestamp on the perf clock, used as the merger's ordering
    /// key.
    pub fn timestamp(&self) -> u64 {
        match self {
            TypedEvent::SchedSwitch(e) => e.timestamp,
            TypedEvent::Fork(e) => e.timestamp,
            TypedEvent::Exit(e) => e.timestamp,
            TypedEvent::SampleWithStack(e) => e.timestamp,
            TypedEvent::Uprobe(e) => e.timestamp,
            TypedEvent::Uretprobe(e) => e.timestamp,
            TypedEvent::Tracepoint(e) => e.timestamp,
            TypedEvent::Mmap(e) => e.timestamp,
            TypedEvent::ThreadName(e) => e.timestamp,
            TypedEvent::Lost(e) => e.timestamp,
            TypedEvent::Unknown(e) => e.timestamp,
        }
    }

    /// Consumes the event and dispatches it to the matching visit method.
    pub fn visit<V: EventVisitor + ?Sized>(self, visitor: &mut V) {
        match self {
            TypedEvent::SchedSwitch(e) => visitor.visit_sched_switch(e),
            TypedEvent::Fork(e) => visitor.visit_fork(e),
            TypedEvent::Exit(e) => visitor.visit_exit(e),
            TypedEvent::SampleWithStack(e) => visitor.visit_stack_sample(e),
            TypedEvent::Uprobe(e) => visitor.visit_uprobe(e),
            TypedEvent::Uretprobe(e) => visitor.visit_uretprobe(e),
            TypedEvent::Tracepoint(e) => visitor.visit_tracepoint(e),
            TypedEvent::Mmap(e) => visitor.visit_mmap(e),
            TypedEvent::ThreadName(e) => visitor.visit_thread_name(e),
            TypedEvent::Lost(e) => visitor.visit_lost(e),
            TypedEvent::Unknown(e) => visitor.visit_default(TypedEvent::Unknown(e)),
        }
    }
}

/// One visit method per event variant. Every method defaults to
/// [`EventVisitor::visit_default`], so a visitor only implements the
/// variants it cares about and new variants do not force existing visitors
/// to change.
pub trait EventVisitor {
    fn visit_default(&mut self, _event: TypedEvent) {}

    fn visit_sched_switch(&mut self, e: SchedSwitchEvent) {
        self.visit_default(TypedEvent::SchedSwitch(e));
    }
    fn visit_fork(&mut self, e: ForkEvent) {
        self.visit_default(TypedEvent::Fork(e));
    }
    fn visit_exit(&mut self, e: ExitEvent) {
        self.visit_default(TypedEvent::Exit(e));
    }
    fn visit_stack_sample(&mut self, e: StackSampleEvent) {
        self.visit_default(TypedEvent::SampleWithStack(e));
    }
    fn visit_uprobe(&mut self, e: UprobeEvent) {
        self.visit_default(TypedEvent::Uprobe(e));
    }
    fn visit_uretprobe(&mut self, e: UretprobeEvent) {
        self.visit_default(TypedEvent::Uretprobe(e));
    }
    fn visit_tracepoint(&mut self, e: TracepointEvent) {
        self.visit_default(TypedEvent::Tracepoint(e));
    }
    fn visit_mmap(&mut self, e: MmapEvent) {
        self.visit_default(TypedEvent::Mmap(e));
    }
    fn visit_thread_name(&mut self, e: ThreadNameEvent) {
        self.visit_default(TypedEvent::ThreadName(e));
    }
    fn visit_lost(&mut self, e: LostEvent) {
        self.visit_default(TypedEvent::Lost(e));
    }
}
