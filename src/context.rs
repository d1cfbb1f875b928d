use std::sync::atomic::{AtomicU64, Ordering};

/// Per-capture context, passed explicitly to readers, the merger owner and
/// the visitors. Created at capture start, dropped at capture stop.
#[derive(Debug)]
pub struct CaptureContext {
    pub target_pid: i32,
    pub capture_start_timestamp_ns: u64,
    counters: CaptureCounters,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    lost_records: AtomicU64,
    out_of_order_discarded: AtomicU64,
    context_switches: AtomicU64,
    stack_samples: AtomicU64,
    unwind_errors: AtomicU64,
}

impl CaptureContext {
    pub fn new(target_pid: i32, capture_start_timestamp_ns: u64) -> Self {
        CaptureContext {
            target_pid,
            capture_start_timestamp_ns,
            counters: CaptureCounters::default(),
        }
    }

    pub fn count_lost_records(&self, n: u64) {
        self.counters.lost_records.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count_out_of_order_discarded(&self) {
        self.counters
            .out_of_order_discarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_context_switch(&self) {
        self.counters.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_stack_sample(&self) {
        self.counters.stack_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_unwind_error(&self) {
        self.counters.unwind_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lost_records(&self) -> u64 {
        self.counters.lost_records.load(Ordering::Relaxed)
    }

    pub fn out_of_order_discarded(&self) -> u64 {
        self.counters.out_of_order_discarded.load(Ordering::Relaxed)
    }

    pub fn context_switches(&self) -> u64 {
        self.counters.context_switches.load(Ordering::Relaxed)
    }

    pub fn stack_samples(&self) -> u64 {
        self.counters.stack_samples.load(Ordering::Relaxed)
    }

    pub fn unwind_errors(&self) -> u64 {
        self.counters.unwind_errors.load(Ordering::Relaxed)
    }
}
