//! Turns context-switch events into scheduling slices (on-CPU spans) and
//! thread-state slices (off-CPU spans).

use rustc_hash::FxHashMap;

use crate::config::ThreadStateChangeCallstackCollection;
use crate::events::SchedSwitchEvent;
use crate::producer::events::{
    SchedulingSlice, ThreadState, ThreadStateCallstackStatus, ThreadStateSlice, WakeupReason,
};

#[derive(Debug, Clone, Copy)]
enum RunState {
    /// First time we hear of this thread; we don't know what it was doing.
    Unknown,
    On {
        since: u64,
        cpu: u32,
    },
    Off {
        since: u64,
        preempted: bool,
    },
}

/// Per-thread context-switch state machine.
///
/// A switch-out closes the thread's on-CPU span; a switch-in closes its
/// off-CPU span. Threads we have never seen switch in or out start in an
/// unknown state and produce no slice for their first transition. Duplicate
/// switch-outs happen in practice (the same record has been observed twice
/// in a row) and are tolerated.
#[derive(Debug)]
pub struct ThreadStateTracker {
    threads: FxHashMap<i32, RunState>,
    emit_scheduling_slices: bool,
    emit_thread_state_slices: bool,
    callstack_collection: ThreadStateChangeCallstackCollection,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SwitchOutput {
    pub scheduling_slice: Option<SchedulingSlice>,
    pub thread_state_slice: Option<ThreadStateSlice>,
}

impl ThreadStateTracker {
    pub fn new(
        emit_scheduling_slices: bool,
        emit_thread_state_slices: bool,
        callstack_collection: ThreadStateChangeCallstackCollection,
    ) -> Self {
        ThreadStateTracker {
            threads: FxHashMap::default(),
            emit_scheduling_slices,
            emit_thread_state_slices,
            callstack_collection,
        }
    }

    pub fn handle_switch(&mut self, e: &SchedSwitchEvent) -> SwitchOutput {
        if e.is_switch_out {
            self.handle_switch_out(e)
        } else {
            self.handle_switch_in(e)
        }
    }

    fn handle_switch_out(&mut self, e: &SchedSwitchEvent) -> SwitchOutput {
        let state = self.threads.entry(e.tid).or_insert(RunState::Unknown);
        let mut output = SwitchOutput::default();
        match *state {
            RunState::On { since, cpu } => {
                if self.emit_scheduling_slices {
                    output.scheduling_slice = Some(SchedulingSlice {
                        pid: e.pid,
                        tid: e.tid,
                        core: cpu as i32,
                        duration_ns: e.timestamp - since,
                        out_timestamp_ns: e.timestamp,
                    });
                }
            }
            RunState::Unknown => {
                // The thread was running until now, but we never saw it
                // switch in, so the span has no start.
            }
            RunState::Off { .. } => {
                // Duplicate switch-out; keep the earlier off timestamp.
                return output;
            }
        }
        *state = RunState::Off {
            since: e.timestamp,
            preempted: e.is_switch_out_preempt,
        };
        output
    }

    fn handle_switch_in(&mut self, e: &SchedSwitchEvent) -> SwitchOutput {
        let state = self.threads.entry(e.tid).or_insert(RunState::Unknown);
        let mut output = SwitchOutput::default();
        match *state {
            RunState::Off { since, preempted } => {
                if self.emit_thread_state_slices {
                    let status = match self.callstack_collection {
                        ThreadStateChangeCallstackCollection::None => {
                            ThreadStateCallstackStatus::NoCallstack
                        }
                        _ => ThreadStateCallstackStatus::WaitingForCallstack,
                    };
                    output.thread_state_slice = Some(ThreadStateSlice {
                        pid: e.pid,
                        tid: e.tid,
                        thread_state: if preempted {
                            ThreadState::Runnable
                        } else {
                            ThreadState::InterruptibleSleep
                        },
                        duration_ns: e.timestamp - since,
                        end_timestamp_ns: e.timestamp,
                        wakeup_reason: WakeupReason::NotApplicable,
                        wakeup_tid: 0,
                        wakeup_pid: 0,
                        switch_out_or_wakeup_callstack_status: status,
                        switch_out_or_wakeup_callstack_id: 0,
                    });
                }
            }
            RunState::Unknown => {}
            RunState::On { .. } => {
                // Duplicate switch-in; keep the earlier on timestamp.
                return output;
            }
        }
        *state = RunState::On {
            since: e.timestamp,
            cpu: e.cpu,
        };
        output
    }

    /// Forgets a thread, called when it exits.
    pub fn remove_thread(&mut self, tid: i32) {
        self.threads.remove(&tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ThreadStateTracker {
        ThreadStateTracker::new(true, true, ThreadStateChangeCallstackCollection::None)
    }

    fn switch(tid: i32, timestamp: u64, cpu: u32, out: bool, preempt: bool) -> SchedSwitchEvent {
        SchedSwitchEvent {
            pid: 100,
            tid,
            cpu,
            timestamp,
            is_switch_out: out,
            is_switch_out_preempt: preempt,
        }
    }

    #[test]
    fn on_span_becomes_a_scheduling_slice() {
        let mut tracker = tracker();
        assert_eq!(
            tracker.handle_switch(&switch(7, 1_000, 2, false, false)),
            SwitchOutput::default()
        );
        let output = tracker.handle_switch(&switch(7, 1_500, 2, true, false));
        assert_eq!(
            output.scheduling_slice,
            Some(SchedulingSlice {
                pid: 100,
                tid: 7,
                core: 2,
                duration_ns: 500,
                out_timestamp_ns: 1_500,
            })
        );
        assert_eq!(output.thread_state_slice, None);
    }

    #[test]
    fn off_span_becomes_a_thread_state_slice() {
        let mut tracker = tracker();
        tracker.handle_switch(&switch(7, 1_000, 0, false, false));
        tracker.handle_switch(&switch(7, 1_500, 0, true, false));
        let output = tracker.handle_switch(&switch(7, 2_500, 1, false, false));
        let slice = output.thread_state_slice.unwrap();
        assert_eq!(slice.thread_state, ThreadState::InterruptibleSleep);
        assert_eq!(slice.duration_ns, 1_000);
        assert_eq!(slice.end_timestamp_ns, 2_500);
        assert_eq!(
            slice.switch_out_or_wakeup_callstack_status,
            ThreadStateCallstackStatus::NoCallstack
        );
    }

    #[test]
    fn preempted_threads_are_runnable_while_off() {
        let mut tracker = tracker();
        tracker.handle_switch(&switch(7, 1_000, 0, false, false));
        tracker.handle_switch(&switch(7, 1_500, 0, true, true));
        let output = tracker.handle_switch(&switch(7, 1_600, 0, false, false));
        assert_eq!(
            output.thread_state_slice.unwrap().thread_state,
            ThreadState::Runnable
        );
    }

    #[test]
    fn first_contact_produces_no_slice() {
        let mut tracker = tracker();
        let output = tracker.handle_switch(&switch(7, 1_000, 0, true, false));
        assert_eq!(output, SwitchOutput::default());
    }

    #[test]
    fn duplicate_switch_out_is_tolerated() {
        let mut tracker = tracker();
        tracker.handle_switch(&switch(7, 1_000, 0, false, false));
        tracker.handle_switch(&switch(7, 1_500, 0, true, false));
        assert_eq!(
            tracker.handle_switch(&switch(7, 1_500, 0, true, false)),
            SwitchOutput::default()
        );
        // The off span still starts at the first switch-out.
        let output = tracker.handle_switch(&switch(7, 2_000, 0, false, false));
        assert_eq!(output.thread_state_slice.unwrap().duration_ns, 500);
    }

    #[test]
    fn callstack_collection_marks_slices_as_waiting() {
        let mut tracker = ThreadStateTracker::new(
            true,
            true,
            ThreadStateChangeCallstackCollection::OnSwitchOut,
        );
        tracker.handle_switch(&switch(7, 1_000, 0, true, false));
        let output = tracker.handle_switch(&switch(7, 2_000, 0, false, false));
        assert_eq!(
            output
                .thread_state_slice
                .unwrap()
                .switch_out_or_wakeup_callstack_status,
            ThreadStateCallstackStatus::WaitingForCallstack
        );
    }

    #[test]
    fn disabled_outputs_stay_silent() {
        let mut tracker =
            ThreadStateTracker::new(false, false, ThreadStateChangeCallstackCollection::None);
        tracker.handle_switch(&switch(7, 1_000, 0, false, false));
        assert_eq!(
            tracker.handle_switch(&switch(7, 1_500, 0, true, false)),
            SwitchOutput::default()
        );
        assert_eq!(
            tracker.handle_switch(&switch(7, 2_000, 0, false, false)),
            SwitchOutput::default()
        );
    }
}
