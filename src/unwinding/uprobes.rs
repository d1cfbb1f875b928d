//! Repair of callstacks broken by uretprobe return-address hijacking, and
//! function-call timing from uprobe/uretprobe pairs.
//!
//! When a uprobe is attached at the entry of a function, the kernel rewrites
//! the return address on the user stack so that returning from the function
//! traps into the kernel. Any stack sample taken while the thread is inside
//! such a function unwinds into the `[uprobes]` trampoline map and stops
//! there, losing everything above the instrumented function.
//!
//! To rebuild those stacks we keep, per thread, a stack of the callstacks
//! collected when each instrumented function was entered. A sample that ends
//! in `[uprobes]` is spliced onto the most recent entry callstack for its
//! thread. Entry callstacks are stored already spliced, so one join step
//! suffices at any instrumentation depth.

use log::warn;
use rustc_hash::FxHashMap;

use super::{Callstack, CallstackKind, Frame};

/// Splices `callstack` onto `previous` (the most recent entry callstack for
/// the same thread): the frames up to the `[uprobes]` sentinel, then the
/// entry callstack minus its first frame, which is the instrumented
/// function's entry frame and already visible in the sample.
fn join_with_previous(mut callstack: Callstack, previous: &Callstack) -> Callstack {
    if callstack.frames.is_empty() {
        // The sample's own unwinding failed; there is nothing to splice to.
        return callstack;
    }
    if previous.frames.is_empty() {
        // The entry callstack is broken, so the outer part of this sample
        // is unknowable.
        let kind = if previous.kind == CallstackKind::Complete {
            CallstackKind::DwarfUnwindingError
        } else {
            previous.kind
        };
        return Callstack::empty(kind);
    }
    let Some(sentinel) = callstack.frames.iter().position(Frame::is_uprobes) else {
        return callstack;
    };
    callstack.frames.truncate(sentinel);
    callstack
        .frames
        .extend(previous.frames.iter().skip(1).cloned());
    if callstack.kind == CallstackKind::Complete {
        callstack.kind = previous.kind;
    }
    callstack
}

/// Per-thread bookkeeping of entry callstacks of the dynamically
/// instrumented functions currently on each thread's stack.
///
/// Events for one tid arrive in order from the merger, so no locking is
/// needed here.
#[derive(Debug, Default)]
pub struct UprobesCallstackManager {
    tid_uprobes_callstack_stacks: FxHashMap<i32, Vec<Callstack>>,
}

impl UprobesCallstackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes the callstack collected at the entry of an instrumented
    /// function and pushes it for later joins. Returns the processed entry
    /// callstack.
    pub fn process_uprobes_callstack(&mut self, tid: i32, callstack: Callstack) -> Callstack {
        let stack = self.tid_uprobes_callstack_stacks.entry(tid).or_default();
        let processed = match stack.last() {
            Some(previous) => join_with_previous(callstack, previous),
            None => callstack,
        };
        stack.push(processed.clone());
        processed
    }

    /// Repairs a sampled callstack for `tid`. The identity when no
    /// instrumented function is active on that thread.
    pub fn process_sampled_callstack(&mut self, tid: i32, callstack: Callstack) -> Callstack {
        match self
            .tid_uprobes_callstack_stacks
            .get(&tid)
            .and_then(|stack| stack.last())
        {
            Some(previous) => join_with_previous(callstack, previous),
            None => callstack,
        }
    }

    /// Pops the entry callstack matching this uretprobe. A uretprobe with
    /// no matching uprobe is a producer bug: logged and ignored.
    pub fn process_uretprobes(&mut self, tid: i32) {
        match self.tid_uprobes_callstack_stacks.get_mut(&tid) {
            Some(stack) if !stack.is_empty() => {
                stack.pop();
                if stack.is_empty() {
                    self.tid_uprobes_callstack_stacks.remove(&tid);
                }
            }
            _ => warn!("uretprobe without a matching uprobe for tid {tid}"),
        }
    }

    /// Drains all per-thread state at capture stop. Every remaining entry is
    /// a uprobe that never saw its uretprobe; returns `(tid, depth)` pairs
    /// for reporting.
    pub fn drain_dangling(&mut self) -> Vec<(i32, usize)> {
        let mut dangling: Vec<(i32, usize)> = self
            .tid_uprobes_callstack_stacks
            .drain()
            .map(|(tid, stack)| (tid, stack.len()))
            .collect();
        dangling.sort_unstable();
        dangling
    }
}

/// The closed span of one instrumented function call, produced when a
/// uretprobe matches its uprobe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpan {
    pub tid: i32,
    pub function_id: u64,
    /// Number of enclosing instrumented calls on the same thread.
    pub depth: u32,
    pub begin_timestamp: u64,
    pub end_timestamp: u64,
    pub return_value: u64,
    /// Integer argument registers captured at function entry, in call order.
    pub registers: Vec<u64>,
}

#[derive(Debug, Clone)]
struct OpenTimer {
    function_id: u64,
    begin_timestamp: u64,
    registers: Vec<u64>,
}

/// Matches uprobes against uretprobes per thread, LIFO, to produce
/// [`TimerSpan`]s.
#[derive(Debug, Default)]
pub struct FunctionCallManager {
    tid_timer_stacks: FxHashMap<i32, Vec<OpenTimer>>,
}

impl FunctionCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_uprobe(&mut self, tid: i32, function_id: u64, timestamp: u64, registers: Vec<u64>) {
        self.tid_timer_stacks
            .entry(tid)
            .or_default()
            .push(OpenTimer {
                function_id,
                begin_timestamp: timestamp,
                registers,
            });
    }

    pub fn on_uretprobe(
        &mut self,
        tid: i32,
        timestamp: u64,
        return_value: u64,
    ) -> Option<TimerSpan> {
        let stack = self.tid_timer_stacks.get_mut(&tid)?;
        let timer = stack.pop()?;
        let depth = stack.len() as u32;
        if stack.is_empty() {
            self.tid_timer_stacks.remove(&tid);
        }
        Some(TimerSpan {
            tid,
            function_id: timer.function_id,
            depth,
            begin_timestamp: timer.begin_timestamp,
            end_timestamp: timestamp,
            return_value,
            registers: timer.registers,
        })
    }

    /// Open timers left at capture stop, i.e. instrumented calls that never
    /// returned during the capture.
    pub fn drain_dangling(&mut self) -> Vec<(i32, u64)> {
        let mut dangling: Vec<(i32, u64)> = self
            .tid_timer_stacks
            .drain()
            .flat_map(|(tid, stack)| {
                stack
                    .into_iter()
                    .map(move |timer| (tid, timer.function_id))
            })
            .collect();
        dangling.sort_unstable();
        dangling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(function_name: &str) -> Frame {
        // Distinct pcs per name keep the frames distinguishable.
        let pc = function_name
            .bytes()
            .fold(0x1000u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        Frame {
            pc,
            module: Some("a.out".to_owned()),
            offset_in_module: pc & 0xfff,
        }
    }

    /// Builds a callstack from root-first names; the result is leaf-first.
    fn make_test_callstack(function_names: &[&str]) -> Callstack {
        let frames = function_names.iter().rev().map(|n| make_test_frame(n)).collect();
        Callstack::new(frames, CallstackKind::Complete)
    }

    fn make_test_uprobes_frame() -> Frame {
        Frame {
            pc: 0x7fff_f000,
            module: Some("[uprobes]".to_owned()),
            offset_in_module: 0,
        }
    }

    /// Like `make_test_callstack`, but broken: ends with the `[uprobes]`
    /// sentinel at its outer end.
    fn make_test_uprobes_callstack(function_names: &[&str]) -> Callstack {
        let mut callstack = make_test_callstack(function_names);
        callstack.frames.push(make_test_uprobes_frame());
        callstack
    }

    #[test]
    fn no_uprobes() {
        let mut manager = UprobesCallstackManager::new();

        let unwound = make_test_callstack(&["main", "alpha", "beta"]);
        let processed = manager.process_sampled_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);

        let unwound = make_test_callstack(&["main", "alpha", "gamma"]);
        let processed = manager.process_sampled_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);
    }

    #[test]
    fn one_uprobe() {
        let mut manager = UprobesCallstackManager::new();

        let unwound = make_test_callstack(&["main", "alpha"]);
        let processed = manager.process_sampled_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);

        // Begin FUNCTION().
        let unwound = make_test_callstack(&["main", "alpha", "FUNCTION"]);
        let processed = manager.process_uprobes_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);

        let unwound = make_test_uprobes_callstack(&["FUNCTION"]);
        let processed = manager.process_sampled_callstack(42, unwound);
        assert_eq!(processed, make_test_callstack(&["main", "alpha", "FUNCTION"]));

        let unwound = make_test_uprobes_callstack(&["FUNCTION", "beta"]);
        let processed = manager.process_sampled_callstack(42, unwound);
        assert_eq!(
            processed,
            make_test_callstack(&["main", "alpha", "FUNCTION", "beta"])
        );

        // End FUNCTION().
        manager.process_uretprobes(42);
        let unwound = make_test_callstack(&["main", "alpha"]);
        let processed = manager.process_sampled_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);
    }

    #[test]
    fn different_thread_is_untouched() {
        let mut manager = UprobesCallstackManager::new();

        // Begin FUNCTION() on tid 42.
        let unwound = make_test_callstack(&["main", "alpha", "FUNCTION"]);
        manager.process_uprobes_callstack(42, unwound);

        // Sample from tid 111.
        let unwound = make_test_callstack(&["thread", "omega"]);
        let processed = manager.process_sampled_callstack(111, unwound.clone());
        assert_eq!(processed, unwound);

        manager.process_uretprobes(42);
    }

    #[test]
    fn two_nested_uprobes_and_another_uprobe() {
        let mut manager = UprobesCallstackManager::new();

        let unwound = make_test_callstack(&["main", "alpha"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound.clone()),
            unwound
        );

        // Begin FOO().
        let unwound = make_test_callstack(&["main", "alpha", "FOO"]);
        assert_eq!(
            manager.process_uprobes_callstack(42, unwound.clone()),
            unwound
        );

        let unwound = make_test_uprobes_callstack(&["FOO"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound),
            make_test_callstack(&["main", "alpha", "FOO"])
        );

        // Begin BAR().
        let unwound = make_test_uprobes_callstack(&["FOO", "beta", "BAR"]);
        assert_eq!(
            manager.process_uprobes_callstack(42, unwound),
            make_test_callstack(&["main", "alpha", "FOO", "beta", "BAR"])
        );

        let unwound = make_test_uprobes_callstack(&["BAR", "gamma"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound),
            make_test_callstack(&["main", "alpha", "FOO", "beta", "BAR", "gamma"])
        );

        // End BAR().
        manager.process_uretprobes(42);
        let unwound = make_test_uprobes_callstack(&["FOO", "delta"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound),
            make_test_callstack(&["main", "alpha", "FOO", "delta"])
        );

        // End FOO().
        manager.process_uretprobes(42);
        let unwound = make_test_callstack(&["main"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound.clone()),
            unwound
        );

        // Begin FUNCTION().
        let unwound = make_test_callstack(&["main", "epsilon", "FUNCTION"]);
        assert_eq!(
            manager.process_uprobes_callstack(42, unwound.clone()),
            unwound
        );

        let unwound = make_test_uprobes_callstack(&["FUNCTION", "zeta"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound),
            make_test_callstack(&["main", "epsilon", "FUNCTION", "zeta"])
        );

        // End FUNCTION().
        manager.process_uretprobes(42);
        let unwound = make_test_callstack(&["main"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound.clone()),
            unwound
        );
    }

    #[test]
    fn unwinding_error_is_not_joined() {
        let mut manager = UprobesCallstackManager::new();

        // Begin FUNCTION().
        let unwound = make_test_callstack(&["main", "alpha", "FUNCTION"]);
        manager.process_uprobes_callstack(42, unwound);

        // Unwind error: zero frames in, zero frames out, status preserved.
        let unwound = Callstack::empty(CallstackKind::DwarfUnwindingError);
        let processed = manager.process_sampled_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);

        manager.process_uretprobes(42);
    }

    #[test]
    fn unwinding_error_on_the_entry_stack_loses_the_sample() {
        let mut manager = UprobesCallstackManager::new();

        // Begin FUNCTION() with a failed entry unwind.
        let unwound = Callstack::empty(CallstackKind::DwarfUnwindingError);
        let processed = manager.process_uprobes_callstack(42, unwound.clone());
        assert_eq!(processed, unwound);

        // A later broken sample cannot be repaired.
        let unwound = make_test_uprobes_callstack(&["FUNCTION", "beta"]);
        let processed = manager.process_sampled_callstack(42, unwound);
        assert!(processed.frames.is_empty());
        assert_eq!(processed.kind, CallstackKind::DwarfUnwindingError);

        manager.process_uretprobes(42);
    }

    #[test]
    fn uretprobe_without_uprobe_is_ignored() {
        let mut manager = UprobesCallstackManager::new();
        manager.process_uretprobes(42);

        let unwound = make_test_callstack(&["main"]);
        assert_eq!(
            manager.process_sampled_callstack(42, unwound.clone()),
            unwound
        );
    }

    #[test]
    fn dangling_uprobes_are_reported_at_drain() {
        let mut manager = UprobesCallstackManager::new();
        manager.process_uprobes_callstack(42, make_test_callstack(&["main", "f"]));
        manager.process_uprobes_callstack(42, make_test_uprobes_callstack(&["f", "g"]));
        manager.process_uprobes_callstack(7, make_test_callstack(&["main", "h"]));

        assert_eq!(manager.drain_dangling(), vec![(7, 1), (42, 2)]);
        assert!(manager.drain_dangling().is_empty());
    }

    #[test]
    fn function_calls_nest_lifo() {
        let mut manager = FunctionCallManager::new();
        manager.on_uprobe(42, 1, 100, vec![11, 22, 33]);
        manager.on_uprobe(42, 2, 110, vec![44, 55]);

        let inner = manager.on_uretprobe(42, 120, 7).unwrap();
        assert_eq!(inner.function_id, 2);
        assert_eq!(inner.depth, 1);
        assert_eq!((inner.begin_timestamp, inner.end_timestamp), (110, 120));
        assert_eq!(inner.return_value, 7);
        assert_eq!(inner.registers, vec![44, 55]);

        let outer = manager.on_uretprobe(42, 130, 0).unwrap();
        assert_eq!(outer.function_id, 1);
        assert_eq!(outer.depth, 0);
        assert_eq!((outer.begin_timestamp, outer.end_timestamp), (100, 130));
        assert_eq!(outer.registers, vec![11, 22, 33]);

        assert!(manager.on_uretprobe(42, 140, 0).is_none());
    }

    #[test]
    fn unreturned_calls_are_reported_at_drain() {
        let mut manager = FunctionCallManager::new();
        manager.on_uprobe(42, 1, 100, Vec::new());
        manager.on_uprobe(7, 9, 100, Vec::new());
        assert_eq!(manager.drain_dangling(), vec![(7, 9), (42, 1)]);
    }
}
