//! The capture driver: owns the per-capture state, the reader thread that
//! drains the ring buffers into the merger, and the consumer thread that
//! dispatches merged events through the visitor chain into the producer
//! event processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{error, warn};

use crate::config::{CaptureOptions, DynamicInstrumentationMethod};
use crate::context::CaptureContext;
use crate::error::CaptureError;
use crate::events::{
    EventVisitor, ExitEvent, LostEvent, MmapEvent, SchedSwitchEvent, StackSampleEvent,
    ThreadNameEvent, TracepointEvent, UprobeEvent, UretprobeEvent,
};
use crate::linux::perf_group::{monotonic_now_ns, PerfGroup};
use crate::linux::read_string_lossy;
use crate::linux::sys::{
    sample_reg_index, PERF_REG_X86_CX, PERF_REG_X86_DI, PERF_REG_X86_DX, PERF_REG_X86_R8,
    PERF_REG_X86_R9, PERF_REG_X86_SI, SAMPLE_REGS_COUNT,
};
use crate::merger::Merger;
use crate::producer::events::{
    CallstackInfo, CaptureFinished, CaptureFinishedStatus, CaptureStarted, ClockResolutionEvent,
    ErrorEnablingUserSpaceInstrumentationEvent, ErrorsWithPerfEventOpenEvent, FullCallstackSample,
    FullTracepointEvent, FunctionCall, FunctionInstrumentationFailure, LostPerfRecordsEvent,
    ModuleInfo, ModuleUpdateEvent, ModulesSnapshot, OutOfOrderEventsDiscardedEvent,
    ProducerCaptureEvent, ThreadName, ThreadNamesSnapshot, TracepointInfo, WarningEvent,
    WarningInstrumentingWithUserSpaceInstrumentationEvent,
};
use crate::producer::{
    ClientCaptureEventCollector, ProducerEventProcessor, ProducerProtocolError,
    KERNEL_TRACING_PRODUCER_ID,
};
use crate::unwinding::modules::LoadedModule;
use crate::unwinding::{FunctionCallManager, StackUnwinder, UprobesCallstackManager};

/// Dispatches merged kernel-tracing events into per-concern trackers and
/// forwards the results to the producer event processor.
///
/// Runs on the one consumer thread, which guarantees per-tid ordering for
/// the uprobes manager and single-threaded access to the interning tables'
/// lock.
struct CaptureVisitor<C: ClientCaptureEventCollector> {
    processor: Arc<ProducerEventProcessor<C>>,
    context: Arc<CaptureContext>,
    unwinder: StackUnwinder,
    callstack_manager: UprobesCallstackManager,
    function_calls: FunctionCallManager,
    thread_states: crate::unwinding::thread_state::ThreadStateTracker,
    tracepoint_names: rustc_hash::FxHashMap<u64, (String, String)>,
    holdback_ns: u64,
    max_seen_timestamp: u64,
    /// First protocol violation; ends the capture.
    fatal: Option<ProducerProtocolError>,
}

impl<C: ClientCaptureEventCollector> CaptureVisitor<C> {
    fn forward(&mut self, event: ProducerCaptureEvent) {
        if self.fatal.is_some() {
            return;
        }
        if let Err(violation) = self.processor.process(KERNEL_TRACING_PRODUCER_ID, event) {
            error!("{violation}");
            self.fatal = Some(violation);
        }
    }

    /// Discards events that arrive more than the holdback window after a
    /// younger event was already dispatched; such stragglers are reported
    /// on the stream instead of being delivered out of order.
    fn admit(&mut self, timestamp: u64) -> bool {
        if timestamp + self.holdback_ns < self.max_seen_timestamp {
            self.context.count_out_of_order_discarded();
            let end = self.max_seen_timestamp;
            self.forward(ProducerCaptureEvent::OutOfOrderEventsDiscardedEvent(
                OutOfOrderEventsDiscardedEvent {
                    duration_ns: end - timestamp,
                    end_timestamp_ns: end,
                },
            ));
            return false;
        }
        if timestamp > self.max_seen_timestamp {
            self.max_seen_timestamp = timestamp;
        }
        true
    }

    /// Reports dangling instrumentation state at capture stop.
    fn flush(&mut self) {
        for (tid, depth) in self.callstack_manager.drain_dangling() {
            self.forward(ProducerCaptureEvent::WarningEvent(WarningEvent {
                timestamp_ns: monotonic_now_ns(),
                message: format!(
                    "{depth} dynamically instrumented function(s) on tid {tid} never returned \
                     during the capture"
                ),
            }));
        }
        self.function_calls.drain_dangling();
    }
}

impl<C: ClientCaptureEventCollector> EventVisitor for CaptureVisitor<C> {
    fn visit_sched_switch(&mut self, e: SchedSwitchEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        self.context.count_context_switch();
        let output = self.thread_states.handle_switch(&e);
        if let Some(slice) = output.scheduling_slice {
            self.forward(ProducerCaptureEvent::SchedulingSlice(slice));
        }
        if let Some(slice) = output.thread_state_slice {
            self.forward(ProducerCaptureEvent::ThreadStateSlice(slice));
        }
    }

    fn visit_exit(&mut self, e: ExitEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        self.thread_states.remove_thread(e.tid);
    }

    fn visit_stack_sample(&mut self, e: StackSampleEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        self.context.count_stack_sample();
        let callstack = self.unwinder.unwind(&e.regs, &e.stack);
        let processed = self
            .callstack_manager
            .process_sampled_callstack(e.tid, callstack);
        if !processed.is_complete() {
            self.context.count_unwind_error();
        }
        self.forward(ProducerCaptureEvent::FullCallstackSample(
            FullCallstackSample {
                pid: e.pid,
                tid: e.tid,
                timestamp_ns: e.timestamp,
                callstack: CallstackInfo {
                    pcs: processed.pcs(),
                    kind: processed.kind,
                },
            },
        ));
    }

    fn visit_uprobe(&mut self, e: UprobeEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        let entry_callstack = self.unwinder.unwind(&e.regs, &e.stack);
        self.callstack_manager
            .process_uprobes_callstack(e.tid, entry_callstack);
        self.function_calls.on_uprobe(
            e.tid,
            e.function_id,
            e.timestamp,
            argument_registers(&e.regs),
        );
    }

    fn visit_uretprobe(&mut self, e: UretprobeEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        self.callstack_manager.process_uretprobes(e.tid);
        if let Some(span) = self
            .function_calls
            .on_uretprobe(e.tid, e.timestamp, e.return_value)
        {
            self.forward(ProducerCaptureEvent::FunctionCall(FunctionCall {
                pid: e.pid,
                tid: span.tid,
                function_id: span.function_id,
                duration_ns: span.end_timestamp - span.begin_timestamp,
                end_timestamp_ns: span.end_timestamp,
                depth: span.depth as i32,
                return_value: span.return_value,
                registers: span.registers,
            }));
        }
    }

    fn visit_tracepoint(&mut self, e: TracepointEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        let Some((category, name)) = self.tracepoint_names.get(&e.tracepoint_id) else {
            warn!("record for unknown tracepoint id {}", e.tracepoint_id);
            return;
        };
        let tracepoint_info = TracepointInfo {
            category: category.clone(),
            name: name.clone(),
        };
        self.forward(ProducerCaptureEvent::FullTracepointEvent(
            FullTracepointEvent {
                pid: e.pid,
                tid: e.tid,
                timestamp_ns: e.timestamp,
                cpu: e.cpu as i32,
                tracepoint_info,
            },
        ));
    }

    fn visit_mmap(&mut self, e: MmapEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        if e.pid != self.context.target_pid {
            return;
        }
        if let Some(module) = self.unwinder.handle_mmap(&e) {
            self.forward(ProducerCaptureEvent::ModuleUpdateEvent(ModuleUpdateEvent {
                pid: e.pid,
                timestamp_ns: e.timestamp,
                module: module_info(&module),
            }));
        }
    }

    fn visit_thread_name(&mut self, e: ThreadNameEvent) {
        if !self.admit(e.timestamp) {
            return;
        }
        self.forward(ProducerCaptureEvent::ThreadName(ThreadName {
            pid: e.pid,
            tid: e.tid,
            timestamp_ns: e.timestamp,
            name: e.name,
        }));
    }

    fn visit_lost(&mut self, e: LostEvent) {
        self.context.count_lost_records(e.lost);
        self.forward(ProducerCaptureEvent::LostPerfRecordsEvent(
            LostPerfRecordsEvent {
                duration_ns: 0,
                end_timestamp_ns: e.timestamp,
            },
        ));
    }
}

/// The x86-64 System V integer argument registers, in call order, pulled
/// out of an entry register snapshot.
fn argument_registers(regs: &[u64; SAMPLE_REGS_COUNT]) -> Vec<u64> {
    [
        PERF_REG_X86_DI,
        PERF_REG_X86_SI,
        PERF_REG_X86_DX,
        PERF_REG_X86_CX,
        PERF_REG_X86_R8,
        PERF_REG_X86_R9,
    ]
    .iter()
    .map(|&register| regs[sample_reg_index(register)])
    .collect()
}

fn module_info(module: &LoadedModule) -> ModuleInfo {
    ModuleInfo {
        name: module.name.clone(),
        file_path: module.file_path.clone(),
        file_size: module.file_size,
        address_start: module.address_start,
        address_end: module.address_end,
        build_id: module.build_id.clone(),
        load_bias: module.load_bias,
    }
}

fn thread_names_snapshot(pid: u32, timestamp_ns: u64) -> ThreadNamesSnapshot {
    let mut thread_names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/task")) {
        for entry in entries.flatten() {
            let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            let comm_path = format!("/proc/{pid}/task/{tid}/comm");
            let Ok(buffer) = std::fs::read(comm_path) else {
                continue;
            };
            let length = memchr::memchr(b'\0', &buffer).unwrap_or(buffer.len());
            let name = String::from_utf8_lossy(&buffer[..length])
                .trim_end()
                .to_owned();
            thread_names.push(ThreadName {
                pid: pid as i32,
                tid,
                timestamp_ns,
                name,
            });
        }
    }
    ThreadNamesSnapshot {
        timestamp_ns,
        thread_names,
    }
}

fn clock_resolution_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// A running capture. All per-capture state lives behind this handle and is
/// torn down by [`CaptureHandle::stop`].
pub struct CaptureHandle<C: ClientCaptureEventCollector + 'static> {
    stop_flag: Arc<AtomicBool>,
    stop_sender: Sender<()>,
    reader: thread::JoinHandle<Result<(), String>>,
    consumer: thread::JoinHandle<CaptureVisitor<C>>,
    processor: Arc<ProducerEventProcessor<C>>,
    context: Arc<CaptureContext>,
}

pub struct Capture;

impl Capture {
    /// Starts a capture of `pid`, delivering client events to `collector`
    /// until [`CaptureHandle::stop`] is called.
    pub fn start<C: ClientCaptureEventCollector + 'static>(
        pid: u32,
        options: CaptureOptions,
        collector: C,
    ) -> Result<CaptureHandle<C>, CaptureError> {
        options.validate()?;

        let start_timestamp = monotonic_now_ns();
        let context = Arc::new(CaptureContext::new(pid as i32, start_timestamp));
        let processor = Arc::new(ProducerEventProcessor::new(collector));
        let emit = |event: ProducerCaptureEvent| -> Result<(), CaptureError> {
            processor
                .process(KERNEL_TRACING_PRODUCER_ID, event)
                .map_err(CaptureError::from)
        };

        let mut unwinder = StackUnwinder::new(options.unwinding_method);
        let maps_text =
            read_string_lossy(format!("/proc/{pid}/maps")).map_err(CaptureError::Io)?;
        let modules = unwinder
            .set_maps(&maps_text)
            .map_err(|source| CaptureError::InvalidMaps {
                pid: pid as i32,
                source,
            })?;

        let executable_path = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        let executable_build_id = modules
            .iter()
            .find(|module| module.file_path == executable_path)
            .map(|module| module.build_id.clone())
            .unwrap_or_default();

        emit(ProducerCaptureEvent::CaptureStarted(CaptureStarted {
            process_id: pid as i32,
            executable_path,
            executable_build_id,
            capture_start_timestamp_ns: start_timestamp,
            capture_options: options.clone(),
        }))?;
        emit(ProducerCaptureEvent::ClockResolutionEvent(
            ClockResolutionEvent {
                timestamp_ns: start_timestamp,
                clock_resolution_ns: clock_resolution_ns(),
            },
        ))?;
        emit(ProducerCaptureEvent::ModulesSnapshot(ModulesSnapshot {
            pid: pid as i32,
            timestamp_ns: start_timestamp,
            modules: modules.iter().map(module_info).collect(),
        }))?;
        emit(ProducerCaptureEvent::ThreadNamesSnapshot(
            thread_names_snapshot(pid, start_timestamp),
        ))?;

        if options.dynamic_instrumentation_method
            == DynamicInstrumentationMethod::UserSpaceInstrumentation
        {
            // Only uprobes-based instrumentation is supported here; report
            // the fallback and continue with uprobes.
            emit(ProducerCaptureEvent::ErrorEnablingUserSpaceInstrumentationEvent(
                ErrorEnablingUserSpaceInstrumentationEvent {
                    timestamp_ns: start_timestamp,
                    message: "user space instrumentation is not available; falling back to uprobes"
                        .to_owned(),
                },
            ))?;
        }

        let mut group =
            PerfGroup::open(pid, &options).map_err(CaptureError::PerfEventOpenFailedOnAllCpus)?;
        if !group.failed_cpus().is_empty() {
            emit(ProducerCaptureEvent::ErrorsWithPerfEventOpenEvent(
                ErrorsWithPerfEventOpenEvent {
                    timestamp_ns: monotonic_now_ns(),
                    failed_to_open: group
                        .failed_cpus()
                        .iter()
                        .map(|(cpu, message)| format!("cpu {cpu}: {message}"))
                        .collect(),
                },
            ))?;
        }
        if !group.failed_instrumented_functions().is_empty() {
            emit(
                ProducerCaptureEvent::WarningInstrumentingWithUserSpaceInstrumentationEvent(
                    WarningInstrumentingWithUserSpaceInstrumentationEvent {
                        timestamp_ns: monotonic_now_ns(),
                        functions_that_failed: group
                            .failed_instrumented_functions()
                            .iter()
                            .map(|(function_id, error_message)| FunctionInstrumentationFailure {
                                function_id: *function_id,
                                error_message: error_message.clone(),
                            })
                            .collect(),
                    },
                ),
            )?;
        }
        let tracepoint_names = group.tracepoint_names().clone();

        let merger = Arc::new(Merger::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));
        let (stop_sender, stop_receiver) = crossbeam_channel::bounded::<()>(1);

        group.enable().map_err(CaptureError::Io)?;

        let reader = {
            let merger = Arc::clone(&merger);
            let reader_done = Arc::clone(&reader_done);
            thread::spawn(move || {
                let result = reader_loop(&mut group, &merger, &stop_receiver);
                reader_done.store(true, Ordering::SeqCst);
                result
            })
        };

        let consumer = {
            let merger = Arc::clone(&merger);
            let stop_flag = Arc::clone(&stop_flag);
            let reader_done = Arc::clone(&reader_done);
            let mut visitor = CaptureVisitor {
                processor: Arc::clone(&processor),
                context: Arc::clone(&context),
                unwinder,
                callstack_manager: UprobesCallstackManager::new(),
                function_calls: FunctionCallManager::new(),
                thread_states: crate::unwinding::thread_state::ThreadStateTracker::new(
                    options.collect_scheduler_info,
                    options.collect_thread_states,
                    options.thread_state_change_callstack_collection,
                ),
                tracepoint_names,
                holdback_ns: merger.holdback_ns(),
                max_seen_timestamp: 0,
                fatal: None,
            };
            thread::spawn(move || {
                loop {
                    merger.wait_for_events(Duration::from_millis(10));
                    merger.drain_up_to_window(&mut visitor);
                    if visitor.fatal.is_some() {
                        break;
                    }
                    if stop_flag.load(Ordering::SeqCst)
                        && reader_done.load(Ordering::SeqCst)
                        && !merger.has_queued_events()
                    {
                        break;
                    }
                }
                merger.drain_all(&mut visitor);
                visitor.flush();
                visitor
            })
        };

        Ok(CaptureHandle {
            stop_flag,
            stop_sender,
            reader,
            consumer,
            processor,
            context,
        })
    }
}

fn reader_loop(
    group: &mut PerfGroup,
    merger: &Merger,
    stop_receiver: &Receiver<()>,
) -> Result<(), String> {
    loop {
        match stop_receiver.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        group.wait();
        group
            .consume_into(merger)
            .map_err(|error| error.to_string())?;
    }
    // One final sweep so nothing the kernel wrote up to the stop request is
    // lost.
    group.consume_into(merger).map_err(|error| error.to_string())?;
    Ok(())
}

impl<C: ClientCaptureEventCollector + 'static> CaptureHandle<C> {
    pub fn context(&self) -> &CaptureContext {
        &self.context
    }

    /// Stops the capture: signals the reader, waits for the consumer to
    /// drain the merger and flush the processor, emits `CaptureFinished`,
    /// and hands back the collector.
    pub fn stop(self) -> Result<C, CaptureError> {
        let _ = self.stop_sender.send(());
        self.stop_flag.store(true, Ordering::SeqCst);

        let reader_result = match self.reader.join() {
            Ok(result) => result,
            Err(_) => Err("reader thread panicked".to_owned()),
        };

        let visitor = match self.consumer.join() {
            Ok(visitor) => visitor,
            Err(_) => {
                return Err(CaptureError::Io(std::io::Error::other(
                    "consumer thread panicked",
                )))
            }
        };

        let fatal = visitor.fatal.clone();
        drop(visitor);

        let (status, error_message) = match (&reader_result, &fatal) {
            (Err(message), _) => (CaptureFinishedStatus::Failed, message.clone()),
            (_, Some(violation)) => (CaptureFinishedStatus::Failed, violation.to_string()),
            _ => (CaptureFinishedStatus::Successful, String::new()),
        };
        self.processor
            .process(
                KERNEL_TRACING_PRODUCER_ID,
                ProducerCaptureEvent::CaptureFinished(CaptureFinished {
                    status,
                    error_message,
                }),
            )
            .map_err(CaptureError::from)?;

        let processor = Arc::try_unwrap(self.processor)
            .unwrap_or_else(|_| unreachable!("all other processor handles have been joined"));

        if let Some(violation) = fatal {
            // The collector has already seen CaptureFinished { Failed }.
            let _ = processor.into_collector();
            return Err(CaptureError::ProducerProtocol(violation));
        }
        Ok(processor.into_collector())
    }
}
