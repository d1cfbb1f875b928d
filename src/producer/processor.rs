use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::collector::ClientCaptureEventCollector;
use super::events::*;

/// A producer broke the interning protocol. Fatal for the capture: the
/// owner emits `CaptureFinished { Failed }` and tears down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerProtocolError {
    #[error("producer {producer_id} re-used string key {key}")]
    DuplicateStringKey { producer_id: u64, key: InternKey },

    #[error("producer {producer_id} re-used callstack key {key}")]
    DuplicateCallstackKey { producer_id: u64, key: InternKey },

    #[error("producer {producer_id} referenced unregistered string key {key}")]
    UnknownStringKey { producer_id: u64, key: InternKey },

    #[error("producer {producer_id} referenced unregistered callstack key {key}")]
    UnknownCallstackKey { producer_id: u64, key: InternKey },
}

struct State<C> {
    collector: C,
    next_key: InternKey,
    /// Canonical global interning tables, keyed by structural value.
    string_table: FxHashMap<String, InternKey>,
    callstack_table: FxHashMap<CallstackInfo, InternKey>,
    tracepoint_table: FxHashMap<TracepointInfo, InternKey>,
    /// Producer-local key → global key, per interning class.
    producer_string_keys: FxHashMap<(u64, InternKey), InternKey>,
    producer_callstack_keys: FxHashMap<(u64, InternKey), InternKey>,
    /// Thread-state-change callstacks waiting for their slice, keyed on
    /// `(tid, slice start timestamp)`.
    pending_thread_state_callstacks: FxHashMap<(i32, u64), CallstackInfo>,
}

impl<C: ClientCaptureEventCollector> State<C> {
    fn allocate_key(&mut self) -> InternKey {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Returns the global key for this string, emitting the interning entry
    /// if the value is new.
    fn intern_string(&mut self, text: &str) -> InternKey {
        if let Some(&key) = self.string_table.get(text) {
            return key;
        }
        let key = self.allocate_key();
        self.string_table.insert(text.to_owned(), key);
        self.collector
            .add_event(ClientCaptureEvent::InternedString(InternedString {
                key,
                intern: text.to_owned(),
            }));
        key
    }

    fn intern_callstack(&mut self, callstack: &CallstackInfo) -> InternKey {
        if let Some(&key) = self.callstack_table.get(callstack) {
            return key;
        }
        let key = self.allocate_key();
        self.callstack_table.insert(callstack.clone(), key);
        self.collector
            .add_event(ClientCaptureEvent::InternedCallstack(InternedCallstack {
                key,
                intern: callstack.clone(),
            }));
        key
    }

    fn intern_tracepoint(&mut self, tracepoint: &TracepointInfo) -> InternKey {
        if let Some(&key) = self.tracepoint_table.get(tracepoint) {
            return key;
        }
        let key = self.allocate_key();
        self.tracepoint_table.insert(tracepoint.clone(), key);
        self.collector.add_event(ClientCaptureEvent::InternedTracepointInfo(
            InternedTracepointInfo {
                key,
                intern: tracepoint.clone(),
            },
        ));
        key
    }

    fn translate_string_key(
        &self,
        producer_id: u64,
        key: InternKey,
    ) -> Result<InternKey, ProducerProtocolError> {
        self.producer_string_keys
            .get(&(producer_id, key))
            .copied()
            .ok_or(ProducerProtocolError::UnknownStringKey { producer_id, key })
    }

    fn translate_callstack_key(
        &self,
        producer_id: u64,
        key: InternKey,
    ) -> Result<InternKey, ProducerProtocolError> {
        self.producer_callstack_keys
            .get(&(producer_id, key))
            .copied()
            .ok_or(ProducerProtocolError::UnknownCallstackKey { producer_id, key })
    }

    fn emit(&mut self, event: ClientCaptureEvent) {
        self.collector.add_event(event);
    }
}

/// Merges the event streams of all producers into one client stream.
///
/// Every producer assigns its own interning keys; the processor translates
/// them into global keys, deduplicating structurally equal values across
/// producers, and guarantees that the interning entry for a global key is
/// emitted exactly once and before any event referencing it.
///
/// One mutex guards all state, so `process` may be called from any thread
/// and the collector observes a total order of events.
pub struct ProducerEventProcessor<C: ClientCaptureEventCollector> {
    state: Mutex<State<C>>,
}

impl<C: ClientCaptureEventCollector> ProducerEventProcessor<C> {
    pub fn new(collector: C) -> Self {
        ProducerEventProcessor {
            state: Mutex::new(State {
                collector,
                next_key: INVALID_INTERN_ID + 1,
                string_table: FxHashMap::default(),
                callstack_table: FxHashMap::default(),
                tracepoint_table: FxHashMap::default(),
                producer_string_keys: FxHashMap::default(),
                producer_callstack_keys: FxHashMap::default(),
                pending_thread_state_callstacks: FxHashMap::default(),
            }),
        }
    }

    /// Tears the processor down and hands back the collector after flushing
    /// it.
    pub fn into_collector(self) -> C {
        let mut state = self.state.into_inner();
        state.collector.finish();
        state.collector
    }

    /// Processes one event from `producer_id`, delivering zero or more
    /// client events to the collector. Errors indicate a producer protocol
    /// violation and are fatal for the capture.
    pub fn process(
        &self,
        producer_id: u64,
        event: ProducerCaptureEvent,
    ) -> Result<(), ProducerProtocolError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match event {
            ProducerCaptureEvent::InternedString(interned) => {
                if state
                    .producer_string_keys
                    .contains_key(&(producer_id, interned.key))
                {
                    return Err(ProducerProtocolError::DuplicateStringKey {
                        producer_id,
                        key: interned.key,
                    });
                }
                let global = state.intern_string(&interned.intern);
                state
                    .producer_string_keys
                    .insert((producer_id, interned.key), global);
            }
            ProducerCaptureEvent::InternedCallstack(interned) => {
                if state
                    .producer_callstack_keys
                    .contains_key(&(producer_id, interned.key))
                {
                    return Err(ProducerProtocolError::DuplicateCallstackKey {
                        producer_id,
                        key: interned.key,
                    });
                }
                let global = state.intern_callstack(&interned.intern);
                state
                    .producer_callstack_keys
                    .insert((producer_id, interned.key), global);
            }
            ProducerCaptureEvent::FullCallstackSample(sample) => {
                let callstack_id = state.intern_callstack(&sample.callstack);
                state.emit(ClientCaptureEvent::CallstackSample(CallstackSample {
                    pid: sample.pid,
                    tid: sample.tid,
                    timestamp_ns: sample.timestamp_ns,
                    callstack_id,
                }));
            }
            ProducerCaptureEvent::CallstackSample(mut sample) => {
                sample.callstack_id =
                    state.translate_callstack_key(producer_id, sample.callstack_id)?;
                state.emit(ClientCaptureEvent::CallstackSample(sample));
            }
            ProducerCaptureEvent::FullTracepointEvent(event) => {
                let tracepoint_info_key = state.intern_tracepoint(&event.tracepoint_info);
                state.emit(ClientCaptureEvent::TracepointEvent(TracepointEvent {
                    pid: event.pid,
                    tid: event.tid,
                    timestamp_ns: event.timestamp_ns,
                    cpu: event.cpu,
                    tracepoint_info_key,
                }));
            }
            ProducerCaptureEvent::FullGpuJob(job) => {
                let timeline_key = state.intern_string(&job.timeline);
                state.emit(ClientCaptureEvent::GpuJob(GpuJob {
                    pid: job.pid,
                    tid: job.tid,
                    context: job.context,
                    seqno: job.seqno,
                    depth: job.depth,
                    amdgpu_cs_ioctl_time_ns: job.amdgpu_cs_ioctl_time_ns,
                    amdgpu_sched_run_job_time_ns: job.amdgpu_sched_run_job_time_ns,
                    gpu_hardware_start_time_ns: job.gpu_hardware_start_time_ns,
                    dma_fence_signaled_time_ns: job.dma_fence_signaled_time_ns,
                    timeline_key,
                }));
            }
            ProducerCaptureEvent::FullAddressInfo(info) => {
                let function_name_key = state.intern_string(&info.function_name);
                let module_name_key = state.intern_string(&info.module_name);
                state.emit(ClientCaptureEvent::AddressInfo(AddressInfo {
                    absolute_address: info.absolute_address,
                    offset_in_function: info.offset_in_function,
                    function_name_key,
                    module_name_key,
                }));
            }
            ProducerCaptureEvent::GpuQueueSubmission(mut submission) => {
                for marker in &mut submission.completed_markers {
                    if marker.text_key != INVALID_INTERN_ID {
                        marker.text_key =
                            state.translate_string_key(producer_id, marker.text_key)?;
                    }
                }
                state.emit(ClientCaptureEvent::GpuQueueSubmission(submission));
            }
            ProducerCaptureEvent::ThreadStateSliceCallstack(callstack) => {
                state.pending_thread_state_callstacks.insert(
                    (callstack.thread_state_slice_tid, callstack.timestamp_ns),
                    callstack.callstack,
                );
            }
            ProducerCaptureEvent::ThreadStateSlice(mut slice) => {
                if slice.switch_out_or_wakeup_callstack_status
                    == ThreadStateCallstackStatus::WaitingForCallstack
                {
                    let start_timestamp = slice.end_timestamp_ns - slice.duration_ns;
                    match state
                        .pending_thread_state_callstacks
                        .remove(&(slice.tid, start_timestamp))
                    {
                        Some(callstack) => {
                            let key = state.intern_callstack(&callstack);
                            slice.switch_out_or_wakeup_callstack_status =
                                ThreadStateCallstackStatus::CallstackSet;
                            slice.switch_out_or_wakeup_callstack_id = key;
                        }
                        None => {
                            slice.switch_out_or_wakeup_callstack_status =
                                ThreadStateCallstackStatus::NoCallstack;
                        }
                    }
                }
                state.emit(ClientCaptureEvent::ThreadStateSlice(slice));
            }
            ProducerCaptureEvent::CaptureStarted(e) => {
                state.emit(ClientCaptureEvent::CaptureStarted(e));
            }
            ProducerCaptureEvent::CaptureFinished(e) => {
                state.emit(ClientCaptureEvent::CaptureFinished(e));
            }
            ProducerCaptureEvent::SchedulingSlice(e) => {
                state.emit(ClientCaptureEvent::SchedulingSlice(e));
            }
            ProducerCaptureEvent::FunctionCall(e) => {
                state.emit(ClientCaptureEvent::FunctionCall(e));
            }
            ProducerCaptureEvent::ThreadName(e) => {
                state.emit(ClientCaptureEvent::ThreadName(e));
            }
            ProducerCaptureEvent::ThreadNamesSnapshot(e) => {
                state.emit(ClientCaptureEvent::ThreadNamesSnapshot(e));
            }
            ProducerCaptureEvent::ModuleUpdateEvent(e) => {
                state.emit(ClientCaptureEvent::ModuleUpdateEvent(e));
            }
            ProducerCaptureEvent::ModulesSnapshot(e) => {
                state.emit(ClientCaptureEvent::ModulesSnapshot(e));
            }
            ProducerCaptureEvent::MemoryUsageEvent(e) => {
                state.emit(ClientCaptureEvent::MemoryUsageEvent(e));
            }
            ProducerCaptureEvent::ApiScopeStart(e) => {
                state.emit(ClientCaptureEvent::ApiScopeStart(e));
            }
            ProducerCaptureEvent::ApiScopeStop(e) => {
                state.emit(ClientCaptureEvent::ApiScopeStop(e));
            }
            ProducerCaptureEvent::ApiScopeStartAsync(e) => {
                state.emit(ClientCaptureEvent::ApiScopeStartAsync(e));
            }
            ProducerCaptureEvent::ApiScopeStopAsync(e) => {
                state.emit(ClientCaptureEvent::ApiScopeStopAsync(e));
            }
            ProducerCaptureEvent::ApiStringEvent(e) => {
                state.emit(ClientCaptureEvent::ApiStringEvent(e));
            }
            ProducerCaptureEvent::ApiTrackInt(e) => {
                state.emit(ClientCaptureEvent::ApiTrackInt(e));
            }
            ProducerCaptureEvent::ApiTrackInt64(e) => {
                state.emit(ClientCaptureEvent::ApiTrackInt64(e));
            }
            ProducerCaptureEvent::ApiTrackUint(e) => {
                state.emit(ClientCaptureEvent::ApiTrackUint(e));
            }
            ProducerCaptureEvent::ApiTrackUint64(e) => {
                state.emit(ClientCaptureEvent::ApiTrackUint64(e));
            }
            ProducerCaptureEvent::ApiTrackFloat(e) => {
                state.emit(ClientCaptureEvent::ApiTrackFloat(e));
            }
            ProducerCaptureEvent::ApiTrackDouble(e) => {
                state.emit(ClientCaptureEvent::ApiTrackDouble(e));
            }
            ProducerCaptureEvent::WarningEvent(e) => {
                state.emit(ClientCaptureEvent::WarningEvent(e));
            }
            ProducerCaptureEvent::ClockResolutionEvent(e) => {
                state.emit(ClientCaptureEvent::ClockResolutionEvent(e));
            }
            ProducerCaptureEvent::ErrorsWithPerfEventOpenEvent(e) => {
                state.emit(ClientCaptureEvent::ErrorsWithPerfEventOpenEvent(e));
            }
            ProducerCaptureEvent::ErrorEnablingApiEvent(e) => {
                state.emit(ClientCaptureEvent::ErrorEnablingApiEvent(e));
            }
            ProducerCaptureEvent::ErrorEnablingUserSpaceInstrumentationEvent(e) => {
                state.emit(ClientCaptureEvent::ErrorEnablingUserSpaceInstrumentationEvent(e));
            }
            ProducerCaptureEvent::WarningInstrumentingWithUserSpaceInstrumentationEvent(e) => {
                state.emit(
                    ClientCaptureEvent::WarningInstrumentingWithUserSpaceInstrumentationEvent(e),
                );
            }
            ProducerCaptureEvent::LostPerfRecordsEvent(e) => {
                state.emit(ClientCaptureEvent::LostPerfRecordsEvent(e));
            }
            ProducerCaptureEvent::OutOfOrderEventsDiscardedEvent(e) => {
                state.emit(ClientCaptureEvent::OutOfOrderEventsDiscardedEvent(e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::collector::VecCollector;
    use crate::unwinding::CallstackKind;

    const PRODUCER_1: u64 = 1;
    const PRODUCER_2: u64 = 2;

    const PID_1: i32 = 5;
    const TID_1: i32 = 7;
    const TID_2: i32 = 111;
    const KEY_1: InternKey = 13;
    const KEY_2: InternKey = 113;
    const TIMESTAMP_1: u64 = 7723;
    const TIMESTAMP_2: u64 = 7727;
    const DURATION_1: u64 = 971;
    const DURATION_2: u64 = 977;

    fn processor() -> ProducerEventProcessor<VecCollector> {
        ProducerEventProcessor::new(VecCollector::default())
    }

    fn callstack(pcs: &[u64], kind: CallstackKind) -> CallstackInfo {
        CallstackInfo {
            pcs: pcs.to_vec(),
            kind,
        }
    }

    fn interned_string_event(key: InternKey, text: &str) -> ProducerCaptureEvent {
        ProducerCaptureEvent::InternedString(InternedString {
            key,
            intern: text.to_owned(),
        })
    }

    fn interned_callstack_event(key: InternKey, callstack: CallstackInfo) -> ProducerCaptureEvent {
        ProducerCaptureEvent::InternedCallstack(InternedCallstack {
            key,
            intern: callstack,
        })
    }

    #[test]
    fn scheduling_slice_passes_through() {
        let processor = processor();
        let slice = SchedulingSlice {
            pid: PID_1,
            tid: TID_1,
            core: 11,
            duration_ns: DURATION_1,
            out_timestamp_ns: TIMESTAMP_1,
        };
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::SchedulingSlice(slice.clone()))
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events, vec![ClientCaptureEvent::SchedulingSlice(slice)]);
    }

    #[test]
    fn one_interned_callstack_gets_a_global_key() {
        let processor = processor();
        let intern = callstack(&[1, 2, 3], CallstackKind::Complete);
        processor
            .process(PRODUCER_1, interned_callstack_event(KEY_1, intern.clone()))
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 1);
        let ClientCaptureEvent::InternedCallstack(actual) = &events[0] else {
            panic!("expected an interned callstack, got {:?}", events[0]);
        };
        assert_ne!(actual.key, INVALID_INTERN_ID);
        assert_eq!(actual.intern, intern);
    }

    #[test]
    fn same_frames_different_kinds_are_distinct_callstacks() {
        let processor = processor();
        processor
            .process(
                PRODUCER_1,
                interned_callstack_event(KEY_1, callstack(&[1, 2, 3], CallstackKind::Complete)),
            )
            .unwrap();
        processor
            .process(
                PRODUCER_1,
                interned_callstack_event(
                    KEY_2,
                    callstack(&[1, 2, 3], CallstackKind::DwarfUnwindingError),
                ),
            )
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 2);
        let keys: Vec<InternKey> = events
            .iter()
            .map(|event| match event {
                ClientCaptureEvent::InternedCallstack(c) => c.key,
                other => panic!("expected interned callstacks, got {other:?}"),
            })
            .collect();
        assert_ne!(keys[0], keys[1]);
        assert!(keys.iter().all(|&key| key != INVALID_INTERN_ID));
    }

    #[test]
    fn different_producers_may_reuse_local_callstack_keys() {
        let processor = processor();
        processor
            .process(
                PRODUCER_1,
                interned_callstack_event(KEY_1, callstack(&[1, 2, 3], CallstackKind::Complete)),
            )
            .unwrap();
        processor
            .process(
                PRODUCER_2,
                interned_callstack_event(KEY_1, callstack(&[1, 2, 4], CallstackKind::Complete)),
            )
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 2);
        let (first, second) = match (&events[0], &events[1]) {
            (
                ClientCaptureEvent::InternedCallstack(first),
                ClientCaptureEvent::InternedCallstack(second),
            ) => (first, second),
            other => panic!("expected two interned callstacks, got {other:?}"),
        };
        assert_ne!(first.key, second.key);
        assert_eq!(first.intern.pcs, vec![1, 2, 3]);
        assert_eq!(second.intern.pcs, vec![1, 2, 4]);
    }

    #[test]
    fn equal_callstacks_from_different_producers_intern_once() {
        let processor = processor();
        let intern = callstack(&[1, 2, 3], CallstackKind::Complete);
        processor
            .process(PRODUCER_1, interned_callstack_event(KEY_1, intern.clone()))
            .unwrap();
        processor
            .process(PRODUCER_2, interned_callstack_event(KEY_2, intern.clone()))
            .unwrap();

        // Both producers' local keys must still translate, to the same
        // global key.
        processor
            .process(
                PRODUCER_1,
                ProducerCaptureEvent::CallstackSample(CallstackSample {
                    pid: PID_1,
                    tid: TID_1,
                    timestamp_ns: TIMESTAMP_1,
                    callstack_id: KEY_1,
                }),
            )
            .unwrap();
        processor
            .process(
                PRODUCER_2,
                ProducerCaptureEvent::CallstackSample(CallstackSample {
                    pid: PID_1,
                    tid: TID_2,
                    timestamp_ns: TIMESTAMP_2,
                    callstack_id: KEY_2,
                }),
            )
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedCallstack(interned) = &events[0] else {
            panic!("expected one interned callstack first, got {:?}", events[0]);
        };
        for event in &events[1..] {
            let ClientCaptureEvent::CallstackSample(sample) = event else {
                panic!("expected callstack samples, got {event:?}");
            };
            assert_eq!(sample.callstack_id, interned.key);
        }
    }

    #[test]
    fn one_interned_string_gets_a_global_key() {
        let processor = processor();
        processor
            .process(PRODUCER_1, interned_string_event(KEY_1, "string"))
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 1);
        let ClientCaptureEvent::InternedString(actual) = &events[0] else {
            panic!("expected an interned string, got {:?}", events[0]);
        };
        assert_ne!(actual.key, INVALID_INTERN_ID);
        assert_eq!(actual.intern, "string");
    }

    #[test]
    fn different_producers_may_reuse_local_string_keys() {
        let processor = processor();
        processor
            .process(PRODUCER_1, interned_string_event(KEY_1, "string1"))
            .unwrap();
        processor
            .process(PRODUCER_2, interned_string_event(KEY_1, "string2"))
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 2);
        let (first, second) = match (&events[0], &events[1]) {
            (
                ClientCaptureEvent::InternedString(first),
                ClientCaptureEvent::InternedString(second),
            ) => (first, second),
            other => panic!("expected two interned strings, got {other:?}"),
        };
        assert_ne!(first.key, second.key);
        assert_eq!(first.intern, "string1");
        assert_eq!(second.intern, "string2");
    }

    #[test]
    fn equal_strings_from_different_producers_intern_once() {
        let processor = processor();
        processor
            .process(PRODUCER_1, interned_string_event(KEY_1, "string"))
            .unwrap();
        processor
            .process(PRODUCER_2, interned_string_event(KEY_2, "string"))
            .unwrap();

        // Both producers then reference their own local key from a gpu
        // debug marker; both must translate to the one global key.
        for (producer, local_key, tid) in [(PRODUCER_1, KEY_1, TID_1), (PRODUCER_2, KEY_2, TID_2)] {
            processor
                .process(
                    producer,
                    ProducerCaptureEvent::GpuQueueSubmission(GpuQueueSubmission {
                        meta_info: GpuQueueSubmissionMetaInfo {
                            tid,
                            pre_submission_cpu_timestamp: TIMESTAMP_1,
                            post_submission_cpu_timestamp: TIMESTAMP_2,
                        },
                        submit_infos: Vec::new(),
                        completed_markers: vec![GpuDebugMarker {
                            begin_marker: None,
                            text_key: local_key,
                            depth: 1,
                            end_gpu_timestamp_ns: TIMESTAMP_1,
                            color: Color::default(),
                        }],
                        num_begin_markers: 1,
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedString(interned) = &events[0] else {
            panic!("expected one interned string first, got {:?}", events[0]);
        };
        assert_eq!(interned.intern, "string");
        for event in &events[1..] {
            let ClientCaptureEvent::GpuQueueSubmission(submission) = event else {
                panic!("expected gpu queue submissions, got {event:?}");
            };
            assert_eq!(submission.completed_markers[0].text_key, interned.key);
        }
    }

    #[test]
    fn full_callstack_samples_with_different_callstacks_intern_both() {
        let processor = processor();
        for (pcs, timestamp) in [(&[1u64, 2, 3], TIMESTAMP_1), (&[1u64, 2, 4], TIMESTAMP_2)] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullCallstackSample(FullCallstackSample {
                        pid: PID_1,
                        tid: TID_1,
                        timestamp_ns: timestamp,
                        callstack: callstack(pcs, CallstackKind::Complete),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 4);
        let ClientCaptureEvent::InternedCallstack(interned_1) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        let ClientCaptureEvent::CallstackSample(sample_1) = &events[1] else {
            panic!("unexpected {:?}", events[1]);
        };
        let ClientCaptureEvent::InternedCallstack(interned_2) = &events[2] else {
            panic!("unexpected {:?}", events[2]);
        };
        let ClientCaptureEvent::CallstackSample(sample_2) = &events[3] else {
            panic!("unexpected {:?}", events[3]);
        };
        assert_ne!(interned_1.key, interned_2.key);
        assert_eq!(sample_1.callstack_id, interned_1.key);
        assert_eq!(sample_2.callstack_id, interned_2.key);
    }

    #[test]
    fn full_callstack_samples_with_the_same_callstack_intern_once() {
        let processor = processor();
        for timestamp in [TIMESTAMP_1, TIMESTAMP_2] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullCallstackSample(FullCallstackSample {
                        pid: PID_1,
                        tid: TID_1,
                        timestamp_ns: timestamp,
                        callstack: callstack(&[1, 2, 3], CallstackKind::Complete),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedCallstack(interned) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        for event in &events[1..] {
            let ClientCaptureEvent::CallstackSample(sample) = event else {
                panic!("expected callstack samples, got {event:?}");
            };
            assert_eq!(sample.callstack_id, interned.key);
        }
    }

    #[test]
    fn full_callstack_samples_same_frames_different_kinds_intern_twice() {
        let processor = processor();
        for kind in [CallstackKind::Complete, CallstackKind::DwarfUnwindingError] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullCallstackSample(FullCallstackSample {
                        pid: PID_1,
                        tid: TID_1,
                        timestamp_ns: TIMESTAMP_1,
                        callstack: callstack(&[1, 2, 3], kind),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        let interned: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ClientCaptureEvent::InternedCallstack(c) => Some(c.key),
                _ => None,
            })
            .collect();
        assert_eq!(interned.len(), 2);
        assert_ne!(interned[0], interned[1]);
    }

    #[test]
    fn full_tracepoint_events_share_interned_infos() {
        let processor = processor();
        let info = TracepointInfo {
            category: "sched".to_owned(),
            name: "sched_switch".to_owned(),
        };
        for timestamp in [TIMESTAMP_1, TIMESTAMP_2] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullTracepointEvent(FullTracepointEvent {
                        pid: PID_1,
                        tid: TID_1,
                        timestamp_ns: timestamp,
                        cpu: 0,
                        tracepoint_info: info.clone(),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedTracepointInfo(interned) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        assert_eq!(interned.intern, info);
        for event in &events[1..] {
            let ClientCaptureEvent::TracepointEvent(tracepoint) = event else {
                panic!("expected tracepoint events, got {event:?}");
            };
            assert_eq!(tracepoint.tracepoint_info_key, interned.key);
        }
    }

    #[test]
    fn function_call_passes_through() {
        let processor = processor();
        let call = FunctionCall {
            pid: PID_1,
            tid: TID_1,
            function_id: 37,
            duration_ns: DURATION_1,
            end_timestamp_ns: TIMESTAMP_1,
            depth: 2,
            return_value: 42,
            registers: vec![1, 2, 3],
        };
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::FunctionCall(call.clone()))
            .unwrap();
        let events = processor.into_collector().events;
        assert_eq!(events, vec![ClientCaptureEvent::FunctionCall(call)]);
    }

    #[test]
    fn gpu_jobs_with_different_timelines_intern_both() {
        let processor = processor();
        for (timeline, timestamp) in [("timeline1", TIMESTAMP_1), ("timeline2", TIMESTAMP_2)] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullGpuJob(FullGpuJob {
                        pid: PID_1,
                        tid: TID_1,
                        context: 43,
                        seqno: 53,
                        depth: 1,
                        amdgpu_cs_ioctl_time_ns: timestamp,
                        amdgpu_sched_run_job_time_ns: timestamp + 1,
                        gpu_hardware_start_time_ns: timestamp + 2,
                        dma_fence_signaled_time_ns: timestamp + 3,
                        timeline: timeline.to_owned(),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 4);
        let ClientCaptureEvent::InternedString(string_1) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        let ClientCaptureEvent::GpuJob(job_1) = &events[1] else {
            panic!("unexpected {:?}", events[1]);
        };
        let ClientCaptureEvent::InternedString(string_2) = &events[2] else {
            panic!("unexpected {:?}", events[2]);
        };
        let ClientCaptureEvent::GpuJob(job_2) = &events[3] else {
            panic!("unexpected {:?}", events[3]);
        };
        assert_eq!(string_1.intern, "timeline1");
        assert_eq!(string_2.intern, "timeline2");
        assert_eq!(job_1.timeline_key, string_1.key);
        assert_eq!(job_2.timeline_key, string_2.key);
    }

    #[test]
    fn gpu_jobs_with_the_same_timeline_intern_once() {
        let processor = processor();
        for timestamp in [TIMESTAMP_1, TIMESTAMP_2] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullGpuJob(FullGpuJob {
                        pid: PID_1,
                        tid: TID_1,
                        context: 43,
                        seqno: 53,
                        depth: 1,
                        amdgpu_cs_ioctl_time_ns: timestamp,
                        amdgpu_sched_run_job_time_ns: timestamp + 1,
                        gpu_hardware_start_time_ns: timestamp + 2,
                        dma_fence_signaled_time_ns: timestamp + 3,
                        timeline: "timeline1".to_owned(),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedString(string) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        for event in &events[1..] {
            let ClientCaptureEvent::GpuJob(job) = event else {
                panic!("expected gpu jobs, got {event:?}");
            };
            assert_eq!(job.timeline_key, string.key);
        }
    }

    #[test]
    fn thread_state_slice_without_callstack_passes_through() {
        let processor = processor();
        let slice = ThreadStateSlice {
            pid: PID_1,
            tid: TID_1,
            thread_state: ThreadState::Idle,
            duration_ns: DURATION_1,
            end_timestamp_ns: TIMESTAMP_1,
            wakeup_reason: WakeupReason::NotApplicable,
            wakeup_tid: 0,
            wakeup_pid: 0,
            switch_out_or_wakeup_callstack_status: ThreadStateCallstackStatus::NoCallstack,
            switch_out_or_wakeup_callstack_id: 0,
        };
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::ThreadStateSlice(slice.clone()))
            .unwrap();
        let events = processor.into_collector().events;
        assert_eq!(events, vec![ClientCaptureEvent::ThreadStateSlice(slice)]);
    }

    #[test]
    fn thread_state_slices_join_their_buffered_callstacks() {
        let processor = processor();

        for (tid, timestamp, duration) in
            [(TID_1, TIMESTAMP_1, DURATION_1), (TID_2, TIMESTAMP_2, DURATION_2)]
        {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::ThreadStateSliceCallstack(ThreadStateSliceCallstack {
                        thread_state_slice_tid: tid,
                        timestamp_ns: timestamp - duration,
                        callstack: callstack(&[1, 2, 3], CallstackKind::Complete),
                    }),
                )
                .unwrap();
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::ThreadStateSlice(ThreadStateSlice {
                        pid: PID_1,
                        tid,
                        thread_state: ThreadState::Runnable,
                        duration_ns: duration,
                        end_timestamp_ns: timestamp,
                        wakeup_reason: WakeupReason::NotApplicable,
                        wakeup_tid: 0,
                        wakeup_pid: 0,
                        switch_out_or_wakeup_callstack_status:
                            ThreadStateCallstackStatus::WaitingForCallstack,
                        switch_out_or_wakeup_callstack_id: 0,
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        // One interned callstack (both threads blocked at the same stack),
        // then the two slices.
        assert_eq!(events.len(), 3);
        let ClientCaptureEvent::InternedCallstack(interned) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        assert_eq!(interned.intern.pcs, vec![1, 2, 3]);
        for event in &events[1..] {
            let ClientCaptureEvent::ThreadStateSlice(slice) = event else {
                panic!("expected thread state slices, got {event:?}");
            };
            assert_eq!(
                slice.switch_out_or_wakeup_callstack_status,
                ThreadStateCallstackStatus::CallstackSet
            );
            assert_eq!(slice.switch_out_or_wakeup_callstack_id, interned.key);
        }
    }

    #[test]
    fn thread_state_slice_with_no_buffered_callstack_degrades_gracefully() {
        let processor = processor();
        processor
            .process(
                PRODUCER_1,
                ProducerCaptureEvent::ThreadStateSlice(ThreadStateSlice {
                    pid: PID_1,
                    tid: TID_1,
                    thread_state: ThreadState::Runnable,
                    duration_ns: DURATION_1,
                    end_timestamp_ns: TIMESTAMP_1,
                    wakeup_reason: WakeupReason::NotApplicable,
                    wakeup_tid: 0,
                    wakeup_pid: 0,
                    switch_out_or_wakeup_callstack_status:
                        ThreadStateCallstackStatus::WaitingForCallstack,
                    switch_out_or_wakeup_callstack_id: 0,
                }),
            )
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(events.len(), 1);
        let ClientCaptureEvent::ThreadStateSlice(slice) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        assert_eq!(
            slice.switch_out_or_wakeup_callstack_status,
            ThreadStateCallstackStatus::NoCallstack
        );
    }

    #[test]
    fn address_infos_intern_function_and_module_names() {
        let processor = processor();
        for (address, offset, function) in [(1000, 10, "function1"), (2000, 20, "function2")] {
            processor
                .process(
                    PRODUCER_1,
                    ProducerCaptureEvent::FullAddressInfo(FullAddressInfo {
                        absolute_address: address,
                        offset_in_function: offset,
                        function_name: function.to_owned(),
                        module_name: "module".to_owned(),
                    }),
                )
                .unwrap();
        }

        let events = processor.into_collector().events;
        // function1, module, info1, function2, info2: the module string is
        // interned once.
        assert_eq!(events.len(), 5);
        let ClientCaptureEvent::InternedString(function_1) = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        let ClientCaptureEvent::InternedString(module) = &events[1] else {
            panic!("unexpected {:?}", events[1]);
        };
        let ClientCaptureEvent::AddressInfo(info_1) = &events[2] else {
            panic!("unexpected {:?}", events[2]);
        };
        let ClientCaptureEvent::InternedString(function_2) = &events[3] else {
            panic!("unexpected {:?}", events[3]);
        };
        let ClientCaptureEvent::AddressInfo(info_2) = &events[4] else {
            panic!("unexpected {:?}", events[4]);
        };
        assert_eq!(function_1.intern, "function1");
        assert_eq!(module.intern, "module");
        assert_eq!(function_2.intern, "function2");
        assert_eq!(info_1.function_name_key, function_1.key);
        assert_eq!(info_1.module_name_key, module.key);
        assert_eq!(info_2.function_name_key, function_2.key);
        assert_eq!(info_2.module_name_key, module.key);
    }

    #[test]
    fn reusing_a_string_key_within_one_producer_is_a_protocol_violation() {
        let processor = processor();
        processor
            .process(PRODUCER_1, interned_string_event(KEY_1, "string1"))
            .unwrap();
        assert_eq!(
            processor.process(PRODUCER_1, interned_string_event(KEY_1, "string2")),
            Err(ProducerProtocolError::DuplicateStringKey {
                producer_id: PRODUCER_1,
                key: KEY_1,
            })
        );
    }

    #[test]
    fn reusing_a_callstack_key_within_one_producer_is_a_protocol_violation() {
        let processor = processor();
        processor
            .process(
                PRODUCER_1,
                interned_callstack_event(KEY_1, callstack(&[1], CallstackKind::Complete)),
            )
            .unwrap();
        assert_eq!(
            processor.process(
                PRODUCER_1,
                interned_callstack_event(KEY_1, callstack(&[2], CallstackKind::Complete)),
            ),
            Err(ProducerProtocolError::DuplicateCallstackKey {
                producer_id: PRODUCER_1,
                key: KEY_1,
            })
        );
    }

    #[test]
    fn referencing_an_unregistered_key_is_a_protocol_violation() {
        let processor = processor();
        assert_eq!(
            processor.process(
                PRODUCER_1,
                ProducerCaptureEvent::CallstackSample(CallstackSample {
                    pid: PID_1,
                    tid: TID_1,
                    timestamp_ns: TIMESTAMP_1,
                    callstack_id: KEY_1,
                }),
            ),
            Err(ProducerProtocolError::UnknownCallstackKey {
                producer_id: PRODUCER_1,
                key: KEY_1,
            })
        );
    }

    #[test]
    fn capture_started_and_finished_pass_through() {
        let processor = processor();
        let started = CaptureStarted {
            process_id: PID_1,
            executable_path: "/path/to/executable".to_owned(),
            executable_build_id: "build_id_1".to_owned(),
            capture_start_timestamp_ns: TIMESTAMP_1,
            capture_options: crate::config::CaptureOptions::default(),
        };
        let finished = CaptureFinished {
            status: CaptureFinishedStatus::Failed,
            error_message: "error_message".to_owned(),
        };
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::CaptureStarted(started.clone()))
            .unwrap();
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::CaptureFinished(finished.clone()))
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(
            events,
            vec![
                ClientCaptureEvent::CaptureStarted(started),
                ClientCaptureEvent::CaptureFinished(finished),
            ]
        );
    }

    #[test]
    fn loss_events_pass_through() {
        let processor = processor();
        let lost = LostPerfRecordsEvent {
            duration_ns: DURATION_1,
            end_timestamp_ns: TIMESTAMP_1,
        };
        let discarded = OutOfOrderEventsDiscardedEvent {
            duration_ns: DURATION_2,
            end_timestamp_ns: TIMESTAMP_2,
        };
        processor
            .process(PRODUCER_1, ProducerCaptureEvent::LostPerfRecordsEvent(lost))
            .unwrap();
        processor
            .process(
                PRODUCER_1,
                ProducerCaptureEvent::OutOfOrderEventsDiscardedEvent(discarded),
            )
            .unwrap();

        let events = processor.into_collector().events;
        assert_eq!(
            events,
            vec![
                ClientCaptureEvent::LostPerfRecordsEvent(lost),
                ClientCaptureEvent::OutOfOrderEventsDiscardedEvent(discarded),
            ]
        );
    }

    /// Every interned key referenced by any event must have been defined by
    /// an earlier interning event.
    #[test]
    fn keys_are_always_defined_before_use() {
        let processor = processor();
        processor
            .process(PRODUCER_1, interned_string_event(KEY_1, "marker"))
            .unwrap();
        processor
            .process(
                PRODUCER_1,
                ProducerCaptureEvent::FullCallstackSample(FullCallstackSample {
                    pid: PID_1,
                    tid: TID_1,
                    timestamp_ns: TIMESTAMP_1,
                    callstack: callstack(&[1, 2], CallstackKind::Complete),
                }),
            )
            .unwrap();
        processor
            .process(
                PRODUCER_1,
                ProducerCaptureEvent::FullAddressInfo(FullAddressInfo {
                    absolute_address: 1000,
                    offset_in_function: 1,
                    function_name: "f".to_owned(),
                    module_name: "m".to_owned(),
                }),
            )
            .unwrap();

        let events = processor.into_collector().events;
        let mut defined = std::collections::HashSet::new();
        for event in &events {
            match event {
                ClientCaptureEvent::InternedString(e) => {
                    assert!(defined.insert(e.key), "key {} defined twice", e.key);
                }
                ClientCaptureEvent::InternedCallstack(e) => {
                    assert!(defined.insert(e.key), "key {} defined twice", e.key);
                }
                ClientCaptureEvent::InternedTracepointInfo(e) => {
                    assert!(defined.insert(e.key), "key {} defined twice", e.key);
                }
                ClientCaptureEvent::CallstackSample(e) => {
                    assert!(defined.contains(&e.callstack_id));
                }
                ClientCaptureEvent::AddressInfo(e) => {
                    assert!(defined.contains(&e.function_name_key));
                    assert!(defined.contains(&e.module_name_key));
                }
                _ => {}
            }
        }
    }
}
