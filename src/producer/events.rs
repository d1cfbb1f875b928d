//! The event vocabulary of the producer fan-in layer.
//!
//! Producers send [`ProducerCaptureEvent`]s, which may carry inline strings
//! and callstacks ("full" forms) or producer-local interning keys. The
//! processor translates them into [`ClientCaptureEvent`]s, where every
//! string, callstack and tracepoint descriptor is referenced by a global
//! interning key. Key 0 is reserved; readers treat it as "absent".

use crate::unwinding::CallstackKind;

pub type InternKey = u64;

/// Reserved "invalid/absent" interning key.
pub const INVALID_INTERN_ID: InternKey = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallstackInfo {
    /// Program counters, innermost first.
    pub pcs: Vec<u64>,
    pub kind: CallstackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternedString {
    pub key: InternKey,
    pub intern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternedCallstack {
    pub key: InternKey,
    pub intern: CallstackInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracepointInfo {
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternedTracepointInfo {
    pub key: InternKey,
    pub intern: TracepointInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingSlice {
    pub pid: i32,
    pub tid: i32,
    pub core: i32,
    pub duration_ns: u64,
    pub out_timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Runnable,
    InterruptibleSleep,
    UninterruptibleSleep,
    Stopped,
    Traced,
    Dead,
    Zombie,
    Parked,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStateCallstackStatus {
    NoCallstack,
    WaitingForCallstack,
    CallstackSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    NotApplicable,
    Unblocked,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStateSlice {
    pub pid: i32,
    pub tid: i32,
    pub thread_state: ThreadState,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    pub wakeup_reason: WakeupReason,
    pub wakeup_tid: i32,
    pub wakeup_pid: i32,
    pub switch_out_or_wakeup_callstack_status: ThreadStateCallstackStatus,
    pub switch_out_or_wakeup_callstack_id: InternKey,
}

/// The callstack collected at a thread-state change, sent separately from
/// the slice it belongs to and joined by the processor on `(tid, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStateSliceCallstack {
    pub thread_state_slice_tid: i32,
    pub timestamp_ns: u64,
    pub callstack: CallstackInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallstackSample {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub callstack_id: InternKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCallstackSample {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub callstack: CallstackInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracepointEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub cpu: i32,
    pub tracepoint_info_key: InternKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTracepointEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub cpu: i32,
    pub tracepoint_info: TracepointInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub pid: i32,
    pub tid: i32,
    pub function_id: u64,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    pub depth: i32,
    pub return_value: u64,
    pub registers: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullGpuJob {
    pub pid: i32,
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub depth: i32,
    pub amdgpu_cs_ioctl_time_ns: u64,
    pub amdgpu_sched_run_job_time_ns: u64,
    pub gpu_hardware_start_time_ns: u64,
    pub dma_fence_signaled_time_ns: u64,
    pub timeline: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuJob {
    pub pid: i32,
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub depth: i32,
    pub amdgpu_cs_ioctl_time_ns: u64,
    pub amdgpu_sched_run_job_time_ns: u64,
    pub gpu_hardware_start_time_ns: u64,
    pub dma_fence_signaled_time_ns: u64,
    pub timeline_key: InternKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuQueueSubmissionMetaInfo {
    pub tid: i32,
    pub pre_submission_cpu_timestamp: u64,
    pub post_submission_cpu_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCommandBuffer {
    pub begin_gpu_timestamp_ns: u64,
    pub end_gpu_timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GpuSubmitInfo {
    pub command_buffers: Vec<GpuCommandBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuDebugMarkerBeginInfo {
    pub meta_info: GpuQueueSubmissionMetaInfo,
    pub gpu_timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuDebugMarker {
    pub begin_marker: Option<GpuDebugMarkerBeginInfo>,
    /// Producer-local on input, global on output.
    pub text_key: InternKey,
    pub depth: i32,
    pub end_gpu_timestamp_ns: u64,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuQueueSubmission {
    pub meta_info: GpuQueueSubmissionMetaInfo,
    pub submit_infos: Vec<GpuSubmitInfo>,
    pub completed_markers: Vec<GpuDebugMarker>,
    pub num_begin_markers: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullAddressInfo {
    pub absolute_address: u64,
    pub offset_in_function: u64,
    pub function_name: String,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub absolute_address: u64,
    pub offset_in_function: u64,
    pub function_name_key: InternKey,
    pub module_name_key: InternKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub file_path: String,
    pub file_size: u64,
    pub address_start: u64,
    pub address_end: u64,
    pub build_id: String,
    pub load_bias: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleUpdateEvent {
    pub pid: i32,
    pub timestamp_ns: u64,
    pub module: ModuleInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulesSnapshot {
    pub pid: i32,
    pub timestamp_ns: u64,
    pub modules: Vec<ModuleInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadName {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNamesSnapshot {
    pub timestamp_ns: u64,
    pub thread_names: Vec<ThreadName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemMemoryUsage {
    pub timestamp_ns: u64,
    pub total_kb: i64,
    pub free_kb: i64,
    pub available_kb: i64,
    pub buffers_kb: i64,
    pub cached_kb: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessMemoryUsage {
    pub pid: i32,
    pub timestamp_ns: u64,
    pub rss_anon_kb: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CGroupMemoryUsage {
    pub cgroup_name: String,
    pub timestamp_ns: u64,
    pub limit_bytes: i64,
    pub rss_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryUsageEvent {
    pub timestamp_ns: u64,
    pub system_memory_usage: Option<SystemMemoryUsage>,
    pub process_memory_usage: Option<ProcessMemoryUsage>,
    pub cgroup_memory_usage: Option<CGroupMemoryUsage>,
}

/// Names in API events arrive pre-encoded in eight 64-bit chunks plus an
/// overflow list, so the hot annotation path never allocates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiEncodedName {
    pub encoded_name_1: u64,
    pub encoded_name_2: u64,
    pub encoded_name_3: u64,
    pub encoded_name_4: u64,
    pub encoded_name_5: u64,
    pub encoded_name_6: u64,
    pub encoded_name_7: u64,
    pub encoded_name_8: u64,
    pub encoded_name_additional: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiScopeStart {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub color_rgba: u32,
    pub group_id: u64,
    pub address_in_function: u64,
    pub name: ApiEncodedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiScopeStop {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiScopeStartAsync {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub color_rgba: u32,
    pub id: u64,
    pub address_in_function: u64,
    pub name: ApiEncodedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiScopeStopAsync {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiStringEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub id: u64,
    pub name: ApiEncodedName,
}

macro_rules! api_track_event {
    ($name:ident, $ty:ty) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub pid: i32,
            pub tid: i32,
            pub timestamp_ns: u64,
            pub data: $ty,
            pub name: ApiEncodedName,
        }
    };
}

api_track_event!(ApiTrackInt, i32);
api_track_event!(ApiTrackInt64, i64);
api_track_event!(ApiTrackUint, u32);
api_track_event!(ApiTrackUint64, u64);
api_track_event!(ApiTrackFloat, f32);
api_track_event!(ApiTrackDouble, f64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockResolutionEvent {
    pub timestamp_ns: u64,
    pub clock_resolution_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorsWithPerfEventOpenEvent {
    pub timestamp_ns: u64,
    pub failed_to_open: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnablingApiEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnablingUserSpaceInstrumentationEvent {
    pub timestamp_ns: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInstrumentationFailure {
    pub function_id: u64,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningInstrumentingWithUserSpaceInstrumentationEvent {
    pub timestamp_ns: u64,
    pub functions_that_failed: Vec<FunctionInstrumentationFailure>,
}

/// Records dropped by the kernel or overwritten in a ring buffer during the
/// covered time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPerfRecordsEvent {
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
}

/// Events that arrived later than the merger's holdback window and were
/// discarded, covering the given time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfOrderEventsDiscardedEvent {
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStarted {
    pub process_id: i32,
    pub executable_path: String,
    pub executable_build_id: String,
    pub capture_start_timestamp_ns: u64,
    pub capture_options: crate::config::CaptureOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFinishedStatus {
    Successful,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFinished {
    pub status: CaptureFinishedStatus,
    pub error_message: String,
}

/// What producers send into the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerCaptureEvent {
    CaptureStarted(CaptureStarted),
    CaptureFinished(CaptureFinished),
    InternedString(InternedString),
    InternedCallstack(InternedCallstack),
    FullCallstackSample(FullCallstackSample),
    CallstackSample(CallstackSample),
    FullTracepointEvent(FullTracepointEvent),
    FullGpuJob(FullGpuJob),
    FullAddressInfo(FullAddressInfo),
    SchedulingSlice(SchedulingSlice),
    ThreadStateSlice(ThreadStateSlice),
    ThreadStateSliceCallstack(ThreadStateSliceCallstack),
    FunctionCall(FunctionCall),
    GpuQueueSubmission(GpuQueueSubmission),
    ThreadName(ThreadName),
    ThreadNamesSnapshot(ThreadNamesSnapshot),
    ModuleUpdateEvent(ModuleUpdateEvent),
    ModulesSnapshot(ModulesSnapshot),
    MemoryUsageEvent(MemoryUsageEvent),
    ApiScopeStart(ApiScopeStart),
    ApiScopeStop(ApiScopeStop),
    ApiScopeStartAsync(ApiScopeStartAsync),
    ApiScopeStopAsync(ApiScopeStopAsync),
    ApiStringEvent(ApiStringEvent),
    ApiTrackInt(ApiTrackInt),
    ApiTrackInt64(ApiTrackInt64),
    ApiTrackUint(ApiTrackUint),
    ApiTrackUint64(ApiTrackUint64),
    ApiTrackFloat(ApiTrackFloat),
    ApiTrackDouble(ApiTrackDouble),
    WarningEvent(WarningEvent),
    ClockResolutionEvent(ClockResolutionEvent),
    ErrorsWithPerfEventOpenEvent(ErrorsWithPerfEventOpenEvent),
    ErrorEnablingApiEvent(ErrorEnablingApiEvent),
    ErrorEnablingUserSpaceInstrumentationEvent(ErrorEnablingUserSpaceInstrumentationEvent),
    WarningInstrumentingWithUserSpaceInstrumentationEvent(
        WarningInstrumentingWithUserSpaceInstrumentationEvent,
    ),
    LostPerfRecordsEvent(LostPerfRecordsEvent),
    OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent),
}

/// What the client sees: every interned value is referenced by a global key
/// that was defined strictly earlier in the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCaptureEvent {
    CaptureStarted(CaptureStarted),
    CaptureFinished(CaptureFinished),
    InternedString(InternedString),
    InternedCallstack(InternedCallstack),
    InternedTracepointInfo(InternedTracepointInfo),
    SchedulingSlice(SchedulingSlice),
    ThreadStateSlice(ThreadStateSlice),
    CallstackSample(CallstackSample),
    TracepointEvent(TracepointEvent),
    FunctionCall(FunctionCall),
    GpuJob(GpuJob),
    GpuQueueSubmission(GpuQueueSubmission),
    AddressInfo(AddressInfo),
    ModuleUpdateEvent(ModuleUpdateEvent),
    ModulesSnapshot(ModulesSnapshot),
    ThreadName(ThreadName),
    ThreadNamesSnapshot(ThreadNamesSnapshot),
    MemoryUsageEvent(MemoryUsageEvent),
    ApiScopeStart(ApiScopeStart),
    ApiScopeStop(ApiScopeStop),
    ApiScopeStartAsync(ApiScopeStartAsync),
    ApiScopeStopAsync(ApiScopeStopAsync),
    ApiStringEvent(ApiStringEvent),
    ApiTrackInt(ApiTrackInt),
    ApiTrackInt64(ApiTrackInt64),
    ApiTrackUint(ApiTrackUint),
    ApiTrackUint64(ApiTrackUint64),
    ApiTrackFloat(ApiTrackFloat),
    ApiTrackDouble(ApiTrackDouble),
    WarningEvent(WarningEvent),
    ClockResolutionEvent(ClockResolutionEvent),
    ErrorsWithPerfEventOpenEvent(ErrorsWithPerfEventOpenEvent),
    ErrorEnablingApiEvent(ErrorEnablingApiEvent),
    ErrorEnablingUserSpaceInstrumentationEvent(ErrorEnablingUserSpaceInstrumentationEvent),
    WarningInstrumentingWithUserSpaceInstrumentationEvent(
        WarningInstrumentingWithUserSpaceInstrumentationEvent,
    ),
    LostPerfRecordsEvent(LostPerfRecordsEvent),
    OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent),
}
