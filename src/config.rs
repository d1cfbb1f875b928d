use thiserror::Error;

/// The kernel rejects `sample_stack_user` values of 64 KiB or more; the
/// largest accepted dump size is `(1 << 16) - 8`.
pub const MAX_STACK_DUMP_SIZE: u32 = (1 << 16) - 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindingMethod {
    #[default]
    Dwarf,
    FramePointer,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DynamicInstrumentationMethod {
    #[default]
    Uprobes,
    UserSpaceInstrumentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStateChangeCallstackCollection {
    #[default]
    None,
    OnSwitchOut,
    OnSwitchOutAndWakeup,
}

/// How samples that fall inside Wine's syscall dispatcher are treated.
/// Wine switches to a separate syscall stack, which regular DWARF unwinding
/// cannot cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WineSyscallHandling {
    #[default]
    NoSpecialHandling,
    StopUnwinding,
    RecordUserStack,
}

/// A function to instrument with a uprobe/uretprobe pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedFunction {
    pub function_id: u64,
    pub function_name: String,
    pub file_path: String,
    pub file_build_id: String,
    pub file_offset: u64,
    pub function_virtual_address: u64,
}

/// All recognized capture options. Plain data; validated once before the
/// capture starts via [`CaptureOptions::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    /// Interval between time-based samples, per CPU.
    pub sampling_period_ns: u64,
    /// Bytes of thread stack copied per sample. `0` disables stack dumps.
    pub stack_dump_size_bytes: u32,
    /// Same as `stack_dump_size_bytes`, for thread-state-change callstacks.
    pub thread_state_change_stack_dump_size_bytes: u32,
    pub unwinding_method: UnwindingMethod,
    pub dynamic_instrumentation_method: DynamicInstrumentationMethod,
    pub instrumented_functions: Vec<InstrumentedFunction>,
    pub collect_scheduler_info: bool,
    pub collect_thread_states: bool,
    pub thread_state_change_callstack_collection: ThreadStateChangeCallstackCollection,
    pub trace_gpu_submissions: bool,
    pub enable_api_instrumentation: bool,
    pub enable_introspection: bool,
    pub max_local_marker_depth_per_command_buffer: u64,
    pub memory_sampling_period_ms: u64,
    pub memory_warning_threshold_kb: u64,
    pub wine_syscall_handling: WineSyscallHandling,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            sampling_period_ns: 1_000_000,
            stack_dump_size_bytes: 64 * 1024 - 8,
            thread_state_change_stack_dump_size_bytes: 512,
            unwinding_method: UnwindingMethod::default(),
            dynamic_instrumentation_method: DynamicInstrumentationMethod::default(),
            instrumented_functions: Vec::new(),
            collect_scheduler_info: true,
            collect_thread_states: false,
            thread_state_change_callstack_collection:
                ThreadStateChangeCallstackCollection::default(),
            trace_gpu_submissions: false,
            enable_api_instrumentation: false,
            enable_introspection: false,
            max_local_marker_depth_per_command_buffer: 0,
            memory_sampling_period_ms: 100,
            memory_warning_threshold_kb: 0,
            wine_syscall_handling: WineSyscallHandling::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("sampling_period_ns must be nonzero")]
    ZeroSamplingPeriod,

    #[error("stack dump size {0} exceeds the maximum of {MAX_STACK_DUMP_SIZE} bytes")]
    StackDumpTooLarge(u32),

    #[error("stack dump size {0} must be a multiple of 8")]
    StackDumpMisaligned(u32),
}

impl CaptureOptions {
    /// Rejects option combinations the kernel or the capture core cannot
    /// honor. Called before any perf event is opened.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.sampling_period_ns == 0 {
            return Err(OptionsError::ZeroSamplingPeriod);
        }
        for size in [
            self.stack_dump_size_bytes,
            self.thread_state_change_stack_dump_size_bytes,
        ] {
            if size > MAX_STACK_DUMP_SIZE {
                return Err(OptionsError::StackDumpTooLarge(size));
            }
            if size % 8 != 0 {
                return Err(OptionsError::StackDumpMisaligned(size));
            }
        }
        Ok(())
    }
}
