use std::cmp::max;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::pid_t;
use log::debug;

use super::ring_buffer::{page_size, RingBufferReader};
use super::sys::*;
use crate::records::{FdOrigin, RecordParser};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventSource {
    HwCpuCycles,
    SwCpuClock,
}

/// What to attach this fd to.
#[derive(Clone, Debug)]
pub enum EventConfig {
    /// Time-based sampling with the given period.
    Sampling {
        source: EventSource,
        period_ns: u64,
    },
    /// A uprobe or uretprobe on `path` at `offset`, firing on every hit.
    Uprobe {
        path: String,
        offset: u64,
        is_retprobe: bool,
        function_id: u64,
    },
    /// A raw tracepoint by tracefs id, firing on every hit.
    Tracepoint { id: u64 },
}

#[derive(Clone, Debug)]
pub struct PerfBuilder {
    pid: u32,
    cpu: Option<u32>,
    config: EventConfig,
    stack_size: u32,
    regs_mask: u64,
    inherit: bool,
    enable_on_exec: bool,
    exclude_kernel: bool,
    gather_context_switches: bool,
    mmap_tracking: bool,
    ring_pages: Option<u32>,
}

impl PerfBuilder {
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn only_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn any_cpu(mut self) -> Self {
        self.cpu = None;
        self
    }

    /// Copy this many bytes of user stack into every sample. The kernel
    /// accepts at most `(1 << 16) - 8` and requires a multiple of 8.
    pub fn sample_user_stack(mut self, stack_size: u32) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn sample_user_regs(mut self, reg_mask: u64) -> Self {
        self.regs_mask = reg_mask;
        self
    }

    /// Turns on kernel-side measurements. Requires
    /// `/proc/sys/kernel/perf_event_paranoid` to be less than 2.
    pub fn sample_kernel(mut self) -> Self {
        self.exclude_kernel = false;
        self
    }

    pub fn inherit_to_children(mut self) -> Self {
        self.inherit = true;
        self
    }

    pub fn enable_on_exec(mut self) -> Self {
        self.enable_on_exec = true;
        self
    }

    pub fn gather_context_switches(mut self) -> Self {
        self.gather_context_switches = true;
        self
    }

    /// Receive mmap and comm records on this fd. Only wanted on one fd per
    /// CPU, to avoid duplicates.
    pub fn track_mmaps(mut self) -> Self {
        self.mmap_tracking = true;
        self
    }

    pub fn ring_pages(mut self, pages: u32) -> Self {
        self.ring_pages = Some(pages);
        self
    }

    fn sample_type(&self) -> u64 {
        let mut sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;
        match &self.config {
            EventConfig::Sampling { .. } => {
                if self.regs_mask != 0 {
                    sample_type |= PERF_SAMPLE_REGS_USER;
                }
                if self.stack_size != 0 {
                    sample_type |= PERF_SAMPLE_STACK_USER;
                }
            }
            EventConfig::Uprobe { is_retprobe, .. } => {
                if self.regs_mask != 0 {
                    sample_type |= PERF_SAMPLE_REGS_USER;
                }
                if !is_retprobe && self.stack_size != 0 {
                    sample_type |= PERF_SAMPLE_STACK_USER;
                }
            }
            EventConfig::Tracepoint { .. } => {
                sample_type |= PERF_SAMPLE_RAW;
            }
        }
        sample_type
    }

    pub fn open(self) -> io::Result<Perf> {
        let cpu = self.cpu.map(|cpu| cpu as i32).unwrap_or(-1);

        if self.stack_size > crate::config::MAX_STACK_DUMP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sample_user_stack exceeds the kernel limit",
            ));
        }

        // See `perf_mmap` in the Linux kernel.
        if cpu == -1 && self.inherit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "you can't inherit to children and run on all cpus at the same time",
            ));
        }

        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<PerfEventAttr>() as u32;

        // config1 points at the probed path for uprobe events; the string
        // must stay alive until the syscall has returned.
        let mut _uprobe_path_storage = None;
        let origin = match &self.config {
            EventConfig::Sampling { source, period_ns } => {
                match source {
                    EventSource::HwCpuCycles => {
                        attr.kind = PERF_TYPE_HARDWARE;
                        attr.config = PERF_COUNT_HW_CPU_CYCLES;
                    }
                    EventSource::SwCpuClock => {
                        attr.kind = PERF_TYPE_SOFTWARE;
                        attr.config = PERF_COUNT_SW_CPU_CLOCK;
                    }
                }
                attr.sample_period_or_freq = *period_ns;
                FdOrigin::TimeSample
            }
            EventConfig::Uprobe {
                path,
                offset,
                is_retprobe,
                function_id,
            } => {
                attr.kind = uprobe_pmu_type()?;
                if *is_retprobe {
                    attr.config = 1 << uprobe_retprobe_bit()?;
                }
                let path = CString::new(path.as_str()).map_err(io::Error::other)?;
                attr.bp_addr_or_config = path.as_ptr() as u64;
                attr.bp_len_or_config = *offset;
                _uprobe_path_storage = Some(path);
                attr.sample_period_or_freq = 1;
                if *is_retprobe {
                    FdOrigin::Uretprobe {
                        function_id: *function_id,
                    }
                } else {
                    FdOrigin::Uprobe {
                        function_id: *function_id,
                    }
                }
            }
            EventConfig::Tracepoint { id } => {
                attr.kind = PERF_TYPE_TRACEPOINT;
                attr.config = *id;
                attr.sample_period_or_freq = 1;
                FdOrigin::Tracepoint { id: *id }
            }
        };

        let sample_type = self.sample_type();
        attr.sample_type = sample_type;
        attr.sample_regs_user = self.regs_mask;
        if sample_type & PERF_SAMPLE_STACK_USER != 0 {
            attr.sample_stack_user = self.stack_size;
        }
        attr.clock_id = libc::CLOCK_MONOTONIC;

        attr.flags = PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | PERF_ATTR_FLAG_USE_CLOCKID;

        if self.mmap_tracking {
            attr.flags |=
                PERF_ATTR_FLAG_MMAP | PERF_ATTR_FLAG_MMAP2 | PERF_ATTR_FLAG_COMM;
        }
        if self.enable_on_exec {
            attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
        }
        if self.exclude_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if self.inherit {
            attr.flags |= PERF_ATTR_FLAG_INHERIT;
        }
        if self.gather_context_switches {
            attr.flags |= PERF_ATTR_FLAG_CONTEXT_SWITCH;
        }

        let fd = sys_perf_event_open(
            &attr,
            self.pid as pid_t,
            cpu as _,
            -1,
            PERF_FLAG_FD_CLOEXEC,
        );
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd));
        }

        let ring_pages = self.ring_pages.unwrap_or_else(|| {
            // Enough room that a burst of samples with full stack dumps does
            // not immediately overrun the consumer.
            const STACK_COUNT_PER_BUFFER: u32 = 32;
            let required_space = max(self.stack_size, 4096) * STACK_COUNT_PER_BUFFER;
            let page_size = page_size() as u32;
            let n = (1..26)
                .find(|n| (1_u32 << n) * page_size >= required_space)
                .unwrap_or(4);
            max(1 << n, 16)
        });

        let reader = match RingBufferReader::open(fd, ring_pages) {
            Ok(reader) => reader,
            Err(error) => {
                unsafe { libc::close(fd) };
                return Err(error);
            }
        };

        debug!(
            "perf event open: fd={fd} pid={} cpu={cpu} origin={origin:?} ring={ring_pages} pages",
            self.pid
        );

        Ok(Perf {
            fd,
            origin,
            parser: RecordParser::new(sample_type),
            reader,
        })
    }
}

/// One open perf event fd together with its ring buffer and the parser
/// matching its sample format.
pub struct Perf {
    fd: RawFd,
    origin: FdOrigin,
    parser: RecordParser,
    reader: RingBufferReader,
}

impl Perf {
    pub fn build(config: EventConfig) -> PerfBuilder {
        PerfBuilder {
            pid: 0,
            cpu: None,
            config,
            stack_size: 0,
            regs_mask: 0,
            inherit: false,
            enable_on_exec: false,
            exclude_kernel: true,
            gather_context_switches: false,
            mmap_tracking: false,
            ring_pages: None,
        }
    }

    pub fn max_sample_rate() -> Option<u64> {
        let data = std::fs::read_to_string("/proc/sys/kernel/perf_event_max_sample_rate").ok()?;
        data.trim().parse::<u64>().ok()
    }

    pub fn enable(&self) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as _) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disable(&self) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as _) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn origin(&self) -> FdOrigin {
        self.origin
    }

    #[inline]
    pub fn parser(&self) -> &RecordParser {
        &self.parser
    }

    #[inline]
    pub fn reader(&self) -> &RingBufferReader {
        &self.reader
    }

    #[inline]
    pub fn reader_and_parser(&mut self) -> (&mut RingBufferReader, &RecordParser, FdOrigin) {
        (&mut self.reader, &self.parser, self.origin)
    }
}

impl Drop for Perf {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
