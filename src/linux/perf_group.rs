use std::cell::Cell;
use std::collections::BTreeMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;

use log::{debug, warn};

use super::perf_event::{EventConfig, EventSource, Perf};
use super::ring_buffer::RingBufferError;
use super::sys::SAMPLE_REGS_USER_X86_64;
use crate::config::{CaptureOptions, UnwindingMethod};
use crate::events::{LostEvent, TypedEvent};
use crate::merger::Merger;
use crate::records::FdOrigin;

/// Keeps the target stopped while perf events are being attached, so that
/// nothing executes unobserved in between. Resumed on drop.
struct StoppedProcess(u32);

impl StoppedProcess {
    fn new(pid: u32) -> Result<Self, io::Error> {
        debug!("stopping process {pid} while attaching");
        let ok = unsafe { libc::kill(pid as _, libc::SIGSTOP) };
        if ok < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(StoppedProcess(pid))
    }
}

impl Drop for StoppedProcess {
    fn drop(&mut self) {
        debug!("resuming process {}", self.0);
        unsafe {
            libc::kill(self.0 as _, libc::SIGCONT);
        }
    }
}

struct Member {
    perf: Perf,
    is_closed: Cell<bool>,
}

impl Member {
    fn new(perf: Perf) -> Self {
        Member {
            perf,
            is_closed: Cell::new(false),
        }
    }
}

impl Deref for Member {
    type Target = Perf;
    fn deref(&self) -> &Self::Target {
        &self.perf
    }
}

impl DerefMut for Member {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.perf
    }
}

/// The set of perf event fds for one capture target: per-CPU sampling fds
/// plus per-CPU uprobe/uretprobe fds for every instrumented function, all
/// feeding one merger.
pub struct PerfGroup {
    members: BTreeMap<RawFd, Member>,
    poll_fds: Vec<libc::pollfd>,
    stopped_processes: Vec<StoppedProcess>,
    /// CPUs on which perf_event_open failed, with the errno-derived message.
    failed_cpus: Vec<(u32, String)>,
    /// Functions whose uprobe/uretprobe could not be attached anywhere,
    /// with the first error message seen.
    failed_functions: Vec<(u64, String)>,
    /// Tracefs id → (category, name) for every tracepoint that was opened.
    tracepoint_names: rustc_hash::FxHashMap<u64, (String, String)>,
}

/// The amdgpu driver tracepoints that let a downstream consumer reconstruct
/// the lifetime of one GPU job.
const GPU_TRACEPOINTS: &[(&str, &str)] = &[
    ("amdgpu", "amdgpu_cs_ioctl"),
    ("amdgpu", "amdgpu_sched_run_job"),
    ("dma_fence", "dma_fence_signaled"),
];

/// CPUs currently online, from `/sys/devices/system/cpu/online`
/// (e.g. `0-3,5`).
pub fn online_cpus() -> io::Result<Vec<u32>> {
    let text = std::fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(text.trim())
}

fn parse_cpu_list(text: &str) -> io::Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in text.split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(io::Error::other)?;
                let hi: u32 = hi.trim().parse().map_err(io::Error::other)?;
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().map_err(io::Error::other)?),
        }
    }
    Ok(cpus)
}

fn poll_events<'a, I>(poll_fds: &mut Vec<libc::pollfd>, iter: I)
where
    I: IntoIterator<Item = &'a Member>,
    <I as IntoIterator>::IntoIter: Clone,
{
    let iter = iter.into_iter();

    poll_fds.clear();
    poll_fds.extend(iter.clone().map(|member| libc::pollfd {
        fd: member.fd(),
        events: libc::POLLIN | libc::POLLHUP,
        revents: 0,
    }));

    let ok = unsafe { libc::poll(poll_fds.as_ptr() as *mut _, poll_fds.len() as _, 100) };
    if ok == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            warn!("poll failed: {err}");
        }
    }

    for (member, poll_fd) in iter.zip(poll_fds.iter()) {
        member.is_closed.set(poll_fd.revents & libc::POLLHUP != 0);
    }
}

impl PerfGroup {
    /// Opens all fds for `pid` per the capture options. perf_event_open
    /// failures on individual CPUs are recorded in [`Self::failed_cpus`] and
    /// do not fail the open; the capture continues on the CPUs that worked.
    /// Only fails if no CPU could be opened at all.
    pub fn open(pid: u32, options: &CaptureOptions) -> Result<Self, io::Error> {
        let mut group = PerfGroup {
            members: BTreeMap::new(),
            poll_fds: Vec::new(),
            stopped_processes: Vec::new(),
            failed_cpus: Vec::new(),
            failed_functions: Vec::new(),
            tracepoint_names: rustc_hash::FxHashMap::default(),
        };
        group.open_process(pid, options)?;
        Ok(group)
    }

    fn open_process(&mut self, pid: u32, options: &CaptureOptions) -> Result<(), io::Error> {
        self.stopped_processes.push(StoppedProcess::new(pid)?);

        let regs_mask = match options.unwinding_method {
            UnwindingMethod::None => 0,
            _ => SAMPLE_REGS_USER_X86_64,
        };
        let stack_size = match options.unwinding_method {
            UnwindingMethod::None => 0,
            _ => options.stack_dump_size_bytes,
        };

        let cpus = online_cpus()?;
        let mut last_error = None;
        for &cpu in &cpus {
            let sampling = Perf::build(EventConfig::Sampling {
                source: EventSource::SwCpuClock,
                period_ns: options.sampling_period_ns,
            })
            .pid(pid)
            .only_cpu(cpu)
            .sample_user_stack(stack_size)
            .sample_user_regs(regs_mask)
            .inherit_to_children()
            .track_mmaps()
            .gather_context_switches()
            .open();

            let sampling = match sampling {
                Ok(perf) => perf,
                Err(error) => {
                    self.failed_cpus.push((cpu, error.to_string()));
                    last_error = Some(error);
                    continue;
                }
            };
            self.members.insert(sampling.fd(), Member::new(sampling));

            if options.trace_gpu_submissions {
                for &(category, name) in GPU_TRACEPOINTS {
                    let id = match super::sys::tracepoint_id(category, name) {
                        Ok(id) => id,
                        Err(error) => {
                            warn!("tracepoint {category}:{name} not available: {error}");
                            continue;
                        }
                    };
                    match Perf::build(EventConfig::Tracepoint { id })
                        .pid(pid)
                        .only_cpu(cpu)
                        .sample_kernel()
                        .open()
                    {
                        Ok(perf) => {
                            self.tracepoint_names
                                .insert(id, (category.to_owned(), name.to_owned()));
                            self.members.insert(perf.fd(), Member::new(perf));
                        }
                        Err(error) => {
                            warn!("could not open tracepoint {category}:{name} on cpu {cpu}: {error}");
                        }
                    }
                }
            }

            for function in &options.instrumented_functions {
                for is_retprobe in [false, true] {
                    // Registers are sampled on these fds regardless of the
                    // unwinding method: entry registers carry the call's
                    // arguments, AX at return carries the return value.
                    let perf = Perf::build(EventConfig::Uprobe {
                        path: function.file_path.clone(),
                        offset: function.file_offset,
                        is_retprobe,
                        function_id: function.function_id,
                    })
                    .pid(pid)
                    .only_cpu(cpu)
                    .sample_kernel()
                    .sample_user_stack(if is_retprobe { 0 } else { stack_size })
                    .sample_user_regs(SAMPLE_REGS_USER_X86_64)
                    .open();
                    match perf {
                        Ok(perf) => {
                            self.members.insert(perf.fd(), Member::new(perf));
                        }
                        Err(error) => {
                            warn!(
                                "could not attach {} for function {} on cpu {cpu}: {error}",
                                if is_retprobe { "uretprobe" } else { "uprobe" },
                                function.function_id
                            );
                            if !self
                                .failed_functions
                                .iter()
                                .any(|(id, _)| *id == function.function_id)
                            {
                                self.failed_functions
                                    .push((function.function_id, error.to_string()));
                            }
                        }
                    }
                }
            }
        }

        if !self.members.is_empty() {
            Ok(())
        } else {
            Err(last_error
                .unwrap_or_else(|| io::Error::other("no online CPUs to profile")))
        }
    }

    pub fn failed_cpus(&self) -> &[(u32, String)] {
        &self.failed_cpus
    }

    pub fn failed_instrumented_functions(&self) -> &[(u64, String)] {
        &self.failed_functions
    }

    pub fn tracepoint_names(&self) -> &rustc_hash::FxHashMap<u64, (String, String)> {
        &self.tracepoint_names
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn enable(&mut self) -> io::Result<()> {
        for perf in self.members.values_mut() {
            perf.enable()?;
        }
        self.stopped_processes.clear();
        Ok(())
    }

    /// Blocks until at least one member has pending records, a member is
    /// closed, or a short timeout elapses.
    pub fn wait(&mut self) {
        for member in self.members.values() {
            if member.reader().has_new_data() {
                return;
            }
        }
        poll_events(&mut self.poll_fds, self.members.values());
    }

    /// Reads every pending record from every member and pushes the parsed
    /// events into the merger. Returns a fatal error only for malformed
    /// ring-buffer contents.
    pub fn consume_into(&mut self, merger: &Merger) -> Result<ConsumeStats, RingBufferError> {
        let mut stats = ConsumeStats::default();
        let mut fds_to_remove = Vec::new();

        for member in self.members.values_mut() {
            let fd = member.fd();
            let (reader, parser, origin) = member.perf.reader_and_parser();

            loop {
                if !reader.has_new_data() {
                    break;
                }
                let header = match reader.read_header() {
                    Ok(header) => header,
                    Err(RingBufferError::Overrun { lost_bytes }) => {
                        warn!("ring buffer overrun on fd {fd}: {lost_bytes} bytes lost");
                        reader.resync();
                        stats.overrun_bytes += lost_bytes;
                        merger.push(
                            TypedEvent::Lost(LostEvent {
                                timestamp: monotonic_now_ns(),
                                lost: lost_bytes,
                            }),
                            fd,
                        );
                        continue;
                    }
                    Err(error) => return Err(error),
                };

                if Self::is_interesting_kind(header.kind, origin) {
                    let raw = reader.read_record(&header)?;
                    match parser.parse(origin, &raw) {
                        Ok(event) => {
                            stats.records += 1;
                            merger.push(event, fd);
                        }
                        Err(error) => {
                            warn!("dropping unparseable record on fd {fd}: {error}");
                        }
                    }
                } else {
                    reader.skip_record(&header);
                }
            }

            if member.is_closed.get() {
                fds_to_remove.push(fd);
            }
        }

        for fd in fds_to_remove {
            self.members.remove(&fd);
        }

        Ok(stats)
    }

    fn is_interesting_kind(kind: u32, origin: FdOrigin) -> bool {
        use super::sys::*;
        match kind {
            PERF_RECORD_SAMPLE | PERF_RECORD_SWITCH | PERF_RECORD_FORK | PERF_RECORD_EXIT
            | PERF_RECORD_LOST => true,
            // mmap/comm records are requested on one fd set only; other fds
            // never produce them.
            PERF_RECORD_COMM | PERF_RECORD_MMAP2 => matches!(origin, FdOrigin::TimeSample),
            _ => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumeStats {
    pub records: u64,
    pub overrun_bytes: u64,
}

pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
