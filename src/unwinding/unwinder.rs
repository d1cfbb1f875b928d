use framehop::x86_64::UnwindRegsX86_64;
use framehop::{CacheNative, FrameAddress, MayAllocateDuringUnwind, Unwinder, UnwinderNative};
use log::{error, warn};

use super::modules::{load_module, LoadedModule, SectionData};
use super::{Callstack, CallstackKind, Frame};
use crate::config::UnwindingMethod;
use crate::events::MmapEvent;
use crate::linux::proc_maps::{MapsParseError, ProcessMaps, Region};
use crate::linux::sys::{
    sample_reg_index, PERF_REG_X86_BP, PERF_REG_X86_IP, PERF_REG_X86_SP, SAMPLE_REGS_COUNT,
};

/// Frame-walk cap. Deeper stacks are cut off and reported as
/// [`CallstackKind::StackTopForDwarf`].
pub const MAX_FRAMES: usize = 1024;

/// Reconstructs callstacks from sampled registers and copied stack bytes.
///
/// Frame walking is delegated to framehop (DWARF CFI with `.eh_frame`, frame
/// pointers as fallback). The unwinder reads the callee's stack exclusively
/// from the sample's stack copy, so `unwind` is a deterministic function of
/// its inputs and the maps/modules registered beforehand.
pub struct StackUnwinder {
    unwinder: UnwinderNative<SectionData, MayAllocateDuringUnwind>,
    cache: CacheNative<MayAllocateDuringUnwind>,
    maps: Option<ProcessMaps>,
    method: UnwindingMethod,
    max_frames: usize,
}

impl StackUnwinder {
    pub fn new(method: UnwindingMethod) -> Self {
        StackUnwinder {
            unwinder: UnwinderNative::default(),
            cache: CacheNative::new(),
            maps: None,
            method,
            max_frames: MAX_FRAMES,
        }
    }

    /// Ingests a `/proc/<pid>/maps` snapshot and loads unwind information
    /// for every executable file-backed region in it. Must be called before
    /// the first [`Self::unwind`].
    pub fn set_maps(&mut self, maps_text: &str) -> Result<Vec<LoadedModule>, MapsParseError> {
        let maps = ProcessMaps::parse(maps_text)?;
        let mut loaded = Vec::new();
        for region in maps.regions() {
            if !region.is_executable {
                continue;
            }
            if let Some(module) = self.add_module_for_region(region) {
                loaded.push(module);
            }
        }
        self.maps = Some(maps);
        Ok(loaded)
    }

    /// Applies one mmap record: updates the maps snapshot and, for
    /// executable file-backed mappings, loads the module's unwind
    /// information. Returns the module metadata when a module was loaded.
    pub fn handle_mmap(&mut self, e: &MmapEvent) -> Option<LoadedModule> {
        let maps = self.maps.as_mut()?;
        let name = String::from_utf8_lossy(&e.path).into_owned();
        let region = Region {
            start: e.address,
            end: e.address + e.length,
            is_read: true,
            is_write: false,
            is_executable: e.is_executable,
            is_shared: false,
            file_offset: e.page_offset,
            major: 0,
            minor: 0,
            inode: 0,
            name,
        };
        maps.add(region.clone());

        if !e.is_executable {
            return None;
        }
        self.add_module_for_region(&region)
    }

    fn add_module_for_region(&mut self, region: &Region) -> Option<LoadedModule> {
        let (module, loaded) = load_module(
            &region.name,
            region.start,
            region.end - region.start,
            region.file_offset,
        )?;
        self.unwinder.add_module(module);
        Some(loaded)
    }

    /// Walks the stack for one sample. Unwind failures are data, not
    /// errors: partial frames are kept and the callstack's kind records the
    /// failure class.
    pub fn unwind(&mut self, regs: &[u64; SAMPLE_REGS_COUNT], stack: &[u8]) -> Callstack {
        let Some(maps) = &self.maps else {
            error!("unwind called before set_maps");
            return Callstack::empty(CallstackKind::Empty);
        };

        let ip = regs[sample_reg_index(PERF_REG_X86_IP)];
        let sp = regs[sample_reg_index(PERF_REG_X86_SP)];
        let bp = regs[sample_reg_index(PERF_REG_X86_BP)];

        let leaf_region = maps.lookup(ip);
        let leaf = resolve_frame(maps, ip);
        match leaf_region {
            None => {
                return Callstack::new(vec![leaf], self.error_kind());
            }
            Some(region) if !region.is_executable => {
                return Callstack::new(vec![leaf], CallstackKind::InMapNotExecutable);
            }
            Some(_) => {}
        }

        if self.method == UnwindingMethod::None {
            return Callstack::new(vec![leaf], CallstackKind::Complete);
        }

        // The stack copy starts at the sampled stack pointer; reads outside
        // of it fail the frame rather than touching live memory.
        let read_stack = &mut |addr: u64| {
            let offset = addr.checked_sub(sp).ok_or(())?;
            let index = usize::try_from(offset).map_err(|_| ())?;
            let bytes = stack.get(index..index + 8).ok_or(())?;
            Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| ())?))
        };

        let error_kind = self.error_kind();
        let mut kind = CallstackKind::Complete;
        let mut frames = Vec::new();
        let StackUnwinder {
            unwinder,
            cache,
            max_frames,
            ..
        } = self;
        let mut iter = unwinder.iter_frames(ip, UnwindRegsX86_64::new(ip, sp, bp), cache, read_stack);
        loop {
            match iter.next() {
                Ok(Some(frame_address)) => {
                    let pc = match frame_address {
                        FrameAddress::InstructionPointer(pc) => pc,
                        FrameAddress::ReturnAddress(ra) => ra.into(),
                    };
                    frames.push(resolve_frame(maps, pc));
                    if frames.len() >= *max_frames {
                        kind = CallstackKind::StackTopForDwarf;
                        break;
                    }
                }
                Ok(None) => break,
                Err(unwind_error) => {
                    warn!("unwinding stopped after {} frames: {unwind_error}", frames.len());
                    kind = error_kind;
                    break;
                }
            }
        }

        if frames.is_empty() {
            return Callstack::empty(CallstackKind::Empty);
        }
        Callstack::new(frames, kind)
    }

    fn error_kind(&self) -> CallstackKind {
        match self.method {
            UnwindingMethod::FramePointer => CallstackKind::FramePointerUnwindingError,
            _ => CallstackKind::DwarfUnwindingError,
        }
    }
}

fn resolve_frame(maps: &ProcessMaps, pc: u64) -> Frame {
    match maps.lookup(pc) {
        Some(region) if !region.name.is_empty() => Frame {
            pc,
            module: Some(region.name.clone()),
            offset_in_module: pc - region.start + region.file_offset,
        },
        _ => Frame {
            pc,
            module: None,
            offset_in_module: 0,
        },
    }
}
