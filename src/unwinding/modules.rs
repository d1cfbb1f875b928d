//! Loads unwind information for executable mappings.
//!
//! When the target maps an executable file (at capture start, or later via
//! an mmap record), the file's `.eh_frame`/`.text` sections are handed to
//! the unwinder so DWARF CFI unwinding can cross that module's frames.

use std::ops::{Deref, Range};
use std::sync::Arc;

use framehop::{ExplicitModuleSectionInfo, Module};
use log::{debug, warn};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment};

/// Section bytes handed to the unwinder: either a range of the mmapped
/// module file, or an owned copy (for compressed sections).
#[derive(Clone)]
pub enum SectionData {
    MmapRange(Arc<Mmap>, (usize, usize)),
    Vec(Arc<Vec<u8>>),
}

impl SectionData {
    pub fn new_mmap_range(mmap: Arc<Mmap>, start: u64, size: u64) -> Option<SectionData> {
        let start = usize::try_from(start).ok()?;
        let size = usize::try_from(size).ok()?;
        let end = start.checked_add(size)?;
        if end <= mmap.len() {
            Some(Self::MmapRange(mmap, (start, size)))
        } else {
            None
        }
    }
}

impl Deref for SectionData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            SectionData::MmapRange(mmap, (start, size)) => &mmap[*start..][..*size],
            SectionData::Vec(vec) => &vec[..],
        }
    }
}

/// What the rest of the capture needs to know about a loaded module; turned
/// into a module-update client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub file_path: String,
    pub file_size: u64,
    pub address_start: u64,
    pub address_end: u64,
    pub build_id: String,
    pub load_bias: u64,
}

fn section_data<'a>(
    section: &impl ObjectSection<'a>,
    mmap: &Arc<Mmap>,
) -> Option<SectionData> {
    let range = section.compressed_file_range().ok()?;
    match range.format {
        object::CompressionFormat::None => {
            SectionData::new_mmap_range(mmap.clone(), range.offset, range.uncompressed_size)
        }
        _ => Some(SectionData::Vec(Arc::new(
            section.uncompressed_data().ok()?.to_vec(),
        ))),
    }
}

fn svma_range<'a>(section: &impl ObjectSection<'a>) -> Range<u64> {
    section.address()..section.address() + section.size()
}

/// The stated virtual address the module's segments are relative to: the
/// lowest LOAD segment address. Zero for shared objects and PIEs.
fn relative_address_base<'data>(file: &impl Object<'data>) -> u64 {
    file.segments().map(|s| s.address()).min().unwrap_or(0)
}

/// Computes the load bias of a mapping: the amount every stated virtual
/// address is shifted by in this process. Finds the LOAD segment whose file
/// range covers the mapping's file offset and compares addresses.
fn compute_load_bias<'data>(
    file: &impl Object<'data>,
    mapping_start_file_offset: u64,
    mapping_start_avma: u64,
) -> Option<u64> {
    let segment = file.segments().find(|segment| {
        let (offset, size) = segment.file_range();
        offset <= mapping_start_file_offset && mapping_start_file_offset < offset + size.max(1)
    })?;
    let (segment_file_offset, _) = segment.file_range();
    let mapping_start_svma = segment.address() + (mapping_start_file_offset - segment_file_offset);
    mapping_start_avma.checked_sub(mapping_start_svma)
}

/// Opens the mapped file and builds the unwinder module plus the metadata
/// event for it. Returns `None` when the file cannot be read or is not an
/// object file (anonymous and special mappings, deleted files).
pub fn load_module(
    path: &str,
    mapping_start_avma: u64,
    mapping_size: u64,
    mapping_start_file_offset: u64,
) -> Option<(Module<SectionData>, LoadedModule)> {
    if path.is_empty() || path.starts_with('[') {
        return None;
    }

    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(error) => {
            debug!("could not open module file {path}: {error}");
            return None;
        }
    };
    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mmap = match unsafe { memmap2::MmapOptions::new().map(&file) } {
        Ok(mmap) => Arc::new(mmap),
        Err(error) => {
            warn!("could not mmap module file {path}: {error}");
            return None;
        }
    };

    let object_file = match object::File::parse(&mmap[..]) {
        Ok(object_file) => object_file,
        Err(_) => {
            debug!("module file {path} has unrecognized format");
            return None;
        }
    };

    let build_id = object_file
        .build_id()
        .ok()
        .flatten()
        .map(hex_string)
        .unwrap_or_default();

    let base_svma = relative_address_base(&object_file);
    let load_bias = compute_load_bias(&object_file, mapping_start_file_offset, mapping_start_avma)?;
    let base_avma = base_svma + load_bias;

    let text = object_file.section_by_name(".text");
    let got = object_file.section_by_name(".got");
    let eh_frame = object_file.section_by_name(".eh_frame");
    let eh_frame_hdr = object_file.section_by_name(".eh_frame_hdr");

    let section_info = ExplicitModuleSectionInfo {
        base_svma,
        text_svma: text.as_ref().map(svma_range),
        text: text.as_ref().and_then(|s| section_data(s, &mmap)),
        stubs_svma: None,
        stub_helper_svma: None,
        got_svma: got.as_ref().map(svma_range),
        unwind_info: None,
        eh_frame_svma: eh_frame.as_ref().map(svma_range),
        eh_frame: eh_frame.as_ref().and_then(|s| section_data(s, &mmap)),
        eh_frame_hdr_svma: eh_frame_hdr.as_ref().map(svma_range),
        eh_frame_hdr: eh_frame_hdr.as_ref().and_then(|s| section_data(s, &mmap)),
        debug_frame: None,
        text_segment_svma: None,
        text_segment: None,
    };

    let avma_range = mapping_start_avma..mapping_start_avma + mapping_size;
    let module = Module::new(path.to_owned(), avma_range, base_avma, section_info);

    let name = match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_owned(),
        None => path.to_owned(),
    };
    let loaded = LoadedModule {
        name,
        file_path: path.to_owned(),
        file_size,
        address_start: mapping_start_avma,
        address_end: mapping_start_avma + mapping_size,
        build_id,
        load_bias,
    };

    Some((module, loaded))
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
