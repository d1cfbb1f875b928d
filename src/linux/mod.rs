pub mod perf_event;
pub mod perf_group;
pub mod proc_maps;
pub mod ring_buffer;
pub mod sys;

pub use perf_event::{EventSource, Perf, PerfBuilder};
pub use perf_group::PerfGroup;
pub use proc_maps::{ProcessMaps, Region};
pub use ring_buffer::RingBufferReader;

pub fn read_string_lossy<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<String> {
    let data = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}
