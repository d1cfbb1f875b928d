use std::io;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::c_void;
use thiserror::Error;

use super::sys::PerfEventMmapPage;
use crate::records::{RawRecord, RecordHeader, RECORD_HEADER_SIZE};

/// Failure modes of a single read attempt against the ring buffer.
#[derive(Debug, Error)]
pub enum RingBufferError {
    /// The kernel produced more data than the consumer read in time and the
    /// unread span was overwritten. Non-fatal: the caller reports the lost
    /// byte span and resynchronizes with [`RingBufferReader::resync`].
    #[error("consumer too slow, {lost_bytes} unread bytes overwritten")]
    Overrun { lost_bytes: u64 },

    /// A record with `kind == 0` or a size that runs past `data_head`. This
    /// means the buffer is broken (kernel bug or memory corruption) and the
    /// capture must be aborted.
    #[error("malformed record at tail {tail:#x}: kind {kind}, size {size}")]
    Malformed { tail: u64, kind: u32, size: u16 },

    /// A read larger than the ring itself was requested. Programming error.
    #[error("requested {requested} bytes from a {ring_size}-byte ring")]
    RequestTooLarge { requested: u64, ring_size: u64 },
}

/// Copy `len` bytes starting at ring offset `tail` into `dst`, splitting the
/// copy in two if the span wraps around the end of the ring. `data.len()`
/// must be a power of two.
fn copy_from_ring(data: &[u8], tail: u64, len: usize, dst: &mut Vec<u8>) {
    let size = data.len() as u64;
    let modulo = (tail & (size - 1)) as usize;
    if modulo + len <= data.len() {
        dst.extend_from_slice(&data[modulo..modulo + len]);
    } else {
        let first = data.len() - modulo;
        dst.extend_from_slice(&data[modulo..]);
        dst.extend_from_slice(&data[..len - first]);
    }
}

/// Single-consumer reader over the kernel-shared ring buffer of one
/// `perf_event_open` fd.
///
/// The first page of the mapping is the metadata page; `data_size` bytes of
/// ring follow at `data_offset`. `data_head` is advanced by the kernel with
/// release semantics, `data_tail` by us with release semantics, so the
/// kernel knows how far we have read and does not overwrite unread records.
///
/// The reader exclusively owns the mapping; it is unmapped exactly once on
/// drop. One reader must only ever be used from one thread at a time.
pub struct RingBufferReader {
    mmap_start: *mut u8,
    mmap_len: usize,
    data: *const u8,
    data_size: u64,
    mask: u64,
    exponent: u32,
}

// The raw pointers are only touched through &self/&mut self and the mapping
// lives until drop, so moving the reader to another thread is fine.
unsafe impl Send for RingBufferReader {}

impl RingBufferReader {
    /// Maps `1 + pages` pages of the given perf event fd: one metadata page
    /// followed by a `pages * page_size` ring. `pages` must be a power of
    /// two, as required by the kernel.
    pub fn open(fd: i32, pages: u32) -> io::Result<Self> {
        if !pages.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring buffer page count must be a power of two",
            ));
        }

        let page_size = page_size();
        let mmap_len = (1 + pages as usize) * page_size;
        let mmap_start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mmap_start == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mmap_start = mmap_start as *mut u8;

        let metadata = unsafe { &*(mmap_start as *const PerfEventMmapPage) };
        let data_offset = metadata.data_offset;
        let data_size = metadata.data_size;
        debug_assert!(data_size.is_power_of_two());

        // data_size is a power of two, so index-mod and index-div become a
        // mask and a shift. Compute the exponent once, here.
        let exponent = data_size.trailing_zeros();

        Ok(RingBufferReader {
            mmap_start,
            mmap_len,
            data: unsafe { mmap_start.add(data_offset as usize) },
            data_size,
            mask: data_size - 1,
            exponent,
        })
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    fn metadata(&self) -> *mut PerfEventMmapPage {
        self.mmap_start as *mut PerfEventMmapPage
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.metadata()).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn read_tail(&self) -> u64 {
        // No fence: the tail is only ever written by us.
        unsafe { ptr::read_volatile(&(*self.metadata()).data_tail) }
    }

    fn write_tail(&mut self, value: u64) {
        fence(Ordering::AcqRel);
        unsafe { ptr::write_volatile(&mut (*self.metadata()).data_tail, value) };
    }

    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data, self.data_size as usize) }
    }

    /// True iff at least one record header's worth of data is available.
    pub fn has_new_data(&self) -> bool {
        self.read_head() - self.read_tail() >= RECORD_HEADER_SIZE as u64
    }

    /// Reads the header of the record at the current tail, without consuming
    /// anything. The caller must follow up with [`Self::read_record`] or
    /// [`Self::skip_record`].
    pub fn read_header(&self) -> Result<RecordHeader, RingBufferError> {
        let head = self.read_head();
        let tail = self.read_tail();

        if head - tail > self.data_size {
            // The kernel wrapped past us. With PROT_WRITE and a properly
            // maintained data_tail this only happens if we stopped reading
            // for too long.
            return Err(RingBufferError::Overrun {
                lost_bytes: head - tail,
            });
        }

        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE);
        copy_from_ring(self.data(), tail, RECORD_HEADER_SIZE, &mut bytes);
        let header = RecordHeader::parse(&bytes);

        if header.kind == 0
            || (header.size as usize) < RECORD_HEADER_SIZE
            || tail + header.size as u64 > head
        {
            return Err(RingBufferError::Malformed {
                tail,
                kind: header.kind,
                size: header.size,
            });
        }

        Ok(header)
    }

    /// Copies the full record described by `header` out of the ring and
    /// advances the tail past it.
    pub fn read_record(&mut self, header: &RecordHeader) -> Result<RawRecord, RingBufferError> {
        let payload_len = header.size as usize - RECORD_HEADER_SIZE;
        if header.size as u64 > self.data_size {
            return Err(RingBufferError::RequestTooLarge {
                requested: header.size as u64,
                ring_size: self.data_size,
            });
        }

        let tail = self.read_tail();
        let mut data = Vec::with_capacity(payload_len);
        copy_from_ring(
            self.data(),
            tail + RECORD_HEADER_SIZE as u64,
            payload_len,
            &mut data,
        );
        self.write_tail(tail + header.size as u64);

        Ok(RawRecord {
            header: *header,
            data,
        })
    }

    /// Advances the tail past the record without copying it. Used to drop
    /// records of unknown kind.
    pub fn skip_record(&mut self, header: &RecordHeader) {
        let tail = self.read_tail();
        self.write_tail(tail + header.size as u64);
    }

    /// Drops everything currently unread. Called after [`RingBufferError::Overrun`].
    pub fn resync(&mut self) {
        let head = self.read_head();
        self.write_tail(head);
    }
}

impl Drop for RingBufferReader {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_start as *mut c_void, self.mmap_len);
        }
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RECORD_HEADER_SIZE;

    fn make_record_bytes(kind: u32, payload: &[u8]) -> Vec<u8> {
        let size = (RECORD_HEADER_SIZE + payload.len()) as u16;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn contiguous_copy_is_byte_exact() {
        let mut ring = vec![0u8; 64];
        let record = make_record_bytes(9, &[1, 2, 3, 4, 5, 6, 7, 8]);
        ring[8..8 + record.len()].copy_from_slice(&record);

        let mut out = Vec::new();
        copy_from_ring(&ring, 8, record.len(), &mut out);
        assert_eq!(out, record);
    }

    #[test]
    fn wrapping_copy_is_byte_exact() {
        // Place a 16-byte record so that it straddles the end of a 64-byte
        // ring: 10 bytes at the end, 6 at the beginning.
        let mut ring = vec![0u8; 64];
        let record = make_record_bytes(9, &[10, 20, 30, 40, 50, 60, 70, 80]);
        assert_eq!(record.len(), 16);
        ring[54..].copy_from_slice(&record[..10]);
        ring[..6].copy_from_slice(&record[10..]);

        let mut out = Vec::new();
        copy_from_ring(&ring, 54, record.len(), &mut out);
        assert_eq!(out, record);
    }

    #[test]
    fn wrapping_copy_with_unmasked_tail_is_byte_exact() {
        // The tail is an absolute position; only its low bits index the ring.
        let mut ring = vec![0u8; 64];
        let record = make_record_bytes(9, &[9, 9, 9, 9, 9, 9, 9, 9]);
        ring[56..].copy_from_slice(&record[..8]);
        ring[..8].copy_from_slice(&record[8..]);

        let mut out = Vec::new();
        copy_from_ring(&ring, 64 * 3 + 56, record.len(), &mut out);
        assert_eq!(out, record);
    }
}
