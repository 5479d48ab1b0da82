//! Snapshot of the process memory map.
//!
//! [`MapsSnapshot`] parses `/proc/self/maps` into a sorted list of regions.
//! [`MapsSnapshot::reload`] allocates and sizes every buffer; afterwards
//! [`MapsSnapshot::refresh_in_place`] re-reads the file using only those
//! buffers, so it can run while other threads are suspended.

use std::io;

/// One mapping from `/proc/self/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// First address.
    pub begin: usize,
    /// One past the last address.
    pub end: usize,
    /// `r` permission.
    pub readable: bool,
    /// `w` permission.
    pub writable: bool,
}

impl MappedRegion {
    /// Whether `addr` lies in the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }
}

const MAPS_PATH: &[u8] = b"/proc/self/maps\0";

/// Slack added when sizing buffers, so that mappings created between
/// `reload` and `refresh_in_place` still fit.
const BUFFER_SLACK: usize = 64 * 1024;
const REGION_SLACK: usize = 256;

/// Parsed memory map with pre-reserved buffers.
#[derive(Debug, Default)]
pub struct MapsSnapshot {
    regions: Vec<MappedRegion>,
    scratch: Vec<MappedRegion>,
    text: Vec<u8>,
}

impl MapsSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from already-parsed regions.
    pub fn from_regions(mut regions: Vec<MappedRegion>) -> Self {
        regions.sort_by_key(|region| region.begin);
        Self {
            regions,
            scratch: Vec::new(),
            text: Vec::new(),
        }
    }

    /// Read and parse the map, growing buffers as needed.
    pub fn reload(&mut self) -> io::Result<()> {
        let text = std::fs::read("/proc/self/maps")?;
        let lines = text.iter().filter(|&&b| b == b'\n').count();

        self.text = Vec::with_capacity(text.len() * 2 + BUFFER_SLACK);
        self.regions = Vec::with_capacity(lines * 2 + REGION_SLACK);
        self.scratch = Vec::with_capacity(lines * 2 + REGION_SLACK);
        if !parse_maps(&text, &mut self.regions) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unparseable memory map"));
        }
        Ok(())
    }

    /// Re-read the map without allocating.
    ///
    /// Returns `false` and keeps the previous regions when the map no longer
    /// fits the reserved buffers or cannot be read.
    pub fn refresh_in_place(&mut self) -> bool {
        if self.text.capacity() == 0 || !read_into(&mut self.text) {
            return false;
        }
        if !parse_maps(&self.text, &mut self.scratch) {
            return false;
        }
        std::mem::swap(&mut self.regions, &mut self.scratch);
        true
    }

    /// Parsed regions, sorted by start address.
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    /// Whether `[begin, begin + len)` is covered by contiguous readable
    /// regions.
    pub fn is_readable(&self, begin: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = begin.checked_add(len) else {
            return false;
        };
        let mut index = match self.regions.binary_search_by(|region| region.begin.cmp(&begin)) {
            Ok(index) => index,
            Err(0) => return false,
            Err(index) => index - 1,
        };
        let mut cursor = begin;
        while cursor < end {
            let Some(region) = self.regions.get(index) else {
                return false;
            };
            if !region.readable || !region.contains(cursor) {
                return false;
            }
            cursor = region.end;
            index += 1;
        }
        true
    }
}

/// Parse map text into `out`, never growing `out` past its capacity.
///
/// Returns `false` if a line is malformed or `out` is full.
fn parse_maps(text: &[u8], out: &mut Vec<MappedRegion>) -> bool {
    out.clear();
    for line in text.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let Some(region) = parse_line(line) else {
            return false;
        };
        if out.len() == out.capacity() {
            return false;
        }
        out.push(region);
    }
    true
}

/// Parse `begin-end perms ...`.
fn parse_line(line: &[u8]) -> Option<MappedRegion> {
    let dash = line.iter().position(|&b| b == b'-')?;
    let space = line.iter().position(|&b| b == b' ')?;
    if space <= dash {
        return None;
    }
    let begin = parse_hex(&line[..dash])?;
    let end = parse_hex(&line[dash + 1..space])?;
    let perms = line.get(space + 1..space + 5)?;
    Some(MappedRegion {
        begin,
        end,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
    })
}

fn parse_hex(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &b| {
        let digit = (b as char).to_digit(16)? as usize;
        acc.checked_mul(16)?.checked_add(digit)
    })
}

/// Read the whole map into `buf` using raw syscalls.
///
/// Returns `false` if the file does not fit in `buf`'s capacity.
#[cfg(target_os = "linux")]
fn read_into(buf: &mut Vec<u8>) -> bool {
    buf.clear();
    // SAFETY: the path is NUL-terminated; reads stay within the spare
    // capacity and the length is only extended by the bytes read.
    unsafe {
        let fd = libc::open(
            MAPS_PATH.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return false;
        }
        let mut complete = false;
        loop {
            let spare = buf.capacity() - buf.len();
            if spare == 0 {
                break;
            }
            let n = libc::read(fd, buf.as_mut_ptr().add(buf.len()) as *mut libc::c_void, spare);
            if n < 0 {
                if *libc::__errno_location() == libc::EINTR {
                    continue;
                }
                break;
            }
            if n == 0 {
                complete = true;
                break;
            }
            buf.set_len(buf.len() + n as usize);
        }
        libc::close(fd);
        complete
    }
}

#[cfg(not(target_os = "linux"))]
fn read_into(_buf: &mut Vec<u8>) -> bool {
    let _ = MAPS_PATH;
    false
}
