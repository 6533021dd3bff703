//! Utility functions for copying memory out of a target's address space.
//!
//! Everything the inspector reads out of a process goes through the
//! `ProcessMemory` trait so that live targets (process_vm_readv), core files
//! (segment-table lookups) and test fixtures are interchangeable.

use crate::core::types::MemoryCopyError;

const MAX_COPY_LENGTH: usize = 20_000_000;

/// A read-only view of a target's address space. Implementations must be
/// callable concurrently and must report partial reads as errors.
pub trait ProcessMemory {
    /// Fill `buf` from target address `addr`, completely or not at all.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryCopyError>;
}

pub fn copy_address<T: ProcessMemory + ?Sized>(
    addr: u64,
    length: usize,
    source: &T,
) -> Result<Vec<u8>, MemoryCopyError> {
    if length > MAX_COPY_LENGTH {
        return Err(MemoryCopyError::RequestTooLarge(length));
    }
    let mut copy = vec![0; length];
    source.read_at(addr, &mut copy)?;
    Ok(copy)
}

pub fn read_u64<T: ProcessMemory + ?Sized>(addr: u64, source: &T) -> Result<u64, MemoryCopyError> {
    let mut buf = [0u8; 8];
    source.read_at(addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_u32<T: ProcessMemory + ?Sized>(addr: u64, source: &T) -> Result<u32, MemoryCopyError> {
    let mut buf = [0u8; 4];
    source.read_at(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32<T: ProcessMemory + ?Sized>(addr: u64, source: &T) -> Result<i32, MemoryCopyError> {
    read_u32(addr, source).map(|v| v as i32)
}

pub fn read_i64<T: ProcessMemory + ?Sized>(addr: u64, source: &T) -> Result<i64, MemoryCopyError> {
    read_u64(addr, source).map(|v| v as i64)
}

/// Read a pointer-sized array of target addresses.
pub fn read_ptr_vec<T: ProcessMemory + ?Sized>(
    addr: u64,
    count: usize,
    source: &T,
) -> Result<Vec<u64>, MemoryCopyError> {
    let raw = copy_address(addr, count * 8, source)?;
    Ok(raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Read a NUL-terminated string of at most `max` bytes. Fails if no
/// terminator shows up within the bound.
pub fn read_c_string<T: ProcessMemory + ?Sized>(
    addr: u64,
    max: usize,
    source: &T,
) -> Result<String, MemoryCopyError> {
    // Fetch in small chunks so a string near the end of a mapping doesn't
    // fault the whole read.
    const CHUNK: usize = 256;
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < max {
        let want = CHUNK.min(max - offset);
        let mut buf = vec![0; want];
        source.read_at(addr + offset as u64, &mut buf)?;
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..nul]);
            return Ok(String::from_utf8(out)?);
        }
        out.extend_from_slice(&buf);
        offset += want;
    }
    Err(MemoryCopyError::UnterminatedString(addr, max))
}

/// Decoders for little-endian fields at explicit offsets inside a buffer
/// already copied out of the target. Struct layouts mirror the target's ABI,
/// so fields are picked out by offset rather than by casting to host structs.
pub mod field {
    use crate::core::types::MemoryCopyError;

    pub fn u64_at(buf: &[u8], off: usize) -> Result<u64, MemoryCopyError> {
        let bytes = buf
            .get(off..off + 8)
            .ok_or(MemoryCopyError::ShortRead(off as u64, 8, 0))?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn i64_at(buf: &[u8], off: usize) -> Result<i64, MemoryCopyError> {
        u64_at(buf, off).map(|v| v as i64)
    }

    pub fn u32_at(buf: &[u8], off: usize) -> Result<u32, MemoryCopyError> {
        let bytes = buf
            .get(off..off + 4)
            .ok_or(MemoryCopyError::ShortRead(off as u64, 4, 0))?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn i32_at(buf: &[u8], off: usize) -> Result<i32, MemoryCopyError> {
        u32_at(buf, off).map(|v| v as i32)
    }

    pub fn f64_at(buf: &[u8], off: usize) -> Result<f64, MemoryCopyError> {
        u64_at(buf, off).map(f64::from_bits)
    }
}

/// Live-process implementation backed by process_vm_readv, scoped to a pid.
pub struct LivePid {
    pid: crate::core::types::Pid,
}

impl LivePid {
    pub fn new(pid: crate::core::types::Pid) -> Self {
        LivePid { pid }
    }
}

impl ProcessMemory for LivePid {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let nread =
            unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if nread < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ESRCH) => MemoryCopyError::ProcessEnded,
                Some(libc::EFAULT) => MemoryCopyError::UnmappedAddress(addr),
                Some(libc::EPERM) => MemoryCopyError::PermissionDenied,
                _ => MemoryCopyError::Io(addr, err),
            });
        }
        if nread as usize != buf.len() {
            return Err(MemoryCopyError::ShortRead(addr, buf.len(), nread as usize));
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! An address space assembled from in-memory chunks, for hermetic tests
    //! of everything that consumes `ProcessMemory`.
    use std::collections::BTreeMap;

    use super::ProcessMemory;
    use crate::core::types::MemoryCopyError;

    #[derive(Default)]
    pub struct FakeMemory {
        chunks: BTreeMap<u64, Vec<u8>>,
    }

    impl FakeMemory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Lay bytes into the fake address space. A write landing inside an
        /// existing chunk patches it in place, so fixtures can fix up fields
        /// after the fact (e.g. to build cycles).
        pub fn put(&mut self, addr: u64, bytes: &[u8]) {
            if let Some((&base, chunk)) = self.chunks.range_mut(..=addr).next_back() {
                let start = (addr - base) as usize;
                if start < chunk.len() && start + bytes.len() <= chunk.len() {
                    chunk[start..start + bytes.len()].copy_from_slice(bytes);
                    return;
                }
            }
            self.chunks.insert(addr, bytes.to_vec());
        }

        pub fn put_u64(&mut self, addr: u64, value: u64) {
            self.put(addr, &value.to_le_bytes());
        }
    }

    impl ProcessMemory for FakeMemory {
        fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
            let (base, chunk) = self
                .chunks
                .range(..=addr)
                .next_back()
                .ok_or(MemoryCopyError::UnmappedAddress(addr))?;
            let start = (addr - base) as usize;
            let end = start + buf.len();
            if start > chunk.len() {
                return Err(MemoryCopyError::UnmappedAddress(addr));
            }
            if end > chunk.len() {
                return Err(MemoryCopyError::ShortRead(
                    addr,
                    buf.len(),
                    chunk.len() - start,
                ));
            }
            buf.copy_from_slice(&chunk[start..end]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeMemory;
    use super::*;

    #[test]
    fn copy_refuses_oversized_requests() {
        let mem = FakeMemory::new();
        match copy_address(0x1000, MAX_COPY_LENGTH + 1, &mem) {
            Err(MemoryCopyError::RequestTooLarge(_)) => {}
            other => panic!("expected RequestTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn c_string_stops_at_nul() {
        let mut mem = FakeMemory::new();
        mem.put(0x1000, b"hello\0garbage");
        assert_eq!(read_c_string(0x1000, 64, &mem).unwrap(), "hello");
    }

    #[test]
    fn c_string_without_terminator_fails() {
        let mut mem = FakeMemory::new();
        let mut block = vec![b'x'; 512];
        block.push(0);
        mem.put(0x1000, &block);
        match read_c_string(0x1000, 16, &mem) {
            Err(MemoryCopyError::UnterminatedString(0x1000, 16)) => {}
            other => panic!("expected UnterminatedString, got {:?}", other),
        }
    }

    #[test]
    fn unmapped_reads_are_errors() {
        let mut mem = FakeMemory::new();
        mem.put(0x1000, &[1, 2, 3, 4]);
        assert!(matches!(
            read_u64(0x4000_0000, &mem),
            Err(MemoryCopyError::UnmappedAddress(_)) | Err(MemoryCopyError::ShortRead(..))
        ));
    }

    #[test]
    fn field_decoding_is_bounds_checked() {
        let buf = 0xdead_beef_u64.to_le_bytes();
        assert_eq!(field::u64_at(&buf, 0).unwrap(), 0xdead_beef);
        assert!(field::u64_at(&buf, 4).is_err());
    }
}
