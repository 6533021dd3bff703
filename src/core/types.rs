//! Core types used throughout pstack: Registers, Frame, ThreadStack and the
//! error enums shared between the live and core paths.

use std::fmt;

use thiserror::Error;

pub type Pid = i32;

/// The register subset the unwinder and the renderers care about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}

#[cfg(not(target_arch = "x86_64"))]
compile_error!("pstack currently supports only x86_64 targets");

/// A resolved symbol for a frame: which image, which symbol, how far in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub image: String,
    pub name: String,
    pub offset: u64,
}

/// One native stack frame, innermost first in a `ThreadStack`.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
    pub symbol: Option<SymbolInfo>,
    pub source: Option<(String, u32)>,
}

/// A thread as the enumerator found it: the kernel-visible id, the pthread
/// handle when the thread-library walk produced one, and a register set.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub lwp: Pid,
    pub pthread: Option<u64>,
    pub regs: Registers,
}

#[derive(Debug, Clone)]
pub struct ThreadStack {
    pub thread: ThreadRecord,
    pub frames: Vec<Frame>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}", self.ip)?;
        if let Some(ref sym) = self.symbol {
            write!(f, " {}+{:#x} ({})", sym.name, sym.offset, sym.image)?;
        }
        if let Some((ref file, line)) = self.source {
            write!(f, " at {}:{}", file, line)?;
        }
        Ok(())
    }
}

/// Errors from reading the target's address space. Short reads and unmapped
/// addresses are explicit failures, never silent truncation.
#[derive(Error, Debug)]
pub enum MemoryCopyError {
    #[error("permission denied when reading from the target. If you're not running as root, try again with sudo. If you're using Docker, try passing `--cap-add=SYS_PTRACE` to `docker run`")]
    PermissionDenied,
    #[error("process isn't running")]
    ProcessEnded,
    #[error("address {0:#x} is not mapped in the target")]
    UnmappedAddress(u64),
    #[error("short read at {0:#x}: wanted {1} bytes, got {2}")]
    ShortRead(u64, usize, usize),
    #[error("too much memory requested when copying: {0}")]
    RequestTooLarge(usize),
    #[error("no NUL terminator within {1} bytes at {0:#x}")]
    UnterminatedString(u64, usize),
    #[error("tried to read invalid string")]
    InvalidString(#[from] std::string::FromUtf8Error),
    #[error("failed to copy memory address {0:#x}")]
    Io(u64, #[source] std::io::Error),
}

/// Errors opening or freezing a target.
#[derive(Error, Debug)]
pub enum ProcError {
    #[error("no such process: {0}")]
    NoSuchProcess(Pid),
    #[error("couldn't read {0}: {1}")]
    UnreadableCore(String, #[source] std::io::Error),
    #[error("{0} is not an ELF core file")]
    NotACore(String),
    #[error("malformed core file {0}: {1}")]
    MalformedCore(String, String),
    #[error("failed to stop any thread of process {0}")]
    StopFailed(Pid),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_display_with_and_without_annotations() {
        let mut frame = Frame {
            ip: 0x40_1000,
            ..Default::default()
        };
        assert_eq!(format!("{}", frame), "0x0000000000401000");

        frame.symbol = Some(SymbolInfo {
            image: "a.out".to_string(),
            name: "worker".to_string(),
            offset: 0x1f,
        });
        frame.source = Some(("worker.c".to_string(), 42));
        assert_eq!(
            format!("{}", frame),
            "0x0000000000401000 worker+0x1f (a.out) at worker.c:42"
        );
    }
}
