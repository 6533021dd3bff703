//! Post-mortem target view: the PT_LOAD segment table of an ELF core file,
//! its NT_PRSTATUS register notes and its NT_FILE mapping table.
//!
//! Reads against a core resolve virtual addresses to file offsets; anything
//! outside a loadable segment is an explicit `UnmappedAddress`, and a read
//! running off the dumped portion of a segment is an explicit `ShortRead`.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;

use crate::core::mem::ProcessMemory;
use crate::core::types::{MemoryCopyError, Pid, ProcError, Registers};

// Offsets into struct elf_prstatus on x86_64.
const PRSTATUS_PR_PID: usize = 32;
const PRSTATUS_PR_REG: usize = 112;
// Indexes into the user_regs_struct array embedded in pr_reg.
const REG_RBP: usize = 4;
const REG_RIP: usize = 16;
const REG_RSP: usize = 19;

#[derive(Debug, Clone, Copy)]
struct Segment {
    vaddr: u64,
    memsz: u64,
    filesz: u64,
    offset: u64,
}

/// One entry of the core's NT_FILE note: a file-backed mapping recorded at
/// dump time. This is how a core tells us which images were loaded where.
#[derive(Debug, Clone)]
pub struct FileMapping {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
}

pub struct CoreFile {
    path: String,
    data: Vec<u8>,
    segments: Vec<Segment>,
    threads: Vec<(Pid, Registers)>,
    mappings: Vec<FileMapping>,
}

impl CoreFile {
    pub fn open(path: &Path) -> Result<CoreFile, ProcError> {
        let name = path.display().to_string();
        let data = fs::read(path).map_err(|e| ProcError::UnreadableCore(name.clone(), e))?;
        let header = elf::FileHeader64::<Endianness>::parse(&*data)
            .map_err(|e| ProcError::MalformedCore(name.clone(), e.to_string()))?;
        let endian = header
            .endian()
            .map_err(|e| ProcError::MalformedCore(name.clone(), e.to_string()))?;
        if header.e_type(endian) != elf::ET_CORE {
            return Err(ProcError::NotACore(name));
        }

        let mut segments = Vec::new();
        let mut threads = Vec::new();
        let mut mappings = Vec::new();

        let phdrs = header
            .program_headers(endian, &*data)
            .map_err(|e| ProcError::MalformedCore(name.clone(), e.to_string()))?;
        for ph in phdrs {
            match ph.p_type(endian) {
                elf::PT_LOAD => segments.push(Segment {
                    vaddr: ph.p_vaddr(endian),
                    memsz: ph.p_memsz(endian),
                    filesz: ph.p_filesz(endian),
                    offset: ph.p_offset(endian),
                }),
                elf::PT_NOTE => {
                    let mut notes = match ph.notes(endian, &*data) {
                        Ok(Some(notes)) => notes,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("skipping malformed note segment in {}: {}", name, e);
                            continue;
                        }
                    };
                    loop {
                        match notes.next() {
                            Ok(Some(note)) => match note.n_type(endian) {
                                elf::NT_PRSTATUS => {
                                    if let Some(thread) = parse_prstatus(note.desc()) {
                                        threads.push(thread);
                                    }
                                }
                                elf::NT_FILE => {
                                    mappings = parse_nt_file(note.desc());
                                }
                                _ => {}
                            },
                            Ok(None) => break,
                            Err(e) => {
                                warn!("stopping note scan in {}: {}", name, e);
                                break;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        segments.sort_by_key(|s| s.vaddr);
        debug!(
            "core {}: {} segments, {} threads, {} file mappings",
            name,
            segments.len(),
            threads.len(),
            mappings.len()
        );
        Ok(CoreFile {
            path: name,
            data,
            segments,
            threads,
            mappings,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn threads(&self) -> &[(Pid, Registers)] {
        &self.threads
    }

    pub fn mappings(&self) -> &[FileMapping] {
        &self.mappings
    }
}

impl ProcessMemory for CoreFile {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryCopyError> {
        if buf.is_empty() {
            return Ok(());
        }
        let seg = match self
            .segments
            .iter()
            .rev()
            .find(|s| addr >= s.vaddr && addr < s.vaddr + s.memsz)
        {
            Some(seg) => seg,
            None => return Err(MemoryCopyError::UnmappedAddress(addr)),
        };
        let into_seg = addr - seg.vaddr;
        if into_seg >= seg.filesz {
            // Mapped in the process, but not dumped into the core.
            return Err(MemoryCopyError::UnmappedAddress(addr));
        }
        let avail = (seg.filesz - into_seg) as usize;
        if avail < buf.len() {
            return Err(MemoryCopyError::ShortRead(addr, buf.len(), avail));
        }
        let start = (seg.offset + into_seg) as usize;
        let end = start + buf.len();
        let bytes = self
            .data
            .get(start..end)
            .ok_or(MemoryCopyError::ShortRead(addr, buf.len(), 0))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

fn parse_prstatus(desc: &[u8]) -> Option<(Pid, Registers)> {
    let reg_at = |idx: usize| -> Option<u64> {
        let off = PRSTATUS_PR_REG + idx * 8;
        Some(u64::from_le_bytes(desc.get(off..off + 8)?.try_into().ok()?))
    };
    let pid = u32::from_le_bytes(
        desc.get(PRSTATUS_PR_PID..PRSTATUS_PR_PID + 4)?
            .try_into()
            .ok()?,
    ) as Pid;
    Some((
        pid,
        Registers {
            rip: reg_at(REG_RIP)?,
            rsp: reg_at(REG_RSP)?,
            rbp: reg_at(REG_RBP)?,
        },
    ))
}

fn parse_nt_file(desc: &[u8]) -> Vec<FileMapping> {
    let u64_at = |off: usize| -> Option<u64> {
        Some(u64::from_le_bytes(desc.get(off..off + 8)?.try_into().ok()?))
    };
    let count = match u64_at(0) {
        Some(n) if n < 0x10000 => n as usize,
        _ => return Vec::new(),
    };
    // The per-mapping file offset is recorded in pages.
    let page_size = u64_at(8).filter(|&p| p > 0).unwrap_or(4096);
    let table = 16;
    let strings_start = table + count * 24;
    let mut names = desc
        .get(strings_start..)
        .unwrap_or(&[])
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned());

    let mut mappings = Vec::with_capacity(count);
    for i in 0..count {
        let base = table + i * 24;
        let (start, end, file_offset) = match (u64_at(base), u64_at(base + 8), u64_at(base + 16)) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => break,
        };
        let path = match names.next() {
            Some(p) if !p.is_empty() => p,
            _ => continue,
        };
        mappings.push(FileMapping {
            start,
            end,
            file_offset: file_offset * page_size,
            path,
        });
    }
    mappings
}

/// Classify a file on the command line: a core, some other ELF image, or
/// not ELF at all.
#[derive(Debug, PartialEq, Eq)]
pub enum ElfKind {
    Core,
    Other,
    NotElf,
}

pub fn classify_elf(data: &[u8]) -> ElfKind {
    match elf::FileHeader64::<Endianness>::parse(data) {
        Ok(header) => match header.endian() {
            Ok(endian) if header.e_type(endian) == elf::ET_CORE => ElfKind::Core,
            Ok(_) => ElfKind::Other,
            Err(_) => ElfKind::NotElf,
        },
        Err(_) => ElfKind::NotElf,
    }
}
