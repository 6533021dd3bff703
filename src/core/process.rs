//! The process handle: one inspected target, live or post-mortem.
//!
//! A handle owns the target I/O view and the list of mapped objects, knows
//! every kernel thread's register set (pre-populated from core notes, filled
//! inside the stop scope for live targets) and borrows the image cache so
//! repeated batch-mode inspections amortize debug-info parsing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};
use nix::unistd;

use crate::core::corefile::CoreFile;
use crate::core::image::{Image, ImageCache};
use crate::core::mem::{LivePid, ProcessMemory};
use crate::core::types::{Frame, Pid, ProcError, Registers, SymbolInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Live,
    Core,
}

/// An executable or shared library mapped into the target, with the address
/// ranges it covers and the base its image was loaded at.
pub struct MappedObject {
    pub base: u64,
    pub path: PathBuf,
    pub ranges: Vec<(u64, u64)>,
}

pub struct Process<'a> {
    pub kind: TargetKind,
    pub pid: Option<Pid>,
    /// What the renderer calls the target: the executable path for a live
    /// process, the core's own path for a post-mortem one.
    pub name: String,
    pub io: Box<dyn ProcessMemory>,
    pub objects: Vec<MappedObject>,
    pub lwps: BTreeMap<Pid, Registers>,
    pub cache: &'a ImageCache,
}

impl<'a> Process<'a> {
    pub fn new_live(
        pid: Pid,
        exec_override: Option<&Path>,
        cache: &'a ImageCache,
    ) -> Result<Process<'a>, ProcError> {
        let proc_dir = PathBuf::from(format!("/proc/{}", pid));
        if !proc_dir.exists() {
            return Err(ProcError::NoSuchProcess(pid));
        }
        let exe = fs::read_link(proc_dir.join("exe"))
            .unwrap_or_else(|_| PathBuf::from(format!("/proc/{}/exe", pid)));

        let maps = proc_maps::get_process_maps(pid).map_err(ProcError::Io)?;
        let mut grouped: BTreeMap<PathBuf, MappedObject> = BTreeMap::new();
        let mut order: Vec<PathBuf> = Vec::new();
        for map in &maps {
            let path = match map.filename() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => continue,
            };
            if path.to_string_lossy().starts_with('[') {
                continue;
            }
            let start = map.start() as u64;
            let end = start + map.size() as u64;
            let base = start.saturating_sub(map.offset as u64);
            grouped
                .entry(path.clone())
                .and_modify(|obj| {
                    obj.base = obj.base.min(base);
                    obj.ranges.push((start, end));
                })
                .or_insert_with(|| {
                    order.push(path.clone());
                    MappedObject {
                        base,
                        path,
                        ranges: vec![(start, end)],
                    }
                });
        }
        let mut objects: Vec<MappedObject> = order
            .into_iter()
            .filter_map(|p| grouped.remove(&p))
            .collect();
        apply_exec_override(&mut objects, &exe, exec_override);

        let name = exec_override
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| exe.display().to_string());

        Ok(Process {
            kind: TargetKind::Live,
            pid: Some(pid),
            name,
            io: Box::new(LivePid::new(pid)),
            objects,
            lwps: BTreeMap::new(),
            cache,
        })
    }

    pub fn new_core(
        core_path: &Path,
        exec_override: Option<&Path>,
        cache: &'a ImageCache,
    ) -> Result<Process<'a>, ProcError> {
        let core = CoreFile::open(core_path)?;

        let mut grouped: BTreeMap<String, MappedObject> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for mapping in core.mappings() {
            let base = mapping.start.saturating_sub(mapping.file_offset);
            grouped
                .entry(mapping.path.clone())
                .and_modify(|obj| {
                    obj.base = obj.base.min(base);
                    obj.ranges.push((mapping.start, mapping.end));
                })
                .or_insert_with(|| {
                    order.push(mapping.path.clone());
                    MappedObject {
                        base,
                        path: PathBuf::from(&mapping.path),
                        ranges: vec![(mapping.start, mapping.end)],
                    }
                });
        }
        let mut objects: Vec<MappedObject> = order
            .into_iter()
            .filter_map(|p| grouped.remove(&p))
            .collect();

        // The executable's own mappings come first in the file note; the
        // override replaces where we look for its image on disk.
        let exe_path = objects.first().map(|o| o.path.clone());
        if let Some(exe_path) = exe_path {
            apply_exec_override(&mut objects, &exe_path, exec_override);
        }

        let lwps = core.threads().iter().copied().collect();
        let name = core.path().to_string();

        Ok(Process {
            kind: TargetKind::Core,
            pid: None,
            name,
            io: Box::new(core),
            objects,
            lwps,
            cache,
        })
    }

    /// The mapped object covering a target address. When ranges overlap
    /// (possible after unloads), the most recently loaded object wins.
    pub fn object_for(&self, addr: u64) -> Option<&MappedObject> {
        self.objects
            .iter()
            .rev()
            .find(|obj| obj.ranges.iter().any(|&(s, e)| addr >= s && addr < e))
    }

    pub fn image(&self, obj: &MappedObject) -> Option<Rc<Image>> {
        match self.cache.get(&obj.path) {
            Ok(image) => Some(image),
            Err(e) => {
                debug!("couldn't open {}: {:#}", obj.path.display(), e);
                None
            }
        }
    }

    /// The addend applied to the image's linked addresses.
    pub fn bias(obj: &MappedObject, image: &Image) -> u64 {
        if image.is_pic {
            obj.base
        } else {
            0
        }
    }

    /// Resolve a symbol by name anywhere in the target, returning its
    /// relocated address.
    pub fn find_symbol(&self, name: &str) -> Option<u64> {
        for obj in &self.objects {
            if let Some(image) = self.image(obj) {
                if let Some(addr) = image.symbol_address(name) {
                    return Some(addr + Self::bias(obj, &image));
                }
            }
        }
        None
    }

    /// Annotate a frame with symbol and source info. `lookup` is the
    /// call-site-adjusted address (ip for the innermost frame, ip-1 above).
    pub fn annotate_frame(&self, frame: &mut Frame, lookup: u64) {
        let obj = match self.object_for(lookup) {
            Some(obj) => obj,
            None => return,
        };
        let image = match self.image(obj) {
            Some(image) => image,
            None => return,
        };
        let bias = Self::bias(obj, &image);
        let local = lookup.wrapping_sub(bias);
        let image_name = obj
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| obj.path.display().to_string());
        if let Some((name, offset)) = image.symbol_for(local) {
            frame.symbol = Some(SymbolInfo {
                image: image_name,
                name: name.to_string(),
                offset: offset + (frame.ip - lookup),
            });
        }
        frame.source = image.source_for(local);
    }

    /// Register state of one kernel thread. Live threads must be inside a
    /// stop scope, which pre-fills the map; the direct ptrace query is a
    /// fallback for threads that appeared mid-scope.
    pub fn registers(&self, tid: Pid) -> Result<Registers, ProcError> {
        if let Some(regs) = self.lwps.get(&tid) {
            return Ok(*regs);
        }
        match self.kind {
            TargetKind::Core => Err(ProcError::NoSuchProcess(tid)),
            TargetKind::Live => getregs(tid),
        }
    }

    /// Kernel thread ids as /proc reports them right now (live only).
    pub fn task_tids(&self) -> Result<Vec<Pid>, ProcError> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(self.lwps.keys().copied().collect()),
        };
        let mut tids = Vec::new();
        for entry in fs::read_dir(format!("/proc/{}/task", pid)).map_err(ProcError::Io)? {
            let entry = entry.map_err(ProcError::Io)?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<Pid>() {
                tids.push(tid);
            }
        }
        Ok(tids)
    }
}

pub fn getregs(tid: Pid) -> Result<Registers, ProcError> {
    let regs = nix::sys::ptrace::getregs(unistd::Pid::from_raw(tid)).map_err(|e| {
        warn!("couldn't read registers of lwp {}: {}", tid, e);
        ProcError::Io(std::io::Error::from_raw_os_error(e as i32))
    })?;
    Ok(Registers {
        rip: regs.rip,
        rsp: regs.rsp,
        rbp: regs.rbp,
    })
}

fn apply_exec_override(objects: &mut [MappedObject], exe: &Path, exec_override: Option<&Path>) {
    if let Some(replacement) = exec_override {
        for obj in objects.iter_mut() {
            if obj.path == exe {
                debug!(
                    "using {} in place of {}",
                    replacement.display(),
                    obj.path.display()
                );
                obj.path = replacement.to_path_buf();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::ImageCache;

    fn dummy_process(cache: &ImageCache) -> Process {
        Process {
            kind: TargetKind::Core,
            pid: None,
            name: "test".into(),
            io: Box::new(crate::core::mem::testing::FakeMemory::new()),
            objects: vec![
                MappedObject {
                    base: 0x1000,
                    path: PathBuf::from("/lib/early.so"),
                    ranges: vec![(0x1000, 0x2000)],
                },
                MappedObject {
                    base: 0x1800,
                    path: PathBuf::from("/lib/late.so"),
                    ranges: vec![(0x1800, 0x2800)],
                },
            ],
            lwps: BTreeMap::new(),
            cache,
        }
    }

    #[test]
    fn object_lookup_prefers_most_recent_load() {
        let cache = ImageCache::new(vec![]);
        let proc = dummy_process(&cache);
        // Unambiguous addresses resolve normally.
        assert_eq!(
            proc.object_for(0x1400).unwrap().path,
            PathBuf::from("/lib/early.so")
        );
        assert_eq!(
            proc.object_for(0x2400).unwrap().path,
            PathBuf::from("/lib/late.so")
        );
        // In the overlap the later load wins.
        assert_eq!(
            proc.object_for(0x1900).unwrap().path,
            PathBuf::from("/lib/late.so")
        );
        assert!(proc.object_for(0x9000).is_none());
    }

    #[test]
    fn core_registers_come_from_the_note_table() {
        let cache = ImageCache::new(vec![]);
        let mut proc = dummy_process(&cache);
        proc.lwps.insert(
            7,
            Registers {
                rip: 1,
                rsp: 2,
                rbp: 3,
            },
        );
        assert_eq!(proc.registers(7).unwrap().rip, 1);
        assert!(proc.registers(8).is_err());
    }
}
