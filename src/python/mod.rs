//! The embedded-Python inspector: a second, entirely separate walk of the
//! target's state that ignores the native unwinder and instead chases the
//! interpreter's own chain of interpreter states, thread states and frames.

pub mod layouts;
pub mod printer;

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use log::{debug, info};
use thiserror::Error;

use crate::core::mem::{copy_address, field, read_i32, read_u64};
use crate::core::process::Process;
use crate::core::threads::pthread_tid_offset;
use crate::python::layouts::PyLayouts;
use crate::python::printer::{ObjectPrinter, PrinterEntry, BUILTIN_PRINTERS};
use crate::Options;

#[derive(Error, Debug)]
pub enum PythonError {
    #[error("No libpython found")]
    NoLibpython,
    #[error("libpython is missing the {0} symbol")]
    MissingTypeSymbol(String),
    #[error("unsupported python version {0}")]
    UnsupportedVersion(String),
}

pub struct PythonPrinter<'a> {
    proc: &'a Process<'a>,
    printer: ObjectPrinter<'a>,
    layouts: &'static PyLayouts,
    interp_head: u64,
    tid_offset: Option<u64>,
}

impl<'a> PythonPrinter<'a> {
    /// Locate the interpreter inside the target and resolve the printer
    /// registry against its type descriptor symbols.
    pub fn new(proc: &'a Process<'a>, options: &Options) -> Result<PythonPrinter<'a>, PythonError> {
        let mut found = None;
        for obj in &proc.objects {
            if !obj.path.to_string_lossy().contains("python") {
                continue;
            }
            let image = match proc.image(obj) {
                Some(image) => image,
                None => continue,
            };
            let bias = Process::bias(obj, &image);
            if let Some(addr) = image.global_variable_address("interp_head", bias) {
                found = Some((obj, image, bias, addr));
                break;
            }
        }
        let (obj, image, bias, interp_head) = found.ok_or(PythonError::NoLibpython)?;
        info!("python library is {}", obj.path.display());

        let lay = match detect_version(&obj.path.to_string_lossy()) {
            Some(version) => layouts::for_version(&version)
                .ok_or(PythonError::UnsupportedVersion(version))?,
            None => &layouts::PY27,
        };

        let mut printers = HashMap::new();
        for &(symbol, kind, dedup) in BUILTIN_PRINTERS {
            let addr = image
                .symbol_address(symbol)
                .ok_or_else(|| PythonError::MissingTypeSymbol(symbol.to_string()))?;
            printers.insert(addr + bias, PrinterEntry { kind, dedup });
        }

        let tid_offset = match pthread_tid_offset(proc) {
            Ok(offset) => Some(offset),
            Err(e) => {
                debug!("failed to find offset of tid in pthread: {:#}", e);
                None
            }
        };

        Ok(PythonPrinter {
            proc,
            printer: ObjectPrinter::new(proc.io.as_ref(), lay, printers, options.do_args),
            layouts: lay,
            interp_head,
            tid_offset,
        })
    }

    /// Walk every interpreter in the target and print every thread's frame
    /// chain.
    pub fn print_stacks(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut interp = read_u64(self.interp_head, self.proc.io.as_ref())?;
        while interp != 0 {
            interp = self.print_interp(out, interp)?;
        }
        Ok(())
    }

    /// Process one interpreter; returns the next interpreter on the list.
    fn print_interp(&mut self, out: &mut dyn Write, addr: u64) -> Result<u64> {
        let lay = self.layouts;
        let raw = copy_address(addr, lay.interp_tstate_head + 8, self.proc.io.as_ref())?;
        let next = field::u64_at(&raw, lay.interp_next)?;
        writeln!(out, "---- interpreter @{:#x} ----", addr)?;
        let mut tsp = field::u64_at(&raw, lay.interp_tstate_head)?;
        while tsp != 0 {
            tsp = self.print_thread(out, tsp)?;
            writeln!(out)?;
        }
        Ok(next)
    }

    /// Process one interpreter thread; returns the next thread on the list.
    /// An unreadable thread state ends the chain rather than the inspection.
    fn print_thread(&mut self, out: &mut dyn Write, addr: u64) -> Result<u64> {
        let lay = self.layouts;
        let raw = match copy_address(addr, lay.tstate_thread_id + 8, self.proc.io.as_ref()) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("thread state at {:#x} unreadable: {}", addr, e);
                writeln!(out, "(unreadable thread state)")?;
                return Ok(0);
            }
        };
        let next = field::u64_at(&raw, lay.tstate_next)?;
        let frame = field::u64_at(&raw, lay.tstate_frame)?;
        let thread_id = field::u64_at(&raw, lay.tstate_thread_id)?;

        let lwp = self.tid_offset.and_then(|toff| {
            if thread_id == 0 {
                return None;
            }
            read_i32(thread_id + toff, self.proc.io.as_ref()).ok()
        });
        match lwp {
            Some(tid) => writeln!(out, "pthread: {:#x}, lwp {}", thread_id, tid)?,
            None => writeln!(out, "anonymous thread")?,
        }
        self.printer.print_root(out, frame)?;
        Ok(next)
    }
}

/// "libpython2.7.so.1.0" -> "2.7". A bare "python" binary (static link)
/// yields nothing and falls back to the default layout.
fn detect_version(path: &str) -> Option<String> {
    let idx = path.rfind("python")?;
    let rest = &path[idx + "python".len()..];
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_matches('.').to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::image::ImageCache;
    use crate::core::mem::testing::FakeMemory;
    use crate::core::process::TargetKind;

    // Interpreter state chain laid out in fake memory: two interpreters, the
    // first with two threads (one with a resolvable lwp, one anonymous).
    #[test]
    fn walks_interpreters_and_their_thread_chains() {
        const HEAD: u64 = 0x1000;
        const I1: u64 = 0x2000;
        const I2: u64 = 0x3000;
        const T1: u64 = 0x4000;
        const T2: u64 = 0x5000;
        const PTHREAD: u64 = 0x9000;
        const TID_OFF: u64 = 0x90;

        let lay = &layouts::PY27;
        let mut mem = FakeMemory::new();
        mem.put_u64(HEAD, I1);

        let mut interp = vec![0u8; lay.interp_tstate_head + 8];
        interp[lay.interp_next..lay.interp_next + 8].copy_from_slice(&I2.to_le_bytes());
        interp[lay.interp_tstate_head..lay.interp_tstate_head + 8]
            .copy_from_slice(&T1.to_le_bytes());
        mem.put(I1, &interp);
        mem.put(I2, &vec![0u8; lay.interp_tstate_head + 8]);

        let mut tstate = vec![0u8; lay.tstate_thread_id + 8];
        tstate[lay.tstate_next..lay.tstate_next + 8].copy_from_slice(&T2.to_le_bytes());
        tstate[lay.tstate_thread_id..lay.tstate_thread_id + 8]
            .copy_from_slice(&PTHREAD.to_le_bytes());
        mem.put(T1, &tstate);
        mem.put(T2, &vec![0u8; lay.tstate_thread_id + 8]);
        mem.put(PTHREAD + TID_OFF, &4242u32.to_le_bytes());

        let cache = ImageCache::new(vec![]);
        let proc = Process {
            kind: TargetKind::Core,
            pid: None,
            name: "py".into(),
            io: Box::new(mem),
            objects: Vec::new(),
            lwps: BTreeMap::new(),
            cache: &cache,
        };
        let mut printer = PythonPrinter {
            printer: ObjectPrinter::new(proc.io.as_ref(), lay, HashMap::new(), false),
            proc: &proc,
            layouts: lay,
            interp_head: HEAD,
            tid_offset: Some(TID_OFF),
        };

        let mut out = Vec::new();
        printer.print_stacks(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("---- interpreter @0x2000 ----"), "got {:?}", text);
        assert!(text.contains("---- interpreter @0x3000 ----"), "got {:?}", text);
        assert!(text.contains("pthread: 0x9000, lwp 4242"), "got {:?}", text);
        assert_eq!(text.matches("anonymous thread").count(), 1, "got {:?}", text);
    }

    #[test]
    fn version_detection_from_library_names() {
        assert_eq!(
            detect_version("/usr/lib/libpython2.7.so.1.0"),
            Some("2.7".to_string())
        );
        assert_eq!(detect_version("/usr/bin/python"), None);
        assert_eq!(detect_version("/opt/py/libpython3.11.so"), Some("3.11".to_string()));
        assert_eq!(detect_version("/usr/lib/libc.so.6"), None);
    }
}
