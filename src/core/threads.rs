//! Thread enumeration.
//!
//! Two passes, matching how the stack lister wants to see threads: first walk
//! the C library's own thread list inside the target (giving us pthread
//! handles to pair with kernel ids), then sweep the kernel's lwp set for
//! anything the library didn't know about. Walk failures only ever degrade
//! the result to the kernel view; they never abort inspection.

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};

use crate::core::mem::{read_u32, read_u64, ProcessMemory};
use crate::core::process::Process;
use crate::core::types::{Pid, ThreadRecord};

type SymbolLookup<'a> = dyn Fn(&str) -> Option<u64> + 'a;

/// glibc publishes the layout of `struct pthread` to debuggers through
/// `_thread_db_*` descriptor symbols: three 32-bit words whose third entry is
/// the field offset.
fn descriptor_offset(io: &dyn ProcessMemory, sym: &SymbolLookup, name: &str) -> Result<u64> {
    let addr = sym(name).ok_or_else(|| anyhow!("no {} symbol in the target", name))?;
    let offset = read_u32(addr + 8, io).with_context(|| format!("read descriptor {}", name))?;
    Ok(offset as u64)
}

/// The offset of the kernel tid inside `struct pthread`, used both here and
/// by the interpreter inspector to label threads.
pub fn pthread_tid_offset(proc: &Process) -> Result<u64> {
    descriptor_offset(proc.io.as_ref(), &|n| proc.find_symbol(n), "_thread_db_pthread_tid")
}

/// Walk the thread library's `stack_used` / `__stack_user` lists, yielding
/// (pthread handle, kernel tid) pairs.
fn pthread_walk(io: &dyn ProcessMemory, sym: &SymbolLookup) -> Result<Vec<(u64, Pid)>> {
    let tid_off = descriptor_offset(io, sym, "_thread_db_pthread_tid")?;
    let list_off = descriptor_offset(io, sym, "_thread_db_pthread_list")?;
    let next_off = descriptor_offset(io, sym, "_thread_db_list_t_next")?;

    let mut out = Vec::new();
    for head_sym in ["stack_used", "__stack_user"] {
        let head = match sym(head_sym) {
            Some(addr) => addr,
            None => continue,
        };
        let mut cur = read_u64(head + next_off, io)
            .with_context(|| format!("read list head {}", head_sym))?;
        // The lists are circular; also cap the walk in case we're reading
        // a torn list.
        let mut remaining = 4096;
        while cur != 0 && cur != head && remaining > 0 {
            let pthread = cur.wrapping_sub(list_off);
            let tid = read_u32(pthread + tid_off, io)? as Pid;
            if tid != 0 {
                out.push((pthread, tid));
            }
            cur = read_u64(cur + next_off, io)?;
            remaining -= 1;
        }
    }
    if out.is_empty() {
        return Err(anyhow!("thread library lists were empty"));
    }
    Ok(out)
}

/// Enumerate the target's threads. Each lwp appears exactly once, whether or
/// not the thread library knew about it; ordering is unspecified.
pub fn list_threads(proc: &Process, use_thread_db: bool) -> Vec<ThreadRecord> {
    let mut records = Vec::new();
    let mut traced: HashSet<Pid> = HashSet::new();

    if use_thread_db {
        match pthread_walk(proc.io.as_ref(), &|n| proc.find_symbol(n)) {
            Ok(handles) => {
                for (pthread, tid) in handles {
                    if traced.contains(&tid) {
                        continue;
                    }
                    match proc.registers(tid) {
                        Ok(regs) => {
                            traced.insert(tid);
                            records.push(ThreadRecord {
                                lwp: tid,
                                pthread: Some(pthread),
                                regs,
                            });
                        }
                        Err(e) => debug!("skipping pthread {:#x} (lwp {}): {}", pthread, tid, e),
                    }
                }
            }
            Err(e) => {
                warn!(
                    "thread library walk failed ({:#}); using kernel thread list only",
                    e
                );
            }
        }
    }

    for (&tid, &regs) in &proc.lwps {
        if !traced.contains(&tid) {
            records.push(ThreadRecord {
                lwp: tid,
                pthread: None,
                regs,
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::image::ImageCache;
    use crate::core::mem::testing::FakeMemory;
    use crate::core::process::{Process, TargetKind};
    use crate::core::types::Registers;

    fn core_process<'a>(cache: &'a ImageCache, io: FakeMemory, lwps: &'a [(Pid, u64)]) -> Process<'a> {
        let mut map = BTreeMap::new();
        for &(tid, rip) in lwps {
            map.insert(
                tid,
                Registers {
                    rip,
                    ..Default::default()
                },
            );
        }
        Process {
            kind: TargetKind::Core,
            pid: None,
            name: "fake".into(),
            io: Box::new(io),
            objects: Vec::new(),
            lwps: map,
            cache,
        }
    }

    // Lay out a fake glibc thread list: descriptors, a circular list head
    // and two pthread structs.
    fn fake_thread_list() -> (FakeMemory, Vec<(&'static str, u64)>) {
        const TID_OFF: u64 = 0x2d0;
        const LIST_OFF: u64 = 0x2e0;
        let mut mem = FakeMemory::new();
        let desc = |off: u32| {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&8u32.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&off.to_le_bytes());
            bytes
        };
        mem.put(0x100, &desc(TID_OFF as u32)); // _thread_db_pthread_tid
        mem.put(0x200, &desc(LIST_OFF as u32)); // _thread_db_pthread_list
        mem.put(0x300, &desc(0)); // _thread_db_list_t_next

        // Two pthreads at 0x10000 and 0x20000, list nodes at +LIST_OFF,
        // chained head -> a -> b -> head.
        let head = 0x500u64;
        let node_a = 0x10000 + LIST_OFF;
        let node_b = 0x20000 + LIST_OFF;
        mem.put_u64(head, node_a);
        mem.put_u64(node_a, node_b);
        mem.put_u64(node_b, head);
        mem.put(0x10000 + TID_OFF, &101u32.to_le_bytes());
        mem.put(0x20000 + TID_OFF, &102u32.to_le_bytes());

        let syms = vec![
            ("_thread_db_pthread_tid", 0x100u64),
            ("_thread_db_pthread_list", 0x200),
            ("_thread_db_list_t_next", 0x300),
            ("stack_used", head),
        ];
        (mem, syms)
    }

    #[test]
    fn pthread_walk_follows_the_list() {
        let (mem, syms) = fake_thread_list();
        let lookup = |name: &str| syms.iter().find(|(n, _)| *n == name).map(|&(_, a)| a);
        let handles = pthread_walk(&mem, &lookup).unwrap();
        let tids: Vec<Pid> = handles.iter().map(|&(_, tid)| tid).collect();
        assert_eq!(tids, vec![101, 102]);
        assert_eq!(handles[0].0, 0x10000);
        assert_eq!(handles[1].0, 0x20000);
    }

    #[test]
    fn kernel_sweep_covers_all_lwps_once() {
        let cache = ImageCache::new(vec![]);
        let proc = core_process(&cache, FakeMemory::new(), &[(10, 1), (11, 2)]);
        // No thread library symbols in the fake target: the walk degrades.
        let mut records = list_threads(&proc, true);
        records.sort_by_key(|r| r.lwp);
        let lwps: Vec<Pid> = records.iter().map(|r| r.lwp).collect();
        assert_eq!(lwps, vec![10, 11]);
        assert!(records.iter().all(|r| r.pthread.is_none()));
    }

    #[test]
    fn thread_db_disabled_still_enumerates() {
        let cache = ImageCache::new(vec![]);
        let proc = core_process(&cache, FakeMemory::new(), &[(42, 7)]);
        let records = list_threads(&proc, false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lwp, 42);
        assert_eq!(records[0].regs.rip, 7);
    }
}
